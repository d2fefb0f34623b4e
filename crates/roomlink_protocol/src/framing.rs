#![forbid(unsafe_code)]

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024; // 256 KiB

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a message into a `u32` big-endian length-prefixed JSON frame.
pub fn encode_frame<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = serde_json::to_vec(msg)?;
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(&payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Serialize>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

fn read_len(src: &[u8], max_frame_size: usize) -> Result<usize, FramingError> {
	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(len)
}

/// Decode a single frame from the start of `src`, returning the bytes consumed.
pub fn decode_frame<M: DeserializeOwned>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < PREFIX_LEN {
		return Err(FramingError::InsufficientData {
			need: PREFIX_LEN,
			have: src.len(),
		});
	}

	let len = read_len(src, max_frame_size)?;
	let need = PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = serde_json::from_slice(&src[PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer; `None` until a full frame is buffered.
pub fn try_decode_frame_from_buffer<M: DeserializeOwned>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	if buf.len() < PREFIX_LEN {
		return Ok(None);
	}

	let len = read_len(&buf[..], max_frame_size)?;
	if buf.len() < PREFIX_LEN + len {
		return Ok(None);
	}

	buf.advance(PREFIX_LEN);
	let payload = buf.split_to(len);
	let msg = serde_json::from_slice(&payload)?;
	Ok(Some(msg))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::messages::{ClientAction, ClientFrame, ReplyBody, ServerFrame};

	fn send(content: &str) -> ClientFrame {
		ClientFrame::Request {
			request_id: "r1".to_string(),
			action: ClientAction::SendMessage {
				room_id: "main".to_string(),
				content: content.to_string(),
			},
		}
	}

	#[test]
	fn partial_frame_is_reported_with_sizes() {
		let frame = encode_frame_default(&send("hello")).unwrap();

		match decode_frame::<ClientFrame>(&frame[..frame.len() - 1], DEFAULT_MAX_FRAME_SIZE).unwrap_err() {
			FramingError::InsufficientData { need, have } => {
				assert_eq!(need, frame.len());
				assert_eq!(have, frame.len() - 1);
			}
			other => panic!("unexpected error: {other:?}"),
		}

		let (decoded, used) = decode_frame::<ClientFrame>(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap();
		assert_eq!(decoded, send("hello"));
		assert_eq!(used, frame.len());
	}

	#[test]
	fn buffer_yields_back_to_back_frames_in_order() {
		let first = ServerFrame::Reply {
			request_id: "a".to_string(),
			status: 200,
			body: ReplyBody::Text("Chat removed".to_string()),
		};
		let second = ServerFrame::Error {
			code: "AUTHZ_DENIED".to_string(),
			message: "no".to_string(),
			request_id: "b".to_string(),
		};

		let mut wire = encode_frame_default(&first).unwrap();
		wire.extend(encode_frame_default(&second).unwrap());

		// Feed one byte at a time, as a slow stream would.
		let mut buf = BytesMut::new();
		let mut out = Vec::new();
		for byte in wire {
			buf.extend_from_slice(&[byte]);
			while let Some(frame) = try_decode_frame_from_buffer::<ServerFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
				out.push(frame);
			}
		}

		assert_eq!(out, vec![first, second]);
		assert!(buf.is_empty());
	}

	#[test]
	fn oversized_frames_are_refused_both_ways() {
		assert!(matches!(
			encode_frame(&send(&"x".repeat(200)), 64).unwrap_err(),
			FramingError::FrameTooLarge { max: 64, .. }
		));

		let mut buf = BytesMut::from(&1_000_000u32.to_be_bytes()[..]);
		assert!(matches!(
			try_decode_frame_from_buffer::<ClientFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err(),
			FramingError::FrameTooLarge { len: 1_000_000, .. }
		));
	}

	#[test]
	fn garbage_payload_is_a_json_error() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&3u32.to_be_bytes());
		buf.extend_from_slice(b"{x}");
		assert!(matches!(
			try_decode_frame_from_buffer::<ClientFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err(),
			FramingError::Json(_)
		));
	}
}
