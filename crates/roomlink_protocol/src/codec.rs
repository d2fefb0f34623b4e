#![forbid(unsafe_code)]

//! Flat string payload carried through the broker.
//!
//! Layout: `room-KIND-content-sender_email-sender_name-correlation`. Inside a
//! field, `\` is written as `\\` and `-` as `\-`, so a field may contain the
//! delimiter and still decode to the same value.

use roomlink_domain::{ChatEvent, CorrelationToken, EventKind, ParseIdError};
use thiserror::Error;

/// Field separator on the wire.
pub const DELIMITER: char = '-';

const ESCAPE: char = '\\';
const FIELD_COUNT: usize = 6;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("malformed payload: expected 6 fields, found {found}")]
	FieldCount { found: usize },

	#[error("malformed payload: dangling escape at end of input")]
	DanglingEscape,

	#[error("malformed payload: invalid escape sequence \\{0}")]
	InvalidEscape(char),

	#[error("malformed payload: {0}")]
	Kind(#[from] ParseIdError),
}

/// Encode an event into the broker payload.
pub fn encode(event: &ChatEvent) -> String {
	let fields = [
		event.room_id.as_str(),
		event.kind.as_str(),
		event.content.as_str(),
		event.sender_email.as_str(),
		event.sender_name.as_str(),
		event.correlation.as_str(),
	];

	let mut out = String::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
	for (idx, field) in fields.iter().enumerate() {
		if idx > 0 {
			out.push(DELIMITER);
		}
		push_escaped(&mut out, field);
	}
	out
}

/// Decode a broker payload; any structural problem is a `DecodeError`.
pub fn decode(payload: &str) -> Result<ChatEvent, DecodeError> {
	let fields = split_fields(payload)?;
	if fields.len() != FIELD_COUNT {
		return Err(DecodeError::FieldCount { found: fields.len() });
	}

	let mut it = fields.into_iter();
	let mut next = || it.next().unwrap_or_default();

	let room_id = next();
	let kind: EventKind = next().parse()?;
	let content = next();
	let sender_email = next();
	let sender_name = next();
	let correlation = CorrelationToken::from_wire(next());

	Ok(ChatEvent {
		room_id,
		kind,
		content,
		sender_email,
		sender_name,
		correlation,
	})
}

fn push_escaped(out: &mut String, field: &str) {
	for c in field.chars() {
		if c == ESCAPE || c == DELIMITER {
			out.push(ESCAPE);
		}
		out.push(c);
	}
}

fn split_fields(payload: &str) -> Result<Vec<String>, DecodeError> {
	let mut fields = Vec::with_capacity(FIELD_COUNT);
	let mut current = String::new();
	let mut chars = payload.chars();

	while let Some(c) = chars.next() {
		match c {
			ESCAPE => match chars.next() {
				Some(escaped @ (ESCAPE | DELIMITER)) => current.push(escaped),
				Some(other) => return Err(DecodeError::InvalidEscape(other)),
				None => return Err(DecodeError::DanglingEscape),
			},
			DELIMITER => fields.push(std::mem::take(&mut current)),
			other => current.push(other),
		}
	}
	fields.push(current);

	Ok(fields)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn event(content: &str) -> ChatEvent {
		ChatEvent {
			room_id: "0f1e2d3c4b5a69788796a5b4c3d2e1f0".to_string(),
			kind: EventKind::Chat,
			content: content.to_string(),
			sender_email: "a@x".to_string(),
			sender_name: "alice".to_string(),
			correlation: CorrelationToken::from_wire("00112233445566778899aabbccddeeff"),
		}
	}

	#[test]
	fn plain_fields_keep_reference_layout() {
		let wire = encode(&event("hi"));
		assert_eq!(
			wire,
			"0f1e2d3c4b5a69788796a5b4c3d2e1f0-CHAT-hi-a@x-alice-00112233445566778899aabbccddeeff"
		);
		assert_eq!(decode(&wire).unwrap(), event("hi"));
	}

	#[test]
	fn dashes_in_content_survive() {
		let ev = event("well - that's a dash-separated - thing\\");
		let wire = encode(&ev);
		assert_eq!(decode(&wire).unwrap(), ev);
	}

	#[test]
	fn reference_system_payload_decodes() {
		let ev = decode("main-SYSTEM-Main chat initialized-System-System-abcdefabcdefabcdefabcdefabcdefab").unwrap();
		assert_eq!(ev.room_id, "main");
		assert_eq!(ev.kind, EventKind::System);
		assert_eq!(ev.content, "Main chat initialized");
		assert_eq!(ev.sender_name, "System");
	}

	#[test]
	fn wrong_field_count_is_malformed() {
		assert_eq!(decode("main-CHAT-hi"), Err(DecodeError::FieldCount { found: 3 }));
		assert_eq!(decode("a-CHAT-b-c-d-e-f"), Err(DecodeError::FieldCount { found: 7 }));
	}

	#[test]
	fn bad_escapes_and_kinds_are_malformed() {
		assert_eq!(decode("main-CHAT-hi\\"), Err(DecodeError::DanglingEscape));
		assert_eq!(decode("main-CHAT-h\\i-a-b-c"), Err(DecodeError::InvalidEscape('i')));
		assert!(matches!(decode("main-JOIN-hi-a-b-c"), Err(DecodeError::Kind(_))));
	}
}
