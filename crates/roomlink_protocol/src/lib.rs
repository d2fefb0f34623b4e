#![forbid(unsafe_code)]

pub mod codec;
pub mod framing;
pub mod messages;

pub use codec::{DELIMITER, DecodeError, decode, encode};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol version, echoed in `Hello`/`Welcome`.
	pub const PROTOCOL_VERSION: u32 = 1;

	/// ALPN identifier for the QUIC transport.
	pub const ALPN: &[u8] = b"roomlink-v1";
}
