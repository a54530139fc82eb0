#![forbid(unsafe_code)]

pub mod framing;
pub mod wire;

use bytes::Bytes;
use chatmesh_domain::{InstanceId, Message};
use thiserror::Error;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FramingError, decode_exact_frame, encode_frame};
pub use wire::{BusEnvelope, WireKind, WireMessage};

/// Protocol version constants.
pub mod version {
	/// Current bus protocol major version. Frames with another major are rejected.
	pub const PROTOCOL_MAJOR: u32 = 1;
}

/// Errors produced while decoding a bus frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error(transparent)]
	Framing(#[from] FramingError),

	#[error("unsupported protocol version {0}")]
	UnsupportedVersion(u32),

	#[error("envelope without message")]
	MissingMessage,

	#[error("invalid origin instance")]
	InvalidOrigin,

	#[error("unknown message kind {0}")]
	UnknownKind(i32),

	#[error("invalid message: {0}")]
	InvalidMessage(&'static str),
}

/// A decoded bus delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct BusFrame {
	pub origin: InstanceId,
	pub message: Message,
}

/// Encode `msg` as a bus frame published by `origin`.
pub fn encode_bus_frame(origin: &InstanceId, msg: &Message) -> Result<Bytes, ProtocolError> {
	Ok(encode_frame(&BusEnvelope::new(origin, msg), DEFAULT_MAX_FRAME_SIZE)?)
}

/// Decode and validate a bus frame.
pub fn decode_bus_frame(src: &[u8]) -> Result<BusFrame, ProtocolError> {
	let env: BusEnvelope = decode_exact_frame(src, DEFAULT_MAX_FRAME_SIZE)?;

	if env.version != version::PROTOCOL_MAJOR {
		return Err(ProtocolError::UnsupportedVersion(env.version));
	}

	let origin = InstanceId::new(env.origin_instance).map_err(|_| ProtocolError::InvalidOrigin)?;
	let wire = env.message.ok_or(ProtocolError::MissingMessage)?;

	Ok(BusFrame {
		origin,
		message: Message::try_from(wire)?,
	})
}
