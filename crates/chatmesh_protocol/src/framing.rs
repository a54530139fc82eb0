#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size for bus frames.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024; // 256 KiB

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("truncated frame: need={need} have={have}")]
	Truncated {
		need: usize,
		have: usize,
	},

	#[error("trailing bytes after frame: {extra}")]
	TrailingBytes {
		extra: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message as one length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Bytes, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
	out.put_u32(payload_len as u32);
	msg.encode(&mut out)?;
	Ok(out.freeze())
}

/// Decode a buffer that must contain exactly one frame.
///
/// Bus deliveries are discrete, so anything after the declared payload is treated as corruption.
pub fn decode_exact_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<M, FramingError> {
	if src.len() < FRAME_HEADER_LEN {
		return Err(FramingError::Truncated {
			need: FRAME_HEADER_LEN,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = FRAME_HEADER_LEN + len;
	if src.len() < need {
		return Err(FramingError::Truncated { need, have: src.len() });
	}
	if src.len() > need {
		return Err(FramingError::TrailingBytes {
			extra: src.len() - need,
		});
	}

	Ok(M::decode(&src[FRAME_HEADER_LEN..need])?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct Probe {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	#[test]
	fn header_carries_payload_len() {
		let msg = Probe {
			s: "hello".to_string(),
			n: 42,
		};

		let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
		assert_eq!(declared, msg.encoded_len());
		assert_eq!(frame.len(), FRAME_HEADER_LEN + declared);
	}

	#[test]
	fn rejects_trailing_garbage() {
		let msg = Probe { s: "x".into(), n: 1 };
		let mut frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode").to_vec();
		frame.extend_from_slice(b"zz");

		match decode_exact_frame::<Probe>(&frame, DEFAULT_MAX_FRAME_SIZE) {
			Err(FramingError::TrailingBytes { extra }) => assert_eq!(extra, 2),
			other => panic!("expected TrailingBytes, got {other:?}"),
		}
	}

	#[test]
	fn rejects_short_header() {
		match decode_exact_frame::<Probe>(&[0, 0], DEFAULT_MAX_FRAME_SIZE) {
			Err(FramingError::Truncated { need, have }) => {
				assert_eq!(need, FRAME_HEADER_LEN);
				assert_eq!(have, 2);
			}
			other => panic!("expected Truncated, got {other:?}"),
		}
	}
}
