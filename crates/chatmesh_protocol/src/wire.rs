#![forbid(unsafe_code)]

//! Protobuf wire types for bus frames (`chatmesh.v1`).

use chatmesh_domain::{InstanceId, Message, MessageId, MessageKind, RoomId, UserId};

use crate::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireKind {
	Unspecified = 0,
	Chat = 1,
	Join = 2,
	Leave = 3,
	Typing = 4,
	Read = 5,
	System = 6,
}

impl From<MessageKind> for WireKind {
	fn from(kind: MessageKind) -> Self {
		match kind {
			MessageKind::Chat => WireKind::Chat,
			MessageKind::Join => WireKind::Join,
			MessageKind::Leave => WireKind::Leave,
			MessageKind::Typing => WireKind::Typing,
			MessageKind::Read => WireKind::Read,
			MessageKind::System => WireKind::System,
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMessage {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub sender_id: String,
	#[prost(string, optional, tag = "3")]
	pub receiver_id: Option<String>,
	#[prost(string, optional, tag = "4")]
	pub room_id: Option<String>,
	#[prost(enumeration = "WireKind", tag = "5")]
	pub kind: i32,
	#[prost(string, tag = "6")]
	pub payload: String,
	#[prost(int64, tag = "7")]
	pub timestamp_unix_ms: i64,
}

/// Bus envelope: one message plus the instance that published it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BusEnvelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	#[prost(string, tag = "2")]
	pub origin_instance: String,
	#[prost(message, optional, tag = "3")]
	pub message: Option<WireMessage>,
}

impl From<&Message> for WireMessage {
	fn from(msg: &Message) -> Self {
		Self {
			id: msg.id.as_str().to_string(),
			sender_id: msg.sender_id.as_str().to_string(),
			receiver_id: msg.receiver_id.as_ref().map(|u| u.as_str().to_string()),
			room_id: msg.room_id.as_ref().map(|r| r.as_str().to_string()),
			kind: WireKind::from(msg.kind) as i32,
			payload: msg.payload.clone(),
			timestamp_unix_ms: msg.timestamp_ms,
		}
	}
}

impl TryFrom<WireMessage> for Message {
	type Error = ProtocolError;

	fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
		let kind = match WireKind::try_from(wire.kind) {
			Ok(WireKind::Chat) => MessageKind::Chat,
			Ok(WireKind::Join) => MessageKind::Join,
			Ok(WireKind::Leave) => MessageKind::Leave,
			Ok(WireKind::Typing) => MessageKind::Typing,
			Ok(WireKind::Read) => MessageKind::Read,
			Ok(WireKind::System) => MessageKind::System,
			Ok(WireKind::Unspecified) | Err(_) => return Err(ProtocolError::UnknownKind(wire.kind)),
		};

		let sender_id = UserId::new(wire.sender_id).map_err(|_| ProtocolError::InvalidMessage("empty sender_id"))?;

		// Blank optional ids are treated as absent rather than rejected.
		let receiver_id = wire.receiver_id.and_then(|r| UserId::new(r).ok());
		let room_id = wire.room_id.and_then(|r| RoomId::new(r).ok());

		Ok(Message {
			id: MessageId::from_wire(wire.id),
			sender_id,
			receiver_id,
			room_id,
			kind,
			payload: wire.payload,
			timestamp_ms: wire.timestamp_unix_ms,
		})
	}
}

impl BusEnvelope {
	pub fn new(origin: &InstanceId, msg: &Message) -> Self {
		Self {
			version: crate::version::PROTOCOL_MAJOR,
			origin_instance: origin.as_str().to_string(),
			message: Some(WireMessage::from(msg)),
		}
	}
}
