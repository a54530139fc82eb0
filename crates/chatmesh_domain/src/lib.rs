#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown message kind: {0}")]
	UnknownKind(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Opaque user identifier issued by the identity provider.
	UserId
);

string_id!(
	/// Identity string of one running server process.
	InstanceId
);

string_id!(
	/// Chat room identifier.
	RoomId
);

impl InstanceId {
	/// Random identity for processes that were not given one.
	pub fn generate() -> Self {
		Self(format!("instance-{}", uuid::Uuid::new_v4()))
	}
}

/// Message identifier. Client-supplied ids are kept verbatim; missing ids are assigned a v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Wrap an existing id, generating a fresh one when `id` is blank.
	pub fn from_wire(id: impl Into<String>) -> Self {
		let id = id.into();
		if id.trim().is_empty() { Self::new_v4() } else { Self(id) }
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Instance-local session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "s{}", self.0)
	}
}

/// Message categories understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Chat,
	Join,
	Leave,
	Typing,
	Read,
	System,
}

impl MessageKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Chat => "chat",
			MessageKind::Join => "join",
			MessageKind::Leave => "leave",
			MessageKind::Typing => "typing",
			MessageKind::Read => "read",
			MessageKind::System => "system",
		}
	}

	/// Broadcast-class kinds are fanned out to every instance instead of routed to an owner.
	pub const fn is_broadcast(self) -> bool {
		matches!(self, MessageKind::Join | MessageKind::Leave | MessageKind::System)
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"chat" => Ok(MessageKind::Chat),
			"join" => Ok(MessageKind::Join),
			"leave" => Ok(MessageKind::Leave),
			"typing" => Ok(MessageKind::Typing),
			"read" => Ok(MessageKind::Read),
			"system" => Ok(MessageKind::System),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// A chat message. Treated as immutable once handed to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender_id: UserId,
	pub receiver_id: Option<UserId>,
	pub room_id: Option<RoomId>,
	pub kind: MessageKind,
	pub payload: String,
	/// Unix time in milliseconds.
	pub timestamp_ms: i64,
}

impl Message {
	fn new(kind: MessageKind, sender_id: UserId, payload: impl Into<String>) -> Self {
		Self {
			id: MessageId::new_v4(),
			sender_id,
			receiver_id: None,
			room_id: None,
			kind,
			payload: payload.into(),
			timestamp_ms: unix_ms_now(),
		}
	}

	/// One-to-one chat message.
	pub fn direct(sender_id: UserId, receiver_id: UserId, payload: impl Into<String>) -> Self {
		let mut msg = Self::new(MessageKind::Chat, sender_id, payload);
		msg.receiver_id = Some(receiver_id);
		msg
	}

	/// Chat message addressed to every member of a room.
	pub fn room(sender_id: UserId, room_id: RoomId, payload: impl Into<String>) -> Self {
		let mut msg = Self::new(MessageKind::Chat, sender_id, payload);
		msg.room_id = Some(room_id);
		msg
	}

	pub fn join(user_id: UserId) -> Self {
		let payload = format!("{user_id} joined");
		Self::new(MessageKind::Join, user_id, payload)
	}

	pub fn leave(user_id: UserId) -> Self {
		let payload = format!("{user_id} left");
		Self::new(MessageKind::Leave, user_id, payload)
	}

	pub fn system(sender_id: UserId, payload: impl Into<String>) -> Self {
		Self::new(MessageKind::System, sender_id, payload)
	}

	/// Copy of this message re-addressed to a single receiver (room fan-out).
	pub fn addressed_to(&self, receiver_id: UserId) -> Self {
		let mut msg = self.clone();
		msg.receiver_id = Some(receiver_id);
		msg
	}

	pub fn with_kind(mut self, kind: MessageKind) -> Self {
		self.kind = kind;
		self
	}
}

/// Routing fact: `user_id` is currently attached to `instance_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
	pub user_id: UserId,
	pub instance_id: InstanceId,
	pub established_at_ms: i64,
}

/// Heartbeat record written by a live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
	pub instance_id: InstanceId,
	pub last_seen_ms: i64,
}

/// Persisted token bucket for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
	pub tokens: f64,
	pub last_refill_ms: i64,
	pub capacity: u32,
	/// Tokens per second.
	pub refill_rate: f64,
	/// Throttled attempts since the last admission; staggers retry hints.
	#[serde(default)]
	pub backlog: u32,
}

impl TokenBucketState {
	/// A full bucket, as seen by a first-time sender.
	pub fn full(capacity: u32, refill_rate: f64, now_ms: i64) -> Self {
		Self {
			tokens: capacity as f64,
			last_refill_ms: now_ms,
			capacity,
			refill_rate,
			backlog: 0,
		}
	}
}

/// Structured rejection delivered to a sender's own session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
	pub code: String,
	pub message: String,
	pub retry_after_secs: Option<u64>,
}

impl Rejection {
	pub const RATE_LIMIT_EXCEEDED: &'static str = "RATE_LIMIT_EXCEEDED";

	pub fn rate_limited(retry_after_secs: u64) -> Self {
		Self {
			code: Self::RATE_LIMIT_EXCEEDED.to_string(),
			message: format!("message rate exceeded; retry after {retry_after_secs}s"),
			retry_after_secs: Some(retry_after_secs),
		}
	}
}

/// Current Unix time in milliseconds.
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(UserId::new("").is_err());
		assert!(InstanceId::new("   ").is_err());
		assert!("".parse::<RoomId>().is_err());
	}

	#[test]
	fn kind_parse_and_display() {
		assert_eq!("JOIN".parse::<MessageKind>().unwrap(), MessageKind::Join);
		assert_eq!(MessageKind::Typing.to_string(), "typing");
		assert!(matches!("wave".parse::<MessageKind>(), Err(ParseIdError::UnknownKind(_))));
	}

	#[test]
	fn broadcast_class_is_join_leave_system() {
		assert!(MessageKind::Join.is_broadcast());
		assert!(MessageKind::Leave.is_broadcast());
		assert!(MessageKind::System.is_broadcast());
		assert!(!MessageKind::Chat.is_broadcast());
		assert!(!MessageKind::Read.is_broadcast());
	}

	#[test]
	fn blank_wire_id_gets_generated() {
		let id = MessageId::from_wire("  ");
		assert!(!id.as_str().trim().is_empty());
		assert_eq!(MessageId::from_wire("m-1").as_str(), "m-1");
	}

	#[test]
	fn room_fanout_copy_keeps_identity() {
		let msg = Message::room(user("alice"), RoomId::new("lobby").unwrap(), "hi");
		let copy = msg.addressed_to(user("bob"));
		assert_eq!(copy.id, msg.id);
		assert_eq!(copy.room_id, msg.room_id);
		assert_eq!(copy.receiver_id, Some(user("bob")));
	}

	#[test]
	fn bucket_state_without_backlog_still_parses() {
		let json = r#"{"tokens":2.5,"last_refill_ms":10,"capacity":3,"refill_rate":1.0}"#;
		let state: TokenBucketState = serde_json::from_str(json).unwrap();
		assert_eq!(state.backlog, 0);
		assert_eq!(state.capacity, 3);
	}
}
