#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chatmesh_domain::{Message, MessageId, MessageKind, Rejection, RoomId, SessionId, UserId};
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::rate_limit::{Admission, RateLimiter};
use crate::server::router::MessageRouter;
use crate::util::time::Clock;

/// Items pushed to a connected client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
	Message(Message),
	Rejection(Rejection),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
	#[error("session closed")]
	Closed,

	#[error("session outbound queue full")]
	Full,
}

/// Outbound side of a client session. Only the instance that created a handle ever holds it.
#[async_trait::async_trait]
pub trait SessionHandle: Send + Sync + fmt::Debug {
	fn id(&self) -> SessionId;

	fn user(&self) -> &UserId;

	fn is_open(&self) -> bool;

	/// Queue an item for the client. Never waits on a slow client.
	async fn send(&self, item: Outbound) -> Result<(), SessionError>;
}

/// Session backed by a bounded channel drained by the transport.
#[derive(Debug)]
pub struct ChannelSession {
	id: SessionId,
	user: UserId,
	tx: mpsc::Sender<Outbound>,
}

impl ChannelSession {
	pub fn new(id: SessionId, user: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Arc::new(Self { id, user, tx }), rx)
	}
}

#[async_trait::async_trait]
impl SessionHandle for ChannelSession {
	fn id(&self) -> SessionId {
		self.id
	}

	fn user(&self) -> &UserId {
		&self.user
	}

	fn is_open(&self) -> bool {
		!self.tx.is_closed()
	}

	async fn send(&self, item: Outbound) -> Result<(), SessionError> {
		self.tx.try_send(item).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => SessionError::Full,
			mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
		})
	}
}

/// Instance-local map of attached sessions keyed by user.
pub trait SessionDirectory: Send + Sync + fmt::Debug {
	/// Insert `session`, returning whichever session it replaced.
	fn insert(&self, user: UserId, session: Arc<dyn SessionHandle>) -> Option<Arc<dyn SessionHandle>>;

	fn get(&self, user: &UserId) -> Option<Arc<dyn SessionHandle>>;

	fn remove(&self, user: &UserId) -> Option<Arc<dyn SessionHandle>>;

	/// Remove the entry only while it still belongs to `session_id`.
	fn remove_if_session(&self, user: &UserId, session_id: SessionId) -> Option<Arc<dyn SessionHandle>>;

	fn snapshot(&self) -> Vec<Arc<dyn SessionHandle>>;

	fn len(&self) -> usize;

	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[derive(Debug, Default)]
pub struct DashMapDirectory {
	sessions: DashMap<UserId, Arc<dyn SessionHandle>>,
}

impl DashMapDirectory {
	pub fn new() -> Self {
		Self::default()
	}
}

impl SessionDirectory for DashMapDirectory {
	fn insert(&self, user: UserId, session: Arc<dyn SessionHandle>) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.insert(user, session)
	}

	fn get(&self, user: &UserId) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.get(user).map(|s| Arc::clone(s.value()))
	}

	fn remove(&self, user: &UserId) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.remove(user).map(|(_, s)| s)
	}

	fn remove_if_session(&self, user: &UserId, session_id: SessionId) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.remove_if(user, |_, s| s.id() == session_id).map(|(_, s)| s)
	}

	fn snapshot(&self) -> Vec<Arc<dyn SessionHandle>> {
		self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
	}

	fn len(&self) -> usize {
		self.sessions.len()
	}
}

/// Client-authored message before the server stamps it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Draft {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub receiver_id: Option<String>,
	#[serde(default)]
	pub room_id: Option<String>,
	#[serde(default)]
	pub kind: Option<MessageKind>,
	#[serde(default)]
	pub payload: String,
	#[serde(default)]
	pub timestamp_ms: i64,
}

impl Draft {
	pub fn to_user(receiver: &str, payload: impl Into<String>) -> Self {
		Self {
			receiver_id: Some(receiver.to_string()),
			payload: payload.into(),
			..Self::default()
		}
	}

	pub fn to_room(room: &str, payload: impl Into<String>) -> Self {
		Self {
			room_id: Some(room.to_string()),
			payload: payload.into(),
			..Self::default()
		}
	}

	pub fn with_kind(mut self, kind: MessageKind) -> Self {
		self.kind = Some(kind);
		self
	}

	/// Attribute the draft to `sender` and fill in id and timestamp when missing.
	pub fn stamp(self, sender: &UserId, now_ms: i64) -> Message {
		Message {
			id: MessageId::from_wire(self.id),
			sender_id: sender.clone(),
			receiver_id: self.receiver_id.and_then(|r| UserId::new(r).ok()),
			room_id: self.room_id.and_then(|r| RoomId::new(r).ok()),
			kind: self.kind.unwrap_or(MessageKind::Chat),
			payload: self.payload,
			timestamp_ms: if self.timestamp_ms > 0 { self.timestamp_ms } else { now_ms },
		}
	}
}

/// Input handed over by the transport for one session.
#[derive(Debug, Clone)]
pub enum Inbound {
	Draft(Draft),
	/// JSON-encoded `Draft` as received on the wire.
	Raw(Bytes),
}

impl From<Draft> for Inbound {
	fn from(d: Draft) -> Self {
		Inbound::Draft(d)
	}
}

/// Per-session inbound path: stamp, admit, route. One message at a time.
#[derive(Debug, Clone)]
pub struct SessionPipeline {
	pub(crate) router: Arc<MessageRouter>,
	pub(crate) limiter: Arc<RateLimiter>,
	pub(crate) clock: Arc<dyn Clock>,
}

impl SessionPipeline {
	pub fn new(router: Arc<MessageRouter>, limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Self {
		Self { router, limiter, clock }
	}

	/// Drain `inbox` in arrival order until the transport drops its sender.
	pub async fn run(&self, session: Arc<dyn SessionHandle>, mut inbox: mpsc::Receiver<Inbound>) {
		while let Some(item) = inbox.recv().await {
			self.handle(&session, item).await;
		}
		debug!(user = %session.user(), session = %session.id(), "session inbox closed");
	}

	pub async fn handle(&self, session: &Arc<dyn SessionHandle>, item: Inbound) {
		let draft = match item {
			Inbound::Draft(d) => d,
			Inbound::Raw(bytes) => match serde_json::from_slice::<Draft>(&bytes) {
				Ok(d) => d,
				Err(e) => {
					warn!(user = %session.user(), error = %e, "discarding malformed client message");
					metrics::counter!("chatmesh_malformed_messages_total", "source" => "session").increment(1);
					return;
				}
			},
		};

		// Join, leave and system notices are server-originated.
		if draft.kind.is_some_and(MessageKind::is_broadcast) {
			warn!(user = %session.user(), kind = ?draft.kind, "discarding client message with broadcast-only kind");
			metrics::counter!("chatmesh_malformed_messages_total", "source" => "session").increment(1);
			return;
		}

		let msg = draft.stamp(session.user(), self.clock.now_ms());

		if let Admission::Throttled { retry_after_secs } = self.limiter.check(&msg.sender_id).await {
			debug!(user = %msg.sender_id, retry_after_secs, "message throttled");
			if let Err(e) = session
				.send(Outbound::Rejection(Rejection::rate_limited(retry_after_secs)))
				.await
			{
				debug!(user = %msg.sender_id, error = %e, "could not deliver rejection");
			}
			return;
		}

		self.router.route(msg).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	#[tokio::test]
	async fn channel_session_reports_closed_and_full() {
		let (session, rx) = ChannelSession::new(SessionId(1), user("alice"), 1);
		let msg = Message::join(user("alice"));

		session.send(Outbound::Message(msg.clone())).await.unwrap();
		assert_eq!(session.send(Outbound::Message(msg.clone())).await, Err(SessionError::Full));

		drop(rx);
		assert!(!session.is_open());
		assert_eq!(session.send(Outbound::Message(msg)).await, Err(SessionError::Closed));
	}

	#[test]
	fn directory_removal_is_scoped_to_session() {
		let dir = DashMapDirectory::new();
		let (old, _old_rx) = ChannelSession::new(SessionId(1), user("alice"), 4);
		let (new, _new_rx) = ChannelSession::new(SessionId(2), user("alice"), 4);

		dir.insert(user("alice"), old);
		let replaced = dir.insert(user("alice"), new).expect("old session replaced");
		assert_eq!(replaced.id(), SessionId(1));

		assert!(dir.remove_if_session(&user("alice"), SessionId(1)).is_none());
		assert_eq!(dir.len(), 1);
		assert!(dir.remove_if_session(&user("alice"), SessionId(2)).is_some());
		assert!(dir.is_empty());
	}

	#[test]
	fn stamping_fills_missing_fields() {
		let draft: Draft = serde_json::from_str(r#"{"receiver_id":"bob","payload":"hi"}"#).unwrap();
		let msg = draft.stamp(&user("alice"), 42);

		assert_eq!(msg.sender_id, user("alice"));
		assert_eq!(msg.receiver_id, Some(user("bob")));
		assert_eq!(msg.kind, MessageKind::Chat);
		assert_eq!(msg.timestamp_ms, 42);
		assert!(!msg.id.as_str().is_empty());
	}

	#[test]
	fn stamping_keeps_client_id_and_time_and_drops_blank_targets() {
		let draft = Draft {
			id: "m-7".to_string(),
			receiver_id: Some("  ".to_string()),
			room_id: Some("lobby".to_string()),
			kind: Some(MessageKind::Typing),
			payload: String::new(),
			timestamp_ms: 1_000,
		};
		let msg = draft.stamp(&user("alice"), 42);

		assert_eq!(msg.id.as_str(), "m-7");
		assert_eq!(msg.timestamp_ms, 1_000);
		assert!(msg.receiver_id.is_none());
		assert_eq!(msg.room_id.map(|r| r.into_string()), Some("lobby".to_string()));
		assert_eq!(msg.kind, MessageKind::Typing);
	}
}
