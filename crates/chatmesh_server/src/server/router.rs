#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use chatmesh_domain::{InstanceId, Message, UserId};
use chatmesh_protocol::{decode_bus_frame, encode_bus_frame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, Topics};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::Outbound;

/// Why a message went nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	/// Neither receiver nor room set on a directed kind.
	NoTarget,
	/// Receiver has no registry entry (offline).
	UnknownReceiver,
	/// The registry or room membership could not be read.
	StoreUnavailable,
	/// This instance owns the receiver but holds no open session for them.
	LocalSessionClosed,
	PublishFailed,
}

impl DropReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			DropReason::NoTarget => "no_target",
			DropReason::UnknownReceiver => "unknown_receiver",
			DropReason::StoreUnavailable => "store_unavailable",
			DropReason::LocalSessionClosed => "local_session_closed",
			DropReason::PublishFailed => "publish_failed",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
	DeliveredLocal,
	Published { instance: InstanceId },
	Broadcast,
	/// Room message split into one directed copy per member other than the sender.
	RoomFanout { recipients: usize },
	Dropped(DropReason),
}

/// Decides between local hand-off and cross-instance publish, and consumes frames addressed
/// to this instance.
#[derive(Debug)]
pub struct MessageRouter {
	instance: InstanceId,
	registry: Arc<ConnectionRegistry>,
	bus: Arc<dyn MessageBus>,
	topics: Topics,
}

impl MessageRouter {
	pub fn new(registry: Arc<ConnectionRegistry>, bus: Arc<dyn MessageBus>, topics: Topics) -> Self {
		Self {
			instance: registry.instance().clone(),
			registry,
			bus,
			topics,
		}
	}

	pub fn topics(&self) -> &Topics {
		&self.topics
	}

	/// Route one message. Never fails; undeliverable messages are dropped and logged.
	pub async fn route(&self, msg: Message) -> RouteOutcome {
		let outcome = if msg.kind.is_broadcast() {
			self.publish_broadcast(&msg).await
		} else if let Some(receiver) = msg.receiver_id.clone() {
			self.route_direct(&receiver, msg).await
		} else if msg.room_id.is_some() {
			self.route_room(msg).await
		} else {
			warn!(sender = %msg.sender_id, id = %msg.id, kind = %msg.kind, "message has no receiver or room; dropping");
			RouteOutcome::Dropped(DropReason::NoTarget)
		};

		record_outcome(&outcome);
		outcome
	}

	async fn route_direct(&self, receiver: &UserId, msg: Message) -> RouteOutcome {
		let owner = match self.registry.lookup_owner(receiver).await {
			Ok(Some(owner)) => owner,
			Ok(None) => {
				warn!(receiver = %receiver, sender = %msg.sender_id, id = %msg.id, "receiver not connected; dropping");
				return RouteOutcome::Dropped(DropReason::UnknownReceiver);
			}
			Err(e) => {
				warn!(receiver = %receiver, id = %msg.id, error = %e, "owner lookup failed; dropping");
				return RouteOutcome::Dropped(DropReason::StoreUnavailable);
			}
		};

		if owner == self.instance {
			return if self.deliver_local(receiver, msg).await {
				RouteOutcome::DeliveredLocal
			} else {
				RouteOutcome::Dropped(DropReason::LocalSessionClosed)
			};
		}

		let topic = self.topics.instance(&owner);
		if self.publish(&topic, &msg).await {
			debug!(receiver = %receiver, instance = %owner, id = %msg.id, "published to owner");
			RouteOutcome::Published { instance: owner }
		} else {
			RouteOutcome::Dropped(DropReason::PublishFailed)
		}
	}

	async fn route_room(&self, msg: Message) -> RouteOutcome {
		let Some(room) = msg.room_id.clone() else {
			return RouteOutcome::Dropped(DropReason::NoTarget);
		};

		let members = match self.registry.room_members(&room).await {
			Ok(m) => m,
			Err(e) => {
				warn!(room = %room, id = %msg.id, error = %e, "room membership unavailable; dropping");
				return RouteOutcome::Dropped(DropReason::StoreUnavailable);
			}
		};

		let mut recipients = 0;
		for member in members.into_iter().filter(|m| *m != msg.sender_id) {
			let copy = msg.addressed_to(member.clone());
			match self.route_direct(&member, copy).await {
				RouteOutcome::DeliveredLocal | RouteOutcome::Published { .. } => recipients += 1,
				_ => {}
			}
		}

		debug!(room = %room, id = %msg.id, recipients, "room fan-out");
		RouteOutcome::RoomFanout { recipients }
	}

	async fn publish_broadcast(&self, msg: &Message) -> RouteOutcome {
		if self.publish(&self.topics.broadcast, msg).await {
			RouteOutcome::Broadcast
		} else {
			RouteOutcome::Dropped(DropReason::PublishFailed)
		}
	}

	async fn publish(&self, topic: &str, msg: &Message) -> bool {
		let frame = match encode_bus_frame(&self.instance, msg) {
			Ok(f) => f,
			Err(e) => {
				warn!(%topic, id = %msg.id, error = %e, "could not encode bus frame; dropping");
				return false;
			}
		};

		match self.bus.publish(topic, frame).await {
			Ok(()) => true,
			Err(e) => {
				warn!(%topic, id = %msg.id, error = %e, "bus publish failed; dropping");
				false
			}
		}
	}

	async fn deliver_local(&self, receiver: &UserId, msg: Message) -> bool {
		let Some(session) = self.registry.get_local_session(receiver).filter(|s| s.is_open()) else {
			debug!(receiver = %receiver, id = %msg.id, "local session gone; dropping");
			return false;
		};

		match session.send(Outbound::Message(msg)).await {
			Ok(()) => true,
			Err(e) => {
				debug!(receiver = %receiver, session = %session.id(), error = %e, "local send failed; dropping");
				false
			}
		}
	}

	/// Deliver a message that arrived on this instance's topics. Broadcast kinds go to every
	/// open local session; directed messages go to the receiver's session if it is still here.
	/// Returns the number of sessions reached.
	pub async fn deliver_inbound(&self, msg: Message) -> usize {
		if msg.kind.is_broadcast() {
			let mut delivered = 0;
			for session in self.registry.local_sessions() {
				if session.is_open() && session.send(Outbound::Message(msg.clone())).await.is_ok() {
					delivered += 1;
				}
			}
			return delivered;
		}

		match msg.receiver_id.clone() {
			Some(receiver) => usize::from(self.deliver_local(&receiver, msg).await),
			None => {
				debug!(id = %msg.id, "inbound message without receiver; dropping");
				0
			}
		}
	}

	/// Decode and deliver one bus frame. Malformed frames are logged and discarded.
	pub async fn handle_frame(&self, frame: &[u8]) -> usize {
		match decode_bus_frame(frame) {
			Ok(decoded) => self.deliver_inbound(decoded.message).await,
			Err(e) => {
				warn!(error = %e, len = frame.len(), "discarding malformed bus frame");
				metrics::counter!("chatmesh_malformed_messages_total", "source" => "bus").increment(1);
				0
			}
		}
	}

	/// Consume `rx` until it ends or `cancel` fires.
	pub fn spawn_consumer(self: Arc<Self>, topic: String, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) -> JoinHandle<()> {
		tokio::spawn(async move {
			info!(%topic, "bus consumer started");
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					frame = rx.recv() => match frame {
						Some(frame) => {
							self.handle_frame(&frame).await;
						}
						None => {
							warn!(%topic, "bus subscription closed");
							break;
						}
					},
				}
			}
			info!(%topic, "bus consumer stopped");
		})
	}
}

fn record_outcome(outcome: &RouteOutcome) {
	let label = match outcome {
		RouteOutcome::DeliveredLocal => "local",
		RouteOutcome::Published { .. } => "published",
		RouteOutcome::Broadcast => "broadcast",
		RouteOutcome::RoomFanout { .. } => "room",
		RouteOutcome::Dropped(reason) => reason.as_str(),
	};
	metrics::counter!("chatmesh_routed_messages_total", "outcome" => label).increment(1);
}
