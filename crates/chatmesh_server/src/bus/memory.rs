#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::{BusError, MessageBus};

/// In-process bus. Clones share the same topics, so several instances in one process can
/// talk through it.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
	inner: Arc<Mutex<Inner>>,
	unavailable: Arc<AtomicBool>,
	subscriber_queue_capacity: usize,
}

#[derive(Debug, Default)]
struct Inner {
	topics: HashMap<String, TopicEntry>,
	published: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct TopicEntry {
	subscribers: Vec<mpsc::Sender<Bytes>>,
	dropped: u64,
}

impl Default for InMemoryBus {
	fn default() -> Self {
		Self::new(1024)
	}
}

impl InMemoryBus {
	pub fn new(subscriber_queue_capacity: usize) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			unavailable: Arc::new(AtomicBool::new(false)),
			subscriber_queue_capacity: subscriber_queue_capacity.max(1),
		}
	}

	/// Make every publish fail with `Unavailable`.
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	/// Number of successful publishes on `topic`, whether or not anyone was listening.
	pub async fn publish_count(&self, topic: &str) -> u64 {
		let inner = self.inner.lock().await;
		inner.published.get(topic).copied().unwrap_or(0)
	}

	pub async fn total_publishes(&self) -> u64 {
		let inner = self.inner.lock().await;
		inner.published.values().sum()
	}

	/// Frames dropped on `topic` because a subscriber queue was full.
	pub async fn dropped_count(&self, topic: &str) -> u64 {
		let inner = self.inner.lock().await;
		inner.topics.get(topic).map(|t| t.dropped).unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl MessageBus for InMemoryBus {
	async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BusError> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(BusError::Unavailable("in-memory bus marked unavailable".to_string()));
		}

		let mut inner = self.inner.lock().await;
		*inner.published.entry(topic.to_string()).or_default() += 1;

		let Some(entry) = inner.topics.get_mut(topic) else {
			return Ok(());
		};

		let mut dropped = 0u64;
		for sub in &entry.subscribers {
			match sub.try_send(frame.clone()) {
				Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
				Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
			}
		}
		entry.subscribers.retain(|s| !s.is_closed());
		entry.dropped = entry.dropped.saturating_add(dropped);

		if dropped > 0 {
			debug!(%topic, dropped, "bus: dropped frames for full subscriber queues");
			metrics::counter!("chatmesh_bus_dropped_total").increment(dropped);
		}

		if entry.subscribers.is_empty() && entry.dropped == 0 {
			inner.topics.remove(topic);
		}

		Ok(())
	}

	async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
		let (tx, rx) = mpsc::channel(self.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.topics.entry(topic.to_string()).or_default();
		entry.subscribers.retain(|s| !s.is_closed());
		entry.subscribers.push(tx);

		debug!(%topic, subs = entry.subscribers.len(), "bus: subscribed");
		Ok(rx)
	}
}
