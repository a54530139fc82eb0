#![forbid(unsafe_code)]

//! Cross-instance publish/subscribe seam.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use chatmesh_domain::InstanceId;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::InMemoryBus;
pub use redis::RedisBus;

#[derive(Debug, Error)]
pub enum BusError {
	#[error("bus unavailable: {0}")]
	Unavailable(String),

	#[error("bus call timed out after {0:?}")]
	Timeout(Duration),

	#[error("bus closed")]
	Closed,
}

/// Best-effort fan-out of opaque frames. Nothing published before a subscription exists
/// is replayed to it.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug {
	async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BusError>;

	/// Stream of frames published on `topic` from now on. The stream ends when the bus is
	/// dropped or the underlying subscription fails.
	async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Bytes>, BusError>;
}

/// Topic naming for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
	pub broadcast: String,
	pub instance_prefix: String,
}

impl Default for Topics {
	fn default() -> Self {
		Self {
			broadcast: "chat.broadcast".to_string(),
			instance_prefix: "chat.instance.".to_string(),
		}
	}
}

impl Topics {
	/// Directed-delivery topic owned by `instance`.
	pub fn instance(&self, instance: &InstanceId) -> String {
		format!("{}{}", self.instance_prefix, instance)
	}
}

pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, BusError>
where
	F: Future<Output = Result<T, BusError>>,
{
	match tokio::time::timeout(limit, fut).await {
		Ok(res) => res,
		Err(_) => Err(BusError::Timeout(limit)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn bounded_reports_timeout_for_unanswered_publish() {
		let limit = Duration::from_millis(250);
		let res: Result<(), BusError> = bounded(limit, std::future::pending()).await;
		assert!(matches!(res, Err(BusError::Timeout(d)) if d == limit));
	}

	#[test]
	fn instance_topic_uses_prefix() {
		let topics = Topics::default();
		assert_eq!(topics.instance(&InstanceId::new("srv2").unwrap()), "chat.instance.srv2");
	}
}
