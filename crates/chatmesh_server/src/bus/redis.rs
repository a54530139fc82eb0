#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BusError, MessageBus, bounded};

/// Redis PUBLISH/SUBSCRIBE bus. Publishes share one multiplexed connection; each
/// subscription owns a dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
	client: redis::Client,
	conn: MultiplexedConnection,
	op_timeout: Duration,
	subscriber_queue_capacity: usize,
}

impl std::fmt::Debug for RedisBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisBus")
			.field("op_timeout", &self.op_timeout)
			.field("subscriber_queue_capacity", &self.subscriber_queue_capacity)
			.finish()
	}
}

impl From<redis::RedisError> for BusError {
	fn from(e: redis::RedisError) -> Self {
		BusError::Unavailable(e.to_string())
	}
}

impl RedisBus {
	pub async fn connect(url: &str, op_timeout: Duration, subscriber_queue_capacity: usize) -> Result<Self, BusError> {
		let client = redis::Client::open(url)?;
		let conn = bounded(op_timeout, async { Ok(client.get_multiplexed_async_connection().await?) }).await?;
		Ok(Self {
			client,
			conn,
			op_timeout,
			subscriber_queue_capacity: subscriber_queue_capacity.max(1),
		})
	}
}

#[async_trait::async_trait]
impl MessageBus for RedisBus {
	async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BusError> {
		let mut conn = self.conn.clone();
		bounded(self.op_timeout, async move {
			let receivers = redis::cmd("PUBLISH")
				.arg(topic)
				.arg(frame.as_ref())
				.query_async::<_, i64>(&mut conn)
				.await?;
			debug!(%topic, receivers, "bus: published");
			Ok(())
		})
		.await
	}

	async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
		let client = self.client.clone();
		let owned_topic = topic.to_string();
		let mut pubsub = bounded(self.op_timeout, async move {
			let mut pubsub = client.get_async_pubsub().await?;
			pubsub.subscribe(&owned_topic).await?;
			Ok(pubsub)
		})
		.await?;

		let (tx, rx) = mpsc::channel(self.subscriber_queue_capacity);
		let topic = topic.to_string();
		tokio::spawn(async move {
			let mut stream = pubsub.on_message();
			while let Some(msg) = stream.next().await {
				let payload: Vec<u8> = match msg.get_payload() {
					Ok(p) => p,
					Err(e) => {
						warn!(%topic, error = %e, "bus: unreadable payload");
						continue;
					}
				};
				if tx.send(Bytes::from(payload)).await.is_err() {
					break;
				}
			}
			debug!(%topic, "bus: subscription ended");
		});

		Ok(rx)
	}
}
