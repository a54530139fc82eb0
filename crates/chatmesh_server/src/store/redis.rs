#![forbid(unsafe_code)]

use std::time::Duration;

use redis::aio::MultiplexedConnection;

use super::{SharedStore, StoreError, bounded};

const SCAN_BATCH: usize = 200;

/// Redis-backed store. One multiplexed connection is shared by every caller.
#[derive(Clone)]
pub struct RedisStore {
	conn: MultiplexedConnection,
	op_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisStore").field("op_timeout", &self.op_timeout).finish()
	}
}

impl From<redis::RedisError> for StoreError {
	fn from(e: redis::RedisError) -> Self {
		StoreError::Unavailable(e.to_string())
	}
}

impl RedisStore {
	pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
		let client = redis::Client::open(url)?;
		let conn = bounded(op_timeout, async { Ok(client.get_multiplexed_async_connection().await?) }).await?;
		tracing::info!(%url, "connected to redis store");
		Ok(Self { conn, op_timeout })
	}

	fn conn(&self) -> MultiplexedConnection {
		self.conn.clone()
	}
}

fn ttl_ms(ttl: Duration) -> u64 {
	(ttl.as_millis() as u64).max(1)
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			Ok(redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await?)
		})
		.await
	}

	async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			redis::cmd("SET")
				.arg(key)
				.arg(value)
				.arg("PX")
				.arg(ttl_ms(ttl))
				.query_async::<_, ()>(&mut conn)
				.await?;
			Ok(())
		})
		.await
	}

	async fn delete(&self, key: &str) -> Result<bool, StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			let removed = redis::cmd("DEL").arg(key).query_async::<_, i64>(&mut conn).await?;
			Ok(removed > 0)
		})
		.await
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			let applied = redis::cmd("PEXPIRE")
				.arg(key)
				.arg(ttl_ms(ttl))
				.query_async::<_, i64>(&mut conn)
				.await?;
			Ok(applied == 1)
		})
		.await
	}

	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		let mut conn = self.conn();
		let pattern = format!("{prefix}*");
		bounded(self.op_timeout, async move {
			let mut cursor: u64 = 0;
			let mut keys = Vec::new();
			loop {
				let (next, batch) = redis::cmd("SCAN")
					.arg(cursor)
					.arg("MATCH")
					.arg(&pattern)
					.arg("COUNT")
					.arg(SCAN_BATCH)
					.query_async::<_, (u64, Vec<String>)>(&mut conn)
					.await?;
				keys.extend(batch);
				if next == 0 {
					break;
				}
				cursor = next;
			}
			keys.sort();
			keys.dedup();
			Ok(keys)
		})
		.await
	}

	async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			redis::cmd("SADD").arg(key).arg(member).query_async::<_, i64>(&mut conn).await?;
			Ok(())
		})
		.await
	}

	async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			redis::cmd("SREM").arg(key).arg(member).query_async::<_, i64>(&mut conn).await?;
			Ok(())
		})
		.await
	}

	async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
		let mut conn = self.conn();
		bounded(self.op_timeout, async move {
			let mut members = redis::cmd("SMEMBERS").arg(key).query_async::<_, Vec<String>>(&mut conn).await?;
			members.sort();
			Ok(members)
		})
		.await
	}
}
