#![forbid(unsafe_code)]

//! Shared store seam: key/value with TTL plus set collections.
//!
//! Every instance talks to the same store; nothing here is locked across instances.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("shared store unavailable: {0}")]
	Unavailable(String),

	#[error("shared store call timed out after {0:?}")]
	Timeout(Duration),

	#[error("stored value could not be decoded: {0}")]
	Codec(#[from] serde_json::Error),
}

#[async_trait::async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

	/// Write `value`, replacing any previous value and TTL.
	async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

	/// Returns whether a key was removed.
	async fn delete(&self, key: &str) -> Result<bool, StoreError>;

	/// Reset the TTL of an existing key. Returns `false` when the key does not exist.
	async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

	/// All live keys starting with `prefix`.
	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

	async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

	async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

	async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// Store key layout.
pub mod keys {
	pub const REGISTRY_PREFIX: &str = "registry:";
	pub const LIVENESS_PREFIX: &str = "liveness:";
	pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";
	pub const ROOM_MEMBERS_PREFIX: &str = "room:members:";

	pub fn registry(user: &str) -> String {
		format!("{REGISTRY_PREFIX}{user}")
	}

	pub fn liveness(instance: &str) -> String {
		format!("{LIVENESS_PREFIX}{instance}")
	}

	pub fn rate_limit(user: &str) -> String {
		format!("{RATE_LIMIT_PREFIX}{user}")
	}

	pub fn room_members(room: &str) -> String {
		format!("{ROOM_MEMBERS_PREFIX}{room}")
	}
}

/// Bound a store round trip by `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
	F: Future<Output = Result<T, StoreError>>,
{
	match tokio::time::timeout(limit, fut).await {
		Ok(res) => res,
		Err(_) => Err(StoreError::Timeout(limit)),
	}
}
