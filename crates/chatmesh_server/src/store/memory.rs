#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{SharedStore, StoreError, bounded};

/// Process-local store. Shared between in-process instances in tests and used by
/// single-node deployments.
#[derive(Debug)]
pub struct InMemoryStore {
	inner: Mutex<HashMap<String, Slot>>,
	unavailable: AtomicBool,
	stalled: AtomicBool,
	op_timeout: Duration,
}

#[derive(Debug)]
struct Slot {
	value: SlotValue,
	expires_at: Option<Instant>,
}

#[derive(Debug)]
enum SlotValue {
	Text(String),
	Set(HashSet<String>),
}

impl Slot {
	fn is_live(&self, now: Instant) -> bool {
		self.expires_at.is_none_or(|at| at > now)
	}
}

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

impl Default for InMemoryStore {
	fn default() -> Self {
		Self {
			inner: Mutex::new(HashMap::new()),
			unavailable: AtomicBool::new(false),
			stalled: AtomicBool::new(false),
			op_timeout: DEFAULT_OP_TIMEOUT,
		}
	}
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
		self.op_timeout = op_timeout;
		self
	}

	/// Simulate a partition toward the store: every call fails with `Unavailable`.
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	/// Simulate a store that stops answering: every call hangs until `op_timeout`.
	pub fn set_stalled(&self, stalled: bool) {
		self.stalled.store(stalled, Ordering::SeqCst);
	}

	async fn check_reachable(&self) -> Result<(), StoreError> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
		}
		if self.stalled.load(Ordering::SeqCst) {
			return bounded(self.op_timeout, std::future::pending()).await;
		}
		Ok(())
	}
}

fn prune(map: &mut HashMap<String, Slot>, key: &str, now: Instant) {
	if map.get(key).is_some_and(|slot| !slot.is_live(now)) {
		map.remove(key);
	}
}

#[async_trait::async_trait]
impl SharedStore for InMemoryStore {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		self.check_reachable().await?;
		let mut map = self.inner.lock().await;
		prune(&mut map, key, Instant::now());
		Ok(match map.get(key) {
			Some(Slot {
				value: SlotValue::Text(v),
				..
			}) => Some(v.clone()),
			_ => None,
		})
	}

	async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
		self.check_reachable().await?;
		let mut map = self.inner.lock().await;
		map.insert(
			key.to_string(),
			Slot {
				value: SlotValue::Text(value.to_string()),
				expires_at: Some(Instant::now() + ttl),
			},
		);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<bool, StoreError> {
		self.check_reachable().await?;
		let mut map = self.inner.lock().await;
		prune(&mut map, key, Instant::now());
		Ok(map.remove(key).is_some())
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
		self.check_reachable().await?;
		let now = Instant::now();
		let mut map = self.inner.lock().await;
		prune(&mut map, key, now);
		match map.get_mut(key) {
			Some(slot) => {
				slot.expires_at = Some(now + ttl);
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		self.check_reachable().await?;
		let now = Instant::now();
		let mut map = self.inner.lock().await;
		map.retain(|_, slot| slot.is_live(now));
		let mut keys: Vec<String> = map.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
		keys.sort();
		Ok(keys)
	}

	async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
		self.check_reachable().await?;
		let mut map = self.inner.lock().await;
		prune(&mut map, key, Instant::now());
		let slot = map.entry(key.to_string()).or_insert_with(|| Slot {
			value: SlotValue::Set(HashSet::new()),
			expires_at: None,
		});
		match &mut slot.value {
			SlotValue::Set(set) => {
				set.insert(member.to_string());
			}
			SlotValue::Text(_) => {
				let mut set = HashSet::new();
				set.insert(member.to_string());
				slot.value = SlotValue::Set(set);
			}
		}
		Ok(())
	}

	async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
		self.check_reachable().await?;
		let mut map = self.inner.lock().await;
		prune(&mut map, key, Instant::now());
		let now_empty = match map.get_mut(key) {
			Some(Slot {
				value: SlotValue::Set(set),
				..
			}) => {
				set.remove(member);
				set.is_empty()
			}
			_ => false,
		};
		if now_empty {
			map.remove(key);
		}
		Ok(())
	}

	async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
		self.check_reachable().await?;
		let mut map = self.inner.lock().await;
		prune(&mut map, key, Instant::now());
		let mut members: Vec<String> = match map.get(key) {
			Some(Slot {
				value: SlotValue::Set(set),
				..
			}) => set.iter().cloned().collect(),
			_ => Vec::new(),
		};
		members.sort();
		Ok(members)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn values_expire_after_ttl() {
		let store = InMemoryStore::new();
		store.set_with_ttl("k", "v", Duration::from_secs(5)).await.unwrap();
		assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

		tokio::time::advance(Duration::from_secs(6)).await;
		assert_eq!(store.get("k").await.unwrap(), None);
		assert!(!store.expire("k", Duration::from_secs(5)).await.unwrap());
	}

	#[tokio::test(start_paused = true)]
	async fn expire_extends_live_keys() {
		let store = InMemoryStore::new();
		store.set_with_ttl("k", "v", Duration::from_secs(5)).await.unwrap();

		tokio::time::advance(Duration::from_secs(4)).await;
		assert!(store.expire("k", Duration::from_secs(5)).await.unwrap());

		tokio::time::advance(Duration::from_secs(4)).await;
		assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
	}

	#[tokio::test]
	async fn prefix_scan_and_sets() {
		let store = InMemoryStore::new();
		store.set_with_ttl("registry:a", "1", Duration::from_secs(60)).await.unwrap();
		store.set_with_ttl("registry:b", "2", Duration::from_secs(60)).await.unwrap();
		store.set_with_ttl("liveness:x", "3", Duration::from_secs(60)).await.unwrap();

		let keys = store.keys_with_prefix("registry:").await.unwrap();
		assert_eq!(keys, vec!["registry:a".to_string(), "registry:b".to_string()]);

		store.set_add("room:members:lobby", "alice").await.unwrap();
		store.set_add("room:members:lobby", "bob").await.unwrap();
		store.set_remove("room:members:lobby", "alice").await.unwrap();
		assert_eq!(store.set_members("room:members:lobby").await.unwrap(), vec!["bob".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn stalled_store_times_out() {
		let store = InMemoryStore::new().with_op_timeout(Duration::from_millis(200));
		store.set_with_ttl("k", "v", Duration::from_secs(60)).await.unwrap();
		store.set_stalled(true);

		let started = Instant::now();
		assert!(matches!(store.get("k").await, Err(StoreError::Timeout(d)) if d == Duration::from_millis(200)));
		assert!(matches!(store.keys_with_prefix("").await, Err(StoreError::Timeout(_))));
		assert!(started.elapsed() >= Duration::from_millis(400));

		store.set_stalled(false);
		assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
	}

	#[tokio::test]
	async fn unavailable_store_fails_every_call() {
		let store = InMemoryStore::new();
		store.set_unavailable(true);
		assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
		store.set_unavailable(false);
		assert!(store.get("k").await.unwrap().is_none());
	}
}
