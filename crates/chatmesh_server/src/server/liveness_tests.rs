#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatmesh_domain::{InstanceId, LivenessRecord, RegistryEntry, SessionId, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::server::health::HealthState;
use crate::server::liveness::{InstanceState, LivenessMonitor, LivenessSettings, ReapReport};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{ChannelSession, DashMapDirectory, Outbound, SessionHandle};
use crate::store::{InMemoryStore, SharedStore, StoreError, keys};
use crate::util::time::ManualClock;

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn settings() -> LivenessSettings {
	LivenessSettings {
		heartbeat_interval: Duration::from_secs(30),
		ttl: Duration::from_secs(60),
		reap_interval: Duration::from_secs(60),
	}
}

struct Member {
	registry: Arc<ConnectionRegistry>,
	monitor: Arc<LivenessMonitor>,
	health: HealthState,
	outbound: Vec<mpsc::Receiver<Outbound>>,
}

impl Member {
	fn new(instance: &str, store: &Arc<InMemoryStore>) -> Self {
		let clock = Arc::new(ManualClock::new(5_000));
		let registry = Arc::new(ConnectionRegistry::new(
			InstanceId::new(instance).expect("valid InstanceId"),
			store.clone(),
			Arc::new(DashMapDirectory::new()),
			clock.clone(),
			Duration::from_secs(600),
		));
		let health = HealthState::new();
		let monitor = Arc::new(LivenessMonitor::new(
			store.clone(),
			registry.clone(),
			clock,
			settings(),
			health.clone(),
		));
		Self {
			registry,
			monitor,
			health,
			outbound: Vec::new(),
		}
	}

	async fn connect(&mut self, name: &str) {
		let (s, rx) = ChannelSession::new(SessionId(self.outbound.len() as u64 + 1), user(name), 8);
		let s: Arc<dyn SessionHandle> = s;
		self.registry.register_local(user(name), s).await;
		self.outbound.push(rx);
	}
}

async fn owner_of(store: &InMemoryStore, name: &str) -> Option<String> {
	let raw = store.get(&keys::registry(name)).await.unwrap()?;
	let entry: RegistryEntry = serde_json::from_str(&raw).unwrap();
	Some(entry.instance_id.into_string())
}

#[tokio::test]
async fn first_heartbeat_marks_instance_alive_and_ready() {
	let store = Arc::new(InMemoryStore::new());
	let a = Member::new("srvA", &store);

	assert_eq!(a.monitor.state(), InstanceState::Starting);
	assert!(!a.health.is_ready());

	a.monitor.heartbeat().await.expect("heartbeat");
	assert_eq!(a.monitor.state(), InstanceState::Alive);
	assert!(a.health.is_ready());

	let live = a.monitor.live_instances().await.unwrap();
	assert!(live.contains(&InstanceId::new("srvA").unwrap()));
}

#[tokio::test]
async fn failed_heartbeat_stays_starting_and_recovers_next_tick() {
	let store = Arc::new(InMemoryStore::new());
	let a = Member::new("srvA", &store);

	store.set_unavailable(true);
	assert!(a.monitor.heartbeat().await.is_err());
	assert_eq!(a.monitor.state(), InstanceState::Starting);

	store.set_unavailable(false);
	a.monitor.heartbeat().await.expect("heartbeat");
	assert_eq!(a.monitor.state(), InstanceState::Alive);
}

#[tokio::test(start_paused = true)]
async fn reaps_entries_of_expired_instance_only() {
	let store = Arc::new(InMemoryStore::new());
	let mut a = Member::new("srvA", &store);
	let mut x = Member::new("srvX", &store);

	a.monitor.heartbeat().await.unwrap();
	x.monitor.heartbeat().await.unwrap();
	a.connect("alice").await;
	x.connect("xavier").await;
	x.connect("xena").await;

	// X stops heartbeating; A keeps going.
	for _ in 0..3 {
		tokio::time::advance(Duration::from_secs(30)).await;
		a.monitor.heartbeat().await.unwrap();
	}

	let live = a.monitor.live_instances().await.unwrap();
	assert!(!live.contains(&InstanceId::new("srvX").unwrap()));

	let report = a.monitor.reap_dead_instances().await.unwrap();
	assert_eq!(report, ReapReport { scanned: 3, removed: 2 });

	assert_eq!(owner_of(&store, "alice").await.as_deref(), Some("srvA"));
	assert!(owner_of(&store, "xavier").await.is_none());
	assert!(owner_of(&store, "xena").await.is_none());
}

#[tokio::test]
async fn live_instances_are_never_reaped() {
	let store = Arc::new(InMemoryStore::new());
	let mut a = Member::new("srvA", &store);
	let mut b = Member::new("srvB", &store);

	a.monitor.heartbeat().await.unwrap();
	b.monitor.heartbeat().await.unwrap();
	a.connect("alice").await;
	b.connect("bob").await;

	let report = b.monitor.reap_dead_instances().await.unwrap();
	assert_eq!(report.removed, 0);
	assert_eq!(owner_of(&store, "alice").await.as_deref(), Some("srvA"));
	assert_eq!(owner_of(&store, "bob").await.as_deref(), Some("srvB"));
}

#[tokio::test]
async fn own_entries_survive_before_first_heartbeat() {
	let store = Arc::new(InMemoryStore::new());
	let mut a = Member::new("srvA", &store);
	a.connect("alice").await;

	let report = a.monitor.reap_dead_instances().await.unwrap();
	assert_eq!(report.removed, 0);
	assert_eq!(owner_of(&store, "alice").await.as_deref(), Some("srvA"));
}

#[tokio::test]
async fn malformed_entries_are_reaped() {
	let store = Arc::new(InMemoryStore::new());
	let a = Member::new("srvA", &store);
	a.monitor.heartbeat().await.unwrap();

	store
		.set_with_ttl(&keys::registry("ghost"), "{broken", Duration::from_secs(60))
		.await
		.unwrap();

	let report = a.monitor.reap_dead_instances().await.unwrap();
	assert_eq!(report.removed, 1);
	assert!(store.get(&keys::registry("ghost")).await.unwrap().is_none());
}

#[tokio::test]
async fn reap_is_skipped_when_store_is_down() {
	let store = Arc::new(InMemoryStore::new());
	let mut x = Member::new("srvX", &store);
	x.connect("xavier").await;
	let a = Member::new("srvA", &store);

	store.set_unavailable(true);
	assert!(a.monitor.reap_dead_instances().await.is_err());
	store.set_unavailable(false);

	assert_eq!(owner_of(&store, "xavier").await.as_deref(), Some("srvX"));
}

#[tokio::test]
async fn withdraw_removes_liveness_record() {
	let store = Arc::new(InMemoryStore::new());
	let a = Member::new("srvA", &store);
	a.monitor.heartbeat().await.unwrap();

	a.monitor.withdraw().await.unwrap();
	assert_eq!(a.monitor.state(), InstanceState::Stopped);
	assert!(!a.health.is_ready());
	assert!(a.monitor.live_instances().await.unwrap().is_empty());

	// A stopped instance does not come back on a stray tick.
	a.monitor.heartbeat().await.unwrap();
	assert!(a.monitor.live_instances().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn background_loops_heartbeat_and_reap_until_cancelled() {
	let store = Arc::new(InMemoryStore::new());
	let a = Member::new("srvA", &store);
	let mut x = Member::new("srvX", &store);
	x.connect("xavier").await;

	let cancel = CancellationToken::new();
	let tasks = a.monitor.spawn(cancel.clone());

	tokio::time::sleep(Duration::from_secs(31)).await;
	assert_eq!(a.monitor.state(), InstanceState::Alive);

	tokio::time::sleep(Duration::from_secs(30)).await;
	assert!(owner_of(&store, "xavier").await.is_none());

	cancel.cancel();
	for t in tasks {
		t.await.expect("loop exits cleanly");
	}
}

/// Brings `srvNew` up (liveness record, then one attached user) right after the live set
/// has been read and before the registry scan.
#[derive(Debug)]
struct LateStarterStore {
	inner: Arc<InMemoryStore>,
	started: AtomicBool,
}

impl LateStarterStore {
	async fn start_late_instance(&self) -> Result<(), StoreError> {
		let record = LivenessRecord {
			instance_id: InstanceId::new("srvNew").unwrap(),
			last_seen_ms: 5_000,
		};
		self.inner
			.set_with_ttl(&keys::liveness("srvNew"), &serde_json::to_string(&record)?, Duration::from_secs(60))
			.await?;
		let entry = RegistryEntry {
			user_id: user("newbie"),
			instance_id: InstanceId::new("srvNew").unwrap(),
			established_at_ms: 5_000,
		};
		self.inner
			.set_with_ttl(&keys::registry("newbie"), &serde_json::to_string(&entry)?, Duration::from_secs(600))
			.await
	}
}

#[async_trait::async_trait]
impl SharedStore for LateStarterStore {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		self.inner.get(key).await
	}

	async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
		self.inner.set_with_ttl(key, value, ttl).await
	}

	async fn delete(&self, key: &str) -> Result<bool, StoreError> {
		self.inner.delete(key).await
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
		self.inner.expire(key, ttl).await
	}

	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		if prefix == keys::REGISTRY_PREFIX && !self.started.swap(true, Ordering::SeqCst) {
			self.start_late_instance().await?;
		}
		self.inner.keys_with_prefix(prefix).await
	}

	async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
		self.inner.set_add(key, member).await
	}

	async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
		self.inner.set_remove(key, member).await
	}

	async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
		self.inner.set_members(key).await
	}
}

#[tokio::test]
async fn instance_starting_mid_pass_keeps_its_entries() {
	let inner = Arc::new(InMemoryStore::new());
	let store = Arc::new(LateStarterStore {
		inner: inner.clone(),
		started: AtomicBool::new(false),
	});
	let clock = Arc::new(ManualClock::new(5_000));
	let registry = Arc::new(ConnectionRegistry::new(
		InstanceId::new("srvA").unwrap(),
		store.clone(),
		Arc::new(DashMapDirectory::new()),
		clock.clone(),
		Duration::from_secs(600),
	));
	let monitor = LivenessMonitor::new(store, registry, clock, settings(), HealthState::new());
	monitor.heartbeat().await.unwrap();

	let report = monitor.reap_dead_instances().await.unwrap();

	assert_eq!(report, ReapReport { scanned: 1, removed: 0 });
	assert_eq!(owner_of(&inner, "newbie").await.as_deref(), Some("srvNew"));
}
