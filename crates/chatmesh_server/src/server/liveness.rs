#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chatmesh_domain::{InstanceId, LivenessRecord, RegistryEntry};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::health::HealthState;
use crate::server::registry::ConnectionRegistry;
use crate::store::{SharedStore, StoreError, keys};
use crate::util::time::Clock;

#[derive(Debug, Clone)]
pub struct LivenessSettings {
	pub heartbeat_interval: Duration,
	/// Lifetime of a liveness record. Must exceed `heartbeat_interval`.
	pub ttl: Duration,
	/// Must not be shorter than `heartbeat_interval`.
	pub reap_interval: Duration,
}

impl Default for LivenessSettings {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(30),
			ttl: Duration::from_secs(60),
			reap_interval: Duration::from_secs(60),
		}
	}
}

/// Lifecycle of this instance as seen by itself. Peers infer death from an expired record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceState {
	Starting = 0,
	Alive = 1,
	Stopped = 2,
}

impl InstanceState {
	fn from_u8(v: u8) -> Self {
		match v {
			1 => InstanceState::Alive,
			2 => InstanceState::Stopped,
			_ => InstanceState::Starting,
		}
	}
}

/// Summary of one reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
	pub scanned: usize,
	pub removed: usize,
}

#[derive(Debug)]
pub struct LivenessMonitor {
	instance: InstanceId,
	store: Arc<dyn SharedStore>,
	registry: Arc<ConnectionRegistry>,
	clock: Arc<dyn Clock>,
	settings: LivenessSettings,
	health: HealthState,
	state: AtomicU8,
}

impl LivenessMonitor {
	pub fn new(
		store: Arc<dyn SharedStore>,
		registry: Arc<ConnectionRegistry>,
		clock: Arc<dyn Clock>,
		settings: LivenessSettings,
		health: HealthState,
	) -> Self {
		Self {
			instance: registry.instance().clone(),
			store,
			registry,
			clock,
			settings,
			health,
			state: AtomicU8::new(InstanceState::Starting as u8),
		}
	}

	pub fn state(&self) -> InstanceState {
		InstanceState::from_u8(self.state.load(Ordering::SeqCst))
	}

	/// Publish this instance's liveness record and extend the registry entries of its open
	/// sessions. A failure is retried on the next tick.
	pub async fn heartbeat(&self) -> Result<(), StoreError> {
		if self.state() == InstanceState::Stopped {
			return Ok(());
		}

		let record = LivenessRecord {
			instance_id: self.instance.clone(),
			last_seen_ms: self.clock.now_ms(),
		};
		let raw = serde_json::to_string(&record)?;
		self.store
			.set_with_ttl(&keys::liveness(self.instance.as_str()), &raw, self.settings.ttl)
			.await?;

		if self
			.state
			.compare_exchange(
				InstanceState::Starting as u8,
				InstanceState::Alive as u8,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_ok()
		{
			info!(instance = %self.instance, "instance alive");
			self.health.mark_ready();
		}

		let refreshed = self.registry.refresh_all().await;
		debug!(instance = %self.instance, refreshed, "heartbeat");
		Ok(())
	}

	/// Instances with an unexpired liveness record.
	pub async fn live_instances(&self) -> Result<HashSet<InstanceId>, StoreError> {
		let keys = self.store.keys_with_prefix(keys::LIVENESS_PREFIX).await?;
		Ok(keys
			.iter()
			.filter_map(|k| k.strip_prefix(keys::LIVENESS_PREFIX))
			.filter_map(|id| InstanceId::new(id).ok())
			.collect())
	}

	/// Delete registry entries owned by instances missing from the live set. This instance
	/// always counts as live.
	///
	/// Before deleting, the owner's liveness record is checked again and the entry is re-read,
	/// so an instance that started mid-pass or a reconnect in the meantime keeps its entry.
	pub async fn reap_dead_instances(&self) -> Result<ReapReport, StoreError> {
		let mut live = self.live_instances().await?;
		live.insert(self.instance.clone());

		let entry_keys = self.store.keys_with_prefix(keys::REGISTRY_PREFIX).await?;
		let mut report = ReapReport {
			scanned: entry_keys.len(),
			removed: 0,
		};

		for key in entry_keys {
			let Some(raw) = self.store.get(&key).await? else {
				continue;
			};

			let owner = match serde_json::from_str::<RegistryEntry>(&raw) {
				Ok(entry) if live.contains(&entry.instance_id) => continue,
				Ok(entry) => {
					// The owner may have started after the live set was read.
					if self.store.get(&keys::liveness(entry.instance_id.as_str())).await?.is_some() {
						debug!(%key, owner = %entry.instance_id, "owner came up during reap pass; keeping");
						live.insert(entry.instance_id);
						continue;
					}
					Some(entry.instance_id)
				}
				Err(e) => {
					warn!(%key, error = %e, "malformed registry entry; reaping");
					None
				}
			};

			if self.store.get(&key).await?.as_deref() != Some(raw.as_str()) {
				continue;
			}

			if self.store.delete(&key).await? {
				report.removed += 1;
				match owner {
					Some(owner) => debug!(%key, owner = %owner, "reaped orphaned registry entry"),
					None => debug!(%key, "reaped unreadable registry entry"),
				}
			}
		}

		if report.removed > 0 {
			info!(removed = report.removed, scanned = report.scanned, "reaped registry entries of dead instances");
		}
		metrics::counter!("chatmesh_reaped_entries_total").increment(report.removed as u64);
		Ok(report)
	}

	/// Remove this instance's record so peers stop routing to it without waiting for expiry.
	pub async fn withdraw(&self) -> Result<(), StoreError> {
		self.state.store(InstanceState::Stopped as u8, Ordering::SeqCst);
		self.health.mark_not_ready();
		self.store.delete(&keys::liveness(self.instance.as_str())).await?;
		info!(instance = %self.instance, "liveness record withdrawn");
		Ok(())
	}

	/// Start the heartbeat and reap loops. Both first fire one interval from now and stop when
	/// `cancel` fires.
	pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
		let heartbeat = {
			let monitor = Arc::clone(self);
			let cancel = cancel.clone();
			let period = self.settings.heartbeat_interval;
			tokio::spawn(async move {
				let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
				tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
				loop {
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tick.tick() => {
							if let Err(e) = monitor.heartbeat().await {
								warn!(instance = %monitor.instance, error = %e, "heartbeat failed");
								metrics::counter!("chatmesh_heartbeat_failures_total").increment(1);
							}
						}
					}
				}
				debug!("heartbeat loop stopped");
			})
		};

		let reaper = {
			let monitor = Arc::clone(self);
			let period = self.settings.reap_interval;
			tokio::spawn(async move {
				let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
				tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
				loop {
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tick.tick() => {
							if let Err(e) = monitor.reap_dead_instances().await {
								warn!(error = %e, "reap pass skipped");
							}
						}
					}
				}
				debug!("reap loop stopped");
			})
		};

		vec![heartbeat, reaper]
	}
}
