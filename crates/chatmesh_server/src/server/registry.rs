#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatmesh_domain::{InstanceId, RegistryEntry, RoomId, SessionId, UserId};
use tracing::{debug, info, warn};

use crate::server::session::{SessionDirectory, SessionHandle};
use crate::store::{SharedStore, StoreError, keys};
use crate::util::time::Clock;

/// Outcome of attaching a session.
#[derive(Debug)]
pub struct Registration {
	/// Local session for the same user that this one replaced.
	pub superseded: Option<Arc<dyn SessionHandle>>,
	/// Whether the shared ownership entry was written. `false` means only local delivery works
	/// for this user until the next successful refresh.
	pub shared: bool,
}

/// Local session directory plus the shared `user -> instance` ownership map.
///
/// Shared writes are last-write-wins. A user attaching to a second instance simply takes
/// over the entry; the old instance no longer receives directed messages for that user.
#[derive(Debug)]
pub struct ConnectionRegistry {
	instance: InstanceId,
	store: Arc<dyn SharedStore>,
	local: Arc<dyn SessionDirectory>,
	clock: Arc<dyn Clock>,
	entry_ttl: Duration,
}

impl ConnectionRegistry {
	pub fn new(
		instance: InstanceId,
		store: Arc<dyn SharedStore>,
		local: Arc<dyn SessionDirectory>,
		clock: Arc<dyn Clock>,
		entry_ttl: Duration,
	) -> Self {
		Self {
			instance,
			store,
			local,
			clock,
			entry_ttl,
		}
	}

	pub fn instance(&self) -> &InstanceId {
		&self.instance
	}

	pub async fn register_local(&self, user: UserId, session: Arc<dyn SessionHandle>) -> Registration {
		let session_id = session.id();
		let superseded = self.local.insert(user.clone(), session);
		if let Some(prev) = &superseded {
			debug!(user = %user, old = %prev.id(), new = %session_id, "local session superseded");
		}
		metrics::gauge!("chatmesh_local_sessions").set(self.local.len() as f64);

		let shared = match self.write_entry(&user).await {
			Ok(()) => true,
			Err(e) => {
				warn!(user = %user, error = %e, "registry write failed; session is local-only");
				metrics::counter!("chatmesh_registry_store_errors_total", "op" => "register").increment(1);
				false
			}
		};

		info!(user = %user, session = %session_id, shared, "session registered");
		Registration { superseded, shared }
	}

	pub async fn lookup_owner(&self, user: &UserId) -> Result<Option<InstanceId>, StoreError> {
		Ok(self.read_entry(user).await?.map(|e| e.instance_id))
	}

	pub async fn is_online(&self, user: &UserId) -> Result<bool, StoreError> {
		Ok(self.lookup_owner(user).await?.is_some())
	}

	/// Only meaningful on the owning instance.
	pub fn get_local_session(&self, user: &UserId) -> Option<Arc<dyn SessionHandle>> {
		self.local.get(user)
	}

	pub fn local_sessions(&self) -> Vec<Arc<dyn SessionHandle>> {
		self.local.snapshot()
	}

	pub fn local_session_count(&self) -> usize {
		self.local.len()
	}

	/// Graceful close: drop the local session and the shared entry if this instance still owns it.
	pub async fn unregister(&self, user: &UserId) {
		if self.local.remove(user).is_some() {
			metrics::gauge!("chatmesh_local_sessions").set(self.local.len() as f64);
		}
		self.release_entry(user).await;
	}

	/// Like `unregister`, but a no-op when `session_id` has already been replaced by a newer
	/// session for the same user.
	pub async fn unregister_if_current(&self, user: &UserId, session_id: SessionId) -> bool {
		if self.local.remove_if_session(user, session_id).is_none() {
			debug!(user = %user, session = %session_id, "stale session close; registry untouched");
			return false;
		}
		metrics::gauge!("chatmesh_local_sessions").set(self.local.len() as f64);
		self.release_entry(user).await;
		true
	}

	/// Extend the shared entry of an open local session. A missing entry (expired, reaped, or
	/// never written) is re-created.
	pub async fn refresh(&self, user: &UserId) -> Result<bool, StoreError> {
		match self.local.get(user) {
			Some(session) if session.is_open() => {}
			_ => return Ok(false),
		}

		if self.store.expire(&keys::registry(user.as_str()), self.entry_ttl).await? {
			return Ok(true);
		}

		debug!(user = %user, "registry entry missing; rewriting");
		self.write_entry(user).await?;
		Ok(true)
	}

	/// Refresh every local session. Returns how many entries were extended.
	pub async fn refresh_all(&self) -> usize {
		let mut refreshed = 0;
		for session in self.local.snapshot() {
			match self.refresh(session.user()).await {
				Ok(true) => refreshed += 1,
				Ok(false) => {}
				Err(e) => {
					warn!(user = %session.user(), error = %e, "registry refresh failed");
					metrics::counter!("chatmesh_registry_store_errors_total", "op" => "refresh").increment(1);
				}
			}
		}
		refreshed
	}

	/// Members of a room, as maintained by the membership service.
	pub async fn room_members(&self, room: &RoomId) -> Result<Vec<UserId>, StoreError> {
		let raw = self.store.set_members(&keys::room_members(room.as_str())).await?;
		Ok(raw.into_iter().filter_map(|m| UserId::new(m).ok()).collect())
	}

	async fn write_entry(&self, user: &UserId) -> Result<(), StoreError> {
		let entry = RegistryEntry {
			user_id: user.clone(),
			instance_id: self.instance.clone(),
			established_at_ms: self.clock.now_ms(),
		};
		let raw = serde_json::to_string(&entry)?;
		self.store
			.set_with_ttl(&keys::registry(user.as_str()), &raw, self.entry_ttl)
			.await
	}

	async fn read_entry(&self, user: &UserId) -> Result<Option<RegistryEntry>, StoreError> {
		match self.store.get(&keys::registry(user.as_str())).await? {
			Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
			None => Ok(None),
		}
	}

	/// Delete the shared entry unless another instance has taken it over.
	async fn release_entry(&self, user: &UserId) {
		let key = keys::registry(user.as_str());
		let result = async {
			match self.read_entry(user).await {
				Ok(Some(entry)) if entry.instance_id != self.instance => {
					debug!(user = %user, owner = %entry.instance_id, "entry owned elsewhere; keeping");
					Ok(false)
				}
				Ok(None) => Ok(false),
				Ok(Some(_)) | Err(StoreError::Codec(_)) => self.store.delete(&key).await,
				Err(e) => Err(e),
			}
		}
		.await;

		match result {
			Ok(removed) => debug!(user = %user, removed, "session unregistered"),
			Err(e) => {
				warn!(user = %user, error = %e, "registry delete failed; entry will expire");
				metrics::counter!("chatmesh_registry_store_errors_total", "op" => "unregister").increment(1);
			}
		}
	}
}
