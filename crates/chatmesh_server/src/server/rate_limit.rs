#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatmesh_domain::{TokenBucketState, UserId};
use tracing::{debug, warn};

use crate::store::{SharedStore, StoreError, keys};
use crate::util::time::Clock;

/// Token bucket parameters applied to every user.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
	pub enabled: bool,
	/// Burst size; a first-time sender starts with this many tokens.
	pub capacity: u32,
	/// Tokens added per second.
	pub refill_per_sec: f64,
	/// Stored buckets expire after this long without a check.
	pub idle_ttl: Duration,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			capacity: 100,
			refill_per_sec: 200.0 / 60.0,
			idle_ttl: Duration::from_secs(300),
		}
	}
}

impl RateLimitSettings {
	pub fn per_minute(capacity: u32, refill_per_minute: u32) -> Self {
		Self {
			capacity,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			..Self::default()
		}
	}
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	Allowed,
	Throttled { retry_after_secs: u64 },
}

impl Admission {
	pub fn is_allowed(&self) -> bool {
		matches!(self, Admission::Allowed)
	}
}

/// Per-user token bucket kept in the shared store.
///
/// Checks do a read-modify-write without cross-instance locking, so two instances checking
/// the same user at once can admit slightly more than `capacity`.
#[derive(Debug)]
pub struct RateLimiter {
	store: Arc<dyn SharedStore>,
	clock: Arc<dyn Clock>,
	settings: RateLimitSettings,
}

impl RateLimiter {
	pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, settings: RateLimitSettings) -> Self {
		Self { store, clock, settings }
	}

	pub fn settings(&self) -> &RateLimitSettings {
		&self.settings
	}

	/// Consume one token for `user` when available.
	///
	/// A throttled check leaves the stored tokens untouched. It does count as a pending
	/// attempt, so consecutive throttled checks get growing retry hints, capped at the time
	/// one full bucket takes to refill.
	///
	/// Store failures admit the message.
	pub async fn check(&self, user: &UserId) -> Admission {
		if !self.settings.enabled || self.settings.capacity == 0 || self.settings.refill_per_sec <= 0.0 {
			return Admission::Allowed;
		}

		let now = self.clock.now_ms();
		let key = keys::rate_limit(user.as_str());

		let stored = match self.load(&key).await {
			Ok(s) => s,
			Err(e) => {
				warn!(user = %user, error = %e, "rate limit state unavailable; admitting");
				metrics::counter!("chatmesh_rate_limit_store_errors_total").increment(1);
				return Admission::Allowed;
			}
		};

		let state = stored.unwrap_or_else(|| self.full_bucket(now));
		let available = self.refilled(&state, now);

		let (admission, next) = if available >= 1.0 {
			let next = TokenBucketState {
				tokens: available - 1.0,
				last_refill_ms: now,
				capacity: self.settings.capacity,
				refill_rate: self.settings.refill_per_sec,
				backlog: 0,
			};
			(Admission::Allowed, next)
		} else {
			let backlog = state.backlog.min(self.settings.capacity);
			let needed = 1.0 + backlog as f64 - available;
			let retry_after_secs = ((needed / self.settings.refill_per_sec).ceil() as u64).max(1);
			let next = TokenBucketState {
				tokens: state.tokens.clamp(0.0, self.settings.capacity as f64),
				last_refill_ms: state.last_refill_ms,
				capacity: self.settings.capacity,
				refill_rate: self.settings.refill_per_sec,
				backlog: backlog.saturating_add(1).min(self.settings.capacity),
			};
			(Admission::Throttled { retry_after_secs }, next)
		};

		if let Err(e) = self.save(&key, &next).await {
			warn!(user = %user, error = %e, "failed to persist rate limit state");
		}

		match admission {
			Admission::Allowed => metrics::counter!("chatmesh_rate_limit_allowed_total").increment(1),
			Admission::Throttled { retry_after_secs } => {
				debug!(user = %user, retry_after_secs, tokens = available, "rate limited");
				metrics::counter!("chatmesh_rate_limit_rejected_total").increment(1);
			}
		}

		admission
	}

	/// Current bucket for `user` with refill applied. Does not consume.
	pub async fn status(&self, user: &UserId) -> Result<TokenBucketState, StoreError> {
		let now = self.clock.now_ms();
		let stored = self.load(&keys::rate_limit(user.as_str())).await?;
		let state = stored.unwrap_or_else(|| self.full_bucket(now));
		Ok(TokenBucketState {
			tokens: self.refilled(&state, now),
			last_refill_ms: now,
			capacity: self.settings.capacity,
			refill_rate: self.settings.refill_per_sec,
			backlog: state.backlog,
		})
	}

	/// Forget the stored bucket; the next check starts full.
	pub async fn reset(&self, user: &UserId) -> Result<bool, StoreError> {
		let removed = self.store.delete(&keys::rate_limit(user.as_str())).await?;
		if removed {
			debug!(user = %user, "rate limit reset");
		}
		Ok(removed)
	}

	fn full_bucket(&self, now_ms: i64) -> TokenBucketState {
		TokenBucketState::full(self.settings.capacity, self.settings.refill_per_sec, now_ms)
	}

	fn refilled(&self, state: &TokenBucketState, now_ms: i64) -> f64 {
		let capacity = self.settings.capacity as f64;
		let elapsed_secs = (now_ms - state.last_refill_ms).max(0) as f64 / 1000.0;
		(state.tokens.clamp(0.0, capacity) + elapsed_secs * self.settings.refill_per_sec).min(capacity)
	}

	/// Unreadable state is treated as absent.
	async fn load(&self, key: &str) -> Result<Option<TokenBucketState>, StoreError> {
		let Some(raw) = self.store.get(key).await? else {
			return Ok(None);
		};
		match serde_json::from_str(&raw) {
			Ok(state) => Ok(Some(state)),
			Err(e) => {
				warn!(%key, error = %e, "discarding malformed rate limit state");
				Ok(None)
			}
		}
	}

	async fn save(&self, key: &str, state: &TokenBucketState) -> Result<(), StoreError> {
		let raw = serde_json::to_string(state)?;
		self.store.set_with_ttl(key, &raw, self.settings.idle_ttl).await
	}
}
