#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub use chatmesh_domain::unix_ms_now;

/// Wall-clock source. Timestamps are shared across instances through the store, so
/// this is Unix time rather than a monotonic `Instant`.
pub trait Clock: Send + Sync + std::fmt::Debug {
	fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> i64 {
		unix_ms_now()
	}
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
	now: Arc<AtomicI64>,
}

impl ManualClock {
	pub fn new(start_ms: i64) -> Self {
		Self {
			now: Arc::new(AtomicI64::new(start_ms)),
		}
	}

	pub fn advance(&self, by: Duration) {
		self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> i64 {
		self.now.load(Ordering::SeqCst)
	}
}

pub fn system_clock() -> Arc<dyn Clock> {
	Arc::new(SystemClock)
}
