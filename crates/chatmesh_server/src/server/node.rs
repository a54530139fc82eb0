#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chatmesh_domain::{InstanceId, Message, SessionId, UserId};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusError, MessageBus, Topics};
use crate::server::health::HealthState;
use crate::server::liveness::{LivenessMonitor, LivenessSettings};
use crate::server::rate_limit::{RateLimitSettings, RateLimiter};
use crate::server::registry::ConnectionRegistry;
use crate::server::router::MessageRouter;
use crate::server::session::{
	ChannelSession, DashMapDirectory, Inbound, Outbound, SessionError, SessionHandle, SessionPipeline,
};
use crate::store::SharedStore;
use crate::util::time::Clock;

/// Everything one instance needs to join a cluster.
#[derive(Debug, Clone)]
pub struct NodeSettings {
	pub instance: InstanceId,
	pub topics: Topics,
	pub registry_ttl: Duration,
	pub liveness: LivenessSettings,
	pub rate_limit: RateLimitSettings,
	/// Bound of each session's inbound and outbound queues.
	pub session_queue_capacity: usize,
}

impl NodeSettings {
	pub fn new(instance: InstanceId) -> Self {
		Self {
			instance,
			topics: Topics::default(),
			registry_ttl: Duration::from_secs(90),
			liveness: LivenessSettings::default(),
			rate_limit: RateLimitSettings::default(),
			session_queue_capacity: 256,
		}
	}
}

/// One running instance: registry, rate limiter, router and liveness monitor sharing a store
/// and a bus with its peers.
#[derive(Debug)]
pub struct Node {
	instance: InstanceId,
	registry: Arc<ConnectionRegistry>,
	router: Arc<MessageRouter>,
	limiter: Arc<RateLimiter>,
	liveness: Arc<LivenessMonitor>,
	pipeline: SessionPipeline,
	health: HealthState,
	cancel: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	next_session_id: AtomicU64,
	session_queue_capacity: usize,
}

impl Node {
	/// Subscribe to this instance's topics, publish the first heartbeat and start the
	/// background loops. Fails only when a bus subscription cannot be made.
	pub async fn start(
		settings: NodeSettings,
		store: Arc<dyn SharedStore>,
		bus: Arc<dyn MessageBus>,
		clock: Arc<dyn Clock>,
		health: HealthState,
	) -> Result<Arc<Self>, BusError> {
		let NodeSettings {
			instance,
			topics,
			registry_ttl,
			liveness,
			rate_limit,
			session_queue_capacity,
		} = settings;

		let registry = Arc::new(ConnectionRegistry::new(
			instance.clone(),
			Arc::clone(&store),
			Arc::new(DashMapDirectory::new()),
			Arc::clone(&clock),
			registry_ttl,
		));
		let router = Arc::new(MessageRouter::new(Arc::clone(&registry), Arc::clone(&bus), topics.clone()));
		let limiter = Arc::new(RateLimiter::new(Arc::clone(&store), Arc::clone(&clock), rate_limit));
		let liveness = Arc::new(LivenessMonitor::new(
			store,
			Arc::clone(&registry),
			Arc::clone(&clock),
			liveness,
			health.clone(),
		));
		let pipeline = SessionPipeline::new(Arc::clone(&router), Arc::clone(&limiter), clock);
		let cancel = CancellationToken::new();

		let mut tasks = Vec::new();
		for topic in [topics.instance(&instance), topics.broadcast.clone()] {
			let rx = bus.subscribe(&topic).await?;
			tasks.push(Arc::clone(&router).spawn_consumer(topic, rx, cancel.clone()));
		}

		if let Err(e) = liveness.heartbeat().await {
			warn!(instance = %instance, error = %e, "initial heartbeat failed; retrying on schedule");
			metrics::counter!("chatmesh_heartbeat_failures_total").increment(1);
		}
		tasks.extend(liveness.spawn(cancel.clone()));

		info!(instance = %instance, "node started");

		Ok(Arc::new(Self {
			instance,
			registry,
			router,
			limiter,
			liveness,
			pipeline,
			health,
			cancel,
			tasks: Mutex::new(tasks),
			next_session_id: AtomicU64::new(1),
			session_queue_capacity: session_queue_capacity.max(1),
		}))
	}

	pub fn instance(&self) -> &InstanceId {
		&self.instance
	}

	pub fn registry(&self) -> &Arc<ConnectionRegistry> {
		&self.registry
	}

	pub fn router(&self) -> &Arc<MessageRouter> {
		&self.router
	}

	pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
		&self.limiter
	}

	pub fn liveness(&self) -> &Arc<LivenessMonitor> {
		&self.liveness
	}

	pub fn health(&self) -> &HealthState {
		&self.health
	}

	pub fn local_session_count(&self) -> usize {
		self.registry.local_session_count()
	}

	/// Attach a transport session for `user`. The returned handle feeds the session's inbox
	/// and drains what the cluster delivers to it. Closing or dropping the handle detaches
	/// the user.
	pub async fn attach(&self, user: UserId) -> AttachedSession {
		let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
		let (session, outbound) = ChannelSession::new(session_id, user.clone(), self.session_queue_capacity);
		let session: Arc<dyn SessionHandle> = session;

		self.registry.register_local(user.clone(), Arc::clone(&session)).await;
		self.router.route(Message::join(user.clone())).await;

		let (inbound_tx, inbound_rx) = mpsc::channel(self.session_queue_capacity);
		let pipeline = self.pipeline.clone();
		let registry = Arc::clone(&self.registry);
		let cancel = self.cancel.clone();
		let task_user = user.clone();
		let task = tokio::spawn(async move {
			tokio::select! {
				_ = pipeline.run(session, inbound_rx) => {}
				_ = cancel.cancelled() => return,
			}
			if registry.unregister_if_current(&task_user, session_id).await {
				pipeline.router.route(Message::leave(task_user)).await;
			}
		});

		AttachedSession {
			user,
			session_id,
			inbound: inbound_tx,
			outbound,
			task,
		}
	}

	/// Stop background work, detach every local session and withdraw from the live set.
	pub async fn shutdown(&self) {
		info!(instance = %self.instance, "node shutting down");
		self.cancel.cancel();

		for session in self.registry.local_sessions() {
			let user = session.user().clone();
			if self.registry.unregister_if_current(&user, session.id()).await {
				self.router.route(Message::leave(user)).await;
			}
		}

		if let Err(e) = self.liveness.withdraw().await {
			warn!(instance = %self.instance, error = %e, "could not withdraw liveness record; it will expire");
		}

		let tasks = std::mem::take(&mut *self.tasks.lock().await);
		for task in tasks {
			if let Err(e) = task.await {
				warn!(error = %e, "background task ended abnormally");
			}
		}
		info!(instance = %self.instance, "node stopped");
	}
}

/// Transport-side handle for one attached session.
#[derive(Debug)]
pub struct AttachedSession {
	user: UserId,
	session_id: SessionId,
	inbound: mpsc::Sender<Inbound>,
	outbound: mpsc::Receiver<Outbound>,
	task: JoinHandle<()>,
}

impl AttachedSession {
	pub fn user(&self) -> &UserId {
		&self.user
	}

	pub fn session_id(&self) -> SessionId {
		self.session_id
	}

	/// Queue an inbound item. Items are processed strictly in the order they are queued.
	pub async fn send(&self, item: impl Into<Inbound>) -> Result<(), SessionError> {
		self.inbound.send(item.into()).await.map_err(|_| SessionError::Closed)
	}

	pub async fn recv(&mut self) -> Option<Outbound> {
		self.outbound.recv().await
	}

	pub fn try_recv(&mut self) -> Option<Outbound> {
		self.outbound.try_recv().ok()
	}

	/// Detach after every queued inbound item has been processed.
	pub async fn close(self) {
		let Self {
			user, inbound, task, ..
		} = self;
		drop(inbound);
		if let Err(e) = task.await {
			warn!(user = %user, error = %e, "session task ended abnormally");
		}
	}
}
