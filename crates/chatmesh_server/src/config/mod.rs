#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatmesh_domain::InstanceId;
use serde::Deserialize;
use tracing::{info, warn};

use crate::bus::Topics;
use crate::server::liveness::LivenessSettings;
use crate::server::node::NodeSettings;
use crate::server::rate_limit::RateLimitSettings;

/// Default config path: `~/.chatmesh/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatmesh").join("config.toml"))
}

/// Load the config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.sanitize();

	Ok(cfg)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
	/// Identity of this process within the cluster.
	pub instance_id: InstanceId,
	pub store: StoreSettings,
	pub bus: BusSettings,
	pub registry_entry_ttl: Duration,
	pub liveness: LivenessConfig,
	pub rate_limit: RateLimitConfig,
	pub server: ServerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
	Memory,
	Redis,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
	pub backend: StoreBackend,
	pub redis_url: String,
	/// Upper bound for one store or bus round trip.
	pub op_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusSettings {
	pub broadcast_topic: String,
	pub instance_topic_prefix: String,
	pub subscriber_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessConfig {
	pub heartbeat_interval: Duration,
	pub ttl: Duration,
	pub reap_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
	pub enabled: bool,
	pub capacity: u32,
	pub refill_per_minute: u32,
	pub idle_ttl: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	instance: FileInstanceSettings,
	#[serde(default)]
	store: FileStoreSettings,
	#[serde(default)]
	bus: FileBusSettings,
	#[serde(default)]
	registry: FileRegistrySettings,
	#[serde(default)]
	liveness: FileLivenessSettings,
	#[serde(default)]
	rate_limit: FileRateLimitSettings,
	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileInstanceSettings {
	id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	backend: Option<String>,
	redis_url: Option<String>,
	op_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBusSettings {
	broadcast_topic: Option<String>,
	instance_topic_prefix: Option<String>,
	subscriber_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRegistrySettings {
	entry_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLivenessSettings {
	heartbeat_interval_secs: Option<u64>,
	ttl_secs: Option<u64>,
	reap_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimitSettings {
	enabled: Option<bool>,
	capacity: Option<u32>,
	refill_per_minute: Option<u32>,
	idle_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn default_instance_id() -> InstanceId {
	std::env::var("HOSTNAME")
		.ok()
		.and_then(|h| InstanceId::new(h.trim()).ok())
		.unwrap_or_else(InstanceId::generate)
}

fn parse_backend(v: &str) -> Option<StoreBackend> {
	match v.trim().to_ascii_lowercase().as_str() {
		"memory" | "in-memory" | "inmemory" => Some(StoreBackend::Memory),
		"redis" => Some(StoreBackend::Redis),
		_ => None,
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let backend = match non_blank(file.store.backend) {
			Some(v) => parse_backend(&v).unwrap_or_else(|| {
				warn!(backend = %v, "store config: unknown backend; using memory");
				StoreBackend::Memory
			}),
			None => StoreBackend::Memory,
		};

		Self {
			instance_id: non_blank(file.instance.id)
				.and_then(|id| InstanceId::new(id).ok())
				.unwrap_or_else(default_instance_id),
			store: StoreSettings {
				backend,
				redis_url: non_blank(file.store.redis_url).unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
				op_timeout: Duration::from_millis(file.store.op_timeout_ms.unwrap_or(500)),
			},
			bus: BusSettings {
				broadcast_topic: non_blank(file.bus.broadcast_topic).unwrap_or_else(|| Topics::default().broadcast),
				instance_topic_prefix: non_blank(file.bus.instance_topic_prefix)
					.unwrap_or_else(|| Topics::default().instance_prefix),
				subscriber_queue_capacity: file.bus.subscriber_queue_capacity.unwrap_or(1024),
			},
			registry_entry_ttl: Duration::from_secs(file.registry.entry_ttl_secs.unwrap_or(90)),
			liveness: LivenessConfig {
				heartbeat_interval: Duration::from_secs(file.liveness.heartbeat_interval_secs.unwrap_or(30)),
				ttl: Duration::from_secs(file.liveness.ttl_secs.unwrap_or(60)),
				reap_interval: Duration::from_secs(file.liveness.reap_interval_secs.unwrap_or(60)),
			},
			rate_limit: RateLimitConfig {
				enabled: file.rate_limit.enabled.unwrap_or(true),
				capacity: file.rate_limit.capacity.unwrap_or(100),
				refill_per_minute: file.rate_limit.refill_per_minute.unwrap_or(200),
				idle_ttl: Duration::from_secs(file.rate_limit.idle_ttl_secs.unwrap_or(300)),
			},
			server: ServerSettings {
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
			},
		}
	}

	/// Repair timing combinations that would let live state expire between refreshes.
	fn sanitize(&mut self) {
		let min = Duration::from_secs(1);

		if self.liveness.heartbeat_interval < min {
			warn!("liveness config: heartbeat_interval below 1s; using 1s");
			self.liveness.heartbeat_interval = min;
		}
		let heartbeat = self.liveness.heartbeat_interval;

		if self.liveness.ttl <= heartbeat {
			warn!(
				ttl_secs = self.liveness.ttl.as_secs(),
				heartbeat_secs = heartbeat.as_secs(),
				"liveness config: ttl must exceed heartbeat_interval; using twice the interval"
			);
			self.liveness.ttl = heartbeat * 2;
		}

		if self.liveness.reap_interval < heartbeat {
			warn!(
				reap_secs = self.liveness.reap_interval.as_secs(),
				heartbeat_secs = heartbeat.as_secs(),
				"liveness config: reap_interval shorter than heartbeat_interval; using heartbeat_interval"
			);
			self.liveness.reap_interval = heartbeat;
		}

		if self.registry_entry_ttl <= heartbeat {
			warn!(
				entry_ttl_secs = self.registry_entry_ttl.as_secs(),
				heartbeat_secs = heartbeat.as_secs(),
				"registry config: entry_ttl must exceed heartbeat_interval; using three intervals"
			);
			self.registry_entry_ttl = heartbeat * 3;
		}

		if self.store.op_timeout.is_zero() {
			warn!("store config: op_timeout_ms is 0; using 500ms");
			self.store.op_timeout = Duration::from_millis(500);
		}

		if self.rate_limit.enabled && (self.rate_limit.capacity == 0 || self.rate_limit.refill_per_minute == 0) {
			warn!("rate limit config: zero capacity or refill; rate limiting disabled");
			self.rate_limit.enabled = false;
		}
	}

	pub fn topics(&self) -> Topics {
		Topics {
			broadcast: self.bus.broadcast_topic.clone(),
			instance_prefix: self.bus.instance_topic_prefix.clone(),
		}
	}

	pub fn node_settings(&self) -> NodeSettings {
		NodeSettings {
			topics: self.topics(),
			registry_ttl: self.registry_entry_ttl,
			liveness: LivenessSettings {
				heartbeat_interval: self.liveness.heartbeat_interval,
				ttl: self.liveness.ttl,
				reap_interval: self.liveness.reap_interval,
			},
			rate_limit: RateLimitSettings {
				enabled: self.rate_limit.enabled,
				idle_ttl: self.rate_limit.idle_ttl,
				..RateLimitSettings::per_minute(self.rate_limit.capacity, self.rate_limit.refill_per_minute)
			},
			..NodeSettings::new(self.instance_id.clone())
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	non_blank(std::env::var(name).ok())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
	env_string(name).and_then(|v| v.parse::<T>().ok())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("CHATMESH_INSTANCE_ID")
		&& let Ok(id) = InstanceId::new(v)
	{
		info!(instance = %id, "instance config: id overridden by env");
		cfg.instance_id = id;
	}

	if let Some(v) = env_string("CHATMESH_STORE_BACKEND") {
		match parse_backend(&v) {
			Some(backend) => {
				cfg.store.backend = backend;
				info!(?backend, "store config: backend overridden by env");
			}
			None => warn!(backend = %v, "store config: ignoring unknown backend from env"),
		}
	}

	if let Some(v) = env_string("CHATMESH_REDIS_URL") {
		cfg.store.redis_url = v;
		info!("store config: redis_url overridden by env");
	}

	if let Some(ms) = env_parse::<u64>("CHATMESH_STORE_OP_TIMEOUT_MS") {
		cfg.store.op_timeout = Duration::from_millis(ms);
		info!(ms, "store config: op_timeout overridden by env");
	}

	if let Some(v) = env_string("CHATMESH_BROADCAST_TOPIC") {
		cfg.bus.broadcast_topic = v;
		info!("bus config: broadcast_topic overridden by env");
	}

	if let Some(v) = env_string("CHATMESH_INSTANCE_TOPIC_PREFIX") {
		cfg.bus.instance_topic_prefix = v;
		info!("bus config: instance_topic_prefix overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("CHATMESH_REGISTRY_ENTRY_TTL_SECS") {
		cfg.registry_entry_ttl = Duration::from_secs(secs);
		info!(secs, "registry config: entry_ttl overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("CHATMESH_HEARTBEAT_INTERVAL_SECS") {
		cfg.liveness.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "liveness config: heartbeat_interval overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("CHATMESH_LIVENESS_TTL_SECS") {
		cfg.liveness.ttl = Duration::from_secs(secs);
		info!(secs, "liveness config: ttl overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("CHATMESH_REAP_INTERVAL_SECS") {
		cfg.liveness.reap_interval = Duration::from_secs(secs);
		info!(secs, "liveness config: reap_interval overridden by env");
	}

	if let Some(v) = env_string("CHATMESH_RATE_LIMIT_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.rate_limit.enabled = enabled;
		info!(enabled, "rate limit config: enabled overridden by env");
	}

	if let Some(capacity) = env_parse::<u32>("CHATMESH_RATE_LIMIT_CAPACITY") {
		cfg.rate_limit.capacity = capacity;
		info!(capacity, "rate limit config: capacity overridden by env");
	}

	if let Some(rate) = env_parse::<u32>("CHATMESH_RATE_LIMIT_REFILL_PER_MINUTE") {
		cfg.rate_limit.refill_per_minute = rate;
		info!(rate, "rate limit config: refill_per_minute overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("CHATMESH_RATE_LIMIT_IDLE_TTL_SECS") {
		cfg.rate_limit.idle_ttl = Duration::from_secs(secs);
		info!(secs, "rate limit config: idle_ttl overridden by env");
	}

	if let Some(v) = env_string("CHATMESH_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("CHATMESH_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}
}
