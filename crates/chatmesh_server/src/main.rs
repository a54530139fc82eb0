#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chatmesh_server::Node;
use chatmesh_server::bus::{InMemoryBus, MessageBus, RedisBus};
use chatmesh_server::config::{ServerConfig, StoreBackend};
use chatmesh_server::server::health::{HealthState, spawn_health_server};
use chatmesh_server::store::{InMemoryStore, RedisStore, SharedStore};
use chatmesh_server::util::time::system_clock;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatmesh_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.chatmesh/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatmesh_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("chatmesh_server");
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn connect_backends(cfg: &ServerConfig) -> anyhow::Result<(Arc<dyn SharedStore>, Arc<dyn MessageBus>)> {
	match cfg.store.backend {
		StoreBackend::Memory => {
			info!("using in-memory store and bus (single process)");
			Ok((
				Arc::new(InMemoryStore::new().with_op_timeout(cfg.store.op_timeout)),
				Arc::new(InMemoryBus::new(cfg.bus.subscriber_queue_capacity)),
			))
		}
		StoreBackend::Redis => {
			let store = RedisStore::connect(&cfg.store.redis_url, cfg.store.op_timeout)
				.await
				.context("connect redis store")?;
			let bus = RedisBus::connect(
				&cfg.store.redis_url,
				cfg.store.op_timeout,
				cfg.bus.subscriber_queue_capacity,
			)
			.await
			.context("connect redis bus")?;
			Ok((Arc::new(store), Arc::new(bus)))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => chatmesh_server::config::default_config_path()?,
	};
	let cfg = chatmesh_server::config::load_server_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		instance = %cfg.instance_id,
		backend = ?cfg.store.backend,
		"loaded server config (toml + env overrides)"
	);

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let (store, bus) = connect_backends(&cfg).await?;
	let node = Node::start(cfg.node_settings(), store, bus, system_clock(), health)
		.await
		.context("start node")?;

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");
	node.shutdown().await;

	Ok(())
}
