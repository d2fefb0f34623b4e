#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::config::QuicServerConfig;
use crate::server::broker::{Broker, LocalBroker};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::directory::{DirectoryStore, MemoryStore, RoomDirectory, SqliteStore};
use crate::server::router::EventRouter;

const DEFAULT_BIND: &str = "127.0.0.1:18300";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomlink_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind address (default: {DEFAULT_BIND}; quic:// prefix accepted)\n\
\t--config   Config file (default: ~/.roomlink/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn parse_bind(bind: &str) -> anyhow::Result<SocketAddr> {
	let bind = bind.trim();
	let addr = bind.strip_prefix("quic://").unwrap_or(bind);
	addr.parse::<SocketAddr>()
		.map_err(|e| anyhow::anyhow!("invalid bind address {bind:?} (expected host:port with an IP literal): {e}"))
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomlink_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("roomlink_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
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

	match bind.parse::<SocketAddr>() {
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

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn DirectoryStore>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqliteStore::connect(url, cfg.persistence.max_connections).await?;
			info!("directory store: sqlite");
			Ok(Arc::new(store))
		}
		None => {
			warn!("directory store: in-memory (no database_url configured; state is lost on exit)");
			Ok(Arc::new(MemoryStore::new()))
		}
	}
}

fn bind_quic(cfg: &ServerConfig, bind_addr: SocketAddr) -> anyhow::Result<quinn::Endpoint> {
	let quic = QuicServerConfig::dev(bind_addr);
	let tls_files = cfg
		.server
		.tls_cert_path
		.as_deref()
		.zip(cfg.server.tls_key_path.as_deref());

	match tls_files {
		Some((cert, key)) => {
			info!(cert = %cert.display(), key = %key.display(), "quic: using configured certificate");
			quic.bind_endpoint_with_tls(cert, key)
		}
		None => {
			let (endpoint, cert_der) = quic.bind_dev_endpoint()?;
			warn!(cert_der_len = cert_der.len(), "quic: no certificate configured; using a self-signed dev cert");
			Ok(endpoint)
		}
	}
}

/// Accept connections until ctrl-c or the endpoint closes.
async fn serve(endpoint: &quinn::Endpoint, router: Arc<EventRouter>, settings: ConnectionSettings) {
	let mut conn_seq: u64 = 0;

	loop {
		let incoming = tokio::select! {
			incoming = endpoint.accept() => match incoming {
				Some(incoming) => incoming,
				None => return,
			},
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown requested");
				return;
			}
		};

		conn_seq += 1;
		let conn_id = conn_seq;
		metrics::counter!("roomlink_server_connections_total").increment(1);

		let router = Arc::clone(&router);
		let settings = settings.clone();
		tokio::spawn(async move {
			let connection = match incoming.await {
				Ok(connection) => connection,
				Err(e) => {
					warn!(conn_id, error = %e, "quic handshake failed");
					return;
				}
			};
			info!(conn_id, remote = %connection.remote_address(), "accepted connection");
			if let Err(e) = handle_connection(conn_id, connection, router, settings).await {
				warn!(conn_id, error = %e, "connection ended with error");
			}
		});
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "config loaded");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind_addr = parse_bind(args.bind.as_deref().or(cfg.server.bind.as_deref()).unwrap_or(DEFAULT_BIND))?;

	let store = open_store(&cfg).await?;
	let local_broker = LocalBroker::new(cfg.broker.local.clone());
	let broker: Arc<dyn Broker> = Arc::new(local_broker.clone());

	let directory = Arc::new(RoomDirectory::new(store));
	let router = Arc::new(EventRouter::new(Arc::clone(&directory), broker));

	if let Some(announcement) = directory.init_main_room().await? {
		router.publish_event(&announcement).await;
	}

	let endpoint = bind_quic(&cfg, bind_addr)?;
	info!(bind = %bind_addr, "roomlink_server listening");

	let settings = ConnectionSettings {
		auth_hmac_secret: cfg.server.auth_hmac_secret.clone(),
		outbox_capacity: cfg.server.outbox_capacity,
		..ConnectionSettings::default()
	};
	serve(&endpoint, router, settings).await;

	endpoint.close(0u32.into(), b"server shutting down");
	local_broker.shutdown().await;
	endpoint.wait_idle().await;

	Ok(())
}
