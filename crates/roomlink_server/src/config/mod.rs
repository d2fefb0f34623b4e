#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::broker::{LocalBrokerConfig, StartFrom};
use crate::util::SecretString;

/// Default config path: `~/.roomlink/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomlink").join("config.toml"))
}

/// Load the server config from TOML at `path`, then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub broker: BrokerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Bind address (host:port); the `--bind` flag wins over this.
	pub bind: Option<String>,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Without it every session is anonymous.
	pub auth_hmac_secret: Option<SecretString>,
	/// Capacity of each session's outbound frame queue.
	pub outbox_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: None,
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			outbox_capacity: 512,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:` URL; absent means the in-memory store.
	pub database_url: Option<String>,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			max_connections: 5,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct BrokerSettings {
	pub local: LocalBrokerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	broker: FileBrokerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	outbox_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBrokerSettings {
	partitions: Option<u32>,
	retention_per_partition: Option<usize>,
	consumer_queue_capacity: Option<usize>,
	start_from: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let persistence_defaults = PersistenceSettings::default();
		let broker_defaults = LocalBrokerConfig::default();

		let start_from = match file.broker.start_from.as_deref() {
			None => broker_defaults.start_from,
			Some(v) => parse_start_from(v).unwrap_or_else(|| {
				warn!(value = %v, "broker config: unknown start_from (expected earliest|latest); using earliest");
				StartFrom::Earliest
			}),
		};

		Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				outbox_capacity: file
					.server
					.outbox_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.outbox_capacity),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(persistence_defaults.max_connections),
			},
			broker: BrokerSettings {
				local: LocalBrokerConfig {
					partitions: file.broker.partitions.unwrap_or(broker_defaults.partitions),
					retention_per_partition: file
						.broker
						.retention_per_partition
						.unwrap_or(broker_defaults.retention_per_partition),
					consumer_queue_capacity: file
						.broker
						.consumer_queue_capacity
						.unwrap_or(broker_defaults.consumer_queue_capacity),
					start_from,
				},
			},
		}
	}
}

fn parse_start_from(v: &str) -> Option<StartFrom> {
	match v.trim().to_ascii_lowercase().as_str() {
		"earliest" => Some(StartFrom::Earliest),
		"latest" => Some(StartFrom::Latest),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("ROOMLINK_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_OUTBOX_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbox_capacity = capacity;
		info!(capacity, "server config: outbox_capacity overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_DATABASE_MAX_CONNECTIONS")
		&& let Ok(max) = v.parse::<u32>()
		&& max > 0
	{
		cfg.persistence.max_connections = max;
		info!(max, "persistence: max_connections overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_BROKER_PARTITIONS")
		&& let Ok(partitions) = v.parse::<u32>()
	{
		cfg.broker.local.partitions = partitions;
		info!(partitions, "broker config: partitions overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_BROKER_RETENTION")
		&& let Ok(retention) = v.parse::<usize>()
	{
		cfg.broker.local.retention_per_partition = retention;
		info!(retention, "broker config: retention_per_partition overridden by env");
	}

	if let Some(v) = env_string("ROOMLINK_BROKER_START_FROM") {
		match parse_start_from(&v) {
			Some(start_from) => {
				cfg.broker.local.start_from = start_from;
				info!(?start_from, "broker config: start_from overridden by env");
			}
			None => warn!(value = %v, "broker config: ignoring invalid ROOMLINK_BROKER_START_FROM"),
		}
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_hmac_secret configured; every session will be anonymous");
	}

	if cfg.broker.local.partitions == 0 {
		warn!("broker config: partitions = 0; using 1");
		cfg.broker.local.partitions = 1;
	}
}
