use crate::constants::{CONFIG_ROOT, DEFAULT_CONFIG_ROOT};
use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;
use std::{collections::HashMap, env, path::PathBuf};

#[derive(Clone, Debug, Deserialize)]
pub struct ChainSettings {
	/// WebSocket JSON-RPC endpoint of the blockchain node.
	pub ws_endpoint: String,
	/// File holding the master's hex-encoded admin signing key.
	pub signing_key_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContractSettings {
	/// On-chain address of the deployed contract package.
	pub package: String,
	/// Object id of the worker registry instance.
	pub worker_registry_id: String,
	/// Object id of the request scheduler instance.
	pub scheduler_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MasterSettings {
	/// File holding the HMAC key used to mint join tokens.
	pub hmac_secret_file: PathBuf,
	/// Bind address of the master HTTP surface.
	pub http_bind: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OrchestratorSettings {
	/// Base URL of the Kubernetes API server.
	pub endpoint: String,
	/// File holding the admin bearer credential.
	pub admin_credential_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Prometheus {
	pub hostname: String,
	pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
	pub chain: ChainSettings,
	pub contract: ContractSettings,
	pub master: MasterSettings,
	pub orchestrator: OrchestratorSettings,

	/// Directory for the engine's rocksdb state.
	pub db_path: PathBuf,

	/// Maximum in-flight API request executions.
	pub event_parallelism: u32,

	/// Deployment override of the viewer-tier stake threshold.
	pub min_stake_amount: Option<u64>,

	/// Cadence expected of worker heartbeats.
	pub heartbeat_interval_seconds: u64,

	pub health_check: Option<HealthCheck>,
	pub prometheus: Option<Prometheus>,
}

/// Settings loading shared by the engine and the bootstrapper binaries:
/// defaults < config file < environment < command line.
pub trait CkSettings: Sized + for<'de> Deserialize<'de> {
	type CommandLineOptions: Source + Send + Sync + 'static;

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
		config_root: &str,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>;

	fn validate_settings(&mut self) -> Result<(), ConfigError>;

	fn load_settings_from_all_sources(
		config_root: String,
		opts: Self::CommandLineOptions,
	) -> Result<Self, ConfigError> {
		let mut settings: Self = Self::set_defaults(Config::builder(), &config_root)?
			.add_source(
				File::with_name(&format!("{config_root}/config/Settings.toml")).required(false),
			)
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;
		settings.validate_settings()?;
		Ok(settings)
	}
}

/// The configuration root: flag-less, environment only, because it decides
/// where the settings file itself lives.
pub fn config_root_from_env() -> String {
	env::var(CONFIG_ROOT).unwrap_or_else(|_| DEFAULT_CONFIG_ROOT.to_string())
}

pub fn insert_command_line_option<T: ToString>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), Value::from(value.to_string()));
	}
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct CommandLineOptions {
	#[clap(long = "chain.rpc.ws_endpoint")]
	pub chain_ws_endpoint: Option<String>,
	#[clap(long = "chain.signing_key_file")]
	pub chain_signing_key_file: Option<String>,
	#[clap(long = "contract.package")]
	pub contract_package: Option<String>,
	#[clap(long = "contract.worker_registry_id")]
	pub worker_registry_id: Option<String>,
	#[clap(long = "contract.scheduler_id")]
	pub scheduler_id: Option<String>,
	#[clap(long = "master.hmac_secret_file")]
	pub hmac_secret_file: Option<String>,
	#[clap(long = "master.http_bind")]
	pub http_bind: Option<String>,
	#[clap(long = "orchestrator.endpoint")]
	pub orchestrator_endpoint: Option<String>,
	#[clap(long = "orchestrator.admin_credential_file")]
	pub orchestrator_admin_credential_file: Option<String>,
	#[clap(long = "db_path")]
	pub db_path: Option<String>,
	#[clap(long = "event_parallelism")]
	pub event_parallelism: Option<u32>,
	#[clap(long = "min_stake_amount")]
	pub min_stake_amount: Option<u64>,
	#[clap(long = "heartbeat_interval_seconds")]
	pub heartbeat_interval_seconds: Option<u64>,
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "chain.ws_endpoint", &self.chain_ws_endpoint);
		insert_command_line_option(
			&mut map,
			"chain.signing_key_file",
			&self.chain_signing_key_file,
		);
		insert_command_line_option(&mut map, "contract.package", &self.contract_package);
		insert_command_line_option(
			&mut map,
			"contract.worker_registry_id",
			&self.worker_registry_id,
		);
		insert_command_line_option(&mut map, "contract.scheduler_id", &self.scheduler_id);
		insert_command_line_option(&mut map, "master.hmac_secret_file", &self.hmac_secret_file);
		insert_command_line_option(&mut map, "master.http_bind", &self.http_bind);
		insert_command_line_option(
			&mut map,
			"orchestrator.endpoint",
			&self.orchestrator_endpoint,
		);
		insert_command_line_option(
			&mut map,
			"orchestrator.admin_credential_file",
			&self.orchestrator_admin_credential_file,
		);
		insert_command_line_option(&mut map, "db_path", &self.db_path);
		insert_command_line_option(&mut map, "event_parallelism", &self.event_parallelism);
		insert_command_line_option(&mut map, "min_stake_amount", &self.min_stake_amount);
		insert_command_line_option(
			&mut map,
			"heartbeat_interval_seconds",
			&self.heartbeat_interval_seconds,
		);

		Ok(map)
	}
}

impl CkSettings for Settings {
	type CommandLineOptions = CommandLineOptions;

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
		config_root: &str,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		config_builder
			.set_default("chain.ws_endpoint", "ws://localhost:9944")?
			.set_default("chain.signing_key_file", format!("{config_root}/keys/admin_key"))?
			.set_default("master.hmac_secret_file", format!("{config_root}/keys/hmac_secret"))?
			.set_default("master.http_bind", "127.0.0.1:8950")?
			.set_default("orchestrator.endpoint", "https://localhost:6443")?
			.set_default(
				"orchestrator.admin_credential_file",
				format!("{config_root}/keys/orchestrator_token"),
			)?
			.set_default("db_path", format!("{config_root}/data.db"))?
			.set_default("event_parallelism", 32)?
			.set_default("heartbeat_interval_seconds", 30)
	}

	fn validate_settings(&mut self) -> Result<(), ConfigError> {
		validate_websocket_endpoint(&self.chain.ws_endpoint)?;
		validate_http_endpoint(&self.orchestrator.endpoint)?;
		if self.event_parallelism == 0 {
			return Err(ConfigError::Message("event_parallelism must be at least 1".to_string()))
		}
		if self.heartbeat_interval_seconds == 0 {
			return Err(ConfigError::Message(
				"heartbeat_interval_seconds must be at least 1".to_string(),
			))
		}
		Ok(())
	}
}

impl Settings {
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		Self::load_settings_from_all_sources(config_root_from_env(), opts)
	}
}

pub fn validate_websocket_endpoint(endpoint: &str) -> Result<(), ConfigError> {
	validate_endpoint(endpoint, &["ws", "wss"])
}

pub fn validate_http_endpoint(endpoint: &str) -> Result<(), ConfigError> {
	validate_endpoint(endpoint, &["http", "https"])
}

fn validate_endpoint(endpoint: &str, schemes: &[&str]) -> Result<(), ConfigError> {
	let url = url::Url::parse(endpoint)
		.map_err(|e| ConfigError::Message(format!("invalid endpoint {endpoint}: {e}")))?;
	if !schemes.contains(&url.scheme()) {
		return Err(ConfigError::Message(format!(
			"invalid scheme {} in {endpoint}, expected one of {schemes:?}",
			url.scheme()
		)))
	}
	if url.host_str().is_none() {
		return Err(ConfigError::Message(format!("endpoint {endpoint} has no host")))
	}
	Ok(())
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	/// A full settings value without touching the filesystem or env.
	pub fn new_test_settings() -> Settings {
		Settings {
			chain: ChainSettings {
				ws_endpoint: "ws://localhost:9944".to_string(),
				signing_key_file: PathBuf::from("/tmp/ck-test/admin_key"),
			},
			contract: ContractSettings {
				package: "0x0000000000000000000000000000000000000000000000000000000000000c0d".to_string(),
				worker_registry_id: "registry-0".to_string(),
				scheduler_id: "scheduler-0".to_string(),
			},
			master: MasterSettings {
				hmac_secret_file: PathBuf::from("/tmp/ck-test/hmac_secret"),
				http_bind: "127.0.0.1:0".to_string(),
			},
			orchestrator: OrchestratorSettings {
				endpoint: "http://localhost:6443".to_string(),
				admin_credential_file: PathBuf::from("/tmp/ck-test/orchestrator_token"),
			},
			db_path: PathBuf::from("/tmp/ck-test/data.db"),
			event_parallelism: 32,
			min_stake_amount: None,
			heartbeat_interval_seconds: 30,
			health_check: None,
			prometheus: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_deserialize() {
		let settings: Settings = Settings::set_defaults(Config::builder(), "/etc/chainkube")
			.unwrap()
			.set_default("contract.package", "0xc0d")
			.unwrap()
			.set_default("contract.worker_registry_id", "registry-0")
			.unwrap()
			.set_default("contract.scheduler_id", "scheduler-0")
			.unwrap()
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		assert_eq!(settings.chain.ws_endpoint, "ws://localhost:9944");
		assert_eq!(settings.event_parallelism, 32);
		assert_eq!(settings.heartbeat_interval_seconds, 30);
		assert!(settings.min_stake_amount.is_none());
	}

	#[test]
	fn command_line_overrides_defaults() {
		let opts = CommandLineOptions {
			chain_ws_endpoint: Some("ws://10.0.0.1:9944".to_string()),
			event_parallelism: Some(4),
			..Default::default()
		};

		let settings: Settings = Settings::set_defaults(Config::builder(), "/etc/chainkube")
			.unwrap()
			.set_default("contract.package", "0xc0d")
			.unwrap()
			.set_default("contract.worker_registry_id", "registry-0")
			.unwrap()
			.set_default("contract.scheduler_id", "scheduler-0")
			.unwrap()
			.add_source(opts)
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		assert_eq!(settings.chain.ws_endpoint, "ws://10.0.0.1:9944");
		assert_eq!(settings.event_parallelism, 4);
	}

	#[test]
	fn endpoint_validation_rejects_wrong_scheme() {
		assert!(validate_websocket_endpoint("ws://localhost:9944").is_ok());
		assert!(validate_websocket_endpoint("wss://rpc.example.com").is_ok());
		assert!(validate_websocket_endpoint("http://localhost:9944").is_err());
		assert!(validate_http_endpoint("https://localhost:6443").is_ok());
		assert!(validate_http_endpoint("ftp://localhost").is_err());
	}
}
