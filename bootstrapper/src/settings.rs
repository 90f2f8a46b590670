use chainkube_engine::settings::{
	config_root_from_env, insert_command_line_option, validate_websocket_endpoint,
	ChainSettings, CkSettings, ContractSettings,
};
use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, Map, Source, Value};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

#[derive(Clone, Debug, Deserialize)]
pub struct AgentSettings {
	/// Path of the orchestrator agent binary to supervise.
	pub binary_path: PathBuf,
	/// Data directory handed to the agent; owned exclusively by it.
	pub data_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapperSettings {
	/// The node identifier this host registers under.
	pub node_id: String,
	pub chain: ChainSettings,
	pub contract: ContractSettings,
	pub agent: AgentSettings,
	/// Base URL of the master's HTTP surface.
	pub master_endpoint: String,
	/// Stake submitted at registration, in smallest units.
	pub stake_amount: u64,
	pub heartbeat_interval_seconds: u64,
	/// Withdraw the stake on clean shutdown.
	pub withdraw_on_shutdown: bool,
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct BootstrapperOptions {
	#[clap(long = "node_id")]
	pub node_id: Option<String>,
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
	#[clap(long = "agent.binary_path")]
	pub agent_binary_path: Option<String>,
	#[clap(long = "agent.data_dir")]
	pub agent_data_dir: Option<String>,
	#[clap(long = "master_endpoint")]
	pub master_endpoint: Option<String>,
	#[clap(long = "stake_amount")]
	pub stake_amount: Option<u64>,
	#[clap(long = "heartbeat_interval_seconds")]
	pub heartbeat_interval_seconds: Option<u64>,
}

impl Source for BootstrapperOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "node_id", &self.node_id);
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
		insert_command_line_option(&mut map, "agent.binary_path", &self.agent_binary_path);
		insert_command_line_option(&mut map, "agent.data_dir", &self.agent_data_dir);
		insert_command_line_option(&mut map, "master_endpoint", &self.master_endpoint);
		insert_command_line_option(&mut map, "stake_amount", &self.stake_amount);
		insert_command_line_option(
			&mut map,
			"heartbeat_interval_seconds",
			&self.heartbeat_interval_seconds,
		);

		Ok(map)
	}
}

impl CkSettings for BootstrapperSettings {
	type CommandLineOptions = BootstrapperOptions;

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
		config_root: &str,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		config_builder
			.set_default("chain.ws_endpoint", "ws://localhost:9944")?
			.set_default("chain.signing_key_file", format!("{config_root}/keys/stake_key"))?
			.set_default("agent.binary_path", "/usr/local/bin/kubelet-agent")?
			.set_default("agent.data_dir", format!("{config_root}/agent"))?
			.set_default("master_endpoint", "http://localhost:8950")?
			.set_default("stake_amount", 1_000_000_000u64)?
			.set_default("heartbeat_interval_seconds", 30)?
			.set_default("withdraw_on_shutdown", false)
	}

	fn validate_settings(&mut self) -> Result<(), ConfigError> {
		validate_websocket_endpoint(&self.chain.ws_endpoint)?;
		if self.node_id.is_empty() {
			return Err(ConfigError::Message("node_id must be set".to_string()))
		}
		if self.heartbeat_interval_seconds == 0 {
			return Err(ConfigError::Message(
				"heartbeat_interval_seconds must be at least 1".to_string(),
			))
		}
		Ok(())
	}
}

impl BootstrapperSettings {
	pub fn new(opts: BootstrapperOptions) -> Result<Self, ConfigError> {
		Self::load_settings_from_all_sources(config_root_from_env(), opts)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn required_defaults(
		builder: ConfigBuilder<config::builder::DefaultState>,
	) -> ConfigBuilder<config::builder::DefaultState> {
		builder
			.set_default("node_id", "w1")
			.unwrap()
			.set_default("contract.package", "0xc0d")
			.unwrap()
			.set_default("contract.worker_registry_id", "registry-0")
			.unwrap()
			.set_default("contract.scheduler_id", "scheduler-0")
			.unwrap()
	}

	#[test]
	fn defaults_deserialize() {
		let settings: BootstrapperSettings = required_defaults(
			BootstrapperSettings::set_defaults(Config::builder(), "/etc/chainkube").unwrap(),
		)
		.build()
		.unwrap()
		.try_deserialize()
		.unwrap();

		assert_eq!(settings.stake_amount, 1_000_000_000);
		assert_eq!(settings.heartbeat_interval_seconds, 30);
		assert!(!settings.withdraw_on_shutdown);
	}

	#[test]
	fn command_line_overrides_defaults() {
		let opts = BootstrapperOptions {
			node_id: Some("w7".to_string()),
			stake_amount: Some(2_000_000_000),
			..Default::default()
		};
		let settings: BootstrapperSettings = required_defaults(
			BootstrapperSettings::set_defaults(Config::builder(), "/etc/chainkube").unwrap(),
		)
		.add_source(opts)
		.build()
		.unwrap()
		.try_deserialize()
		.unwrap();

		assert_eq!(settings.node_id, "w7");
		assert_eq!(settings.stake_amount, 2_000_000_000);
	}
}
