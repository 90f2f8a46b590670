//! The staker-host state machine: register stake, wait for the join
//! credential, activate, then keep the agent alive and the master informed
//! until slashing or shutdown.

use crate::{
	agent::{AgentCommand, AgentSupervisor},
	settings::BootstrapperSettings,
};
use anyhow::{bail, Context, Result};
use chainkube_engine::{
	chain_client::{ChainApi, ChainClientError},
	http::{HeartbeatPayload, ResourceUsage},
};
use ck_contract::{error::AbortCode, ContractCall};
use ck_primitives::{unix_time_now, AccountId, NodeId, WorkerStatus};
use std::{cmp::min, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use utilities::task_scope::Scope;

const JOIN_TOKEN_POLL_INITIAL: Duration = Duration::from_secs(2);
const JOIN_TOKEN_POLL_CAP: Duration = Duration::from_secs(30);
const JOIN_TOKEN_TIMEOUT: Duration = Duration::from_secs(600);

/// Heartbeat failures before the agent is restarted, and before the whole
/// process gives up.
const HEARTBEAT_RESTART_THRESHOLD: u32 = 3;
const HEARTBEAT_SHUTDOWN_THRESHOLD: u32 = 7;

pub struct Bootstrapper {
	settings: BootstrapperSettings,
	chain: Arc<dyn ChainApi>,
	node_id: NodeId,
	stake_account: AccountId,
	http: reqwest::Client,
}

impl Bootstrapper {
	pub fn new(
		settings: BootstrapperSettings,
		chain: Arc<dyn ChainApi>,
		stake_account: AccountId,
	) -> Self {
		let node_id = NodeId(settings.node_id.clone());
		Self { settings, chain, node_id, stake_account, http: reqwest::Client::new() }
	}

	pub async fn run(self, scope: &Scope<'_, anyhow::Error>) -> Result<()> {
		self.ensure_registered().await?;
		let token = self.await_join_token().await?;
		self.ensure_active().await?;

		let token = String::from_utf8(token).context("join token is not utf-8")?;

		let (supervisor, commands) = AgentSupervisor::new(
			self.settings.agent.binary_path.clone(),
			self.settings.agent.data_dir.clone(),
			self.node_id.clone(),
			self.settings.master_endpoint.clone(),
			token.clone(),
		);
		scope.spawn(supervisor.run());

		self.heartbeat_loop(commands, token).await
	}

	/// The auth nonce is derived from the stake key, so re-registration
	/// attempts from the same host are recognisable on-chain.
	fn auth_nonce(&self) -> String {
		use sha2::{Digest, Sha256};
		let mut hasher = Sha256::new();
		hasher.update(self.stake_account.0);
		hasher.update(self.node_id.as_str().as_bytes());
		hasher.update(b"auth-nonce");
		hex::encode(&hasher.finalize()[..16])
	}

	async fn ensure_registered(&self) -> Result<()> {
		match self.chain.get_worker_info(&self.node_id).await? {
			Some(record) => match record.status {
				WorkerStatus::Pending | WorkerStatus::Active => {
					info!(node_id = %self.node_id, status = %record.status, "already registered");
					Ok(())
				},
				WorkerStatus::Slashed => bail!("worker record is slashed; stake is forfeit"),
				WorkerStatus::Withdrawn =>
					bail!("node id is tombstoned; pick a fresh node id and re-stake"),
			},
			None => {
				info!(node_id = %self.node_id, amount = self.settings.stake_amount, "staking and registering");
				match self
					.chain
					.submit_transaction(ContractCall::StakeAndRegisterWorker {
						node_id: self.node_id.clone(),
						payment: self.settings.stake_amount,
						auth_nonce: self.auth_nonce(),
					})
					.await
				{
					Ok(receipt) => {
						info!(digest = %receipt.digest, "stake submitted");
						Ok(())
					},
					// A concurrent earlier run of this host won the race.
					Err(ChainClientError::ContractAbort(AbortCode::NodeIdTaken)) => Ok(()),
					Err(error) => Err(error).context("stake registration failed"),
				}
			},
		}
	}

	/// Poll for the join credential with bounded backoff. The master not
	/// issuing one within the timeout is fatal: either the stake did not
	/// clear admission or the master is gone.
	async fn await_join_token(&self) -> Result<Vec<u8>> {
		let deadline = tokio::time::Instant::now() + JOIN_TOKEN_TIMEOUT;
		let mut delay = JOIN_TOKEN_POLL_INITIAL;
		loop {
			match self.chain.get_worker_join_token(&self.node_id).await {
				Ok(Some(token)) if !token.is_empty() => {
					info!(node_id = %self.node_id, "join token available");
					return Ok(token)
				},
				Ok(_) => {},
				Err(error) => warn!(%error, "could not query join token"),
			}

			if tokio::time::Instant::now() + delay > deadline {
				bail!("no join token within {JOIN_TOKEN_TIMEOUT:?}; shutting down")
			}
			tokio::time::sleep(delay).await;
			delay = min(delay * 2, JOIN_TOKEN_POLL_CAP);
		}
	}

	async fn ensure_active(&self) -> Result<()> {
		let record = self
			.chain
			.get_worker_info(&self.node_id)
			.await?
			.context("worker record disappeared")?;
		match record.status {
			WorkerStatus::Active => Ok(()),
			WorkerStatus::Pending => {
				match self
					.chain
					.submit_transaction(ContractCall::ActivateWorker {
						node_id: self.node_id.clone(),
					})
					.await
				{
					Ok(_) => {
						info!(node_id = %self.node_id, "worker activated");
						Ok(())
					},
					// Lost a race with another activation attempt.
					Err(ChainClientError::ContractAbort(AbortCode::InvalidStatus)) => Ok(()),
					Err(error) => Err(error).context("activation failed"),
				}
			},
			status => bail!("cannot activate from status {status}"),
		}
	}

	async fn heartbeat_loop(
		&self,
		commands: mpsc::Sender<AgentCommand>,
		token: String,
	) -> Result<()> {
		let mut consecutive_failures = 0u32;
		let mut interval = tokio::time::interval(Duration::from_secs(
			self.settings.heartbeat_interval_seconds,
		));
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					// Slashing detection is unconditional and fatal.
					let mut running_workloads = 0;
					match self.chain.get_worker_info(&self.node_id).await {
						Ok(Some(record)) if record.status == WorkerStatus::Slashed => {
							error!(node_id = %self.node_id, "slashing detected, shutting down");
							self.stop_agent(&commands).await;
							bail!("worker slashed; stake is forfeit")
						},
						Ok(Some(record)) => running_workloads = record.workload,
						Ok(None) => warn!(node_id = %self.node_id, "worker record missing on-chain"),
						Err(error) => warn!(%error, "could not refresh on-chain status"),
					}

					match self.post_heartbeat(&token, running_workloads).await {
						Ok(()) => consecutive_failures = 0,
						Err(HeartbeatError::Rejected) => {
							// A revoked or superseded token never heals on
							// its own; re-registration needs a fresh stake.
							error!(node_id = %self.node_id, "master rejected our join token");
							self.stop_agent(&commands).await;
							bail!("join token rejected; re-register with a fresh stake")
						},
						Err(HeartbeatError::Unreachable(error)) => {
							consecutive_failures += 1;
							warn!(%error, consecutive_failures, "heartbeat failed");
							if consecutive_failures >= HEARTBEAT_SHUTDOWN_THRESHOLD {
								self.stop_agent(&commands).await;
								bail!("{consecutive_failures} consecutive heartbeat failures; shutting down")
							}
							if consecutive_failures == HEARTBEAT_RESTART_THRESHOLD {
								info!("restarting agent after repeated heartbeat failures");
								let _ = commands.send(AgentCommand::Restart).await;
							}
						},
					}
				},
				result = tokio::signal::ctrl_c() => {
					result.context("could not listen for shutdown signal")?;
					info!("shutdown signal received");
					self.stop_agent(&commands).await;
					if self.settings.withdraw_on_shutdown {
						self.withdraw_stake().await;
					}
					return Ok(())
				},
			}
		}
	}

	async fn stop_agent(&self, commands: &mpsc::Sender<AgentCommand>) {
		let (done_tx, done_rx) = oneshot::channel();
		if commands.send(AgentCommand::Shutdown(done_tx)).await.is_ok() {
			let _ = done_rx.await;
		}
	}

	async fn withdraw_stake(&self) {
		match self
			.chain
			.submit_transaction(ContractCall::WithdrawStake { node_id: self.node_id.clone() })
			.await
		{
			Ok(receipt) => info!(digest = %receipt.digest, "stake withdrawn"),
			Err(error) => warn!(%error, "could not withdraw stake (admin release may be required)"),
		}
	}

	async fn post_heartbeat(
		&self,
		token: &str,
		running_workloads: u64,
	) -> Result<(), HeartbeatError> {
		let payload = HeartbeatPayload {
			node_id: self.node_id.clone(),
			token: token.to_string(),
			usage: sample_usage(running_workloads),
			timestamp: unix_time_now(),
		};

		let url = format!(
			"{}/api/workers/{}/heartbeat",
			self.settings.master_endpoint.trim_end_matches('/'),
			self.node_id
		);
		let response = self
			.http
			.post(&url)
			.json(&payload)
			.send()
			.await
			.map_err(|e| HeartbeatError::Unreachable(e.to_string()))?;

		let status = response.status();
		if status.is_success() {
			Ok(())
		} else if status == reqwest::StatusCode::UNAUTHORIZED {
			Err(HeartbeatError::Rejected)
		} else {
			Err(HeartbeatError::Unreachable(format!("master answered {status}")))
		}
	}
}

#[derive(Debug)]
enum HeartbeatError {
	/// 401: the token is revoked, superseded or forged.
	Rejected,
	/// Anything else: network trouble or a struggling master.
	Unreachable(String),
}

/// Best-effort host counters. Off Linux the counters are zero; the
/// heartbeat still carries the workload count from the chain.
fn sample_usage(running_workloads: u64) -> ResourceUsage {
	ResourceUsage {
		cpu_millis: read_load_millis().unwrap_or(0),
		memory_bytes: read_memory_used_bytes().unwrap_or(0),
		running_workloads,
	}
}

fn read_load_millis() -> Option<u64> {
	let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
	let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
	Some((one_minute * 1000.0) as u64)
}

fn read_memory_used_bytes() -> Option<u64> {
	let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
	let mut total = None;
	let mut available = None;
	for line in meminfo.lines() {
		let mut parts = line.split_whitespace();
		match parts.next()? {
			"MemTotal:" => total = parts.next()?.parse::<u64>().ok(),
			"MemAvailable:" => available = parts.next()?.parse::<u64>().ok(),
			_ => {},
		}
		if let (Some(total), Some(available)) = (total, available) {
			return Some(total.saturating_sub(available) * 1024)
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::settings::AgentSettings;
	use chainkube_engine::{
		chain_client::sim_client::SimChainClient,
		settings::{ChainSettings, ContractSettings},
	};
	use ck_admission::StakeTiers;
	use ck_contract::sim::SimChain;
	use std::{
		path::PathBuf,
		sync::{Arc, Mutex},
	};

	const ADMIN: AccountId = AccountId([0xAA; 32]);
	const OWNER: AccountId = AccountId([1; 32]);
	const STAKE: u64 = 1_000_000_000;

	fn test_settings() -> BootstrapperSettings {
		BootstrapperSettings {
			node_id: "w1".to_string(),
			chain: ChainSettings {
				ws_endpoint: "ws://localhost:9944".to_string(),
				signing_key_file: PathBuf::from("/nonexistent"),
			},
			contract: ContractSettings {
				package: "0xc0d".to_string(),
				worker_registry_id: "registry-0".to_string(),
				scheduler_id: "scheduler-0".to_string(),
			},
			agent: AgentSettings {
				binary_path: PathBuf::from("/bin/true"),
				data_dir: PathBuf::from("/tmp"),
			},
			master_endpoint: "http://localhost:8950".to_string(),
			stake_amount: STAKE,
			heartbeat_interval_seconds: 30,
			withdraw_on_shutdown: false,
		}
	}

	fn harness() -> (Arc<Mutex<SimChain>>, SimChainClient, Bootstrapper) {
		let chain = Arc::new(Mutex::new(SimChain::new(ADMIN, STAKE, StakeTiers::default())));
		let admin = SimChainClient::new(chain.clone(), ADMIN);
		let worker_client = admin.as_account(OWNER);
		let bootstrapper =
			Bootstrapper::new(test_settings(), Arc::new(worker_client), OWNER);
		(chain, admin, bootstrapper)
	}

	#[tokio::test]
	async fn registration_is_idempotent_across_restarts() {
		let (chain, _admin, bootstrapper) = harness();

		bootstrapper.ensure_registered().await.unwrap();
		assert!(chain.lock().unwrap().registry().get_worker_info(&NodeId::from("w1")).is_some());

		// A second run of the same host finds the record and moves on.
		bootstrapper.ensure_registered().await.unwrap();
		assert_eq!(chain.lock().unwrap().registry().stats().total, 1);
	}

	#[tokio::test]
	async fn join_flow_activates_once_the_token_lands() {
		let (_chain, admin, bootstrapper) = harness();

		bootstrapper.ensure_registered().await.unwrap();

		// The master side issues the token a moment later.
		let issue = {
			let admin = admin.clone();
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(50)).await;
				admin
					.submit_transaction(ContractCall::SetJoinToken {
						node_id: NodeId::from("w1"),
						token: b"issued-token".to_vec(),
					})
					.await
					.unwrap();
			})
		};

		let token = bootstrapper.await_join_token().await.unwrap();
		assert_eq!(token, b"issued-token");
		issue.await.unwrap();

		bootstrapper.ensure_active().await.unwrap();
		let status = bootstrapper
			.chain
			.get_worker_info(&NodeId::from("w1"))
			.await
			.unwrap()
			.unwrap()
			.status;
		assert_eq!(status, WorkerStatus::Active);

		// Activating again is harmless.
		bootstrapper.ensure_active().await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn join_token_timeout_is_fatal() {
		let (_chain, _admin, bootstrapper) = harness();
		bootstrapper.ensure_registered().await.unwrap();

		let error = bootstrapper.await_join_token().await.unwrap_err();
		assert!(error.to_string().contains("no join token"));
	}

	#[tokio::test]
	async fn slashed_record_refuses_to_start() {
		let (_chain, admin, bootstrapper) = harness();
		bootstrapper.ensure_registered().await.unwrap();
		admin
			.submit_transaction(ContractCall::SlashWorker { node_id: NodeId::from("w1") })
			.await
			.unwrap();

		let error = bootstrapper.ensure_registered().await.unwrap_err();
		assert!(error.to_string().contains("slashed"));
	}

	#[test]
	fn auth_nonce_is_stable_per_key_and_node() {
		let (_chain, _admin, bootstrapper) = harness();
		assert_eq!(bootstrapper.auth_nonce(), bootstrapper.auth_nonce());

		let other = Bootstrapper::new(
			test_settings(),
			bootstrapper.chain.clone(),
			AccountId([9; 32]),
		);
		assert_ne!(bootstrapper.auth_nonce(), other.auth_nonce());
	}
}
