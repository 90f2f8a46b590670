//! The master runtime: every piece of shared mutable state, gathered into
//! one value constructed at startup and passed explicitly through the
//! handlers. No ambient globals.

use crate::{
	chain_client::{ChainApi, ChainClientError},
	constants::{CHAIN_RETRY_ATTEMPTS, CHAIN_RETRY_INITIAL_DELAY},
	db::PersistentStateDB,
	http::ResourceUsage,
	kube::KubeApi,
	observer::ProgressTracker,
	retrier::{with_retries, RetryLimits},
	settings::Settings,
};
use anyhow::Context;
use ck_admission::{
	token::{JoinTokenMinter, TokenRegistry},
	StakeTiers, DEFAULT_TIERS,
};
use ck_contract::{ContractCall, TxReceipt};
use ck_primitives::{unix_time_now, EpochSeconds, NodeId, WorkerStatus};
use serde::Serialize;
use std::{
	collections::{HashMap, VecDeque},
	sync::{Arc, Mutex},
	time::Instant,
};

const TX_HISTORY_CAPACITY: usize = 256;

/// One recent on-chain effect, for the observability surface.
#[derive(Clone, Debug, Serialize)]
pub struct TxHistoryEntry {
	pub digest: String,
	pub target: String,
	pub block_height: u64,
	pub recorded_at: EpochSeconds,
}

/// The master's local view of one worker node, fed by events and
/// heartbeats.
#[derive(Clone, Debug, Serialize)]
pub struct NodeView {
	pub node_id: NodeId,
	pub status: WorkerStatus,
	pub last_heartbeat: Option<EpochSeconds>,
	pub usage: Option<ResourceUsage>,
}

pub struct MasterRuntime {
	pub settings: Settings,
	pub chain: Arc<dyn ChainApi>,
	pub kube: Arc<dyn KubeApi>,
	pub progress: ProgressTracker,
	pub minter: JoinTokenMinter,
	pub tokens: Mutex<TokenRegistry>,
	pub tiers: StakeTiers,
	pub nodes: Mutex<HashMap<NodeId, NodeView>>,
	pub history: Mutex<VecDeque<TxHistoryEntry>>,
	/// When each node's heartbeat was last mirrored on-chain.
	pub heartbeat_marks: Mutex<HashMap<NodeId, Instant>>,
}

impl MasterRuntime {
	pub fn new(
		settings: Settings,
		chain: Arc<dyn ChainApi>,
		kube: Arc<dyn KubeApi>,
		db: Arc<PersistentStateDB>,
	) -> anyhow::Result<Arc<Self>> {
		let hmac_key = std::fs::read(&settings.master.hmac_secret_file).with_context(|| {
			format!("could not read hmac secret {}", settings.master.hmac_secret_file.display())
		})?;
		Self::with_hmac_key(settings, chain, kube, db, hmac_key)
	}

	/// As [Self::new], but with the HMAC key supplied directly. Tests use
	/// this to avoid touching the filesystem for secrets.
	pub fn with_hmac_key(
		settings: Settings,
		chain: Arc<dyn ChainApi>,
		kube: Arc<dyn KubeApi>,
		db: Arc<PersistentStateDB>,
		hmac_key: Vec<u8>,
	) -> anyhow::Result<Arc<Self>> {
		let tiers = StakeTiers {
			viewer: settings.min_stake_amount.unwrap_or(DEFAULT_TIERS.viewer),
			..DEFAULT_TIERS
		};
		let progress = ProgressTracker::load(db)?;

		Ok(Arc::new(Self {
			settings,
			chain,
			kube,
			progress,
			minter: JoinTokenMinter::new(hmac_key),
			tokens: Mutex::new(TokenRegistry::default()),
			tiers,
			nodes: Mutex::new(HashMap::new()),
			history: Mutex::new(VecDeque::new()),
			heartbeat_marks: Mutex::new(HashMap::new()),
		}))
	}

	/// Submit an admin transaction, retrying transient RPC failures, and
	/// record the effect in the observability history.
	pub async fn submit_admin_tx(
		&self,
		call: ContractCall,
	) -> Result<TxReceipt, ChainClientError> {
		let target = call.target();
		let receipt = with_retries(
			target,
			RetryLimits::new(CHAIN_RETRY_INITIAL_DELAY, CHAIN_RETRY_ATTEMPTS),
			ChainClientError::is_transient,
			|| self.chain.submit_transaction(call.clone()),
		)
		.await?;

		self.record_tx(target, &receipt);
		Ok(receipt)
	}

	pub fn record_tx(&self, target: &str, receipt: &TxReceipt) {
		let mut history = self.history.lock().expect("history lock poisoned");
		history.push_front(TxHistoryEntry {
			digest: receipt.digest.to_hex(),
			target: target.to_string(),
			block_height: receipt.block_height,
			recorded_at: unix_time_now(),
		});
		history.truncate(TX_HISTORY_CAPACITY);
	}

	pub fn note_worker_status(&self, node_id: &NodeId, status: WorkerStatus) {
		let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
		nodes
			.entry(node_id.clone())
			.and_modify(|view| view.status = status)
			.or_insert_with(|| NodeView {
				node_id: node_id.clone(),
				status,
				last_heartbeat: None,
				usage: None,
			});
	}

	pub fn note_heartbeat(&self, node_id: &NodeId, usage: ResourceUsage) {
		let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
		let view = nodes.entry(node_id.clone()).or_insert_with(|| NodeView {
			node_id: node_id.clone(),
			status: WorkerStatus::Active,
			last_heartbeat: None,
			usage: None,
		});
		view.last_heartbeat = Some(unix_time_now());
		view.usage = Some(usage);
	}

	pub fn node_views(&self) -> Vec<NodeView> {
		let mut views: Vec<NodeView> =
			self.nodes.lock().expect("nodes lock poisoned").values().cloned().collect();
		views.sort_by(|a, b| a.node_id.cmp(&b.node_id));
		views
	}

	pub fn tx_history(&self) -> Vec<TxHistoryEntry> {
		self.history.lock().expect("history lock poisoned").iter().cloned().collect()
	}
}
