//! [ChainApi] over the in-process sim chain. Local nets and the
//! integration tests use this in place of a real node.

use super::{ChainApi, ChainClientError, EventStream};
use async_trait::async_trait;
use ck_contract::{
	events::{ContractModule, EventRecord},
	registry::{RegistryStats, WorkerRecord},
	scheduler::{ApiRequestRecord, PoolStats},
	sim::SimChain,
	ContractCall, TxReceipt,
};
use ck_primitives::{AccountId, EventCursor, NodeId, RequestId, RequestStatus};
use futures::StreamExt;
use std::{
	collections::VecDeque,
	sync::{Arc, Mutex},
	time::Duration,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cheap to clone; clones share the chain and differ only in signing
/// identity.
#[derive(Clone)]
pub struct SimChainClient {
	chain: Arc<Mutex<SimChain>>,
	sender: AccountId,
}

impl SimChainClient {
	pub fn new(chain: Arc<Mutex<SimChain>>, sender: AccountId) -> Self {
		Self { chain, sender }
	}

	/// The same chain under a different signing identity.
	pub fn as_account(&self, sender: AccountId) -> Self {
		Self { chain: self.chain.clone(), sender }
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, SimChain> {
		self.chain.lock().expect("sim chain lock poisoned")
	}
}

#[async_trait]
impl ChainApi for SimChainClient {
	async fn submit_transaction(&self, call: ContractCall) -> Result<TxReceipt, ChainClientError> {
		self.lock().execute(self.sender, call).map_err(ChainClientError::ContractAbort)
	}

	async fn get_worker_info(
		&self,
		node_id: &NodeId,
	) -> Result<Option<WorkerRecord>, ChainClientError> {
		Ok(self.lock().registry().get_worker_info(node_id).cloned())
	}

	async fn get_worker_join_token(
		&self,
		node_id: &NodeId,
	) -> Result<Option<Vec<u8>>, ChainClientError> {
		Ok(self.lock().registry().get_worker_join_token(node_id).map(<[u8]>::to_vec))
	}

	async fn get_active_worker_of(
		&self,
		owner: &AccountId,
	) -> Result<Option<WorkerRecord>, ChainClientError> {
		Ok(self.lock().registry().active_worker_of(owner).cloned())
	}

	async fn get_request(
		&self,
		request_id: &RequestId,
	) -> Result<Option<ApiRequestRecord>, ChainClientError> {
		Ok(self.lock().scheduler().get_request(request_id).cloned())
	}

	async fn get_request_status(
		&self,
		request_id: &RequestId,
	) -> Result<Option<RequestStatus>, ChainClientError> {
		Ok(self.lock().scheduler().get_request_status(request_id))
	}

	async fn get_registry_stats(&self) -> Result<RegistryStats, ChainClientError> {
		Ok(self.lock().registry_stats())
	}

	async fn get_pool_stats(&self) -> Result<PoolStats, ChainClientError> {
		Ok(self.lock().pool_stats())
	}

	async fn call_view(
		&self,
		function: &str,
		args: Vec<serde_json::Value>,
	) -> Result<serde_json::Value, ChainClientError> {
		let _ = args;
		match function {
			"get_pool_stats" => Ok(serde_json::to_value(self.lock().pool_stats())
				.expect("pool stats serialize")),
			"get_registry_stats" => Ok(serde_json::to_value(self.lock().registry_stats())
				.expect("registry stats serialize")),
			"get_active_request_count" =>
				Ok(serde_json::json!(self.lock().scheduler().get_active_request_count())),
			_ => Err(ChainClientError::NotFound),
		}
	}

	async fn subscribe_events(
		&self,
		module: ContractModule,
		from: Option<EventCursor>,
	) -> Result<EventStream, ChainClientError> {
		struct PollState {
			chain: Arc<Mutex<SimChain>>,
			module: ContractModule,
			cursor: Option<EventCursor>,
			buffered: VecDeque<EventRecord>,
		}

		let state = PollState { chain: self.chain.clone(), module, cursor: from, buffered: VecDeque::new() };

		Ok(futures::stream::unfold(state, |mut state| async move {
			loop {
				if let Some(record) = state.buffered.pop_front() {
					state.cursor = Some(record.cursor());
					return Some((Ok(record), state))
				}
				let fresh = {
					let chain = state.chain.lock().expect("sim chain lock poisoned");
					chain.events_after(state.module, state.cursor)
				};
				if fresh.is_empty() {
					tokio::time::sleep(POLL_INTERVAL).await;
				} else {
					state.buffered.extend(fresh);
				}
			}
		})
		.boxed())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ck_admission::StakeTiers;
	use ck_contract::error::AbortCode;

	const ADMIN: AccountId = AccountId([0xAA; 32]);
	const OWNER: AccountId = AccountId([1; 32]);

	fn client() -> SimChainClient {
		let chain =
			Arc::new(Mutex::new(SimChain::new(ADMIN, 1_000_000_000, StakeTiers::default())));
		SimChainClient::new(chain, OWNER)
	}

	#[tokio::test]
	async fn aborts_surface_as_contract_abort() {
		let client = client();
		let result = client
			.submit_transaction(ContractCall::StakeAndRegisterWorker {
				node_id: NodeId::from("w1"),
				payment: 1,
				auth_nonce: "n".into(),
			})
			.await;
		assert!(matches!(
			result,
			Err(ChainClientError::ContractAbort(AbortCode::StakeBelowMinimum))
		));
	}

	#[tokio::test]
	async fn subscription_streams_new_events() {
		let client = client();
		let mut stream = client
			.subscribe_events(ContractModule::WorkerRegistry, None)
			.await
			.unwrap();

		client
			.submit_transaction(ContractCall::StakeAndRegisterWorker {
				node_id: NodeId::from("w1"),
				payment: 1_000_000_000,
				auth_nonce: "n".into(),
			})
			.await
			.unwrap();

		let first = stream.next().await.unwrap().unwrap();
		assert_eq!(first.event.kind(), "WorkerRegistered");
		let second = stream.next().await.unwrap().unwrap();
		assert_eq!(second.event.kind(), "StakeDeposited");
	}
}
