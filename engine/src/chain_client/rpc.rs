//! The jsonrpsee-backed chain client.
//!
//! Wire conventions: contract aborts come back as JSON-RPC call errors with
//! `code = ABORT_ERROR_BASE + abort_code`; gas exhaustion is
//! `INSUFFICIENT_GAS_ERROR_CODE`. Everything else (transport loss,
//! timeouts, node restarts) is transient.

use super::{signer::TxSigner, ChainApi, ChainClientError, EventStream};
use crate::{
	constants::CHAIN_RPC_TIMEOUT,
	settings::{ChainSettings, ContractSettings},
};
use async_trait::async_trait;
use ck_contract::{
	error::AbortCode,
	events::{ContractModule, EventRecord},
	registry::{RegistryStats, WorkerRecord},
	scheduler::{ApiRequestRecord, PoolStats},
	ContractCall, TxReceipt,
};
use ck_primitives::{EventCursor, NodeId, RequestId, RequestStatus};
use futures::StreamExt;
use jsonrpsee::{
	core::client::{ClientT, Subscription, SubscriptionClientT},
	rpc_params,
	ws_client::{WsClient, WsClientBuilder},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub const ABORT_ERROR_BASE: i32 = 4000;
pub const INSUFFICIENT_GAS_ERROR_CODE: i32 = 4900;

fn into_chain_error(error: jsonrpsee::core::client::Error) -> ChainClientError {
	use jsonrpsee::core::client::Error;
	match error {
		Error::Call(object) => {
			let code = object.code();
			if let Some(abort) = (code > ABORT_ERROR_BASE)
				.then(|| AbortCode::from_code((code - ABORT_ERROR_BASE) as u16))
				.flatten()
			{
				ChainClientError::ContractAbort(abort)
			} else if code == INSUFFICIENT_GAS_ERROR_CODE {
				ChainClientError::InsufficientGas
			} else {
				ChainClientError::Transient(object.to_string())
			}
		},
		other => ChainClientError::Transient(other.to_string()),
	}
}

/// What gets signed and submitted for one transaction.
#[derive(Serialize)]
struct SignedTransaction<'a> {
	package: &'a str,
	target: &'static str,
	call: &'a ContractCall,
	sender: String,
	nonce: u64,
	signature: String,
	gas_budget: u64,
}

const DEFAULT_GAS_BUDGET: u64 = 50_000_000;

pub struct ChainRpcClient {
	client: Arc<WsClient>,
	signer: Arc<TxSigner>,
	contract: ContractSettings,
	/// Guards the signing nonce; transactions from this key leave the
	/// process in nonce order.
	submission_lock: tokio::sync::Mutex<u64>,
}

impl ChainRpcClient {
	pub async fn connect(
		chain_settings: &ChainSettings,
		contract: ContractSettings,
		signer: Arc<TxSigner>,
	) -> anyhow::Result<Self> {
		let client = WsClientBuilder::default()
			.request_timeout(CHAIN_RPC_TIMEOUT)
			.build(&chain_settings.ws_endpoint)
			.await?;
		info!(endpoint = %chain_settings.ws_endpoint, account = %signer.account_id(), "connected to chain rpc");
		Ok(Self { client: Arc::new(client), signer, contract, submission_lock: tokio::sync::Mutex::new(0) })
	}

	async fn get_object<T: serde::de::DeserializeOwned>(
		&self,
		object_id: &str,
		view: &str,
		key: &str,
	) -> Result<Option<T>, ChainClientError> {
		self.client
			.request("get_object", rpc_params![object_id, view, key])
			.await
			.map_err(into_chain_error)
	}
}

#[async_trait]
impl ChainApi for ChainRpcClient {
	async fn submit_transaction(&self, call: ContractCall) -> Result<TxReceipt, ChainClientError> {
		let mut nonce = self.submission_lock.lock().await;

		let payload = serde_json::to_vec(&(self.contract.package.as_str(), &call, *nonce))
			.expect("contract calls serialize");
		let signature = self.signer.sign(&payload);

		let transaction = SignedTransaction {
			package: &self.contract.package,
			target: call.target(),
			call: &call,
			sender: self.signer.account_id().to_hex(),
			nonce: *nonce,
			signature: hex::encode(signature.to_bytes()),
			gas_budget: DEFAULT_GAS_BUDGET,
		};

		let receipt: TxReceipt = self
			.client
			.request("submit_transaction", rpc_params![transaction])
			.await
			.map_err(into_chain_error)?;

		// Only a submission the node accepted consumes the nonce.
		*nonce += 1;
		Ok(receipt)
	}

	async fn get_worker_info(
		&self,
		node_id: &NodeId,
	) -> Result<Option<WorkerRecord>, ChainClientError> {
		self.get_object(&self.contract.worker_registry_id, "worker", node_id.as_str()).await
	}

	async fn get_worker_join_token(
		&self,
		node_id: &NodeId,
	) -> Result<Option<Vec<u8>>, ChainClientError> {
		let token: Option<String> =
			self.get_object(&self.contract.worker_registry_id, "join_token", node_id.as_str())
				.await?;
		token
			.map(|encoded| {
				hex::decode(encoded).map_err(|e| {
					ChainClientError::Transient(format!("undecodable join token: {e}"))
				})
			})
			.transpose()
	}

	async fn get_active_worker_of(
		&self,
		owner: &ck_primitives::AccountId,
	) -> Result<Option<WorkerRecord>, ChainClientError> {
		self.get_object(&self.contract.worker_registry_id, "worker_by_owner", &owner.to_hex())
			.await
	}

	async fn get_request(
		&self,
		request_id: &RequestId,
	) -> Result<Option<ApiRequestRecord>, ChainClientError> {
		self.get_object(&self.contract.scheduler_id, "request", &request_id.0).await
	}

	async fn get_request_status(
		&self,
		request_id: &RequestId,
	) -> Result<Option<RequestStatus>, ChainClientError> {
		self.get_object(&self.contract.scheduler_id, "request_status", &request_id.0).await
	}

	async fn get_registry_stats(&self) -> Result<RegistryStats, ChainClientError> {
		self.call_view("get_pool_stats", vec![json!(self.contract.worker_registry_id)])
			.await
			.and_then(|value| {
				serde_json::from_value(value)
					.map_err(|e| ChainClientError::Transient(e.to_string()))
			})
	}

	async fn get_pool_stats(&self) -> Result<PoolStats, ChainClientError> {
		self.call_view("get_pool_stats", vec![json!(self.contract.scheduler_id)])
			.await
			.and_then(|value| {
				serde_json::from_value(value)
					.map_err(|e| ChainClientError::Transient(e.to_string()))
			})
	}

	async fn call_view(
		&self,
		function: &str,
		args: Vec<serde_json::Value>,
	) -> Result<serde_json::Value, ChainClientError> {
		self.client
			.request(
				"call_view",
				rpc_params![json!({
					"package": self.contract.package,
					"function": function,
					"args": args,
				})],
			)
			.await
			.map_err(into_chain_error)
	}

	async fn subscribe_events(
		&self,
		module: ContractModule,
		from: Option<EventCursor>,
	) -> Result<EventStream, ChainClientError> {
		let filter = json!({
			"Package": self.contract.package,
			"Module": module.as_str(),
		});
		let cursor = from.map(|c| json!({"block_height": c.block_height, "intra_block": c.intra_block}));

		let subscription: Subscription<EventRecord> = self
			.client
			.subscribe("subscribe_event", rpc_params![filter, cursor], "unsubscribe_event")
			.await
			.map_err(into_chain_error)?;

		Ok(subscription
			.map(|item| item.map_err(|e| ChainClientError::Transient(e.to_string())))
			.boxed())
	}
}
