//! Typed access to the chain: transaction submission, object queries, view
//! calls and the resumable event subscription.

pub mod event_stream;
pub mod rpc;
pub mod signer;
pub mod sim_client;

use async_trait::async_trait;
use ck_contract::{
	error::AbortCode,
	events::{ContractModule, EventRecord},
	registry::{RegistryStats, WorkerRecord},
	scheduler::{ApiRequestRecord, PoolStats},
	ContractCall, TxReceipt,
};
use ck_primitives::{AccountId, EventCursor, NodeId, RequestId, RequestStatus};
use futures::stream::BoxStream;

#[cfg(test)]
use mockall::automock;

pub type EventStream = BoxStream<'static, Result<EventRecord, ChainClientError>>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ChainClientError {
	/// Network-level trouble; retry with backoff.
	#[error("transient chain rpc error: {0}")]
	Transient(String),
	/// Surfaced to the caller; retrying without a new funding source is
	/// pointless.
	#[error("insufficient gas for transaction")]
	InsufficientGas,
	/// The contract rejected the call. Terminal for this submission.
	#[error("contract abort: {0}")]
	ContractAbort(AbortCode),
	#[error("object not found")]
	NotFound,
}

impl ChainClientError {
	pub fn is_transient(&self) -> bool {
		matches!(self, ChainClientError::Transient(_))
	}

	pub fn abort_code(&self) -> Option<AbortCode> {
		match self {
			ChainClientError::ContractAbort(code) => Some(*code),
			_ => None,
		}
	}
}

/// The chain surface the engine consumes. Implementations must be safe for
/// concurrent use and must serialize transactions from one signing key so
/// nonce order is preserved.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainApi: Send + Sync + 'static {
	async fn submit_transaction(&self, call: ContractCall) -> Result<TxReceipt, ChainClientError>;

	async fn get_worker_info(
		&self,
		node_id: &NodeId,
	) -> Result<Option<WorkerRecord>, ChainClientError>;

	async fn get_worker_join_token(
		&self,
		node_id: &NodeId,
	) -> Result<Option<Vec<u8>>, ChainClientError>;

	/// The Active worker record owned by `owner`, if any. Used by the
	/// admission re-check before executing a request.
	async fn get_active_worker_of(
		&self,
		owner: &AccountId,
	) -> Result<Option<WorkerRecord>, ChainClientError>;

	async fn get_request(
		&self,
		request_id: &RequestId,
	) -> Result<Option<ApiRequestRecord>, ChainClientError>;

	async fn get_request_status(
		&self,
		request_id: &RequestId,
	) -> Result<Option<RequestStatus>, ChainClientError>;

	async fn get_registry_stats(&self) -> Result<RegistryStats, ChainClientError>;

	async fn get_pool_stats(&self) -> Result<PoolStats, ChainClientError>;

	/// Read-only view-function passthrough for the observability surface.
	async fn call_view(
		&self,
		function: &str,
		args: Vec<serde_json::Value>,
	) -> Result<serde_json::Value, ChainClientError>;

	/// A lazy, unbounded sequence of one module's events, resuming strictly
	/// after `from`. The stream ends on transport loss; resumption is the
	/// caller's job (see [event_stream::EventPump]).
	async fn subscribe_events(
		&self,
		module: ContractModule,
		from: Option<EventCursor>,
	) -> Result<EventStream, ChainClientError>;
}
