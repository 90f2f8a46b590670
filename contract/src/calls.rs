use crate::events::{ContractModule, EventRecord};
use ck_primitives::{
	AccountId, BlockHeight, EpochSeconds, HttpMethod, NodeId, RequestId, StakeAmount, TxDigest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a successfully executed transaction hands back to the submitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxReceipt {
	pub digest: TxDigest,
	pub block_height: BlockHeight,
	pub events: Vec<EventRecord>,
}

/// Arguments of `submit_k8s_request`. Pod-shaped requests use the
/// structured fields; other requests carry their manifest (if any) in
/// `payload`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
	pub method: HttpMethod,
	pub path: String,
	pub name: String,
	pub labels: BTreeMap<String, String>,
	pub namespace: String,
	pub container_name: String,
	pub image: String,
	pub port: Option<u16>,
	pub payload: Vec<u8>,
	pub priority: u8,
	pub requester: AccountId,
}

/// A transaction against the deployed contract. This is the wire shape the
/// chain client encodes, and the shape the sim chain executes directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractCall {
	StakeAndRegisterWorker {
		node_id: NodeId,
		payment: StakeAmount,
		auth_nonce: String,
	},
	SetJoinToken {
		node_id: NodeId,
		token: Vec<u8>,
	},
	ActivateWorker {
		node_id: NodeId,
	},
	SlashWorker {
		node_id: NodeId,
	},
	ApproveRelease {
		node_id: NodeId,
	},
	WithdrawStake {
		node_id: NodeId,
	},
	RecordHeartbeat {
		node_id: NodeId,
		epoch: EpochSeconds,
	},
	SubmitK8sRequest(SubmitRequest),
	StoreK8sResponse {
		request_id: RequestId,
		status_code: u16,
		headers: Vec<(String, String)>,
		body: Vec<u8>,
		success: bool,
	},
}

impl ContractCall {
	/// The entry-point name as deployed on-chain.
	pub fn target(&self) -> &'static str {
		match self {
			ContractCall::StakeAndRegisterWorker { .. } => "stake_and_register_worker",
			ContractCall::SetJoinToken { .. } => "set_join_token",
			ContractCall::ActivateWorker { .. } => "activate_worker",
			ContractCall::SlashWorker { .. } => "slash_worker",
			ContractCall::ApproveRelease { .. } => "approve_release",
			ContractCall::WithdrawStake { .. } => "withdraw_stake",
			ContractCall::RecordHeartbeat { .. } => "record_heartbeat",
			ContractCall::SubmitK8sRequest(_) => "submit_k8s_request",
			ContractCall::StoreK8sResponse { .. } => "store_k8s_response",
		}
	}

	pub fn module(&self) -> ContractModule {
		match self {
			ContractCall::SubmitK8sRequest(_) | ContractCall::StoreK8sResponse { .. } =>
				ContractModule::RequestScheduler,
			_ => ContractModule::WorkerRegistry,
		}
	}
}
