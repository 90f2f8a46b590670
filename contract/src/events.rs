use ck_primitives::{
	AccountId, BlockHeight, EpochSeconds, EventCursor, HttpMethod, IntraBlockIndex, NodeId,
	RequestId, StakeAmount, TxDigest, WorkerStatus,
};
use serde::{Deserialize, Serialize};

/// Event partitions. Events within one module are strictly ordered; the
/// master processes the two modules concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractModule {
	WorkerRegistry,
	RequestScheduler,
}

impl ContractModule {
	pub const ALL: [ContractModule; 2] =
		[ContractModule::WorkerRegistry, ContractModule::RequestScheduler];

	pub fn as_str(&self) -> &'static str {
		match self {
			ContractModule::WorkerRegistry => "worker_registry",
			ContractModule::RequestScheduler => "request_scheduler",
		}
	}
}

impl std::fmt::Display for ContractModule {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Payload of a scheduled API request, as carried by the
/// `K8sAPIRequestScheduled` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRequest {
	pub request_id: RequestId,
	pub method: HttpMethod,
	pub path: String,
	pub namespace: String,
	pub resource_type: String,
	pub payload: Vec<u8>,
	pub seal_token: String,
	pub requester: AccountId,
	pub priority: u8,
	pub timestamp: EpochSeconds,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractEvent {
	WorkerRegistered {
		node_id: NodeId,
		owner: AccountId,
		amount: StakeAmount,
	},
	StakeDeposited {
		node_id: NodeId,
		amount: StakeAmount,
		proof_id: u64,
	},
	WorkerStatusChanged {
		node_id: NodeId,
		from: WorkerStatus,
		to: WorkerStatus,
	},
	JoinTokenSet {
		node_id: NodeId,
	},
	K8sApiRequestScheduled(ScheduledRequest),
	WorkerAssigned {
		request_id: RequestId,
		node_id: NodeId,
	},
	K8sResponseStored {
		request_id: RequestId,
		status_code: u16,
		success: bool,
	},
}

impl ContractEvent {
	pub fn module(&self) -> ContractModule {
		match self {
			ContractEvent::WorkerRegistered { .. } |
			ContractEvent::StakeDeposited { .. } |
			ContractEvent::WorkerStatusChanged { .. } |
			ContractEvent::JoinTokenSet { .. } => ContractModule::WorkerRegistry,
			ContractEvent::K8sApiRequestScheduled(_) |
			ContractEvent::WorkerAssigned { .. } |
			ContractEvent::K8sResponseStored { .. } => ContractModule::RequestScheduler,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			ContractEvent::WorkerRegistered { .. } => "WorkerRegistered",
			ContractEvent::StakeDeposited { .. } => "StakeDeposited",
			ContractEvent::WorkerStatusChanged { .. } => "WorkerStatusChanged",
			ContractEvent::JoinTokenSet { .. } => "JoinTokenSet",
			ContractEvent::K8sApiRequestScheduled(_) => "K8sAPIRequestScheduled",
			ContractEvent::WorkerAssigned { .. } => "WorkerAssigned",
			ContractEvent::K8sResponseStored { .. } => "K8sResponseStored",
		}
	}
}

/// One entry of the chain's append-only event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
	pub event: ContractEvent,
	pub tx_digest: TxDigest,
	pub block_height: BlockHeight,
	pub intra_block: IntraBlockIndex,
}

impl EventRecord {
	pub fn cursor(&self) -> EventCursor {
		EventCursor::new(self.block_height, self.intra_block)
	}
}
