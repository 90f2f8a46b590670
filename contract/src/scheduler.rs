//! The request scheduler module: API request records, worker assignment
//! and write-once terminal responses.

use crate::{
	calls::SubmitRequest,
	error::AbortCode,
	events::{ContractEvent, ScheduledRequest},
	registry::WorkerRegistry,
	CallContext,
};
use ck_admission::{authorize_with_tiers, AdmissionRequest, StakeTiers, Verdict};
use ck_primitives::{AccountId, EpochSeconds, NodeId, RequestId, RequestStatus, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
	pub status_code: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
	pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequestRecord {
	pub request_id: RequestId,
	pub request: SubmitRequest,
	pub assigned_worker: Option<NodeId>,
	pub status: RequestStatus,
	pub response: Option<StoredResponse>,
	pub submitted_at: EpochSeconds,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
	pub total_requests: u64,
	pub active_requests: u64,
	pub completed_requests: u64,
	pub failed_requests: u64,
}

#[derive(Clone, Debug)]
pub struct RequestScheduler {
	admin: AccountId,
	/// Client keys allowed to submit without holding a worker record.
	allowlisted_clients: BTreeSet<AccountId>,
	tiers: StakeTiers,
	requests: BTreeMap<RequestId, ApiRequestRecord>,
	active_count: u64,
}

impl RequestScheduler {
	pub fn new(admin: AccountId, tiers: StakeTiers) -> Self {
		Self {
			admin,
			allowlisted_clients: BTreeSet::new(),
			tiers,
			requests: BTreeMap::new(),
			active_count: 0,
		}
	}

	pub fn allowlist_client(&mut self, client: AccountId) {
		self.allowlisted_clients.insert(client);
	}

	/// Validates the requester, creates the request record, assigns it to
	/// an Active worker and emits the scheduling events.
	pub fn submit_k8s_request(
		&mut self,
		registry: &mut WorkerRegistry,
		ctx: CallContext,
		submit: SubmitRequest,
	) -> Result<(RequestId, Vec<ContractEvent>), AbortCode> {
		let resource = ResourceKind::from_path(&submit.path);

		// Allowlisted clients act at admin tier; everyone else is judged by
		// the stake backing their active worker record.
		let (stake, own_node, workload) =
			if self.allowlisted_clients.contains(&submit.requester) ||
				submit.requester == self.admin
			{
				(self.tiers.admin, None, 0)
			} else {
				let worker = registry
					.active_worker_of(&submit.requester)
					.ok_or(AbortCode::RequesterNotAdmitted)?;
				(worker.stake, Some(worker.node_id.clone()), worker.workload)
			};

		match authorize_with_tiers(
			&AdmissionRequest {
				method: submit.method,
				resource,
				target_node: target_node_of(&submit.path),
				own_node,
				current_workload: workload,
			},
			stake,
			&self.tiers,
		) {
			Verdict::Allow => {},
			// The chain cannot hold a request back and retry it later; the
			// master applies cooldowns. At submission both non-Allow
			// verdicts abort.
			Verdict::Deny(_) | Verdict::RateLimit(_) => return Err(AbortCode::NotAuthorized),
		}

		let request_id =
			RequestId::derive(&submit.requester, submit.method, &submit.path, ctx.timestamp);
		if self.requests.contains_key(&request_id) {
			return Err(AbortCode::DuplicateRequest)
		}

		let assigned = pick_worker(registry).ok_or(AbortCode::NoActiveWorkers)?;
		registry.add_workload(&assigned);
		self.active_count += 1;

		let record = ApiRequestRecord {
			request_id: request_id.clone(),
			request: submit.clone(),
			assigned_worker: Some(assigned.clone()),
			status: RequestStatus::Assigned,
			response: None,
			submitted_at: ctx.timestamp,
		};
		self.requests.insert(request_id.clone(), record);

		let events = vec![
			ContractEvent::K8sApiRequestScheduled(ScheduledRequest {
				request_id: request_id.clone(),
				method: submit.method,
				path: submit.path.clone(),
				namespace: submit.namespace.clone(),
				resource_type: ResourceKind::from_path(&submit.path).as_str().to_string(),
				payload: submit.payload.clone(),
				seal_token: String::new(),
				requester: submit.requester,
				priority: submit.priority,
				timestamp: ctx.timestamp,
			}),
			ContractEvent::WorkerAssigned { request_id: request_id.clone(), node_id: assigned },
		];
		Ok((request_id, events))
	}

	/// Admin-only. Terminal statuses are write-once: a second store for the
	/// same request aborts with RequestTerminal.
	pub fn store_k8s_response(
		&mut self,
		registry: &mut WorkerRegistry,
		ctx: CallContext,
		request_id: RequestId,
		status_code: u16,
		headers: Vec<(String, String)>,
		body: Vec<u8>,
		success: bool,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		if ctx.sender != self.admin {
			return Err(AbortCode::NotAdmin)
		}
		let record = self.requests.get_mut(&request_id).ok_or(AbortCode::RequestNotFound)?;
		if record.status.is_terminal() {
			return Err(AbortCode::RequestTerminal)
		}
		if record.status != RequestStatus::Assigned {
			return Err(AbortCode::InvalidStatus)
		}

		record.response = Some(StoredResponse { status_code, headers, body, success });
		record.status =
			if success { RequestStatus::Completed } else { RequestStatus::Failed };
		self.active_count = self.active_count.saturating_sub(1);
		if let Some(worker) = record.assigned_worker.clone() {
			registry.remove_workload(&worker);
		}

		Ok(vec![ContractEvent::K8sResponseStored { request_id, status_code, success }])
	}

	// ===== Views =====

	pub fn get_request_status(&self, request_id: &RequestId) -> Option<RequestStatus> {
		self.requests.get(request_id).map(|record| record.status)
	}

	pub fn get_request(&self, request_id: &RequestId) -> Option<&ApiRequestRecord> {
		self.requests.get(request_id)
	}

	pub fn get_active_request_count(&self) -> u64 {
		self.active_count
	}

	pub fn stats(&self) -> PoolStats {
		let mut stats =
			PoolStats { active_requests: self.active_count, ..Default::default() };
		for record in self.requests.values() {
			stats.total_requests += 1;
			match record.status {
				RequestStatus::Completed => stats.completed_requests += 1,
				RequestStatus::Failed => stats.failed_requests += 1,
				_ => {},
			}
		}
		stats
	}
}

/// Scheduling policy: least workload, then most recent heartbeat, then the
/// lexicographically smallest node id.
fn pick_worker(registry: &WorkerRegistry) -> Option<NodeId> {
	registry
		.active_workers()
		.min_by(|a, b| {
			a.workload
				.cmp(&b.workload)
				.then(b.last_heartbeat.cmp(&a.last_heartbeat))
				.then(a.node_id.cmp(&b.node_id))
		})
		.map(|record| record.node_id.clone())
}

/// When a path addresses a single node object, the node it names.
fn target_node_of(path: &str) -> Option<NodeId> {
	let mut segments = path.split('/').filter(|s| !s.is_empty());
	while let Some(segment) = segments.next() {
		if segment == "nodes" {
			return segments.next().map(NodeId::from)
		}
	}
	None
}
