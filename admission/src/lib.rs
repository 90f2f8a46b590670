//! The admission gate: a pure stake-to-permissions mapping plus the
//! join-token minting primitive.
//!
//! The contract model enforces the permission table at request submission;
//! the master re-runs [authorize] before executing anything against the
//! orchestrator. Token minting stays with the master, which holds the HMAC
//! key.

pub mod token;

use ck_primitives::{HttpMethod, NodeId, ResourceKind, StakeAmount};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stake thresholds, in smallest stake units. The table is normative; the
/// viewer threshold is deployment-tunable (`min_stake_amount`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTiers {
	pub viewer: StakeAmount,
	pub worker_node: StakeAmount,
	pub admin: StakeAmount,
}

pub const DEFAULT_TIERS: StakeTiers = StakeTiers {
	viewer: 500_000_000,
	worker_node: 1_000_000_000,
	admin: 10_000_000_000,
};

impl Default for StakeTiers {
	fn default() -> Self {
		DEFAULT_TIERS
	}
}

/// The largest tier whose threshold is at or below the stake amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
	None,
	Viewer,
	WorkerNode,
	Admin,
}

impl StakeTiers {
	pub fn role_for(&self, stake: StakeAmount) -> Role {
		if stake >= self.admin {
			Role::Admin
		} else if stake >= self.worker_node {
			Role::WorkerNode
		} else if stake >= self.viewer {
			Role::Viewer
		} else {
			Role::None
		}
	}

	/// Concurrent workload a worker of the given stake may carry before
	/// further requests are rate limited. Scales linearly with stake.
	pub fn workload_limit(&self, stake: StakeAmount) -> u64 {
		(stake / self.worker_node).saturating_mul(WORKLOADS_PER_WORKER_STAKE)
	}
}

const WORKLOADS_PER_WORKER_STAKE: u64 = 8;

/// Cooldown handed back with a RateLimit verdict.
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(15);

/// The permission set granted by a stake amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermissionSet {
	role: Role,
}

pub fn permissions_for(stake: StakeAmount) -> PermissionSet {
	permissions_for_tiers(stake, &DEFAULT_TIERS)
}

pub fn permissions_for_tiers(stake: StakeAmount, tiers: &StakeTiers) -> PermissionSet {
	PermissionSet { role: tiers.role_for(stake) }
}

impl PermissionSet {
	pub fn role(&self) -> Role {
		self.role
	}

	/// Whether the set permits `method` on `resource`.
	///
	/// `own_node`/`target_node` carry the "nodes/self" distinction: a worker
	/// may mutate its own node object but nobody else's.
	pub fn allows(
		&self,
		method: HttpMethod,
		resource: &ResourceKind,
		own_node: Option<&NodeId>,
		target_node: Option<&NodeId>,
	) -> bool {
		match self.role {
			Role::Admin => true,
			Role::None => false,
			Role::Viewer => {
				!method.is_mutation() &&
					matches!(resource, ResourceKind::Pods | ResourceKind::Services)
			},
			Role::WorkerNode => {
				if !method.is_mutation() {
					return true
				}
				match resource {
					ResourceKind::Pods => true,
					ResourceKind::Nodes => match (own_node, target_node) {
						(Some(own), Some(target)) => own == target,
						_ => false,
					},
					_ => false,
				}
			},
		}
	}
}

/// What the gate is asked to decide on.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
	pub method: HttpMethod,
	pub resource: ResourceKind,
	/// Node object named by the path, when the path targets a node.
	pub target_node: Option<NodeId>,
	/// The requester's own node, when the requester is a registered worker.
	pub own_node: Option<NodeId>,
	/// Workload currently assigned to the requester's worker record.
	pub current_workload: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
	Allow,
	Deny(DenyReason),
	/// Return the request to the pending pool and retry after the cooldown.
	RateLimit(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
	#[error("stake of {stake} grants no permissions")]
	NoStakeTier { stake: StakeAmount },
	#[error("{method} on {resource} exceeds the permissions of {role:?}")]
	MethodNotPermitted { method: HttpMethod, resource: ResourceKind, role: Role },
}

/// The gate decision for one request. Pure: all chain and local state
/// arrives through the arguments.
pub fn authorize(request: &AdmissionRequest, stake: StakeAmount) -> Verdict {
	authorize_with_tiers(request, stake, &DEFAULT_TIERS)
}

pub fn authorize_with_tiers(
	request: &AdmissionRequest,
	stake: StakeAmount,
	tiers: &StakeTiers,
) -> Verdict {
	let permissions = permissions_for_tiers(stake, tiers);
	if permissions.role() == Role::None {
		return Verdict::Deny(DenyReason::NoStakeTier { stake })
	}

	if !permissions.allows(
		request.method,
		&request.resource,
		request.own_node.as_ref(),
		request.target_node.as_ref(),
	) {
		return Verdict::Deny(DenyReason::MethodNotPermitted {
			method: request.method,
			resource: request.resource.clone(),
			role: permissions.role(),
		})
	}

	if request.current_workload >= tiers.workload_limit(stake).max(1) {
		return Verdict::RateLimit(RATE_LIMIT_COOLDOWN)
	}

	Verdict::Allow
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(method: HttpMethod, resource: ResourceKind) -> AdmissionRequest {
		AdmissionRequest { method, resource, target_node: None, own_node: None, current_workload: 0 }
	}

	#[test]
	fn tier_boundaries_are_inclusive() {
		let tiers = StakeTiers::default();
		assert_eq!(tiers.role_for(tiers.viewer), Role::Viewer);
		assert_eq!(tiers.role_for(tiers.viewer - 1), Role::None);
		assert_eq!(tiers.role_for(tiers.worker_node), Role::WorkerNode);
		assert_eq!(tiers.role_for(tiers.worker_node - 1), Role::Viewer);
		assert_eq!(tiers.role_for(tiers.admin), Role::Admin);
		assert_eq!(tiers.role_for(tiers.admin - 1), Role::WorkerNode);
	}

	#[test]
	fn viewer_gets_reads_on_pods_and_services_only() {
		let stake = DEFAULT_TIERS.viewer;
		let set = permissions_for(stake);
		assert!(set.allows(HttpMethod::Get, &ResourceKind::Pods, None, None));
		assert!(set.allows(HttpMethod::Get, &ResourceKind::Services, None, None));
		assert!(!set.allows(HttpMethod::Get, &ResourceKind::Nodes, None, None));
		assert!(!set.allows(HttpMethod::Post, &ResourceKind::Pods, None, None));
	}

	#[test]
	fn worker_node_may_only_mutate_its_own_node() {
		let set = permissions_for(DEFAULT_TIERS.worker_node);
		let own = NodeId::from("w1");
		let other = NodeId::from("w2");
		assert!(set.allows(HttpMethod::Get, &ResourceKind::Nodes, None, None));
		assert!(set.allows(HttpMethod::Patch, &ResourceKind::Nodes, Some(&own), Some(&own)));
		assert!(!set.allows(HttpMethod::Patch, &ResourceKind::Nodes, Some(&own), Some(&other)));
		assert!(!set.allows(HttpMethod::Delete, &ResourceKind::Services, Some(&own), None));
		assert!(set.allows(HttpMethod::Post, &ResourceKind::Pods, None, None));
	}

	#[test]
	fn admin_has_the_full_surface() {
		let set = permissions_for(DEFAULT_TIERS.admin);
		assert!(set.allows(HttpMethod::Delete, &ResourceKind::Namespaces, None, None));
		assert!(set.allows(
			HttpMethod::Put,
			&ResourceKind::Other("customresources".to_string()),
			None,
			None
		));
	}

	#[test]
	fn authorize_denies_below_viewer() {
		let verdict = authorize(&request(HttpMethod::Get, ResourceKind::Pods), 1);
		assert!(matches!(verdict, Verdict::Deny(DenyReason::NoStakeTier { .. })));
	}

	#[test]
	fn authorize_rate_limits_on_workload() {
		let stake = DEFAULT_TIERS.worker_node;
		let mut req = request(HttpMethod::Get, ResourceKind::Pods);
		req.current_workload = DEFAULT_TIERS.workload_limit(stake);
		assert!(matches!(authorize(&req, stake), Verdict::RateLimit(_)));

		req.current_workload -= 1;
		assert_eq!(authorize(&req, stake), Verdict::Allow);
	}
}
