//! The worker registry module: stake-backed worker records and their
//! lifecycle.
//!
//! Records are never deleted. A withdrawn record remains as a tombstone so
//! node ids cannot be reused, and status transitions are monotone except
//! for Active -> Slashed.

use crate::{error::AbortCode, events::ContractEvent, CallContext};
use ck_primitives::{AccountId, EpochSeconds, NodeId, StakeAmount, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
	pub node_id: NodeId,
	pub owner: AccountId,
	pub stake: StakeAmount,
	pub status: WorkerStatus,
	pub join_token: Option<Vec<u8>>,
	pub auth_nonce: String,
	pub created_at: EpochSeconds,
	pub last_heartbeat: EpochSeconds,
	/// Requests currently assigned to this worker.
	pub workload: u64,
	/// Set by the admin to let an Active worker withdraw cleanly.
	pub release_approved: bool,
}

/// Immutable receipt for one stake deposit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeProof {
	pub proof_id: u64,
	pub owner: AccountId,
	pub amount: StakeAmount,
	pub node_id: NodeId,
	pub deposited_at: EpochSeconds,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
	pub total: u64,
	pub pending: u64,
	pub active: u64,
	pub slashed: u64,
	pub withdrawn: u64,
	pub total_active_stake: StakeAmount,
	pub forfeited_stake: StakeAmount,
}

#[derive(Clone, Debug)]
pub struct WorkerRegistry {
	admin: AccountId,
	min_stake: StakeAmount,
	workers: BTreeMap<NodeId, WorkerRecord>,
	proofs: Vec<StakeProof>,
	forfeited_stake: StakeAmount,
}

impl WorkerRegistry {
	pub fn new(admin: AccountId, min_stake: StakeAmount) -> Self {
		Self { admin, min_stake, workers: BTreeMap::new(), proofs: Vec::new(), forfeited_stake: 0 }
	}

	pub fn admin(&self) -> AccountId {
		self.admin
	}

	pub fn min_stake(&self) -> StakeAmount {
		self.min_stake
	}

	fn require_admin(&self, ctx: &CallContext) -> Result<(), AbortCode> {
		if ctx.sender == self.admin {
			Ok(())
		} else {
			Err(AbortCode::NotAdmin)
		}
	}

	pub fn stake_and_register_worker(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
		payment: StakeAmount,
		auth_nonce: String,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		// Tombstoned ids count as taken: identifiers are never reused.
		if self.workers.contains_key(&node_id) {
			return Err(AbortCode::NodeIdTaken)
		}
		if payment < self.min_stake {
			return Err(AbortCode::StakeBelowMinimum)
		}

		let proof_id = self.proofs.len() as u64;
		self.proofs.push(StakeProof {
			proof_id,
			owner: ctx.sender,
			amount: payment,
			node_id: node_id.clone(),
			deposited_at: ctx.timestamp,
		});
		self.workers.insert(
			node_id.clone(),
			WorkerRecord {
				node_id: node_id.clone(),
				owner: ctx.sender,
				stake: payment,
				status: WorkerStatus::Pending,
				join_token: None,
				auth_nonce,
				created_at: ctx.timestamp,
				last_heartbeat: ctx.timestamp,
				workload: 0,
				release_approved: false,
			},
		);

		Ok(vec![
			ContractEvent::WorkerRegistered {
				node_id: node_id.clone(),
				owner: ctx.sender,
				amount: payment,
			},
			ContractEvent::StakeDeposited { node_id, amount: payment, proof_id },
		])
	}

	/// Admin-only. Stores the join token on a Pending record. Does not
	/// activate; activation stays with the owner.
	pub fn set_join_token(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
		token: Vec<u8>,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		self.require_admin(&ctx)?;
		let record = self.workers.get_mut(&node_id).ok_or(AbortCode::WorkerNotFound)?;
		if record.status != WorkerStatus::Pending {
			return Err(AbortCode::InvalidStatus)
		}
		record.join_token = Some(token);
		Ok(vec![ContractEvent::JoinTokenSet { node_id }])
	}

	pub fn activate_worker(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		let record = self.workers.get_mut(&node_id).ok_or(AbortCode::WorkerNotFound)?;
		if record.owner != ctx.sender {
			return Err(AbortCode::NotOwner)
		}
		if record.status != WorkerStatus::Pending {
			return Err(AbortCode::InvalidStatus)
		}
		if record.join_token.as_ref().map_or(true, |token| token.is_empty()) {
			return Err(AbortCode::JoinTokenMissing)
		}
		record.status = WorkerStatus::Active;
		record.last_heartbeat = ctx.timestamp;
		Ok(vec![ContractEvent::WorkerStatusChanged {
			node_id,
			from: WorkerStatus::Pending,
			to: WorkerStatus::Active,
		}])
	}

	/// Admin-only. The stake is forfeit; the transition is terminal.
	pub fn slash_worker(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		self.require_admin(&ctx)?;
		let record = self.workers.get_mut(&node_id).ok_or(AbortCode::WorkerNotFound)?;
		let from = record.status;
		if !matches!(from, WorkerStatus::Pending | WorkerStatus::Active) {
			return Err(AbortCode::InvalidStatus)
		}
		record.status = WorkerStatus::Slashed;
		self.forfeited_stake = self.forfeited_stake.saturating_add(record.stake);
		Ok(vec![ContractEvent::WorkerStatusChanged {
			node_id,
			from,
			to: WorkerStatus::Slashed,
		}])
	}

	/// Admin-only. Marks an Active record eligible for clean withdrawal.
	pub fn approve_release(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		self.require_admin(&ctx)?;
		let record = self.workers.get_mut(&node_id).ok_or(AbortCode::WorkerNotFound)?;
		if record.status != WorkerStatus::Active {
			return Err(AbortCode::InvalidStatus)
		}
		record.release_approved = true;
		Ok(vec![])
	}

	/// Owner-only. Returns the released amount alongside the emitted
	/// events; the record stays behind as a tombstone.
	pub fn withdraw_stake(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
	) -> Result<(StakeAmount, Vec<ContractEvent>), AbortCode> {
		let record = self.workers.get_mut(&node_id).ok_or(AbortCode::WorkerNotFound)?;
		if record.owner != ctx.sender {
			return Err(AbortCode::NotOwner)
		}
		let eligible = record.status == WorkerStatus::Pending ||
			(record.status == WorkerStatus::Active && record.release_approved);
		if !eligible {
			return Err(AbortCode::NotWithdrawEligible)
		}
		let from = record.status;
		let amount = record.stake;
		record.stake = 0;
		record.status = WorkerStatus::Withdrawn;
		Ok((
			amount,
			vec![ContractEvent::WorkerStatusChanged {
				node_id,
				from,
				to: WorkerStatus::Withdrawn,
			}],
		))
	}

	/// Admin-only bookkeeping used by the scheduling tie-break. Not a
	/// record state change in the event-log sense, so nothing is emitted.
	pub fn record_heartbeat(
		&mut self,
		ctx: CallContext,
		node_id: NodeId,
		epoch: EpochSeconds,
	) -> Result<Vec<ContractEvent>, AbortCode> {
		self.require_admin(&ctx)?;
		let record = self.workers.get_mut(&node_id).ok_or(AbortCode::WorkerNotFound)?;
		if record.status != WorkerStatus::Active {
			return Err(AbortCode::InvalidStatus)
		}
		record.last_heartbeat = record.last_heartbeat.max(epoch);
		Ok(vec![])
	}

	// ===== Views =====

	pub fn get_worker_info(&self, node_id: &NodeId) -> Option<&WorkerRecord> {
		self.workers.get(node_id)
	}

	pub fn get_worker_join_token(&self, node_id: &NodeId) -> Option<&[u8]> {
		self.workers.get(node_id).and_then(|record| record.join_token.as_deref())
	}

	pub fn get_worker_workload(&self, node_id: &NodeId) -> Option<u64> {
		self.workers.get(node_id).map(|record| record.workload)
	}

	/// The worker record (if any) whose owner is `owner` and whose status
	/// is Active. Owners run at most one active worker per address.
	pub fn active_worker_of(&self, owner: &AccountId) -> Option<&WorkerRecord> {
		self.workers
			.values()
			.find(|record| record.owner == *owner && record.status == WorkerStatus::Active)
	}

	pub fn active_workers(&self) -> impl Iterator<Item = &WorkerRecord> {
		self.workers.values().filter(|record| record.status == WorkerStatus::Active)
	}

	pub fn stats(&self) -> RegistryStats {
		let mut stats =
			RegistryStats { forfeited_stake: self.forfeited_stake, ..Default::default() };
		for record in self.workers.values() {
			stats.total += 1;
			match record.status {
				WorkerStatus::Pending => stats.pending += 1,
				WorkerStatus::Active => {
					stats.active += 1;
					stats.total_active_stake =
						stats.total_active_stake.saturating_add(record.stake);
				},
				WorkerStatus::Slashed => stats.slashed += 1,
				WorkerStatus::Withdrawn => stats.withdrawn += 1,
			}
		}
		stats
	}

	// ===== Scheduler-internal =====

	pub(crate) fn add_workload(&mut self, node_id: &NodeId) {
		if let Some(record) = self.workers.get_mut(node_id) {
			record.workload += 1;
		}
	}

	pub(crate) fn remove_workload(&mut self, node_id: &NodeId) {
		if let Some(record) = self.workers.get_mut(node_id) {
			record.workload = record.workload.saturating_sub(1);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const ADMIN: AccountId = AccountId([0xAA; 32]);
	const OWNER: AccountId = AccountId([1; 32]);
	const OTHER: AccountId = AccountId([2; 32]);
	const MIN_STAKE: StakeAmount = 1_000_000_000;

	fn ctx(sender: AccountId) -> CallContext {
		CallContext::new(sender, 1_700_000_000)
	}

	fn registry_with_pending_worker() -> WorkerRegistry {
		let mut registry = WorkerRegistry::new(ADMIN, MIN_STAKE);
		registry
			.stake_and_register_worker(ctx(OWNER), NodeId::from("w1"), MIN_STAKE, "n1".into())
			.unwrap();
		registry
	}

	#[test]
	fn registration_emits_registered_then_deposited() {
		let mut registry = WorkerRegistry::new(ADMIN, MIN_STAKE);
		let events = registry
			.stake_and_register_worker(ctx(OWNER), NodeId::from("w1"), MIN_STAKE, "n1".into())
			.unwrap();

		assert!(matches!(
			events.as_slice(),
			[
				ContractEvent::WorkerRegistered { amount: MIN_STAKE, .. },
				ContractEvent::StakeDeposited { proof_id: 0, .. }
			]
		));
		let record = registry.get_worker_info(&NodeId::from("w1")).unwrap();
		assert_eq!(record.status, WorkerStatus::Pending);
		assert_eq!(record.auth_nonce, "n1");
	}

	#[test]
	fn underfunded_registration_aborts_without_state_change() {
		let mut registry = WorkerRegistry::new(ADMIN, MIN_STAKE);
		assert_eq!(
			registry.stake_and_register_worker(
				ctx(OWNER),
				NodeId::from("w1"),
				100_000_000,
				"n1".into()
			),
			Err(AbortCode::StakeBelowMinimum)
		);
		assert!(registry.get_worker_info(&NodeId::from("w1")).is_none());
		assert_eq!(registry.stats().total, 0);
	}

	#[test]
	fn duplicate_registration_aborts_and_registry_is_unchanged() {
		let mut registry = registry_with_pending_worker();
		let before = registry.get_worker_info(&NodeId::from("w1")).unwrap().clone();
		assert_eq!(
			registry.stake_and_register_worker(
				ctx(OTHER),
				NodeId::from("w1"),
				MIN_STAKE * 2,
				"n2".into()
			),
			Err(AbortCode::NodeIdTaken)
		);
		assert_eq!(registry.get_worker_info(&NodeId::from("w1")).unwrap(), &before);
	}

	#[test]
	fn join_token_is_admin_only_and_pending_only() {
		let mut registry = registry_with_pending_worker();
		let node = NodeId::from("w1");

		assert_eq!(
			registry.set_join_token(ctx(OWNER), node.clone(), b"t".to_vec()),
			Err(AbortCode::NotAdmin)
		);

		registry.set_join_token(ctx(ADMIN), node.clone(), b"t".to_vec()).unwrap();
		registry.activate_worker(ctx(OWNER), node.clone()).unwrap();

		// Token writes after activation are state races; they abort.
		assert_eq!(
			registry.set_join_token(ctx(ADMIN), node, b"t2".to_vec()),
			Err(AbortCode::InvalidStatus)
		);
	}

	#[test]
	fn activation_requires_token_and_ownership() {
		let mut registry = registry_with_pending_worker();
		let node = NodeId::from("w1");

		assert_eq!(
			registry.activate_worker(ctx(OWNER), node.clone()),
			Err(AbortCode::JoinTokenMissing)
		);

		registry.set_join_token(ctx(ADMIN), node.clone(), b"t".to_vec()).unwrap();
		assert_eq!(registry.activate_worker(ctx(OTHER), node.clone()), Err(AbortCode::NotOwner));

		let events = registry.activate_worker(ctx(OWNER), node.clone()).unwrap();
		assert!(matches!(
			events.as_slice(),
			[ContractEvent::WorkerStatusChanged {
				from: WorkerStatus::Pending,
				to: WorkerStatus::Active,
				..
			}]
		));
		// An Active record always holds a non-empty join token.
		assert!(!registry.get_worker_join_token(&node).unwrap().is_empty());
	}

	#[test]
	fn slashing_forfeits_stake_and_is_terminal() {
		let mut registry = registry_with_pending_worker();
		let node = NodeId::from("w1");
		registry.slash_worker(ctx(ADMIN), node.clone()).unwrap();

		assert_eq!(registry.get_worker_info(&node).unwrap().status, WorkerStatus::Slashed);
		assert_eq!(registry.stats().forfeited_stake, MIN_STAKE);
		assert_eq!(registry.slash_worker(ctx(ADMIN), node.clone()), Err(AbortCode::InvalidStatus));
		assert_eq!(
			registry.withdraw_stake(ctx(OWNER), node),
			Err(AbortCode::NotWithdrawEligible)
		);
	}

	#[test]
	fn withdrawal_tombstones_the_record() {
		let mut registry = registry_with_pending_worker();
		let node = NodeId::from("w1");
		let (amount, _) = registry.withdraw_stake(ctx(OWNER), node.clone()).unwrap();
		assert_eq!(amount, MIN_STAKE);
		assert_eq!(registry.get_worker_info(&node).unwrap().status, WorkerStatus::Withdrawn);

		// The tombstone keeps the id reserved forever.
		assert_eq!(
			registry.stake_and_register_worker(ctx(OWNER), node, MIN_STAKE, "n2".into()),
			Err(AbortCode::NodeIdTaken)
		);
	}

	#[test]
	fn active_withdrawal_requires_admin_release() {
		let mut registry = registry_with_pending_worker();
		let node = NodeId::from("w1");
		registry.set_join_token(ctx(ADMIN), node.clone(), b"t".to_vec()).unwrap();
		registry.activate_worker(ctx(OWNER), node.clone()).unwrap();

		assert_eq!(
			registry.withdraw_stake(ctx(OWNER), node.clone()),
			Err(AbortCode::NotWithdrawEligible)
		);
		registry.approve_release(ctx(ADMIN), node.clone()).unwrap();
		let (amount, _) = registry.withdraw_stake(ctx(OWNER), node).unwrap();
		assert_eq!(amount, MIN_STAKE);
	}
}
