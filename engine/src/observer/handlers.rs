//! Handlers for worker-registry events, plus the bookkeeping for the
//! scheduler partition's non-execution events.

use super::HandlerOutcome;
use crate::{chain_client::ChainClientError, constants::HANDLER_RETRY_COOLDOWN, metrics, runtime::MasterRuntime};
use ck_contract::{events::{ContractEvent, EventRecord}, ContractCall};
use ck_primitives::{NodeId, StakeAmount, WorkerStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct EventHandlers {
	runtime: Arc<MasterRuntime>,
}

impl EventHandlers {
	pub fn new(runtime: Arc<MasterRuntime>) -> Self {
		Self { runtime }
	}

	pub async fn handle_registry_event(&self, record: &EventRecord) -> HandlerOutcome {
		match &record.event {
			ContractEvent::WorkerRegistered { node_id, amount, .. } =>
				self.on_worker_registered(node_id, *amount).await,
			ContractEvent::StakeDeposited { node_id, amount, proof_id } => {
				debug!(%node_id, amount, proof_id, "stake deposited");
				HandlerOutcome::Done
			},
			// The worker-side bootstrapper reacts to this; nothing to do
			// here beyond advancing.
			ContractEvent::JoinTokenSet { .. } => HandlerOutcome::Done,
			ContractEvent::WorkerStatusChanged { node_id, to, .. } => match to {
				WorkerStatus::Active => {
					info!(%node_id, "worker active, available for assignment");
					self.runtime.note_worker_status(node_id, WorkerStatus::Active);
					HandlerOutcome::Done
				},
				WorkerStatus::Slashed => self.on_worker_slashed(node_id).await,
				status => {
					self.runtime.note_worker_status(node_id, *status);
					HandlerOutcome::Done
				},
			},
			other => {
				debug!(kind = other.kind(), "no registry action for event");
				HandlerOutcome::Done
			},
		}
	}

	/// Gate the stake, then mint and publish a join token. A worker below
	/// the node threshold is slashed rather than admitted.
	async fn on_worker_registered(
		&self,
		node_id: &NodeId,
		amount: StakeAmount,
	) -> HandlerOutcome {
		if amount < self.runtime.tiers.worker_node {
			warn!(%node_id, amount, "stake below worker threshold, slashing");
			return match self
				.runtime
				.submit_admin_tx(ContractCall::SlashWorker { node_id: node_id.clone() })
				.await
			{
				Ok(_) => HandlerOutcome::Done,
				// The record moved on without us (e.g. already slashed or
				// withdrawn); the chain state is the outcome.
				Err(ChainClientError::ContractAbort(code)) =>
					HandlerOutcome::Permanent(format!("slash rejected: {code}")),
				Err(error) => {
					warn!(%node_id, %error, "could not slash underfunded worker");
					HandlerOutcome::RetryLater(HANDLER_RETRY_COOLDOWN)
				},
			}
		}

		let token = self.runtime.minter.mint(node_id);
		self.runtime
			.tokens
			.lock()
			.expect("token lock poisoned")
			.rotate(node_id.clone(), token.clone());

		match self
			.runtime
			.submit_admin_tx(ContractCall::SetJoinToken {
				node_id: node_id.clone(),
				token: token.as_str().as_bytes().to_vec(),
			})
			.await
		{
			Ok(_) => {
				info!(%node_id, "join token issued");
				metrics::JOIN_TOKENS_ISSUED.inc();
				HandlerOutcome::Done
			},
			// A state race (the worker was activated, slashed or withdrawn
			// in the meantime). The worker must re-initiate; do not retry.
			Err(ChainClientError::ContractAbort(code)) =>
				HandlerOutcome::Permanent(format!("set_join_token rejected: {code}")),
			Err(error) => {
				warn!(%node_id, %error, "could not publish join token");
				HandlerOutcome::RetryLater(HANDLER_RETRY_COOLDOWN)
			},
		}
	}

	/// Revoke the slashed worker's token and evict its node object from the
	/// cluster. Eviction is best effort; the authoritative rejection is the
	/// revoked token.
	async fn on_worker_slashed(&self, node_id: &NodeId) -> HandlerOutcome {
		self.runtime.tokens.lock().expect("token lock poisoned").revoke_current(node_id);
		self.runtime.note_worker_status(node_id, WorkerStatus::Slashed);
		metrics::WORKERS_SLASHED.inc();

		match self.runtime.kube.evict_node(node_id).await {
			Ok(response) if response.is_success() => {
				info!(%node_id, "evicted slashed worker from cluster");
			},
			Ok(response) => {
				// 404 just means the node never joined or already left.
				debug!(%node_id, status = response.status, "node eviction returned non-success");
			},
			Err(error) => {
				warn!(%node_id, %error, "could not reach orchestrator to evict slashed worker");
			},
		}
		HandlerOutcome::Done
	}

	/// Scheduler-partition events that need bookkeeping only.
	pub fn note_scheduler_event(&self, record: &EventRecord) {
		match &record.event {
			ContractEvent::WorkerAssigned { request_id, node_id } => {
				debug!(%request_id, %node_id, "request assigned");
			},
			ContractEvent::K8sResponseStored { request_id, status_code, success } => {
				debug!(%request_id, status_code, success, "response stored on-chain");
			},
			other => {
				debug!(kind = other.kind(), "no scheduler action for event");
			},
		}
	}
}
