//! Executes one scheduled API request against the orchestrator and writes
//! the outcome back on-chain. Safe to run any number of times for the same
//! request: the contract's write-once terminal status discards duplicates,
//! and creations probe for an already-applied effect first.

use super::HandlerOutcome;
use crate::{
	chain_client::ChainClientError,
	constants::{
		CHAIN_RETRY_ATTEMPTS, CHAIN_RETRY_INITIAL_DELAY, HANDLER_RETRY_COOLDOWN,
		KUBE_RETRY_ATTEMPTS, KUBE_RETRY_INITIAL_DELAY,
	},
	kube::{manifest, KubeResponse},
	metrics,
	retrier::{with_retries, RetryLimits},
	runtime::MasterRuntime,
};
use ck_admission::{authorize_with_tiers, AdmissionRequest, Verdict};
use ck_contract::{
	calls::SubmitRequest,
	error::AbortCode,
	events::ScheduledRequest,
	scheduler::ApiRequestRecord,
	ContractCall,
};
use ck_primitives::{HttpMethod, NodeId, RequestId, ResourceKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CHAIN_LIMITS: RetryLimits =
	RetryLimits::new(CHAIN_RETRY_INITIAL_DELAY, CHAIN_RETRY_ATTEMPTS);
const KUBE_LIMITS: RetryLimits = RetryLimits::new(KUBE_RETRY_INITIAL_DELAY, KUBE_RETRY_ATTEMPTS);

/// Drives [execute_scheduled] to a terminal outcome, absorbing RetryLater
/// by sleeping and re-running. The dispatcher holds the cursor until this
/// resolves.
pub async fn run_execution(
	runtime: &Arc<MasterRuntime>,
	scheduled: &ScheduledRequest,
) -> HandlerOutcome {
	loop {
		match execute_scheduled(runtime, scheduled).await {
			HandlerOutcome::RetryLater(delay) => {
				warn!(
					request_id = %scheduled.request_id,
					delay_ms = delay.as_millis() as u64,
					"execution deferred, retrying"
				);
				tokio::time::sleep(delay).await;
			},
			outcome => return outcome,
		}
	}
}

async fn execute_scheduled(
	runtime: &Arc<MasterRuntime>,
	scheduled: &ScheduledRequest,
) -> HandlerOutcome {
	let request_id = &scheduled.request_id;

	// The event payload is a summary; the on-chain record is authoritative.
	let record = match with_retries(
		"get-request",
		CHAIN_LIMITS,
		ChainClientError::is_transient,
		|| runtime.chain.get_request(request_id),
	)
	.await
	{
		Ok(Some(record)) => record,
		Ok(None) =>
			return HandlerOutcome::Permanent(format!("no record on-chain for {request_id}")),
		Err(error) => {
			warn!(%request_id, %error, "could not load request record");
			return HandlerOutcome::RetryLater(HANDLER_RETRY_COOLDOWN)
		},
	};

	if record.status.is_terminal() {
		// Crash recovery: a previous run already stored the response.
		debug!(%request_id, "request already terminal, skipping");
		return HandlerOutcome::Done
	}

	// Admission re-check with current stake and workload.
	match admission_verdict(runtime, &record).await {
		Ok(Verdict::Allow) => {},
		Ok(Verdict::Deny(reason)) => {
			info!(%request_id, %reason, "admission denied");
			metrics::REQUEST_EXECUTIONS.with_label_values(&["denied"]).inc();
			let body = serde_json::to_vec(&serde_json::json!({
				"error": "admission denied",
				"reason": reason.to_string(),
			}))
			.expect("diagnostic serializes");
			return store_response(
				runtime,
				request_id,
				KubeResponse { status: 403, headers: vec![], body },
				false,
			)
			.await
		},
		Ok(Verdict::RateLimit(cooldown)) => {
			debug!(%request_id, "requester over workload budget, cooling down");
			return HandlerOutcome::RetryLater(cooldown)
		},
		Err(outcome) => return outcome,
	}

	let response = run_against_orchestrator(runtime, &record.request).await;
	let success = response.is_success();
	metrics::REQUEST_EXECUTIONS
		.with_label_values(&[if success { "completed" } else { "failed" }])
		.inc();
	store_response(runtime, request_id, response, success).await
}

/// Maps the record through the admission gate. A requester without a worker
/// record was admitted by the contract's allowlist; the gate has nothing to
/// add for it.
async fn admission_verdict(
	runtime: &Arc<MasterRuntime>,
	record: &ApiRequestRecord,
) -> Result<Verdict, HandlerOutcome> {
	let worker = match with_retries(
		"get-requester-worker",
		CHAIN_LIMITS,
		ChainClientError::is_transient,
		|| runtime.chain.get_active_worker_of(&record.request.requester),
	)
	.await
	{
		Ok(worker) => worker,
		Err(error) => {
			warn!(request_id = %record.request_id, %error, "could not load requester's worker record");
			return Err(HandlerOutcome::RetryLater(HANDLER_RETRY_COOLDOWN))
		},
	};

	Ok(match worker {
		Some(worker) => authorize_with_tiers(
			&AdmissionRequest {
				method: record.request.method,
				resource: ResourceKind::from_path(&record.request.path),
				target_node: target_node_of(&record.request.path),
				own_node: Some(worker.node_id.clone()),
				current_workload: worker.workload,
			},
			worker.stake,
			&runtime.tiers,
		),
		None => Verdict::Allow,
	})
}

fn target_node_of(path: &str) -> Option<NodeId> {
	let mut segments = path.split('/').filter(|s| !s.is_empty());
	while let Some(segment) = segments.next() {
		if segment == "nodes" {
			return segments.next().map(NodeId::from)
		}
	}
	None
}

/// One orchestrator round trip, with the idempotency probe for creations
/// and the synthetic 503 when the retry budget is spent.
async fn run_against_orchestrator(
	runtime: &Arc<MasterRuntime>,
	request: &SubmitRequest,
) -> KubeResponse {
	// If a crashed previous run already created the object, report what
	// exists rather than colliding with it.
	if let Some(item_path) = manifest::created_object_path(request) {
		if let Ok(existing) =
			runtime.kube.execute(HttpMethod::Get, &item_path, None).await
		{
			if existing.is_success() {
				debug!(path = %item_path, "object already present, reusing");
				return existing
			}
		}
	}

	let body = manifest::body_for(request);
	match with_retries("orchestrator", KUBE_LIMITS, |_| true, || {
		runtime.kube.execute(request.method, &request.path, body.clone())
	})
	.await
	{
		Ok(response) => response,
		Err(error) => {
			warn!(path = %request.path, %error, "orchestrator unreachable, recording synthetic 503");
			let body = serde_json::to_vec(&serde_json::json!({
				"error": "orchestrator unreachable",
				"detail": error.to_string(),
			}))
			.expect("diagnostic serializes");
			KubeResponse { status: 503, headers: vec![], body }
		},
	}
}

/// Writes the terminal response on-chain. A duplicate-terminal rejection is
/// success: someone (possibly an earlier run of this process) already
/// recorded the outcome.
async fn store_response(
	runtime: &Arc<MasterRuntime>,
	request_id: &RequestId,
	response: KubeResponse,
	success: bool,
) -> HandlerOutcome {
	match runtime
		.submit_admin_tx(ContractCall::StoreK8sResponse {
			request_id: request_id.clone(),
			status_code: response.status,
			headers: response.headers,
			body: response.body,
			success,
		})
		.await
	{
		Ok(_) => {
			info!(%request_id, status = response.status, success, "response stored");
			HandlerOutcome::Done
		},
		Err(ChainClientError::ContractAbort(AbortCode::RequestTerminal)) => {
			debug!(%request_id, "response already stored, skipping duplicate");
			HandlerOutcome::Done
		},
		Err(ChainClientError::ContractAbort(code)) =>
			HandlerOutcome::Permanent(format!("store_k8s_response rejected: {code}")),
		Err(error) => {
			warn!(%request_id, %error, "could not store response on-chain");
			HandlerOutcome::RetryLater(HANDLER_RETRY_COOLDOWN)
		},
	}
}
