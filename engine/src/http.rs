//! The master's HTTP surface: liveness, heartbeat ingest and the
//! observability endpoints. Heartbeats authenticate with the HMAC join
//! token; everything mutating stays off this surface.

use crate::{
	constants::HEARTBEAT_CHAIN_RECORD_INTERVAL,
	metrics,
	runtime::MasterRuntime,
};
use ck_admission::token::JoinToken;
use ck_contract::ContractCall;
use ck_primitives::{unix_time_now, EpochSeconds, NodeId};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::{info, warn};
use utilities::task_scope::Scope;
use warp::{http::StatusCode, Filter};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceUsage {
	pub cpu_millis: u64,
	pub memory_bytes: u64,
	pub running_workloads: u64,
}

/// What a worker posts every heartbeat interval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
	pub node_id: NodeId,
	pub token: String,
	pub usage: ResourceUsage,
	pub timestamp: EpochSeconds,
}

#[derive(Deserialize)]
struct ViewCallBody {
	function: String,
	#[serde(default)]
	args: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
}

pub async fn start(
	scope: &Scope<'_, anyhow::Error>,
	runtime: Arc<MasterRuntime>,
) -> anyhow::Result<()> {
	let bind: SocketAddr = runtime.settings.master.http_bind.parse()?;
	let (addr, server) = warp::serve(routes(runtime)).try_bind_ephemeral(bind)?;
	info!(%addr, "master http surface listening");

	scope.spawn_weak(async move {
		server.await;
		Ok(())
	});
	Ok(())
}

pub fn routes(
	runtime: Arc<MasterRuntime>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
	let with_runtime = {
		let runtime = runtime.clone();
		warp::any().map(move || runtime.clone())
	};

	let healthz = warp::path("healthz").and(warp::path::end()).and(warp::get()).map(|| "OK");

	let heartbeat = warp::path!("api" / "workers" / String / "heartbeat")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_runtime.clone())
		.and_then(handle_heartbeat);

	let nodes = warp::path!("api" / "nodes")
		.and(warp::get())
		.and(with_runtime.clone())
		.and_then(handle_nodes);

	let history = warp::path!("api" / "transactions" / "history")
		.and(warp::get())
		.and(with_runtime.clone())
		.and_then(handle_history);

	let contract_call = warp::path!("api" / "contract" / "call")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_runtime)
		.and_then(handle_contract_call);

	healthz.or(heartbeat).or(nodes).or(history).or(contract_call)
}

async fn handle_heartbeat(
	node_id: String,
	payload: HeartbeatPayload,
	runtime: Arc<MasterRuntime>,
) -> Result<impl warp::Reply, warp::Rejection> {
	let node_id = NodeId(node_id);

	// The path and the signed payload must agree on the claimed identity.
	if payload.node_id != node_id {
		metrics::HEARTBEATS.with_label_values(&["rejected"]).inc();
		return Ok(warp::reply::with_status(
			warp::reply::json(&ErrorBody { error: "node id mismatch".to_string() }),
			StatusCode::UNAUTHORIZED,
		))
	}

	let token = JoinToken::from(payload.token.clone());
	let verdict = runtime
		.tokens
		.lock()
		.expect("token lock poisoned")
		.validate(&runtime.minter, &node_id, &token);
	if let Err(error) = verdict {
		metrics::HEARTBEATS.with_label_values(&["rejected"]).inc();
		warn!(%node_id, %error, "rejecting heartbeat");
		return Ok(warp::reply::with_status(
			warp::reply::json(&ErrorBody { error: error.to_string() }),
			StatusCode::UNAUTHORIZED,
		))
	}

	metrics::HEARTBEATS.with_label_values(&["accepted"]).inc();
	runtime.note_heartbeat(&node_id, payload.usage);
	mirror_heartbeat_on_chain(&runtime, &node_id);

	Ok(warp::reply::with_status(
		warp::reply::json(&serde_json::json!({ "status": "ok" })),
		StatusCode::OK,
	))
}

/// The chain only needs heartbeat freshness at scheduling granularity, so
/// the on-chain mirror is throttled per node.
fn mirror_heartbeat_on_chain(runtime: &Arc<MasterRuntime>, node_id: &NodeId) {
	let due = {
		let mut marks = runtime.heartbeat_marks.lock().expect("marks lock poisoned");
		match marks.get(node_id) {
			Some(last) if last.elapsed() < HEARTBEAT_CHAIN_RECORD_INTERVAL => false,
			_ => {
				marks.insert(node_id.clone(), Instant::now());
				true
			},
		}
	};
	if !due {
		return
	}

	let runtime = runtime.clone();
	let node_id = node_id.clone();
	tokio::spawn(async move {
		if let Err(error) = runtime
			.submit_admin_tx(ContractCall::RecordHeartbeat {
				node_id: node_id.clone(),
				epoch: unix_time_now(),
			})
			.await
		{
			warn!(%node_id, %error, "could not mirror heartbeat on-chain");
		}
	});
}

async fn handle_nodes(runtime: Arc<MasterRuntime>) -> Result<impl warp::Reply, warp::Rejection> {
	Ok(warp::reply::json(&runtime.node_views()))
}

async fn handle_history(runtime: Arc<MasterRuntime>) -> Result<impl warp::Reply, warp::Rejection> {
	Ok(warp::reply::json(&runtime.tx_history()))
}

async fn handle_contract_call(
	body: ViewCallBody,
	runtime: Arc<MasterRuntime>,
) -> Result<impl warp::Reply, warp::Rejection> {
	match runtime.chain.call_view(&body.function, body.args).await {
		Ok(value) => Ok(warp::reply::with_status(warp::reply::json(&value), StatusCode::OK)),
		Err(error) => Ok(warp::reply::with_status(
			warp::reply::json(&ErrorBody { error: error.to_string() }),
			StatusCode::BAD_GATEWAY,
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		chain_client::MockChainApi,
		db::PersistentStateDB,
		kube::MockKubeApi,
		settings::test_utils::new_test_settings,
	};
	use ck_contract::TxReceipt;
	use ck_primitives::TxDigest;
	use utilities::testing::new_temp_directory_with_nonexistent_file;

	fn runtime_with_chain(chain: MockChainApi) -> (tempfile::TempDir, Arc<MasterRuntime>) {
		let (dir, db_file) = new_temp_directory_with_nonexistent_file();
		let db = Arc::new(PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap());
		let runtime = MasterRuntime::with_hmac_key(
			new_test_settings(),
			Arc::new(chain),
			Arc::new(MockKubeApi::new()),
			db,
			b"test-hmac-key".to_vec(),
		)
		.unwrap();
		(dir, runtime)
	}

	fn heartbeat_body(runtime: &Arc<MasterRuntime>, node: &str) -> HeartbeatPayload {
		let node_id = NodeId::from(node);
		let token = runtime.minter.mint(&node_id);
		runtime.tokens.lock().unwrap().rotate(node_id.clone(), token.clone());
		HeartbeatPayload {
			node_id,
			token: token.into_string(),
			usage: ResourceUsage { cpu_millis: 100, memory_bytes: 1 << 30, running_workloads: 2 },
			timestamp: unix_time_now(),
		}
	}

	#[tokio::test]
	async fn healthz_needs_no_auth() {
		let (_dir, runtime) = runtime_with_chain(MockChainApi::new());
		let response =
			warp::test::request().path("/healthz").reply(&routes(runtime)).await;
		assert_eq!(response.status(), 200);
		assert_eq!(response.body(), "OK");
	}

	#[tokio::test]
	async fn valid_heartbeat_is_accepted_and_visible_in_nodes() {
		let mut chain = MockChainApi::new();
		chain.expect_submit_transaction().returning(|_| {
			Ok(TxReceipt { digest: TxDigest([1; 32]), block_height: 1, events: vec![] })
		});
		let (_dir, runtime) = runtime_with_chain(chain);
		let body = heartbeat_body(&runtime, "w1");

		let routes = routes(runtime.clone());
		let response = warp::test::request()
			.method("POST")
			.path("/api/workers/w1/heartbeat")
			.json(&body)
			.reply(&routes)
			.await;
		assert_eq!(response.status(), 200);

		let nodes = warp::test::request().path("/api/nodes").reply(&routes).await;
		let views: Vec<serde_json::Value> =
			serde_json::from_slice(nodes.body()).unwrap();
		assert_eq!(views.len(), 1);
		assert_eq!(views[0]["node_id"], "w1");
	}

	#[tokio::test]
	async fn forged_token_is_rejected_with_401() {
		let (_dir, runtime) = runtime_with_chain(MockChainApi::new());
		let mut body = heartbeat_body(&runtime, "w1");
		body.token = "00ff.1234.deadbeef".to_string();

		let response = warp::test::request()
			.method("POST")
			.path("/api/workers/w1/heartbeat")
			.json(&body)
			.reply(&routes(runtime))
			.await;
		assert_eq!(response.status(), 401);
	}

	#[tokio::test]
	async fn token_for_another_node_is_rejected() {
		let (_dir, runtime) = runtime_with_chain(MockChainApi::new());
		// Token minted for w2, presented on w1's path.
		let mut body = heartbeat_body(&runtime, "w2");
		body.node_id = NodeId::from("w1");

		let response = warp::test::request()
			.method("POST")
			.path("/api/workers/w1/heartbeat")
			.json(&body)
			.reply(&routes(runtime))
			.await;
		assert_eq!(response.status(), 401);
	}

	#[tokio::test]
	async fn contract_call_passthrough_proxies_views() {
		let mut chain = MockChainApi::new();
		chain
			.expect_call_view()
			.withf(|function, _| function == "get_active_request_count")
			.returning(|_, _| Ok(serde_json::json!(3)));
		let (_dir, runtime) = runtime_with_chain(chain);

		let response = warp::test::request()
			.method("POST")
			.path("/api/contract/call")
			.json(&serde_json::json!({ "function": "get_active_request_count" }))
			.reply(&routes(runtime))
			.await;
		assert_eq!(response.status(), 200);
		assert_eq!(response.body(), "3");
	}
}
