//! Prometheus metrics for the engine, served on their own port so the
//! observability surface stays off the authenticated master API.

use crate::settings;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::net::IpAddr;
use tracing::info;
use utilities::task_scope;
use warp::Filter;

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	pub static ref EVENTS_PROCESSED: IntCounterVec = IntCounterVec::new(
		Opts::new("ck_events_processed", "Contract events fully processed, by module and kind"),
		&["module", "kind"]
	)
	.expect("metric is well formed");
	pub static ref REQUEST_EXECUTIONS: IntCounterVec = IntCounterVec::new(
		Opts::new("ck_request_executions", "API request executions, by outcome"),
		&["outcome"]
	)
	.expect("metric is well formed");
	pub static ref JOIN_TOKENS_ISSUED: IntCounter =
		IntCounter::new("ck_join_tokens_issued", "Join tokens minted and published on-chain")
			.expect("metric is well formed");
	pub static ref WORKERS_SLASHED: IntCounter =
		IntCounter::new("ck_workers_slashed", "Slashing events observed")
			.expect("metric is well formed");
	pub static ref HEARTBEATS: IntCounterVec = IntCounterVec::new(
		Opts::new("ck_heartbeats", "Worker heartbeats received, by verdict"),
		&["verdict"]
	)
	.expect("metric is well formed");
}

pub fn register_metrics() {
	for collector in [
		Box::new(EVENTS_PROCESSED.clone()) as Box<dyn prometheus::core::Collector>,
		Box::new(REQUEST_EXECUTIONS.clone()),
		Box::new(JOIN_TOKENS_ISSUED.clone()),
		Box::new(WORKERS_SLASHED.clone()),
		Box::new(HEARTBEATS.clone()),
	] {
		// Double registration only happens in tests that rebuild the stack.
		let _ = REGISTRY.register(collector);
	}
}

#[tracing::instrument(name = "prometheus-metrics", skip_all)]
pub async fn start(
	scope: &task_scope::Scope<'_, anyhow::Error>,
	prometheus_settings: &settings::Prometheus,
) -> Result<(), anyhow::Error> {
	info!("Starting");
	const PATH: &str = "metrics";

	let future = warp::serve(
		warp::any().and(warp::path(PATH)).and(warp::path::end()).map(metrics_handler),
	)
	.bind((prometheus_settings.hostname.parse::<IpAddr>()?, prometheus_settings.port));

	scope.spawn_weak(async move {
		future.await;
		Ok(())
	});

	Ok(())
}

fn metrics_handler() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();

	let mut buffer = Vec::new();
	if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!("could not encode metrics: {}", e);
	};
	String::from_utf8(buffer).unwrap_or_default()
}
