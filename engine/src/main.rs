use anyhow::Context;
use chainkube_engine::{
	chain_client::{rpc::ChainRpcClient, signer::TxSigner},
	db::PersistentStateDB,
	http, kube::KubeHttpClient,
	metrics, observer,
	runtime::MasterRuntime,
	settings::{CommandLineOptions, Settings},
};
use clap::Parser;
use futures::FutureExt;
use std::{net::IpAddr, sync::Arc};
use tracing::info;
use utilities::task_scope::{task_scope, Scope};
use warp::Filter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let settings =
		Settings::new(CommandLineOptions::parse()).context("Error reading settings")?;

	utilities::init_tracing(std::env::var("CK_LOG_JSON").is_ok());
	metrics::register_metrics();

	task_scope(|scope| async move { start(scope, settings).await }.boxed()).await
}

async fn start(scope: &Scope<'_, anyhow::Error>, settings: Settings) -> anyhow::Result<()> {
	info!(version = env!("CARGO_PKG_VERSION"), "starting chainkube engine");

	let db = Arc::new(
		PersistentStateDB::open_and_migrate_to_latest(&settings.db_path)
			.context("Failed to open database")?,
	);

	let signer = Arc::new(
		TxSigner::from_key_file(&settings.chain.signing_key_file)
			.context("Failed to load admin signing key")?,
	);
	let chain = Arc::new(
		ChainRpcClient::connect(&settings.chain, settings.contract.clone(), signer)
			.await
			.context("Failed to connect to chain")?,
	);
	let kube =
		Arc::new(KubeHttpClient::new(&settings.orchestrator).context("Failed to build orchestrator client")?);

	let runtime = MasterRuntime::new(settings, chain, kube, db)?;

	if let Some(prometheus_settings) = runtime.settings.prometheus.clone() {
		metrics::start(scope, &prometheus_settings).await?;
	}
	if let Some(health_check) = runtime.settings.health_check.clone() {
		start_health_server(scope, &health_check)?;
	}

	http::start(scope, runtime.clone()).await?;
	observer::start(scope, runtime.clone()).await?;

	// The scope owns every task; returning tears the engine down.
	tokio::signal::ctrl_c().await?;
	info!("shutdown signal received");
	Ok(())
}

/// Plain liveness endpoint on its own port, for infra probes that must not
/// touch the master API surface.
fn start_health_server(
	scope: &Scope<'_, anyhow::Error>,
	health_check: &chainkube_engine::settings::HealthCheck,
) -> anyhow::Result<()> {
	let future = warp::serve(
		warp::path("health").and(warp::path::end()).map(|| "OK"),
	)
	.bind((health_check.hostname.parse::<IpAddr>()?, health_check.port));

	scope.spawn_weak(async move {
		future.await;
		Ok(())
	});
	Ok(())
}
