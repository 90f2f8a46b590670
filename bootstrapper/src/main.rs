mod agent;
mod bootstrap;
mod settings;

use anyhow::Context;
use bootstrap::Bootstrapper;
use chainkube_engine::chain_client::{rpc::ChainRpcClient, signer::TxSigner};
use clap::Parser;
use futures::FutureExt;
use settings::{BootstrapperOptions, BootstrapperSettings};
use std::sync::Arc;
use tracing::info;
use utilities::task_scope::task_scope;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let settings = BootstrapperSettings::new(BootstrapperOptions::parse())
		.context("Error reading settings")?;

	utilities::init_tracing(std::env::var("CK_LOG_JSON").is_ok());

	info!(
		version = env!("CARGO_PKG_VERSION"),
		node_id = %settings.node_id,
		"starting chainkube bootstrapper"
	);

	let signer = Arc::new(
		TxSigner::from_key_file(&settings.chain.signing_key_file)
			.context("Failed to load stake signing key")?,
	);
	let stake_account = signer.account_id();

	let chain = Arc::new(
		ChainRpcClient::connect(&settings.chain, settings.contract.clone(), signer)
			.await
			.context("Failed to connect to chain")?,
	);

	task_scope(|scope| {
		async move { Bootstrapper::new(settings, chain, stake_account).run(scope).await }
			.boxed()
	})
	.await
}
