//! The orchestrator-side client: the master speaks the cluster API's
//! native HTTP surface with an admin bearer credential.

pub mod manifest;

use crate::{constants::KUBE_REQUEST_TIMEOUT, settings::OrchestratorSettings};
use anyhow::Context;
use async_trait::async_trait;
use ck_primitives::{HttpMethod, NodeId};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl KubeResponse {
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

/// Only reachability problems are errors; an HTTP response of any status is
/// a result, recorded verbatim on-chain.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KubeError {
	#[error("orchestrator unreachable: {0}")]
	Transient(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync + 'static {
	async fn execute(
		&self,
		method: HttpMethod,
		path: &str,
		body: Option<Vec<u8>>,
	) -> Result<KubeResponse, KubeError>;

	/// Remove a node object from the cluster (used when a worker is
	/// slashed).
	async fn evict_node(&self, node_id: &NodeId) -> Result<KubeResponse, KubeError>;
}

pub struct KubeHttpClient {
	client: reqwest::Client,
	base_url: String,
	credential: String,
}

impl KubeHttpClient {
	pub fn new(settings: &OrchestratorSettings) -> anyhow::Result<Self> {
		let credential = std::fs::read_to_string(&settings.admin_credential_file)
			.with_context(|| {
				format!(
					"could not read orchestrator credential {}",
					settings.admin_credential_file.display()
				)
			})?
			.trim()
			.to_string();

		let client = reqwest::Client::builder()
			.timeout(KUBE_REQUEST_TIMEOUT)
			.build()
			.context("could not build orchestrator http client")?;

		Ok(Self {
			client,
			base_url: settings.endpoint.trim_end_matches('/').to_string(),
			credential,
		})
	}

	fn url_for(&self, path: &str) -> String {
		format!("{}/{}", self.base_url, path.trim_start_matches('/'))
	}
}

#[async_trait]
impl KubeApi for KubeHttpClient {
	async fn execute(
		&self,
		method: HttpMethod,
		path: &str,
		body: Option<Vec<u8>>,
	) -> Result<KubeResponse, KubeError> {
		let url = self.url_for(path);
		debug!(%method, %url, "orchestrator call");

		let reqwest_method = match method {
			HttpMethod::Get => reqwest::Method::GET,
			HttpMethod::Post => reqwest::Method::POST,
			HttpMethod::Put => reqwest::Method::PUT,
			HttpMethod::Patch => reqwest::Method::PATCH,
			HttpMethod::Delete => reqwest::Method::DELETE,
		};

		let mut request = self
			.client
			.request(reqwest_method, &url)
			.bearer_auth(&self.credential)
			.header(reqwest::header::ACCEPT, "application/json");
		if let Some(body) = body {
			request = request
				.header(reqwest::header::CONTENT_TYPE, "application/json")
				.body(body);
		}

		let response =
			request.send().await.map_err(|e| KubeError::Transient(e.to_string()))?;

		let status = response.status().as_u16();
		let headers = response
			.headers()
			.iter()
			.filter_map(|(name, value)| {
				value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
			})
			.collect();
		let body = response
			.bytes()
			.await
			.map_err(|e| KubeError::Transient(e.to_string()))?
			.to_vec();

		Ok(KubeResponse { status, headers, body })
	}

	async fn evict_node(&self, node_id: &NodeId) -> Result<KubeResponse, KubeError> {
		self.execute(HttpMethod::Delete, &format!("/api/v1/nodes/{node_id}"), None).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn url_join_normalizes_slashes() {
		let client = KubeHttpClient {
			client: reqwest::Client::new(),
			base_url: "https://cluster:6443".to_string(),
			credential: "t".to_string(),
		};
		assert_eq!(
			client.url_for("/api/v1/namespaces/default/pods"),
			"https://cluster:6443/api/v1/namespaces/default/pods"
		);
		assert_eq!(client.url_for("api/v1/nodes"), "https://cluster:6443/api/v1/nodes");
	}

	#[test]
	fn success_statuses() {
		let ok = KubeResponse { status: 201, headers: vec![], body: vec![] };
		let not_found = KubeResponse { status: 404, headers: vec![], body: vec![] };
		assert!(ok.is_success());
		assert!(!not_found.is_success());
	}
}
