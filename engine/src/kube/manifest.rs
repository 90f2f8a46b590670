//! Renders orchestrator JSON bodies from the structured fields of an
//! on-chain request record.

use ck_contract::calls::SubmitRequest;
use ck_primitives::{HttpMethod, ResourceKind};
use serde_json::json;

/// The JSON manifest for a pod-shaped request.
pub fn render_pod_manifest(request: &SubmitRequest) -> serde_json::Value {
	let mut container = json!({
		"name": request.container_name,
		"image": request.image,
	});
	if let Some(port) = request.port {
		container["ports"] = json!([{ "containerPort": port }]);
	}

	json!({
		"apiVersion": "v1",
		"kind": "Pod",
		"metadata": {
			"name": request.name,
			"namespace": request.namespace,
			"labels": request.labels,
		},
		"spec": {
			"containers": [container],
		},
	})
}

/// The request body to send to the orchestrator. Structured pod fields win
/// only when no opaque payload was submitted.
pub fn body_for(request: &SubmitRequest) -> Option<Vec<u8>> {
	if !request.payload.is_empty() {
		return Some(request.payload.clone())
	}
	if request.method.is_mutation() &&
		request.method != HttpMethod::Delete &&
		ResourceKind::from_path(&request.path) == ResourceKind::Pods
	{
		return Some(
			serde_json::to_vec(&render_pod_manifest(request)).expect("manifest serializes"),
		)
	}
	None
}

/// The path of the single object a creation request would produce, used to
/// probe for an already-applied effect when re-executing after a crash.
pub fn created_object_path(request: &SubmitRequest) -> Option<String> {
	(request.method == HttpMethod::Post && !request.name.is_empty())
		.then(|| format!("{}/{}", request.path.trim_end_matches('/'), request.name))
}
