//! Primitive types shared between the on-chain contract model, the master
//! engine and the worker bootstrapper.

use serde::{Deserialize, Serialize};
use std::{
	fmt,
	str::FromStr,
	time::{SystemTime, UNIX_EPOCH},
};

/// Stake amounts are denominated in the chain's smallest currency unit.
pub type StakeAmount = u64;

/// Finalized chain height.
pub type BlockHeight = u64;

/// Position of an event within the block that produced it.
pub type IntraBlockIndex = u32;

/// Seconds since the unix epoch, as recorded on-chain.
pub type EpochSeconds = u64;

pub fn unix_time_now() -> EpochSeconds {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_secs()
}

/// A chain principal. 32 bytes, displayed as 0x-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
	pub fn to_hex(&self) -> String {
		format!("0x{}", hex::encode(self.0))
	}

	pub fn from_hex(s: &str) -> Result<Self, PrimitiveError> {
		let stripped = s.strip_prefix("0x").unwrap_or(s);
		let bytes = hex::decode(stripped).map_err(|_| PrimitiveError::InvalidAccountId)?;
		Ok(Self(bytes.try_into().map_err(|_| PrimitiveError::InvalidAccountId)?))
	}
}

impl fmt::Display for AccountId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for AccountId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "AccountId({})", self.to_hex())
	}
}

/// The digest of the transaction that produced an event. Used as the
/// idempotency key for master-side processing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxDigest(pub [u8; 32]);

impl TxDigest {
	pub fn digest_of(bytes: &[u8]) -> Self {
		use sha2::{Digest, Sha256};
		Self(Sha256::digest(bytes).into())
	}

	pub fn to_hex(&self) -> String {
		format!("0x{}", hex::encode(self.0))
	}
}

impl fmt::Display for TxDigest {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for TxDigest {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "TxDigest({})", self.to_hex())
	}
}

/// Identifier chosen by a worker operator at registration. Never reused,
/// even after the record is tombstoned.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({})", self.0)
	}
}

impl From<&str> for NodeId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Content-addressed identifier of an API request record: the hex digest of
/// the request fields at submission time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
	pub fn derive(requester: &AccountId, method: HttpMethod, path: &str, submitted_at: EpochSeconds) -> Self {
		let preimage =
			format!("{}|{}|{}|{}", requester.to_hex(), method.as_str(), path, submitted_at);
		Self(TxDigest::digest_of(preimage.as_bytes()).to_hex())
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl fmt::Debug for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "RequestId({})", self.0)
	}
}

/// Durable marker of master progress through the event stream.
///
/// Ordered by (block height, intra-block index). The cursor only ever moves
/// forward; an event at or below the cursor has already been fully handled.
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EventCursor {
	pub block_height: BlockHeight,
	pub intra_block: IntraBlockIndex,
}

impl EventCursor {
	pub fn new(block_height: BlockHeight, intra_block: IntraBlockIndex) -> Self {
		Self { block_height, intra_block }
	}
}

impl fmt::Display for EventCursor {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.block_height, self.intra_block)
	}
}

/// Admission status of a worker record.
///
/// Transitions are monotone except Active -> Slashed. Withdrawn records are
/// tombstones: the node id is retained and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
	Pending,
	Active,
	Slashed,
	Withdrawn,
}

impl fmt::Display for WorkerStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let s = match self {
			WorkerStatus::Pending => "Pending",
			WorkerStatus::Active => "Active",
			WorkerStatus::Slashed => "Slashed",
			WorkerStatus::Withdrawn => "Withdrawn",
		};
		write!(f, "{s}")
	}
}

/// Lifecycle of an on-chain API request record. Terminal statuses are
/// write-once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
	Pending,
	Assigned,
	Completed,
	Failed,
}

impl RequestStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, RequestStatus::Completed | RequestStatus::Failed)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
	Get,
	Post,
	Put,
	Patch,
	Delete,
}

impl HttpMethod {
	pub fn as_str(&self) -> &'static str {
		match self {
			HttpMethod::Get => "GET",
			HttpMethod::Post => "POST",
			HttpMethod::Put => "PUT",
			HttpMethod::Patch => "PATCH",
			HttpMethod::Delete => "DELETE",
		}
	}

	pub fn is_mutation(&self) -> bool {
		!matches!(self, HttpMethod::Get)
	}
}

impl FromStr for HttpMethod {
	type Err = PrimitiveError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"GET" => Ok(HttpMethod::Get),
			"POST" => Ok(HttpMethod::Post),
			"PUT" => Ok(HttpMethod::Put),
			"PATCH" => Ok(HttpMethod::Patch),
			"DELETE" => Ok(HttpMethod::Delete),
			other => Err(PrimitiveError::UnknownMethod(other.to_string())),
		}
	}
}

impl fmt::Display for HttpMethod {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Kubernetes resource kinds the admission table distinguishes. Anything
/// else is carried verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
	Pods,
	Services,
	Nodes,
	Deployments,
	Namespaces,
	Other(String),
}

impl ResourceKind {
	/// Extracts the resource kind from an API path such as
	/// `/api/v1/namespaces/default/pods/nginx`.
	pub fn from_path(path: &str) -> Self {
		// The resource collection is the last even-positioned segment after
		// the api group prefix; scanning for known collection names is
		// sufficient for the supported surface.
		for segment in path.split('/').rev() {
			match segment {
				"pods" => return ResourceKind::Pods,
				"services" => return ResourceKind::Services,
				"nodes" => return ResourceKind::Nodes,
				"deployments" => return ResourceKind::Deployments,
				"namespaces" => return ResourceKind::Namespaces,
				_ => {},
			}
		}
		ResourceKind::Other(
			path.rsplit('/').find(|s| !s.is_empty()).unwrap_or_default().to_string(),
		)
	}

	pub fn as_str(&self) -> &str {
		match self {
			ResourceKind::Pods => "pods",
			ResourceKind::Services => "services",
			ResourceKind::Nodes => "nodes",
			ResourceKind::Deployments => "deployments",
			ResourceKind::Namespaces => "namespaces",
			ResourceKind::Other(s) => s,
		}
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
	#[error("invalid account id: expected 32 hex-encoded bytes")]
	InvalidAccountId,
	#[error("unknown http method {0}")]
	UnknownMethod(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn account_id_hex_round_trip() {
		let id = AccountId([7u8; 32]);
		assert_eq!(AccountId::from_hex(&id.to_hex()).unwrap(), id);
		assert!(AccountId::from_hex("0xdeadbeef").is_err());
	}

	#[test]
	fn cursor_ordering_is_block_then_index() {
		assert!(EventCursor::new(2, 0) > EventCursor::new(1, 9));
		assert!(EventCursor::new(3, 4) > EventCursor::new(3, 3));
		assert_eq!(EventCursor::new(3, 4), EventCursor::new(3, 4));
	}

	#[test]
	fn resource_kind_from_api_paths() {
		assert_eq!(
			ResourceKind::from_path("/api/v1/namespaces/default/pods/nginx-demo"),
			ResourceKind::Pods
		);
		assert_eq!(ResourceKind::from_path("/api/v1/nodes/w1"), ResourceKind::Nodes);
		assert_eq!(ResourceKind::from_path("/api/v1/services"), ResourceKind::Services);
		assert_eq!(
			ResourceKind::from_path("/apis/batch/v1/cronjobs"),
			ResourceKind::Other("cronjobs".to_string())
		);
	}

	#[test]
	fn request_id_is_stable_for_same_inputs() {
		let requester = AccountId([1u8; 32]);
		let a = RequestId::derive(&requester, HttpMethod::Post, "/api/v1/pods", 1000);
		let b = RequestId::derive(&requester, HttpMethod::Post, "/api/v1/pods", 1000);
		let c = RequestId::derive(&requester, HttpMethod::Post, "/api/v1/pods", 1001);
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn terminal_statuses() {
		assert!(!RequestStatus::Pending.is_terminal());
		assert!(!RequestStatus::Assigned.is_terminal());
		assert!(RequestStatus::Completed.is_terminal());
		assert!(RequestStatus::Failed.is_terminal());
	}
}
