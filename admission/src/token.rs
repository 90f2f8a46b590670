//! Join-token minting and verification.
//!
//! A token is `hex(nonce) . issuance_epoch . hex(mac)` where
//! `mac = HMAC-SHA256(master_key, node_id || nonce || issuance_epoch)`.
//! The MAC covers the node id, so a token presented for a different node
//! never verifies. Rotation revokes the previously minted token for the
//! node.

use ck_primitives::{unix_time_now, EpochSeconds, NodeId};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct JoinToken(String);

impl JoinToken {
	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl From<String> for JoinToken {
	fn from(s: String) -> Self {
		Self(s)
	}
}

impl std::fmt::Debug for JoinToken {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		// Tokens are credentials; never log them whole.
		write!(f, "JoinToken({}…)", &self.0[..self.0.len().min(8)])
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
	#[error("token is not in nonce.epoch.mac form")]
	Malformed,
	#[error("token mac does not verify for this node id")]
	BadMac,
	#[error("token has been revoked")]
	Revoked,
	#[error("token is not the current token for this node")]
	Superseded,
}

pub struct JoinTokenMinter {
	key: Vec<u8>,
}

impl JoinTokenMinter {
	pub fn new(key: impl Into<Vec<u8>>) -> Self {
		Self { key: key.into() }
	}

	pub fn mint(&self, node_id: &NodeId) -> JoinToken {
		let mut nonce = [0u8; NONCE_LEN];
		rand::thread_rng().fill_bytes(&mut nonce);
		self.mint_with(node_id, &nonce, unix_time_now())
	}

	fn mint_with(&self, node_id: &NodeId, nonce: &[u8; NONCE_LEN], epoch: EpochSeconds) -> JoinToken {
		let mac = self.mac_for(node_id, nonce, epoch);
		JoinToken(format!("{}.{}.{}", hex::encode(nonce), epoch, hex::encode(mac)))
	}

	fn mac_for(&self, node_id: &NodeId, nonce: &[u8], epoch: EpochSeconds) -> Vec<u8> {
		let mut mac =
			HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
		mac.update(node_id.as_str().as_bytes());
		mac.update(nonce);
		mac.update(&epoch.to_be_bytes());
		mac.finalize().into_bytes().to_vec()
	}

	/// Checks that `token` was minted by this key for exactly `node_id`.
	pub fn verify(&self, node_id: &NodeId, token: &JoinToken) -> Result<(), TokenError> {
		let mut parts = token.0.split('.');
		let (nonce_hex, epoch_str, mac_hex) = match (parts.next(), parts.next(), parts.next(), parts.next())
		{
			(Some(n), Some(e), Some(m), None) => (n, e, m),
			_ => return Err(TokenError::Malformed),
		};
		let nonce = hex::decode(nonce_hex).map_err(|_| TokenError::Malformed)?;
		let epoch: EpochSeconds = epoch_str.parse().map_err(|_| TokenError::Malformed)?;
		let mac = hex::decode(mac_hex).map_err(|_| TokenError::Malformed)?;

		let mut expected =
			HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
		expected.update(node_id.as_str().as_bytes());
		expected.update(&nonce);
		expected.update(&epoch.to_be_bytes());
		expected.verify_slice(&mac).map_err(|_| TokenError::BadMac)
	}
}

/// Master-local record of which token is current per node, plus everything
/// revoked by rotation. Callers guard it with the runtime's mutex.
#[derive(Default)]
pub struct TokenRegistry {
	current: HashMap<NodeId, JoinToken>,
	revoked: HashSet<JoinToken>,
}

impl TokenRegistry {
	/// Record a freshly minted token, revoking the node's previous one.
	pub fn rotate(&mut self, node_id: NodeId, token: JoinToken) {
		if let Some(previous) = self.current.insert(node_id, token) {
			self.revoked.insert(previous);
		}
	}

	/// A token is valid iff its MAC verifies for the node, it has not been
	/// revoked, and it is the node's current token.
	pub fn validate(
		&self,
		minter: &JoinTokenMinter,
		node_id: &NodeId,
		token: &JoinToken,
	) -> Result<(), TokenError> {
		minter.verify(node_id, token)?;
		if self.revoked.contains(token) {
			return Err(TokenError::Revoked)
		}
		match self.current.get(node_id) {
			Some(current) if current == token => Ok(()),
			_ => Err(TokenError::Superseded),
		}
	}

	/// Revoke a node's current token without minting a replacement. Used
	/// when the worker is slashed.
	pub fn revoke_current(&mut self, node_id: &NodeId) {
		if let Some(token) = self.current.remove(node_id) {
			self.revoked.insert(token);
		}
	}

	pub fn current_for(&self, node_id: &NodeId) -> Option<&JoinToken> {
		self.current.get(node_id)
	}
}
