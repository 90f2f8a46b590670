use anyhow::Context;
use ck_primitives::AccountId;
use ed25519_dalek::{Signature, Signer, SigningKey};
use std::path::Path;

/// An ed25519 signing identity. The account id is the verifying key.
pub struct TxSigner {
	key: SigningKey,
	account: AccountId,
}

impl TxSigner {
	pub fn new(key: SigningKey) -> Self {
		let account = AccountId(key.verifying_key().to_bytes());
		Self { key, account }
	}

	pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
		let bytes = hex::decode(hex_key.trim().trim_start_matches("0x"))
			.context("signing key is not valid hex")?;
		let bytes: [u8; 32] =
			bytes.try_into().map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
		Ok(Self::new(SigningKey::from_bytes(&bytes)))
	}

	pub fn from_key_file(path: &Path) -> anyhow::Result<Self> {
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("could not read signing key file {}", path.display()))?;
		Self::from_hex(&contents)
	}

	pub fn generate() -> Self {
		Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
	}

	pub fn account_id(&self) -> AccountId {
		self.account
	}

	pub fn sign(&self, payload: &[u8]) -> Signature {
		self.key.sign(payload)
	}
}

impl std::fmt::Debug for TxSigner {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "TxSigner({})", self.account)
	}
}
