//! The on-chain half of the system: the worker registry and the request
//! scheduler, expressed as a deterministic state machine with explicit
//! abort codes and event emission.
//!
//! The deployed contract and this crate implement the same semantics; the
//! `sim` module executes the state machine as an in-process chain, which is
//! what local nets and the engine's integration tests run against.

pub mod calls;
pub mod error;
pub mod events;
pub mod registry;
pub mod scheduler;
pub mod sim;

pub use calls::{ContractCall, TxReceipt};
pub use error::AbortCode;
pub use events::{ContractEvent, ContractModule, EventRecord};

use ck_primitives::{AccountId, EpochSeconds};

/// Ambient call information every entry point receives: who signed the
/// transaction and the chain timestamp it executes at.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
	pub sender: AccountId,
	pub timestamp: EpochSeconds,
}

impl CallContext {
	pub fn new(sender: AccountId, timestamp: EpochSeconds) -> Self {
		Self { sender, timestamp }
	}
}
