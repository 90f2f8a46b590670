use serde::{Deserialize, Serialize};

/// Abort codes surfaced by contract entry points. The numeric values are
/// part of the wire contract: the engine matches on them when deciding
/// whether an abort reflects a state race or a permanent rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[repr(u16)]
pub enum AbortCode {
	#[error("node id is already registered")]
	NodeIdTaken = 1,
	#[error("stake payment is below the registration minimum")]
	StakeBelowMinimum = 2,
	#[error("caller is not the registry admin")]
	NotAdmin = 3,
	#[error("caller is not the record owner")]
	NotOwner = 4,
	#[error("no worker record for this node id")]
	WorkerNotFound = 5,
	#[error("operation is not valid for the record's current status")]
	InvalidStatus = 6,
	#[error("worker has no join token set")]
	JoinTokenMissing = 7,
	#[error("stake is not eligible for withdrawal")]
	NotWithdrawEligible = 8,
	#[error("requester has no active worker record and is not allowlisted")]
	RequesterNotAdmitted = 9,
	#[error("requester's stake does not permit this operation")]
	NotAuthorized = 10,
	#[error("request with this id already exists")]
	DuplicateRequest = 11,
	#[error("no active worker is available for assignment")]
	NoActiveWorkers = 12,
	#[error("no request record for this request id")]
	RequestNotFound = 13,
	#[error("request already holds a terminal response")]
	RequestTerminal = 14,
}

impl AbortCode {
	pub fn code(self) -> u16 {
		self as u16
	}

	pub fn from_code(code: u16) -> Option<Self> {
		use AbortCode::*;
		Some(match code {
			1 => NodeIdTaken,
			2 => StakeBelowMinimum,
			3 => NotAdmin,
			4 => NotOwner,
			5 => WorkerNotFound,
			6 => InvalidStatus,
			7 => JoinTokenMissing,
			8 => NotWithdrawEligible,
			9 => RequesterNotAdmitted,
			10 => NotAuthorized,
			11 => DuplicateRequest,
			12 => NoActiveWorkers,
			13 => RequestNotFound,
			14 => RequestTerminal,
			_ => return None,
		})
	}
}
