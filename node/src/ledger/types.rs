use serde::{Deserialize, Serialize};

use crate::{
	block::Block,
	primitives::{Account, Amount, BlockHash},
};

/// Bootstrap-epoch tag carried by accounts, pending entries and block
/// metadata. Epochs gate protocol upgrades; they only ever move forward.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Epoch {
	Epoch0,
	Epoch1,
}

impl Default for Epoch {
	fn default() -> Self {
		Epoch::Epoch0
	}
}

/// Per-account head state. Created by the account's open block, mutated as
/// the chain tip advances, never destroyed while blocks exist.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AccountInfo {
	pub head: BlockHash,
	pub representative: Account,
	pub open_block: BlockHash,
	pub balance: Amount,
	/// Seconds since the epoch, for telemetry and bootstrap prioritisation.
	pub modified: u64,
	pub block_count: u64,
	pub epoch: Epoch,
}

/// Key of the obligation a send block owes its destination.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct PendingKey {
	pub destination: Account,
	pub send_hash: BlockHash,
}

impl PendingKey {
	pub fn new(destination: Account, send_hash: BlockHash) -> Self {
		PendingKey { destination, send_hash }
	}

	pub fn to_bytes(self) -> [u8; 64] {
		let mut bytes = [0u8; 64];
		bytes[..32].copy_from_slice(self.destination.as_bytes());
		bytes[32..].copy_from_slice(self.send_hash.as_bytes());
		bytes
	}

	pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
		if bytes.len() != 64 {
			return None
		}
		let mut destination = [0u8; 32];
		destination.copy_from_slice(&bytes[..32]);
		let mut send_hash = [0u8; 32];
		send_hash.copy_from_slice(&bytes[32..]);
		Some(PendingKey { destination: Account(destination), send_hash: BlockHash(send_hash) })
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PendingInfo {
	pub source: Account,
	pub amount: Amount,
	pub epoch: Epoch,
}

/// Metadata stored next to every block body. `successor` keeps the chain
/// walkable forward; balance/height make deep lookups cheap.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockSideband {
	pub successor: BlockHash,
	pub account: Account,
	pub balance: Amount,
	pub height: u64,
	pub timestamp: u64,
	pub epoch: Epoch,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockEntry {
	pub block: Block,
	pub sideband: BlockSideband,
}

/// Sparse entry of the balance index, written every `BLOCK_INFO_MAX` blocks
/// along an account chain.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockInfo {
	pub account: Account,
	pub balance: Amount,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ConfirmationHeightInfo {
	pub height: u64,
	pub frontier: BlockHash,
}

/// A block parked because its `previous` or source has not arrived yet.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UncheckedInfo {
	pub block: Block,
	/// Seconds since the epoch at parking time, for bounded retention.
	pub modified: u64,
}
