//! Votes cast by representatives over block hashes.

use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::{
	constants::{VOTE_MAX_HASHES, VOTE_TIMESTAMP_FINAL},
	primitives::{Account, BlockHash, KeyPair, Signature},
};

/// How the router classified one hash of a vote.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteCode {
	/// Counted by a live election.
	Vote,
	/// Already seen, or for an already-confirmed root.
	Replay,
	/// No live election; parked in the vote cache.
	Indeterminate,
	/// Malformed or outdated; discarded.
	Ignored,
}

impl VoteCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			VoteCode::Vote => "vote",
			VoteCode::Replay => "replay",
			VoteCode::Indeterminate => "indeterminate",
			VoteCode::Ignored => "ignored",
		}
	}
}

/// A signed statement that `voter` supports `hashes` at `timestamp`.
///
/// The timestamp doubles as the sequence number: a later vote from the same
/// representative supersedes an earlier one at the same root. The final
/// sentinel is the largest timestamp, so finality dominates naturally.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Vote {
	pub voter: Account,
	pub timestamp: u64,
	pub hashes: Vec<BlockHash>,
	pub signature: Signature,
}

impl Vote {
	pub fn new(key: &KeyPair, timestamp: u64, hashes: Vec<BlockHash>) -> Self {
		let mut vote = Vote { voter: key.account(), timestamp, hashes, signature: Signature::ZERO };
		vote.signature = key.sign(&vote.digest());
		vote
	}

	pub fn new_final(key: &KeyPair, hashes: Vec<BlockHash>) -> Self {
		Self::new(key, VOTE_TIMESTAMP_FINAL, hashes)
	}

	pub fn is_final(&self) -> bool {
		self.timestamp == VOTE_TIMESTAMP_FINAL
	}

	/// Canonical signing payload: domain tag, the hashes in order, then the
	/// big-endian timestamp.
	pub fn digest(&self) -> [u8; 32] {
		let mut hasher = Blake2b::<typenum::U32>::new();
		hasher.update(b"vote ");
		for hash in &self.hashes {
			hasher.update(hash.as_bytes());
		}
		hasher.update(self.timestamp.to_be_bytes());
		hasher.finalize().into()
	}

	/// Structurally sound and properly signed.
	pub fn validate(&self) -> bool {
		if self.hashes.is_empty() || self.hashes.len() > VOTE_MAX_HASHES {
			return false
		}
		self.voter.verify(&self.digest(), &self.signature)
	}
}
