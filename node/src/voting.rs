//! Vote generation for locally held representative keys: answers
//! confirmation requests and volunteers final votes for cemented roots.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::{
	ledger::Ledger,
	messages::{Message, NetworkCommand},
	primitives::{BlockHash, KeyPair, Root},
	vote::Vote,
	vote_cache::now_millis,
};

pub struct VoteGenerator {
	ledger: Arc<Ledger>,
	network: UnboundedSender<NetworkCommand>,
	representatives: Mutex<Vec<KeyPair>>,
}

impl VoteGenerator {
	pub fn new(ledger: Arc<Ledger>, network: UnboundedSender<NetworkCommand>) -> Arc<Self> {
		Arc::new(VoteGenerator { ledger, network, representatives: Mutex::new(Vec::new()) })
	}

	/// Register a representative key (typically supplied by a wallet).
	pub fn add_representative(&self, key: KeyPair) {
		self.representatives.lock().expect("voting poisoned").push(key);
	}

	pub fn representative_count(&self) -> usize {
		self.representatives.lock().expect("voting poisoned").len()
	}

	/// Answer a confirmation request. A root we have already cemented gets
	/// a final vote; anything still open gets a provisional one. The votes
	/// are broadcast and also returned for local routing.
	pub fn generate(&self, roots_hashes: &[(Root, BlockHash)]) -> Vec<Vote> {
		let representatives = self.representatives.lock().expect("voting poisoned").clone();
		if representatives.is_empty() || roots_hashes.is_empty() {
			return Vec::new()
		}

		let (final_hashes, provisional_hashes) = {
			let txn = self.ledger.store().tx_begin_read();
			let mut final_hashes = Vec::new();
			let mut provisional_hashes = Vec::new();
			for (_, hash) in roots_hashes {
				if !self.ledger.block_exists_or_pruned(&txn, hash) {
					continue
				}
				if self.ledger.block_confirmed(&txn, hash) {
					final_hashes.push(*hash);
				} else {
					provisional_hashes.push(*hash);
				}
			}
			(final_hashes, provisional_hashes)
		};

		let mut votes = Vec::new();
		let mut emit = |vote: Vote| {
			let _ = self
				.network
				.send(NetworkCommand::Broadcast(Message::ConfirmAck { vote: vote.clone() }));
			votes.push(vote);
		};
		for representative in &representatives {
			for chunk in final_hashes.chunks(crate::constants::VOTE_MAX_HASHES) {
				emit(Vote::new_final(representative, chunk.to_vec()));
			}
			for chunk in provisional_hashes.chunks(crate::constants::VOTE_MAX_HASHES) {
				emit(Vote::new(representative, now_millis(), chunk.to_vec()));
			}
		}
		trace!("Generated {} vote(s) for {} root(s)", votes.len(), roots_hashes.len());
		votes
	}
}
