//! Entry point for arriving votes: validates them once, then routes each
//! hash to its live election, the replay window, or the vote cache.

use std::{collections::HashMap, sync::Arc};

use crate::{
	elections::ActiveElections,
	ledger::Ledger,
	metrics,
	primitives::{Amount, BlockHash},
	vote::{Vote, VoteCode},
	vote_cache::VoteCache,
};

pub struct VoteRouter {
	ledger: Arc<Ledger>,
	active: Arc<ActiveElections>,
	vote_cache: Arc<VoteCache>,
}

impl VoteRouter {
	pub fn new(
		ledger: Arc<Ledger>,
		active: Arc<ActiveElections>,
		vote_cache: Arc<VoteCache>,
	) -> Self {
		VoteRouter { ledger, active, vote_cache }
	}

	/// Route one vote, returning the verdict per carried hash.
	pub fn vote(&self, vote: &Vote) -> HashMap<BlockHash, VoteCode> {
		let mut results = HashMap::new();

		if !vote.validate() {
			for hash in &vote.hashes {
				results.insert(*hash, VoteCode::Ignored);
			}
			metrics::VOTES_PROCESSED
				.with_label_values(&[VoteCode::Ignored.as_str()])
				.inc_by(vote.hashes.len() as u64);
			return results
		}

		let weight = self.ledger.weight(&vote.voter);
		if weight == Amount::ZERO {
			// No stake behind the signature; nothing to tally.
			for hash in &vote.hashes {
				results.insert(*hash, VoteCode::Ignored);
			}
			metrics::VOTES_PROCESSED
				.with_label_values(&[VoteCode::Ignored.as_str()])
				.inc_by(vote.hashes.len() as u64);
			return results
		}

		// Replay floor persisted across restarts.
		let stored_timestamp = {
			let txn = self.ledger.store().tx_begin_read();
			self.ledger
				.store()
				.vote_get(&txn, &vote.voter)
				.and_then(|bytes| bincode::deserialize::<Vote>(&bytes).ok())
				.map(|stored| stored.timestamp)
		};
		if stored_timestamp.is_some_and(|stored| vote.timestamp < stored) {
			for hash in &vote.hashes {
				results.insert(*hash, VoteCode::Replay);
			}
			metrics::VOTES_PROCESSED
				.with_label_values(&[VoteCode::Replay.as_str()])
				.inc_by(vote.hashes.len() as u64);
			return results
		}

		let mut cached_any = false;
		for hash in &vote.hashes {
			let code = if self.active.recently_confirmed_hash(hash) {
				VoteCode::Replay
			} else if let Some(election) = self.active.election_for_hash(hash) {
				let code = election.vote(&vote.voter, vote.timestamp, *hash, &|account| {
					self.ledger.weight(account)
				});
				self.active.check_confirm(&election);
				code
			} else {
				self.vote_cache.observe(
					hash,
					vote.voter,
					vote.timestamp,
					weight,
					vote.is_final(),
				);
				cached_any = true;
				VoteCode::Indeterminate
			};
			metrics::VOTES_PROCESSED.with_label_values(&[code.as_str()]).inc();
			results.insert(*hash, code);
		}

		if cached_any {
			self.active.flush_hinted();
		}

		if stored_timestamp.map_or(true, |stored| vote.timestamp > stored) {
			let mut txn = self.ledger.store().tx_begin_write();
			self.ledger.store().vote_put(
				&mut txn,
				&vote.voter,
				bincode::serialize(vote).expect("serialization is not expected to fail"),
			);
			let _ = txn.commit();
		}

		results
	}
}
