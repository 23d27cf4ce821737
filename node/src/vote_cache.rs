//! Holding area for votes whose blocks have no live election yet. When an
//! election starts it drains its candidates' buckets and replays the votes
//! in arrival order.

use std::{
	collections::HashMap,
	sync::Mutex,
	time::{SystemTime, UNIX_EPOCH},
};

use crate::{
	metrics,
	primitives::{Account, Amount, BlockHash},
};

/// One recorded voter within a bucket.
#[derive(Clone, Debug)]
pub struct CachedVote {
	pub voter: Account,
	pub timestamp: u64,
	/// Weight sampled at receipt; buckets are ranked by their sum.
	pub weight: Amount,
	pub is_final: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CacheEntry {
	pub voters: Vec<CachedVote>,
}

impl CacheEntry {
	pub fn tally(&self) -> Amount {
		self.voters
			.iter()
			.fold(Amount::ZERO, |sum, vote| sum.saturating_add(vote.weight))
	}

	pub fn final_tally(&self) -> Amount {
		self.voters
			.iter()
			.filter(|vote| vote.is_final)
			.fold(Amount::ZERO, |sum, vote| sum.saturating_add(vote.weight))
	}

	fn observe(&mut self, voter: Account, timestamp: u64, weight: Amount, is_final: bool) {
		// A newer vote from the same representative displaces the older one.
		if let Some(existing) = self.voters.iter_mut().find(|vote| vote.voter == voter) {
			if timestamp >= existing.timestamp {
				existing.timestamp = timestamp;
				existing.weight = weight;
				existing.is_final = is_final;
			}
			return
		}
		self.voters.push(CachedVote { voter, timestamp, weight, is_final });
	}
}

struct Inner {
	buckets: HashMap<BlockHash, CacheEntry>,
	/// Arrival order of bucket creation, for deterministic replay.
	order: Vec<BlockHash>,
}

pub struct VoteCache {
	max_buckets: usize,
	inner: Mutex<Inner>,
}

impl VoteCache {
	pub fn new(max_buckets: usize) -> Self {
		VoteCache {
			max_buckets: max_buckets.max(1),
			inner: Mutex::new(Inner { buckets: HashMap::new(), order: Vec::new() }),
		}
	}

	/// Record one (voter, hash) observation.
	pub fn observe(
		&self,
		hash: &BlockHash,
		voter: Account,
		timestamp: u64,
		weight: Amount,
		is_final: bool,
	) {
		let mut inner = self.inner.lock().expect("vote cache poisoned");
		if !inner.buckets.contains_key(hash) {
			inner.order.push(*hash);
		}
		inner
			.buckets
			.entry(*hash)
			.or_default()
			.observe(voter, timestamp, weight, is_final);

		// Over budget: evict the bucket with the weakest support.
		if inner.buckets.len() > self.max_buckets {
			if let Some(weakest) = inner
				.buckets
				.iter()
				.min_by_key(|(_, entry)| entry.tally())
				.map(|(hash, _)| *hash)
			{
				inner.buckets.remove(&weakest);
				inner.order.retain(|ordered| *ordered != weakest);
				metrics::VOTE_CACHE_EVICTIONS.inc();
			}
		}
	}

	/// Snapshot of a bucket, voters in arrival order.
	pub fn find(&self, hash: &BlockHash) -> Option<CacheEntry> {
		self.inner.lock().expect("vote cache poisoned").buckets.get(hash).cloned()
	}

	/// Remove and return the bucket for `hash`; used when an election takes
	/// over the root.
	pub fn erase(&self, hash: &BlockHash) -> Option<CacheEntry> {
		let mut inner = self.inner.lock().expect("vote cache poisoned");
		let entry = inner.buckets.remove(hash);
		if entry.is_some() {
			inner.order.retain(|ordered| ordered != hash);
		}
		entry
	}

	pub fn size(&self) -> usize {
		self.inner.lock().expect("vote cache poisoned").buckets.len()
	}

	/// Total voters recorded across all buckets.
	pub fn vote_count(&self) -> usize {
		self.inner
			.lock()
			.expect("vote cache poisoned")
			.buckets
			.values()
			.map(|entry| entry.voters.len())
			.sum()
	}

	/// Buckets whose final tally is at least `minimum`, strongest first.
	pub fn top_final(&self, minimum: Amount) -> Vec<(BlockHash, Amount)> {
		let inner = self.inner.lock().expect("vote cache poisoned");
		let mut hits: Vec<(BlockHash, Amount)> = inner
			.buckets
			.iter()
			.map(|(hash, entry)| (*hash, entry.final_tally()))
			.filter(|(_, tally)| *tally >= minimum)
			.collect();
		hits.sort_by(|a, b| b.1.cmp(&a.1));
		hits
	}
}

pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|duration| duration.as_millis() as u64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn account(byte: u8) -> Account {
		Account([byte; 32])
	}

	#[test]
	fn observe_and_find() {
		let cache = VoteCache::new(8);
		let hash = BlockHash([1u8; 32]);
		cache.observe(&hash, account(1), 100, Amount::new(10), false);
		cache.observe(&hash, account(2), 100, Amount::new(20), true);

		let entry = cache.find(&hash).unwrap();
		assert_eq!(entry.voters.len(), 2);
		assert_eq!(entry.tally(), Amount::new(30));
		assert_eq!(entry.final_tally(), Amount::new(20));
		assert_eq!(cache.size(), 1);
		assert_eq!(cache.vote_count(), 2);
	}

	#[test]
	fn newer_vote_from_same_rep_displaces() {
		let cache = VoteCache::new(8);
		let hash = BlockHash([1u8; 32]);
		cache.observe(&hash, account(1), 100, Amount::new(10), false);
		cache.observe(&hash, account(1), 200, Amount::new(10), true);
		cache.observe(&hash, account(1), 50, Amount::new(10), false);

		let entry = cache.find(&hash).unwrap();
		assert_eq!(entry.voters.len(), 1);
		assert_eq!(entry.voters[0].timestamp, 200);
		assert!(entry.voters[0].is_final);
	}

	#[test]
	fn weakest_bucket_is_evicted_over_budget() {
		let cache = VoteCache::new(2);
		cache.observe(&BlockHash([1u8; 32]), account(1), 1, Amount::new(100), false);
		cache.observe(&BlockHash([2u8; 32]), account(2), 1, Amount::new(5), false);
		cache.observe(&BlockHash([3u8; 32]), account(3), 1, Amount::new(50), false);

		assert_eq!(cache.size(), 2);
		assert!(cache.find(&BlockHash([2u8; 32])).is_none());
		assert!(cache.find(&BlockHash([1u8; 32])).is_some());
		assert!(cache.find(&BlockHash([3u8; 32])).is_some());
	}

	#[test]
	fn top_final_ranks_by_final_weight() {
		let cache = VoteCache::new(8);
		cache.observe(&BlockHash([1u8; 32]), account(1), 1, Amount::new(100), true);
		cache.observe(&BlockHash([2u8; 32]), account(2), 1, Amount::new(300), true);
		cache.observe(&BlockHash([3u8; 32]), account(3), 1, Amount::new(200), false);

		let top = cache.top_final(Amount::new(50));
		assert_eq!(
			top,
			vec![
				(BlockHash([2u8; 32]), Amount::new(300)),
				(BlockHash([1u8; 32]), Amount::new(100))
			]
		);
	}
}
