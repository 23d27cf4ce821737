//! Parking lot for blocks whose dependency (previous or source) has not
//! arrived. Entries are bounded in count and age; arrival of the dependency
//! releases the children for another pass through the processor.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
	block::Block,
	ledger::types::UncheckedInfo,
	metrics,
	primitives::BlockHash,
	store::{Store, Transaction, WriteTransaction},
};

pub struct UncheckedMap {
	max_entries: usize,
	max_age: Duration,
}

fn now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl UncheckedMap {
	pub fn new(max_entries: usize, max_age: Duration) -> Self {
		UncheckedMap { max_entries, max_age }
	}

	/// Park `block` until `dependency` arrives. Over budget the block is
	/// discarded instead.
	pub fn put(
		&self,
		store: &Store,
		txn: &mut WriteTransaction,
		dependency: &BlockHash,
		block: Block,
	) {
		if store.unchecked_count(txn) >= self.max_entries {
			metrics::UNCHECKED_DROPS.inc();
			return
		}
		store.unchecked_put(txn, dependency, &UncheckedInfo { block, modified: now() });
	}

	/// Remove and return everything waiting on `dependency`.
	pub fn take_children(
		&self,
		store: &Store,
		txn: &mut WriteTransaction,
		dependency: &BlockHash,
	) -> Vec<Block> {
		let children = store.unchecked_get(txn, dependency);
		let mut blocks = Vec::with_capacity(children.len());
		for info in children {
			store.unchecked_del(txn, dependency, &info.block.hash());
			blocks.push(info.block);
		}
		blocks
	}

	/// Discard entries past the retention window.
	pub fn prune(&self, store: &Store, txn: &mut WriteTransaction) {
		let cutoff = now().saturating_sub(self.max_age.as_secs());
		let stale: Vec<(BlockHash, BlockHash)> = store
			.unchecked_iter(txn)
			.filter(|(_, info)| info.modified < cutoff)
			.map(|(dependency, info)| (dependency, info.block.hash()))
			.collect();
		for (dependency, hash) in stale {
			store.unchecked_del(txn, &dependency, &hash);
			metrics::UNCHECKED_DROPS.inc();
		}
	}

	pub fn count(&self, store: &Store, txn: &dyn Transaction) -> usize {
		store.unchecked_count(txn)
	}
}
