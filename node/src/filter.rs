//! Duplicate suppression for gossiped blocks: a bounded set of short
//! digests. Cleared per-entry when an unconfirmed election is dropped so the
//! block can circulate again.

use std::{num::NonZeroUsize, sync::Mutex};

use blake2::{Blake2b, Digest};
use lru::LruCache;

pub struct NetworkFilter {
	entries: Mutex<LruCache<u128, ()>>,
}

impl NetworkFilter {
	pub fn new(capacity: usize) -> Self {
		NetworkFilter {
			entries: Mutex::new(LruCache::new(
				NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
			)),
		}
	}

	fn digest(bytes: &[u8]) -> u128 {
		let mut hasher = Blake2b::<typenum::U16>::new();
		hasher.update(bytes);
		u128::from_le_bytes(hasher.finalize().into())
	}

	/// Record `bytes`; returns true when they were not already present.
	pub fn apply(&self, bytes: &[u8]) -> bool {
		let digest = Self::digest(bytes);
		let mut entries = self.entries.lock().expect("filter poisoned");
		entries.put(digest, ()).is_none()
	}

	pub fn contains(&self, bytes: &[u8]) -> bool {
		self.entries.lock().expect("filter poisoned").contains(&Self::digest(bytes))
	}

	/// Forget `bytes`, allowing them to be seen as new again.
	pub fn clear(&self, bytes: &[u8]) {
		self.entries.lock().expect("filter poisoned").pop(&Self::digest(bytes));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_sight_then_duplicate() {
		let filter = NetworkFilter::new(16);
		assert!(filter.apply(b"block"));
		assert!(!filter.apply(b"block"));
		assert!(filter.apply(b"other"));
	}

	#[test]
	fn clear_allows_reapply() {
		let filter = NetworkFilter::new(16);
		assert!(filter.apply(b"block"));
		filter.clear(b"block");
		assert!(!filter.contains(b"block"));
		assert!(filter.apply(b"block"));
	}

	#[test]
	fn capacity_evicts_oldest() {
		let filter = NetworkFilter::new(2);
		assert!(filter.apply(b"a"));
		assert!(filter.apply(b"b"));
		assert!(filter.apply(b"c"));
		// "a" fell out and is new again.
		assert!(filter.apply(b"a"));
	}
}
