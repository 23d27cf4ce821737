//! Proof-of-effort validation. Generation is delegated to external workers;
//! the ledger only ever consumes the predicate.

use blake2::{
	digest::{Update, VariableOutput},
	Blake2bVar,
};

use crate::primitives::Root;

/// Difficulty of a nonce against a root: Blake2b-64 over the little-endian
/// nonce followed by the root, read little-endian.
pub fn work_value(root: &Root, work: u64) -> u64 {
	let mut hasher = Blake2bVar::new(8).expect("8 is a valid blake2b output size");
	hasher.update(&work.to_le_bytes());
	hasher.update(root.as_bytes());
	let mut output = [0u8; 8];
	hasher.finalize_variable(&mut output).expect("output size fixed at construction");
	u64::from_le_bytes(output)
}

pub fn valid_pow(root: &Root, work: u64, threshold: u64) -> bool {
	work_value(root, work) >= threshold
}

/// Brute-force a nonce for `root`. Only viable against the development
/// threshold; real networks delegate generation to a work server.
pub fn solve(root: &Root, threshold: u64) -> u64 {
	(0u64..).find(|nonce| valid_pow(root, *nonce, threshold)).expect("search space is exhaustive")
}

/// Find a nonce that fails the predicate, for exercising rejection paths.
pub fn solve_invalid(root: &Root, threshold: u64) -> u64 {
	(0u64..)
		.find(|nonce| !valid_pow(root, *nonce, threshold))
		.expect("the development threshold rejects roughly half of all nonces")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::constants::WORK_THRESHOLD_DEV;

	#[test]
	fn value_is_deterministic_and_root_bound() {
		let root = Root([1u8; 32]);
		assert_eq!(work_value(&root, 42), work_value(&root, 42));
		assert_ne!(work_value(&root, 42), work_value(&Root([2u8; 32]), 42));
	}

	#[test]
	fn solve_round_trip() {
		let root = Root([3u8; 32]);
		let nonce = solve(&root, WORK_THRESHOLD_DEV);
		assert!(valid_pow(&root, nonce, WORK_THRESHOLD_DEV));
		let bad = solve_invalid(&root, WORK_THRESHOLD_DEV);
		assert!(!valid_pow(&root, bad, WORK_THRESHOLD_DEV));
	}
}
