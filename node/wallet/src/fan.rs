//! The fan: an in-memory secret split across XOR shares so the raw key
//! never sits contiguously in memory between uses.

use std::sync::Mutex;

use rand::RngCore;
use zeroize::Zeroizing;

pub struct Fan {
	values: Mutex<Vec<[u8; 32]>>,
}

fn xor_into(target: &mut [u8; 32], other: &[u8; 32]) {
	for (byte, other_byte) in target.iter_mut().zip(other.iter()) {
		*byte ^= other_byte;
	}
}

impl Fan {
	pub fn new(key: [u8; 32], count: usize) -> Self {
		let mut first = key;
		let mut values = Vec::with_capacity(count.max(1));
		for _ in 1..count.max(1) {
			let mut entry = [0u8; 32];
			rand::thread_rng().fill_bytes(&mut entry);
			xor_into(&mut first, &entry);
			values.push(entry);
		}
		values.push(first);
		Fan { values: Mutex::new(values) }
	}

	/// Reassemble the secret.
	pub fn value(&self) -> Zeroizing<[u8; 32]> {
		let values = self.values.lock().expect("fan poisoned");
		let mut out = Zeroizing::new([0u8; 32]);
		for value in values.iter() {
			xor_into(&mut out, value);
		}
		out
	}

	/// Replace the secret, leaving all but one share untouched.
	pub fn value_set(&self, new_value: &[u8; 32]) {
		let current = self.value();
		let mut values = self.values.lock().expect("fan poisoned");
		xor_into(&mut values[0], &current);
		xor_into(&mut values[0], new_value);
	}
}
