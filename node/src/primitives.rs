use std::fmt;

use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Content address of a block: Blake2b-256 over its canonical encoding.
#[derive(
	Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlockHash(pub [u8; 32]);

/// An account id, which is also the account's ed25519 verifying key.
#[derive(
	Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Account(pub [u8; 32]);

/// The value an election is keyed by: the `previous` hash for most blocks,
/// the account id for a block that opens a chain.
#[derive(
	Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Root(pub [u8; 32]);

/// Context-dependent 32-byte field of a state block: destination account,
/// source block hash, epoch identifier, or zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Link(pub [u8; 32]);

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "BigArray")] pub [u8; 64]);

/// 128-bit balance, big-endian on the wire.
#[derive(
	Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Amount(pub u128);

macro_rules! impl_bytes32 {
	($name:ident) => {
		impl $name {
			pub const ZERO: Self = Self([0u8; 32]);

			pub fn from_bytes(bytes: [u8; 32]) -> Self {
				Self(bytes)
			}

			pub fn as_bytes(&self) -> &[u8; 32] {
				&self.0
			}

			pub fn is_zero(&self) -> bool {
				self.0 == [0u8; 32]
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", hex::encode_upper(self.0))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				// Leading 8 hex chars are enough to tell values apart in logs
				write!(f, "{}", &hex::encode_upper(self.0)[..8])
			}
		}
	};
}

impl_bytes32!(BlockHash);
impl_bytes32!(Account);
impl_bytes32!(Root);
impl_bytes32!(Link);

impl From<Account> for Root {
	fn from(account: Account) -> Self {
		Root(account.0)
	}
}

impl From<BlockHash> for Root {
	fn from(hash: BlockHash) -> Self {
		Root(hash.0)
	}
}

impl From<Account> for Link {
	fn from(account: Account) -> Self {
		Link(account.0)
	}
}

impl From<BlockHash> for Link {
	fn from(hash: BlockHash) -> Self {
		Link(hash.0)
	}
}

impl Link {
	pub fn as_account(&self) -> Account {
		Account(self.0)
	}

	pub fn as_hash(&self) -> BlockHash {
		BlockHash(self.0)
	}
}

impl Root {
	pub fn as_account(&self) -> Account {
		Account(self.0)
	}

	pub fn as_hash(&self) -> BlockHash {
		BlockHash(self.0)
	}
}

impl Account {
	/// Verify `signature` over `message` under this account's key. Returns
	/// false for malformed keys as well as bad signatures: both mean the
	/// block or vote cannot have been authorised by the account.
	pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
		match VerifyingKey::from_bytes(&self.0) {
			Ok(key) => key.verify(message, &ed25519_dalek::Signature::from_bytes(&signature.0)).is_ok(),
			Err(_) => false,
		}
	}
}

impl Signature {
	pub const ZERO: Self = Self([0u8; 64]);

	pub fn from_bytes(bytes: [u8; 64]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 64] {
		&self.0
	}
}

impl Default for Signature {
	fn default() -> Self {
		Self::ZERO
	}
}

impl fmt::Debug for Signature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", &hex::encode_upper(self.0)[..8])
	}
}

impl fmt::Display for Signature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode_upper(self.0))
	}
}

impl Amount {
	pub const ZERO: Self = Self(0);
	pub const MAX: Self = Self(u128::MAX);

	pub fn new(raw: u128) -> Self {
		Self(raw)
	}

	pub fn raw(&self) -> u128 {
		self.0
	}

	pub fn to_be_bytes(self) -> [u8; 16] {
		self.0.to_be_bytes()
	}

	pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
		Self(u128::from_be_bytes(bytes))
	}

	pub fn checked_add(self, other: Self) -> Option<Self> {
		self.0.checked_add(other.0).map(Self)
	}

	pub fn checked_sub(self, other: Self) -> Option<Self> {
		self.0.checked_sub(other.0).map(Self)
	}

	pub fn saturating_add(self, other: Self) -> Self {
		Self(self.0.saturating_add(other.0))
	}

	pub fn saturating_sub(self, other: Self) -> Self {
		Self(self.0.saturating_sub(other.0))
	}
}

impl fmt::Display for Amount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl fmt::Debug for Amount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// An ed25519 signing key together with the account id it authorises.
#[derive(Clone)]
pub struct KeyPair {
	secret: SigningKey,
	account: Account,
}

impl KeyPair {
	pub fn generate() -> Self {
		let mut bytes = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut bytes);
		Self::from_secret_bytes(bytes)
	}

	pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
		let secret = SigningKey::from_bytes(&bytes);
		let account = Account(secret.verifying_key().to_bytes());
		KeyPair { secret, account }
	}

	pub fn account(&self) -> Account {
		self.account
	}

	pub fn secret_bytes(&self) -> [u8; 32] {
		self.secret.to_bytes()
	}

	pub fn sign(&self, message: &[u8]) -> Signature {
		Signature(self.secret.sign(message).to_bytes())
	}
}

impl fmt::Debug for KeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "KeyPair({:?})", self.account)
	}
}

/// Derive the account id for a raw private key.
pub fn pub_key(secret_bytes: &[u8; 32]) -> Account {
	Account(SigningKey::from_bytes(secret_bytes).verifying_key().to_bytes())
}

pub fn blake2b256(parts: &[&[u8]]) -> [u8; 32] {
	let mut hasher = Blake2b::<typenum::U32>::new();
	for part in parts {
		hasher.update(part);
	}
	hasher.finalize().into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sign_and_verify() {
		let key = KeyPair::generate();
		let signature = key.sign(b"payload");
		assert!(key.account().verify(b"payload", &signature));
		assert!(!key.account().verify(b"payload2", &signature));

		let other = KeyPair::generate();
		assert!(!other.account().verify(b"payload", &signature));
	}

	#[test]
	fn key_derivation_is_deterministic() {
		let a = KeyPair::from_secret_bytes([7u8; 32]);
		let b = KeyPair::from_secret_bytes([7u8; 32]);
		assert_eq!(a.account(), b.account());
		assert_eq!(pub_key(&[7u8; 32]), a.account());
	}

	#[test]
	fn amount_arithmetic_checks() {
		assert_eq!(Amount::new(5).checked_sub(Amount::new(3)), Some(Amount::new(2)));
		assert_eq!(Amount::new(3).checked_sub(Amount::new(5)), None);
		assert_eq!(Amount::MAX.checked_add(Amount::new(1)), None);
	}
}
