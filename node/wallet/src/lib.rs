//! Encrypted deterministic key container.
//!
//! A wallet holds a random seed and any number of keys, either derived from
//! the seed by index or inserted ad hoc. Everything sensitive is encrypted
//! at rest: the wallet key under the password-derived key, the seed and
//! ad-hoc private keys under the wallet key. Changing the password only
//! re-encrypts the wallet key. In memory, the password-derived key lives in
//! a XOR-sharded fan rather than a single buffer.

mod fan;


use std::{path::Path, sync::Arc};

use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use blake2::{Blake2b, Digest};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use rocksdb::{Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

pub use fan::Fan;

pub type PublicKey = [u8; 32];
pub type RawKey = Zeroizing<[u8; 32]>;

/// Current wallet record layout version.
pub const WALLET_VERSION: u32 = 4;

/// High half of the key field marking a deterministic entry.
const DETERMINISTIC_MARKER: u64 = 1 << 32;

// Reserved entry keys; real account keys are random curve points and never
// collide with these small values.
const VERSION_SPECIAL: u8 = 0;
const SALT_SPECIAL: u8 = 1;
const WALLET_KEY_SPECIAL: u8 = 2;
const CHECK_SPECIAL: u8 = 3;
const REPRESENTATIVE_SPECIAL: u8 = 4;
const SEED_SPECIAL: u8 = 5;
const DETERMINISTIC_INDEX_SPECIAL: u8 = 6;
const SPECIAL_COUNT: u8 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalletError {
	#[error("wallet is locked")]
	Locked,
	#[error("invalid password")]
	BadPassword,
	#[error("key not found in wallet")]
	MissingKey,
	#[error("wallet not found")]
	NotFound,
	#[error("wallet data corrupt: {0}")]
	Corrupt(String),
	#[error("storage failure: {0}")]
	Storage(String),
}

#[derive(Clone, Copy, Debug)]
pub struct KdfParams {
	pub t_cost: u32,
	pub m_cost_kib: u32,
	pub p_cost: u32,
}

impl Default for KdfParams {
	fn default() -> Self {
		KdfParams { t_cost: 1, m_cost_kib: 64 * 1024, p_cost: 1 }
	}
}

impl KdfParams {
	/// Cheap parameters for tests; never for real wallets.
	pub fn insecure() -> Self {
		KdfParams { t_cost: 1, m_cost_kib: 8, p_cost: 1 }
	}
}

#[derive(Clone, Debug)]
pub struct WalletDbConfig {
	pub kdf: KdfParams,
	pub fan_out: usize,
}

impl Default for WalletDbConfig {
	fn default() -> Self {
		WalletDbConfig { kdf: KdfParams::default(), fan_out: 1024 }
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WalletId(pub [u8; 32]);

impl WalletId {
	pub fn random() -> Self {
		let mut bytes = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut bytes);
		WalletId(bytes)
	}
}

impl std::fmt::Display for WalletId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", hex::encode_upper(self.0))
	}
}

/// One stored record: an encrypted-or-plain payload plus a cached work
/// nonce for the entry's account.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WalletValue {
	data: Vec<u8>,
	work: u64,
}

fn special_key(index: u8) -> [u8; 32] {
	let mut key = [0u8; 32];
	key[31] = index;
	key
}

fn is_special(key: &[u8; 32]) -> bool {
	key[..31].iter().all(|byte| *byte == 0) && key[31] < SPECIAL_COUNT
}

const NONCE_SIZE: usize = 12;

/// AES-256-GCM with a fresh random nonce written in front of the
/// ciphertext, so no two records ever share a (key, nonce) pair — not even
/// rewrites of the same record.
fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	let mut nonce = [0u8; NONCE_SIZE];
	rand::thread_rng().fill_bytes(&mut nonce);
	let mut out = nonce.to_vec();
	out.extend_from_slice(
		&cipher
			.encrypt(Nonce::from_slice(&nonce), plaintext)
			.expect("AES-GCM encryption is infallible for in-memory buffers"),
	);
	out
}

fn decrypt(key: &[u8; 32], data: &[u8]) -> Option<Vec<u8>> {
	if data.len() < NONCE_SIZE {
		return None
	}
	let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
}

pub fn public_key_of(prv: &[u8; 32]) -> PublicKey {
	SigningKey::from_bytes(prv).verifying_key().to_bytes()
}

/// `Blake2b-256(seed || index_be)`: the deterministic key schedule.
pub fn deterministic_key(seed: &[u8; 32], index: u32) -> RawKey {
	let mut hasher = Blake2b::<typenum::U32>::new();
	hasher.update(seed);
	hasher.update(index.to_be_bytes());
	Zeroizing::new(hasher.finalize().into())
}

/// The store shared by every wallet: one database, entries keyed by
/// `wallet_id || entry_key`.
pub struct WalletDb {
	db: DB,
	config: WalletDbConfig,
}

impl WalletDb {
	pub fn open(path: &Path, config: WalletDbConfig) -> Result<Arc<Self>, WalletError> {
		let mut options = Options::default();
		options.create_if_missing(true);
		let db = DB::open(&options, path)
			.map_err(|error| WalletError::Storage(error.to_string()))?;
		Ok(Arc::new(WalletDb { db, config }))
	}

	fn get(&self, id: &WalletId, key: &[u8; 32]) -> Option<WalletValue> {
		let mut full_key = Vec::with_capacity(64);
		full_key.extend_from_slice(&id.0);
		full_key.extend_from_slice(key);
		self.db
			.get(&full_key)
			.expect("wallet read should not fail")
			.map(|bytes| bincode::deserialize(&bytes).expect("wallet holds only values we wrote"))
	}

	fn put(&self, batch: &mut WriteBatch, id: &WalletId, key: &[u8; 32], value: &WalletValue) {
		let mut full_key = Vec::with_capacity(64);
		full_key.extend_from_slice(&id.0);
		full_key.extend_from_slice(key);
		batch.put(&full_key, bincode::serialize(value).expect("serialization cannot fail"));
	}

	fn delete(&self, batch: &mut WriteBatch, id: &WalletId, key: &[u8; 32]) {
		let mut full_key = Vec::with_capacity(64);
		full_key.extend_from_slice(&id.0);
		full_key.extend_from_slice(key);
		batch.delete(&full_key);
	}

	fn write(&self, batch: WriteBatch) -> Result<(), WalletError> {
		self.db.write(batch).map_err(|error| WalletError::Storage(error.to_string()))
	}

	fn entry_keys(&self, id: &WalletId) -> Vec<[u8; 32]> {
		self.db
			.iterator(rocksdb::IteratorMode::From(&id.0, rocksdb::Direction::Forward))
			.map(|item| item.expect("wallet iteration should not fail"))
			.take_while(|(key, _)| key.starts_with(&id.0))
			.filter_map(|(key, _)| {
				let mut entry = [0u8; 32];
				if key.len() != 64 {
					return None
				}
				entry.copy_from_slice(&key[32..]);
				Some(entry)
			})
			.collect()
	}

	/// Ids of every wallet in the store.
	pub fn wallet_ids(&self) -> Vec<WalletId> {
		let version_key = special_key(VERSION_SPECIAL);
		self.db
			.iterator(rocksdb::IteratorMode::Start)
			.map(|item| item.expect("wallet iteration should not fail"))
			.filter_map(|(key, _)| {
				if key.len() != 64 || key[32..] != version_key {
					return None
				}
				let mut id = [0u8; 32];
				id.copy_from_slice(&key[..32]);
				Some(WalletId(id))
			})
			.collect()
	}

	/// Create a new wallet with the empty password.
	pub fn create(
		self: &Arc<Self>,
		id: WalletId,
		representative: PublicKey,
	) -> Result<Wallet, WalletError> {
		let mut salt = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut salt);
		let mut wallet_key = Zeroizing::new([0u8; 32]);
		rand::thread_rng().fill_bytes(wallet_key.as_mut());
		let mut seed = Zeroizing::new([0u8; 32]);
		rand::thread_rng().fill_bytes(seed.as_mut());

		let password_key = derive_key(&self.config.kdf, "", &salt)?;

		let mut batch = WriteBatch::default();
		self.put(
			&mut batch,
			&id,
			&special_key(VERSION_SPECIAL),
			&WalletValue { data: WALLET_VERSION.to_be_bytes().to_vec(), work: 0 },
		);
		self.put(
			&mut batch,
			&id,
			&special_key(SALT_SPECIAL),
			&WalletValue { data: salt.to_vec(), work: 0 },
		);
		self.put(
			&mut batch,
			&id,
			&special_key(WALLET_KEY_SPECIAL),
			&WalletValue { data: encrypt(&password_key, &*wallet_key), work: 0 },
		);
		self.put(
			&mut batch,
			&id,
			&special_key(CHECK_SPECIAL),
			&WalletValue { data: encrypt(&wallet_key, &[0u8; 32]), work: 0 },
		);
		self.put(
			&mut batch,
			&id,
			&special_key(REPRESENTATIVE_SPECIAL),
			&WalletValue { data: representative.to_vec(), work: 0 },
		);
		self.put(
			&mut batch,
			&id,
			&special_key(SEED_SPECIAL),
			&WalletValue { data: encrypt(&wallet_key, &*seed), work: 0 },
		);
		self.put(
			&mut batch,
			&id,
			&special_key(DETERMINISTIC_INDEX_SPECIAL),
			&WalletValue { data: 0u32.to_be_bytes().to_vec(), work: 0 },
		);
		self.write(batch)?;
		debug!("Created wallet {id}");

		let wallet = Wallet {
			db: self.clone(),
			id,
			password: Fan::new(*password_key, self.config.fan_out),
		};
		Ok(wallet)
	}

	/// Open an existing wallet; starts locked.
	pub fn open_wallet(self: &Arc<Self>, id: WalletId) -> Result<Wallet, WalletError> {
		let version = self.get(&id, &special_key(VERSION_SPECIAL)).ok_or(WalletError::NotFound)?;
		let version = u32::from_be_bytes(
			version
				.data
				.try_into()
				.map_err(|_| WalletError::Corrupt("bad version record".to_string()))?,
		);
		if version != WALLET_VERSION {
			return Err(WalletError::Corrupt(format!("unsupported wallet version {version}")))
		}
		Ok(Wallet { db: self.clone(), id, password: Fan::new([0u8; 32], self.config.fan_out) })
	}
}

fn derive_key(
	params: &KdfParams,
	password: &str,
	salt: &[u8; 32],
) -> Result<RawKey, WalletError> {
	let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
		.map_err(|error| WalletError::Corrupt(format!("bad kdf parameters: {error}")))?;
	let argon = Argon2::new(Algorithm::Argon2d, Version::V0x13, argon_params);
	let mut out = Zeroizing::new([0u8; 32]);
	argon
		.hash_password_into(password.as_bytes(), salt, out.as_mut())
		.map_err(|error| WalletError::Corrupt(format!("kdf failure: {error}")))?;
	Ok(out)
}

pub struct Wallet {
	db: Arc<WalletDb>,
	pub id: WalletId,
	/// Password-derived key, sharded; never the wallet key itself.
	password: Fan,
}

impl Wallet {
	fn value(&self, key: &[u8; 32]) -> Option<WalletValue> {
		self.db.get(&self.id, key)
	}

	fn salt(&self) -> Result<[u8; 32], WalletError> {
		self.value(&special_key(SALT_SPECIAL))
			.and_then(|value| value.data.try_into().ok())
			.ok_or_else(|| WalletError::Corrupt("missing salt".to_string()))
	}

	/// Decrypt the wallet key with the password currently in the fan. The
	/// authentication tag rejects a wrong password.
	fn wallet_key(&self) -> Result<RawKey, WalletError> {
		let stored = self
			.value(&special_key(WALLET_KEY_SPECIAL))
			.ok_or_else(|| WalletError::Corrupt("missing wallet key".to_string()))?;
		let password_key = self.password.value();
		let plaintext = decrypt(&password_key, &stored.data).ok_or(WalletError::Locked)?;
		let key: [u8; 32] =
			plaintext.try_into().map_err(|_| WalletError::Corrupt("bad wallet key".to_string()))?;
		Ok(Zeroizing::new(key))
	}

	/// The password in the fan decrypts the wallet key, which in turn
	/// decrypts the check record back to its known plaintext.
	pub fn valid_password(&self) -> bool {
		let Ok(wallet_key) = self.wallet_key() else { return false };
		let Some(check) = self.value(&special_key(CHECK_SPECIAL)) else { return false };
		decrypt(&wallet_key, &check.data).is_some_and(|plaintext| plaintext == [0u8; 32])
	}

	/// Derive and try a password; on success the fan holds it.
	pub fn enter_password(&self, password: &str) -> Result<(), WalletError> {
		let derived = derive_key(&self.db.config.kdf, password, &self.salt()?)?;
		self.password.value_set(&derived);
		if self.valid_password() {
			Ok(())
		} else {
			self.password.value_set(&[0u8; 32]);
			Err(WalletError::BadPassword)
		}
	}

	pub fn lock(&self) {
		self.password.value_set(&[0u8; 32]);
	}

	/// Re-encrypt the wallet key under a new password. Entries are
	/// untouched.
	pub fn rekey(&self, new_password: &str) -> Result<(), WalletError> {
		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		let wallet_key = self.wallet_key()?;
		let new_key = derive_key(&self.db.config.kdf, new_password, &self.salt()?)?;
		let mut batch = WriteBatch::default();
		self.db.put(
			&mut batch,
			&self.id,
			&special_key(WALLET_KEY_SPECIAL),
			&WalletValue { data: encrypt(&new_key, &*wallet_key), work: 0 },
		);
		self.db.write(batch)?;
		self.password.value_set(&new_key);
		Ok(())
	}

	pub fn seed(&self) -> Result<RawKey, WalletError> {
		let wallet_key = self.wallet_key()?;
		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		let stored = self
			.value(&special_key(SEED_SPECIAL))
			.ok_or_else(|| WalletError::Corrupt("missing seed".to_string()))?;
		let plaintext = decrypt(&wallet_key, &stored.data)
			.ok_or_else(|| WalletError::Corrupt("undecryptable seed".to_string()))?;
		let seed: [u8; 32] =
			plaintext.try_into().map_err(|_| WalletError::Corrupt("bad seed".to_string()))?;
		Ok(Zeroizing::new(seed))
	}

	pub fn seed_set(&self, seed: &[u8; 32]) -> Result<(), WalletError> {
		let wallet_key = self.wallet_key()?;
		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		let mut batch = WriteBatch::default();
		self.db.put(
			&mut batch,
			&self.id,
			&special_key(SEED_SPECIAL),
			&WalletValue { data: encrypt(&wallet_key, seed), work: 0 },
		);
		self.db.write(batch)
	}

	pub fn deterministic_index(&self) -> u32 {
		self.value(&special_key(DETERMINISTIC_INDEX_SPECIAL))
			.and_then(|value| value.data.try_into().ok())
			.map(u32::from_be_bytes)
			.unwrap_or(0)
	}

	fn deterministic_index_set(
		&self,
		batch: &mut WriteBatch,
		index: u32,
	) {
		self.db.put(
			batch,
			&self.id,
			&special_key(DETERMINISTIC_INDEX_SPECIAL),
			&WalletValue { data: index.to_be_bytes().to_vec(), work: 0 },
		);
	}

	/// Derive the next seed slot, skipping any that already exist, and
	/// record it. Returns the new account.
	pub fn deterministic_insert(&self) -> Result<PublicKey, WalletError> {
		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		let seed = self.seed()?;
		let mut index = self.deterministic_index();
		let mut account = public_key_of(&deterministic_key(&seed, index));
		while self.exists(&account) {
			index += 1;
			account = public_key_of(&deterministic_key(&seed, index));
		}
		let mut batch = WriteBatch::default();
		self.db.put(
			&mut batch,
			&self.id,
			&account,
			&WalletValue {
				data: (DETERMINISTIC_MARKER | index as u64).to_be_bytes().to_vec(),
				work: 0,
			},
		);
		self.deterministic_index_set(&mut batch, index + 1);
		self.db.write(batch)?;
		Ok(account)
	}

	fn deterministic_insert_at(&self, index: u32) -> Result<PublicKey, WalletError> {
		let seed = self.seed()?;
		let account = public_key_of(&deterministic_key(&seed, index));
		let mut batch = WriteBatch::default();
		self.db.put(
			&mut batch,
			&self.id,
			&account,
			&WalletValue {
				data: (DETERMINISTIC_MARKER | index as u64).to_be_bytes().to_vec(),
				work: 0,
			},
		);
		self.db.write(batch)?;
		Ok(account)
	}

	/// Store an ad-hoc private key, encrypted with the wallet key.
	pub fn insert_adhoc(&self, prv: &[u8; 32]) -> Result<PublicKey, WalletError> {
		let wallet_key = self.wallet_key()?;
		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		let account = public_key_of(prv);
		let mut batch = WriteBatch::default();
		self.db.put(
			&mut batch,
			&self.id,
			&account,
			&WalletValue { data: encrypt(&wallet_key, prv), work: 0 },
		);
		self.db.write(batch)?;
		Ok(account)
	}

	pub fn exists(&self, account: &PublicKey) -> bool {
		!is_special(account) && self.value(account).is_some()
	}

	/// Recover the private key for `account`.
	pub fn fetch_key(&self, account: &PublicKey) -> Result<RawKey, WalletError> {
		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		let value = self.value(account).ok_or(WalletError::MissingKey)?;
		let prv = match value.data.len() {
			// Deterministic entry: marker | index.
			8 => {
				let marker = u64::from_be_bytes(
					value.data.try_into().expect("length checked"),
				);
				if marker & DETERMINISTIC_MARKER == 0 {
					return Err(WalletError::Corrupt("bad deterministic marker".to_string()))
				}
				let seed = self.seed()?;
				deterministic_key(&seed, marker as u32)
			},
			_ => {
				let wallet_key = self.wallet_key()?;
				let plaintext = decrypt(&wallet_key, &value.data)
					.ok_or_else(|| WalletError::Corrupt("undecryptable entry".to_string()))?;
				let prv: [u8; 32] = plaintext
					.try_into()
					.map_err(|_| WalletError::Corrupt("bad private key".to_string()))?;
				Zeroizing::new(prv)
			},
		};
		if public_key_of(&prv) != *account {
			return Err(WalletError::Corrupt("entry does not match its account".to_string()))
		}
		Ok(prv)
	}

	pub fn remove(&self, account: &PublicKey) -> Result<(), WalletError> {
		let mut batch = WriteBatch::default();
		self.db.delete(&mut batch, &self.id, account);
		self.db.write(batch)
	}

	/// All account entries, special records excluded.
	pub fn accounts(&self) -> Vec<PublicKey> {
		self.db
			.entry_keys(&self.id)
			.into_iter()
			.filter(|key| !is_special(key))
			.collect()
	}

	pub fn representative(&self) -> PublicKey {
		self.value(&special_key(REPRESENTATIVE_SPECIAL))
			.and_then(|value| value.data.try_into().ok())
			.unwrap_or([0u8; 32])
	}

	pub fn representative_set(&self, representative: &PublicKey) -> Result<(), WalletError> {
		let mut batch = WriteBatch::default();
		self.db.put(
			&mut batch,
			&self.id,
			&special_key(REPRESENTATIVE_SPECIAL),
			&WalletValue { data: representative.to_vec(), work: 0 },
		);
		self.db.write(batch)
	}

	pub fn work_get(&self, account: &PublicKey) -> Option<u64> {
		self.value(account).map(|value| value.work).filter(|work| *work != 0)
	}

	pub fn work_set(&self, account: &PublicKey, work: u64) -> Result<(), WalletError> {
		let mut value = self.value(account).ok_or(WalletError::MissingKey)?;
		value.work = work;
		let mut batch = WriteBatch::default();
		self.db.put(&mut batch, &self.id, account, &value);
		self.db.write(batch)
	}

	/// Replace the seed and materialize every already-used slot, probing
	/// `in_use` (typically "has blocks or pending") with a look-ahead
	/// window.
	pub fn change_seed(
		&self,
		seed: &[u8; 32],
		in_use: impl Fn(&PublicKey) -> bool,
	) -> Result<Vec<PublicKey>, WalletError> {
		const LOOK_AHEAD: u32 = 64;

		if !self.valid_password() {
			return Err(WalletError::Locked)
		}
		self.seed_set(seed)?;

		// Clear previous deterministic entries; they belong to the old
		// seed.
		let mut batch = WriteBatch::default();
		for account in self.accounts() {
			if let Some(value) = self.value(&account) {
				if value.data.len() == 8 {
					self.db.delete(&mut batch, &self.id, &account);
				}
			}
		}
		self.deterministic_index_set(&mut batch, 0);
		self.db.write(batch)?;

		// Find the highest slot the ledger knows about.
		let mut last_used: Option<u32> = None;
		let mut index = 0u32;
		loop {
			let account = public_key_of(&deterministic_key(seed, index));
			if in_use(&account) {
				last_used = Some(index);
			}
			if index >= last_used.map(|used| used + LOOK_AHEAD).unwrap_or(LOOK_AHEAD) {
				break
			}
			index += 1;
		}

		let count = last_used.map(|used| used + 1).unwrap_or(0).max(1);
		let mut inserted = Vec::with_capacity(count as usize);
		for index in 0..count {
			inserted.push(self.deterministic_insert_at(index)?);
		}
		let mut batch = WriteBatch::default();
		self.deterministic_index_set(&mut batch, count);
		self.db.write(batch)?;
		Ok(inserted)
	}
}
