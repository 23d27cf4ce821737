//! Ordered key-value storage under the ledger: named tables over rocksdb
//! column families, with read transactions and a single serialized write
//! transaction whose mutations stay invisible until commit.

use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashMap},
	fs,
	path::{Path, PathBuf},
	sync::{Mutex, MutexGuard},
};

use anyhow::{anyhow, bail, Context, Result};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::{
	ledger::types::{
		AccountInfo, BlockEntry, BlockInfo, ConfirmationHeightInfo, PendingInfo, PendingKey,
		UncheckedInfo,
	},
	primitives::{Account, Amount, BlockHash},
};

/// Bumped on any change to the persisted data format; migrations are
/// forward-only.
const LATEST_SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_KEY: &[u8; 17] = b"db_schema_version";
const NODE_ID_KEY: &[u8; 7] = b"node_id";

/// Name of the directory that backups go into (only created before
/// migrations).
const BACKUPS_DIRECTORY: &str = "backups";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Table {
	/// head block hash -> account
	Frontiers,
	/// account -> AccountInfo
	Accounts,
	/// (destination, send hash) -> PendingInfo
	Pending,
	/// block hash -> BlockEntry (body + sideband)
	Blocks,
	/// block hash -> BlockInfo, sparse
	BlocksInfo,
	/// representative account -> delegated amount
	Representation,
	/// (missing dependency, block hash) -> UncheckedInfo
	Unchecked,
	/// block hash -> (), bodies deleted by pruning
	Pruned,
	/// account -> ConfirmationHeightInfo
	ConfirmationHeight,
	/// (prefix, mask) -> xor accumulator of frontier hashes
	Checksum,
	/// voter account -> highest vote seen, for replay rejection
	Vote,
	/// schema version and node identity
	Meta,
}

impl Table {
	fn cf_name(self) -> &'static str {
		match self {
			Table::Frontiers => "frontiers",
			Table::Accounts => "accounts",
			Table::Pending => "pending",
			Table::Blocks => "blocks",
			Table::BlocksInfo => "blocks_info",
			Table::Representation => "representation",
			Table::Unchecked => "unchecked",
			Table::Pruned => "pruned",
			Table::ConfirmationHeight => "confirmation_height",
			Table::Checksum => "checksum",
			Table::Vote => "vote",
			Table::Meta => "meta",
		}
	}
}

const ALL_TABLES: [Table; 12] = [
	Table::Frontiers,
	Table::Accounts,
	Table::Pending,
	Table::Blocks,
	Table::BlocksInfo,
	Table::Representation,
	Table::Unchecked,
	Table::Pruned,
	Table::ConfirmationHeight,
	Table::Checksum,
	Table::Vote,
	Table::Meta,
];

pub struct Store {
	db: DB,
	/// Writes are globally serialized; a write transaction holds this for
	/// its whole lifetime.
	write_serializer: Mutex<()>,
}

/// Read-only view. Individual gets are consistent against committed state;
/// the single-writer discipline makes whole-transaction consistency hold in
/// practice.
pub struct ReadTransaction<'a> {
	db: &'a DB,
}

/// Buffered mutations over a set of tables. Reads through the transaction
/// observe its own uncommitted writes; nothing reaches the database until
/// `commit`. Registered commit actions fire only after the batch is
/// durably written, so in-memory caches stay aligned with the tables when
/// a transaction is aborted instead.
pub struct WriteTransaction<'a> {
	db: &'a DB,
	overlay: HashMap<&'static str, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
	on_commit: Vec<Box<dyn FnOnce() + Send>>,
	_guard: MutexGuard<'a, ()>,
}

pub trait Transaction {
	fn get_raw(&self, table: Table, key: &[u8]) -> Option<Vec<u8>>;

	/// Ascending iteration starting at `start` (inclusive), materialized in
	/// key order.
	fn iter_from(&self, table: Table, start: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>;
}

fn cf_handle(db: &DB, table: Table) -> &ColumnFamily {
	db.cf_handle(table.cf_name())
		.unwrap_or_else(|| panic!("missing column family {}", table.cf_name()))
}

impl Transaction for ReadTransaction<'_> {
	fn get_raw(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
		self.db
			.get_cf(cf_handle(self.db, table), key)
			.expect("database read should not fail")
	}

	fn iter_from(&self, table: Table, start: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
		let mode = IteratorMode::From(start, Direction::Forward);
		Box::new(
			self.db
				.iterator_cf(cf_handle(self.db, table), mode)
				.map(|item| item.expect("database iteration should not fail"))
				.map(|(key, value)| (key.to_vec(), value.to_vec())),
		)
	}
}

impl Transaction for WriteTransaction<'_> {
	fn get_raw(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
		if let Some(buffered) = self.overlay.get(table.cf_name()).and_then(|map| map.get(key)) {
			return buffered.clone()
		}
		self.db
			.get_cf(cf_handle(self.db, table), key)
			.expect("database read should not fail")
	}

	fn iter_from(&self, table: Table, start: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
		// Merge committed state with this transaction's buffered mutations.
		let mode = IteratorMode::From(start, Direction::Forward);
		let committed = self
			.db
			.iterator_cf(cf_handle(self.db, table), mode)
			.map(|item| item.expect("database iteration should not fail"))
			.map(|(key, value)| (key.to_vec(), value.to_vec()));

		let overlay: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
			.overlay
			.get(table.cf_name())
			.map(|map| {
				map.range(start.to_vec()..)
					.map(|(key, value)| (key.clone(), value.clone()))
					.collect()
			})
			.unwrap_or_default();

		Box::new(MergeIter {
			committed: committed.peekable(),
			overlay: overlay.into_iter().peekable(),
		})
	}
}

struct MergeIter<C, O>
where
	C: Iterator<Item = (Vec<u8>, Vec<u8>)>,
	O: Iterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
	committed: std::iter::Peekable<C>,
	overlay: std::iter::Peekable<O>,
}

impl<C, O> Iterator for MergeIter<C, O>
where
	C: Iterator<Item = (Vec<u8>, Vec<u8>)>,
	O: Iterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
	type Item = (Vec<u8>, Vec<u8>);

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			let order = match (self.committed.peek(), self.overlay.peek()) {
				(None, None) => return None,
				(Some(_), None) => Ordering::Less,
				(None, Some(_)) => Ordering::Greater,
				(Some((ck, _)), Some((ok, _))) => ck.cmp(ok),
			};
			match order {
				Ordering::Less => return self.committed.next(),
				Ordering::Greater => {
					let (key, value) = self.overlay.next().expect("peeked above");
					if let Some(value) = value {
						return Some((key, value))
					}
					// Deleted in this transaction and absent from committed
					// state: skip.
				},
				Ordering::Equal => {
					self.committed.next();
					let (key, value) = self.overlay.next().expect("peeked above");
					if let Some(value) = value {
						return Some((key, value))
					}
				},
			}
		}
	}
}

impl<'a> WriteTransaction<'a> {
	pub fn put_raw(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
		self.overlay.entry(table.cf_name()).or_default().insert(key, Some(value));
	}

	pub fn delete_raw(&mut self, table: Table, key: Vec<u8>) {
		self.overlay.entry(table.cf_name()).or_default().insert(key, None);
	}

	/// Run `action` after this transaction's batch is written; dropped
	/// silently on abort.
	pub fn on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
		self.on_commit.push(Box::new(action));
	}

	pub fn commit(self) -> Result<()> {
		let WriteTransaction { db, overlay, on_commit, _guard } = self;
		let mut batch = WriteBatch::default();
		for (cf_name, mutations) in &overlay {
			let cf = db
				.cf_handle(cf_name)
				.unwrap_or_else(|| panic!("missing column family {cf_name}"));
			for (key, value) in mutations {
				match value {
					Some(value) => batch.put_cf(cf, key, value),
					None => batch.delete_cf(cf, key),
				}
			}
		}
		db.write(batch).context("failed to commit write transaction")?;
		// Still under the write serializer, so cache updates land in the
		// same order as their table writes.
		for action in on_commit {
			action();
		}
		Ok(())
	}

	/// Drop all buffered mutations and commit actions without touching the
	/// database.
	pub fn abort(self) {}
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
	bincode::serialize(value).expect("serialization is not expected to fail")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
	bincode::deserialize(bytes).expect("database holds only values we wrote")
}

impl Store {
	pub fn open(path: &Path) -> Result<Self> {
		let is_existing_db = path.exists();

		let mut create_missing = Options::default();
		create_missing.create_missing_column_families(true);
		create_missing.create_if_missing(true);

		let descriptors = ALL_TABLES
			.iter()
			.map(|table| ColumnFamilyDescriptor::new(table.cf_name(), Options::default()));

		let db = DB::open_cf_descriptors(&create_missing, path, descriptors)
			.map_err(anyhow::Error::msg)
			.context(format!("Failed to open database at: {}", path.display()))?;

		if !is_existing_db {
			let mut batch = WriteBatch::default();
			batch.put_cf(
				db.cf_handle(Table::Meta.cf_name()).expect("created above"),
				SCHEMA_VERSION_KEY,
				LATEST_SCHEMA_VERSION.to_be_bytes(),
			);
			db.write(batch).context("Failed to write metadata to new db")?;
		}

		migrate_to_version(&db, path, is_existing_db, LATEST_SCHEMA_VERSION)?;

		Ok(Store { db, write_serializer: Mutex::new(()) })
	}

	pub fn tx_begin_read(&self) -> ReadTransaction<'_> {
		ReadTransaction { db: &self.db }
	}

	pub fn tx_begin_write(&self) -> WriteTransaction<'_> {
		let guard = self.write_serializer.lock().expect("write serializer poisoned");
		WriteTransaction {
			db: &self.db,
			overlay: HashMap::new(),
			on_commit: Vec::new(),
			_guard: guard,
		}
	}

	// ===== accounts =====

	pub fn account_get(&self, txn: &dyn Transaction, account: &Account) -> Option<AccountInfo> {
		txn.get_raw(Table::Accounts, account.as_bytes()).map(|bytes| decode(&bytes))
	}

	pub fn account_put(&self, txn: &mut WriteTransaction, account: &Account, info: &AccountInfo) {
		txn.put_raw(Table::Accounts, account.as_bytes().to_vec(), encode(info));
	}

	pub fn account_del(&self, txn: &mut WriteTransaction, account: &Account) {
		txn.delete_raw(Table::Accounts, account.as_bytes().to_vec());
	}

	/// Accounts in ascending id order starting at `start` (inclusive).
	pub fn account_iter<'txn>(
		&self,
		txn: &'txn dyn Transaction,
		start: &Account,
	) -> impl Iterator<Item = (Account, AccountInfo)> + 'txn {
		txn.iter_from(Table::Accounts, start.as_bytes()).map(|(key, value)| {
			let mut account = [0u8; 32];
			account.copy_from_slice(&key);
			(Account(account), decode(&value))
		})
	}

	// ===== blocks =====

	pub fn block_get(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<BlockEntry> {
		txn.get_raw(Table::Blocks, hash.as_bytes()).map(|bytes| decode(&bytes))
	}

	pub fn block_put(&self, txn: &mut WriteTransaction, hash: &BlockHash, entry: &BlockEntry) {
		txn.put_raw(Table::Blocks, hash.as_bytes().to_vec(), encode(entry));
	}

	pub fn block_del(&self, txn: &mut WriteTransaction, hash: &BlockHash) {
		txn.delete_raw(Table::Blocks, hash.as_bytes().to_vec());
	}

	pub fn block_exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
		txn.get_raw(Table::Blocks, hash.as_bytes()).is_some()
	}

	pub fn block_successor_set(
		&self,
		txn: &mut WriteTransaction,
		hash: &BlockHash,
		successor: &BlockHash,
	) {
		if let Some(mut entry) = self.block_get(txn, hash) {
			entry.sideband.successor = *successor;
			self.block_put(txn, hash, &entry);
		}
	}

	// ===== pending =====

	pub fn pending_get(&self, txn: &dyn Transaction, key: &PendingKey) -> Option<PendingInfo> {
		txn.get_raw(Table::Pending, &key.to_bytes()).map(|bytes| decode(&bytes))
	}

	pub fn pending_put(&self, txn: &mut WriteTransaction, key: &PendingKey, info: &PendingInfo) {
		txn.put_raw(Table::Pending, key.to_bytes().to_vec(), encode(info));
	}

	pub fn pending_del(&self, txn: &mut WriteTransaction, key: &PendingKey) {
		txn.delete_raw(Table::Pending, key.to_bytes().to_vec());
	}

	/// Pending entries owed to `destination`, in send-hash order.
	pub fn pending_iter_account<'txn>(
		&self,
		txn: &'txn dyn Transaction,
		destination: &Account,
	) -> impl Iterator<Item = (PendingKey, PendingInfo)> + 'txn {
		let destination = *destination;
		txn.iter_from(Table::Pending, destination.as_bytes())
			.map(|(key, value)| {
				(PendingKey::from_bytes(&key).expect("pending keys are 64 bytes"), decode(&value))
			})
			.take_while(move |(key, _)| key.destination == destination)
	}

	pub fn pending_iter_all<'txn>(
		&self,
		txn: &'txn dyn Transaction,
	) -> impl Iterator<Item = (PendingKey, PendingInfo)> + 'txn {
		txn.iter_from(Table::Pending, &[]).map(|(key, value)| {
			(PendingKey::from_bytes(&key).expect("pending keys are 64 bytes"), decode(&value))
		})
	}

	// ===== frontiers =====

	pub fn frontier_get(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
		txn.get_raw(Table::Frontiers, hash.as_bytes()).map(|bytes| decode(&bytes))
	}

	pub fn frontier_put(&self, txn: &mut WriteTransaction, hash: &BlockHash, account: &Account) {
		txn.put_raw(Table::Frontiers, hash.as_bytes().to_vec(), encode(account));
	}

	pub fn frontier_del(&self, txn: &mut WriteTransaction, hash: &BlockHash) {
		txn.delete_raw(Table::Frontiers, hash.as_bytes().to_vec());
	}

	// ===== representation =====

	pub fn representation_get(&self, txn: &dyn Transaction, account: &Account) -> Amount {
		txn.get_raw(Table::Representation, account.as_bytes())
			.map(|bytes| decode(&bytes))
			.unwrap_or(Amount::ZERO)
	}

	pub fn representation_put(
		&self,
		txn: &mut WriteTransaction,
		account: &Account,
		amount: Amount,
	) {
		if amount == Amount::ZERO {
			txn.delete_raw(Table::Representation, account.as_bytes().to_vec());
		} else {
			txn.put_raw(Table::Representation, account.as_bytes().to_vec(), encode(&amount));
		}
	}

	pub fn representation_iter<'txn>(
		&self,
		txn: &'txn dyn Transaction,
	) -> impl Iterator<Item = (Account, Amount)> + 'txn {
		txn.iter_from(Table::Representation, &[]).map(|(key, value)| {
			let mut account = [0u8; 32];
			account.copy_from_slice(&key);
			(Account(account), decode(&value))
		})
	}

	// ===== block info =====

	pub fn block_info_get(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<BlockInfo> {
		txn.get_raw(Table::BlocksInfo, hash.as_bytes()).map(|bytes| decode(&bytes))
	}

	pub fn block_info_put(&self, txn: &mut WriteTransaction, hash: &BlockHash, info: &BlockInfo) {
		txn.put_raw(Table::BlocksInfo, hash.as_bytes().to_vec(), encode(info));
	}

	pub fn block_info_del(&self, txn: &mut WriteTransaction, hash: &BlockHash) {
		txn.delete_raw(Table::BlocksInfo, hash.as_bytes().to_vec());
	}

	// ===== confirmation height =====

	pub fn confirmation_height_get(
		&self,
		txn: &dyn Transaction,
		account: &Account,
	) -> ConfirmationHeightInfo {
		txn.get_raw(Table::ConfirmationHeight, account.as_bytes())
			.map(|bytes| decode(&bytes))
			.unwrap_or_default()
	}

	pub fn confirmation_height_put(
		&self,
		txn: &mut WriteTransaction,
		account: &Account,
		info: &ConfirmationHeightInfo,
	) {
		txn.put_raw(Table::ConfirmationHeight, account.as_bytes().to_vec(), encode(info));
	}

	// ===== unchecked =====

	pub fn unchecked_put(
		&self,
		txn: &mut WriteTransaction,
		dependency: &BlockHash,
		info: &UncheckedInfo,
	) {
		let mut key = Vec::with_capacity(64);
		key.extend_from_slice(dependency.as_bytes());
		key.extend_from_slice(info.block.hash().as_bytes());
		txn.put_raw(Table::Unchecked, key, encode(info));
	}

	/// All blocks parked on `dependency`.
	pub fn unchecked_get(&self, txn: &dyn Transaction, dependency: &BlockHash) -> Vec<UncheckedInfo> {
		let prefix = dependency.as_bytes().to_vec();
		txn.iter_from(Table::Unchecked, &prefix)
			.take_while(|(key, _)| key.starts_with(&prefix))
			.map(|(_, value)| decode(&value))
			.collect()
	}

	pub fn unchecked_del(
		&self,
		txn: &mut WriteTransaction,
		dependency: &BlockHash,
		hash: &BlockHash,
	) {
		let mut key = Vec::with_capacity(64);
		key.extend_from_slice(dependency.as_bytes());
		key.extend_from_slice(hash.as_bytes());
		txn.delete_raw(Table::Unchecked, key);
	}

	pub fn unchecked_count(&self, txn: &dyn Transaction) -> usize {
		txn.iter_from(Table::Unchecked, &[]).count()
	}

	pub fn unchecked_iter<'txn>(
		&self,
		txn: &'txn dyn Transaction,
	) -> impl Iterator<Item = (BlockHash, UncheckedInfo)> + 'txn {
		txn.iter_from(Table::Unchecked, &[]).map(|(key, value)| {
			let mut dependency = [0u8; 32];
			dependency.copy_from_slice(&key[..32]);
			(BlockHash(dependency), decode(&value))
		})
	}

	// ===== pruned =====

	pub fn pruned_put(&self, txn: &mut WriteTransaction, hash: &BlockHash) {
		txn.put_raw(Table::Pruned, hash.as_bytes().to_vec(), Vec::new());
	}

	pub fn pruned_exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
		txn.get_raw(Table::Pruned, hash.as_bytes()).is_some()
	}

	// ===== checksum =====

	fn checksum_key(prefix: u64, mask: u8) -> [u8; 9] {
		let mut key = [0u8; 9];
		key[..8].copy_from_slice(&prefix.to_be_bytes());
		key[8] = mask;
		key
	}

	pub fn checksum_get(&self, txn: &dyn Transaction, prefix: u64, mask: u8) -> BlockHash {
		txn.get_raw(Table::Checksum, &Self::checksum_key(prefix, mask))
			.map(|bytes| decode(&bytes))
			.unwrap_or(BlockHash::ZERO)
	}

	pub fn checksum_put(
		&self,
		txn: &mut WriteTransaction,
		prefix: u64,
		mask: u8,
		hash: &BlockHash,
	) {
		txn.put_raw(Table::Checksum, Self::checksum_key(prefix, mask).to_vec(), encode(hash));
	}

	/// Fold a frontier hash in or out of the accumulator; xor makes insert
	/// and remove the same operation.
	pub fn checksum_update(&self, txn: &mut WriteTransaction, hash: &BlockHash) {
		let mut accumulator = self.checksum_get(txn, 0, 0);
		for (byte, other) in accumulator.0.iter_mut().zip(hash.0.iter()) {
			*byte ^= other;
		}
		self.checksum_put(txn, 0, 0, &accumulator);
	}

	// ===== votes =====

	pub fn vote_get(&self, txn: &dyn Transaction, voter: &Account) -> Option<Vec<u8>> {
		txn.get_raw(Table::Vote, voter.as_bytes())
	}

	pub fn vote_put(&self, txn: &mut WriteTransaction, voter: &Account, encoded: Vec<u8>) {
		txn.put_raw(Table::Vote, voter.as_bytes().to_vec(), encoded);
	}

	// ===== meta =====

	pub fn version(&self, txn: &dyn Transaction) -> Option<u32> {
		txn.get_raw(Table::Meta, SCHEMA_VERSION_KEY).map(|bytes| {
			let bytes: [u8; 4] = bytes.try_into().expect("version should be a u32");
			u32::from_be_bytes(bytes)
		})
	}

	/// This node's identity secret, proven over handshakes.
	pub fn node_id_get(&self, txn: &dyn Transaction) -> Option<[u8; 32]> {
		txn.get_raw(Table::Meta, NODE_ID_KEY).and_then(|bytes| bytes.try_into().ok())
	}

	pub fn node_id_put(&self, txn: &mut WriteTransaction, secret: &[u8; 32]) {
		txn.put_raw(Table::Meta, NODE_ID_KEY.to_vec(), secret.to_vec());
	}
}

fn read_schema_version(db: &DB) -> Result<u32> {
	db.get_cf(
		db.cf_handle(Table::Meta.cf_name()).expect("meta column exists"),
		SCHEMA_VERSION_KEY,
	)
	.context("Failed to read meta column")?
	.map(|version| {
		let version: [u8; 4] = version.try_into().expect("version should be a u32");
		u32::from_be_bytes(version)
	})
	.ok_or_else(|| anyhow!("Could not find db schema version"))
}

fn migrate_to_version(db: &DB, path: &Path, is_existing_db: bool, target_version: u32) -> Result<()> {
	let current_version = read_schema_version(db)?;

	match current_version.cmp(&target_version) {
		Ordering::Equal => Ok(()),
		Ordering::Greater => Err(anyhow!(
			"Database schema version {current_version} is ahead of the supported version {target_version}. Is this node up to date?"
		)),
		Ordering::Less => {
			if is_existing_db {
				info!(
					"Database backup created at {}",
					create_backup(path, current_version)
						.context("Failed to create database backup before migration")?
				);
			}
			// No migrations are defined yet; any lower version is from a
			// build that never shipped.
			bail!("Unexpected migration from version {current_version}")
		},
	}
}

// Creates a backup of the database folder to BACKUPS_DIRECTORY/backup_vx_xx
fn create_backup(path: &Path, schema_version: u32) -> Result<String> {
	let backup_dir_name = format!(
		"backup_v{}_{}_{}",
		schema_version,
		chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S"),
		path.file_name()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_else(|| "db".to_string()),
	);

	let backups_path: PathBuf =
		path.parent().map(|parent| parent.join(BACKUPS_DIRECTORY)).unwrap_or_default();
	if !backups_path.exists() {
		fs::create_dir_all(&backups_path).with_context(|| {
			format!("Failed to create backup directory {}", backups_path.display())
		})?;
	}

	let backup_dir_path = backups_path.join(backup_dir_name);
	if backup_dir_path.exists() {
		bail!("Backup directory already exists {}", backup_dir_path.display());
	}

	let mut copy_options = fs_extra::dir::CopyOptions::new();
	copy_options.copy_inside = true;
	fs_extra::dir::copy(path, &backup_dir_path, &copy_options)
		.map_err(anyhow::Error::msg)
		.context("Failed to copy db files for backup")?;

	Ok(backup_dir_path.display().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		block::{Block, SendBlock},
		ledger::types::{BlockSideband, Epoch},
		primitives::KeyPair,
	};

	fn open_store() -> (tempfile::TempDir, Store) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(&dir.path().join("data.ldb")).unwrap();
		(dir, store)
	}

	#[test]
	fn fresh_database_gets_latest_schema_version() {
		let (_dir, store) = open_store();
		let txn = store.tx_begin_read();
		assert_eq!(store.version(&txn), Some(LATEST_SCHEMA_VERSION));
	}

	#[test]
	fn write_transaction_buffers_until_commit() {
		let (_dir, store) = open_store();
		let account = Account([1u8; 32]);
		let info = AccountInfo {
			head: BlockHash([2u8; 32]),
			representative: Account([3u8; 32]),
			open_block: BlockHash([4u8; 32]),
			balance: Amount::new(5),
			modified: 6,
			block_count: 7,
			epoch: Epoch::Epoch0,
		};

		{
			let mut txn = store.tx_begin_write();
			store.account_put(&mut txn, &account, &info);
			// Visible inside the transaction...
			assert_eq!(store.account_get(&txn, &account), Some(info.clone()));
			txn.abort();
		}
		// ...but aborted, so not outside it.
		let read = store.tx_begin_read();
		assert_eq!(store.account_get(&read, &account), None);

		let mut txn = store.tx_begin_write();
		store.account_put(&mut txn, &account, &info);
		txn.commit().unwrap();
		let read = store.tx_begin_read();
		assert_eq!(store.account_get(&read, &account), Some(info));
	}

	#[test]
	fn merged_iteration_sees_buffered_writes_and_deletes() {
		let (_dir, store) = open_store();
		let mut txn = store.tx_begin_write();
		for i in 1u8..=3 {
			let info = AccountInfo {
				head: BlockHash([i; 32]),
				representative: Account([0u8; 32]),
				open_block: BlockHash([i; 32]),
				balance: Amount::new(i as u128),
				modified: 0,
				block_count: 1,
				epoch: Epoch::Epoch0,
			};
			store.account_put(&mut txn, &Account([i; 32]), &info);
		}
		txn.commit().unwrap();

		let mut txn = store.tx_begin_write();
		store.account_del(&mut txn, &Account([2u8; 32]));
		let info = AccountInfo {
			head: BlockHash([9u8; 32]),
			representative: Account([0u8; 32]),
			open_block: BlockHash([9u8; 32]),
			balance: Amount::new(9),
			modified: 0,
			block_count: 1,
			epoch: Epoch::Epoch0,
		};
		store.account_put(&mut txn, &Account([4u8; 32]), &info);

		let accounts: Vec<Account> =
			store.account_iter(&txn, &Account::ZERO).map(|(account, _)| account).collect();
		assert_eq!(accounts, vec![Account([1u8; 32]), Account([3u8; 32]), Account([4u8; 32])]);
	}

	#[test]
	fn pending_iteration_stays_within_account() {
		let (_dir, store) = open_store();
		let mut txn = store.tx_begin_write();
		let info = PendingInfo {
			source: Account([7u8; 32]),
			amount: Amount::new(1),
			epoch: Epoch::Epoch0,
		};
		store.pending_put(
			&mut txn,
			&PendingKey::new(Account([1u8; 32]), BlockHash([1u8; 32])),
			&info,
		);
		store.pending_put(
			&mut txn,
			&PendingKey::new(Account([1u8; 32]), BlockHash([2u8; 32])),
			&info,
		);
		store.pending_put(
			&mut txn,
			&PendingKey::new(Account([2u8; 32]), BlockHash([3u8; 32])),
			&info,
		);
		txn.commit().unwrap();

		let read = store.tx_begin_read();
		assert_eq!(store.pending_iter_account(&read, &Account([1u8; 32])).count(), 2);
		assert_eq!(store.pending_iter_account(&read, &Account([2u8; 32])).count(), 1);
		assert_eq!(store.pending_iter_account(&read, &Account([3u8; 32])).count(), 0);
	}

	#[test]
	fn block_round_trip_with_sideband() {
		let (_dir, store) = open_store();
		let key = KeyPair::generate();
		let block = Block::Send(SendBlock::new(
			BlockHash([1u8; 32]),
			Account([2u8; 32]),
			Amount::new(10),
			&key,
			0,
		));
		let entry = BlockEntry {
			block: block.clone(),
			sideband: BlockSideband {
				successor: BlockHash::ZERO,
				account: key.account(),
				balance: Amount::new(10),
				height: 2,
				timestamp: 1,
				epoch: Epoch::Epoch0,
			},
		};

		let mut txn = store.tx_begin_write();
		store.block_put(&mut txn, &block.hash(), &entry);
		txn.commit().unwrap();

		let read = store.tx_begin_read();
		assert_eq!(store.block_get(&read, &block.hash()), Some(entry));
		assert!(store.block_exists(&read, &block.hash()));
		assert!(!store.block_exists(&read, &BlockHash([9u8; 32])));
	}

	#[test]
	fn commit_actions_run_on_commit_and_not_on_abort() {
		use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

		let (_dir, store) = open_store();
		let counter = std::sync::Arc::new(AtomicU32::new(0));

		let mut txn = store.tx_begin_write();
		txn.on_commit({
			let counter = counter.clone();
			move || {
				counter.fetch_add(1, AtomicOrdering::SeqCst);
			}
		});
		txn.abort();
		assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);

		let mut txn = store.tx_begin_write();
		txn.on_commit({
			let counter = counter.clone();
			move || {
				counter.fetch_add(1, AtomicOrdering::SeqCst);
			}
		});
		txn.commit().unwrap();
		assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
	}

	#[test]
	fn checksum_xor_round_trip() {
		let (_dir, store) = open_store();
		let mut txn = store.tx_begin_write();
		let hash = BlockHash([5u8; 32]);
		store.checksum_update(&mut txn, &hash);
		assert_eq!(store.checksum_get(&txn, 0, 0), hash);
		// xor-ing the same hash again removes it
		store.checksum_update(&mut txn, &hash);
		assert_eq!(store.checksum_get(&txn, 0, 0), BlockHash::ZERO);
	}
}
