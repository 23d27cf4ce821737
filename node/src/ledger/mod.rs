//! The ledger: strict validation and bookkeeping over account chains.
//!
//! `process` is the single mutating entry point for new blocks; `rollback`
//! undoes a chain segment back to a given block. Everything else is
//! read-only. All mutation happens inside a caller-provided write
//! transaction, and the block processor is the only caller that opens one.

mod rollback;
pub mod types;

#[cfg(test)]
mod tests;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use crate::{
	block::Block,
	constants,
	primitives::{Account, Amount, BlockHash, Link, Root},
	store::{Store, Transaction, WriteTransaction},
	work,
};

pub use rollback::RollbackError;
use types::{
	AccountInfo, BlockEntry, BlockInfo, BlockSideband, ConfirmationHeightInfo, Epoch,
	PendingInfo, PendingKey,
};

/// Outcome of ledger validation for one block. `Progress` is the only value
/// that mutates state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessResult {
	Progress,
	Old,
	GapPrevious,
	GapSource,
	BadSignature,
	NegativeSpend,
	Fork,
	Unreceivable,
	InsufficientWork,
	OpenedBurnAccount,
	BalanceMismatch,
	RepresentativeMismatch,
	BlockPosition,
	GapEpochOpenPending,
}

impl ProcessResult {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProcessResult::Progress => "progress",
			ProcessResult::Old => "old",
			ProcessResult::GapPrevious => "gap_previous",
			ProcessResult::GapSource => "gap_source",
			ProcessResult::BadSignature => "bad_signature",
			ProcessResult::NegativeSpend => "negative_spend",
			ProcessResult::Fork => "fork",
			ProcessResult::Unreceivable => "unreceivable",
			ProcessResult::InsufficientWork => "insufficient_work",
			ProcessResult::OpenedBurnAccount => "opened_burn_account",
			ProcessResult::BalanceMismatch => "balance_mismatch",
			ProcessResult::RepresentativeMismatch => "representative_mismatch",
			ProcessResult::BlockPosition => "block_position",
			ProcessResult::GapEpochOpenPending => "gap_epoch_open_pending",
		}
	}
}

/// Network-wide invariants the ledger enforces against.
#[derive(Clone)]
pub struct LedgerConstants {
	pub genesis: Block,
	pub genesis_account: Account,
	pub supply: Amount,
	pub burn_account: Account,
	pub epoch_1_link: Link,
	/// Epoch blocks may be signed by this account instead of the owner.
	pub epoch_signer: Account,
	pub work_threshold: u64,
	/// When set, freshly produced transactions use the state form even on
	/// legacy-headed accounts.
	pub state_block_generation_enabled: bool,
}

impl LedgerConstants {
	pub fn dev() -> Self {
		let genesis = constants::dev_genesis_block();
		let genesis_account = constants::dev_genesis_key().account();
		LedgerConstants {
			genesis,
			genesis_account,
			supply: constants::GENESIS_AMOUNT,
			burn_account: constants::BURN_ACCOUNT,
			epoch_1_link: constants::epoch_1_link(),
			epoch_signer: genesis_account,
			work_threshold: constants::WORK_THRESHOLD_DEV,
			state_block_generation_enabled: true,
		}
	}
}

/// In-memory mirror of the representation table, so vote tallying never
/// touches the database.
#[derive(Default)]
struct RepWeights {
	weights: Mutex<HashMap<Account, u128>>,
}

impl RepWeights {
	fn get(&self, representative: &Account) -> Amount {
		Amount::new(
			self.weights
				.lock()
				.expect("rep weights poisoned")
				.get(representative)
				.copied()
				.unwrap_or(0),
		)
	}

	fn add(&self, representative: &Account, amount: Amount) {
		let mut weights = self.weights.lock().expect("rep weights poisoned");
		let entry = weights.entry(*representative).or_insert(0);
		*entry = entry.saturating_add(amount.raw());
	}

	fn sub(&self, representative: &Account, amount: Amount) {
		let mut weights = self.weights.lock().expect("rep weights poisoned");
		let entry = weights.entry(*representative).or_insert(0);
		*entry = entry.saturating_sub(amount.raw());
		if *entry == 0 {
			weights.remove(representative);
		}
	}
}

pub struct Ledger {
	store: Arc<Store>,
	pub constants: LedgerConstants,
	rep_weights: Arc<RepWeights>,
}

fn seconds_since_epoch() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl Ledger {
	/// Open the ledger over `store`, writing the genesis state if the store
	/// is empty and loading the representation cache.
	pub fn new(store: Arc<Store>, constants: LedgerConstants) -> anyhow::Result<Self> {
		let ledger =
			Ledger { store, constants, rep_weights: Arc::new(RepWeights::default()) };

		let needs_genesis = {
			let txn = ledger.store.tx_begin_read();
			ledger.store.account_get(&txn, &ledger.constants.genesis_account).is_none()
		};
		if needs_genesis {
			let mut txn = ledger.store.tx_begin_write();
			ledger.initialize_genesis(&mut txn);
			txn.commit()?;
		}

		{
			let txn = ledger.store.tx_begin_read();
			for (representative, amount) in ledger.store.representation_iter(&txn) {
				ledger.rep_weights.add(&representative, amount);
			}
		}

		Ok(ledger)
	}

	fn initialize_genesis(&self, txn: &mut WriteTransaction) {
		let genesis = self.constants.genesis.clone();
		let hash = genesis.hash();
		let account = self.constants.genesis_account;

		self.store.block_put(
			txn,
			&hash,
			&BlockEntry {
				block: genesis,
				sideband: BlockSideband {
					successor: BlockHash::ZERO,
					account,
					balance: self.constants.supply,
					height: 1,
					timestamp: seconds_since_epoch(),
					epoch: Epoch::Epoch0,
				},
			},
		);
		self.store.account_put(
			txn,
			&account,
			&AccountInfo {
				head: hash,
				representative: account,
				open_block: hash,
				balance: self.constants.supply,
				modified: seconds_since_epoch(),
				block_count: 1,
				epoch: Epoch::Epoch0,
			},
		);
		self.store.frontier_put(txn, &hash, &account);
		self.store.checksum_update(txn, &hash);
		self.store
			.representation_put(txn, &account, self.constants.supply);
		// Genesis is born cemented.
		self.store.confirmation_height_put(
			txn,
			&account,
			&ConfirmationHeightInfo { height: 1, frontier: hash },
		);
	}

	pub fn store(&self) -> &Store {
		&self.store
	}

	/// Shift delegated weight onto a representative. The table is updated
	/// through the transaction; the in-memory cache follows only when the
	/// transaction commits, so an abort leaves both aligned.
	fn representation_add(
		&self,
		txn: &mut WriteTransaction,
		representative: &Account,
		amount: Amount,
	) {
		let updated = self.store.representation_get(txn, representative).saturating_add(amount);
		self.store.representation_put(txn, representative, updated);
		let weights = self.rep_weights.clone();
		let representative = *representative;
		txn.on_commit(move || weights.add(&representative, amount));
	}

	fn representation_sub(
		&self,
		txn: &mut WriteTransaction,
		representative: &Account,
		amount: Amount,
	) {
		let updated = self.store.representation_get(txn, representative).saturating_sub(amount);
		self.store.representation_put(txn, representative, updated);
		let weights = self.rep_weights.clone();
		let representative = *representative;
		txn.on_commit(move || weights.sub(&representative, amount));
	}

	// ===== read-only helpers =====

	pub fn weight(&self, representative: &Account) -> Amount {
		self.rep_weights.get(representative)
	}

	pub fn account_balance(&self, txn: &dyn Transaction, account: &Account) -> Amount {
		self.store.account_get(txn, account).map(|info| info.balance).unwrap_or(Amount::ZERO)
	}

	pub fn latest(&self, txn: &dyn Transaction, account: &Account) -> Option<BlockHash> {
		self.store.account_get(txn, account).map(|info| info.head)
	}

	pub fn block_exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
		self.store.block_exists(txn, hash)
	}

	pub fn block_exists_or_pruned(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
		self.store.block_exists(txn, hash) || self.store.pruned_exists(txn, hash)
	}

	pub fn block_get(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Block> {
		self.store.block_get(txn, hash).map(|entry| entry.block)
	}

	pub fn successor(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<BlockHash> {
		self.store
			.block_get(txn, hash)
			.map(|entry| entry.sideband.successor)
			.filter(|successor| !successor.is_zero())
	}

	pub fn block_account(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
		self.store.block_get(txn, hash).map(|entry| entry.sideband.account)
	}

	pub fn balance(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Amount> {
		// The sparse index short-circuits for deep history queries.
		if let Some(info) = self.store.block_info_get(txn, hash) {
			return Some(info.balance)
		}
		self.store.block_get(txn, hash).map(|entry| entry.sideband.balance)
	}

	/// Whether `hash` has been cemented.
	pub fn block_confirmed(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
		if self.store.pruned_exists(txn, hash) {
			return true
		}
		match self.store.block_get(txn, hash) {
			Some(entry) => {
				let confirmation =
					self.store.confirmation_height_get(txn, &entry.sideband.account);
				entry.sideband.height <= confirmation.height
			},
			None => false,
		}
	}

	/// All of a block's referents (previous, and source for receiving
	/// blocks) are cemented. Pruned referents count as cemented.
	pub fn dependents_confirmed(&self, txn: &dyn Transaction, block: &Block) -> bool {
		let previous_ok = {
			let previous = block.previous();
			previous.is_zero() || self.block_confirmed(txn, &previous)
		};
		let source_ok = {
			let source = match block {
				Block::State(state) => {
					// Only a receive's link references a block.
					let prior = self.balance(txn, &state.previous).unwrap_or(Amount::ZERO);
					if state.balance > prior && !state.link.is_zero() {
						Some(state.link.as_hash())
					} else {
						None
					}
				},
				_ => block.source_field(),
			};
			match source {
				Some(source) =>
					source == BlockHash(self.constants.genesis_account.0) ||
						self.block_confirmed(txn, &source),
				None => true,
			}
		};
		previous_ok && source_ok
	}

	pub fn representative_of(&self, txn: &dyn Transaction, mut hash: BlockHash) -> Account {
		// Walk back until a block that names a representative.
		loop {
			let Some(entry) = self.store.block_get(txn, &hash) else {
				return Account::ZERO
			};
			if let Some(representative) = entry.block.representative_field() {
				return representative
			}
			hash = entry.block.previous();
		}
	}

	pub fn epoch_from_link(&self, link: &Link) -> Option<Epoch> {
		(*link == self.constants.epoch_1_link).then_some(Epoch::Epoch1)
	}

	/// An account has anything receivable.
	pub fn receivable_any(&self, txn: &dyn Transaction, account: &Account) -> bool {
		self.store.pending_iter_account(txn, account).next().is_some()
	}

	// ===== pruning =====

	/// Delete up to `batch_size` cemented block bodies ending at `hash`,
	/// walking towards the account's open block. Hashes are retained in the
	/// pruned table. Returns the number of blocks pruned.
	pub fn pruning_action(
		&self,
		txn: &mut WriteTransaction,
		hash: &BlockHash,
		batch_size: u64,
	) -> u64 {
		let mut pruned = 0;
		let mut current = *hash;
		while pruned < batch_size && !current.is_zero() {
			let Some(entry) = self.store.block_get(txn, &current) else { break };
			if !self.block_confirmed(txn, &current) {
				warn!("Refusing to prune unconfirmed block {current:?}");
				break
			}
			// Never prune an account frontier or the genesis.
			let info = self.store.account_get(txn, &entry.sideband.account);
			if info.as_ref().map(|info| info.head) == Some(current) ||
				current == self.constants.genesis.hash()
			{
				break
			}
			self.store.block_del(txn, &current);
			self.store.block_info_del(txn, &current);
			self.store.pruned_put(txn, &current);
			pruned += 1;
			current = entry.block.previous();
		}
		pruned
	}

	// ===== process =====

	pub fn process(&self, txn: &mut WriteTransaction, block: &Block) -> ProcessResult {
		let hash = block.hash();
		if self.store.block_exists(txn, &hash) {
			return ProcessResult::Old
		}

		match block {
			Block::State(_) => self.process_state(txn, block, hash),
			Block::Open(_) => self.process_open(txn, block, hash),
			_ => self.process_legacy(txn, block, hash),
		}
	}

	fn process_state(
		&self,
		txn: &mut WriteTransaction,
		block: &Block,
		hash: BlockHash,
	) -> ProcessResult {
		let Block::State(state) = block else { unreachable!("dispatched on variant") };
		let account = state.account;
		let info = self.store.account_get(txn, &account);

		// Position checks before anything expensive.
		if let Some(info) = &info {
			if state.previous.is_zero() {
				return ProcessResult::Fork
			}
			if !self.store.block_exists(txn, &state.previous) {
				return ProcessResult::GapPrevious
			}
			if state.previous != info.head {
				return ProcessResult::Fork
			}
		} else {
			if !state.previous.is_zero() {
				return ProcessResult::GapPrevious
			}
			if account == self.constants.burn_account {
				return ProcessResult::OpenedBurnAccount
			}
		}

		if !work::valid_pow(&block.root(), state.work, self.constants.work_threshold) {
			return ProcessResult::InsufficientWork
		}

		let prior_balance = info.as_ref().map(|info| info.balance).unwrap_or(Amount::ZERO);
		let prior_epoch = info.as_ref().map(|info| info.epoch).unwrap_or_default();

		let is_epoch =
			self.epoch_from_link(&state.link).is_some() && state.balance == prior_balance;

		// Epoch blocks may carry the epoch signer's signature instead of
		// the account's.
		let signature_ok = block.verify_signature(&account) ||
			(is_epoch && block.verify_signature(&self.constants.epoch_signer));
		if !signature_ok {
			return ProcessResult::BadSignature
		}

		if is_epoch {
			return self.process_epoch(txn, state, hash, info)
		}

		let epoch = prior_epoch;
		if state.balance < prior_balance {
			// Send: link names the destination.
			let amount = prior_balance.checked_sub(state.balance).expect("checked above");
			self.apply_state(txn, state, hash, info, epoch);
			self.store.pending_put(
				txn,
				&PendingKey::new(state.link.as_account(), hash),
				&PendingInfo { source: account, amount, epoch },
			);
			ProcessResult::Progress
		} else if state.balance > prior_balance || !state.link.is_zero() {
			// Receive (open when no prior info): link names the source send.
			if state.link.is_zero() {
				return ProcessResult::BalanceMismatch
			}
			let source = state.link.as_hash();
			if !self.block_exists_or_pruned(txn, &source) {
				return ProcessResult::GapSource
			}
			let key = PendingKey::new(account, source);
			let Some(pending) = self.store.pending_get(txn, &key) else {
				return ProcessResult::Unreceivable
			};
			let expected =
				prior_balance.checked_add(pending.amount).unwrap_or(Amount::MAX);
			if state.balance != expected {
				return ProcessResult::BalanceMismatch
			}
			let epoch = epoch.max(pending.epoch);
			self.apply_state(txn, state, hash, info, epoch);
			self.store.pending_del(txn, &key);
			ProcessResult::Progress
		} else {
			// Same balance, zero link: a representative change.
			self.apply_state(txn, state, hash, info, epoch);
			ProcessResult::Progress
		}
	}

	fn process_epoch(
		&self,
		txn: &mut WriteTransaction,
		state: &crate::block::StateBlock,
		hash: BlockHash,
		info: Option<AccountInfo>,
	) -> ProcessResult {
		let account = state.account;
		match &info {
			Some(info) => {
				if info.epoch >= Epoch::Epoch1 {
					return ProcessResult::BlockPosition
				}
				// Epoch upgrades move no value and keep the representative.
				if state.representative != info.representative {
					return ProcessResult::RepresentativeMismatch
				}
			},
			None => {
				if state.balance != Amount::ZERO {
					return ProcessResult::BalanceMismatch
				}
				if state.representative != Account::ZERO {
					return ProcessResult::RepresentativeMismatch
				}
				// An epoch open is only meaningful for an account that has
				// something waiting for it.
				if !self.receivable_any(txn, &account) {
					return ProcessResult::GapEpochOpenPending
				}
			},
		}
		self.apply_state(txn, state, hash, info, Epoch::Epoch1);
		ProcessResult::Progress
	}

	/// Write a validated state block and update account/rep/frontier
	/// bookkeeping. Pending mutations stay with the caller.
	fn apply_state(
		&self,
		txn: &mut WriteTransaction,
		state: &crate::block::StateBlock,
		hash: BlockHash,
		info: Option<AccountInfo>,
		epoch: Epoch,
	) {
		let account = state.account;
		let height = info.as_ref().map(|info| info.block_count).unwrap_or(0) + 1;

		if let Some(info) = &info {
			self.representation_sub(txn, &info.representative, info.balance);
			self.store.block_successor_set(txn, &info.head, &hash);
			self.store.frontier_del(txn, &info.head);
			self.store.checksum_update(txn, &info.head);
		}
		self.representation_add(txn, &state.representative, state.balance);

		self.store.block_put(
			txn,
			&hash,
			&BlockEntry {
				block: Block::State(state.clone()),
				sideband: BlockSideband {
					successor: BlockHash::ZERO,
					account,
					balance: state.balance,
					height,
					timestamp: seconds_since_epoch(),
					epoch,
				},
			},
		);
		self.store.account_put(
			txn,
			&account,
			&AccountInfo {
				head: hash,
				representative: state.representative,
				open_block: info.as_ref().map(|info| info.open_block).unwrap_or(hash),
				balance: state.balance,
				modified: seconds_since_epoch(),
				block_count: height,
				epoch,
			},
		);
		self.store.frontier_put(txn, &hash, &account);
		self.store.checksum_update(txn, &hash);
		if height % constants::BLOCK_INFO_MAX == 0 {
			self.store
				.block_info_put(txn, &hash, &BlockInfo { account, balance: state.balance });
		}
	}

	fn process_open(
		&self,
		txn: &mut WriteTransaction,
		block: &Block,
		hash: BlockHash,
	) -> ProcessResult {
		let Block::Open(open) = block else { unreachable!("dispatched on variant") };
		let account = open.account;

		if self.store.account_get(txn, &account).is_some() {
			return ProcessResult::Fork
		}
		if account == self.constants.burn_account {
			return ProcessResult::OpenedBurnAccount
		}
		if !work::valid_pow(&block.root(), open.work, self.constants.work_threshold) {
			return ProcessResult::InsufficientWork
		}
		if !block.verify_signature(&account) {
			return ProcessResult::BadSignature
		}
		if !self.block_exists_or_pruned(txn, &open.source) {
			return ProcessResult::GapSource
		}
		let key = PendingKey::new(account, open.source);
		let Some(pending) = self.store.pending_get(txn, &key) else {
			return ProcessResult::Unreceivable
		};
		// A legacy open cannot represent an upgraded pending entry.
		if pending.epoch > Epoch::Epoch0 {
			return ProcessResult::GapEpochOpenPending
		}

		self.representation_add(txn, &open.representative, pending.amount);
		self.store.block_put(
			txn,
			&hash,
			&BlockEntry {
				block: block.clone(),
				sideband: BlockSideband {
					successor: BlockHash::ZERO,
					account,
					balance: pending.amount,
					height: 1,
					timestamp: seconds_since_epoch(),
					epoch: Epoch::Epoch0,
				},
			},
		);
		self.store.account_put(
			txn,
			&account,
			&AccountInfo {
				head: hash,
				representative: open.representative,
				open_block: hash,
				balance: pending.amount,
				modified: seconds_since_epoch(),
				block_count: 1,
				epoch: Epoch::Epoch0,
			},
		);
		self.store.pending_del(txn, &key);
		self.store.frontier_put(txn, &hash, &account);
		self.store.checksum_update(txn, &hash);
		ProcessResult::Progress
	}

	fn process_legacy(
		&self,
		txn: &mut WriteTransaction,
		block: &Block,
		hash: BlockHash,
	) -> ProcessResult {
		let previous_hash = block.previous();
		if !self.store.block_exists(txn, &previous_hash) {
			return ProcessResult::GapPrevious
		}
		// The previous block must still be the account's head; anything
		// else is a competing chain.
		let Some(account) = self.store.frontier_get(txn, &previous_hash) else {
			return ProcessResult::Fork
		};
		let info = self.store.account_get(txn, &account).expect("frontier implies account");
		// Legacy forms are closed off once an account upgrades.
		if info.epoch > Epoch::Epoch0 {
			return ProcessResult::BlockPosition
		}
		if !work::valid_pow(&block.root(), block.work(), self.constants.work_threshold) {
			return ProcessResult::InsufficientWork
		}
		if !block.verify_signature(&account) {
			return ProcessResult::BadSignature
		}

		let (new_balance, new_representative) = match block {
			Block::Send(send) => {
				if send.balance > info.balance {
					return ProcessResult::NegativeSpend
				}
				(send.balance, info.representative)
			},
			Block::Receive(receive) => {
				if !self.block_exists_or_pruned(txn, &receive.source) {
					return ProcessResult::GapSource
				}
				let key = PendingKey::new(account, receive.source);
				let Some(pending) = self.store.pending_get(txn, &key) else {
					return ProcessResult::Unreceivable
				};
				if pending.epoch > Epoch::Epoch0 {
					return ProcessResult::Unreceivable
				}
				self.store.pending_del(txn, &key);
				(
					info.balance.checked_add(pending.amount).unwrap_or(Amount::MAX),
					info.representative,
				)
			},
			Block::Change(change) => (info.balance, change.representative),
			_ => unreachable!("open and state are dispatched separately"),
		};

		if let Block::Send(send) = block {
			let amount = info.balance.checked_sub(send.balance).expect("checked above");
			self.store.pending_put(
				txn,
				&PendingKey::new(send.destination, hash),
				&PendingInfo { source: account, amount, epoch: Epoch::Epoch0 },
			);
		}

		self.representation_sub(txn, &info.representative, info.balance);
		self.representation_add(txn, &new_representative, new_balance);

		let height = info.block_count + 1;
		self.store.block_put(
			txn,
			&hash,
			&BlockEntry {
				block: block.clone(),
				sideband: BlockSideband {
					successor: BlockHash::ZERO,
					account,
					balance: new_balance,
					height,
					timestamp: seconds_since_epoch(),
					epoch: Epoch::Epoch0,
				},
			},
		);
		self.store.block_successor_set(txn, &previous_hash, &hash);
		self.store.account_put(
			txn,
			&account,
			&AccountInfo {
				head: hash,
				representative: new_representative,
				open_block: info.open_block,
				balance: new_balance,
				modified: seconds_since_epoch(),
				block_count: height,
				epoch: Epoch::Epoch0,
			},
		);
		self.store.frontier_del(txn, &previous_hash);
		self.store.frontier_put(txn, &hash, &account);
		self.store.checksum_update(txn, &previous_hash);
		self.store.checksum_update(txn, &hash);
		if height % constants::BLOCK_INFO_MAX == 0 {
			self.store.block_info_put(txn, &hash, &BlockInfo { account, balance: new_balance });
		}
		ProcessResult::Progress
	}

	/// The block currently occupying `root`'s position, if any: the
	/// successor of the root block, or the open block of the root account.
	pub fn block_at_root(&self, txn: &dyn Transaction, root: &Root) -> Option<Block> {
		if let Some(successor) = self.successor(txn, &root.as_hash()) {
			return self.block_get(txn, &successor)
		}
		self.store
			.account_get(txn, &root.as_account())
			.map(|info| info.open_block)
			.and_then(|open| self.block_get(txn, &open))
	}
}
