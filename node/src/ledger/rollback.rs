//! Undoing chain segments. Rollback reverses every mutation `process` made,
//! newest block first, and refuses to cross a cemented frontier.

use thiserror::Error;
use tracing::{debug, error};

use crate::{
	block::Block,
	ledger::{
		types::{AccountInfo, PendingInfo, PendingKey},
		Ledger,
	},
	metrics,
	primitives::{Account, Amount, BlockHash},
	store::WriteTransaction,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RollbackError {
	/// The segment contains a cemented block. If the protocol is obeyed
	/// this cannot happen; it is logged and counted when it does.
	#[error("block {0} is cemented and cannot be rolled back")]
	Cemented(BlockHash),
	#[error("block {0} is not in the ledger")]
	MissingBlock(BlockHash),
}

impl Ledger {
	/// Roll back `hash` and every later block on its account chain,
	/// including any blocks on other chains that received from the rolled
	/// back segment. Returns the removed blocks, newest first.
	///
	/// On error the transaction may hold partial mutations; the caller is
	/// expected to abort it. Aborting is safe: the weight cache only moves
	/// when the transaction commits.
	pub fn rollback(
		&self,
		txn: &mut WriteTransaction,
		hash: &BlockHash,
	) -> Result<Vec<Block>, RollbackError> {
		let entry =
			self.store.block_get(txn, hash).ok_or(RollbackError::MissingBlock(*hash))?;
		if self.block_confirmed(txn, hash) {
			metrics::ROLLBACK_FAILED.inc();
			error!("Refusing rollback of cemented block {hash:?}");
			return Err(RollbackError::Cemented(*hash))
		}
		let account = entry.sideband.account;

		let mut rolled_back = Vec::new();
		while self.store.block_exists(txn, hash) {
			let info = self
				.store
				.account_get(txn, &account)
				.ok_or(RollbackError::MissingBlock(*hash))?;
			self.rollback_head(txn, &account, info, &mut rolled_back)?;
		}
		debug!("Rolled back {} block(s) from {:?}", rolled_back.len(), account);
		Ok(rolled_back)
	}

	/// Reverse exactly the head block of `account`.
	fn rollback_head(
		&self,
		txn: &mut WriteTransaction,
		account: &Account,
		info: AccountInfo,
		rolled_back: &mut Vec<Block>,
	) -> Result<(), RollbackError> {
		let head = info.head;
		let entry =
			self.store.block_get(txn, &head).ok_or(RollbackError::MissingBlock(head))?;

		let confirmation = self.store.confirmation_height_get(txn, account);
		if entry.sideband.height <= confirmation.height {
			metrics::ROLLBACK_FAILED.inc();
			error!("Refusing rollback of cemented block {head:?}");
			return Err(RollbackError::Cemented(head))
		}

		let previous_hash = entry.block.previous();
		let previous_balance = if previous_hash.is_zero() {
			Amount::ZERO
		} else {
			self.store
				.block_get(txn, &previous_hash)
				.ok_or(RollbackError::MissingBlock(previous_hash))?
				.sideband
				.balance
		};
		let balance = entry.sideband.balance;

		if balance < previous_balance {
			// A send. If its pending entry is gone the destination has
			// already received; unwind the destination chain until the
			// entry reappears.
			let destination = match &entry.block {
				Block::Send(send) => send.destination,
				Block::State(state) => state.link.as_account(),
				_ => unreachable!("only sends decrease balance"),
			};
			let key = PendingKey::new(destination, head);
			while self.store.pending_get(txn, &key).is_none() {
				let destination_head = self
					.latest(txn, &destination)
					.ok_or(RollbackError::MissingBlock(head))?;
				self.rollback(txn, &destination_head)?;
			}
			self.store.pending_del(txn, &key);
		} else if balance > previous_balance {
			// A receive or open: restore the obligation it consumed.
			let source = match &entry.block {
				Block::State(state) => state.link.as_hash(),
				block => block.source_field().expect("only receiving blocks increase balance"),
			};
			let amount = balance.checked_sub(previous_balance).expect("checked above");
			let (source_account, source_epoch) = self
				.store
				.block_get(txn, &source)
				.map(|source_entry| (source_entry.sideband.account, source_entry.sideband.epoch))
				.unwrap_or((Account::ZERO, entry.sideband.epoch));
			self.store.pending_put(
				txn,
				&PendingKey::new(*account, source),
				&PendingInfo { source: source_account, amount, epoch: source_epoch },
			);
		}

		// Reverse representation.
		self.representation_sub(txn, &info.representative, balance);

		if previous_hash.is_zero() {
			self.store.account_del(txn, account);
		} else {
			let previous_entry = self
				.store
				.block_get(txn, &previous_hash)
				.ok_or(RollbackError::MissingBlock(previous_hash))?;
			let representative = self.representative_of(txn, previous_hash);
			self.representation_add(txn, &representative, previous_balance);
			self.store.account_put(
				txn,
				account,
				&AccountInfo {
					head: previous_hash,
					representative,
					open_block: info.open_block,
					balance: previous_balance,
					modified: entry.sideband.timestamp,
					block_count: entry.sideband.height - 1,
					epoch: previous_entry.sideband.epoch,
				},
			);
			self.store.block_successor_set(txn, &previous_hash, &BlockHash::ZERO);
			self.store.frontier_put(txn, &previous_hash, account);
			self.store.checksum_update(txn, &previous_hash);
		}

		self.store.frontier_del(txn, &head);
		self.store.checksum_update(txn, &head);
		self.store.block_info_del(txn, &head);
		self.store.block_del(txn, &head);
		rolled_back.push(entry.block);
		Ok(())
	}
}
