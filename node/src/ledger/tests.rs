use std::sync::Arc;

use super::{types::*, Ledger, LedgerConstants, ProcessResult, RollbackError};
use crate::{
	block::{Block, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock, StateBlock},
	constants::{dev_genesis_key, GENESIS_AMOUNT, WORK_THRESHOLD_DEV},
	primitives::{Account, Amount, BlockHash, KeyPair, Link, Root},
	store::Store,
	work,
};

struct Ctx {
	_dir: tempfile::TempDir,
	ledger: Ledger,
}

fn ctx() -> Ctx {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(Store::open(&dir.path().join("data.ldb")).unwrap());
	let ledger = Ledger::new(store, LedgerConstants::dev()).unwrap();
	Ctx { _dir: dir, ledger }
}

fn pow(root: impl Into<Root>) -> u64 {
	work::solve(&root.into(), WORK_THRESHOLD_DEV)
}

/// A send from `key`'s chain head leaving `balance` behind.
fn send(ledger: &Ledger, key: &KeyPair, destination: Account, balance: Amount) -> SendBlock {
	let txn = ledger.store().tx_begin_read();
	let previous = ledger.latest(&txn, &key.account()).unwrap();
	SendBlock::new(previous, destination, balance, key, pow(previous))
}

fn process(ledger: &Ledger, block: &Block) -> ProcessResult {
	let mut txn = ledger.store().tx_begin_write();
	let result = ledger.process(&mut txn, block);
	if result == ProcessResult::Progress {
		txn.commit().unwrap();
	} else {
		txn.abort();
	}
	result
}

/// Every unit is either on an account or in flight; their sum is constant.
fn assert_supply_invariant(ledger: &Ledger) {
	let txn = ledger.store().tx_begin_read();
	let mut total = Amount::ZERO;
	for (account, _) in ledger.store().account_iter(&txn, &Account::ZERO) {
		total = total.checked_add(ledger.account_balance(&txn, &account)).unwrap();
	}
	for (_, pending) in ledger.store().pending_iter_all(&txn) {
		total = total.checked_add(pending.amount).unwrap();
	}
	assert_eq!(total, GENESIS_AMOUNT);
}

#[test]
fn genesis_state() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key().account();
	let txn = ledger.store().tx_begin_read();
	assert_eq!(ledger.account_balance(&txn, &genesis), GENESIS_AMOUNT);
	assert_eq!(ledger.weight(&genesis), GENESIS_AMOUNT);
	let info = ledger.store().account_get(&txn, &genesis).unwrap();
	assert_eq!(info.block_count, 1);
	assert!(ledger.block_confirmed(&txn, &info.head));
	assert_supply_invariant(&ledger);
}

#[test]
fn send_receive_round_trip() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	let send = send(&ledger, &genesis, key.account(), GENESIS_AMOUNT.checked_sub(Amount::new(100)).unwrap());
	let send_hash = send.hash();
	assert_eq!(process(&ledger, &Block::Send(send)), ProcessResult::Progress);

	{
		let txn = ledger.store().tx_begin_read();
		assert_eq!(
			ledger.account_balance(&txn, &genesis.account()),
			GENESIS_AMOUNT.checked_sub(Amount::new(100)).unwrap()
		);
		let pending = ledger
			.store()
			.pending_get(&txn, &PendingKey::new(key.account(), send_hash))
			.unwrap();
		assert_eq!(pending.source, genesis.account());
		assert_eq!(pending.amount, Amount::new(100));
		assert_eq!(ledger.latest(&txn, &genesis.account()), Some(send_hash));
	}
	assert_supply_invariant(&ledger);

	let representative = KeyPair::generate().account();
	let open = OpenBlock::new(send_hash, representative, &key, pow(key.account()));
	assert_eq!(process(&ledger, &Block::Open(open.clone())), ProcessResult::Progress);

	let txn = ledger.store().tx_begin_read();
	assert_eq!(ledger.account_balance(&txn, &key.account()), Amount::new(100));
	assert_eq!(ledger.weight(&representative), Amount::new(100));
	assert!(ledger
		.store()
		.pending_get(&txn, &PendingKey::new(key.account(), send_hash))
		.is_none());
	assert_eq!(ledger.successor(&txn, &send_hash), None);
	drop(txn);
	assert_supply_invariant(&ledger);
}

#[test]
fn duplicate_block_is_old() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let send =
		Block::Send(send(&ledger, &genesis, Account([7u8; 32]), Amount::new(1_000_000)));
	assert_eq!(process(&ledger, &send), ProcessResult::Progress);
	assert_eq!(process(&ledger, &send), ProcessResult::Old);
}

#[test]
fn fork_at_same_previous() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let send1 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(10));
	let send2 = SendBlock::new(
		send1.previous,
		Account([2u8; 32]),
		Amount::new(20),
		&genesis,
		send1.work,
	);
	assert_eq!(process(&ledger, &Block::Send(send1)), ProcessResult::Progress);
	assert_eq!(process(&ledger, &Block::Send(send2)), ProcessResult::Fork);
}

#[test]
fn gap_previous_and_source() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let missing = BlockHash([42u8; 32]);

	let dangling = SendBlock::new(missing, Account([1u8; 32]), Amount::ZERO, &genesis, pow(missing));
	assert_eq!(process(&ledger, &Block::Send(dangling)), ProcessResult::GapPrevious);

	let key = KeyPair::generate();
	let open = OpenBlock::new(missing, key.account(), &key, pow(key.account()));
	assert_eq!(process(&ledger, &Block::Open(open)), ProcessResult::GapSource);
}

#[test]
fn negative_spend_is_rejected() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let send1 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(50));
	assert_eq!(process(&ledger, &Block::Send(send1)), ProcessResult::Progress);
	// "Sending" to a balance above the current one would mint.
	let send2 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(51));
	assert_eq!(process(&ledger, &Block::Send(send2)), ProcessResult::NegativeSpend);
}

#[test]
fn bad_signature_and_insufficient_work() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();

	let mut forged = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(1));
	forged.signature = crate::primitives::Signature([1u8; 64]);
	assert_eq!(process(&ledger, &Block::Send(forged)), ProcessResult::BadSignature);

	// Work sits outside the hash, so the signature stays valid.
	let mut weak = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(1));
	weak.work = work::solve_invalid(&weak.previous.into(), WORK_THRESHOLD_DEV);
	assert_eq!(process(&ledger, &Block::Send(weak)), ProcessResult::InsufficientWork);
}

#[test]
fn receive_without_pending_is_unreceivable() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	let send1 = send(&ledger, &genesis, key.account(), Amount::new(0));
	let send_hash = send1.hash();
	assert_eq!(process(&ledger, &Block::Send(send1)), ProcessResult::Progress);
	let open = OpenBlock::new(send_hash, key.account(), &key, pow(key.account()));
	assert_eq!(process(&ledger, &Block::Open(open.clone())), ProcessResult::Progress);

	// Receiving the same send twice.
	let receive =
		ReceiveBlock::new(open.hash(), send_hash, &key, pow(open.hash()));
	assert_eq!(process(&ledger, &Block::Receive(receive)), ProcessResult::Unreceivable);
}

#[test]
fn burn_account_cannot_be_opened() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let burn = Account([0u8; 32]);

	let send1 = send(&ledger, &genesis, burn, Amount::new(0));
	let send_hash = send1.hash();
	assert_eq!(process(&ledger, &Block::Send(send1)), ProcessResult::Progress);

	// Signed by an arbitrary key claiming the burn account.
	let key = KeyPair::generate();
	let mut open = OpenBlock::new(send_hash, burn, &key, pow(burn));
	open.account = burn;
	assert_eq!(process(&ledger, &Block::Open(open)), ProcessResult::OpenedBurnAccount);
	// The obligation stays pending forever.
	assert_supply_invariant(&ledger);
}

#[test]
fn change_moves_representation() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let representative = KeyPair::generate().account();

	let previous = {
		let txn = ledger.store().tx_begin_read();
		ledger.latest(&txn, &genesis.account()).unwrap()
	};
	let change = ChangeBlock::new(previous, representative, &genesis, pow(previous));
	assert_eq!(process(&ledger, &Block::Change(change)), ProcessResult::Progress);

	assert_eq!(ledger.weight(&genesis.account()), Amount::ZERO);
	assert_eq!(ledger.weight(&representative), GENESIS_AMOUNT);
}

#[test]
fn state_send_receive_round_trip() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	let previous = {
		let txn = ledger.store().tx_begin_read();
		ledger.latest(&txn, &genesis.account()).unwrap()
	};
	let balance = GENESIS_AMOUNT.checked_sub(Amount::new(250)).unwrap();
	let state_send = StateBlock::new(
		genesis.account(),
		previous,
		genesis.account(),
		balance,
		key.account().into(),
		&genesis,
		pow(previous),
	);
	let send_hash = state_send.hash();
	assert_eq!(process(&ledger, &Block::State(state_send)), ProcessResult::Progress);

	// State open: previous is zero, link is the source send.
	let state_open = StateBlock::new(
		key.account(),
		BlockHash::ZERO,
		key.account(),
		Amount::new(250),
		send_hash.into(),
		&key,
		pow(key.account()),
	);
	assert_eq!(process(&ledger, &Block::State(state_open)), ProcessResult::Progress);

	let txn = ledger.store().tx_begin_read();
	assert_eq!(ledger.account_balance(&txn, &key.account()), Amount::new(250));
	assert_eq!(ledger.weight(&key.account()), Amount::new(250));
	drop(txn);
	assert_supply_invariant(&ledger);
}

#[test]
fn state_receive_with_wrong_amount_is_balance_mismatch() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	let send1 = send(&ledger, &genesis, key.account(), GENESIS_AMOUNT.checked_sub(Amount::new(10)).unwrap());
	let send_hash = send1.hash();
	assert_eq!(process(&ledger, &Block::Send(send1)), ProcessResult::Progress);

	let open = StateBlock::new(
		key.account(),
		BlockHash::ZERO,
		key.account(),
		Amount::new(11),
		send_hash.into(),
		&key,
		pow(key.account()),
	);
	assert_eq!(process(&ledger, &Block::State(open)), ProcessResult::BalanceMismatch);
}

#[test]
fn epoch_upgrade_rules() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let link = ledger.constants.epoch_1_link;

	let previous = {
		let txn = ledger.store().tx_begin_read();
		ledger.latest(&txn, &genesis.account()).unwrap()
	};

	// Epoch block changing the representative is rejected.
	let bad = StateBlock::new(
		genesis.account(),
		previous,
		KeyPair::generate().account(),
		GENESIS_AMOUNT,
		link,
		&genesis,
		pow(previous),
	);
	assert_eq!(
		process(&ledger, &Block::State(bad)),
		ProcessResult::RepresentativeMismatch
	);

	let epoch = StateBlock::new(
		genesis.account(),
		previous,
		genesis.account(),
		GENESIS_AMOUNT,
		link,
		&genesis,
		pow(previous),
	);
	let epoch_hash = epoch.hash();
	assert_eq!(process(&ledger, &Block::State(epoch.clone())), ProcessResult::Progress);
	{
		let txn = ledger.store().tx_begin_read();
		let info = ledger.store().account_get(&txn, &genesis.account()).unwrap();
		assert_eq!(info.epoch, Epoch::Epoch1);
		// Value did not move.
		assert_eq!(info.balance, GENESIS_AMOUNT);
	}

	// Legacy blocks are closed off after the upgrade.
	let legacy = SendBlock::new(
		epoch_hash,
		Account([1u8; 32]),
		Amount::new(5),
		&genesis,
		pow(epoch_hash),
	);
	assert_eq!(process(&ledger, &Block::Send(legacy)), ProcessResult::BlockPosition);

	// A second upgrade is out of position.
	let again = StateBlock::new(
		genesis.account(),
		epoch_hash,
		genesis.account(),
		GENESIS_AMOUNT,
		link,
		&genesis,
		pow(epoch_hash),
	);
	assert_eq!(process(&ledger, &Block::State(again)), ProcessResult::BlockPosition);
}

#[test]
fn legacy_open_cannot_consume_upgraded_pending() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	// Upgrade genesis, then send from the upgraded chain: the pending entry
	// carries epoch 1.
	let previous = {
		let txn = ledger.store().tx_begin_read();
		ledger.latest(&txn, &genesis.account()).unwrap()
	};
	let epoch = StateBlock::new(
		genesis.account(),
		previous,
		genesis.account(),
		GENESIS_AMOUNT,
		ledger.constants.epoch_1_link,
		&genesis,
		pow(previous),
	);
	let epoch_hash = epoch.hash();
	assert_eq!(process(&ledger, &Block::State(epoch)), ProcessResult::Progress);

	let balance = GENESIS_AMOUNT.checked_sub(Amount::new(9)).unwrap();
	let state_send = StateBlock::new(
		genesis.account(),
		epoch_hash,
		genesis.account(),
		balance,
		key.account().into(),
		&genesis,
		pow(epoch_hash),
	);
	let send_hash = state_send.hash();
	assert_eq!(process(&ledger, &Block::State(state_send)), ProcessResult::Progress);

	let open = OpenBlock::new(send_hash, key.account(), &key, pow(key.account()));
	assert_eq!(process(&ledger, &Block::Open(open)), ProcessResult::GapEpochOpenPending);

	// The state form works.
	let state_open = StateBlock::new(
		key.account(),
		BlockHash::ZERO,
		key.account(),
		Amount::new(9),
		send_hash.into(),
		&key,
		pow(key.account()),
	);
	assert_eq!(process(&ledger, &Block::State(state_open)), ProcessResult::Progress);
	let txn = ledger.store().tx_begin_read();
	assert_eq!(
		ledger.store().account_get(&txn, &key.account()).unwrap().epoch,
		Epoch::Epoch1
	);
}

#[test]
fn rollback_round_trip_restores_state() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();

	let before = {
		let txn = ledger.store().tx_begin_read();
		ledger.store().account_get(&txn, &genesis.account()).unwrap()
	};
	let weight_before = ledger.weight(&genesis.account());

	let send1 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(77));
	let block = Block::Send(send1);
	assert_eq!(process(&ledger, &block), ProcessResult::Progress);

	let mut txn = ledger.store().tx_begin_write();
	let rolled_back = ledger.rollback(&mut txn, &block.hash()).unwrap();
	txn.commit().unwrap();
	assert_eq!(rolled_back, vec![block.clone()]);

	let txn = ledger.store().tx_begin_read();
	let after = ledger.store().account_get(&txn, &genesis.account()).unwrap();
	assert_eq!(after.head, before.head);
	assert_eq!(after.balance, before.balance);
	assert_eq!(after.block_count, before.block_count);
	assert_eq!(ledger.weight(&genesis.account()), weight_before);
	assert!(!ledger.block_exists(&txn, &block.hash()));
	assert!(ledger
		.store()
		.pending_get(&txn, &PendingKey::new(Account([1u8; 32]), block.hash()))
		.is_none());
	drop(txn);
	assert_supply_invariant(&ledger);

	// Re-applying after rollback reproduces the exact same state.
	assert_eq!(process(&ledger, &block), ProcessResult::Progress);
	let txn = ledger.store().tx_begin_read();
	assert_eq!(ledger.latest(&txn, &genesis.account()), Some(block.hash()));
}

#[test]
fn rollback_of_received_send_unwinds_receiver() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	let send1 = send(&ledger, &genesis, key.account(), GENESIS_AMOUNT.checked_sub(Amount::new(5)).unwrap());
	let send_hash = send1.hash();
	assert_eq!(process(&ledger, &Block::Send(send1)), ProcessResult::Progress);
	let open = OpenBlock::new(send_hash, key.account(), &key, pow(key.account()));
	assert_eq!(process(&ledger, &Block::Open(open)), ProcessResult::Progress);

	let mut txn = ledger.store().tx_begin_write();
	let rolled_back = ledger.rollback(&mut txn, &send_hash).unwrap();
	txn.commit().unwrap();

	// Both the send and the dependent open came out.
	assert_eq!(rolled_back.len(), 2);
	let txn = ledger.store().tx_begin_read();
	assert!(ledger.store().account_get(&txn, &key.account()).is_none());
	assert!(!ledger.block_exists(&txn, &send_hash));
	drop(txn);
	assert_supply_invariant(&ledger);
}

#[test]
fn aborted_transactions_leave_weights_untouched() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let destination = Account([1u8; 32]);

	let balance = GENESIS_AMOUNT.checked_sub(Amount::new(40)).unwrap();
	let block = Block::Send(send(&ledger, &genesis, destination, balance));
	assert_eq!(process(&ledger, &block), ProcessResult::Progress);
	assert_eq!(ledger.weight(&genesis.account()), balance);

	// A rollback that mutates state but is then abandoned must not move
	// the in-memory weights: quorum tallies read only the cache.
	let mut txn = ledger.store().tx_begin_write();
	ledger.rollback(&mut txn, &block.hash()).unwrap();
	txn.abort();

	assert_eq!(ledger.weight(&genesis.account()), balance);
	{
		let txn = ledger.store().tx_begin_read();
		assert_eq!(
			ledger.store().representation_get(&txn, &genesis.account()),
			balance
		);
		assert_eq!(ledger.latest(&txn, &genesis.account()), Some(block.hash()));
	}

	// A committed rollback applies the cache change exactly once.
	let mut txn = ledger.store().tx_begin_write();
	ledger.rollback(&mut txn, &block.hash()).unwrap();
	txn.commit().unwrap();
	assert_eq!(ledger.weight(&genesis.account()), GENESIS_AMOUNT);
	let txn = ledger.store().tx_begin_read();
	assert_eq!(
		ledger.store().representation_get(&txn, &genesis.account()),
		GENESIS_AMOUNT
	);
}

#[test]
fn cemented_block_cannot_be_rolled_back() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();

	let send1 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(3));
	let block = Block::Send(send1);
	assert_eq!(process(&ledger, &block), ProcessResult::Progress);

	// Cement it.
	{
		let mut txn = ledger.store().tx_begin_write();
		ledger.store().confirmation_height_put(
			&mut txn,
			&genesis.account(),
			&ConfirmationHeightInfo { height: 2, frontier: block.hash() },
		);
		txn.commit().unwrap();
	}

	let mut txn = ledger.store().tx_begin_write();
	assert_eq!(
		ledger.rollback(&mut txn, &block.hash()),
		Err(RollbackError::Cemented(block.hash()))
	);
	txn.abort();

	let txn = ledger.store().tx_begin_read();
	assert!(ledger.block_exists(&txn, &block.hash()));
	assert_eq!(ledger.latest(&txn, &genesis.account()), Some(block.hash()));
}

#[test]
fn pruning_keeps_hash_knowledge() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();

	let send1 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(4));
	let first = Block::Send(send1);
	assert_eq!(process(&ledger, &first), ProcessResult::Progress);
	let send2 = send(&ledger, &genesis, Account([1u8; 32]), Amount::new(2));
	let second = Block::Send(send2);
	assert_eq!(process(&ledger, &second), ProcessResult::Progress);

	// Cement up to the head, then prune below it.
	let mut txn = ledger.store().tx_begin_write();
	ledger.store().confirmation_height_put(
		&mut txn,
		&genesis.account(),
		&ConfirmationHeightInfo { height: 3, frontier: second.hash() },
	);
	let pruned = ledger.pruning_action(&mut txn, &first.hash(), 64);
	txn.commit().unwrap();
	assert_eq!(pruned, 1);

	let txn = ledger.store().tx_begin_read();
	assert!(!ledger.block_exists(&txn, &first.hash()));
	assert!(ledger.block_exists_or_pruned(&txn, &first.hash()));
	assert!(ledger.block_exists(&txn, &second.hash()));
}

#[test]
fn dependents_confirmed_follows_cementation() {
	let Ctx { _dir, ledger } = ctx();
	let genesis = dev_genesis_key();
	let key = KeyPair::generate();

	let send1 = send(&ledger, &genesis, key.account(), GENESIS_AMOUNT.checked_sub(Amount::new(8)).unwrap());
	let send_block = Block::Send(send1);
	assert_eq!(process(&ledger, &send_block), ProcessResult::Progress);

	let open = Block::Open(OpenBlock::new(
		send_block.hash(),
		key.account(),
		&key,
		pow(key.account()),
	));

	{
		let txn = ledger.store().tx_begin_read();
		// The send sits on cemented genesis.
		assert!(ledger.dependents_confirmed(&txn, &send_block));
		// The open's source is not cemented yet.
		assert!(!ledger.dependents_confirmed(&txn, &open));
	}

	let mut txn = ledger.store().tx_begin_write();
	ledger.store().confirmation_height_put(
		&mut txn,
		&genesis.account(),
		&ConfirmationHeightInfo { height: 2, frontier: send_block.hash() },
	);
	txn.commit().unwrap();

	let txn = ledger.store().tx_begin_read();
	assert!(ledger.dependents_confirmed(&txn, &open));
}
