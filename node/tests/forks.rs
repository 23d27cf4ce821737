//! Fork resolution through the whole stack: publish both sides of a fork,
//! let a principal representative's final vote pick the winner, and watch
//! the loser get rolled back and the winner cemented.

use std::{sync::Arc, time::Duration};

use basalt_node::{
	block::{Block, ChangeBlock, SendBlock},
	block_processor::BlockSource,
	constants::{dev_genesis_key, GENESIS_AMOUNT, WORK_THRESHOLD_DEV},
	ledger::{types::PendingKey, LedgerConstants, ProcessResult},
	messages::Message,
	vote::Vote,
	work, Account, Amount, KeyPair, Node, Settings,
};

struct TestNode {
	_dir: tempfile::TempDir,
	node: Arc<Node>,
	representative: KeyPair,
}

/// A node whose whole voting weight is delegated to one representative.
async fn spawn_node_with_rep() -> TestNode {
	let dir = tempfile::tempdir().unwrap();
	let mut settings = Settings::default();
	settings.node.bootstrap_listen_port = 0;
	let node = Node::start(dir.path(), &settings, LedgerConstants::dev()).await.unwrap();

	let genesis = dev_genesis_key();
	let representative = KeyPair::generate();
	let previous = {
		let txn = node.ledger.store().tx_begin_read();
		node.ledger.latest(&txn, &genesis.account()).unwrap()
	};
	let change = Block::Change(ChangeBlock::new(
		previous,
		representative.account(),
		&genesis,
		work::solve(&previous.into(), WORK_THRESHOLD_DEV),
	));
	assert_eq!(
		node.processor.process_and_wait(change, BlockSource::Local).await,
		ProcessResult::Progress
	);
	assert_eq!(node.ledger.weight(&representative.account()), GENESIS_AMOUNT);

	TestNode { _dir: dir, node, representative }
}

fn fork_pair(node: &Node) -> (Block, Block) {
	let genesis = dev_genesis_key();
	let previous = {
		let txn = node.ledger.store().tx_begin_read();
		node.ledger.latest(&txn, &genesis.account()).unwrap()
	};
	let pow = work::solve(&previous.into(), WORK_THRESHOLD_DEV);
	let send_a = Block::Send(SendBlock::new(
		previous,
		Account([0xAAu8; 32]),
		GENESIS_AMOUNT.checked_sub(Amount::new(100)).unwrap(),
		&genesis,
		pow,
	));
	let send_b = Block::Send(SendBlock::new(
		previous,
		Account([0xBBu8; 32]),
		GENESIS_AMOUNT.checked_sub(Amount::new(200)).unwrap(),
		&genesis,
		pow,
	));
	(send_a, send_b)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
	for _ in 0..200 {
		if check() {
			return
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("condition not reached within timeout");
}

#[tokio::test]
async fn majority_final_vote_replaces_the_resident_fork() {
	let ctx = spawn_node_with_rep().await;
	let (node, representative) = (ctx.node.clone(), ctx.representative.clone());
	let (send_a, send_b) = fork_pair(&node);
	let root = send_a.root();

	// A lands first and takes the ledger position; B forks in afterwards.
	node.handle_message(Message::Publish { block: send_a.clone() });
	node.processor.flush().await;
	node.handle_message(Message::Publish { block: send_b.clone() });
	node.processor.flush().await;
	{
		let txn = node.ledger.store().tx_begin_read();
		assert!(node.ledger.block_exists(&txn, &send_a.hash()));
		assert!(!node.ledger.block_exists(&txn, &send_b.hash()));
	}
	let election = node.active.election(&root).expect("fork started an election");
	assert!(election.contains(&send_a.hash()));
	assert!(election.contains(&send_b.hash()));

	// The representative votes finally for B.
	let vote = Vote::new_final(&representative, vec![send_b.hash()]);
	node.handle_message(Message::ConfirmAck { vote });

	// The loser is rolled back, the winner applied and cemented.
	{
		let node = node.clone();
		let send_b = send_b.clone();
		wait_until(move || {
			let txn = node.ledger.store().tx_begin_read();
			node.ledger.block_confirmed(&txn, &send_b.hash())
		})
		.await;
	}

	let txn = node.ledger.store().tx_begin_read();
	let genesis = dev_genesis_key().account();
	assert_eq!(node.ledger.latest(&txn, &genesis), Some(send_b.hash()));
	assert!(!node.ledger.block_exists(&txn, &send_a.hash()));
	assert_eq!(
		node.ledger.account_balance(&txn, &genesis),
		GENESIS_AMOUNT.checked_sub(Amount::new(200)).unwrap()
	);
	assert!(node
		.ledger
		.store()
		.pending_get(&txn, &PendingKey::new(Account([0xBBu8; 32]), send_b.hash()))
		.is_some());
	assert!(node
		.ledger
		.store()
		.pending_get(&txn, &PendingKey::new(Account([0xAAu8; 32]), send_a.hash()))
		.is_none());
	drop(txn);

	node.stop().await;
}

#[tokio::test]
async fn cemented_winner_shuts_out_later_forks() {
	let ctx = spawn_node_with_rep().await;
	let (node, representative) = (ctx.node.clone(), ctx.representative.clone());
	let (send_a, send_b) = fork_pair(&node);

	node.handle_message(Message::Publish { block: send_a.clone() });
	node.processor.flush().await;
	let vote = Vote::new_final(&representative, vec![send_a.hash()]);
	node.handle_message(Message::ConfirmAck { vote });
	{
		let node = node.clone();
		let send_a = send_a.clone();
		wait_until(move || {
			let txn = node.ledger.store().tx_begin_read();
			node.ledger.block_confirmed(&txn, &send_a.hash())
		})
		.await;
	}

	// The settled root ignores the competing block entirely.
	node.handle_message(Message::Publish { block: send_b.clone() });
	node.processor.flush().await;

	let txn = node.ledger.store().tx_begin_read();
	assert!(node.ledger.block_exists(&txn, &send_a.hash()));
	assert!(!node.ledger.block_exists(&txn, &send_b.hash()));
	assert_eq!(
		node.ledger.latest(&txn, &dev_genesis_key().account()),
		Some(send_a.hash())
	);
	drop(txn);

	// Late votes for the settled root are replays.
	let late = Vote::new(&representative, 1, vec![send_a.hash()]);
	let codes = node.router.vote(&late);
	assert_eq!(codes.get(&send_a.hash()), Some(&basalt_node::VoteCode::Replay));

	node.stop().await;
}
