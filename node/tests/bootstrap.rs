//! End-to-end bootstrap over localhost TCP: two full nodes, one ahead of
//! the other, synchronised by frontier comparison plus bulk pull/push.

use std::{
	net::SocketAddr,
	sync::Arc,
	time::Duration,
};

use basalt_node::{
	block::{Block, OpenBlock, SendBlock},
	block_processor::BlockSource,
	constants::{dev_genesis_key, GENESIS_AMOUNT, WORK_THRESHOLD_DEV},
	ledger::{LedgerConstants, ProcessResult},
	work, Account, Amount, KeyPair, Node, Settings,
};

struct TestNode {
	_dir: tempfile::TempDir,
	node: Arc<Node>,
}

async fn spawn_node() -> TestNode {
	let dir = tempfile::tempdir().unwrap();
	let mut settings = Settings::default();
	settings.node.bootstrap_listen_port = 0;
	settings.bootstrap.base_connections = 2;
	settings.bootstrap.max_connections = 4;
	let node = Node::start(dir.path(), &settings, LedgerConstants::dev()).await.unwrap();
	TestNode { _dir: dir, node }
}

fn peer_of(node: &Node) -> SocketAddr {
	SocketAddr::from(([127, 0, 0, 1], node.bootstrap_listen_addr().port()))
}

/// Grow a small lattice: several sends from genesis, each opened by its
/// destination account.
async fn grow_chain(node: &Node, accounts: usize) -> u64 {
	let genesis = dev_genesis_key();
	let mut created = 0u64;
	let mut remaining = GENESIS_AMOUNT;

	for index in 0..accounts {
		let key = KeyPair::from_secret_bytes([index as u8 + 10; 32]);
		let previous = {
			let txn = node.ledger.store().tx_begin_read();
			node.ledger.latest(&txn, &genesis.account()).unwrap()
		};
		remaining = remaining.checked_sub(Amount::new(1000)).unwrap();
		let send = Block::Send(SendBlock::new(
			previous,
			key.account(),
			remaining,
			&genesis,
			work::solve(&previous.into(), WORK_THRESHOLD_DEV),
		));
		assert_eq!(
			node.processor.process_and_wait(send.clone(), BlockSource::Local).await,
			ProcessResult::Progress
		);
		let open = Block::Open(OpenBlock::new(
			send.hash(),
			key.account(),
			&key,
			work::solve(&key.account().into(), WORK_THRESHOLD_DEV),
		));
		assert_eq!(
			node.processor.process_and_wait(open, BlockSource::Local).await,
			ProcessResult::Progress
		);
		created += 2;
	}
	created
}

fn frontier_of(node: &Node, account: &Account) -> Option<basalt_node::BlockHash> {
	let txn = node.ledger.store().tx_begin_read();
	node.ledger.latest(&txn, account)
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
async fn pull_synchronises_a_fresh_node_and_is_idempotent() {
	let source = spawn_node().await;
	let created = grow_chain(&source.node, 4).await;

	let fresh = spawn_node().await;
	let summary = fresh
		.node
		.bootstrapper
		.bootstrap(vec![peer_of(&source.node)])
		.await
		.unwrap();
	assert!(summary.pulled_blocks >= created, "pulled {} of {created}", summary.pulled_blocks);

	fresh.node.processor.flush().await;
	// Frontiers agree for every account.
	let genesis = dev_genesis_key().account();
	assert_eq!(frontier_of(&fresh.node, &genesis), frontier_of(&source.node, &genesis));
	for index in 0..4u8 {
		let account = KeyPair::from_secret_bytes([index + 10; 32]).account();
		assert_eq!(
			frontier_of(&fresh.node, &account),
			frontier_of(&source.node, &account),
			"account {index} frontier mismatch"
		);
	}

	// Pulling again against an unchanged peer moves nothing.
	let again = fresh
		.node
		.bootstrapper
		.bootstrap(vec![peer_of(&source.node)])
		.await
		.unwrap();
	assert_eq!(again.pulled_blocks, 0);

	source.node.stop().await;
	fresh.node.stop().await;
}

#[tokio::test]
async fn push_delivers_our_chain_to_a_stale_peer() {
	let ahead = spawn_node().await;
	grow_chain(&ahead.node, 2).await;

	let stale = spawn_node().await;
	let summary = ahead
		.node
		.bootstrapper
		.bootstrap(vec![peer_of(&stale.node)])
		.await
		.unwrap();
	assert_eq!(summary.pulled_blocks, 0);
	assert!(summary.pushed_blocks > 0);

	// The pushed blocks land through the stale node's processor; gaps
	// resolve as parents arrive.
	let genesis = dev_genesis_key().account();
	let expected = frontier_of(&ahead.node, &genesis);
	wait_until(|| frontier_of(&stale.node, &genesis) == expected).await;
	for index in 0..2u8 {
		let account = KeyPair::from_secret_bytes([index + 10; 32]).account();
		let expected = frontier_of(&ahead.node, &account);
		wait_until(|| frontier_of(&stale.node, &account) == expected).await;
	}

	ahead.node.stop().await;
	stale.node.stop().await;
}

#[tokio::test]
async fn bootstrap_in_progress_observer_fires() {
	let source = spawn_node().await;
	grow_chain(&source.node, 1).await;
	let fresh = spawn_node().await;

	let mut watch = fresh.node.bootstrapper.subscribe_in_progress();
	assert!(!*watch.borrow());

	let bootstrapper = fresh.node.bootstrapper.clone();
	let peer = peer_of(&source.node);
	let attempt = tokio::spawn(async move { bootstrapper.bootstrap(vec![peer]).await });

	// Flips on while the attempt runs, and off at the end.
	watch.changed().await.unwrap();
	assert!(*watch.borrow());
	attempt.await.unwrap().unwrap();
	assert!(!*watch.borrow());

	source.node.stop().await;
	fresh.node.stop().await;
}
