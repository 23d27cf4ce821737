//! Cementation: durable, rollback-forbidden commitment of blocks. One task
//! drains the queue; every other component only enqueues.

use std::{
	collections::{HashSet, VecDeque},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
};

use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::{
	block::Block,
	ledger::{types::ConfirmationHeightInfo, Ledger},
	metrics,
	primitives::{Account, BlockHash},
};

/// Fired once per cemented block, in chain order per account.
#[derive(Clone, Debug)]
pub struct CementedEvent {
	pub block: Block,
	pub account: Account,
}

struct Inner {
	queue: VecDeque<BlockHash>,
	queued: HashSet<BlockHash>,
}

pub struct ConfirmingSet {
	ledger: Arc<Ledger>,
	inner: Mutex<Inner>,
	notify: Notify,
	stopped: AtomicBool,
	cemented: broadcast::Sender<CementedEvent>,
}

impl ConfirmingSet {
	pub fn new(ledger: Arc<Ledger>) -> Arc<Self> {
		let (cemented, _) = broadcast::channel(1024);
		Arc::new(ConfirmingSet {
			ledger,
			inner: Mutex::new(Inner { queue: VecDeque::new(), queued: HashSet::new() }),
			notify: Notify::new(),
			stopped: AtomicBool::new(false),
			cemented,
		})
	}

	/// Queue a block for cementation. Duplicates while queued are dropped.
	pub fn add(&self, hash: BlockHash) {
		{
			let mut inner = self.inner.lock().expect("confirming set poisoned");
			if !inner.queued.insert(hash) {
				return
			}
			inner.queue.push_back(hash);
		}
		self.notify.notify_one();
	}

	pub fn exists(&self, hash: &BlockHash) -> bool {
		self.inner.lock().expect("confirming set poisoned").queued.contains(hash)
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("confirming set poisoned").queue.len()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<CementedEvent> {
		self.cemented.subscribe()
	}

	pub fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}

	/// Drain loop; run as a dedicated task.
	pub async fn run(self: Arc<Self>) {
		loop {
			if self.stopped.load(Ordering::SeqCst) {
				break
			}
			let next = {
				let mut inner = self.inner.lock().expect("confirming set poisoned");
				let next = inner.queue.pop_front();
				if let Some(hash) = &next {
					inner.queued.remove(hash);
				}
				next
			};
			match next {
				Some(hash) => self.cement(&hash),
				None => self.notify.notified().await,
			}
		}
	}

	/// Advance the account's cemented frontier up to `hash`, firing one
	/// event per newly covered block in chain order. Idempotent: an
	/// already-covered hash is a no-op.
	fn cement(&self, hash: &BlockHash) {
		let store = self.ledger.store();
		let mut txn = store.tx_begin_write();

		let Some(entry) = store.block_get(&txn, hash) else {
			// Rolled back between queueing and cementation.
			warn!("Not cementing missing block {hash:?}");
			return
		};
		let account = entry.sideband.account;
		let confirmation = store.confirmation_height_get(&txn, &account);
		if entry.sideband.height <= confirmation.height {
			return
		}

		// Uncemented predecessors on the same chain go first.
		let mut chain = Vec::new();
		let mut cursor = *hash;
		loop {
			let Some(current) = store.block_get(&txn, &cursor) else { break };
			if current.sideband.height <= confirmation.height {
				break
			}
			cursor = current.block.previous();
			chain.push(current.block);
		}
		chain.reverse();

		store.confirmation_height_put(
			&mut txn,
			&account,
			&ConfirmationHeightInfo { height: entry.sideband.height, frontier: *hash },
		);
		if let Err(error) = txn.commit() {
			warn!("Failed to persist cementation of {hash:?}: {error:#}");
			return
		}

		debug!("Cemented {} block(s) up to {:?} for {:?}", chain.len(), hash, account);
		for block in chain {
			metrics::BLOCKS_CEMENTED.inc();
			let _ = self.cemented.send(CementedEvent { block, account });
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		block::SendBlock,
		constants::{dev_genesis_key, WORK_THRESHOLD_DEV},
		ledger::{LedgerConstants, ProcessResult},
		primitives::Amount,
		store::Store,
		work,
	};

	fn ledger() -> (tempfile::TempDir, Arc<Ledger>) {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(Store::open(&dir.path().join("data.ldb")).unwrap());
		(dir, Arc::new(Ledger::new(store, LedgerConstants::dev()).unwrap()))
	}

	fn push_send(ledger: &Ledger, balance: Amount) -> Block {
		let genesis = dev_genesis_key();
		let previous = {
			let txn = ledger.store().tx_begin_read();
			ledger.latest(&txn, &genesis.account()).unwrap()
		};
		let block = Block::Send(SendBlock::new(
			previous,
			Account([9u8; 32]),
			balance,
			&genesis,
			work::solve(&previous.into(), WORK_THRESHOLD_DEV),
		));
		let mut txn = ledger.store().tx_begin_write();
		assert_eq!(ledger.process(&mut txn, &block), ProcessResult::Progress);
		txn.commit().unwrap();
		block
	}

	#[tokio::test]
	async fn cements_chain_in_order_and_once() {
		let (_dir, ledger) = ledger();
		let first = push_send(&ledger, Amount::new(10));
		let second = push_send(&ledger, Amount::new(5));

		let set = ConfirmingSet::new(ledger.clone());
		let mut events = set.subscribe();
		let runner = tokio::spawn(set.clone().run());

		assert!(!set.exists(&second.hash()));
		set.add(second.hash());

		let event1 = tokio::time::timeout(Duration::from_secs(5), events.recv())
			.await
			.unwrap()
			.unwrap();
		let event2 = tokio::time::timeout(Duration::from_secs(5), events.recv())
			.await
			.unwrap()
			.unwrap();
		// Chain order: the earlier send first.
		assert_eq!(event1.block.hash(), first.hash());
		assert_eq!(event2.block.hash(), second.hash());

		{
			let txn = ledger.store().tx_begin_read();
			assert!(ledger.block_confirmed(&txn, &first.hash()));
			assert!(ledger.block_confirmed(&txn, &second.hash()));
		}

		// Re-adding an already cemented block emits nothing further.
		set.add(second.hash());
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(events.try_recv().is_err());

		set.stop();
		runner.await.unwrap();
	}
}
