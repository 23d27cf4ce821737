//! Wallet actions: the bridge between the encrypted key container and the
//! ledger. A single task drains a priority-ordered queue of actions; each
//! action signs a block and pushes it through the block processor, waiting
//! for the verdict so callers observe their own writes.

use std::{
	cmp::Ordering,
	collections::{BinaryHeap, HashMap},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
		Arc, Mutex,
	},
};

use basalt_wallet::{Wallet, WalletDb, WalletError, WalletId};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info_span, Instrument};

use crate::{
	block::{Block, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock, StateBlock},
	block_processor::{BlockProcessor, BlockSource},
	ledger::{types::PendingKey, Ledger, ProcessResult},
	primitives::{Account, Amount, BlockHash, KeyPair},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalletActionError {
	#[error(transparent)]
	Wallet(#[from] WalletError),
	#[error("account not found in ledger")]
	AccountMissing,
	#[error("insufficient balance")]
	InsufficientBalance,
	#[error("nothing pending for this source")]
	NothingPending,
	#[error("no cached work for account")]
	WorkMissing,
	#[error("ledger rejected the block: {0}")]
	Rejected(&'static str),
}

enum Action {
	Send {
		wallet: WalletId,
		source: Account,
		destination: Account,
		amount: Amount,
		respond: oneshot::Sender<Result<BlockHash, WalletActionError>>,
	},
	Receive {
		wallet: WalletId,
		account: Account,
		send_hash: BlockHash,
		respond: oneshot::Sender<Result<BlockHash, WalletActionError>>,
	},
	ChangeRepresentative {
		wallet: WalletId,
		account: Account,
		representative: Account,
		respond: oneshot::Sender<Result<BlockHash, WalletActionError>>,
	},
}

struct QueuedAction {
	priority: u64,
	sequence: u64,
	action: Action,
}

impl PartialEq for QueuedAction {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.sequence == other.sequence
	}
}
impl Eq for QueuedAction {}
impl PartialOrd for QueuedAction {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for QueuedAction {
	fn cmp(&self, other: &Self) -> Ordering {
		// Max-heap: higher priority first, then FIFO.
		self.priority
			.cmp(&other.priority)
			.then_with(|| other.sequence.cmp(&self.sequence))
	}
}

const PRIORITY_HIGH: u64 = 3;
const PRIORITY_MID: u64 = 2;
const PRIORITY_LOW: u64 = 1;

pub struct Wallets {
	db: Arc<WalletDb>,
	ledger: Arc<Ledger>,
	processor: Arc<BlockProcessor>,
	wallets: Mutex<HashMap<WalletId, Arc<Wallet>>>,
	queue: Mutex<BinaryHeap<QueuedAction>>,
	sequence: AtomicU64,
	notify: Notify,
	stopped: AtomicBool,
}

impl Wallets {
	pub fn new(
		db: Arc<WalletDb>,
		ledger: Arc<Ledger>,
		processor: Arc<BlockProcessor>,
	) -> Arc<Self> {
		let wallets = Wallets {
			db: db.clone(),
			ledger,
			processor,
			wallets: Mutex::new(HashMap::new()),
			queue: Mutex::new(BinaryHeap::new()),
			sequence: AtomicU64::new(0),
			notify: Notify::new(),
			stopped: AtomicBool::new(false),
		};
		// Wallets created in earlier runs come back locked.
		for id in db.wallet_ids() {
			if let Ok(wallet) = db.open_wallet(id) {
				wallets.wallets.lock().expect("wallets poisoned").insert(id, Arc::new(wallet));
			}
		}
		Arc::new(wallets)
	}

	pub fn create(&self) -> Result<WalletId, WalletError> {
		let id = WalletId::random();
		let wallet = self.db.create(id, [0u8; 32])?;
		self.wallets.lock().expect("wallets poisoned").insert(id, Arc::new(wallet));
		Ok(id)
	}

	pub fn wallet(&self, id: &WalletId) -> Option<Arc<Wallet>> {
		self.wallets.lock().expect("wallets poisoned").get(id).cloned()
	}

	pub fn wallet_ids(&self) -> Vec<WalletId> {
		self.wallets.lock().expect("wallets poisoned").keys().copied().collect()
	}

	/// Replace a wallet's seed, materializing the accounts the ledger has
	/// seen activity for.
	pub fn change_seed(
		&self,
		id: &WalletId,
		seed: &[u8; 32],
	) -> Result<Vec<Account>, WalletActionError> {
		let wallet = self.wallet(id).ok_or(WalletError::NotFound)?;
		let accounts = wallet.change_seed(seed, |public_key| {
			let account = Account(*public_key);
			let txn = self.ledger.store().tx_begin_read();
			self.ledger.store().account_get(&txn, &account).is_some() ||
				self.ledger.receivable_any(&txn, &account)
		})?;
		Ok(accounts.into_iter().map(Account).collect())
	}

	pub fn stop(&self) {
		self.stopped.store(true, AtomicOrdering::SeqCst);
		self.notify.notify_one();
	}

	fn enqueue(&self, priority: u64, action: Action) {
		let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
		self.queue
			.lock()
			.expect("wallet queue poisoned")
			.push(QueuedAction { priority, sequence, action });
		self.notify.notify_one();
	}

	pub async fn send(
		&self,
		wallet: WalletId,
		source: Account,
		destination: Account,
		amount: Amount,
	) -> Result<BlockHash, WalletActionError> {
		let (respond, receive) = oneshot::channel();
		self.enqueue(PRIORITY_HIGH, Action::Send { wallet, source, destination, amount, respond });
		receive.await.unwrap_or(Err(WalletActionError::Rejected("node stopped")))
	}

	pub async fn receive(
		&self,
		wallet: WalletId,
		account: Account,
		send_hash: BlockHash,
	) -> Result<BlockHash, WalletActionError> {
		let (respond, receive) = oneshot::channel();
		self.enqueue(PRIORITY_MID, Action::Receive { wallet, account, send_hash, respond });
		receive.await.unwrap_or(Err(WalletActionError::Rejected("node stopped")))
	}

	pub async fn change_representative(
		&self,
		wallet: WalletId,
		account: Account,
		representative: Account,
	) -> Result<BlockHash, WalletActionError> {
		let (respond, receive) = oneshot::channel();
		self.enqueue(
			PRIORITY_LOW,
			Action::ChangeRepresentative { wallet, account, representative, respond },
		);
		receive.await.unwrap_or(Err(WalletActionError::Rejected("node stopped")))
	}

	/// Drain loop; one task per node.
	pub async fn run(self: Arc<Self>) {
		async {
			loop {
				if self.stopped.load(AtomicOrdering::SeqCst) {
					break
				}
				let next = self.queue.lock().expect("wallet queue poisoned").pop();
				match next {
					Some(queued) => self.perform(queued.action).await,
					None => self.notify.notified().await,
				}
			}
			debug!("Wallet action queue stopped");
		}
		.instrument(info_span!("Wallets"))
		.await
	}

	async fn perform(&self, action: Action) {
		match action {
			Action::Send { wallet, source, destination, amount, respond } => {
				let result = self.perform_send(wallet, source, destination, amount).await;
				let _ = respond.send(result);
			},
			Action::Receive { wallet, account, send_hash, respond } => {
				let result = self.perform_receive(wallet, account, send_hash).await;
				let _ = respond.send(result);
			},
			Action::ChangeRepresentative { wallet, account, representative, respond } => {
				let result = self.perform_change(wallet, account, representative).await;
				let _ = respond.send(result);
			},
		}
	}

	fn key_for(&self, id: &WalletId, account: &Account) -> Result<KeyPair, WalletActionError> {
		let wallet = self.wallet(id).ok_or(WalletError::NotFound)?;
		let raw = wallet.fetch_key(&account.0)?;
		Ok(KeyPair::from_secret_bytes(*raw))
	}

	fn cached_work(
		&self,
		id: &WalletId,
		account: &Account,
	) -> Result<u64, WalletActionError> {
		let wallet = self.wallet(id).ok_or(WalletError::NotFound)?;
		wallet.work_get(&account.0).ok_or(WalletActionError::WorkMissing)
	}

	/// New transactions use the state form once the account is on it, or
	/// when the ledger enables state generation outright.
	fn should_generate_state_block(&self, head: &BlockHash) -> bool {
		if self.ledger.constants.state_block_generation_enabled {
			return true
		}
		let txn = self.ledger.store().tx_begin_read();
		matches!(self.ledger.block_get(&txn, head), Some(Block::State(_)))
	}

	async fn submit(&self, block: Block) -> Result<BlockHash, WalletActionError> {
		let hash = block.hash();
		let verdict = self.processor.process_and_wait(block, BlockSource::Local).await;
		// Drain the queue so the caller sees the effect of its own block.
		self.processor.flush().await;
		match verdict {
			ProcessResult::Progress => Ok(hash),
			other => Err(WalletActionError::Rejected(other.as_str())),
		}
	}

	async fn perform_send(
		&self,
		wallet: WalletId,
		source: Account,
		destination: Account,
		amount: Amount,
	) -> Result<BlockHash, WalletActionError> {
		let key = self.key_for(&wallet, &source)?;
		let (head, balance, representative) = {
			let txn = self.ledger.store().tx_begin_read();
			let info = self
				.ledger
				.store()
				.account_get(&txn, &source)
				.ok_or(WalletActionError::AccountMissing)?;
			(info.head, info.balance, info.representative)
		};
		let remaining =
			balance.checked_sub(amount).ok_or(WalletActionError::InsufficientBalance)?;
		let work = self.cached_work(&wallet, &source)?;

		let block = if self.should_generate_state_block(&head) {
			Block::State(StateBlock::new(
				source,
				head,
				representative,
				remaining,
				destination.into(),
				&key,
				work,
			))
		} else {
			Block::Send(SendBlock::new(head, destination, remaining, &key, work))
		};
		self.submit(block).await
	}

	async fn perform_receive(
		&self,
		wallet: WalletId,
		account: Account,
		send_hash: BlockHash,
	) -> Result<BlockHash, WalletActionError> {
		let key = self.key_for(&wallet, &account)?;
		let (pending, info) = {
			let txn = self.ledger.store().tx_begin_read();
			let pending = self
				.ledger
				.store()
				.pending_get(&txn, &PendingKey::new(account, send_hash))
				.ok_or(WalletActionError::NothingPending)?;
			(pending, self.ledger.store().account_get(&txn, &account))
		};
		let work = self.cached_work(&wallet, &account)?;

		let block = match info {
			Some(info) =>
				if self.should_generate_state_block(&info.head) {
					Block::State(StateBlock::new(
						account,
						info.head,
						info.representative,
						info.balance.saturating_add(pending.amount),
						send_hash.into(),
						&key,
						work,
					))
				} else {
					Block::Receive(ReceiveBlock::new(info.head, send_hash, &key, work))
				},
			None => {
				let representative = self
					.wallet(&wallet)
					.map(|wallet| Account(wallet.representative()))
					.filter(|representative| !representative.is_zero())
					.unwrap_or(account);
				if self.ledger.constants.state_block_generation_enabled {
					Block::State(StateBlock::new(
						account,
						BlockHash::ZERO,
						representative,
						pending.amount,
						send_hash.into(),
						&key,
						work,
					))
				} else {
					Block::Open(OpenBlock::new(send_hash, representative, &key, work))
				}
			},
		};
		self.submit(block).await
	}

	async fn perform_change(
		&self,
		wallet: WalletId,
		account: Account,
		representative: Account,
	) -> Result<BlockHash, WalletActionError> {
		let key = self.key_for(&wallet, &account)?;
		let (head, balance) = {
			let txn = self.ledger.store().tx_begin_read();
			let info = self
				.ledger
				.store()
				.account_get(&txn, &account)
				.ok_or(WalletActionError::AccountMissing)?;
			(info.head, info.balance)
		};
		let work = self.cached_work(&wallet, &account)?;

		let block = if self.should_generate_state_block(&head) {
			Block::State(StateBlock::new(
				account,
				head,
				representative,
				balance,
				crate::primitives::Link::ZERO,
				&key,
				work,
			))
		} else {
			Block::Change(ChangeBlock::new(head, representative, &key, work))
		};
		self.submit(block).await
	}
}

#[cfg(test)]
mod tests {
	use basalt_wallet::{KdfParams, WalletDbConfig};
	use tokio::sync::mpsc;

	use super::*;
	use crate::{
		confirming_set::ConfirmingSet,
		constants::{dev_genesis_key, DEV_GENESIS_SECRET, GENESIS_AMOUNT, WORK_THRESHOLD_DEV},
		elections::ActiveElections,
		filter::NetworkFilter,
		ledger::LedgerConstants,
		store::Store,
		vote_cache::VoteCache,
		work,
	};

	struct Ctx {
		_dir: tempfile::TempDir,
		ledger: Arc<Ledger>,
		wallets: Arc<Wallets>,
		wallet_id: WalletId,
		_runner: tokio::task::JoinHandle<()>,
		_actions: tokio::task::JoinHandle<()>,
	}

	async fn ctx() -> Ctx {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(Store::open(&dir.path().join("data.ldb")).unwrap());
		let ledger = Arc::new(Ledger::new(store, LedgerConstants::dev()).unwrap());
		let confirming_set = ConfirmingSet::new(ledger.clone());
		let vote_cache = Arc::new(VoteCache::new(64));
		let filter = Arc::new(NetworkFilter::new(1024));
		let (network_tx, _network_rx) = mpsc::unbounded_channel();
		let (force_tx, force_rx) = mpsc::unbounded_channel();
		let active = ActiveElections::new(
			Default::default(),
			ledger.clone(),
			confirming_set,
			vote_cache.clone(),
			filter.clone(),
			network_tx.clone(),
			force_tx,
		);
		let (processor, channels) = BlockProcessor::new(
			Default::default(),
			ledger.clone(),
			active,
			filter,
			vote_cache,
			network_tx,
			force_rx,
		);
		let runner = tokio::spawn(processor.clone().run(channels));

		let db = WalletDb::open(
			&dir.path().join("wallets.ldb"),
			WalletDbConfig { kdf: KdfParams::insecure(), fan_out: 16 },
		)
		.unwrap();
		let wallets = Wallets::new(db, ledger.clone(), processor);
		let actions = tokio::spawn(wallets.clone().run());
		let wallet_id = wallets.create().unwrap();

		Ctx { _dir: dir, ledger, wallets, wallet_id, _runner: runner, _actions: actions }
	}

	fn set_work(ctx: &Ctx, account: &Account) {
		let root = {
			let txn = ctx.ledger.store().tx_begin_read();
			match ctx.ledger.latest(&txn, account) {
				Some(head) => crate::primitives::Root(head.0),
				None => crate::primitives::Root(account.0),
			}
		};
		let work = work::solve(&root, WORK_THRESHOLD_DEV);
		ctx.wallets
			.wallet(&ctx.wallet_id)
			.unwrap()
			.work_set(&account.0, work)
			.unwrap();
	}

	#[tokio::test]
	async fn send_and_receive_between_wallet_accounts() {
		let ctx = ctx().await;
		let wallet = ctx.wallets.wallet(&ctx.wallet_id).unwrap();

		// The dev genesis key funds the wallet.
		let genesis = Account(wallet.insert_adhoc(&DEV_GENESIS_SECRET).unwrap());
		assert_eq!(genesis, dev_genesis_key().account());
		let destination = Account(wallet.deterministic_insert().unwrap());

		set_work(&ctx, &genesis);
		let send_hash = ctx
			.wallets
			.send(ctx.wallet_id, genesis, destination, Amount::new(1000))
			.await
			.unwrap();
		{
			let txn = ctx.ledger.store().tx_begin_read();
			assert_eq!(
				ctx.ledger.account_balance(&txn, &genesis),
				GENESIS_AMOUNT.checked_sub(Amount::new(1000)).unwrap()
			);
		}

		set_work(&ctx, &destination);
		ctx.wallets.receive(ctx.wallet_id, destination, send_hash).await.unwrap();
		let txn = ctx.ledger.store().tx_begin_read();
		assert_eq!(ctx.ledger.account_balance(&txn, &destination), Amount::new(1000));
	}

	#[tokio::test]
	async fn send_fails_without_balance_or_work() {
		let ctx = ctx().await;
		let wallet = ctx.wallets.wallet(&ctx.wallet_id).unwrap();
		let genesis = Account(wallet.insert_adhoc(&DEV_GENESIS_SECRET).unwrap());
		let destination = Account([1u8; 32]);

		// No cached work yet.
		assert_eq!(
			ctx.wallets.send(ctx.wallet_id, genesis, destination, Amount::new(1)).await,
			Err(WalletActionError::WorkMissing)
		);

		set_work(&ctx, &genesis);
		ctx.wallets.send(ctx.wallet_id, genesis, destination, Amount::new(1000)).await.unwrap();

		// More than what is left.
		set_work(&ctx, &genesis);
		assert_eq!(
			ctx.wallets.send(ctx.wallet_id, genesis, destination, Amount::MAX).await,
			Err(WalletActionError::InsufficientBalance)
		);
	}

	#[tokio::test]
	async fn locked_wallet_cannot_send() {
		let ctx = ctx().await;
		let wallet = ctx.wallets.wallet(&ctx.wallet_id).unwrap();
		let genesis = Account(wallet.insert_adhoc(&DEV_GENESIS_SECRET).unwrap());
		set_work(&ctx, &genesis);
		wallet.lock();
		assert_eq!(
			ctx.wallets.send(ctx.wallet_id, genesis, Account([1u8; 32]), Amount::new(1)).await,
			Err(WalletActionError::Wallet(WalletError::Locked))
		);
	}

	#[tokio::test]
	async fn change_seed_recovers_funded_accounts() {
		let ctx = ctx().await;
		let wallet = ctx.wallets.wallet(&ctx.wallet_id).unwrap();
		let genesis = Account(wallet.insert_adhoc(&DEV_GENESIS_SECRET).unwrap());

		// Fund slot 0 of a fresh seed.
		let seed = [0x77u8; 32];
		let slot0 = Account(basalt_wallet::public_key_of(&basalt_wallet::deterministic_key(
			&seed, 0,
		)));
		set_work(&ctx, &genesis);
		ctx.wallets.send(ctx.wallet_id, genesis, slot0, Amount::new(5)).await.unwrap();

		let accounts = ctx.wallets.change_seed(&ctx.wallet_id, &seed).unwrap();
		assert!(accounts.contains(&slot0));
	}
}
