//! The active election set: per-root voting sessions keyed by block root,
//! with bounded capacity, hinted admission from the vote cache, and
//! confirmation side effects (cementation, losing-fork rollback).

mod election;


use std::{
	collections::{HashMap, VecDeque},
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tracing::{debug, trace};

use crate::{
	block::Block,
	confirming_set::ConfirmingSet,
	constants::ONLINE_WEIGHT_QUORUM_PERCENT,
	filter::NetworkFilter,
	ledger::Ledger,
	messages::{Message, NetworkCommand},
	metrics,
	primitives::{Account, Amount, BlockHash, Root},
	vote_cache::VoteCache,
};

pub use election::{Election, ElectionBehavior, ElectionStatus, VoteInfo};

/// Roots per confirm_req broadcast.
const CONFIRM_REQ_BATCH: usize = 7;

#[derive(Clone, Debug)]
pub struct ActiveElectionsConfig {
	/// Cap on simultaneously live elections.
	pub size: usize,
	/// Hinted elections may occupy at most this share of `size`.
	pub hinted_limit_percent: usize,
	/// A cached final tally at this share of quorum starts a hinted
	/// election.
	pub hinted_threshold_percent: u8,
	/// Unconfirmed elections older than this are dropped by the scheduler.
	pub election_timeout: Duration,
	/// Assumed online voting weight until better information arrives.
	pub online_weight: Amount,
	/// Replay window of recently confirmed roots.
	pub recently_confirmed_size: usize,
}

impl Default for ActiveElectionsConfig {
	fn default() -> Self {
		ActiveElectionsConfig {
			size: 5000,
			hinted_limit_percent: 20,
			hinted_threshold_percent: 10,
			election_timeout: Duration::from_secs(60),
			online_weight: Amount::MAX,
			recently_confirmed_size: 65536,
		}
	}
}

/// Bounded FIFO of `(root, winner)` pairs answering "is this a replay?".
struct RecentlyConfirmed {
	entries: VecDeque<(Root, BlockHash)>,
	capacity: usize,
}

impl RecentlyConfirmed {
	fn new(capacity: usize) -> Self {
		RecentlyConfirmed { entries: VecDeque::new(), capacity: capacity.max(1) }
	}

	fn put(&mut self, root: Root, hash: BlockHash) {
		self.entries.push_back((root, hash));
		while self.entries.len() > self.capacity {
			self.entries.pop_front();
		}
	}

	fn contains_root(&self, root: &Root) -> bool {
		self.entries.iter().any(|(entry_root, _)| entry_root == root)
	}

	fn contains_hash(&self, hash: &BlockHash) -> bool {
		self.entries.iter().any(|(_, entry_hash)| entry_hash == hash)
	}
}

struct Inner {
	roots: HashMap<Root, Arc<Election>>,
	hash_index: HashMap<BlockHash, Root>,
}

pub struct ActiveElections {
	config: ActiveElectionsConfig,
	ledger: Arc<Ledger>,
	confirming_set: Arc<ConfirmingSet>,
	vote_cache: Arc<VoteCache>,
	filter: Arc<NetworkFilter>,
	inner: Mutex<Inner>,
	recently_confirmed: Mutex<RecentlyConfirmed>,
	online_weight: Mutex<Amount>,
	network: UnboundedSender<NetworkCommand>,
	/// Winners the ledger disagrees with go here for forced application.
	force_queue: UnboundedSender<Block>,
	confirmed_events: broadcast::Sender<(Root, BlockHash)>,
}

impl ActiveElections {
	pub fn new(
		config: ActiveElectionsConfig,
		ledger: Arc<Ledger>,
		confirming_set: Arc<ConfirmingSet>,
		vote_cache: Arc<VoteCache>,
		filter: Arc<NetworkFilter>,
		network: UnboundedSender<NetworkCommand>,
		force_queue: UnboundedSender<Block>,
	) -> Arc<Self> {
		let (confirmed_events, _) = broadcast::channel(1024);
		let online_weight = config.online_weight;
		let recently_confirmed_size = config.recently_confirmed_size;
		Arc::new(ActiveElections {
			config,
			ledger,
			confirming_set,
			vote_cache,
			filter,
			inner: Mutex::new(Inner { roots: HashMap::new(), hash_index: HashMap::new() }),
			recently_confirmed: Mutex::new(RecentlyConfirmed::new(recently_confirmed_size)),
			online_weight: Mutex::new(online_weight),
			network,
			force_queue,
			confirmed_events,
		})
	}

	pub fn subscribe_confirmed(&self) -> broadcast::Receiver<(Root, BlockHash)> {
		self.confirmed_events.subscribe()
	}

	pub fn set_online_weight(&self, weight: Amount) {
		*self.online_weight.lock().expect("online weight poisoned") = weight;
	}

	/// Final-vote weight required to cement.
	pub fn quorum(&self) -> Amount {
		let online = self.online_weight.lock().expect("online weight poisoned").raw();
		Amount::new(online / 100 * ONLINE_WEIGHT_QUORUM_PERCENT as u128)
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("active elections poisoned").roots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn election(&self, root: &Root) -> Option<Arc<Election>> {
		self.inner.lock().expect("active elections poisoned").roots.get(root).cloned()
	}

	pub fn election_for_hash(&self, hash: &BlockHash) -> Option<Arc<Election>> {
		let inner = self.inner.lock().expect("active elections poisoned");
		inner.hash_index.get(hash).and_then(|root| inner.roots.get(root)).cloned()
	}

	pub fn active(&self, hash: &BlockHash) -> bool {
		self.inner.lock().expect("active elections poisoned").hash_index.contains_key(hash)
	}

	pub fn recently_confirmed_root(&self, root: &Root) -> bool {
		self.recently_confirmed.lock().expect("recently confirmed poisoned").contains_root(root)
	}

	pub fn recently_confirmed_hash(&self, hash: &BlockHash) -> bool {
		self.recently_confirmed.lock().expect("recently confirmed poisoned").contains_hash(hash)
	}

	/// Start or join the election at `block`'s root. Returns true when a
	/// new election was created.
	pub fn insert(&self, block: &Block, behavior: ElectionBehavior) -> bool {
		let root = block.root();
		let hash = block.hash();

		if self.recently_confirmed_root(&root) {
			return false
		}

		let existing = self.election(&root);
		if let Some(election) = existing {
			let support = self
				.vote_cache
				.find(&hash)
				.map(|entry| entry.tally())
				.unwrap_or(Amount::ZERO);
			let weight_of = self.weight_of();
			if election.insert_candidate(block.clone(), support, &weight_of) {
				self.inner
					.lock()
					.expect("active elections poisoned")
					.hash_index
					.insert(hash, root);
				self.replay_cached_votes(&election, &hash);
				self.check_confirm(&election);
			}
			return false
		}

		{
			let mut inner = self.inner.lock().expect("active elections poisoned");
			// Someone else may have started this root since the lookup above.
			if inner.roots.contains_key(&root) {
				drop(inner);
				return self.insert(block, behavior)
			}
			if behavior == ElectionBehavior::Hinted {
				let hinted = inner
					.roots
					.values()
					.filter(|election| election.behavior == ElectionBehavior::Hinted)
					.count();
				if hinted >= self.config.size * self.config.hinted_limit_percent / 100 {
					return false
				}
			}
			if inner.roots.len() >= self.config.size {
				// Shed the least worthy election: lowest retention class,
				// oldest within it.
				let victim = inner
					.roots
					.values()
					.filter(|election| !election.confirmed())
					.min_by_key(|election| (election.behavior.retention_rank(), election.started))
					.map(|election| election.root);
				match victim {
					Some(victim_root) => Self::erase_locked(
						&mut inner,
						&victim_root,
						false,
						&self.filter,
					),
					None => return false,
				}
			}

			let election = Arc::new(Election::new(root, block.clone(), behavior));
			inner.roots.insert(root, election);
			inner.hash_index.insert(hash, root);
		}
		metrics::ELECTIONS_STARTED.with_label_values(&[behavior.as_str()]).inc();
		metrics::ACTIVE_ELECTIONS.set(self.len() as i64);
		trace!("Election started at {root:?} ({})", behavior.as_str());

		let election = self.election(&root).expect("inserted above");
		self.replay_cached_votes(&election, &hash);
		self.check_confirm(&election);
		true
	}

	/// Feed votes that arrived before the block back in, in arrival order.
	fn replay_cached_votes(&self, election: &Arc<Election>, hash: &BlockHash) {
		if let Some(entry) = self.vote_cache.erase(hash) {
			let weight_of = self.weight_of();
			for cached in entry.voters {
				election.vote(&cached.voter, cached.timestamp, *hash, &weight_of);
			}
		}
	}

	fn weight_of(&self) -> impl Fn(&Account) -> Amount + '_ {
		|account| self.ledger.weight(account)
	}

	/// Run the confirmation rule; on success, fire every side effect
	/// exactly once and retire the election.
	pub fn check_confirm(&self, election: &Arc<Election>) {
		let weight_of = self.weight_of();
		let Some(winner) = election.try_confirm(self.quorum(), &weight_of) else { return };
		let root = election.root;
		let hash = winner.hash();
		metrics::ELECTIONS_CONFIRMED.inc();
		debug!("Election at {root:?} confirmed {hash:?}");

		self.recently_confirmed
			.lock()
			.expect("recently confirmed poisoned")
			.put(root, hash);
		self.confirming_set.add(hash);

		// If the ledger currently holds a different block at this root, the
		// losing chain has to come out and the winner go in.
		let resident = {
			let txn = self.ledger.store().tx_begin_read();
			self.ledger.block_at_root(&txn, &root).map(|block| block.hash())
		};
		if resident != Some(hash) {
			let _ = self.force_queue.send(winner);
		}

		let _ = self.confirmed_events.send((root, hash));

		let mut inner = self.inner.lock().expect("active elections poisoned");
		Self::erase_locked(&mut inner, &root, true, &self.filter);
		metrics::ACTIVE_ELECTIONS.set(inner.roots.len() as i64);
	}

	/// Drop the election at `root` without confirming it.
	pub fn erase(&self, root: &Root) {
		let mut inner = self.inner.lock().expect("active elections poisoned");
		Self::erase_locked(&mut inner, root, false, &self.filter);
		metrics::ACTIVE_ELECTIONS.set(inner.roots.len() as i64);
	}

	fn erase_locked(inner: &mut Inner, root: &Root, confirmed: bool, filter: &NetworkFilter) {
		let Some(election) = inner.roots.remove(root) else { return };
		for block in election.blocks() {
			inner.hash_index.remove(&block.hash());
			if !confirmed {
				// Allow the block to circulate again: the filter entry is
				// only kept for settled roots.
				let mut bytes = Vec::new();
				block.serialize(&mut bytes);
				filter.clear(&bytes);
			}
		}
		if !confirmed {
			metrics::ELECTIONS_DROPPED.inc();
			debug!("Election at {root:?} dropped unconfirmed");
		}
	}

	/// Start hinted elections for cache buckets whose final tally crossed
	/// the hinting threshold.
	pub fn flush_hinted(&self) {
		let minimum = Amount::new(
			self.quorum().raw() / 100 * self.config.hinted_threshold_percent as u128,
		);
		for (hash, _tally) in self.vote_cache.top_final(minimum) {
			if self.active(&hash) || self.recently_confirmed_hash(&hash) {
				continue
			}
			let block = {
				let txn = self.ledger.store().tx_begin_read();
				self.ledger.block_get(&txn, &hash)
			};
			if let Some(block) = block {
				self.insert(&block, ElectionBehavior::Hinted);
			}
		}
	}

	/// One scheduler pass: drop expired elections, emit confirm_req for the
	/// rest. Driven by an external interval.
	pub fn tick(&self) {
		let snapshot: Vec<Arc<Election>> = {
			let inner = self.inner.lock().expect("active elections poisoned");
			inner.roots.values().cloned().collect()
		};

		let mut requests = Vec::new();
		for election in snapshot {
			if election.confirmed() {
				continue
			}
			if election.started.elapsed() > self.config.election_timeout {
				self.erase(&election.root);
				continue
			}
			if let Some(winner) = election.status().winner {
				requests.push((election.root, winner));
				election.increment_confirmation_requests();
			}
		}

		for batch in requests.chunks(CONFIRM_REQ_BATCH) {
			metrics::CONFIRM_REQS_SENT.inc();
			let _ = self.network.send(NetworkCommand::Broadcast(Message::ConfirmReq {
				block: None,
				roots_hashes: batch.to_vec(),
			}));
		}
	}
}
