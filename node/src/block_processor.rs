//! Single-writer ingest queue. Every ledger mutation in the node flows
//! through this task: live gossip, bootstrap traffic, locally produced
//! blocks, and forced winner application after fork resolution.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::sync::{
	mpsc::{self, error::TrySendError},
	oneshot,
};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
	block::Block,
	elections::{ActiveElections, ElectionBehavior},
	filter::NetworkFilter,
	ledger::{Ledger, ProcessResult},
	messages::{Message, NetworkCommand},
	metrics,
	primitives::BlockHash,
	unchecked_map::UncheckedMap,
	vote_cache::VoteCache,
};

/// Where a block came from; decides queue backpressure and election
/// activation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockSource {
	Live,
	Bootstrap,
	Local,
}

impl BlockSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			BlockSource::Live => "live",
			BlockSource::Bootstrap => "bootstrap",
			BlockSource::Local => "local",
		}
	}
}

struct Item {
	block: Block,
	source: BlockSource,
	result: Option<oneshot::Sender<ProcessResult>>,
}

enum Command {
	Process(Box<Item>),
	Flush(oneshot::Sender<()>),
	Stop,
}

#[derive(Clone, Debug)]
pub struct BlockProcessorConfig {
	pub max_queue: usize,
	pub unchecked_max_entries: usize,
	pub unchecked_max_age: Duration,
}

impl Default for BlockProcessorConfig {
	fn default() -> Self {
		BlockProcessorConfig {
			max_queue: 8192,
			unchecked_max_entries: 65536,
			unchecked_max_age: Duration::from_secs(8 * 60 * 60),
		}
	}
}

pub struct BlockProcessor {
	ledger: Arc<Ledger>,
	active: Arc<ActiveElections>,
	filter: Arc<NetworkFilter>,
	vote_cache: Arc<VoteCache>,
	unchecked: UncheckedMap,
	network: mpsc::UnboundedSender<NetworkCommand>,
	queue: mpsc::Sender<Command>,
}

pub struct BlockProcessorChannels {
	queue: mpsc::Receiver<Command>,
	forced: mpsc::UnboundedReceiver<Block>,
}

impl BlockProcessor {
	pub fn new(
		config: BlockProcessorConfig,
		ledger: Arc<Ledger>,
		active: Arc<ActiveElections>,
		filter: Arc<NetworkFilter>,
		vote_cache: Arc<VoteCache>,
		network: mpsc::UnboundedSender<NetworkCommand>,
		forced: mpsc::UnboundedReceiver<Block>,
	) -> (Arc<Self>, BlockProcessorChannels) {
		let (queue_tx, queue_rx) = mpsc::channel(config.max_queue);
		let processor = Arc::new(BlockProcessor {
			ledger,
			active,
			filter,
			vote_cache,
			unchecked: UncheckedMap::new(
				config.unchecked_max_entries,
				config.unchecked_max_age,
			),
			network,
			queue: queue_tx,
		});
		(processor, BlockProcessorChannels { queue: queue_rx, forced })
	}

	/// Queue a block, waiting for room. Bootstrap and local producers get
	/// backpressure instead of drops.
	pub async fn add(&self, block: Block, source: BlockSource) {
		let item = Box::new(Item { block, source, result: None });
		let _ = self.queue.send(Command::Process(item)).await;
	}

	/// Queue a live block without waiting; over the limit it is dropped.
	pub fn add_live(&self, block: Block) {
		let item = Box::new(Item { block, source: BlockSource::Live, result: None });
		if let Err(TrySendError::Full(_)) = self.queue.try_send(Command::Process(item)) {
			metrics::QUEUE_DROPS.with_label_values(&[BlockSource::Live.as_str()]).inc();
			trace!("Live queue full; dropping block");
		}
	}

	/// Queue a block and wait for its ledger verdict.
	pub async fn process_and_wait(&self, block: Block, source: BlockSource) -> ProcessResult {
		let (result_tx, result_rx) = oneshot::channel();
		let item = Box::new(Item { block, source, result: Some(result_tx) });
		let _ = self.queue.send(Command::Process(item)).await;
		result_rx.await.unwrap_or(ProcessResult::Old)
	}

	/// Resolve once every previously queued item has been handled. Wallet
	/// send paths use this to observe their own blocks.
	pub async fn flush(&self) {
		let (flushed_tx, flushed_rx) = oneshot::channel();
		if self.queue.send(Command::Flush(flushed_tx)).await.is_ok() {
			let _ = flushed_rx.await;
		}
	}

	pub async fn stop(&self) {
		let _ = self.queue.send(Command::Stop).await;
	}

	/// The processing loop. Forced winners take precedence over the queue.
	pub async fn run(self: Arc<Self>, mut channels: BlockProcessorChannels) {
		async {
			loop {
				tokio::select! {
					biased;
					Some(winner) = channels.forced.recv() => {
						self.process_forced(winner);
					}
					command = channels.queue.recv() => {
						match command {
							Some(Command::Process(item)) => self.process_item(*item),
							Some(Command::Flush(acknowledge)) => {
								// Drain any forced work that is already queued
								// before acknowledging.
								while let Ok(winner) = channels.forced.try_recv() {
									self.process_forced(winner);
								}
								let _ = acknowledge.send(());
							},
							Some(Command::Stop) | None => break,
						}
					}
				}
			}
			debug!("Block processor stopped");
		}
		.instrument(info_span!("BlockProcessor"))
		.await
	}

	fn process_item(&self, item: Item) {
		let Item { block, source, result } = item;

		// Gossip duplicates are cut before touching the ledger.
		if source == BlockSource::Live {
			let mut bytes = Vec::new();
			block.serialize(&mut bytes);
			if !self.filter.apply(&bytes) {
				metrics::DUPLICATE_FILTER_HITS.inc();
				if let Some(sender) = result {
					let _ = sender.send(ProcessResult::Old);
				}
				return
			}
		}

		let verdict = self.process_one(block, source);
		if let Some(sender) = result {
			let _ = sender.send(verdict);
		}
	}

	fn process_one(&self, block: Block, source: BlockSource) -> ProcessResult {
		let first_hash = block.hash();
		let mut verdict_for_caller = None;

		// A successful block may release parked children, which are
		// processed in the same sweep.
		let mut pending = VecDeque::new();
		pending.push_back(block);
		while let Some(block) = pending.pop_front() {
			let hash = block.hash();
			let mut txn = self.ledger.store().tx_begin_write();
			let result = self.ledger.process(&mut txn, &block);
			metrics::BLOCKS_PROCESSED.with_label_values(&[result.as_str()]).inc();

			match result {
				ProcessResult::Progress => {
					for child in
						self.unchecked.take_children(self.ledger.store(), &mut txn, &hash)
					{
						pending.push_back(child);
					}
					txn.commit().unwrap_or_else(|error| {
						panic!("Failed to commit block {hash:?}: {error}")
					});
					trace!("Processed {hash:?} from {}", source.as_str());
					if source != BlockSource::Bootstrap {
						self.active.insert(&block, ElectionBehavior::Priority);
					} else if self.vote_cache.find(&hash).is_some() {
						// Bootstrap blocks only go active when votes are
						// already waiting for them.
						self.active.insert(&block, ElectionBehavior::Hinted);
					}
				},
				ProcessResult::Fork => {
					let resident = self.ledger.block_at_root(&txn, &block.root());
					txn.abort();
					debug!("Fork at {:?}", block.root());
					if let Some(resident) = resident {
						self.active.insert(&resident, ElectionBehavior::Priority);
						self.active.insert(&block, ElectionBehavior::Priority);
						let _ = self.network.send(NetworkCommand::Broadcast(
							Message::ConfirmReq {
								block: None,
								roots_hashes: vec![
									(resident.root(), resident.hash()),
									(block.root(), block.hash()),
								],
							},
						));
					}
				},
				ProcessResult::GapPrevious => {
					let dependency = block.previous();
					self.unchecked.put(self.ledger.store(), &mut txn, &dependency, block);
					let _ = txn.commit();
				},
				ProcessResult::GapSource | ProcessResult::GapEpochOpenPending => {
					let dependency = Self::source_dependency(&block).unwrap_or_default();
					self.unchecked.put(self.ledger.store(), &mut txn, &dependency, block);
					let _ = txn.commit();
				},
				ProcessResult::Old => {
					txn.abort();
				},
				_ => {
					// Terminal validation failure; the metric above is the
					// only trace it leaves.
					txn.abort();
				},
			}

			if hash == first_hash {
				verdict_for_caller = Some(result);
			}
		}

		verdict_for_caller.expect("first block is always processed")
	}

	fn source_dependency(block: &Block) -> Option<BlockHash> {
		match block {
			Block::State(state) => Some(state.link.as_hash()),
			_ => block.source_field(),
		}
	}

	/// Apply an election winner over whatever the ledger holds at its root.
	fn process_forced(&self, winner: Block) {
		let root = winner.root();
		let mut txn = self.ledger.store().tx_begin_write();
		if let Some(resident) = self.ledger.block_at_root(&txn, &root) {
			if resident.hash() != winner.hash() {
				match self.ledger.rollback(&mut txn, &resident.hash()) {
					Ok(rolled_back) => {
						debug!(
							"Rolled back {} block(s) to apply winner {:?}",
							rolled_back.len(),
							winner.hash()
						);
					},
					Err(error) => {
						// Cemented loser: protocol violation upstream.
						warn!("Failed to roll back loser at {root:?}: {error}");
						txn.abort();
						return
					},
				}
			}
		}
		let result = self.ledger.process(&mut txn, &winner);
		match result {
			ProcessResult::Progress | ProcessResult::Old => {
				let _ = txn.commit();
			},
			other => {
				warn!("Forced winner {:?} rejected: {:?}", winner.hash(), other);
				txn.abort();
			},
		}
	}
}
