//! Component wiring: builds every subsystem over one ledger, spawns the
//! long-lived tasks, and routes realtime messages between them.

use std::{
	net::SocketAddr,
	path::Path,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use anyhow::{Context, Result};
use basalt_wallet::{KdfParams, WalletDb, WalletDbConfig};
use tokio::{
	net::TcpListener,
	sync::mpsc::{self, UnboundedReceiver},
	task::JoinHandle,
};
use tracing::info;

use crate::{
	block_processor::BlockProcessor,
	bootstrap::{BootstrapServer, Bootstrapper},
	confirming_set::ConfirmingSet,
	elections::ActiveElections,
	filter::NetworkFilter,
	ledger::{Ledger, LedgerConstants},
	messages::{Message, NetworkCommand},
	settings::Settings,
	store::Store,
	vote_cache::VoteCache,
	vote_router::VoteRouter,
	voting::VoteGenerator,
	wallets::Wallets,
};

/// Cadence of the election scheduler pass.
const ELECTION_TICK_INTERVAL: Duration = Duration::from_millis(500);

const NETWORK_FILTER_CAPACITY: usize = 256 * 1024;
const VOTE_CACHE_CAPACITY: usize = 64 * 1024;

pub struct Node {
	pub ledger: Arc<Ledger>,
	/// Identity proven over node_id_handshake; persisted across restarts.
	node_id: crate::primitives::KeyPair,
	pub active: Arc<ActiveElections>,
	pub processor: Arc<BlockProcessor>,
	pub confirming_set: Arc<ConfirmingSet>,
	pub vote_cache: Arc<VoteCache>,
	pub filter: Arc<NetworkFilter>,
	pub router: Arc<VoteRouter>,
	pub voting: Arc<VoteGenerator>,
	pub wallets: Arc<Wallets>,
	pub bootstrapper: Arc<Bootstrapper>,
	bootstrap_listen_addr: SocketAddr,
	network: mpsc::UnboundedSender<NetworkCommand>,
	network_rx: Mutex<Option<UnboundedReceiver<NetworkCommand>>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	stopped: AtomicBool,
}

impl Node {
	/// Build a node over `data_dir` and start its worker tasks.
	pub async fn start(
		data_dir: &Path,
		settings: &Settings,
		constants: LedgerConstants,
	) -> Result<Arc<Self>> {
		std::fs::create_dir_all(data_dir)
			.with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

		let store = Arc::new(Store::open(&data_dir.join("data.ldb"))?);
		let ledger = Arc::new(Ledger::new(store, constants)?);

		// Stable node identity for handshakes.
		let node_id = {
			let existing = {
				let txn = ledger.store().tx_begin_read();
				ledger.store().node_id_get(&txn)
			};
			match existing {
				Some(secret) => crate::primitives::KeyPair::from_secret_bytes(secret),
				None => {
					let generated = crate::primitives::KeyPair::generate();
					let mut txn = ledger.store().tx_begin_write();
					ledger.store().node_id_put(&mut txn, &generated.secret_bytes());
					txn.commit()?;
					generated
				},
			}
		};

		let (network_tx, network_rx) = mpsc::unbounded_channel();
		let (force_tx, force_rx) = mpsc::unbounded_channel();

		let filter = Arc::new(NetworkFilter::new(NETWORK_FILTER_CAPACITY));
		let vote_cache = Arc::new(VoteCache::new(VOTE_CACHE_CAPACITY));
		let confirming_set = ConfirmingSet::new(ledger.clone());
		let active = ActiveElections::new(
			settings.active_elections_config(),
			ledger.clone(),
			confirming_set.clone(),
			vote_cache.clone(),
			filter.clone(),
			network_tx.clone(),
			force_tx,
		);
		let (processor, processor_channels) = BlockProcessor::new(
			settings.processor_config(),
			ledger.clone(),
			active.clone(),
			filter.clone(),
			vote_cache.clone(),
			network_tx.clone(),
			force_rx,
		);
		let router =
			Arc::new(VoteRouter::new(ledger.clone(), active.clone(), vote_cache.clone()));
		let voting = VoteGenerator::new(ledger.clone(), network_tx.clone());

		let wallet_db = WalletDb::open(
			&data_dir.join("wallets.ldb"),
			WalletDbConfig {
				kdf: KdfParams {
					t_cost: settings.wallet.kdf_t_cost,
					m_cost_kib: settings.wallet.kdf_m_cost_kib,
					p_cost: settings.wallet.kdf_p_cost,
				},
				fan_out: settings.wallet.fan_out,
			},
		)?;
		let wallets = Wallets::new(wallet_db, ledger.clone(), processor.clone());

		let bootstrapper =
			Bootstrapper::new(ledger.clone(), processor.clone(), settings.bootstrap_config());

		// The bootstrap listener binds immediately so peers can sync from
		// us; port zero lets tests pick an ephemeral one.
		let listener = TcpListener::bind(("0.0.0.0", settings.node.bootstrap_listen_port))
			.await
			.context("Failed to bind bootstrap listener")?;
		let bootstrap_listen_addr = listener.local_addr()?;
		let server = BootstrapServer::new(
			ledger.clone(),
			processor.clone(),
			settings.bootstrap_config(),
		);

		let node = Arc::new(Node {
			ledger,
			node_id,
			active: active.clone(),
			processor: processor.clone(),
			confirming_set: confirming_set.clone(),
			vote_cache,
			filter,
			router,
			voting,
			wallets: wallets.clone(),
			bootstrapper,
			bootstrap_listen_addr,
			network: network_tx,
			network_rx: Mutex::new(Some(network_rx)),
			tasks: Mutex::new(Vec::new()),
			stopped: AtomicBool::new(false),
		});

		let mut tasks = node.tasks.lock().expect("node poisoned");
		tasks.push(tokio::spawn(processor.run(processor_channels)));
		tasks.push(tokio::spawn(confirming_set.run()));
		tasks.push(tokio::spawn(wallets.run()));
		tasks.push(tokio::spawn(server.run(listener)));
		tasks.push(tokio::spawn({
			let active = active.clone();
			let node = node.clone();
			async move {
				let mut interval = tokio::time::interval(ELECTION_TICK_INTERVAL);
				loop {
					interval.tick().await;
					if node.stopped.load(Ordering::SeqCst) {
						break
					}
					active.tick();
				}
			}
		}));
		drop(tasks);

		info!(
			"Node started; bootstrap listener on {}",
			node.bootstrap_listen_addr
		);
		Ok(node)
	}

	/// The transport drains this for outbound traffic. Can be taken once.
	pub fn take_network_receiver(&self) -> Option<UnboundedReceiver<NetworkCommand>> {
		self.network_rx.lock().expect("node poisoned").take()
	}

	pub fn bootstrap_listen_addr(&self) -> SocketAddr {
		self.bootstrap_listen_addr
	}

	/// Answer a handshake query: prove possession of our node id by
	/// signing the peer's cookie.
	pub fn handshake_response(&self, cookie: &[u8; 32]) -> Message {
		Message::NodeIdHandshake {
			query: None,
			response: Some((self.node_id.account(), self.node_id.sign(cookie))),
		}
	}

	/// Realtime ingress from the (external) transport.
	pub fn handle_message(&self, message: Message) {
		match message {
			Message::Publish { block } => {
				self.processor.add_live(block);
			},
			Message::NodeIdHandshake { query: Some(cookie), .. } => {
				// The transport sends our proof back to the peer.
				let _ = self
					.network
					.send(NetworkCommand::Broadcast(self.handshake_response(&cookie)));
			},
			Message::ConfirmReq { block, roots_hashes } => {
				let roots_hashes = match block {
					Some(block) => vec![(block.root(), block.hash())],
					None => roots_hashes,
				};
				for vote in self.voting.generate(&roots_hashes) {
					// Our own votes also count locally.
					self.router.vote(&vote);
				}
			},
			Message::ConfirmAck { vote } => {
				self.router.vote(&vote);
			},
			// Keepalives and bootstrap streams belong to the transport and
			// bootstrap server.
			_ => {},
		}
	}

	pub async fn stop(&self) {
		if self.stopped.swap(true, Ordering::SeqCst) {
			return
		}
		self.processor.stop().await;
		self.confirming_set.stop();
		self.wallets.stop();
		let tasks = std::mem::take(&mut *self.tasks.lock().expect("node poisoned"));
		for task in &tasks {
			task.abort();
		}
		info!("Node stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		block::{Block, SendBlock},
		constants::{dev_genesis_key, WORK_THRESHOLD_DEV},
		primitives::{Account, Amount},
		work,
	};

	#[tokio::test]
	async fn starts_handles_publish_and_stops() {
		let dir = tempfile::tempdir().unwrap();
		let mut settings = Settings::default();
		settings.node.bootstrap_listen_port = 0;
		let node = Node::start(dir.path(), &settings, LedgerConstants::dev()).await.unwrap();

		let genesis = dev_genesis_key();
		let previous = {
			let txn = node.ledger.store().tx_begin_read();
			node.ledger.latest(&txn, &genesis.account()).unwrap()
		};
		let block = Block::Send(SendBlock::new(
			previous,
			Account([1u8; 32]),
			Amount::new(7),
			&genesis,
			work::solve(&previous.into(), WORK_THRESHOLD_DEV),
		));
		node.handle_message(Message::Publish { block: block.clone() });
		node.processor.flush().await;

		let txn = node.ledger.store().tx_begin_read();
		assert!(node.ledger.block_exists(&txn, &block.hash()));
		assert!(node.active.active(&block.hash()));
		drop(txn);

		node.stop().await;
	}

	#[tokio::test]
	async fn handshake_query_is_answered_with_a_signed_proof() {
		let dir = tempfile::tempdir().unwrap();
		let mut settings = Settings::default();
		settings.node.bootstrap_listen_port = 0;
		let node = Node::start(dir.path(), &settings, LedgerConstants::dev()).await.unwrap();

		let mut network = node.take_network_receiver().unwrap();
		// Taking it twice is not possible.
		assert!(node.take_network_receiver().is_none());

		let cookie = [7u8; 32];
		node.handle_message(Message::NodeIdHandshake { query: Some(cookie), response: None });

		// The scheduler may interleave other broadcasts; find ours.
		loop {
			let NetworkCommand::Broadcast(message) = network.recv().await.unwrap();
			if let Message::NodeIdHandshake { response: Some((account, signature)), .. } = message
			{
				assert!(account.verify(&cookie, &signature));
				break
			}
		}

		node.stop().await;
	}
}
