//! Bootstrap: catching a node up by frontier comparison and bulk block
//! transfer against already-synced peers.
//!
//! An attempt owns a connection pool that is rescaled every second against
//! the remaining pull workload, a pull queue drained by per-connection
//! tasks, and a push list served back to the remote at the end. Slow peers
//! are dropped for the attempt, never blacklisted.

mod connections;
mod frontier;
mod pulls;
mod push;
mod server;

use std::{
	collections::VecDeque,
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
	block_processor::BlockProcessor,
	constants,
	ledger::Ledger,
	metrics,
	primitives::{Account, BlockHash},
};

pub use connections::{target_connections, BootstrapClient, ConnectionPool};
pub use server::BootstrapServer;

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
	/// Connection floor; the pool never aims below it.
	pub base_connections: usize,
	pub max_connections: usize,
	/// Pull backlog at which the pool saturates at `max_connections`.
	pub scale_target_pulls: usize,
	pub io_timeout: Duration,
	pub warmup_time: Duration,
	pub minimum_blocks_per_sec: f64,
	pub frontier_minimum_blocks_per_sec: f64,
	pub minimum_termination_time: Duration,
	pub max_new_connections: usize,
	pub frontier_retry_limit: u32,
	pub populate_interval: Duration,
}

impl Default for BootstrapConfig {
	fn default() -> Self {
		BootstrapConfig {
			base_connections: 4,
			max_connections: 64,
			scale_target_pulls: 50_000,
			io_timeout: constants::BOOTSTRAP_IO_TIMEOUT,
			warmup_time: constants::BOOTSTRAP_WARMUP_TIME,
			minimum_blocks_per_sec: constants::BOOTSTRAP_MINIMUM_BLOCKS_PER_SEC,
			frontier_minimum_blocks_per_sec:
				constants::BOOTSTRAP_MINIMUM_FRONTIER_BLOCKS_PER_SEC,
			minimum_termination_time: constants::BOOTSTRAP_MINIMUM_TERMINATION_TIME,
			max_new_connections: constants::BOOTSTRAP_MAX_NEW_CONNECTIONS,
			frontier_retry_limit: constants::BOOTSTRAP_FRONTIER_RETRY_LIMIT,
			populate_interval: constants::BOOTSTRAP_POPULATE_INTERVAL,
		}
	}
}

/// One account chain segment to fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullInfo {
	pub account: Account,
	/// The remote's head; zero when unknown.
	pub head: BlockHash,
	/// Our head, where the pulled segment must connect; zero for accounts
	/// we do not have at all.
	pub end: BlockHash,
	pub attempts: u32,
}

impl PullInfo {
	pub fn new(account: Account, head: BlockHash, end: BlockHash) -> Self {
		PullInfo { account, head, end, attempts: 0 }
	}
}

/// Rotating set of peers an attempt may dial. Never blacklists; a dropped
/// peer simply goes to the back of the line.
pub struct PeerRegistry {
	peers: Mutex<VecDeque<SocketAddr>>,
}

impl PeerRegistry {
	pub fn new(seed: Vec<SocketAddr>) -> Arc<Self> {
		Arc::new(PeerRegistry { peers: Mutex::new(seed.into_iter().collect()) })
	}

	pub fn add(&self, peer: SocketAddr) {
		let mut peers = self.peers.lock().expect("registry poisoned");
		if !peers.contains(&peer) {
			peers.push_back(peer);
		}
	}

	pub fn next_peer(&self) -> Option<SocketAddr> {
		let mut peers = self.peers.lock().expect("registry poisoned");
		let peer = peers.pop_front()?;
		peers.push_back(peer);
		Some(peer)
	}

	pub fn len(&self) -> usize {
		self.peers.lock().expect("registry poisoned").len()
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AttemptSummary {
	pub pulled_blocks: u64,
	pub pushed_blocks: u64,
	pub frontier_rounds: u32,
}

pub struct Bootstrapper {
	ledger: Arc<Ledger>,
	processor: Arc<BlockProcessor>,
	config: BootstrapConfig,
	in_progress: watch::Sender<bool>,
}

impl Bootstrapper {
	pub fn new(
		ledger: Arc<Ledger>,
		processor: Arc<BlockProcessor>,
		config: BootstrapConfig,
	) -> Arc<Self> {
		let (in_progress, _) = watch::channel(false);
		Arc::new(Bootstrapper { ledger, processor, config, in_progress })
	}

	pub fn subscribe_in_progress(&self) -> watch::Receiver<bool> {
		self.in_progress.subscribe()
	}

	/// Run one attempt against `peers` to completion.
	pub async fn bootstrap(&self, peers: Vec<SocketAddr>) -> Result<AttemptSummary> {
		let _ = self.in_progress.send(true);
		let attempt = BootstrapAttempt::new(
			self.ledger.clone(),
			self.processor.clone(),
			self.config.clone(),
			PeerRegistry::new(peers),
		);
		let result = attempt
			.clone()
			.run()
			.instrument(info_span!("BootstrapAttempt"))
			.await;
		let _ = self.in_progress.send(false);
		result
	}
}

struct AttemptState {
	pulls: VecDeque<PullInfo>,
	pushes: Vec<(BlockHash, BlockHash)>,
	frontier_peer: Option<SocketAddr>,
}

pub struct BootstrapAttempt {
	ledger: Arc<Ledger>,
	processor: Arc<BlockProcessor>,
	config: BootstrapConfig,
	pool: Arc<ConnectionPool>,
	registry: Arc<PeerRegistry>,
	state: Mutex<AttemptState>,
	pulling: AtomicUsize,
	total_blocks: AtomicU64,
	stopped: Arc<AtomicBool>,
}

impl BootstrapAttempt {
	fn new(
		ledger: Arc<Ledger>,
		processor: Arc<BlockProcessor>,
		config: BootstrapConfig,
		registry: Arc<PeerRegistry>,
	) -> Arc<Self> {
		let pool = ConnectionPool::new(config.clone());
		Arc::new(BootstrapAttempt {
			ledger,
			processor,
			config,
			pool,
			registry,
			state: Mutex::new(AttemptState {
				pulls: VecDeque::new(),
				pushes: Vec::new(),
				frontier_peer: None,
			}),
			pulling: AtomicUsize::new(0),
			total_blocks: AtomicU64::new(0),
			stopped: Arc::new(AtomicBool::new(false)),
		})
	}

	pub fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
	}

	fn pulls_remaining(&self) -> usize {
		self.state.lock().expect("attempt poisoned").pulls.len() +
			self.pulling.load(Ordering::Relaxed)
	}

	async fn run(self: Arc<Self>) -> Result<AttemptSummary> {
		// Pool maintenance on a fixed cadence for the attempt's lifetime.
		let maintenance = {
			let attempt = self.clone();
			tokio::spawn(async move {
				while !attempt.stopped.load(Ordering::SeqCst) {
					let remaining = attempt.pulls_remaining();
					attempt.pool.populate(remaining, &attempt.registry).await;
					tokio::time::sleep(attempt.config.populate_interval).await;
				}
			})
		};

		let result = self.clone().run_phases().await;
		self.stop();
		let _ = maintenance.await;
		result
	}

	async fn run_phases(self: Arc<Self>) -> Result<AttemptSummary> {
		let mut summary = AttemptSummary::default();

		// Alternate frontier scan and pull drain until a scan comes back
		// clean; forks resolved while pulling can surface new work.
		loop {
			summary.frontier_rounds += 1;
			let scan = self.frontier_phase().await?;
			{
				let mut state = self.state.lock().expect("attempt poisoned");
				state.pushes = scan.pushes;
				state.pulls.extend(scan.pulls);
				if state.pulls.is_empty() {
					break
				}
			}
			self.clone().pull_phase().await;
			// Everything pulled has to clear the processor before the next
			// comparison is meaningful.
			self.processor.flush().await;

			if summary.frontier_rounds >= self.config.frontier_retry_limit {
				warn!("Frontier comparison did not stabilise; giving up this attempt");
				break
			}
		}

		summary.pulled_blocks = self.total_blocks.load(Ordering::Relaxed);
		summary.pushed_blocks = self.push_phase().await?;
		info!(
			"Bootstrap attempt complete: {} pulled, {} pushed, {} frontier round(s)",
			summary.pulled_blocks, summary.pushed_blocks, summary.frontier_rounds
		);
		Ok(summary)
	}

	/// Wait for an idle connection, bounded by the io timeout times a small
	/// factor so a dead pool fails the phase rather than hanging it.
	async fn wait_for_idle(&self) -> Option<BootstrapClient> {
		let deadline = tokio::time::Instant::now() + self.config.io_timeout * 4;
		loop {
			if self.stopped.load(Ordering::SeqCst) {
				return None
			}
			if let Some(client) = self.pool.pop_idle() {
				return Some(client)
			}
			if tokio::time::Instant::now() >= deadline {
				return None
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
	}

	async fn frontier_phase(&self) -> Result<frontier::FrontierResult> {
		for retry in 0..self.config.frontier_retry_limit {
			let Some(mut client) = self.wait_for_idle().await else {
				bail!("no bootstrap connections available for frontier request")
			};
			let peer = client.stats.peer;
			match frontier::request_frontiers(&mut client, &self.ledger, &self.config).await {
				Ok(result) => {
					self.state.lock().expect("attempt poisoned").frontier_peer = Some(peer);
					self.pool.repool(client);
					return Ok(result)
				},
				Err(error) => {
					debug!("Frontier request {retry} against {peer} failed: {error:#}");
				},
			}
		}
		bail!("frontier request failed against every peer tried")
	}

	async fn pull_phase(self: Arc<Self>) {
		loop {
			if self.stopped.load(Ordering::SeqCst) {
				break
			}
			let next = self.state.lock().expect("attempt poisoned").pulls.pop_front();
			match next {
				Some(pull) if pull.attempts > self.config.frontier_retry_limit => {
					// Last resort: one shot against the frontier peer, then
					// the pull is abandoned.
					self.clone().last_resort_pull(pull).await;
				},
				Some(pull) => {
					let Some(client) = self.wait_for_idle().await else {
						// No connections; put it back untouched and give
						// the pool a beat to recover.
						self.state
							.lock()
							.expect("attempt poisoned")
							.pulls
							.push_front(pull);
						tokio::time::sleep(Duration::from_millis(100)).await;
						continue
					};
					self.pulling.fetch_add(1, Ordering::SeqCst);
					let attempt = self.clone();
					tokio::spawn(async move {
						attempt.run_one_pull(client, pull).await;
						attempt.pulling.fetch_sub(1, Ordering::SeqCst);
					});
				},
				None => {
					if self.pulling.load(Ordering::SeqCst) == 0 {
						break
					}
					tokio::time::sleep(Duration::from_millis(50)).await;
				},
			}
		}
	}

	async fn run_one_pull(&self, mut client: BootstrapClient, pull: PullInfo) {
		match pulls::bulk_pull(&mut client, &pull, &self.processor, &self.config).await {
			Ok(received) => {
				self.total_blocks.fetch_add(received, Ordering::Relaxed);
				self.pool.repool(client);
			},
			Err(error) => {
				debug!(
					"Pull for {:?} via {} failed (attempt {}): {error:#}",
					pull.account, client.stats.peer, pull.attempts
				);
				// The connection is suspect; the pull goes back in the queue
				// for someone else.
				self.requeue(pull);
			},
		}
	}

	fn requeue(&self, mut pull: PullInfo) {
		pull.attempts += 1;
		metrics::BOOTSTRAP_PULL_RETRIES.inc();
		self.state.lock().expect("attempt poisoned").pulls.push_back(pull);
	}

	async fn last_resort_pull(self: Arc<Self>, pull: PullInfo) {
		let peer = self.state.lock().expect("attempt poisoned").frontier_peer;
		let Some(peer) = peer else {
			warn!("Dropping pull for {:?} after {} attempts", pull.account, pull.attempts);
			return
		};
		self.pool.connect(peer).await;
		let Some(mut client) = self.pool.pop_idle() else {
			warn!("Dropping pull for {:?} after {} attempts", pull.account, pull.attempts);
			return
		};
		match pulls::bulk_pull(&mut client, &pull, &self.processor, &self.config).await {
			Ok(received) => {
				self.total_blocks.fetch_add(received, Ordering::Relaxed);
				self.pool.repool(client);
			},
			Err(error) => {
				warn!(
					"Dropping pull for {:?} after last-resort attempt: {error:#}",
					pull.account
				);
			},
		}
	}

	async fn push_phase(&self) -> Result<u64> {
		let targets = {
			let state = self.state.lock().expect("attempt poisoned");
			state.pushes.clone()
		};
		if targets.is_empty() {
			return Ok(0)
		}
		let Some(mut client) = self.wait_for_idle().await else {
			bail!("no bootstrap connection available for bulk push")
		};
		let pushed = push::bulk_push(&mut client, &self.ledger, &targets, &self.config)
			.await
			.context("bulk push failed")?;
		self.pool.repool(client);
		Ok(pushed)
	}
}
