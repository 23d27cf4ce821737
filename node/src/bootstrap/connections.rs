//! The bootstrap connection pool: idle clients, rate tracking, adaptive
//! scaling and eviction of unproductive peers.

use std::{
	collections::VecDeque,
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
		Arc, Mutex, Weak,
	},
	time::Instant,
};

use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::{BootstrapConfig, PeerRegistry};
use crate::metrics;

/// Shared per-connection counters. The pull task owns the socket; everyone
/// else observes and signals through this.
pub struct ClientStats {
	pub peer: SocketAddr,
	blocks: AtomicU64,
	started: Instant,
	stop: AtomicBool,
}

impl ClientStats {
	fn new(peer: SocketAddr) -> Arc<Self> {
		Arc::new(ClientStats {
			peer,
			blocks: AtomicU64::new(0),
			started: Instant::now(),
			stop: AtomicBool::new(false),
		})
	}

	pub fn add_blocks(&self, count: u64) {
		self.blocks.fetch_add(count, Ordering::Relaxed);
	}

	pub fn block_count(&self) -> u64 {
		self.blocks.load(Ordering::Relaxed)
	}

	pub fn elapsed_secs(&self) -> f64 {
		self.started.elapsed().as_secs_f64()
	}

	pub fn block_rate(&self) -> f64 {
		let elapsed = self.elapsed_secs().max(f64::EPSILON);
		self.block_count() as f64 / elapsed
	}

	pub fn stop(&self) {
		self.stop.store(true, Ordering::SeqCst);
	}

	pub fn stopped(&self) -> bool {
		self.stop.load(Ordering::SeqCst)
	}
}

pub struct BootstrapClient {
	pub stream: TcpStream,
	pub stats: Arc<ClientStats>,
}

pub struct ConnectionPool {
	config: BootstrapConfig,
	idle: Mutex<VecDeque<BootstrapClient>>,
	/// Every client ever opened by this attempt, for rate bookkeeping.
	clients: Mutex<Vec<Weak<ClientStats>>>,
	connecting: AtomicUsize,
}

/// A peer that has been around past the termination grace period yet
/// dribbles blocks below the floor can hold the whole attempt hostage on
/// the last remaining pull.
pub fn should_force_stop(elapsed_secs: f64, blocks_per_sec: f64, config: &BootstrapConfig) -> bool {
	elapsed_secs > config.minimum_termination_time.as_secs_f64() &&
		blocks_per_sec < config.minimum_blocks_per_sec
}

/// Connection goal for the remaining workload: a linear ramp from the base
/// floor to the maximum, saturating at `scale_target_pulls`.
pub fn target_connections(pulls_remaining: usize, config: &BootstrapConfig) -> usize {
	if config.base_connections >= config.max_connections {
		return config.max_connections.max(1)
	}
	let step = (pulls_remaining as f64 / config.scale_target_pulls as f64).clamp(0.0, 1.0);
	let target = config.base_connections as f64 +
		(config.max_connections - config.base_connections) as f64 * step;
	(target + 0.5) as usize
}

impl ConnectionPool {
	pub fn new(config: BootstrapConfig) -> Arc<Self> {
		Arc::new(ConnectionPool {
			config,
			idle: Mutex::new(VecDeque::new()),
			clients: Mutex::new(Vec::new()),
			connecting: AtomicUsize::new(0),
		})
	}

	pub fn config(&self) -> &BootstrapConfig {
		&self.config
	}

	/// Live connections, including in-flight dials.
	pub fn connection_count(&self) -> usize {
		let live = self
			.clients
			.lock()
			.expect("pool poisoned")
			.iter()
			.filter(|weak| weak.upgrade().is_some())
			.count();
		live + self.connecting.load(Ordering::Relaxed)
	}

	pub fn pop_idle(&self) -> Option<BootstrapClient> {
		let mut idle = self.idle.lock().expect("pool poisoned");
		while let Some(client) = idle.pop_front() {
			if client.stats.stopped() {
				continue
			}
			return Some(client)
		}
		None
	}

	/// Return a client after a completed operation. Stopped clients are
	/// dropped instead of repooled.
	pub fn repool(&self, client: BootstrapClient) {
		if client.stats.stopped() {
			metrics::BOOTSTRAP_CONNECTIONS_DROPPED.with_label_values(&["stopped"]).inc();
			return
		}
		self.idle.lock().expect("pool poisoned").push_front(client);
	}

	pub async fn connect(self: &Arc<Self>, peer: SocketAddr) {
		self.connecting.fetch_add(1, Ordering::Relaxed);
		let result =
			tokio::time::timeout(self.config.io_timeout, TcpStream::connect(peer)).await;
		self.connecting.fetch_sub(1, Ordering::Relaxed);
		match result {
			Ok(Ok(stream)) => {
				let stats = ClientStats::new(peer);
				self.clients.lock().expect("pool poisoned").push(Arc::downgrade(&stats));
				self.idle
					.lock()
					.expect("pool poisoned")
					.push_back(BootstrapClient { stream, stats });
				trace!("Bootstrap connection to {peer} established");
			},
			Ok(Err(error)) => {
				debug!("Bootstrap connection to {peer} failed: {error}");
			},
			Err(_) => {
				debug!("Bootstrap connection to {peer} timed out");
			},
		}
	}

	/// One maintenance pass: stop unproductive peers, rebalance, and open
	/// new connections toward the target. Runs on a 1 s cadence while an
	/// attempt is live.
	pub async fn populate(self: &Arc<Self>, pulls_remaining: usize, peers: &PeerRegistry) {
		let target = target_connections(pulls_remaining, &self.config);

		let mut warmed: Vec<Arc<ClientStats>> = Vec::new();
		{
			let mut clients = self.clients.lock().expect("pool poisoned");
			clients.retain(|weak| weak.upgrade().is_some());
			for stats in clients.iter().filter_map(|weak| weak.upgrade()) {
				if stats.elapsed_secs() > self.config.warmup_time.as_secs_f64() &&
					stats.block_count() > 0
				{
					warmed.push(stats.clone());
				}
				if should_force_stop(stats.elapsed_secs(), stats.block_rate(), &self.config) {
					warn!(
						"Stopping slow bootstrap peer {} ({:.1} blocks/sec)",
						stats.peer,
						stats.block_rate()
					);
					metrics::BOOTSTRAP_CONNECTIONS_DROPPED.with_label_values(&["slow"]).inc();
					stats.stop();
				}
			}
		}

		// Rotate the fastest peers out once most of the pool has warmed up,
		// making room to sample unseen peers.
		if warmed.len() * 3 >= target * 2 && target >= 4 {
			let drop = ((target as f64 - 2.0).sqrt().round()) as usize;
			warmed.sort_by(|a, b| {
				b.block_rate().partial_cmp(&a.block_rate()).unwrap_or(std::cmp::Ordering::Equal)
			});
			for stats in warmed.iter().take(drop) {
				debug!(
					"Rotating out bootstrap peer {} ({:.1} blocks/sec)",
					stats.peer,
					stats.block_rate()
				);
				metrics::BOOTSTRAP_CONNECTIONS_DROPPED.with_label_values(&["rotated"]).inc();
				stats.stop();
			}
		}

		// Drop idle clients that were stopped above.
		{
			let mut idle = self.idle.lock().expect("pool poisoned");
			idle.retain(|client| !client.stats.stopped());
		}

		let current = self.connection_count();
		if current < target {
			let delta = ((target - current) * 2).min(self.config.max_new_connections);
			for _ in 0..delta {
				let Some(peer) = peers.next_peer() else { break };
				let pool = self.clone();
				tokio::spawn(async move { pool.connect(peer).await });
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn config(base: usize, max: usize) -> BootstrapConfig {
		BootstrapConfig {
			base_connections: base,
			max_connections: max,
			scale_target_pulls: 50_000,
			io_timeout: Duration::from_secs(5),
			..Default::default()
		}
	}

	#[test]
	fn target_scales_linearly_with_remaining_pulls() {
		let config = config(4, 64);
		assert_eq!(target_connections(0, &config), 4);
		assert_eq!(target_connections(50_000, &config), 64);
		assert_eq!(target_connections(100_000, &config), 64);
		// Half way: base + (max - base) / 2, rounded.
		assert_eq!(target_connections(25_000, &config), 34);
	}

	#[test]
	fn target_is_at_least_one() {
		let config = config(0, 0);
		assert_eq!(target_connections(0, &config), 1);
	}

	#[test]
	fn base_above_max_clamps_to_max() {
		let config = config(64, 8);
		assert_eq!(target_connections(123, &config), 8);
	}

	#[test]
	fn slow_peers_are_stopped_only_after_the_grace_period() {
		let config = config(4, 64);
		// One block per second is hopeless, but only once the attempt has
		// run long enough.
		assert!(!should_force_stop(10.0, 1.0, &config));
		assert!(should_force_stop(31.0, 1.0, &config));
		// A healthy peer is left alone regardless of age.
		assert!(!should_force_stop(300.0, 500.0, &config));
	}
}
