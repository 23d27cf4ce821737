//! Frontier comparison: stream the remote's `(account, head)` pairs and
//! walk our own frontier set alongside, emitting pull tasks for what we
//! lack and push targets for what the remote lacks.

use anyhow::{bail, Context, Result};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	time::timeout,
};
use tracing::debug;

use super::{connections::BootstrapClient, BootstrapConfig, PullInfo};
use crate::{
	ledger::Ledger,
	messages::{FrontierReq, Message},
	primitives::{Account, BlockHash},
};

#[derive(Debug, Default)]
pub struct FrontierResult {
	pub pulls: Vec<PullInfo>,
	/// `(our_head, their_head)` segments the remote is missing.
	pub pushes: Vec<(BlockHash, BlockHash)>,
}

pub async fn request_frontiers(
	client: &mut BootstrapClient,
	ledger: &Ledger,
	config: &BootstrapConfig,
) -> Result<FrontierResult> {
	let request = Message::FrontierReq(FrontierReq {
		start: Account::ZERO,
		age: u32::MAX,
		count: u32::MAX,
	});
	timeout(config.io_timeout, client.stream.write_all(&request.serialize()))
		.await
		.context("frontier request write timed out")?
		.context("frontier request write failed")?;

	// Our own frontiers, ascending, fixed at request time.
	let ours: Vec<(Account, BlockHash)> = {
		let txn = ledger.store().tx_begin_read();
		ledger
			.store()
			.account_iter(&txn, &Account::ZERO)
			.map(|(account, info)| (account, info.head))
			.collect()
	};
	let mut our_index = 0usize;

	let mut result = FrontierResult::default();
	let started = tokio::time::Instant::now();
	let mut received = 0u64;

	loop {
		let mut pair = [0u8; 64];
		timeout(config.io_timeout, client.stream.read_exact(&mut pair))
			.await
			.context("frontier read timed out")?
			.context("frontier read failed")?;
		if pair == [0u8; 64] {
			break
		}
		received += 1;
		client.stats.add_blocks(1);

		// A trickling frontier stream stalls the whole attempt; abort and
		// let the caller retry elsewhere.
		let elapsed = started.elapsed().as_secs_f64();
		if elapsed > config.warmup_time.as_secs_f64() &&
			(received as f64 / elapsed) < config.frontier_minimum_blocks_per_sec
		{
			bail!(
				"frontier peer {} too slow ({:.0}/sec)",
				client.stats.peer,
				received as f64 / elapsed
			);
		}

		let mut account = [0u8; 32];
		account.copy_from_slice(&pair[..32]);
		let account = Account(account);
		let mut head = [0u8; 32];
		head.copy_from_slice(&pair[32..]);
		let their_head = BlockHash(head);

		// Accounts only we know about: push them later.
		while our_index < ours.len() && ours[our_index].0 < account {
			result.pushes.push((ours[our_index].1, BlockHash::ZERO));
			our_index += 1;
		}

		if our_index < ours.len() && ours[our_index].0 == account {
			let our_head = ours[our_index].1;
			our_index += 1;
			if our_head == their_head {
				continue
			}
			let we_have_theirs = {
				let txn = ledger.store().tx_begin_read();
				ledger.block_exists_or_pruned(&txn, &their_head)
			};
			if we_have_theirs {
				// The remote is behind on this account.
				result.pushes.push((our_head, their_head));
			} else {
				result.pulls.push(PullInfo::new(account, their_head, our_head));
			}
		} else {
			// An account we have never seen.
			result.pulls.push(PullInfo::new(account, their_head, BlockHash::ZERO));
		}
	}

	while our_index < ours.len() {
		result.pushes.push((ours[our_index].1, BlockHash::ZERO));
		our_index += 1;
	}

	debug!(
		"Frontier scan against {}: {} frontiers, {} pulls, {} pushes",
		client.stats.peer,
		received,
		result.pulls.len(),
		result.pushes.len()
	);
	Ok(result)
}
