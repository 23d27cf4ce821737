//! Bulk push client: offer the remote the chain segments it was missing
//! during the frontier scan.

use anyhow::{Context, Result};
use tokio::{io::AsyncWriteExt, time::timeout};
use tracing::debug;

use super::{connections::BootstrapClient, BootstrapConfig};
use crate::{
	block::BlockType,
	ledger::Ledger,
	messages::Message,
	primitives::BlockHash,
};

/// Send every block from each `(head, end)` segment, newest first, followed
/// by the stream terminator. Returns the number of blocks pushed.
pub async fn bulk_push(
	client: &mut BootstrapClient,
	ledger: &Ledger,
	targets: &[(BlockHash, BlockHash)],
	config: &BootstrapConfig,
) -> Result<u64> {
	timeout(config.io_timeout, client.stream.write_all(&Message::BulkPush.serialize()))
		.await
		.context("bulk push write timed out")?
		.context("bulk push write failed")?;

	let mut pushed = 0u64;
	for (head, end) in targets {
		let mut cursor = *head;
		while !cursor.is_zero() && cursor != *end {
			let block = {
				let txn = ledger.store().tx_begin_read();
				ledger.block_get(&txn, &cursor)
			};
			let Some(block) = block else { break };
			let mut bytes = vec![block.block_type() as u8];
			block.serialize(&mut bytes);
			timeout(config.io_timeout, client.stream.write_all(&bytes))
				.await
				.context("bulk push block write timed out")?
				.context("bulk push block write failed")?;
			pushed += 1;
			cursor = block.previous();
		}
	}
	timeout(config.io_timeout, client.stream.write_all(&[BlockType::NotABlock as u8]))
		.await
		.context("bulk push terminator write timed out")?
		.context("bulk push terminator write failed")?;

	debug!("Pushed {pushed} block(s) to {}", client.stats.peer);
	Ok(pushed)
}
