//! Bulk pull client: fetch one account chain segment over an idle
//! connection and feed it to the block processor.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	time::timeout,
};
use tracing::trace;

use super::{connections::BootstrapClient, BootstrapConfig, PullInfo};
use crate::{
	block::{Block, BlockType},
	block_processor::{BlockProcessor, BlockSource},
	messages::{BulkPull, Message},
	metrics,
	primitives::Root,
};

/// Issue one bulk pull. Returns the number of blocks received; errors mean
/// the connection is unusable and the pull should be requeued.
pub async fn bulk_pull(
	client: &mut BootstrapClient,
	pull: &PullInfo,
	processor: &Arc<BlockProcessor>,
	config: &BootstrapConfig,
) -> Result<u64> {
	metrics::BOOTSTRAP_PULLS.inc();
	let request = Message::BulkPull(BulkPull { start: Root(pull.account.0), end: pull.end });
	timeout(config.io_timeout, client.stream.write_all(&request.serialize()))
		.await
		.context("bulk pull write timed out")?
		.context("bulk pull write failed")?;

	let mut received = 0u64;
	let mut last: Option<Block> = None;
	loop {
		if client.stats.stopped() {
			bail!("connection stopped mid-pull");
		}

		let mut type_byte = [0u8; 1];
		timeout(config.io_timeout, client.stream.read_exact(&mut type_byte))
			.await
			.context("bulk pull read timed out")?
			.context("bulk pull read failed")?;
		let Some(block_type) = BlockType::from_u8(type_byte[0]) else {
			bail!("unknown block type {} in pull stream", type_byte[0]);
		};
		if block_type == BlockType::NotABlock {
			break
		}
		let size = Block::serialized_size(block_type)
			.context("stream carried a typeless block")?;
		let mut body = vec![0u8; size];
		timeout(config.io_timeout, client.stream.read_exact(&mut body))
			.await
			.context("bulk pull body read timed out")?
			.context("bulk pull body read failed")?;
		let block = Block::deserialize(block_type, &body).context("malformed pulled block")?;

		received += 1;
		client.stats.add_blocks(1);
		metrics::BOOTSTRAP_BLOCKS_RECEIVED.inc();
		last = Some(block.clone());
		// Straight into the processor; no staging layer.
		processor.add(block, BlockSource::Bootstrap).await;
	}

	// The stream has to connect back to what we asked for: the oldest block
	// received sits directly on top of our frontier.
	if !pull.end.is_zero() {
		match &last {
			Some(block) if block.previous() == pull.end => {},
			Some(block) => {
				bail!(
					"pull for {:?} ended at {:?}, expected to connect to {:?}",
					pull.account,
					block.hash(),
					pull.end
				)
			},
			None => bail!("pull for {:?} returned no blocks", pull.account),
		}
	} else if received == 0 && !pull.head.is_zero() {
		bail!("pull for {:?} returned no blocks", pull.account);
	}

	trace!("Pulled {received} block(s) for {:?} from {}", pull.account, client.stats.peer);
	Ok(received)
}
