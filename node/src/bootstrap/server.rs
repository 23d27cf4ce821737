//! Serving side of bootstrap: answers frontier scans, chain pulls and push
//! streams from peers that are catching up.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	time::timeout,
};
use tracing::{debug, info_span, trace, Instrument};

use super::BootstrapConfig;
use crate::{
	block::{Block, BlockType},
	block_processor::{BlockProcessor, BlockSource},
	ledger::Ledger,
	messages::{
		read_message, AscPullAckPayload, AscPullReqType, BulkPull, FrontierReq, Message,
	},
	primitives::{Account, BlockHash},
};

/// Frontier pages and ascending pulls are capped per response.
const MAX_ASC_PULL_COUNT: usize = 128;

pub struct BootstrapServer {
	ledger: Arc<Ledger>,
	processor: Arc<BlockProcessor>,
	config: BootstrapConfig,
}

impl BootstrapServer {
	pub fn new(
		ledger: Arc<Ledger>,
		processor: Arc<BlockProcessor>,
		config: BootstrapConfig,
	) -> Arc<Self> {
		Arc::new(BootstrapServer { ledger, processor, config })
	}

	/// Accept loop. Ends when the listener is closed by shutdown.
	pub async fn run(self: Arc<Self>, listener: TcpListener) {
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let server = self.clone();
					tokio::spawn(
						async move {
							if let Err(error) = server.serve(stream).await {
								debug!("Bootstrap session ended: {error:#}");
							}
						}
						.instrument(info_span!("BootstrapServer", %peer)),
					);
				},
				Err(error) => {
					debug!("Bootstrap accept failed: {error}");
					break
				},
			}
		}
	}

	async fn serve(&self, mut stream: TcpStream) -> Result<()> {
		loop {
			// Peers keep a session open across several requests; an idle
			// one is eventually cut.
			let message = match timeout(
				self.config.io_timeout * 2,
				read_message(&mut stream),
			)
			.await
			{
				Ok(Ok(message)) => message,
				Ok(Err(_)) | Err(_) => return Ok(()),
			};

			match message {
				Message::FrontierReq(request) => self.send_frontiers(&mut stream, request).await?,
				Message::BulkPull(request) => self.send_chain(&mut stream, request).await?,
				Message::BulkPush => self.receive_push(&mut stream).await?,
				Message::AscPullReq { id, req } => self.send_asc_pull(&mut stream, id, req).await?,
				Message::Keepalive { .. } => {},
				other => {
					trace!("Ignoring {:?} on bootstrap session", other.message_type());
					return Ok(())
				},
			}
		}
	}

	async fn send_frontiers(&self, stream: &mut TcpStream, request: FrontierReq) -> Result<()> {
		let frontiers: Vec<(Account, BlockHash)> = {
			let txn = self.ledger.store().tx_begin_read();
			self.ledger
				.store()
				.account_iter(&txn, &request.start)
				.map(|(account, info)| (account, info.head))
				.take(request.count as usize)
				.collect()
		};
		let mut sent = 0usize;
		for (account, head) in frontiers {
			let mut pair = [0u8; 64];
			pair[..32].copy_from_slice(account.as_bytes());
			pair[32..].copy_from_slice(head.as_bytes());
			timeout(self.config.io_timeout, stream.write_all(&pair))
				.await
				.context("frontier write timed out")??;
			sent += 1;
		}
		// Zero sentinel terminates the stream.
		timeout(self.config.io_timeout, stream.write_all(&[0u8; 64]))
			.await
			.context("frontier terminator timed out")??;
		trace!("Served {sent} frontiers");
		Ok(())
	}

	async fn send_chain(&self, stream: &mut TcpStream, request: BulkPull) -> Result<()> {
		// `start` names an account (pull from its head) or a block hash
		// (pull from there).
		let head = {
			let txn = self.ledger.store().tx_begin_read();
			match self.ledger.store().account_get(&txn, &request.start.as_account()) {
				Some(info) => Some(info.head),
				None if self.ledger.block_exists(&txn, &request.start.as_hash()) =>
					Some(request.start.as_hash()),
				None => None,
			}
		};

		let mut sent = 0usize;
		let mut cursor = head.unwrap_or(BlockHash::ZERO);
		while !cursor.is_zero() && cursor != request.end {
			let block = {
				let txn = self.ledger.store().tx_begin_read();
				self.ledger.block_get(&txn, &cursor)
			};
			let Some(block) = block else { break };
			let mut bytes = vec![block.block_type() as u8];
			block.serialize(&mut bytes);
			timeout(self.config.io_timeout, stream.write_all(&bytes))
				.await
				.context("bulk pull write timed out")??;
			sent += 1;
			cursor = block.previous();
		}
		timeout(self.config.io_timeout, stream.write_all(&[BlockType::NotABlock as u8]))
			.await
			.context("bulk pull terminator timed out")??;
		trace!("Served {sent} blocks for {:?}", request.start);
		Ok(())
	}

	async fn receive_push(&self, stream: &mut TcpStream) -> Result<()> {
		let mut received = 0usize;
		loop {
			let mut type_byte = [0u8; 1];
			timeout(self.config.io_timeout, stream.read_exact(&mut type_byte))
				.await
				.context("bulk push read timed out")??;
			let Some(block_type) = BlockType::from_u8(type_byte[0]) else { return Ok(()) };
			if block_type == BlockType::NotABlock {
				break
			}
			let Some(size) = Block::serialized_size(block_type) else { return Ok(()) };
			let mut body = vec![0u8; size];
			timeout(self.config.io_timeout, stream.read_exact(&mut body))
				.await
				.context("bulk push body read timed out")??;
			if let Some(block) = Block::deserialize(block_type, &body) {
				received += 1;
				self.processor.add(block, BlockSource::Bootstrap).await;
			}
		}
		trace!("Received {received} pushed blocks");
		Ok(())
	}

	async fn send_asc_pull(
		&self,
		stream: &mut TcpStream,
		id: u64,
		request: AscPullReqType,
	) -> Result<()> {
		let payload = match request {
			AscPullReqType::Blocks { start, count } => {
				let count = (count as usize).min(MAX_ASC_PULL_COUNT);
				let txn = self.ledger.store().tx_begin_read();
				// Ascending from an account's open block, or from a given
				// hash.
				let mut cursor = match self
					.ledger
					.store()
					.account_get(&txn, &Account(start))
				{
					Some(info) => Some(info.open_block),
					None => {
						let hash = BlockHash(start);
						self.ledger.block_exists(&txn, &hash).then_some(hash)
					},
				};
				let mut blocks = Vec::new();
				while let Some(hash) = cursor {
					if blocks.len() >= count {
						break
					}
					let Some(block) = self.ledger.block_get(&txn, &hash) else { break };
					blocks.push(block);
					cursor = self.ledger.successor(&txn, &hash);
				}
				AscPullAckPayload::Blocks(blocks)
			},
			AscPullReqType::Frontiers { start, count } => {
				let count = (count as usize).min(MAX_ASC_PULL_COUNT);
				let txn = self.ledger.store().tx_begin_read();
				AscPullAckPayload::Frontiers(
					self.ledger
						.store()
						.account_iter(&txn, &start)
						.map(|(account, info)| (account, info.head))
						.take(count)
						.collect(),
				)
			},
		};
		let response = Message::AscPullAck { id, payload };
		timeout(self.config.io_timeout, stream.write_all(&response.serialize()))
			.await
			.context("asc pull write timed out")??;
		Ok(())
	}
}
