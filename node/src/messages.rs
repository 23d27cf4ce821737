//! Typed inter-node message envelopes and their canonical wire codec.
//!
//! Every message shares an 8-byte header: two magic bytes, three protocol
//! versions, the message type, and 16 bits of extensions. Block type lives
//! in extension bits 8..11, multi-entry counts in bits 12..15, bootstrap
//! flags in the low byte. Multi-byte integers are big-endian.

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
	block::{Block, BlockType},
	constants::{NETWORK_ID_DEV, NETWORK_MAGIC, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN},
	primitives::{Account, BlockHash, Root, Signature},
	vote::Vote,
};

pub const HEADER_SIZE: usize = 8;

const BLOCK_TYPE_MASK: u16 = 0x0f00;
const COUNT_MASK: u16 = 0xf000;

/// Handshake extension flags.
const HANDSHAKE_QUERY_FLAG: u16 = 1;
const HANDSHAKE_RESPONSE_FLAG: u16 = 1 << 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MessageType {
	Invalid = 0,
	NotAType = 1,
	Keepalive = 2,
	Publish = 3,
	ConfirmReq = 4,
	ConfirmAck = 5,
	BulkPull = 6,
	BulkPush = 7,
	FrontierReq = 8,
	NodeIdHandshake = 10,
	AscPullReq = 14,
	AscPullAck = 15,
}

impl MessageType {
	pub fn from_u8(value: u8) -> Option<Self> {
		match value {
			0 => Some(MessageType::Invalid),
			1 => Some(MessageType::NotAType),
			2 => Some(MessageType::Keepalive),
			3 => Some(MessageType::Publish),
			4 => Some(MessageType::ConfirmReq),
			5 => Some(MessageType::ConfirmAck),
			6 => Some(MessageType::BulkPull),
			7 => Some(MessageType::BulkPush),
			8 => Some(MessageType::FrontierReq),
			10 => Some(MessageType::NodeIdHandshake),
			14 => Some(MessageType::AscPullReq),
			15 => Some(MessageType::AscPullAck),
			_ => None,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MessageHeader {
	pub network: [u8; 2],
	pub version_max: u8,
	pub version_using: u8,
	pub version_min: u8,
	pub message_type: MessageType,
	pub extensions: u16,
}

impl MessageHeader {
	pub fn new(message_type: MessageType) -> Self {
		MessageHeader {
			network: [NETWORK_MAGIC, NETWORK_ID_DEV],
			version_max: PROTOCOL_VERSION,
			version_using: PROTOCOL_VERSION,
			version_min: PROTOCOL_VERSION_MIN,
			message_type,
			extensions: 0,
		}
	}

	pub fn block_type(&self) -> Option<BlockType> {
		BlockType::from_u8(((self.extensions & BLOCK_TYPE_MASK) >> 8) as u8)
	}

	pub fn set_block_type(&mut self, block_type: BlockType) {
		self.extensions = (self.extensions & !BLOCK_TYPE_MASK) | ((block_type as u16) << 8);
	}

	pub fn count(&self) -> u8 {
		((self.extensions & COUNT_MASK) >> 12) as u8
	}

	pub fn set_count(&mut self, count: u8) {
		debug_assert!(count < 16);
		self.extensions = (self.extensions & !COUNT_MASK) | ((count as u16) << 12);
	}

	pub fn serialize(&self) -> [u8; HEADER_SIZE] {
		let mut bytes = [0u8; HEADER_SIZE];
		bytes[0] = self.network[0];
		bytes[1] = self.network[1];
		bytes[2] = self.version_max;
		bytes[3] = self.version_using;
		bytes[4] = self.version_min;
		bytes[5] = self.message_type as u8;
		bytes[6..8].copy_from_slice(&self.extensions.to_be_bytes());
		bytes
	}

	pub fn deserialize(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
		let message_type = MessageType::from_u8(bytes[5])
			.ok_or_else(|| anyhow!("unknown message type {}", bytes[5]))?;
		Ok(MessageHeader {
			network: [bytes[0], bytes[1]],
			version_max: bytes[2],
			version_using: bytes[3],
			version_min: bytes[4],
			message_type,
			extensions: u16::from_be_bytes([bytes[6], bytes[7]]),
		})
	}
}

/// Frontier scan request: stream `(account, head)` pairs starting at
/// `start`, at most `count` (zero meaning unbounded).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrontierReq {
	pub start: Account,
	pub age: u32,
	pub count: u32,
}

/// Chain fetch: the serving side walks from its head of `start`'s account
/// down to (excluding) `end`, then terminates with `not_a_block`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BulkPull {
	pub start: Root,
	pub end: BlockHash,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AscPullReqType {
	/// Up to `count` blocks ascending from a frontier-or-hash `start`.
	Blocks { start: [u8; 32], count: u8 },
	/// A page of `(account, head)` frontiers ascending from `start`.
	Frontiers { start: Account, count: u16 },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AscPullAckPayload {
	Blocks(Vec<Block>),
	Frontiers(Vec<(Account, BlockHash)>),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
	Keepalive {
		/// Up to eight peer endpoints: 16-byte ip, big-endian port.
		peers: Vec<([u8; 16], u16)>,
	},
	Publish {
		block: Block,
	},
	/// Solicit votes, either for a concrete block or for root/hash pairs.
	ConfirmReq {
		block: Option<Block>,
		roots_hashes: Vec<(Root, BlockHash)>,
	},
	ConfirmAck {
		vote: Vote,
	},
	NodeIdHandshake {
		query: Option<[u8; 32]>,
		response: Option<(Account, Signature)>,
	},
	FrontierReq(FrontierReq),
	BulkPull(BulkPull),
	/// No body; the sender follows up with a block stream.
	BulkPush,
	AscPullReq {
		id: u64,
		req: AscPullReqType,
	},
	AscPullAck {
		id: u64,
		payload: AscPullAckPayload,
	},
}

/// Outbound traffic handed to the (external) realtime transport.
#[derive(Clone, Debug)]
pub enum NetworkCommand {
	Broadcast(Message),
}

impl Message {
	pub fn message_type(&self) -> MessageType {
		match self {
			Message::Keepalive { .. } => MessageType::Keepalive,
			Message::Publish { .. } => MessageType::Publish,
			Message::ConfirmReq { .. } => MessageType::ConfirmReq,
			Message::ConfirmAck { .. } => MessageType::ConfirmAck,
			Message::NodeIdHandshake { .. } => MessageType::NodeIdHandshake,
			Message::FrontierReq(_) => MessageType::FrontierReq,
			Message::BulkPull(_) => MessageType::BulkPull,
			Message::BulkPush => MessageType::BulkPush,
			Message::AscPullReq { .. } => MessageType::AscPullReq,
			Message::AscPullAck { .. } => MessageType::AscPullAck,
		}
	}

	pub fn serialize(&self) -> Vec<u8> {
		let mut header = MessageHeader::new(self.message_type());
		let mut body = Vec::new();
		match self {
			Message::Keepalive { peers } => {
				debug_assert!(peers.len() <= 8);
				for (ip, port) in peers.iter().take(8) {
					body.extend_from_slice(ip);
					body.extend_from_slice(&port.to_be_bytes());
				}
				// Pad to exactly eight entries.
				body.resize(8 * 18, 0);
			},
			Message::Publish { block } => {
				header.set_block_type(block.block_type());
				block.serialize(&mut body);
			},
			Message::ConfirmReq { block, roots_hashes } => match block {
				Some(block) => {
					header.set_block_type(block.block_type());
					block.serialize(&mut body);
				},
				None => {
					header.set_block_type(BlockType::NotABlock);
					header.set_count(roots_hashes.len().min(15) as u8);
					for (root, hash) in roots_hashes.iter().take(15) {
						body.extend_from_slice(root.as_bytes());
						body.extend_from_slice(hash.as_bytes());
					}
				},
			},
			Message::ConfirmAck { vote } => {
				header.set_block_type(BlockType::NotABlock);
				header.set_count(vote.hashes.len().min(15) as u8);
				body.extend_from_slice(vote.voter.as_bytes());
				body.extend_from_slice(vote.signature.as_bytes());
				body.extend_from_slice(&vote.timestamp.to_be_bytes());
				for hash in vote.hashes.iter().take(15) {
					body.extend_from_slice(hash.as_bytes());
				}
			},
			Message::NodeIdHandshake { query, response } => {
				if query.is_some() {
					header.extensions |= HANDSHAKE_QUERY_FLAG;
				}
				if response.is_some() {
					header.extensions |= HANDSHAKE_RESPONSE_FLAG;
				}
				if let Some(cookie) = query {
					body.extend_from_slice(cookie);
				}
				if let Some((account, signature)) = response {
					body.extend_from_slice(account.as_bytes());
					body.extend_from_slice(signature.as_bytes());
				}
			},
			Message::FrontierReq(req) => {
				body.extend_from_slice(req.start.as_bytes());
				body.extend_from_slice(&req.age.to_be_bytes());
				body.extend_from_slice(&req.count.to_be_bytes());
			},
			Message::BulkPull(req) => {
				body.extend_from_slice(req.start.as_bytes());
				body.extend_from_slice(req.end.as_bytes());
			},
			Message::BulkPush => {},
			Message::AscPullReq { id, req } => {
				match req {
					AscPullReqType::Blocks { .. } => body.push(0),
					AscPullReqType::Frontiers { .. } => body.push(1),
				}
				body.extend_from_slice(&id.to_be_bytes());
				match req {
					AscPullReqType::Blocks { start, count } => {
						body.extend_from_slice(start);
						body.push(*count);
					},
					AscPullReqType::Frontiers { start, count } => {
						body.extend_from_slice(start.as_bytes());
						body.extend_from_slice(&count.to_be_bytes());
					},
				}
			},
			Message::AscPullAck { id, payload } => {
				match payload {
					AscPullAckPayload::Blocks(_) => body.push(0),
					AscPullAckPayload::Frontiers(_) => body.push(1),
				}
				body.extend_from_slice(&id.to_be_bytes());
				match payload {
					AscPullAckPayload::Blocks(blocks) => {
						for block in blocks {
							body.push(block.block_type() as u8);
							block.serialize(&mut body);
						}
						body.push(BlockType::NotABlock as u8);
					},
					AscPullAckPayload::Frontiers(frontiers) => {
						for (account, head) in frontiers {
							body.extend_from_slice(account.as_bytes());
							body.extend_from_slice(head.as_bytes());
						}
						// Zero sentinel pair.
						body.extend_from_slice(&[0u8; 64]);
					},
				}
			},
		}

		let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
		bytes.extend_from_slice(&header.serialize());
		bytes.extend_from_slice(&body);
		bytes
	}
}

async fn read_exact_vec<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
	let mut buffer = vec![0u8; len];
	reader.read_exact(&mut buffer).await?;
	Ok(buffer)
}

async fn read_block<R: AsyncRead + Unpin>(
	reader: &mut R,
	block_type: BlockType,
) -> Result<Block> {
	let size = Block::serialized_size(block_type)
		.ok_or_else(|| anyhow!("not a deserializable block type {block_type:?}"))?;
	let body = read_exact_vec(reader, size).await?;
	Block::deserialize(block_type, &body).ok_or_else(|| anyhow!("malformed block body"))
}

/// Read one framed message. Streamed payloads (frontier and bulk-pull
/// responses) are not messages and are read by the bootstrap clients
/// directly.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
	let mut header_bytes = [0u8; HEADER_SIZE];
	reader.read_exact(&mut header_bytes).await?;
	let header = MessageHeader::deserialize(&header_bytes)?;

	match header.message_type {
		MessageType::Keepalive => {
			let body = read_exact_vec(reader, 8 * 18).await?;
			let mut peers = Vec::with_capacity(8);
			for entry in body.chunks_exact(18) {
				let mut ip = [0u8; 16];
				ip.copy_from_slice(&entry[..16]);
				let port = u16::from_be_bytes([entry[16], entry[17]]);
				if ip != [0u8; 16] || port != 0 {
					peers.push((ip, port));
				}
			}
			Ok(Message::Keepalive { peers })
		},
		MessageType::Publish => {
			let block_type =
				header.block_type().ok_or_else(|| anyhow!("publish without block type"))?;
			let block = read_block(reader, block_type).await?;
			Ok(Message::Publish { block })
		},
		MessageType::ConfirmReq => {
			let block_type =
				header.block_type().ok_or_else(|| anyhow!("confirm_req without block type"))?;
			if block_type == BlockType::NotABlock {
				let count = header.count() as usize;
				let body = read_exact_vec(reader, count * 64).await?;
				let mut roots_hashes = Vec::with_capacity(count);
				for entry in body.chunks_exact(64) {
					let mut root = [0u8; 32];
					root.copy_from_slice(&entry[..32]);
					let mut hash = [0u8; 32];
					hash.copy_from_slice(&entry[32..]);
					roots_hashes.push((Root(root), BlockHash(hash)));
				}
				Ok(Message::ConfirmReq { block: None, roots_hashes })
			} else {
				let block = read_block(reader, block_type).await?;
				Ok(Message::ConfirmReq { block: Some(block), roots_hashes: Vec::new() })
			}
		},
		MessageType::ConfirmAck => {
			let count = header.count() as usize;
			let body = read_exact_vec(reader, 32 + 64 + 8 + count * 32).await?;
			let mut voter = [0u8; 32];
			voter.copy_from_slice(&body[..32]);
			let mut signature = [0u8; 64];
			signature.copy_from_slice(&body[32..96]);
			let mut timestamp = [0u8; 8];
			timestamp.copy_from_slice(&body[96..104]);
			let mut hashes = Vec::with_capacity(count);
			for entry in body[104..].chunks_exact(32) {
				let mut hash = [0u8; 32];
				hash.copy_from_slice(entry);
				hashes.push(BlockHash(hash));
			}
			Ok(Message::ConfirmAck {
				vote: Vote {
					voter: Account(voter),
					timestamp: u64::from_be_bytes(timestamp),
					hashes,
					signature: Signature(signature),
				},
			})
		},
		MessageType::NodeIdHandshake => {
			let query = if header.extensions & HANDSHAKE_QUERY_FLAG != 0 {
				let cookie = read_exact_vec(reader, 32).await?;
				Some(cookie.try_into().expect("read 32 bytes"))
			} else {
				None
			};
			let response = if header.extensions & HANDSHAKE_RESPONSE_FLAG != 0 {
				let body = read_exact_vec(reader, 96).await?;
				let mut account = [0u8; 32];
				account.copy_from_slice(&body[..32]);
				let mut signature = [0u8; 64];
				signature.copy_from_slice(&body[32..]);
				Some((Account(account), Signature(signature)))
			} else {
				None
			};
			Ok(Message::NodeIdHandshake { query, response })
		},
		MessageType::FrontierReq => {
			let body = read_exact_vec(reader, 32 + 4 + 4).await?;
			let mut start = [0u8; 32];
			start.copy_from_slice(&body[..32]);
			Ok(Message::FrontierReq(FrontierReq {
				start: Account(start),
				age: u32::from_be_bytes(body[32..36].try_into().expect("4 bytes")),
				count: u32::from_be_bytes(body[36..40].try_into().expect("4 bytes")),
			}))
		},
		MessageType::BulkPull => {
			let body = read_exact_vec(reader, 64).await?;
			let mut start = [0u8; 32];
			start.copy_from_slice(&body[..32]);
			let mut end = [0u8; 32];
			end.copy_from_slice(&body[32..]);
			Ok(Message::BulkPull(BulkPull { start: Root(start), end: BlockHash(end) }))
		},
		MessageType::BulkPush => Ok(Message::BulkPush),
		MessageType::AscPullReq => {
			let mut prefix = [0u8; 9];
			reader.read_exact(&mut prefix).await?;
			let id = u64::from_be_bytes(prefix[1..9].try_into().expect("8 bytes"));
			match prefix[0] {
				0 => {
					let body = read_exact_vec(reader, 33).await?;
					let mut start = [0u8; 32];
					start.copy_from_slice(&body[..32]);
					Ok(Message::AscPullReq {
						id,
						req: AscPullReqType::Blocks { start, count: body[32] },
					})
				},
				1 => {
					let body = read_exact_vec(reader, 34).await?;
					let mut start = [0u8; 32];
					start.copy_from_slice(&body[..32]);
					Ok(Message::AscPullReq {
						id,
						req: AscPullReqType::Frontiers {
							start: Account(start),
							count: u16::from_be_bytes([body[32], body[33]]),
						},
					})
				},
				other => bail!("unknown asc_pull_req type {other}"),
			}
		},
		MessageType::AscPullAck => {
			let mut prefix = [0u8; 9];
			reader.read_exact(&mut prefix).await?;
			let id = u64::from_be_bytes(prefix[1..9].try_into().expect("8 bytes"));
			match prefix[0] {
				0 => {
					let mut blocks = Vec::new();
					loop {
						let mut type_byte = [0u8; 1];
						reader.read_exact(&mut type_byte).await?;
						let block_type = BlockType::from_u8(type_byte[0])
							.ok_or_else(|| anyhow!("unknown block type {}", type_byte[0]))?;
						if block_type == BlockType::NotABlock {
							break
						}
						blocks.push(read_block(reader, block_type).await?);
					}
					Ok(Message::AscPullAck { id, payload: AscPullAckPayload::Blocks(blocks) })
				},
				1 => {
					let mut frontiers = Vec::new();
					loop {
						let entry = read_exact_vec(reader, 64).await?;
						if entry.iter().all(|byte| *byte == 0) {
							break
						}
						let mut account = [0u8; 32];
						account.copy_from_slice(&entry[..32]);
						let mut head = [0u8; 32];
						head.copy_from_slice(&entry[32..]);
						frontiers.push((Account(account), BlockHash(head)));
					}
					Ok(Message::AscPullAck {
						id,
						payload: AscPullAckPayload::Frontiers(frontiers),
					})
				},
				other => bail!("unknown asc_pull_ack type {other}"),
			}
		},
		MessageType::Invalid | MessageType::NotAType => {
			bail!("unexpected message type {:?}", header.message_type)
		},
	}
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
	writer.write_all(&message.serialize()).await?;
	Ok(())
}
