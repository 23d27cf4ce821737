//! Block variants of the lattice and their canonical encodings.
//!
//! Every account maintains its own chain of blocks; transfers are a pair of
//! a send on the sender's chain and a receive (or open) on the destination's
//! chain. Blocks are content-addressed: the hash covers every field except
//! the signature and work nonce, so signatures and proof-of-work can be
//! attached after the fact without changing identity.

use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::primitives::{Account, Amount, BlockHash, KeyPair, Link, Root, Signature};

/// Wire tag for a block body. `NotABlock` terminates bulk pull/push streams.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
	Invalid = 0,
	NotABlock = 1,
	Send = 2,
	Receive = 3,
	Open = 4,
	Change = 5,
	State = 6,
}

impl BlockType {
	pub fn from_u8(value: u8) -> Option<Self> {
		match value {
			0 => Some(BlockType::Invalid),
			1 => Some(BlockType::NotABlock),
			2 => Some(BlockType::Send),
			3 => Some(BlockType::Receive),
			4 => Some(BlockType::Open),
			5 => Some(BlockType::Change),
			6 => Some(BlockType::State),
			_ => None,
		}
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SendBlock {
	pub previous: BlockHash,
	pub destination: Account,
	/// Sender's balance *after* this send; the sent amount is the delta
	/// against the previous block's balance.
	pub balance: Amount,
	pub signature: Signature,
	pub work: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReceiveBlock {
	pub previous: BlockHash,
	pub source: BlockHash,
	pub signature: Signature,
	pub work: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct OpenBlock {
	pub source: BlockHash,
	pub representative: Account,
	pub account: Account,
	pub signature: Signature,
	pub work: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChangeBlock {
	pub previous: BlockHash,
	pub representative: Account,
	pub signature: Signature,
	pub work: u64,
}

/// Unified block form: carries the full account state after the operation.
/// The sign of the balance delta decides how `link` is interpreted.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StateBlock {
	pub account: Account,
	pub previous: BlockHash,
	pub representative: Account,
	pub balance: Amount,
	pub link: Link,
	pub signature: Signature,
	pub work: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Block {
	Send(SendBlock),
	Receive(ReceiveBlock),
	Open(OpenBlock),
	Change(ChangeBlock),
	State(StateBlock),
}

/// State block hashes are domain-separated from legacy hashes by a 32-byte
/// preamble whose last byte is the state tag.
fn state_preamble() -> [u8; 32] {
	let mut preamble = [0u8; 32];
	preamble[31] = BlockType::State as u8;
	preamble
}

fn blake2b(parts: &[&[u8]]) -> BlockHash {
	let mut hasher = Blake2b::<typenum::U32>::new();
	for part in parts {
		hasher.update(part);
	}
	BlockHash(hasher.finalize().into())
}

impl SendBlock {
	pub fn new(
		previous: BlockHash,
		destination: Account,
		balance: Amount,
		key: &KeyPair,
		work: u64,
	) -> Self {
		let mut block =
			SendBlock { previous, destination, balance, signature: Signature::ZERO, work };
		block.signature = key.sign(block.hash().as_bytes());
		block
	}

	pub fn hash(&self) -> BlockHash {
		blake2b(&[
			self.previous.as_bytes(),
			self.destination.as_bytes(),
			&self.balance.to_be_bytes(),
		])
	}
}

impl ReceiveBlock {
	pub fn new(previous: BlockHash, source: BlockHash, key: &KeyPair, work: u64) -> Self {
		let mut block = ReceiveBlock { previous, source, signature: Signature::ZERO, work };
		block.signature = key.sign(block.hash().as_bytes());
		block
	}

	pub fn hash(&self) -> BlockHash {
		blake2b(&[self.previous.as_bytes(), self.source.as_bytes()])
	}
}

impl OpenBlock {
	pub fn new(source: BlockHash, representative: Account, key: &KeyPair, work: u64) -> Self {
		let mut block = OpenBlock {
			source,
			representative,
			account: key.account(),
			signature: Signature::ZERO,
			work,
		};
		block.signature = key.sign(block.hash().as_bytes());
		block
	}

	pub fn hash(&self) -> BlockHash {
		blake2b(&[
			self.source.as_bytes(),
			self.representative.as_bytes(),
			self.account.as_bytes(),
		])
	}
}

impl ChangeBlock {
	pub fn new(previous: BlockHash, representative: Account, key: &KeyPair, work: u64) -> Self {
		let mut block = ChangeBlock { previous, representative, signature: Signature::ZERO, work };
		block.signature = key.sign(block.hash().as_bytes());
		block
	}

	pub fn hash(&self) -> BlockHash {
		blake2b(&[self.previous.as_bytes(), self.representative.as_bytes()])
	}
}

impl StateBlock {
	pub fn new(
		account: Account,
		previous: BlockHash,
		representative: Account,
		balance: Amount,
		link: Link,
		key: &KeyPair,
		work: u64,
	) -> Self {
		let mut block = StateBlock {
			account,
			previous,
			representative,
			balance,
			link,
			signature: Signature::ZERO,
			work,
		};
		block.signature = key.sign(block.hash().as_bytes());
		block
	}

	pub fn hash(&self) -> BlockHash {
		blake2b(&[
			&state_preamble(),
			self.account.as_bytes(),
			self.previous.as_bytes(),
			self.representative.as_bytes(),
			&self.balance.to_be_bytes(),
			self.link.as_bytes(),
		])
	}
}

impl Block {
	pub fn block_type(&self) -> BlockType {
		match self {
			Block::Send(_) => BlockType::Send,
			Block::Receive(_) => BlockType::Receive,
			Block::Open(_) => BlockType::Open,
			Block::Change(_) => BlockType::Change,
			Block::State(_) => BlockType::State,
		}
	}

	pub fn hash(&self) -> BlockHash {
		match self {
			Block::Send(b) => b.hash(),
			Block::Receive(b) => b.hash(),
			Block::Open(b) => b.hash(),
			Block::Change(b) => b.hash(),
			Block::State(b) => b.hash(),
		}
	}

	/// Hash of the prior block on the same chain; zero for a chain-opening
	/// block (open, or state with zero previous).
	pub fn previous(&self) -> BlockHash {
		match self {
			Block::Send(b) => b.previous,
			Block::Receive(b) => b.previous,
			Block::Open(_) => BlockHash::ZERO,
			Block::Change(b) => b.previous,
			Block::State(b) => b.previous,
		}
	}

	/// The election key for this block.
	pub fn root(&self) -> Root {
		match self {
			Block::Open(b) => b.account.into(),
			Block::State(b) if b.previous.is_zero() => b.account.into(),
			_ => self.previous().into(),
		}
	}

	pub fn is_open(&self) -> bool {
		self.previous().is_zero()
	}

	/// The account that signed this block, when the block itself carries it.
	/// Legacy send/receive/change blocks do not; the ledger resolves their
	/// account through the frontier index.
	pub fn account_field(&self) -> Option<Account> {
		match self {
			Block::Open(b) => Some(b.account),
			Block::State(b) => Some(b.account),
			_ => None,
		}
	}

	pub fn representative_field(&self) -> Option<Account> {
		match self {
			Block::Open(b) => Some(b.representative),
			Block::Change(b) => Some(b.representative),
			Block::State(b) => Some(b.representative),
			_ => None,
		}
	}

	pub fn balance_field(&self) -> Option<Amount> {
		match self {
			Block::Send(b) => Some(b.balance),
			Block::State(b) => Some(b.balance),
			_ => None,
		}
	}

	/// Source block hash for blocks that consume a pending entry.
	pub fn source_field(&self) -> Option<BlockHash> {
		match self {
			Block::Receive(b) => Some(b.source),
			Block::Open(b) => Some(b.source),
			_ => None,
		}
	}

	pub fn link_field(&self) -> Option<Link> {
		match self {
			Block::State(b) => Some(b.link),
			_ => None,
		}
	}

	pub fn destination_field(&self) -> Option<Account> {
		match self {
			Block::Send(b) => Some(b.destination),
			_ => None,
		}
	}

	pub fn work(&self) -> u64 {
		match self {
			Block::Send(b) => b.work,
			Block::Receive(b) => b.work,
			Block::Open(b) => b.work,
			Block::Change(b) => b.work,
			Block::State(b) => b.work,
		}
	}

	pub fn signature(&self) -> &Signature {
		match self {
			Block::Send(b) => &b.signature,
			Block::Receive(b) => &b.signature,
			Block::Open(b) => &b.signature,
			Block::Change(b) => &b.signature,
			Block::State(b) => &b.signature,
		}
	}

	/// Check the signature under `signer`. The signed message is the block
	/// hash itself.
	pub fn verify_signature(&self, signer: &Account) -> bool {
		signer.verify(self.hash().as_bytes(), self.signature())
	}

	/// Canonical wire encoding: fields in declared order, fixed widths,
	/// big-endian integers, signature then work appended last.
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		match self {
			Block::Send(b) => {
				buffer.extend_from_slice(b.previous.as_bytes());
				buffer.extend_from_slice(b.destination.as_bytes());
				buffer.extend_from_slice(&b.balance.to_be_bytes());
				buffer.extend_from_slice(b.signature.as_bytes());
				buffer.extend_from_slice(&b.work.to_be_bytes());
			},
			Block::Receive(b) => {
				buffer.extend_from_slice(b.previous.as_bytes());
				buffer.extend_from_slice(b.source.as_bytes());
				buffer.extend_from_slice(b.signature.as_bytes());
				buffer.extend_from_slice(&b.work.to_be_bytes());
			},
			Block::Open(b) => {
				buffer.extend_from_slice(b.source.as_bytes());
				buffer.extend_from_slice(b.representative.as_bytes());
				buffer.extend_from_slice(b.account.as_bytes());
				buffer.extend_from_slice(b.signature.as_bytes());
				buffer.extend_from_slice(&b.work.to_be_bytes());
			},
			Block::Change(b) => {
				buffer.extend_from_slice(b.previous.as_bytes());
				buffer.extend_from_slice(b.representative.as_bytes());
				buffer.extend_from_slice(b.signature.as_bytes());
				buffer.extend_from_slice(&b.work.to_be_bytes());
			},
			Block::State(b) => {
				buffer.extend_from_slice(b.account.as_bytes());
				buffer.extend_from_slice(b.previous.as_bytes());
				buffer.extend_from_slice(b.representative.as_bytes());
				buffer.extend_from_slice(&b.balance.to_be_bytes());
				buffer.extend_from_slice(b.link.as_bytes());
				buffer.extend_from_slice(b.signature.as_bytes());
				buffer.extend_from_slice(&b.work.to_be_bytes());
			},
		}
	}

	/// Serialized body length for a block type, used to frame reads.
	pub fn serialized_size(block_type: BlockType) -> Option<usize> {
		match block_type {
			BlockType::Send => Some(32 + 32 + 16 + 64 + 8),
			BlockType::Receive => Some(32 + 32 + 64 + 8),
			BlockType::Open => Some(32 + 32 + 32 + 64 + 8),
			BlockType::Change => Some(32 + 32 + 64 + 8),
			BlockType::State => Some(32 + 32 + 32 + 16 + 32 + 64 + 8),
			BlockType::Invalid | BlockType::NotABlock => None,
		}
	}

	pub fn deserialize(block_type: BlockType, bytes: &[u8]) -> Option<Block> {
		if Self::serialized_size(block_type)? != bytes.len() {
			return None
		}

		let mut offset = 0usize;
		match block_type {
			BlockType::Send => {
				let previous = BlockHash(take32(bytes, &mut offset));
				let destination = Account(take32(bytes, &mut offset));
				let balance = Amount::from_be_bytes(take16(bytes, &mut offset));
				let (signature, work) = read_suffix(bytes, offset);
				Some(Block::Send(SendBlock { previous, destination, balance, signature, work }))
			},
			BlockType::Receive => {
				let previous = BlockHash(take32(bytes, &mut offset));
				let source = BlockHash(take32(bytes, &mut offset));
				let (signature, work) = read_suffix(bytes, offset);
				Some(Block::Receive(ReceiveBlock { previous, source, signature, work }))
			},
			BlockType::Open => {
				let source = BlockHash(take32(bytes, &mut offset));
				let representative = Account(take32(bytes, &mut offset));
				let account = Account(take32(bytes, &mut offset));
				let (signature, work) = read_suffix(bytes, offset);
				Some(Block::Open(OpenBlock { source, representative, account, signature, work }))
			},
			BlockType::Change => {
				let previous = BlockHash(take32(bytes, &mut offset));
				let representative = Account(take32(bytes, &mut offset));
				let (signature, work) = read_suffix(bytes, offset);
				Some(Block::Change(ChangeBlock { previous, representative, signature, work }))
			},
			BlockType::State => {
				let account = Account(take32(bytes, &mut offset));
				let previous = BlockHash(take32(bytes, &mut offset));
				let representative = Account(take32(bytes, &mut offset));
				let balance = Amount::from_be_bytes(take16(bytes, &mut offset));
				let link = Link(take32(bytes, &mut offset));
				let (signature, work) = read_suffix(bytes, offset);
				Some(Block::State(StateBlock {
					account,
					previous,
					representative,
					balance,
					link,
					signature,
					work,
				}))
			},
			BlockType::Invalid | BlockType::NotABlock => None,
		}
	}
}

fn take32(bytes: &[u8], offset: &mut usize) -> [u8; 32] {
	let mut out = [0u8; 32];
	out.copy_from_slice(&bytes[*offset..*offset + 32]);
	*offset += 32;
	out
}

fn take16(bytes: &[u8], offset: &mut usize) -> [u8; 16] {
	let mut out = [0u8; 16];
	out.copy_from_slice(&bytes[*offset..*offset + 16]);
	*offset += 16;
	out
}

fn read_suffix(bytes: &[u8], offset: usize) -> (Signature, u64) {
	let mut signature = [0u8; 64];
	signature.copy_from_slice(&bytes[offset..offset + 64]);
	let mut work = [0u8; 8];
	work.copy_from_slice(&bytes[offset + 64..offset + 72]);
	(Signature(signature), u64::from_be_bytes(work))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_send() -> (KeyPair, SendBlock) {
		let key = KeyPair::from_secret_bytes([1u8; 32]);
		let block = SendBlock::new(
			BlockHash([2u8; 32]),
			Account([3u8; 32]),
			Amount::new(1000),
			&key,
			12345,
		);
		(key, block)
	}

	#[test]
	fn hash_is_deterministic_and_excludes_signature_and_work() {
		let (_, block) = test_send();
		let mut other = block.clone();
		other.signature = Signature([0xFF; 64]);
		other.work = 99;
		assert_eq!(block.hash(), other.hash());

		let mut changed = block.clone();
		changed.balance = Amount::new(999);
		assert_ne!(block.hash(), changed.hash());
	}

	#[test]
	fn state_hash_is_domain_separated_from_legacy() {
		// A change block and a state block over overlapping bytes must never
		// collide because of the preamble.
		let key = KeyPair::from_secret_bytes([1u8; 32]);
		let change = ChangeBlock::new(BlockHash([2u8; 32]), Account([3u8; 32]), &key, 0);
		let state = StateBlock::new(
			key.account(),
			BlockHash([2u8; 32]),
			Account([3u8; 32]),
			Amount::ZERO,
			Link::ZERO,
			&key,
			0,
		);
		assert_ne!(change.hash(), state.hash());
	}

	#[test]
	fn signature_covers_hash() {
		let (key, block) = test_send();
		let block = Block::Send(block);
		assert!(block.verify_signature(&key.account()));
		assert!(!block.verify_signature(&KeyPair::generate().account()));
	}

	#[test]
	fn root_selection() {
		let key = KeyPair::from_secret_bytes([1u8; 32]);
		let open = Block::Open(OpenBlock::new(BlockHash([9u8; 32]), key.account(), &key, 0));
		assert_eq!(open.root(), key.account().into());

		let (_, send) = test_send();
		let send = Block::Send(send);
		assert_eq!(send.root(), send.previous().into());

		let state_open = Block::State(StateBlock::new(
			key.account(),
			BlockHash::ZERO,
			key.account(),
			Amount::new(1),
			Link([9u8; 32]),
			&key,
			0,
		));
		assert_eq!(state_open.root(), key.account().into());
	}

	#[test]
	fn wire_round_trip_all_variants() {
		let key = KeyPair::from_secret_bytes([4u8; 32]);
		let blocks = vec![
			Block::Send(SendBlock::new(
				BlockHash([1u8; 32]),
				Account([2u8; 32]),
				Amount::new(7),
				&key,
				1,
			)),
			Block::Receive(ReceiveBlock::new(BlockHash([1u8; 32]), BlockHash([2u8; 32]), &key, 2)),
			Block::Open(OpenBlock::new(BlockHash([1u8; 32]), Account([2u8; 32]), &key, 3)),
			Block::Change(ChangeBlock::new(BlockHash([1u8; 32]), Account([2u8; 32]), &key, 4)),
			Block::State(StateBlock::new(
				key.account(),
				BlockHash([1u8; 32]),
				Account([2u8; 32]),
				Amount::new(8),
				Link([3u8; 32]),
				&key,
				5,
			)),
		];

		for block in blocks {
			let mut buffer = Vec::new();
			block.serialize(&mut buffer);
			assert_eq!(buffer.len(), Block::serialized_size(block.block_type()).unwrap());
			let decoded = Block::deserialize(block.block_type(), &buffer).unwrap();
			assert_eq!(decoded, block);
			assert_eq!(decoded.hash(), block.hash());
		}
	}
}
