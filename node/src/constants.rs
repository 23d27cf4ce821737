use std::time::Duration;

use crate::{
	block::{Block, OpenBlock},
	primitives::{Account, Amount, BlockHash, KeyPair, Link},
};

// ======= Ledger =======

/// Total supply, fixed at genesis. Every unit not held by an account sits in
/// a pending entry; the two always sum back to this.
pub const GENESIS_AMOUNT: Amount = Amount(u128::MAX);

/// The burn address. Can never be opened; value sent here is unspendable.
pub const BURN_ACCOUNT: Account = Account([0u8; 32]);

/// A sparse balance index entry is written once per this many blocks on an
/// account chain, bounding balance lookups on deep chains.
pub const BLOCK_INFO_MAX: u64 = 128;

/// Upgrade marker recognised in a state block's link field.
pub fn epoch_1_link() -> Link {
	let mut link = [0u8; 32];
	link[..14].copy_from_slice(b"epoch v1 block");
	Link(link)
}

// ======= Elections =======

/// Candidate slots per election; further forks must out-weigh an existing
/// candidate to enter.
pub const ELECTION_MAX_BLOCKS: usize = 10;

/// Hashes carried by a single vote.
pub const VOTE_MAX_HASHES: usize = 12;

/// Fraction of online trended weight required for final-vote confirmation,
/// in percent.
pub const ONLINE_WEIGHT_QUORUM_PERCENT: u8 = 67;

/// Sentinel timestamp marking a vote as final.
pub const VOTE_TIMESTAMP_FINAL: u64 = u64::MAX;

// ======= Bootstrap =======

pub const BOOTSTRAP_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A pull client below this rate after warmup is cut loose.
pub const BOOTSTRAP_MINIMUM_BLOCKS_PER_SEC: f64 = 10.0;

/// The frontier stream is retried elsewhere if it trickles below this.
pub const BOOTSTRAP_MINIMUM_FRONTIER_BLOCKS_PER_SEC: f64 = 1000.0;

/// Grace period before rate-based eviction applies to a fresh connection.
pub const BOOTSTRAP_WARMUP_TIME: Duration = Duration::from_secs(5);

/// Rate-based eviction only starts once an attempt has run this long.
pub const BOOTSTRAP_MINIMUM_TERMINATION_TIME: Duration = Duration::from_secs(30);

/// A pull is retried this many times before being handed back to the
/// frontier peer as a last resort.
pub const BOOTSTRAP_FRONTIER_RETRY_LIMIT: u32 = 16;

/// New connections opened per `populate_connections` round are capped here.
pub const BOOTSTRAP_MAX_NEW_CONNECTIONS: usize = 10;

/// Cadence of the connection-pool maintenance loop.
pub const BOOTSTRAP_POPULATE_INTERVAL: Duration = Duration::from_secs(1);

// ======= Work =======

/// Development-network threshold: roughly half of all nonces pass, so both
/// valid and invalid work are cheap to exhibit.
pub const WORK_THRESHOLD_DEV: u64 = 1 << 63;

// ======= Protocol =======

pub const PROTOCOL_VERSION: u8 = 20;
pub const PROTOCOL_VERSION_MIN: u8 = 18;

/// First byte of the network magic; the second identifies the network.
pub const NETWORK_MAGIC: u8 = b'R';
pub const NETWORK_ID_DEV: u8 = b'A';

// ======= Development genesis =======

/// Well-known development genesis key. Dev networks derive the genesis
/// block from it at startup; the result is identical on every node.
pub const DEV_GENESIS_SECRET: [u8; 32] = [
	0x34, 0xF0, 0xA3, 0x7A, 0xAD, 0x20, 0xF4, 0xA2, 0x60, 0xF0, 0xA5, 0xB3, 0xCB, 0x3D, 0x7F,
	0xB5, 0x06, 0x73, 0x21, 0x2A, 0x35, 0x1B, 0xFD, 0x93, 0xEE, 0x14, 0xF9, 0x2D, 0x5A, 0xA4,
	0x23, 0x80,
];

pub fn dev_genesis_key() -> KeyPair {
	KeyPair::from_secret_bytes(DEV_GENESIS_SECRET)
}

/// The genesis block: an open block whose source is the genesis account
/// itself, holding the entire supply.
pub fn dev_genesis_block() -> Block {
	let key = dev_genesis_key();
	let account = key.account();
	Block::Open(OpenBlock::new(BlockHash(account.0), account, &key, 0))
}
