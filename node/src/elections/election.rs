//! A single per-root voting session.

use std::{
	collections::HashMap,
	sync::Mutex,
	time::Instant,
};

use crate::{
	block::Block,
	constants::ELECTION_MAX_BLOCKS,
	primitives::{Account, Amount, BlockHash, Root},
	vote::VoteCode,
};

/// How an election entered the active set. Determines its survival under
/// pressure: optimistic elections are shed first, then hinted, then
/// priority.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElectionBehavior {
	/// Started by the block processor for freshly arrived blocks.
	Priority,
	/// Started because the vote cache accumulated substantial final weight.
	Hinted,
	/// Started speculatively by a scheduler.
	Optimistic,
}

impl ElectionBehavior {
	pub fn as_str(&self) -> &'static str {
		match self {
			ElectionBehavior::Priority => "priority",
			ElectionBehavior::Hinted => "hinted",
			ElectionBehavior::Optimistic => "optimistic",
		}
	}

	/// Eviction order: lower survives less.
	pub(crate) fn retention_rank(&self) -> u8 {
		match self {
			ElectionBehavior::Optimistic => 0,
			ElectionBehavior::Hinted => 1,
			ElectionBehavior::Priority => 2,
		}
	}
}

/// Latest vote recorded from one representative. Finality dominates because
/// the final sentinel is the maximum timestamp.
#[derive(Clone, Copy, Debug)]
pub struct VoteInfo {
	pub timestamp: u64,
	pub hash: BlockHash,
}

#[derive(Clone, Debug, Default)]
pub struct ElectionStatus {
	pub winner: Option<BlockHash>,
	pub tally: Amount,
	pub final_tally: Amount,
	pub confirmation_request_count: u32,
	pub block_count: usize,
	pub voter_count: usize,
}

struct ElectionData {
	blocks: HashMap<BlockHash, Block>,
	last_votes: HashMap<Account, VoteInfo>,
	confirmed: bool,
	status: ElectionStatus,
}

pub struct Election {
	pub root: Root,
	pub behavior: ElectionBehavior,
	pub started: Instant,
	data: Mutex<ElectionData>,
}

impl Election {
	pub fn new(root: Root, block: Block, behavior: ElectionBehavior) -> Self {
		let hash = block.hash();
		let mut blocks = HashMap::new();
		blocks.insert(hash, block);
		Election {
			root,
			behavior,
			started: Instant::now(),
			data: Mutex::new(ElectionData {
				blocks,
				last_votes: HashMap::new(),
				confirmed: false,
				status: ElectionStatus { winner: Some(hash), ..Default::default() },
			}),
		}
	}

	pub fn contains(&self, hash: &BlockHash) -> bool {
		self.data.lock().expect("election poisoned").blocks.contains_key(hash)
	}

	pub fn blocks(&self) -> Vec<Block> {
		self.data.lock().expect("election poisoned").blocks.values().cloned().collect()
	}

	pub fn confirmed(&self) -> bool {
		self.data.lock().expect("election poisoned").confirmed
	}

	pub fn status(&self) -> ElectionStatus {
		self.data.lock().expect("election poisoned").status.clone()
	}

	/// The current leader by tally, falling back to the first candidate.
	pub fn winner(&self) -> Option<Block> {
		let data = self.data.lock().expect("election poisoned");
		data.status.winner.and_then(|hash| data.blocks.get(&hash).cloned())
	}

	pub fn increment_confirmation_requests(&self) {
		self.data.lock().expect("election poisoned").status.confirmation_request_count += 1;
	}

	/// Admit a competing candidate. Beyond the slot bound the weakest
	/// existing candidate is displaced, and only by an incomer with
	/// strictly more supporting weight.
	pub fn insert_candidate(
		&self,
		block: Block,
		incoming_weight: Amount,
		weight_of: &dyn Fn(&Account) -> Amount,
	) -> bool {
		let hash = block.hash();
		let mut data = self.data.lock().expect("election poisoned");
		if data.confirmed {
			return false
		}
		if data.blocks.contains_key(&hash) {
			return false
		}
		if data.blocks.len() < ELECTION_MAX_BLOCKS {
			data.blocks.insert(hash, block);
			return true
		}

		let tallies = Self::tally_locked(&data, weight_of);
		let weakest = data
			.blocks
			.keys()
			.map(|candidate| {
				(*candidate, tallies.get(candidate).copied().unwrap_or(Amount::ZERO))
			})
			.min_by_key(|(_, tally)| *tally);
		match weakest {
			Some((weakest_hash, weakest_tally)) if incoming_weight > weakest_tally => {
				data.blocks.remove(&weakest_hash);
				data.blocks.insert(hash, block);
				true
			},
			_ => false,
		}
	}

	/// Record a vote for `hash` at this root.
	pub fn vote(
		&self,
		voter: &Account,
		timestamp: u64,
		hash: BlockHash,
		weight_of: &dyn Fn(&Account) -> Amount,
	) -> VoteCode {
		let mut data = self.data.lock().expect("election poisoned");
		if !data.blocks.contains_key(&hash) {
			return VoteCode::Indeterminate
		}
		match data.last_votes.get(voter) {
			Some(last) if last.timestamp > timestamp => return VoteCode::Replay,
			Some(last) if last.timestamp == timestamp && last.hash == hash =>
				return VoteCode::Replay,
			_ => {},
		}
		if data.confirmed {
			return VoteCode::Replay
		}
		data.last_votes.insert(*voter, VoteInfo { timestamp, hash });
		Self::update_status_locked(&mut data, weight_of);
		VoteCode::Vote
	}

	/// Per-candidate stake totals over each representative's latest vote.
	pub fn tally(&self, weight_of: &dyn Fn(&Account) -> Amount) -> HashMap<BlockHash, Amount> {
		Self::tally_locked(&self.data.lock().expect("election poisoned"), weight_of)
	}

	fn tally_locked(
		data: &ElectionData,
		weight_of: &dyn Fn(&Account) -> Amount,
	) -> HashMap<BlockHash, Amount> {
		let mut tallies: HashMap<BlockHash, Amount> = HashMap::new();
		for (voter, info) in &data.last_votes {
			let entry = tallies.entry(info.hash).or_insert(Amount::ZERO);
			*entry = entry.saturating_add(weight_of(voter));
		}
		tallies
	}

	fn final_tally_locked(
		data: &ElectionData,
		hash: &BlockHash,
		weight_of: &dyn Fn(&Account) -> Amount,
	) -> Amount {
		data.last_votes
			.iter()
			.filter(|(_, info)| {
				info.hash == *hash && info.timestamp == crate::constants::VOTE_TIMESTAMP_FINAL
			})
			.fold(Amount::ZERO, |sum, (voter, _)| sum.saturating_add(weight_of(voter)))
	}

	fn update_status_locked(data: &mut ElectionData, weight_of: &dyn Fn(&Account) -> Amount) {
		let tallies = Self::tally_locked(data, weight_of);
		let leader = tallies
			.iter()
			.filter(|(hash, _)| data.blocks.contains_key(hash))
			.max_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
		if let Some((hash, tally)) = leader {
			data.status.winner = Some(*hash);
			data.status.tally = *tally;
			data.status.final_tally = Self::final_tally_locked(data, hash, weight_of);
		}
		data.status.block_count = data.blocks.len();
		data.status.voter_count = data.last_votes.len();
	}

	/// Confirm once a candidate's final-vote tally reaches `quorum`.
	/// Returns the winning block exactly once; the election refuses further
	/// state changes afterwards.
	pub fn try_confirm(
		&self,
		quorum: Amount,
		weight_of: &dyn Fn(&Account) -> Amount,
	) -> Option<Block> {
		let mut data = self.data.lock().expect("election poisoned");
		if data.confirmed {
			return None
		}
		let candidates: Vec<BlockHash> = data.blocks.keys().copied().collect();
		for hash in candidates {
			let final_tally = Self::final_tally_locked(&data, &hash, weight_of);
			if final_tally >= quorum && final_tally > Amount::ZERO {
				data.confirmed = true;
				data.status.winner = Some(hash);
				data.status.final_tally = final_tally;
				return data.blocks.get(&hash).cloned()
			}
		}
		None
	}
}
