//! Prometheus counters shared across the node's subsystems. Registered on
//! the default registry; the bin decides whether to expose them.

use lazy_static::lazy_static;
use prometheus::{
	register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
	IntCounterVec, IntGauge,
};

lazy_static! {
	pub static ref BLOCKS_PROCESSED: IntCounterVec = register_int_counter_vec!(
		"basalt_blocks_processed_total",
		"Blocks handled by the block processor, by ledger result",
		&["result"]
	)
	.unwrap();
	pub static ref BLOCKS_CEMENTED: IntCounter = register_int_counter!(
		"basalt_blocks_cemented_total",
		"Blocks durably confirmed by the confirming set"
	)
	.unwrap();
	pub static ref ROLLBACK_FAILED: IntCounter = register_int_counter!(
		"basalt_rollback_failed_total",
		"Rollbacks refused because the target was already cemented"
	)
	.unwrap();
	pub static ref VOTES_PROCESSED: IntCounterVec = register_int_counter_vec!(
		"basalt_votes_processed_total",
		"Votes routed, by resulting code",
		&["code"]
	)
	.unwrap();
	pub static ref VOTE_CACHE_EVICTIONS: IntCounter = register_int_counter!(
		"basalt_vote_cache_evictions_total",
		"Vote cache buckets evicted under the size budget"
	)
	.unwrap();
	pub static ref ELECTIONS_STARTED: IntCounterVec = register_int_counter_vec!(
		"basalt_elections_started_total",
		"Elections started, by admission path",
		&["behavior"]
	)
	.unwrap();
	pub static ref ELECTIONS_CONFIRMED: IntCounter = register_int_counter!(
		"basalt_elections_confirmed_total",
		"Elections that reached quorum"
	)
	.unwrap();
	pub static ref ELECTIONS_DROPPED: IntCounter = register_int_counter!(
		"basalt_elections_dropped_total",
		"Elections dropped unconfirmed under pressure or age"
	)
	.unwrap();
	pub static ref ACTIVE_ELECTIONS: IntGauge = register_int_gauge!(
		"basalt_active_elections",
		"Currently live elections"
	)
	.unwrap();
	pub static ref CONFIRM_REQS_SENT: IntCounter = register_int_counter!(
		"basalt_confirm_reqs_sent_total",
		"Confirmation requests broadcast by the election scheduler"
	)
	.unwrap();
	pub static ref DUPLICATE_FILTER_HITS: IntCounter = register_int_counter!(
		"basalt_duplicate_filter_hits_total",
		"Blocks dropped by the network duplicate filter"
	)
	.unwrap();
	pub static ref QUEUE_DROPS: IntCounterVec = register_int_counter_vec!(
		"basalt_processor_queue_drops_total",
		"Blocks dropped because the processor queue was full",
		&["source"]
	)
	.unwrap();
	pub static ref UNCHECKED_DROPS: IntCounter = register_int_counter!(
		"basalt_unchecked_drops_total",
		"Gap blocks discarded because the unchecked store was full or stale"
	)
	.unwrap();
	pub static ref BOOTSTRAP_PULLS: IntCounter = register_int_counter!(
		"basalt_bootstrap_pulls_total",
		"Bulk pulls issued across all attempts"
	)
	.unwrap();
	pub static ref BOOTSTRAP_PULL_RETRIES: IntCounter = register_int_counter!(
		"basalt_bootstrap_pull_retries_total",
		"Pulls requeued after a failed or short response"
	)
	.unwrap();
	pub static ref BOOTSTRAP_BLOCKS_RECEIVED: IntCounter = register_int_counter!(
		"basalt_bootstrap_blocks_received_total",
		"Blocks received over bulk pull"
	)
	.unwrap();
	pub static ref BOOTSTRAP_CONNECTIONS_DROPPED: IntCounterVec = register_int_counter_vec!(
		"basalt_bootstrap_connections_dropped_total",
		"Bootstrap connections closed early, by reason",
		&["reason"]
	)
	.unwrap();
}
