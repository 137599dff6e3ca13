//! Store metrics.

use metriken::{Counter, metric};

/// Objects committed to disk.
#[metric(name = "store_swap_outs")]
pub static SWAP_OUTS: Counter = Counter::new();

/// Swap-out attempts that failed or rolled back.
#[metric(name = "store_swap_out_fails")]
pub static SWAP_OUT_FAILS: Counter = Counter::new();

/// Objects read back from disk.
#[metric(name = "store_swap_ins")]
pub static SWAP_INS: Counter = Counter::new();

/// Disk read-backs that failed.
#[metric(name = "store_swap_in_fails")]
pub static SWAP_IN_FAILS: Counter = Counter::new();

/// Memory tier hits.
#[metric(name = "store_mem_hits")]
pub static MEM_HITS: Counter = Counter::new();

/// Memory tier misses.
#[metric(name = "store_mem_misses")]
pub static MEM_MISSES: Counter = Counter::new();

/// Objects copied into the memory tier.
#[metric(name = "store_mem_keeps")]
pub static MEM_KEEPS: Counter = Counter::new();
