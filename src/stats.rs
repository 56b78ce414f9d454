//! Snapshot structures filled by [`Pool::get_stats`] and [`MemPools::global_stats`].
//!
//! [`Pool::get_stats`]: crate::Pool::get_stats
//! [`MemPools::global_stats`]: crate::MemPools::global_stats

use crate::meter::PoolMeter;

/// A point-in-time view of one pool.
///
/// Chunk occupancy figures reflect what the chunks themselves know; between cleanup passes,
/// freed objects sit on the pool cache and chunks can appear more loaded than they are. The
/// `items_*` figures come from the meters and are always truthful.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub label: &'static str,
    pub meter: PoolMeter,
    /// Object size after rounding, in bytes.
    pub object_size: usize,
    /// Slots per chunk for chunks created from now on; zero for malloc-backed pools.
    pub chunk_capacity: usize,
    /// Byte size of chunks created from now on; zero for malloc-backed pools.
    pub chunk_size_bytes: usize,
    pub chunks_alloc: usize,
    pub chunks_in_use: usize,
    pub chunks_partial: usize,
    pub chunks_free: usize,
    pub items_alloc: usize,
    pub items_in_use: usize,
    pub items_idle: usize,
    /// Bookkeeping bytes the pool spends on itself rather than on objects.
    pub overhead_bytes: usize,
}

/// Totals across every pool in the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub meter: PoolMeter,
    /// Number of pools created.
    pub pools_alloc: usize,
    /// Number of pools with at least one object in use.
    pub pools_in_use: usize,
    pub chunks_alloc: usize,
    pub chunks_in_use: usize,
    pub chunks_partial: usize,
    pub chunks_free: usize,
    pub items_alloc: usize,
    pub items_in_use: usize,
    pub items_idle: usize,
    pub overhead_bytes: usize,
    /// The registry's idle-memory budget in bytes.
    pub idle_limit: usize,
}
