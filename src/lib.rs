// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pooled, chunk-backed fixed-size object allocator with per-pool accounting.
//!
//! # Design
//!
//! `mempools` sits on top of the system allocator and services many independent pools, each
//! dedicated to objects of a single fixed size. The chunk design is in the lineage of the slab
//! allocator originally introduced in the SunOS 5.4 kernel and described in depth in [The Slab
//! Allocator: An Object-Caching Kernel Memory Allocator][1], adapted for a long-running user-land
//! server rather than a kernel.
//!
//! Each pool owns a set of *chunks* - contiguous slabs holding a fixed number of object-sized
//! slots - plus a pool-level cache of recently-freed slots. Allocation pops the cache when it can;
//! otherwise it takes a slot from the most-loaded chunk that still has room, so that live objects
//! concentrate in few chunks and the rest drain toward empty. Free is O(1): the slot is pushed
//! onto the pool cache without looking up its home chunk. A periodic [`MemPools::clean`] pass
//! reconciles the cache back into the chunks, re-sorts the chunks so nearly-full ones are
//! preferred by subsequent allocations, and releases fully-idle chunks back to the system subject
//! to the registry's idle-memory budget and an age threshold.
//!
//! This buys three things over going straight to the general-purpose allocator:
//!
//! * Fragmentation stays bounded: same-sized objects pack densely into chunks, and whole chunks
//!   are returned to the system once idle.
//! * The hot paths are cheap: a cache hit is a pointer pop, and free never searches.
//! * Every pool carries meters (current/peak/total, in bytes) and call counters, so per-pool
//!   memory consumption is always inspectable via [`Pool::get_stats`] and
//!   [`MemPools::global_stats`].
//!
//! The allocator is single-threaded by contract. No operation blocks or synchronizes; callers
//! that share pools across threads must provide their own mutual exclusion.
//!
//! [1]: http://www.usenix.org/publications/library/proceedings/bos94/full_papers/bonwick.ps
//!
//! # Example
//!
//! ```
//! use mempools::MemPools;
//!
//! let pools = MemPools::instance();
//! let pool = pools.create("example", 40).unwrap();
//! unsafe {
//!     let obj = pool.alloc().unwrap();
//!     pool.free(obj);
//! }
//! ```

#[macro_use]
extern crate log;

mod chunk;
mod chunked;
mod meter;
mod pool;
mod proxy;
mod registry;
mod simple;
mod stats;

pub use meter::{CallVolume, Meter, PoolMeter};
pub use pool::Pool;
pub use proxy::PoolProxy;
pub use registry::{CreateError, MemPools, PoolIter};
pub use stats::{GlobalStats, PoolStats};

use std::cmp;
use std::mem;

/// The page size assumed when rounding chunk byte sizes.
pub const PAGE_SIZE: usize = 4096;

/// The default byte size of a freshly-created pool's chunks.
pub const DEFAULT_CHUNK_SIZE: usize = PAGE_SIZE * 4;

/// The largest byte size a chunk may have; object sizes beyond this are rejected outright.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// The smallest number of slots a chunk will be given.
pub const MIN_SLOTS_PER_CHUNK: usize = 32;

/// The largest number of slots a chunk will be given. Slot indices within a chunk historically
/// fit a u16, and keeping the ceiling preserves that property.
pub const MAX_SLOTS_PER_CHUNK: usize = 65_535;

/// Objects larger than this get a malloc-backed pool even when chunking is the default; a chunk
/// must hold at least [`MIN_SLOTS_PER_CHUNK`] slots without exceeding [`MAX_CHUNK_SIZE`] bytes.
pub const MAX_CHUNKED_OBJECT_SIZE: usize = MAX_CHUNK_SIZE / MIN_SLOTS_PER_CHUNK;

/// The default idle-memory budget (2 GiB), large enough to behave as "unlimited".
pub const DEFAULT_IDLE_LIMIT: usize = 2 * 1024 * 1024 * 1024;

/// Rounds a requested object size up to the pool's slot size.
///
/// Slots must be able to hold an embedded free-list link in place, so the result is a multiple of
/// the pointer size and never smaller than one pointer.
pub fn rounded_size(min_size: usize) -> usize {
    let word = mem::size_of::<*mut u8>();
    cmp::max(word, (min_size + word - 1) / word * word)
}

#[cfg(test)]
mod size_tests {
    use super::*;

    #[test]
    fn rounding_is_pointer_granular() {
        let word = mem::size_of::<*mut u8>();
        assert_eq!(rounded_size(1), word);
        assert_eq!(rounded_size(word), word);
        assert_eq!(rounded_size(word + 1), 2 * word);
        for req in 1..512 {
            let rounded = rounded_size(req);
            assert!(rounded >= req);
            assert!(rounded >= word);
            assert_eq!(rounded % word, 0);
        }
    }

    #[test]
    fn rounding_matches_known_sizes() {
        // 17 bytes lands on the third pointer-sized step of a 64-bit build.
        if mem::size_of::<*mut u8>() == 8 {
            assert_eq!(rounded_size(17), 24);
        }
    }
}
