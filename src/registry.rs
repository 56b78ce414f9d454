// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pool registry.
//!
//! [`MemPools`] is the process-wide home of every pool: it creates them, keeps the list for
//! iteration and statistics, owns the idle-memory budget, and drives the periodic cleanup pass.
//! The singleton is lazily initialized behind a non-reentrant guard in a thread-local slot; under
//! the allocator's single-thread contract that is indistinguishable from ambient process state,
//! and it gives each test thread an isolated registry for free.
//!
//! The pool list is append-only for the life of the process. Pools must not be created while an
//! iteration obtained from [`MemPools::iterate`] is being consumed.

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::meter::PoolMeter;
use crate::pool::Pool;
use crate::stats::{GlobalStats, PoolStats};
use crate::{rounded_size, DEFAULT_IDLE_LIMIT, MAX_CHUNKED_OBJECT_SIZE, MAX_CHUNK_SIZE};

/// Why [`MemPools::create`] refused to make a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateError {
    /// The requested object size was zero.
    ZeroObjectSize,
    /// The requested object size exceeds the chunk byte maximum.
    ObjectTooLarge { requested: usize, max: usize },
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CreateError::ZeroObjectSize => write!(f, "pool object size must not be zero"),
            CreateError::ObjectTooLarge { requested, max } => {
                write!(f, "pool object size {} exceeds the maximum of {}", requested, max)
            }
        }
    }
}

impl Error for CreateError {}

struct RegistryInner {
    pools: Vec<Pool>,
    idle_limit: usize,
    default_chunked: bool,
    meter: PoolMeter,
}

impl RegistryInner {
    fn new() -> RegistryInner {
        RegistryInner {
            pools: Vec::new(),
            idle_limit: DEFAULT_IDLE_LIMIT,
            default_chunked: true,
            meter: PoolMeter::default(),
        }
    }
}

thread_local! {
    static INSTANCE: MemPools = MemPools {
        inner: Rc::new(RefCell::new(RegistryInner::new())),
    };
}

/// A handle on the pool registry.
#[derive(Clone)]
pub struct MemPools {
    inner: Rc<RefCell<RegistryInner>>,
}

impl MemPools {
    /// The lazily-initialized registry singleton.
    pub fn instance() -> MemPools {
        INSTANCE.with(|pools| pools.clone())
    }

    /// Creates a pool for objects of `object_size` bytes and links it into the registry.
    ///
    /// The size is rounded up to the slot size (see [`rounded_size`]); the pool is chunked when
    /// that is the registry default and the rounded size is within the chunking threshold,
    /// malloc-backed otherwise. Zero sizes and sizes beyond [`MAX_CHUNK_SIZE`] are refused
    /// before any allocation happens.
    ///
    /// [`rounded_size`]: crate::rounded_size
    /// [`MAX_CHUNK_SIZE`]: crate::MAX_CHUNK_SIZE
    pub fn create(&self, label: &'static str, object_size: usize) -> Result<Pool, CreateError> {
        let chunked = self.inner.borrow().default_chunked;
        self.create_pool(label, object_size, chunked)
    }

    /// Creates a malloc-backed pool regardless of the registry's chunking default.
    pub fn create_unchunked(&self, label: &'static str, object_size: usize) -> Result<Pool, CreateError> {
        self.create_pool(label, object_size, false)
    }

    fn create_pool(&self, label: &'static str, object_size: usize, chunked: bool) -> Result<Pool, CreateError> {
        if object_size == 0 {
            return Err(CreateError::ZeroObjectSize);
        }
        if object_size > MAX_CHUNK_SIZE {
            return Err(CreateError::ObjectTooLarge {
                requested: object_size,
                max: MAX_CHUNK_SIZE,
            });
        }
        let rounded = rounded_size(object_size);
        let pool = if chunked && rounded <= MAX_CHUNKED_OBJECT_SIZE {
            Pool::new_chunked(label, rounded)
        } else {
            Pool::new_malloc(label, rounded)
        };
        trace!("created pool '{}': {} byte objects, chunked: {}", label, rounded, pool.is_chunked());
        self.inner.borrow_mut().pools.push(pool.clone());
        Ok(pool)
    }

    /// Sets the upper limit in bytes on idle memory kept across all pools.
    ///
    /// This is a hint, not a hard cap: when total idle memory is over the limit, the next
    /// [`MemPools::clean`] releases every reconciled-empty chunk immediately instead of only
    /// those idle past the age threshold.
    pub fn set_idle_limit(&self, bytes: usize) {
        self.inner.borrow_mut().idle_limit = bytes;
    }

    pub fn idle_limit(&self) -> usize {
        self.inner.borrow().idle_limit
    }

    /// Chooses whether future [`MemPools::create`] calls produce chunked pools.
    pub fn set_default_pool_chunking(&self, chunked: bool) {
        self.inner.borrow_mut().default_chunked = chunked;
    }

    /// The registry-wide cleanup pass.
    ///
    /// Flushes meters, then walks the pools and reconciles each one worth visiting: chunks
    /// that have been fully idle for `max_age` or longer are returned to the system. When total
    /// idle memory exceeds the idle limit the pass escalates, treating `max_age` as zero. A pass
    /// with a zero `max_age` visits every pool; a periodic pass skips pools whose idle memory is
    /// too small to matter (see [`Pool::idle_trigger`]).
    ///
    /// Between calls, freed objects accumulate on pool caches and chunks may appear more loaded
    /// than they are; calling this every few tens of seconds to few minutes keeps the accounting
    /// close to the truth and fragmentation down.
    ///
    /// [`Pool::idle_trigger`]: crate::Pool::idle_trigger
    pub fn clean(&self, max_age: Duration) {
        self.flush_meters();
        let (pools, over_limit) = {
            let inner = self.inner.borrow();
            (inner.pools.clone(), inner.meter.idle.level() > inner.idle_limit)
        };
        let max_age = if over_limit { Duration::from_secs(0) } else { max_age };
        let aggressive = max_age == Duration::from_secs(0);
        let shift = if aggressive { 0 } else { 1 };
        debug!("cleaning {} pools (aggressive: {})", pools.len(), aggressive);
        for pool in &pools {
            if aggressive || pool.idle_trigger(shift) {
                pool.clean(max_age);
            }
        }
    }

    /// Recomputes the global meter as the sum of the per-pool meters, folding each pool's
    /// pending call counts into its cumulative histories first. The global meter's high-water
    /// marks persist across flushes: they track the peak of the sum, not the peak since the last
    /// flush.
    pub fn flush_meters(&self) {
        let pools = self.inner.borrow().pools.clone();
        for pool in &pools {
            pool.flush_meters();
        }
        let mut inner = self.inner.borrow_mut();
        inner.meter.reset_levels();
        for pool in &pools {
            inner.meter.accumulate(&pool.meter());
        }
    }

    /// A snapshot of the global meter as of the last flush.
    pub fn meter(&self) -> PoolMeter {
        self.inner.borrow().meter
    }

    /// Iterates over every pool registered so far.
    ///
    /// The iterator holds a snapshot of the pool list; dropping it ends the iteration. Creating
    /// pools while consuming the iterator is not supported.
    pub fn iterate(&self) -> PoolIter {
        PoolIter {
            pools: self.inner.borrow().pools.clone().into_iter(),
        }
    }

    /// Fills `stats` with totals across every pool and returns the number of dirty pools - those
    /// with at least one object in use.
    pub fn global_stats(&self, stats: &mut GlobalStats) -> usize {
        self.flush_meters();
        let inner = self.inner.borrow();
        *stats = GlobalStats::default();
        stats.meter = inner.meter;
        stats.idle_limit = inner.idle_limit;
        stats.pools_alloc = inner.pools.len();
        for pool in &inner.pools {
            let mut pool_stats = PoolStats::default();
            let in_use = pool.get_stats(&mut pool_stats);
            if in_use > 0 {
                stats.pools_in_use += 1;
            }
            stats.chunks_alloc += pool_stats.chunks_alloc;
            stats.chunks_in_use += pool_stats.chunks_in_use;
            stats.chunks_partial += pool_stats.chunks_partial;
            stats.chunks_free += pool_stats.chunks_free;
            stats.items_alloc += pool_stats.items_alloc;
            stats.items_in_use += pool_stats.items_in_use;
            stats.items_idle += pool_stats.items_idle;
            stats.overhead_bytes += pool_stats.overhead_bytes;
        }
        stats.pools_in_use
    }
}

/// An iteration over the registry's pools. Each pool is yielded exactly once.
pub struct PoolIter {
    pools: std::vec::IntoIter<Pool>,
}

impl Iterator for PoolIter {
    type Item = Pool;

    fn next(&mut self) -> Option<Pool> {
        self.pools.next()
    }
}
