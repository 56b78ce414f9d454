// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The chunk-backed pool engine.
//!
//! A `ChunkedPool` owns its chunks in a tree keyed by slab base address, which doubles as the
//! address-to-chunk lookup cleanup needs, plus two fast-path structures:
//!
//! * `cache` - an embedded LIFO list of freed slots. Free pushes here without finding the slot's
//!   home chunk, so it is O(1); the cost is that chunk occupancies go stale until the next
//!   cleanup pass drains the cache.
//! * `avail` - the bases of chunks that still have a free slot, in allocation-preference order.
//!   Cleanup sorts non-empty chunks with the fewest free slots to the front, so allocations fill
//!   nearly-full chunks first and empty chunks drift to the tail where they become release
//!   candidates.
//!
//! Cleanup runs in three phases: drain the cache into the owning chunks (making every
//! `in_use` count truthful), rebuild the preference order, then release chunks that are fully
//! idle and old enough, handing their slabs back to the system.

use std::cmp::{self, Reverse};
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use crate::chunk::{load_link, store_link, Chunk};
use crate::pool::PoolCore;
use crate::stats::PoolStats;
use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_SLOTS_PER_CHUNK, MIN_SLOTS_PER_CHUNK, PAGE_SIZE};

pub(crate) struct ChunkedPool {
    pub(crate) core: PoolCore,
    /// Byte size used for chunks created from now on, page-rounded.
    chunk_size: usize,
    /// Slot count for chunks created from now on.
    chunk_capacity: usize,
    /// All chunks, keyed by slab base address.
    chunks: BTreeMap<usize, Chunk>,
    /// Bases of chunks with at least one free slot, most-loaded first.
    avail: VecDeque<usize>,
    /// Head of the embedded LIFO list of freed-but-unreconciled slots.
    cache_head: *mut u8,
    cache_len: usize,
}

fn round_up_to_page(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

impl ChunkedPool {
    pub(crate) fn new(label: &'static str, obj_size: usize) -> ChunkedPool {
        let mut pool = ChunkedPool {
            core: PoolCore::new(label, obj_size),
            chunk_size: 0,
            chunk_capacity: 0,
            chunks: BTreeMap::new(),
            avail: VecDeque::new(),
            cache_head: ptr::null_mut(),
            cache_len: 0,
        };
        pool.set_chunk_size(DEFAULT_CHUNK_SIZE);
        pool
    }

    /// Derives the capacity of future chunks from a target byte size.
    ///
    /// The target is capped at [`MAX_CHUNK_SIZE`] and rounded up to whole pages; the capacity is
    /// clamped to the slot-count floor and ceiling, backed off if the floor pushed the chunk past
    /// the byte maximum, and the byte size re-rounded so a chunk always covers whole pages.
    pub(crate) fn set_chunk_size(&mut self, bytes: usize) {
        let obj_size = self.core.obj_size;
        let mut csize = round_up_to_page(cmp::min(bytes, MAX_CHUNK_SIZE));
        let mut capacity = csize / obj_size;
        if capacity < MIN_SLOTS_PER_CHUNK {
            capacity = MIN_SLOTS_PER_CHUNK;
        }
        if capacity * obj_size > MAX_CHUNK_SIZE {
            capacity = MAX_CHUNK_SIZE / obj_size;
        }
        if capacity > MAX_SLOTS_PER_CHUNK {
            capacity = MAX_SLOTS_PER_CHUNK;
        }
        csize = round_up_to_page(capacity * obj_size);
        capacity = csize / obj_size;
        self.chunk_capacity = capacity;
        self.chunk_size = csize;
    }

    pub(crate) unsafe fn alloc(&mut self) -> Option<NonNull<u8>> {
        self.core.alloc_calls += 1;
        let obj_size = self.core.obj_size;

        // Fast path: the pool cache.
        if !self.cache_head.is_null() {
            let slot = self.cache_head;
            self.cache_head = load_link(slot);
            self.cache_len -= 1;
            self.core.saved_calls += 1;
            self.core.meter.idle.dec(obj_size);
            self.core.meter.inuse.inc(obj_size);
            if self.core.zero_on_alloc {
                ptr::write_bytes(slot, 0, obj_size);
            }
            return NonNull::new(slot);
        }

        // Otherwise take a slot from the preferred chunk, growing the pool if every chunk is
        // full.
        let mut grew = false;
        if self.avail.is_empty() {
            let chunk = Chunk::new(self.chunk_capacity, obj_size)?;
            self.avail.push_back(chunk.base_addr());
            self.chunks.insert(chunk.base_addr(), chunk);
            grew = true;
        }
        let base = *self.avail.front().expect("pool just grew or had an available chunk");
        let chunk = self.chunks.get_mut(&base).expect("available list references a live chunk");
        let (slot, fresh) = chunk.allocate_slot().expect("available chunk has a free slot");
        if chunk.is_full() {
            self.avail.pop_front();
        }
        if fresh {
            self.core.meter.alloc.inc(obj_size);
        } else {
            self.core.meter.idle.dec(obj_size);
        }
        self.core.meter.inuse.inc(obj_size);
        if !grew {
            self.core.saved_calls += 1;
        }
        if self.core.zero_on_alloc {
            ptr::write_bytes(slot.as_ptr(), 0, obj_size);
        }
        Some(slot)
    }

    pub(crate) unsafe fn free(&mut self, p: NonNull<u8>) {
        #[cfg(debug_assertions)]
        self.assert_owns(p.as_ptr());
        self.core.free_calls += 1;
        store_link(p.as_ptr(), self.cache_head);
        self.cache_head = p.as_ptr();
        self.cache_len += 1;
        let obj_size = self.core.obj_size;
        self.core.meter.inuse.dec(obj_size);
        self.core.meter.idle.inc(obj_size);
    }

    #[cfg(debug_assertions)]
    fn assert_owns(&self, p: *mut u8) {
        let addr = p as usize;
        let owner = self
            .chunks
            .range(..=addr)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains(p));
        let chunk = owner.unwrap_or_else(|| {
            panic!("free of {:p}, which no chunk of pool '{}' contains", p, self.core.label)
        });
        assert_eq!(
            (addr - chunk.base_addr()) % self.core.obj_size,
            0,
            "free of {:p}, which is not slot-aligned in pool '{}'",
            p,
            self.core.label
        );
    }

    /// The reconciliation and reclamation pass.
    pub(crate) fn clean(&mut self, max_age: Duration) {
        // Phase A: return every cached slot to its owning chunk, found by address range.
        let mut p = self.cache_head;
        self.cache_head = ptr::null_mut();
        self.cache_len = 0;
        while !p.is_null() {
            let next = unsafe { load_link(p) };
            let addr = p as usize;
            let (_, chunk) = self
                .chunks
                .range_mut(..=addr)
                .next_back()
                .expect("cached slot below every chunk base");
            debug_assert!(chunk.contains(p));
            unsafe {
                chunk.release_slot(p);
            }
            p = next;
        }

        // Phase B: rebuild the preference order. Most-loaded chunks first, empty chunks at the
        // tail; address breaks ties so the order is deterministic.
        let mut order: Vec<usize> = self
            .chunks
            .values()
            .filter(|chunk| !chunk.is_full())
            .map(|chunk| chunk.base_addr())
            .collect();
        order.sort_by_key(|base| {
            let chunk = &self.chunks[base];
            (chunk.is_empty(), Reverse(chunk.in_use()), *base)
        });
        self.avail = order.into();

        // Phase C: release chunks that are fully idle and old enough, tail first.
        let now = Instant::now();
        let stale: Vec<usize> = self
            .avail
            .iter()
            .rev()
            .take_while(|base| self.chunks[base].is_empty())
            .filter(|base| now.duration_since(self.chunks[base].last_ref()) >= max_age)
            .cloned()
            .collect();
        for base in stale {
            let chunk = self.chunks.remove(&base).expect("stale list references a live chunk");
            let bytes = chunk.accounted_bytes();
            self.core.meter.alloc.dec(bytes);
            self.core.meter.idle.dec(bytes);
            // Dropping the chunk hands its slab back to the system.
        }
        let chunks = &self.chunks;
        self.avail.retain(|base| chunks.contains_key(base));
        debug!(
            "cleaned pool '{}': {} chunks remain, {} bytes idle",
            self.core.label,
            self.chunks.len(),
            self.core.meter.idle.level()
        );
    }

    /// Whether this pool is holding more idle bytes than one chunk's worth, left-shifted by
    /// `shift`. The cleaner uses this to skip pools not worth visiting.
    pub(crate) fn idle_trigger(&self, shift: u32) -> bool {
        self.core.meter.idle.level() > (self.chunk_capacity * self.core.obj_size) << shift
    }

    pub(crate) fn get_stats(&self, stats: &mut PoolStats) -> usize {
        let obj_size = self.core.obj_size;
        stats.label = self.core.label;
        stats.meter = self.core.meter;
        stats.object_size = obj_size;
        stats.chunk_capacity = self.chunk_capacity;
        stats.chunk_size_bytes = self.chunk_size;
        stats.chunks_alloc = self.chunks.len();
        stats.chunks_in_use = 0;
        stats.chunks_partial = 0;
        stats.chunks_free = 0;
        for chunk in self.chunks.values() {
            if chunk.is_full() {
                stats.chunks_in_use += 1;
            } else if chunk.is_empty() {
                stats.chunks_free += 1;
            } else {
                stats.chunks_partial += 1;
            }
        }
        stats.items_alloc = self.core.meter.alloc.level() / obj_size;
        stats.items_in_use = self.core.meter.inuse.level() / obj_size;
        stats.items_idle = self.core.meter.idle.level() / obj_size;
        stats.overhead_bytes = mem::size_of::<ChunkedPool>()
            + self.chunks.len() * mem::size_of::<Chunk>()
            + self.core.label.len()
            + 1;
        stats.items_in_use
    }

    #[cfg(test)]
    pub(crate) fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    #[cfg(test)]
    pub(crate) fn chunk_capacities(&self) -> Vec<usize> {
        self.chunks.values().map(|c| c.capacity()).collect()
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache_len
    }

    #[cfg(test)]
    pub(crate) fn chunk_in_use_total(&self) -> usize {
        self.chunks.values().map(|c| c.in_use()).sum()
    }
}

impl Drop for ChunkedPool {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.core.meter.inuse.level(),
                0,
                "pool '{}' dropped with objects still in use",
                self.core.label
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(obj_size: usize) -> ChunkedPool {
        let _ = env_logger::builder().is_test(true).try_init();
        ChunkedPool::new("test", crate::rounded_size(obj_size))
    }

    fn meters_consistent(p: &ChunkedPool) -> bool {
        let m = &p.core.meter;
        m.inuse.level() + m.idle.level() == m.alloc.level()
    }

    #[test]
    fn cache_is_lifo() {
        let mut p = pool(32);
        unsafe {
            let p1 = p.alloc().unwrap();
            let p2 = p.alloc().unwrap();
            p.free(p1);
            let p3 = p.alloc().unwrap();
            assert_eq!(p3, p1);
            p.free(p3);
            p.free(p2);
        }
        p.clean(Duration::from_secs(0));
    }

    #[test]
    fn default_capacity_for_24_byte_objects() {
        if mem::size_of::<*mut u8>() != 8 {
            return;
        }
        let p = pool(17);
        assert_eq!(p.core.obj_size, 24);
        assert_eq!(p.chunk_capacity(), 682);
        assert_eq!(p.chunk_size, 16384);
    }

    #[test]
    fn capacity_respects_floor_and_byte_ceiling() {
        // The largest chunkable object: the slot-count floor lands exactly on the byte ceiling.
        let p = pool(crate::MAX_CHUNKED_OBJECT_SIZE);
        assert_eq!(p.chunk_capacity(), MIN_SLOTS_PER_CHUNK);
        assert!(p.chunk_capacity() * p.core.obj_size <= MAX_CHUNK_SIZE);
        // A mid-sized object still lands within every clamp.
        let p = pool(8000);
        assert!(p.chunk_capacity() >= MIN_SLOTS_PER_CHUNK);
        assert!(p.chunk_capacity() <= MAX_SLOTS_PER_CHUNK);
        assert!(p.chunk_capacity() * p.core.obj_size <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn set_chunk_size_applies_to_future_chunks_only() {
        let mut p = pool(64);
        let old_capacity = p.chunk_capacity();
        unsafe {
            let a = p.alloc().unwrap();
            p.set_chunk_size(MAX_CHUNK_SIZE);
            assert_ne!(p.chunk_capacity(), old_capacity);
            assert_eq!(p.chunk_capacities(), vec![old_capacity]);
            // Fill the first chunk so the next allocation opens a chunk with the new capacity.
            let mut held = vec![a];
            for _ in 1..old_capacity {
                held.push(p.alloc().unwrap());
            }
            held.push(p.alloc().unwrap());
            let mut capacities = p.chunk_capacities();
            capacities.sort();
            assert_eq!(capacities, vec![old_capacity, p.chunk_capacity()]);
            for q in held {
                p.free(q);
            }
        }
        p.clean(Duration::from_secs(0));
    }

    #[test]
    fn second_chunk_appears_when_first_fills() {
        let mut p = pool(64);
        let capacity = p.chunk_capacity();
        let mut held = Vec::new();
        unsafe {
            for _ in 0..capacity {
                held.push(p.alloc().unwrap());
            }
            assert_eq!(p.chunks.len(), 1);
            let extra = p.alloc().unwrap();
            assert_eq!(p.chunks.len(), 2);
            // Freeing the overflow object and cleaning releases the second chunk again.
            p.free(extra);
            p.clean(Duration::from_secs(0));
            assert_eq!(p.chunks.len(), 1);
            for q in held {
                p.free(q);
            }
        }
        p.clean(Duration::from_secs(0));
        assert_eq!(p.chunks.len(), 0);
        assert_eq!(p.core.meter.alloc.level(), 0);
    }

    #[test]
    fn meters_balance_after_every_step() {
        let mut p = pool(40);
        let mut held = Vec::new();
        unsafe {
            for _ in 0..100 {
                held.push(p.alloc().unwrap());
                assert!(meters_consistent(&p));
            }
            for q in held.drain(..) {
                p.free(q);
                assert!(meters_consistent(&p));
            }
        }
        p.clean(Duration::from_secs(3600));
        assert!(meters_consistent(&p));
        p.clean(Duration::from_secs(0));
        assert!(meters_consistent(&p));
        assert_eq!(p.core.meter.alloc.level(), 0);
    }

    #[test]
    fn clean_drains_cache_and_trues_up_chunks() {
        let mut p = pool(48);
        unsafe {
            let a = p.alloc().unwrap();
            let b = p.alloc().unwrap();
            let c = p.alloc().unwrap();
            p.free(b);
            // The chunk still believes all three are out until the cache drains.
            assert_eq!(p.cache_len(), 1);
            assert_eq!(p.chunk_in_use_total(), 3);
            p.clean(Duration::from_secs(3600));
            assert_eq!(p.cache_len(), 0);
            assert_eq!(p.chunk_in_use_total(), 2);
            p.free(a);
            p.free(c);
        }
        p.clean(Duration::from_secs(0));
    }

    #[test]
    fn clean_is_idempotent() {
        let mut p = pool(32);
        let mut held = Vec::new();
        unsafe {
            for _ in 0..50 {
                held.push(p.alloc().unwrap());
            }
            for _ in 0..25 {
                p.free(held.pop().unwrap());
            }
        }
        p.clean(Duration::from_secs(3600));
        let meter = p.core.meter;
        let chunks = p.chunks.len();
        p.clean(Duration::from_secs(3600));
        assert_eq!(p.core.meter, meter);
        assert_eq!(p.chunks.len(), chunks);
        unsafe {
            for q in held.drain(..) {
                p.free(q);
            }
        }
        p.clean(Duration::from_secs(0));
    }

    #[test]
    fn zeroing_covers_recycled_slots() {
        let mut p = pool(64);
        p.core.zero_on_alloc = true;
        unsafe {
            let a = p.alloc().unwrap();
            ptr::write_bytes(a.as_ptr(), 0xff, 64);
            p.free(a);
            let b = p.alloc().unwrap();
            assert_eq!(b, a);
            for i in 0..64 {
                assert_eq!(*b.as_ptr().add(i), 0);
            }
            p.free(b);
        }
        p.clean(Duration::from_secs(0));
    }

    #[test]
    fn idle_trigger_scales_with_shift() {
        let mut p = pool(64);
        let chunk_bytes = p.chunk_capacity() * p.core.obj_size;
        let mut held = Vec::new();
        unsafe {
            // A bit more than two chunks' worth of idle memory.
            for _ in 0..(2 * p.chunk_capacity() + 8) {
                held.push(p.alloc().unwrap());
            }
            for q in held.drain(..) {
                p.free(q);
            }
        }
        assert!(p.core.meter.idle.level() > 2 * chunk_bytes);
        assert!(p.idle_trigger(0));
        assert!(p.idle_trigger(1));
        assert!(!p.idle_trigger(4));
        p.clean(Duration::from_secs(0));
    }

    #[test]
    fn allocations_prefer_loaded_chunks_after_clean() {
        let mut p = pool(64);
        let capacity = p.chunk_capacity();
        let mut held = Vec::new();
        unsafe {
            // Two chunks: fill the first, put a single object in the second.
            for _ in 0..capacity + 1 {
                held.push(p.alloc().unwrap());
            }
            // Empty the first chunk, keep the second's single object live.
            let survivor = held.pop().unwrap();
            for q in held.drain(..) {
                p.free(q);
            }
            p.clean(Duration::from_secs(3600));
            assert_eq!(p.chunks.len(), 2);
            // The next allocation must land in the survivor's chunk, not the empty one.
            let neighbor = p.alloc().unwrap();
            let survivor_base = p
                .chunks
                .values()
                .find(|c| c.contains(survivor.as_ptr()))
                .unwrap()
                .base_addr();
            let neighbor_base = p
                .chunks
                .values()
                .find(|c| c.contains(neighbor.as_ptr()))
                .unwrap()
                .base_addr();
            assert_eq!(neighbor_base, survivor_base);
            p.free(neighbor);
            p.free(survivor);
        }
        p.clean(Duration::from_secs(0));
    }
}
