// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A contiguous slab of fixed-size slots belonging to one pool.
//!
//! # Layout
//!
//! A chunk's slab is a single system-allocator block of `capacity * slot_size` bytes, split into
//! `capacity` slots. Slots are handed out in two ways:
//!
//! * fresh slots come from the *untouched tail*: a bump index past which no slot has ever been
//!   handed out;
//! * returned slots are threaded onto an embedded singly-linked free list, each free slot's first
//!   pointer-sized word holding the address of the next free slot, null-terminated.
//!
//! The embedded list is why slots are at least pointer-sized and pointer-aligned, and why a slot
//! must be treated as uninitialized memory once handed out. Keeping fresh slots out of the free
//! list means the touched prefix is exactly the portion of the slab that the pool's meters have
//! ever accounted for, which is what cleanup subtracts when it releases the chunk.
//!
//! A chunk only knows its aggregate occupancy. Freed slots park on the pool-level cache, so
//! between cleanup passes `in_use` includes slots that callers have already returned; the cleanup
//! pass calls [`Chunk::release_slot`] for each cached slot to make the count truthful again.

use std::alloc;
use std::ptr::{self, NonNull};
use std::time::Instant;

/// Stores the embedded free-list link in a free slot's first word.
///
/// The slot must be pointer-aligned; slabs are pointer-aligned and slot sizes are multiples of
/// the pointer size, so every slot qualifies.
pub(crate) unsafe fn store_link(slot: *mut u8, next: *mut u8) {
    debug_assert_eq!(slot as usize % std::mem::align_of::<*mut u8>(), 0);
    ptr::write(slot as *mut *mut u8, next);
}

/// Reads the embedded free-list link out of a free slot's first word.
pub(crate) unsafe fn load_link(slot: *mut u8) -> *mut u8 {
    debug_assert_eq!(slot as usize % std::mem::align_of::<*mut u8>(), 0);
    ptr::read(slot as *const *mut u8)
}

pub(crate) struct Chunk {
    base: NonNull<u8>,
    capacity: usize,
    slot_size: usize,
    free_head: *mut u8,
    touched: usize,
    in_use: usize,
    last_ref: Instant,
}

impl Chunk {
    /// Allocates a slab for `capacity` slots of `slot_size` bytes. Returns `None` when the system
    /// allocator fails.
    pub(crate) fn new(capacity: usize, slot_size: usize) -> Option<Chunk> {
        let layout = Self::slab_layout(capacity, slot_size);
        let base = NonNull::new(unsafe { alloc::alloc(layout) })?;
        trace!("new chunk: {} slots of {} bytes at {:p}", capacity, slot_size, base.as_ptr());
        Some(Chunk {
            base,
            capacity,
            slot_size,
            free_head: ptr::null_mut(),
            touched: 0,
            in_use: 0,
            last_ref: Instant::now(),
        })
    }

    fn slab_layout(capacity: usize, slot_size: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(capacity * slot_size, std::mem::align_of::<*mut u8>())
            .expect("slab layout must be valid")
    }

    /// Hands out one slot, preferring returned slots over untouched ones. The second tuple field
    /// is true when the slot has never been handed out before.
    pub(crate) fn allocate_slot(&mut self) -> Option<(NonNull<u8>, bool)> {
        if !self.free_head.is_null() {
            let slot = self.free_head;
            self.free_head = unsafe { load_link(slot) };
            self.in_use += 1;
            self.last_ref = Instant::now();
            return NonNull::new(slot).map(|s| (s, false));
        }
        if self.touched < self.capacity {
            let slot = unsafe { self.base.as_ptr().add(self.touched * self.slot_size) };
            self.touched += 1;
            self.in_use += 1;
            self.last_ref = Instant::now();
            return NonNull::new(slot).map(|s| (s, true));
        }
        None
    }

    /// Returns a slot to this chunk's free list.
    ///
    /// `slot` must lie within the slab and be slot-aligned.
    pub(crate) unsafe fn release_slot(&mut self, slot: *mut u8) {
        debug_assert!(self.contains(slot));
        debug_assert_eq!((slot as usize - self.base.as_ptr() as usize) % self.slot_size, 0);
        debug_assert!(self.in_use > 0);
        store_link(slot, self.free_head);
        self.free_head = slot;
        self.in_use -= 1;
        self.last_ref = Instant::now();
    }

    pub(crate) fn contains(&self, p: *mut u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = p as usize;
        addr >= base && addr < base + self.capacity * self.slot_size
    }

    /// True when every slot this chunk knows about is back home.
    pub(crate) fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// True when no slot is available, neither returned nor untouched.
    pub(crate) fn is_full(&self) -> bool {
        self.in_use == self.capacity
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    #[cfg_attr(not(test), allow(unused))]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn last_ref(&self) -> Instant {
        self.last_ref
    }

    /// The bytes the pool's meters have accounted for in this chunk: the touched prefix.
    pub(crate) fn accounted_bytes(&self) -> usize {
        self.touched * self.slot_size
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        trace!("releasing chunk at {:p} ({} of {} slots touched)", self.base.as_ptr(), self.touched, self.capacity);
        unsafe {
            alloc::dealloc(self.base.as_ptr(), Self::slab_layout(self.capacity, self.slot_size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slots_bump_in_address_order() {
        let mut chunk = Chunk::new(32, 16).unwrap();
        let first = chunk.allocate_slot().unwrap();
        let second = chunk.allocate_slot().unwrap();
        assert!(first.1 && second.1);
        assert_eq!(second.0.as_ptr() as usize - first.0.as_ptr() as usize, 16);
        assert_eq!(chunk.in_use(), 2);
        assert_eq!(chunk.accounted_bytes(), 32);
        unsafe {
            chunk.release_slot(first.0.as_ptr());
            chunk.release_slot(second.0.as_ptr());
        }
    }

    #[test]
    fn returned_slots_recycle_lifo() {
        let mut chunk = Chunk::new(32, 16).unwrap();
        let (a, _) = chunk.allocate_slot().unwrap();
        let (b, _) = chunk.allocate_slot().unwrap();
        unsafe {
            chunk.release_slot(a.as_ptr());
            chunk.release_slot(b.as_ptr());
        }
        assert!(chunk.is_empty());
        // b was released last, so it comes back first, and neither is fresh.
        let (c, fresh) = chunk.allocate_slot().unwrap();
        assert_eq!(c, b);
        assert!(!fresh);
        let (d, fresh) = chunk.allocate_slot().unwrap();
        assert_eq!(d, a);
        assert!(!fresh);
        // Recycling must not have grown the accounted prefix.
        assert_eq!(chunk.accounted_bytes(), 32);
        unsafe {
            chunk.release_slot(c.as_ptr());
            chunk.release_slot(d.as_ptr());
        }
    }

    #[test]
    fn fills_to_capacity() {
        let mut chunk = Chunk::new(32, 16).unwrap();
        let mut slots = Vec::new();
        while let Some((slot, _)) = chunk.allocate_slot() {
            slots.push(slot);
        }
        assert_eq!(slots.len(), 32);
        assert!(chunk.is_full());
        assert!(chunk.allocate_slot().is_none());
        for slot in slots {
            unsafe {
                chunk.release_slot(slot.as_ptr());
            }
        }
        assert!(chunk.is_empty());
    }

    #[test]
    fn membership_is_range_exact() {
        let mut chunk = Chunk::new(32, 16).unwrap();
        let (slot, _) = chunk.allocate_slot().unwrap();
        let base = chunk.base_addr();
        assert!(chunk.contains(slot.as_ptr()));
        assert!(chunk.contains((base + 32 * 16 - 1) as *mut u8));
        assert!(!chunk.contains((base + 32 * 16) as *mut u8));
        assert!(!chunk.contains((base.wrapping_sub(1)) as *mut u8));
        unsafe {
            chunk.release_slot(slot.as_ptr());
        }
    }
}
