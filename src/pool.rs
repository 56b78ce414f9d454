// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The public pool handle and the closed set of pool variants behind it.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;

use crate::chunked::ChunkedPool;
use crate::meter::PoolMeter;
use crate::simple::MallocPool;
use crate::stats::PoolStats;

/// State common to every pool variant: identity, rounded object size, meters, call counters and
/// the zero-on-alloc flag.
pub(crate) struct PoolCore {
    pub(crate) label: &'static str,
    pub(crate) obj_size: usize,
    pub(crate) meter: PoolMeter,
    pub(crate) alloc_calls: u64,
    pub(crate) saved_calls: u64,
    pub(crate) free_calls: u64,
    pub(crate) zero_on_alloc: bool,
}

impl PoolCore {
    pub(crate) fn new(label: &'static str, obj_size: usize) -> PoolCore {
        PoolCore {
            label,
            obj_size,
            meter: PoolMeter::default(),
            alloc_calls: 0,
            saved_calls: 0,
            free_calls: 0,
            zero_on_alloc: false,
        }
    }

    /// Moves the pending call counts into the meter's cumulative histories.
    pub(crate) fn flush_meters(&mut self) {
        let (allocs, saves, frees) = (self.alloc_calls, self.saved_calls, self.free_calls);
        self.alloc_calls = 0;
        self.saved_calls = 0;
        self.free_calls = 0;
        self.meter.fold_calls(allocs, saves, frees, self.obj_size);
    }
}

pub(crate) enum PoolImpl {
    Chunked(ChunkedPool),
    Malloc(MallocPool),
}

impl PoolImpl {
    pub(crate) fn core(&self) -> &PoolCore {
        match self {
            PoolImpl::Chunked(p) => &p.core,
            PoolImpl::Malloc(p) => &p.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut PoolCore {
        match self {
            PoolImpl::Chunked(p) => &mut p.core,
            PoolImpl::Malloc(p) => &mut p.core,
        }
    }
}

/// A cheap, cloneable handle on one pool.
///
/// All clones refer to the same pool; the registry keeps one for iteration and statistics. Pool
/// state sits behind a non-reentrant guard, so handles may be stashed at scattered call sites but
/// must only be used from the single thread of control the allocator contract assumes.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<RefCell<PoolImpl>>,
}

impl Pool {
    pub(crate) fn new_chunked(label: &'static str, obj_size: usize) -> Pool {
        Pool {
            inner: Rc::new(RefCell::new(PoolImpl::Chunked(ChunkedPool::new(label, obj_size)))),
        }
    }

    pub(crate) fn new_malloc(label: &'static str, obj_size: usize) -> Pool {
        Pool {
            inner: Rc::new(RefCell::new(PoolImpl::Malloc(MallocPool::new(label, obj_size)))),
        }
    }

    /// Allocates one object from the pool.
    ///
    /// Returns a pointer to `object_size` bytes, zero-initialized when the pool was configured
    /// with [`Pool::set_zero_on_alloc`] and uninitialized otherwise. The pointer stays valid
    /// until passed to [`Pool::free`]. `None` means the system allocator failed to provide
    /// backing memory.
    ///
    /// # Safety
    /// The returned memory is uninitialized (or all-zero); the caller must fully overwrite it
    /// before reading, and must return it to this pool and no other.
    pub unsafe fn alloc(&self) -> Option<NonNull<u8>> {
        match *self.inner.borrow_mut() {
            PoolImpl::Chunked(ref mut p) => p.alloc(),
            PoolImpl::Malloc(ref mut p) => p.alloc(),
        }
    }

    /// Returns an object to the pool.
    ///
    /// After this call `p` is invalid and may be handed out again by a subsequent
    /// [`Pool::alloc`].
    ///
    /// # Safety
    /// `p` must have come from a call to `alloc` on this same pool and must not have been freed
    /// already. Debug builds verify at least the address-range part of that contract.
    pub unsafe fn free(&self, p: NonNull<u8>) {
        match *self.inner.borrow_mut() {
            PoolImpl::Chunked(ref mut pool) => pool.free(p),
            PoolImpl::Malloc(ref mut pool) => pool.free(p),
        }
    }

    /// Fills `stats` with a snapshot of the pool's counters and returns the number of objects in
    /// use. Does not mutate the pool.
    pub fn get_stats(&self, stats: &mut PoolStats) -> usize {
        match *self.inner.borrow() {
            PoolImpl::Chunked(ref p) => p.get_stats(stats),
            PoolImpl::Malloc(ref p) => p.get_stats(stats),
        }
    }

    /// The pool's object size after rounding.
    pub fn object_size(&self) -> usize {
        self.inner.borrow().core().obj_size
    }

    /// The number of objects currently handed out.
    pub fn in_use_count(&self) -> usize {
        let inner = self.inner.borrow();
        let core = inner.core();
        core.meter.inuse.level() / core.obj_size
    }

    /// A snapshot of the pool's meter.
    pub fn meter(&self) -> PoolMeter {
        self.inner.borrow().core().meter
    }

    /// The label the pool was created with.
    pub fn label(&self) -> &'static str {
        self.inner.borrow().core().label
    }

    /// Retunes the byte size used for chunks created from now on; existing chunks keep their
    /// capacity. No effect on malloc-backed pools.
    pub fn set_chunk_size(&self, bytes: usize) {
        if let PoolImpl::Chunked(ref mut p) = *self.inner.borrow_mut() {
            p.set_chunk_size(bytes);
        }
    }

    /// Requests zero-initialized memory from future allocations.
    pub fn set_zero_on_alloc(&self, zero: bool) {
        self.inner.borrow_mut().core_mut().zero_on_alloc = zero;
    }

    /// True when this pool carves objects out of chunks rather than calling the system allocator
    /// per object.
    pub fn is_chunked(&self) -> bool {
        match *self.inner.borrow() {
            PoolImpl::Chunked(..) => true,
            PoolImpl::Malloc(..) => false,
        }
    }

    /// True when the pool is holding enough idle memory to be worth a cleanup visit: more than
    /// one chunk's worth of bytes, left-shifted by `shift`.
    pub fn idle_trigger(&self, shift: u32) -> bool {
        match *self.inner.borrow() {
            PoolImpl::Chunked(ref p) => p.idle_trigger(shift),
            PoolImpl::Malloc(..) => false,
        }
    }

    /// Reconciles the pool cache into its chunks, re-sorts the chunks, and releases chunks that
    /// have been fully idle for at least `max_age`. See [`MemPools::clean`] for the registry-wide
    /// entry point that also applies the idle-memory budget.
    ///
    /// [`MemPools::clean`]: crate::MemPools::clean
    pub fn clean(&self, max_age: Duration) {
        if let PoolImpl::Chunked(ref mut p) = *self.inner.borrow_mut() {
            p.clean(max_age);
        }
    }

    /// Whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn flush_meters(&self) {
        self.inner.borrow_mut().core_mut().flush_meters();
    }
}
