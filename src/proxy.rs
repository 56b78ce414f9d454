// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A late-bound pool handle.
//!
//! Objects that want pooled allocation but cannot name their pool at construction time hold a
//! [`PoolProxy`] instead: the label and object size are captured up front, and the pool itself is
//! created in the registry on the first allocation, then reused. The proxy owns no memory - it
//! only memoizes the handle.

use std::any;
use std::cell::RefCell;
use std::mem;
use std::ptr::NonNull;

use crate::meter::PoolMeter;
use crate::pool::Pool;
use crate::registry::MemPools;
use crate::stats::PoolStats;

pub struct PoolProxy {
    label: &'static str,
    size: usize,
    pool: RefCell<Option<Pool>>,
}

impl PoolProxy {
    /// Captures a pool's identity without creating it.
    pub fn new(label: &'static str, size: usize) -> PoolProxy {
        PoolProxy {
            label,
            size,
            pool: RefCell::new(None),
        }
    }

    /// A proxy for a pool dedicated to values of type `T`, named after the type.
    pub fn for_type<T>() -> PoolProxy {
        PoolProxy::new(any::type_name::<T>(), mem::size_of::<T>())
    }

    /// The memoized pool, created in the registry on first use.
    ///
    /// Panics if the captured size is one the registry refuses; a proxy's size is fixed at
    /// construction, so that is a programming error rather than a runtime condition.
    fn pool(&self) -> Pool {
        let mut slot = self.pool.borrow_mut();
        if slot.is_none() {
            let pool = MemPools::instance()
                .create(self.label, self.size)
                .expect("proxy captured an unpoolable object size");
            *slot = Some(pool);
        }
        slot.as_ref().expect("proxy pool was just bound").clone()
    }

    /// Allocates one object, binding the pool first if this is the proxy's first use.
    ///
    /// # Safety
    /// As for [`Pool::alloc`].
    pub unsafe fn alloc(&self) -> Option<NonNull<u8>> {
        self.pool().alloc()
    }

    /// Returns an object to the proxied pool.
    ///
    /// # Safety
    /// As for [`Pool::free`].
    pub unsafe fn free(&self, p: NonNull<u8>) {
        self.pool().free(p)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// The pool's rounded object size. Binds the pool.
    pub fn object_size(&self) -> usize {
        self.pool().object_size()
    }

    pub fn in_use_count(&self) -> usize {
        self.pool().in_use_count()
    }

    pub fn meter(&self) -> PoolMeter {
        self.pool().meter()
    }

    pub fn get_stats(&self, stats: &mut PoolStats) -> usize {
        self.pool().get_stats(stats)
    }
}
