//! Memory accounting: a tracked allocator wrapper and fixed-block pools.
//!
//! The kernel itself never allocates - object pools and stacks are static
//! or application-provided. These facilities exist so the *application's*
//! memory use is observable through the kernel's statistics surface.
use core::{alloc::GlobalAlloc, fmt, ptr};

use crate::{
    error::{ErrorCode, PoolError},
    klock::{self, CpuLockCell},
    utils::Init,
    KernelTraits, Region,
};

/// Global allocation statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    /// Bytes currently allocated.
    pub current: usize,
    /// The most bytes ever allocated at once.
    pub peak: usize,
    /// Lifetime number of allocations.
    pub allocations: u32,
    /// Lifetime number of failed allocations.
    pub failures: u32,
}

pub(crate) struct MemGlobals<Traits> {
    pub(crate) stats: CpuLockCell<Traits, MemoryStats>,
}

impl<Traits> Init for MemGlobals<Traits> {
    const INIT: Self = Self {
        stats: CpuLockCell::new(MemoryStats {
            current: 0,
            peak: 0,
            allocations: 0,
            failures: 0,
        }),
    };
}

/// Implements `System::memory_stats`.
pub(crate) fn stats<Traits: KernelTraits>() -> MemoryStats {
    match klock::lock_cpu::<Traits>() {
        Ok(lock) => Traits::state().mem.stats.get(&*lock),
        Err(_) => MemoryStats::default(),
    }
}

fn on_alloc<Traits: KernelTraits>(size: usize, ok: bool) {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };
    let stats = Traits::state().mem.stats.write(&mut *lock);
    if ok {
        stats.current += size;
        stats.peak = stats.peak.max(stats.current);
        stats.allocations = stats.allocations.wrapping_add(1);
    } else {
        stats.failures = stats.failures.wrapping_add(1);
        crate::error::record::<Traits>(lock.borrow_mut(), ErrorCode::OutOfMemory, size as u32);
    }
}

fn on_dealloc<Traits: KernelTraits>(size: usize) {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };
    let stats = Traits::state().mem.stats.write(&mut *lock);
    stats.current = stats.current.saturating_sub(size);
}

/// A [`GlobalAlloc`] wrapper that feeds the kernel's memory statistics.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: TrackedAllocator<SystemTraits, SomeHeap> =
///     TrackedAllocator::new(SomeHeap::empty());
/// ```
pub struct TrackedAllocator<Traits, A> {
    inner: A,
    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits, A> TrackedAllocator<Traits, A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            _phantom: core::marker::PhantomData,
        }
    }

    /// Access the wrapped allocator (e.g. for its initialization routine).
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

// Safety: defers to the wrapped allocator; the statistics update is
// internally synchronized through CPU Lock.
unsafe impl<Traits: KernelTraits, A: GlobalAlloc> GlobalAlloc for TrackedAllocator<Traits, A> {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        // Safety: same contract as ours
        let p = unsafe { self.inner.alloc(layout) };
        on_alloc::<Traits>(layout.size(), !p.is_null());
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
        // Safety: same contract as ours
        unsafe { self.inner.dealloc(ptr, layout) };
        on_dealloc::<Traits>(layout.size());
    }
}

// ---------------------------------------------------------------------------
// Fixed-block pools

/// A constant-time fixed-block allocator over an application-provided
/// region. Blocks are linked through their own storage while free.
pub struct BlockPool<Traits> {
    inner: CpuLockCell<Traits, PoolInner>,
}

struct PoolInner {
    storage: Region,
    block_size: usize,
    /// Head of the free list; blocks store the next-free pointer in their
    /// first word.
    free_head: *mut u8,
    free_count: usize,
    total: usize,
}

// Safety: the raw pointers refer to the pool's exclusively-owned region and
// are only dereferenced under CPU Lock.
unsafe impl Send for PoolInner {}

impl<Traits> fmt::Debug for BlockPool<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockPool").finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> BlockPool<Traits> {
    /// Construct a pool of `block_size`-byte blocks covering `storage`.
    /// `block_size` must be a multiple of the pointer size, at least one
    /// pointer wide.
    pub fn new(storage: Region, block_size: usize) -> Result<Self, PoolError> {
        let word = core::mem::size_of::<usize>();
        if block_size < word
            || block_size % word != 0
            || storage.is_null()
            || storage.base() as usize % word != 0
            || storage.len() < block_size
        {
            return Err(PoolError::BadParam);
        }

        let total = storage.len() / block_size;

        // Thread the free list through the blocks
        let mut head: *mut u8 = ptr::null_mut();
        for i in (0..total).rev() {
            // Safety: block `i` lies within the exclusively-owned region
            unsafe {
                let block = storage.base().add(i * block_size);
                (block as *mut *mut u8).write(head);
                head = block;
            }
        }

        Ok(Self {
            inner: CpuLockCell::new(PoolInner {
                storage,
                block_size,
                free_head: head,
                free_count: total,
                total,
            }),
        })
    }

    /// Take a block from the pool. O(1).
    pub fn allocate(&self) -> Result<*mut u8, PoolError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| PoolError::BadParam)?;
        let inner = self.inner.write(&mut *lock);

        if inner.free_head.is_null() {
            let block_size = inner.block_size;
            let _ = inner;
            crate::error::record::<Traits>(
                lock.borrow_mut(),
                ErrorCode::PoolExhausted,
                block_size as u32,
            );
            return Err(PoolError::Exhausted);
        }

        let block = inner.free_head;
        // Safety: a free block's first word holds the next-free pointer
        inner.free_head = unsafe { (block as *const *mut u8).read() };
        inner.free_count -= 1;
        Ok(block)
    }

    /// Return a block to the pool. O(1).
    ///
    /// # Safety
    ///
    /// `block` must have been obtained from [`Self::allocate`] on this pool
    /// and must not be used after this call.
    pub unsafe fn free(&self, block: *mut u8) {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        let inner = self.inner.write(&mut *lock);

        debug_assert!({
            let base = inner.storage.base() as usize;
            let b = block as usize;
            b >= base
                && b < base + inner.total * inner.block_size
                && (b - base) % inner.block_size == 0
        });

        // Safety: the block is unused from here on, so its first word can
        // hold the free-list link
        unsafe { (block as *mut *mut u8).write(inner.free_head) };
        inner.free_head = block;
        inner.free_count += 1;
    }

    /// `(free blocks, total blocks)`.
    pub fn usage(&self) -> (usize, usize) {
        match klock::lock_cpu::<Traits>() {
            Ok(mut lock) => {
                let inner = self.inner.write(&mut *lock);
                (inner.free_count, inner.total)
            }
            Err(_) => (0, 0),
        }
    }
}

/// Fraction of the tracked heap in use, in percent, for the health monitor.
pub(crate) fn heap_usage_pct(stats: &MemoryStats, heap_capacity: usize) -> u8 {
    if heap_capacity == 0 {
        0
    } else {
        (stats.current * 100 / heap_capacity).min(100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_usage_percentage() {
        let stats = MemoryStats {
            current: 512,
            peak: 600,
            allocations: 3,
            failures: 0,
        };
        assert_eq!(heap_usage_pct(&stats, 1024), 50);
        assert_eq!(heap_usage_pct(&stats, 0), 0);
    }
}
