//! Fixed-pool suballocator with a wait/notify free list
//!
//! One contiguous device allocation is reserved at init and never grows;
//! per-step allocations are carved out of it with a best-fit, coalescing
//! free list. `alloc` blocks the caller on a condition variable while the
//! pool cannot satisfy the request and retries when a concurrent `free`
//! broadcasts availability. This mutex is the sole serialization point
//! between the compute thread and the background workers that free
//! offloaded activations.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::device::{DevicePtr, DeviceRuntime};
use crate::error::{GradForgeError, GradResult};

/// Block alignment inside the pool. Every carved block size is a multiple
/// of this, so offsets stay aligned without padding fragments.
pub const POOL_ALIGNMENT: usize = 256;

/// Round a request up to the pool alignment. The planner's analytic
/// accounting uses the same rounding so simulated and real consumption
/// match byte for byte.
pub fn align_up(bytes: usize) -> usize {
    (bytes + POOL_ALIGNMENT - 1) & !(POOL_ALIGNMENT - 1)
}

/// Free region within the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

impl FreeBlock {
    fn is_adjacent_to(&self, other: &FreeBlock) -> bool {
        self.offset + self.size == other.offset
    }
}

#[derive(Debug)]
struct PoolState {
    /// Sorted by offset, coalesced.
    free_blocks: Vec<FreeBlock>,
    /// Live allocations: device address -> (offset, aligned size).
    allocations: HashMap<u64, (usize, usize)>,
    outstanding: usize,
    peak_outstanding: usize,
    shut_down: bool,
}

impl PoolState {
    fn best_fit(&self, size: usize) -> Option<usize> {
        self.free_blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| b.size)
            .map(|(idx, _)| idx)
    }

    fn carve(&mut self, idx: usize, size: usize) -> usize {
        let block = self.free_blocks[idx];
        if block.size == size {
            self.free_blocks.remove(idx);
        } else {
            self.free_blocks[idx] = FreeBlock {
                offset: block.offset + size,
                size: block.size - size,
            };
        }
        block.offset
    }

    fn insert_free(&mut self, offset: usize, size: usize) {
        self.free_blocks.push(FreeBlock { offset, size });
        self.free_blocks.sort_by_key(|b| b.offset);
        let mut i = 0;
        while i + 1 < self.free_blocks.len() {
            let next = self.free_blocks[i + 1];
            if self.free_blocks[i].is_adjacent_to(&next) {
                self.free_blocks[i].size += next.size;
                self.free_blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// Mutex-guarded wrapper over a fixed-capacity device pool.
pub struct Suballocator {
    runtime: Arc<dyn DeviceRuntime>,
    base: DevicePtr,
    capacity: usize,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl Suballocator {
    /// Reserve a contiguous device pool of `capacity_bytes`. Growth is
    /// disabled: the underlying allocator is never called again until
    /// shutdown.
    pub fn init(runtime: Arc<dyn DeviceRuntime>, capacity_bytes: usize) -> GradResult<Arc<Self>> {
        if capacity_bytes == 0 {
            return Err(GradForgeError::InvalidConfiguration(
                "pool capacity cannot be zero".into(),
            ));
        }
        let capacity = align_up(capacity_bytes);
        let base = runtime.alloc_device(capacity)?;
        tracing::debug!(
            capacity,
            base = base.as_raw(),
            "suballocator: pool reserved"
        );
        Ok(Arc::new(Suballocator {
            runtime,
            base,
            capacity,
            state: Mutex::new(PoolState {
                free_blocks: vec![FreeBlock {
                    offset: 0,
                    size: capacity,
                }],
                allocations: HashMap::new(),
                outstanding: 0,
                peak_outstanding: 0,
                shut_down: false,
            }),
            freed: Condvar::new(),
        }))
    }

    /// Blocking allocate. Waits on the free broadcast while the pool cannot
    /// satisfy the request; a request larger than the whole pool can never
    /// succeed and fails immediately.
    pub fn alloc(&self, bytes: usize) -> GradResult<DevicePtr> {
        let size = Self::checked_size(bytes, self.capacity)?;
        let mut state = self.state.lock()?;
        loop {
            if state.shut_down {
                return Err(GradForgeError::Internal(
                    "allocation from a shut-down pool".into(),
                ));
            }
            if let Some(idx) = state.best_fit(size) {
                return Ok(self.commit(&mut state, idx, size));
            }
            tracing::trace!(bytes, "suballocator: pool contended, waiting on free");
            state = self.freed.wait(state)?;
        }
    }

    /// Non-blocking allocate for the planner's confirmation replay:
    /// `Ok(None)` means the pool cannot satisfy the request right now.
    pub fn try_alloc(&self, bytes: usize) -> GradResult<Option<DevicePtr>> {
        let size = Self::checked_size(bytes, self.capacity)?;
        let mut state = self.state.lock()?;
        if state.shut_down {
            return Err(GradForgeError::Internal(
                "allocation from a shut-down pool".into(),
            ));
        }
        Ok(state
            .best_fit(size)
            .map(|idx| self.commit(&mut state, idx, size)))
    }

    /// Release a block and broadcast to all waiters.
    pub fn free(&self, ptr: DevicePtr) -> GradResult<()> {
        let mut state = self.state.lock()?;
        let (offset, size) = state.allocations.remove(&ptr.as_raw()).ok_or_else(|| {
            GradForgeError::Invariant(format!(
                "free of pointer {:#x} not owned by the pool",
                ptr.as_raw()
            ))
        })?;
        state.insert_free(offset, size);
        state.outstanding -= size;
        self.freed.notify_all();
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently free (may be fragmented).
    pub fn free_bytes(&self) -> usize {
        self.state
            .lock()
            .map(|s| self.capacity - s.outstanding)
            .unwrap_or(0)
    }

    /// Bytes currently allocated out of the pool.
    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().map(|s| s.outstanding).unwrap_or(0)
    }

    /// High-water mark of `outstanding_bytes` since init or `reset_peak`.
    pub fn peak_outstanding(&self) -> usize {
        self.state.lock().map(|s| s.peak_outstanding).unwrap_or(0)
    }

    pub fn reset_peak(&self) -> GradResult<()> {
        let mut state = self.state.lock()?;
        state.peak_outstanding = state.outstanding;
        Ok(())
    }

    /// Drain and release the pool. Outstanding allocations at shutdown are
    /// reported, not chased; the process is expected to exit.
    pub fn shutdown(&self) -> GradResult<()> {
        let mut state = self.state.lock()?;
        if state.shut_down {
            return Ok(());
        }
        if state.outstanding > 0 {
            tracing::warn!(
                outstanding = state.outstanding,
                "suballocator: shutting down with outstanding allocations"
            );
        }
        state.shut_down = true;
        self.freed.notify_all();
        drop(state);
        self.runtime.free_device(self.base)?;
        Ok(())
    }

    fn checked_size(bytes: usize, capacity: usize) -> GradResult<usize> {
        if bytes == 0 {
            return Err(GradForgeError::Invariant(
                "zero-byte pool allocation".into(),
            ));
        }
        let size = align_up(bytes);
        if size > capacity {
            return Err(GradForgeError::Internal(format!(
                "pool request of {} bytes exceeds pool capacity {}",
                size, capacity
            )));
        }
        Ok(size)
    }

    fn commit(&self, state: &mut PoolState, idx: usize, size: usize) -> DevicePtr {
        let offset = state.carve(idx, size);
        let ptr = DevicePtr::from_raw(self.base.as_raw() + offset as u64);
        state.allocations.insert(ptr.as_raw(), (offset, size));
        state.outstanding += size;
        state.peak_outstanding = state.peak_outstanding.max(state.outstanding);
        ptr
    }
}

impl Drop for Suballocator {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            if state.shut_down {
                return;
            }
        }
        if let Err(err) = self.runtime.free_device(self.base) {
            tracing::warn!(%err, "suballocator: failed to release pool backing");
        }
    }
}
