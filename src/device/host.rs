//! Host device runtime
//!
//! A full implementation of [`DeviceRuntime`] with no accelerator: device
//! memory is host memory and every stream is a FIFO worker thread draining
//! enqueued jobs. Offload/prefetch overlap, event ordering, and the
//! free-worker chains therefore execute for real, which is what makes the
//! whole training schedule testable on machines without a GPU.
//!
//! Capacity is configurable so tests can constrain the device budget and
//! drive the planner through its fallback tiers.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::device::{
    DeviceError, DevicePtr, DeviceResult, DeviceRuntime, EventHandle, PinnedPtr, StreamHandle,
};

/// Default simulated device capacity: 4 GiB.
const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024 * 1024;

/// Allocation alignment. Matches the suballocator's block alignment so a
/// handle at any pool offset stays element-aligned.
const HOST_ALLOC_ALIGN: usize = 256;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct StreamQueue {
    jobs: VecDeque<Job>,
    busy: bool,
    shutdown: bool,
}

struct StreamState {
    queue: Mutex<StreamQueue>,
    work: Condvar,
    idle: Condvar,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            queue: Mutex::new(StreamQueue::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn push(&self, job: Job) -> DeviceResult<()> {
        let mut queue = self.queue.lock()?;
        if queue.shutdown {
            return Err(DeviceError::StreamError(
                "stream is shut down".to_string(),
            ));
        }
        queue.jobs.push_back(job);
        self.work.notify_one();
        Ok(())
    }

    fn drain(&self) -> DeviceResult<()> {
        let mut queue = self.queue.lock()?;
        while queue.busy || !queue.jobs.is_empty() {
            queue = self.idle.wait(queue)?;
        }
        Ok(())
    }

    fn run_worker(self: &Arc<Self>) {
        loop {
            let job = {
                let mut queue = match self.queue.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        queue.busy = true;
                        break job;
                    }
                    if queue.shutdown {
                        return;
                    }
                    queue = match self.work.wait(queue) {
                        Ok(q) => q,
                        Err(_) => return,
                    };
                }
            };
            job();
            if let Ok(mut queue) = self.queue.lock() {
                queue.busy = false;
                if queue.jobs.is_empty() {
                    self.idle.notify_all();
                }
            }
        }
    }
}

#[derive(Default)]
struct EventFlag {
    pending: bool,
}

struct EventState {
    flag: Mutex<EventFlag>,
    done: Condvar,
}

impl EventState {
    fn new() -> Self {
        EventState {
            flag: Mutex::new(EventFlag::default()),
            done: Condvar::new(),
        }
    }
}

struct MemoryBook {
    /// Device allocations: address -> (layout, requested bytes).
    device: HashMap<u64, (Layout, usize)>,
    pinned: HashMap<u64, Layout>,
    device_used: usize,
}

/// Host implementation of [`DeviceRuntime`].
pub struct HostRuntime {
    capacity: usize,
    memory: Mutex<MemoryBook>,
    streams: Mutex<HashMap<u64, (Arc<StreamState>, Option<JoinHandle<()>>)>>,
    events: Mutex<HashMap<u64, Arc<EventState>>>,
    next_handle: AtomicU64,
}

impl HostRuntime {
    /// Create a host runtime with the default simulated capacity.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a host runtime with an explicit simulated device capacity.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        tracing::debug!(capacity, "HostRuntime: creating host device runtime");
        Arc::new(HostRuntime {
            capacity,
            memory: Mutex::new(MemoryBook {
                device: HashMap::new(),
                pinned: HashMap::new(),
                device_used: 0,
            }),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Simulated device bytes currently allocated (direct allocations).
    pub fn device_used(&self) -> usize {
        self.memory.lock().map(|m| m.device_used).unwrap_or(0)
    }

    /// Enqueue an arbitrary job on a stream. This is how the host primitive
    /// library runs compute on the compute stream.
    pub fn enqueue(
        &self,
        stream: StreamHandle,
        job: impl FnOnce() + Send + 'static,
    ) -> DeviceResult<()> {
        let state = self.stream_state(stream)?;
        state.push(Box::new(job))
    }

    fn stream_state(&self, stream: StreamHandle) -> DeviceResult<Arc<StreamState>> {
        let streams = self.streams.lock()?;
        streams
            .get(&stream.as_raw())
            .map(|(state, _)| Arc::clone(state))
            .ok_or_else(|| DeviceError::InvalidHandle(format!("stream {}", stream.as_raw())))
    }

    fn event_state(&self, event: EventHandle) -> DeviceResult<Arc<EventState>> {
        let events = self.events.lock()?;
        events
            .get(&event.as_raw())
            .map(Arc::clone)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("event {}", event.as_raw())))
    }

    fn raw_alloc(bytes: usize) -> DeviceResult<(u64, Layout)> {
        let layout = Layout::from_size_align(bytes.max(1), HOST_ALLOC_ALIGN)
            .map_err(|e| DeviceError::AllocationFailed(e.to_string()))?;
        // SAFETY: layout has non-zero size and a valid power-of-two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DeviceError::AllocationFailed(format!(
                "host allocation of {} bytes failed",
                bytes
            )));
        }
        Ok((ptr as u64, layout))
    }
}

impl DeviceRuntime for HostRuntime {
    fn total_memory(&self) -> DeviceResult<usize> {
        Ok(self.capacity)
    }

    fn alloc_device(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let mut memory = self.memory.lock()?;
        let free = self.capacity.saturating_sub(memory.device_used);
        if bytes > free {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                free,
            });
        }
        let (addr, layout) = Self::raw_alloc(bytes)?;
        memory.device.insert(addr, (layout, bytes));
        memory.device_used += bytes;
        tracing::trace!(bytes, addr, "HostRuntime: device alloc");
        Ok(DevicePtr::from_raw(addr))
    }

    fn free_device(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut memory = self.memory.lock()?;
        let (layout, bytes) = memory
            .device
            .remove(&ptr.as_raw())
            .ok_or_else(|| DeviceError::InvalidHandle(format!("device ptr {:#x}", ptr.as_raw())))?;
        memory.device_used = memory.device_used.saturating_sub(bytes);
        // SAFETY: the pointer came from `raw_alloc` with exactly this layout
        // and is removed from the book before deallocation.
        unsafe { dealloc(ptr.as_raw() as *mut u8, layout) };
        Ok(())
    }

    fn alloc_pinned(&self, bytes: usize) -> DeviceResult<PinnedPtr> {
        let (addr, layout) = Self::raw_alloc(bytes)?;
        self.memory.lock()?.pinned.insert(addr, layout);
        Ok(PinnedPtr::from_raw(addr))
    }

    fn free_pinned(&self, ptr: PinnedPtr) -> DeviceResult<()> {
        let layout = self
            .memory
            .lock()?
            .pinned
            .remove(&ptr.as_raw())
            .ok_or_else(|| DeviceError::InvalidHandle(format!("pinned ptr {:#x}", ptr.as_raw())))?;
        // SAFETY: same provenance argument as `free_device`.
        unsafe { dealloc(ptr.as_raw() as *mut u8, layout) };
        Ok(())
    }

    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(StreamState::new());
        let worker_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name(format!("gradforge-stream-{}", id))
            .spawn(move || worker_state.run_worker())
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;
        self.streams.lock()?.insert(id, (state, Some(handle)));
        tracing::debug!(id, "HostRuntime: stream created");
        Ok(StreamHandle::from_raw(id))
    }

    fn sync_stream(&self, stream: StreamHandle) -> DeviceResult<()> {
        self.stream_state(stream)?.drain()
    }

    fn create_event(&self) -> DeviceResult<EventHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.events.lock()?.insert(id, Arc::new(EventState::new()));
        Ok(EventHandle::from_raw(id))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DeviceResult<()> {
        let event_state = self.event_state(event)?;
        event_state.flag.lock()?.pending = true;
        let marker_state = Arc::clone(&event_state);
        self.enqueue(stream, move || {
            if let Ok(mut flag) = marker_state.flag.lock() {
                flag.pending = false;
                marker_state.done.notify_all();
            }
        })
    }

    fn sync_event(&self, event: EventHandle) -> DeviceResult<()> {
        let state = self.event_state(event)?;
        let mut flag = state.flag.lock()?;
        // A never-recorded event is complete immediately (HIP semantics).
        while flag.pending {
            flag = state.done.wait(flag)?;
        }
        Ok(())
    }

    fn copy_to_host_async(
        &self,
        dst: PinnedPtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DeviceResult<()> {
        let (dst_addr, src_addr) = (dst.as_raw(), src.as_raw());
        self.enqueue(stream, move || {
            // SAFETY: the schedule frees the source only after the
            // offload-done event (recorded behind this job) completes, and
            // the pinned destination lives until engine teardown.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_addr as *const u8,
                    dst_addr as *mut u8,
                    bytes,
                );
            }
        })
    }

    fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: PinnedPtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DeviceResult<()> {
        let (dst_addr, src_addr) = (dst.as_raw(), src.as_raw());
        self.enqueue(stream, move || {
            // SAFETY: the destination was allocated before this enqueue and
            // is not released until the consuming backward step, which waits
            // on the prefetch-ready semaphore chained behind this job.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_addr as *const u8,
                    dst_addr as *mut u8,
                    bytes,
                );
            }
        })
    }

    fn upload(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        if dst.is_null() {
            return Err(DeviceError::CopyFailed("upload to null pointer".to_string()));
        }
        // SAFETY: callers order synchronous copies against stream work; the
        // destination is a live allocation from this runtime.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_raw() as *mut u8, data.len());
        }
        Ok(())
    }

    fn download(&self, src: DevicePtr, out: &mut [u8]) -> DeviceResult<()> {
        if src.is_null() {
            return Err(DeviceError::CopyFailed(
                "download from null pointer".to_string(),
            ));
        }
        // SAFETY: same contract as `upload`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_raw() as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write_pinned(&self, dst: PinnedPtr, data: &[u8]) -> DeviceResult<()> {
        // SAFETY: pinned buffers are sized by the caller and live until
        // engine teardown.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_raw() as *mut u8, data.len());
        }
        Ok(())
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.streams.lock() {
            for (_, (state, handle)) in streams.iter_mut() {
                if let Ok(mut queue) = state.queue.lock() {
                    queue.shutdown = true;
                    state.work.notify_all();
                }
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
        }
        if let Ok(mut memory) = self.memory.lock() {
            for (addr, (layout, _)) in memory.device.drain() {
                // SAFETY: leaked allocations still have their recorded layout.
                unsafe { dealloc(addr as *mut u8, layout) };
            }
            for (addr, layout) in memory.pinned.drain() {
                // SAFETY: as above.
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }
}
