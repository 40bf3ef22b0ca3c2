//! Device runtime boundary
//!
//! The executor, planner, and suballocator talk to the accelerator through
//! the [`DeviceRuntime`] trait: direct and pinned allocation, two kinds of
//! handles for asynchronous work (streams and events), async copies, and a
//! capacity query. Two implementations exist:
//!
//! - [`host::HostRuntime`] - always compiled; device memory is host memory
//!   and each stream is a FIFO worker thread, so cross-stream overlap and
//!   event ordering are real rather than simulated,
//! - `hip::HipRuntime` (feature `rocm`) - HIP FFI against a ROCm install.
//!
//! All handle types are opaque, `Copy`, and non-owning; the allocating
//! runtime owns the memory and the lifetime is bounded by explicit
//! alloc/free calls.

pub mod host;

#[cfg(feature = "rocm")]
pub mod hip;

use thiserror::Error;

/// Device runtime error types.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("device allocation failed: {0}")]
    AllocationFailed(String),
    #[error("device out of memory: requested {requested}, free {free}")]
    OutOfMemory { requested: usize, free: usize },
    #[error("pinned host allocation failed: {0}")]
    PinnedAllocationFailed(String),
    #[error("memory copy failed: {0}")]
    CopyFailed(String),
    #[error("stream error: {0}")]
    StreamError(String),
    #[error("event error: {0}")]
    EventError(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("device initialization failed: {0}")]
    InitializationFailed(String),
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(err.to_string())
    }
}

/// Device runtime result type.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Non-owning handle to a device allocation.
///
/// The raw value is the device address (or the host address, for the host
/// runtime). Ownership lives in the runtime that produced the handle; a
/// `DevicePtr` held past the matching free is dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn from_raw(raw: u64) -> Self {
        DevicePtr(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Non-owning handle to a pinned (page-locked) host allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinnedPtr(u64);

impl PinnedPtr {
    pub fn from_raw(raw: u64) -> Self {
        PinnedPtr(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Handle to an accelerator command queue. FIFO within a stream; streams
/// execute concurrently with respect to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub fn from_raw(raw: u64) -> Self {
        StreamHandle(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Handle to an accelerator event recorded on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

impl EventHandle {
    pub fn from_raw(raw: u64) -> Self {
        EventHandle(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// The accelerator runtime seam.
///
/// Stream handles are single-producer: only the main thread enqueues work
/// or records events. Worker threads may only wait on events
/// ([`DeviceRuntime::sync_event`]).
pub trait DeviceRuntime: Send + Sync {
    /// Total device memory in bytes.
    fn total_memory(&self) -> DeviceResult<usize>;

    /// Allocate device memory directly (persistent tensors, pool backing).
    fn alloc_device(&self, bytes: usize) -> DeviceResult<DevicePtr>;

    /// Free a direct device allocation.
    fn free_device(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Allocate pinned host memory (offload shadows, staging buffers).
    fn alloc_pinned(&self, bytes: usize) -> DeviceResult<PinnedPtr>;

    /// Free a pinned host allocation.
    fn free_pinned(&self, ptr: PinnedPtr) -> DeviceResult<()>;

    /// Create a command stream.
    fn create_stream(&self) -> DeviceResult<StreamHandle>;

    /// Block the host until every operation enqueued on the stream retired.
    fn sync_stream(&self, stream: StreamHandle) -> DeviceResult<()>;

    /// Create an event (synchronization only, no timing).
    fn create_event(&self) -> DeviceResult<EventHandle>;

    /// Record the event on the stream: the event completes once every
    /// operation enqueued before the record has retired.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DeviceResult<()>;

    /// Block until the event completes. Waiting on a never-recorded event
    /// returns immediately (HIP/CUDA semantics).
    fn sync_event(&self, event: EventHandle) -> DeviceResult<()>;

    /// Enqueue an async device-to-pinned-host copy on the stream.
    fn copy_to_host_async(
        &self,
        dst: PinnedPtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DeviceResult<()>;

    /// Enqueue an async pinned-host-to-device copy on the stream.
    fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: PinnedPtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DeviceResult<()>;

    /// Synchronous host-to-device copy. The caller is responsible for
    /// ordering against in-flight stream work touching the same buffer.
    fn upload(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()>;

    /// Synchronous device-to-host copy. Same ordering contract as `upload`.
    fn download(&self, src: DevicePtr, out: &mut [u8]) -> DeviceResult<()>;

    /// Copy host data into a pinned buffer (staging).
    fn write_pinned(&self, dst: PinnedPtr, data: &[u8]) -> DeviceResult<()>;
}
