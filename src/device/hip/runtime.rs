//! HIP implementation of the device-runtime seam

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::hip::event::HipEvent;
use crate::device::hip::stream::HipStream;
use crate::device::hip::{ffi, memory};
use crate::device::{
    DeviceError, DevicePtr, DeviceResult, DeviceRuntime, EventHandle, PinnedPtr, StreamHandle,
};

/// HIP device runtime. Device pointers are real device addresses; stream
/// and event handles index into internal tables so the rest of the crate
/// stays FFI-free.
pub struct HipRuntime {
    streams: Mutex<HashMap<u64, Arc<HipStream>>>,
    events: Mutex<HashMap<u64, Arc<HipEvent>>>,
    next_handle: AtomicU64,
    total_memory: usize,
}

impl HipRuntime {
    /// Initialize HIP and select a device.
    pub fn new(device_id: i32) -> DeviceResult<Arc<Self>> {
        let result = unsafe { ffi::hipInit(0) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::InitializationFailed(format!(
                "hipInit failed with code {}",
                result
            )));
        }
        let result = unsafe { ffi::hipSetDevice(device_id) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::InitializationFailed(format!(
                "hipSetDevice({}) failed with code {}",
                device_id, result
            )));
        }
        let (free, total) = memory::memory_info()?;
        tracing::info!(device_id, free, total, "hip: runtime initialized");
        Ok(Arc::new(HipRuntime {
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            total_memory: total,
        }))
    }

    fn stream(&self, handle: StreamHandle) -> DeviceResult<Arc<HipStream>> {
        self.streams
            .lock()?
            .get(&handle.as_raw())
            .map(Arc::clone)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("stream {}", handle.as_raw())))
    }

    fn event(&self, handle: EventHandle) -> DeviceResult<Arc<HipEvent>> {
        self.events
            .lock()?
            .get(&handle.as_raw())
            .map(Arc::clone)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("event {}", handle.as_raw())))
    }
}

impl DeviceRuntime for HipRuntime {
    fn total_memory(&self) -> DeviceResult<usize> {
        Ok(self.total_memory)
    }

    fn alloc_device(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        memory::device_malloc(bytes).map(|raw| DevicePtr::from_raw(raw as u64))
    }

    fn free_device(&self, ptr: DevicePtr) -> DeviceResult<()> {
        memory::device_free(ptr.as_raw() as *mut std::ffi::c_void)
    }

    fn alloc_pinned(&self, bytes: usize) -> DeviceResult<PinnedPtr> {
        memory::pinned_malloc(bytes).map(|raw| PinnedPtr::from_raw(raw as u64))
    }

    fn free_pinned(&self, ptr: PinnedPtr) -> DeviceResult<()> {
        memory::pinned_free(ptr.as_raw() as *mut std::ffi::c_void)
    }

    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.streams.lock()?.insert(id, Arc::new(HipStream::new()?));
        Ok(StreamHandle::from_raw(id))
    }

    fn sync_stream(&self, stream: StreamHandle) -> DeviceResult<()> {
        self.stream(stream)?.synchronize()
    }

    fn create_event(&self) -> DeviceResult<EventHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.events.lock()?.insert(id, Arc::new(HipEvent::new()?));
        Ok(EventHandle::from_raw(id))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DeviceResult<()> {
        let stream = self.stream(stream)?;
        self.event(event)?.record(&stream)
    }

    fn sync_event(&self, event: EventHandle) -> DeviceResult<()> {
        self.event(event)?.synchronize()
    }

    fn copy_to_host_async(
        &self,
        dst: PinnedPtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DeviceResult<()> {
        let stream = self.stream(stream)?;
        let result = unsafe {
            ffi::hipMemcpyAsync(
                dst.as_raw() as *mut std::ffi::c_void,
                src.as_raw() as *const std::ffi::c_void,
                bytes,
                ffi::HIP_MEMCPY_DEVICE_TO_HOST,
                stream.as_ptr(),
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::CopyFailed(format!(
                "hipMemcpyAsync D2H failed with code {} ({} bytes)",
                result, bytes
            )));
        }
        Ok(())
    }

    fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: PinnedPtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DeviceResult<()> {
        let stream = self.stream(stream)?;
        let result = unsafe {
            ffi::hipMemcpyAsync(
                dst.as_raw() as *mut std::ffi::c_void,
                src.as_raw() as *const std::ffi::c_void,
                bytes,
                ffi::HIP_MEMCPY_HOST_TO_DEVICE,
                stream.as_ptr(),
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::CopyFailed(format!(
                "hipMemcpyAsync H2D failed with code {} ({} bytes)",
                result, bytes
            )));
        }
        Ok(())
    }

    fn upload(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        let result = unsafe {
            ffi::hipMemcpy(
                dst.as_raw() as *mut std::ffi::c_void,
                data.as_ptr() as *const std::ffi::c_void,
                data.len(),
                ffi::HIP_MEMCPY_HOST_TO_DEVICE,
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::CopyFailed(format!(
                "hipMemcpy H2D failed with code {}",
                result
            )));
        }
        Ok(())
    }

    fn download(&self, src: DevicePtr, out: &mut [u8]) -> DeviceResult<()> {
        let result = unsafe {
            ffi::hipMemcpy(
                out.as_mut_ptr() as *mut std::ffi::c_void,
                src.as_raw() as *const std::ffi::c_void,
                out.len(),
                ffi::HIP_MEMCPY_DEVICE_TO_HOST,
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::CopyFailed(format!(
                "hipMemcpy D2H failed with code {}",
                result
            )));
        }
        Ok(())
    }

    fn write_pinned(&self, dst: PinnedPtr, data: &[u8]) -> DeviceResult<()> {
        // Pinned memory is host memory; a plain copy suffices.
        // SAFETY: the buffer was sized by the caller at allocation time.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_raw() as *mut u8, data.len());
        }
        Ok(())
    }
}
