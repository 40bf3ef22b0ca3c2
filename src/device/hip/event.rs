//! HIP event wrapper for cross-stream synchronization

use std::ptr;

use crate::device::hip::ffi;
use crate::device::hip::stream::HipStream;
use crate::device::{DeviceError, DeviceResult};

// SAFETY: HipEvent only contains a raw pointer; records happen on the main
// thread, waits from worker threads, and HIP serializes the rest.
// NOTE: no Clone - cloning the raw pointer would double-destroy.
unsafe impl Send for HipEvent {}
unsafe impl Sync for HipEvent {}

/// HIP event wrapper. Created with timing disabled: these events exist for
/// the offload-done / prefetch-done chains, not for profiling.
#[repr(C)]
#[derive(Debug)]
pub struct HipEvent {
    event: *mut std::ffi::c_void,
}

impl HipEvent {
    pub fn new() -> DeviceResult<Self> {
        let mut event: *mut std::ffi::c_void = ptr::null_mut();
        let result =
            unsafe { ffi::hipEventCreateWithFlags(&mut event, ffi::HIP_EVENT_DISABLE_TIMING) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventError(format!(
                "hipEventCreateWithFlags failed with code {}",
                result
            )));
        }
        if event.is_null() {
            return Err(DeviceError::EventError(
                "hipEventCreateWithFlags returned null pointer".to_string(),
            ));
        }
        Ok(HipEvent { event })
    }

    /// Record this event in the given stream
    pub fn record(&self, stream: &HipStream) -> DeviceResult<()> {
        let result = unsafe { ffi::hipEventRecord(self.event, stream.as_ptr()) };
        if result != ffi::HIP_SUCCESS {
            Err(DeviceError::EventError(format!(
                "hipEventRecord failed with code {}",
                result
            )))
        } else {
            Ok(())
        }
    }

    /// Block the calling thread until every operation captured by the last
    /// record has completed. Never-recorded events complete immediately.
    pub fn synchronize(&self) -> DeviceResult<()> {
        let result = unsafe { ffi::hipEventSynchronize(self.event) };
        if result != ffi::HIP_SUCCESS {
            Err(DeviceError::EventError(format!(
                "hipEventSynchronize failed with code {}",
                result
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for HipEvent {
    fn drop(&mut self) {
        if !self.event.is_null() {
            unsafe {
                ffi::hipEventDestroy(self.event);
            }
        }
    }
}
