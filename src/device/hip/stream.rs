//! HIP stream wrapper

use std::ptr;

use crate::device::hip::ffi;
use crate::device::{DeviceError, DeviceResult};

// SAFETY: HipStream only contains a raw pointer; the runtime serializes
// access (streams are single-producer from the main thread).
// NOTE: no Clone - cloning the raw pointer would double-destroy.
unsafe impl Send for HipStream {}
unsafe impl Sync for HipStream {}

/// HIP stream wrapper
#[repr(C)]
#[derive(Debug)]
pub struct HipStream {
    stream: *mut std::ffi::c_void,
}

impl HipStream {
    /// Create a new HIP stream
    pub fn new() -> DeviceResult<Self> {
        tracing::debug!("HipStream::new: creating HIP stream");
        let mut stream: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::hipStreamCreate(&mut stream) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::StreamError(format!(
                "hipStreamCreate failed with code {}",
                result
            )));
        }
        if stream.is_null() {
            return Err(DeviceError::StreamError(
                "hipStreamCreate returned null pointer".to_string(),
            ));
        }
        Ok(HipStream { stream })
    }

    /// Block the host until the stream drains
    pub fn synchronize(&self) -> DeviceResult<()> {
        let result = unsafe { ffi::hipStreamSynchronize(self.stream) };
        if result != ffi::HIP_SUCCESS {
            Err(DeviceError::StreamError(format!(
                "hipStreamSynchronize failed with code {}",
                result
            )))
        } else {
            Ok(())
        }
    }

    /// Raw stream pointer for FFI calls
    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.stream
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if !self.stream.is_null() {
            unsafe {
                ffi::hipStreamDestroy(self.stream);
            }
        }
    }
}
