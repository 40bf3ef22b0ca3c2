//! HIP memory helpers: device allocations and pinned host buffers

use std::ptr;

use crate::device::hip::ffi;
use crate::device::{DeviceError, DeviceResult};

/// Allocate raw device memory
pub fn device_malloc(bytes: usize) -> DeviceResult<*mut std::ffi::c_void> {
    if bytes == 0 {
        return Err(DeviceError::AllocationFailed(
            "zero-size device allocation".to_string(),
        ));
    }
    let mut raw: *mut std::ffi::c_void = ptr::null_mut();
    let result = unsafe { ffi::hipMalloc(&mut raw, bytes) };
    if result != ffi::HIP_SUCCESS {
        return Err(DeviceError::AllocationFailed(format!(
            "hipMalloc failed with code {} for {} bytes",
            result, bytes
        )));
    }
    if raw.is_null() {
        return Err(DeviceError::AllocationFailed(format!(
            "hipMalloc returned null pointer for {} bytes",
            bytes
        )));
    }
    tracing::trace!(bytes, ptr = ?raw, "hip: device alloc");
    Ok(raw)
}

/// Free raw device memory
pub fn device_free(raw: *mut std::ffi::c_void) -> DeviceResult<()> {
    let result = unsafe { ffi::hipFree(raw) };
    if result != ffi::HIP_SUCCESS {
        return Err(DeviceError::AllocationFailed(format!(
            "hipFree failed with code {}",
            result
        )));
    }
    Ok(())
}

/// Allocate pinned (page-locked) host memory for async transfers
pub fn pinned_malloc(bytes: usize) -> DeviceResult<*mut std::ffi::c_void> {
    let mut raw: *mut std::ffi::c_void = ptr::null_mut();
    let result =
        unsafe { ffi::hipHostMalloc(&mut raw, bytes.max(1), ffi::HIP_HOST_MALLOC_DEFAULT) };
    if result != ffi::HIP_SUCCESS {
        return Err(DeviceError::PinnedAllocationFailed(format!(
            "hipHostMalloc failed with code {} for {} bytes",
            result, bytes
        )));
    }
    if raw.is_null() {
        return Err(DeviceError::PinnedAllocationFailed(format!(
            "hipHostMalloc returned null pointer for {} bytes",
            bytes
        )));
    }
    Ok(raw)
}

/// Free pinned host memory
pub fn pinned_free(raw: *mut std::ffi::c_void) -> DeviceResult<()> {
    let result = unsafe { ffi::hipHostFree(raw) };
    if result != ffi::HIP_SUCCESS {
        return Err(DeviceError::PinnedAllocationFailed(format!(
            "hipHostFree failed with code {}",
            result
        )));
    }
    Ok(())
}

/// Free and total device memory in bytes
pub fn memory_info() -> DeviceResult<(usize, usize)> {
    let mut free = 0usize;
    let mut total = 0usize;
    let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
    if result != ffi::HIP_SUCCESS {
        return Err(DeviceError::InitializationFailed(format!(
            "hipMemGetInfo failed with code {}",
            result
        )));
    }
    Ok((free, total))
}
