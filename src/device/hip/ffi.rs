//! HIP FFI bindings
//!
//! Bound to the ROCm HIP API. All functions are used through the safe
//! wrappers in this module's siblings; the dead_code allowance is needed
//! because FFI symbols appear unused to the compiler.

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;
    pub fn hipMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: i32,
        stream: *mut c_void,
    ) -> i32;
    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipEventDestroy(event: *mut c_void) -> i32;
    pub fn hipEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn hipEventSynchronize(event: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
}

/// HIP memory copy kinds
pub const HIP_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: i32 = 2;

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// Event flag to disable timing data collection (sync-only events)
pub const HIP_EVENT_DISABLE_TIMING: u32 = 0x1;

/// Default pinned-allocation flags
pub const HIP_HOST_MALLOC_DEFAULT: u32 = 0x0;
