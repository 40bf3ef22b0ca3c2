//! HIP device runtime (ROCm), enabled with the `rocm` feature

pub mod event;
pub mod ffi;
pub mod memory;
pub mod runtime;
pub mod stream;

pub use event::HipEvent;
pub use runtime::HipRuntime;
pub use stream::HipStream;
