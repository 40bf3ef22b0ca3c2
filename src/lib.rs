//! gradforge - GPU training runtime with virtualized device memory
//!
//! Trains straight-line convolutional networks larger than accelerator
//! memory: per-layer forward activations are offloaded to pinned host
//! memory during the forward sweep and prefetched just in time during the
//! backward sweep. Compute, offload, and prefetch overlap across two
//! asynchronous streams, coordinated by detached worker threads and a
//! mutex-protected suballocator with a wait/notify free list.

#![allow(clippy::too_many_arguments)] // layer primitives take many tensor handles

pub mod device;
pub mod dnn;
pub mod engine;
pub mod error;
pub mod executor;
pub mod layers;
pub mod logging;
pub mod memory;
pub mod planner;

pub use device::host::HostRuntime;
pub use device::DeviceRuntime;
pub use dnn::host::HostDnn;
pub use dnn::{AlgoPreference, DnnLibrary, Precision, TensorLayout};
pub use engine::{TrainingConfig, TrainingEngine, UpdateRule};
pub use error::{ErrorCategory, GradForgeError, GradResult};
pub use executor::{Executor, StepOutput, StepStats};
pub use layers::{LayerKind, LayerRegistry, LayerSpec};
pub use logging::init_logging_default;
pub use memory::Suballocator;
pub use planner::{choose_plan, OffloadPolicy, Plan};

#[cfg(feature = "rocm")]
pub use device::hip::HipRuntime;
