//! Shared helpers for the integration suites.
#![allow(dead_code)] // each integration binary uses a subset

use std::sync::Arc;

use gradforge::device::host::HostRuntime;
use gradforge::dnn::host::HostDnn;
use gradforge::dnn::AlgoPreference;
use gradforge::error::GradResult;
use gradforge::layers::{LayerRegistry, LayerSpec};
use gradforge::planner::{analytic, training_steps};
use gradforge::{DeviceRuntime, DnnLibrary, TrainingConfig, TrainingEngine};

/// Generous simulated device so only `device_capacity` constrains plans.
pub const HOST_CAPACITY: usize = 1 << 30;

pub struct TestBed {
    pub runtime: Arc<HostRuntime>,
    pub dnn: Arc<HostDnn>,
}

impl TestBed {
    pub fn new() -> Self {
        let runtime = HostRuntime::with_capacity(HOST_CAPACITY);
        let dnn = HostDnn::new(Arc::clone(&runtime));
        TestBed { runtime, dnn }
    }

    pub fn engine(&self, specs: &[LayerSpec], config: TrainingConfig) -> GradResult<TrainingEngine> {
        TrainingEngine::new(
            Arc::clone(&self.runtime) as Arc<dyn DeviceRuntime>,
            Arc::clone(&self.dnn) as Arc<dyn DnnLibrary>,
            specs,
            config,
        )
    }

    pub fn registry(&self, specs: &[LayerSpec], config: &TrainingConfig) -> LayerRegistry {
        LayerRegistry::build(
            specs,
            config.batch_size,
            config.input_shape,
            config.precision,
            config.layout,
            config.dropout_seed,
            config.weight_stddev,
            self.dnn.as_ref(),
        )
        .expect("test stack must build")
    }

    /// Activation/gradient-only peak for an offload bitmap: the
    /// memory-optimal hard walk under an unconstrained budget picks the
    /// zero-workspace algorithms, leaving pure tensor residency.
    pub fn tensor_peak(&self, registry: &LayerRegistry, offload: &[bool]) -> usize {
        let steps = training_steps(registry, offload);
        analytic(
            registry,
            self.dnn.as_ref(),
            &steps,
            AlgoPreference::MemoryOptimal,
            true,
            usize::MAX,
        )
        .expect("analytic walk")
        .expect("memory-optimal walk is always feasible under a huge budget")
        .peak_bytes
    }

    /// Peak of the performance-optimal walk under an unconstrained budget
    /// (greedy workspaces included).
    pub fn perf_peak(&self, registry: &LayerRegistry, offload: &[bool]) -> usize {
        let steps = training_steps(registry, offload);
        analytic(
            registry,
            self.dnn.as_ref(),
            &steps,
            AlgoPreference::PerformanceOptimal,
            true,
            usize::MAX,
        )
        .expect("analytic walk")
        .expect("performance walk is always feasible under a huge budget")
        .peak_bytes
    }
}

/// The offload set the conv-only policy produces (mirrors the planner's
/// exemptions: never the last non-Activation/Softmax layer).
pub fn conv_only_bitmap(registry: &LayerRegistry) -> Vec<bool> {
    let last = registry.last_offloadable();
    (0..registry.len())
        .map(|i| Some(i) != last && registry.layer(i).kind.is_convolution())
        .collect()
}

/// The offload set the all policy produces.
pub fn all_bitmap(registry: &LayerRegistry) -> Vec<bool> {
    let last = registry.last_offloadable();
    (0..registry.len())
        .map(|i| Some(i) != last && !registry.layer(i).kind.is_activation_like())
        .collect()
}

/// Deterministic pseudo-random batch: values in (-1, 1).
pub fn batch_input(elements: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..elements)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Cycling labels 0..classes.
pub fn batch_labels(batch: usize, classes: usize) -> Vec<u32> {
    (0..batch).map(|i| (i % classes) as u32).collect()
}
