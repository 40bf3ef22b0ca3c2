//! Training engine
//!
//! [`TrainingEngine`] ties the core together: it builds registry metadata
//! from the layer specs, plans (offload set + locked algorithms + pool
//! size), materializes persistent tensors, initializes the suballocator at
//! the planned peak, and compiles the schedules into an executor. One
//! `step` call runs one mini-batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceRuntime;
use crate::dnn::{AlgoPreference, DnnLibrary, Precision, TensorLayout};
use crate::error::{GradForgeError, GradResult};
use crate::executor::{Executor, StepOutput, StepStats};
use crate::layers::{LayerRegistry, LayerSpec};
use crate::memory::Suballocator;
use crate::planner::{choose_plan, OffloadPolicy, Plan};

/// Parameter update rule. SGD is the only rule this runtime applies;
/// the enum exists so configurations name it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateRule {
    #[default]
    Sgd,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub precision: Precision,
    pub layout: TensorLayout,
    pub batch_size: usize,
    /// Input sample shape (C, H, W).
    pub input_shape: (usize, usize, usize),
    pub dropout_seed: u64,
    pub softmax_epsilon: f64,
    pub weight_stddev: f64,
    pub offload_policy: OffloadPolicy,
    pub algo_pref: AlgoPreference,
    pub update_rule: UpdateRule,
    /// Device budget override; `None` queries the runtime.
    pub device_capacity: Option<usize>,
}

impl TrainingConfig {
    pub fn new(batch_size: usize, input_shape: (usize, usize, usize)) -> Self {
        TrainingConfig {
            precision: Precision::Float32,
            layout: TensorLayout::Nchw,
            batch_size,
            input_shape,
            dropout_seed: 0x6772_6164,
            softmax_epsilon: 1e-8,
            weight_stddev: 0.01,
            offload_policy: OffloadPolicy::Dynamic,
            algo_pref: AlgoPreference::PerformanceOptimal,
            update_rule: UpdateRule::Sgd,
            device_capacity: None,
        }
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_offload_policy(mut self, policy: OffloadPolicy) -> Self {
        self.offload_policy = policy;
        self
    }

    pub fn with_algo_pref(mut self, pref: AlgoPreference) -> Self {
        self.algo_pref = pref;
        self
    }

    pub fn with_dropout_seed(mut self, seed: u64) -> Self {
        self.dropout_seed = seed;
        self
    }

    pub fn with_weight_stddev(mut self, stddev: f64) -> Self {
        self.weight_stddev = stddev;
        self
    }

    pub fn with_device_capacity(mut self, bytes: usize) -> Self {
        self.device_capacity = Some(bytes);
        self
    }
}

/// The assembled training runtime for one network.
pub struct TrainingEngine {
    registry: Arc<LayerRegistry>,
    runtime: Arc<dyn DeviceRuntime>,
    pool: Arc<Suballocator>,
    /// `Some` until teardown; the executor must drop before the registry
    /// releases its parameter tensors.
    executor: Option<Executor>,
}

impl std::fmt::Debug for TrainingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingEngine").finish_non_exhaustive()
    }
}

impl TrainingEngine {
    /// Build, plan, materialize, and compile. Fails with PlannerInfeasible
    /// when no candidate plan fits the device budget.
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        dnn: Arc<dyn DnnLibrary>,
        specs: &[LayerSpec],
        config: TrainingConfig,
    ) -> GradResult<Self> {
        let mut registry = LayerRegistry::build(
            specs,
            config.batch_size,
            config.input_shape,
            config.precision,
            config.layout,
            config.dropout_seed,
            config.weight_stddev,
            dnn.as_ref(),
        )?;

        let capacity = match config.device_capacity {
            Some(bytes) => bytes,
            None => runtime.total_memory()?,
        };

        // Plan against metadata only; nothing is allocated yet, so a
        // network whose parameters alone exceed the budget fails cleanly.
        let plan = choose_plan(
            &registry,
            dnn.as_ref(),
            &runtime,
            capacity,
            config.offload_policy,
            config.algo_pref,
        )?;
        tracing::info!(
            tier = %plan.tier,
            peak_bytes = plan.peak_bytes,
            offloaded = plan.offload_count(),
            persistent_bytes = registry.persistent_bytes(),
            "engine: plan selected"
        );

        registry.materialize(runtime.as_ref())?;
        dnn.prepare(&registry)?;
        let registry = Arc::new(registry);

        let pool = Suballocator::init(Arc::clone(&runtime), plan.peak_bytes)?;
        let executor = Executor::new(
            Arc::clone(&registry),
            plan,
            Arc::clone(&runtime),
            dnn,
            Arc::clone(&pool),
            config.softmax_epsilon,
        )?;

        Ok(TrainingEngine {
            registry,
            runtime,
            pool,
            executor: Some(executor),
        })
    }

    /// Run one mini-batch. Training applies SGD updates in place and
    /// returns the loss; inference skips offload and backward entirely and
    /// returns the correct count.
    pub fn step(
        &mut self,
        input: &[f32],
        labels: &[u32],
        learning_rate: f32,
        training: bool,
    ) -> GradResult<StepOutput> {
        self.executor_mut()?
            .step(input, labels, learning_rate, training)
    }

    pub fn plan(&self) -> &Plan {
        self.executor
            .as_ref()
            .expect("executor lives until teardown")
            .plan()
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// Pool accounting (peak bound and conservation checks).
    pub fn pool(&self) -> &Suballocator {
        &self.pool
    }

    /// Offload/prefetch counters from the most recent step.
    pub fn step_stats(&self) -> StepStats {
        self.executor
            .as_ref()
            .expect("executor lives until teardown")
            .step_stats()
    }

    fn executor_mut(&mut self) -> GradResult<&mut Executor> {
        self.executor
            .as_mut()
            .ok_or_else(|| GradForgeError::Internal("step after teardown".into()))
    }
}

impl Drop for TrainingEngine {
    fn drop(&mut self) {
        // Executor first: it shares the registry and the pool.
        drop(self.executor.take());
        if let Err(err) = self.pool.shutdown() {
            tracing::warn!(%err, "engine: pool shutdown failed");
        }
        if let Some(registry) = Arc::get_mut(&mut self.registry) {
            registry.release(self.runtime.as_ref());
        } else {
            tracing::warn!("engine: registry still shared at teardown, parameters leak");
        }
    }
}
