//! Layer-sequence executor
//!
//! Runs one mini-batch of forward + backward by interpreting the compiled
//! schedule: primitive kernels go to the compute stream, device<->host
//! copies to the memory stream, and cross-stream coordination runs through
//! per-layer events, detached worker threads, and host semaphores.
//!
//! Offload chain (forward, per offloaded layer): async D2H copy on the
//! memory stream -> offload-done event -> detached worker waits on the
//! event, frees the device activation through the suballocator, posts the
//! offload-sync semaphore. Prefetch chain (backward) mirrors it: pool
//! alloc -> async H2D copy -> prefetch-done event -> worker posts
//! prefetch-ready, which the consuming backward step blocks on.

pub mod sync;

pub use sync::Semaphore;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{DevicePtr, DeviceRuntime, EventHandle, PinnedPtr, StreamHandle};
use crate::dnn::{DnnLibrary, Precision};
use crate::error::{GradForgeError, GradResult};
use crate::layers::LayerRegistry;
use crate::memory::{align_up, SlotTable, Suballocator};
use crate::planner::{inference_steps, training_steps, PassDirection, Plan, Step};

/// Result of one mini-batch step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// Epsilon-clamped cross-entropy (training and inference).
    pub loss: f64,
    /// Argmax matches against the label vector.
    pub correct: usize,
}

/// Per-step offload/prefetch counters (testing and diagnostics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub offload_frees: usize,
    pub prefetches: usize,
}

pub struct Executor {
    registry: Arc<LayerRegistry>,
    plan: Plan,
    runtime: Arc<dyn DeviceRuntime>,
    dnn: Arc<dyn DnnLibrary>,
    pool: Arc<Suballocator>,
    compute: StreamHandle,
    memory: StreamHandle,
    offload_events: Vec<EventHandle>,
    prefetch_events: Vec<EventHandle>,
    offload_sync: Vec<Arc<Semaphore>>,
    prefetch_ready: Vec<Arc<Semaphore>>,
    /// Pinned host shadows for offloaded layers (index 0 uses the staging
    /// buffer instead).
    shadows: Vec<Option<PinnedPtr>>,
    /// Pinned staging for the input batch; doubles as layer 0's shadow.
    staging: PinnedPtr,
    /// Shared with the offload free-workers.
    activations: Arc<Mutex<SlotTable<DevicePtr>>>,
    /// Main-thread only.
    grads: SlotTable<DevicePtr>,
    workspaces: Vec<Option<(DevicePtr, usize)>>,
    training_schedule: Vec<Step>,
    inference_schedule: Vec<Step>,
    softmax_epsilon: f64,
    offload_free_count: Arc<AtomicUsize>,
    prefetch_count: Arc<AtomicUsize>,
}

impl Executor {
    pub fn new(
        registry: Arc<LayerRegistry>,
        plan: Plan,
        runtime: Arc<dyn DeviceRuntime>,
        dnn: Arc<dyn DnnLibrary>,
        pool: Arc<Suballocator>,
        softmax_epsilon: f64,
    ) -> GradResult<Self> {
        let l = registry.len();
        let compute = runtime.create_stream()?;
        let memory = runtime.create_stream()?;
        dnn.attach_stream(compute)?;

        let mut offload_events = Vec::with_capacity(l);
        let mut prefetch_events = Vec::with_capacity(l);
        let mut offload_sync = Vec::with_capacity(l);
        let mut prefetch_ready = Vec::with_capacity(l);
        let mut shadows = Vec::with_capacity(l);
        for i in 0..l {
            offload_events.push(runtime.create_event()?);
            prefetch_events.push(runtime.create_event()?);
            offload_sync.push(Arc::new(Semaphore::new()));
            prefetch_ready.push(Arc::new(Semaphore::new()));
            // Offloaded layers get a pinned host shadow sized for their
            // forward input; layer 0 reuses the input staging buffer.
            let shadow = if plan.offload[i] && i > 0 {
                Some(runtime.alloc_pinned(registry.activation_bytes(i))?)
            } else {
                None
            };
            shadows.push(shadow);
        }
        let staging = runtime.alloc_pinned(registry.activation_bytes(0))?;

        let training_schedule = training_steps(&registry, &plan.offload);
        let inference_schedule = inference_steps(&registry);

        tracing::debug!(
            layers = l,
            offloaded = plan.offload_count(),
            peak_bytes = plan.peak_bytes,
            "executor: ready"
        );

        Ok(Executor {
            activations: Arc::new(Mutex::new(SlotTable::new(l + 1))),
            grads: SlotTable::new(l + 1),
            workspaces: vec![None; l],
            registry,
            plan,
            runtime,
            dnn,
            pool,
            compute,
            memory,
            offload_events,
            prefetch_events,
            offload_sync,
            prefetch_ready,
            shadows,
            staging,
            training_schedule,
            inference_schedule,
            softmax_epsilon,
            offload_free_count: Arc::new(AtomicUsize::new(0)),
            prefetch_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Counters from the most recent step.
    pub fn step_stats(&self) -> StepStats {
        StepStats {
            offload_frees: self.offload_free_count.load(Ordering::Relaxed),
            prefetches: self.prefetch_count.load(Ordering::Relaxed),
        }
    }

    /// Run one mini-batch. `input` is the host-side batch in logical
    /// (N,C,H,W) order; `labels` has one class index per sample.
    pub fn step(
        &mut self,
        input: &[f32],
        labels: &[u32],
        learning_rate: f32,
        training: bool,
    ) -> GradResult<StepOutput> {
        let expected = self.registry.activation_shape(0).elements();
        if input.len() != expected {
            return Err(GradForgeError::InvalidConfiguration(format!(
                "input batch has {} elements, expected {}",
                input.len(),
                expected
            )));
        }
        if labels.len() != self.registry.batch() {
            return Err(GradForgeError::InvalidConfiguration(format!(
                "label vector has {} entries, expected {}",
                labels.len(),
                self.registry.batch()
            )));
        }
        let classes = self.registry.num_classes() as u32;
        if let Some(bad) = labels.iter().find(|y| **y >= classes) {
            return Err(GradForgeError::InvalidConfiguration(format!(
                "label {} out of range for {} classes",
                bad, classes
            )));
        }
        if training
            && !matches!(
                self.registry.layer(self.registry.len() - 1).kind,
                crate::layers::LayerKind::Softmax
            )
        {
            return Err(GradForgeError::InvalidNetwork(
                "training requires a terminal softmax layer".into(),
            ));
        }

        self.offload_free_count.store(0, Ordering::Relaxed);
        self.prefetch_count.store(0, Ordering::Relaxed);
        self.runtime
            .write_pinned(self.staging, &self.to_precision_bytes(input))?;

        let schedule = if training {
            self.training_schedule.clone()
        } else {
            self.inference_schedule.clone()
        };

        let mut output = StepOutput {
            loss: 0.0,
            correct: 0,
        };
        for step in &schedule {
            self.interpret(*step, labels, learning_rate, training, &mut output)?;
        }
        Ok(output)
    }

    fn interpret(
        &mut self,
        step: Step,
        labels: &[u32],
        learning_rate: f32,
        training: bool,
        output: &mut StepOutput,
    ) -> GradResult<()> {
        match step {
            Step::AllocActivation { index } => {
                let bytes = self.registry.activation_bytes(index);
                let ptr = self.pool.alloc(bytes)?;
                self.activations
                    .lock()?
                    .set_owned(index, ptr, align_up(bytes));
            }
            Step::AliasActivation { dst, src } => self.activations.lock()?.alias(dst, src),
            Step::AllocGrad { index } => {
                let bytes = self.registry.activation_bytes(index);
                let ptr = self.pool.alloc(bytes)?;
                self.grads.set_owned(index, ptr, align_up(bytes));
            }
            Step::AliasGrad { dst, src } => self.grads.alias(dst, src),
            Step::AllocWorkspace { layer, direction } => {
                let bytes = self
                    .plan
                    .conv_algos
                    .get(layer)
                    .and_then(|c| c.as_ref())
                    .map(|c| match direction {
                        PassDirection::Forward => c.forward_workspace(),
                        PassDirection::Backward => c.backward_workspace(),
                    })
                    .unwrap_or(0);
                if bytes > 0 {
                    let ptr = self.pool.alloc(bytes)?;
                    self.workspaces[layer] = Some((ptr, bytes));
                }
            }
            Step::FreeWorkspace { layer } => {
                if let Some((ptr, _)) = self.workspaces[layer].take() {
                    self.pool.free(ptr)?;
                }
            }
            Step::StageInput => {
                let act0 = self.activation_ptr(0)?;
                let bytes = self.registry.activation_bytes(0);
                self.runtime
                    .copy_to_device_async(act0, self.staging, bytes, self.memory)?;
                self.runtime.sync_stream(self.memory)?;
            }
            Step::OffloadOut { layer } => {
                let shadow = self.shadows[layer].ok_or_else(|| {
                    GradForgeError::Invariant(format!("layer {} offloaded without a shadow", layer))
                })?;
                let src = self.activation_ptr(layer)?;
                let bytes = self.registry.activation_bytes(layer);
                self.runtime
                    .copy_to_host_async(shadow, src, bytes, self.memory)
                    .map_err(|e| GradForgeError::FatalCopy {
                        layer,
                        reason: e.to_string(),
                    })?;
                self.runtime.record_event(self.offload_events[layer], self.memory)?;
            }
            Step::Forward {
                layer,
                fused_softmax,
            } => {
                let input = self.activation_ptr(layer)?;
                let out = self.activation_ptr(layer + 1)?;
                let algo = self.plan.conv_algos[layer].map(|c| c.fwd.algo);
                self.registry.forward(
                    self.dnn.as_ref(),
                    layer,
                    input,
                    out,
                    self.workspaces[layer],
                    algo,
                    training,
                )?;
                if let Some(softmax) = fused_softmax {
                    let sm_in = self.activation_ptr(softmax)?;
                    let sm_out = self.activation_ptr(softmax + 1)?;
                    self.registry.forward(
                        self.dnn.as_ref(),
                        softmax,
                        sm_in,
                        sm_out,
                        None,
                        None,
                        training,
                    )?;
                }
            }
            Step::Backward { layer } => {
                let fwd_input = self.activation_ptr(layer)?;
                let fwd_output = self.activation_ptr(layer + 1)?;
                let grad_output = self.grads.get(layer + 1).ok_or_else(|| {
                    GradForgeError::Invariant(format!("missing grad[{}]", layer + 1))
                })?;
                let grad_input = if layer > 0 { self.grads.get(layer) } else { None };
                let algos = self.plan.conv_algos[layer]
                    .map(|c| (c.bwd_filter.algo, c.bwd_data.algo));
                self.registry.backward(
                    self.dnn.as_ref(),
                    layer,
                    fwd_input,
                    fwd_output,
                    grad_output,
                    grad_input,
                    self.workspaces[layer],
                    algos,
                    learning_rate,
                )?;
            }
            Step::SyncCompute => self.runtime.sync_stream(self.compute)?,
            Step::SpawnOffloadFree { layer } => {
                let runtime = Arc::clone(&self.runtime);
                let pool = Arc::clone(&self.pool);
                let activations = Arc::clone(&self.activations);
                let semaphore = Arc::clone(&self.offload_sync[layer]);
                let counter = Arc::clone(&self.offload_free_count);
                let event = self.offload_events[layer];
                // Detached on purpose: the semaphore is the join point.
                std::thread::spawn(move || {
                    if let Err(err) = runtime.sync_event(event) {
                        tracing::error!(%err, layer, "offload worker: event wait failed");
                    }
                    let released = activations
                        .lock()
                        .ok()
                        .and_then(|mut table| table.release(layer));
                    if let Some((ptr, _)) = released {
                        match pool.free(ptr) {
                            Ok(()) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                tracing::error!(%err, layer, "offload worker: free failed")
                            }
                        }
                    }
                    semaphore.post();
                });
            }
            Step::AwaitOffloads => {
                for layer in 0..self.registry.len() {
                    if self.plan.offload[layer] {
                        self.offload_sync[layer].wait();
                    }
                }
            }
            Step::WaitPrefetch { layer } => self.prefetch_ready[layer].wait(),
            Step::BeginPrefetch { layer } => {
                let bytes = self.registry.activation_bytes(layer);
                let ptr = self.pool.alloc(bytes)?;
                self.activations
                    .lock()?
                    .set_owned(layer, ptr, align_up(bytes));
                let source = if layer == 0 {
                    self.staging
                } else {
                    self.shadows[layer].ok_or_else(|| {
                        GradForgeError::Invariant(format!(
                            "prefetch of layer {} without a shadow",
                            layer
                        ))
                    })?
                };
                self.runtime
                    .copy_to_device_async(ptr, source, bytes, self.memory)
                    .map_err(|e| GradForgeError::FatalCopy {
                        layer,
                        reason: e.to_string(),
                    })?;
                self.runtime
                    .record_event(self.prefetch_events[layer], self.memory)?;

                let runtime = Arc::clone(&self.runtime);
                let semaphore = Arc::clone(&self.prefetch_ready[layer]);
                let counter = Arc::clone(&self.prefetch_count);
                let event = self.prefetch_events[layer];
                std::thread::spawn(move || {
                    if let Err(err) = runtime.sync_event(event) {
                        tracing::error!(%err, layer, "prefetch worker: event wait failed");
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                    semaphore.post();
                });
            }
            Step::ComputeLoss => {
                let (loss, correct) = self.loss_and_gradient(labels, training)?;
                output.loss = loss;
                output.correct = correct;
            }
            Step::ComputeMetrics => {
                let (loss, correct) = self.loss_and_gradient(labels, false)?;
                output.loss = loss;
                output.correct = correct;
            }
            Step::FreeActivation { index } => {
                let released = self.activations.lock()?.release(index);
                if let Some((ptr, _)) = released {
                    self.pool.free(ptr)?;
                }
            }
            Step::FreeGrad { index } => {
                if let Some((ptr, _)) = self.grads.release(index) {
                    self.pool.free(ptr)?;
                }
            }
        }
        Ok(())
    }

    /// Download the network output, compute the epsilon-clamped
    /// cross-entropy and correct count, and (training) fill `grad[L]` with
    /// `(p - onehot) / N`.
    fn loss_and_gradient(&mut self, labels: &[u32], training: bool) -> GradResult<(f64, usize)> {
        let l = self.registry.len();
        let out_ptr = self.activation_ptr(l)?;
        let mut raw = vec![0u8; self.registry.activation_bytes(l)];
        self.runtime
            .download(out_ptr, &mut raw)
            .map_err(|e| GradForgeError::FatalCopy {
                layer: l - 1,
                reason: e.to_string(),
            })?;
        let probs = self.from_precision_bytes(&raw);

        let n = self.registry.batch();
        let classes = self.registry.num_classes();
        if probs.len() != n * classes {
            return Err(GradForgeError::Invariant(format!(
                "network output has {} elements, expected {} classes x {} batch",
                probs.len(),
                classes,
                n
            )));
        }

        let eps = self.softmax_epsilon;
        let mut loss = 0.0f64;
        let mut correct = 0usize;
        let mut grad = vec![0.0f64; n * classes];
        for (sample, &label) in labels.iter().enumerate() {
            let row = &probs[sample * classes..(sample + 1) * classes];
            let argmax = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            if argmax == label as usize {
                correct += 1;
            }
            loss -= row[label as usize].max(eps).ln();
            for class in 0..classes {
                let target = if class == label as usize { 1.0 } else { 0.0 };
                grad[sample * classes + class] = (row[class] - target) / n as f64;
            }
        }
        loss /= n as f64;

        if training {
            let grad_ptr = self
                .grads
                .get(l)
                .ok_or_else(|| GradForgeError::Invariant(format!("missing grad[{}]", l)))?;
            let bytes = self.f64s_to_precision_bytes(&grad);
            self.runtime
                .upload(grad_ptr, &bytes)
                .map_err(|e| GradForgeError::FatalCopy {
                    layer: l - 1,
                    reason: e.to_string(),
                })?;
        }
        Ok((loss, correct))
    }

    fn activation_ptr(&self, index: usize) -> GradResult<DevicePtr> {
        self.activations
            .lock()?
            .get(index)
            .ok_or_else(|| GradForgeError::Invariant(format!("missing activation[{}]", index)))
    }

    fn to_precision_bytes(&self, data: &[f32]) -> Vec<u8> {
        match self.registry.precision() {
            Precision::Float32 => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Precision::Float64 => data
                .iter()
                .flat_map(|v| (*v as f64).to_le_bytes())
                .collect(),
        }
    }

    fn f64s_to_precision_bytes(&self, data: &[f64]) -> Vec<u8> {
        match self.registry.precision() {
            Precision::Float32 => data
                .iter()
                .flat_map(|v| (*v as f32).to_le_bytes())
                .collect(),
            Precision::Float64 => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn from_precision_bytes(&self, raw: &[u8]) -> Vec<f64> {
        match self.registry.precision() {
            Precision::Float32 => raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            Precision::Float64 => raw
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Drain both streams before releasing pinned memory; an aborted
        // step may still have copies in flight.
        let _ = self.runtime.sync_stream(self.compute);
        let _ = self.runtime.sync_stream(self.memory);
        for shadow in self.shadows.iter().flatten() {
            if let Err(err) = self.runtime.free_pinned(*shadow) {
                tracing::warn!(%err, "executor: failed to free pinned shadow");
            }
        }
        if let Err(err) = self.runtime.free_pinned(self.staging) {
            tracing::warn!(%err, "executor: failed to free staging buffer");
        }
    }
}
