//! The training/inference schedule, compiled once per (registry, plan)
//!
//! The forward and backward passes are described as a flat list of
//! [`Step`]s. The planner's analytic simulation, its allocator-confirmation
//! replay, and the executor all interpret this one list, so the allocation
//! sequence the planner sizes for is by construction the sequence the
//! executor performs.
//!
//! Workspace steps carry no byte size: the analytic pass resolves them by
//! selecting algorithms against its running budget (and locks the choices
//! into the plan); the replay and the executor resolve them from the locked
//! plan.

use crate::layers::LayerRegistry;

/// Which pass a workspace allocation belongs to. Backward workspaces are
/// sized at max(backward-filter, backward-data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassDirection {
    Forward,
    Backward,
}

/// One step of the compiled schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Enqueue the async D2H copy of `activation[layer]` to its pinned
    /// shadow on the memory stream and record the layer's offload-done
    /// event.
    OffloadOut { layer: usize },
    /// Allocate `activation[index]` from the pool.
    AllocActivation { index: usize },
    /// Alias `activation[dst] = activation[src]` (fused trailing softmax).
    AliasActivation { dst: usize, src: usize },
    /// Allocate `grad[index]` from the pool.
    AllocGrad { index: usize },
    /// Alias `grad[dst] = grad[src]` (Activation/Softmax backward).
    AliasGrad { dst: usize, src: usize },
    /// Allocate the convolution workspace for `layer`.
    AllocWorkspace {
        layer: usize,
        direction: PassDirection,
    },
    /// Free the convolution workspace for `layer`.
    FreeWorkspace { layer: usize },
    /// Enqueue layer `layer`'s forward kernels on the compute stream,
    /// folding the trailing softmax layer in when present.
    Forward {
        layer: usize,
        fused_softmax: Option<usize>,
    },
    /// Enqueue layer `layer`'s backward kernels on the compute stream.
    Backward { layer: usize },
    /// Host-side compute-stream synchronize (once per layer per pass).
    SyncCompute,
    /// Spawn the detached worker that waits on the layer's offload-done
    /// event, frees `activation[layer]`, and posts the offload-sync
    /// semaphore.
    SpawnOffloadFree { layer: usize },
    /// Forward-to-loss barrier: wait on every offload-sync semaphore.
    AwaitOffloads,
    /// Download the softmax output, compute loss + correct count, fill
    /// `grad[L]` (training).
    ComputeLoss,
    /// Download the network output and count argmax matches (inference).
    ComputeMetrics,
    /// Block on the layer's prefetch-ready semaphore.
    WaitPrefetch { layer: usize },
    /// Allocate `activation[layer]`, enqueue the async H2D copy from its
    /// pinned shadow (the input staging buffer for layer 0), record the
    /// prefetch-done event, and spawn the worker that posts prefetch-ready.
    BeginPrefetch { layer: usize },
    /// Free `activation[index]` (owner-resolved by the slot table).
    FreeActivation { index: usize },
    /// Free `grad[index]` (owner-resolved by the slot table).
    FreeGrad { index: usize },
    /// Copy the staged input batch from pinned memory into the freshly
    /// allocated `activation[0]`.
    StageInput,
}

/// Nearest earlier offloaded-and-unprefetched layer to pair a prefetch
/// with, scanning from `cur - 1` downward. A convolution met before any
/// candidate aborts the scan: its backward will dominate latency and the
/// prefetch would hold pool memory too early.
pub fn find_prefetch_layer(
    registry: &LayerRegistry,
    offload: &[bool],
    prefetched: &[bool],
    cur: usize,
) -> Option<usize> {
    for j in (0..cur).rev() {
        if offload[j] && !prefetched[j] {
            return Some(j);
        }
        if registry.layer(j).kind.is_convolution() {
            return None;
        }
    }
    None
}

/// Compile the training schedule (forward sweep, loss, backward sweep).
pub fn training_steps(registry: &LayerRegistry, offload: &[bool]) -> Vec<Step> {
    let l = registry.len();
    debug_assert_eq!(offload.len(), l);
    let mut steps = Vec::with_capacity(12 * l + 6);

    steps.push(Step::AllocActivation { index: 0 });
    steps.push(Step::StageInput);

    // Forward sweep.
    let mut i = 0;
    while i < l {
        let desc = registry.layer(i);
        if i > 0 && offload[i] {
            steps.push(Step::OffloadOut { layer: i });
        }
        steps.push(Step::AllocActivation { index: i + 1 });
        let is_conv = desc.kind.is_convolution();
        if is_conv {
            steps.push(Step::AllocWorkspace {
                layer: i,
                direction: PassDirection::Forward,
            });
        }
        // Fold a trailing softmax into this step: its output aliases its
        // input and the loop advances past it.
        let fused = if i + 1 < l && registry.layer(i + 1).kind == crate::layers::LayerKind::Softmax
        {
            steps.push(Step::AliasActivation {
                dst: i + 2,
                src: i + 1,
            });
            Some(i + 1)
        } else {
            None
        };
        steps.push(Step::Forward {
            layer: i,
            fused_softmax: fused,
        });
        steps.push(Step::SyncCompute);
        if offload[i] {
            steps.push(Step::SpawnOffloadFree { layer: i });
        }
        if is_conv {
            steps.push(Step::FreeWorkspace { layer: i });
        }
        i += if fused.is_some() { 2 } else { 1 };
    }

    steps.push(Step::AwaitOffloads);
    steps.push(Step::AllocGrad { index: l });
    steps.push(Step::ComputeLoss);

    // Backward sweep.
    let mut prefetched = vec![false; l];
    for i in (0..l).rev() {
        let desc = registry.layer(i);
        if offload[i] {
            steps.push(Step::WaitPrefetch { layer: i });
        }
        if i > 0 {
            if desc.kind.is_activation_like() {
                steps.push(Step::AliasGrad { dst: i, src: i + 1 });
            } else {
                steps.push(Step::AllocGrad { index: i });
                if let Some(j) = find_prefetch_layer(registry, offload, &prefetched, i) {
                    prefetched[j] = true;
                    steps.push(Step::BeginPrefetch { layer: j });
                }
            }
        }
        let is_conv = desc.kind.is_convolution();
        if is_conv {
            steps.push(Step::AllocWorkspace {
                layer: i,
                direction: PassDirection::Backward,
            });
        }
        steps.push(Step::Backward { layer: i });
        steps.push(Step::SyncCompute);
        if is_conv {
            steps.push(Step::FreeWorkspace { layer: i });
        }
        steps.push(Step::FreeActivation { index: i + 1 });
        steps.push(Step::FreeGrad { index: i + 1 });
        if i == 0 {
            steps.push(Step::FreeActivation { index: 0 });
        }
    }

    // Liveness: every offloaded layer must have been paired with a
    // prefetch, or its WaitPrefetch would block forever. The last-layer
    // offload exemption guarantees this for policy-generated bitmaps.
    debug_assert!(
        (0..l).all(|i| !offload[i] || prefetched[i]),
        "offloaded layer without a paired prefetch"
    );

    steps
}

/// Compile the inference schedule: forward only, no offload, activations
/// freed as soon as consumed.
pub fn inference_steps(registry: &LayerRegistry) -> Vec<Step> {
    let l = registry.len();
    let mut steps = Vec::with_capacity(6 * l + 4);
    steps.push(Step::AllocActivation { index: 0 });
    steps.push(Step::StageInput);
    for i in 0..l {
        let is_conv = registry.layer(i).kind.is_convolution();
        steps.push(Step::AllocActivation { index: i + 1 });
        if is_conv {
            steps.push(Step::AllocWorkspace {
                layer: i,
                direction: PassDirection::Forward,
            });
        }
        steps.push(Step::Forward {
            layer: i,
            fused_softmax: None,
        });
        steps.push(Step::SyncCompute);
        if is_conv {
            steps.push(Step::FreeWorkspace { layer: i });
        }
        steps.push(Step::FreeActivation { index: i });
    }
    steps.push(Step::ComputeMetrics);
    steps.push(Step::FreeActivation { index: l });
    steps
}
