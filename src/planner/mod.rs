//! Memory planner
//!
//! Given an offload policy and an algorithm preference, the planner picks a
//! plan - which layers' forward activations go to pinned host memory, which
//! convolution algorithms run, and the resulting peak device footprint -
//! that makes the network trainable within the device budget. Candidates
//! are checked by an analytic simulation of the compiled schedule and then
//! confirmed against a real suballocator (see [`simulate`]).

pub mod schedule;
pub mod simulate;

pub use schedule::{find_prefetch_layer, inference_steps, training_steps, PassDirection, Step};
pub use simulate::{analytic, confirm, AnalyticOutcome};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceRuntime;
use crate::dnn::{AlgoCandidate, AlgoPreference, DnnLibrary};
use crate::error::{GradForgeError, GradResult};
use crate::layers::LayerRegistry;

/// Which layers to offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffloadPolicy {
    /// Keep everything resident.
    None,
    /// Offload convolution inputs only.
    ConvOnly,
    /// Offload every non-Activation/Softmax layer (minus the last).
    All,
    /// Explore the candidate cascade and take the first feasible tier.
    Dynamic,
}

/// Locked convolution algorithm choices for one layer. Selecting them at
/// plan time (and never re-selecting) is what keeps the planner and the
/// executor from disagreeing under memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvAlgoPlan {
    pub fwd: AlgoCandidate,
    pub bwd_filter: AlgoCandidate,
    pub bwd_data: AlgoCandidate,
}

impl ConvAlgoPlan {
    pub fn forward_workspace(&self) -> usize {
        self.fwd.workspace_bytes
    }

    /// Backward allocates one workspace covering both backward calls.
    pub fn backward_workspace(&self) -> usize {
        self.bwd_filter
            .workspace_bytes
            .max(self.bwd_data.workspace_bytes)
    }
}

/// The planner's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// `offload[i]`: layer i's forward activation goes to pinned host
    /// memory during the forward sweep.
    pub offload: Vec<bool>,
    pub algo_pref: AlgoPreference,
    /// Hard: algorithm selection strictly fits the free budget. Soft:
    /// greedy speed preference with graceful degradation.
    pub hard: bool,
    /// Pool size the suballocator is initialized with; executing the plan
    /// never exceeds it.
    pub peak_bytes: usize,
    /// Per-layer locked algorithm choices (`None` for non-convolutions).
    pub conv_algos: Vec<Option<ConvAlgoPlan>>,
    /// Human-readable tier that produced this plan (diagnostics).
    pub tier: String,
}

impl Plan {
    pub fn is_offloaded(&self, layer: usize) -> bool {
        self.offload[layer]
    }

    pub fn offload_count(&self) -> usize {
        self.offload.iter().filter(|o| **o).count()
    }
}

/// The three concrete offload sets the policies produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffloadSet {
    None,
    ConvOnly,
    All,
}

impl OffloadSet {
    fn label(&self) -> &'static str {
        match self {
            OffloadSet::None => "none",
            OffloadSet::ConvOnly => "conv-only",
            OffloadSet::All => "all",
        }
    }
}

/// Mark layers for offload. Activation/Softmax layers are never marked and
/// neither is the last remaining markable layer: its output feeds the loss
/// and must stay resident - which is also what guarantees every offloaded
/// layer gets a prefetch before its backward step blocks.
fn offload_bitmap(registry: &LayerRegistry, set: OffloadSet) -> Vec<bool> {
    let last = registry.last_offloadable();
    (0..registry.len())
        .map(|i| {
            if Some(i) == last {
                return false;
            }
            let kind = &registry.layer(i).kind;
            match set {
                OffloadSet::None => false,
                OffloadSet::ConvOnly => kind.is_convolution(),
                OffloadSet::All => !kind.is_activation_like(),
            }
        })
        .collect()
}

struct Candidate {
    set: OffloadSet,
    pref: AlgoPreference,
    hard: bool,
}

fn pref_label(pref: AlgoPreference) -> &'static str {
    match pref {
        AlgoPreference::PerformanceOptimal => "perf",
        AlgoPreference::MemoryOptimal => "mem",
    }
}

/// Choose a feasible plan for the registry under `capacity_bytes` of
/// device memory.
///
/// Static policies evaluate a single candidate with the configured
/// preference under hard discipline. The dynamic policy first gates on the
/// memory-conservative floor (all-offload, memory-optimal, hard - if even
/// that fails, nothing can work), then walks the fallback cascade and
/// returns the first tier that confirms, falling back to the gate plan.
pub fn choose_plan(
    registry: &LayerRegistry,
    dnn: &dyn DnnLibrary,
    runtime: &Arc<dyn DeviceRuntime>,
    capacity_bytes: usize,
    policy: OffloadPolicy,
    pref: AlgoPreference,
) -> GradResult<Plan> {
    let persistent = registry.persistent_bytes();
    let budget = capacity_bytes.checked_sub(persistent).ok_or_else(|| {
        GradForgeError::PlannerInfeasible(format!(
            "persistent tensors ({} bytes) alone exceed device capacity ({} bytes)",
            persistent, capacity_bytes
        ))
    })?;
    tracing::debug!(
        capacity_bytes,
        persistent,
        budget,
        ?policy,
        "planner: choosing plan"
    );

    let evaluate = |candidate: &Candidate| -> GradResult<Option<Plan>> {
        evaluate_candidate(registry, dnn, runtime, budget, candidate)
    };

    match policy {
        OffloadPolicy::None | OffloadPolicy::ConvOnly | OffloadPolicy::All => {
            let set = match policy {
                OffloadPolicy::None => OffloadSet::None,
                OffloadPolicy::ConvOnly => OffloadSet::ConvOnly,
                _ => OffloadSet::All,
            };
            let candidate = Candidate {
                set,
                pref,
                hard: true,
            };
            evaluate(&candidate)?.ok_or_else(|| {
                GradForgeError::PlannerInfeasible(format!(
                    "policy {} with {} algorithms does not fit in {} pool bytes",
                    set.label(),
                    pref_label(pref),
                    budget
                ))
            })
        }
        OffloadPolicy::Dynamic => {
            // Feasibility gate: the most memory-conservative candidate
            // (all-offload, memory-optimal, hard). If even this fails,
            // nothing in the cascade can fit.
            let gate = Candidate {
                set: OffloadSet::All,
                pref: AlgoPreference::MemoryOptimal,
                hard: true,
            };
            let Some(gate_plan) = evaluate(&gate)? else {
                return Err(GradForgeError::PlannerInfeasible(format!(
                    "all-offload/mem/hard does not fit in {} pool bytes",
                    budget
                )));
            };

            use AlgoPreference::{MemoryOptimal, PerformanceOptimal};
            let cascade = [
                Candidate { set: OffloadSet::None, pref: PerformanceOptimal, hard: true },
                Candidate { set: OffloadSet::ConvOnly, pref: PerformanceOptimal, hard: true },
                Candidate { set: OffloadSet::All, pref: PerformanceOptimal, hard: true },
                Candidate { set: OffloadSet::ConvOnly, pref: PerformanceOptimal, hard: false },
                Candidate { set: OffloadSet::All, pref: PerformanceOptimal, hard: false },
                Candidate { set: OffloadSet::ConvOnly, pref: MemoryOptimal, hard: true },
                Candidate { set: OffloadSet::All, pref: MemoryOptimal, hard: true },
            ];
            for candidate in &cascade {
                if let Some(plan) = evaluate(candidate)? {
                    tracing::info!(
                        tier = %plan.tier,
                        peak_bytes = plan.peak_bytes,
                        offloaded = plan.offload_count(),
                        "planner: selected tier"
                    );
                    return Ok(plan);
                }
            }
            tracing::info!(
                tier = %gate_plan.tier,
                peak_bytes = gate_plan.peak_bytes,
                "planner: cascade exhausted, using gate plan"
            );
            Ok(gate_plan)
        }
    }
}

fn evaluate_candidate(
    registry: &LayerRegistry,
    dnn: &dyn DnnLibrary,
    runtime: &Arc<dyn DeviceRuntime>,
    budget: usize,
    candidate: &Candidate,
) -> GradResult<Option<Plan>> {
    let tier = format!(
        "{}/{}/{}",
        candidate.set.label(),
        pref_label(candidate.pref),
        if candidate.hard { "hard" } else { "soft" }
    );
    let offload = offload_bitmap(registry, candidate.set);
    let steps = training_steps(registry, &offload);

    let Some(outcome) = analytic(
        registry,
        dnn,
        &steps,
        candidate.pref,
        candidate.hard,
        budget,
    )?
    else {
        tracing::debug!(%tier, "planner: algorithm selection infeasible");
        return Ok(None);
    };
    if outcome.peak_bytes > budget {
        tracing::debug!(
            %tier,
            peak = outcome.peak_bytes,
            budget,
            "planner: analytic peak exceeds budget"
        );
        return Ok(None);
    }

    // Feasibility is judged on the analytic optimum; the pool itself is
    // sized with a 1/16 fragmentation margin (budget-capped). Best-fit
    // placement under the live run's worker-free timing is not byte-exact
    // against the replay, and the margin is what keeps a backward-pass
    // allocation from ever waiting on a free that is not coming.
    let cap = budget & !(crate::memory::POOL_ALIGNMENT - 1);
    let headroom = |peak: usize| {
        crate::memory::align_up(peak + (peak / 16).max(crate::memory::POOL_ALIGNMENT)).min(cap)
    };
    let mut plan = Plan {
        offload,
        algo_pref: candidate.pref,
        hard: candidate.hard,
        peak_bytes: headroom(outcome.peak_bytes).max(outcome.peak_bytes),
        conv_algos: outcome.conv_algos,
        tier: tier.clone(),
    };
    for _ in 0..8 {
        if confirm(registry, &steps, &plan, Arc::clone(runtime))? {
            return Ok(Some(plan));
        }
        let grown = headroom(plan.peak_bytes);
        if grown <= plan.peak_bytes {
            break;
        }
        tracing::debug!(
            %tier,
            peak = grown,
            "planner: growing pool for fragmentation headroom"
        );
        plan.peak_bytes = grown;
    }
    tracing::debug!(%tier, "planner: allocator confirmation failed");
    Ok(None)
}
