//! Plan feasibility checks
//!
//! Two phases over the same compiled schedule:
//!
//! 1. [`analytic`] - pure accounting. Tracks consumed/max-consumed bytes
//!    through the step list, selecting convolution algorithms under the
//!    pool budget (the library's setup-time query) at the points where the
//!    executor will allocate their workspaces, and locks the choices.
//! 2. [`confirm`] - initializes a real [`Suballocator`] at the planned
//!    peak and replays the same steps with `try_alloc`/`free` (no compute),
//!    confirming the peak survives best-fit fragmentation.

use std::sync::Arc;

use crate::device::{DevicePtr, DeviceRuntime};
use crate::dnn::{AlgoCandidate, AlgoPreference, ConvDirection, DnnLibrary};
use crate::error::GradResult;
use crate::layers::LayerRegistry;
use crate::memory::{align_up, SlotTable, Suballocator};
use crate::planner::schedule::{PassDirection, Step};
use crate::planner::{ConvAlgoPlan, Plan};

/// Result of the analytic walk: the peak and the locked algorithm choices.
pub struct AnalyticOutcome {
    pub peak_bytes: usize,
    pub conv_algos: Vec<Option<ConvAlgoPlan>>,
}

#[derive(Default, Clone, Copy)]
struct PartialChoice {
    fwd: Option<AlgoCandidate>,
    bwd_filter: Option<AlgoCandidate>,
    bwd_data: Option<AlgoCandidate>,
}

/// Walk the schedule, modelling the runtime's exact allocation sequence.
/// Returns `None` when algorithm selection fails under the budget; the
/// caller then rejects the candidate plan.
pub fn analytic(
    registry: &LayerRegistry,
    dnn: &dyn DnnLibrary,
    steps: &[Step],
    pref: AlgoPreference,
    hard: bool,
    budget: usize,
) -> GradResult<Option<AnalyticOutcome>> {
    let l = registry.len();
    let mut activations: SlotTable<()> = SlotTable::new(l + 1);
    let mut grads: SlotTable<()> = SlotTable::new(l + 1);
    let mut workspaces: Vec<Option<usize>> = vec![None; l];
    let mut choices: Vec<PartialChoice> = vec![PartialChoice::default(); l];

    let mut consumed = 0usize;
    let mut peak = 0usize;

    for step in steps {
        match *step {
            Step::AllocActivation { index } | Step::BeginPrefetch { layer: index } => {
                let bytes = align_up(registry.activation_bytes(index));
                consumed += bytes;
                activations.set_owned(index, (), bytes);
            }
            Step::AliasActivation { dst, src } => activations.alias(dst, src),
            Step::AllocGrad { index } => {
                let bytes = align_up(registry.activation_bytes(index));
                consumed += bytes;
                grads.set_owned(index, (), bytes);
            }
            Step::AliasGrad { dst, src } => grads.alias(dst, src),
            Step::AllocWorkspace { layer, direction } => {
                // Selection models the runtime's setup-time query: the
                // whole pool budget is the free-byte limit. A
                // performance-optimal choice can therefore overshoot the
                // walk's peak and sink the candidate, which is exactly the
                // degradation path the fallback cascade exists for.
                let free = budget;
                let bytes = match direction {
                    PassDirection::Forward => {
                        let Some(choice) = registry.select_conv_algo(
                            dnn,
                            layer,
                            ConvDirection::Forward,
                            pref,
                            hard,
                            free,
                        )?
                        else {
                            return Ok(None);
                        };
                        choices[layer].fwd = Some(choice);
                        choice.workspace_bytes
                    }
                    PassDirection::Backward => {
                        let Some(filter) = registry.select_conv_algo(
                            dnn,
                            layer,
                            ConvDirection::BackwardFilter,
                            pref,
                            hard,
                            free,
                        )?
                        else {
                            return Ok(None);
                        };
                        let Some(data) = registry.select_conv_algo(
                            dnn,
                            layer,
                            ConvDirection::BackwardData,
                            pref,
                            hard,
                            free,
                        )?
                        else {
                            return Ok(None);
                        };
                        choices[layer].bwd_filter = Some(filter);
                        choices[layer].bwd_data = Some(data);
                        filter.workspace_bytes.max(data.workspace_bytes)
                    }
                };
                let aligned = if bytes > 0 { align_up(bytes) } else { 0 };
                consumed += aligned;
                workspaces[layer] = Some(aligned);
            }
            Step::FreeWorkspace { layer } => {
                if let Some(bytes) = workspaces[layer].take() {
                    consumed -= bytes;
                }
            }
            Step::SpawnOffloadFree { layer } => {
                if let Some(((), bytes)) = activations.release(layer) {
                    consumed -= bytes;
                }
            }
            Step::FreeActivation { index } => {
                if let Some(((), bytes)) = activations.release(index) {
                    consumed -= bytes;
                }
            }
            Step::FreeGrad { index } => {
                if let Some(((), bytes)) = grads.release(index) {
                    consumed -= bytes;
                }
            }
            Step::OffloadOut { .. }
            | Step::Forward { .. }
            | Step::Backward { .. }
            | Step::SyncCompute
            | Step::AwaitOffloads
            | Step::ComputeLoss
            | Step::ComputeMetrics
            | Step::StageInput
            | Step::WaitPrefetch { .. } => {}
        }
        peak = peak.max(consumed);
    }

    debug_assert_eq!(consumed, 0, "schedule does not conserve pool bytes");

    let conv_algos = choices
        .into_iter()
        .map(|c| match (c.fwd, c.bwd_filter, c.bwd_data) {
            (Some(fwd), Some(bwd_filter), Some(bwd_data)) => Some(ConvAlgoPlan {
                fwd,
                bwd_filter,
                bwd_data,
            }),
            _ => None,
        })
        .collect();

    Ok(Some(AnalyticOutcome {
        peak_bytes: peak,
        conv_algos,
    }))
}

/// Replay the schedule against a real suballocator sized at the plan's
/// peak. Returns `false` when any allocation fails (fragmentation ate the
/// analytic headroom) - the candidate is then rejected.
pub fn confirm(
    registry: &LayerRegistry,
    steps: &[Step],
    plan: &Plan,
    runtime: Arc<dyn DeviceRuntime>,
) -> GradResult<bool> {
    let pool = Suballocator::init(runtime, plan.peak_bytes)?;
    let outcome = replay(registry, steps, plan, &pool);
    pool.shutdown()?;
    outcome
}

fn replay(
    registry: &LayerRegistry,
    steps: &[Step],
    plan: &Plan,
    pool: &Suballocator,
) -> GradResult<bool> {
    let l = registry.len();
    let mut activations: SlotTable<DevicePtr> = SlotTable::new(l + 1);
    let mut grads: SlotTable<DevicePtr> = SlotTable::new(l + 1);
    let mut workspaces: Vec<Option<DevicePtr>> = vec![None; l];

    for step in steps {
        match *step {
            Step::AllocActivation { index } | Step::BeginPrefetch { layer: index } => {
                let bytes = registry.activation_bytes(index);
                match pool.try_alloc(bytes)? {
                    Some(ptr) => activations.set_owned(index, ptr, align_up(bytes)),
                    None => return Ok(false),
                }
            }
            Step::AliasActivation { dst, src } => activations.alias(dst, src),
            Step::AllocGrad { index } => {
                let bytes = registry.activation_bytes(index);
                match pool.try_alloc(bytes)? {
                    Some(ptr) => grads.set_owned(index, ptr, align_up(bytes)),
                    None => return Ok(false),
                }
            }
            Step::AliasGrad { dst, src } => grads.alias(dst, src),
            Step::AllocWorkspace { layer, direction } => {
                let bytes = plan
                    .conv_algos
                    .get(layer)
                    .and_then(|c| c.as_ref())
                    .map(|c| match direction {
                        PassDirection::Forward => c.forward_workspace(),
                        PassDirection::Backward => c.backward_workspace(),
                    })
                    .unwrap_or(0);
                if bytes > 0 {
                    match pool.try_alloc(bytes)? {
                        Some(ptr) => workspaces[layer] = Some(ptr),
                        None => return Ok(false),
                    }
                }
            }
            Step::FreeWorkspace { layer } => {
                if let Some(ptr) = workspaces[layer].take() {
                    pool.free(ptr)?;
                }
            }
            Step::SpawnOffloadFree { layer } => {
                if let Some((ptr, _)) = activations.release(layer) {
                    pool.free(ptr)?;
                }
            }
            Step::FreeActivation { index } => {
                if let Some((ptr, _)) = activations.release(index) {
                    pool.free(ptr)?;
                }
            }
            Step::FreeGrad { index } => {
                if let Some((ptr, _)) = grads.release(index) {
                    pool.free(ptr)?;
                }
            }
            Step::OffloadOut { .. }
            | Step::Forward { .. }
            | Step::Backward { .. }
            | Step::SyncCompute
            | Step::AwaitOffloads
            | Step::ComputeLoss
            | Step::ComputeMetrics
            | Step::StageInput
            | Step::WaitPrefetch { .. } => {}
        }
    }

    let conserved = pool.outstanding_bytes() == 0;
    debug_assert!(conserved, "replay left outstanding pool bytes");
    Ok(conserved)
}
