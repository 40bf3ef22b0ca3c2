//! End-to-end planner + executor scenarios on the host runtime.

mod common;

use common::{all_bitmap, batch_input, batch_labels, conv_only_bitmap, TestBed};
use gradforge::dnn::{ActivationMode, AlgoPreference};
use gradforge::layers::LayerSpec;
use gradforge::planner::OffloadPolicy;
use gradforge::TrainingConfig;

#[test]
fn scenario_small_network_fits_without_offload() {
    let bed = TestBed::new();
    let specs = [
        LayerSpec::convolution(10, 8, 1, 0),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::softmax(),
    ];
    let config = TrainingConfig::new(32, (3, 8, 8))
        .with_offload_policy(OffloadPolicy::None)
        .with_weight_stddev(0.05);

    let mut engine = bed.engine(&specs, config).unwrap();
    assert_eq!(engine.plan().tier, "none/perf/hard");
    assert_eq!(engine.plan().offload_count(), 0);
    assert!(engine.plan().hard);

    let registry_elems = engine.registry().activation_shape(0).elements();
    let input = batch_input(registry_elems, 1);
    let labels = batch_labels(32, 10);

    let first = engine.step(&input, &labels, 0.05, true).unwrap();
    assert!(first.loss.is_finite() && first.loss > 0.0);
    // Peak bound and conservation after every step.
    assert!(engine.pool().peak_outstanding() <= engine.plan().peak_bytes);
    assert_eq!(engine.pool().outstanding_bytes(), 0);
    assert_eq!(engine.step_stats().offload_frees, 0);
    assert_eq!(engine.step_stats().prefetches, 0);

    // Overfitting one fixed batch must reduce the loss.
    let mut last = first.loss;
    for _ in 0..15 {
        last = engine.step(&input, &labels, 0.05, true).unwrap().loss;
    }
    assert!(
        last < first.loss,
        "loss did not decrease: {} -> {}",
        first.loss,
        last
    );
}

#[test]
fn scenario_conv_only_offload() {
    let bed = TestBed::new();
    // Five convolutions alternating with activations; 7x7 kernels keep the
    // GEMM workspaces far above the budget this test pins, so the hard
    // performance tier stays on the direct algorithm.
    let specs = [
        LayerSpec::convolution(8, 7, 1, 3),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::convolution(8, 7, 1, 3),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::convolution(8, 7, 1, 3),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::convolution(8, 7, 1, 3),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::convolution(10, 8, 1, 0),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::softmax(),
    ];
    let config = TrainingConfig::new(256, (3, 8, 8))
        .with_offload_policy(OffloadPolicy::Dynamic)
        .with_algo_pref(AlgoPreference::PerformanceOptimal);

    let registry = bed.registry(&specs, &config);
    let none_peak = bed.tensor_peak(&registry, &vec![false; registry.len()]);
    let conv_bitmap = conv_only_bitmap(&registry);
    let conv_peak = bed.tensor_peak(&registry, &conv_bitmap);
    assert!(
        conv_peak < none_peak,
        "offloading must reduce residency: {} vs {}",
        conv_peak,
        none_peak
    );

    // Just below the no-offload tensor peak: "none" cannot fit at any
    // algorithm tier, "conv-only" under hard performance selection must.
    let budget = none_peak - gradforge::memory::POOL_ALIGNMENT;
    let conv_steps = gradforge::planner::training_steps(&registry, &conv_bitmap);
    let conv_perf_walk = gradforge::planner::analytic(
        &registry,
        bed.dnn.as_ref(),
        &conv_steps,
        AlgoPreference::PerformanceOptimal,
        true,
        budget,
    )
    .unwrap()
    .expect("conv-only selection must succeed")
    .peak_bytes;
    assert!(
        conv_perf_walk <= budget,
        "test geometry: conv-only/perf/hard must fit ({} > {})",
        conv_perf_walk,
        budget
    );
    let config = config.with_device_capacity(registry.persistent_bytes() + budget);

    let mut engine = bed.engine(&specs, config).unwrap();
    assert_eq!(engine.plan().tier, "conv-only/perf/hard");
    assert_eq!(engine.plan().offload, conv_bitmap);
    // Exactly the four non-last convolutions carry pinned shadows.
    assert_eq!(engine.plan().offload_count(), 4);

    let input = batch_input(engine.registry().activation_shape(0).elements(), 2);
    let labels = batch_labels(256, 10);
    let out = engine.step(&input, &labels, 0.01, true).unwrap();
    assert!(out.loss.is_finite());
    // Every offloaded activation is freed once in forward and prefetched
    // once in backward.
    assert_eq!(engine.step_stats().offload_frees, 4);
    assert_eq!(engine.step_stats().prefetches, 4);
    assert!(engine.pool().peak_outstanding() <= engine.plan().peak_bytes);
    assert_eq!(engine.pool().outstanding_bytes(), 0);
}

#[test]
fn scenario_all_offload() {
    let bed = TestBed::new();
    // Eight convolution + batch-norm pairs, then the classifier head.
    // 7x7 kernels push every GEMM workspace past the pinned budget.
    let mut specs = Vec::new();
    for _ in 0..8 {
        specs.push(LayerSpec::convolution(8, 7, 1, 3));
        specs.push(LayerSpec::batch_norm(1e-5, 0.1));
    }
    specs.push(LayerSpec::fully_connected(10));
    specs.push(LayerSpec::softmax());

    let config = TrainingConfig::new(512, (3, 4, 4))
        .with_offload_policy(OffloadPolicy::Dynamic)
        .with_algo_pref(AlgoPreference::PerformanceOptimal);

    let registry = bed.registry(&specs, &config);
    let conv_bitmap = conv_only_bitmap(&registry);
    let conv_peak = bed.tensor_peak(&registry, &conv_bitmap);
    let all = all_bitmap(&registry);
    let all_peak = bed.tensor_peak(&registry, &all);
    assert!(all_peak < conv_peak);

    // Just below the conv-only tensor peak: rows "none" and "conv-only"
    // cannot fit, "all" under hard performance selection must.
    let budget = conv_peak - gradforge::memory::POOL_ALIGNMENT;
    let all_steps = gradforge::planner::training_steps(&registry, &all);
    let all_perf_walk = gradforge::planner::analytic(
        &registry,
        bed.dnn.as_ref(),
        &all_steps,
        AlgoPreference::PerformanceOptimal,
        true,
        budget,
    )
    .unwrap()
    .expect("all-offload selection must succeed")
    .peak_bytes;
    assert!(
        all_perf_walk <= budget,
        "test geometry: all/perf/hard must fit ({} > {})",
        all_perf_walk,
        budget
    );
    let config = config.with_device_capacity(registry.persistent_bytes() + budget);

    let mut engine = bed.engine(&specs, config).unwrap();
    assert_eq!(engine.plan().tier, "all/perf/hard");
    assert_eq!(engine.plan().offload, all);
    // Every non-terminal conv and batch-norm layer is offloaded.
    assert_eq!(engine.plan().offload_count(), 16);

    let input = batch_input(engine.registry().activation_shape(0).elements(), 3);
    let labels = batch_labels(512, 10);
    let out = engine.step(&input, &labels, 0.01, true).unwrap();
    assert!(out.loss.is_finite());
    assert_eq!(engine.step_stats().offload_frees, 16);
    assert_eq!(engine.step_stats().prefetches, 16);
    assert!(engine.pool().peak_outstanding() <= engine.plan().peak_bytes);
    assert_eq!(engine.pool().outstanding_bytes(), 0);
}

#[test]
fn scenario_dynamic_falls_back_to_memory_optimal() {
    let bed = TestBed::new();
    // 1x1 convolutions: the GEMM workspace equals the input activation, so
    // it fits any budget that fits the activations - and greedily taking it
    // overshoots a budget pinned just above the tensor peak. Every
    // performance tier (hard and soft) fails; memory-optimal/hard lands.
    let specs = [
        LayerSpec::convolution(8, 1, 1, 0),
        LayerSpec::activation(ActivationMode::Tanh),
        LayerSpec::convolution(8, 1, 1, 0),
        LayerSpec::activation(ActivationMode::Tanh),
        LayerSpec::convolution(8, 1, 1, 0),
        LayerSpec::activation(ActivationMode::Tanh),
        LayerSpec::fully_connected(10),
        LayerSpec::softmax(),
    ];
    let config = TrainingConfig::new(64, (8, 8, 8))
        .with_offload_policy(OffloadPolicy::Dynamic)
        .with_algo_pref(AlgoPreference::PerformanceOptimal);

    let registry = bed.registry(&specs, &config);
    let all = all_bitmap(&registry);
    let tensor_peak = bed.tensor_peak(&registry, &all);
    let perf_peak = bed.perf_peak(&registry, &all);
    assert!(
        perf_peak > tensor_peak,
        "greedy workspaces must inflate the peak for this stack"
    );

    // Between the two peaks: performance selections overshoot, the
    // memory-optimal walk fits.
    let budget = (tensor_peak + perf_peak) / 2;
    let config = config.with_device_capacity(registry.persistent_bytes() + budget);

    let mut engine = bed.engine(&specs, config).unwrap();
    assert_eq!(engine.plan().tier, "conv-only/mem/hard");
    assert_eq!(engine.plan().algo_pref, AlgoPreference::MemoryOptimal);
    assert!(engine.plan().hard);

    let input = batch_input(engine.registry().activation_shape(0).elements(), 4);
    let labels = batch_labels(64, 10);
    let out = engine.step(&input, &labels, 0.01, true).unwrap();
    assert!(out.loss.is_finite());
    assert_eq!(engine.pool().outstanding_bytes(), 0);
}

#[test]
fn scenario_infeasible_when_parameters_exceed_budget() {
    let bed = TestBed::new();
    // The fully-connected weights alone outweigh the device budget.
    let specs = [
        LayerSpec::fully_connected(4096),
        LayerSpec::activation(ActivationMode::Relu),
        LayerSpec::fully_connected(10),
        LayerSpec::softmax(),
    ];
    let config = TrainingConfig::new(8, (64, 8, 8))
        .with_offload_policy(OffloadPolicy::Dynamic)
        .with_device_capacity(8 * 1024 * 1024);

    let err = bed.engine(&specs, config).unwrap_err();
    assert!(err.is_planner_error(), "unexpected error: {}", err);
}

#[test]
fn scenario_inference_counts_argmax_matches() {
    let bed = TestBed::new();
    // A pure softmax stack: argmax of the output equals argmax of the
    // input, so the correct count is known exactly.
    let specs = [LayerSpec::softmax()];
    let config = TrainingConfig::new(8, (4, 1, 1)).with_offload_policy(OffloadPolicy::None);

    let mut engine = bed.engine(&specs, config).unwrap();

    // Sample s peaks at class s % 4; labels match for even samples only.
    let mut input = vec![0.0f32; 8 * 4];
    for s in 0..8 {
        input[s * 4 + (s % 4)] = 5.0;
    }
    let labels: Vec<u32> = (0..8)
        .map(|s| if s % 2 == 0 { (s % 4) as u32 } else { ((s + 1) % 4) as u32 })
        .collect();

    let out = engine.step(&input, &labels, 0.0, false).unwrap();
    assert_eq!(out.correct, 4);
    // Inference skips offload and backward entirely.
    assert_eq!(engine.step_stats().offload_frees, 0);
    assert_eq!(engine.step_stats().prefetches, 0);
    assert_eq!(engine.pool().outstanding_bytes(), 0);
}
