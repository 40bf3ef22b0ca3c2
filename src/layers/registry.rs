//! Layer registry: static layer metadata and parameter tensors
//!
//! Built in two phases. `build` runs shape inference over the spec list and
//! computes every byte size the planner needs, without touching the device.
//! `materialize` allocates parameter and reserve tensors directly from the
//! device runtime (outside the suballocator pool) and initializes them.
//! The registry is immutable after materialization.

use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::device::{DevicePtr, DeviceRuntime};
use crate::dnn::{
    AlgoCandidate, AlgoPreference, BackwardArgs, ConvAlgo, ConvDirection, DnnLibrary, ForwardArgs,
    Precision, TensorLayout, TensorShape,
};
use crate::error::{GradForgeError, GradResult};
use crate::layers::{LayerKind, LayerSpec};

/// A parameter tensor: non-owning device handle plus its size. The handle
/// is null until the registry is materialized.
#[derive(Debug, Clone, Copy)]
pub struct TensorParam {
    pub ptr: DevicePtr,
    pub elements: usize,
    pub bytes: usize,
}

impl TensorParam {
    fn sized(elements: usize, precision: Precision) -> Self {
        TensorParam {
            ptr: DevicePtr::NULL,
            elements,
            bytes: elements * precision.elem_bytes(),
        }
    }
}

/// Parameter and auxiliary tensors of one layer. Which fields are populated
/// depends on the kind: Convolution/FullyConnected use weights+bias,
/// BatchNorm uses scale/shift/running stats plus a saved-statistics reserve,
/// Dropout uses only the reserve.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerParams {
    pub weights: Option<TensorParam>,
    pub bias: Option<TensorParam>,
    pub scale: Option<TensorParam>,
    pub shift: Option<TensorParam>,
    pub running_mean: Option<TensorParam>,
    pub running_var: Option<TensorParam>,
    /// Dropout mask reserve or batch-norm saved statistics.
    pub reserve: Option<TensorParam>,
}

impl LayerParams {
    fn iter(&self) -> impl Iterator<Item = &TensorParam> {
        [
            self.weights.as_ref(),
            self.bias.as_ref(),
            self.scale.as_ref(),
            self.shift.as_ref(),
            self.running_mean.as_ref(),
            self.running_var.as_ref(),
            self.reserve.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut TensorParam> {
        [
            self.weights.as_mut(),
            self.bias.as_mut(),
            self.scale.as_mut(),
            self.shift.as_mut(),
            self.running_mean.as_mut(),
            self.running_var.as_mut(),
            self.reserve.as_mut(),
        ]
        .into_iter()
        .flatten()
    }

    /// Total persistent bytes of this layer.
    pub fn bytes_total(&self) -> usize {
        self.iter().map(|p| p.bytes).sum()
    }
}

/// One layer with inferred shapes and (after materialization) parameters.
#[derive(Debug, Clone, Copy)]
pub struct LayerDescriptor {
    pub kind: LayerKind,
    pub fused_activation: Option<crate::dnn::ActivationMode>,
    pub input: TensorShape,
    pub output: TensorShape,
    pub params: LayerParams,
}

/// Ordered, immutable sequence of layer descriptors with shared precision
/// and layout.
#[derive(Debug)]
pub struct LayerRegistry {
    layers: Vec<LayerDescriptor>,
    /// `activation_shapes[i]` is the input to layer i; `[L]` is the output.
    activation_shapes: Vec<TensorShape>,
    precision: Precision,
    layout: TensorLayout,
    batch: usize,
    dropout_seed: u64,
    weight_stddev: f64,
    persistent_bytes: usize,
    materialized: bool,
}

impl LayerRegistry {
    /// Shape-infer the spec list and compute all byte sizes. No device
    /// memory is touched; `materialize` does that after planning.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        specs: &[LayerSpec],
        batch: usize,
        input: (usize, usize, usize),
        precision: Precision,
        layout: TensorLayout,
        dropout_seed: u64,
        weight_stddev: f64,
        dnn: &dyn DnnLibrary,
    ) -> GradResult<Self> {
        if specs.is_empty() {
            return Err(GradForgeError::InvalidNetwork("empty layer stack".into()));
        }
        if batch == 0 {
            return Err(GradForgeError::InvalidConfiguration("batch size 0".into()));
        }
        let (c, h, w) = input;
        if c == 0 || h == 0 || w == 0 {
            return Err(GradForgeError::InvalidConfiguration(format!(
                "degenerate input shape {}x{}x{}",
                c, h, w
            )));
        }

        let mut shapes = vec![TensorShape::new(batch, c, h, w)];
        let mut layers = Vec::with_capacity(specs.len());

        for (index, spec) in specs.iter().enumerate() {
            if spec.fused_activation.is_some()
                && !matches!(
                    spec.kind,
                    LayerKind::Convolution(_) | LayerKind::FullyConnected { .. }
                )
            {
                return Err(GradForgeError::InvalidNetwork(format!(
                    "layer {}: fused activation on {}",
                    index,
                    spec.kind.name()
                )));
            }
            if matches!(spec.kind, LayerKind::Softmax) && index != specs.len() - 1 {
                return Err(GradForgeError::InvalidNetwork(format!(
                    "layer {}: softmax must be the final layer",
                    index
                )));
            }

            let input_shape = *shapes.last().expect("shape table is never empty");
            let output_shape = infer_output_shape(index, &spec.kind, input_shape)?;
            let params = build_params(&spec.kind, input_shape, precision, dnn);

            layers.push(LayerDescriptor {
                kind: spec.kind,
                fused_activation: spec.fused_activation,
                input: input_shape,
                output: output_shape,
                params,
            });
            shapes.push(output_shape);
        }

        let persistent_bytes = layers.iter().map(|l| l.params.bytes_total()).sum();

        Ok(LayerRegistry {
            layers,
            activation_shapes: shapes,
            precision,
            layout,
            batch,
            dropout_seed,
            weight_stddev,
            persistent_bytes,
            materialized: false,
        })
    }

    /// Allocate and initialize all parameter and reserve tensors directly
    /// from the device runtime. Weights are gaussian with the configured
    /// stddev (seeded per layer), biases zero, batch-norm scale/variance one.
    pub fn materialize(&mut self, runtime: &dyn DeviceRuntime) -> GradResult<()> {
        if self.materialized {
            return Err(GradForgeError::Internal(
                "registry materialized twice".into(),
            ));
        }
        let precision = self.precision;
        let stddev = self.weight_stddev;
        let seed = self.dropout_seed;

        for (index, layer) in self.layers.iter_mut().enumerate() {
            let mut rng = ChaCha8Rng::seed_from_u64(
                seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            );
            if let Some(weights) = layer.params.weights.as_mut() {
                weights.ptr = runtime.alloc_device(weights.bytes)?;
                let init = gaussian_bytes(weights.elements, stddev, precision, &mut rng);
                runtime.upload(weights.ptr, &init)?;
            }
            if let Some(bias) = layer.params.bias.as_mut() {
                bias.ptr = runtime.alloc_device(bias.bytes)?;
                runtime.upload(bias.ptr, &constant_bytes(bias.elements, 0.0, precision))?;
            }
            if let Some(scale) = layer.params.scale.as_mut() {
                scale.ptr = runtime.alloc_device(scale.bytes)?;
                runtime.upload(scale.ptr, &constant_bytes(scale.elements, 1.0, precision))?;
            }
            if let Some(shift) = layer.params.shift.as_mut() {
                shift.ptr = runtime.alloc_device(shift.bytes)?;
                runtime.upload(shift.ptr, &constant_bytes(shift.elements, 0.0, precision))?;
            }
            if let Some(mean) = layer.params.running_mean.as_mut() {
                mean.ptr = runtime.alloc_device(mean.bytes)?;
                runtime.upload(mean.ptr, &constant_bytes(mean.elements, 0.0, precision))?;
            }
            if let Some(var) = layer.params.running_var.as_mut() {
                var.ptr = runtime.alloc_device(var.bytes)?;
                runtime.upload(var.ptr, &constant_bytes(var.elements, 1.0, precision))?;
            }
            if let Some(reserve) = layer.params.reserve.as_mut() {
                // Fully written by the producing forward pass before any read.
                reserve.ptr = runtime.alloc_device(reserve.bytes)?;
            }
            tracing::trace!(
                layer = index,
                kind = layer.kind.name(),
                bytes = layer.params.bytes_total(),
                "registry: materialized layer parameters"
            );
        }

        self.materialized = true;
        tracing::debug!(
            layers = self.layers.len(),
            persistent_bytes = self.persistent_bytes,
            "registry: materialization complete"
        );
        Ok(())
    }

    /// Free every persistent tensor. Called at engine teardown.
    pub fn release(&mut self, runtime: &dyn DeviceRuntime) {
        if !self.materialized {
            return;
        }
        for layer in self.layers.iter_mut() {
            for param in layer.params.iter_mut() {
                if !param.ptr.is_null() {
                    if let Err(err) = runtime.free_device(param.ptr) {
                        tracing::warn!(%err, "registry: failed to free parameter tensor");
                    }
                    param.ptr = DevicePtr::NULL;
                }
            }
        }
        self.materialized = false;
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> &LayerDescriptor {
        &self.layers[index]
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn dropout_seed(&self) -> u64 {
        self.dropout_seed
    }

    /// Shape of `activation[index]`, `index` in `0..=len()`.
    pub fn activation_shape(&self, index: usize) -> TensorShape {
        self.activation_shapes[index]
    }

    /// Byte size of `activation[index]` (gradients are sized identically).
    pub fn activation_bytes(&self, index: usize) -> usize {
        self.activation_shapes[index].bytes(self.precision)
    }

    /// Classes per sample in the network output.
    pub fn num_classes(&self) -> usize {
        self.activation_shapes[self.len()].sample_elements()
    }

    /// Total persistent bytes (parameters, reserves, statistics).
    pub fn persistent_bytes(&self) -> usize {
        self.persistent_bytes
    }

    /// Index of the last layer that is not Activation/Softmax - the layer
    /// the offload policies exempt. `None` for a degenerate stack of only
    /// Activation/Softmax layers (behavior then intentionally unspecified).
    pub fn last_offloadable(&self) -> Option<usize> {
        self.layers
            .iter()
            .rposition(|l| !l.kind.is_activation_like())
    }

    /// Select a convolution algorithm for `direction` under the given
    /// preference and discipline, against `free_bytes` of headroom.
    /// `None` means no algorithm fits under hard discipline.
    pub fn select_conv_algo(
        &self,
        dnn: &dyn DnnLibrary,
        index: usize,
        direction: ConvDirection,
        pref: AlgoPreference,
        hard: bool,
        free_bytes: usize,
    ) -> GradResult<Option<AlgoCandidate>> {
        let desc = self.layer(index);
        debug_assert!(desc.kind.is_convolution());
        let candidates = dnn.conv_algorithms(desc, direction)?;
        if candidates.is_empty() {
            return Err(GradForgeError::FatalPrimitive {
                layer: index,
                reason: format!("no convolution algorithms for {:?}", direction),
            });
        }

        let fitting_fastest = candidates
            .iter()
            .find(|c| c.workspace_bytes <= free_bytes)
            .copied();
        let choice = match (pref, hard) {
            (AlgoPreference::PerformanceOptimal, true) => fitting_fastest,
            (AlgoPreference::MemoryOptimal, true) => candidates
                .iter()
                .min_by_key(|c| c.workspace_bytes)
                .filter(|c| c.workspace_bytes <= free_bytes)
                .copied(),
            // Soft: prefer speed within the budget, degrade to the smallest
            // workspace instead of failing.
            (_, false) => fitting_fastest.or_else(|| {
                candidates
                    .iter()
                    .min_by_key(|c| c.workspace_bytes)
                    .copied()
            }),
        };
        Ok(choice)
    }

    /// Workspace requirement for the selection `select_conv_algo` would
    /// make; `None` means infeasible under hard discipline.
    pub fn workspace_bytes(
        &self,
        dnn: &dyn DnnLibrary,
        index: usize,
        direction: ConvDirection,
        pref: AlgoPreference,
        hard: bool,
        free_bytes: usize,
    ) -> GradResult<Option<usize>> {
        Ok(self
            .select_conv_algo(dnn, index, direction, pref, hard, free_bytes)?
            .map(|c| c.workspace_bytes))
    }

    /// Invoke one layer's forward primitive.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        dnn: &dyn DnnLibrary,
        index: usize,
        input: DevicePtr,
        output: DevicePtr,
        workspace: Option<(DevicePtr, usize)>,
        algo: Option<ConvAlgo>,
        training: bool,
    ) -> GradResult<()> {
        dnn.forward(ForwardArgs {
            layer: index,
            desc: self.layer(index),
            input,
            output,
            workspace,
            algo,
            training,
        })
    }

    /// Invoke one layer's backward primitive (parameter update included).
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &self,
        dnn: &dyn DnnLibrary,
        index: usize,
        fwd_input: DevicePtr,
        fwd_output: DevicePtr,
        grad_output: DevicePtr,
        grad_input: Option<DevicePtr>,
        workspace: Option<(DevicePtr, usize)>,
        algos: Option<(ConvAlgo, ConvAlgo)>,
        learning_rate: f32,
    ) -> GradResult<()> {
        dnn.backward(BackwardArgs {
            layer: index,
            desc: self.layer(index),
            fwd_input,
            fwd_output,
            grad_output,
            grad_input,
            workspace,
            algos,
            learning_rate,
        })
    }
}

fn infer_output_shape(
    index: usize,
    kind: &LayerKind,
    input: TensorShape,
) -> GradResult<TensorShape> {
    let out = match kind {
        LayerKind::Convolution(geom) => {
            let padded_h = input.h + 2 * geom.padding;
            let padded_w = input.w + 2 * geom.padding;
            if geom.kernel_h > padded_h || geom.kernel_w > padded_w || geom.stride == 0 {
                return Err(GradForgeError::InvalidNetwork(format!(
                    "layer {}: convolution {}x{} stride {} does not fit input {}",
                    index, geom.kernel_h, geom.kernel_w, geom.stride, input
                )));
            }
            TensorShape::new(
                input.n,
                geom.out_channels,
                (padded_h - geom.kernel_h) / geom.stride + 1,
                (padded_w - geom.kernel_w) / geom.stride + 1,
            )
        }
        LayerKind::FullyConnected { outputs } => {
            if *outputs == 0 {
                return Err(GradForgeError::InvalidNetwork(format!(
                    "layer {}: fully-connected with 0 outputs",
                    index
                )));
            }
            TensorShape::new(input.n, *outputs, 1, 1)
        }
        LayerKind::Pooling(geom) => {
            let padded_h = input.h + 2 * geom.padding;
            let padded_w = input.w + 2 * geom.padding;
            if geom.window > padded_h || geom.window > padded_w || geom.stride == 0 {
                return Err(GradForgeError::InvalidNetwork(format!(
                    "layer {}: pooling window {} stride {} does not fit input {}",
                    index, geom.window, geom.stride, input
                )));
            }
            TensorShape::new(
                input.n,
                input.c,
                (padded_h - geom.window) / geom.stride + 1,
                (padded_w - geom.window) / geom.stride + 1,
            )
        }
        LayerKind::Dropout(_)
        | LayerKind::BatchNorm(_)
        | LayerKind::Activation(_)
        | LayerKind::Softmax => input,
    };
    Ok(out)
}

fn build_params(
    kind: &LayerKind,
    input: TensorShape,
    precision: Precision,
    dnn: &dyn DnnLibrary,
) -> LayerParams {
    let mut params = LayerParams::default();
    match kind {
        LayerKind::Convolution(geom) => {
            let weight_elems = geom.out_channels * input.c * geom.kernel_h * geom.kernel_w;
            params.weights = Some(TensorParam::sized(weight_elems, precision));
            params.bias = Some(TensorParam::sized(geom.out_channels, precision));
        }
        LayerKind::FullyConnected { outputs } => {
            params.weights = Some(TensorParam::sized(
                outputs * input.sample_elements(),
                precision,
            ));
            params.bias = Some(TensorParam::sized(*outputs, precision));
        }
        LayerKind::BatchNorm(_) => {
            params.scale = Some(TensorParam::sized(input.c, precision));
            params.shift = Some(TensorParam::sized(input.c, precision));
            params.running_mean = Some(TensorParam::sized(input.c, precision));
            params.running_var = Some(TensorParam::sized(input.c, precision));
            let stats = dnn.batchnorm_stats_bytes(input.c, precision);
            params.reserve = Some(TensorParam {
                ptr: DevicePtr::NULL,
                elements: stats / precision.elem_bytes(),
                bytes: stats,
            });
        }
        LayerKind::Dropout(_) => {
            let reserve = dnn.dropout_reserve_bytes(&input, precision);
            params.reserve = Some(TensorParam {
                ptr: DevicePtr::NULL,
                elements: reserve / precision.elem_bytes(),
                bytes: reserve,
            });
        }
        LayerKind::Pooling(_) | LayerKind::Activation(_) | LayerKind::Softmax => {}
    }
    params
}

fn gaussian_bytes(
    elements: usize,
    stddev: f64,
    precision: Precision,
    rng: &mut ChaCha8Rng,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(elements * precision.elem_bytes());
    for _ in 0..elements {
        // Box-Muller transform.
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let value = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * stddev;
        match precision {
            Precision::Float32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Precision::Float64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
    out
}

fn constant_bytes(elements: usize, value: f64, precision: Precision) -> Vec<u8> {
    let mut out = Vec::with_capacity(elements * precision.elem_bytes());
    for _ in 0..elements {
        match precision {
            Precision::Float32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Precision::Float64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnn::{ActivationMode, PoolMode};
    use crate::error::GradResult as Result_;

    /// Minimal primitive library for metadata tests: realistic byte
    /// queries, no compute.
    struct StubDnn;

    impl DnnLibrary for StubDnn {
        fn prepare(&self, _registry: &LayerRegistry) -> Result_<()> {
            Ok(())
        }

        fn attach_stream(&self, _compute: crate::device::StreamHandle) -> Result_<()> {
            Ok(())
        }

        fn conv_algorithms(
            &self,
            desc: &LayerDescriptor,
            _direction: ConvDirection,
        ) -> Result_<Vec<AlgoCandidate>> {
            let im2col = desc.output.h * desc.output.w * desc.input.c * 9 * 4 * desc.input.n;
            Ok(vec![
                AlgoCandidate {
                    algo: ConvAlgo::Gemm,
                    workspace_bytes: im2col,
                },
                AlgoCandidate {
                    algo: ConvAlgo::Direct,
                    workspace_bytes: 0,
                },
            ])
        }

        fn dropout_reserve_bytes(&self, shape: &TensorShape, precision: Precision) -> usize {
            shape.bytes(precision)
        }

        fn batchnorm_stats_bytes(&self, channels: usize, precision: Precision) -> usize {
            2 * channels * precision.elem_bytes()
        }

        fn forward(&self, _args: ForwardArgs<'_>) -> Result_<()> {
            Ok(())
        }

        fn backward(&self, _args: BackwardArgs<'_>) -> Result_<()> {
            Ok(())
        }
    }

    fn small_stack() -> Vec<LayerSpec> {
        vec![
            LayerSpec::convolution(8, 3, 1, 1),
            LayerSpec::activation(ActivationMode::Relu),
            LayerSpec::pooling(PoolMode::Max, 2, 2),
            LayerSpec::fully_connected(10),
            LayerSpec::softmax(),
        ]
    }

    fn build_small() -> LayerRegistry {
        LayerRegistry::build(
            &small_stack(),
            4,
            (3, 8, 8),
            Precision::Float32,
            TensorLayout::Nchw,
            42,
            0.01,
            &StubDnn,
        )
        .unwrap()
    }

    #[test]
    fn test_shape_inference() {
        let registry = build_small();
        assert_eq!(registry.activation_shape(0), TensorShape::new(4, 3, 8, 8));
        // 3x3 conv, pad 1, stride 1 preserves spatial dims.
        assert_eq!(registry.activation_shape(1), TensorShape::new(4, 8, 8, 8));
        assert_eq!(registry.activation_shape(2), TensorShape::new(4, 8, 8, 8));
        // 2x2/2 max pool halves them.
        assert_eq!(registry.activation_shape(3), TensorShape::new(4, 8, 4, 4));
        assert_eq!(registry.activation_shape(4), TensorShape::new(4, 10, 1, 1));
        assert_eq!(registry.activation_shape(5), TensorShape::new(4, 10, 1, 1));
        assert_eq!(registry.num_classes(), 10);
    }

    #[test]
    fn test_persistent_bytes_cover_params_and_reserves() {
        let registry = build_small();
        // conv: 8*3*3*3 weights + 8 bias; fc: 10*128 weights + 10 bias.
        let expected = (8 * 3 * 3 * 3 + 8 + 10 * 8 * 4 * 4 + 10) * 4;
        assert_eq!(registry.persistent_bytes(), expected);
    }

    #[test]
    fn test_last_offloadable_skips_trailing_act_softmax() {
        let registry = build_small();
        // fc (index 3) is the last non-Activation/Softmax layer.
        assert_eq!(registry.last_offloadable(), Some(3));
    }

    #[test]
    fn test_softmax_must_be_last() {
        let specs = vec![LayerSpec::softmax(), LayerSpec::fully_connected(10)];
        let err = LayerRegistry::build(
            &specs,
            4,
            (3, 8, 8),
            Precision::Float32,
            TensorLayout::Nchw,
            0,
            0.01,
            &StubDnn,
        )
        .unwrap_err();
        assert!(matches!(err, GradForgeError::InvalidNetwork(_)));
    }

    #[test]
    fn test_fused_activation_rejected_on_pooling() {
        let specs = vec![LayerSpec::pooling(PoolMode::Max, 2, 2)
            .with_fused_activation(ActivationMode::Relu)];
        assert!(LayerRegistry::build(
            &specs,
            4,
            (3, 8, 8),
            Precision::Float32,
            TensorLayout::Nchw,
            0,
            0.01,
            &StubDnn,
        )
        .is_err());
    }

    #[test]
    fn test_algo_selection_policies() {
        let registry = build_small();
        let dnn = StubDnn;
        let gemm_ws = registry
            .select_conv_algo(
                &dnn,
                0,
                ConvDirection::Forward,
                AlgoPreference::PerformanceOptimal,
                true,
                usize::MAX,
            )
            .unwrap()
            .unwrap();
        assert_eq!(gemm_ws.algo, ConvAlgo::Gemm);

        // Hard + tiny budget: performance-optimal falls through to the
        // zero-workspace algorithm; memory-optimal picks it directly.
        let direct = registry
            .select_conv_algo(
                &dnn,
                0,
                ConvDirection::Forward,
                AlgoPreference::PerformanceOptimal,
                true,
                16,
            )
            .unwrap()
            .unwrap();
        assert_eq!(direct.algo, ConvAlgo::Direct);
        let mem = registry
            .select_conv_algo(
                &dnn,
                0,
                ConvDirection::Forward,
                AlgoPreference::MemoryOptimal,
                true,
                usize::MAX,
            )
            .unwrap()
            .unwrap();
        assert_eq!(mem.algo, ConvAlgo::Direct);

        // Soft never fails even with a zero budget... and the stub's
        // cheapest algorithm needs no workspace anyway.
        let soft = registry
            .select_conv_algo(
                &dnn,
                0,
                ConvDirection::Forward,
                AlgoPreference::PerformanceOptimal,
                false,
                0,
            )
            .unwrap()
            .unwrap();
        assert_eq!(soft.algo, ConvAlgo::Direct);
    }

    #[test]
    fn test_materialize_and_release_round_trip() {
        use crate::device::host::HostRuntime;

        let mut registry = build_small();
        let runtime = HostRuntime::with_capacity(64 * 1024 * 1024);
        registry.materialize(runtime.as_ref()).unwrap();
        assert_eq!(runtime.device_used(), registry.persistent_bytes());
        assert!(!registry.layer(0).params.weights.unwrap().ptr.is_null());

        registry.release(runtime.as_ref());
        assert_eq!(runtime.device_used(), 0);
    }
}
