//! DNN primitive-library boundary
//!
//! Per-layer numeric kernels are opaque to the core: the executor drives
//! them through the [`DnnLibrary`] trait and only relies on their pre/post
//! memory contract. The trait mirrors what a cuDNN/MIOpen-class library
//! offers this runtime: opaque per-layer state built in `prepare`, explicit
//! compute-stream attachment, convolution algorithm enumeration per
//! direction, and forward/backward invocations. Backward receives the
//! learning rate and applies the SGD update to the layer's parameters in
//! place.
//!
//! [`host::HostDnn`] is the in-tree reference implementation (CPU math on
//! the paired host runtime's compute stream).

pub mod host;
pub mod types;

pub use types::{
    ActivationMode, AlgoCandidate, AlgoPreference, ConvAlgo, ConvDirection, PoolMode, Precision,
    TensorLayout, TensorShape,
};

use crate::device::{DevicePtr, StreamHandle};
use crate::error::GradResult;
use crate::layers::{LayerDescriptor, LayerRegistry};

/// Arguments for one layer's forward invocation.
pub struct ForwardArgs<'a> {
    /// Layer index (diagnostics only).
    pub layer: usize,
    pub desc: &'a LayerDescriptor,
    /// `activation[layer]`.
    pub input: DevicePtr,
    /// `activation[layer + 1]`.
    pub output: DevicePtr,
    /// Convolution workspace, if the layer needs one.
    pub workspace: Option<(DevicePtr, usize)>,
    /// Locked convolution algorithm from the plan.
    pub algo: Option<ConvAlgo>,
    /// Training mode (dropout behaves differently at inference).
    pub training: bool,
}

/// Arguments for one layer's backward invocation.
pub struct BackwardArgs<'a> {
    pub layer: usize,
    pub desc: &'a LayerDescriptor,
    /// The layer's forward input, `activation[layer]`.
    pub fwd_input: DevicePtr,
    /// The layer's forward output, `activation[layer + 1]`.
    pub fwd_output: DevicePtr,
    /// Upstream gradient feeding this layer, `grad[layer + 1]`.
    pub grad_output: DevicePtr,
    /// Data gradient to produce, `grad[layer]`. `None` for layer 0.
    pub grad_input: Option<DevicePtr>,
    /// Convolution workspace sized at max(bwd-filter, bwd-data).
    pub workspace: Option<(DevicePtr, usize)>,
    /// Locked (backward-filter, backward-data) algorithms from the plan.
    pub algos: Option<(ConvAlgo, ConvAlgo)>,
    /// SGD step size; the primitive updates parameters in place.
    pub learning_rate: f32,
}

/// The primitive-library seam.
///
/// Implementations enqueue their kernels on the attached compute stream;
/// completion is observed through the runtime's stream synchronization.
pub trait DnnLibrary: Send + Sync {
    /// Build opaque per-layer state (dropout RNGs, cached geometry). Called
    /// once, after registry metadata exists and before any invocation.
    fn prepare(&self, registry: &LayerRegistry) -> GradResult<()>;

    /// Attach the compute stream all kernels enqueue on.
    fn attach_stream(&self, compute: StreamHandle) -> GradResult<()>;

    /// Enumerate convolution algorithms for a layer and direction, ordered
    /// fastest first, each with its workspace requirement.
    fn conv_algorithms(
        &self,
        desc: &LayerDescriptor,
        direction: ConvDirection,
    ) -> GradResult<Vec<AlgoCandidate>>;

    /// Dropout reserve-space requirement for a layer of the given shape.
    fn dropout_reserve_bytes(&self, shape: &TensorShape, precision: Precision) -> usize;

    /// Batch-norm saved-statistics allocation for the given channel count.
    fn batchnorm_stats_bytes(&self, channels: usize, precision: Precision) -> usize;

    /// Run one layer's forward pass on the compute stream.
    fn forward(&self, args: ForwardArgs<'_>) -> GradResult<()>;

    /// Run one layer's backward pass on the compute stream, applying the
    /// parameter update in place.
    fn backward(&self, args: BackwardArgs<'_>) -> GradResult<()>;
}
