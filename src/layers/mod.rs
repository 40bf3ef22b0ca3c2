//! Layer descriptions
//!
//! [`LayerSpec`] is what callers hand to the engine: a layer kind with its
//! geometry, plus an optional fused activation for Convolution and
//! FullyConnected layers. [`registry::LayerRegistry`] turns an ordered spec
//! list into shape-inferred descriptors with materialized parameters.

pub mod registry;

pub use registry::{LayerDescriptor, LayerParams, LayerRegistry, TensorParam};

use serde::{Deserialize, Serialize};

use crate::dnn::{ActivationMode, PoolMode};

/// Convolution geometry. Weights are (K, C, kh, kw); square stride/padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    pub padding: usize,
}

/// Pooling geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolGeometry {
    pub mode: PoolMode,
    pub window: usize,
    pub stride: usize,
    pub padding: usize,
}

/// Dropout geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropoutGeometry {
    /// Probability of zeroing an element during training.
    pub drop_prob: f32,
}

/// Batch normalization geometry (per-channel, spatial).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormGeometry {
    pub epsilon: f64,
    /// Running-statistics exponential-average factor.
    pub momentum: f64,
}

/// The layer kinds this runtime schedules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Convolution(ConvGeometry),
    FullyConnected { outputs: usize },
    Dropout(DropoutGeometry),
    BatchNorm(BatchNormGeometry),
    Pooling(PoolGeometry),
    Activation(ActivationMode),
    Softmax,
}

impl LayerKind {
    pub fn is_convolution(&self) -> bool {
        matches!(self, LayerKind::Convolution(_))
    }

    /// Activation and Softmax layers: compute-fused trailing steps that are
    /// never offloaded and alias their gradients.
    pub fn is_activation_like(&self) -> bool {
        matches!(self, LayerKind::Activation(_) | LayerKind::Softmax)
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Convolution(_) => "conv",
            LayerKind::FullyConnected { .. } => "fc",
            LayerKind::Dropout(_) => "dropout",
            LayerKind::BatchNorm(_) => "batchnorm",
            LayerKind::Pooling(_) => "pool",
            LayerKind::Activation(_) => "activation",
            LayerKind::Softmax => "softmax",
        }
    }
}

/// One layer in a network description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    /// Fused activation applied inside the layer's forward/backward.
    /// Only meaningful for Convolution and FullyConnected.
    pub fused_activation: Option<ActivationMode>,
}

impl LayerSpec {
    pub fn new(kind: LayerKind) -> Self {
        LayerSpec {
            kind,
            fused_activation: None,
        }
    }

    pub fn convolution(out_channels: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        Self::new(LayerKind::Convolution(ConvGeometry {
            out_channels,
            kernel_h: kernel,
            kernel_w: kernel,
            stride,
            padding,
        }))
    }

    pub fn fully_connected(outputs: usize) -> Self {
        Self::new(LayerKind::FullyConnected { outputs })
    }

    pub fn dropout(drop_prob: f32) -> Self {
        Self::new(LayerKind::Dropout(DropoutGeometry { drop_prob }))
    }

    pub fn batch_norm(epsilon: f64, momentum: f64) -> Self {
        Self::new(LayerKind::BatchNorm(BatchNormGeometry { epsilon, momentum }))
    }

    pub fn pooling(mode: PoolMode, window: usize, stride: usize) -> Self {
        Self::new(LayerKind::Pooling(PoolGeometry {
            mode,
            window,
            stride,
            padding: 0,
        }))
    }

    pub fn activation(mode: ActivationMode) -> Self {
        Self::new(LayerKind::Activation(mode))
    }

    pub fn softmax() -> Self {
        Self::new(LayerKind::Softmax)
    }

    /// Fuse an activation into a Convolution or FullyConnected layer.
    pub fn with_fused_activation(mut self, mode: ActivationMode) -> Self {
        self.fused_activation = Some(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(LayerSpec::convolution(8, 3, 1, 1).kind.is_convolution());
        assert!(LayerSpec::softmax().kind.is_activation_like());
        assert!(LayerSpec::activation(ActivationMode::Relu)
            .kind
            .is_activation_like());
        assert!(!LayerSpec::fully_connected(10).kind.is_activation_like());
    }

    #[test]
    fn test_names() {
        assert_eq!(LayerSpec::dropout(0.5).kind.name(), "dropout");
        assert_eq!(LayerSpec::batch_norm(1e-5, 0.1).kind.name(), "batchnorm");
    }
}
