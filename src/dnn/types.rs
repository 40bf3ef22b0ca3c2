//! Shared tensor and algorithm types for the primitive-library boundary.

use serde::{Deserialize, Serialize};

/// Numeric precision of every tensor in a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Float32,
    Float64,
}

impl Precision {
    /// Element size in bytes.
    pub fn elem_bytes(&self) -> usize {
        match self {
            Precision::Float32 => 4,
            Precision::Float64 => 8,
        }
    }
}

/// Tensor memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Four-dimensional tensor shape (N, C, H, W).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl TensorShape {
    pub fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        TensorShape { n, c, h, w }
    }

    /// Total element count.
    pub fn elements(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    /// Elements per sample.
    pub fn sample_elements(&self) -> usize {
        self.c * self.h * self.w
    }

    /// Byte size at the given precision.
    pub fn bytes(&self, precision: Precision) -> usize {
        self.elements() * precision.elem_bytes()
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}x{}", self.n, self.c, self.h, self.w)
    }
}

/// Pointwise activation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationMode {
    Relu,
    Sigmoid,
    Tanh,
}

/// Pooling modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolMode {
    Max,
    Average,
}

/// Convolution pass direction, used for algorithm and workspace queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvDirection {
    Forward,
    BackwardFilter,
    BackwardData,
}

/// Convolution algorithm families a primitive library may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvAlgo {
    /// Matrix-multiply over an explicit im2col expansion. Fast, needs a
    /// workspace proportional to the unrolled input.
    Gemm,
    /// Direct (implicit-GEMM) convolution. Zero workspace.
    Direct,
    /// Winograd transform.
    Winograd,
    /// FFT-based convolution.
    Fft,
}

/// One algorithm option: the algorithm and its workspace requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgoCandidate {
    pub algo: ConvAlgo,
    pub workspace_bytes: usize,
}

/// Algorithm selection preference: fastest-first or
/// smallest-workspace-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgoPreference {
    PerformanceOptimal,
    MemoryOptimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_bytes() {
        let shape = TensorShape::new(32, 3, 28, 28);
        assert_eq!(shape.elements(), 32 * 3 * 28 * 28);
        assert_eq!(shape.bytes(Precision::Float32), shape.elements() * 4);
        assert_eq!(shape.bytes(Precision::Float64), shape.elements() * 8);
        assert_eq!(shape.sample_elements(), 3 * 28 * 28);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(TensorShape::new(1, 2, 3, 4).to_string(), "1x2x3x4");
    }
}
