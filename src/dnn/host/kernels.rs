//! Reference CPU kernels (f32, NCHW)
//!
//! Straightforward implementations of the seven layer kinds, batch-parallel
//! with rayon where it pays. Backward kernels apply the SGD parameter
//! update in place after producing the data gradient, so data gradients
//! always see the pre-step weights.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::dnn::{ActivationMode, PoolMode};

/// Convolution geometry flattened for kernel use.
#[derive(Debug, Clone, Copy)]
pub struct ConvDims {
    pub batch: usize,
    pub in_c: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvDims {
    pub fn in_sample(&self) -> usize {
        self.in_c * self.in_h * self.in_w
    }

    pub fn out_sample(&self) -> usize {
        self.out_c * self.out_h * self.out_w
    }

    /// im2col matrix: (in_c * kh * kw) x (out_h * out_w) per sample.
    pub fn im2col_elements(&self) -> usize {
        self.in_c * self.kernel_h * self.kernel_w * self.out_h * self.out_w
    }
}

#[inline]
fn activate(value: f32, mode: ActivationMode) -> f32 {
    match mode {
        ActivationMode::Relu => value.max(0.0),
        ActivationMode::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        ActivationMode::Tanh => value.tanh(),
    }
}

/// Derivative expressed through the forward OUTPUT, which is all the
/// backward pass keeps around.
#[inline]
fn activate_grad_from_output(output: f32, mode: ActivationMode) -> f32 {
    match mode {
        ActivationMode::Relu => {
            if output > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        ActivationMode::Sigmoid => output * (1.0 - output),
        ActivationMode::Tanh => 1.0 - output * output,
    }
}

pub fn conv2d_forward_direct(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    y: &mut [f32],
    dims: &ConvDims,
    fused: Option<ActivationMode>,
) {
    let out_sample = dims.out_sample();
    y.par_chunks_mut(out_sample).enumerate().for_each(|(n, y_n)| {
        let x_n = &x[n * dims.in_sample()..(n + 1) * dims.in_sample()];
        for k in 0..dims.out_c {
            for oh in 0..dims.out_h {
                for ow in 0..dims.out_w {
                    let mut acc = b[k];
                    for c in 0..dims.in_c {
                        for kh in 0..dims.kernel_h {
                            let ih = (oh * dims.stride + kh) as isize - dims.padding as isize;
                            if ih < 0 || ih >= dims.in_h as isize {
                                continue;
                            }
                            for kw in 0..dims.kernel_w {
                                let iw =
                                    (ow * dims.stride + kw) as isize - dims.padding as isize;
                                if iw < 0 || iw >= dims.in_w as isize {
                                    continue;
                                }
                                let x_idx =
                                    (c * dims.in_h + ih as usize) * dims.in_w + iw as usize;
                                let w_idx = ((k * dims.in_c + c) * dims.kernel_h + kh)
                                    * dims.kernel_w
                                    + kw;
                                acc += x_n[x_idx] * w[w_idx];
                            }
                        }
                    }
                    let y_idx = (k * dims.out_h + oh) * dims.out_w + ow;
                    y_n[y_idx] = match fused {
                        Some(mode) => activate(acc, mode),
                        None => acc,
                    };
                }
            }
        }
    });
}

/// GEMM-algorithm forward: unroll each sample into the workspace
/// (im2col), then multiply. Numerically identical to the direct kernel;
/// the point is the workspace contract.
pub fn conv2d_forward_gemm(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    y: &mut [f32],
    workspace: &mut [f32],
    dims: &ConvDims,
    fused: Option<ActivationMode>,
) {
    let cols = dims.out_h * dims.out_w;
    let rows = dims.in_c * dims.kernel_h * dims.kernel_w;
    let per_sample = rows * cols;
    debug_assert!(workspace.len() >= dims.batch * per_sample);

    y.par_chunks_mut(dims.out_sample())
        .zip(workspace.par_chunks_mut(per_sample))
        .enumerate()
        .for_each(|(n, (y_n, col))| {
            let x_n = &x[n * dims.in_sample()..(n + 1) * dims.in_sample()];
            // im2col
            for c in 0..dims.in_c {
                for kh in 0..dims.kernel_h {
                    for kw in 0..dims.kernel_w {
                        let row = (c * dims.kernel_h + kh) * dims.kernel_w + kw;
                        for oh in 0..dims.out_h {
                            let ih = (oh * dims.stride + kh) as isize - dims.padding as isize;
                            for ow in 0..dims.out_w {
                                let iw =
                                    (ow * dims.stride + kw) as isize - dims.padding as isize;
                                let value = if ih < 0
                                    || ih >= dims.in_h as isize
                                    || iw < 0
                                    || iw >= dims.in_w as isize
                                {
                                    0.0
                                } else {
                                    x_n[(c * dims.in_h + ih as usize) * dims.in_w + iw as usize]
                                };
                                col[row * cols + oh * dims.out_w + ow] = value;
                            }
                        }
                    }
                }
            }
            // y = W * col + b
            for k in 0..dims.out_c {
                let w_row = &w[k * rows..(k + 1) * rows];
                for col_idx in 0..cols {
                    let mut acc = b[k];
                    for row in 0..rows {
                        acc += w_row[row] * col[row * cols + col_idx];
                    }
                    y_n[k * cols + col_idx] = match fused {
                        Some(mode) => activate(acc, mode),
                        None => acc,
                    };
                }
            }
        });
}

/// Convolution backward: data gradient with pre-step weights, then the
/// in-place SGD update of weights and bias.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_backward(
    x: &[f32],
    y: &[f32],
    dy: &[f32],
    mut dx: Option<&mut [f32]>,
    w: &mut [f32],
    b: &mut [f32],
    dims: &ConvDims,
    fused: Option<ActivationMode>,
    lr: f32,
) {
    // Fused activation backward first: dz = dy * act'(y).
    let dz: Vec<f32> = match fused {
        Some(mode) => dy
            .iter()
            .zip(y.iter())
            .map(|(g, out)| g * activate_grad_from_output(*out, mode))
            .collect(),
        None => dy.to_vec(),
    };

    if let Some(dx) = dx.as_deref_mut() {
        let in_sample = dims.in_sample();
        dx.par_chunks_mut(in_sample).enumerate().for_each(|(n, dx_n)| {
            let dz_n = &dz[n * dims.out_sample()..(n + 1) * dims.out_sample()];
            dx_n.fill(0.0);
            for k in 0..dims.out_c {
                for oh in 0..dims.out_h {
                    for ow in 0..dims.out_w {
                        let g = dz_n[(k * dims.out_h + oh) * dims.out_w + ow];
                        if g == 0.0 {
                            continue;
                        }
                        for c in 0..dims.in_c {
                            for kh in 0..dims.kernel_h {
                                let ih =
                                    (oh * dims.stride + kh) as isize - dims.padding as isize;
                                if ih < 0 || ih >= dims.in_h as isize {
                                    continue;
                                }
                                for kw in 0..dims.kernel_w {
                                    let iw = (ow * dims.stride + kw) as isize
                                        - dims.padding as isize;
                                    if iw < 0 || iw >= dims.in_w as isize {
                                        continue;
                                    }
                                    let w_idx = ((k * dims.in_c + c) * dims.kernel_h + kh)
                                        * dims.kernel_w
                                        + kw;
                                    dx_n[(c * dims.in_h + ih as usize) * dims.in_w
                                        + iw as usize] += g * w[w_idx];
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    // Weight update: each output channel's filter slice is independent.
    let filter_len = dims.in_c * dims.kernel_h * dims.kernel_w;
    w.par_chunks_mut(filter_len).enumerate().for_each(|(k, w_k)| {
        for c in 0..dims.in_c {
            for kh in 0..dims.kernel_h {
                for kw in 0..dims.kernel_w {
                    let mut acc = 0.0f32;
                    for n in 0..dims.batch {
                        let x_n = &x[n * dims.in_sample()..(n + 1) * dims.in_sample()];
                        let dz_n = &dz[n * dims.out_sample()..(n + 1) * dims.out_sample()];
                        for oh in 0..dims.out_h {
                            let ih = (oh * dims.stride + kh) as isize - dims.padding as isize;
                            if ih < 0 || ih >= dims.in_h as isize {
                                continue;
                            }
                            for ow in 0..dims.out_w {
                                let iw =
                                    (ow * dims.stride + kw) as isize - dims.padding as isize;
                                if iw < 0 || iw >= dims.in_w as isize {
                                    continue;
                                }
                                acc += dz_n[(k * dims.out_h + oh) * dims.out_w + ow]
                                    * x_n[(c * dims.in_h + ih as usize) * dims.in_w
                                        + iw as usize];
                            }
                        }
                    }
                    w_k[(c * dims.kernel_h + kh) * dims.kernel_w + kw] -= lr * acc;
                }
            }
        }
    });
    for k in 0..dims.out_c {
        let mut acc = 0.0f32;
        for n in 0..dims.batch {
            let dz_n = &dz[n * dims.out_sample()..(n + 1) * dims.out_sample()];
            for idx in 0..dims.out_h * dims.out_w {
                acc += dz_n[k * dims.out_h * dims.out_w + idx];
            }
        }
        b[k] -= lr * acc;
    }
}

pub fn fc_forward(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    y: &mut [f32],
    inputs: usize,
    outputs: usize,
    fused: Option<ActivationMode>,
) {
    y.par_chunks_mut(outputs).enumerate().for_each(|(n, y_n)| {
        let x_n = &x[n * inputs..(n + 1) * inputs];
        for o in 0..outputs {
            let w_row = &w[o * inputs..(o + 1) * inputs];
            let mut acc = b[o];
            for i in 0..inputs {
                acc += w_row[i] * x_n[i];
            }
            y_n[o] = match fused {
                Some(mode) => activate(acc, mode),
                None => acc,
            };
        }
    });
}

#[allow(clippy::too_many_arguments)]
pub fn fc_backward(
    x: &[f32],
    y: &[f32],
    dy: &[f32],
    mut dx: Option<&mut [f32]>,
    w: &mut [f32],
    b: &mut [f32],
    batch: usize,
    inputs: usize,
    outputs: usize,
    fused: Option<ActivationMode>,
    lr: f32,
) {
    let dz: Vec<f32> = match fused {
        Some(mode) => dy
            .iter()
            .zip(y.iter())
            .map(|(g, out)| g * activate_grad_from_output(*out, mode))
            .collect(),
        None => dy.to_vec(),
    };

    if let Some(dx) = dx.as_deref_mut() {
        dx.par_chunks_mut(inputs).enumerate().for_each(|(n, dx_n)| {
            let dz_n = &dz[n * outputs..(n + 1) * outputs];
            for i in 0..inputs {
                let mut acc = 0.0f32;
                for o in 0..outputs {
                    acc += dz_n[o] * w[o * inputs + i];
                }
                dx_n[i] = acc;
            }
        });
    }

    w.par_chunks_mut(inputs).enumerate().for_each(|(o, w_o)| {
        for i in 0..inputs {
            let mut acc = 0.0f32;
            for n in 0..batch {
                acc += dz[n * outputs + o] * x[n * inputs + i];
            }
            w_o[i] -= lr * acc;
        }
    });
    for o in 0..outputs {
        let mut acc = 0.0f32;
        for n in 0..batch {
            acc += dz[n * outputs + o];
        }
        b[o] -= lr * acc;
    }
}

/// Pooling geometry flattened for kernel use.
#[derive(Debug, Clone, Copy)]
pub struct PoolDims {
    pub batch: usize,
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub window: usize,
    pub stride: usize,
    pub padding: usize,
}

impl PoolDims {
    fn in_sample(&self) -> usize {
        self.channels * self.in_h * self.in_w
    }

    fn out_sample(&self) -> usize {
        self.channels * self.out_h * self.out_w
    }
}

pub fn pool_forward(x: &[f32], y: &mut [f32], dims: &PoolDims, mode: PoolMode) {
    y.par_chunks_mut(dims.out_sample()).enumerate().for_each(|(n, y_n)| {
        let x_n = &x[n * dims.in_sample()..(n + 1) * dims.in_sample()];
        for c in 0..dims.channels {
            for oh in 0..dims.out_h {
                for ow in 0..dims.out_w {
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for kh in 0..dims.window {
                        let ih = (oh * dims.stride + kh) as isize - dims.padding as isize;
                        if ih < 0 || ih >= dims.in_h as isize {
                            continue;
                        }
                        for kw in 0..dims.window {
                            let iw = (ow * dims.stride + kw) as isize - dims.padding as isize;
                            if iw < 0 || iw >= dims.in_w as isize {
                                continue;
                            }
                            let v = x_n[(c * dims.in_h + ih as usize) * dims.in_w + iw as usize];
                            max = max.max(v);
                            sum += v;
                            count += 1;
                        }
                    }
                    y_n[(c * dims.out_h + oh) * dims.out_w + ow] = match mode {
                        PoolMode::Max => max,
                        // Padding excluded from the average.
                        PoolMode::Average => sum / count.max(1) as f32,
                    };
                }
            }
        }
    });
}

pub fn pool_backward(x: &[f32], dy: &[f32], dx: &mut [f32], dims: &PoolDims, mode: PoolMode) {
    dx.par_chunks_mut(dims.in_sample()).enumerate().for_each(|(n, dx_n)| {
        let x_n = &x[n * dims.in_sample()..(n + 1) * dims.in_sample()];
        let dy_n = &dy[n * dims.out_sample()..(n + 1) * dims.out_sample()];
        dx_n.fill(0.0);
        for c in 0..dims.channels {
            for oh in 0..dims.out_h {
                for ow in 0..dims.out_w {
                    let g = dy_n[(c * dims.out_h + oh) * dims.out_w + ow];
                    match mode {
                        PoolMode::Max => {
                            // Route to the argmax (recomputed from the
                            // forward input; first maximum wins on ties).
                            let mut best = f32::NEG_INFINITY;
                            let mut best_idx = None;
                            for kh in 0..dims.window {
                                let ih =
                                    (oh * dims.stride + kh) as isize - dims.padding as isize;
                                if ih < 0 || ih >= dims.in_h as isize {
                                    continue;
                                }
                                for kw in 0..dims.window {
                                    let iw = (ow * dims.stride + kw) as isize
                                        - dims.padding as isize;
                                    if iw < 0 || iw >= dims.in_w as isize {
                                        continue;
                                    }
                                    let idx = (c * dims.in_h + ih as usize) * dims.in_w
                                        + iw as usize;
                                    if x_n[idx] > best {
                                        best = x_n[idx];
                                        best_idx = Some(idx);
                                    }
                                }
                            }
                            if let Some(idx) = best_idx {
                                dx_n[idx] += g;
                            }
                        }
                        PoolMode::Average => {
                            let mut indices = Vec::new();
                            for kh in 0..dims.window {
                                let ih =
                                    (oh * dims.stride + kh) as isize - dims.padding as isize;
                                if ih < 0 || ih >= dims.in_h as isize {
                                    continue;
                                }
                                for kw in 0..dims.window {
                                    let iw = (ow * dims.stride + kw) as isize
                                        - dims.padding as isize;
                                    if iw < 0 || iw >= dims.in_w as isize {
                                        continue;
                                    }
                                    indices.push(
                                        (c * dims.in_h + ih as usize) * dims.in_w + iw as usize,
                                    );
                                }
                            }
                            let share = g / indices.len().max(1) as f32;
                            for idx in indices {
                                dx_n[idx] += share;
                            }
                        }
                    }
                }
            }
        }
    });
}

/// Batch-norm dims: per-channel statistics over N x H x W.
#[derive(Debug, Clone, Copy)]
pub struct BnDims {
    pub batch: usize,
    pub channels: usize,
    pub spatial: usize,
}

impl BnDims {
    fn sample(&self) -> usize {
        self.channels * self.spatial
    }

    fn per_channel(&self) -> usize {
        self.batch * self.spatial
    }
}

#[inline]
fn bn_index(dims: &BnDims, n: usize, c: usize, s: usize) -> usize {
    n * dims.sample() + c * dims.spatial + s
}

/// Training forward: batch statistics, saved (mean, inv-std) per channel in
/// `saved` (laid out mean[0..C], inv_std[0..C]), running averages updated
/// with `momentum`.
#[allow(clippy::too_many_arguments)]
pub fn batchnorm_forward_training(
    x: &[f32],
    y: &mut [f32],
    scale: &[f32],
    shift: &[f32],
    running_mean: &mut [f32],
    running_var: &mut [f32],
    saved: &mut [f32],
    dims: &BnDims,
    eps: f64,
    momentum: f64,
) {
    let m = dims.per_channel() as f32;
    for c in 0..dims.channels {
        let mut mean = 0.0f32;
        for n in 0..dims.batch {
            for s in 0..dims.spatial {
                mean += x[bn_index(dims, n, c, s)];
            }
        }
        mean /= m;
        let mut var = 0.0f32;
        for n in 0..dims.batch {
            for s in 0..dims.spatial {
                let d = x[bn_index(dims, n, c, s)] - mean;
                var += d * d;
            }
        }
        var /= m;
        let inv_std = 1.0 / (var + eps as f32).sqrt();
        saved[c] = mean;
        saved[dims.channels + c] = inv_std;
        running_mean[c] =
            running_mean[c] * (1.0 - momentum as f32) + mean * momentum as f32;
        running_var[c] = running_var[c] * (1.0 - momentum as f32) + var * momentum as f32;
        for n in 0..dims.batch {
            for s in 0..dims.spatial {
                let idx = bn_index(dims, n, c, s);
                y[idx] = scale[c] * (x[idx] - mean) * inv_std + shift[c];
            }
        }
    }
}

pub fn batchnorm_forward_inference(
    x: &[f32],
    y: &mut [f32],
    scale: &[f32],
    shift: &[f32],
    running_mean: &[f32],
    running_var: &[f32],
    dims: &BnDims,
    eps: f64,
) {
    for c in 0..dims.channels {
        let inv_std = 1.0 / (running_var[c] + eps as f32).sqrt();
        for n in 0..dims.batch {
            for s in 0..dims.spatial {
                let idx = bn_index(dims, n, c, s);
                y[idx] = scale[c] * (x[idx] - running_mean[c]) * inv_std + shift[c];
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn batchnorm_backward(
    x: &[f32],
    dy: &[f32],
    mut dx: Option<&mut [f32]>,
    scale: &mut [f32],
    shift: &mut [f32],
    saved: &[f32],
    dims: &BnDims,
    lr: f32,
) {
    let m = dims.per_channel() as f32;
    for c in 0..dims.channels {
        let mean = saved[c];
        let inv_std = saved[dims.channels + c];
        let mut dscale = 0.0f32;
        let mut dshift = 0.0f32;
        for n in 0..dims.batch {
            for s in 0..dims.spatial {
                let idx = bn_index(dims, n, c, s);
                let xhat = (x[idx] - mean) * inv_std;
                dscale += dy[idx] * xhat;
                dshift += dy[idx];
            }
        }
        if let Some(dx) = dx.as_deref_mut() {
            let k = scale[c] * inv_std / m;
            for n in 0..dims.batch {
                for s in 0..dims.spatial {
                    let idx = bn_index(dims, n, c, s);
                    let xhat = (x[idx] - mean) * inv_std;
                    dx[idx] = k * (m * dy[idx] - dshift - xhat * dscale);
                }
            }
        }
        scale[c] -= lr * dscale;
        shift[c] -= lr * dshift;
    }
}

/// Inverted dropout: surviving elements scale by 1/keep so inference is a
/// pass-through. The mask persists in the layer's reserve space for
/// backward.
pub fn dropout_forward(x: &[f32], y: &mut [f32], mask: &mut [f32], keep: f32, rng: &mut ChaCha8Rng) {
    for i in 0..x.len() {
        let keep_it: f32 = rng.gen();
        mask[i] = if keep_it < keep { 1.0 / keep } else { 0.0 };
        y[i] = x[i] * mask[i];
    }
}

pub fn dropout_backward(dy: &[f32], dx: &mut [f32], mask: &[f32]) {
    for i in 0..dy.len() {
        dx[i] = dy[i] * mask[i];
    }
}

pub fn activation_forward(x: &[f32], y: &mut [f32], mode: ActivationMode) {
    for (out, v) in y.iter_mut().zip(x.iter()) {
        *out = activate(*v, mode);
    }
}

/// Two-buffer activation backward.
pub fn activation_backward(y: &[f32], dy: &[f32], dx: &mut [f32], mode: ActivationMode) {
    for i in 0..dy.len() {
        dx[i] = dy[i] * activate_grad_from_output(y[i], mode);
    }
}

/// In-place variant for the aliased-gradient path (`grad[i] == grad[i+1]`).
pub fn activation_backward_inplace(y: &[f32], dydx: &mut [f32], mode: ActivationMode) {
    for i in 0..dydx.len() {
        dydx[i] *= activate_grad_from_output(y[i], mode);
    }
}

pub fn softmax_forward(x: &[f32], y: &mut [f32], classes: usize) {
    for (x_row, y_row) in x.chunks_exact(classes).zip(y.chunks_exact_mut(classes)) {
        softmax_row(x_row, y_row);
    }
}

/// In-place variant for the fused trailing softmax (output aliases input).
pub fn softmax_forward_inplace(data: &mut [f32], classes: usize) {
    for row in data.chunks_exact_mut(classes) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

fn softmax_row(x: &[f32], y: &mut [f32]) {
    let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (out, v) in y.iter_mut().zip(x.iter()) {
        *out = (*v - max).exp();
        sum += *out;
    }
    for out in y.iter_mut() {
        *out /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn conv_dims_3x3() -> ConvDims {
        ConvDims {
            batch: 2,
            in_c: 2,
            in_h: 4,
            in_w: 4,
            out_c: 3,
            out_h: 4,
            out_w: 4,
            kernel_h: 3,
            kernel_w: 3,
            stride: 1,
            padding: 1,
        }
    }

    fn filled(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_conv_gemm_matches_direct() {
        let dims = conv_dims_3x3();
        let x = filled(dims.batch * dims.in_sample(), 1);
        let w = filled(dims.out_c * dims.in_c * 9, 2);
        let b = filled(dims.out_c, 3);
        let mut y_direct = vec![0.0; dims.batch * dims.out_sample()];
        let mut y_gemm = vec![0.0; dims.batch * dims.out_sample()];
        let mut workspace = vec![0.0; dims.batch * dims.im2col_elements()];

        conv2d_forward_direct(&x, &w, &b, &mut y_direct, &dims, None);
        conv2d_forward_gemm(&x, &w, &b, &mut y_gemm, &mut workspace, &dims, None);
        for (a, g) in y_direct.iter().zip(y_gemm.iter()) {
            assert!((a - g).abs() < 1e-4, "direct {} vs gemm {}", a, g);
        }
    }

    #[test]
    fn test_conv_backward_data_gradient_finite_difference() {
        let dims = ConvDims {
            batch: 1,
            in_c: 1,
            in_h: 3,
            in_w: 3,
            out_c: 1,
            out_h: 3,
            out_w: 3,
            kernel_h: 3,
            kernel_w: 3,
            stride: 1,
            padding: 1,
        };
        let x = filled(9, 4);
        let w0 = filled(9, 5);
        let b0 = filled(1, 6);
        let dy = filled(9, 7);

        // Analytic dx (lr = 0 keeps the weights untouched).
        let mut y = vec![0.0; 9];
        conv2d_forward_direct(&x, &w0, &b0, &mut y, &dims, None);
        let mut dx = vec![0.0; 9];
        let mut w = w0.clone();
        let mut b = b0.clone();
        conv2d_backward(&x, &y, &dy, Some(&mut dx), &mut w, &mut b, &dims, None, 0.0);

        // Finite difference of loss = sum(y * dy) in each input element.
        let h = 1e-3f32;
        for i in 0..x.len() {
            let mut x_plus = x.clone();
            x_plus[i] += h;
            let mut x_minus = x.clone();
            x_minus[i] -= h;
            let mut y_plus = vec![0.0; 9];
            let mut y_minus = vec![0.0; 9];
            conv2d_forward_direct(&x_plus, &w0, &b0, &mut y_plus, &dims, None);
            conv2d_forward_direct(&x_minus, &w0, &b0, &mut y_minus, &dims, None);
            let loss_plus: f32 = y_plus.iter().zip(dy.iter()).map(|(a, g)| a * g).sum();
            let loss_minus: f32 = y_minus.iter().zip(dy.iter()).map(|(a, g)| a * g).sum();
            let numeric = (loss_plus - loss_minus) / (2.0 * h);
            assert!(
                (numeric - dx[i]).abs() < 1e-2,
                "dx[{}]: analytic {} vs numeric {}",
                i,
                dx[i],
                numeric
            );
        }
    }

    #[test]
    fn test_conv_backward_applies_sgd_update() {
        let dims = conv_dims_3x3();
        let x = filled(dims.batch * dims.in_sample(), 8);
        let w0 = filled(dims.out_c * dims.in_c * 9, 9);
        let b0 = filled(dims.out_c, 10);
        let dy = filled(dims.batch * dims.out_sample(), 11);
        let mut y = vec![0.0; dims.batch * dims.out_sample()];
        conv2d_forward_direct(&x, &w0, &b0, &mut y, &dims, None);

        let mut w = w0.clone();
        let mut b = b0.clone();
        conv2d_backward(&x, &y, &dy, None, &mut w, &mut b, &dims, None, 0.1);
        assert!(w.iter().zip(w0.iter()).any(|(a, b)| a != b));
        assert!(b.iter().zip(b0.iter()).any(|(a, b)| a != b));
    }

    #[test]
    fn test_fc_backward_finite_difference() {
        let (batch, inputs, outputs) = (2usize, 5usize, 3usize);
        let x = filled(batch * inputs, 12);
        let w0 = filled(outputs * inputs, 13);
        let b0 = filled(outputs, 14);
        let dy = filled(batch * outputs, 15);

        let mut y = vec![0.0; batch * outputs];
        fc_forward(&x, &w0, &b0, &mut y, inputs, outputs, None);
        let mut dx = vec![0.0; batch * inputs];
        let mut w = w0.clone();
        let mut b = b0.clone();
        fc_backward(
            &x, &y, &dy, Some(&mut dx), &mut w, &mut b, batch, inputs, outputs, None, 0.0,
        );

        let h = 1e-3f32;
        for i in 0..x.len() {
            let mut x_plus = x.clone();
            x_plus[i] += h;
            let mut x_minus = x.clone();
            x_minus[i] -= h;
            let mut y_plus = vec![0.0; batch * outputs];
            let mut y_minus = vec![0.0; batch * outputs];
            fc_forward(&x_plus, &w0, &b0, &mut y_plus, inputs, outputs, None);
            fc_forward(&x_minus, &w0, &b0, &mut y_minus, inputs, outputs, None);
            let loss_plus: f32 = y_plus.iter().zip(dy.iter()).map(|(a, g)| a * g).sum();
            let loss_minus: f32 = y_minus.iter().zip(dy.iter()).map(|(a, g)| a * g).sum();
            let numeric = (loss_plus - loss_minus) / (2.0 * h);
            assert!((numeric - dx[i]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_max_pool_routes_gradient_to_argmax() {
        let dims = PoolDims {
            batch: 1,
            channels: 1,
            in_h: 2,
            in_w: 2,
            out_h: 1,
            out_w: 1,
            window: 2,
            stride: 2,
            padding: 0,
        };
        let x = vec![1.0, 5.0, 2.0, 3.0];
        let mut y = vec![0.0];
        pool_forward(&x, &mut y, &dims, PoolMode::Max);
        assert_eq!(y[0], 5.0);

        let dy = vec![2.0];
        let mut dx = vec![0.0; 4];
        pool_backward(&x, &dy, &mut dx, &dims, PoolMode::Max);
        assert_eq!(dx, vec![0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_average_pool_distributes_gradient() {
        let dims = PoolDims {
            batch: 1,
            channels: 1,
            in_h: 2,
            in_w: 2,
            out_h: 1,
            out_w: 1,
            window: 2,
            stride: 2,
            padding: 0,
        };
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let mut y = vec![0.0];
        pool_forward(&x, &mut y, &dims, PoolMode::Average);
        assert!((y[0] - 2.5).abs() < 1e-6);

        let dy = vec![4.0];
        let mut dx = vec![0.0; 4];
        pool_backward(&x, &dy, &mut dx, &dims, PoolMode::Average);
        assert_eq!(dx, vec![1.0; 4]);
    }

    #[test]
    fn test_batchnorm_normalizes_and_tracks_running_stats() {
        let dims = BnDims {
            batch: 2,
            channels: 1,
            spatial: 4,
        };
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let mut y = vec![0.0; 8];
        let scale = vec![1.0];
        let shift = vec![0.0];
        let mut running_mean = vec![0.0];
        let mut running_var = vec![1.0];
        let mut saved = vec![0.0; 2];
        batchnorm_forward_training(
            &x,
            &mut y,
            &scale,
            &shift,
            &mut running_mean,
            &mut running_var,
            &mut saved,
            &dims,
            1e-5,
            0.1,
        );

        let mean: f32 = y.iter().sum::<f32>() / 8.0;
        let var: f32 = y.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 8.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
        assert!((saved[0] - 4.5).abs() < 1e-5);
        assert!((running_mean[0] - 0.45).abs() < 1e-5);
    }

    #[test]
    fn test_batchnorm_backward_zero_for_uniform_gradient() {
        // With scale 1 and a constant upstream gradient, dx sums to ~0 per
        // channel (the mean term removes it).
        let dims = BnDims {
            batch: 1,
            channels: 1,
            spatial: 4,
        };
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let mut y = vec![0.0; 4];
        let mut scale = vec![1.0];
        let mut shift = vec![0.0];
        let mut running_mean = vec![0.0];
        let mut running_var = vec![1.0];
        let mut saved = vec![0.0; 2];
        batchnorm_forward_training(
            &x,
            &mut y,
            &scale,
            &shift,
            &mut running_mean,
            &mut running_var,
            &mut saved,
            &dims,
            1e-5,
            0.1,
        );
        let dy = vec![1.0; 4];
        let mut dx = vec![0.0; 4];
        batchnorm_backward(&x, &dy, Some(&mut dx), &mut scale, &mut shift, &saved, &dims, 0.0);
        assert!(dx.iter().sum::<f32>().abs() < 1e-4);
    }

    #[test]
    fn test_dropout_mask_is_deterministic_and_reused() {
        let x = filled(64, 16);
        let mut y1 = vec![0.0; 64];
        let mut y2 = vec![0.0; 64];
        let mut mask1 = vec![0.0; 64];
        let mut mask2 = vec![0.0; 64];
        let mut rng1 = ChaCha8Rng::seed_from_u64(99);
        let mut rng2 = ChaCha8Rng::seed_from_u64(99);
        dropout_forward(&x, &mut y1, &mut mask1, 0.5, &mut rng1);
        dropout_forward(&x, &mut y2, &mut mask2, 0.5, &mut rng2);
        assert_eq!(y1, y2);
        assert_eq!(mask1, mask2);

        let dy = filled(64, 17);
        let mut dx = vec![0.0; 64];
        dropout_backward(&dy, &mut dx, &mask1);
        for i in 0..64 {
            assert_eq!(dx[i], dy[i] * mask1[i]);
        }
    }

    #[test]
    fn test_softmax_rows_are_distributions() {
        let x = filled(4 * 5, 18);
        let mut y = vec![0.0; 20];
        softmax_forward(&x, &mut y, 5);
        for row in y.chunks_exact(5) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| *p >= 0.0));
        }

        let mut inplace = x.clone();
        softmax_forward_inplace(&mut inplace, 5);
        for (a, b) in inplace.iter().zip(y.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_activation_backward_inplace_matches_two_buffer() {
        let y: Vec<f32> = filled(32, 19).iter().map(|v| v.tanh()).collect();
        let dy = filled(32, 20);
        let mut dx = vec![0.0; 32];
        activation_backward(&y, &dy, &mut dx, ActivationMode::Tanh);
        let mut dydx = dy.clone();
        activation_backward_inplace(&y, &mut dydx, ActivationMode::Tanh);
        assert_eq!(dx, dydx);
    }
}
