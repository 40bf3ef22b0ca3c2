//! Host reference implementation of the primitive-library boundary
//!
//! All seven layer kinds, computed on the CPU but enqueued on the paired
//! [`HostRuntime`]'s compute stream so stream ordering, the per-layer
//! compute-stream synchronization, and the offload/prefetch overlap behave
//! exactly as they would against an accelerator library.
//!
//! f32 only: planning with f64 networks is fully supported upstream, but
//! this library reports Unsupported for f64 compute.

pub mod kernels;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::device::host::HostRuntime;
use crate::device::StreamHandle;
use crate::dnn::{
    AlgoCandidate, BackwardArgs, ConvAlgo, ConvDirection, DnnLibrary, ForwardArgs, Precision,
    TensorShape,
};
use crate::error::{GradForgeError, GradResult};
use crate::layers::{LayerDescriptor, LayerKind, LayerRegistry};

use kernels::{BnDims, ConvDims, PoolDims};

pub struct HostDnn {
    runtime: Arc<HostRuntime>,
    compute: Mutex<Option<StreamHandle>>,
    precision: Mutex<Option<Precision>>,
    /// Per-dropout-layer seeded generators, rebuilt by `prepare`.
    dropout_rngs: Arc<Mutex<HashMap<usize, ChaCha8Rng>>>,
}

impl HostDnn {
    pub fn new(runtime: Arc<HostRuntime>) -> Arc<Self> {
        Arc::new(HostDnn {
            runtime,
            compute: Mutex::new(None),
            precision: Mutex::new(None),
            dropout_rngs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn compute_stream(&self) -> GradResult<StreamHandle> {
        self.compute.lock()?.ok_or_else(|| {
            GradForgeError::Internal("primitive invoked before stream attachment".into())
        })
    }

    fn check_precision(&self, layer: usize) -> GradResult<()> {
        match *self.precision.lock()? {
            Some(Precision::Float32) => Ok(()),
            Some(Precision::Float64) => Err(GradForgeError::Unsupported(format!(
                "layer {}: host primitives compute in f32 only",
                layer
            ))),
            None => Err(GradForgeError::Internal(
                "primitive invoked before prepare".into(),
            )),
        }
    }

    fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> GradResult<()> {
        let stream = self.compute_stream()?;
        self.runtime.enqueue(stream, job)?;
        Ok(())
    }
}

/// Raw handle -> slice conversions for the enqueued kernels.
///
/// SAFETY: the executor's schedule guarantees every handle passed to a
/// primitive stays allocated until the compute-stream sync that retires
/// it, and distinct arguments never alias (the only sanctioned aliases,
/// in-place softmax and the activation-gradient chain, go through the
/// dedicated in-place kernels).
unsafe fn slice<'a>(addr: u64, len: usize) -> &'a [f32] {
    std::slice::from_raw_parts(addr as *const f32, len)
}

unsafe fn slice_mut<'a>(addr: u64, len: usize) -> &'a mut [f32] {
    std::slice::from_raw_parts_mut(addr as *mut f32, len)
}

fn conv_dims(desc: &LayerDescriptor) -> GradResult<ConvDims> {
    let LayerKind::Convolution(geom) = desc.kind else {
        return Err(GradForgeError::Internal(
            "convolution dims on a non-convolution".into(),
        ));
    };
    Ok(ConvDims {
        batch: desc.input.n,
        in_c: desc.input.c,
        in_h: desc.input.h,
        in_w: desc.input.w,
        out_c: desc.output.c,
        out_h: desc.output.h,
        out_w: desc.output.w,
        kernel_h: geom.kernel_h,
        kernel_w: geom.kernel_w,
        stride: geom.stride,
        padding: geom.padding,
    })
}

fn param(
    field: Option<crate::layers::TensorParam>,
    name: &str,
    layer: usize,
) -> GradResult<crate::layers::TensorParam> {
    field
        .filter(|p| !p.ptr.is_null())
        .ok_or_else(|| GradForgeError::FatalPrimitive {
            layer,
            reason: format!("missing {} tensor", name),
        })
}

impl DnnLibrary for HostDnn {
    fn prepare(&self, registry: &LayerRegistry) -> GradResult<()> {
        if registry.layout() != crate::dnn::TensorLayout::Nchw {
            return Err(GradForgeError::Unsupported(
                "host primitives compute in NCHW only".into(),
            ));
        }
        *self.precision.lock()? = Some(registry.precision());
        let mut rngs = self.dropout_rngs.lock()?;
        rngs.clear();
        for (index, layer) in registry.layers().iter().enumerate() {
            if matches!(layer.kind, LayerKind::Dropout(_)) {
                rngs.insert(
                    index,
                    ChaCha8Rng::seed_from_u64(
                        registry.dropout_seed() ^ (index as u64).wrapping_mul(0x517c_c1b7_2722_0a95),
                    ),
                );
            }
        }
        tracing::debug!(dropout_layers = rngs.len(), "host dnn: prepared");
        Ok(())
    }

    fn attach_stream(&self, compute: StreamHandle) -> GradResult<()> {
        *self.compute.lock()? = Some(compute);
        Ok(())
    }

    fn conv_algorithms(
        &self,
        desc: &LayerDescriptor,
        direction: ConvDirection,
    ) -> GradResult<Vec<AlgoCandidate>> {
        let dims = conv_dims(desc)?;
        // Fastest first: GEMM over an explicit im2col buffer, then the
        // zero-workspace direct kernel. Backward GEMM re-materializes the
        // column buffer plus its gradient, hence the doubled requirement;
        // the reference math is direct either way, so backward algorithms
        // differ only in their memory contract.
        let im2col = dims.batch * dims.im2col_elements() * 4;
        let gemm_ws = match direction {
            ConvDirection::Forward => im2col,
            ConvDirection::BackwardFilter | ConvDirection::BackwardData => 2 * im2col,
        };
        Ok(vec![
            AlgoCandidate {
                algo: ConvAlgo::Gemm,
                workspace_bytes: gemm_ws,
            },
            AlgoCandidate {
                algo: ConvAlgo::Direct,
                workspace_bytes: 0,
            },
        ])
    }

    fn dropout_reserve_bytes(&self, shape: &TensorShape, precision: Precision) -> usize {
        // One mask element per activation element.
        shape.elements() * precision.elem_bytes()
    }

    fn batchnorm_stats_bytes(&self, channels: usize, precision: Precision) -> usize {
        // Saved mean + saved inverse stddev.
        2 * channels * precision.elem_bytes()
    }

    fn forward(&self, args: ForwardArgs<'_>) -> GradResult<()> {
        self.check_precision(args.layer)?;
        let layer = args.layer;
        let desc = *args.desc;
        let in_len = desc.input.elements();
        let out_len = desc.output.elements();
        let x = args.input.as_raw();
        let y = args.output.as_raw();
        if x == 0 || y == 0 {
            return Err(GradForgeError::FatalPrimitive {
                layer,
                reason: "null activation handle".into(),
            });
        }

        match desc.kind {
            LayerKind::Convolution(_) => {
                let dims = conv_dims(&desc)?;
                let weights = param(desc.params.weights, "weight", layer)?;
                let bias = param(desc.params.bias, "bias", layer)?;
                let use_gemm = matches!(args.algo, Some(ConvAlgo::Gemm));
                let workspace = match (use_gemm, args.workspace) {
                    (true, Some((ptr, bytes))) if bytes >= dims.batch * dims.im2col_elements() * 4 => {
                        Some(ptr.as_raw())
                    }
                    (true, _) => {
                        return Err(GradForgeError::FatalPrimitive {
                            layer,
                            reason: "gemm algorithm without an adequate workspace".into(),
                        })
                    }
                    (false, _) => None,
                };
                let fused = desc.fused_activation;
                self.enqueue(move || unsafe {
                    let x = slice(x, in_len);
                    let y = slice_mut(y, out_len);
                    let w = slice(weights.ptr.as_raw(), weights.elements);
                    let b = slice(bias.ptr.as_raw(), bias.elements);
                    match workspace {
                        Some(ws) => {
                            let ws = slice_mut(ws, dims.batch * dims.im2col_elements());
                            kernels::conv2d_forward_gemm(x, w, b, y, ws, &dims, fused);
                        }
                        None => kernels::conv2d_forward_direct(x, w, b, y, &dims, fused),
                    }
                })
            }
            LayerKind::FullyConnected { .. } => {
                let weights = param(desc.params.weights, "weight", layer)?;
                let bias = param(desc.params.bias, "bias", layer)?;
                let inputs = desc.input.sample_elements();
                let outputs = desc.output.sample_elements();
                let fused = desc.fused_activation;
                self.enqueue(move || unsafe {
                    let x = slice(x, in_len);
                    let y = slice_mut(y, out_len);
                    let w = slice(weights.ptr.as_raw(), weights.elements);
                    let b = slice(bias.ptr.as_raw(), bias.elements);
                    kernels::fc_forward(x, w, b, y, inputs, outputs, fused);
                })
            }
            LayerKind::Dropout(geom) => {
                if args.training {
                    let reserve = param(desc.params.reserve, "reserve", layer)?;
                    let rngs = Arc::clone(&self.dropout_rngs);
                    let keep = 1.0 - geom.drop_prob;
                    self.enqueue(move || unsafe {
                        let x = slice(x, in_len);
                        let y = slice_mut(y, out_len);
                        let mask = slice_mut(reserve.ptr.as_raw(), in_len);
                        match rngs.lock() {
                            Ok(mut rngs) => match rngs.get_mut(&layer) {
                                Some(rng) => kernels::dropout_forward(x, y, mask, keep, rng),
                                None => {
                                    tracing::error!(layer, "dropout forward without prepared rng")
                                }
                            },
                            Err(err) => tracing::error!(%err, "dropout rng lock poisoned"),
                        }
                    })
                } else {
                    // Inverted dropout is a pass-through at inference.
                    self.enqueue(move || unsafe {
                        let x = slice(x, in_len);
                        let y = slice_mut(y, out_len);
                        y.copy_from_slice(x);
                    })
                }
            }
            LayerKind::BatchNorm(geom) => {
                let scale = param(desc.params.scale, "scale", layer)?;
                let shift = param(desc.params.shift, "shift", layer)?;
                let mean = param(desc.params.running_mean, "running mean", layer)?;
                let var = param(desc.params.running_var, "running variance", layer)?;
                let reserve = param(desc.params.reserve, "saved statistics", layer)?;
                let dims = BnDims {
                    batch: desc.input.n,
                    channels: desc.input.c,
                    spatial: desc.input.h * desc.input.w,
                };
                let training = args.training;
                self.enqueue(move || unsafe {
                    let x = slice(x, in_len);
                    let y = slice_mut(y, out_len);
                    let scale = slice(scale.ptr.as_raw(), scale.elements);
                    let shift = slice(shift.ptr.as_raw(), shift.elements);
                    if training {
                        kernels::batchnorm_forward_training(
                            x,
                            y,
                            scale,
                            shift,
                            slice_mut(mean.ptr.as_raw(), mean.elements),
                            slice_mut(var.ptr.as_raw(), var.elements),
                            slice_mut(reserve.ptr.as_raw(), reserve.elements),
                            &dims,
                            geom.epsilon,
                            geom.momentum,
                        );
                    } else {
                        kernels::batchnorm_forward_inference(
                            x,
                            y,
                            scale,
                            shift,
                            slice(mean.ptr.as_raw(), mean.elements),
                            slice(var.ptr.as_raw(), var.elements),
                            &dims,
                            geom.epsilon,
                        );
                    }
                })
            }
            LayerKind::Pooling(geom) => {
                let dims = PoolDims {
                    batch: desc.input.n,
                    channels: desc.input.c,
                    in_h: desc.input.h,
                    in_w: desc.input.w,
                    out_h: desc.output.h,
                    out_w: desc.output.w,
                    window: geom.window,
                    stride: geom.stride,
                    padding: geom.padding,
                };
                let mode = geom.mode;
                self.enqueue(move || unsafe {
                    kernels::pool_forward(slice(x, in_len), slice_mut(y, out_len), &dims, mode);
                })
            }
            LayerKind::Activation(mode) => self.enqueue(move || unsafe {
                kernels::activation_forward(slice(x, in_len), slice_mut(y, out_len), mode);
            }),
            LayerKind::Softmax => {
                let classes = desc.input.sample_elements();
                if x == y {
                    self.enqueue(move || unsafe {
                        kernels::softmax_forward_inplace(slice_mut(y, out_len), classes);
                    })
                } else {
                    self.enqueue(move || unsafe {
                        kernels::softmax_forward(slice(x, in_len), slice_mut(y, out_len), classes);
                    })
                }
            }
        }
    }

    fn backward(&self, args: BackwardArgs<'_>) -> GradResult<()> {
        self.check_precision(args.layer)?;
        let layer = args.layer;
        let desc = *args.desc;
        let in_len = desc.input.elements();
        let out_len = desc.output.elements();
        let x = args.fwd_input.as_raw();
        let y = args.fwd_output.as_raw();
        let dy = args.grad_output.as_raw();
        let dx = args.grad_input.map(|p| p.as_raw());
        if x == 0 || y == 0 || dy == 0 {
            return Err(GradForgeError::FatalPrimitive {
                layer,
                reason: "null tensor handle in backward".into(),
            });
        }
        let lr = args.learning_rate;

        match desc.kind {
            LayerKind::Convolution(_) => {
                let dims = conv_dims(&desc)?;
                let weights = param(desc.params.weights, "weight", layer)?;
                let bias = param(desc.params.bias, "bias", layer)?;
                let fused = desc.fused_activation;
                // The locked backward algorithms shape the workspace
                // contract; the reference math is direct either way.
                self.enqueue(move || unsafe {
                    kernels::conv2d_backward(
                        slice(x, in_len),
                        slice(y, out_len),
                        slice(dy, out_len),
                        dx.map(|p| slice_mut(p, in_len)),
                        slice_mut(weights.ptr.as_raw(), weights.elements),
                        slice_mut(bias.ptr.as_raw(), bias.elements),
                        &dims,
                        fused,
                        lr,
                    );
                })
            }
            LayerKind::FullyConnected { .. } => {
                let weights = param(desc.params.weights, "weight", layer)?;
                let bias = param(desc.params.bias, "bias", layer)?;
                let batch = desc.input.n;
                let inputs = desc.input.sample_elements();
                let outputs = desc.output.sample_elements();
                let fused = desc.fused_activation;
                self.enqueue(move || unsafe {
                    kernels::fc_backward(
                        slice(x, in_len),
                        slice(y, out_len),
                        slice(dy, out_len),
                        dx.map(|p| slice_mut(p, in_len)),
                        slice_mut(weights.ptr.as_raw(), weights.elements),
                        slice_mut(bias.ptr.as_raw(), bias.elements),
                        batch,
                        inputs,
                        outputs,
                        fused,
                        lr,
                    );
                })
            }
            LayerKind::Dropout(_) => {
                let Some(dx) = dx else { return Ok(()) };
                let reserve = param(desc.params.reserve, "reserve", layer)?;
                self.enqueue(move || unsafe {
                    kernels::dropout_backward(
                        slice(dy, out_len),
                        slice_mut(dx, in_len),
                        slice(reserve.ptr.as_raw(), in_len),
                    );
                })
            }
            LayerKind::BatchNorm(_) => {
                let scale = param(desc.params.scale, "scale", layer)?;
                let shift = param(desc.params.shift, "shift", layer)?;
                let reserve = param(desc.params.reserve, "saved statistics", layer)?;
                let dims = BnDims {
                    batch: desc.input.n,
                    channels: desc.input.c,
                    spatial: desc.input.h * desc.input.w,
                };
                self.enqueue(move || unsafe {
                    kernels::batchnorm_backward(
                        slice(x, in_len),
                        slice(dy, out_len),
                        dx.map(|p| slice_mut(p, in_len)),
                        slice_mut(scale.ptr.as_raw(), scale.elements),
                        slice_mut(shift.ptr.as_raw(), shift.elements),
                        slice(reserve.ptr.as_raw(), reserve.elements),
                        &dims,
                        lr,
                    );
                })
            }
            LayerKind::Pooling(geom) => {
                let Some(dx) = dx else { return Ok(()) };
                let dims = PoolDims {
                    batch: desc.input.n,
                    channels: desc.input.c,
                    in_h: desc.input.h,
                    in_w: desc.input.w,
                    out_h: desc.output.h,
                    out_w: desc.output.w,
                    window: geom.window,
                    stride: geom.stride,
                    padding: geom.padding,
                };
                let mode = geom.mode;
                self.enqueue(move || unsafe {
                    kernels::pool_backward(
                        slice(x, in_len),
                        slice(dy, out_len),
                        slice_mut(dx, in_len),
                        &dims,
                        mode,
                    );
                })
            }
            LayerKind::Activation(mode) => {
                let Some(dx) = dx else { return Ok(()) };
                if dx == dy {
                    // The aliased-gradient path: transform in place.
                    self.enqueue(move || unsafe {
                        kernels::activation_backward_inplace(
                            slice(y, out_len),
                            slice_mut(dx, in_len),
                            mode,
                        );
                    })
                } else {
                    self.enqueue(move || unsafe {
                        kernels::activation_backward(
                            slice(y, out_len),
                            slice(dy, out_len),
                            slice_mut(dx, in_len),
                            mode,
                        );
                    })
                }
            }
            LayerKind::Softmax => {
                // The loss produces the gradient with respect to the
                // softmax input, so backward is the identity.
                let Some(dx) = dx else { return Ok(()) };
                if dx == dy {
                    return Ok(());
                }
                self.enqueue(move || unsafe {
                    slice_mut(dx, in_len).copy_from_slice(slice(dy, out_len));
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DevicePtr, DeviceRuntime};
    use crate::dnn::{ActivationMode, TensorLayout};
    use crate::layers::LayerSpec;

    fn upload_f32(rt: &HostRuntime, data: &[f32]) -> DevicePtr {
        let ptr = rt.alloc_device(data.len() * 4).unwrap();
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        rt.upload(ptr, &bytes).unwrap();
        ptr
    }

    fn download_f32(rt: &HostRuntime, ptr: DevicePtr, len: usize) -> Vec<f32> {
        let mut raw = vec![0u8; len * 4];
        rt.download(ptr, &mut raw).unwrap();
        raw.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_forward_runs_on_the_attached_stream() {
        let rt = HostRuntime::with_capacity(64 * 1024 * 1024);
        let dnn = HostDnn::new(Arc::clone(&rt));

        let mut registry = LayerRegistry::build(
            &[LayerSpec::activation(ActivationMode::Relu)],
            1,
            (1, 2, 2),
            Precision::Float32,
            TensorLayout::Nchw,
            0,
            0.01,
            dnn.as_ref(),
        )
        .unwrap();
        registry.materialize(rt.as_ref()).unwrap();
        dnn.prepare(&registry).unwrap();

        let stream = rt.create_stream().unwrap();
        dnn.attach_stream(stream).unwrap();

        let x = upload_f32(&rt, &[-1.0, 2.0, -3.0, 4.0]);
        let y = upload_f32(&rt, &[0.0; 4]);
        registry
            .forward(dnn.as_ref(), 0, x, y, None, None, true)
            .unwrap();
        rt.sync_stream(stream).unwrap();
        assert_eq!(download_f32(&rt, y, 4), vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_f64_compute_is_unsupported() {
        let rt = HostRuntime::with_capacity(64 * 1024 * 1024);
        let dnn = HostDnn::new(Arc::clone(&rt));
        let mut registry = LayerRegistry::build(
            &[LayerSpec::activation(ActivationMode::Relu)],
            1,
            (1, 2, 2),
            Precision::Float64,
            TensorLayout::Nchw,
            0,
            0.01,
            dnn.as_ref(),
        )
        .unwrap();
        registry.materialize(rt.as_ref()).unwrap();
        dnn.prepare(&registry).unwrap();
        let stream = rt.create_stream().unwrap();
        dnn.attach_stream(stream).unwrap();

        let x = upload_f32(&rt, &[0.0; 4]);
        let y = upload_f32(&rt, &[0.0; 4]);
        let err = registry
            .forward(dnn.as_ref(), 0, x, y, None, None, true)
            .unwrap_err();
        assert!(matches!(err, GradForgeError::Unsupported(_)));
    }
}
