//! Adaptive average pooling over NCHW inputs.
//!
//! Output position `o` averages the input window `floor(o * in / out)..ceil((o + 1) * in / out)`
//! along each spatial dim. When every window has the same size the operator runs as a uniform
//! average pooling with the engine, otherwise with the reference kernels here.

use super::{
    check_io,
    pooling::{pooling_compute, pooling_grad_compute, PoolingParam},
    DispatchMode, Operator, Pass,
};
use crate::{
    config::Config,
    context::{OpContext, OpReq},
    error::Error,
    planner::{adaptive_uniform_kernel, adaptive_window},
    scalar::{Float, Scalar},
    tensor::Tensor,
};
use anyhow::{ensure, Result};
use dry::macro_for;
use half::bf16;
use ndarray::{parallel::prelude::*, Array3, ArrayView2, Axis, Ix4, Slice};
use rayon::prelude::*;

/// Adaptive average pooling to a fixed output size.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptiveAvgPooling2D {
    output_size: Vec<usize>,
}

impl AdaptiveAvgPooling2D {
    /// Creates the operator.
    ///
    /// An empty `output_size` is `(1, 1)`, a single value is square.
    pub fn new(output_size: impl Into<Vec<usize>>) -> Self {
        Self {
            output_size: output_size.into(),
        }
    }
    /// The output height and width.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if more than 2 values were provided.
    pub fn output_hw(&self) -> Result<(usize, usize)> {
        match self.output_size.as_slice() {
            [] => Ok((1, 1)),
            [s] => Ok((*s, *s)),
            [h, w] => Ok((*h, *w)),
            output_size => Err(Error::configuration(format!(
                "adaptive_avg_pooling2d output_size {output_size:?} must have at most 2 values"
            ))),
        }
    }
    fn pooling_param(&self) -> Result<PoolingParam> {
        let (oh, ow) = self.output_hw()?;
        Ok(PoolingParam::adaptive([oh, ow]))
    }
    fn check_shapes(&self, input: &[usize], output: &[usize]) -> Result<()> {
        let expected = self.infer_shape(&[input.to_vec()])?;
        ensure!(
            output == expected[0].as_slice(),
            Error::Configuration(format!(
                "adaptive_avg_pooling2d output {output:?} does not match {:?}",
                expected[0]
            ))
        );
        Ok(())
    }
}

/// Whether pooling from `data` to `out` dims is a uniform pooling the engine supports.
fn is_uniform(data: &[usize], out: &[usize]) -> bool {
    data.len() == 4
        && out.len() == 4
        && adaptive_uniform_kernel(&data[2..], &out[2..]).map_or(false, |dims| !dims.is_padded())
}

fn accelerated_dtype(tensor: &Tensor) -> bool {
    let scalar_type = tensor.scalar_type();
    macro_for!($T in [bf16, f32] {
        if scalar_type == $T::scalar_type() {
            return true;
        }
    });
    false
}

impl Operator for AdaptiveAvgPooling2D {
    fn name(&self) -> &'static str {
        "adaptive_avg_pooling2d"
    }
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        ensure!(
            inputs.len() == 1,
            Error::Configuration(format!(
                "adaptive_avg_pooling2d expects 1 input, found {}",
                inputs.len()
            ))
        );
        let input = &inputs[0];
        ensure!(
            input.len() == 4,
            Error::Configuration(format!(
                "adaptive_avg_pooling2d expects NCHW input, found {input:?}"
            ))
        );
        let (oh, ow) = self.output_hw()?;
        ensure!(
            (input[2] > 0 || oh == 0) && (input[3] > 0 || ow == 0),
            Error::Configuration(format!(
                "adaptive_avg_pooling2d cannot pool empty input {input:?} to ({oh}, {ow})"
            ))
        );
        Ok(vec![vec![input[0], input[1], oh, ow]])
    }
    fn supports_accelerated(
        &self,
        config: &Config,
        pass: Pass,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> DispatchMode {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return DispatchMode::Fallback;
        };
        let supported = match pass {
            Pass::Forward => {
                config.accelerated
                    && accelerated_dtype(input)
                    && is_uniform(&input.shape(), &output.shape())
            }
            // the input is the output gradient, the output the input gradient
            Pass::Backward => {
                config.accelerated
                    && !input.is_view()
                    && !output.is_view()
                    && accelerated_dtype(output)
                    && is_uniform(&output.shape(), &input.shape())
            }
        };
        if supported {
            DispatchMode::Accelerated
        } else {
            DispatchMode::Fallback
        }
    }
    fn forward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        check_io(self.name(), inputs, &[1], req, outputs, &[1])?;
        self.check_shapes(&inputs[0].shape(), &outputs[0].shape())?;
        match self.supports_accelerated(ctx.exec.config(), Pass::Forward, inputs, outputs) {
            DispatchMode::Accelerated => {
                pooling_compute(ctx, &self.pooling_param()?, inputs, req, outputs)
            }
            DispatchMode::Fallback => {
                tracing::debug!(
                    input = ?inputs[0].shape(),
                    output = ?outputs[0].shape(),
                    dtype = ?inputs[0].scalar_type(),
                    "adaptive_avg_pooling2d forward: reference fallback"
                );
                if req[0] == OpReq::Null {
                    return Ok(());
                }
                let input = &inputs[0];
                macro_for!($T in [bf16, f32] {
                    if input.scalar_type() == $T::scalar_type() {
                        let values = adaptive_avg_pool_forward::<$T>(input, &outputs[0].shape())?;
                        return outputs[0].assign_f32(req[0], &values);
                    }
                });
                Err(Error::configuration(format!(
                    "adaptive_avg_pooling2d {:?} not implemented",
                    input.scalar_type()
                )))
            }
        }
    }
    /// `inputs` is `[out_grad]`, `outputs` is `[in_grad]`.
    fn backward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        check_io(self.name(), inputs, &[1], req, outputs, &[1])?;
        self.check_shapes(&outputs[0].shape(), &inputs[0].shape())?;
        match self.supports_accelerated(ctx.exec.config(), Pass::Backward, inputs, outputs) {
            DispatchMode::Accelerated => {
                pooling_grad_compute(ctx, &self.pooling_param()?, inputs, req, outputs)
            }
            DispatchMode::Fallback => {
                tracing::debug!(
                    out_grad = ?inputs[0].shape(),
                    in_grad = ?outputs[0].shape(),
                    view = inputs[0].is_view() || outputs[0].is_view(),
                    "adaptive_avg_pooling2d backward: reference fallback"
                );
                if req[0] == OpReq::Null {
                    return Ok(());
                }
                let out_grad = &inputs[0];
                macro_for!($T in [bf16, f32] {
                    if out_grad.scalar_type() == $T::scalar_type() {
                        let values = adaptive_avg_pool_backward::<$T>(out_grad, &outputs[0].shape())?;
                        return outputs[0].assign_f32(req[0], &values);
                    }
                });
                Err(Error::configuration(format!(
                    "adaptive_avg_pooling2d backward {:?} not implemented",
                    out_grad.scalar_type()
                )))
            }
        }
    }
}

/// Planes of `tensor` as `[N * C, H, W]`.
fn planes<T: Float>(tensor: &Tensor) -> Result<Array3<T>> {
    let array = tensor.to_array::<T>()?.into_dimensionality::<Ix4>()?;
    let (n, c, h, w) = array.dim();
    Ok(array.into_shape((n * c, h, w))?)
}

fn window_mean<T: Float>(plane: ArrayView2<T>, (oy, ox): (usize, usize), (oh, ow): (usize, usize)) -> f32 {
    let (h, w) = plane.dim();
    let ys = adaptive_window(oy, h, oh);
    let xs = adaptive_window(ox, w, ow);
    let count = (ys.len() * xs.len()) as f32;
    let sum: f32 = plane
        .slice_axis(Axis(0), Slice::from(ys))
        .slice_axis(Axis(1), Slice::from(xs))
        .iter()
        .map(|x| x.to_f32_lossy())
        .sum();
    sum / count
}

/// Reference forward, returns the row major output as f32.
fn adaptive_avg_pool_forward<T: Float>(input: &Tensor, out_dims: &[usize]) -> Result<Vec<f32>> {
    let x = planes::<T>(input)?;
    let (oh, ow) = (out_dims[2], out_dims[3]);
    let mut y = vec![0f32; x.len_of(Axis(0)) * oh * ow];
    if oh * ow == 0 {
        return Ok(y);
    }
    y.par_chunks_mut(oh * ow)
        .zip(x.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(y, x)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    y[oy * ow + ox] = window_mean(x.view(), (oy, ox), (oh, ow));
                }
            }
        });
    Ok(y)
}

/// Reference backward, returns the row major input gradient as f32.
///
/// Every output gradient is spread evenly over its window, overlapping windows accumulate.
fn adaptive_avg_pool_backward<T: Float>(out_grad: &Tensor, in_dims: &[usize]) -> Result<Vec<f32>> {
    let dy = planes::<T>(out_grad)?;
    let (_, oh, ow) = dy.dim();
    let (h, w) = (in_dims[2], in_dims[3]);
    let mut dx = vec![0f32; dy.len_of(Axis(0)) * h * w];
    if h * w == 0 {
        return Ok(dx);
    }
    dx.par_chunks_mut(h * w)
        .zip(dy.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(dx, dy)| {
            for oy in 0..oh {
                let ys = adaptive_window(oy, h, oh);
                for ox in 0..ow {
                    let xs = adaptive_window(ox, w, ow);
                    let grad = dy[(oy, ox)].to_f32_lossy() / (ys.len() * xs.len()) as f32;
                    for y in ys.clone() {
                        dx[y * w + xs.start..y * w + xs.end]
                            .iter_mut()
                            .for_each(|dx| *dx += grad);
                    }
                }
            }
        });
    Ok(dx)
}
