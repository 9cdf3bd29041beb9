//! Quantized batch normalization.
//!
//! Runs the f32 batch norm inference primitive on s8 data. Scale and shift are folded with
//! the moving statistics and the input and output ranges, so the primitive sees mean 0 and
//! variance 1.

use super::{check_io, DispatchMode, Operator, Pass};
use crate::{
    config::Config,
    context::{ExecContext, OpContext, OpReq},
    engine::{
        batch_norm::{BatchNormDesc, BatchNormFlags, BatchNormForward, BatchNormForwardPd},
        reorder::ReorderAttr,
        Arg, ArgMap, Engine,
    },
    error::Error,
    exec::{commit_output, create_mem, memory_as, register_reorder},
    memory::MemoryDesc,
    scalar::ScalarType,
    signature::{OpSignature, Sign},
    tensor::Tensor,
};
use anyhow::{ensure, Result};
use rayon::prelude::*;
use std::sync::Arc;

const U8_RANGE: f32 = 255.;
const I8_RANGE: f32 = 127.;

/// Batch normalization parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchNormParam {
    /// Added to the variance.
    pub eps: f32,
    /// The channel axis, negative counts from the end.
    pub axis: i32,
    /// Calibrated output minimum.
    pub min_calib_range: Option<f32>,
    /// Calibrated output maximum.
    pub max_calib_range: Option<f32>,
}

impl Default for BatchNormParam {
    fn default() -> Self {
        Self {
            eps: 1e-3,
            axis: 1,
            min_calib_range: None,
            max_calib_range: None,
        }
    }
}

impl BatchNormParam {
    /// With a calibrated output range.
    pub fn with_calib_range(self, min: f32, max: f32) -> Self {
        Self {
            min_calib_range: Some(min),
            max_calib_range: Some(max),
            ..self
        }
    }
    /// The calibrated range, if both ends are set.
    pub fn calib_range(&self) -> Option<(f32, f32)> {
        self.min_calib_range.zip(self.max_calib_range)
    }
    /// The channel axis for rank `ndim`.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if the axis is out of range.
    pub fn channel_axis(&self, ndim: usize) -> Result<usize> {
        let axis = if self.axis < 0 {
            ndim as i64 + self.axis as i64
        } else {
            self.axis as i64
        };
        ensure!(
            (0..ndim as i64).contains(&axis),
            Error::Configuration(format!(
                "batch norm axis {} out of range for rank {ndim}",
                self.axis
            ))
        );
        Ok(axis as usize)
    }
}

impl Sign for BatchNormParam {
    fn sign(&self, sig: &mut OpSignature) {
        sig.add(&self.eps)
            .add(&self.axis)
            .add(&self.min_calib_range)
            .add(&self.max_calib_range);
    }
}

/// Compiled batch norm inference.
#[derive(Debug)]
pub struct BatchNormFwd {
    pd: BatchNormForwardPd,
    primitive: Arc<BatchNormForward>,
}

impl BatchNormFwd {
    fn new(engine: &Engine, eps: f32, flags: BatchNormFlags, src: MemoryDesc) -> Result<Self> {
        let pd = BatchNormForwardPd::new(engine, BatchNormDesc { src, eps, flags })?;
        let primitive = Arc::new(BatchNormForward::new(pd.clone()));
        Ok(Self { pd, primitive })
    }
    /// The primitive descriptor.
    pub fn pd(&self) -> &BatchNormForwardPd {
        &self.pd
    }
}

/// The cached batch norm for `src`.
///
/// **Errors**
/// - The primitive could not be built.
pub fn get_batch_norm_fwd(
    exec: &mut ExecContext,
    param: &BatchNormParam,
    flags: BatchNormFlags,
    src: &MemoryDesc,
) -> Result<Arc<BatchNormFwd>> {
    let mut key = OpSignature::new();
    key.add(param)
        .add(&flags.use_global_stats)
        .add(&flags.use_scale_shift)
        .add(src);
    let engine = exec.engine().clone();
    exec.caches
        .batch_norm_fwd
        .get_or_build(key, || BatchNormFwd::new(&engine, param.eps, flags, src.clone()))
}

/// Folded per channel statistics.
#[derive(Clone, Debug, PartialEq)]
struct ChannelStats<'a> {
    gamma: &'a [f32],
    beta: &'a [f32],
    mean: &'a [f32],
    var: &'a [f32],
}

impl ChannelStats<'_> {
    /// `[scale.., shift..]`, mapping data in `max_abs_data` to output in `max_abs_out`.
    fn scale_shift(&self, eps: f32, max_abs_data: f32, max_abs_out: f32) -> Vec<f32> {
        let channels = self.gamma.len();
        let (scale, shift): (Vec<f32>, Vec<f32>) = (0..channels)
            .into_par_iter()
            .map(|c| {
                let invstd = (self.var[c] + eps).sqrt().recip();
                let scale = self.gamma[c] * invstd * max_abs_data / max_abs_out;
                let shift = (self.beta[c] - self.mean[c] * self.gamma[c] * invstd) * I8_RANGE
                    / max_abs_out;
                (scale, shift)
            })
            .unzip();
        let mut output = scale;
        output.extend(shift);
        output
    }
}

fn single_f32(name: &str, tensor: &Tensor) -> Result<f32> {
    ensure!(
        tensor.scalar_type() == ScalarType::F32 && tensor.shape().iter().product::<usize>() == 1,
        Error::Configuration(format!(
            "quantized batch norm {name} must be a single f32, found {:?} {:?}",
            tensor.scalar_type(),
            tensor.shape()
        ))
    );
    Ok(tensor.to_f32_vec()?[0])
}

/// Batch norm inference on u8 or i8 data.
///
/// `inputs` is `[data, gamma, beta, moving_mean, moving_var, min_data, max_data]`, `outputs` is
/// `[out, min_out, max_out]` with `out` i8. Requires a calibrated output range.
#[derive(Clone, Debug)]
pub struct QuantizedBatchNorm {
    param: BatchNormParam,
}

impl QuantizedBatchNorm {
    /// Creates the operator.
    pub fn new(param: BatchNormParam) -> Self {
        Self { param }
    }
    /// The parameters.
    pub fn param(&self) -> &BatchNormParam {
        &self.param
    }
}

impl Operator for QuantizedBatchNorm {
    fn name(&self) -> &'static str {
        "quantized_batch_norm"
    }
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        ensure!(
            inputs.len() == 7,
            Error::Configuration(format!(
                "quantized batch norm expects 7 inputs, found {}",
                inputs.len()
            ))
        );
        let axis = self.param.channel_axis(inputs[0].len())?;
        let channels = inputs[0][axis];
        for (i, shape) in inputs[1..5].iter().enumerate() {
            ensure!(
                shape.as_slice() == [channels],
                Error::Configuration(format!(
                    "quantized batch norm input {} must be [{channels}], found {shape:?}",
                    i + 1
                ))
            );
        }
        Ok(vec![inputs[0].clone(), vec![1], vec![1]])
    }
    fn supports_accelerated(
        &self,
        _config: &Config,
        _pass: Pass,
        _inputs: &[Tensor],
        _outputs: &[Tensor],
    ) -> DispatchMode {
        DispatchMode::Accelerated
    }
    fn forward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        check_io(self.name(), inputs, &[7], req, outputs, &[3])?;
        let param = &self.param;
        let (min_out, max_out) = param.calib_range().ok_or_else(|| {
            Error::configuration("quantized batch norm requires min_calib_range and max_calib_range")
        })?;
        let shapes: Vec<Vec<usize>> = inputs.iter().map(Tensor::shape).collect();
        self.infer_shape(&shapes)?;
        let data = inputs[0].to_compact()?;
        let data_type = data.scalar_type();
        ensure!(
            data_type.is_quantized(),
            Error::Configuration(format!(
                "quantized batch norm requires u8 or i8 data, found {data_type:?}"
            ))
        );
        let axis = param.channel_axis(data.desc().ndim())?;
        ensure!(
            axis == 1,
            Error::Configuration(format!(
                "quantized batch norm requires channels on axis 1, found {axis}"
            ))
        );
        let out = &outputs[0];
        ensure!(
            out.shape() == data.shape() && out.scalar_type() == ScalarType::I8,
            Error::Configuration(format!(
                "quantized batch norm output must be i8 {:?}, found {:?} {:?}",
                data.shape(),
                out.scalar_type(),
                out.shape()
            ))
        );
        for (i, stat) in inputs[1..5].iter().enumerate() {
            ensure!(
                stat.scalar_type() == ScalarType::F32,
                Error::Configuration(format!(
                    "quantized batch norm input {} must be f32, found {:?}",
                    i + 1,
                    stat.scalar_type()
                ))
            );
        }
        let min_data = single_f32("min_data", &inputs[5])?;
        let max_data = single_f32("max_data", &inputs[6])?;
        single_f32("min_out", &outputs[1])?;
        single_f32("max_out", &outputs[2])?;
        if ctx.is_train {
            tracing::info!("quantized batch norm runs with global stats during training");
        }
        let max_abs_data = min_data.abs().max(max_data.abs());
        let max_abs_out = min_out.abs().max(max_out.abs());
        ensure!(
            max_abs_out > 0.,
            Error::Configuration("quantized batch norm calibrated range is zero".into())
        );
        let flags = BatchNormFlags {
            use_global_stats: true,
            use_scale_shift: true,
        };
        let src_desc = data.desc().with_scalar_type(ScalarType::I8);
        let fwd = get_batch_norm_fwd(ctx.exec, param, flags, &src_desc)?;
        let [gamma, beta, mean, var] = [1, 2, 3, 4].map(|i| inputs[i].to_f32_vec());
        let (gamma, beta, mean, var) = (gamma?, beta?, mean?, var?);
        let stats = ChannelStats {
            gamma: &gamma,
            beta: &beta,
            mean: &mean,
            var: &var,
        };
        let scale_shift = stats.scale_shift(param.eps, max_abs_data, max_abs_out);
        let write_ranges = || -> Result<()> {
            outputs[1].assign_f32(req[1], &[min_out])?;
            outputs[2].assign_f32(req[2], &[max_out])
        };
        if req[0] == OpReq::Null {
            return write_ranges();
        }
        ctx.exec.scoped(|exec| {
            let pd = fwd.pd();
            let src = if data_type == ScalarType::U8 {
                let s8 = exec.temp.alloc(src_desc.clone())?;
                let attr = ReorderAttr::scale(I8_RANGE / U8_RANGE);
                register_reorder(&data.memory()?, &s8, attr, &mut exec.stream)?;
                s8
            } else {
                memory_as(&data, pd.src_desc(), &mut exec.temp, &mut exec.stream)?
            };
            let weights = exec.temp.alloc(pd.scale_shift_desc().clone())?;
            weights.write_f32(&scale_shift)?;
            let channels = pd.stats_desc().logical_len();
            let mean = exec.temp.alloc(pd.stats_desc().clone())?;
            let var = exec.temp.alloc(pd.stats_desc().clone())?;
            var.write_f32(&vec![1.; channels])?;
            let dst = create_mem(out, pd.dst_desc(), req[0], true, &mut exec.temp)?;
            let args = ArgMap::from([
                (Arg::Src, src),
                (Arg::ScaleShift, weights),
                (Arg::Mean, mean),
                (Arg::Variance, var),
                (Arg::Dst, dst.1.clone()),
            ]);
            exec.stream.register(fwd.primitive.clone(), args);
            commit_output(out, dst, &mut exec.stream)?;
            exec.stream.submit()?;
            write_ranges()
        })
    }
    fn backward(
        &self,
        _ctx: &mut OpContext,
        _inputs: &[Tensor],
        _req: &[OpReq],
        _outputs: &[Tensor],
    ) -> Result<()> {
        Err(Error::configuration("quantized_batch_norm has no backward"))
    }
}
