//! QuantizeV2: float to 8 bit quantization.
use super::{check_io, DispatchMode, Operator, Pass};
use crate::{
    config::Config,
    context::{OpContext, OpReq},
    engine::{
        reorder::{reorder, Reorder, ReorderAttr, ReorderPd},
        Arg, ArgMap,
    },
    error::Error,
    exec::{commit_output, create_mem, memory_as},
    memory::MemoryDesc,
    scalar::ScalarType,
    tensor::Tensor,
};
use anyhow::{ensure, Result};
use dry::macro_for;
use parking_lot::Mutex;
use paste::paste;
use rayon::prelude::*;
use std::sync::Arc;

const U8_MIN: f32 = 0.;
const U8_MAX: f32 = 255.;
const I8_MIN: f32 = -127.;
const I8_MAX: f32 = 127.;

/// Output type of [`QuantizeV2`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QuantizeOutType {
    /// [`Uint8`](Self::Uint8) if the calibrated minimum is >= 0, otherwise [`Int8`](Self::Int8).
    #[default]
    Auto,
    /// Signed, symmetric.
    Int8,
    /// Unsigned.
    Uint8,
}

/// QuantizeV2 parameters.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QuantizeV2Param {
    /// The output type.
    pub out_type: QuantizeOutType,
    /// Calibrated minimum.
    pub min_calib_range: Option<f32>,
    /// Calibrated maximum.
    pub max_calib_range: Option<f32>,
    /// Shift signed data into u8.
    pub shifted_output: bool,
}

impl QuantizeV2Param {
    /// Quantizes to `out_type` with the range of each input.
    pub fn new(out_type: QuantizeOutType) -> Self {
        Self {
            out_type,
            ..Self::default()
        }
    }
    /// With a calibrated range.
    pub fn with_calib_range(self, min: f32, max: f32) -> Self {
        Self {
            min_calib_range: Some(min),
            max_calib_range: Some(max),
            ..self
        }
    }
    /// With shifted output.
    pub fn with_shifted_output(self) -> Self {
        Self {
            shifted_output: true,
            ..self
        }
    }
    /// The calibrated range, if both ends are set.
    pub fn calib_range(&self) -> Option<(f32, f32)> {
        self.min_calib_range.zip(self.max_calib_range)
    }
    /// The type float inputs are quantized to.
    pub fn output_type(&self) -> ScalarType {
        if self.shifted_output {
            return ScalarType::U8;
        }
        match self.out_type {
            QuantizeOutType::Int8 => ScalarType::I8,
            QuantizeOutType::Uint8 => ScalarType::U8,
            QuantizeOutType::Auto => match self.min_calib_range {
                Some(min) if min >= 0. => ScalarType::U8,
                _ => ScalarType::I8,
            },
        }
    }
}

/// The full range of a quantized type.
fn quantized_range(scalar_type: ScalarType) -> Option<(f32, f32)> {
    macro_for!($T in [U8, I8] {
        paste! {
            if scalar_type == ScalarType::$T {
                return Some(([<$T _MIN>], [<$T _MAX>]));
            }
        }
    });
    None
}

/// Scale mapping `max(|min|, |max|)` to the range of `scalar_type`.
fn quantize_scale(scalar_type: ScalarType, min: f32, max: f32) -> f32 {
    let real_range = min.abs().max(max.abs());
    let quantized_range = if scalar_type == ScalarType::I8 {
        I8_MAX
    } else {
        U8_MAX
    };
    if real_range == 0. {
        i32::MAX as f32
    } else {
        quantized_range / real_range
    }
}

/// The min and max of `values`, in parallel.
///
/// Chunks without elements contribute the identities, so any number of threads is fine. Empty
/// input returns `(0, 0)`.
fn min_max(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0., 0.);
    }
    values
        .par_iter()
        .fold(
            || (f32::MAX, f32::MIN),
            |(min, max), x| (min.min(*x), max.max(*x)),
        )
        .reduce(
            || (f32::MAX, f32::MIN),
            |(a_min, a_max), (b_min, b_max)| (a_min.min(b_min), a_max.max(b_max)),
        )
}

#[derive(Debug)]
struct QuantizeState {
    data_min: f32,
    data_max: f32,
    scale: f32,
    shift: u8,
    src_desc: MemoryDesc,
    dst_desc: MemoryDesc,
    primitive: Arc<Reorder>,
}

/// Quantizes float data to u8 or i8, outputs `[data_q, min_range, max_range]`.
///
/// The reorder is built on the first call and reused until the range of an uncalibrated input
/// changes.
#[derive(Debug)]
pub struct QuantizeV2 {
    param: QuantizeV2Param,
    state: Mutex<Option<QuantizeState>>,
}

impl QuantizeV2 {
    /// Creates the operator.
    pub fn new(param: QuantizeV2Param) -> Self {
        Self {
            param,
            state: Mutex::new(None),
        }
    }
    /// The parameters.
    pub fn param(&self) -> &QuantizeV2Param {
        &self.param
    }
    /// The type of the quantized output for input type `input`.
    ///
    /// Quantized inputs pass through.
    pub fn output_type(&self, input: ScalarType) -> ScalarType {
        if input.is_quantized() {
            input
        } else {
            self.param.output_type()
        }
    }
    /// The scale of the cached reorder, if built.
    pub fn cached_scale(&self) -> Option<f32> {
        self.state.lock().as_ref().map(|state| state.scale)
    }
    fn output_range(&self, out_type: ScalarType, data_min: f32, data_max: f32) -> (f32, f32) {
        if self.param.shifted_output {
            (0., data_max - data_min)
        } else if out_type == ScalarType::U8 {
            (data_min, data_max)
        } else {
            let real_range = data_min.abs().max(data_max.abs());
            (-real_range, real_range)
        }
    }
    fn build_state(
        &self,
        out_type: ScalarType,
        src_desc: MemoryDesc,
        data_min: f32,
        data_max: f32,
    ) -> Result<QuantizeState> {
        let (scale, shift, attr) = if self.param.shifted_output {
            let scale = U8_MAX / (data_max - data_min);
            let shift = (scale * -data_min).round().clamp(U8_MIN, U8_MAX) as u8;
            (scale, shift, ReorderAttr::scale(scale).with_sum())
        } else {
            let scale = quantize_scale(out_type, data_min, data_max);
            (scale, 0, ReorderAttr::scale(scale))
        };
        let dst_desc = if src_desc.ndim() == 4 {
            MemoryDesc::channels_last(src_desc.dims(), out_type)
        } else {
            src_desc.with_scalar_type(out_type)
        };
        let pd = ReorderPd::new(src_desc.clone(), dst_desc.clone(), attr)?;
        Ok(QuantizeState {
            data_min,
            data_max,
            scale,
            shift,
            src_desc,
            dst_desc,
            primitive: Arc::new(Reorder::new(pd)),
        })
    }
    fn check_range_outputs(&self, outputs: &[Tensor]) -> Result<()> {
        for range in &outputs[1..] {
            ensure!(
                range.scalar_type() == ScalarType::F32 && range.shape().iter().product::<usize>() == 1,
                Error::Configuration(format!(
                    "quantize range outputs must be single f32 elements, found {:?} {:?}",
                    range.scalar_type(),
                    range.shape()
                ))
            );
        }
        Ok(())
    }
    fn write_ranges(req: &[OpReq], outputs: &[Tensor], (min, max): (f32, f32)) -> Result<()> {
        outputs[1].assign_f32(req[1], &[min])?;
        outputs[2].assign_f32(req[2], &[max])
    }
    fn pass_through(&self, data: &Tensor, req: &[OpReq], outputs: &[Tensor]) -> Result<()> {
        let scalar_type = data.scalar_type();
        ensure!(
            outputs[0].scalar_type() == scalar_type,
            Error::Configuration(format!(
                "quantized {scalar_type:?} input requires a {scalar_type:?} output, found {:?}",
                outputs[0].scalar_type()
            ))
        );
        let range = self
            .param
            .calib_range()
            .or_else(|| quantized_range(scalar_type))
            .unwrap_or_else(|| unreachable!("quantized input"));
        let attr = match req[0] {
            OpReq::Null | OpReq::WriteInPlace => None,
            OpReq::Write => Some(ReorderAttr::default()),
            OpReq::AddTo => Some(ReorderAttr::sum()),
        };
        if let Some(attr) = attr {
            reorder(&data.memory()?, &outputs[0].memory()?, attr)?;
        }
        Self::write_ranges(req, outputs, range)
    }
}

impl Operator for QuantizeV2 {
    fn name(&self) -> &'static str {
        "quantize_v2"
    }
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        ensure!(
            inputs.len() == 1,
            Error::Configuration(format!("quantize expects 1 input, found {}", inputs.len()))
        );
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
        check_io(self.name(), inputs, &[1], req, outputs, &[3])?;
        self.check_range_outputs(outputs)?;
        let data = &inputs[0];
        ensure!(
            outputs[0].shape() == data.shape(),
            Error::Configuration(format!(
                "quantize output {:?} does not match input {:?}",
                outputs[0].shape(),
                data.shape()
            ))
        );
        let input_type = data.scalar_type();
        if input_type.is_quantized() {
            return self.pass_through(data, req, outputs);
        }
        ensure!(
            input_type.is_float(),
            Error::Configuration(format!("cannot quantize {input_type:?}"))
        );
        let out_type = self.param.output_type();
        ensure!(
            outputs[0].scalar_type() == out_type,
            Error::Configuration(format!(
                "quantize output must be {out_type:?}, found {:?}",
                outputs[0].scalar_type()
            ))
        );
        let data = data.to_compact()?;
        let calibrated = self.param.calib_range();
        let (data_min, data_max) = match calibrated {
            Some(range) => range,
            None => min_max(&data.to_f32_vec()?),
        };
        if self.param.shifted_output {
            ensure!(
                data_min < 0.,
                Error::Configuration(format!(
                    "shifted quantize output requires a negative minimum, found {data_min}"
                ))
            );
        }
        let src_desc = data.desc();
        let mut guard = self.state.lock();
        let stale = guard.as_ref().map_or(false, |state| {
            state.src_desc != src_desc
                || (calibrated.is_none()
                    && (state.data_min != data_min || state.data_max != data_max))
        });
        if stale {
            tracing::debug!(data_min, data_max, "quantize: range changed, rebuilding reorder");
            guard.take();
        }
        if guard.is_none() {
            guard.replace(self.build_state(out_type, src_desc, data_min, data_max)?);
        }
        let state = guard
            .as_ref()
            .unwrap_or_else(|| unreachable!("quantize state initialized"));
        let range = self.output_range(out_type, data_min, data_max);
        if req[0] == OpReq::Null {
            return Self::write_ranges(req, outputs, range);
        }
        let out = &outputs[0];
        ctx.exec.scoped(|exec| {
            let src = memory_as(&data, &state.src_desc, &mut exec.temp, &mut exec.stream)?;
            let dst = create_mem(out, &state.dst_desc, req[0], false, &mut exec.temp)?;
            if self.param.shifted_output {
                dst.1.write_f32(&vec![f32::from(state.shift); dst.1.desc().logical_len()])?;
            }
            let args = ArgMap::from([(Arg::Src, src), (Arg::Dst, dst.1.clone())]);
            exec.stream.register(state.primitive.clone(), args);
            commit_output(out, dst, &mut exec.stream)?;
            exec.stream.submit()?;
            Self::write_ranges(req, outputs, range)
        })
    }
    fn backward(
        &self,
        _ctx: &mut OpContext,
        _inputs: &[Tensor],
        _req: &[OpReq],
        _outputs: &[Tensor],
    ) -> Result<()> {
        Err(Error::configuration("quantize_v2 has no backward"))
    }
}
