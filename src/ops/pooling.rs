//! Pooling.

use super::{check_io, DispatchMode, Operator, Pass};
use crate::{
    config::Config,
    context::{ExecContext, OpContext, OpReq},
    engine::{
        pooling::{
            PoolingAlgorithm, PoolingBackward, PoolingBackwardPd, PoolingDesc, PoolingForward,
            PoolingForwardPd, PropKind,
        },
        Arg, ArgMap, Engine, Primitive,
    },
    error::Error,
    exec::{commit_output, create_mem, memory_as},
    memory::MemoryDesc,
    planner::{adaptive_uniform_kernel, init_pooling_kernels, pooling_output_shape, KernelDims},
    signature::{OpSignature, Sign},
    tensor::Tensor,
};
use anyhow::{ensure, Result};
use std::sync::Arc;

/// Pooling type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PoolType {
    /// Maximum.
    Max,
    /// Average.
    Avg,
}

/// How the output size is rounded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PoolingConvention {
    /// Windows must fit in the padded input.
    Valid,
    /// The right padding grows so that the last window covers the input.
    Full,
}

/// Pooling parameters.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolingParam {
    /// Kernel size.
    pub kernel: Vec<usize>,
    /// Strides.
    pub stride: Vec<usize>,
    /// Padding on both sides.
    pub pad: Vec<usize>,
    /// Pooling type.
    pub pool_type: PoolType,
    /// Output rounding.
    pub pooling_convention: PoolingConvention,
    /// Pool the full spatial extent.
    pub global_pool: bool,
    /// Whether average pooling counts padding, default true.
    pub count_include_pad: Option<bool>,
    /// Adaptive output size, the kernel is derived from the input.
    pub output_size: Option<Vec<usize>>,
}

impl PoolingParam {
    /// Max pooling with `kernel`, unit strides and no padding.
    pub fn new(kernel: impl Into<Vec<usize>>) -> Self {
        let kernel = kernel.into();
        let nd = kernel.len();
        Self {
            kernel,
            stride: vec![1; nd],
            pad: vec![0; nd],
            pool_type: PoolType::Max,
            pooling_convention: PoolingConvention::Valid,
            global_pool: false,
            count_include_pad: None,
            output_size: None,
        }
    }
    /// Adaptive average pooling to `output_size`.
    pub fn adaptive(output_size: impl Into<Vec<usize>>) -> Self {
        let output_size = output_size.into();
        Self {
            output_size: Some(output_size.clone()),
            pool_type: PoolType::Avg,
            ..Self::new(vec![1; output_size.len()])
        }
    }
    /// Global pooling.
    pub fn global(self) -> Self {
        Self {
            global_pool: true,
            ..self
        }
    }
    /// With `stride`.
    pub fn with_stride(self, stride: impl Into<Vec<usize>>) -> Self {
        Self {
            stride: stride.into(),
            ..self
        }
    }
    /// With `pad`.
    pub fn with_pad(self, pad: impl Into<Vec<usize>>) -> Self {
        Self {
            pad: pad.into(),
            ..self
        }
    }
    /// With `pool_type`.
    pub fn with_pool_type(self, pool_type: PoolType) -> Self {
        Self { pool_type, ..self }
    }
    /// With `pooling_convention`.
    pub fn with_convention(self, pooling_convention: PoolingConvention) -> Self {
        Self {
            pooling_convention,
            ..self
        }
    }
    /// With `count_include_pad`.
    pub fn with_count_include_pad(self, count_include_pad: bool) -> Self {
        Self {
            count_include_pad: Some(count_include_pad),
            ..self
        }
    }
    /// Whether the kernel is derived from the output size.
    pub fn is_adaptive(&self) -> bool {
        self.output_size.is_some()
    }
    /// Whether training records a workspace for the backward pass.
    pub fn require_workspace(&self) -> bool {
        self.pool_type == PoolType::Max && !self.is_adaptive()
    }
    /// The engine algorithm.
    pub fn algorithm(&self) -> PoolingAlgorithm {
        match self.pool_type {
            PoolType::Max => PoolingAlgorithm::Max,
            PoolType::Avg if self.is_adaptive() || self.count_include_pad == Some(false) => {
                PoolingAlgorithm::AvgExcludePadding
            }
            PoolType::Avg => PoolingAlgorithm::AvgIncludePadding,
        }
    }
    /// Kernel dims from input `data` to output `out` dims.
    fn kernel_dims(&self, data: &[usize], out: &[usize]) -> Result<KernelDims> {
        if self.is_adaptive() {
            ensure!(
                data.len() == out.len() && data.len() > 2,
                Error::Configuration(format!("adaptive pooling {data:?} to {out:?}"))
            );
            adaptive_uniform_kernel(&data[2..], &out[2..]).ok_or_else(|| {
                Error::configuration(format!(
                    "adaptive pooling from {data:?} to {out:?} is not uniform"
                ))
            })
        } else {
            init_pooling_kernels(self, data)
        }
    }
}

impl Sign for PoolingParam {
    fn sign(&self, sig: &mut OpSignature) {
        sig.add(&self.kernel)
            .add(&self.stride)
            .add(&self.pad)
            .add(&(self.pool_type as usize))
            .add(&(self.pooling_convention as usize))
            .add(&self.global_pool)
            .add(&self.count_include_pad)
            .add(&self.output_size);
    }
}

/// Compiled pooling forward.
#[derive(Debug)]
pub struct PoolingFwd {
    pd: PoolingForwardPd,
    primitive: Arc<dyn Primitive>,
}

impl PoolingFwd {
    fn new(
        engine: &Engine,
        param: &PoolingParam,
        is_train: bool,
        data: &MemoryDesc,
        out_dims: &[usize],
    ) -> Result<Self> {
        let kernel = param.kernel_dims(data.dims(), out_dims)?;
        let alg = param.algorithm();
        let prop = if is_train && alg != PoolingAlgorithm::AvgExcludePadding {
            PropKind::ForwardTraining
        } else {
            PropKind::ForwardScoring
        };
        if is_train && prop == PropKind::ForwardScoring {
            tracing::info!("pooling: training with prop_kind forward_scoring");
        }
        let pd = PoolingForwardPd::new(
            engine,
            PoolingDesc {
                prop,
                alg,
                src: data.clone(),
                dst: MemoryDesc::any(out_dims, data.scalar_type()),
                kernel,
            },
        )?;
        let primitive = Arc::new(PoolingForward::new(pd.clone()));
        Ok(Self { pd, primitive })
    }
    /// The primitive descriptor.
    pub fn pd(&self) -> &PoolingForwardPd {
        &self.pd
    }
    /// Executes, writing `output` per `req` and the `workspace` when training max pooling.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if a required workspace is missing or has the wrong layout.
    pub fn execute(
        &self,
        exec: &mut ExecContext,
        input: &Tensor,
        req: OpReq,
        output: &Tensor,
        workspace: Option<&Tensor>,
    ) -> Result<()> {
        let input = input.to_compact()?;
        exec.scoped(|exec| {
            let src = memory_as(&input, self.pd.src_desc(), &mut exec.temp, &mut exec.stream)?;
            let dst = create_mem(
                output,
                self.pd.dst_desc(),
                req,
                self.primitive.supports_in_place(),
                &mut exec.temp,
            )?;
            let mut args = ArgMap::from([(Arg::Src, src), (Arg::Dst, dst.1.clone())]);
            if let Some(ws_desc) = self.pd.workspace_desc() {
                let workspace = workspace.ok_or_else(|| {
                    Error::configuration("pooling: incorrect workspace input")
                })?;
                ensure!(
                    workspace.desc() == *ws_desc,
                    Error::Configuration(format!(
                        "pooling: workspace {:?} must be {ws_desc:?}",
                        workspace.desc()
                    ))
                );
                args.insert(Arg::Workspace, workspace.memory()?);
            }
            exec.stream.register(self.primitive.clone(), args);
            commit_output(output, dst, &mut exec.stream)?;
            exec.stream.submit()
        })
    }
}

/// Compiled pooling backward.
#[derive(Debug)]
pub struct PoolingBwd {
    pd: PoolingBackwardPd,
    primitive: Arc<dyn Primitive>,
}

impl PoolingBwd {
    fn new(
        engine: &Engine,
        param: &PoolingParam,
        data: &MemoryDesc,
        in_grad_dims: &[usize],
        out_grad_dims: &[usize],
    ) -> Result<Self> {
        let kernel = param.kernel_dims(in_grad_dims, out_grad_dims)?;
        let alg = param.algorithm();
        let scalar_type = data.scalar_type();
        let fwd_desc = PoolingDesc {
            prop: PropKind::ForwardTraining,
            alg,
            src: data.clone(),
            dst: MemoryDesc::any(out_grad_dims, scalar_type),
            kernel: kernel.clone(),
        };
        let hint = PoolingForwardPd::new(engine, fwd_desc)?;
        let bwd_desc = PoolingDesc {
            prop: PropKind::ForwardTraining,
            alg,
            src: MemoryDesc::any(in_grad_dims, scalar_type),
            dst: MemoryDesc::any(out_grad_dims, scalar_type),
            kernel,
        };
        let pd = PoolingBackwardPd::new(engine, bwd_desc, &hint)?;
        let primitive = Arc::new(PoolingBackward::new(pd.clone()));
        Ok(Self { pd, primitive })
    }
    /// The primitive descriptor.
    pub fn pd(&self) -> &PoolingBackwardPd {
        &self.pd
    }
    /// Executes, writing `in_grad` per `req`.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if a required workspace is missing.
    pub fn execute(
        &self,
        exec: &mut ExecContext,
        out_grad: &Tensor,
        req: OpReq,
        in_grad: &Tensor,
        workspace: Option<&Tensor>,
    ) -> Result<()> {
        exec.scoped(|exec| {
            let diff_dst = memory_as(
                out_grad,
                self.pd.diff_dst_desc(),
                &mut exec.temp,
                &mut exec.stream,
            )?;
            let diff_src = create_mem(
                in_grad,
                self.pd.diff_src_desc(),
                req,
                self.primitive.supports_in_place(),
                &mut exec.temp,
            )?;
            let mut args = ArgMap::from([
                (Arg::DiffDst, diff_dst),
                (Arg::DiffSrc, diff_src.1.clone()),
            ]);
            if let Some(ws_desc) = self.pd.workspace_desc() {
                let workspace = workspace.ok_or_else(|| {
                    Error::configuration("pooling backward: missing workspace")
                })?;
                let workspace = memory_as(workspace, ws_desc, &mut exec.temp, &mut exec.stream)?;
                args.insert(Arg::Workspace, workspace);
            }
            exec.stream.register(self.primitive.clone(), args);
            commit_output(in_grad, diff_src, &mut exec.stream)?;
            exec.stream.submit()
        })
    }
}

/// The cached forward primitive for the call.
///
/// **Errors**
/// - The primitive could not be built.
pub fn get_pooling_fwd(
    exec: &mut ExecContext,
    param: &PoolingParam,
    is_train: bool,
    data: &Tensor,
    output: &Tensor,
) -> Result<Arc<PoolingFwd>> {
    let with_workspace = is_train && param.require_workspace();
    let mut key = OpSignature::new();
    key.add(param).add(&is_train).add(&with_workspace).add(data).add(output);
    if param.is_adaptive() {
        key.add(&true);
    }
    let engine = exec.engine().clone();
    let data_desc = data.desc();
    let out_dims = output.shape();
    exec.caches.pooling_fwd.get_or_build(key, || {
        PoolingFwd::new(&engine, param, is_train, &data_desc, &out_dims)
    })
}

/// The cached backward primitive for the call.
///
/// Without `in_data`, as for adaptive pooling, the forward input is described by `in_grad`.
///
/// **Errors**
/// - The primitive could not be built.
pub fn get_pooling_bwd(
    exec: &mut ExecContext,
    param: &PoolingParam,
    in_data: Option<&Tensor>,
    in_grad: &Tensor,
    out_grad: &Tensor,
) -> Result<Arc<PoolingBwd>> {
    let in_data = in_data.unwrap_or(in_grad);
    let mut key = OpSignature::new();
    key.add(param).add(in_data).add(in_grad).add(out_grad);
    if param.is_adaptive() {
        key.add(&true);
    }
    let engine = exec.engine().clone();
    let data_desc = in_data.desc();
    let (in_grad_dims, out_grad_dims) = (in_grad.shape(), out_grad.shape());
    exec.caches.pooling_bwd.get_or_build(key, || {
        PoolingBwd::new(&engine, param, &data_desc, &in_grad_dims, &out_grad_dims)
    })
}

/// Pooling forward with the engine.
///
/// `outputs` is `[out]`, plus `[workspace]` for max pooling.
///
/// **Errors**
/// - See [`Operator::forward`].
pub fn pooling_compute(
    ctx: &mut OpContext,
    param: &PoolingParam,
    inputs: &[Tensor],
    req: &[OpReq],
    outputs: &[Tensor],
) -> Result<()> {
    let workspace = if param.require_workspace() {
        ensure!(
            outputs.len() > 1,
            Error::Configuration("max pooling requires a workspace output".into())
        );
        Some(&outputs[1])
    } else {
        None
    };
    if req[0] == OpReq::Null {
        return Ok(());
    }
    let fwd = get_pooling_fwd(ctx.exec, param, ctx.is_train, &inputs[0], &outputs[0])?;
    fwd.execute(ctx.exec, &inputs[0], req[0], &outputs[0], workspace)
}

/// Pooling backward with the engine.
///
/// `inputs` is `[out_grad, out_grad_ws, in_data, out_data, workspace]` for max pooling,
/// `[out_grad, in_data, out_data]` for average pooling and `[out_grad]` for adaptive pooling.
/// `outputs` is `[in_grad]`.
///
/// **Errors**
/// - See [`Operator::backward`].
pub fn pooling_grad_compute(
    ctx: &mut OpContext,
    param: &PoolingParam,
    inputs: &[Tensor],
    req: &[OpReq],
    outputs: &[Tensor],
) -> Result<()> {
    if req[0] == OpReq::Null {
        return Ok(());
    }
    let out_grad = &inputs[0];
    let in_grad = &outputs[0];
    let (in_data, workspace) = if param.require_workspace() {
        ensure!(
            inputs.len() == 5,
            Error::Configuration(format!("max pooling backward expects 5 inputs, found {}", inputs.len()))
        );
        (Some(&inputs[2]), Some(&inputs[4]))
    } else if !param.is_adaptive() {
        ensure!(
            inputs.len() == 3,
            Error::Configuration(format!("pooling backward expects 3 inputs, found {}", inputs.len()))
        );
        (Some(&inputs[1]), None)
    } else {
        (None, None)
    };
    let bwd = get_pooling_bwd(ctx.exec, param, in_data, in_grad, out_grad)?;
    bwd.execute(ctx.exec, out_grad, req[0], in_grad, workspace)
}

/// Pooling operator.
#[derive(Clone, Debug)]
pub struct Pooling {
    param: PoolingParam,
}

impl Pooling {
    /// Creates the operator.
    pub fn new(param: PoolingParam) -> Self {
        Self { param }
    }
    /// The parameters.
    pub fn param(&self) -> &PoolingParam {
        &self.param
    }
    fn num_outputs(&self) -> usize {
        if self.param.require_workspace() {
            2
        } else {
            1
        }
    }
}

impl Operator for Pooling {
    fn name(&self) -> &'static str {
        "pooling"
    }
    /// The output shape, plus the workspace shape for max pooling.
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        ensure!(
            inputs.len() == 1,
            Error::Configuration(format!("pooling expects 1 input, found {}", inputs.len()))
        );
        let out = pooling_output_shape(&self.param, &inputs[0])?;
        Ok(vec![out; self.num_outputs()])
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
        check_io(self.name(), inputs, &[1], req, outputs, &[self.num_outputs()])?;
        pooling_compute(ctx, &self.param, inputs, req, outputs)
    }
    fn backward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        let num_inputs = if self.param.require_workspace() {
            5
        } else if self.param.is_adaptive() {
            1
        } else {
            3
        };
        check_io(self.name(), inputs, &[num_inputs], req, outputs, &[1])?;
        pooling_grad_compute(ctx, &self.param, inputs, req, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::CacheKind, scalar::ScalarType};

    fn iota(dims: [usize; 4]) -> Tensor {
        let len = dims.iter().product::<usize>();
        Tensor::from_vec(dims, (1..=len).map(|x| x as f32).collect()).unwrap()
    }

    #[test]
    fn max_pooling_train_and_backward() {
        let mut exec = ExecContext::with_config(Config::default());
        let op = Pooling::new(PoolingParam::new([2, 2]).with_stride([2, 2]));
        let x = iota([1, 1, 4, 4]);
        let shapes = op.infer_shape(&[x.shape()]).unwrap();
        let y = Tensor::zeros(shapes[0].clone(), ScalarType::F32);
        let ws = Tensor::zeros(shapes[1].clone(), ScalarType::I32);
        let mut ctx = OpContext::new(&mut exec, true);
        op.forward(&mut ctx, &[x.clone()], &[OpReq::Write, OpReq::Write], &[y.clone(), ws.clone()])
            .unwrap();
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![6., 8., 14., 16.]);
        let dy = Tensor::from_vec([1, 1, 2, 2], vec![1f32, 1., 1., 1.]).unwrap();
        let dx = Tensor::zeros([1, 1, 4, 4], ScalarType::F32);
        op.backward(
            &mut ctx,
            &[dy.clone(), dy, x, y, ws],
            &[OpReq::Write],
            &[dx.clone()],
        )
        .unwrap();
        let dx = dx.to_vec::<f32>().unwrap();
        assert_eq!(dx.iter().sum::<f32>(), 4.);
        assert_eq!(dx[5], 1.);
        assert_eq!(dx[15], 1.);
    }

    #[test]
    fn missing_workspace_is_configuration_error() {
        let mut exec = ExecContext::with_config(Config::default());
        let param = PoolingParam::new([2, 2]).with_stride([2, 2]);
        let x = iota([1, 1, 4, 4]);
        let y = Tensor::zeros([1, 1, 2, 2], ScalarType::F32);
        let mut ctx = OpContext::new(&mut exec, true);
        let error = pooling_compute(&mut ctx, &param, &[x], &[OpReq::Write], &[y.clone()]).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![0.; 4]);
    }

    #[test]
    fn add_to_and_cache_reuse() {
        let mut exec = ExecContext::with_config(Config::default());
        let op = Pooling::new(
            PoolingParam::new([2, 2])
                .with_stride([2, 2])
                .with_pool_type(PoolType::Avg),
        );
        let x = iota([1, 1, 4, 4]);
        let y = Tensor::from_vec([1, 1, 2, 2], vec![1f32; 4]).unwrap();
        for _ in 0..2 {
            let mut ctx = OpContext::new(&mut exec, false);
            op.forward(&mut ctx, &[x.clone()], &[OpReq::AddTo], &[y.clone()]).unwrap();
        }
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![8., 12., 24., 28.]);
        let stats = exec.cache_stats(CacheKind::PoolingForward);
        assert_eq!((stats.misses, stats.hits), (1, 1));
        assert_eq!(exec.temp_stats().live, 0);
    }

    #[test]
    fn bf16_channels_last() {
        let mut exec = ExecContext::with_config(Config::default());
        let op = Pooling::new(PoolingParam::new([2, 2]).with_stride([2, 2]).with_pool_type(PoolType::Avg));
        let x = Tensor::from_vec(
            [1, 1, 4, 4],
            (1..=16).map(|x| half::bf16::from_f32(x as f32)).collect(),
        )
        .unwrap();
        x.reorder_in_place(MemoryDesc::channels_last([1, 1, 4, 4], ScalarType::BF16)).unwrap();
        let y = Tensor::zeros([1, 1, 2, 2], ScalarType::BF16);
        let mut ctx = OpContext::new(&mut exec, false);
        op.forward(&mut ctx, &[x], &[OpReq::Write], &[y.clone()]).unwrap();
        assert_eq!(y.to_f32_vec().unwrap(), vec![3.5, 5.5, 11.5, 13.5]);
    }

    #[test]
    fn int8_is_configuration_error() {
        let mut exec = ExecContext::with_config(Config::default());
        let op = Pooling::new(PoolingParam::new([2]).with_pool_type(PoolType::Avg));
        let x = Tensor::zeros([1, 1, 4], ScalarType::I8);
        let y = Tensor::zeros([1, 1, 3], ScalarType::I8);
        let mut ctx = OpContext::new(&mut exec, false);
        let error = op.forward(&mut ctx, &[x], &[OpReq::Write], &[y]).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
    }
}
