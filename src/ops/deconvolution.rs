//! Deconvolution (transposed convolution).
//!
//! Weights are stored `[IC, OC / G, k..]`. The engine expects them logically swapped, as
//! `[OC, IC, k..]` or `[G, OC / G, IC / G, k..]` when grouped, so the weight tensors are
//! reinterpreted for the duration of a call and restored afterwards.
//!
//! Primitive descriptors are searched by [`create_deconv_pd`]: the engine proposes layouts,
//! and implementations whose layouts need more memory than the logical tensors are skipped.
//! When every implementation pads, one flexible descriptor at a time is forced to row major.

use super::{check_io, DispatchMode, Operator, Pass};
use crate::{
    config::Config,
    context::{ExecContext, OpContext, OpReq},
    engine::{
        convolution::{
            DeconvBackwardData, DeconvBackwardWeights, DeconvDesc, DeconvForward, DeconvPd,
            DeconvPropKind,
        },
        Arg, ArgMap, Engine, Primitive,
    },
    error::Error,
    exec::{commit_output, create_mem, memory_as},
    memory::MemoryDesc,
    planner::deconv_output_shape,
    scalar::ScalarType,
    signature::{OpSignature, Sign},
    tensor::Tensor,
};
use anyhow::{ensure, Result};
use std::sync::Arc;

/// Deconvolution parameters.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeconvolutionParam {
    /// Kernel size, 1 to 3 spatial dims.
    pub kernel: Vec<usize>,
    /// Strides.
    pub stride: Vec<usize>,
    /// Dilation, 1 is dense.
    pub dilate: Vec<usize>,
    /// Padding on both sides.
    pub pad: Vec<usize>,
    /// Extra output size on the right.
    pub adj: Vec<usize>,
    /// Output channels.
    pub num_filter: usize,
    /// Groups.
    pub num_group: usize,
    /// Whether there is no bias input.
    pub no_bias: bool,
}

impl DeconvolutionParam {
    /// A dense, ungrouped deconvolution without bias.
    pub fn new(kernel: impl Into<Vec<usize>>, num_filter: usize) -> Self {
        let kernel = kernel.into();
        let nd = kernel.len();
        Self {
            kernel,
            stride: vec![1; nd],
            dilate: vec![1; nd],
            pad: vec![0; nd],
            adj: vec![0; nd],
            num_filter,
            num_group: 1,
            no_bias: true,
        }
    }
    /// With `stride`.
    pub fn with_stride(self, stride: impl Into<Vec<usize>>) -> Self {
        Self {
            stride: stride.into(),
            ..self
        }
    }
    /// With `dilate`.
    pub fn with_dilate(self, dilate: impl Into<Vec<usize>>) -> Self {
        Self {
            dilate: dilate.into(),
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
    /// With `adj`.
    pub fn with_adj(self, adj: impl Into<Vec<usize>>) -> Self {
        Self {
            adj: adj.into(),
            ..self
        }
    }
    /// With `num_group` groups.
    pub fn with_groups(self, num_group: usize) -> Self {
        Self { num_group, ..self }
    }
    /// With a bias input.
    pub fn with_bias(self) -> Self {
        Self {
            no_bias: false,
            ..self
        }
    }
    /// Validates the parameters.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] for inconsistent lengths, zero sizes or groups that do not
    ///   divide the filters.
    pub fn check(&self) -> Result<()> {
        let nd = self.kernel.len();
        ensure!(
            (1..=3).contains(&nd),
            Error::Configuration(format!(
                "deconvolution kernel {:?} must have 1 to 3 dims",
                self.kernel
            ))
        );
        ensure!(
            [&self.stride, &self.dilate, &self.pad, &self.adj]
                .iter()
                .all(|x| x.len() == nd),
            Error::Configuration(format!(
                "deconvolution stride {:?}, dilate {:?}, pad {:?} and adj {:?} must have {nd} dims",
                self.stride, self.dilate, self.pad, self.adj
            ))
        );
        ensure!(
            self.kernel.iter().chain(&self.stride).chain(&self.dilate).all(|x| *x > 0),
            Error::Configuration("deconvolution kernel, stride and dilate must be > 0".into())
        );
        ensure!(
            self.num_filter > 0 && self.num_group > 0 && self.num_filter % self.num_group == 0,
            Error::Configuration(format!(
                "deconvolution num_filter {} must be a positive multiple of num_group {}",
                self.num_filter, self.num_group
            ))
        );
        Ok(())
    }
    /// The weights shape for input channels `ic`, `[IC, OC / G, k..]`.
    pub fn weight_shape(&self, ic: usize) -> Vec<usize> {
        let mut shape = vec![ic, self.num_filter / self.num_group.max(1)];
        shape.extend_from_slice(&self.kernel);
        shape
    }
    fn desc_params(&self) -> (Vec<usize>, Vec<usize>, Vec<usize>, Vec<isize>) {
        let strides = self.stride.clone();
        let dilates = self.dilate.iter().map(|d| d - 1).collect();
        let pad_l = self.pad.clone();
        let pad_r = self
            .pad
            .iter()
            .zip(&self.adj)
            .map(|(p, a)| *p as isize - *a as isize)
            .collect();
        (strides, dilates, pad_l, pad_r)
    }
}

impl Sign for DeconvolutionParam {
    fn sign(&self, sig: &mut OpSignature) {
        sig.add(&self.kernel)
            .add(&self.stride)
            .add(&self.dilate)
            .add(&self.pad)
            .add(&self.adj)
            .add(&self.num_filter)
            .add(&self.num_group)
            .add(&self.no_bias);
    }
}

/// Weights `[IC, OC / G, k..]` viewed as the engine expects them.
fn io_swap(desc: &MemoryDesc, num_group: usize) -> Result<MemoryDesc> {
    if num_group > 1 {
        desc.split_groups(num_group)?.swap_io(num_group)
    } else {
        desc.swap_io(1)
    }
}

/// The inverse of [`io_swap`].
fn io_unswap(desc: &MemoryDesc, num_group: usize) -> Result<MemoryDesc> {
    if num_group > 1 {
        desc.swap_io(num_group)?.merge_groups()
    } else {
        desc.swap_io(1)
    }
}

/// `tensor` described in engine orientation, sharing its storage.
///
/// Only the returned handle sees the swapped dims, the caller's handle is untouched.
fn io_swapped(tensor: &Tensor, num_group: usize) -> Result<Tensor> {
    let memory = tensor.memory()?;
    let desc = io_swap(memory.desc(), num_group)?;
    Ok(memory.with_desc(desc)?.into())
}

/// A descriptor slot of [`DeconvDescCreator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DescSlot {
    /// Data, or its gradient.
    Data,
    /// Output, or its gradient.
    Out,
    /// Weights, or their gradient.
    Weights,
}

/// Builds deconvolution descriptors, tracking which slots were forced to row major.
#[derive(Clone, Debug)]
pub struct DeconvDescCreator {
    data: MemoryDesc,
    weights: MemoryDesc,
    weight_dims: Vec<usize>,
    bias: Option<MemoryDesc>,
    out: MemoryDesc,
    num_group: usize,
    strides: Vec<usize>,
    dilates: Vec<usize>,
    pad_l: Vec<usize>,
    pad_r: Vec<isize>,
    imposed: Vec<DescSlot>,
}

impl DeconvDescCreator {
    /// Flexible descriptors for the tensors of a call.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if the weights cannot be split into groups.
    pub fn new(
        param: &DeconvolutionParam,
        data: &Tensor,
        weights: &Tensor,
        bias: Option<&Tensor>,
        out: &Tensor,
    ) -> Result<Self> {
        let (strides, dilates, pad_l, pad_r) = param.desc_params();
        let weight_dims = weights.shape();
        let weights_desc = io_swap(
            &MemoryDesc::any(weight_dims.clone(), weights.scalar_type()),
            param.num_group,
        )?;
        Ok(Self {
            data: MemoryDesc::any(data.shape(), data.scalar_type()),
            weights: weights_desc,
            weight_dims,
            bias: bias.map(|b| MemoryDesc::plain(b.shape(), b.scalar_type())),
            out: MemoryDesc::any(out.shape(), out.scalar_type()),
            num_group: param.num_group,
            strides,
            dilates,
            pad_l,
            pad_r,
            imposed: Vec::new(),
        })
    }
    /// The operation descriptor, with the bias when `with_bias`.
    pub fn desc(&self, with_bias: bool) -> DeconvDesc {
        DeconvDesc {
            src: self.data.clone(),
            weights: self.weights.clone(),
            bias: if with_bias { self.bias.clone() } else { None },
            dst: self.out.clone(),
            strides: self.strides.clone(),
            dilates: self.dilates.clone(),
            pad_l: self.pad_l.clone(),
            pad_r: self.pad_r.clone(),
        }
    }
    fn logical_sizes(&self) -> [usize; 3] {
        [
            self.data.logical_size_bytes(),
            self.weights.logical_size_bytes(),
            self.out.logical_size_bytes(),
        ]
    }
    /// Whether the physical `sizes` of data, weights and out match the logical sizes.
    pub fn check_impl_size_req(&self, sizes: [usize; 3]) -> bool {
        sizes == self.logical_sizes()
    }
    /// Forces the first flexible descriptor whose size mismatches to row major, in the order
    /// data, out, weights.
    ///
    /// Returns the slot changed, or `None` if nothing is left to change.
    pub fn impose_plain_where_padding(&mut self, sizes: [usize; 3]) -> Option<DescSlot> {
        let [data_size, weights_size, out_size] = sizes;
        let [data_logical, weights_logical, out_logical] = self.logical_sizes();
        let slot = if self.data.is_any() && data_size != data_logical {
            self.data = self.data.to_plain();
            DescSlot::Data
        } else if self.out.is_any() && out_size != out_logical {
            self.out = self.out.to_plain();
            DescSlot::Out
        } else if self.weights.is_any() && weights_size != weights_logical {
            let plain = MemoryDesc::plain(self.weight_dims.clone(), self.weights.scalar_type());
            self.weights = io_swap(&plain, self.num_group).ok()?;
            DescSlot::Weights
        } else {
            return None;
        };
        self.imposed.push(slot);
        Some(slot)
    }
    /// The slots forced to row major, in order.
    pub fn imposed(&self) -> &[DescSlot] {
        &self.imposed
    }
}

fn pd_sizes(pd: &DeconvPd) -> [usize; 3] {
    [
        pd.src_desc().size_bytes(),
        pd.weights_desc().size_bytes(),
        pd.dst_desc().size_bytes(),
    ]
}

enum Search {
    Candidate(DeconvPd),
    Downgrade(DeconvPd),
}

/// Searches for a primitive descriptor whose layouts need no padding.
///
/// Tries every implementation of the current descriptors, then forces one descriptor to row
/// major and starts over. Terminates after at most 3 downgrades.
///
/// **Errors**
/// - [`Error::NoViableImplementation`] if every implementation pads and no descriptor is
///   left to change.
pub fn create_deconv_pd(
    engine: &Engine,
    kind: DeconvPropKind,
    creator: &mut DeconvDescCreator,
    hint: Option<&DeconvPd>,
) -> Result<DeconvPd> {
    let with_bias = kind != DeconvPropKind::BackwardData;
    let mut state = Search::Candidate(DeconvPd::new(engine, kind, creator.desc(with_bias), hint)?);
    loop {
        state = match state {
            Search::Candidate(mut pd) => {
                if creator.check_impl_size_req(pd_sizes(&pd)) {
                    return Ok(pd);
                }
                if pd.next_impl() {
                    Search::Candidate(pd)
                } else {
                    Search::Downgrade(pd)
                }
            }
            Search::Downgrade(pd) => {
                let slot = creator
                    .impose_plain_where_padding(pd_sizes(&pd))
                    .ok_or_else(|| {
                        Error::no_viable_implementation(format!(
                            "no {kind:?} deconvolution implementation without padding"
                        ))
                    })?;
                tracing::debug!(?kind, ?slot, "deconvolution: imposing row major layout");
                Search::Candidate(DeconvPd::new(engine, kind, creator.desc(with_bias), hint)?)
            }
        };
    }
}

/// Compiled deconvolution forward.
#[derive(Debug)]
pub struct DeconvFwd {
    pd: DeconvPd,
    primitive: Arc<dyn Primitive>,
    imposed: Vec<DescSlot>,
}

impl DeconvFwd {
    fn new(
        engine: &Engine,
        param: &DeconvolutionParam,
        data: &Tensor,
        weights: &Tensor,
        bias: Option<&Tensor>,
        out: &Tensor,
    ) -> Result<Self> {
        let mut creator = DeconvDescCreator::new(param, data, weights, bias, out)?;
        let pd = create_deconv_pd(engine, DeconvPropKind::Forward, &mut creator, None)?;
        let primitive = Arc::new(DeconvForward::new(pd.clone())?);
        Ok(Self {
            pd,
            primitive,
            imposed: creator.imposed().to_vec(),
        })
    }
    /// The primitive descriptor.
    pub fn pd(&self) -> &DeconvPd {
        &self.pd
    }
    /// The slots forced to row major while searching.
    pub fn imposed(&self) -> &[DescSlot] {
        &self.imposed
    }
    /// Keeps the weights in the layout suited to the pass.
    ///
    /// Inference converts row major weights to the layout of the primitive, so later calls
    /// skip the reorder. Training converts them back to row major.
    fn control_weights_format(&self, num_group: usize, is_train: bool, weights: &Tensor) -> Result<()> {
        if weights.is_view() {
            return Ok(());
        }
        if is_train {
            weights.reorder_to_default_in_place()
        } else if weights.is_default_layout() {
            match io_unswap(self.pd.weights_desc(), num_group) {
                Ok(desc) => weights.reorder_in_place(desc),
                Err(error) => {
                    tracing::debug!("deconvolution: keeping row major weights: {error:#}");
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }
    /// Executes, writing `out` per `req`.
    ///
    /// **Errors**
    /// - The tensors do not match the primitive.
    pub fn execute(
        &self,
        exec: &mut ExecContext,
        num_group: usize,
        data: &Tensor,
        weights: &Tensor,
        bias: Option<&Tensor>,
        req: OpReq,
        out: &Tensor,
    ) -> Result<()> {
        let data = data.to_compact()?;
        let weights = io_swapped(weights, num_group)?;
        exec.scoped(|exec| {
            let pd = &self.pd;
            let src = memory_as(&data, pd.src_desc(), &mut exec.temp, &mut exec.stream)?;
            let w = memory_as(&weights, pd.weights_desc(), &mut exec.temp, &mut exec.stream)?;
            let dst = create_mem(
                out,
                pd.dst_desc(),
                req,
                self.primitive.supports_in_place(),
                &mut exec.temp,
            )?;
            let scratchpad = exec.temp.alloc(pd.scratchpad_desc())?;
            let mut args = ArgMap::from([
                (Arg::Src, src),
                (Arg::Weights, w),
                (Arg::Dst, dst.1.clone()),
                (Arg::Scratchpad, scratchpad),
            ]);
            if let (Some(bias), Some(bias_desc)) = (bias, pd.bias_desc()) {
                let bias = memory_as(bias, bias_desc, &mut exec.temp, &mut exec.stream)?;
                args.insert(Arg::Bias, bias);
            }
            exec.stream.register(self.primitive.clone(), args);
            commit_output(out, dst, &mut exec.stream)?;
            exec.stream.submit()
        })
    }
}

/// Compiled deconvolution backward, data and weights.
#[derive(Debug)]
pub struct DeconvBwd {
    data_pd: DeconvPd,
    weights_pd: DeconvPd,
    bwd_data: Arc<dyn Primitive>,
    bwd_weights: Arc<dyn Primitive>,
}

/// Gradients written by [`DeconvBwd::execute`].
#[derive(Clone, Copy, Debug)]
pub struct DeconvGrads<'a> {
    /// Data gradient.
    pub data_grad: &'a Tensor,
    /// Weights gradient.
    pub weights_grad: &'a Tensor,
    /// Bias gradient.
    pub bias_grad: Option<&'a Tensor>,
}

impl DeconvBwd {
    fn new(
        engine: &Engine,
        param: &DeconvolutionParam,
        out_grad: &Tensor,
        data: &Tensor,
        weights: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Self> {
        let mut fwd_creator = DeconvDescCreator::new(param, data, weights, bias, out_grad)?;
        let hint = create_deconv_pd(engine, DeconvPropKind::Forward, &mut fwd_creator, None)?;
        let mut data_creator = DeconvDescCreator::new(param, data, weights, None, out_grad)?;
        let data_pd = create_deconv_pd(
            engine,
            DeconvPropKind::BackwardData,
            &mut data_creator,
            Some(&hint),
        )?;
        let mut weights_creator = DeconvDescCreator::new(param, data, weights, bias, out_grad)?;
        let weights_pd = create_deconv_pd(
            engine,
            DeconvPropKind::BackwardWeights,
            &mut weights_creator,
            Some(&hint),
        )?;
        Ok(Self {
            bwd_data: Arc::new(DeconvBackwardData::new(data_pd.clone())?),
            bwd_weights: Arc::new(DeconvBackwardWeights::new(weights_pd.clone())?),
            data_pd,
            weights_pd,
        })
    }
    /// The backward data primitive descriptor.
    pub fn data_pd(&self) -> &DeconvPd {
        &self.data_pd
    }
    /// The backward weights primitive descriptor.
    pub fn weights_pd(&self) -> &DeconvPd {
        &self.weights_pd
    }
    /// Executes, writing the gradients per `req`, `[data, weights, bias?]`.
    ///
    /// The weights gradient is skipped when neither it nor the bias gradient is requested.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if the weights gradient is requested in place.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        exec: &mut ExecContext,
        num_group: usize,
        out_grad: &Tensor,
        data: &Tensor,
        weights: &Tensor,
        req: &[OpReq],
        grads: DeconvGrads,
    ) -> Result<()> {
        let data_req = req.first().copied().unwrap_or(OpReq::Null);
        let weight_req = req.get(1).copied().unwrap_or(OpReq::Null);
        let bias_req = req.get(2).copied().unwrap_or(OpReq::Null);
        ensure!(
            weight_req != OpReq::WriteInPlace,
            Error::Configuration("cannot write deconvolution weights in place".into())
        );
        let out_grad = out_grad.to_compact()?;
        let data = data.to_compact()?;
        let weights = io_swapped(weights, num_group)?;
        let weights_grad = io_swapped(grads.weights_grad, num_group)?;
        exec.scoped(|exec| {
            if data_req != OpReq::Null {
                let pd = &self.data_pd;
                let diff_dst = memory_as(&out_grad, pd.dst_desc(), &mut exec.temp, &mut exec.stream)?;
                let w = memory_as(&weights, pd.weights_desc(), &mut exec.temp, &mut exec.stream)?;
                let diff_src = create_mem(
                    grads.data_grad,
                    pd.src_desc(),
                    data_req,
                    self.bwd_data.supports_in_place(),
                    &mut exec.temp,
                )?;
                let scratchpad = exec.temp.alloc(pd.scratchpad_desc())?;
                let args = ArgMap::from([
                    (Arg::DiffDst, diff_dst),
                    (Arg::Weights, w),
                    (Arg::DiffSrc, diff_src.1.clone()),
                    (Arg::Scratchpad, scratchpad),
                ]);
                exec.stream.register(self.bwd_data.clone(), args);
                commit_output(grads.data_grad, diff_src, &mut exec.stream)?;
            }
            if weight_req != OpReq::Null || bias_req != OpReq::Null {
                let pd = &self.weights_pd;
                let diff_dst = memory_as(&out_grad, pd.dst_desc(), &mut exec.temp, &mut exec.stream)?;
                let src = memory_as(&data, pd.src_desc(), &mut exec.temp, &mut exec.stream)?;
                let diff_weights = create_mem(
                    &weights_grad,
                    pd.weights_desc(),
                    weight_req,
                    false,
                    &mut exec.temp,
                )?;
                let scratchpad = exec.temp.alloc(pd.scratchpad_desc())?;
                let mut args = ArgMap::from([
                    (Arg::DiffDst, diff_dst),
                    (Arg::Src, src),
                    (Arg::DiffWeights, diff_weights.1.clone()),
                    (Arg::Scratchpad, scratchpad),
                ]);
                let diff_bias = match (grads.bias_grad, pd.bias_desc()) {
                    (Some(bias_grad), Some(bias_desc)) if bias_req != OpReq::Null => {
                        let diff_bias = create_mem(bias_grad, bias_desc, bias_req, false, &mut exec.temp)?;
                        args.insert(Arg::DiffBias, diff_bias.1.clone());
                        Some((bias_grad, diff_bias))
                    }
                    _ => None,
                };
                exec.stream.register(self.bwd_weights.clone(), args);
                commit_output(&weights_grad, diff_weights, &mut exec.stream)?;
                if let Some((bias_grad, diff_bias)) = diff_bias {
                    commit_output(bias_grad, diff_bias, &mut exec.stream)?;
                }
            }
            exec.stream.submit()
        })
    }
}

/// The cached forward primitive for the call.
///
/// **Errors**
/// - The primitive could not be built.
pub fn get_deconv_fwd(
    exec: &mut ExecContext,
    param: &DeconvolutionParam,
    data: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    out: &Tensor,
) -> Result<Arc<DeconvFwd>> {
    let mut key = OpSignature::new();
    key.add(param).add(data).add(weights).add(out);
    if let Some(bias) = bias {
        key.add(bias);
    }
    let engine = exec.engine().clone();
    exec.caches
        .deconv_fwd
        .get_or_build(key, || DeconvFwd::new(&engine, param, data, weights, bias, out))
}

/// The cached backward primitives for the call.
///
/// **Errors**
/// - The primitives could not be built.
pub fn get_deconv_bwd(
    exec: &mut ExecContext,
    param: &DeconvolutionParam,
    out_grad: &Tensor,
    data: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Arc<DeconvBwd>> {
    let mut key = OpSignature::new();
    key.add(param).add(data).add(weights).add(out_grad);
    if let Some(bias) = bias {
        key.add(bias);
    }
    let engine = exec.engine().clone();
    exec.caches
        .deconv_bwd
        .get_or_build(key, || DeconvBwd::new(&engine, param, out_grad, data, weights, bias))
}

/// Deconvolution operator.
#[derive(Clone, Debug)]
pub struct Deconvolution {
    param: DeconvolutionParam,
}

impl Deconvolution {
    /// Creates the operator.
    pub fn new(param: DeconvolutionParam) -> Self {
        Self { param }
    }
    /// The parameters.
    pub fn param(&self) -> &DeconvolutionParam {
        &self.param
    }
    fn num_inputs(&self) -> usize {
        if self.param.no_bias {
            2
        } else {
            3
        }
    }
    fn check_tensors(&self, data: &Tensor, weights: &Tensor, bias: Option<&Tensor>, out: &Tensor) -> Result<()> {
        let param = &self.param;
        let data_shape = data.shape();
        let scalar_type = data.scalar_type();
        ensure!(
            matches!(scalar_type, ScalarType::F32 | ScalarType::BF16),
            Error::Configuration(format!("deconvolution requires f32 or bf16, found {scalar_type:?}"))
        );
        let out_shape = deconv_output_shape(param, &data_shape)?;
        ensure!(
            out.shape() == out_shape,
            Error::Configuration(format!(
                "deconvolution output {:?} does not match {out_shape:?}",
                out.shape()
            ))
        );
        let weight_shape = param.weight_shape(data_shape[1]);
        ensure!(
            data_shape[1] % param.num_group == 0 && weights.shape() == weight_shape,
            Error::Configuration(format!(
                "deconvolution weights {:?} do not match {weight_shape:?}",
                weights.shape()
            ))
        );
        if let Some(bias) = bias {
            ensure!(
                bias.shape() == [param.num_filter],
                Error::Configuration(format!(
                    "deconvolution bias {:?} must be [{}]",
                    bias.shape(),
                    param.num_filter
                ))
            );
        }
        Ok(())
    }
}

impl Operator for Deconvolution {
    fn name(&self) -> &'static str {
        "deconvolution"
    }
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        ensure!(
            !inputs.is_empty(),
            Error::Configuration("deconvolution expects a data input".into())
        );
        Ok(vec![deconv_output_shape(&self.param, &inputs[0])?])
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
    /// `inputs` is `[data, weight, bias?]`, `outputs` is `[out]`.
    fn forward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        check_io(self.name(), inputs, &[self.num_inputs()], req, outputs, &[1])?;
        let (data, weights, bias) = (&inputs[0], &inputs[1], inputs.get(2));
        self.check_tensors(data, weights, bias, &outputs[0])?;
        if req[0] == OpReq::Null {
            return Ok(());
        }
        let fwd = get_deconv_fwd(ctx.exec, &self.param, data, weights, bias, &outputs[0])?;
        fwd.control_weights_format(self.param.num_group, ctx.is_train, weights)?;
        fwd.execute(
            ctx.exec,
            self.param.num_group,
            data,
            weights,
            bias,
            req[0],
            &outputs[0],
        )
    }
    /// `inputs` is `[out_grad, data, weight, bias?]`, `outputs` is
    /// `[data_grad, weight_grad, bias_grad?]`.
    fn backward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        let num_outputs = self.num_inputs();
        check_io(self.name(), inputs, &[num_outputs + 1], req, outputs, &[num_outputs])?;
        ensure!(
            req[1] != OpReq::WriteInPlace,
            Error::Configuration("cannot write deconvolution weights in place".into())
        );
        let (out_grad, data, weights, bias) = (&inputs[0], &inputs[1], &inputs[2], inputs.get(3));
        self.check_tensors(data, weights, bias, out_grad)?;
        ensure!(
            outputs[0].shape() == data.shape()
                && outputs[1].shape() == weights.shape()
                && outputs.get(2).map_or(true, |b| b.shape() == [self.param.num_filter]),
            Error::Configuration(format!(
                "deconvolution gradients {:?} do not match the inputs",
                outputs.iter().map(Tensor::shape).collect::<Vec<_>>()
            ))
        );
        if req.iter().all(|r| *r == OpReq::Null) {
            return Ok(());
        }
        let bwd = get_deconv_bwd(ctx.exec, &self.param, out_grad, data, weights, bias)?;
        let grads = DeconvGrads {
            data_grad: &outputs[0],
            weights_grad: &outputs[1],
            bias_grad: outputs.get(2),
        };
        bwd.execute(ctx.exec, self.param.num_group, out_grad, data, weights, req, grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::CacheKind, engine::{ImplKind, Isa}};
    use approx::assert_relative_eq;
    use half::bf16;

    /// Scatter form of a 1d deconvolution with `[IC, OC / G, k]` weights.
    fn direct_1d(param: &DeconvolutionParam, x: &[f32], ic: usize, w: &[f32], b: Option<&[f32]>) -> Vec<f32> {
        let iw = x.len() / ic;
        let ow = deconv_output_shape(param, &[1, ic, iw]).unwrap()[2];
        let (g, oc) = (param.num_group, param.num_filter);
        let (icg, ocg, k) = (ic / g, oc / g, param.kernel[0]);
        let (s, d, p) = (param.stride[0], param.dilate[0], param.pad[0] as isize);
        let mut y = vec![0f32; oc * ow];
        for c in 0..oc {
            let bias = b.map_or(0., |b| b[c]);
            y[c * ow..(c + 1) * ow].iter_mut().for_each(|y| *y = bias);
        }
        for gi in 0..g {
            for ci in 0..icg {
                let c_in = gi * icg + ci;
                for i in 0..iw {
                    for co in 0..ocg {
                        let c_out = gi * ocg + co;
                        for kk in 0..k {
                            let o = (i * s + kk * d) as isize - p;
                            if o >= 0 && (o as usize) < ow {
                                y[c_out * ow + o as usize] += x[c_in * iw + i] * w[(c_in * ocg + co) * k + kk];
                            }
                        }
                    }
                }
            }
        }
        y
    }

    fn values(len: usize, f: impl Fn(usize) -> f32) -> Vec<f32> {
        (0..len).map(f).collect()
    }

    fn run_forward(exec: &mut ExecContext, param: &DeconvolutionParam, ic: usize, iw: usize, is_train: bool) -> (Vec<f32>, Vec<f32>) {
        let op = Deconvolution::new(param.clone());
        let x = values(ic * iw, |i| (i % 7) as f32 - 3.);
        let w = values(param.weight_shape(ic).iter().product(), |i| (i % 5) as f32 - 2.);
        let b = values(param.num_filter, |i| i as f32);
        let mut inputs = vec![
            Tensor::from_vec([1, ic, iw], x.clone()).unwrap(),
            Tensor::from_vec(param.weight_shape(ic), w.clone()).unwrap(),
        ];
        if !param.no_bias {
            inputs.push(Tensor::from_vec([param.num_filter], b.clone()).unwrap());
        }
        let out_shape = op.infer_shape(&[inputs[0].shape()]).unwrap().remove(0);
        let out = Tensor::zeros(out_shape, ScalarType::F32);
        let mut ctx = OpContext::new(exec, is_train);
        op.forward(&mut ctx, &inputs, &[OpReq::Write], &[out.clone()]).unwrap();
        let bias = (!param.no_bias).then_some(b.as_slice());
        (out.to_vec::<f32>().unwrap(), direct_1d(param, &x, ic, &w, bias))
    }

    #[test]
    fn param_check() {
        assert!(DeconvolutionParam::new([3], 4).check().is_ok());
        let error = DeconvolutionParam::new([3], 4).with_groups(3).check().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
        assert!(DeconvolutionParam::new([3, 3], 4).with_stride([1]).check().is_err());
        assert!(DeconvolutionParam::new([0], 4).check().is_err());
    }

    #[test]
    fn forward_matches_direct() {
        let params = [
            DeconvolutionParam::new([3], 3).with_stride([2]).with_pad([1]).with_bias(),
            DeconvolutionParam::new([2], 4).with_stride([2]).with_adj([1]),
            DeconvolutionParam::new([3], 4).with_dilate([2]).with_groups(2).with_bias(),
        ];
        for isa in [Isa::Reference, Isa::Simd16] {
            let mut exec = ExecContext::with_config(Config {
                isa,
                ..Config::default()
            });
            for param in params.iter() {
                let (y, expected) = run_forward(&mut exec, param, 2, 5, true);
                assert_eq!(y.len(), expected.len());
                for (y, e) in y.iter().zip(expected) {
                    assert_relative_eq!(*y, e, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn inference_keeps_weights_values() {
        let mut exec = ExecContext::with_config(Config::default());
        let param = DeconvolutionParam::new([3], 16);
        let op = Deconvolution::new(param.clone());
        let w = values(16 * 16 * 3, |i| (i % 11) as f32);
        let x = Tensor::from_vec([1, 16, 4], values(64, |i| i as f32 * 0.25)).unwrap();
        let weights = Tensor::from_vec(param.weight_shape(16), w.clone()).unwrap();
        let y = Tensor::zeros([1, 16, 6], ScalarType::F32);
        let mut outputs = Vec::new();
        for is_train in [false, false, true] {
            let mut ctx = OpContext::new(&mut exec, is_train);
            op.forward(&mut ctx, &[x.clone(), weights.clone()], &[OpReq::Write], &[y.clone()])
                .unwrap();
            assert_eq!(weights.shape(), vec![16, 16, 3]);
            assert_eq!(weights.to_f32_vec().unwrap(), w);
            outputs.push(y.to_vec::<f32>().unwrap());
            if !is_train {
                // converted to the layout of the blocked primitive
                assert!(!weights.is_default_layout());
            }
        }
        assert!(weights.is_default_layout());
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], outputs[2]);
    }

    #[test]
    fn backward_gradients() {
        let mut exec = ExecContext::with_config(Config {
            isa: Isa::Reference,
            ..Config::default()
        });
        let param = DeconvolutionParam::new([2], 2).with_bias();
        let op = Deconvolution::new(param.clone());
        let x = Tensor::from_vec([1, 1, 2], vec![1f32, 2.]).unwrap();
        let w = Tensor::from_vec([1, 2, 2], vec![1f32, -1., 2., 0.5]).unwrap();
        let b = Tensor::from_vec([2], vec![0f32, 0.]).unwrap();
        let dy = Tensor::from_vec([1, 2, 3], vec![1f32, 0., 1., 0., 1., 1.]).unwrap();
        let dx = Tensor::zeros([1, 1, 2], ScalarType::F32);
        let dw = Tensor::zeros([1, 2, 2], ScalarType::F32);
        let db = Tensor::from_vec([2], vec![1f32, 1.]).unwrap();
        let mut ctx = OpContext::new(&mut exec, true);
        op.backward(
            &mut ctx,
            &[dy, x, w.clone(), b],
            &[OpReq::Write, OpReq::Write, OpReq::AddTo],
            &[dx.clone(), dw.clone(), db.clone()],
        )
        .unwrap();
        // dx[i] = sum_c sum_k w[c][k] * dy[c][i + k]
        assert_eq!(dx.to_vec::<f32>().unwrap(), vec![1.5, 1.5]);
        // dw[c][k] = sum_i x[i] * dy[c][i + k]
        assert_eq!(dw.to_vec::<f32>().unwrap(), vec![1., 2., 2., 3.]);
        assert_eq!(db.to_vec::<f32>().unwrap(), vec![3., 3.]);
        assert!(dw.is_default_layout());
        assert_eq!(w.shape(), vec![1, 2, 2]);
    }

    #[test]
    fn weights_in_place_is_configuration_error() {
        let mut exec = ExecContext::with_config(Config::default());
        let op = Deconvolution::new(DeconvolutionParam::new([2], 2));
        let dy = Tensor::zeros([1, 2, 3], ScalarType::F32);
        let x = Tensor::zeros([1, 1, 2], ScalarType::F32);
        let w = Tensor::zeros([1, 2, 2], ScalarType::F32);
        let dx = Tensor::from_vec([1, 1, 2], vec![5f32, 5.]).unwrap();
        let dw = Tensor::zeros([1, 2, 2], ScalarType::F32);
        let mut ctx = OpContext::new(&mut exec, true);
        let error = op
            .backward(
                &mut ctx,
                &[dy, x, w],
                &[OpReq::Write, OpReq::WriteInPlace],
                &[dx.clone(), dw],
            )
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
        assert_eq!(dx.to_vec::<f32>().unwrap(), vec![5., 5.]);
        assert_eq!(exec.cache_len(CacheKind::DeconvBackward), 0);
    }

    #[test]
    fn downgrade_imposes_data_out_weights() {
        let mut exec = ExecContext::with_config(Config::default());
        let param = DeconvolutionParam::new([3, 3], 5);
        let x = Tensor::from_vec([1, 3, 4, 4], vec![bf16::ONE; 48]).unwrap();
        let w = Tensor::from_vec(param.weight_shape(3), vec![bf16::ONE; 135]).unwrap();
        let y = Tensor::zeros([1, 5, 6, 6], ScalarType::BF16);
        let fwd = get_deconv_fwd(&mut exec, &param, &x, &w, None, &y).unwrap();
        assert_eq!(fwd.imposed(), &[DescSlot::Data, DescSlot::Out, DescSlot::Weights]);
        assert_eq!(fwd.pd().impl_kind(), ImplKind::Blocked16);
        let op = Deconvolution::new(param);
        let mut ctx = OpContext::new(&mut exec, true);
        op.forward(&mut ctx, &[x, w], &[OpReq::Write], &[y.clone()]).unwrap();
        let y = y.to_f32_vec().unwrap();
        // the center sees the full 3 x 3 kernel over 3 channels
        assert_eq!(y[2 * 6 + 2], 27.);
        assert_eq!(y[0], 3.);
        let stats = exec.cache_stats(CacheKind::DeconvForward);
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn no_viable_implementation() {
        let mut exec = ExecContext::with_config(Config {
            isa: Isa::Reference,
            ..Config::default()
        });
        let op = Deconvolution::new(DeconvolutionParam::new([2], 2));
        let x = Tensor::zeros([1, 1, 2], ScalarType::BF16);
        let w = Tensor::zeros([1, 2, 2], ScalarType::BF16);
        let y = Tensor::zeros([1, 2, 3], ScalarType::BF16);
        let mut ctx = OpContext::new(&mut exec, false);
        let error = op.forward(&mut ctx, &[x, w], &[OpReq::Write], &[y]).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NoViableImplementation(_))
        ));
        assert_eq!(exec.cache_len(CacheKind::DeconvForward), 0);
    }

    #[test]
    fn io_swap_round_trip() {
        let desc = MemoryDesc::plain([4, 3, 2], ScalarType::F32);
        let swapped = io_swap(&desc, 2).unwrap();
        assert_eq!(swapped.dims(), &[2, 3, 2, 2]);
        assert_eq!(io_unswap(&swapped, 2).unwrap(), desc);
        let swapped = io_swap(&desc, 1).unwrap();
        assert_eq!(swapped.dims(), &[3, 4, 2]);
        assert_eq!(io_unswap(&swapped, 1).unwrap(), desc);
    }

    #[test]
    fn swapped_weights_share_storage() {
        let w = Tensor::from_vec([2, 3], (0..6).map(|x| x as f32).collect()).unwrap();
        let swapped = io_swapped(&w, 1).unwrap();
        assert_eq!(swapped.shape(), vec![3, 2]);
        assert_eq!(w.shape(), vec![2, 3]);
        assert_eq!(swapped.to_vec::<f32>().unwrap(), vec![0., 3., 1., 4., 2., 5.]);
        assert!(swapped.same_storage(&w));
        swapped.assign_f32(OpReq::Write, &[0., 30., 10., 40., 20., 50.]).unwrap();
        assert_eq!(w.to_vec::<f32>().unwrap(), vec![0., 10., 20., 30., 40., 50.]);
    }

    #[test]
    fn shared_weights_keep_dims_across_threads() {
        let param = DeconvolutionParam::new([2], 2).with_groups(2);
        let w = Tensor::from_vec(param.weight_shape(2), vec![1f32, 2., 3., 4.]).unwrap();
        let dims = w.shape();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let (param, w) = (param.clone(), w.clone());
                scope.spawn(move || {
                    let mut exec = ExecContext::with_config(Config {
                        isa: Isa::Reference,
                        ..Config::default()
                    });
                    let op = Deconvolution::new(param);
                    for _ in 0..16 {
                        let x = Tensor::from_vec([1, 2, 2], vec![1f32, 1., 1., 1.]).unwrap();
                        let y = Tensor::zeros([1, 2, 3], ScalarType::F32);
                        let mut ctx = OpContext::new(&mut exec, true);
                        op.forward(&mut ctx, &[x, w.clone()], &[OpReq::Write], &[y.clone()])
                            .unwrap();
                        assert_eq!(y.to_vec::<f32>().unwrap(), vec![1., 3., 2., 3., 7., 4.]);
                    }
                });
            }
            for _ in 0..64 {
                assert_eq!(w.shape(), dims);
            }
        });
        assert_eq!(w.to_vec::<f32>().unwrap(), vec![1., 2., 3., 4.]);
    }
}
