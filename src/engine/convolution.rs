//! Deconvolution primitives.
//!
//! A deconvolution is the adjoint of a convolution whose input is the deconvolution output.
//! Forward runs the convolution backward data kernel, backward data runs the convolution
//! forward kernel and backward weights runs the convolution backward weights kernel with
//! source and gradient exchanged.

use super::{check_arg, spatial3, Arg, ArgMap, Engine, ImplKind, Primitive};
use crate::{
    error::Error,
    memory::{Layout, Memory, MemoryDesc},
    scalar::ScalarType,
};
use anyhow::{anyhow, ensure, Result};
use rayon::prelude::*;

/// Propagation kind of a deconvolution primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeconvPropKind {
    /// Data to output.
    Forward,
    /// Output gradient to data gradient.
    BackwardData,
    /// Data and output gradient to weights (and bias) gradient.
    BackwardWeights,
}

/// Operation descriptor for deconvolution.
///
/// `src` is the data (or its gradient), `dst` the output (or its gradient). Weights are
/// `[OC, IC, k..]`, or `[G, OC / G, IC / G, k..]` when grouped.
#[derive(Clone, Debug, PartialEq)]
pub struct DeconvDesc {
    /// Data.
    pub src: MemoryDesc,
    /// Weights.
    pub weights: MemoryDesc,
    /// Bias, `[OC]`.
    pub bias: Option<MemoryDesc>,
    /// Output.
    pub dst: MemoryDesc,
    /// Strides.
    pub strides: Vec<usize>,
    /// Dilation, 0 is dense.
    pub dilates: Vec<usize>,
    /// Padding before.
    pub pad_l: Vec<usize>,
    /// Padding after, negative when the output is extended past the last window.
    pub pad_r: Vec<isize>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ConvGeometry {
    n: usize,
    groups: usize,
    /// Convolution input channels per group, the deconvolution output channels.
    ci: usize,
    /// Convolution output channels per group, the deconvolution input channels.
    co: usize,
    /// Convolution input extent, the deconvolution output.
    i: [usize; 3],
    /// Convolution output extent, the deconvolution input.
    o: [usize; 3],
    k: [usize; 3],
    s: [usize; 3],
    d: [usize; 3],
    p: [usize; 3],
}

fn positions(dims: [usize; 3]) -> impl Iterator<Item = [usize; 3]> {
    (0..dims[0]).flat_map(move |a| (0..dims[1]).flat_map(move |b| (0..dims[2]).map(move |c| [a, b, c])))
}

impl ConvGeometry {
    fn input_len(&self) -> usize {
        self.i.iter().product()
    }
    fn output_len(&self) -> usize {
        self.o.iter().product()
    }
    fn kernel_len(&self) -> usize {
        self.k.iter().product()
    }
    /// Input position read by output `o` at kernel position `k`.
    fn input_index(&self, o: [usize; 3], k: [usize; 3]) -> Option<usize> {
        let mut index = 0;
        for a in 0..3 {
            let x = (o[a] * self.s[a] + k[a] * self.d[a]).checked_sub(self.p[a])?;
            if x >= self.i[a] {
                return None;
            }
            index = index * self.i[a] + x;
        }
        Some(index)
    }
    /// Output position reading input `i` at kernel position `k`.
    fn output_index(&self, i: [usize; 3], k: [usize; 3]) -> Option<usize> {
        let mut index = 0;
        for a in 0..3 {
            let x = (i[a] + self.p[a]).checked_sub(k[a] * self.d[a])?;
            if x % self.s[a] != 0 || x / self.s[a] >= self.o[a] {
                return None;
            }
            index = index * self.o[a] + x / self.s[a];
        }
        Some(index)
    }
}

fn check_deconv(desc: &DeconvDesc) -> Result<ConvGeometry> {
    let DeconvDesc {
        src,
        weights,
        bias,
        dst,
        strides,
        dilates,
        pad_l,
        pad_r,
    } = desc;
    let nd = strides.len();
    let config = |msg: String| Error::Configuration(format!("deconvolution {msg}"));
    ensure!(
        (1..=3).contains(&nd)
            && dilates.len() == nd
            && pad_l.len() == nd
            && pad_r.len() == nd
            && src.ndim() == nd + 2
            && dst.ndim() == nd + 2,
        config(format!(
            "requires rank 3 to 5, found {:?} {:?} {strides:?}",
            src.dims(),
            dst.dims()
        ))
    );
    let grouped = weights.ndim() == nd + 3;
    ensure!(
        grouped || weights.ndim() == nd + 2,
        config(format!("weights {:?} do not match data {:?}", weights.dims(), src.dims()))
    );
    let scalar_type = src.scalar_type();
    ensure!(
        scalar_type.is_float()
            && weights.scalar_type() == scalar_type
            && dst.scalar_type() == scalar_type
            && bias.as_ref().map_or(true, |b| b.scalar_type() == scalar_type),
        config(format!("requires f32 or bf16, found {scalar_type:?}"))
    );
    let w = weights.dims();
    let (groups, oc, ic) = if grouped {
        (w[0], w[1], w[2])
    } else {
        (1, w[0], w[1])
    };
    ensure!(
        src.dims()[0] == dst.dims()[0]
            && src.dims()[1] == groups * ic
            && dst.dims()[1] == groups * oc,
        config(format!(
            "channels of {:?} {:?} do not match weights {w:?}",
            src.dims(),
            dst.dims()
        ))
    );
    if let Some(bias) = bias {
        ensure!(
            bias.dims() == [groups * oc],
            config(format!("bias {:?} must be [{}]", bias.dims(), groups * oc))
        );
    }
    let kernel = &w[w.len() - nd..];
    for a in 0..nd {
        let x = src.dims()[a + 2];
        ensure!(
            kernel[a] > 0 && strides[a] > 0 && x > 0,
            config("kernel, strides and input must be > 0".into())
        );
        let extent = ((x - 1) * strides[a] + (kernel[a] - 1) * (dilates[a] + 1) + 1) as isize;
        let expected = extent - pad_l[a] as isize - pad_r[a];
        ensure!(
            expected > 0 && expected as usize == dst.dims()[a + 2],
            config(format!(
                "output {:?} inconsistent with input {:?}, kernel {kernel:?}",
                dst.dims(),
                src.dims()
            ))
        );
    }
    Ok(ConvGeometry {
        n: src.dims()[0],
        groups,
        ci: oc,
        co: ic,
        i: spatial3(&dst.dims()[2..], 1),
        o: spatial3(&src.dims()[2..], 1),
        k: spatial3(kernel, 1),
        s: spatial3(strides, 1),
        d: spatial3(&dilates.iter().map(|d| d + 1).collect::<Vec<_>>(), 1),
        p: spatial3(pad_l, 0),
    })
}

/// Weights `[G?, OC, IC, k..]` stored as `[G?, OC, k.., IC]` with IC padded to `block`.
fn padded_weights(weights: &MemoryDesc, block: usize, grouped: bool) -> Result<MemoryDesc> {
    let dims = weights.dims();
    let ndim = dims.len();
    let ic_axis = if grouped { 2 } else { 1 };
    // innermost first
    let mut order = vec![ic_axis];
    order.extend((ic_axis + 1..ndim).rev());
    order.extend((0..ic_axis).rev());
    let mut strides = vec![0; ndim];
    let mut stride = 1;
    for axis in order {
        strides[axis] = stride;
        let extent = if axis == ic_axis {
            (dims[axis] + block - 1) / block * block
        } else {
            dims[axis]
        };
        stride *= extent.max(1);
    }
    weights.with_layout(Layout::Strided(strides))
}

fn supports(kind: ImplKind, desc: &DeconvDesc) -> bool {
    let strided = |d: &MemoryDesc| matches!(d.layout(), Layout::Any | Layout::Strided(_));
    let data_ok = |d: &MemoryDesc| match (kind.block(), d.layout()) {
        (_, Layout::Any | Layout::Strided(_)) => true,
        (Some(block), Layout::Blocked { block: b }) => block == *b,
        (None, Layout::Blocked { .. }) => false,
    };
    data_ok(&desc.src) && data_ok(&desc.dst) && strided(&desc.weights)
}

fn resolve(kind: ImplKind, desc: &DeconvDesc) -> Result<DeconvDesc> {
    let mut output = desc.clone();
    let data = |d: &mut MemoryDesc| -> Result<()> {
        if d.is_any() {
            *d = match kind.block() {
                Some(block) => d.with_layout(Layout::Blocked { block })?,
                None => d.to_plain(),
            };
        }
        Ok(())
    };
    data(&mut output.src)?;
    data(&mut output.dst)?;
    if output.weights.is_any() {
        output.weights = match kind.block() {
            Some(block) => {
                let grouped = output.weights.ndim() == output.src.ndim() + 1;
                padded_weights(&output.weights, block, grouped)?
            }
            None => output.weights.to_plain(),
        };
    }
    if let Some(bias) = output.bias.as_mut() {
        if bias.is_any() {
            *bias = bias.to_plain();
        }
    }
    Ok(output)
}

/// Deconvolution primitive descriptor with an ordered list of implementation candidates.
#[derive(Clone, Debug, PartialEq)]
pub struct DeconvPd {
    kind: DeconvPropKind,
    candidates: Vec<ImplKind>,
    index: usize,
    requested: DeconvDesc,
    resolved: DeconvDesc,
    geometry: ConvGeometry,
}

impl DeconvPd {
    /// Creates a descriptor for `kind`.
    ///
    /// Backward descriptors take the forward descriptor as a `hint`, whose implementation is
    /// tried first.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] for inconsistent shapes, ranks or types.
    /// - [`Error::NoViableImplementation`] if no candidate supports the descriptors.
    pub fn new(
        engine: &Engine,
        kind: DeconvPropKind,
        desc: DeconvDesc,
        hint: Option<&DeconvPd>,
    ) -> Result<Self> {
        let geometry = check_deconv(&desc)?;
        let scalar_type = desc.src.scalar_type();
        let mut candidates: Vec<ImplKind> = engine
            .candidates(scalar_type)
            .into_iter()
            .filter(|c| supports(*c, &desc))
            .collect();
        if let Some(hint) = hint {
            let preferred = hint.impl_kind();
            candidates.sort_by_key(|c| *c != preferred);
        }
        let first = candidates.first().copied().ok_or_else(|| {
            Error::no_viable_implementation(format!(
                "no {kind:?} deconvolution implementation for {scalar_type:?} on {}",
                engine.isa()
            ))
        })?;
        let resolved = resolve(first, &desc)?;
        Ok(Self {
            kind,
            candidates,
            index: 0,
            requested: desc,
            resolved,
            geometry,
        })
    }
    /// Advances to the next implementation candidate.
    ///
    /// Returns false when exhausted, leaving self unchanged.
    pub fn next_impl(&mut self) -> bool {
        let Some(kind) = self.candidates.get(self.index + 1).copied() else {
            return false;
        };
        match resolve(kind, &self.requested) {
            Ok(resolved) => {
                self.index += 1;
                self.resolved = resolved;
                true
            }
            Err(_) => false,
        }
    }
    /// The current implementation.
    pub fn impl_kind(&self) -> ImplKind {
        self.candidates[self.index]
    }
    /// The propagation kind.
    pub fn kind(&self) -> DeconvPropKind {
        self.kind
    }
    /// The resolved descriptor.
    pub fn desc(&self) -> &DeconvDesc {
        &self.resolved
    }
    /// The data (or data gradient) desc.
    pub fn src_desc(&self) -> &MemoryDesc {
        &self.resolved.src
    }
    /// The weights (or weights gradient) desc.
    pub fn weights_desc(&self) -> &MemoryDesc {
        &self.resolved.weights
    }
    /// The bias (or bias gradient) desc.
    pub fn bias_desc(&self) -> Option<&MemoryDesc> {
        self.resolved.bias.as_ref()
    }
    /// The output (or output gradient) desc.
    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.resolved.dst
    }
    /// Staging memory required by the primitive, bound to [`Arg::Scratchpad`].
    pub fn scratchpad_desc(&self) -> MemoryDesc {
        let len = self.resolved.src.logical_len()
            + self.resolved.weights.logical_len()
            + self.resolved.dst.logical_len();
        MemoryDesc::plain([len], ScalarType::F32)
    }
    /// Weights in convolution order `[G, IC / G, OC / G, k..]`.
    fn conv_weights_desc(&self, weights: &MemoryDesc) -> Result<MemoryDesc> {
        let grouped = if weights.ndim() == self.resolved.src.ndim() {
            weights.split_groups(1)?
        } else {
            weights.clone()
        };
        grouped.swap_axes(1, 2)
    }
}

fn scratchpad<'a>(
    guard: &'a mut crate::memory::Buffer,
    memory: &Memory,
    lens: [usize; 3],
) -> Result<(&'a mut [f32], &'a mut [f32], &'a mut [f32])> {
    let offset = memory.offset();
    let slice = guard
        .as_slice_mut::<f32>()
        .ok_or_else(|| anyhow!("deconvolution scratchpad must be f32"))?;
    let slice = slice
        .get_mut(offset..offset + lens.iter().sum::<usize>())
        .ok_or_else(|| anyhow!("deconvolution scratchpad too small"))?;
    let (a, rest) = slice.split_at_mut(lens[0]);
    let (b, c) = rest.split_at_mut(lens[1]);
    Ok((a, b, c))
}

fn conv_forward(g: &ConvGeometry, x: &[f32], w: &[f32], y: &mut [f32]) {
    let (isz, osz, ksz) = (g.input_len(), g.output_len(), g.kernel_len());
    if osz == 0 {
        return;
    }
    y.par_chunks_mut(osz).enumerate().for_each(|(plane, y)| {
        let n = plane / (g.groups * g.co);
        let gc = plane % (g.groups * g.co);
        let (group, c) = (gc / g.co, gc % g.co);
        y.fill(0.);
        for cin in 0..g.ci {
            let x = &x[(n * g.groups * g.ci + group * g.ci + cin) * isz..][..isz];
            let w = &w[((group * g.co + c) * g.ci + cin) * ksz..][..ksz];
            for (oidx, o) in positions(g.o).enumerate() {
                let mut acc = 0f32;
                for (kidx, k) in positions(g.k).enumerate() {
                    if let Some(i) = g.input_index(o, k) {
                        acc += x[i] * w[kidx];
                    }
                }
                y[oidx] += acc;
            }
        }
    });
}

fn conv_backward_data(g: &ConvGeometry, dy: &[f32], w: &[f32], dx: &mut [f32]) {
    let (isz, osz, ksz) = (g.input_len(), g.output_len(), g.kernel_len());
    if isz == 0 {
        return;
    }
    dx.par_chunks_mut(isz).enumerate().for_each(|(plane, dx)| {
        let n = plane / (g.groups * g.ci);
        let gc = plane % (g.groups * g.ci);
        let (group, cin) = (gc / g.ci, gc % g.ci);
        dx.fill(0.);
        for c in 0..g.co {
            let dy = &dy[(n * g.groups * g.co + group * g.co + c) * osz..][..osz];
            let w = &w[((group * g.co + c) * g.ci + cin) * ksz..][..ksz];
            for (iidx, i) in positions(g.i).enumerate() {
                let mut acc = 0f32;
                for (kidx, k) in positions(g.k).enumerate() {
                    if let Some(o) = g.output_index(i, k) {
                        acc += dy[o] * w[kidx];
                    }
                }
                dx[iidx] += acc;
            }
        }
    });
}

fn conv_backward_weights(g: &ConvGeometry, x: &[f32], dy: &[f32], dw: &mut [f32]) {
    let (isz, osz, ksz) = (g.input_len(), g.output_len(), g.kernel_len());
    if ksz == 0 || g.ci == 0 {
        return;
    }
    dw.par_chunks_mut(g.ci * ksz)
        .enumerate()
        .for_each(|(gc, dw)| {
            let (group, c) = (gc / g.co, gc % g.co);
            dw.fill(0.);
            for n in 0..g.n {
                let dy = &dy[(n * g.groups * g.co + group * g.co + c) * osz..][..osz];
                for (cin, dw) in dw.chunks_mut(ksz).enumerate() {
                    let x = &x[(n * g.groups * g.ci + group * g.ci + cin) * isz..][..isz];
                    for (kidx, k) in positions(g.k).enumerate() {
                        let mut acc = 0f32;
                        for (oidx, o) in positions(g.o).enumerate() {
                            if let Some(i) = g.input_index(o, k) {
                                acc += x[i] * dy[oidx];
                            }
                        }
                        dw[kidx] += acc;
                    }
                }
            }
        });
}

/// Deconvolution forward primitive.
#[derive(Debug)]
pub struct DeconvForward {
    pd: DeconvPd,
}

impl DeconvForward {
    /// Creates the primitive.
    ///
    /// **Errors**
    /// - `pd` is not a forward descriptor.
    pub fn new(pd: DeconvPd) -> Result<Self> {
        ensure!(pd.kind == DeconvPropKind::Forward);
        Ok(Self { pd })
    }
    /// The descriptor.
    pub fn pd(&self) -> &DeconvPd {
        &self.pd
    }
}

impl Primitive for DeconvForward {
    fn name(&self) -> &'static str {
        "deconvolution_forward"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let pd = &self.pd;
        let g = &pd.geometry;
        let src = check_arg(args, Arg::Src, pd.src_desc())?;
        let weights = check_arg(args, Arg::Weights, pd.weights_desc())?;
        let weights = weights.with_desc(pd.conv_weights_desc(weights.desc())?)?;
        let dst = check_arg(args, Arg::Dst, pd.dst_desc())?;
        let scratch = check_arg(args, Arg::Scratchpad, &pd.scratchpad_desc())?;
        let mut guard = scratch.write();
        let lens = [
            pd.src_desc().logical_len(),
            pd.weights_desc().logical_len(),
            pd.dst_desc().logical_len(),
        ];
        let (x, w, y) = scratchpad(&mut guard, &scratch, lens)?;
        src.read_f32_into(x)?;
        weights.read_f32_into(w)?;
        conv_backward_data(g, x, w, y);
        if let Some(bias_desc) = pd.bias_desc() {
            let bias = check_arg(args, Arg::Bias, bias_desc)?.to_f32_vec()?;
            let osz = g.input_len();
            if osz > 0 {
                y.par_chunks_mut(osz).enumerate().for_each(|(plane, y)| {
                    let b = bias[plane % bias.len()];
                    y.iter_mut().for_each(|y| *y += b);
                });
            }
        }
        dst.write_f32(y)
    }
}

/// Deconvolution backward data primitive.
#[derive(Debug)]
pub struct DeconvBackwardData {
    pd: DeconvPd,
}

impl DeconvBackwardData {
    /// Creates the primitive.
    ///
    /// **Errors**
    /// - `pd` is not a backward data descriptor.
    pub fn new(pd: DeconvPd) -> Result<Self> {
        ensure!(pd.kind == DeconvPropKind::BackwardData);
        Ok(Self { pd })
    }
    /// The descriptor.
    pub fn pd(&self) -> &DeconvPd {
        &self.pd
    }
}

impl Primitive for DeconvBackwardData {
    fn name(&self) -> &'static str {
        "deconvolution_backward_data"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let pd = &self.pd;
        let diff_dst = check_arg(args, Arg::DiffDst, pd.dst_desc())?;
        let weights = check_arg(args, Arg::Weights, pd.weights_desc())?;
        let weights = weights.with_desc(pd.conv_weights_desc(weights.desc())?)?;
        let diff_src = check_arg(args, Arg::DiffSrc, pd.src_desc())?;
        let scratch = check_arg(args, Arg::Scratchpad, &pd.scratchpad_desc())?;
        let mut guard = scratch.write();
        let lens = [
            pd.dst_desc().logical_len(),
            pd.weights_desc().logical_len(),
            pd.src_desc().logical_len(),
        ];
        let (dy, w, dx) = scratchpad(&mut guard, &scratch, lens)?;
        diff_dst.read_f32_into(dy)?;
        weights.read_f32_into(w)?;
        conv_forward(&pd.geometry, dy, w, dx);
        diff_src.write_f32(dx)
    }
}

/// Deconvolution backward weights primitive, also computes the bias gradient when bound.
#[derive(Debug)]
pub struct DeconvBackwardWeights {
    pd: DeconvPd,
}

impl DeconvBackwardWeights {
    /// Creates the primitive.
    ///
    /// **Errors**
    /// - `pd` is not a backward weights descriptor.
    pub fn new(pd: DeconvPd) -> Result<Self> {
        ensure!(pd.kind == DeconvPropKind::BackwardWeights);
        Ok(Self { pd })
    }
    /// The descriptor.
    pub fn pd(&self) -> &DeconvPd {
        &self.pd
    }
}

impl Primitive for DeconvBackwardWeights {
    fn name(&self) -> &'static str {
        "deconvolution_backward_weights"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let pd = &self.pd;
        let g = &pd.geometry;
        let src = check_arg(args, Arg::Src, pd.src_desc())?;
        let diff_dst = check_arg(args, Arg::DiffDst, pd.dst_desc())?;
        let diff_weights = check_arg(args, Arg::DiffWeights, pd.weights_desc())?;
        let diff_weights = diff_weights.with_desc(pd.conv_weights_desc(diff_weights.desc())?)?;
        let scratch = check_arg(args, Arg::Scratchpad, &pd.scratchpad_desc())?;
        let mut guard = scratch.write();
        let lens = [
            pd.dst_desc().logical_len(),
            pd.src_desc().logical_len(),
            pd.weights_desc().logical_len(),
        ];
        let (diff_dst_f, src_f, dw) = scratchpad(&mut guard, &scratch, lens)?;
        diff_dst.read_f32_into(diff_dst_f)?;
        src.read_f32_into(src_f)?;
        // convolution input is the output gradient
        conv_backward_weights(g, diff_dst_f, src_f, dw);
        diff_weights.write_f32(dw)?;
        if let (Some(bias_desc), Some(diff_bias)) = (pd.bias_desc(), args.get(&Arg::DiffBias)) {
            ensure!(
                diff_bias.desc() == bias_desc,
                "argument DiffBias {:?} does not match {bias_desc:?}",
                diff_bias.desc()
            );
            let channels = g.groups * g.ci;
            let isz = g.input_len();
            let mut db = vec![0f32; channels];
            if isz > 0 {
                for (plane, dy) in diff_dst_f.chunks(isz).enumerate() {
                    db[plane % channels] += dy.iter().sum::<f32>();
                }
            }
            diff_bias.write_f32(&db)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Isa;

    fn desc(
        scalar_type: ScalarType,
        src: &[usize],
        weights: &[usize],
        dst: &[usize],
        stride: usize,
        pad: usize,
    ) -> DeconvDesc {
        let nd = src.len() - 2;
        DeconvDesc {
            src: MemoryDesc::any(src, scalar_type),
            weights: MemoryDesc::any(weights, scalar_type),
            bias: None,
            dst: MemoryDesc::any(dst, scalar_type),
            strides: vec![stride; nd],
            dilates: vec![0; nd],
            pad_l: vec![pad; nd],
            pad_r: vec![pad as isize; nd],
        }
    }

    fn memory(desc: &MemoryDesc, values: Vec<f32>) -> Memory {
        let memory = Memory::zeros(desc.clone()).unwrap();
        memory.write_f32(&values).unwrap();
        memory
    }

    /// Scatter form of deconvolution, `[OC, IC, k]` weights, 1d, no groups.
    fn direct_1d(x: &[f32], ic: usize, w: &[f32], oc: usize, k: usize, s: usize, p: usize, ow: usize) -> Vec<f32> {
        let iw = x.len() / ic;
        let mut y = vec![0f32; oc * ow];
        for c_in in 0..ic {
            for i in 0..iw {
                for c_out in 0..oc {
                    for kk in 0..k {
                        let o = (i * s + kk) as isize - p as isize;
                        if o >= 0 && (o as usize) < ow {
                            y[c_out * ow + o as usize] += x[c_in * iw + i] * w[(c_out * ic + c_in) * k + kk];
                        }
                    }
                }
            }
        }
        y
    }

    #[test]
    fn forward_matches_direct() {
        let engine = Engine::new(Isa::Reference);
        let (ic, oc, k, s, p, iw) = (2, 3, 3, 2, 1, 4);
        let ow = (iw - 1) * s + k - 2 * p;
        let d = desc(ScalarType::F32, &[1, ic, iw], &[oc, ic, k], &[1, oc, ow], s, p);
        let pd = DeconvPd::new(&engine, DeconvPropKind::Forward, d, None).unwrap();
        assert_eq!(pd.impl_kind(), ImplKind::Reference);
        let x: Vec<f32> = (0..ic * iw).map(|x| x as f32 * 0.5 - 1.).collect();
        let w: Vec<f32> = (0..oc * ic * k).map(|x| (x % 5) as f32 - 2.).collect();
        let src = memory(pd.src_desc(), x.clone());
        let weights = memory(pd.weights_desc(), w.clone());
        let dst = Memory::zeros(pd.dst_desc().clone()).unwrap();
        let scratch = Memory::zeros(pd.scratchpad_desc()).unwrap();
        let args = ArgMap::from([
            (Arg::Src, src),
            (Arg::Weights, weights),
            (Arg::Dst, dst.clone()),
            (Arg::Scratchpad, scratch),
        ]);
        DeconvForward::new(pd).unwrap().execute(&args).unwrap();
        let expected = direct_1d(&x, ic, &w, oc, k, s, p, ow);
        assert_eq!(dst.to_vec::<f32>().unwrap(), expected);
    }

    #[test]
    fn backward_data_is_adjoint() {
        // <deconv(x), dy> == <x, deconv_backward_data(dy)>
        let engine = Engine::new(Isa::Reference);
        let (ic, oc, k, s, p, iw) = (2, 2, 3, 2, 1, 3);
        let ow = (iw - 1) * s + k - 2 * p;
        let d = desc(ScalarType::F32, &[1, ic, iw], &[oc, ic, k], &[1, oc, ow], s, p);
        let w: Vec<f32> = (0..oc * ic * k).map(|x| x as f32 - 5.).collect();
        let x: Vec<f32> = (0..ic * iw).map(|x| x as f32 + 1.).collect();
        let dy: Vec<f32> = (0..oc * ow).map(|x| (x % 3) as f32).collect();
        let y = direct_1d(&x, ic, &w, oc, k, s, p, ow);
        let pd = DeconvPd::new(&engine, DeconvPropKind::BackwardData, d, None).unwrap();
        let dx = Memory::zeros(pd.src_desc().clone()).unwrap();
        let args = ArgMap::from([
            (Arg::DiffDst, memory(pd.dst_desc(), dy.clone())),
            (Arg::Weights, memory(pd.weights_desc(), w)),
            (Arg::DiffSrc, dx.clone()),
            (Arg::Scratchpad, Memory::zeros(pd.scratchpad_desc()).unwrap()),
        ]);
        DeconvBackwardData::new(pd).unwrap().execute(&args).unwrap();
        let dx = dx.to_vec::<f32>().unwrap();
        let lhs: f32 = y.iter().zip(&dy).map(|(a, b)| a * b).sum();
        let rhs: f32 = x.iter().zip(&dx).map(|(a, b)| a * b).sum();
        approx::assert_relative_eq!(lhs, rhs, epsilon = 1e-3);
    }

    #[test]
    fn backward_weights_and_bias() {
        let engine = Engine::new(Isa::Reference);
        let (ic, oc, k, iw) = (1, 2, 2, 2);
        let ow = iw + k - 1;
        let mut d = desc(ScalarType::F32, &[1, ic, iw], &[oc, ic, k], &[1, oc, ow], 1, 0);
        d.bias = Some(MemoryDesc::plain([oc], ScalarType::F32));
        let pd = DeconvPd::new(&engine, DeconvPropKind::BackwardWeights, d, None).unwrap();
        let x = vec![1f32, 2.];
        let dy = vec![1f32, 0., 1., 0., 1., 1.];
        let dw = Memory::zeros(pd.weights_desc().clone()).unwrap();
        let db = Memory::zeros(pd.bias_desc().unwrap().clone()).unwrap();
        let args = ArgMap::from([
            (Arg::Src, memory(pd.src_desc(), x)),
            (Arg::DiffDst, memory(pd.dst_desc(), dy)),
            (Arg::DiffWeights, dw.clone()),
            (Arg::DiffBias, db.clone()),
            (Arg::Scratchpad, Memory::zeros(pd.scratchpad_desc()).unwrap()),
        ]);
        DeconvBackwardWeights::new(pd).unwrap().execute(&args).unwrap();
        // dw[c][0][kk] = sum_i x[i] * dy[c][i + kk]
        assert_eq!(dw.to_vec::<f32>().unwrap(), vec![1., 2., 2., 3.]);
        assert_eq!(db.to_vec::<f32>().unwrap(), vec![2., 2.]);
    }

    #[test]
    fn blocked_candidates_resolve_layouts() {
        let engine = Engine::new(Isa::Simd16);
        let d = desc(ScalarType::BF16, &[1, 3, 4, 4], &[5, 3, 3, 3], &[1, 5, 6, 6], 1, 0);
        let mut pd = DeconvPd::new(&engine, DeconvPropKind::Forward, d, None).unwrap();
        assert_eq!(pd.impl_kind(), ImplKind::Blocked16);
        assert_eq!(*pd.src_desc().layout(), Layout::Blocked { block: 16 });
        assert_ne!(pd.src_desc().size_bytes(), pd.src_desc().logical_size_bytes());
        assert_ne!(pd.weights_desc().size_bytes(), pd.weights_desc().logical_size_bytes());
        assert!(pd.next_impl());
        assert_eq!(pd.impl_kind(), ImplKind::Blocked8);
        assert!(!pd.next_impl());
        assert_eq!(pd.impl_kind(), ImplKind::Blocked8);
    }

    #[test]
    fn no_candidate_is_no_viable_implementation() {
        let engine = Engine::new(Isa::Reference);
        let d = desc(ScalarType::BF16, &[1, 3, 4], &[5, 3, 3], &[1, 5, 6], 1, 0);
        let error = DeconvPd::new(&engine, DeconvPropKind::Forward, d, None).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NoViableImplementation(_))
        ));
    }

    #[test]
    fn padded_weights_layout() {
        let weights = MemoryDesc::any([2, 3, 1, 1], ScalarType::F32);
        let padded = padded_weights(&weights, 8, false).unwrap();
        assert_eq!(*padded.layout(), Layout::Strided(vec![8, 1, 8, 8]));
        assert_eq!(padded.len(), 1 + 8 + 2);
        let weights = MemoryDesc::any([2, 8, 1, 1], ScalarType::F32);
        assert_eq!(padded_weights(&weights, 8, false).unwrap().len(), 16);
        let grouped = MemoryDesc::any([2, 4, 3, 2, 2], ScalarType::F32);
        let padded = padded_weights(&grouped, 8, true).unwrap();
        assert_eq!(padded.offset(&[0, 0, 1, 0, 0]), 1);
        assert_eq!(padded.offset(&[0, 1, 0, 0, 0]), 32);
        assert_eq!(padded.offset(&[1, 0, 0, 0, 0]), 128);
    }
}
