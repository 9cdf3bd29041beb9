//! Pooling forward and backward primitives.

use super::{check_arg, spatial3, Arg, ArgMap, Engine, Isa, Primitive};
use crate::{
    error::Error,
    memory::{Layout, Memory, MemoryDesc},
    planner::KernelDims,
    scalar::ScalarType,
};
use anyhow::{ensure, Result};
use rayon::prelude::*;
use wide::f32x8;

/// Propagation kind of a forward primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PropKind {
    /// Forward with state for the backward pass.
    ForwardTraining,
    /// Forward only.
    ForwardScoring,
}

/// Pooling algorithm.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PoolingAlgorithm {
    /// Maximum of the window.
    Max,
    /// Average dividing by the full kernel size.
    AvgIncludePadding,
    /// Average dividing by the number of elements inside the input.
    AvgExcludePadding,
}

/// Operation descriptor for pooling.
///
/// For backward, `src` and `dst` describe the gradients.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolingDesc {
    /// Propagation kind.
    pub prop: PropKind,
    /// Algorithm.
    pub alg: PoolingAlgorithm,
    /// Source.
    pub src: MemoryDesc,
    /// Destination, may be [`Layout::Any`].
    pub dst: MemoryDesc,
    /// Kernel, strides and padding.
    pub kernel: KernelDims,
}

fn check_geometry(desc: &PoolingDesc) -> Result<()> {
    let PoolingDesc {
        src, dst, kernel, ..
    } = desc;
    let nd = kernel.ndim();
    ensure!(
        (1..=3).contains(&nd) && src.ndim() == nd + 2 && dst.ndim() == nd + 2,
        Error::Configuration(format!(
            "pooling requires rank 3 to 5 matching kernel {:?}, found {:?} {:?}",
            kernel.kernel,
            src.dims(),
            dst.dims()
        ))
    );
    ensure!(
        src.scalar_type().is_float() && dst.scalar_type() == src.scalar_type(),
        Error::Configuration(format!(
            "pooling requires f32 or bf16, found {:?} {:?}",
            src.scalar_type(),
            dst.scalar_type()
        ))
    );
    ensure!(
        src.dims()[..2] == dst.dims()[..2],
        Error::Configuration(format!(
            "pooling batch and channels differ, {:?} {:?}",
            src.dims(),
            dst.dims()
        ))
    );
    for i in 0..nd {
        let x = src.dims()[i + 2];
        let padded = x + kernel.pad_l[i] + kernel.pad_r[i];
        let expected = padded
            .checked_sub(kernel.kernel[i])
            .filter(|_| kernel.strides[i] > 0)
            .map(|e| e / kernel.strides[i] + 1);
        ensure!(
            expected == Some(dst.dims()[i + 2]),
            Error::Configuration(format!(
                "pooling output {:?} inconsistent with input {:?} and {kernel:?}",
                dst.dims(),
                src.dims()
            ))
        );
    }
    Ok(())
}

/// Pooling forward primitive descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolingForwardPd {
    desc: PoolingDesc,
    workspace: Option<MemoryDesc>,
    vectorize: bool,
}

impl PoolingForwardPd {
    /// Resolves `desc` for `engine`.
    ///
    /// An [`Any`](Layout::Any) destination takes the layout of the source.
    ///
    /// **Errors**
    /// - Unsupported rank or type.
    /// - Output dims inconsistent with the kernel.
    pub fn new(engine: &Engine, mut desc: PoolingDesc) -> Result<Self> {
        ensure!(
            !desc.src.is_any(),
            "pooling source layout must be concrete, found {:?}",
            desc.src
        );
        check_geometry(&desc)?;
        if desc.dst.is_any() {
            desc.dst = desc.src.like(desc.dst.dims());
        }
        let workspace = (desc.alg == PoolingAlgorithm::Max && desc.prop == PropKind::ForwardTraining)
            .then(|| MemoryDesc::plain(desc.dst.dims(), ScalarType::I32));
        Ok(Self {
            desc,
            workspace,
            vectorize: engine.isa() >= Isa::Simd8,
        })
    }
    /// The resolved descriptor.
    pub fn desc(&self) -> &PoolingDesc {
        &self.desc
    }
    /// The source desc.
    pub fn src_desc(&self) -> &MemoryDesc {
        &self.desc.src
    }
    /// The destination desc.
    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.desc.dst
    }
    /// The workspace desc, when training max pooling.
    pub fn workspace_desc(&self) -> Option<&MemoryDesc> {
        self.workspace.as_ref()
    }
}

/// Pooling backward primitive descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolingBackwardPd {
    desc: PoolingDesc,
    workspace: Option<MemoryDesc>,
}

impl PoolingBackwardPd {
    /// Resolves `desc` against the forward `hint`.
    ///
    /// `desc.src` is the source gradient and `desc.dst` the destination gradient.
    ///
    /// **Errors**
    /// - Unsupported rank or type.
    /// - Max pooling without a training hint.
    pub fn new(_engine: &Engine, mut desc: PoolingDesc, hint: &PoolingForwardPd) -> Result<Self> {
        check_geometry(&desc)?;
        if desc.src.is_any() {
            desc.src = hint.src_desc().like(desc.src.dims());
        }
        if desc.dst.is_any() {
            desc.dst = hint.dst_desc().like(desc.dst.dims());
        }
        let workspace = if desc.alg == PoolingAlgorithm::Max {
            let workspace = hint.workspace_desc().cloned();
            ensure!(
                workspace.is_some(),
                Error::Configuration("max pooling backward requires a training forward hint".into())
            );
            workspace
        } else {
            None
        };
        Ok(Self { desc, workspace })
    }
    /// The resolved descriptor.
    pub fn desc(&self) -> &PoolingDesc {
        &self.desc
    }
    /// The source gradient desc.
    pub fn diff_src_desc(&self) -> &MemoryDesc {
        &self.desc.src
    }
    /// The destination gradient desc.
    pub fn diff_dst_desc(&self) -> &MemoryDesc {
        &self.desc.dst
    }
    /// The workspace desc, for max pooling.
    pub fn workspace_desc(&self) -> Option<&MemoryDesc> {
        self.workspace.as_ref()
    }
}

#[derive(Clone, Copy, Debug)]
struct Geometry {
    i: [usize; 3],
    o: [usize; 3],
    k: [usize; 3],
    s: [usize; 3],
    p: [usize; 3],
}

impl Geometry {
    fn new(src: &[usize], dst: &[usize], kernel: &KernelDims) -> Self {
        Self {
            i: spatial3(&src[2..], 1),
            o: spatial3(&dst[2..], 1),
            k: spatial3(&kernel.kernel, 1),
            s: spatial3(&kernel.strides, 1),
            p: spatial3(&kernel.pad_l, 0),
        }
    }
    fn input_len(&self) -> usize {
        self.i.iter().product()
    }
    fn output_len(&self) -> usize {
        self.o.iter().product()
    }
    fn kernel_len(&self) -> usize {
        self.k.iter().product()
    }
    /// Calls `f(kernel_index, input_index)` for each kernel position inside the input.
    fn for_each_in_window(&self, o: [usize; 3], mut f: impl FnMut(usize, usize)) {
        let [ih, iw] = [self.i[1], self.i[2]];
        for kd in 0..self.k[0] {
            let Some(d) = (o[0] * self.s[0] + kd).checked_sub(self.p[0]).filter(|d| *d < self.i[0]) else {
                continue;
            };
            for kh in 0..self.k[1] {
                let Some(h) = (o[1] * self.s[1] + kh).checked_sub(self.p[1]).filter(|h| *h < ih) else {
                    continue;
                };
                for kw in 0..self.k[2] {
                    let Some(w) = (o[2] * self.s[2] + kw).checked_sub(self.p[2]).filter(|w| *w < iw) else {
                        continue;
                    };
                    f((kd * self.k[1] + kh) * self.k[2] + kw, (d * ih + h) * iw + w);
                }
            }
        }
    }
    fn kernel_offset(&self, o: [usize; 3], kernel_index: usize) -> Option<usize> {
        let kw = kernel_index % self.k[2];
        let kh = (kernel_index / self.k[2]) % self.k[1];
        let kd = kernel_index / (self.k[1] * self.k[2]);
        let d = (o[0] * self.s[0] + kd).checked_sub(self.p[0])?;
        let h = (o[1] * self.s[1] + kh).checked_sub(self.p[1])?;
        let w = (o[2] * self.s[2] + kw).checked_sub(self.p[2])?;
        (d < self.i[0] && h < self.i[1] && w < self.i[2])
            .then(|| (d * self.i[1] + h) * self.i[2] + w)
    }
    fn output_positions(&self) -> impl Iterator<Item = [usize; 3]> {
        let o = self.o;
        (0..o[0]).flat_map(move |d| (0..o[1]).flat_map(move |h| (0..o[2]).map(move |w| [d, h, w])))
    }
}

fn forward_plane(
    g: &Geometry,
    alg: PoolingAlgorithm,
    x: &[f32],
    y: &mut [f32],
    mut ws: Option<&mut [i32]>,
) {
    for (oidx, o) in g.output_positions().enumerate() {
        match alg {
            PoolingAlgorithm::Max => {
                let mut best = f32::NEG_INFINITY;
                let mut arg = 0;
                g.for_each_in_window(o, |k, i| {
                    if x[i] > best {
                        best = x[i];
                        arg = k;
                    }
                });
                y[oidx] = if best == f32::NEG_INFINITY { 0. } else { best };
                if let Some(ws) = ws.as_mut() {
                    ws[oidx] = arg as i32;
                }
            }
            PoolingAlgorithm::AvgIncludePadding | PoolingAlgorithm::AvgExcludePadding => {
                let mut sum = 0f32;
                let mut count = 0;
                g.for_each_in_window(o, |_, i| {
                    sum += x[i];
                    count += 1;
                });
                if alg == PoolingAlgorithm::AvgIncludePadding {
                    count = g.kernel_len();
                }
                y[oidx] = if count > 0 { sum / count as f32 } else { 0. };
            }
        }
    }
}

fn backward_plane(
    g: &Geometry,
    alg: PoolingAlgorithm,
    dy: &[f32],
    dx: &mut [f32],
    ws: Option<&[i32]>,
) {
    dx.fill(0.);
    for (oidx, o) in g.output_positions().enumerate() {
        match (alg, ws) {
            (PoolingAlgorithm::Max, Some(ws)) => {
                if let Some(i) = g.kernel_offset(o, ws[oidx] as usize) {
                    dx[i] += dy[oidx];
                }
            }
            (PoolingAlgorithm::Max, None) => (),
            _ => {
                let mut count = 0;
                if alg == PoolingAlgorithm::AvgIncludePadding {
                    count = g.kernel_len();
                } else {
                    g.for_each_in_window(o, |_, _| count += 1);
                }
                if count > 0 {
                    let delta = dy[oidx] / count as f32;
                    g.for_each_in_window(o, |_, i| dx[i] += delta);
                }
            }
        }
    }
}

/// Max / avg over `[f32x8]` lanes of the blocked 8 layout.
fn forward_plane_f32x8(g: &Geometry, alg: PoolingAlgorithm, x: &[f32], y: &mut [f32]) {
    let load = |i: usize| {
        let mut lanes = [0f32; 8];
        lanes.copy_from_slice(&x[i * 8..(i + 1) * 8]);
        f32x8::from(lanes)
    };
    for (oidx, o) in g.output_positions().enumerate() {
        let mut count = 0;
        let acc = match alg {
            PoolingAlgorithm::Max => {
                let mut acc = f32x8::splat(f32::NEG_INFINITY);
                g.for_each_in_window(o, |_, i| {
                    acc = acc.max(load(i));
                    count += 1;
                });
                if count == 0 {
                    f32x8::splat(0.)
                } else {
                    acc
                }
            }
            PoolingAlgorithm::AvgIncludePadding | PoolingAlgorithm::AvgExcludePadding => {
                let mut acc = f32x8::splat(0.);
                g.for_each_in_window(o, |_, i| {
                    acc += load(i);
                    count += 1;
                });
                if alg == PoolingAlgorithm::AvgIncludePadding {
                    count = g.kernel_len();
                }
                if count == 0 {
                    f32x8::splat(0.)
                } else {
                    acc / f32x8::splat(count as f32)
                }
            }
        };
        y[oidx * 8..(oidx + 1) * 8].copy_from_slice(acc.as_array_ref());
    }
}

/// Pooling forward primitive.
#[derive(Debug)]
pub struct PoolingForward {
    pd: PoolingForwardPd,
}

impl PoolingForward {
    /// Creates the primitive.
    pub fn new(pd: PoolingForwardPd) -> Self {
        Self { pd }
    }
    /// The descriptor.
    pub fn pd(&self) -> &PoolingForwardPd {
        &self.pd
    }
    fn execute_f32x8(&self, src: &Memory, dst: &Memory) -> Result<bool> {
        let desc = &self.pd.desc;
        let blocked = Layout::Blocked { block: 8 };
        if !self.pd.vectorize
            || self.pd.workspace.is_some()
            || src.aliases(dst)
            || src.offset() != 0
            || dst.offset() != 0
            || desc.src.scalar_type() != ScalarType::F32
            || *desc.src.layout() != blocked
            || *desc.dst.layout() != blocked
        {
            return Ok(false);
        }
        let g = Geometry::new(desc.src.dims(), desc.dst.dims(), &desc.kernel);
        let (isz, osz) = (g.input_len() * 8, g.output_len() * 8);
        if isz == 0 || osz == 0 {
            return Ok(true);
        }
        let x = src.read();
        let mut y = dst.write();
        let (Some(x), Some(y)) = (x.as_slice::<f32>(), y.as_slice_mut::<f32>()) else {
            return Ok(false);
        };
        let len = desc.dst.len();
        y[..len]
            .par_chunks_mut(osz)
            .zip(x.par_chunks(isz))
            .for_each(|(y, x)| forward_plane_f32x8(&g, desc.alg, x, y));
        Ok(true)
    }
}

impl Primitive for PoolingForward {
    fn name(&self) -> &'static str {
        "pooling_forward"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let desc = &self.pd.desc;
        let src = check_arg(args, Arg::Src, &desc.src)?;
        let dst = check_arg(args, Arg::Dst, &desc.dst)?;
        if self.execute_f32x8(&src, &dst)? {
            return Ok(());
        }
        let g = Geometry::new(desc.src.dims(), desc.dst.dims(), &desc.kernel);
        let x = src.to_f32_vec()?;
        let mut y = vec![0f32; desc.dst.logical_len()];
        let (isz, osz) = (g.input_len(), g.output_len());
        if let Some(ws_desc) = self.pd.workspace.as_ref() {
            let ws = check_arg(args, Arg::Workspace, ws_desc)?;
            let mut ws_buffer = ws.write();
            let ws_offset = ws.offset();
            let ws_slice = ws_buffer
                .as_slice_mut::<i32>()
                .ok_or_else(|| anyhow::anyhow!("pooling workspace must be i32"))?;
            let ws_slice = &mut ws_slice[ws_offset..ws_offset + ws_desc.len()];
            if isz > 0 && osz > 0 {
                y.par_chunks_mut(osz)
                    .zip(ws_slice.par_chunks_mut(osz))
                    .zip(x.par_chunks(isz))
                    .for_each(|((y, ws), x)| forward_plane(&g, desc.alg, x, y, Some(ws)));
            }
        } else if isz > 0 && osz > 0 {
            y.par_chunks_mut(osz)
                .zip(x.par_chunks(isz))
                .for_each(|(y, x)| forward_plane(&g, desc.alg, x, y, None));
        }
        dst.write_f32(&y)
    }
}

/// Pooling backward primitive.
#[derive(Debug)]
pub struct PoolingBackward {
    pd: PoolingBackwardPd,
}

impl PoolingBackward {
    /// Creates the primitive.
    pub fn new(pd: PoolingBackwardPd) -> Self {
        Self { pd }
    }
    /// The descriptor.
    pub fn pd(&self) -> &PoolingBackwardPd {
        &self.pd
    }
}

impl Primitive for PoolingBackward {
    fn name(&self) -> &'static str {
        "pooling_backward"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let desc = &self.pd.desc;
        let diff_dst = check_arg(args, Arg::DiffDst, &desc.dst)?;
        let diff_src = check_arg(args, Arg::DiffSrc, &desc.src)?;
        let g = Geometry::new(desc.src.dims(), desc.dst.dims(), &desc.kernel);
        let dy = diff_dst.to_f32_vec()?;
        let ws = if let Some(ws_desc) = self.pd.workspace.as_ref() {
            let ws = check_arg(args, Arg::Workspace, ws_desc)?;
            Some(ws.to_vec::<i32>()?)
        } else {
            None
        };
        let mut dx = vec![0f32; desc.src.logical_len()];
        let (isz, osz) = (g.input_len(), g.output_len());
        if isz > 0 && osz > 0 {
            if let Some(ws) = ws.as_ref() {
                dx.par_chunks_mut(isz)
                    .zip(dy.par_chunks(osz))
                    .zip(ws.par_chunks(osz))
                    .for_each(|((dx, dy), ws)| backward_plane(&g, desc.alg, dy, dx, Some(ws)));
            } else {
                dx.par_chunks_mut(isz)
                    .zip(dy.par_chunks(osz))
                    .for_each(|(dx, dy)| backward_plane(&g, desc.alg, dy, dx, None));
            }
        }
        diff_src.write_f32(&dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Buffer;

    fn kernel2(k: usize, s: usize, p: usize) -> KernelDims {
        KernelDims {
            kernel: vec![k, k],
            strides: vec![s, s],
            pad_l: vec![p, p],
            pad_r: vec![p, p],
        }
    }

    fn iota(dims: [usize; 4]) -> Memory {
        let desc = MemoryDesc::plain(dims, ScalarType::F32);
        let values = (1..=desc.len()).map(|x| x as f32).collect::<Vec<_>>();
        Memory::from_buffer(desc, Buffer::from_vec(values)).unwrap()
    }

    fn forward(engine: &Engine, alg: PoolingAlgorithm, prop: PropKind, src: &Memory, kernel: KernelDims, out: [usize; 4]) -> (Vec<f32>, Option<Vec<i32>>) {
        let desc = PoolingDesc {
            prop,
            alg,
            src: src.desc().clone(),
            dst: MemoryDesc::any(out, ScalarType::F32),
            kernel,
        };
        let pd = PoolingForwardPd::new(engine, desc).unwrap();
        let dst = Memory::zeros(pd.dst_desc().clone()).unwrap();
        let mut args = ArgMap::from([(Arg::Src, src.clone()), (Arg::Dst, dst.clone())]);
        let ws = pd.workspace_desc().map(|d| Memory::zeros(d.clone()).unwrap());
        if let Some(ws) = ws.as_ref() {
            args.insert(Arg::Workspace, ws.clone());
        }
        PoolingForward::new(pd).execute(&args).unwrap();
        (
            dst.to_vec::<f32>().unwrap(),
            ws.map(|ws| ws.to_vec::<i32>().unwrap()),
        )
    }

    #[test]
    fn avg_2x2() {
        let src = iota([1, 1, 4, 4]);
        let (y, ws) = forward(
            &Engine::default(),
            PoolingAlgorithm::AvgExcludePadding,
            PropKind::ForwardScoring,
            &src,
            kernel2(2, 2, 0),
            [1, 1, 2, 2],
        );
        assert_eq!(y, vec![3.5, 5.5, 11.5, 13.5]);
        assert!(ws.is_none());
    }

    #[test]
    fn max_training_workspace() {
        let src = iota([1, 1, 4, 4]);
        let (y, ws) = forward(
            &Engine::default(),
            PoolingAlgorithm::Max,
            PropKind::ForwardTraining,
            &src,
            kernel2(2, 2, 0),
            [1, 1, 2, 2],
        );
        assert_eq!(y, vec![6., 8., 14., 16.]);
        assert_eq!(ws.unwrap(), vec![3, 3, 3, 3]);
    }

    #[test]
    fn avg_padding_modes() {
        let src = iota([1, 1, 2, 2]);
        let (include, _) = forward(
            &Engine::default(),
            PoolingAlgorithm::AvgIncludePadding,
            PropKind::ForwardScoring,
            &src,
            kernel2(2, 1, 1),
            [1, 1, 3, 3],
        );
        let (exclude, _) = forward(
            &Engine::default(),
            PoolingAlgorithm::AvgExcludePadding,
            PropKind::ForwardScoring,
            &src,
            kernel2(2, 1, 1),
            [1, 1, 3, 3],
        );
        assert_eq!(include[0], 0.25);
        assert_eq!(exclude[0], 1.);
        assert_eq!(include[4], 2.5);
        assert_eq!(exclude[4], 2.5);
    }

    #[test]
    fn blocked_f32x8_matches_plain() {
        let plain = iota([2, 3, 4, 4]);
        let blocked = Memory::zeros(plain.desc().with_layout(Layout::Blocked { block: 8 }).unwrap()).unwrap();
        crate::engine::reorder::reorder(&plain, &blocked, Default::default()).unwrap();
        for alg in [PoolingAlgorithm::Max, PoolingAlgorithm::AvgExcludePadding] {
            let (expected, _) = forward(&Engine::new(Isa::Reference), alg, PropKind::ForwardScoring, &plain, kernel2(2, 2, 0), [2, 3, 2, 2]);
            let desc = PoolingDesc {
                prop: PropKind::ForwardScoring,
                alg,
                src: blocked.desc().clone(),
                dst: MemoryDesc::any([2, 3, 2, 2], ScalarType::F32),
                kernel: kernel2(2, 2, 0),
            };
            let pd = PoolingForwardPd::new(&Engine::new(Isa::Simd8), desc).unwrap();
            assert_eq!(*pd.dst_desc().layout(), Layout::Blocked { block: 8 });
            let dst = Memory::zeros(pd.dst_desc().clone()).unwrap();
            let args = ArgMap::from([(Arg::Src, blocked.clone()), (Arg::Dst, dst.clone())]);
            PoolingForward::new(pd).execute(&args).unwrap();
            assert_eq!(dst.to_f32_vec().unwrap(), expected);
        }
    }

    #[test]
    fn max_backward_routes_to_argmax() {
        let engine = Engine::default();
        let src = iota([1, 1, 4, 4]);
        let fwd_desc = PoolingDesc {
            prop: PropKind::ForwardTraining,
            alg: PoolingAlgorithm::Max,
            src: src.desc().clone(),
            dst: MemoryDesc::any([1, 1, 2, 2], ScalarType::F32),
            kernel: kernel2(2, 2, 0),
        };
        let fwd_pd = PoolingForwardPd::new(&engine, fwd_desc.clone()).unwrap();
        let bwd_desc = PoolingDesc {
            src: MemoryDesc::any([1, 1, 4, 4], ScalarType::F32),
            ..fwd_desc
        };
        let bwd_pd = PoolingBackwardPd::new(&engine, bwd_desc, &fwd_pd).unwrap();
        let dy = Memory::from_buffer(
            bwd_pd.diff_dst_desc().clone(),
            Buffer::from_vec(vec![1f32, 2., 3., 4.]),
        )
        .unwrap();
        let dx = Memory::zeros(bwd_pd.diff_src_desc().clone()).unwrap();
        let ws = Memory::from_buffer(
            fwd_pd.workspace_desc().unwrap().clone(),
            Buffer::from_vec(vec![3i32, 3, 3, 0]),
        )
        .unwrap();
        let args = ArgMap::from([
            (Arg::DiffDst, dy),
            (Arg::DiffSrc, dx.clone()),
            (Arg::Workspace, ws),
        ]);
        PoolingBackward::new(bwd_pd).execute(&args).unwrap();
        let dx = dx.to_vec::<f32>().unwrap();
        assert_eq!(dx[5], 1.);
        assert_eq!(dx[7], 2.);
        assert_eq!(dx[13], 3.);
        assert_eq!(dx[10], 4.);
        assert_eq!(dx.iter().sum::<f32>(), 10.);
    }

    #[test]
    fn inconsistent_output_is_configuration_error() {
        let desc = PoolingDesc {
            prop: PropKind::ForwardScoring,
            alg: PoolingAlgorithm::Max,
            src: MemoryDesc::plain([1, 1, 4, 4], ScalarType::F32),
            dst: MemoryDesc::any([1, 1, 3, 3], ScalarType::F32),
            kernel: kernel2(2, 2, 0),
        };
        let error = PoolingForwardPd::new(&Engine::default(), desc).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
    }
}
