//! Layout and type conversion.

use super::{check_arg, Arg, ArgMap, Primitive};
use crate::memory::{Memory, MemoryDesc};
use anyhow::{ensure, Result};
use rayon::prelude::*;

/// Reorder attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReorderAttr {
    /// Multiplies every element.
    pub scale: Option<f32>,
    /// Adds to the destination instead of overwriting it.
    pub sum: bool,
}

impl ReorderAttr {
    /// Scales by `scale`.
    pub fn scale(scale: f32) -> Self {
        Self {
            scale: Some(scale),
            sum: false,
        }
    }
    /// Accumulates into the destination.
    pub fn sum() -> Self {
        Self {
            scale: None,
            sum: true,
        }
    }
    /// Adds a sum post op.
    pub fn with_sum(self) -> Self {
        Self { sum: true, ..self }
    }
}

/// Reorder primitive descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct ReorderPd {
    src: MemoryDesc,
    dst: MemoryDesc,
    attr: ReorderAttr,
}

impl ReorderPd {
    /// Creates a reorder from `src` to `dst`.
    ///
    /// **Errors**
    /// - The dims differ or a layout is [`Any`](crate::memory::Layout::Any).
    pub fn new(src: MemoryDesc, dst: MemoryDesc, attr: ReorderAttr) -> Result<Self> {
        ensure!(
            src.dims() == dst.dims(),
            "cannot reorder {:?} to {:?}",
            src.dims(),
            dst.dims()
        );
        ensure!(
            !src.is_any() && !dst.is_any(),
            "reorder requires concrete layouts, found {src:?} {dst:?}"
        );
        Ok(Self { src, dst, attr })
    }
    /// The source desc.
    pub fn src_desc(&self) -> &MemoryDesc {
        &self.src
    }
    /// The destination desc.
    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.dst
    }
    /// The attributes.
    pub fn attr(&self) -> ReorderAttr {
        self.attr
    }
}

/// Copies [`Arg::Src`] into [`Arg::Dst`], converting layout and type.
#[derive(Debug)]
pub struct Reorder {
    pd: ReorderPd,
}

impl Reorder {
    /// Creates the primitive.
    pub fn new(pd: ReorderPd) -> Self {
        Self { pd }
    }
    /// The descriptor.
    pub fn pd(&self) -> &ReorderPd {
        &self.pd
    }
}

impl Primitive for Reorder {
    fn name(&self) -> &'static str {
        "reorder"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let src = check_arg(args, Arg::Src, &self.pd.src)?;
        let dst = check_arg(args, Arg::Dst, &self.pd.dst)?;
        reorder(&src, &dst, self.pd.attr)
    }
}

/// Reorders `src` into `dst` immediately.
///
/// **Errors**
/// - The dims differ.
pub fn reorder(src: &Memory, dst: &Memory, attr: ReorderAttr) -> Result<()> {
    ensure!(
        src.desc().dims() == dst.desc().dims(),
        "cannot reorder {:?} to {:?}",
        src.desc().dims(),
        dst.desc().dims()
    );
    let mut values = src.to_f32_vec()?;
    if let Some(scale) = attr.scale {
        values.par_iter_mut().for_each(|x| *x *= scale);
    }
    if attr.sum {
        let prev = dst.to_f32_vec()?;
        values
            .par_iter_mut()
            .zip(prev.par_iter())
            .for_each(|(x, p)| *x += p);
    }
    dst.write_f32(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::Buffer, scalar::ScalarType};
    use std::sync::Arc;

    #[test]
    fn blocked_round_trip() {
        let plain = MemoryDesc::plain([1, 3, 2, 2], ScalarType::F32);
        let values: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let src = Memory::from_buffer(plain.clone(), Buffer::from_vec(values.clone())).unwrap();
        let blocked = Memory::zeros(plain.with_layout(crate::memory::Layout::Blocked { block: 8 }).unwrap()).unwrap();
        reorder(&src, &blocked, ReorderAttr::default()).unwrap();
        assert_eq!(blocked.read().len(), 32);
        let back = Memory::zeros(plain).unwrap();
        reorder(&blocked, &back, ReorderAttr::default()).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), values);
    }

    #[test]
    fn scale_saturates() {
        let desc = MemoryDesc::plain([4], ScalarType::F32);
        let src = Memory::from_buffer(desc.clone(), Buffer::from_vec(vec![-1f32, 0.2, 1., 2.])).unwrap();
        let dst = Memory::zeros(desc.with_scalar_type(ScalarType::I8)).unwrap();
        reorder(&src, &dst, ReorderAttr::scale(127.)).unwrap();
        assert_eq!(dst.to_vec::<i8>().unwrap(), vec![-127, 25, 127, 127]);
    }

    #[test]
    fn primitive_sum() {
        let desc = MemoryDesc::plain([2], ScalarType::F32);
        let src = Memory::from_buffer(desc.clone(), Buffer::from_vec(vec![1f32, 2.])).unwrap();
        let dst = Memory::from_buffer(desc.clone(), Buffer::from_vec(vec![10f32, 20.])).unwrap();
        let pd = ReorderPd::new(desc.clone(), desc, ReorderAttr::sum()).unwrap();
        let primitive: Arc<dyn Primitive> = Arc::new(Reorder::new(pd));
        let args = ArgMap::from([(Arg::Src, src), (Arg::Dst, dst.clone())]);
        primitive.execute(&args).unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![11., 22.]);
    }
}
