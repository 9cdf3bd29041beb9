//! Batch normalization inference primitive.

use super::{check_arg, Arg, ArgMap, Engine, Primitive};
use crate::{
    error::Error,
    memory::MemoryDesc,
    scalar::ScalarType,
};
use anyhow::{ensure, Result};
use rayon::prelude::*;

/// Batch normalization flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct BatchNormFlags {
    /// Normalize with [`Arg::Mean`] and [`Arg::Variance`] instead of batch statistics.
    pub use_global_stats: bool,
    /// Apply [`Arg::ScaleShift`].
    pub use_scale_shift: bool,
}

/// Operation descriptor for batch normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNormDesc {
    /// Source, channels on axis 1.
    pub src: MemoryDesc,
    /// Added to the variance.
    pub eps: f32,
    /// Flags.
    pub flags: BatchNormFlags,
}

/// Batch normalization forward primitive descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNormForwardPd {
    desc: BatchNormDesc,
    stats: MemoryDesc,
    scale_shift: MemoryDesc,
}

impl BatchNormForwardPd {
    /// Creates the descriptor.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] if the source is not concrete, has rank < 2, or global stats
    ///   are not used.
    pub fn new(_engine: &Engine, desc: BatchNormDesc) -> Result<Self> {
        ensure!(
            !desc.src.is_any() && desc.src.ndim() >= 2,
            Error::Configuration(format!(
                "batch norm requires a concrete source of rank >= 2, found {:?}",
                desc.src
            ))
        );
        ensure!(
            desc.flags.use_global_stats,
            Error::Configuration("batch norm inference requires global stats".into())
        );
        let channels = desc.src.dims()[1];
        Ok(Self {
            stats: MemoryDesc::plain([channels], ScalarType::F32),
            scale_shift: MemoryDesc::plain([2, channels], ScalarType::F32),
            desc,
        })
    }
    /// The descriptor.
    pub fn desc(&self) -> &BatchNormDesc {
        &self.desc
    }
    /// The source desc.
    pub fn src_desc(&self) -> &MemoryDesc {
        &self.desc.src
    }
    /// The destination desc, same as the source.
    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.desc.src
    }
    /// Mean and variance desc, `[C]`.
    pub fn stats_desc(&self) -> &MemoryDesc {
        &self.stats
    }
    /// Scale and shift desc, `[2, C]`.
    pub fn scale_shift_desc(&self) -> &MemoryDesc {
        &self.scale_shift
    }
}

/// Batch normalization forward primitive.
#[derive(Debug)]
pub struct BatchNormForward {
    pd: BatchNormForwardPd,
}

impl BatchNormForward {
    /// Creates the primitive.
    pub fn new(pd: BatchNormForwardPd) -> Self {
        Self { pd }
    }
    /// The descriptor.
    pub fn pd(&self) -> &BatchNormForwardPd {
        &self.pd
    }
}

impl Primitive for BatchNormForward {
    fn name(&self) -> &'static str {
        "batch_norm_forward"
    }
    fn execute(&self, args: &ArgMap) -> Result<()> {
        let pd = &self.pd;
        let src = check_arg(args, Arg::Src, pd.src_desc())?;
        let dst = check_arg(args, Arg::Dst, pd.dst_desc())?;
        let mean = check_arg(args, Arg::Mean, &pd.stats)?.to_f32_vec()?;
        let var = check_arg(args, Arg::Variance, &pd.stats)?.to_f32_vec()?;
        let channels = mean.len();
        let (scale, shift) = if pd.desc.flags.use_scale_shift {
            let mut ss = check_arg(args, Arg::ScaleShift, &pd.scale_shift)?.to_f32_vec()?;
            let shift = ss.split_off(channels);
            (ss, shift)
        } else {
            (vec![1.; channels], vec![0.; channels])
        };
        let eps = pd.desc.eps;
        let mut x = src.to_f32_vec()?;
        let inner: usize = pd.src_desc().dims()[2..].iter().product();
        if inner > 0 && channels > 0 {
            x.par_chunks_mut(inner).enumerate().for_each(|(plane, x)| {
                let c = plane % channels;
                let invstd = (var[c] + eps).sqrt().recip();
                x.iter_mut()
                    .for_each(|x| *x = scale[c] * (*x - mean[c]) * invstd + shift[c]);
            });
        }
        dst.write_f32(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Buffer, Memory};

    #[test]
    fn normalize_scale_shift_saturates() {
        let src_desc = MemoryDesc::plain([1, 2, 2], ScalarType::I8);
        let pd = BatchNormForwardPd::new(
            &Engine::default(),
            BatchNormDesc {
                src: src_desc.clone(),
                eps: 0.,
                flags: BatchNormFlags {
                    use_global_stats: true,
                    use_scale_shift: true,
                },
            },
        )
        .unwrap();
        let memory = |desc: &MemoryDesc, values: Vec<f32>| {
            let memory = Memory::zeros(desc.clone()).unwrap();
            memory.write_f32(&values).unwrap();
            memory
        };
        let src = Memory::from_buffer(src_desc, Buffer::from_vec(vec![10i8, -20, 100, 120])).unwrap();
        let dst = Memory::zeros(pd.dst_desc().clone()).unwrap();
        let args = ArgMap::from([
            (Arg::Src, src),
            (Arg::Dst, dst.clone()),
            (Arg::Mean, memory(pd.stats_desc(), vec![0., 0.])),
            (Arg::Variance, memory(pd.stats_desc(), vec![4., 1.])),
            (Arg::ScaleShift, memory(pd.scale_shift_desc(), vec![1., 2., 0., 10.])),
        ]);
        BatchNormForward::new(pd).execute(&args).unwrap();
        assert_eq!(dst.to_vec::<i8>().unwrap(), vec![5, -10, 127, 127]);
    }

    #[test]
    fn requires_global_stats() {
        let error = BatchNormForwardPd::new(
            &Engine::default(),
            BatchNormDesc {
                src: MemoryDesc::plain([1, 2], ScalarType::F32),
                eps: 1e-3,
                flags: BatchNormFlags::default(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
    }
}
