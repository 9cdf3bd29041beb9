//! CPU engine: primitive descriptors, primitives and the execution stream.
//!
//! Primitive descriptors resolve [`Layout::Any`](crate::memory::Layout::Any) descriptors to
//! concrete layouts for one of several implementation candidates. Primitives are executed by
//! registering them with their arguments on a [`Stream`] and submitting it.

use crate::{
    memory::{Memory, MemoryDesc},
    scalar::ScalarType,
};
use anyhow::{anyhow, Result};
use derive_more::Display;
use std::{collections::BTreeMap, fmt::Debug, str::FromStr};

pub mod batch_norm;
pub mod convolution;
pub mod pooling;
pub mod reorder;
mod stream;
pub use stream::Stream;

/// Instruction set level, determines the implementation candidates.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Isa {
    /// Plain layouts only.
    #[display(fmt = "reference")]
    Reference,
    /// 8 wide blocked layouts.
    #[display(fmt = "simd8")]
    Simd8,
    /// 16 and 8 wide blocked layouts.
    #[display(fmt = "simd16")]
    Simd16,
}

impl FromStr for Isa {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reference" | "ref" => Ok(Self::Reference),
            "simd8" => Ok(Self::Simd8),
            "simd16" => Ok(Self::Simd16),
            _ => Err(anyhow!(
                "unknown isa {s:?}, expected reference, simd8 or simd16"
            )),
        }
    }
}

/// An implementation candidate of a primitive descriptor.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum ImplKind {
    /// Channels blocked by 16.
    Blocked16,
    /// Channels blocked by 8.
    Blocked8,
    /// Plain layouts, f32 only.
    Reference,
}

impl ImplKind {
    /// The channel block, if any.
    pub fn block(&self) -> Option<usize> {
        match self {
            Self::Blocked16 => Some(16),
            Self::Blocked8 => Some(8),
            Self::Reference => None,
        }
    }
}

/// The CPU engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Engine {
    isa: Isa,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Isa::Simd16)
    }
}

impl Engine {
    /// Creates an engine for `isa`.
    pub fn new(isa: Isa) -> Self {
        Self { isa }
    }
    /// The isa.
    pub fn isa(&self) -> Isa {
        self.isa
    }
    /// Implementation candidates for `scalar_type`, most preferred first.
    pub fn candidates(&self, scalar_type: ScalarType) -> Vec<ImplKind> {
        let mut candidates = Vec::with_capacity(3);
        if scalar_type.is_float() {
            if self.isa >= Isa::Simd16 {
                candidates.push(ImplKind::Blocked16);
            }
            if self.isa >= Isa::Simd8 {
                candidates.push(ImplKind::Blocked8);
            }
        }
        if scalar_type == ScalarType::F32 {
            candidates.push(ImplKind::Reference);
        }
        candidates
    }
}

/// Primitive arguments.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Arg {
    Src,
    Dst,
    Weights,
    Bias,
    DiffSrc,
    DiffDst,
    DiffWeights,
    DiffBias,
    Workspace,
    Mean,
    Variance,
    ScaleShift,
    Scratchpad,
}

/// Memory bound to primitive arguments.
pub type ArgMap = BTreeMap<Arg, Memory>;

pub(crate) fn arg(args: &ArgMap, arg: Arg) -> Result<&Memory> {
    args.get(&arg)
        .ok_or_else(|| anyhow!("missing primitive argument {arg:?}"))
}

/// Checks that memory bound to an argument matches the descriptor it was built for.
pub(crate) fn check_arg(args: &ArgMap, arg: Arg, desc: &MemoryDesc) -> Result<Memory> {
    let memory = self::arg(args, arg)?;
    anyhow::ensure!(
        memory.desc() == desc,
        "argument {arg:?} {:?} does not match {desc:?}",
        memory.desc()
    );
    Ok(memory.clone())
}

/// An executable primitive.
pub trait Primitive: Debug + Send + Sync {
    /// The name, for logging.
    fn name(&self) -> &'static str;
    /// Executes with `args`.
    ///
    /// **Errors**
    /// - Missing or mismatched arguments.
    fn execute(&self, args: &ArgMap) -> Result<()>;
    /// Whether source and destination may share storage.
    fn supports_in_place(&self) -> bool {
        true
    }
}

/// Spatial extents normalized to 3 dims, missing dims are 1.
pub(crate) fn spatial3(dims: &[usize], fill: usize) -> [usize; 3] {
    let mut output = [fill; 3];
    let offset = 3 - dims.len().min(3);
    for (o, d) in output[offset..].iter_mut().zip(dims) {
        *o = *d;
    }
    output
}
