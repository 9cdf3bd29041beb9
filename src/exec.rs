//! Binding tensors to primitive arguments.
//!
//! Outputs are bound with [`create_mem`], which either hands out the output's own memory or a
//! temp buffer that [`commit_output`] copies (or adds) back after the primitive. Inputs are
//! bound with [`memory_as`], which reorders into the layout the primitive expects. Reorders are
//! registered on the stream, so they run in order with the primitive on submit.

use crate::{
    context::{OpReq, TempSpace},
    engine::{
        reorder::{Reorder, ReorderAttr, ReorderPd},
        Arg, ArgMap, Primitive, Stream,
    },
    memory::{Memory, MemoryDesc},
    tensor::Tensor,
};
use anyhow::Result;
use std::sync::Arc;

/// What to do with an output after the primitive ran.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutDataOp {
    /// The primitive wrote the output directly, or the output is skipped.
    Noop,
    /// Copy the temp buffer into the output.
    CopyBack,
    /// Add the temp buffer to the output.
    AddBack,
}

/// Memory for the primitive to write the output `out` into, with layout `desc`.
///
/// `in_place_ok` is whether the primitive supports its destination sharing storage with a
/// source, relevant for [`OpReq::WriteInPlace`].
///
/// **Errors**
/// - The temp allocation failed.
pub fn create_mem(
    out: &Tensor,
    desc: &MemoryDesc,
    req: OpReq,
    in_place_ok: bool,
    temp: &mut TempSpace,
) -> Result<(OutDataOp, Memory)> {
    let output = match req {
        OpReq::Null => (OutDataOp::Noop, temp.alloc(desc.clone())?),
        OpReq::Write if out.desc() == *desc => (OutDataOp::Noop, out.memory()?),
        OpReq::WriteInPlace if in_place_ok && out.desc() == *desc => (OutDataOp::Noop, out.memory()?),
        OpReq::Write | OpReq::WriteInPlace => (OutDataOp::CopyBack, temp.alloc(desc.clone())?),
        OpReq::AddTo => (OutDataOp::AddBack, temp.alloc(desc.clone())?),
    };
    Ok(output)
}

/// Registers the copy or add of `memory` back into `out`.
///
/// **Errors**
/// - The dims differ.
pub fn commit_output(
    out: &Tensor,
    (op, memory): (OutDataOp, Memory),
    stream: &mut Stream,
) -> Result<()> {
    let attr = match op {
        OutDataOp::Noop => return Ok(()),
        OutDataOp::CopyBack => ReorderAttr::default(),
        OutDataOp::AddBack => ReorderAttr::sum(),
    };
    let dst = out.memory()?;
    register_reorder(&memory, &dst, attr, stream)
}

pub(crate) fn register_reorder(
    src: &Memory,
    dst: &Memory,
    attr: ReorderAttr,
    stream: &mut Stream,
) -> Result<()> {
    let pd = ReorderPd::new(src.desc().clone(), dst.desc().clone(), attr)?;
    let primitive: Arc<dyn Primitive> = Arc::new(Reorder::new(pd));
    let args = ArgMap::from([(Arg::Src, src.clone()), (Arg::Dst, dst.clone())]);
    stream.register(primitive, args);
    Ok(())
}

/// The memory of `tensor` in layout `desc`, reordered through the temp arena if needed.
///
/// Views are bound at their offset, the reorder materializes them.
///
/// **Errors**
/// - The dims or type differ.
pub fn memory_as(
    tensor: &Tensor,
    desc: &MemoryDesc,
    temp: &mut TempSpace,
    stream: &mut Stream,
) -> Result<Memory> {
    let memory = tensor.memory()?;
    if memory.desc() == desc {
        return Ok(memory);
    }
    tracing::trace!(from = ?memory.desc(), to = ?desc, "reorder input");
    let output = temp.alloc(desc.clone())?;
    register_reorder(&memory, &output, ReorderAttr::default(), stream)?;
    Ok(output)
}
