//! Tensors.
//!
//! A [`Tensor`] is a shared handle to [`Memory`], like an `Arc`. Clones share the storage, and
//! re-layouts through one handle are visible through all of them. A tensor can also be a view
//! of a range of its base along axis 0, which accelerated paths materialize before use.

use crate::{
    context::OpReq,
    engine::reorder::{reorder, ReorderAttr},
    error::Error,
    memory::{Buffer, Memory, MemoryDesc},
    scalar::{Scalar, ScalarType},
};
use anyhow::{ensure, Result};
use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use parking_lot::RwLock;
use std::{ops::Range, sync::Arc};

#[derive(Clone, Debug, Eq, PartialEq)]
struct View {
    offset: usize,
    dims: Vec<usize>,
}

/// A shared, re-layoutable tensor handle.
#[derive(Clone, Debug)]
pub struct Tensor {
    chunk: Arc<RwLock<Memory>>,
    view: Option<View>,
}

impl From<Memory> for Tensor {
    fn from(memory: Memory) -> Self {
        Self {
            chunk: Arc::new(RwLock::new(memory)),
            view: None,
        }
    }
}

impl Tensor {
    /// Creates a row major tensor from `vec`.
    ///
    /// **Errors**
    /// - The len of `vec` does not match `dims`.
    pub fn from_vec<T: Scalar>(dims: impl Into<Vec<usize>>, vec: Vec<T>) -> Result<Self> {
        let desc = MemoryDesc::plain(dims, T::scalar_type());
        ensure!(
            desc.len() == vec.len(),
            "expected {} elements for {:?}, found {}",
            desc.len(),
            desc.dims(),
            vec.len()
        );
        Ok(Memory::from_buffer(desc, Buffer::from_vec(vec))?.into())
    }
    /// Creates a row major tensor from an array.
    pub fn from_array<T: Scalar, S: Data<Elem = T>, D: Dimension>(array: &ArrayBase<S, D>) -> Self {
        let dims = array.shape().to_vec();
        let vec = array.iter().copied().collect::<Vec<_>>();
        let desc = MemoryDesc::plain(dims, T::scalar_type());
        Memory::from_buffer(desc, Buffer::from_vec(vec))
            .map(Into::into)
            .unwrap_or_else(|_| unreachable!("array len matches its shape"))
    }
    /// A zeroed row major tensor.
    pub fn zeros(dims: impl Into<Vec<usize>>, scalar_type: ScalarType) -> Self {
        let desc = MemoryDesc::plain(dims, scalar_type);
        let buffer = Buffer::zeros(scalar_type, desc.len());
        Memory::from_buffer(desc, buffer)
            .map(Into::into)
            .unwrap_or_else(|_| unreachable!("buffer allocated for desc"))
    }
    /// A zeroed tensor with `desc`.
    ///
    /// **Errors**
    /// - The layout is [`Any`](crate::memory::Layout::Any).
    pub fn with_desc(desc: MemoryDesc) -> Result<Self> {
        Ok(Memory::zeros(desc)?.into())
    }
    /// The logical dims.
    pub fn shape(&self) -> Vec<usize> {
        if let Some(view) = self.view.as_ref() {
            view.dims.clone()
        } else {
            self.chunk.read().desc().dims().to_vec()
        }
    }
    /// The element type.
    pub fn scalar_type(&self) -> ScalarType {
        self.chunk.read().desc().scalar_type()
    }
    /// The descriptor.
    ///
    /// Views are row major.
    pub fn desc(&self) -> MemoryDesc {
        if let Some(view) = self.view.as_ref() {
            MemoryDesc::plain(view.dims.clone(), self.scalar_type())
        } else {
            self.chunk.read().desc().clone()
        }
    }
    /// Whether self is a view of a larger tensor.
    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }
    /// Whether the layout is row major.
    pub fn is_default_layout(&self) -> bool {
        self.desc().is_plain()
    }
    /// Whether self and other share storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk) || self.chunk.read().aliases(&other.chunk.read())
    }
    /// The memory, offset into the base for views.
    ///
    /// **Errors**
    /// - Self is a view and its base is not row major.
    pub fn memory(&self) -> Result<Memory> {
        let memory = self.chunk.read().clone();
        let Some(view) = self.view.as_ref() else {
            return Ok(memory);
        };
        ensure!(
            memory.desc().is_plain(),
            "view of a {:?} base, the base must be row major",
            memory.desc().layout()
        );
        let desc = MemoryDesc::plain(view.dims.clone(), memory.desc().scalar_type());
        memory.with_desc_offset(desc, memory.offset() + view.offset)
    }
    /// A view of `range` along axis 0.
    ///
    /// **Errors**
    /// - Self is not row major, is a view, or the range is out of bounds.
    pub fn slice_axis0(&self, range: Range<usize>) -> Result<Self> {
        let desc = self.desc();
        ensure!(
            !self.is_view() && desc.is_plain() && desc.ndim() > 0,
            "can only slice row major tensors, found {desc:?}"
        );
        ensure!(
            range.start <= range.end && range.end <= desc.dims()[0],
            "slice {range:?} out of bounds for {:?}",
            desc.dims()
        );
        let inner: usize = desc.dims()[1..].iter().product();
        let mut dims = desc.dims().to_vec();
        dims[0] = range.len();
        Ok(Self {
            chunk: self.chunk.clone(),
            view: Some(View {
                offset: range.start * inner,
                dims,
            }),
        })
    }
    /// A row major tensor with its own storage, or self if already compact.
    ///
    /// **Errors**
    /// - The copy failed.
    pub fn to_compact(&self) -> Result<Self> {
        if !self.is_view() {
            return Ok(self.clone());
        }
        let output = Self::zeros(self.shape(), self.scalar_type());
        reorder(&self.memory()?, &output.memory()?, ReorderAttr::default())?;
        Ok(output)
    }
    /// Copies the logical elements into a row major vec.
    ///
    /// **Errors**
    /// - T is not the element type.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        self.memory()?.to_vec()
    }
    /// Reads the logical elements as f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.memory()?.to_f32_vec()
    }
    /// Copies into a row major array.
    ///
    /// **Errors**
    /// - T is not the element type.
    pub fn to_array<T: Scalar>(&self) -> Result<ArrayD<T>> {
        let vec = self.to_vec::<T>()?;
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape()), vec)?)
    }
    /// Replaces the storage of self, and of every handle sharing it.
    ///
    /// **Errors**
    /// - Self is a view.
    /// - The dims differ.
    pub(crate) fn set_memory(&self, memory: Memory) -> Result<()> {
        ensure!(!self.is_view(), "cannot replace the memory of a view");
        let mut chunk = self.chunk.write();
        ensure!(
            chunk.desc().dims() == memory.desc().dims(),
            "cannot replace {:?} with {:?}",
            chunk.desc().dims(),
            memory.desc().dims()
        );
        *chunk = memory;
        Ok(())
    }
    /// Converts the storage to `desc`.
    ///
    /// **Errors**
    /// - Self is a view.
    /// - The dims differ or `desc` is not concrete.
    pub fn reorder_in_place(&self, desc: MemoryDesc) -> Result<()> {
        ensure!(!self.is_view(), "cannot reorder a view in place");
        if self.desc() == desc {
            return Ok(());
        }
        let output = Memory::zeros(desc)?;
        reorder(&self.memory()?, &output, ReorderAttr::default())?;
        tracing::debug!(
            from = ?self.desc().layout(),
            to = ?output.desc().layout(),
            "reorder in place"
        );
        self.set_memory(output)
    }
    /// Converts the storage to row major.
    ///
    /// **Errors**
    /// - Self is a view.
    pub fn reorder_to_default_in_place(&self) -> Result<()> {
        if self.is_default_layout() {
            return Ok(());
        }
        self.reorder_in_place(self.desc().to_plain())
    }
    /// Writes `values` per `req`.
    ///
    /// **Errors**
    /// - The len of `values` does not match.
    pub(crate) fn assign_f32(&self, req: OpReq, values: &[f32]) -> Result<()> {
        let memory = self.memory()?;
        match req {
            OpReq::Null => Ok(()),
            OpReq::Write | OpReq::WriteInPlace => memory.write_f32(values),
            OpReq::AddTo => {
                let mut prev = memory.to_f32_vec()?;
                ensure!(
                    prev.len() == values.len(),
                    Error::Configuration(format!(
                        "cannot add {} elements to {:?}",
                        values.len(),
                        memory.desc().dims()
                    ))
                );
                prev.iter_mut().zip(values).for_each(|(p, v)| *p += v);
                memory.write_f32(&prev)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Layout;
    use ndarray::Array;

    #[test]
    fn views_offset_into_base() {
        let x = Tensor::from_vec([3, 2], (0..6).map(|x| x as f32).collect()).unwrap();
        let view = x.slice_axis0(1..3).unwrap();
        assert!(view.is_view());
        assert_eq!(view.shape(), vec![2, 2]);
        assert_eq!(view.memory().unwrap().offset(), 2);
        assert_eq!(view.to_vec::<f32>().unwrap(), vec![2., 3., 4., 5.]);
        let compact = view.to_compact().unwrap();
        assert!(!compact.is_view());
        assert!(!compact.same_storage(&x));
        assert_eq!(compact.to_vec::<f32>().unwrap(), vec![2., 3., 4., 5.]);
    }

    #[test]
    fn reorder_in_place_shared() {
        let x = Tensor::from_array(&Array::from_shape_vec((1, 2, 1, 2), vec![1f32, 2., 3., 4.]).unwrap());
        let y = x.clone();
        let blocked = x.desc().with_layout(Layout::Blocked { block: 8 }).unwrap();
        x.reorder_in_place(blocked.clone()).unwrap();
        assert_eq!(y.desc(), blocked);
        assert!(!y.is_default_layout());
        assert_eq!(y.to_f32_vec().unwrap(), vec![1., 2., 3., 4.]);
        y.reorder_to_default_in_place().unwrap();
        assert!(x.is_default_layout());
        assert_eq!(x.to_array::<f32>().unwrap().shape(), &[1, 2, 1, 2]);
    }

    #[test]
    fn view_of_blocked_base() {
        let x = Tensor::from_vec([2, 2, 1, 2], (0..8).map(|x| x as f32).collect()).unwrap();
        let view = x.slice_axis0(1..2).unwrap();
        let blocked = x.desc().with_layout(Layout::Blocked { block: 8 }).unwrap();
        x.reorder_in_place(blocked).unwrap();
        assert!(view.memory().is_err());
        assert!(view.to_f32_vec().is_err());
        x.reorder_to_default_in_place().unwrap();
        assert_eq!(view.to_vec::<f32>().unwrap(), vec![4., 5., 6., 7.]);
    }

    #[test]
    fn assign_per_req() {
        let x = Tensor::from_vec([2], vec![1f32, 2.]).unwrap();
        x.assign_f32(OpReq::AddTo, &[1., 1.]).unwrap();
        assert_eq!(x.to_vec::<f32>().unwrap(), vec![2., 3.]);
        x.assign_f32(OpReq::Null, &[0., 0.]).unwrap();
        assert_eq!(x.to_vec::<f32>().unwrap(), vec![2., 3.]);
        x.assign_f32(OpReq::Write, &[5., 6.]).unwrap();
        assert_eq!(x.to_vec::<f32>().unwrap(), vec![5., 6.]);
    }
}
