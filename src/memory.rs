//! Memory descriptors, typed buffers and memory handles.

use crate::{
    error::Error,
    scalar::{Scalar, ScalarElem, ScalarType},
};
use anyhow::{bail, ensure, Result};
use half::bf16;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use std::sync::Arc;

/// Physical arrangement of the elements of a [`MemoryDesc`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Layout {
    /// Not yet chosen, resolved by a primitive descriptor.
    Any,
    /// Element strides for each logical dimension.
    Strided(Vec<usize>),
    /// Axis 1 split into blocks of `block` innermost elements, padded with zeros.
    Blocked {
        /// Elements per block.
        block: usize,
    },
}

/// Describes the logical dims, element type and layout of memory.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryDesc {
    dims: Vec<usize>,
    scalar_type: ScalarType,
    layout: Layout,
}

pub(crate) fn default_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (1..dims.len()).rev() {
        strides[i - 1] = strides[i] * dims[i].max(1);
    }
    strides
}

/// Strides for `dims` stored in `order`, outermost first.
fn ordered_strides(dims: &[usize], order: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    let mut stride = 1;
    for &axis in order.iter().rev() {
        strides[axis] = stride;
        stride *= dims[axis].max(1);
    }
    strides
}

fn round_up(x: usize, block: usize) -> usize {
    (x + block - 1) / block * block
}

impl MemoryDesc {
    /// Creates a new descriptor.
    ///
    /// **Errors**
    /// - Strides or block do not match the dims.
    pub fn new(dims: impl Into<Vec<usize>>, scalar_type: ScalarType, layout: Layout) -> Result<Self> {
        let dims = dims.into();
        match &layout {
            Layout::Any => (),
            Layout::Strided(strides) => {
                ensure!(
                    strides.len() == dims.len(),
                    "strides {strides:?} do not match dims {dims:?}"
                );
            }
            Layout::Blocked { block } => {
                ensure!(
                    *block > 0 && dims.len() >= 2,
                    "blocked layout requires rank >= 2 and block > 0, found {dims:?} {block}"
                );
            }
        }
        Ok(Self {
            dims,
            scalar_type,
            layout,
        })
    }
    /// Row major layout.
    pub fn plain(dims: impl Into<Vec<usize>>, scalar_type: ScalarType) -> Self {
        let dims = dims.into();
        let strides = default_strides(&dims);
        Self {
            dims,
            scalar_type,
            layout: Layout::Strided(strides),
        }
    }
    /// Channels innermost, ie NHWC for rank 4.
    pub fn channels_last(dims: impl Into<Vec<usize>>, scalar_type: ScalarType) -> Self {
        let dims = dims.into();
        let ndim = dims.len();
        let strides = if ndim >= 3 {
            let order: Vec<usize> = std::iter::once(0)
                .chain(2..ndim)
                .chain(std::iter::once(1))
                .collect();
            ordered_strides(&dims, &order)
        } else {
            default_strides(&dims)
        };
        Self {
            dims,
            scalar_type,
            layout: Layout::Strided(strides),
        }
    }
    /// Channels blocked by `block`.
    pub fn blocked(dims: impl Into<Vec<usize>>, scalar_type: ScalarType, block: usize) -> Result<Self> {
        Self::new(dims, scalar_type, Layout::Blocked { block })
    }
    /// Layout deferred to the primitive descriptor.
    pub fn any(dims: impl Into<Vec<usize>>, scalar_type: ScalarType) -> Self {
        Self {
            dims: dims.into(),
            scalar_type,
            layout: Layout::Any,
        }
    }
    /// The dims.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
    /// The number of dims.
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }
    /// The element type.
    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }
    /// The layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }
    /// Whether the layout is [`Layout::Any`].
    pub fn is_any(&self) -> bool {
        self.layout == Layout::Any
    }
    /// Whether the layout is row major.
    pub fn is_plain(&self) -> bool {
        self.layout == Layout::Strided(default_strides(&self.dims))
    }
    /// Whether the layout is channels last.
    pub fn is_channels_last(&self) -> bool {
        self.ndim() >= 3 && *self == Self::channels_last(self.dims.clone(), self.scalar_type)
    }
    /// The number of logical elements.
    pub fn logical_len(&self) -> usize {
        self.dims.iter().product()
    }
    /// The size predicted from the dims alone.
    pub fn logical_size_bytes(&self) -> usize {
        self.logical_len() * self.scalar_type.size()
    }
    /// The number of elements the layout occupies, including padding.
    pub fn len(&self) -> usize {
        if self.dims.iter().any(|x| *x == 0) {
            return 0;
        }
        match &self.layout {
            Layout::Any => self.logical_len(),
            Layout::Strided(strides) => {
                1 + self
                    .dims
                    .iter()
                    .zip(strides)
                    .map(|(d, s)| (d - 1) * s)
                    .sum::<usize>()
            }
            Layout::Blocked { block } => {
                self.dims[0] * round_up(self.dims[1], *block) * self.dims[2..].iter().product::<usize>()
            }
        }
    }
    /// Whether the desc has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The physical size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len() * self.scalar_type.size()
    }
    /// The element offset of `index`.
    ///
    /// [`Layout::Any`] is treated as row major.
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.ndim());
        match &self.layout {
            Layout::Any => index
                .iter()
                .zip(default_strides(&self.dims))
                .map(|(i, s)| i * s)
                .sum(),
            Layout::Strided(strides) => index.iter().zip(strides).map(|(i, s)| i * s).sum(),
            Layout::Blocked { block } => {
                let inner: usize = self.dims[2..].iter().product();
                let spatial: usize = index[2..]
                    .iter()
                    .zip(default_strides(&self.dims[2..]))
                    .map(|(i, s)| i * s)
                    .sum();
                let c = index[1];
                index[0] * round_up(self.dims[1], *block) * inner
                    + (c / block) * inner * block
                    + spatial * block
                    + c % block
            }
        }
    }
    /// Element offsets of every logical index, in row major order.
    pub fn offsets(&self) -> Vec<usize> {
        let len = self.logical_len();
        if len == 0 {
            return Vec::new();
        }
        if self.is_plain() {
            return (0..len).collect();
        }
        let ndim = self.ndim();
        let mut offsets = Vec::with_capacity(len);
        let mut index = vec![0; ndim];
        for _ in 0..len {
            offsets.push(self.offset(&index));
            for axis in (0..ndim).rev() {
                index[axis] += 1;
                if index[axis] < self.dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        offsets
    }
    /// Replaces the layout.
    pub fn with_layout(&self, layout: Layout) -> Result<Self> {
        Self::new(self.dims.clone(), self.scalar_type, layout)
    }
    /// Replaces the element type.
    pub fn with_scalar_type(&self, scalar_type: ScalarType) -> Self {
        Self {
            scalar_type,
            ..self.clone()
        }
    }
    /// Row major desc with the same dims and type.
    pub fn to_plain(&self) -> Self {
        Self::plain(self.dims.clone(), self.scalar_type)
    }
    /// A concrete layout of the same family as self for `dims`.
    ///
    /// Row major and channels last are preserved, blocked keeps its block, other strided
    /// layouts become row major.
    pub fn like(&self, dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        match &self.layout {
            Layout::Blocked { block } if dims.len() >= 2 => Self {
                dims,
                scalar_type: self.scalar_type,
                layout: Layout::Blocked { block: *block },
            },
            Layout::Strided(_) if self.is_channels_last() => {
                Self::channels_last(dims, self.scalar_type)
            }
            _ => Self::plain(dims, self.scalar_type),
        }
    }
    /// Swaps two axes.
    ///
    /// **Errors**
    /// - The layout is blocked.
    pub fn swap_axes(&self, a: usize, b: usize) -> Result<Self> {
        ensure!(
            a < self.ndim() && b < self.ndim(),
            "swap_axes {a} {b} out of range for {:?}",
            self.dims
        );
        let mut output = self.clone();
        output.dims.swap(a, b);
        match &mut output.layout {
            Layout::Any => (),
            Layout::Strided(strides) => strides.swap(a, b),
            Layout::Blocked { .. } => bail!("cannot swap axes of blocked layout {self:?}"),
        }
        Ok(output)
    }
    /// Swaps the logical input and output channel axes of weights.
    ///
    /// Axes 0 and 1 without groups, 1 and 2 when grouped.
    pub fn swap_io(&self, num_group: usize) -> Result<Self> {
        if num_group > 1 {
            self.swap_axes(1, 2)
        } else {
            self.swap_axes(0, 1)
        }
    }
    /// Splits axis 0 into `[num_group, dims[0] / num_group]`.
    ///
    /// **Errors**
    /// - dims[0] is not divisible by num_group.
    /// - The layout is blocked.
    pub fn split_groups(&self, num_group: usize) -> Result<Self> {
        ensure!(
            num_group > 0 && self.ndim() > 0 && self.dims[0] % num_group == 0,
            Error::Configuration(format!(
                "{:?} cannot be split into {num_group} groups",
                self.dims
            ))
        );
        let mut dims = Vec::with_capacity(self.ndim() + 1);
        dims.push(num_group);
        dims.push(self.dims[0] / num_group);
        dims.extend_from_slice(&self.dims[1..]);
        let layout = match &self.layout {
            Layout::Any => Layout::Any,
            Layout::Strided(strides) => {
                let mut output = Vec::with_capacity(dims.len());
                output.push(strides[0] * dims[1]);
                output.extend_from_slice(strides);
                Layout::Strided(output)
            }
            Layout::Blocked { .. } => bail!("cannot split groups of blocked layout {self:?}"),
        };
        Ok(Self {
            dims,
            scalar_type: self.scalar_type,
            layout,
        })
    }
    /// Merges axes 0 and 1, the inverse of [`.split_groups()`](MemoryDesc::split_groups).
    ///
    /// **Errors**
    /// - The axes are not contiguous.
    pub fn merge_groups(&self) -> Result<Self> {
        ensure!(self.ndim() >= 2, "merge_groups requires rank >= 2");
        let mut dims = Vec::with_capacity(self.ndim() - 1);
        dims.push(self.dims[0] * self.dims[1]);
        dims.extend_from_slice(&self.dims[2..]);
        let layout = match &self.layout {
            Layout::Any => Layout::Any,
            Layout::Strided(strides) => {
                ensure!(
                    self.dims[0] == 1 || strides[0] == strides[1] * self.dims[1],
                    "cannot merge groups of {self:?}"
                );
                Layout::Strided(strides[1..].to_vec())
            }
            Layout::Blocked { .. } => bail!("cannot merge groups of blocked layout {self:?}"),
        };
        Ok(Self {
            dims,
            scalar_type: self.scalar_type,
            layout,
        })
    }
}

/// Typed storage.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Buffer {
    U8(Vec<u8>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
}

macro_rules! map_buffer {
    ($buffer:expr, $x:ident => $e:expr) => {
        match $buffer {
            Buffer::U8($x) => $e,
            Buffer::I8($x) => $e,
            Buffer::I32($x) => $e,
            Buffer::BF16($x) => $e,
            Buffer::F32($x) => $e,
        }
    };
}
pub(crate) use map_buffer;

impl Buffer {
    /// A zeroed buffer.
    pub fn zeros(scalar_type: ScalarType, len: usize) -> Self {
        match scalar_type {
            ScalarType::U8 => Self::U8(vec![0; len]),
            ScalarType::I8 => Self::I8(vec![0; len]),
            ScalarType::I32 => Self::I32(vec![0; len]),
            ScalarType::BF16 => Self::BF16(vec![bf16::ZERO; len]),
            ScalarType::F32 => Self::F32(vec![0.; len]),
        }
    }
    /// Wraps a vec.
    pub fn from_vec<T: Scalar>(vec: Vec<T>) -> Self {
        T::into_buffer(vec)
    }
    /// The element type.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::U8(_) => ScalarType::U8,
            Self::I8(_) => ScalarType::I8,
            Self::I32(_) => ScalarType::I32,
            Self::BF16(_) => ScalarType::BF16,
            Self::F32(_) => ScalarType::F32,
        }
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        map_buffer!(self, x => x.len())
    }
    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Borrows as a slice of T.
    ///
    /// Returns `None` if T is not the element type.
    pub fn as_slice<T: Scalar>(&self) -> Option<&[T]> {
        if self.scalar_type() != T::scalar_type() {
            return None;
        }
        map_buffer!(self, x => bytemuck::try_cast_slice(x.as_slice()).ok())
    }
    /// Borrows as a mutable slice of T.
    ///
    /// Returns `None` if T is not the element type.
    pub fn as_slice_mut<T: Scalar>(&mut self) -> Option<&mut [T]> {
        if self.scalar_type() != T::scalar_type() {
            return None;
        }
        map_buffer!(self, x => bytemuck::try_cast_slice_mut(x.as_mut_slice()).ok())
    }
    /// Fills `range` with `elem`, converting it to the element type.
    pub fn fill(&mut self, range: std::ops::Range<usize>, elem: ScalarElem) {
        let value = elem.to_f32_lossy();
        map_buffer!(self, x => x[range].fill(Scalar::from_f32_saturating(value)))
    }
}

/// Gathers the logical elements of `desc` at `offset` as f32, in row major order.
pub(crate) fn gather_f32(buffer: &Buffer, desc: &MemoryDesc, offset: usize) -> Result<Vec<f32>> {
    let mut output = vec![0f32; desc.logical_len()];
    gather_f32_into(buffer, desc, offset, &mut output)?;
    Ok(output)
}

/// Like [`gather_f32`], writing into `output`.
pub(crate) fn gather_f32_into(
    buffer: &Buffer,
    desc: &MemoryDesc,
    offset: usize,
    output: &mut [f32],
) -> Result<()> {
    ensure!(
        offset + desc.len() <= buffer.len(),
        "buffer of len {} too small for {desc:?} at offset {offset}",
        buffer.len()
    );
    ensure!(output.len() == desc.logical_len());
    let offsets = desc.offsets();
    map_buffer!(buffer, x => output
        .par_iter_mut()
        .zip(offsets.par_iter())
        .for_each(|(y, o)| *y = x[offset + o].to_f32_lossy()));
    Ok(())
}

/// Scatters row major `values` into the logical elements of `desc` at `offset`.
///
/// Integer types are rounded and saturated.
pub(crate) fn scatter_f32(
    buffer: &mut Buffer,
    desc: &MemoryDesc,
    offset: usize,
    values: &[f32],
) -> Result<()> {
    ensure!(
        offset + desc.len() <= buffer.len(),
        "buffer of len {} too small for {desc:?} at offset {offset}",
        buffer.len()
    );
    ensure!(values.len() == desc.logical_len());
    let offsets = desc.offsets();
    map_buffer!(buffer, x => {
        for (v, o) in values.iter().zip(offsets) {
            x[offset + o] = Scalar::from_f32_saturating(*v);
        }
    });
    Ok(())
}

/// A descriptor bound to shared storage.
///
/// Clones share the storage.
#[derive(Clone, Debug)]
pub struct Memory {
    desc: MemoryDesc,
    buffer: Arc<RwLock<Buffer>>,
    offset: usize,
}

impl Memory {
    /// Allocates zeroed memory.
    ///
    /// **Errors**
    /// - The desc layout is [`Layout::Any`].
    pub fn zeros(desc: MemoryDesc) -> Result<Self> {
        ensure!(!desc.is_any(), "cannot allocate memory for {desc:?}");
        let buffer = Buffer::zeros(desc.scalar_type(), desc.len());
        Ok(Self {
            desc,
            buffer: Arc::new(RwLock::new(buffer)),
            offset: 0,
        })
    }
    /// Wraps a buffer.
    ///
    /// **Errors**
    /// - The buffer type or len does not match desc.
    pub fn from_buffer(desc: MemoryDesc, buffer: Buffer) -> Result<Self> {
        ensure!(!desc.is_any(), "cannot bind memory to {desc:?}");
        ensure!(
            buffer.scalar_type() == desc.scalar_type() && buffer.len() >= desc.len(),
            "buffer {:?} of len {} does not fit {desc:?}",
            buffer.scalar_type(),
            buffer.len()
        );
        Ok(Self {
            desc,
            buffer: Arc::new(RwLock::new(buffer)),
            offset: 0,
        })
    }
    /// The descriptor.
    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }
    /// The element offset into the storage.
    pub fn offset(&self) -> usize {
        self.offset
    }
    /// Locks the storage for reading.
    pub fn read(&self) -> RwLockReadGuard<Buffer> {
        self.buffer.read()
    }
    /// Locks the storage for writing.
    pub fn write(&self) -> RwLockWriteGuard<Buffer> {
        self.buffer.write()
    }
    /// Whether self and other share storage.
    pub fn aliases(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
    /// Reinterprets the storage with another descriptor.
    ///
    /// **Errors**
    /// - desc does not fit in the storage.
    pub fn with_desc(&self, desc: MemoryDesc) -> Result<Self> {
        self.with_desc_offset(desc, self.offset)
    }
    pub(crate) fn with_desc_offset(&self, desc: MemoryDesc, offset: usize) -> Result<Self> {
        {
            let buffer = self.buffer.read();
            ensure!(
                !desc.is_any()
                    && buffer.scalar_type() == desc.scalar_type()
                    && offset + desc.len() <= buffer.len(),
                "{desc:?} at offset {offset} does not fit buffer of len {}",
                buffer.len()
            );
        }
        Ok(Self {
            desc,
            buffer: self.buffer.clone(),
            offset,
        })
    }
    /// Reads the logical elements as f32 in row major order.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        gather_f32(&self.read(), &self.desc, self.offset)
    }
    /// Like [`.to_f32_vec()`](Memory::to_f32_vec), writing into `output`.
    pub fn read_f32_into(&self, output: &mut [f32]) -> Result<()> {
        gather_f32_into(&self.read(), &self.desc, self.offset, output)
    }
    /// Writes row major `values` into the logical elements.
    pub fn write_f32(&self, values: &[f32]) -> Result<()> {
        scatter_f32(&mut self.write(), &self.desc, self.offset, values)
    }
    /// Copies the logical elements into a row major vec.
    ///
    /// **Errors**
    /// - T is not the element type.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        let buffer = self.read();
        let slice = buffer.as_slice::<T>().ok_or_else(|| {
            Error::configuration(format!(
                "expected {:?}, found {:?}",
                T::scalar_type(),
                self.desc.scalar_type()
            ))
        })?;
        let offset = self.offset;
        Ok(self
            .desc
            .offsets()
            .into_iter()
            .map(|o| slice[offset + o])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_len_offset() {
        let desc = MemoryDesc::plain([2, 3, 4], ScalarType::F32);
        assert!(desc.is_plain());
        assert_eq!(desc.len(), 24);
        assert_eq!(desc.size_bytes(), 96);
        assert_eq!(desc.offset(&[1, 2, 3]), 23);
    }

    #[test]
    fn channels_last_offset() {
        let desc = MemoryDesc::channels_last([1, 3, 2, 2], ScalarType::U8);
        assert!(desc.is_channels_last());
        assert!(!desc.is_plain());
        // n, h, w, c
        assert_eq!(desc.offset(&[0, 1, 0, 1]), 1 + 3);
        assert_eq!(desc.len(), 12);
    }

    #[test]
    fn blocked_len_is_padded() {
        let desc = MemoryDesc::blocked([1, 3, 2, 2], ScalarType::F32, 8).unwrap();
        assert_eq!(desc.logical_len(), 12);
        assert_eq!(desc.len(), 32);
        assert_eq!(desc.offset(&[0, 2, 1, 0]), 2 * 8 + 2);
        let desc = MemoryDesc::blocked([2, 16, 1, 1], ScalarType::F32, 8).unwrap();
        assert_eq!(desc.len(), desc.logical_len());
        assert_eq!(desc.offset(&[1, 9, 0, 0]), 16 + 8 + 1);
    }

    #[test]
    fn swap_io_grouped() {
        let desc = MemoryDesc::plain([4, 3, 2, 2], ScalarType::F32);
        let swapped = desc.swap_io(1).unwrap();
        assert_eq!(swapped.dims(), &[3, 4, 2, 2]);
        assert_eq!(swapped.offset(&[1, 2, 0, 0]), desc.offset(&[2, 1, 0, 0]));
        let grouped = desc.split_groups(2).unwrap();
        assert_eq!(grouped.dims(), &[2, 2, 3, 2, 2]);
        assert_eq!(grouped.offset(&[1, 0, 2, 1, 1]), desc.offset(&[2, 2, 1, 1]));
        let swapped = grouped.swap_io(2).unwrap();
        assert_eq!(swapped.dims(), &[2, 3, 2, 2, 2]);
        let merged = grouped.merge_groups().unwrap();
        assert_eq!(merged, desc);
    }

    #[test]
    fn buffer_slices() {
        let mut buffer = Buffer::from_vec(vec![1f32, 2., 3.]);
        assert!(buffer.as_slice::<u8>().is_none());
        buffer.as_slice_mut::<f32>().unwrap()[1] = 5.;
        assert_eq!(buffer.as_slice::<f32>().unwrap(), &[1., 5., 3.]);
        buffer.fill(0..2, ScalarElem::U8(7));
        assert_eq!(buffer.as_slice::<f32>().unwrap(), &[7., 7., 3.]);
    }

    #[test]
    fn gather_scatter_strided() {
        let desc = MemoryDesc::channels_last([1, 2, 1, 2], ScalarType::I8);
        let mut buffer = Buffer::zeros(ScalarType::I8, desc.len());
        scatter_f32(&mut buffer, &desc, 0, &[1., 2., 300., -4.4]).unwrap();
        assert_eq!(buffer.as_slice::<i8>().unwrap(), &[1, 127, 2, -4]);
        assert_eq!(
            gather_f32(&buffer, &desc, 0).unwrap(),
            vec![1., 2., 127., -4.]
        );
    }
}
