use crate::memory::Buffer;
use bytemuck::Pod;
use half::bf16;
use num_traits::{FromPrimitive, ToPrimitive};
use std::fmt::Debug;

mod sealed {
    use half::bf16;

    #[doc(hidden)]
    pub trait Sealed {}

    macro_rules! impl_sealed {
        ($($t:ty),+) => {
            $(
                impl Sealed for $t {}
            )+
        };
    }

    impl_sealed! {u8, i8, i32, bf16, f32}
}
use sealed::Sealed;

/// Element types supported by oxidnn.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScalarType {
    U8,
    I8,
    I32,
    BF16,
    F32,
}

impl ScalarType {
    /// Size of the type in bytes.
    pub fn size(&self) -> usize {
        use ScalarType::*;
        match self {
            U8 | I8 => 1,
            BF16 => 2,
            I32 | F32 => 4,
        }
    }
    /// Whether the type is a floating point type.
    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::BF16 | ScalarType::F32)
    }
    /// Whether the type is an 8 bit quantized type.
    pub fn is_quantized(&self) -> bool {
        matches!(self, ScalarType::U8 | ScalarType::I8)
    }
    pub(crate) fn id(&self) -> u64 {
        use ScalarType::*;
        match self {
            U8 => 1,
            I8 => 2,
            I32 => 3,
            BF16 => 4,
            F32 => 5,
        }
    }
}

/// Base trait for all scalars.
pub trait Scalar:
    Default
    + Copy
    + 'static
    + Into<ScalarElem>
    + ToPrimitive
    + FromPrimitive
    + Pod
    + PartialOrd
    + Debug
    + Send
    + Sync
    + Sealed
{
    /// The [`ScalarType`] of the scalar.
    fn scalar_type() -> ScalarType;
    /// Converts from f32, rounding half away from zero and saturating for integers.
    fn from_f32_saturating(x: f32) -> Self;
    /// Converts to f32, possibly losing precision.
    fn to_f32_lossy(self) -> f32;
    /// Wraps a vec into a [`Buffer`].
    fn into_buffer(vec: Vec<Self>) -> Buffer;
}

/// A scalar value of any [`ScalarType`].
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, derive_more::Display)]
pub enum ScalarElem {
    U8(u8),
    I8(i8),
    I32(i32),
    BF16(bf16),
    F32(f32),
}

impl ScalarElem {
    /// The [`ScalarType`] of the value.
    pub fn scalar_type(&self) -> ScalarType {
        use ScalarElem::*;
        match self {
            U8(_) => ScalarType::U8,
            I8(_) => ScalarType::I8,
            I32(_) => ScalarType::I32,
            BF16(_) => ScalarType::BF16,
            F32(_) => ScalarType::F32,
        }
    }
    /// Converts to f32, possibly losing precision.
    pub fn to_f32_lossy(&self) -> f32 {
        use ScalarElem::*;
        match *self {
            U8(x) => x.to_f32_lossy(),
            I8(x) => x.to_f32_lossy(),
            I32(x) => x.to_f32_lossy(),
            BF16(x) => x.to_f32_lossy(),
            F32(x) => x,
        }
    }
}

macro_rules! impl_scalar {
    (@Int $($t:ident => $X:ident),+) => {
        $(
            impl From<$t> for ScalarElem {
                fn from(x: $t) -> Self {
                    Self::$X(x)
                }
            }

            impl Scalar for $t {
                fn scalar_type() -> ScalarType {
                    ScalarType::$X
                }
                fn from_f32_saturating(x: f32) -> Self {
                    // float to int casts saturate, NaN maps to 0
                    x.round() as $t
                }
                fn to_f32_lossy(self) -> f32 {
                    self as f32
                }
                fn into_buffer(vec: Vec<Self>) -> Buffer {
                    Buffer::$X(vec)
                }
            }
        )+
    };
}

impl_scalar! {@Int u8 => U8, i8 => I8, i32 => I32}

impl From<bf16> for ScalarElem {
    fn from(x: bf16) -> Self {
        Self::BF16(x)
    }
}

impl Scalar for bf16 {
    fn scalar_type() -> ScalarType {
        ScalarType::BF16
    }
    fn from_f32_saturating(x: f32) -> Self {
        bf16::from_f32(x)
    }
    fn to_f32_lossy(self) -> f32 {
        self.to_f32()
    }
    fn into_buffer(vec: Vec<Self>) -> Buffer {
        Buffer::BF16(vec)
    }
}

impl From<f32> for ScalarElem {
    fn from(x: f32) -> Self {
        Self::F32(x)
    }
}

impl Scalar for f32 {
    fn scalar_type() -> ScalarType {
        ScalarType::F32
    }
    fn from_f32_saturating(x: f32) -> Self {
        x
    }
    fn to_f32_lossy(self) -> f32 {
        self
    }
    fn into_buffer(vec: Vec<Self>) -> Buffer {
        Buffer::F32(vec)
    }
}

/// Float types.
pub trait Float: Scalar + num_traits::Float {}

impl Float for bf16 {}
impl Float for f32 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_f32_saturating() {
        assert_eq!(u8::from_f32_saturating(300.), 255);
        assert_eq!(u8::from_f32_saturating(-3.), 0);
        assert_eq!(i8::from_f32_saturating(-200.), -128);
        assert_eq!(i8::from_f32_saturating(2.5), 3);
        assert_eq!(i8::from_f32_saturating(-2.5), -3);
        assert_eq!(i32::from_f32_saturating(f32::NAN), 0);
        assert_eq!(f32::from_f32_saturating(1.25), 1.25);
    }

    #[test]
    fn scalar_type_size() {
        assert_eq!(ScalarType::U8.size(), 1);
        assert_eq!(ScalarType::BF16.size(), 2);
        assert_eq!(ScalarType::F32.size(), 4);
        assert_eq!(<bf16 as Scalar>::scalar_type(), ScalarType::BF16);
    }
}
