//! Signatures keying the primitive caches.

use crate::{
    memory::{Layout, MemoryDesc},
    scalar::ScalarType,
    tensor::Tensor,
};
use std::hash::{Hash, Hasher};

/// An order sensitive fold of parameters and descriptors.
///
/// Equality compares every element, the hash is only used to bucket.
#[derive(Clone, Debug, Default)]
pub struct OpSignature {
    eles: Vec<u64>,
    hash: u64,
}

impl OpSignature {
    /// An empty signature.
    pub fn new() -> Self {
        Self::default()
    }
    /// Appends `value`.
    pub fn add<S: Sign + ?Sized>(&mut self, value: &S) -> &mut Self {
        value.sign(self);
        self
    }
    /// Appends a single element.
    pub fn push(&mut self, x: u64) {
        // FNV style mixing, order sensitive
        self.hash = (self.hash ^ x).wrapping_mul(0x100_0000_01b3).rotate_left(5);
        self.eles.push(x);
    }
    /// The accumulated hash.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.eles.len()
    }
    /// Whether nothing was added.
    pub fn is_empty(&self) -> bool {
        self.eles.is_empty()
    }
}

impl PartialEq for OpSignature {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.eles == other.eles
    }
}

impl Eq for OpSignature {}

impl Hash for OpSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Values that can be folded into an [`OpSignature`].
pub trait Sign {
    /// Appends self to `sig`.
    fn sign(&self, sig: &mut OpSignature);
}

impl Sign for bool {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(*self as u64);
    }
}

impl Sign for usize {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(*self as u64);
    }
}

impl Sign for i32 {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(*self as i64 as u64);
    }
}

impl Sign for f32 {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(self.to_bits() as u64);
    }
}

impl Sign for f64 {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(self.to_bits());
    }
}

impl<T: Sign> Sign for [T] {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(self.len() as u64);
        for x in self {
            x.sign(sig);
        }
    }
}

impl<T: Sign> Sign for Vec<T> {
    fn sign(&self, sig: &mut OpSignature) {
        self.as_slice().sign(sig);
    }
}

impl<T: Sign> Sign for Option<T> {
    fn sign(&self, sig: &mut OpSignature) {
        match self {
            Some(x) => {
                sig.push(1);
                x.sign(sig);
            }
            None => sig.push(0),
        }
    }
}

impl<T: Sign + ?Sized> Sign for &T {
    fn sign(&self, sig: &mut OpSignature) {
        (**self).sign(sig);
    }
}

impl Sign for ScalarType {
    fn sign(&self, sig: &mut OpSignature) {
        sig.push(self.id());
    }
}

impl Sign for Layout {
    fn sign(&self, sig: &mut OpSignature) {
        match self {
            Layout::Any => sig.push(0),
            Layout::Strided(strides) => {
                sig.push(1);
                strides.sign(sig);
            }
            Layout::Blocked { block } => {
                sig.push(2);
                block.sign(sig);
            }
        }
    }
}

impl Sign for MemoryDesc {
    fn sign(&self, sig: &mut OpSignature) {
        self.dims().sign(sig);
        self.scalar_type().sign(sig);
        self.layout().sign(sig);
    }
}

impl Sign for Tensor {
    fn sign(&self, sig: &mut OpSignature) {
        self.desc().sign(sig);
        self.is_view().sign(sig);
    }
}
