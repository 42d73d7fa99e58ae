//! Derivative values and the storage that maps handles to them.
//!
//! The evaluation sweeps are generic over two things:
//!
//! - [`Gradient`]: the derivative carried per handle, either a scalar `T` or
//!   a fixed-size [`Direction`] for vector mode.
//! - [`AdjointStorage`]: the handle-to-derivative mapping. The default is the
//!   resizable [`DerivativeVector`]; callers can pass their own storage (for
//!   example a pre-partitioned or synchronized one) as long as it honours the
//!   read/clear/add/set write points.

use crate::index::{Identifier, IndexManager};
use crate::real::Real;
use std::fmt::Debug;
use std::ops::{Index, IndexMut};

/// Derivative value attached to one handle.
pub trait Gradient<T>: Copy + Debug + PartialEq + 'static {
    /// Number of directions carried.
    const DIM: usize;

    /// The zero derivative.
    fn zero() -> Self;

    /// Check whether every component is zero.
    fn is_zero(&self) -> bool;

    /// `self += factor * other`.
    fn add_scaled(&mut self, factor: T, other: &Self);

    /// Component `dim`.
    fn component(&self, dim: usize) -> T;

    /// Mutable component `dim`.
    fn component_mut(&mut self, dim: usize) -> &mut T;
}

macro_rules! impl_scalar_gradient {
    ($t:ty) => {
        impl Gradient<$t> for $t {
            const DIM: usize = 1;

            #[inline]
            fn zero() -> Self {
                0.0
            }

            #[inline]
            fn is_zero(&self) -> bool {
                *self == 0.0
            }

            #[inline]
            fn add_scaled(&mut self, factor: $t, other: &Self) {
                *self += factor * *other;
            }

            #[inline]
            fn component(&self, _dim: usize) -> $t {
                *self
            }

            #[inline]
            fn component_mut(&mut self, _dim: usize) -> &mut $t {
                self
            }
        }
    };
}

impl_scalar_gradient!(f64);
impl_scalar_gradient!(f32);

/// Fixed-size derivative direction for vector mode.
///
/// Evaluating with `Direction<T, N>` propagates `N` seeds in one sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Direction<T: Real, const N: usize>([T; N]);

impl<T: Real, const N: usize> Direction<T, N> {
    /// Create a direction from its components.
    pub fn new(components: [T; N]) -> Self {
        Self(components)
    }

    /// Unit direction along `dim`.
    pub fn unit(dim: usize) -> Self {
        let mut components = [T::zero(); N];
        components[dim] = T::one();
        Self(components)
    }

    /// Components as an array.
    pub fn components(&self) -> &[T; N] {
        &self.0
    }
}

impl<T: Real, const N: usize> Default for Direction<T, N> {
    fn default() -> Self {
        Self([T::zero(); N])
    }
}

impl<T: Real, const N: usize> Index<usize> for Direction<T, N> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        &self.0[i]
    }
}

impl<T: Real, const N: usize> IndexMut<usize> for Direction<T, N> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        &mut self.0[i]
    }
}

impl<T: Real, const N: usize> Gradient<T> for Direction<T, N> {
    const DIM: usize = N;

    fn zero() -> Self {
        Self::default()
    }

    fn is_zero(&self) -> bool {
        self.0.iter().all(|&c| c == T::zero())
    }

    #[inline]
    fn add_scaled(&mut self, factor: T, other: &Self) {
        for (lhs, &rhs) in self.0.iter_mut().zip(other.0.iter()) {
            *lhs += factor * rhs;
        }
    }

    fn component(&self, dim: usize) -> T {
        self.0[dim]
    }

    fn component_mut(&mut self, dim: usize) -> &mut T {
        &mut self.0[dim]
    }
}

/// Mapping from handles to derivatives used by the evaluation sweeps.
///
/// The sweeps only touch storage through these calls, at fixed points:
/// reverse reads and clears the output, then adds into each argument;
/// forward sets the output. The passive handle is never written.
pub trait AdjointStorage<T: Real, G: Gradient<T>> {
    /// Grow so that handles up to `largest` are addressable.
    fn ensure_size(&mut self, largest: usize);

    /// Derivative of `id` (zero for unknown or passive handles).
    fn read(&self, id: Identifier) -> G;

    /// Overwrite the derivative of `id`.
    fn set(&mut self, id: Identifier, value: G);

    /// `derivative[id] += factor * value`.
    fn add_scaled(&mut self, id: Identifier, factor: T, value: &G);

    /// Zero the derivative of `id`.
    fn clear(&mut self, id: Identifier) {
        self.set(id, G::zero());
    }
}

/// Resizable handle-to-derivative vector.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeVector<G> {
    data: Vec<G>,
}

impl<G: Copy> DerivativeVector<G> {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Number of addressable slots.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether no slot is allocated.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slots as a slice, indexed by `Identifier::index`.
    pub fn as_slice(&self) -> &[G] {
        &self.data
    }

    /// Mutable slots.
    pub fn as_mut_slice(&mut self) -> &mut [G] {
        &mut self.data
    }
}

impl<G: Copy + Default> DerivativeVector<G> {
    /// Grow so that every handle `indices` has issued is addressable.
    pub fn resize_for<I: IndexManager>(&mut self, indices: &I) {
        let len = indices.largest_issued() as usize + 1;
        if self.data.len() < len {
            self.data.resize(len, G::default());
        }
    }
}

impl<G: Copy> Default for DerivativeVector<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real, G: Gradient<T>> AdjointStorage<T, G> for DerivativeVector<G> {
    fn ensure_size(&mut self, largest: usize) {
        if self.data.len() <= largest {
            self.data.resize(largest + 1, G::zero());
        }
    }

    #[inline]
    fn read(&self, id: Identifier) -> G {
        self.data.get(id.index()).copied().unwrap_or_else(G::zero)
    }

    #[inline]
    fn set(&mut self, id: Identifier, value: G) {
        if !id.is_active() {
            return;
        }
        if let Some(slot) = self.data.get_mut(id.index()) {
            *slot = value;
        }
    }

    #[inline]
    fn add_scaled(&mut self, id: Identifier, factor: T, value: &G) {
        if !id.is_active() {
            return;
        }
        if let Some(slot) = self.data.get_mut(id.index()) {
            slot.add_scaled(factor, value);
        }
    }
}

impl<G> Index<Identifier> for DerivativeVector<G> {
    type Output = G;

    fn index(&self, id: Identifier) -> &G {
        &self.data[id.index()]
    }
}

impl<G> IndexMut<Identifier> for DerivativeVector<G> {
    fn index_mut(&mut self, id: Identifier) -> &mut G {
        &mut self.data[id.index()]
    }
}
