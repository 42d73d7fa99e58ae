//! Real scalar trait for primal values and derivatives.

use crate::storage::Gradient;
use faer_traits::ComplexField;
use std::fmt::{Debug, Display};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};
use std::str::FromStr;

/// Trait for the floating-point types a tape can record.
///
/// This wraps faer's `ComplexField` (so preaccumulated Jacobians can live in
/// a `faer::Mat`) with the arithmetic and elementary functions the
/// evaluation sweeps and operation kernels need. Every real type is also its
/// own scalar [`Gradient`], which provides `zero()`.
pub trait Real:
    ComplexField
    + Gradient<Self>
    + Copy
    + Debug
    + Display
    + Default
    + PartialOrd
    + FromStr
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + 'static
{
    /// Returns the multiplicative identity (one).
    fn one() -> Self;

    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
    fn powf(self, exponent: Self) -> Self;
    fn atan2(self, other: Self) -> Self;
}

macro_rules! impl_real {
    ($t:ty) => {
        impl Real for $t {
            fn one() -> Self {
                1.0
            }

            fn sin(self) -> Self {
                <$t>::sin(self)
            }

            fn cos(self) -> Self {
                <$t>::cos(self)
            }

            fn tan(self) -> Self {
                <$t>::tan(self)
            }

            fn exp(self) -> Self {
                <$t>::exp(self)
            }

            fn ln(self) -> Self {
                <$t>::ln(self)
            }

            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }

            fn tanh(self) -> Self {
                <$t>::tanh(self)
            }

            fn abs(self) -> Self {
                <$t>::abs(self)
            }

            fn powf(self, exponent: Self) -> Self {
                <$t>::powf(self, exponent)
            }

            fn atan2(self, other: Self) -> Self {
                <$t>::atan2(self, other)
            }
        }
    };
}

impl_real!(f64);
impl_real!(f32);
