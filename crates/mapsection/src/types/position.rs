//! Arbitrary-precision coordinates used to identify and place map sections.
//!
//! Block positions are integer vectors in units of one block; map positions
//! and sample-point deltas are dyadic rationals (`value * 2^exponent`) so that
//! deep zooms keep exact coordinates even when an `f64` would collapse.

use core::fmt;
use core::ops::Add;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

/// An integer vector of unbounded precision.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BigVector {
    pub x: BigInt,
    pub y: BigInt,
}

impl BigVector {
    pub fn new(x: impl Into<BigInt>, y: impl Into<BigInt>) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns this vector translated by a small offset, as produced when a
    /// screen is walked block by block.
    pub fn offset(&self, dx: i64, dy: i64) -> Self {
        Self {
            x: &self.x + dx,
            y: &self.y + dy,
        }
    }
}

impl fmt::Display for BigVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A dyadic rational: `value * 2^exponent`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RValue {
    pub value: BigInt,
    pub exponent: i32,
}

impl RValue {
    pub fn new(value: impl Into<BigInt>, exponent: i32) -> Self {
        Self {
            value: value.into(),
            exponent,
        }
    }

    /// Approximates `value` with `precision` fractional bits.
    ///
    /// Returns `None` for NaN or infinite inputs.
    pub fn from_f64(value: f64, precision: u8) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * f64::from(precision).exp2()).round();
        let value = BigInt::from_f64(scaled)?;
        Some(Self {
            value,
            exponent: -i32::from(precision),
        })
    }

    /// Lossy conversion used by double-precision engines.
    pub fn to_f64(&self) -> f64 {
        let mantissa = self.value.to_f64().unwrap_or(f64::NAN);
        mantissa * f64::from(self.exponent).exp2()
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Multiplies by an integer without losing precision.
    pub fn mul_int(&self, factor: &BigInt) -> Self {
        Self {
            value: &self.value * factor,
            exponent: self.exponent,
        }
    }

    /// Rewrites both operands over the smaller exponent.
    fn aligned(&self, other: &Self) -> (BigInt, BigInt, i32) {
        match self.exponent.cmp(&other.exponent) {
            core::cmp::Ordering::Equal => (self.value.clone(), other.value.clone(), self.exponent),
            core::cmp::Ordering::Greater => {
                let shift = self.exponent.abs_diff(other.exponent) as usize;
                (&self.value << shift, other.value.clone(), other.exponent)
            }
            core::cmp::Ordering::Less => {
                let shift = self.exponent.abs_diff(other.exponent) as usize;
                (self.value.clone(), &other.value << shift, self.exponent)
            }
        }
    }
}

impl Add for &RValue {
    type Output = RValue;

    fn add(self, rhs: Self) -> RValue {
        let (a, b, exponent) = self.aligned(rhs);
        RValue {
            value: a + b,
            exponent,
        }
    }
}

impl fmt::Display for RValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*2^{}", self.value, self.exponent)
    }
}

/// A point in map coordinates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RPoint {
    pub x: RValue,
    pub y: RValue,
}

impl RPoint {
    pub const fn new(x: RValue, y: RValue) -> Self {
        Self { x, y }
    }

    /// Moves the point by `steps` samples of size `delta` along each axis.
    pub fn translate(&self, steps: &BigVector, delta: &RSize) -> Self {
        Self {
            x: &self.x + &delta.width.mul_int(&steps.x),
            y: &self.y + &delta.height.mul_int(&steps.y),
        }
    }
}

/// The distance between adjacent samples in map coordinates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RSize {
    pub width: RValue,
    pub height: RValue,
}

impl RSize {
    pub const fn new(width: RValue, height: RValue) -> Self {
        Self { width, height }
    }

    pub fn square(side: RValue) -> Self {
        Self {
            width: side.clone(),
            height: side,
        }
    }
}

/// Block dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SizeInt {
    pub width: u32,
    pub height: u32,
}

impl SizeInt {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for SizeInt {
    fn default() -> Self {
        Self::new(128, 128)
    }
}

impl fmt::Display for SizeInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
