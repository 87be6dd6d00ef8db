use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Index of a loop axis within an iteration space.
pub type AxisId = u8;

pub const MAX_RANK: usize = 8;

/// The largest extent a dimension may take. A [DimRange] reaching this value is
/// treated as unbounded.
pub const DIM_MAX: u64 = i32::MAX as u64;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::EnumIter,
    strum::EnumString,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    #[strum(serialize = "i8")]
    Int8,
    #[strum(serialize = "u8")]
    Uint8,
    #[strum(serialize = "f16")]
    Float16,
    #[strum(serialize = "bf16")]
    Bfloat16,
    #[strum(serialize = "i32")]
    Int32,
    #[strum(serialize = "f32")]
    Float32,
}

/// The extent of one tensor dimension: either a concrete size (`min == max`) or
/// a symbolic range bound at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DimRange {
    min: u64,
    max: u64,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Int8 | Dtype::Uint8 => 1,
            Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Int32 | Dtype::Float32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Dtype::Float16 | Dtype::Bfloat16 | Dtype::Float32)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::Int8 => write!(f, "i8"),
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Int32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

impl DimRange {
    /// Creates a range. Panics if `1 <= min <= max <= DIM_MAX` does not hold; use
    /// [DimRange::try_new] for unvalidated input.
    pub fn new(min: u64, max: u64) -> Self {
        Self::try_new(min, max)
            .unwrap_or_else(|| panic!("invalid dimension range [{min},{max}]"))
    }

    pub fn try_new(min: u64, max: u64) -> Option<Self> {
        if min == 0 || min > max || max > DIM_MAX {
            return None;
        }
        Some(DimRange { min, max })
    }

    pub fn known(size: u64) -> Self {
        DimRange::new(size, size)
    }

    pub fn unbounded(min: u64) -> Self {
        DimRange::new(min, DIM_MAX)
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn is_known(&self) -> bool {
        self.min == self.max
    }

    pub fn is_unbounded(&self) -> bool {
        self.max == DIM_MAX
    }

    pub fn contains(&self, size: u64) -> bool {
        self.min <= size && size <= self.max
    }

    pub fn contains_range(&self, other: &DimRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn intersect(&self, other: &DimRange) -> Option<DimRange> {
        DimRange::try_new(self.min.max(other.min), self.max.min(other.max))
    }

    /// Returns this range clamped to `[lo, hi]`, or `None` if they do not overlap.
    pub fn clamp_to(&self, lo: u64, hi: u64) -> Option<DimRange> {
        DimRange::try_new(self.min.max(lo), self.max.min(hi))
    }

    /// The range of element counts of a tensor whose dimensions range over `dims`.
    ///
    /// Saturates at [DIM_MAX].
    pub fn product<'a, I>(dims: I) -> DimRange
    where
        I: IntoIterator<Item = &'a DimRange>,
    {
        let (min, max) = dims.into_iter().fold((1u64, 1u64), |(lo, hi), d| {
            (
                lo.saturating_mul(d.min).min(DIM_MAX),
                hi.saturating_mul(d.max).min(DIM_MAX),
            )
        });
        DimRange { min, max }
    }
}

impl Display for DimRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}", self.min)
        } else if self.is_unbounded() {
            write!(f, "[{},-]", self.min)
        } else {
            write!(f, "[{},{}]", self.min, self.max)
        }
    }
}

/// Formats a shape range as `a x b x c`.
pub fn shape_range_string(dims: &[DimRange]) -> String {
    dims.iter().join(" x ")
}

/// Product of concrete extents, saturating at `u64::MAX`.
pub fn saturating_volume(dims: &[u64]) -> u64 {
    dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
}
