use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::classify::Pattern;
use crate::common::{saturating_volume, shape_range_string, AxisId, DimRange};

/// An inclusive range of split factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FactorBound {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SpecialPattern {
    Standard,
    /// Shapes too small to be worth splitting across cores.
    SingleCore,
    /// Appended when the other cases leave part of the declared shape range
    /// uncovered.
    Fallback,
    /// A norm case keeping reduce results in a global workspace between passes.
    NormWorkspace,
    WindowBucket {
        kernel: [u32; 2],
        stride: [u32; 2],
        bucket: u32,
    },
}

/// A monotone predicate over concrete iteration-space extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Constraint {
    /// The product of extents from `from_axis` inward is at most `max`.
    InnerVolume { from_axis: AxisId, max: u64 },
    /// The product of extents before `to_axis` is at most `max`.
    OuterVolume { to_axis: AxisId, max: u64 },
    /// `ceil(prod(dims[..=block_axis]) / cores) * prod(dims[block_axis + 1..])`
    /// is at most `max`.
    PerCoreTile {
        block_axis: AxisId,
        cores: u32,
        max: u64,
    },
}

/// The runtime match predicate of a [TilingCase].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ShapeRegion {
    pub dims: Vec<DimRange>,
    pub constraints: Vec<Constraint>,
    /// For dynamic-axis reduces: the reduce axes this region applies to.
    pub reduce_mask: Option<u32>,
}

/// One tiling strategy for a pattern, valid over [TilingCase::region].
///
/// `block_factor_bound` counts block-axis elements per core. `ub_factor_bound`
/// counts the elements of one on-chip tile, except for window patterns where it
/// counts output positions along the ub axis per tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingCase {
    pub pattern: Pattern,
    pub block_split_axis: Option<AxisId>,
    pub block_factor_bound: FactorBound,
    pub ub_split_axis: Option<AxisId>,
    pub ub_factor_bound: FactorBound,
    pub is_atomic: bool,
    pub is_db: bool,
    pub special: SpecialPattern,
    pub region: ShapeRegion,
}

impl FactorBound {
    pub const UNIT: FactorBound = FactorBound { min: 1, max: 1 };

    pub fn new(min: u64, max: u64) -> Self {
        debug_assert!(min <= max, "empty factor bound [{min},{max}]");
        FactorBound { min, max }
    }

    pub fn contains(&self, factor: u64) -> bool {
        self.min <= factor && factor <= self.max
    }
}

impl Display for FactorBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.min, self.max)
    }
}

impl SpecialPattern {
    pub fn code(&self) -> u8 {
        match self {
            SpecialPattern::Standard => 0,
            SpecialPattern::SingleCore => 1,
            SpecialPattern::Fallback => 2,
            SpecialPattern::NormWorkspace => 3,
            SpecialPattern::WindowBucket { .. } => 4,
        }
    }
}

impl Display for SpecialPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialPattern::Standard => write!(f, "-"),
            SpecialPattern::SingleCore => write!(f, "single-core"),
            SpecialPattern::Fallback => write!(f, "fallback"),
            SpecialPattern::NormWorkspace => write!(f, "workspace"),
            SpecialPattern::WindowBucket {
                kernel,
                stride,
                bucket,
            } => write!(
                f,
                "k{}x{} s{}x{} b{}",
                kernel[0], kernel[1], stride[0], stride[1], bucket
            ),
        }
    }
}

impl Constraint {
    pub fn holds(&self, dims: &[u64]) -> bool {
        match *self {
            Constraint::InnerVolume { from_axis, max } => {
                let from = usize::from(from_axis).min(dims.len());
                saturating_volume(&dims[from..]) <= max
            }
            Constraint::OuterVolume { to_axis, max } => {
                let to = usize::from(to_axis).min(dims.len());
                saturating_volume(&dims[..to]) <= max
            }
            Constraint::PerCoreTile {
                block_axis,
                cores,
                max,
            } => {
                let split = (usize::from(block_axis) + 1).min(dims.len());
                let outer = saturating_volume(&dims[..split]);
                let per_core = divrem::DivCeil::div_ceil(outer, u64::from(cores.max(1)));
                per_core.saturating_mul(saturating_volume(&dims[split..])) <= max
            }
        }
    }

    /// The first axis whose extent the constraint reads.
    pub fn first_axis(&self) -> AxisId {
        match *self {
            Constraint::InnerVolume { from_axis, .. } => from_axis,
            Constraint::OuterVolume { .. } | Constraint::PerCoreTile { .. } => 0,
        }
    }

    pub fn max(&self) -> u64 {
        match *self {
            Constraint::InnerVolume { max, .. }
            | Constraint::OuterVolume { max, .. }
            | Constraint::PerCoreTile { max, .. } => max,
        }
    }
}

impl Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::InnerVolume { from_axis, max } => write!(f, "vol[{from_axis}..]<={max}"),
            Constraint::OuterVolume { to_axis, max } => write!(f, "vol[..{to_axis}]<={max}"),
            Constraint::PerCoreTile {
                block_axis,
                cores,
                max,
            } => write!(f, "core[{block_axis}]/{cores}<={max}"),
        }
    }
}

impl ShapeRegion {
    pub fn new(dims: Vec<DimRange>) -> Self {
        ShapeRegion {
            dims,
            constraints: vec![],
            reduce_mask: None,
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_reduce_mask(mut self, mask: Option<u32>) -> Self {
        self.reduce_mask = mask;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Whether concrete extents `dims` (and, for dynamic-axis reduces, the
    /// runtime reduce-axis mask) fall within this region.
    pub fn matches(&self, dims: &[u64], reduce_mask: Option<u32>) -> bool {
        if let Some(mask) = self.reduce_mask {
            if reduce_mask != Some(mask) {
                return false;
            }
        }
        dims.len() == self.dims.len()
            && self.dims.iter().zip(dims).all(|(r, &d)| r.contains(d))
            && self.constraints.iter().all(|c| c.holds(dims))
    }

    /// The largest number of elements one core may stage, as bounded by the
    /// region.
    pub fn max_core_volume(&self) -> u64 {
        let box_max = self.dims.iter().map(DimRange::max).collect::<Vec<_>>();
        self.constraints
            .iter()
            .filter(|c| match c {
                Constraint::InnerVolume { from_axis, .. } => *from_axis == 0,
                Constraint::PerCoreTile { .. } => true,
                Constraint::OuterVolume { .. } => false,
            })
            .map(Constraint::max)
            .chain(std::iter::once(saturating_volume(&box_max)))
            .min()
            .unwrap_or(u64::MAX)
    }
}

impl Display for ShapeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shape_range_string(&self.dims))?;
        for c in &self.constraints {
            write!(f, "; {c}")?;
        }
        if let Some(mask) = self.reduce_mask {
            write!(f, "; mask={mask:#b}")?;
        }
        Ok(())
    }
}

impl TilingCase {
    /// A stable decimal key: pattern, special pattern, block axis, ub axis,
    /// atomic and db flags, then the window bucket or reduce mask.
    pub fn tiling_key(&self) -> u64 {
        let axis_digit = |a: Option<AxisId>| a.map_or(0, |a| u64::from(a) + 1);
        let tail = match (&self.special, self.region.reduce_mask) {
            (SpecialPattern::WindowBucket { bucket, .. }, _) => u64::from(*bucket),
            (_, Some(mask)) => u64::from(mask),
            _ => 0,
        };
        let mut key = u64::from(self.pattern.code());
        key = key * 10 + u64::from(self.special.code());
        key = key * 10 + axis_digit(self.block_split_axis);
        key = key * 10 + axis_digit(self.ub_split_axis);
        key = key * 10 + u64::from(self.is_atomic);
        key = key * 10 + u64::from(self.is_db);
        key * 1000 + tail
    }

    /// The most elements of one full-rank tile.
    pub fn tile_elems(&self) -> u64 {
        if self.ub_split_axis.is_some() && !self.pattern.is_window() {
            self.ub_factor_bound.max
        } else {
            self.region.max_core_volume()
        }
    }
}
