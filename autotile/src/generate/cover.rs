use itertools::Itertools;

use crate::case::{Constraint, ShapeRegion};
use crate::common::DimRange;

/// Grid cells examined before the check gives up and reports the declared box
/// as not certified.
pub const MAX_COVER_CELLS: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverCheck {
    Covered,
    /// Low corner of a cell no single region holds on.
    Gap(Vec<u64>),
    TooManyCells,
}

/// Checks that every shape in `dims` matches at least one of `regions`.
///
/// The box is cut into cells at every region bound (and, on rank-1 spaces, at
/// every constraint threshold). A cell is covered only when one region contains
/// it and all of that region's constraints hold at the cell's upper corner.
/// Constraints are monotone, so a reported cover is exact; a reported gap may
/// be spurious when a constraint's threshold falls inside a cell.
pub fn check_cover(dims: &[DimRange], regions: &[&ShapeRegion]) -> CoverCheck {
    let regions = regions
        .iter()
        .filter(|r| r.rank() == dims.len())
        .collect::<Vec<_>>();
    let cuts = dims
        .iter()
        .enumerate()
        .map(|(axis, extent)| axis_cells(axis, extent, dims.len(), &regions))
        .collect::<Vec<_>>();
    let cell_count = cuts
        .iter()
        .try_fold(1usize, |acc, c| acc.checked_mul(c.len()));
    if cell_count.map_or(true, |n| n > MAX_COVER_CELLS) {
        return CoverCheck::TooManyCells;
    }

    for cell in cuts.iter().multi_cartesian_product() {
        let lo = cell.iter().map(|c| c.min()).collect::<Vec<_>>();
        let hi = cell.iter().map(|c| c.max()).collect::<Vec<_>>();
        let covered = regions.iter().any(|r| {
            r.dims.iter().zip(&cell).all(|(d, c)| d.contains_range(c))
                && r.constraints.iter().all(|c| c.holds(&hi))
        });
        if !covered {
            return CoverCheck::Gap(lo);
        }
    }
    CoverCheck::Covered
}

pub fn verify_cover(dims: &[DimRange], regions: &[&ShapeRegion]) -> bool {
    check_cover(dims, regions) == CoverCheck::Covered
}

fn axis_cells(axis: usize, extent: &DimRange, rank: usize, regions: &[&&ShapeRegion]) -> Vec<DimRange> {
    let mut starts = vec![extent.min()];
    for r in regions {
        let d = r.dims[axis];
        starts.push(d.min());
        starts.push(d.max().saturating_add(1));
        if rank == 1 {
            starts.extend(r.constraints.iter().filter_map(rank1_threshold));
        }
    }
    starts.retain(|&s| extent.min() <= s && s <= extent.max());
    starts.sort_unstable();
    starts.dedup();
    starts
        .iter()
        .enumerate()
        .map(|(i, &lo)| {
            let hi = starts.get(i + 1).map_or(extent.max(), |&next| next - 1);
            DimRange::new(lo, hi)
        })
        .collect()
}

/// The smallest extent violating `c` on a rank-1 space.
fn rank1_threshold(c: &Constraint) -> Option<u64> {
    match *c {
        Constraint::InnerVolume { from_axis: 0, max } => Some(max.saturating_add(1)),
        Constraint::OuterVolume { to_axis, max } if to_axis >= 1 => Some(max.saturating_add(1)),
        Constraint::PerCoreTile { cores, max, .. } => {
            Some(max.saturating_mul(u64::from(cores.max(1))).saturating_add(1))
        }
        _ => None,
    }
}
