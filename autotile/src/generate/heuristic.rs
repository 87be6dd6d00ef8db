use std::cmp::Ordering;

use crate::axis::AxisInfo;
use crate::common::saturating_volume;

/// Rough cycles to launch one on-chip tile: DMA setup plus pipeline drain.
const TILE_OVERHEAD: u64 = 200;

/// Extent assumed for a symbolic dimension when estimating costs.
const REPRESENTATIVE_EXTENT: u64 = 1024;

/// A (block axis, ub axis) candidate for a reduce-family case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SplitPair {
    pub block: Option<usize>,
    pub ub: usize,
}

pub struct SplitContext<'a> {
    pub axes: &'a [AxisInfo],
    pub cores: u32,
    /// The most elements one tile may hold.
    pub tile_cap: u64,
}

/// Orders legal split pairs. Pairs are sorted by [SplitHeuristic::estimate],
/// and equal estimates by [SplitHeuristic::tie_break].
pub trait SplitHeuristic: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, ctx: &SplitContext, pair: SplitPair) -> u64;

    /// Returns [Ordering::Less] if `lhs` should be tried before `rhs`.
    fn tie_break(&self, lhs: SplitPair, rhs: SplitPair) -> Ordering;
}

/// Estimates per-core cycles at a representative shape and prefers splits
/// closest to the innermost, contiguous axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct InnermostContiguous;

impl SplitHeuristic for InnermostContiguous {
    fn name(&self) -> &'static str {
        "innermost-contiguous"
    }

    fn estimate(&self, ctx: &SplitContext, pair: SplitPair) -> u64 {
        let dims = ctx
            .axes
            .iter()
            .map(|a| REPRESENTATIVE_EXTENT.clamp(a.extent.min(), a.extent.max()))
            .collect::<Vec<_>>();
        let inner = saturating_volume(&dims[pair.ub + 1..]);
        if inner > ctx.tile_cap {
            return u64::MAX;
        }
        let ub_factor = (ctx.tile_cap / inner).clamp(1, dims[pair.ub]);
        let ub_tiles = divrem::DivCeil::div_ceil(dims[pair.ub], ub_factor);
        let outer = saturating_volume(&dims[..pair.ub]);
        let parallel = match pair.block {
            Some(b) => saturating_volume(&dims[..=b]).min(u64::from(ctx.cores)),
            None => 1,
        };
        let iterations = divrem::DivCeil::div_ceil(outer, parallel.max(1)).saturating_mul(ub_tiles);
        iterations.saturating_mul(TILE_OVERHEAD + ub_factor * inner)
    }

    fn tie_break(&self, lhs: SplitPair, rhs: SplitPair) -> Ordering {
        rhs.ub
            .cmp(&lhs.ub)
            .then_with(|| rhs.block.cmp(&lhs.block))
    }
}

/// Sorts `pairs` in place by estimated cost, then by the heuristic's tie-break.
pub(crate) fn rank_pairs(heuristic: &dyn SplitHeuristic, ctx: &SplitContext, pairs: &mut [SplitPair]) {
    pairs.sort_by(|&a, &b| {
        heuristic
            .estimate(ctx, a)
            .cmp(&heuristic.estimate(ctx, b))
            .then_with(|| heuristic.tie_break(a, b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisRole;
    use crate::common::DimRange;

    fn axes(extents: &[DimRange]) -> Vec<AxisInfo> {
        extents
            .iter()
            .enumerate()
            .map(|(i, &extent)| AxisInfo {
                dim_index: i as u8,
                role: if i == extents.len() - 1 {
                    AxisRole::Reduce
                } else {
                    AxisRole::Parallel
                },
                extent,
            })
            .collect()
    }

    #[test]
    fn test_oversized_inner_volume_is_infeasible() {
        let axes = axes(&[DimRange::new(1, 4096), DimRange::known(8192)]);
        let ctx = SplitContext {
            axes: &axes,
            cores: 32,
            tile_cap: 4096,
        };
        let pair = SplitPair {
            block: Some(0),
            ub: 0,
        };
        assert_eq!(InnermostContiguous.estimate(&ctx, pair), u64::MAX);
        let pair = SplitPair {
            block: Some(0),
            ub: 1,
        };
        assert!(InnermostContiguous.estimate(&ctx, pair) < u64::MAX);
    }

    #[test]
    fn test_ties_prefer_innermost() {
        let a = SplitPair {
            block: Some(0),
            ub: 2,
        };
        let b = SplitPair {
            block: Some(1),
            ub: 2,
        };
        let c = SplitPair {
            block: Some(1),
            ub: 3,
        };
        assert_eq!(InnermostContiguous.tie_break(c, a), Ordering::Less);
        assert_eq!(InnermostContiguous.tie_break(b, a), Ordering::Less);
        assert_eq!(InnermostContiguous.tie_break(a, a), Ordering::Equal);
    }

    #[test]
    fn test_rank_pairs_is_deterministic() {
        let axes = axes(&[
            DimRange::new(1, 64),
            DimRange::new(1, 64),
            DimRange::known(128),
        ]);
        let ctx = SplitContext {
            axes: &axes,
            cores: 32,
            tile_cap: 8192,
        };
        let mut pairs = vec![
            SplitPair { block: Some(0), ub: 2 },
            SplitPair { block: Some(1), ub: 2 },
        ];
        let mut again = pairs.clone();
        again.reverse();
        rank_pairs(&InnermostContiguous, &ctx, &mut pairs);
        rank_pairs(&InnermostContiguous, &ctx, &mut again);
        assert_eq!(pairs, again);
    }
}
