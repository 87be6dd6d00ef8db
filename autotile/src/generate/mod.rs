mod cover;
mod elementwise;
mod heuristic;
mod reduce;
mod window;

pub use cover::{check_cover, verify_cover, CoverCheck, MAX_COVER_CELLS};
pub use heuristic::{InnermostContiguous, SplitContext, SplitHeuristic, SplitPair};
pub use window::{height_buckets, WindowGeometry, WindowKind, WINDOW_BUCKET_CAP};

pub(crate) use elementwise::single_core_threshold;
pub(crate) use reduce::{atomic_eligible, reduce_policy};

use log::{debug, warn};

use crate::axis::iteration_axes;
use crate::case::{FactorBound, ShapeRegion, SpecialPattern, TilingCase};
use crate::classify::Pattern;
use crate::common::shape_range_string;
use crate::dag::ComputeDag;
use crate::storage::{ub_capacity_elems, BufferPolicy};
use crate::target::Target;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("No sub-generator for pattern {0} on this target")]
    NoSubGenerator(Pattern),
}

/// Enumerates the tiling cases of `dag` in runtime priority order, using the
/// default [InnermostContiguous] split heuristic.
pub fn generate_cases<Tgt: Target>(
    dag: &ComputeDag,
    pattern: Pattern,
) -> Result<Vec<TilingCase>, GenerationError> {
    generate_cases_with::<Tgt>(dag, pattern, &InnermostContiguous)
}

/// Enumerates the tiling cases of `dag` in runtime priority order.
///
/// The union of the returned regions covers the declared shape range (per
/// reduce-axis mask for dynamic-axis reduces): a [SpecialPattern::Fallback]
/// case is appended to any group the other cases do not provably cover.
pub fn generate_cases_with<Tgt: Target>(
    dag: &ComputeDag,
    pattern: Pattern,
    heuristic: &dyn SplitHeuristic,
) -> Result<Vec<TilingCase>, GenerationError> {
    let groups = match pattern {
        Pattern::ElementwiseOnly => vec![(None, elementwise::elementwise_cases::<Tgt>(dag))],
        Pattern::PureBroadcast => vec![(None, elementwise::broadcast_cases::<Tgt>(dag))],
        Pattern::KnownReduce | Pattern::Norm => vec![(
            None,
            reduce::reduce_cases::<Tgt>(dag, pattern, None, heuristic),
        )],
        Pattern::UnknownReduce => {
            let rank = iteration_axes(dag, pattern, None).len() as u32;
            (1..1u32 << rank)
                .map(|mask| {
                    let cases = reduce::reduce_cases::<Tgt>(dag, pattern, Some(mask), heuristic);
                    (Some(mask), cases)
                })
                .collect()
        }
        Pattern::Pooling | Pattern::Cube => match window::window_cases::<Tgt>(dag, pattern) {
            Some(cases) => vec![(None, cases)],
            None => return Err(GenerationError::NoSubGenerator(pattern)),
        },
    };

    let dims = iteration_axes(dag, pattern, None)
        .iter()
        .map(|a| a.extent)
        .collect::<Vec<_>>();
    let mut all = vec![];
    for (mask, mut cases) in groups {
        let regions = cases.iter().map(|c| &c.region).collect::<Vec<_>>();
        match check_cover(&dims, &regions) {
            CoverCheck::Covered => {}
            check => {
                debug!(
                    "{} cases for mask {:?} leave {} uncovered ({:?}); adding fallback",
                    cases.len(),
                    mask,
                    shape_range_string(&dims),
                    check
                );
                cases.push(fallback_case::<Tgt>(dag, pattern, &dims, mask));
            }
        }
        all.extend(cases);
    }
    if all.is_empty() {
        warn!("pattern {} produced no tiling cases", pattern);
        return Err(GenerationError::NoSubGenerator(pattern));
    }
    for case in &all {
        debug!(
            "case {}: block={:?} ub={:?} atomic={} db={} special={} region={}",
            case.tiling_key(),
            case.block_split_axis,
            case.ub_split_axis,
            case.is_atomic,
            case.is_db,
            case.special,
            case.region
        );
    }
    Ok(all)
}

/// A whole-box case with no block split and the ub split on the innermost axis.
fn fallback_case<Tgt: Target>(
    dag: &ComputeDag,
    pattern: Pattern,
    dims: &[crate::common::DimRange],
    mask: Option<u32>,
) -> TilingCase {
    let cap = match pattern {
        Pattern::ElementwiseOnly | Pattern::PureBroadcast => {
            ub_capacity_elems::<Tgt>(dag, BufferPolicy::SINGLE)
        }
        Pattern::KnownReduce | Pattern::UnknownReduce => {
            ub_capacity_elems::<Tgt>(dag, reduce_policy(dag, SpecialPattern::Standard))
        }
        Pattern::Norm => {
            ub_capacity_elems::<Tgt>(dag, reduce_policy(dag, SpecialPattern::NormWorkspace))
        }
        Pattern::Pooling | Pattern::Cube => window::fallback_cols::<Tgt>(dag, pattern),
    };
    TilingCase {
        pattern,
        block_split_axis: None,
        block_factor_bound: FactorBound::UNIT,
        ub_split_axis: Some((dims.len() - 1) as u8),
        ub_factor_bound: FactorBound::new(1, cap.max(1)),
        is_atomic: false,
        is_db: false,
        special: SpecialPattern::Fallback,
        region: ShapeRegion::new(dims.to_vec()).with_reduce_mask(mask),
    }
}
