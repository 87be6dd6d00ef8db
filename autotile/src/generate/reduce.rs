use log::debug;

use crate::axis::{first_reduce_axis, iteration_axes, primary_reduce, AxisInfo};
use crate::case::{Constraint, FactorBound, ShapeRegion, SpecialPattern, TilingCase};
use crate::classify::Pattern;
use crate::dag::{ComputeDag, NodeId, NodeKind, ReduceOp};
use crate::generate::heuristic::{rank_pairs, SplitContext, SplitHeuristic, SplitPair};
use crate::storage::{ub_capacity_elems, BufferPolicy};
use crate::target::Target;

/// The buffer policy of reduce-family tiles: one accumulator beyond the DAG's
/// own intermediates, and for workspace norm cases one reload and one partial
/// buffer per reduce.
pub(crate) fn reduce_policy(dag: &ComputeDag, special: SpecialPattern) -> BufferPolicy {
    let policy = BufferPolicy::SINGLE.with_extra(1);
    if special == SpecialPattern::NormWorkspace {
        let reduces = dag
            .nodes()
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Reduce { .. }))
            .count() as u32;
        policy.with_extra(2 * reduces)
    } else {
        policy
    }
}

/// Whether the reduce node may accumulate straight into global memory with
/// atomic adds.
pub(crate) fn atomic_eligible<Tgt: Target>(dag: &ComputeDag, pattern: Pattern, r: NodeId) -> bool {
    let node = dag.node(r);
    matches!(pattern, Pattern::KnownReduce | Pattern::UnknownReduce)
        && matches!(
            node.kind,
            NodeKind::Reduce {
                op: ReduceOp::Sum,
                ..
            }
        )
        && node.flags.atomic_capable
        && Tgt::supports_atomic_add(node.dtype)
        && dag.is_output(r)
        && dag.consumers(r).is_empty()
}

/// Cases for one reduce-axis assignment of a reduce-family DAG.
///
/// `mask` selects the reduce axes of a dynamic-axis reduce and tags every
/// region with it.
pub(super) fn reduce_cases<Tgt: Target>(
    dag: &ComputeDag,
    pattern: Pattern,
    mask: Option<u32>,
    heuristic: &dyn SplitHeuristic,
) -> Vec<TilingCase> {
    let Some(r) = primary_reduce(dag) else {
        return vec![];
    };
    let axes = iteration_axes(dag, pattern, mask);
    let Some(first_r) = first_reduce_axis(&axes) else {
        return vec![];
    };
    let dims = axes.iter().map(|a| a.extent).collect::<Vec<_>>();
    let whole = ShapeRegion::new(dims.clone()).with_reduce_mask(mask);
    let cap = ub_capacity_elems::<Tgt>(dag, reduce_policy(dag, SpecialPattern::Standard));
    let ctx = SplitContext {
        axes: &axes,
        cores: Tgt::core_count(),
        tile_cap: cap,
    };

    let fits = |u: usize| {
        let inner_min = dims[u + 1..]
            .iter()
            .fold(1u64, |acc, d| acc.saturating_mul(d.min()));
        cap > 0 && inner_min <= cap
    };
    let block_candidates = if first_r == 0 {
        vec![None]
    } else {
        (0..first_r).map(Some).collect::<Vec<_>>()
    };

    let mut pairs = vec![];
    for &b in &block_candidates {
        let ub_range = if pattern == Pattern::Norm {
            b.unwrap_or(0)..first_r
        } else {
            first_r..axes.len()
        };
        pairs.extend(ub_range.filter(|&u| fits(u)).map(|ub| SplitPair { block: b, ub }));
    }
    rank_pairs(heuristic, &ctx, &mut pairs);

    let mut cases = vec![];
    if atomic_eligible::<Tgt>(dag, pattern, r) {
        let mut atomic_pairs = (first_r..axes.len())
            .filter(|&u| fits(u))
            .map(|ub| SplitPair {
                block: Some(first_r),
                ub,
            })
            .collect::<Vec<_>>();
        rank_pairs(heuristic, &ctx, &mut atomic_pairs);
        let outer_max = u64::from(Tgt::core_count()).saturating_sub(1).max(1);
        cases.extend(atomic_pairs.into_iter().map(|pair| TilingCase {
            is_atomic: true,
            region: split_region(&whole, pair, cap).with_constraint(Constraint::OuterVolume {
                to_axis: first_r as u8,
                max: outer_max,
            }),
            ..split_case(pattern, &axes, pair, cap, &whole)
        }));
    }
    cases.extend(
        pairs
            .into_iter()
            .map(|pair| split_case(pattern, &axes, pair, cap, &whole)),
    );

    if pattern == Pattern::Norm {
        let last_r = axes.iter().rposition(AxisInfo::is_reduce).unwrap_or(first_r);
        let ws_cap = ub_capacity_elems::<Tgt>(dag, reduce_policy(dag, SpecialPattern::NormWorkspace));
        if ws_cap > 0 && dims[last_r + 1..].iter().fold(1u64, |acc, d| acc.saturating_mul(d.min())) <= ws_cap {
            for &b in &block_candidates {
                let pair = SplitPair { block: b, ub: last_r };
                cases.push(TilingCase {
                    special: SpecialPattern::NormWorkspace,
                    ..split_case(pattern, &axes, pair, ws_cap, &whole)
                });
            }
        }
    }
    debug!(
        "{} reduce cases for mask {:?} (first reduce axis {})",
        cases.len(),
        mask,
        first_r
    );
    cases
}

fn split_region(whole: &ShapeRegion, pair: SplitPair, cap: u64) -> ShapeRegion {
    whole.clone().with_constraint(Constraint::InnerVolume {
        from_axis: pair.ub as u8 + 1,
        max: cap,
    })
}

fn split_case(
    pattern: Pattern,
    axes: &[AxisInfo],
    pair: SplitPair,
    cap: u64,
    whole: &ShapeRegion,
) -> TilingCase {
    TilingCase {
        pattern,
        block_split_axis: pair.block.map(|b| b as u8),
        block_factor_bound: pair
            .block
            .map_or(FactorBound::UNIT, |b| FactorBound::new(1, axes[b].extent.max())),
        ub_split_axis: Some(pair.ub as u8),
        ub_factor_bound: FactorBound::new(1, cap),
        is_atomic: false,
        is_db: false,
        special: SpecialPattern::Standard,
        region: split_region(whole, pair, cap),
    }
}
