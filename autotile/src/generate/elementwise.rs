use crate::axis::{iteration_axes, AxisInfo};
use crate::case::{Constraint, FactorBound, ShapeRegion, SpecialPattern, TilingCase};
use crate::classify::Pattern;
use crate::common::{saturating_volume, DimRange};
use crate::dag::ComputeDag;
use crate::storage::{ub_capacity_elems, BufferPolicy};
use crate::target::Target;

/// Elements below which splitting across cores does not pay: one block per core.
pub(crate) fn single_core_threshold<Tgt: Target>(dag: &ComputeDag) -> u64 {
    u64::from(Tgt::core_count()) * u64::from(Tgt::block_bytes()) / u64::from(dag.max_dtype_size())
}

fn case(pattern: Pattern, region: ShapeRegion) -> TilingCase {
    TilingCase {
        pattern,
        block_split_axis: None,
        block_factor_bound: FactorBound::UNIT,
        ub_split_axis: None,
        ub_factor_bound: FactorBound::UNIT,
        is_atomic: false,
        is_db: false,
        special: SpecialPattern::Standard,
        region,
    }
}

/// Cases over the single fused axis of an elementwise-only DAG: a single-core
/// case for small extents, then a block-only and a block-plus-ub case.
pub(super) fn elementwise_cases<Tgt: Target>(dag: &ComputeDag) -> Vec<TilingCase> {
    let pattern = Pattern::ElementwiseOnly;
    let extent = iteration_axes(dag, pattern, None)[0].extent;
    let cores = Tgt::core_count();
    let threshold = single_core_threshold::<Tgt>(dag);
    let cap = ub_capacity_elems::<Tgt>(dag, BufferPolicy::SINGLE);
    let cap_db = ub_capacity_elems::<Tgt>(dag, BufferPolicy::DOUBLE);
    let min_per_core = divrem::DivCeil::div_ceil(threshold, u64::from(cores)).max(1);

    let mut cases = vec![];
    if let Some(small) = extent.clamp_to(1, threshold.saturating_sub(1)) {
        cases.push(TilingCase {
            special: SpecialPattern::SingleCore,
            ..case(pattern, ShapeRegion::new(vec![small]))
        });
    }
    let Some(large) = extent.clamp_to(threshold, u64::MAX) else {
        return cases;
    };
    if cap >= min_per_core {
        cases.push(TilingCase {
            block_split_axis: Some(0),
            block_factor_bound: FactorBound::new(min_per_core, cap),
            ..case(
                pattern,
                ShapeRegion::new(vec![large]).with_constraint(Constraint::PerCoreTile {
                    block_axis: 0,
                    cores,
                    max: cap,
                }),
            )
        });
    }
    if cap_db > 0 {
        let max_per_core = divrem::DivCeil::div_ceil(large.max(), u64::from(cores));
        cases.push(TilingCase {
            block_split_axis: Some(0),
            block_factor_bound: FactorBound::new(min_per_core.min(max_per_core), max_per_core),
            ub_split_axis: Some(0),
            ub_factor_bound: FactorBound::new(1, cap_db),
            is_db: true,
            ..case(pattern, ShapeRegion::new(vec![large]))
        });
    }
    cases
}

/// Cases over the output axes of a broadcasting DAG.
pub(super) fn broadcast_cases<Tgt: Target>(dag: &ComputeDag) -> Vec<TilingCase> {
    let pattern = Pattern::PureBroadcast;
    let axes = iteration_axes(dag, pattern, None);
    let dims = axes.iter().map(|a| a.extent).collect::<Vec<_>>();
    let cores = Tgt::core_count();
    let threshold = single_core_threshold::<Tgt>(dag);
    let cap = ub_capacity_elems::<Tgt>(dag, BufferPolicy::SINGLE);
    let cap_db = ub_capacity_elems::<Tgt>(dag, BufferPolicy::DOUBLE);
    let min_volume = DimRange::product(&dims).min();
    let whole = ShapeRegion::new(dims.clone());

    let mut cases = vec![];
    if min_volume < threshold {
        cases.push(TilingCase {
            special: SpecialPattern::SingleCore,
            ..case(
                pattern,
                whole.clone().with_constraint(Constraint::InnerVolume {
                    from_axis: 0,
                    max: threshold - 1,
                }),
            )
        });
    }
    let block_bound = FactorBound::new(1, dims[0].max());
    if cap > 0 {
        cases.push(TilingCase {
            block_split_axis: Some(0),
            block_factor_bound: block_bound,
            ..case(
                pattern,
                whole.clone().with_constraint(Constraint::PerCoreTile {
                    block_axis: 0,
                    cores,
                    max: cap,
                }),
            )
        });
    }
    if cap_db > 0 {
        let ub = broadcast_ub_axis(&axes, cap_db);
        cases.push(TilingCase {
            block_split_axis: Some(0),
            block_factor_bound: block_bound,
            ub_split_axis: Some(ub as u8),
            ub_factor_bound: FactorBound::new(1, cap_db),
            is_db: true,
            ..case(
                pattern,
                whole.with_constraint(Constraint::InnerVolume {
                    from_axis: ub as u8 + 1,
                    max: cap_db,
                }),
            )
        });
    }
    cases
}

/// The outermost axis after the block axis whose inner volume fits `cap` at the
/// declared maxima, or the innermost axis.
fn broadcast_ub_axis(axes: &[AxisInfo], cap: u64) -> usize {
    let maxima = axes.iter().map(|a| a.extent.max()).collect::<Vec<_>>();
    if axes.len() == 1 {
        return 0;
    }
    (1..axes.len())
        .find(|&u| saturating_volume(&maxima[u + 1..]) <= cap)
        .unwrap_or(axes.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dag::ElemOp;
    use crate::target::CloudTarget;

    fn add(extent: DimRange) -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![extent], Dtype::Float32);
        let y = b.placeholder(vec![extent], Dtype::Float32);
        let z = b.elementwise(ElemOp::Add, &[x, y]);
        b.output(z);
        b.build().unwrap()
    }

    #[test]
    fn test_threshold() {
        assert_eq!(single_core_threshold::<CloudTarget>(&add(DimRange::known(8))), 256);
    }

    #[test]
    fn test_small_extent_is_single_core_only() {
        let cases = elementwise_cases::<CloudTarget>(&add(DimRange::new(1, 100)));
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].special, SpecialPattern::SingleCore);
        assert_eq!(cases[0].region.dims, vec![DimRange::new(1, 100)]);
    }

    #[test]
    fn test_large_extent_skips_single_core() {
        let cases = elementwise_cases::<CloudTarget>(&add(DimRange::new(4096, 1 << 20)));
        assert_eq!(cases.len(), 2);
        assert!(cases.iter().all(|c| c.block_split_axis == Some(0)));
        assert!(cases[1].is_db);
    }

    #[test]
    fn test_broadcast_ub_axis_bounds_inner_volume() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(
            vec![DimRange::new(1, 64), DimRange::new(1, 64), DimRange::known(256)],
            Dtype::Float16,
        );
        let y = b.placeholder(vec![DimRange::known(256)], Dtype::Float16);
        let z = b.elementwise(ElemOp::Add, &[x, y]);
        b.output(z);
        let dag = b.build().unwrap();
        let cases = broadcast_cases::<CloudTarget>(&dag);
        assert_eq!(cases.len(), 3);
        let db = &cases[2];
        assert_eq!(db.ub_split_axis, Some(1));
        assert_eq!(
            db.region.constraints,
            vec![Constraint::InnerVolume {
                from_axis: 2,
                max: db.ub_factor_bound.max
            }]
        );
    }
}
