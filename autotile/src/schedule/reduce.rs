use crate::axis::{iteration_axes, primary_reduce, AxisInfo};
use crate::case::TilingCase;
use crate::dag::{ComputeDag, NodeId, NodeKind, ReduceOp};
use crate::info::topological_order;
use crate::target::BufferScope;

use super::builder::{nest, nest_split, PlanNode};
use super::{
    compute_stage, copy_out, loop_vars, tile_elems_of, tile_stages, EmitInsn, Hardware, LoopVar,
    PatternScheduler, Plan, PlannedStage, ScheduleError,
};

/// Reduces with known or runtime-selected axes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReduceScheduler;

impl PatternScheduler for ReduceScheduler {
    fn plan(&self, dag: &ComputeDag, case: &TilingCase, _hw: &Hardware) -> Result<Plan, ScheduleError> {
        let r = primary_reduce(dag).ok_or(ScheduleError::PatternMismatch(case.pattern))?;
        if !reduce_family(dag) {
            return Err(ScheduleError::PatternMismatch(case.pattern));
        }
        let axes = iteration_axes(dag, case.pattern, case.region.reduce_mask);
        let loops = loop_vars(case, &axes)?;
        let tile = case.tile_elems();
        let roots = if case.is_atomic {
            atomic_pass(dag, case, r, &loops, tile)?
        } else {
            match reduce_loop_level(&loops, &axes) {
                Some(level) => accumulate_pass(dag, case, r, &loops, level, tile)?,
                None => {
                    let mut body = vec![];
                    for id in topological_order(dag) {
                        body.extend(tile_stages(dag, id, tile_elems_of(dag, id, tile), case.pattern)?);
                    }
                    nest(&loops, body)
                }
            }
        };
        Ok(Plan { roots })
    }
}

pub(super) fn reduce_family(dag: &ComputeDag) -> bool {
    dag.nodes().iter().all(|n| {
        matches!(
            n.kind,
            NodeKind::Placeholder
                | NodeKind::Elementwise(_)
                | NodeKind::Broadcast
                | NodeKind::Reduce { .. }
        )
    })
}

/// The outermost loop that walks a reduce axis, if any reduce axis is split
/// out of the tile.
pub(super) fn reduce_loop_level(loops: &[LoopVar], axes: &[AxisInfo]) -> Option<usize> {
    loops
        .iter()
        .position(|l| axes.get(usize::from(l.axis)).map_or(false, AxisInfo::is_reduce))
}

pub(super) fn reduce_op(dag: &ComputeDag, r: NodeId) -> ReduceOp {
    match dag.node(r).kind {
        NodeKind::Reduce { op, .. } => op,
        _ => ReduceOp::Sum,
    }
}

/// The accumulator of `r`: initialized before the reduce loops, updated in
/// place by every tile.
pub(super) fn accumulator(dag: &ComputeDag, r: NodeId, tile: u64) -> (PlannedStage, PlannedStage) {
    let op = reduce_op(dag, r);
    let elems = tile_elems_of(dag, r, tile);
    let dtype = dag.node(r).dtype;
    (
        PlannedStage::tile(r, EmitInsn::ReduceInit(op), BufferScope::Ub, elems, dtype).outside(),
        PlannedStage::tile(r, EmitInsn::VectorReduce(op), BufferScope::Ub, elems, dtype).reusing(r),
    )
}

/// Ancestors of `r` are computed per tile; `r` accumulates across the loops
/// from `level` inward; everything downstream runs once the accumulation is
/// complete.
fn accumulate_pass(
    dag: &ComputeDag,
    case: &TilingCase,
    r: NodeId,
    loops: &[LoopVar],
    level: usize,
    tile: u64,
) -> Result<Vec<PlanNode>, ScheduleError> {
    let upstream = dag.ancestors_or_self(r);
    let (init, update) = accumulator(dag, r, tile);
    let mut body = vec![];
    let mut after = vec![];
    for id in topological_order(dag) {
        let elems = tile_elems_of(dag, id, tile);
        if id == r {
            body.push(update.clone().into());
            if dag.is_output(r) {
                after.push(copy_out(dag, r, elems, BufferScope::Global).outside().into());
            }
        } else if upstream[id.index()] {
            body.extend(tile_stages(dag, id, elems, case.pattern)?);
        } else {
            after.push(compute_stage(dag, id, elems, case.pattern)?.outside().into());
            if dag.is_output(id) {
                after.push(copy_out(dag, id, elems, BufferScope::Global).outside().into());
            }
        }
    }
    Ok(nest_split(loops, level, vec![init.into()], body, after))
}

/// Every tile reduces its slice and adds it into a zeroed global output.
fn atomic_pass(
    dag: &ComputeDag,
    case: &TilingCase,
    r: NodeId,
    loops: &[LoopVar],
    tile: u64,
) -> Result<Vec<PlanNode>, ScheduleError> {
    if !dag.consumers(r).is_empty() || dag.outputs() != [r].as_slice() {
        return Err(ScheduleError::AtomicWithEpilogue);
    }
    let elems = tile_elems_of(dag, r, tile);
    let dtype = dag.node(r).dtype;
    let zero = PlannedStage::tile(r, EmitInsn::ZeroInit, BufferScope::Global, elems, dtype).outside();
    let mut body = vec![];
    for id in topological_order(dag) {
        body.push(compute_stage(dag, id, tile_elems_of(dag, id, tile), case.pattern)?.into());
    }
    body.push(PlannedStage::tile(r, EmitInsn::AtomicAdd, BufferScope::Global, elems, dtype).into());
    let mut roots = vec![zero.into()];
    roots.extend(nest(loops, body));
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::FactorBound;
    use crate::common::{DimRange, Dtype};
    use crate::schedule::LoopKind;

    #[test]
    fn test_reduce_loop_level() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(8), DimRange::known(8)], Dtype::Float32);
        let r = b.reduce(ReduceOp::Max, x, &[1], false);
        b.output(r);
        let dag = b.build().unwrap();
        let axes = iteration_axes(&dag, crate::classify::Pattern::KnownReduce, None);
        let var = |axis, kind| LoopVar {
            axis,
            kind,
            factor: FactorBound::UNIT,
        };
        let loops = [var(0, LoopKind::Block), var(1, LoopKind::UbOuter)];
        assert_eq!(reduce_loop_level(&loops, &axes), Some(1));
        assert_eq!(reduce_loop_level(&loops[..1], &axes), None);
        assert_eq!(reduce_op(&dag, r), ReduceOp::Max);
    }
}
