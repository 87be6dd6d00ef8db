use log::debug;

use crate::axis::iteration_axes;
use crate::case::{SpecialPattern, TilingCase};
use crate::dag::{ComputeDag, NodeId, NodeKind};
use crate::info::topological_order;
use crate::target::BufferScope;

use super::builder::{nest, nest_split, PlanNode};
use super::reduce::{accumulator, reduce_family, reduce_loop_level};
use super::{
    compute_stage, copy_out, loop_vars, tile_elems_of, tile_stages, EmitInsn, Hardware, LoopVar,
    PatternScheduler, Plan, PlannedStage, ScheduleError,
};

/// Reduces whose results are broadcast back into elementwise consumers.
///
/// When whole reduce extents fit in a tile, one pass computes everything.
/// Otherwise each reduce depth gets its own pass over the input, keeping
/// finished reduce results in the workspace for later passes to reload.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NormScheduler;

impl PatternScheduler for NormScheduler {
    fn plan(&self, dag: &ComputeDag, case: &TilingCase, _hw: &Hardware) -> Result<Plan, ScheduleError> {
        if !reduce_family(dag) || !dag.nodes().iter().any(|n| matches!(n.kind, NodeKind::Reduce { .. })) {
            return Err(ScheduleError::PatternMismatch(case.pattern));
        }
        let axes = iteration_axes(dag, case.pattern, None);
        let loops = loop_vars(case, &axes)?;
        let tile = case.tile_elems();
        let level = reduce_loop_level(&loops, &axes);
        if case.special != SpecialPattern::NormWorkspace && level.is_none() {
            let mut body = vec![];
            for id in topological_order(dag) {
                body.extend(tile_stages(dag, id, tile_elems_of(dag, id, tile), case.pattern)?);
            }
            return Ok(Plan {
                roots: nest(&loops, body),
            });
        }

        let level = level.unwrap_or(loops.len());
        let depth = reduce_depths(dag);
        let passes = depth.iter().copied().max().unwrap_or(0);
        let mut roots = vec![];
        for pass in 1..=passes {
            let targets = dag
                .ids()
                .filter(|&id| is_reduce(dag, id) && depth[id.index()] == pass)
                .collect::<Vec<_>>();
            roots.extend(reduce_pass(dag, case, &targets, &loops, level, tile)?);
        }
        roots.extend(final_pass(dag, case, &loops, tile)?);
        debug!("norm schedule in {} passes", passes + 1);
        Ok(Plan { roots })
    }
}

fn is_reduce(dag: &ComputeDag, id: NodeId) -> bool {
    matches!(dag.node(id).kind, NodeKind::Reduce { .. })
}

/// For each node, the most reduces on any path from a placeholder to it,
/// counting itself.
fn reduce_depths(dag: &ComputeDag) -> Vec<usize> {
    let mut depth = vec![0; dag.len()];
    for id in topological_order(dag) {
        let inherited = dag
            .node(id)
            .inputs
            .iter()
            .map(|i| depth[i.index()])
            .max()
            .unwrap_or(0);
        depth[id.index()] = inherited + usize::from(is_reduce(dag, id));
    }
    depth
}

/// Nodes needed to compute `seeds`, not looking past reduces outside `seeds`.
fn cone(dag: &ComputeDag, seeds: &[NodeId]) -> Vec<bool> {
    let mut needed = vec![false; dag.len()];
    let mut stack = seeds.to_vec();
    while let Some(id) = stack.pop() {
        if needed[id.index()] {
            continue;
        }
        needed[id.index()] = true;
        if is_reduce(dag, id) && !seeds.contains(&id) {
            continue;
        }
        stack.extend(dag.node(id).inputs.iter().copied());
    }
    needed
}

fn reload(dag: &ComputeDag, id: NodeId, tile: u64) -> PlannedStage {
    PlannedStage::tile(
        id,
        EmitInsn::DmaCopyIn {
            from: BufferScope::Workspace,
        },
        BufferScope::Ub,
        tile_elems_of(dag, id, tile),
        dag.node(id).dtype,
    )
}

fn reduce_pass(
    dag: &ComputeDag,
    case: &TilingCase,
    targets: &[NodeId],
    loops: &[LoopVar],
    level: usize,
    tile: u64,
) -> Result<Vec<PlanNode>, ScheduleError> {
    let needed = cone(dag, targets);
    let mut before = vec![];
    let mut body = vec![];
    let mut after = vec![];
    for id in topological_order(dag).into_iter().filter(|id| needed[id.index()]) {
        let elems = tile_elems_of(dag, id, tile);
        if targets.contains(&id) {
            let (init, update) = accumulator(dag, id, tile);
            before.push(init.into());
            body.push(update.into());
            after.push(copy_out(dag, id, elems, BufferScope::Workspace).outside().into());
            if dag.is_output(id) {
                after.push(copy_out(dag, id, elems, BufferScope::Global).outside().into());
            }
        } else if is_reduce(dag, id) {
            body.push(reload(dag, id, tile).into());
        } else {
            body.push(compute_stage(dag, id, elems, case.pattern)?.into());
        }
    }
    Ok(nest_split(loops, level, before, body, after))
}

/// Recomputes the elementwise tail of every output from reloaded reduce
/// results.
fn final_pass(
    dag: &ComputeDag,
    case: &TilingCase,
    loops: &[LoopVar],
    tile: u64,
) -> Result<Vec<PlanNode>, ScheduleError> {
    let outputs = dag
        .outputs()
        .iter()
        .copied()
        .filter(|&o| !is_reduce(dag, o))
        .collect::<Vec<_>>();
    if outputs.is_empty() {
        return Ok(vec![]);
    }
    let needed = cone(dag, &outputs);
    let mut body = vec![];
    for id in topological_order(dag).into_iter().filter(|id| needed[id.index()]) {
        if is_reduce(dag, id) {
            body.push(reload(dag, id, tile).into());
        } else {
            body.extend(tile_stages(dag, id, tile_elems_of(dag, id, tile), case.pattern)?);
        }
    }
    Ok(nest(loops, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimRange, Dtype};
    use crate::dag::{ElemOp, ReduceOp};

    fn layer_norm() -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64), DimRange::known(768)], Dtype::Float32);
        let mean = b.reduce(ReduceOp::Sum, x, &[1], true);
        let centered = b.elementwise(ElemOp::Sub, &[x, mean]);
        let sq = b.elementwise(ElemOp::Mul, &[centered, centered]);
        let var = b.reduce(ReduceOp::Sum, sq, &[1], true);
        let inv = b.elementwise(ElemOp::Rsqrt, &[var]);
        let y = b.elementwise(ElemOp::Mul, &[centered, inv]);
        b.output(y);
        b.build().unwrap()
    }

    #[test]
    fn test_reduce_depths() {
        let dag = layer_norm();
        assert_eq!(reduce_depths(&dag), vec![0, 1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_cone_stops_at_earlier_reduces() {
        let dag = layer_norm();
        let needed = cone(&dag, &[NodeId(4)]);
        assert_eq!(needed, vec![true, true, true, true, true, false, false]);
        let needed = cone(&dag, &[NodeId(6)]);
        assert!(!needed[3]);
        assert!(needed[4] && needed[1] && needed[0]);
    }
}
