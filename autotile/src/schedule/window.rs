use crate::case::{FactorBound, TilingCase};
use crate::classify::Pattern;
use crate::common::AxisId;
use crate::dag::{ComputeDag, NodeKind};
use crate::generate::WindowGeometry;
use crate::info::topological_order;
use crate::storage::residency;
use crate::target::BufferScope;

use super::builder::{nest, PlanNode};
use super::{
    compute_stage, copy_out, tile_elems_of, EmitInsn, Hardware, LoopKind, LoopVar, PatternScheduler,
    Plan, PlannedStage, ScheduleError,
};

/// Pooling and cube DAGs, tiled in bands of output rows.
///
/// Cube weights are loaded into L1 once, before any loop. Inputs are staged
/// with the halo their window needs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WindowScheduler;

impl PatternScheduler for WindowScheduler {
    fn plan(&self, dag: &ComputeDag, case: &TilingCase, _hw: &Hardware) -> Result<Plan, ScheduleError> {
        let mismatch = ScheduleError::PatternMismatch(case.pattern);
        let geometry = WindowGeometry::of(dag).ok_or(mismatch.clone())?;
        if geometry.is_cube() != (case.pattern == Pattern::Cube)
            || dag.nodes().iter().any(|n| matches!(n.kind, NodeKind::Reduce { .. }))
        {
            return Err(mismatch);
        }
        let window = geometry.node;
        let rank = dag.node(window).rank();
        let dims = &case.region.dims;
        for axis in [case.block_split_axis, case.ub_split_axis].into_iter().flatten() {
            if usize::from(axis) >= rank || dims.len() != rank {
                return Err(ScheduleError::AxisOutOfRange { axis, rank });
            }
        }

        let width = geometry.width_axis;
        let by_width = case.ub_split_axis == Some(width as AxisId) && width != geometry.ub_axis;
        let (rows, cols) = if by_width {
            (1, case.ub_factor_bound.max)
        } else {
            (case.ub_factor_bound.max, dims[width].max())
        };
        let rows = rows.max(1);
        let cols = cols.max(1);
        let loops = window_loops(case, &geometry, by_width);

        let upstream = dag.ancestors_or_self(window);
        let weights = match (geometry.is_cube(), dag.node(window).inputs.get(1)) {
            (true, Some(&w)) => dag.ancestors_or_self(w),
            _ => vec![false; dag.len()],
        };
        let in_elems = geometry.input_elems(rows, cols);
        let out_elems = geometry.output_elems(rows, cols);

        let mut hoisted: Vec<PlanNode> = vec![];
        let mut body: Vec<PlanNode> = vec![];
        for id in topological_order(dag) {
            let node = dag.node(id);
            if weights[id.index()] {
                hoisted.push(
                    compute_stage(dag, id, geometry.weight_elems.max(1), case.pattern)?
                        .outside()
                        .into(),
                );
                continue;
            }
            let stage = if id == window {
                compute_stage(dag, id, out_elems, case.pattern)?
            } else if upstream[id.index()] {
                PlannedStage {
                    scope: if matches!(node.kind, NodeKind::Placeholder) {
                        residency(dag, id)
                    } else {
                        BufferScope::Ub
                    },
                    ..compute_stage(dag, id, in_elems, case.pattern)?
                }
            } else {
                compute_stage(dag, id, tile_elems_of(dag, id, out_elems), case.pattern)?
            };
            let elems = stage.elems;
            body.push(stage.into());
            if dag.is_output(id) {
                body.push(copy_out(dag, id, elems, BufferScope::Global).into());
            }
        }
        let mut roots = hoisted;
        roots.extend(nest(&loops, body));
        Ok(Plan { roots })
    }
}

fn window_loops(case: &TilingCase, geometry: &WindowGeometry, by_width: bool) -> Vec<LoopVar> {
    let dims = &case.region.dims;
    let var = |axis: usize, kind, factor| LoopVar {
        axis: axis as AxisId,
        kind,
        factor,
    };
    let span = |axis: usize| FactorBound::new(1, dims[axis].max());
    let mut loops = vec![];
    match case.block_split_axis {
        Some(b) => loops.push(var(usize::from(b), LoopKind::Block, case.block_factor_bound)),
        None if geometry.block_axis != geometry.ub_axis => {
            loops.push(var(geometry.block_axis, LoopKind::Serial, span(geometry.block_axis)))
        }
        None => {}
    }
    if by_width {
        loops.push(var(geometry.ub_axis, LoopKind::Serial, span(geometry.ub_axis)));
    }
    if let Some(u) = case.ub_split_axis.map(usize::from) {
        loops.push(var(u, LoopKind::UbOuter, span(u)));
        loops.push(var(u, LoopKind::UbInner, case.ub_factor_bound));
    }
    loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimRange, Dtype};
    use crate::dag::ElemOp;
    use crate::generate::generate_cases;
    use crate::schedule::build_schedule;
    use crate::target::CloudTarget;

    fn matmul_bias() -> ComputeDag {
        let mut b = ComputeDag::builder();
        let a = b.placeholder(vec![DimRange::new(1, 4096), DimRange::known(256)], Dtype::Float16);
        let w = b.placeholder(vec![DimRange::known(256), DimRange::known(128)], Dtype::Float16);
        let m = b.matmul(a, w);
        let bias = b.placeholder(vec![DimRange::known(1), DimRange::known(128)], Dtype::Float16);
        let c = b.cast(m, Dtype::Float16);
        let y = b.elementwise(ElemOp::Add, &[c, bias]);
        b.output(y);
        b.build().unwrap()
    }

    #[test]
    fn test_matmul_hoists_weights_and_stages_epilogue_in_ub() {
        let dag = matmul_bias();
        let cases = generate_cases::<CloudTarget>(&dag, Pattern::Cube).unwrap();
        let schedule = build_schedule::<CloudTarget>(&dag, &cases[0]).unwrap();
        let stages = schedule.stages();
        assert_eq!(stages[0].0, 0);
        assert_eq!(stages[0].1.scope, BufferScope::L1);
        let kinds = schedule.loops().iter().map(|l| l.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![LoopKind::Block, LoopKind::UbOuter, LoopKind::UbInner]);
        let bias = stages
            .iter()
            .find(|(_, s)| s.node == Some(crate::dag::NodeId(3)))
            .unwrap();
        assert_eq!(bias.1.scope, BufferScope::Ub);
        assert!(stages.iter().any(|(_, s)| s.insn == EmitInsn::Mmad));
    }
}
