use crate::axis::iteration_axes;
use crate::case::TilingCase;
use crate::dag::{ComputeDag, NodeKind};
use crate::info::topological_order;

use super::builder::nest;
use super::{loop_vars, tile_stages, tile_elems_of, Hardware, PatternScheduler, Plan, ScheduleError};

/// Elementwise and broadcast DAGs: every node is computed per tile, in
/// topological order, and outputs are copied out as soon as they are ready.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VectorScheduler;

impl PatternScheduler for VectorScheduler {
    fn plan(&self, dag: &ComputeDag, case: &TilingCase, _hw: &Hardware) -> Result<Plan, ScheduleError> {
        let vector_only = dag.nodes().iter().all(|n| {
            matches!(
                n.kind,
                NodeKind::Placeholder | NodeKind::Elementwise(_) | NodeKind::Broadcast
            )
        });
        if !vector_only {
            return Err(ScheduleError::PatternMismatch(case.pattern));
        }
        let axes = iteration_axes(dag, case.pattern, None);
        let loops = loop_vars(case, &axes)?;
        let tile = case.tile_elems();
        let mut body = vec![];
        for id in topological_order(dag) {
            body.extend(tile_stages(dag, id, tile_elems_of(dag, id, tile), case.pattern)?);
        }
        Ok(Plan {
            roots: nest(&loops, body),
        })
    }
}
