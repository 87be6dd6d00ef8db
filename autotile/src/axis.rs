use serde::{Deserialize, Serialize};

use crate::classify::Pattern;
use crate::common::{AxisId, DimRange};
use crate::dag::{ComputeDag, NodeId, NodeKind, ReduceAxes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AxisRole {
    Parallel,
    Reduce,
}

/// One loop axis of the iteration space a tiling case is expressed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AxisInfo {
    /// The tensor dimension this axis iterates over. For the fused axis of an
    /// elementwise-only DAG, this is 0.
    pub dim_index: AxisId,
    pub role: AxisRole,
    pub extent: DimRange,
}

impl AxisInfo {
    pub fn is_reduce(&self) -> bool {
        self.role == AxisRole::Reduce
    }

    /// Whether the extent is known when the schedule is built.
    pub fn is_known(&self) -> bool {
        self.extent.is_known()
    }
}

/// Derives the iteration space for `pattern`.
///
/// `reduce_mask` selects the reduced axes of a dynamic-axis reduce (bit `i` set
/// for axis `i`). It is ignored for reduces with known axes.
pub fn iteration_axes(dag: &ComputeDag, pattern: Pattern, reduce_mask: Option<u32>) -> Vec<AxisInfo> {
    let parallel = |shape: &[DimRange]| {
        shape
            .iter()
            .enumerate()
            .map(|(i, &extent)| AxisInfo {
                dim_index: i as AxisId,
                role: AxisRole::Parallel,
                extent,
            })
            .collect::<Vec<_>>()
    };
    match pattern {
        Pattern::ElementwiseOnly => {
            let out = dag.node(widest_output(dag));
            vec![AxisInfo {
                dim_index: 0,
                role: AxisRole::Parallel,
                extent: DimRange::product(&out.shape),
            }]
        }
        Pattern::PureBroadcast => parallel(&dag.node(widest_output(dag)).shape),
        Pattern::Pooling | Pattern::Cube => {
            let node = window_node(dag).unwrap_or_else(|| widest_output(dag));
            parallel(&dag.node(node).shape)
        }
        Pattern::KnownReduce | Pattern::UnknownReduce | Pattern::Norm => {
            let Some(r) = primary_reduce(dag) else {
                return parallel(&dag.node(widest_output(dag)).shape);
            };
            let input = dag.node(dag.node(r).inputs[0]);
            let mask = reduce_axes_of(dag, r)
                .map(|axes| reduce_mask_of(&axes))
                .or(reduce_mask)
                .unwrap_or(0);
            input
                .shape
                .iter()
                .enumerate()
                .map(|(i, &extent)| AxisInfo {
                    dim_index: i as AxisId,
                    role: if mask & (1 << i) != 0 {
                        AxisRole::Reduce
                    } else {
                        AxisRole::Parallel
                    },
                    extent,
                })
                .collect()
        }
    }
}

/// The output with the highest rank; the first one on ties.
pub fn widest_output(dag: &ComputeDag) -> NodeId {
    let outputs = dag.outputs();
    outputs
        .iter()
        .copied()
        .rev()
        .max_by_key(|&o| dag.node(o).rank())
        .unwrap_or(NodeId(dag.len() as u32 - 1))
}

/// The first reduce node in id order.
pub fn primary_reduce(dag: &ComputeDag) -> Option<NodeId> {
    dag.ids()
        .find(|&id| matches!(dag.node(id).kind, NodeKind::Reduce { .. }))
}

/// The statically known reduce axes of `id`, sorted, or `None` if `id` is not a
/// reduce with known axes.
pub fn reduce_axes_of(dag: &ComputeDag, id: NodeId) -> Option<Vec<AxisId>> {
    match &dag.node(id).kind {
        NodeKind::Reduce {
            axes: ReduceAxes::Known(axes),
            ..
        } => {
            let mut axes = axes.clone();
            axes.sort_unstable();
            axes.dedup();
            Some(axes)
        }
        _ => None,
    }
}

pub fn reduce_mask_of(axes: &[AxisId]) -> u32 {
    axes.iter().fold(0, |mask, &a| mask | (1 << a))
}

pub fn mask_axes(mask: u32, rank: usize) -> Vec<AxisId> {
    (0..rank)
        .filter(|&i| mask & (1 << i) != 0)
        .map(|i| i as AxisId)
        .collect()
}

/// The sliding-window or cube node of a window DAG.
pub fn window_node(dag: &ComputeDag) -> Option<NodeId> {
    dag.ids()
        .find(|&id| dag.node(id).kind.is_cube() || matches!(dag.node(id).kind, NodeKind::Pool { .. }))
        .or_else(|| dag.ids().find(|&id| dag.node(id).is_cube()))
}

pub fn first_reduce_axis(axes: &[AxisInfo]) -> Option<usize> {
    axes.iter().position(AxisInfo::is_reduce)
}
