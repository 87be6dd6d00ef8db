use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::common::AxisId;
use crate::dag::{ComputeDag, NodeId, NodeKind, ReduceAxes};

/// The computation pattern of a DAG. Exactly one is assigned per DAG and it
/// selects both the case sub-generator and the scheduler.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Pattern {
    ElementwiseOnly,
    PureBroadcast,
    KnownReduce,
    UnknownReduce,
    Norm,
    Pooling,
    Cube,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Unsupported topology: {0}")]
    UnsupportedTopology(TopologyReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyReason {
    #[error("node kind `{0}` has no classifier rule")]
    UnregisteredKind(String),
    #[error("no combined scheduler for {0}")]
    NoCombinedScheduler(&'static str),
    #[error("multiple outputs are not supported by this pattern")]
    MultipleOutputs,
}

impl Pattern {
    /// A stable code used by the encoder and in tiling keys.
    pub fn code(&self) -> u8 {
        match self {
            Pattern::ElementwiseOnly => 1,
            Pattern::PureBroadcast => 2,
            Pattern::KnownReduce => 3,
            Pattern::UnknownReduce => 4,
            Pattern::Norm => 5,
            Pattern::Pooling => 6,
            Pattern::Cube => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Pattern> {
        <Pattern as strum::IntoEnumIterator>::iter().find(|p| p.code() == code)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(
            self,
            Pattern::KnownReduce | Pattern::UnknownReduce | Pattern::Norm
        )
    }

    pub fn is_window(&self) -> bool {
        matches!(self, Pattern::Pooling | Pattern::Cube)
    }

    fn allows_multiple_outputs(&self) -> bool {
        matches!(
            self,
            Pattern::ElementwiseOnly | Pattern::PureBroadcast | Pattern::Norm
        )
    }
}

/// Counts gathered by one walk over the DAG.
#[derive(Debug, Default)]
struct NodeCensus {
    unregistered: Option<String>,
    cube: Vec<NodeId>,
    pools: Vec<NodeId>,
    known_reduces: Vec<NodeId>,
    dynamic_reduces: usize,
    broadcasts: usize,
    rank_mismatches: usize,
    reduce_axis_sets: HashSet<Vec<AxisId>>,
}

impl NodeCensus {
    fn take(dag: &ComputeDag) -> Self {
        let mut census = NodeCensus::default();
        for (id, node) in dag.ids().zip(dag.nodes()) {
            if node.is_cube() {
                census.cube.push(id);
            }
            match &node.kind {
                NodeKind::Unregistered(name) => {
                    census.unregistered.get_or_insert_with(|| name.clone());
                }
                NodeKind::Pool { .. } => census.pools.push(id),
                NodeKind::Reduce {
                    axes: ReduceAxes::Known(axes),
                    ..
                } => {
                    census.known_reduces.push(id);
                    let mut sorted = axes.clone();
                    sorted.sort_unstable();
                    sorted.dedup();
                    census.reduce_axis_sets.insert(sorted);
                }
                NodeKind::Reduce {
                    axes: ReduceAxes::Dynamic,
                    ..
                } => census.dynamic_reduces += 1,
                NodeKind::Broadcast => census.broadcasts += 1,
                NodeKind::Elementwise(_) => {
                    if node
                        .inputs
                        .iter()
                        .any(|&i| dag.node(i).shape != node.shape)
                    {
                        census.rank_mismatches += 1;
                    }
                }
                _ => {}
            }
        }
        census
    }

    fn has_reduce(&self) -> bool {
        !self.known_reduces.is_empty() || self.dynamic_reduces > 0
    }
}

/// Assigns a [Pattern] to `dag`.
///
/// Pure: the result depends only on the node kinds and shape relationships.
pub fn classify(dag: &ComputeDag) -> Result<Pattern, ClassificationError> {
    let unsupported = |r| Err(ClassificationError::UnsupportedTopology(r));
    let census = NodeCensus::take(dag);

    if let Some(name) = census.unregistered {
        return unsupported(TopologyReason::UnregisteredKind(name));
    }

    let pattern = if !census.cube.is_empty() {
        if census.dynamic_reduces > 0 {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "a cube node with a dynamic-axis reduce",
            ));
        }
        if !census.pools.is_empty() {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "a cube node with pooling",
            ));
        }
        if census.cube.len() > 1 {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "more than one cube node",
            ));
        }
        Pattern::Cube
    } else if !census.pools.is_empty() {
        if census.has_reduce() {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "pooling with a reduce",
            ));
        }
        if census.pools.len() > 1 || !only_elementwise_downstream(dag, census.pools[0]) {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "pooling followed by a non-elementwise node",
            ));
        }
        Pattern::Pooling
    } else if census.dynamic_reduces > 0 {
        if !census.known_reduces.is_empty() {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "known and dynamic-axis reduces",
            ));
        }
        Pattern::UnknownReduce
    } else if !census.known_reduces.is_empty() {
        if census.reduce_axis_sets.len() > 1 {
            return unsupported(TopologyReason::NoCombinedScheduler(
                "reduces over different axes",
            ));
        }
        if census
            .known_reduces
            .iter()
            .any(|&r| has_norm_signature(dag, r))
        {
            Pattern::Norm
        } else {
            Pattern::KnownReduce
        }
    } else if census.broadcasts > 0 || census.rank_mismatches > 0 {
        Pattern::PureBroadcast
    } else {
        Pattern::ElementwiseOnly
    };

    if dag.outputs().len() > 1 && !pattern.allows_multiple_outputs() {
        return unsupported(TopologyReason::MultipleOutputs);
    }
    Ok(pattern)
}

fn only_elementwise_downstream(dag: &ComputeDag, root: NodeId) -> bool {
    let downstream = dag.descendants_or_self(root);
    dag.ids()
        .filter(|&id| id != root && downstream[id.index()])
        .all(|id| matches!(dag.node(id).kind, NodeKind::Elementwise(_)))
}

/// Whether reduce `r` feeds back, through a broadcast, into an elementwise node
/// that also reads `r`'s input or one of its ancestors.
///
/// The broadcast is either an explicit [NodeKind::Broadcast] or an elementwise
/// node whose operand shape differs from its output.
fn has_norm_signature(dag: &ComputeDag, r: NodeId) -> bool {
    let Some(&reduce_input) = dag.node(r).inputs.first() else {
        return false;
    };
    let upstream = dag.ancestors_or_self(reduce_input);
    let mut seen = HashSet::new();
    let mut stack = dag
        .consumers(r)
        .iter()
        .map(|&c| (r, c, false))
        .collect::<Vec<_>>();
    while let Some((via, node, broadcasted)) = stack.pop() {
        if !seen.insert((via, node, broadcasted)) {
            continue;
        }
        let n = dag.node(node);
        let broadcasted = match n.kind {
            NodeKind::Broadcast => true,
            NodeKind::Elementwise(_) => {
                let broadcasted = broadcasted || dag.node(via).shape != n.shape;
                if broadcasted
                    && n.inputs
                        .iter()
                        .any(|&i| i != via && upstream[i.index()])
                {
                    return true;
                }
                broadcasted
            }
            _ => continue,
        };
        stack.extend(dag.consumers(node).iter().map(|&c| (node, c, broadcasted)));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimRange, Dtype};
    use crate::dag::{ElemOp, PoolMode, ReduceOp, Window};
    use proptest::prelude::*;

    fn softmax(rows: DimRange, cols: DimRange) -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![rows, cols], Dtype::Float32);
        let m = b.reduce(ReduceOp::Max, x, &[1], true);
        let s = b.elementwise(ElemOp::Sub, &[x, m]);
        let e = b.elementwise(ElemOp::Exp, &[s]);
        let sum = b.reduce(ReduceOp::Sum, e, &[1], true);
        let d = b.elementwise(ElemOp::Div, &[e, sum]);
        b.output(d);
        b.build().unwrap()
    }

    #[test]
    fn test_elementwise_add_is_elementwise_only() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 65536)], Dtype::Float32);
        let y = b.placeholder(vec![DimRange::new(1, 65536)], Dtype::Float32);
        let z = b.elementwise(ElemOp::Add, &[x, y]);
        b.output(z);
        assert_eq!(classify(&b.build().unwrap()), Ok(Pattern::ElementwiseOnly));
    }

    #[test]
    fn test_rank_mismatch_is_pure_broadcast() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64), DimRange::known(32)], Dtype::Float16);
        let y = b.placeholder(vec![DimRange::known(32)], Dtype::Float16);
        let z = b.elementwise(ElemOp::Add, &[x, y]);
        b.output(z);
        assert_eq!(classify(&b.build().unwrap()), Ok(Pattern::PureBroadcast));
    }

    #[test]
    fn test_known_axis_reduce_is_known_reduce() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 4096), DimRange::known(128)], Dtype::Float32);
        let r = b.reduce(ReduceOp::Sum, x, &[1], false);
        b.output(r);
        assert_eq!(classify(&b.build().unwrap()), Ok(Pattern::KnownReduce));
    }

    #[test]
    fn test_dynamic_axis_reduce_is_unknown_reduce() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 4096), DimRange::new(1, 4096)], Dtype::Float32);
        let r = b.reduce_dynamic(ReduceOp::Sum, x);
        b.output(r);
        assert_eq!(classify(&b.build().unwrap()), Ok(Pattern::UnknownReduce));
    }

    #[test]
    fn test_softmax_is_norm() {
        let dag = softmax(DimRange::new(1, 1024), DimRange::known(256));
        assert_eq!(classify(&dag), Ok(Pattern::Norm));
    }

    #[test]
    fn test_reduce_then_unrelated_broadcast_is_known_reduce() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64), DimRange::known(16)], Dtype::Float32);
        let r = b.reduce(ReduceOp::Sum, x, &[1], true);
        let y = b.placeholder(vec![DimRange::new(1, 64), DimRange::known(16)], Dtype::Float32);
        let z = b.elementwise(ElemOp::Mul, &[y, r]);
        b.output(z);
        assert_eq!(classify(&b.build().unwrap()), Ok(Pattern::KnownReduce));
    }

    #[test]
    fn test_pooling() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(
            vec![
                DimRange::new(1, 8),
                DimRange::known(16),
                DimRange::new(8, 256),
                DimRange::new(8, 256),
            ],
            Dtype::Float16,
        );
        let window = Window {
            kernel: [3, 3],
            stride: [2, 2],
            pad: [1, 1, 1, 1],
        };
        let p = b.pool(PoolMode::Max, x, window);
        let r = b.elementwise(ElemOp::Relu, &[p]);
        b.output(r);
        assert_eq!(classify(&b.build().unwrap()), Ok(Pattern::Pooling));
    }

    #[test]
    fn test_cube_with_dynamic_reduce_is_unsupported() {
        let mut b = ComputeDag::builder();
        let a = b.placeholder(vec![DimRange::new(1, 512), DimRange::known(64)], Dtype::Float16);
        let w = b.placeholder(vec![DimRange::known(64), DimRange::known(32)], Dtype::Float16);
        let m = b.matmul(a, w);
        let r = b.reduce_dynamic(ReduceOp::Sum, m);
        b.output(r);
        assert!(matches!(
            classify(&b.build().unwrap()),
            Err(ClassificationError::UnsupportedTopology(
                TopologyReason::NoCombinedScheduler(_)
            ))
        ));
    }

    #[test]
    fn test_unregistered_kind_is_unsupported() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64)], Dtype::Float32);
        let y = b.unregistered("frobnicate", &[x], vec![DimRange::new(1, 64)], Dtype::Float32);
        b.output(y);
        assert_eq!(
            classify(&b.build().unwrap()),
            Err(ClassificationError::UnsupportedTopology(
                TopologyReason::UnregisteredKind("frobnicate".into())
            ))
        );
    }

    #[test]
    fn test_multiple_reduce_outputs_are_unsupported() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64), DimRange::known(16)], Dtype::Float32);
        let s = b.reduce(ReduceOp::Sum, x, &[1], false);
        let m = b.reduce(ReduceOp::Max, x, &[1], false);
        b.output(s).output(m);
        assert_eq!(
            classify(&b.build().unwrap()),
            Err(ClassificationError::UnsupportedTopology(
                TopologyReason::MultipleOutputs
            ))
        );
    }

    #[test]
    fn test_pattern_codes_are_stable() {
        for pattern in <Pattern as strum::IntoEnumIterator>::iter() {
            assert_eq!(Pattern::from_code(pattern.code()), Some(pattern));
        }
        assert_eq!(Pattern::from_code(0), None);
    }

    proptest! {
        #[test]
        fn test_classify_is_deterministic(rows in 1u64..4096, cols in 2u64..4096) {
            let dag = softmax(DimRange::new(1, rows), DimRange::known(cols));
            let first = classify(&dag);
            prop_assert_eq!(first.clone(), classify(&dag.clone()));
            prop_assert_eq!(first, Ok(Pattern::Norm));
        }
    }
}
