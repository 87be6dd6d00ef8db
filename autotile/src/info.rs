use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::dag::{ComputeDag, NodeId};

/// Returns the nodes of `dag` in topological order.
///
/// Kahn's algorithm with the ready set ordered by node id, so the order is
/// deterministic and preserves the original node order wherever it is free.
pub fn topological_order(dag: &ComputeDag) -> Vec<NodeId> {
    let mut pending = dag
        .nodes()
        .iter()
        .map(|n| {
            let mut inputs = n.inputs.clone();
            inputs.sort_unstable();
            inputs.dedup();
            inputs.len()
        })
        .collect::<Vec<_>>();
    let mut ready = dag
        .ids()
        .filter(|id| pending[id.index()] == 0)
        .map(Reverse)
        .collect::<BinaryHeap<_>>();
    let mut order = Vec::with_capacity(dag.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for &c in dag.consumers(id) {
            pending[c.index()] -= 1;
            if pending[c.index()] == 0 {
                ready.push(Reverse(c));
            }
        }
    }
    debug_assert_eq!(order.len(), dag.len());
    order
}

/// For each node, the position in `order` of its last consumer. Nodes without
/// consumers map to their own position.
pub fn last_uses(dag: &ComputeDag, order: &[NodeId]) -> Vec<usize> {
    let mut position = vec![0; dag.len()];
    for (i, id) in order.iter().enumerate() {
        position[id.index()] = i;
    }
    dag.ids()
        .map(|id| {
            dag.consumers(id)
                .iter()
                .map(|c| position[c.index()])
                .max()
                .unwrap_or(position[id.index()])
                .max(position[id.index()])
        })
        .collect()
}

pub fn is_single_consumer(dag: &ComputeDag, id: NodeId) -> bool {
    dag.consumers(id).len() == 1
}

/// Whether `id` may be computed at its consumer rather than materialized at
/// tile scope: it has exactly one consumer, is not an output, and `footprint`
/// bytes fit in the `remaining` budget.
pub fn compute_at_eligible(dag: &ComputeDag, id: NodeId, footprint: u64, remaining: u64) -> bool {
    is_single_consumer(dag, id) && !dag.is_output(id) && footprint <= remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimRange, Dtype};
    use crate::dag::ElemOp;

    fn diamond() -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64)], Dtype::Float32);
        let l = b.elementwise(ElemOp::Exp, &[x]);
        let r = b.elementwise(ElemOp::Abs, &[x]);
        let j = b.elementwise(ElemOp::Add, &[l, r]);
        b.output(j);
        b.build().unwrap()
    }

    #[test]
    fn test_topological_order_is_by_id() {
        let dag = diamond();
        let order = topological_order(&dag);
        assert_eq!(order, vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(order, topological_order(&dag));
    }

    #[test]
    fn test_self_binary_input_counts_once() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 64)], Dtype::Float32);
        let sq = b.elementwise(ElemOp::Mul, &[x, x]);
        b.output(sq);
        let dag = b.build().unwrap();
        assert_eq!(topological_order(&dag), vec![x, sq]);
    }

    #[test]
    fn test_last_uses() {
        let dag = diamond();
        let order = topological_order(&dag);
        assert_eq!(last_uses(&dag, &order), vec![2, 3, 3, 3]);
    }

    #[test]
    fn test_compute_at_eligibility() {
        let dag = diamond();
        assert!(!compute_at_eligible(&dag, NodeId(0), 1, 100));
        assert!(compute_at_eligible(&dag, NodeId(1), 100, 100));
        assert!(!compute_at_eligible(&dag, NodeId(1), 101, 100));
        assert!(!compute_at_eligible(&dag, NodeId(3), 1, 100));
    }
}
