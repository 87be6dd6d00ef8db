use serde::{Deserialize, Serialize};

use crate::common::Dtype;
use crate::dag::{ComputeDag, NodeId, NodeKind};
use crate::info::{last_uses, topological_order};
use crate::target::{BufferScope, Target, SCOPE_COUNT};

/// How many buffers a tile keeps live beyond the DAG's own intermediates, and
/// whether each is double-buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct BufferPolicy {
    pub double_buffer: bool,
    pub extra_buffers: u32,
}

/// Running per-scope live bytes and their peaks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    live: [u64; SCOPE_COUNT],
    peak: [u64; SCOPE_COUNT],
}

pub fn align_up(value: u64, align: u64) -> u64 {
    divrem::DivCeil::div_ceil(value, align) * align
}

pub fn align_down(value: u64, align: u64) -> u64 {
    value / align * align
}

/// Bytes of an on-chip buffer holding `elems` values, padded to `block_bytes`
/// and doubled when double-buffered.
pub fn buffer_bytes(elems: u64, dtype: Dtype, db: bool, block_bytes: u32) -> u64 {
    let bytes = align_up(
        elems.saturating_mul(u64::from(dtype.size())),
        u64::from(block_bytes),
    );
    if db {
        bytes.saturating_mul(2)
    } else {
        bytes
    }
}

impl BufferPolicy {
    pub const SINGLE: BufferPolicy = BufferPolicy {
        double_buffer: false,
        extra_buffers: 0,
    };

    pub const DOUBLE: BufferPolicy = BufferPolicy {
        double_buffer: true,
        extra_buffers: 0,
    };

    pub fn with_extra(self, extra_buffers: u32) -> Self {
        BufferPolicy {
            extra_buffers: self.extra_buffers + extra_buffers,
            ..self
        }
    }

    fn factor(&self) -> u64 {
        if self.double_buffer {
            2
        } else {
            1
        }
    }
}

/// The on-chip scope a node's tile lives in.
pub fn residency(dag: &ComputeDag, id: NodeId) -> BufferScope {
    let node = dag.node(id);
    if node.is_cube() {
        return BufferScope::L0c;
    }
    if matches!(node.kind, NodeKind::Placeholder) {
        let consumers = dag.consumers(id);
        if !consumers.is_empty() && consumers.iter().all(|&c| dag.node(c).is_cube()) {
            return BufferScope::L1;
        }
    }
    BufferScope::Ub
}

/// The most UB-resident node tiles live at once over a topological sweep, plus
/// the policy's extra buffers.
pub fn max_live_buffers(dag: &ComputeDag, policy: BufferPolicy) -> u32 {
    let order = topological_order(dag);
    let last = last_uses(dag, &order);
    let mut ends = Vec::new();
    let mut peak = 0;
    for (pos, &id) in order.iter().enumerate() {
        ends.retain(|&end| end >= pos);
        if residency(dag, id) == BufferScope::Ub {
            ends.push(last[id.index()]);
        }
        peak = peak.max(ends.len());
    }
    (peak as u32).max(1) + policy.extra_buffers
}

/// The largest tile, in elements, that keeps every live buffer within the
/// unified buffer. A multiple of the target's block size.
pub fn ub_capacity_elems<Tgt: Target>(dag: &ComputeDag, policy: BufferPolicy) -> u64 {
    let live = u64::from(max_live_buffers(dag, policy));
    let per_elem = u64::from(dag.max_dtype_size()) * live * policy.factor();
    align_down(
        Tgt::capacity(BufferScope::Ub) / per_elem,
        u64::from(Tgt::block_bytes()),
    )
}

impl LiveSet {
    /// Adds `bytes` to `scope` and returns its new live total.
    pub fn alloc(&mut self, scope: BufferScope, bytes: u64) -> u64 {
        let live = &mut self.live[scope.index()];
        *live = live.saturating_add(bytes);
        let peak = &mut self.peak[scope.index()];
        *peak = (*peak).max(*live);
        *live
    }

    pub fn free(&mut self, scope: BufferScope, bytes: u64) {
        let live = &mut self.live[scope.index()];
        *live = live.saturating_sub(bytes);
    }

    pub fn live(&self, scope: BufferScope) -> u64 {
        self.live[scope.index()]
    }

    pub fn peak(&self) -> [u64; SCOPE_COUNT] {
        self.peak
    }
}
