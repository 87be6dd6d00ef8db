mod builder;
mod norm;
mod reduce;
mod vector;
mod window;

pub(crate) use builder::{Plan, PlanNode, PlannedStage};

use enum_dispatch::enum_dispatch;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::axis::AxisInfo;
use crate::case::{FactorBound, TilingCase};
use crate::classify::Pattern;
use crate::common::{AxisId, DimRange, Dtype};
use crate::dag::{ComputeDag, ElemOp, NodeId, NodeKind, PoolMode, ReduceOp};
use crate::storage::residency;
use crate::target::{BufferScope, Target, SCOPE_COUNT};

use norm::NormScheduler;
use reduce::ReduceScheduler;
use vector::VectorScheduler;
use window::WindowScheduler;

/// A compile-ready plan for one [TilingCase]: a loop tree whose leaves are
/// stages, each binding one node to a buffer scope and an instruction kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub case: TilingCase,
    pub roots: Vec<ScheduleNode>,
    /// Peak live bytes per [BufferScope] (indexed by [BufferScope::index]).
    pub peak_bytes: [u64; SCOPE_COUNT],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleNode {
    Loop(LoopNode),
    Stage(Stage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopNode {
    pub var: LoopVar,
    pub body: Vec<ScheduleNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopVar {
    pub axis: AxisId,
    pub kind: LoopKind,
    pub factor: FactorBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum LoopKind {
    /// Bound to the core index.
    Block,
    BlockInner,
    UbOuter,
    /// The innermost on-chip loop.
    UbInner,
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputeAt {
    /// Outside every loop.
    Root,
    /// Inside the loop over `axis` of kind `kind`, outside any loop it encloses.
    Loop { axis: AxisId, kind: LoopKind },
    Tile,
    /// Inlined into the single consumer's stage.
    Consumer(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub node: Option<NodeId>,
    pub insn: EmitInsn,
    pub scope: BufferScope,
    pub compute_at: ComputeAt,
    pub double_buffer: bool,
    pub bytes: u64,
    /// The node whose buffer this stage writes into instead of allocating.
    pub reuses: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmitInsn {
    DmaCopyIn { from: BufferScope },
    DmaCopyOut { to: BufferScope },
    Vector(ElemOp),
    VectorBroadcast,
    VectorReduce(ReduceOp),
    ReduceInit(ReduceOp),
    ZeroInit,
    AtomicAdd,
    VectorPool(PoolMode),
    Mmad,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{scope} overflow: {required} bytes live, capacity {capacity}")]
    StorageOverflow {
        scope: BufferScope,
        required: u64,
        capacity: u64,
    },
    #[error("Split axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: AxisId, rank: usize },
    #[error("Case pattern {0} does not match the DAG")]
    PatternMismatch(Pattern),
    #[error("Atomic accumulation requires the reduce to be the sole output")]
    AtomicWithEpilogue,
}

impl Display for EmitInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitInsn::DmaCopyIn { from } => write!(f, "copy_in {from}"),
            EmitInsn::DmaCopyOut { to } => write!(f, "copy_out {to}"),
            EmitInsn::Vector(op) => write!(f, "v{op}"),
            EmitInsn::VectorBroadcast => write!(f, "vbroadcast"),
            EmitInsn::VectorReduce(op) => write!(f, "vreduce_{op}"),
            EmitInsn::ReduceInit(op) => write!(f, "init_{op}"),
            EmitInsn::ZeroInit => write!(f, "zero_init"),
            EmitInsn::AtomicAdd => write!(f, "atomic_add"),
            EmitInsn::VectorPool(mode) => write!(f, "vpool_{mode}"),
            EmitInsn::Mmad => write!(f, "mmad"),
        }
    }
}

impl Display for ComputeAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeAt::Root => write!(f, "root"),
            ComputeAt::Loop { axis, kind } => write!(f, "{kind} {axis}"),
            ComputeAt::Tile => write!(f, "tile"),
            ComputeAt::Consumer(n) => write!(f, "at {n}"),
        }
    }
}

/// Hardware parameters a scheduler reads, taken from a [Target].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardware {
    pub capacity: [u64; SCOPE_COUNT],
    pub block_bytes: u32,
    pub cores: u32,
}

impl Hardware {
    pub fn of<Tgt: Target>() -> Self {
        let mut capacity = [0; SCOPE_COUNT];
        for scope in <BufferScope as strum::IntoEnumIterator>::iter() {
            capacity[scope.index()] = Tgt::capacity(scope);
        }
        Hardware {
            capacity,
            block_bytes: Tgt::block_bytes(),
            cores: Tgt::core_count(),
        }
    }

    pub fn capacity(&self, scope: BufferScope) -> u64 {
        self.capacity[scope.index()]
    }
}

/// Lays out the stages of one pattern family for a case.
#[enum_dispatch]
pub(crate) trait PatternScheduler {
    fn plan(&self, dag: &ComputeDag, case: &TilingCase, hw: &Hardware) -> Result<Plan, ScheduleError>;
}

#[enum_dispatch(PatternScheduler)]
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scheduler {
    VectorScheduler,
    ReduceScheduler,
    NormScheduler,
    WindowScheduler,
}

impl Scheduler {
    pub fn for_pattern(pattern: Pattern) -> Self {
        match pattern {
            Pattern::ElementwiseOnly | Pattern::PureBroadcast => VectorScheduler.into(),
            Pattern::KnownReduce | Pattern::UnknownReduce => ReduceScheduler.into(),
            Pattern::Norm => NormScheduler.into(),
            Pattern::Pooling | Pattern::Cube => WindowScheduler.into(),
        }
    }
}

/// Builds the schedule of one case.
///
/// Fails without side effects; a partially built schedule is never returned.
pub fn build_schedule<Tgt: Target>(dag: &ComputeDag, case: &TilingCase) -> Result<Schedule, ScheduleError> {
    let hw = Hardware::of::<Tgt>();
    let plan = Scheduler::for_pattern(case.pattern).plan(dag, case, &hw)?;
    let schedule = builder::ScheduleBuilder::new(dag, case, &hw).realize(plan)?;
    debug!(
        "built schedule for case {} with peak UB {} bytes",
        case.tiling_key(),
        schedule.peak_bytes[BufferScope::Ub.index()]
    );
    Ok(schedule)
}

impl Schedule {
    /// Stages in execution (pre-order) order, with their loop depth.
    pub fn stages(&self) -> Vec<(usize, &Stage)> {
        fn walk<'a>(nodes: &'a [ScheduleNode], depth: usize, out: &mut Vec<(usize, &'a Stage)>) {
            for n in nodes {
                match n {
                    ScheduleNode::Loop(l) => walk(&l.body, depth + 1, out),
                    ScheduleNode::Stage(s) => out.push((depth, s)),
                }
            }
        }
        let mut out = vec![];
        walk(&self.roots, 0, &mut out);
        out
    }

    /// Loop variables in pre-order.
    pub fn loops(&self) -> Vec<&LoopVar> {
        fn walk<'a>(nodes: &'a [ScheduleNode], out: &mut Vec<&'a LoopVar>) {
            for n in nodes {
                if let ScheduleNode::Loop(l) = n {
                    out.push(&l.var);
                    walk(&l.body, out);
                }
            }
        }
        let mut out = vec![];
        walk(&self.roots, &mut out);
        out
    }

    /// Replays the finished stages to recompute peak live bytes per scope,
    /// independent of the bookkeeping done while building.
    pub fn recompute_peak(&self, dag: &ComputeDag) -> [u64; SCOPE_COUNT] {
        let (stages, lifetimes) = builder::schedule_lifetimes(dag, &self.roots);
        let mut replay = builder::Replay::default();
        for (k, stage) in stages.iter().enumerate() {
            if let (Some(node), true) = (stage.node, builder::produces(stage)) {
                let reused = stage
                    .reuses
                    .map_or(false, |p| replay.transfer(p, node, k));
                if !reused {
                    replay.alloc(node, k, stage.scope, stage.bytes);
                }
            }
            replay.release(&lifetimes, k);
        }
        replay.peak()
    }
}

/// The loop nest shared by vector and reduce schedules: the block loop bound
/// to cores, remaining outer parallel axes in dimension order, then the ub
/// split.
///
/// Outer reduce axes are walked inside every parallel loop, and inside the
/// ub outer loop when the ub axis is parallel, so an accumulator opened at
/// the first reduce loop never outlives one tile's outputs.
pub(crate) fn loop_vars(case: &TilingCase, axes: &[AxisInfo]) -> Result<Vec<LoopVar>, ScheduleError> {
    let rank = axes.len();
    for axis in [case.block_split_axis, case.ub_split_axis].into_iter().flatten() {
        if usize::from(axis) >= rank {
            return Err(ScheduleError::AxisOutOfRange { axis, rank });
        }
    }
    let var = |axis: usize, kind, factor| LoopVar {
        axis: axis as AxisId,
        kind,
        factor,
    };
    let block = case.block_split_axis.map(usize::from);
    let ub = case.ub_split_axis.map(usize::from);
    let mut loops = vec![];
    if let Some(b) = block {
        loops.push(var(b, LoopKind::Block, case.block_factor_bound));
    }
    let Some(split_end) = ub.or(block) else {
        return Ok(loops);
    };
    let mut reduce_loops = vec![];
    for (i, axis) in axes.iter().enumerate().take(split_end) {
        let outer = if Some(i) == block {
            var(i, LoopKind::BlockInner, FactorBound::new(1, case.block_factor_bound.max))
        } else {
            var(i, LoopKind::Serial, FactorBound::new(1, axis.extent.max()))
        };
        if axis.is_reduce() {
            reduce_loops.push(outer);
        } else {
            loops.push(outer);
        }
    }
    match ub {
        Some(u) => {
            let ub_outer = var(u, LoopKind::UbOuter, FactorBound::new(1, axes[u].extent.max()));
            if axes[u].is_reduce() {
                loops.extend(reduce_loops);
                loops.push(ub_outer);
            } else {
                loops.push(ub_outer);
                loops.extend(reduce_loops);
            }
            loops.push(var(u, LoopKind::UbInner, case.ub_factor_bound));
        }
        None => loops.extend(reduce_loops),
    }
    Ok(loops)
}

/// The most elements of `id` one tile holds.
pub(crate) fn tile_elems_of(dag: &ComputeDag, id: NodeId, tile: u64) -> u64 {
    DimRange::product(&dag.node(id).shape).max().min(tile).max(1)
}

/// The stage computing `id` from its inputs, or loading it if it is a
/// placeholder.
pub(crate) fn compute_stage(
    dag: &ComputeDag,
    id: NodeId,
    elems: u64,
    pattern: Pattern,
) -> Result<PlannedStage, ScheduleError> {
    let node = dag.node(id);
    let (insn, scope, dtype) = match &node.kind {
        NodeKind::Placeholder => (
            EmitInsn::DmaCopyIn {
                from: BufferScope::Global,
            },
            residency(dag, id),
            node.dtype,
        ),
        NodeKind::Elementwise(op) => (EmitInsn::Vector(*op), BufferScope::Ub, node.dtype),
        NodeKind::Broadcast => (EmitInsn::VectorBroadcast, BufferScope::Ub, node.dtype),
        NodeKind::Reduce { op, .. } => (EmitInsn::VectorReduce(*op), BufferScope::Ub, node.dtype),
        NodeKind::Pool { mode, .. } => (EmitInsn::VectorPool(*mode), BufferScope::Ub, node.dtype),
        NodeKind::Conv2d { .. } | NodeKind::Matmul => (EmitInsn::Mmad, BufferScope::L0c, Dtype::Float32),
        NodeKind::Unregistered(_) => return Err(ScheduleError::PatternMismatch(pattern)),
    };
    Ok(PlannedStage::tile(id, insn, scope, elems, dtype))
}

pub(crate) fn copy_out(dag: &ComputeDag, id: NodeId, elems: u64, to: BufferScope) -> PlannedStage {
    PlannedStage::tile(id, EmitInsn::DmaCopyOut { to }, to, elems, dag.node(id).dtype)
}

/// The tile stage for `id`, followed by its copy-out when it is an output.
pub(crate) fn tile_stages(
    dag: &ComputeDag,
    id: NodeId,
    elems: u64,
    pattern: Pattern,
) -> Result<Vec<PlanNode>, ScheduleError> {
    let mut out = vec![compute_stage(dag, id, elems, pattern)?.into()];
    if dag.is_output(id) {
        out.push(copy_out(dag, id, elems, BufferScope::Global).into());
    }
    Ok(out)
}
