use std::collections::HashMap;

use crate::case::TilingCase;
use crate::common::Dtype;
use crate::dag::{ComputeDag, NodeId};
use crate::info::compute_at_eligible;
use crate::storage::{buffer_bytes, LiveSet};
use crate::target::{BufferScope, SCOPE_COUNT};

use super::{
    ComputeAt, EmitInsn, Hardware, LoopNode, LoopVar, Schedule, ScheduleError, ScheduleNode, Stage,
};

/// The stage layout a pattern scheduler produces, before storage decisions.
#[derive(Debug, Clone, Default)]
pub(crate) struct Plan {
    pub roots: Vec<PlanNode>,
}

#[derive(Debug, Clone)]
pub(crate) enum PlanNode {
    Loop(LoopVar, Vec<PlanNode>),
    Stage(PlannedStage),
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedStage {
    pub node: Option<NodeId>,
    pub insn: EmitInsn,
    pub scope: BufferScope,
    pub elems: u64,
    pub dtype: Dtype,
    /// Runs once per innermost tile rather than once per enclosing loop.
    pub in_tile: bool,
    /// Forced buffer reuse, e.g. a reduce writing its accumulator.
    pub reuses: Option<NodeId>,
}

impl PlannedStage {
    pub fn tile(node: NodeId, insn: EmitInsn, scope: BufferScope, elems: u64, dtype: Dtype) -> Self {
        PlannedStage {
            node: Some(node),
            insn,
            scope,
            elems,
            dtype,
            in_tile: true,
            reuses: None,
        }
    }

    pub fn outside(self) -> Self {
        PlannedStage {
            in_tile: false,
            ..self
        }
    }

    pub fn reusing(self, node: NodeId) -> Self {
        PlannedStage {
            reuses: Some(node),
            ..self
        }
    }
}

impl From<PlannedStage> for PlanNode {
    fn from(stage: PlannedStage) -> Self {
        PlanNode::Stage(stage)
    }
}

/// Wraps `body` in `loops`, outermost first.
pub(crate) fn nest(loops: &[LoopVar], body: Vec<PlanNode>) -> Vec<PlanNode> {
    loops
        .iter()
        .rev()
        .fold(body, |body, &var| vec![PlanNode::Loop(var, body)])
}

/// Like [nest], but runs `before` and `after` inside `loops[..level]`, around
/// the loops from `level` inward.
pub(crate) fn nest_split(
    loops: &[LoopVar],
    level: usize,
    before: Vec<PlanNode>,
    tile: Vec<PlanNode>,
    after: Vec<PlanNode>,
) -> Vec<PlanNode> {
    let level = level.min(loops.len());
    let mut mid = before;
    mid.extend(nest(&loops[level..], tile));
    mid.extend(after);
    nest(&loops[..level], mid)
}

/// Whether a stage materializes its node in an on-chip buffer.
pub(super) fn produces(stage: &Stage) -> bool {
    produces_insn(stage.node, stage.insn, stage.scope)
}

fn produces_insn(node: Option<NodeId>, insn: EmitInsn, scope: BufferScope) -> bool {
    node.is_some()
        && scope.is_on_chip()
        && !matches!(
            insn,
            EmitInsn::DmaCopyOut { .. } | EmitInsn::AtomicAdd | EmitInsn::ZeroInit
        )
}

/// The node buffers a stage reads.
fn reads(dag: &ComputeDag, node: Option<NodeId>, insn: EmitInsn, reuses: Option<NodeId>) -> Vec<NodeId> {
    let Some(node) = node else {
        return vec![];
    };
    let mut out = match insn {
        EmitInsn::DmaCopyIn { .. } | EmitInsn::ReduceInit(_) | EmitInsn::ZeroInit => vec![],
        EmitInsn::DmaCopyOut { .. } | EmitInsn::AtomicAdd => vec![node],
        EmitInsn::Vector(_)
        | EmitInsn::VectorBroadcast
        | EmitInsn::VectorReduce(_)
        | EmitInsn::VectorPool(_)
        | EmitInsn::Mmad => {
            let mut inputs = dag.node(node).inputs.clone();
            inputs.sort_unstable();
            inputs.dedup();
            inputs
        }
    };
    if let Some(p) = reuses {
        if !out.contains(&p) {
            out.push(p);
        }
    }
    out
}

struct StageFacts {
    reads: Vec<NodeId>,
    produces: Option<NodeId>,
    /// Ids of the enclosing loops, outermost first.
    path: Vec<usize>,
}

/// When each node instance (a node and the stage that produced it) is last
/// read.
///
/// A read inside a loop that does not enclose the producer keeps the instance
/// live until that loop ends.
pub(super) struct Lifetimes {
    /// Instances to release after each stage.
    releases: Vec<Vec<(NodeId, usize)>>,
    ends: HashMap<(NodeId, usize), usize>,
}

fn lifetimes(facts: &[StageFacts]) -> Lifetimes {
    let mut loop_end: HashMap<usize, usize> = HashMap::new();
    for (k, f) in facts.iter().enumerate() {
        for &l in &f.path {
            loop_end.insert(l, k);
        }
    }
    let mut current: HashMap<NodeId, usize> = HashMap::new();
    let mut ends: HashMap<(NodeId, usize), usize> = HashMap::new();
    for (k, f) in facts.iter().enumerate() {
        for n in &f.reads {
            let Some(&origin) = current.get(n) else {
                continue;
            };
            let origin_path = &facts[origin].path;
            let common = f
                .path
                .iter()
                .zip(origin_path)
                .take_while(|(a, b)| a == b)
                .count();
            let effective = f.path.get(common).map_or(k, |l| loop_end[l]);
            let end = ends.entry((*n, origin)).or_insert(origin);
            *end = (*end).max(effective);
        }
        if let Some(n) = f.produces {
            current.insert(n, k);
            ends.entry((n, k)).or_insert(k);
        }
    }
    let mut releases = vec![vec![]; facts.len()];
    for (&instance, &end) in &ends {
        releases[end].push(instance);
    }
    for r in &mut releases {
        r.sort_unstable();
    }
    Lifetimes { releases, ends }
}

/// Loop-aware lifetimes for the stages of a finished schedule, in pre-order.
pub(super) fn schedule_lifetimes<'a>(
    dag: &ComputeDag,
    roots: &'a [ScheduleNode],
) -> (Vec<&'a Stage>, Lifetimes) {
    fn walk<'a>(
        dag: &ComputeDag,
        nodes: &'a [ScheduleNode],
        path: &mut Vec<usize>,
        next_loop: &mut usize,
        out: &mut Vec<(&'a Stage, StageFacts)>,
    ) {
        for n in nodes {
            match n {
                ScheduleNode::Loop(l) => {
                    path.push(*next_loop);
                    *next_loop += 1;
                    walk(dag, &l.body, path, next_loop, out);
                    path.pop();
                }
                ScheduleNode::Stage(s) => out.push((
                    s,
                    StageFacts {
                        reads: reads(dag, s.node, s.insn, s.reuses),
                        produces: s.node.filter(|_| produces(s)),
                        path: path.clone(),
                    },
                )),
            }
        }
    }
    let mut flat = vec![];
    walk(dag, roots, &mut vec![], &mut 0, &mut flat);
    let (stages, facts): (Vec<_>, Vec<_>) = flat.into_iter().unzip();
    (stages, lifetimes(&facts))
}

fn plan_facts(dag: &ComputeDag, roots: &[PlanNode]) -> Vec<StageFacts> {
    fn walk(
        dag: &ComputeDag,
        nodes: &[PlanNode],
        path: &mut Vec<usize>,
        next_loop: &mut usize,
        out: &mut Vec<StageFacts>,
    ) {
        for n in nodes {
            match n {
                PlanNode::Loop(_, body) => {
                    path.push(*next_loop);
                    *next_loop += 1;
                    walk(dag, body, path, next_loop, out);
                    path.pop();
                }
                PlanNode::Stage(s) => out.push(StageFacts {
                    reads: reads(dag, s.node, s.insn, s.reuses),
                    produces: s.node.filter(|_| produces_insn(s.node, s.insn, s.scope)),
                    path: path.clone(),
                }),
            }
        }
    }
    let mut out = vec![];
    walk(dag, roots, &mut vec![], &mut 0, &mut out);
    out
}

/// Buffer ownership while stages execute in order.
#[derive(Default)]
pub(super) struct Replay {
    pub live: LiveSet,
    holders: HashMap<(NodeId, usize), (BufferScope, u64)>,
    current: HashMap<NodeId, usize>,
}

impl Replay {
    /// Hands `from`'s live buffer to `to`, produced at stage `k`.
    pub fn transfer(&mut self, from: NodeId, to: NodeId, k: usize) -> bool {
        let Some(&origin) = self.current.get(&from) else {
            return false;
        };
        let Some(buffer) = self.holders.remove(&(from, origin)) else {
            return false;
        };
        if from != to {
            self.current.remove(&from);
        }
        self.holders.insert((to, k), buffer);
        self.current.insert(to, k);
        true
    }

    /// Allocates a buffer for `node` at stage `k`; returns the scope's new
    /// live total.
    pub fn alloc(&mut self, node: NodeId, k: usize, scope: BufferScope, bytes: u64) -> u64 {
        self.holders.insert((node, k), (scope, bytes));
        self.current.insert(node, k);
        self.live.alloc(scope, bytes)
    }

    pub fn release(&mut self, lifetimes: &Lifetimes, k: usize) {
        for instance in &lifetimes.releases[k] {
            if let Some((scope, bytes)) = self.holders.remove(instance) {
                self.live.free(scope, bytes);
            }
        }
    }

    /// The live buffer `node` holds, if its current instance ends at `k`.
    fn dying_buffer(&self, lifetimes: &Lifetimes, node: NodeId, k: usize) -> Option<(BufferScope, u64)> {
        let origin = *self.current.get(&node)?;
        if lifetimes.ends.get(&(node, origin)) != Some(&k) {
            return None;
        }
        self.holders.get(&(node, origin)).copied()
    }

    pub fn peak(&self) -> [u64; SCOPE_COUNT] {
        self.live.peak()
    }
}

/// Threads liveness through a [Plan] in execution order. Decides where each
/// node is computed and which buffers are shared, and checks every on-chip
/// scope against the target's capacity.
pub(super) struct ScheduleBuilder<'a> {
    dag: &'a ComputeDag,
    case: &'a TilingCase,
    hw: &'a Hardware,
    lifetimes: Lifetimes,
    replay: Replay,
    position: usize,
}

impl<'a> ScheduleBuilder<'a> {
    pub fn new(dag: &'a ComputeDag, case: &'a TilingCase, hw: &'a Hardware) -> Self {
        ScheduleBuilder {
            dag,
            case,
            hw,
            lifetimes: Lifetimes {
                releases: vec![],
                ends: HashMap::new(),
            },
            replay: Replay::default(),
            position: 0,
        }
    }

    pub fn realize(mut self, plan: Plan) -> Result<Schedule, ScheduleError> {
        self.lifetimes = lifetimes(&plan_facts(self.dag, &plan.roots));
        let roots = self.realize_nodes(&plan.roots, None)?;
        Ok(Schedule {
            case: self.case.clone(),
            roots,
            peak_bytes: self.replay.peak(),
        })
    }

    fn realize_nodes(
        &mut self,
        nodes: &[PlanNode],
        enclosing: Option<LoopVar>,
    ) -> Result<Vec<ScheduleNode>, ScheduleError> {
        let mut out = Vec::with_capacity(nodes.len());
        for n in nodes {
            out.push(match n {
                PlanNode::Loop(var, body) => ScheduleNode::Loop(LoopNode {
                    var: *var,
                    body: self.realize_nodes(body, Some(*var))?,
                }),
                PlanNode::Stage(s) => ScheduleNode::Stage(self.realize_stage(s, enclosing)?),
            });
        }
        Ok(out)
    }

    fn realize_stage(&mut self, s: &PlannedStage, enclosing: Option<LoopVar>) -> Result<Stage, ScheduleError> {
        let k = self.position;
        self.position += 1;
        let block = self.hw.block_bytes;
        let mut stage = Stage {
            node: s.node,
            insn: s.insn,
            scope: s.scope,
            compute_at: match (s.in_tile, enclosing) {
                (true, _) => ComputeAt::Tile,
                (false, None) => ComputeAt::Root,
                (false, Some(var)) => ComputeAt::Loop {
                    axis: var.axis,
                    kind: var.kind,
                },
            },
            double_buffer: false,
            bytes: buffer_bytes(s.elems, s.dtype, false, block),
            reuses: None,
        };
        let Some(node) = s.node.filter(|_| produces_insn(s.node, s.insn, s.scope)) else {
            self.replay.release(&self.lifetimes, k);
            return Ok(stage);
        };

        if let Some(p) = s.reuses {
            if self.replay.transfer(p, node, k) {
                stage.reuses = Some(p);
            } else {
                self.alloc(node, k, s.scope, stage.bytes)?;
            }
            self.replay.release(&self.lifetimes, k);
            return Ok(stage);
        }

        if s.in_tile {
            let remaining = self
                .hw
                .capacity(s.scope)
                .saturating_sub(self.replay.live.live(s.scope));
            match self.dag.consumers(node).first() {
                Some(&c) if compute_at_eligible(self.dag, node, stage.bytes, remaining) => {
                    stage.compute_at = ComputeAt::Consumer(c);
                }
                _ => {
                    stage.double_buffer = self.case.is_db;
                    stage.bytes = buffer_bytes(s.elems, s.dtype, stage.double_buffer, block);
                }
            }
        }
        match self.reusable_input(node, k, &stage) {
            Some(p) => {
                self.replay.transfer(p, node, k);
                stage.reuses = Some(p);
            }
            None => self.alloc(node, k, s.scope, stage.bytes)?,
        }
        self.replay.release(&self.lifetimes, k);
        Ok(stage)
    }

    /// An elementwise tile stage may write into an input whose last read it
    /// is, when that buffer lives in the same scope and is large enough.
    fn reusable_input(&self, node: NodeId, k: usize, stage: &Stage) -> Option<NodeId> {
        if !matches!(stage.insn, EmitInsn::Vector(_)) || stage.compute_at == ComputeAt::Root {
            return None;
        }
        self.dag.node(node).inputs.iter().copied().find(|&p| {
            matches!(
                self.replay.dying_buffer(&self.lifetimes, p, k),
                Some((scope, bytes)) if scope == stage.scope && bytes >= stage.bytes
            )
        })
    }

    fn alloc(&mut self, node: NodeId, k: usize, scope: BufferScope, bytes: u64) -> Result<(), ScheduleError> {
        let required = self.replay.alloc(node, k, scope, bytes);
        let capacity = self.hw.capacity(scope);
        if required > capacity {
            return Err(ScheduleError::StorageOverflow {
                scope,
                required,
                capacity,
            });
        }
        Ok(())
    }
}
