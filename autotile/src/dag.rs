use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::common::{AxisId, DimRange, Dtype, DIM_MAX, MAX_RANK};

/// Index of a [ComputeNode] in a [ComputeDag] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct NodeId(pub u32);

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum ElemOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Exp,
    Log,
    Abs,
    Relu,
    Sqrt,
    Rsqrt,
    Cast,
    Adds,
    Muls,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    Prod,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum PoolMode {
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ReduceAxes {
    Known(Vec<AxisId>),
    /// The reduced axes are an input of the operator and only known at launch.
    Dynamic,
}

/// Sliding-window parameters over the two innermost (spatial) dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Window {
    pub kernel: [u32; 2],
    pub stride: [u32; 2],
    /// Padding as `[top, bottom, left, right]`.
    pub pad: [u32; 4],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum NodeKind {
    Placeholder,
    Elementwise(ElemOp),
    Broadcast,
    Reduce { op: ReduceOp, axes: ReduceAxes },
    Pool { mode: PoolMode, window: Window },
    Conv2d { window: Window },
    Matmul,
    /// An op-kind the front end produced but no classifier rule exists for.
    Unregistered(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeFlags {
    /// Marks a node the front end lowered from a convolution-like operator.
    pub cube: bool,
    /// Cleared to forbid atomic-accumulate tiling of a reduce node.
    pub atomic_capable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ComputeNode {
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    pub shape: Vec<DimRange>,
    pub dtype: Dtype,
    pub flags: NodeFlags,
}

/// An arena of tensor-algebra nodes.
///
/// Nodes may only reference nodes with smaller ids, so a [ComputeDag] is acyclic by
/// construction. It is immutable once built and may be shared freely between threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDag {
    nodes: Vec<ComputeNode>,
    outputs: Vec<NodeId>,
    consumers: Vec<Vec<NodeId>>,
}

#[derive(Debug, Default)]
pub struct DagBuilder {
    nodes: Vec<ComputeNode>,
    outputs: Vec<NodeId>,
}

/// A front-end description of a DAG, with op-kinds given as strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DagDesc {
    pub nodes: Vec<NodeDesc>,
    pub outputs: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeDesc {
    pub op: String,
    #[serde(default)]
    pub inputs: Vec<u32>,
    pub shape: Vec<(u64, u64)>,
    pub dtype: Dtype,
    #[serde(default)]
    pub axes: Option<Vec<AxisId>>,
    #[serde(default)]
    pub window: Option<Window>,
    #[serde(default)]
    pub flags: NodeFlags,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("DAG has no nodes")]
    Empty,
    #[error("DAG has no outputs")]
    NoOutputs,
    #[error("node {node} references missing input {input}")]
    DanglingInput { node: NodeId, input: NodeId },
    #[error("node {node} references input {input}, which is not an earlier node")]
    ForwardReference { node: NodeId, input: NodeId },
    #[error("output {0} does not exist")]
    DanglingOutput(NodeId),
    #[error("node {node} has rank {rank}, more than the supported {MAX_RANK}")]
    RankTooLarge { node: NodeId, rank: usize },
    #[error("node {node} reduces axis {axis}, out of range")]
    ReduceAxisOutOfRange { node: NodeId, axis: AxisId },
    #[error("node {node} takes {expected} inputs but was given {actual}")]
    ArityMismatch {
        node: NodeId,
        expected: usize,
        actual: usize,
    },
    #[error("node {node} has inputs whose shapes do not broadcast to its output")]
    ShapeMismatch { node: NodeId },
    #[error("node {node} has an invalid dimension range")]
    InvalidDim { node: NodeId },
    #[error("node {node} has a window with a zero kernel or stride")]
    InvalidWindow { node: NodeId },
    #[error("node {node} ({op}) requires attribute `{attribute}`")]
    MissingAttribute {
        node: NodeId,
        op: String,
        attribute: &'static str,
    },
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl ElemOp {
    pub fn arity(&self) -> usize {
        match self {
            ElemOp::Add | ElemOp::Sub | ElemOp::Mul | ElemOp::Div | ElemOp::Max | ElemOp::Min => {
                2
            }
            ElemOp::Exp
            | ElemOp::Log
            | ElemOp::Abs
            | ElemOp::Relu
            | ElemOp::Sqrt
            | ElemOp::Rsqrt
            | ElemOp::Cast
            | ElemOp::Adds
            | ElemOp::Muls => 1,
        }
    }
}

impl Window {
    pub const IDENTITY: Window = Window {
        kernel: [1, 1],
        stride: [1, 1],
        pad: [0, 0, 0, 0],
    };

    /// Every kernel and stride extent is at least 1.
    pub fn is_valid(&self) -> bool {
        self.kernel.iter().chain(&self.stride).all(|&v| v >= 1)
    }

    /// The output extent of spatial dimension `dim` (0 = height, 1 = width) for an
    /// input extent, or `None` if the window is invalid or the padded input is
    /// smaller than the kernel.
    pub fn output_extent(&self, dim: usize, input: u64) -> Option<u64> {
        if !self.is_valid() {
            return None;
        }
        let padded = input + u64::from(self.pad[2 * dim]) + u64::from(self.pad[2 * dim + 1]);
        let kernel = u64::from(self.kernel[dim]);
        if padded < kernel {
            return None;
        }
        Some((padded - kernel) / u64::from(self.stride[dim]) + 1)
    }

    fn output_range(&self, dim: usize, input: &DimRange) -> Option<DimRange> {
        let min = self.output_extent(dim, input.min())?.max(1);
        let max = if input.is_unbounded() {
            DIM_MAX
        } else {
            self.output_extent(dim, input.max())?
        };
        DimRange::try_new(min, max.max(min))
    }
}

impl NodeKind {
    /// Parses a front-end op-kind string such as `elewise_binary_add` or `reduce_sum`.
    ///
    /// Strings naming no known kind are preserved as [NodeKind::Unregistered].
    pub fn parse(op: &str, axes: Option<&[AxisId]>, window: Option<Window>) -> NodeKind {
        let unregistered = || NodeKind::Unregistered(op.to_string());
        if op == "placeholder" {
            return NodeKind::Placeholder;
        }
        if op == "broadcast" {
            return NodeKind::Broadcast;
        }
        if op == "matmul" {
            return NodeKind::Matmul;
        }
        if op == "conv2d" {
            return window.map_or_else(unregistered, |window| NodeKind::Conv2d { window });
        }
        if let Some(name) = op
            .strip_prefix("elewise_single_")
            .or_else(|| op.strip_prefix("elewise_binary_"))
        {
            return ElemOp::from_str(name).map_or_else(|_| unregistered(), NodeKind::Elementwise);
        }
        if let Some(name) = op.strip_prefix("reduce_") {
            let Ok(reduce_op) = ReduceOp::from_str(name) else {
                return unregistered();
            };
            let axes = match axes {
                Some(a) => ReduceAxes::Known(a.to_vec()),
                None => ReduceAxes::Dynamic,
            };
            return NodeKind::Reduce {
                op: reduce_op,
                axes,
            };
        }
        if let Some(name) = op.strip_prefix("pooling2d_") {
            return match (PoolMode::from_str(name), window) {
                (Ok(mode), Some(window)) => NodeKind::Pool { mode, window },
                _ => unregistered(),
            };
        }
        unregistered()
    }

    pub fn is_cube(&self) -> bool {
        matches!(self, NodeKind::Conv2d { .. } | NodeKind::Matmul)
    }

    pub fn window(&self) -> Option<Window> {
        match self {
            NodeKind::Pool { window, .. } | NodeKind::Conv2d { window } => Some(*window),
            NodeKind::Matmul => Some(Window::IDENTITY),
            _ => None,
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Placeholder => write!(f, "placeholder"),
            NodeKind::Elementwise(op) => write!(f, "elewise_{op}"),
            NodeKind::Broadcast => write!(f, "broadcast"),
            NodeKind::Reduce {
                op,
                axes: ReduceAxes::Known(axes),
            } => write!(f, "reduce_{op}{axes:?}"),
            NodeKind::Reduce {
                op,
                axes: ReduceAxes::Dynamic,
            } => write!(f, "reduce_{op}[?]"),
            NodeKind::Pool { mode, window } => {
                write!(f, "pooling2d_{mode}(k={:?}, s={:?})", window.kernel, window.stride)
            }
            NodeKind::Conv2d { window } => {
                write!(f, "conv2d(k={:?}, s={:?})", window.kernel, window.stride)
            }
            NodeKind::Matmul => write!(f, "matmul"),
            NodeKind::Unregistered(name) => write!(f, "{name}?"),
        }
    }
}

impl Default for NodeFlags {
    fn default() -> Self {
        NodeFlags {
            cube: false,
            atomic_capable: true,
        }
    }
}

impl ComputeNode {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_cube(&self) -> bool {
        self.flags.cube || self.kind.is_cube()
    }
}

impl ComputeDag {
    pub fn builder() -> DagBuilder {
        DagBuilder::default()
    }

    pub fn nodes(&self) -> &[ComputeNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &ComputeNode {
        &self.nodes[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }

    /// Nodes reading `id`, ordered by id. A node reading `id` twice appears once.
    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        &self.consumers[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The widest dtype of any node, in bytes.
    pub fn max_dtype_size(&self) -> u8 {
        self.nodes.iter().map(|n| n.dtype.size()).max().unwrap_or(1)
    }

    /// Returns `id` and every node it transitively reads.
    pub fn ancestors_or_self(&self, id: NodeId) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n.index()], true) {
                continue;
            }
            stack.extend(self.node(n).inputs.iter().copied());
        }
        seen
    }

    /// Returns `id` and every node transitively reading it.
    pub fn descendants_or_self(&self, id: NodeId) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n.index()], true) {
                continue;
            }
            stack.extend(self.consumers(n).iter().copied());
        }
        seen
    }
}

impl DagBuilder {
    fn push(&mut self, kind: NodeKind, inputs: Vec<NodeId>, shape: Vec<DimRange>, dtype: Dtype) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ComputeNode {
            kind,
            inputs,
            shape,
            dtype,
            flags: NodeFlags::default(),
        });
        id
    }

    fn shape_of(&self, id: NodeId) -> Vec<DimRange> {
        self.nodes
            .get(id.index())
            .map(|n| n.shape.clone())
            .unwrap_or_default()
    }

    fn dtype_of(&self, id: NodeId) -> Dtype {
        self.nodes
            .get(id.index())
            .map_or(Dtype::Float32, |n| n.dtype)
    }

    pub fn placeholder(&mut self, shape: Vec<DimRange>, dtype: Dtype) -> NodeId {
        self.push(NodeKind::Placeholder, vec![], shape, dtype)
    }

    /// Adds an elementwise node. The output shape is the broadcast of the input
    /// shapes; mismatches are reported by [DagBuilder::build].
    pub fn elementwise(&mut self, op: ElemOp, inputs: &[NodeId]) -> NodeId {
        let shapes = inputs.iter().map(|&i| self.shape_of(i)).collect::<Vec<_>>();
        let shape = broadcast_shapes(&shapes)
            .or_else(|| shapes.first().cloned())
            .unwrap_or_default();
        let dtype = inputs.first().map_or(Dtype::Float32, |&i| self.dtype_of(i));
        self.push(NodeKind::Elementwise(op), inputs.to_vec(), shape, dtype)
    }

    pub fn cast(&mut self, input: NodeId, dtype: Dtype) -> NodeId {
        let shape = self.shape_of(input);
        self.push(NodeKind::Elementwise(ElemOp::Cast), vec![input], shape, dtype)
    }

    pub fn broadcast(&mut self, input: NodeId, shape: Vec<DimRange>) -> NodeId {
        let dtype = self.dtype_of(input);
        self.push(NodeKind::Broadcast, vec![input], shape, dtype)
    }

    /// Adds a reduction over statically known axes.
    ///
    /// With `keep_dims`, reduced dimensions are kept with extent 1.
    pub fn reduce(&mut self, op: ReduceOp, input: NodeId, axes: &[AxisId], keep_dims: bool) -> NodeId {
        let in_shape = self.shape_of(input);
        let shape = in_shape
            .iter()
            .enumerate()
            .filter_map(|(i, d)| {
                let reduced = axes.iter().any(|&a| usize::from(a) == i);
                match (reduced, keep_dims) {
                    (false, _) => Some(*d),
                    (true, true) => Some(DimRange::known(1)),
                    (true, false) => None,
                }
            })
            .collect::<Vec<_>>();
        let shape = if shape.is_empty() {
            vec![DimRange::known(1)]
        } else {
            shape
        };
        let dtype = self.dtype_of(input);
        let kind = NodeKind::Reduce {
            op,
            axes: ReduceAxes::Known(axes.to_vec()),
        };
        self.push(kind, vec![input], shape, dtype)
    }

    /// Adds a reduction whose axes are only known at launch. Dimensions are kept,
    /// each ranging down to 1.
    pub fn reduce_dynamic(&mut self, op: ReduceOp, input: NodeId) -> NodeId {
        let shape = self
            .shape_of(input)
            .iter()
            .map(|d| DimRange::new(1, d.max()))
            .collect();
        let dtype = self.dtype_of(input);
        let kind = NodeKind::Reduce {
            op,
            axes: ReduceAxes::Dynamic,
        };
        self.push(kind, vec![input], shape, dtype)
    }

    /// Adds a 2-D pooling over an `[N, C, H, W]` input.
    pub fn pool(&mut self, mode: PoolMode, input: NodeId, window: Window) -> NodeId {
        let in_shape = self.shape_of(input);
        let shape = windowed_shape(&in_shape, None, &window).unwrap_or(in_shape);
        let dtype = self.dtype_of(input);
        self.push(NodeKind::Pool { mode, window }, vec![input], shape, dtype)
    }

    /// Adds a 2-D convolution of an `[N, Cin, H, W]` input with a
    /// `[Cout, Cin, KH, KW]` weight.
    pub fn conv2d(&mut self, input: NodeId, weight: NodeId, window: Window) -> NodeId {
        let in_shape = self.shape_of(input);
        let cout = self.shape_of(weight).first().copied();
        let shape = windowed_shape(&in_shape, cout, &window).unwrap_or(in_shape);
        let dtype = self.dtype_of(input);
        self.push(NodeKind::Conv2d { window }, vec![input, weight], shape, dtype)
    }

    /// Adds a `[M, K] x [K, N]` matrix multiplication.
    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let a_shape = self.shape_of(a);
        let b_shape = self.shape_of(b);
        let shape = match (a_shape.first(), b_shape.get(1)) {
            (Some(&m), Some(&n)) => vec![m, n],
            _ => a_shape,
        };
        let dtype = self.dtype_of(a);
        self.push(NodeKind::Matmul, vec![a, b], shape, dtype)
    }

    pub fn unregistered(
        &mut self,
        name: &str,
        inputs: &[NodeId],
        shape: Vec<DimRange>,
        dtype: Dtype,
    ) -> NodeId {
        self.push(
            NodeKind::Unregistered(name.to_string()),
            inputs.to_vec(),
            shape,
            dtype,
        )
    }

    pub fn set_flags(&mut self, id: NodeId, flags: NodeFlags) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.flags = flags;
        }
    }

    pub fn output(&mut self, id: NodeId) -> &mut Self {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        self
    }

    /// Validates the nodes and freezes them into a [ComputeDag].
    pub fn build(self) -> Result<ComputeDag, DagError> {
        let DagBuilder { nodes, outputs } = self;
        if nodes.is_empty() {
            return Err(DagError::Empty);
        }
        if outputs.is_empty() {
            return Err(DagError::NoOutputs);
        }
        for (idx, node) in nodes.iter().enumerate() {
            validate_node(&nodes, NodeId(idx as u32), node)?;
        }
        if let Some(&missing) = outputs.iter().find(|o| o.index() >= nodes.len()) {
            return Err(DagError::DanglingOutput(missing));
        }

        let mut consumers = vec![Vec::new(); nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            for input in &node.inputs {
                let list: &mut Vec<NodeId> = &mut consumers[input.index()];
                let id = NodeId(idx as u32);
                if list.last() != Some(&id) {
                    list.push(id);
                }
            }
        }
        Ok(ComputeDag {
            nodes,
            outputs,
            consumers,
        })
    }
}

fn validate_node(nodes: &[ComputeNode], id: NodeId, node: &ComputeNode) -> Result<(), DagError> {
    if node.shape.is_empty() {
        return Err(DagError::InvalidDim { node: id });
    }
    if node.shape.len() > MAX_RANK {
        return Err(DagError::RankTooLarge {
            node: id,
            rank: node.shape.len(),
        });
    }
    for &input in &node.inputs {
        if input.index() >= nodes.len() {
            return Err(DagError::DanglingInput { node: id, input });
        }
        if input >= id {
            return Err(DagError::ForwardReference { node: id, input });
        }
    }
    let expected_arity = match &node.kind {
        NodeKind::Placeholder => Some(0),
        NodeKind::Elementwise(op) => Some(op.arity()),
        NodeKind::Broadcast | NodeKind::Reduce { .. } | NodeKind::Pool { .. } => Some(1),
        NodeKind::Conv2d { .. } | NodeKind::Matmul => Some(2),
        NodeKind::Unregistered(_) => None,
    };
    if let Some(expected) = expected_arity {
        if node.inputs.len() != expected {
            return Err(DagError::ArityMismatch {
                node: id,
                expected,
                actual: node.inputs.len(),
            });
        }
    }
    match &node.kind {
        NodeKind::Elementwise(_) => {
            let shapes = node
                .inputs
                .iter()
                .map(|i| nodes[i.index()].shape.clone())
                .collect::<Vec<_>>();
            match broadcast_shapes(&shapes) {
                Some(s) if s == node.shape => {}
                _ => return Err(DagError::ShapeMismatch { node: id }),
            }
        }
        NodeKind::Reduce {
            axes: ReduceAxes::Known(axes),
            ..
        } => {
            let rank = nodes[node.inputs[0].index()].shape.len();
            if let Some(&axis) = axes.iter().find(|&&a| usize::from(a) >= rank) {
                return Err(DagError::ReduceAxisOutOfRange { node: id, axis });
            }
        }
        NodeKind::Pool { window, .. } | NodeKind::Conv2d { window } => {
            if !window.is_valid() {
                return Err(DagError::InvalidWindow { node: id });
            }
            let channels = match node.kind {
                NodeKind::Conv2d { .. } => {
                    let weight = &nodes[node.inputs[1].index()].shape;
                    if weight.len() != 4 {
                        return Err(DagError::ShapeMismatch { node: id });
                    }
                    Some(weight[0])
                }
                _ => None,
            };
            let input = &nodes[node.inputs[0].index()].shape;
            match windowed_shape(input, channels, window) {
                Some(s) if s == node.shape => {}
                _ => return Err(DagError::ShapeMismatch { node: id }),
            }
        }
        NodeKind::Broadcast => {
            let input = &nodes[node.inputs[0].index()].shape;
            let Some(offset) = node.shape.len().checked_sub(input.len()) else {
                return Err(DagError::ShapeMismatch { node: id });
            };
            let aligned = input
                .iter()
                .zip(&node.shape[offset..])
                .all(|(i, o)| *i == DimRange::known(1) || i == o);
            if !aligned {
                return Err(DagError::ShapeMismatch { node: id });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Computes the numpy-style broadcast of `shapes`, aligned at the innermost
/// dimension. Returns `None` if two non-unit ranges do not overlap.
pub fn broadcast_shapes(shapes: &[Vec<DimRange>]) -> Option<Vec<DimRange>> {
    let rank = shapes.iter().map(Vec::len).max()?;
    let mut out = vec![DimRange::known(1); rank];
    for shape in shapes {
        let offset = rank - shape.len();
        for (i, d) in shape.iter().enumerate() {
            let cur = &mut out[offset + i];
            if *d == DimRange::known(1) {
                continue;
            }
            if *cur == DimRange::known(1) {
                *cur = *d;
            } else {
                *cur = cur.intersect(d)?;
            }
        }
    }
    Some(out)
}

fn windowed_shape(
    input: &[DimRange],
    channels: Option<DimRange>,
    window: &Window,
) -> Option<Vec<DimRange>> {
    let [n, c, h, w] = input else {
        return None;
    };
    if !window.is_valid() {
        return None;
    }
    Some(vec![
        *n,
        channels.unwrap_or(*c),
        window.output_range(0, h)?,
        window.output_range(1, w)?,
    ])
}

impl TryFrom<DagDesc> for ComputeDag {
    type Error = DagError;

    fn try_from(desc: DagDesc) -> Result<Self, Self::Error> {
        let mut nodes = Vec::with_capacity(desc.nodes.len());
        for (idx, node) in desc.nodes.into_iter().enumerate() {
            let id = NodeId(idx as u32);
            let shape = node
                .shape
                .iter()
                .map(|&(lo, hi)| DimRange::try_new(lo, hi))
                .collect::<Option<Vec<_>>>()
                .ok_or(DagError::InvalidDim { node: id })?;
            let kind = NodeKind::parse(&node.op, node.axes.as_deref(), node.window);
            if matches!(kind, NodeKind::Unregistered(_))
                && (node.op == "conv2d" || node.op.starts_with("pooling2d_"))
                && node.window.is_none()
            {
                return Err(DagError::MissingAttribute {
                    node: id,
                    op: node.op,
                    attribute: "window",
                });
            }
            nodes.push(ComputeNode {
                kind,
                inputs: node.inputs.into_iter().map(NodeId).collect(),
                shape,
                dtype: node.dtype,
                flags: node.flags,
            });
        }
        DagBuilder {
            nodes,
            outputs: desc.outputs.into_iter().map(NodeId).collect(),
        }
        .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lo: u64, hi: u64) -> DimRange {
        DimRange::new(lo, hi)
    }

    #[test]
    fn test_builder_infers_broadcast_shape() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![range(1, 64), DimRange::known(16)], Dtype::Float16);
        let y = b.placeholder(vec![DimRange::known(16)], Dtype::Float16);
        let z = b.elementwise(ElemOp::Add, &[x, y]);
        b.output(z);
        let dag = b.build().unwrap();
        assert_eq!(dag.node(z).shape, vec![range(1, 64), DimRange::known(16)]);
        assert_eq!(dag.node(z).dtype, Dtype::Float16);
        assert_eq!(dag.consumers(x), &[z]);
        assert_eq!(dag.consumers(y), &[z]);
    }

    #[test]
    fn test_build_rejects_mismatched_shapes() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(8)], Dtype::Float32);
        let y = b.placeholder(vec![DimRange::known(9)], Dtype::Float32);
        let z = b.elementwise(ElemOp::Mul, &[x, y]);
        b.output(z);
        assert_eq!(b.build(), Err(DagError::ShapeMismatch { node: z }));
    }

    #[test]
    fn test_build_rejects_empty_and_outputless() {
        assert_eq!(ComputeDag::builder().build(), Err(DagError::Empty));
        let mut b = ComputeDag::builder();
        b.placeholder(vec![DimRange::known(8)], Dtype::Float32);
        assert_eq!(b.build(), Err(DagError::NoOutputs));
    }

    #[test]
    fn test_build_rejects_reduce_axis_out_of_range() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(8)], Dtype::Float32);
        let r = b.reduce(ReduceOp::Sum, x, &[3], false);
        b.output(r);
        assert_eq!(
            b.build(),
            Err(DagError::ReduceAxisOutOfRange { node: r, axis: 3 })
        );
    }

    #[test]
    fn test_pool_shape_inference() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(
            vec![
                DimRange::known(1),
                DimRange::known(16),
                range(8, 64),
                range(8, 64),
            ],
            Dtype::Float16,
        );
        let window = Window {
            kernel: [3, 3],
            stride: [2, 2],
            pad: [0, 0, 0, 0],
        };
        let p = b.pool(PoolMode::Max, x, window);
        b.output(p);
        let dag = b.build().unwrap();
        assert_eq!(dag.node(p).shape[2], range(3, 31));
        assert_eq!(dag.node(p).shape[3], range(3, 31));
    }

    fn nchw(b: &mut DagBuilder) -> NodeId {
        b.placeholder(
            vec![
                DimRange::known(1),
                DimRange::known(16),
                range(8, 64),
                range(8, 64),
            ],
            Dtype::Float16,
        )
    }

    #[test]
    fn test_zero_stride_window_is_rejected() {
        let window = Window {
            kernel: [3, 3],
            stride: [0, 2],
            pad: [0, 0, 0, 0],
        };
        assert_eq!(window.output_extent(0, 64), None);
        let mut b = ComputeDag::builder();
        let x = nchw(&mut b);
        let p = b.pool(PoolMode::Max, x, window);
        b.output(p);
        assert_eq!(b.build(), Err(DagError::InvalidWindow { node: p }));
    }

    #[test]
    fn test_zero_kernel_window_is_rejected() {
        let window = Window {
            kernel: [3, 0],
            stride: [1, 1],
            pad: [1, 1, 1, 1],
        };
        assert_eq!(window.output_extent(1, 64), None);
        let mut b = ComputeDag::builder();
        let x = nchw(&mut b);
        let w = b.placeholder(
            vec![
                DimRange::known(32),
                DimRange::known(16),
                DimRange::known(3),
                DimRange::known(1),
            ],
            Dtype::Float16,
        );
        let c = b.conv2d(x, w, window);
        b.output(c);
        assert_eq!(b.build(), Err(DagError::InvalidWindow { node: c }));
    }

    #[test]
    fn test_desc_pool_shape_must_follow_window() {
        let pool = |shape: Vec<(u64, u64)>| DagDesc {
            nodes: vec![
                NodeDesc {
                    op: "placeholder".into(),
                    inputs: vec![],
                    shape: vec![(1, 1), (16, 16), (8, 64), (8, 64)],
                    dtype: Dtype::Float16,
                    axes: None,
                    window: None,
                    flags: NodeFlags::default(),
                },
                NodeDesc {
                    op: "pooling2d_max".into(),
                    inputs: vec![0],
                    shape,
                    dtype: Dtype::Float16,
                    axes: None,
                    window: Some(Window {
                        kernel: [3, 3],
                        stride: [2, 2],
                        pad: [0, 0, 0, 0],
                    }),
                    flags: NodeFlags::default(),
                },
            ],
            outputs: vec![1],
        };
        assert_eq!(
            ComputeDag::try_from(pool(vec![(1, 1), (16, 16), (8, 64), (8, 64)])),
            Err(DagError::ShapeMismatch { node: NodeId(1) })
        );
        assert!(ComputeDag::try_from(pool(vec![(1, 1), (16, 16), (3, 31), (3, 31)])).is_ok());
    }

    #[test]
    fn test_conv_weight_must_be_rank_4() {
        let mut b = ComputeDag::builder();
        let x = nchw(&mut b);
        let w = b.placeholder(vec![DimRange::known(32), DimRange::known(16)], Dtype::Float16);
        let c = b.conv2d(x, w, Window::IDENTITY);
        b.output(c);
        assert_eq!(b.build(), Err(DagError::ShapeMismatch { node: c }));
    }

    #[test]
    fn test_broadcast_shape_must_extend_input() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(1), DimRange::known(8)], Dtype::Float32);
        let y = b.broadcast(x, vec![range(1, 16), DimRange::known(8)]);
        b.output(y);
        assert!(b.build().is_ok());

        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(4)], Dtype::Float32);
        let y = b.broadcast(x, vec![range(1, 16), DimRange::known(5)]);
        b.output(y);
        assert_eq!(b.build(), Err(DagError::ShapeMismatch { node: y }));

        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(2), DimRange::known(4)], Dtype::Float32);
        let y = b.broadcast(x, vec![DimRange::known(4)]);
        b.output(y);
        assert_eq!(b.build(), Err(DagError::ShapeMismatch { node: y }));
    }

    #[test]
    fn test_desc_preserves_unknown_op_kinds() {
        let desc = DagDesc {
            nodes: vec![
                NodeDesc {
                    op: "placeholder".into(),
                    inputs: vec![],
                    shape: vec![(1, 1024)],
                    dtype: Dtype::Float32,
                    axes: None,
                    window: None,
                    flags: NodeFlags::default(),
                },
                NodeDesc {
                    op: "elewise_single_frobnicate".into(),
                    inputs: vec![0],
                    shape: vec![(1, 1024)],
                    dtype: Dtype::Float32,
                    axes: None,
                    window: None,
                    flags: NodeFlags::default(),
                },
            ],
            outputs: vec![1],
        };
        let dag = ComputeDag::try_from(desc).unwrap();
        assert_eq!(
            dag.node(NodeId(1)).kind,
            NodeKind::Unregistered("elewise_single_frobnicate".into())
        );
    }

    #[test]
    fn test_parse_op_kinds() {
        assert_eq!(
            NodeKind::parse("elewise_binary_add", None, None),
            NodeKind::Elementwise(ElemOp::Add)
        );
        assert_eq!(
            NodeKind::parse("reduce_sum", Some(&[1]), None),
            NodeKind::Reduce {
                op: ReduceOp::Sum,
                axes: ReduceAxes::Known(vec![1])
            }
        );
        assert_eq!(
            NodeKind::parse("reduce_max", None, None),
            NodeKind::Reduce {
                op: ReduceOp::Max,
                axes: ReduceAxes::Dynamic
            }
        );
        assert!(matches!(
            NodeKind::parse("pooling2d_max", None, None),
            NodeKind::Unregistered(_)
        ));
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::known(4)], Dtype::Float32);
        let e = b.elementwise(ElemOp::Exp, &[x]);
        let y = b.placeholder(vec![DimRange::known(4)], Dtype::Float32);
        let z = b.elementwise(ElemOp::Add, &[e, y]);
        b.output(z);
        let dag = b.build().unwrap();
        let anc = dag.ancestors_or_self(e);
        assert!(anc[x.index()] && anc[e.index()] && !anc[y.index()] && !anc[z.index()]);
        let desc = dag.descendants_or_self(x);
        assert!(desc[x.index()] && desc[e.index()] && desc[z.index()] && !desc[y.index()]);
    }
}
