//! Trace-time representation of a tensor program.
//!
//! The front end records operations through a [`Tracer`]; each call appends one
//! immutable [`Node`] to the [`Graph`]. Indexed stores never mutate a node: they append
//! a new node standing for the updated tensor and the caller's handle is rebound to it.
//! Loops are explicit [`LoopRegion`]s whose carried values are matched by position.

mod typing;
pub use typing::*;
mod index;
pub use index::*;
mod op;
pub use op::*;
pub(crate) mod eval;
mod tensor;
pub use tensor::*;

use std::fmt;

use crate::error::*;

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub dtype: DType,
    pub shape: Shape,
    // innermost loop body the node was traced in
    pub region: Option<LoopId>,
}

impl Node {
    /// Iteration domain of the parallel pass computing this node.
    pub fn domain(&self) -> &Shape {
        match &self.op {
            Op::Store { domain, .. } | Op::Scatter { domain, .. } => domain,
            _ => &self.shape,
        }
    }
}

/// Trip count of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extent {
    Fixed(usize),
    // scalar int32 node read at run time, negative counts run zero iterations
    Node(NodeId),
}

/// One loop-carried value: `init` enters the loop, `param` names it inside the body,
/// `next` is what the body produces for the following iteration and `result` is the
/// value after the last iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Carry {
    pub init: NodeId,
    pub param: NodeId,
    pub next: NodeId,
    pub result: NodeId,
}

#[derive(Debug, Clone)]
pub struct LoopRegion {
    pub id: LoopId,
    pub parent: Option<LoopId>,
    pub end: Extent,
    pub counter: NodeId,
    pub carries: Vec<Carry>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) loops: Vec<LoopRegion>,
    pub(crate) symbols: Symbols,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
}

impl Graph {
    /// Record a graph by running the front end's building routine.
    pub fn trace<F>(boundary: Boundary, f: F) -> Result<Graph>
        where F: for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>
    {
        // we have to make an internally mutable variable for implicit recording
        let cell = std::cell::RefCell::new(Trace::new(boundary));
        let outputs = f(Tracer::new(&cell))?.iter().map(|t| t.id()).collect::<Vec<_>>();
        let mut trace = cell.into_inner();
        if let Some(err) = trace.error.take() { return Err(err) }
        if outputs.is_empty() { return invalid("a program needs at least one output") }
        let mut graph = trace.graph;
        for &out in &outputs {
            if graph.node(out).region.is_some() { return invalid(format!("output {out} escaped its loop body")) }
        }
        graph.outputs = outputs;
        log::debug!("traced {} nodes, {} loops", graph.len(), graph.loops.len());
        Ok(graph)
    }

    // push a new node, used to create tensors
    pub(crate) fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }
    pub fn node(&self, id: NodeId) -> &Node { &self.nodes[id.0] }
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }
    pub fn region(&self, id: LoopId) -> &LoopRegion { &self.loops[id.0] }
    pub fn regions(&self) -> &[LoopRegion] { &self.loops }
    pub fn inputs(&self) -> &[NodeId] { &self.inputs }
    pub fn outputs(&self) -> &[NodeId] { &self.outputs }
    pub fn symbols(&self) -> &Symbols { &self.symbols }

    /// Whether code in region `inner` may read values of region `outer`.
    pub fn visible(&self, outer: Option<LoopId>, inner: Option<LoopId>) -> bool {
        let mut at = inner;
        loop {
            if at == outer { return true }
            match at {
                Some(r) => at = self.loops[r.0].parent,
                None => return false,
            }
        }
    }

    // the child of `outer` on the path down to `inner`, if `inner` lies strictly inside
    pub(crate) fn child_towards(&self, outer: Option<LoopId>, inner: Option<LoopId>) -> Option<LoopId> {
        let mut at = inner?;
        loop {
            let parent = self.loops[at.0].parent;
            if parent == outer { return Some(at) }
            at = parent?;
        }
    }

    /// Human readable operation listing.
    pub fn listing(&self) -> String { self.to_string() }
}

fn write_index(f: &mut fmt::Formatter<'_>, index: &Index) -> fmt::Result {
    f.write_str("[")?;
    for (k, a) in index.iter().enumerate() {
        if k > 0 { f.write_str(", ")? }
        match a { Access::Idx(i) => write!(f, "{i}")?, Access::Value(n) => write!(f, "{n}")? }
    }
    f.write_str("]")
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, node) in self.nodes() {
            let mut depth = 0;
            let mut at = node.region;
            while let Some(r) = at { depth += 1; at = self.loops[r.0].parent }
            write!(f, "{:indent$}{id}: {}{} = {}(", "", node.dtype, node.shape, node.op.name(), indent = depth * 2)?;
            match &node.op {
                Op::Input { slot } => write!(f, "#{slot}")?,
                Op::Const { value } => write!(f, "{value}")?,
                Op::IndexValue { expr } => write!(f, "{expr}")?,
                Op::Load { src, index, boundary } => {
                    write!(f, "{src}")?; write_index(f, index)?; write!(f, ", {}", boundary.name())?
                }
                Op::Store { target, value, index, .. } | Op::Scatter { target, value, index, .. } => {
                    write!(f, "{target}")?; write_index(f, index)?; write!(f, ", {value}")?
                }
                Op::Reduce { x, axis, .. } => write!(f, "{x}, axis={axis}")?,
                Op::LoopCounter { region } => write!(f, "loop{}", region.0)?,
                Op::LoopParam { region, slot } | Op::LoopResult { region, slot } => write!(f, "loop{}#{slot}", region.0)?,
                op => {
                    for (k, up) in op.upstream().iter().enumerate() {
                        if k > 0 { f.write_str(", ")? }
                        write!(f, "{up}")?;
                    }
                }
            }
            writeln!(f, ")")?;
        }
        f.write_str("outputs:")?;
        for out in &self.outputs { write!(f, " {out}")? }
        writeln!(f)
    }
}
