//! Fusion planner: partitions a traced graph into kernels and orders them.
//!
//! A kernel is one parallel pass over an iteration domain. Its member nodes are
//! evaluated per element in node order; a reduction member runs an accumulation loop
//! over the reduced axis, evaluating its inner members once per step. Buffers read by
//! a kernel are the outputs of earlier steps or values bound from outside (inputs,
//! loop counters and carried values).

mod passes;
mod fuse;
mod schedule;

use std::fmt;
use std::sync::Arc;

use crate::error::*;
use crate::pre::*;

pub use fuse::FusionMode;

/// Members of the accumulation loop of one reduction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Inner {
    pub reduce: NodeId,
    pub body: Vec<NodeId>,
}

/// How an output buffer is filled before the kernel writes into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Init {
    // every element equal to a literal
    Fill(Scalar),
    // copy of another buffer with the same layout
    Copy(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Output {
    pub node: NodeId,
    pub init: Option<Init>,
    // write members landing in this buffer, in order; the last one is `node`
    pub chain: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Kernel {
    pub id: usize,
    pub region: Option<LoopId>,
    pub domain: Shape,
    pub body: Vec<NodeId>,
    pub inner: Vec<Inner>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<Output>,
    // scatter-accumulate members need atomic combines
    pub atomic: bool,
}

impl Kernel {
    /// Output buffer a member writes, for write members and materialized values.
    pub fn dest(&self, member: NodeId) -> Option<usize> {
        self.outputs.iter().position(|o| o.node == member || o.chain.contains(&member))
    }
    pub fn input(&self, node: NodeId) -> Option<usize> {
        self.inputs.iter().position(|&n| n == node)
    }
    pub fn inner(&self, reduce: NodeId) -> Option<&Inner> {
        self.inner.iter().find(|i| i.reduce == reduce)
    }
    /// Every node evaluated by the kernel.
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.body.iter().copied().chain(self.inner.iter().flat_map(|i| i.body.iter().copied()))
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |ids: &[NodeId]| ids.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        write!(f, "kernel {} over {}", self.id, self.domain)?;
        if self.atomic { f.write_str(" atomic")? }
        writeln!(f)?;
        writeln!(f, "  in: {}", list(&self.inputs))?;
        writeln!(f, "  body: {}", list(&self.body))?;
        for inner in &self.inner {
            writeln!(f, "  accumulate {}: {}", inner.reduce, list(&inner.body))?;
        }
        for out in &self.outputs {
            write!(f, "  out: {}", out.node)?;
            match out.init {
                Some(Init::Fill(v)) => write!(f, " = fill({v})")?,
                Some(Init::Copy(n)) => write!(f, " = copy({n})")?,
                None => {},
            }
            if out.chain.len() > 1 { write!(f, " via {}", list(&out.chain))? }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A sequential loop whose body runs once per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopStep {
    pub region: LoopId,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Kernel(usize),
    Loop(LoopStep),
}

/// Ordered steps of one region, with the buffers to release after each step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Block {
    pub steps: Vec<Step>,
    pub frees: Vec<Vec<NodeId>>,
}

/// A planned program: kernels, their order and the graph they were cut from.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) graph: Arc<Graph>,
    pub(crate) kernels: Vec<Kernel>,
    pub(crate) main: Block,
    pub(crate) mode: FusionMode,
    signature: String,
}

impl Program {
    /// Simplify and partition a traced graph.
    pub fn plan(graph: &Graph, mode: FusionMode) -> Result<Program> {
        let graph = passes::simplify(graph);
        passes::check_resolvable(&graph)?;
        let kernels = fuse::partition(&graph, mode);
        let main = schedule::block(&graph, &kernels, None);
        log::debug!("planned {} kernels from {} nodes ({mode:?} fusion)", kernels.len(), graph.len());
        let mut program = Program { graph: Arc::new(graph), kernels, main, mode, signature: String::new() };
        program.signature = program.structural_hash();
        Ok(program)
    }

    pub fn graph(&self) -> &Graph { &self.graph }
    pub fn kernels(&self) -> &[Kernel] { &self.kernels }
    pub fn main(&self) -> &Block { &self.main }
    pub fn mode(&self) -> FusionMode { self.mode }

    /// Structural signature, identical for identically traced programs.
    pub fn signature(&self) -> &str { &self.signature }

    fn structural_hash(&self) -> String {
        use sha2::*;
        let mut hasher = Sha256::new();
        hasher.update(self.graph.to_string());
        hasher.update(self.listing());
        for s in 0..self.graph.symbols.len() {
            hasher.update(format!("s{s}={};", self.graph.symbols.canon(&Dim::Var(s))));
        }
        hex::encode(hasher.finalize())
    }

    /// Kernel and step listing.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for k in &self.kernels { out += &k.to_string() }
        write_block(&mut out, &self.main, 0);
        out
    }
}

fn write_block(out: &mut String, block: &Block, depth: usize) {
    for (step, frees) in block.steps.iter().zip(&block.frees) {
        match step {
            Step::Kernel(k) => *out += &format!("{:indent$}run kernel {k}", "", indent = depth * 2),
            Step::Loop(l) => {
                *out += &format!("{:indent$}loop{} {{\n", "", l.region.0, indent = depth * 2);
                write_block(out, &l.body, depth + 1);
                *out += &format!("{:indent$}}}", "", indent = depth * 2);
            }
        }
        if !frees.is_empty() {
            *out += " free";
            for n in frees { *out += &format!(" {n}") }
        }
        out.push('\n');
    }
}

// operands that are read as buffers when `node` is evaluated outside their kernel;
// literals are inlined everywhere except as a load source
pub(crate) fn buffer_operands(graph: &Graph, node: &Node) -> Vec<NodeId> {
    let index_values = |index: &Index| index.iter().filter_map(|a| match a {
        Access::Value(n) => Some(*n), Access::Idx(_) => None }).collect::<Vec<_>>();
    let mut out = match &node.op {
        Op::Load { src, index, .. } => {
            let mut v = index_values(index);
            v.retain(|n| !is_const(graph, *n));
            v.insert(0, *src);
            return v;
        }
        Op::Store { value, index, .. } | Op::Scatter { value, index, .. } => {
            let mut v = vec![*value];
            v.extend(index_values(index));
            v
        }
        op => op.upstream().to_vec(),
    };
    out.retain(|n| !is_const(graph, *n));
    out
}

pub(crate) fn is_const(graph: &Graph, n: NodeId) -> bool {
    matches!(graph.node(n).op, Op::Const { .. })
}

// where the buffer of a write's target comes from
pub(crate) fn init_of(graph: &Graph, target: NodeId) -> Init {
    match graph.node(target).op {
        Op::Const { value } => Init::Fill(value),
        _ => Init::Copy(target),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    fn stencil(mode: FusionMode) -> Program {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let u = t.input(&[8, 8], F32)?;
            let idx = u.indices();
            let (i, j) = (&idx[0], &idx[1]);
            let s = u.at([i - 1, j.clone()])? + u.at([i + 1, j.clone()])? + u.at([i.clone(), j - 1])? + u.at([i.clone(), j + 1])?;
            Ok(vec![s * 0.25])
        }).unwrap();
        Program::plan(&g, mode).unwrap()
    }

    #[test]
    fn stencil_fuses_into_one_kernel() {
        let p = stencil(FusionMode::Max);
        assert_eq!(p.kernels().len(), 1);
        let k = &p.kernels()[0];
        assert_eq!(k.inputs, vec![p.graph().inputs()[0]]);
        assert_eq!(k.outputs.len(), 1);
        assert_eq!(p.main().steps, vec![Step::Kernel(0)]);
    }

    #[test]
    fn minimal_fusion_splits_every_node() {
        let p = stencil(FusionMode::None);
        // four loads, three adds and the scale
        assert_eq!(p.kernels().len(), 8);
        assert!(p.kernels().iter().all(|k| k.body.len() == 1));
    }

    #[test]
    fn signature_is_structural() {
        let (a, b) = (stencil(FusionMode::Max), stencil(FusionMode::Max));
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().len(), 64);
        assert_ne!(a.signature(), stencil(FusionMode::None).signature());
    }

    #[test]
    fn reduction_result_materializes_before_broadcast() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let x = t.input(&[4, 6], F32)?;
            let row = (&x * 2.0).sum(-1)?;
            let i = t.indices(&sh([4, 6]));
            Ok(vec![&x - &row.at([&i[0]])?])
        }).unwrap();
        let p = Program::plan(&g, FusionMode::Max).unwrap();
        assert_eq!(p.kernels().len(), 2);
        let reduce = &p.kernels()[0];
        assert_eq!(reduce.domain, sh([4]));
        assert_eq!(reduce.inner.len(), 1);
        // the scale runs inside the accumulation loop
        assert_eq!(reduce.inner[0].body.len(), 1);
        assert_eq!(p.kernels()[1].inputs.len(), 2);
    }

    #[test]
    fn unresolvable_symbol_is_rejected() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let shape = t.dims(&[-1])?;
            Ok(vec![t.zeros(&shape, F32)? + 1.0])
        }).unwrap();
        assert!(matches!(Program::plan(&g, FusionMode::Max), Err(Error::ShapeUnresolvable(_))));
    }
}
