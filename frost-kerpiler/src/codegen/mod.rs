//! Kernel source generation.
//!
//! Lowering walks a kernel's members in order and asks a [`Dialect`] for the
//! concrete syntax of every statement. Dialects are stateless, so the same kernel and
//! target always render to the same text.

mod c;
mod hlsl;

use std::collections::HashSet;
use std::fmt::{self, Write};

use crate::error::*;
use crate::ker::*;
use crate::pre::*;

pub use c::CDialect;
pub use hlsl::HlslDialect;

/// Backend a program is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Target {
    /// portable C with OpenMP annotations
    #[default]
    C,
    /// HLSL compute shaders
    Hlsl,
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self { Target::C => "c", Target::Hlsl => "hlsl" }
    }
    pub fn parse(s: &str) -> Option<Target> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "cpu" => Some(Target::C),
            "hlsl" | "gpu" => Some(Target::Hlsl),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Statement syntax of one backend.
pub trait Dialect: Send + Sync {
    fn target(&self) -> Target;
    /// helpers every unit starts with
    fn prelude(&self) -> &'static str;
    /// function head and the parallel loop binding `gid` over `total` points
    fn open(&self, name: &str, kernel: &Kernel, total: &str) -> String;
    fn close(&self) -> &'static str;
    fn index_type(&self) -> &'static str;
    fn ty(&self, dtype: DType) -> &'static str;
    fn literal(&self, value: Scalar) -> String;
    /// extent of a dynamic dimension class
    fn dim(&self, symbol: usize) -> String;
    fn load(&self, buffer: usize, offset: &str, dtype: DType) -> String;
    fn store(&self, buffer: usize, offset: &str, dtype: DType, value: &str) -> String;
    /// order independent combine of `value` into an element, safe under parallel writers
    fn combine(&self, op: ScatterOp, buffer: usize, offset: &str, dtype: DType, value: &str) -> String;
    fn unary(&self, op: UnaryOp, dtype: DType, x: &str) -> String;
    fn cast(&self, to: DType, x: &str) -> String;
    fn min_max(&self, max: bool, dtype: DType, a: &str, b: &str) -> String;
    fn float_call(&self, name: &str, args: &[&str]) -> String;

    fn binary(&self, op: BinaryOp, dtype: DType, a: &str, b: &str) -> String {
        use BinaryOp::*;
        let int = dtype.is_integer();
        let suffix = if dtype == DType::U32 { "u32" } else { "i32" };
        match op {
            Add => format!("({a} + {b})"),
            Sub => format!("({a} - {b})"),
            Mul => format!("({a} * {b})"),
            Div if int => format!("div_{suffix}({a}, {b})"),
            Div => format!("({a} / {b})"),
            Mod if int => format!("mod_{suffix}({a}, {b})"),
            Mod => self.float_call("fmod", &[a, b]),
            Min => self.min_max(false, dtype, a, b),
            Max => self.min_max(true, dtype, a, b),
            Pow => self.float_call("pow", &[a, b]),
            Atan2 => self.float_call("atan2", &[a, b]),
            Lt => format!("({a} < {b})"),
            Le => format!("({a} <= {b})"),
            Gt => format!("({a} > {b})"),
            Ge => format!("({a} >= {b})"),
            Eq => format!("({a} == {b})"),
            Ne => format!("({a} != {b})"),
            And if dtype == DType::Bool => format!("({a} && {b})"),
            Or if dtype == DType::Bool => format!("({a} || {b})"),
            Xor if dtype == DType::Bool => format!("({a} != {b})"),
            And => format!("({a} & {b})"),
            Or => format!("({a} | {b})"),
            Xor => format!("({a} ^ {b})"),
            Shl => format!("({a} << ({b} & 31))"),
            Shr => format!("({a} >> ({b} & 31))"),
        }
    }
}

// unary operations both dialects spell as a plain float function
fn math_name(op: UnaryOp) -> Option<&'static str> {
    use UnaryOp::*;
    Some(match op {
        Floor => "floor", Ceil => "ceil", Round => "round", Trunc => "trunc",
        Sin => "sin", Cos => "cos", Tan => "tan", Asin => "asin", Acos => "acos", Atan => "atan",
        Sinh => "sinh", Cosh => "cosh", Tanh => "tanh",
        Exp => "exp", Exp2 => "exp2", Log => "log", Log2 => "log2", Sqrt => "sqrt",
        _ => return None,
    })
}

static C: CDialect = CDialect;
static HLSL: HlslDialect = HlslDialect;

/// The dialect of a target. Selection is a pure function of the target.
pub fn dialect(target: Target) -> &'static dyn Dialect {
    match target { Target::C => &C, Target::Hlsl => &HLSL }
}

/// Name of the entry point of a kernel.
pub fn entry_name(kernel: &Kernel) -> String { format!("kernel_{}", kernel.id) }

/// Source text of one kernel, a standalone unit with its own prelude.
pub fn render(graph: &Graph, kernel: &Kernel, target: Target) -> Result<String> {
    Ok(dialect(target).prelude().to_string() + &render_kernel(graph, kernel, target)?)
}

fn render_kernel(graph: &Graph, kernel: &Kernel, target: Target) -> Result<String> {
    let mut lower = Lower::new(graph, kernel, dialect(target));
    lower.kernel().map_err(|_| Error::InvalidTrace(format!("failed to format kernel {}", kernel.id)))?;
    Ok(lower.out)
}

/// Source text of every kernel of a program, in kernel order, after one shared prelude.
pub fn render_program(program: &Program, target: Target) -> Result<String> {
    let mut out = dialect(target).prelude().to_string();
    for k in program.kernels() {
        out += &render_kernel(program.graph(), k, target)?;
        out.push('\n');
    }
    Ok(out)
}

// the point a statement is evaluated at
#[derive(Clone)]
struct Point {
    axes: Vec<String>,
    // members visible at this point
    scope: Vec<NodeId>,
}

struct Lower<'a> {
    graph: &'a Graph,
    kernel: &'a Kernel,
    d: &'a dyn Dialect,
    members: HashSet<NodeId>,
    out: String,
    depth: usize,
}

impl<'a> Lower<'a> {
    fn new(graph: &'a Graph, kernel: &'a Kernel, d: &'a dyn Dialect) -> Self {
        Lower { graph, kernel, d, members: kernel.members().collect(), out: String::new(), depth: 0 }
    }

    fn line(&mut self, text: &str) -> fmt::Result {
        writeln!(self.out, "{:indent$}{text}", "", indent = self.depth * 4)
    }

    fn dim(&self, dim: &Dim) -> String {
        match self.graph.symbols().canon(dim) {
            Dim::Fix(n) => n.to_string(),
            Dim::Var(s) => self.d.dim(s),
            Dim::Add(a, b) => format!("({} + {})", self.dim(&a), self.dim(&b)),
            Dim::Sub(a, b) => format!("({} - {})", self.dim(&a), self.dim(&b)),
            Dim::Mul(a, b) => format!("({} * {})", self.dim(&a), self.dim(&b)),
            Dim::Div(a, b) => format!("({} / {})", self.dim(&a), self.dim(&b)),
        }
    }

    // row-major offset of `coords` in `shape`
    fn offset(&self, shape: &Shape, coords: &[String]) -> String {
        let mut acc = String::from("0");
        for (k, c) in coords.iter().enumerate() {
            acc = if k == 0 { c.clone() } else { format!("({acc} * {} + {c})", self.dim(shape.dim(k))) };
        }
        acc
    }

    // read a value that lives in a buffer, broadcast against the point
    fn broadcast(&self, n: NodeId, at: &Point) -> String {
        let node = self.graph.node(n);
        let lead = at.axes.len().saturating_sub(node.shape.rank());
        let coords = node.shape.dims().iter().enumerate().map(|(k, d)| {
            if self.graph.symbols().canon(d) == Dim::Fix(1) { "0".to_string() } else { at.axes[lead + k].clone() }
        }).collect::<Vec<_>>();
        let buffer = self.kernel.input(n).unwrap_or(0);
        self.d.load(buffer, &self.offset(&node.shape, &coords), node.dtype)
    }

    fn operand(&self, n: NodeId, at: &Point) -> String {
        match self.graph.node(n).op {
            Op::Const { value } => self.d.literal(value),
            _ if at.scope.contains(&n) => format!("v{}", n.0),
            _ => self.broadcast(n, at),
        }
    }

    fn index(&self, index: &Index, boundary: Boundary, shape: &Shape, at: &Point) -> String {
        let (div, rem) = ("fdiv", "fmod_i");
        let coords = index.iter().enumerate().map(|(axis, a)| {
            let raw = match a {
                Access::Idx(i) => i.render(&at.axes, div, rem),
                Access::Value(v) => format!("(({}){})", self.d.index_type(), self.operand(*v, at)),
            };
            let extent = self.dim(shape.dim(axis));
            match boundary {
                Boundary::Clamp => format!("clampi({raw}, {extent})"),
                Boundary::Wrap => format!("wrapi({raw}, {extent})"),
                Boundary::Error => format!("checki({raw}, {extent})"),
            }
        }).collect::<Vec<_>>();
        self.offset(shape, &coords)
    }

    fn expr(&self, n: NodeId, at: &Point) -> String {
        let node = self.graph.node(n);
        let dtype_of = |x: NodeId| self.graph.node(x).dtype;
        match &node.op {
            Op::Const { value } => self.d.literal(*value),
            Op::IndexValue { expr } => format!("(({}){})", self.d.ty(DType::I32), expr.render(&at.axes, "fdiv", "fmod_i")),
            Op::Unary { op, x } => self.d.unary(*op, dtype_of(*x), &self.operand(*x, at)),
            Op::Binary { op, lhs, rhs } => self.d.binary(*op, dtype_of(*lhs), &self.operand(*lhs, at), &self.operand(*rhs, at)),
            Op::Ternary { op, a, b, c } => {
                let (x, y, z) = (self.operand(*a, at), self.operand(*b, at), self.operand(*c, at));
                match op {
                    TernaryOp::Select => format!("({x} ? {y} : {z})"),
                    TernaryOp::Clamp => {
                        let lo = self.d.min_max(true, node.dtype, &x, &y);
                        self.d.min_max(false, node.dtype, &lo, &z)
                    }
                    TernaryOp::Fma => self.d.float_call("fma", &[&x, &y, &z]),
                    TernaryOp::Lerp => format!("({x} + ({y} - {x}) * {z})"),
                }
            }
            Op::Cast { x } => self.d.cast(node.dtype, &self.operand(*x, at)),
            Op::Load { src, index, boundary } => {
                let src_node = self.graph.node(*src);
                let offset = self.index(index, *boundary, &src_node.shape, at);
                self.d.load(self.kernel.input(*src).unwrap_or(0), &offset, src_node.dtype)
            }
            // reductions, writes and bound values are emitted as statements
            _ => format!("v{}", n.0),
        }
    }

    fn member(&mut self, n: NodeId, at: &mut Point) -> fmt::Result {
        let node = self.graph.node(n);
        let ty = self.d.ty(node.dtype);
        match &node.op {
            Op::Reduce { op, x, axis } => {
                let x_node = self.graph.node(*x);
                let init = self.d.literal(crate::pre::eval::reduce_init(*op, node.dtype));
                self.line(&format!("{ty} v{} = {init};", n.0))?;
                let k = format!("r{}", n.0);
                let extent = self.dim(x_node.shape.dim(*axis));
                self.line(&format!("for ({} {k} = 0; {k} < {extent}; {k}++) {{", self.d.index_type()))?;
                self.depth += 1;
                let mut inner = at.clone();
                inner.axes.insert(*axis, k);
                if let Some(scope) = self.kernel.inner(n) {
                    for &m in &scope.body {
                        inner.scope.push(m);
                        let text = format!("{} v{} = {};", self.d.ty(self.graph.node(m).dtype), m.0, self.expr(m, &inner));
                        self.line(&text)?;
                    }
                }
                let value = self.operand(*x, &inner);
                let acc = format!("v{}", n.0);
                let step = match op {
                    ReduceOp::Sum => self.d.binary(BinaryOp::Add, node.dtype, &acc, &value),
                    ReduceOp::Prod => self.d.binary(BinaryOp::Mul, node.dtype, &acc, &value),
                    ReduceOp::Min => self.d.min_max(false, node.dtype, &acc, &value),
                    ReduceOp::Max => self.d.min_max(true, node.dtype, &acc, &value),
                };
                self.line(&format!("{acc} = {step};"))?;
                self.depth -= 1;
                self.line("}")?;
            }
            Op::Store { target, value, index, boundary, .. } | Op::Scatter { target, value, index, boundary, .. } => {
                let shape = &self.graph.node(*target).shape;
                let offset = self.index(index, *boundary, shape, at);
                let value = self.operand(*value, at);
                let buffer = self.kernel.inputs.len() + self.kernel.dest(n).unwrap_or(0);
                let text = match &node.op {
                    Op::Scatter { op, .. } => self.d.combine(*op, buffer, &offset, node.dtype, &value),
                    _ => self.d.store(buffer, &offset, node.dtype, &value),
                };
                for l in text.lines() { self.line(l)? }
            }
            _ => {
                let text = format!("{ty} v{} = {};", n.0, self.expr(n, at));
                self.line(&text)?;
            }
        }
        at.scope.push(n);
        Ok(())
    }

    fn kernel(&mut self) -> fmt::Result {
        let k = self.kernel;
        let rank = k.domain.rank();
        let extents = k.domain.dims().iter().map(|d| self.dim(d)).collect::<Vec<_>>();
        let total = if extents.is_empty() { "1".to_string() } else { extents.join(" * ") };
        writeln!(self.out, "// {} over {}", entry_name(k), k.domain)?;
        self.out += &self.d.open(&entry_name(k), k, &total);
        self.depth = 2;
        let axes = (0..rank).map(|a| format!("i{a}")).collect::<Vec<_>>();
        self.line(&format!("{} rest = gid;", self.d.index_type()))?;
        for a in (0..rank).rev() {
            self.line(&format!("{} {} = rest % {};", self.d.index_type(), axes[a], extents[a]))?;
            if a > 0 { self.line(&format!("rest = rest / {};", extents[a]))? }
        }
        let mut at = Point { axes, scope: vec![] };
        for &m in &k.body { self.member(m, &mut at)? }
        for (o, out) in k.outputs.iter().enumerate() {
            if self.graph.node(out.node).op.is_write() || !self.members.contains(&out.node) { continue }
            let offset = self.offset(&k.domain, &at.axes);
            let value = self.operand(out.node, &at);
            let text = self.d.store(k.inputs.len() + o, &offset, self.graph.node(out.node).dtype, &value);
            self.line(&text)?;
        }
        self.out += self.d.close();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    fn program(f: impl for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>) -> Program {
        Program::plan(&Graph::trace(Boundary::Clamp, f).unwrap(), FusionMode::Max).unwrap()
    }

    fn matmul() -> Program {
        program(|t| {
            let a = t.input(&[-1, 8], F32)?;
            let b = t.input(&[8, 3], F32)?;
            let m = a.shape().dim(0).clone();
            let mut c = t.zeros(&Shape::new([m.clone(), Dim::Fix(3)]), F32)?;
            let d = Shape::new([m, Dim::Fix(3), Dim::Fix(8)]);
            let [i, j, k] = <[IndexVar; 3]>::try_from(t.indices(&d)).unwrap();
            c.scatter_add([i.clone(), j.clone()], &(a.at([&i, &k])? * b.at([&k, &j])?))?;
            Ok(vec![c])
        })
    }

    #[test]
    fn c_source_has_parallel_loop_and_atomics() {
        let src = render_program(&matmul(), Target::C).unwrap();
        assert!(src.contains("#pragma omp parallel for"));
        assert!(src.contains("#pragma omp atomic"));
        assert!(src.contains("dims[0]"));
        assert!(src.contains("clampi("));
        assert!(src.contains("void kernel_0("));
    }

    #[test]
    fn hlsl_source_is_a_compute_shader() {
        let src = render_program(&matmul(), Target::Hlsl).unwrap();
        assert!(src.contains("[numthreads(256, 1, 1)]"));
        assert!(src.contains("RWStructuredBuffer<uint>"));
        assert!(src.contains("InterlockedCompareExchange"));
        assert!(!src.contains("#pragma"));
    }

    #[test]
    fn program_source_carries_one_prelude() {
        let p = program(|t| {
            let x = t.input(&[4, 6], F32)?;
            let row = x.sum(-1)?;
            let i = t.indices(&sh([4, 6]));
            Ok(vec![&x - &row.at([&i[0]])?])
        });
        assert_eq!(p.kernels().len(), 2);
        for target in [Target::C, Target::Hlsl] {
            let prelude = dialect(target).prelude();
            let src = render_program(&p, target).unwrap();
            assert!(src.starts_with(prelude));
            assert_eq!(src.matches(prelude).count(), 1);
            assert!(src.contains("kernel_1"));
            // a single kernel still renders as a complete unit
            assert!(render(p.graph(), &p.kernels()[1], target).unwrap().starts_with(prelude));
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        for target in [Target::C, Target::Hlsl] {
            assert_eq!(render_program(&matmul(), target).unwrap(), render_program(&matmul(), target).unwrap());
        }
    }

    #[test]
    fn reductions_emit_an_accumulation_loop() {
        let p = program(|t| {
            let x = t.input(&[4, 5], F32)?;
            Ok(vec![x.exp()?.max_along(-1)?])
        });
        let src = render(p.graph(), &p.kernels()[0], Target::C).unwrap();
        assert!(src.contains("for (int64_t r"), "{src}");
        assert!(src.contains("expf("), "{src}");
        assert!(src.contains("-INFINITY"), "{src}");
    }

    #[test]
    fn target_names_parse() {
        assert_eq!(Target::parse("HLSL"), Some(Target::Hlsl));
        assert_eq!(Target::parse("cpu"), Some(Target::C));
        assert_eq!(Target::parse("ptx"), None);
        assert_eq!(dialect(Target::Hlsl).target(), Target::Hlsl);
    }
}
