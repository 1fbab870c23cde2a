use smallvec::*;
use std::fmt;

use super::*;
use crate::error::*;

/// Node reference, also the node's position in trace order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize { self.0 }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "%{}", self.0) }
}

/// Loop region reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg, Not, BitNot,
    Abs, Sign, Floor, Ceil, Round, Trunc, Frac,
    Sin, Cos, Tan, Asin, Acos, Atan, Sinh, Cosh, Tanh,
    Exp, Exp2, Log, Log2, Sqrt, Sqr, Rsqrt, Rcp,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        use UnaryOp::*;
        match self {
            Neg => "neg", Not => "not", BitNot => "bnot",
            Abs => "abs", Sign => "sign", Floor => "floor", Ceil => "ceil", Round => "round", Trunc => "trunc", Frac => "frac",
            Sin => "sin", Cos => "cos", Tan => "tan", Asin => "asin", Acos => "acos", Atan => "atan",
            Sinh => "sinh", Cosh => "cosh", Tanh => "tanh",
            Exp => "exp", Exp2 => "exp2", Log => "log", Log2 => "log2",
            Sqrt => "sqrt", Sqr => "sqr", Rsqrt => "rsqrt", Rcp => "rcp",
        }
    }
    pub fn result(&self, x: DType) -> Result<DType> {
        use UnaryOp::*;
        let ok = match self {
            Neg | Abs | Sign | Sqr => x.is_numeric(),
            Not => x == DType::Bool,
            BitNot => x.is_integer(),
            _ => x.is_float(),
        };
        if !ok { return type_mismatch(format!("{} is not defined for {x}", self.name())) }
        Ok(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // arithmetic
    Add, Sub, Mul, Div, Mod, Min, Max, Pow, Atan2,
    // comparison
    Lt, Le, Gt, Ge, Eq, Ne,
    // logical on bool, bitwise on integers
    And, Or, Xor, Shl, Shr,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "add", Sub => "sub", Mul => "mul", Div => "div", Mod => "mod", Min => "min", Max => "max",
            Pow => "pow", Atan2 => "atan2",
            Lt => "lt", Le => "lte", Gt => "gt", Ge => "gte", Eq => "eq", Ne => "neq",
            And => "and", Or => "or", Xor => "xor", Shl => "shl", Shr => "shr",
        }
    }
    pub fn is_comparison(&self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne)
    }
    pub fn result(&self, l: DType, r: DType) -> Result<DType> {
        use BinaryOp::*;
        if l != r { return type_mismatch(format!("{} of {l} and {r}", self.name())) }
        let ok = match self {
            Add | Sub | Mul | Div | Mod | Min | Max => l.is_numeric(),
            Pow | Atan2 => l.is_float(),
            Lt | Le | Gt | Ge => l.is_numeric(),
            Eq | Ne => true,
            And | Or | Xor => l != DType::F32,
            Shl | Shr => l.is_integer(),
        };
        if !ok { return type_mismatch(format!("{} is not defined for {l}", self.name())) }
        Ok(if self.is_comparison() { DType::Bool } else { l })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOp {
    // cond ? a : b
    Select,
    // clamp(x, lo, hi)
    Clamp,
    // a * b + c
    Fma,
    // a + (b - a) * t
    Lerp,
}

impl TernaryOp {
    pub fn name(&self) -> &'static str {
        match self { TernaryOp::Select => "select", TernaryOp::Clamp => "clamp", TernaryOp::Fma => "fma", TernaryOp::Lerp => "lerp" }
    }
    pub fn result(&self, a: DType, b: DType, c: DType) -> Result<DType> {
        match self {
            TernaryOp::Select if a != DType::Bool => type_mismatch(format!("select condition must be bool, got {a}")),
            TernaryOp::Select if b != c => type_mismatch(format!("select branches differ: {b} and {c}")),
            TernaryOp::Select => Ok(b),
            _ if a != b || b != c => type_mismatch(format!("{} of {a}, {b} and {c}", self.name())),
            TernaryOp::Clamp if a.is_numeric() => Ok(a),
            TernaryOp::Fma | TernaryOp::Lerp if a.is_float() => Ok(a),
            _ => type_mismatch(format!("{} is not defined for {a}", self.name())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp { Sum, Prod, Min, Max }

impl ReduceOp {
    pub fn name(&self) -> &'static str {
        match self { ReduceOp::Sum => "sum", ReduceOp::Prod => "prod", ReduceOp::Min => "min", ReduceOp::Max => "max" }
    }
}

/// Combine of a scatter-accumulate, always associative and commutative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScatterOp { Add, Min, Max }

impl ScatterOp {
    pub fn name(&self) -> &'static str {
        match self { ScatterOp::Add => "scatter_add", ScatterOp::Min => "scatter_min", ScatterOp::Max => "scatter_max" }
    }
}

/// One component of an indexed access.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Access {
    // affine-like arithmetic over the access domain's axes
    Idx(Idx),
    // data dependent (gather) index read from an int32 node
    Value(NodeId),
}

pub type Index = SmallVec<[Access; 4]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Input { slot: usize },
    // literal broadcast over the node's shape
    Const { value: Scalar },
    // value of an index expression over the node's shape
    IndexValue { expr: Idx },
    Unary { op: UnaryOp, x: NodeId },
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
    Ternary { op: TernaryOp, a: NodeId, b: NodeId, c: NodeId },
    Cast { x: NodeId },
    // read `src` at `index`, evaluated over the node's own shape
    Load { src: NodeId, index: Index, boundary: Boundary },
    Reduce { op: ReduceOp, x: NodeId, axis: usize },
    // copy of `target` with `value` written at `index` over `domain`
    Store { target: NodeId, value: NodeId, index: Index, boundary: Boundary, domain: Shape },
    // copy of `target` with `value` combined in at `index` over `domain`
    Scatter { op: ScatterOp, target: NodeId, value: NodeId, index: Index, boundary: Boundary, domain: Shape },
    LoopCounter { region: LoopId },
    // value carried into the current iteration
    LoopParam { region: LoopId, slot: usize },
    // value leaving the loop
    LoopResult { region: LoopId, slot: usize },
}

impl Op {
    pub fn upstream(&self) -> SmallVec<[NodeId; 4]> {
        let index_values = |index: &Index| index.iter().filter_map(|a| match a {
            Access::Value(n) => Some(*n), Access::Idx(_) => None }).collect::<SmallVec<[NodeId; 4]>>();
        match self {
            Op::Input { .. } | Op::Const { .. } | Op::IndexValue { .. } => smallvec![],
            Op::LoopCounter { .. } | Op::LoopParam { .. } | Op::LoopResult { .. } => smallvec![],
            Op::Unary { x, .. } | Op::Cast { x } | Op::Reduce { x, .. } => smallvec![*x],
            Op::Binary { lhs, rhs, .. } => smallvec![*lhs, *rhs],
            Op::Ternary { a, b, c, .. } => smallvec![*a, *b, *c],
            Op::Load { src, index, .. } => {
                let mut up = smallvec![*src];
                up.extend(index_values(index));
                up
            }
            Op::Store { target, value, index, .. } | Op::Scatter { target, value, index, .. } => {
                let mut up = smallvec![*target, *value];
                up.extend(index_values(index));
                up
            }
        }
    }

    /// Rewrite every operand reference.
    pub fn map_inputs(&self, f: impl Fn(NodeId) -> NodeId) -> Op {
        let map_index = |index: &Index| index.iter().map(|a| match a {
            Access::Value(n) => Access::Value(f(*n)), Access::Idx(i) => Access::Idx(i.clone()) }).collect::<Index>();
        let mut op = self.clone();
        match &mut op {
            Op::Input { .. } | Op::Const { .. } | Op::IndexValue { .. } => {},
            Op::LoopCounter { .. } | Op::LoopParam { .. } | Op::LoopResult { .. } => {},
            Op::Unary { x, .. } | Op::Cast { x } | Op::Reduce { x, .. } => *x = f(*x),
            Op::Binary { lhs, rhs, .. } => { *lhs = f(*lhs); *rhs = f(*rhs) },
            Op::Ternary { a, b, c, .. } => { *a = f(*a); *b = f(*b); *c = f(*c) },
            Op::Load { src, index, .. } => { *src = f(*src); *index = map_index(index) },
            Op::Store { target, value, index, .. } | Op::Scatter { target, value, index, .. } => {
                *target = f(*target); *value = f(*value); *index = map_index(index)
            }
        }
        op
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Const { .. } => "const",
            Op::IndexValue { .. } => "index",
            Op::Unary { op, .. } => op.name(),
            Op::Binary { op, .. } => op.name(),
            Op::Ternary { op, .. } => op.name(),
            Op::Cast { .. } => "cast",
            Op::Load { .. } => "load",
            Op::Reduce { op, .. } => op.name(),
            Op::Store { .. } => "store",
            Op::Scatter { op, .. } => op.name(),
            Op::LoopCounter { .. } => "loop_counter",
            Op::LoopParam { .. } => "loop_param",
            Op::LoopResult { .. } => "loop_result",
        }
    }

    // bound from outside instead of computed by a kernel
    pub fn is_bound(&self) -> bool {
        matches!(self, Op::Input { .. } | Op::LoopCounter { .. } | Op::LoopParam { .. } | Op::LoopResult { .. })
    }

    pub fn is_write(&self) -> bool { matches!(self, Op::Store { .. } | Op::Scatter { .. }) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binary_typing() {
        assert_eq!(BinaryOp::Add.result(DType::F32, DType::F32).unwrap(), DType::F32);
        assert_eq!(BinaryOp::Lt.result(DType::I32, DType::I32).unwrap(), DType::Bool);
        assert!(matches!(BinaryOp::Add.result(DType::F32, DType::I32), Err(Error::TypeMismatch(_))));
        assert!(BinaryOp::Shl.result(DType::F32, DType::F32).is_err());
        assert!(UnaryOp::Sin.result(DType::I32).is_err());
        assert_eq!(TernaryOp::Select.result(DType::Bool, DType::I32, DType::I32).unwrap(), DType::I32);
        assert!(TernaryOp::Lerp.result(DType::I32, DType::I32, DType::I32).is_err());
    }

    #[test]
    fn upstream_and_remap() {
        let op = Op::Store {
            target: NodeId(0), value: NodeId(1), boundary: Boundary::Clamp, domain: sh([2]),
            index: smallvec![Access::Value(NodeId(2)), Access::Idx(Idx::Axis(0))],
        };
        assert_eq!(op.upstream().as_slice(), &[NodeId(0), NodeId(1), NodeId(2)]);
        let moved = op.map_inputs(|n| NodeId(n.0 + 10));
        assert_eq!(moved.upstream().as_slice(), &[NodeId(10), NodeId(11), NodeId(12)]);
    }
}
