use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Neg, Not, Rem, Shl, Shr, Sub};

use super::*;
use crate::error::*;

/// Recording state behind a [`Tracer`].
#[derive(Debug)]
pub struct Trace {
    pub(crate) graph: Graph,
    // loop bodies currently open, innermost last
    stack: Vec<LoopId>,
    // first failure of an operator overload
    pub(crate) error: Option<Error>,
    boundary: Boundary,
}

impl Trace {
    pub(crate) fn new(boundary: Boundary) -> Self {
        Trace { graph: Graph::default(), stack: vec![], error: None, boundary }
    }
    fn region(&self) -> Option<LoopId> { self.stack.last().copied() }
}

/// Entry point handed to the front end's building routine.
#[derive(Clone, Copy)]
pub struct Tracer<'t> {
    cell: &'t RefCell<Trace>,
}

/// Handle to a traced value. Cloning the handle never copies the value.
#[derive(Clone)]
pub struct Tensor<'t> {
    graph: &'t RefCell<Trace>,
    shape: Shape,
    dtype: DType,
    id: NodeId,
}

impl fmt::Debug for Tensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}: {}{})", self.id, self.dtype, self.shape)
    }
}

/// One component of an index list: a symbolic index or an int32 tensor (gather).
#[derive(Debug, Clone)]
pub enum At<'t> {
    Var(IndexVar),
    Value(Tensor<'t>),
}

impl<'t> From<IndexVar> for At<'t> { fn from(v: IndexVar) -> Self { At::Var(v) } }
impl<'t> From<&IndexVar> for At<'t> { fn from(v: &IndexVar) -> Self { At::Var(v.clone()) } }
impl<'t> From<Tensor<'t>> for At<'t> { fn from(t: Tensor<'t>) -> Self { At::Value(t) } }
impl<'t> From<&Tensor<'t>> for At<'t> { fn from(t: &Tensor<'t>) -> Self { At::Value(t.clone()) } }

/// Trip count of [`Tracer::repeat`].
#[derive(Debug, Clone)]
pub enum End<'t> {
    Fixed(usize),
    Value(Tensor<'t>),
}

impl<'t> From<usize> for End<'t> { fn from(n: usize) -> Self { End::Fixed(n) } }
impl<'t> From<Tensor<'t>> for End<'t> { fn from(t: Tensor<'t>) -> Self { End::Value(t) } }
impl<'t> From<&Tensor<'t>> for End<'t> { fn from(t: &Tensor<'t>) -> Self { End::Value(t.clone()) } }

impl<'t> Tracer<'t> {
    pub(crate) fn new(cell: &'t RefCell<Trace>) -> Self { Tracer { cell } }

    // append a node after checking its operands are visible from the open region
    fn node(&self, op: Op, dtype: DType, shape: Shape) -> Result<Tensor<'t>> {
        let mut trace = self.cell.borrow_mut();
        let region = trace.region();
        for up in op.upstream() {
            if !trace.graph.visible(trace.graph.node(up).region, region) {
                return invalid(format!("{up} is used outside the loop body it was traced in"));
            }
        }
        let id = trace.graph.push(Node { op, dtype, shape: shape.clone(), region });
        Ok(Tensor { graph: self.cell, id, shape, dtype })
    }

    fn with_symbols<T>(&self, f: impl FnOnce(&mut Symbols) -> T) -> T {
        f(&mut self.cell.borrow_mut().graph.symbols)
    }

    /// The first error an operator overload ran into, if any.
    pub fn check(&self) -> Result<()> {
        match &self.cell.borrow().error { Some(err) => Err(err.clone()), None => Ok(()) }
    }

    pub fn boundary(&self) -> Boundary { self.cell.borrow().boundary }

    /// Build a shape, `-1` declares a fresh dynamic dimension.
    pub fn dims(&self, dims: &[i64]) -> Result<Shape> {
        let mut out = Vec::with_capacity(dims.len());
        for &d in dims {
            out.push(match d {
                -1 => self.with_symbols(|s| s.fresh()),
                d if d >= 0 => Dim::Fix(d as usize),
                d => return mismatch(format!("invalid dimension {d}")),
            });
        }
        Ok(Shape::new(out))
    }

    /// Declare the next external input.
    pub fn input(&self, dims: &[i64], dtype: DType) -> Result<Tensor<'t>> {
        let shape = self.dims(dims)?;
        self.input_shaped(shape, dtype)
    }

    pub fn input_shaped(&self, shape: Shape, dtype: DType) -> Result<Tensor<'t>> {
        if self.cell.borrow().region().is_some() { return invalid("inputs must be declared outside loops") }
        let slot = self.cell.borrow().graph.inputs.len();
        let t = self.node(Op::Input { slot }, dtype, shape)?;
        self.cell.borrow_mut().graph.inputs.push(t.id);
        Ok(t)
    }

    pub fn constant(&self, value: impl Into<Scalar>) -> Result<Tensor<'t>> {
        self.fill(&Shape::scalar(), value)
    }

    /// A tensor of the given shape with every element equal to `value`.
    pub fn fill(&self, shape: &Shape, value: impl Into<Scalar>) -> Result<Tensor<'t>> {
        let value = value.into();
        self.node(Op::Const { value }, value.dtype(), shape.clone())
    }

    pub fn zeros(&self, shape: &Shape, dtype: DType) -> Result<Tensor<'t>> {
        self.fill(shape, Scalar::zero(dtype))
    }

    /// One index variable per axis of `domain`.
    pub fn indices(&self, domain: &Shape) -> Vec<IndexVar> {
        (0..domain.rank()).map(|a| IndexVar::axis(domain, a)).collect()
    }

    pub fn index(&self, axis: usize, domain: &Shape) -> Result<IndexVar> {
        if axis >= domain.rank() { return mismatch(format!("axis {axis} out of range for {domain}")) }
        Ok(IndexVar::axis(domain, axis))
    }

    /// Materialize an index expression as int32 values over its domain.
    pub fn index_value(&self, var: &IndexVar) -> Result<Tensor<'t>> {
        check_idx(&var.expr)?;
        let domain = var.checked_domain()?.clone();
        self.node(Op::IndexValue { expr: var.expr.clone() }, DType::I32, domain)
    }

    /// Sequential loop running `body` `end` times. `carried` values enter the loop,
    /// the body receives the loop counter and the current carried values and returns
    /// the next ones in the same order; the final values are returned.
    pub fn repeat<F>(&self, end: impl Into<End<'t>>, carried: &[Tensor<'t>], body: F) -> Result<Vec<Tensor<'t>>>
        where F: FnOnce(Tensor<'t>, Vec<Tensor<'t>>) -> Result<Vec<Tensor<'t>>>
    {
        let parent = self.cell.borrow().region();
        let end = match end.into() {
            End::Fixed(n) => Extent::Fixed(n),
            End::Value(t) => {
                if t.dtype != DType::I32 { return type_mismatch(format!("loop end must be i32, got {}", t.dtype)) }
                if !t.shape.is_scalar() { return mismatch(format!("loop end must be a scalar, got {}", t.shape)) }
                Extent::Node(t.id)
            }
        };
        let id = {
            let mut trace = self.cell.borrow_mut();
            let id = LoopId(trace.graph.loops.len());
            for n in carried.iter().map(|t| t.id).chain(match end { Extent::Node(n) => Some(n), _ => None }) {
                if !trace.graph.visible(trace.graph.node(n).region, parent) {
                    return invalid(format!("{n} is used outside the loop body it was traced in"));
                }
            }
            // placeholders until the body is traced
            trace.graph.loops.push(LoopRegion { id, parent, end, counter: NodeId(0), carries: vec![] });
            trace.stack.push(id);
            id
        };
        let traced = (|| -> Result<_> {
            let counter = self.node(Op::LoopCounter { region: id }, DType::I32, Shape::scalar())?;
            let params = carried.iter().enumerate()
                .map(|(slot, t)| self.node(Op::LoopParam { region: id, slot }, t.dtype, t.shape.clone()))
                .collect::<Result<Vec<_>>>()?;
            self.cell.borrow_mut().graph.loops[id.0].counter = counter.id;
            let next = body(counter, params.clone())?;
            Ok((params, next))
        })();
        self.cell.borrow_mut().stack.pop();
        let (params, next) = traced?;
        if next.len() != carried.len() {
            return invalid(format!("loop body returned {} values for {} carried", next.len(), carried.len()));
        }
        let mut results = Vec::with_capacity(next.len());
        for (slot, ((init, param), next)) in carried.iter().zip(&params).zip(&next).enumerate() {
            if next.dtype != init.dtype {
                return type_mismatch(format!("carried value #{slot} changes type from {} to {}", init.dtype, next.dtype));
            }
            let same = self.cell.borrow().graph.symbols.same(&next.shape, &init.shape);
            if !same {
                return mismatch(format!("carried value #{slot} changes shape from {} to {}", init.shape, next.shape));
            }
            {
                let trace = self.cell.borrow();
                if !trace.graph.visible(trace.graph.node(next.id).region, Some(id)) {
                    return invalid(format!("carried value #{slot} comes from a closed loop body"));
                }
            }
            let result = self.node(Op::LoopResult { region: id, slot }, init.dtype, init.shape.clone())?;
            self.cell.borrow_mut().graph.loops[id.0].carries.push(Carry {
                init: init.id, param: param.id, next: next.id, result: result.id,
            });
            results.push(result);
        }
        Ok(results)
    }
}

impl<'t> Tensor<'t> {
    pub fn id(&self) -> NodeId { self.id }
    pub fn shape(&self) -> &Shape { &self.shape }
    pub fn dtype(&self) -> DType { self.dtype }
    pub fn tracer(&self) -> Tracer<'t> { Tracer { cell: self.graph } }
    /// Index variables over this tensor's own shape.
    pub fn indices(&self) -> Vec<IndexVar> { self.tracer().indices(&self.shape) }

    // the literal value if this is a constant node
    fn literal(&self) -> Option<Scalar> {
        match self.graph.borrow().graph.node(self.id).op { Op::Const { value } => Some(value), _ => None }
    }

    fn same_shape(&self, other: &Shape) -> bool {
        self.graph.borrow().graph.symbols.same(&self.shape, other)
    }

    // record a failure of an operator overload and keep tracing with `self`
    fn sticky(&self, r: Result<Tensor<'t>>) -> Tensor<'t> {
        match r {
            Ok(t) => t,
            Err(err) => {
                let mut trace = self.graph.borrow_mut();
                if trace.error.is_none() { trace.error = Some(err) }
                self.clone()
            }
        }
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Tensor<'t>> {
        let dtype = op.result(self.dtype)?;
        if let Some(x) = self.literal() {
            return self.tracer().fill(&self.shape, super::eval::unary(op, x));
        }
        self.tracer().node(Op::Unary { op, x: self.id }, dtype, self.shape.clone())
    }

    pub fn binary(&self, op: BinaryOp, rhs: &Tensor<'t>) -> Result<Tensor<'t>> {
        let dtype = op.result(self.dtype, rhs.dtype)?;
        let shape = self.tracer().with_symbols(|s| s.broadcast(&self.shape, &rhs.shape))?;
        let (l, r) = (self.literal(), rhs.literal());
        if let (Some(a), Some(b)) = (l, r) {
            return self.tracer().fill(&shape, super::eval::binary(op, a, b));
        }
        if self.dtype.is_numeric() {
            let keep_lhs = match (op, r) {
                (BinaryOp::Add | BinaryOp::Sub, Some(z)) => z.is(0),
                (BinaryOp::Mul | BinaryOp::Div, Some(o)) => o.is(1),
                _ => false,
            };
            if keep_lhs && self.same_shape(&shape) { return Ok(self.clone()) }
            let keep_rhs = match (op, l) {
                (BinaryOp::Add, Some(z)) => z.is(0),
                (BinaryOp::Mul, Some(o)) => o.is(1),
                _ => false,
            };
            if keep_rhs && rhs.same_shape(&shape) { return Ok(rhs.clone()) }
        }
        self.tracer().node(Op::Binary { op, lhs: self.id, rhs: rhs.id }, dtype, shape)
    }

    pub fn ternary(&self, op: TernaryOp, b: &Tensor<'t>, c: &Tensor<'t>) -> Result<Tensor<'t>> {
        let dtype = op.result(self.dtype, b.dtype, c.dtype)?;
        let shape = self.tracer().with_symbols(|s| {
            let ab = s.broadcast(&self.shape, &b.shape)?;
            s.broadcast(&ab, &c.shape)
        })?;
        if let (Some(x), Some(y), Some(z)) = (self.literal(), b.literal(), c.literal()) {
            return self.tracer().fill(&shape, super::eval::ternary(op, x, y, z));
        }
        self.tracer().node(Op::Ternary { op, a: self.id, b: b.id, c: c.id }, dtype, shape)
    }

    pub fn cast(&self, dtype: DType) -> Result<Tensor<'t>> {
        if dtype == self.dtype { return Ok(self.clone()) }
        if let Some(x) = self.literal() { return self.tracer().fill(&self.shape, x.cast(dtype)) }
        self.tracer().node(Op::Cast { x: self.id }, dtype, self.shape.clone())
    }

    /// Reduce along one axis, negative axes count from the back.
    pub fn reduce(&self, op: ReduceOp, axis: isize) -> Result<Tensor<'t>> {
        if !self.dtype.is_numeric() { return type_mismatch(format!("{} of {}", op.name(), self.dtype)) }
        let axis = self.shape.axis(axis)?;
        let shape = self.shape.clone().remove(axis);
        self.tracer().node(Op::Reduce { op, x: self.id, axis }, self.dtype, shape)
    }
    pub fn sum(&self, axis: isize) -> Result<Tensor<'t>> { self.reduce(ReduceOp::Sum, axis) }
    pub fn prod(&self, axis: isize) -> Result<Tensor<'t>> { self.reduce(ReduceOp::Prod, axis) }
    pub fn min_along(&self, axis: isize) -> Result<Tensor<'t>> { self.reduce(ReduceOp::Min, axis) }
    pub fn max_along(&self, axis: isize) -> Result<Tensor<'t>> { self.reduce(ReduceOp::Max, axis) }

    pub fn select(&self, a: &Tensor<'t>, b: &Tensor<'t>) -> Result<Tensor<'t>> { self.ternary(TernaryOp::Select, a, b) }
    pub fn clamp(&self, lo: &Tensor<'t>, hi: &Tensor<'t>) -> Result<Tensor<'t>> { self.ternary(TernaryOp::Clamp, lo, hi) }
    pub fn fma(&self, b: &Tensor<'t>, c: &Tensor<'t>) -> Result<Tensor<'t>> { self.ternary(TernaryOp::Fma, b, c) }
    pub fn lerp(&self, b: &Tensor<'t>, t: &Tensor<'t>) -> Result<Tensor<'t>> { self.ternary(TernaryOp::Lerp, b, t) }

    // resolve an index list against a tensor of rank `rank`, giving the access domain
    fn access<I>(&self, index: I) -> Result<(Index, Shape)>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        let items = index.into_iter().map(Into::into).collect::<Vec<At<'t>>>();
        if items.len() != self.shape.rank() {
            return mismatch(format!("{} indices for tensor of shape {}", items.len(), self.shape));
        }
        let tracer = self.tracer();
        let mut domain: Option<Shape> = None;
        for item in &items {
            let At::Var(var) = item else { continue };
            check_idx(&var.expr)?;
            let d = var.checked_domain()?;
            match &domain {
                None => domain = Some(d.clone()),
                Some(x) if tracer.with_symbols(|s| s.same(x, d)) => {},
                Some(x) => return mismatch(format!("index domains {x} and {d} differ")),
            }
        }
        let mut values = Shape::scalar();
        for item in &items {
            let At::Value(t) = item else { continue };
            if t.dtype != DType::I32 { return type_mismatch(format!("index tensors must be i32, got {}", t.dtype)) }
            values = tracer.with_symbols(|s| s.broadcast(&values, &t.shape))?;
        }
        let domain = match domain {
            Some(d) => {
                let joined = tracer.with_symbols(|s| s.broadcast(&d, &values))?;
                if !tracer.with_symbols(|s| s.same(&joined, &d)) {
                    return mismatch(format!("index tensors of shape {values} do not fit domain {d}"));
                }
                d
            }
            None => values,
        };
        let index = items.into_iter().map(|a| match a {
            At::Var(v) => Access::Idx(v.expr), At::Value(t) => Access::Value(t.id),
        }).collect();
        Ok((index, domain))
    }

    /// Indexed load with the tracer's boundary policy, `u[i-1, j]`.
    pub fn at<I>(&self, index: I) -> Result<Tensor<'t>>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        self.at_with(index, self.tracer().boundary())
    }

    pub fn at_with<I>(&self, index: I, boundary: Boundary) -> Result<Tensor<'t>>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        let (index, domain) = self.access(index)?;
        self.tracer().node(Op::Load { src: self.id, index, boundary }, self.dtype, domain)
    }

    // value must broadcast into the write domain without widening it
    fn fit_value(&self, value: &Tensor<'t>, domain: &Shape) -> Result<()> {
        if value.dtype != self.dtype {
            return type_mismatch(format!("writing {} into a {} tensor", value.dtype, self.dtype));
        }
        let tracer = self.tracer();
        let joined = tracer.with_symbols(|s| s.broadcast(domain, &value.shape))?;
        if !tracer.with_symbols(|s| s.same(&joined, domain)) {
            return mismatch(format!("value of shape {} does not fit write domain {domain}", value.shape));
        }
        Ok(())
    }

    /// Indexed store `C[i, j] = value`; the handle is rebound to the updated tensor.
    pub fn set<I>(&mut self, index: I, value: &Tensor<'t>) -> Result<()>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        let boundary = self.tracer().boundary();
        let (index, domain) = self.access(index)?;
        self.fit_value(value, &domain)?;
        let op = Op::Store { target: self.id, value: value.id, index, boundary, domain };
        *self = self.tracer().node(op, self.dtype, self.shape.clone())?;
        Ok(())
    }

    /// Indexed scatter-accumulate; the handle is rebound to the updated tensor.
    pub fn scatter<I>(&mut self, op: ScatterOp, index: I, value: &Tensor<'t>) -> Result<()>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        if !self.dtype.is_numeric() { return type_mismatch(format!("{} into {}", op.name(), self.dtype)) }
        let boundary = self.tracer().boundary();
        let (index, domain) = self.access(index)?;
        self.fit_value(value, &domain)?;
        let op = Op::Scatter { op, target: self.id, value: value.id, index, boundary, domain };
        *self = self.tracer().node(op, self.dtype, self.shape.clone())?;
        Ok(())
    }

    pub fn scatter_add<I>(&mut self, index: I, value: &Tensor<'t>) -> Result<()>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        self.scatter(ScatterOp::Add, index, value)
    }

    pub fn scatter_min<I>(&mut self, index: I, value: &Tensor<'t>) -> Result<()>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        self.scatter(ScatterOp::Min, index, value)
    }

    pub fn scatter_max<I>(&mut self, index: I, value: &Tensor<'t>) -> Result<()>
        where I: IntoIterator, I::Item: Into<At<'t>>
    {
        self.scatter(ScatterOp::Max, index, value)
    }
}

// named element functions, all fallible
macro_rules! impl_unary_fn {
    ($($name: ident => $Op: ident),* $(,)?) => {
        impl<'t> Tensor<'t> {
            $(pub fn $name(&self) -> Result<Tensor<'t>> { self.unary(UnaryOp::$Op) })*
        }
    };
}

impl_unary_fn!(
    abs => Abs, sign => Sign, floor => Floor, ceil => Ceil, round => Round, trunc => Trunc, frac => Frac,
    sin => Sin, cos => Cos, tan => Tan, asin => Asin, acos => Acos, atan => Atan,
    sinh => Sinh, cosh => Cosh, tanh => Tanh, exp => Exp, exp2 => Exp2, log => Log, log2 => Log2,
    sqrt => Sqrt, sqr => Sqr, rsqrt => Rsqrt, rcp => Rcp,
);

macro_rules! impl_binary_fn {
    ($($name: ident => $Op: ident),* $(,)?) => {
        impl<'t> Tensor<'t> {
            $(pub fn $name(&self, rhs: &Tensor<'t>) -> Result<Tensor<'t>> { self.binary(BinaryOp::$Op, rhs) })*
        }
    };
}

impl_binary_fn!(
    minimum => Min, maximum => Max, pow => Pow, atan2 => Atan2,
    lt => Lt, le => Le, gt => Gt, ge => Ge, equal => Eq, not_equal => Ne,
    and => And, or => Or,
);

// implement binary operators for tensor handles, failures become sticky
macro_rules! impl_bin_op {
    ($Name: ident, $name: ident, $Op: ident) => {
        impl<'t> $Name for Tensor<'t> {
            type Output = Tensor<'t>;
            fn $name(self, rhs: Self) -> Self::Output {
                self.sticky(self.binary(BinaryOp::$Op, &rhs))
            }
        }
        impl<'t> $Name for &Tensor<'t> {
            type Output = Tensor<'t>;
            fn $name(self, rhs: Self) -> Self::Output {
                self.sticky(self.binary(BinaryOp::$Op, rhs))
            }
        }
        impl<'t> $Name<&Tensor<'t>> for Tensor<'t> {
            type Output = Tensor<'t>;
            fn $name(self, rhs: &Tensor<'t>) -> Self::Output {
                self.sticky(self.binary(BinaryOp::$Op, rhs))
            }
        }
        impl<'t> $Name<f32> for Tensor<'t> {
            type Output = Tensor<'t>;
            fn $name(self, rhs: f32) -> Self::Output { (&self).$name(rhs) }
        }
        impl<'t> $Name<f32> for &Tensor<'t> {
            type Output = Tensor<'t>;
            fn $name(self, rhs: f32) -> Self::Output {
                let rhs = self.tracer().constant(rhs).and_then(|r| self.binary(BinaryOp::$Op, &r));
                self.sticky(rhs)
            }
        }
        impl<'t> $Name<i32> for Tensor<'t> {
            type Output = Tensor<'t>;
            fn $name(self, rhs: i32) -> Self::Output {
                let rhs = self.tracer().constant(rhs).and_then(|r| self.binary(BinaryOp::$Op, &r));
                self.sticky(rhs)
            }
        }
        impl<'t> $Name<Tensor<'t>> for f32 {
            type Output = Tensor<'t>;
            fn $name(self, rhs: Tensor<'t>) -> Self::Output {
                let out = rhs.tracer().constant(self).and_then(|l| l.binary(BinaryOp::$Op, &rhs));
                rhs.sticky(out)
            }
        }
        impl<'t> $Name<&Tensor<'t>> for f32 {
            type Output = Tensor<'t>;
            fn $name(self, rhs: &Tensor<'t>) -> Self::Output {
                let out = rhs.tracer().constant(self).and_then(|l| l.binary(BinaryOp::$Op, rhs));
                rhs.sticky(out)
            }
        }
    };
}

impl_bin_op!(Add, add, Add);
impl_bin_op!(Sub, sub, Sub);
impl_bin_op!(Mul, mul, Mul);
impl_bin_op!(Div, div, Div);
impl_bin_op!(Rem, rem, Mod);
impl_bin_op!(BitAnd, bitand, And);
impl_bin_op!(BitOr, bitor, Or);
impl_bin_op!(BitXor, bitxor, Xor);
impl_bin_op!(Shl, shl, Shl);
impl_bin_op!(Shr, shr, Shr);

impl<'t> Neg for Tensor<'t> {
    type Output = Tensor<'t>;
    fn neg(self) -> Self::Output { -&self }
}

impl<'t> Neg for &Tensor<'t> {
    type Output = Tensor<'t>;
    fn neg(self) -> Self::Output { self.sticky(self.unary(UnaryOp::Neg)) }
}

impl<'t> Not for Tensor<'t> {
    type Output = Tensor<'t>;
    fn not(self) -> Self::Output {
        let op = if self.dtype == DType::Bool { UnaryOp::Not } else { UnaryOp::BitNot };
        self.sticky(self.unary(op))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    #[test]
    fn elementwise_and_folding() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[4, 4], F32)?;
            let b = t.input(&[4], F32)?;
            let c = &a + &b;
            assert_eq!(c.shape(), &sh([4, 4]));
            // x * 1 and x + 0 return x itself
            let same = (c.clone() * 1.0) + 0.0;
            assert_eq!(same.id(), c.id());
            let two = t.constant(1.0f32)? + t.constant(1.0f32)?;
            Ok(vec![c * two])
        }).unwrap();
        assert_eq!(g.inputs().len(), 2);
        let folded = g.nodes().filter(|(_, n)| n.op == Op::Const { value: Scalar::F32(2.0) }).count();
        assert_eq!(folded, 1);
    }

    #[test]
    fn operator_errors_are_sticky() {
        let err = Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[4], F32)?;
            let b = t.input(&[4], I32)?;
            Ok(vec![a + b])
        }).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
        let err = Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[4], F32)?;
            let b = t.input(&[3], F32)?;
            Ok(vec![a.binary(BinaryOp::Add, &b)?])
        }).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn stencil_load_and_store_rebinds() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let u = t.input(&[-1, -1], F32)?;
            let [i, j] = <[IndexVar; 2]>::try_from(u.indices()).unwrap();
            let lap = u.at([&i - 1, j.clone()])? + u.at([&i + 1, j.clone()])? - u.at([i.clone(), j.clone()])? * 2.0;
            let mut out = t.zeros(u.shape(), F32)?;
            let before = out.id();
            out.set([i, j], &lap)?;
            assert_ne!(out.id(), before);
            Ok(vec![out])
        }).unwrap();
        let store = g.node(g.outputs()[0]);
        assert!(matches!(store.op, Op::Store { .. }));
        assert_eq!(store.domain(), &Shape::new([Dim::Var(0), Dim::Var(1)]));
    }

    #[test]
    fn index_count_and_domains_are_checked() {
        let err = Graph::trace(Boundary::Clamp, |t| {
            let u = t.input(&[4, 4], F32)?;
            let i = t.indices(&sh([4]));
            Ok(vec![u.at([&i[0]])?])
        }).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
        let err = Graph::trace(Boundary::Clamp, |t| {
            let u = t.input(&[4, 4], F32)?;
            let a = t.indices(&sh([4, 4]));
            let b = t.indices(&sh([2, 2]));
            Ok(vec![u.at([&a[0], &b[1]])?])
        }).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn loops_carry_by_position() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let x = t.input(&[8], F32)?;
            let n = t.input(&[], I32)?;
            let out = t.repeat(&n, &[x.clone()], |_, carried| Ok(vec![&carried[0] * 0.5]))?;
            Ok(out)
        }).unwrap();
        let region = &g.regions()[0];
        assert_eq!(region.end, Extent::Node(g.inputs()[1]));
        assert_eq!(region.carries.len(), 1);
        assert_eq!(g.outputs(), &[region.carries[0].result]);
        assert_eq!(g.node(region.carries[0].next).region, Some(region.id));
    }

    #[test]
    fn loop_values_cannot_escape() {
        let err = Graph::trace(Boundary::Clamp, |t| {
            let x = t.input(&[8], F32)?;
            let mut leaked = None;
            t.repeat(3usize, &[x.clone()], |_, c| { leaked = Some(&c[0] + 1.0); Ok(c) })?;
            Ok(vec![leaked.unwrap() + x])
        }).unwrap_err();
        assert!(matches!(err, Error::InvalidTrace(_)));
        let err = Graph::trace(Boundary::Clamp, |t| {
            let x = t.input(&[8], F32)?;
            t.repeat(3usize, &[x.clone()], |_, _| Ok(vec![]))
        }).unwrap_err();
        assert!(matches!(err, Error::InvalidTrace(_)));
    }
}
