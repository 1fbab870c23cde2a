use smallvec::*;
use std::fmt;

use crate::error::*;

/// Element types. Every element occupies one 32 bit word in memory.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum DType {
    F32,
    I32,
    U32,
    Bool,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self { DType::F32 => "f32", DType::I32 => "i32", DType::U32 => "u32", DType::Bool => "bool" }
    }
    pub fn is_float(&self) -> bool { matches!(self, DType::F32) }
    pub fn is_integer(&self) -> bool { matches!(self, DType::I32 | DType::U32) }
    pub fn is_numeric(&self) -> bool { !matches!(self, DType::Bool) }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// A single typed value.
#[derive(Debug, Clone, Copy)]
pub enum Scalar {
    F32(f32),
    I32(i32),
    U32(u32),
    Bool(bool),
}

impl Scalar {
    pub fn dtype(&self) -> DType {
        match self { Scalar::F32(_) => DType::F32, Scalar::I32(_) => DType::I32, Scalar::U32(_) => DType::U32, Scalar::Bool(_) => DType::Bool }
    }
    pub fn to_bits(&self) -> u32 {
        match *self { Scalar::F32(x) => x.to_bits(), Scalar::I32(x) => x as u32, Scalar::U32(x) => x, Scalar::Bool(x) => x as u32 }
    }
    pub fn from_bits(dtype: DType, bits: u32) -> Scalar {
        match dtype {
            DType::F32 => Scalar::F32(f32::from_bits(bits)),
            DType::I32 => Scalar::I32(bits as i32),
            DType::U32 => Scalar::U32(bits),
            DType::Bool => Scalar::Bool(bits != 0),
        }
    }
    pub fn zero(dtype: DType) -> Scalar { Scalar::from_bits(dtype, 0) }
    // equal to a small integer in the scalar's own type, used for identity folding
    pub fn is(&self, value: i32) -> bool {
        match *self {
            Scalar::F32(x) => x == value as f32,
            Scalar::I32(x) => x == value,
            Scalar::U32(x) => value >= 0 && x == value as u32,
            Scalar::Bool(x) => (value == 1 && x) || (value == 0 && !x),
        }
    }
    /// Numeric conversion with C cast semantics (float to int truncates).
    pub fn cast(&self, to: DType) -> Scalar {
        match (*self, to) {
            (Scalar::F32(x), DType::F32) => Scalar::F32(x),
            (Scalar::F32(x), DType::I32) => Scalar::I32(x as i32),
            (Scalar::F32(x), DType::U32) => Scalar::U32(x as u32),
            (Scalar::F32(x), DType::Bool) => Scalar::Bool(x != 0.0),
            (Scalar::I32(x), DType::F32) => Scalar::F32(x as f32),
            (Scalar::I32(x), DType::I32) => Scalar::I32(x),
            (Scalar::I32(x), DType::U32) => Scalar::U32(x as u32),
            (Scalar::I32(x), DType::Bool) => Scalar::Bool(x != 0),
            (Scalar::U32(x), DType::F32) => Scalar::F32(x as f32),
            (Scalar::U32(x), DType::I32) => Scalar::I32(x as i32),
            (Scalar::U32(x), DType::U32) => Scalar::U32(x),
            (Scalar::U32(x), DType::Bool) => Scalar::Bool(x != 0),
            (Scalar::Bool(x), DType::F32) => Scalar::F32(x as u32 as f32),
            (Scalar::Bool(x), DType::I32) => Scalar::I32(x as i32),
            (Scalar::Bool(x), DType::U32) => Scalar::U32(x as u32),
            (Scalar::Bool(x), DType::Bool) => Scalar::Bool(x),
        }
    }
}

// constants are compared and hashed by bit pattern, so CSE treats 0.0 and -0.0 apart
impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool { self.dtype() == other.dtype() && self.to_bits() == other.to_bits() }
}
impl Eq for Scalar {}
impl std::hash::Hash for Scalar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) { self.dtype().hash(state); self.to_bits().hash(state) }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::F32(x) => write!(f, "{x:?}f"),
            Scalar::I32(x) => write!(f, "{x}"),
            Scalar::U32(x) => write!(f, "{x}u"),
            Scalar::Bool(x) => write!(f, "{x}"),
        }
    }
}

impl From<f32> for Scalar { fn from(x: f32) -> Self { Scalar::F32(x) } }
impl From<i32> for Scalar { fn from(x: i32) -> Self { Scalar::I32(x) } }
impl From<u32> for Scalar { fn from(x: u32) -> Self { Scalar::U32(x) } }
impl From<bool> for Scalar { fn from(x: bool) -> Self { Scalar::Bool(x) } }

/// One dimension of a shape: fixed, a dynamic symbol bound at call time, or an
/// integer expression over other dimensions.
#[derive(Debug, PartialEq, Eq, Clone, Hash, PartialOrd, Ord)]
pub enum Dim {
    Fix(usize),
    Var(usize),
    Add(Box<Dim>, Box<Dim>),
    Sub(Box<Dim>, Box<Dim>),
    Mul(Box<Dim>, Box<Dim>),
    Div(Box<Dim>, Box<Dim>),
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self { Dim::Fix(n) => Some(*n), _ => None }
    }
    // evaluate with symbol values, None when a symbol is unknown or the result is negative
    pub fn eval(&self, var: &impl Fn(usize) -> Option<usize>) -> Option<usize> {
        Some(match self {
            Dim::Fix(n) => *n,
            Dim::Var(s) => var(*s)?,
            Dim::Add(a, b) => a.eval(var)?.checked_add(b.eval(var)?)?,
            Dim::Sub(a, b) => a.eval(var)?.checked_sub(b.eval(var)?)?,
            Dim::Mul(a, b) => a.eval(var)?.checked_mul(b.eval(var)?)?,
            Dim::Div(a, b) => a.eval(var)?.checked_div(b.eval(var)?)?,
        })
    }
    // every symbol the dimension mentions
    pub fn vars(&self, out: &mut Vec<usize>) {
        match self {
            Dim::Fix(_) => {},
            Dim::Var(s) => out.push(*s),
            Dim::Add(a, b) | Dim::Sub(a, b) | Dim::Mul(a, b) | Dim::Div(a, b) => { a.vars(out); b.vars(out) },
        }
    }
    fn fold(self) -> Dim {
        let both = |a: &Dim, b: &Dim| Some((a.fixed()?, b.fixed()?));
        let folded = match &self {
            Dim::Add(a, b) => both(a, b).and_then(|(a, b)| a.checked_add(b)),
            Dim::Sub(a, b) => both(a, b).and_then(|(a, b)| a.checked_sub(b)),
            Dim::Mul(a, b) => both(a, b).and_then(|(a, b)| a.checked_mul(b)),
            Dim::Div(a, b) => both(a, b).and_then(|(a, b)| a.checked_div(b)),
            _ => None,
        };
        folded.map(Dim::Fix).unwrap_or(self)
    }
}

macro_rules! impl_dim_op {
    ($Trait: ident, $name: ident, $Variant: ident) => {
        impl std::ops::$Trait<Dim> for Dim {
            type Output = Dim;
            fn $name(self, rhs: Dim) -> Dim { Dim::$Variant(Box::new(self), Box::new(rhs)).fold() }
        }
        impl std::ops::$Trait<usize> for Dim {
            type Output = Dim;
            fn $name(self, rhs: usize) -> Dim { Dim::$Variant(Box::new(self), Box::new(Dim::Fix(rhs))).fold() }
        }
        impl std::ops::$Trait<usize> for &Dim {
            type Output = Dim;
            fn $name(self, rhs: usize) -> Dim { std::ops::$Trait::$name(self.clone(), rhs) }
        }
    };
}

impl_dim_op!(Add, add, Add);
impl_dim_op!(Sub, sub, Sub);
impl_dim_op!(Mul, mul, Mul);
impl_dim_op!(Div, div, Div);

impl From<usize> for Dim { fn from(n: usize) -> Self { Dim::Fix(n) } }

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fix(n) => write!(f, "{n}"),
            Dim::Var(s) => write!(f, "s{s}"),
            Dim::Add(a, b) => write!(f, "({a}+{b})"),
            Dim::Sub(a, b) => write!(f, "({a}-{b})"),
            Dim::Mul(a, b) => write!(f, "({a}*{b})"),
            Dim::Div(a, b) => write!(f, "({a}/{b})"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Default)]
pub struct Shape(pub(crate) SmallVec<[Dim; 4]>);

impl Shape {
    pub fn scalar() -> Self { Shape(SmallVec::new()) }
    pub fn new(dims: impl IntoIterator<Item = Dim>) -> Self { Shape(dims.into_iter().collect()) }
    pub fn rank(&self) -> usize { self.0.len() }
    pub fn dims(&self) -> &[Dim] { &self.0 }
    pub fn dim(&self, axis: usize) -> &Dim { &self.0[axis] }
    pub fn is_scalar(&self) -> bool { self.0.is_empty() }
    pub fn remove(mut self, dim: usize) -> Self {
        self.0.remove(dim); self
    }
    pub fn insert(mut self, dim: usize, n: Dim) -> Self {
        self.0.insert(dim, n); self
    }
    // number of elements if every dimension is fixed
    pub fn fixed_len(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, d| acc.checked_mul(d.fixed()?))
    }
    pub fn vars(&self) -> Vec<usize> {
        let mut out = vec![];
        self.0.iter().for_each(|d| d.vars(&mut out));
        out
    }
    // normalize a possibly negative axis
    pub fn axis(&self, axis: isize) -> Result<usize> {
        let rank = self.rank() as isize;
        let a = if axis < 0 { axis + rank } else { axis };
        if a < 0 || a >= rank { return mismatch(format!("axis {axis} out of range for shape {self}")) }
        Ok(a as usize)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 { f.write_str(", ")? }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

pub fn sh<const N: usize>(x: [usize; N]) -> Shape {
    Shape(x.into_iter().map(Dim::Fix).collect())
}

/// Equivalence classes of dynamic dimensions.
///
/// Symbols that meet in an elementwise op are unified; a class meeting a fixed
/// extent is pinned to it. At call time every class must receive one consistent value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Symbols {
    parent: Vec<usize>,
    pinned: Vec<Option<usize>>,
}

impl Symbols {
    pub fn fresh(&mut self) -> Dim {
        self.parent.push(self.parent.len());
        self.pinned.push(None);
        Dim::Var(self.parent.len() - 1)
    }
    pub fn len(&self) -> usize { self.parent.len() }
    pub fn is_empty(&self) -> bool { self.parent.is_empty() }
    pub fn find(&self, mut s: usize) -> usize {
        while self.parent[s] != s { s = self.parent[s] }
        s
    }
    pub fn pinned(&self, s: usize) -> Option<usize> { self.pinned[self.find(s)] }

    /// Rewrite a dimension onto class representatives and fold constants.
    pub fn canon(&self, dim: &Dim) -> Dim {
        let bin = |a: &Dim, b: &Dim| (Box::new(self.canon(a)), Box::new(self.canon(b)));
        match dim {
            Dim::Fix(n) => Dim::Fix(*n),
            Dim::Var(s) => match self.pinned(*s) { Some(n) => Dim::Fix(n), None => Dim::Var(self.find(*s)) },
            Dim::Add(a, b) => { let (a, b) = bin(a, b); Dim::Add(a, b).fold() },
            Dim::Sub(a, b) => { let (a, b) = bin(a, b); Dim::Sub(a, b).fold() },
            Dim::Mul(a, b) => { let (a, b) = bin(a, b); Dim::Mul(a, b).fold() },
            Dim::Div(a, b) => { let (a, b) = bin(a, b); Dim::Div(a, b).fold() },
        }
    }
    pub fn canon_shape(&self, shape: &Shape) -> Shape {
        Shape(shape.0.iter().map(|d| self.canon(d)).collect())
    }

    /// Require two dimensions to be equal, recording the constraint if they are symbolic.
    pub fn unify(&mut self, a: &Dim, b: &Dim) -> Result<Dim> {
        let (a, b) = (self.canon(a), self.canon(b));
        if a == b { return Ok(a) }
        match (&a, &b) {
            (Dim::Var(x), Dim::Var(y)) => {
                let (lo, hi) = (*x.min(y), *x.max(y));
                self.parent[hi] = lo;
                Ok(Dim::Var(lo))
            }
            (Dim::Var(x), Dim::Fix(n)) | (Dim::Fix(n), Dim::Var(x)) => {
                self.pinned[*x] = Some(*n);
                Ok(Dim::Fix(*n))
            }
            _ => mismatch(format!("dimension {a} is not compatible with {b}")),
        }
    }

    /// Numpy style broadcast of two shapes (right aligned, extent 1 stretches).
    pub fn broadcast(&mut self, a: &Shape, b: &Shape) -> Result<Shape> {
        let rank = a.rank().max(b.rank());
        let mut out = SmallVec::with_capacity(rank);
        for k in 0..rank {
            let da = (k + a.rank()).checked_sub(rank).map(|i| self.canon(&a.0[i]));
            let db = (k + b.rank()).checked_sub(rank).map(|i| self.canon(&b.0[i]));
            out.push(match (da, db) {
                (Some(d), None) | (None, Some(d)) => d,
                (Some(Dim::Fix(1)), Some(d)) | (Some(d), Some(Dim::Fix(1))) => d,
                (Some(x), Some(y)) => self.unify(&x, &y)
                    .or_else(|_| mismatch(format!("shapes {a} and {b} do not broadcast")))?,
                (None, None) => unreachable!("axis below both ranks"),
            });
        }
        Ok(Shape(out))
    }

    // shapes equal after canonicalization
    pub fn same(&self, a: &Shape, b: &Shape) -> bool {
        self.canon_shape(a) == self.canon_shape(b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn broadcast_fixed() {
        let mut s = Symbols::default();
        assert_eq!(s.broadcast(&sh([4, 1]), &sh([3])).unwrap(), sh([4, 3]));
        assert_eq!(s.broadcast(&sh([]), &sh([2, 2])).unwrap(), sh([2, 2]));
        assert!(matches!(s.broadcast(&sh([4, 2]), &sh([3])), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn symbols_unify_and_pin() {
        let mut s = Symbols::default();
        let (n, m, k) = (s.fresh(), s.fresh(), s.fresh());
        let a = Shape::new([n.clone(), m.clone()]);
        let b = Shape::new([k.clone(), Dim::Fix(8)]);
        let c = s.broadcast(&a, &b).unwrap();
        assert_eq!(c, Shape::new([Dim::Var(0), Dim::Fix(8)]));
        assert_eq!(s.canon(&k), Dim::Var(0));
        assert_eq!(s.pinned(1), Some(8));
        // half of a pinned symbol folds
        assert_eq!(s.canon(&(m / 2)), Dim::Fix(4));
        assert!(s.same(&Shape::new([n.clone()]), &Shape::new([k])));
        assert!(s.unify(&(n.clone() / 2), &n).is_err());
    }

    #[test]
    fn dim_eval() {
        let d = (Dim::Var(0) + 1) * 2;
        assert_eq!(d.eval(&|_| Some(3)), Some(8));
        assert_eq!(d.eval(&|_| None), None);
        assert_eq!((Dim::Fix(1) - 2).eval(&|_| None), None);
        assert_eq!(sh([2, 3, 4]).fixed_len(), Some(24));
    }

    #[test]
    fn scalar_bits() {
        for x in [Scalar::F32(-1.5), Scalar::I32(-7), Scalar::U32(9), Scalar::Bool(true)] {
            assert_eq!(Scalar::from_bits(x.dtype(), x.to_bits()), x);
        }
        assert_eq!(Scalar::F32(2.9).cast(DType::I32), Scalar::I32(2));
        assert!(Scalar::F32(1.0).is(1));
    }
}
