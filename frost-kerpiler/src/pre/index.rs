use std::fmt;

use super::Shape;
use crate::error::*;

/// What an indexed access does when its index leaves `[0, extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Boundary {
    /// read or write the nearest edge element
    #[default]
    Clamp,
    /// wrap around periodically
    Wrap,
    /// fail the run with `IndexOutOfDomain`
    Error,
}

impl Boundary {
    pub fn name(&self) -> &'static str {
        match self { Boundary::Clamp => "clamp", Boundary::Wrap => "wrap", Boundary::Error => "error" }
    }
    pub fn parse(s: &str) -> Option<Boundary> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Some(Boundary::Clamp),
            "wrap" => Some(Boundary::Wrap),
            "error" => Some(Boundary::Error),
            _ => None,
        }
    }
    /// Map an index onto `[0, extent)` according to the policy.
    pub fn apply(&self, axis: usize, index: i64, extent: usize) -> Result<usize> {
        let n = extent as i64;
        if n == 0 { return Err(Error::IndexOutOfDomain { axis, index, extent }) }
        match self {
            Boundary::Clamp => Ok(index.clamp(0, n - 1) as usize),
            Boundary::Wrap => Ok(index.rem_euclid(n) as usize),
            Boundary::Error if index < 0 || index >= n => Err(Error::IndexOutOfDomain { axis, index, extent }),
            Boundary::Error => Ok(index as usize),
        }
    }
}

/// Index arithmetics over the axes of an iteration domain.
/// Division and remainder round towards negative infinity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Idx {
    Const(i64),
    Axis(usize),
    Add(Box<Idx>, Box<Idx>),
    Mul(Box<Idx>, i64),
    Div(Box<Idx>, i64),
    Rem(Box<Idx>, i64),
}

impl Idx {
    pub fn eval(&self, axes: &[i64]) -> i64 {
        match self {
            Idx::Const(c) => *c,
            Idx::Axis(a) => axes[*a],
            Idx::Add(a, b) => a.eval(axes) + b.eval(axes),
            Idx::Mul(a, k) => a.eval(axes) * k,
            Idx::Div(a, k) => a.eval(axes).div_euclid(*k),
            Idx::Rem(a, k) => a.eval(axes).rem_euclid(*k),
        }
    }
    // highest axis mentioned
    pub fn max_axis(&self) -> Option<usize> {
        match self {
            Idx::Const(_) => None,
            Idx::Axis(a) => Some(*a),
            Idx::Add(a, b) => a.max_axis().max(b.max_axis()),
            Idx::Mul(a, _) | Idx::Div(a, _) | Idx::Rem(a, _) => a.max_axis(),
        }
    }
    /// Render with the given axis names. `div` and `rem` name the floor helpers of the dialect.
    pub fn render(&self, axes: &[String], div: &str, rem: &str) -> String {
        match self {
            Idx::Const(c) => format!("{c}"),
            Idx::Axis(a) => axes[*a].clone(),
            Idx::Add(a, b) => match **b {
                Idx::Const(c) if c < 0 => format!("({} - {})", a.render(axes, div, rem), -c),
                _ => format!("({} + {})", a.render(axes, div, rem), b.render(axes, div, rem)),
            },
            Idx::Mul(a, k) => format!("({} * {k})", a.render(axes, div, rem)),
            Idx::Div(a, k) => format!("{div}({}, {k})", a.render(axes, div, rem)),
            Idx::Rem(a, k) => format!("{rem}({}, {k})", a.render(axes, div, rem)),
        }
    }
    fn add(self, rhs: Idx) -> Idx {
        match (self, rhs) {
            (Idx::Const(a), Idx::Const(b)) => Idx::Const(a + b),
            (x, Idx::Const(0)) | (Idx::Const(0), x) => x,
            (Idx::Add(x, c), Idx::Const(d)) if matches!(*c, Idx::Const(_)) => {
                let Idx::Const(c) = *c else { unreachable!() };
                if c + d == 0 { return *x }
                Idx::Add(x, Box::new(Idx::Const(c + d)))
            }
            (x, y) => Idx::Add(Box::new(x), Box::new(y)),
        }
    }
}

impl fmt::Display for Idx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = (0..=self.max_axis().unwrap_or(0)).map(|a| format!("i{a}")).collect::<Vec<_>>();
        f.write_str(&self.render(&names, "floordiv", "floormod"))
    }
}

/// A symbolic loop variable, or arithmetic over such variables, tied to the
/// iteration domain it ranges over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexVar {
    // None once variables of different domains were combined
    pub(crate) domain: Option<Shape>,
    pub(crate) expr: Idx,
}

impl IndexVar {
    pub(crate) fn axis(domain: &Shape, axis: usize) -> Self {
        IndexVar { domain: Some(domain.clone()), expr: Idx::Axis(axis) }
    }
    pub fn expr(&self) -> &Idx { &self.expr }
    pub fn domain(&self) -> Option<&Shape> { self.domain.as_ref() }
    // domain after a binary combination
    fn join(a: Option<Shape>, b: Option<Shape>) -> Option<Shape> {
        match (a, b) { (Some(a), Some(b)) if a == b => Some(a), _ => None }
    }
    pub(crate) fn checked_domain(&self) -> Result<&Shape> {
        self.domain.as_ref().ok_or_else(|| Error::ShapeMismatch(format!("index {} mixes variables of different domains", self.expr)))
    }
}

macro_rules! impl_idx_scalar_op {
    ($Trait: ident, $name: ident, |$e: ident, $k: ident| $body: expr) => {
        impl std::ops::$Trait<i64> for IndexVar {
            type Output = IndexVar;
            fn $name(self, $k: i64) -> IndexVar {
                let $e = self.expr;
                IndexVar { domain: self.domain, expr: $body }
            }
        }
        impl std::ops::$Trait<i64> for &IndexVar {
            type Output = IndexVar;
            fn $name(self, k: i64) -> IndexVar { std::ops::$Trait::$name(self.clone(), k) }
        }
    };
}

impl_idx_scalar_op!(Add, add, |e, k| e.add(Idx::Const(k)));
impl_idx_scalar_op!(Sub, sub, |e, k| e.add(Idx::Const(-k)));
impl_idx_scalar_op!(Mul, mul, |e, k| match k { 1 => e, 0 => Idx::Const(0), _ => Idx::Mul(Box::new(e), k) });
impl_idx_scalar_op!(Div, div, |e, k| if k == 1 { e } else { Idx::Div(Box::new(e), k) });
impl_idx_scalar_op!(Rem, rem, |e, k| Idx::Rem(Box::new(e), k));

impl std::ops::Add<IndexVar> for IndexVar {
    type Output = IndexVar;
    fn add(self, rhs: IndexVar) -> IndexVar {
        IndexVar { domain: IndexVar::join(self.domain, rhs.domain), expr: self.expr.add(rhs.expr) }
    }
}

impl std::ops::Sub<IndexVar> for IndexVar {
    type Output = IndexVar;
    fn sub(self, rhs: IndexVar) -> IndexVar {
        let neg = Idx::Mul(Box::new(rhs.expr), -1);
        IndexVar { domain: IndexVar::join(self.domain, rhs.domain), expr: self.expr.add(neg) }
    }
}

impl std::ops::Add<&IndexVar> for &IndexVar {
    type Output = IndexVar;
    fn add(self, rhs: &IndexVar) -> IndexVar { self.clone() + rhs.clone() }
}

impl std::ops::Sub<&IndexVar> for &IndexVar {
    type Output = IndexVar;
    fn sub(self, rhs: &IndexVar) -> IndexVar { self.clone() - rhs.clone() }
}

/// Validate divisors, which must be positive.
pub(crate) fn check_idx(idx: &Idx) -> Result<()> {
    match idx {
        Idx::Const(_) | Idx::Axis(_) => Ok(()),
        Idx::Add(a, b) => { check_idx(a)?; check_idx(b) },
        Idx::Mul(a, _) => check_idx(a),
        Idx::Div(a, k) | Idx::Rem(a, k) if *k > 0 => check_idx(a),
        Idx::Div(..) | Idx::Rem(..) => invalid(format!("index {idx} divides by a non-positive constant")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pre::sh;

    #[test]
    fn index_arithmetic() {
        let d = sh([8, 8]);
        let (i, j) = (IndexVar::axis(&d, 0), IndexVar::axis(&d, 1));
        let e = (&i - 1) + (&j * 2);
        assert_eq!(e.expr.eval(&[0, 3]), 5);
        assert_eq!((&i / 2).expr.eval(&[-3, 0]), -2);
        assert_eq!((&i % 3).expr.eval(&[-1, 0]), 2);
        assert_eq!(((&i + 1) - 1).expr, Idx::Axis(0));
        assert_eq!(e.domain(), Some(&d));
        let other = IndexVar::axis(&sh([4]), 0);
        assert!((i + other).checked_domain().is_err());
    }

    #[test]
    fn boundary_policies() {
        assert_eq!(Boundary::Clamp.apply(0, -1, 8).unwrap(), 0);
        assert_eq!(Boundary::Clamp.apply(0, 9, 8).unwrap(), 7);
        assert_eq!(Boundary::Wrap.apply(0, -1, 8).unwrap(), 7);
        assert_eq!(Boundary::Wrap.apply(0, 8, 8).unwrap(), 0);
        assert_eq!(Boundary::Error.apply(1, 8, 8), Err(Error::IndexOutOfDomain { axis: 1, index: 8, extent: 8 }));
        assert_eq!(Boundary::parse("WRAP"), Some(Boundary::Wrap));
    }

    #[test]
    fn render_names_axes() {
        let d = sh([4, 4]);
        let e = (IndexVar::axis(&d, 1) - 1) / 2;
        let axes = vec!["x".to_string(), "y".to_string()];
        assert_eq!(e.expr.render(&axes, "fdiv", "fmod"), "fdiv((y - 1), 2)");
    }
}
