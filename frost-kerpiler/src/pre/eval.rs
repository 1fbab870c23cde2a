//! Scalar semantics of every element operation.
//!
//! Integer arithmetic wraps, integer division by zero yields zero, shifts use the low
//! five bits of the shift amount. Float operations are plain IEEE-754 f32.

use super::*;

fn f(x: Scalar) -> f32 {
    match x { Scalar::F32(x) => x, other => match other.cast(DType::F32) { Scalar::F32(x) => x, _ => 0.0 } }
}

pub fn unary(op: UnaryOp, x: Scalar) -> Scalar {
    use UnaryOp::*;
    match (op, x) {
        (Neg, Scalar::I32(v)) => Scalar::I32(v.wrapping_neg()),
        (Neg, Scalar::U32(v)) => Scalar::U32(v.wrapping_neg()),
        (Abs, Scalar::I32(v)) => Scalar::I32(v.wrapping_abs()),
        (Abs, Scalar::U32(v)) => Scalar::U32(v),
        (Sign, Scalar::I32(v)) => Scalar::I32(v.signum()),
        (Sign, Scalar::U32(v)) => Scalar::U32((v > 0) as u32),
        (Sqr, Scalar::I32(v)) => Scalar::I32(v.wrapping_mul(v)),
        (Sqr, Scalar::U32(v)) => Scalar::U32(v.wrapping_mul(v)),
        (Not, Scalar::Bool(v)) => Scalar::Bool(!v),
        (BitNot, Scalar::I32(v)) => Scalar::I32(!v),
        (BitNot, Scalar::U32(v)) => Scalar::U32(!v),
        (op, x) => {
            let v = f(x);
            Scalar::F32(match op {
                Neg => -v,
                Abs => v.abs(),
                Sign => if v > 0.0 { 1.0 } else if v < 0.0 { -1.0 } else { 0.0 },
                Floor => v.floor(),
                Ceil => v.ceil(),
                Round => v.round(),
                Trunc => v.trunc(),
                Frac => v - v.floor(),
                Sin => v.sin(), Cos => v.cos(), Tan => v.tan(),
                Asin => v.asin(), Acos => v.acos(), Atan => v.atan(),
                Sinh => v.sinh(), Cosh => v.cosh(), Tanh => v.tanh(),
                Exp => v.exp(), Exp2 => v.exp2(), Log => v.ln(), Log2 => v.log2(),
                Sqrt => v.sqrt(),
                Sqr => v * v,
                Rsqrt => 1.0 / v.sqrt(),
                Rcp => 1.0 / v,
                Not | BitNot => v,
            })
        }
    }
}

pub fn binary(op: BinaryOp, a: Scalar, b: Scalar) -> Scalar {
    use BinaryOp::*;
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => match op {
            Add => Scalar::F32(x + y), Sub => Scalar::F32(x - y), Mul => Scalar::F32(x * y), Div => Scalar::F32(x / y),
            Mod => Scalar::F32(x % y), Min => Scalar::F32(x.min(y)), Max => Scalar::F32(x.max(y)),
            Pow => Scalar::F32(x.powf(y)), Atan2 => Scalar::F32(x.atan2(y)),
            Lt => Scalar::Bool(x < y), Le => Scalar::Bool(x <= y), Gt => Scalar::Bool(x > y), Ge => Scalar::Bool(x >= y),
            Eq => Scalar::Bool(x == y), Ne => Scalar::Bool(x != y),
            And | Or | Xor | Shl | Shr => Scalar::F32(x),
        },
        (Scalar::I32(x), Scalar::I32(y)) => match op {
            Add => Scalar::I32(x.wrapping_add(y)), Sub => Scalar::I32(x.wrapping_sub(y)), Mul => Scalar::I32(x.wrapping_mul(y)),
            Div => Scalar::I32(x.checked_div(y).unwrap_or(0)), Mod => Scalar::I32(x.checked_rem(y).unwrap_or(0)),
            Min => Scalar::I32(x.min(y)), Max => Scalar::I32(x.max(y)),
            Pow | Atan2 => Scalar::I32(x),
            Lt => Scalar::Bool(x < y), Le => Scalar::Bool(x <= y), Gt => Scalar::Bool(x > y), Ge => Scalar::Bool(x >= y),
            Eq => Scalar::Bool(x == y), Ne => Scalar::Bool(x != y),
            And => Scalar::I32(x & y), Or => Scalar::I32(x | y), Xor => Scalar::I32(x ^ y),
            Shl => Scalar::I32(x.wrapping_shl(y as u32)), Shr => Scalar::I32(x.wrapping_shr(y as u32)),
        },
        (Scalar::U32(x), Scalar::U32(y)) => match op {
            Add => Scalar::U32(x.wrapping_add(y)), Sub => Scalar::U32(x.wrapping_sub(y)), Mul => Scalar::U32(x.wrapping_mul(y)),
            Div => Scalar::U32(x.checked_div(y).unwrap_or(0)), Mod => Scalar::U32(x.checked_rem(y).unwrap_or(0)),
            Min => Scalar::U32(x.min(y)), Max => Scalar::U32(x.max(y)),
            Pow | Atan2 => Scalar::U32(x),
            Lt => Scalar::Bool(x < y), Le => Scalar::Bool(x <= y), Gt => Scalar::Bool(x > y), Ge => Scalar::Bool(x >= y),
            Eq => Scalar::Bool(x == y), Ne => Scalar::Bool(x != y),
            And => Scalar::U32(x & y), Or => Scalar::U32(x | y), Xor => Scalar::U32(x ^ y),
            Shl => Scalar::U32(x.wrapping_shl(y)), Shr => Scalar::U32(x.wrapping_shr(y)),
        },
        (Scalar::Bool(x), Scalar::Bool(y)) => Scalar::Bool(match op {
            Eq => x == y, Ne => x != y,
            And | Min | Mul => x & y, Or | Max | Add => x | y, Xor | Sub => x ^ y,
            Lt => !x & y, Le => x <= y, Gt => x & !y, Ge => x >= y,
            _ => x,
        }),
        // operands are type checked at trace time
        (x, _) => x,
    }
}

pub fn ternary(op: TernaryOp, a: Scalar, b: Scalar, c: Scalar) -> Scalar {
    match op {
        TernaryOp::Select => if matches!(a, Scalar::Bool(true)) { b } else { c },
        TernaryOp::Clamp => binary(BinaryOp::Min, binary(BinaryOp::Max, a, b), c),
        TernaryOp::Fma => Scalar::F32(f(a).mul_add(f(b), f(c))),
        TernaryOp::Lerp => { let (a, b, t) = (f(a), f(b), f(c)); Scalar::F32(a + (b - a) * t) }
    }
}

// identity element of a reduction
pub fn reduce_init(op: ReduceOp, dtype: DType) -> Scalar {
    match (op, dtype) {
        (ReduceOp::Sum, d) => Scalar::zero(d),
        (ReduceOp::Prod, d) => Scalar::I32(1).cast(d),
        (ReduceOp::Min, DType::F32) => Scalar::F32(f32::INFINITY),
        (ReduceOp::Min, DType::I32) => Scalar::I32(i32::MAX),
        (ReduceOp::Min, DType::U32) => Scalar::U32(u32::MAX),
        (ReduceOp::Min, DType::Bool) => Scalar::Bool(true),
        (ReduceOp::Max, DType::F32) => Scalar::F32(f32::NEG_INFINITY),
        (ReduceOp::Max, DType::I32) => Scalar::I32(i32::MIN),
        (ReduceOp::Max, DType::U32) => Scalar::U32(0),
        (ReduceOp::Max, DType::Bool) => Scalar::Bool(false),
    }
}

pub fn reduce_step(op: ReduceOp, acc: Scalar, x: Scalar) -> Scalar {
    let op = match op { ReduceOp::Sum => BinaryOp::Add, ReduceOp::Prod => BinaryOp::Mul, ReduceOp::Min => BinaryOp::Min, ReduceOp::Max => BinaryOp::Max };
    binary(op, acc, x)
}

pub fn scatter_step(op: ScatterOp, old: Scalar, x: Scalar) -> Scalar {
    let op = match op { ScatterOp::Add => BinaryOp::Add, ScatterOp::Min => BinaryOp::Min, ScatterOp::Max => BinaryOp::Max };
    binary(op, old, x)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arithmetic() {
        assert_eq!(binary(BinaryOp::Add, Scalar::F32(1.0), Scalar::F32(2.0)), Scalar::F32(3.0));
        assert_eq!(binary(BinaryOp::Div, Scalar::I32(7), Scalar::I32(0)), Scalar::I32(0));
        assert_eq!(binary(BinaryOp::Lt, Scalar::U32(1), Scalar::U32(2)), Scalar::Bool(true));
        assert_eq!(unary(UnaryOp::Frac, Scalar::F32(-0.25)), Scalar::F32(0.75));
        assert_eq!(unary(UnaryOp::Neg, Scalar::I32(3)), Scalar::I32(-3));
        assert_eq!(ternary(TernaryOp::Clamp, Scalar::I32(9), Scalar::I32(0), Scalar::I32(4)), Scalar::I32(4));
        assert_eq!(ternary(TernaryOp::Select, Scalar::Bool(false), Scalar::I32(1), Scalar::I32(2)), Scalar::I32(2));
        assert_eq!(reduce_step(ReduceOp::Max, reduce_init(ReduceOp::Max, DType::F32), Scalar::F32(-3.0)), Scalar::F32(-3.0));
    }
}
