use super::*;

/// C99 with OpenMP: one function per kernel, the domain as a `parallel for`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CDialect;

const PRELUDE: &str = r#"#include <stdint.h>
#include <stdbool.h>
#include <string.h>
#include <math.h>

static inline float as_f32(uint32_t x) { float f; memcpy(&f, &x, 4); return f; }
static inline uint32_t from_f32(float f) { uint32_t x; memcpy(&x, &f, 4); return x; }
static inline int64_t fdiv(int64_t a, int64_t b) { int64_t q = a / b; return (a % b != 0 && ((a < 0) != (b < 0))) ? q - 1 : q; }
static inline int64_t fmod_i(int64_t a, int64_t b) { int64_t r = a % b; return (r != 0 && ((r < 0) != (b < 0))) ? r + b : r; }
static inline int64_t clampi(int64_t i, int64_t n) { return i < 0 ? 0 : (i >= n ? n - 1 : i); }
static inline int64_t wrapi(int64_t i, int64_t n) { return fmod_i(i, n); }
static inline int64_t check_index(int64_t i, int64_t n, int32_t* err) { if (i < 0 || i >= n) { *err = 1; return 0; } return i; }
#define checki(i, n) check_index((i), (n), err)
static inline int32_t div_i32(int32_t a, int32_t b) { return b == 0 ? 0 : (int32_t)((int64_t)a / b); }
static inline int32_t mod_i32(int32_t a, int32_t b) { return b == 0 ? 0 : (int32_t)((int64_t)a % b); }
static inline uint32_t div_u32(uint32_t a, uint32_t b) { return b == 0 ? 0 : a / b; }
static inline uint32_t mod_u32(uint32_t a, uint32_t b) { return b == 0 ? 0 : a % b; }
static inline float fracf(float x) { return x - floorf(x); }
static inline float signf(float x) { return (float)((x > 0.0f) - (x < 0.0f)); }

"#;

impl Dialect for CDialect {
    fn target(&self) -> Target { Target::C }
    fn prelude(&self) -> &'static str { PRELUDE }

    fn open(&self, name: &str, _kernel: &Kernel, total: &str) -> String {
        format!(
            "void {name}(const int64_t* dims, uint32_t* const* buf, int32_t* err) {{\n    \
             const int64_t total = {total};\n    \
             #pragma omp parallel for\n    \
             for (int64_t gid = 0; gid < total; gid++) {{\n")
    }
    fn close(&self) -> &'static str { "    }\n}\n" }
    fn index_type(&self) -> &'static str { "int64_t" }

    fn ty(&self, dtype: DType) -> &'static str {
        match dtype { DType::F32 => "float", DType::I32 => "int32_t", DType::U32 => "uint32_t", DType::Bool => "bool" }
    }

    fn literal(&self, value: Scalar) -> String {
        match value {
            Scalar::F32(x) if x.is_nan() => "NAN".into(),
            Scalar::F32(x) if x.is_infinite() => if x > 0.0 { "INFINITY".into() } else { "-INFINITY".into() },
            Scalar::F32(x) => format!("{x:?}f"),
            Scalar::I32(i32::MIN) => "(-2147483647 - 1)".into(),
            Scalar::I32(x) => format!("{x}"),
            Scalar::U32(x) => format!("{x}u"),
            Scalar::Bool(x) => format!("{x}"),
        }
    }

    fn dim(&self, symbol: usize) -> String { format!("dims[{symbol}]") }

    fn load(&self, buffer: usize, offset: &str, dtype: DType) -> String {
        let word = format!("buf[{buffer}][{offset}]");
        match dtype {
            DType::F32 => format!("as_f32({word})"),
            DType::I32 => format!("(int32_t){word}"),
            DType::U32 => word,
            DType::Bool => format!("({word} != 0)"),
        }
    }

    fn store(&self, buffer: usize, offset: &str, dtype: DType, value: &str) -> String {
        match dtype {
            DType::F32 => format!("buf[{buffer}][{offset}] = from_f32({value});"),
            _ => format!("buf[{buffer}][{offset}] = (uint32_t)({value});"),
        }
    }

    fn combine(&self, op: ScatterOp, buffer: usize, offset: &str, dtype: DType, value: &str) -> String {
        let ty = if dtype == DType::Bool { "uint32_t" } else { self.ty(dtype) };
        let place = format!("*({ty}*)&buf[{buffer}][{offset}]");
        match (op, dtype) {
            (ScatterOp::Add, DType::F32 | DType::I32 | DType::U32) => format!("#pragma omp atomic\n{place} += {value};"),
            (ScatterOp::Add, _) => format!("#pragma omp atomic\n{place} |= (uint32_t)({value});"),
            (op, dtype) => {
                let step = self.min_max(op == ScatterOp::Max, dtype, "*p", &format!("({ty})({value})"));
                format!("#pragma omp critical\n{{ {ty}* p = {}; *p = {step}; }}", &place[1..])
            }
        }
    }

    fn unary(&self, op: UnaryOp, dtype: DType, x: &str) -> String {
        use UnaryOp::*;
        if let Some(name) = math_name(op) { return format!("{name}f({x})") }
        let float = dtype == DType::F32;
        match op {
            Neg => format!("(-{x})"),
            Abs if float => format!("fabsf({x})"),
            Abs if dtype == DType::U32 => x.to_string(),
            Abs => format!("({x} < 0 ? -{x} : {x})"),
            Sign if float => format!("signf({x})"),
            Sign => format!("(({x} > 0) - ({x} < 0))"),
            Frac => format!("fracf({x})"),
            Sqr => format!("({x} * {x})"),
            Rsqrt => format!("(1.0f / sqrtf({x}))"),
            Rcp => format!("(1.0f / {x})"),
            Not => format!("(!{x})"),
            BitNot => format!("(~{x})"),
            _ => x.to_string(),
        }
    }

    fn cast(&self, to: DType, x: &str) -> String {
        match to {
            DType::Bool => format!("(({x}) != 0)"),
            to => format!("(({}){x})", self.ty(to)),
        }
    }

    fn min_max(&self, max: bool, dtype: DType, a: &str, b: &str) -> String {
        match (dtype, max) {
            (DType::F32, false) => format!("fminf({a}, {b})"),
            (DType::F32, true) => format!("fmaxf({a}, {b})"),
            (_, false) => format!("({a} < {b} ? {a} : {b})"),
            (_, true) => format!("({a} > {b} ? {a} : {b})"),
        }
    }

    fn float_call(&self, name: &str, args: &[&str]) -> String {
        format!("{name}f({})", args.join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literals_are_valid_c() {
        let d = CDialect;
        assert_eq!(d.literal(Scalar::F32(0.25)), "0.25f");
        assert_eq!(d.literal(Scalar::F32(f32::NEG_INFINITY)), "-INFINITY");
        assert_eq!(d.literal(Scalar::I32(i32::MIN)), "(-2147483647 - 1)");
        assert_eq!(d.literal(Scalar::U32(7)), "7u");
    }

    #[test]
    fn integer_division_goes_through_helpers() {
        let d = CDialect;
        assert_eq!(d.binary(BinaryOp::Div, DType::I32, "a", "b"), "div_i32(a, b)");
        assert_eq!(d.binary(BinaryOp::Div, DType::F32, "a", "b"), "(a / b)");
        assert_eq!(d.binary(BinaryOp::Mod, DType::F32, "a", "b"), "fmodf(a, b)");
        assert_eq!(d.binary(BinaryOp::Xor, DType::Bool, "a", "b"), "(a != b)");
    }

    #[test]
    fn scatter_min_uses_a_critical_section() {
        let src = CDialect.combine(ScatterOp::Min, 2, "o", DType::I32, "v");
        assert!(src.starts_with("#pragma omp critical"), "{src}");
        assert!(src.contains("int32_t* p = (int32_t*)&buf[2][o];"), "{src}");
    }
}
