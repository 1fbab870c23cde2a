use super::*;

/// HLSL compute shaders: one entry point per kernel, one thread per domain point.
/// Every buffer is a `RWStructuredBuffer<uint>` reinterpreted per element type.
#[derive(Debug, Clone, Copy, Default)]
pub struct HlslDialect;

pub const GROUP_SIZE: usize = 256;

const PRELUDE: &str = r#"StructuredBuffer<int> dims : register(t0);
RWStructuredBuffer<uint> err : register(u0);

int fdiv(int a, int b) { int q = a / b; return (a % b != 0 && ((a < 0) != (b < 0))) ? q - 1 : q; }
int fmod_i(int a, int b) { int r = a % b; return (r != 0 && ((r < 0) != (b < 0))) ? r + b : r; }
int clampi(int i, int n) { return clamp(i, 0, n - 1); }
int wrapi(int i, int n) { return fmod_i(i, n); }
int checki(int i, int n) { if (i < 0 || i >= n) { err[0] = 1; return 0; } return i; }
int div_i32(int a, int b) { return b == 0 ? 0 : a / b; }
int mod_i32(int a, int b) { return b == 0 ? 0 : a % b; }
uint div_u32(uint a, uint b) { return b == 0 ? 0 : a / b; }
uint mod_u32(uint a, uint b) { return b == 0 ? 0 : a % b; }
float signf(float x) { return x > 0.0f ? 1.0f : (x < 0.0f ? -1.0f : 0.0f); }

"#;

impl Dialect for HlslDialect {
    fn target(&self) -> Target { Target::Hlsl }
    fn prelude(&self) -> &'static str { PRELUDE }

    fn open(&self, name: &str, kernel: &Kernel, total: &str) -> String {
        let mut out = String::new();
        for b in 0..kernel.inputs.len() + kernel.outputs.len() {
            out += &format!("RWStructuredBuffer<uint> b{b} : register(u{});\n", b + 1);
        }
        out += &format!(
            "\n[numthreads({GROUP_SIZE}, 1, 1)]\n\
             void {name}(uint3 tid : SV_DispatchThreadID) {{\n    \
             int total = {total};\n    \
             if ((int)tid.x < total) {{\n        \
             int gid = (int)tid.x;\n");
        out
    }
    fn close(&self) -> &'static str { "    }\n}\n" }
    fn index_type(&self) -> &'static str { "int" }

    fn ty(&self, dtype: DType) -> &'static str {
        match dtype { DType::F32 => "float", DType::I32 => "int", DType::U32 => "uint", DType::Bool => "bool" }
    }

    fn literal(&self, value: Scalar) -> String {
        match value {
            Scalar::F32(x) if x.is_nan() => "asfloat(0x7fc00000u)".into(),
            Scalar::F32(x) if x.is_infinite() => if x > 0.0 { "asfloat(0x7f800000u)".into() } else { "asfloat(0xff800000u)".into() },
            Scalar::F32(x) => format!("{x:?}f"),
            Scalar::I32(i32::MIN) => "(-2147483647 - 1)".into(),
            Scalar::I32(x) => format!("{x}"),
            Scalar::U32(x) => format!("{x}u"),
            Scalar::Bool(x) => format!("{x}"),
        }
    }

    fn dim(&self, symbol: usize) -> String { format!("dims[{symbol}]") }

    fn load(&self, buffer: usize, offset: &str, dtype: DType) -> String {
        let word = format!("b{buffer}[{offset}]");
        match dtype {
            DType::F32 => format!("asfloat({word})"),
            DType::I32 => format!("asint({word})"),
            DType::U32 => word,
            DType::Bool => format!("({word} != 0)"),
        }
    }

    fn store(&self, buffer: usize, offset: &str, dtype: DType, value: &str) -> String {
        match dtype {
            DType::F32 | DType::I32 => format!("b{buffer}[{offset}] = asuint({value});"),
            DType::U32 => format!("b{buffer}[{offset}] = {value};"),
            DType::Bool => format!("b{buffer}[{offset}] = ({value}) ? 1u : 0u;"),
        }
    }

    fn combine(&self, op: ScatterOp, buffer: usize, offset: &str, dtype: DType, value: &str) -> String {
        let place = format!("b{buffer}[{offset}]");
        match (op, dtype) {
            (ScatterOp::Add, DType::I32 | DType::U32) => format!("InterlockedAdd({place}, asuint({value}));"),
            (ScatterOp::Min, DType::U32) => format!("InterlockedMin({place}, {value});"),
            (ScatterOp::Max, DType::U32) => format!("InterlockedMax({place}, {value});"),
            (ScatterOp::Min, DType::Bool) => format!("InterlockedAnd({place}, ({value}) ? 1u : 0u);"),
            (_, DType::Bool) => format!("InterlockedOr({place}, ({value}) ? 1u : 0u);"),
            (op, dtype) => {
                // compare and swap until no other thread got in between
                let ty = self.ty(dtype);
                let old = if dtype == DType::F32 { "asfloat(seen)" } else { "asint(seen)" };
                let step = match op {
                    ScatterOp::Add => format!("({old} + val)"),
                    op => self.min_max(op == ScatterOp::Max, dtype, old, "val"),
                };
                [
                    "{".to_string(),
                    format!("    int at = {offset};"),
                    format!("    {ty} val = {value};"),
                    format!("    uint seen = b{buffer}[at];"),
                    "    uint prev;".to_string(),
                    "    [allow_uav_condition] while (true) {".to_string(),
                    format!("        InterlockedCompareExchange(b{buffer}[at], seen, asuint({step}), prev);"),
                    "        if (prev == seen) break;".to_string(),
                    "        seen = prev;".to_string(),
                    "    }".to_string(),
                    "}".to_string(),
                ].join("\n")
            }
        }
    }

    fn unary(&self, op: UnaryOp, dtype: DType, x: &str) -> String {
        use UnaryOp::*;
        if let Some(name) = math_name(op) { return format!("{name}({x})") }
        match op {
            Neg => format!("(-{x})"),
            Abs if dtype == DType::U32 => x.to_string(),
            Abs => format!("abs({x})"),
            Sign if dtype == DType::F32 => format!("signf({x})"),
            Sign if dtype == DType::U32 => format!("(uint)({x} > 0)"),
            Sign => format!("sign({x})"),
            Frac => format!("frac({x})"),
            Sqr => format!("({x} * {x})"),
            Rsqrt => format!("rsqrt({x})"),
            Rcp => format!("rcp({x})"),
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

    fn min_max(&self, max: bool, _dtype: DType, a: &str, b: &str) -> String {
        if max { format!("max({a}, {b})") } else { format!("min({a}, {b})") }
    }

    fn float_call(&self, name: &str, args: &[&str]) -> String {
        let name = if name == "fma" { "mad" } else { name };
        format!("{name}({})", args.join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn float_scatter_is_a_compare_exchange_loop() {
        let src = HlslDialect.combine(ScatterOp::Add, 1, "i0", DType::F32, "v3");
        assert!(src.contains("InterlockedCompareExchange(b1[at], seen, asuint((asfloat(seen) + val)), prev);"), "{src}");
        assert!(src.contains("float val = v3;"));
    }

    #[test]
    fn integer_scatter_uses_native_atomics() {
        assert_eq!(HlslDialect.combine(ScatterOp::Add, 0, "k", DType::I32, "x"), "InterlockedAdd(b0[k], asuint(x));");
        assert_eq!(HlslDialect.combine(ScatterOp::Max, 0, "k", DType::U32, "x"), "InterlockedMax(b0[k], x);");
    }

    #[test]
    fn fused_multiply_add_maps_to_mad() {
        assert_eq!(HlslDialect.float_call("fma", &["a", "b", "c"]), "mad(a, b, c)");
        assert_eq!(HlslDialect.unary(UnaryOp::Rsqrt, DType::F32, "x"), "rsqrt(x)");
    }
}
