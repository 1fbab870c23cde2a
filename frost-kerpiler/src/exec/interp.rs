use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use super::*;
use crate::pre::eval;

/// Toolchain that evaluates the kernel IR directly, one domain point after another in
/// row-major order. It accepts every unit and ignores the generated source.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Toolchain for Interpreter {
    fn name(&self) -> &str { "interpreter" }
    fn build(&self, unit: &KernelUnit, _flags: &str) -> Result<Arc<dyn Dispatch>, String> {
        Ok(Arc::new(Evaluator { graph: unit.graph.clone(), kernel: unit.kernel.clone() }))
    }
}

struct Evaluator {
    graph: Arc<Graph>,
    kernel: Kernel,
}

// buffers of one launch, locked for its duration
struct Frame<'a> {
    dims: &'a [usize],
    inputs: Vec<(Vec<usize>, RwLockReadGuard<'a, Vec<u32>>)>,
    outputs: Vec<(Vec<usize>, RwLockWriteGuard<'a, Vec<u32>>)>,
}

fn row_major(shape: &[usize], coords: impl IntoIterator<Item = usize>) -> usize {
    coords.into_iter().zip(shape).fold(0, |acc, (c, n)| acc * n + c)
}

fn as_index(value: Scalar) -> i64 {
    match value {
        Scalar::I32(i) => i as i64,
        Scalar::U32(u) => u as i64,
        other => other.to_bits() as i64,
    }
}

impl Dispatch for Evaluator {
    fn dispatch(&self, launch: &Launch) -> Result<()> {
        let k = &self.kernel;
        let symbols = self.graph.symbols();
        if launch.buffers.len() != k.inputs.len() + k.outputs.len() {
            return invalid(format!("kernel {} takes {} buffers, got {}", k.id, k.inputs.len() + k.outputs.len(), launch.buffers.len()));
        }
        let extents = |shape: &Shape| -> Vec<usize> {
            shape.dims().iter().map(|d| {
                symbols.canon(d).eval(&|s| launch.dims.get(s).copied()).unwrap_or(0)
            }).collect()
        };
        let (ins, outs) = launch.buffers.split_at(k.inputs.len());
        let mut frame = Frame {
            dims: launch.dims,
            inputs: k.inputs.iter().zip(ins).map(|(n, s)| {
                (extents(&self.graph.node(*n).shape), s.read().unwrap_or_else(PoisonError::into_inner))
            }).collect(),
            outputs: k.outputs.iter().zip(outs).map(|(o, s)| {
                (extents(&self.graph.node(o.node).shape), s.write().unwrap_or_else(PoisonError::into_inner))
            }).collect(),
        };
        let domain = extents(&k.domain);
        let total = domain.iter().product::<usize>();
        let mut env = HashMap::new();
        let mut point = vec![0i64; domain.len()];
        for flat in 0..total {
            let mut rest = flat;
            for (axis, &n) in domain.iter().enumerate().rev() {
                point[axis] = (rest % n) as i64;
                rest /= n;
            }
            env.clear();
            for &m in &k.body { self.member(m, &point, &mut env, &mut frame)? }
            for (o, out) in k.outputs.iter().enumerate() {
                if self.graph.node(out.node).op.is_write() { continue }
                let value = self.value(out.node, &point, &env, &frame)?;
                let (shape, words) = &mut frame.outputs[o];
                let offset = row_major(shape, point.iter().map(|&c| c as usize));
                words[offset] = value.to_bits();
            }
        }
        Ok(())
    }
}

impl Evaluator {
    // value of an operand at a point: computed member, literal or buffer element
    fn value(&self, n: NodeId, point: &[i64], env: &HashMap<NodeId, Scalar>, frame: &Frame) -> Result<Scalar> {
        if let Some(v) = env.get(&n) { return Ok(*v) }
        let node = self.graph.node(n);
        if let Op::Const { value } = node.op { return Ok(value) }
        let slot = self.kernel.input(n).ok_or_else(|| Error::InvalidTrace(format!("{n} is not available in kernel {}", self.kernel.id)))?;
        let (shape, words) = &frame.inputs[slot];
        // right aligned broadcast, extent one axes stay at zero
        let lead = point.len().saturating_sub(shape.len());
        let coords = shape.iter().enumerate().map(|(j, &e)| if e == 1 { 0 } else { point[lead + j] as usize });
        Ok(Scalar::from_bits(node.dtype, words[row_major(shape, coords)]))
    }

    // flat offset of an indexed access into a buffer of `shape`
    fn offset(&self, index: &Index, boundary: Boundary, shape: &[usize], point: &[i64], env: &HashMap<NodeId, Scalar>, frame: &Frame) -> Result<usize> {
        let mut offset = 0;
        for (axis, (a, &extent)) in index.iter().zip(shape).enumerate() {
            let raw = match a {
                Access::Idx(i) => i.eval(point),
                Access::Value(v) => as_index(self.value(*v, point, env, frame)?),
            };
            offset = offset * extent + boundary.apply(axis, raw, extent)?;
        }
        Ok(offset)
    }

    fn member(&self, n: NodeId, point: &[i64], env: &mut HashMap<NodeId, Scalar>, frame: &mut Frame) -> Result<()> {
        let node = self.graph.node(n);
        let value = match &node.op {
            Op::Reduce { op, x, axis } => {
                let x_node = self.graph.node(*x);
                let extent = x_node.shape.dim(*axis);
                let len = self.graph.symbols().canon(extent).eval(&|s| frame.dims.get(s).copied()).unwrap_or(0);
                let mut acc = eval::reduce_init(*op, node.dtype);
                let mut inner = point.to_vec();
                inner.insert(*axis, 0);
                for r in 0..len {
                    inner[*axis] = r as i64;
                    if let Some(scope) = self.kernel.inner(n) {
                        for &m in &scope.body { self.member(m, &inner, env, frame)? }
                    }
                    acc = eval::reduce_step(*op, acc, self.value(*x, &inner, env, frame)?);
                }
                acc
            }
            Op::Store { value, index, boundary, .. } | Op::Scatter { value, index, boundary, .. } => {
                let o = self.kernel.dest(n).ok_or_else(|| Error::InvalidTrace(format!("{n} writes no buffer of kernel {}", self.kernel.id)))?;
                let offset = self.offset(index, *boundary, &frame.outputs[o].0, point, env, frame)?;
                let x = self.value(*value, point, env, frame)?;
                let words = &mut frame.outputs[o].1;
                words[offset] = match node.op {
                    Op::Scatter { op, .. } => eval::scatter_step(op, Scalar::from_bits(node.dtype, words[offset]), x).to_bits(),
                    _ => x.to_bits(),
                };
                return Ok(());
            }
            Op::Const { value } => *value,
            Op::IndexValue { expr } => Scalar::I32(expr.eval(point) as i32),
            Op::Unary { op, x } => eval::unary(*op, self.value(*x, point, env, frame)?),
            Op::Binary { op, lhs, rhs } => {
                eval::binary(*op, self.value(*lhs, point, env, frame)?, self.value(*rhs, point, env, frame)?)
            }
            Op::Ternary { op, a, b, c } => eval::ternary(
                *op,
                self.value(*a, point, env, frame)?,
                self.value(*b, point, env, frame)?,
                self.value(*c, point, env, frame)?,
            ),
            Op::Cast { x } => self.value(*x, point, env, frame)?.cast(node.dtype),
            Op::Load { src, index, boundary } => {
                let slot = self.kernel.input(*src).ok_or_else(|| Error::InvalidTrace(format!("load source {src} is not an input of kernel {}", self.kernel.id)))?;
                let offset = self.offset(index, *boundary, &frame.inputs[slot].0, point, env, frame)?;
                Scalar::from_bits(node.dtype, frame.inputs[slot].1[offset])
            }
            op => return invalid(format!("{} cannot be evaluated inside a kernel", op.name())),
        };
        env.insert(n, value);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use frost_pool::Storage;
    use std::sync::RwLock;
    use DType::*;

    fn storage(words: Vec<u32>) -> Storage { Arc::new(RwLock::new(words)) }
    fn floats(s: &Storage) -> Vec<f32> { s.read().unwrap().iter().map(|&w| f32::from_bits(w)).collect() }

    fn build(f: impl for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>) -> (Program, Vec<Arc<dyn Dispatch>>) {
        let p = Program::plan(&Graph::trace(Boundary::Clamp, f).unwrap(), FusionMode::Max).unwrap();
        let built = p.kernels().iter().map(|k| {
            let unit = KernelUnit { target: Target::C, entry: String::new(), source: String::new(), graph: p.graph.clone(), kernel: k.clone() };
            Interpreter.build(&unit, "").unwrap()
        }).collect();
        (p, built)
    }

    #[test]
    fn stencil_reads_clamp_at_the_edge() {
        let (p, k) = build(|t| {
            let u = t.input(&[4], F32)?;
            let i = u.indices();
            Ok(vec![u.at([&i[0] - 1])? + u.at([&i[0] + 1])?])
        });
        assert_eq!(k.len(), 1);
        let u = storage([1.0f32, 2.0, 3.0, 4.0].iter().map(|x| x.to_bits()).collect());
        let out = storage(vec![0; 4]);
        k[0].dispatch(&Launch { dims: &[], buffers: &[u, out.clone()] }).unwrap();
        assert_eq!(floats(&out), vec![3.0, 4.0, 6.0, 7.0]);
        assert_eq!(p.kernels()[0].inputs.len(), 1);
    }

    #[test]
    fn broadcast_operands_repeat_along_missing_axes() {
        let (_, k) = build(|t| {
            let a = t.input(&[2, 3], F32)?;
            let b = t.input(&[3], F32)?;
            Ok(vec![&a * &b])
        });
        let a = storage((0..6).map(|x| (x as f32).to_bits()).collect());
        let b = storage([1.0f32, 10.0, 100.0].iter().map(|x| x.to_bits()).collect());
        let out = storage(vec![0; 6]);
        k[0].dispatch(&Launch { dims: &[], buffers: &[a, b, out.clone()] }).unwrap();
        assert_eq!(floats(&out), vec![0.0, 10.0, 200.0, 3.0, 40.0, 500.0]);
    }

    #[test]
    fn error_boundary_fails_the_launch() {
        let (_, k) = build(|t| {
            let u = t.input(&[3], I32)?;
            let i = u.indices();
            Ok(vec![u.at_with([&i[0] + 1], Boundary::Error)?])
        });
        let out = storage(vec![0; 3]);
        let r = k[0].dispatch(&Launch { dims: &[], buffers: &[storage(vec![5, 6, 7]), out] });
        assert_eq!(r, Err(Error::IndexOutOfDomain { axis: 0, index: 3, extent: 3 }));
    }

    #[test]
    fn dynamic_extents_come_from_the_launch() {
        let (_, k) = build(|t| {
            let x = t.input(&[-1, 2], I32)?;
            Ok(vec![x.sum(0)?])
        });
        let out = storage(vec![0; 2]);
        let x = storage(vec![1, 2, 3, 4, 5, 6]);
        k[0].dispatch(&Launch { dims: &[3], buffers: &[x, out.clone()] }).unwrap();
        assert_eq!(*out.read().unwrap(), vec![9, 12]);
    }
}
