use crate::error::*;
use crate::memory::Layout;
use crate::pre::*;

/// Concrete value of every dimension symbol for one run, indexed by symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dims {
    values: Vec<Option<usize>>,
}

impl Dims {
    /// Bind the dynamic dimensions of a graph from the layouts of its input buffers.
    /// Every shape of the graph is evaluated here, so a bad call fails before any dispatch.
    pub fn resolve(graph: &Graph, layouts: &[Layout]) -> Result<Dims> {
        let symbols = graph.symbols();
        if layouts.len() != graph.inputs().len() {
            return mismatch(format!("program takes {} inputs, got {}", graph.inputs().len(), layouts.len()));
        }
        let mut class: Vec<Option<usize>> = vec![None; symbols.len()];
        // the input a class was first bound by, for diagnostics
        let mut origin = vec![0; symbols.len()];
        for (slot, (&input, layout)) in graph.inputs().iter().zip(layouts).enumerate() {
            let node = graph.node(input);
            if node.dtype != layout.dtype {
                return type_mismatch(format!("input #{slot} expects {}, got {}", node.dtype, layout.dtype));
            }
            if node.shape.rank() != layout.shape.len() {
                return mismatch(format!("input #{slot} expects shape {}, got {:?}", node.shape, layout.shape));
            }
            for (axis, (dim, &n)) in node.shape.dims().iter().zip(&layout.shape).enumerate() {
                match symbols.canon(dim) {
                    Dim::Fix(m) if m != n => {
                        return mismatch(format!("input #{slot} axis {axis} expects {m}, got {n}"));
                    }
                    Dim::Var(s) => match class[s] {
                        Some(m) if m != n => return Err(Error::ShapeConflict(format!(
                            "dimension s{s} is {m} in input #{} but {n} in input #{slot}", origin[s]))),
                        Some(_) => {},
                        None => { class[s] = Some(n); origin[s] = slot }
                    },
                    _ => {},
                }
            }
        }
        let values = (0..symbols.len()).map(|s| symbols.pinned(s).or(class[symbols.find(s)])).collect();
        let dims = Dims { values };
        // derived input dimensions can only be checked once every symbol is known
        for (slot, (&input, layout)) in graph.inputs().iter().zip(layouts).enumerate() {
            let shape = dims.shape(symbols, &graph.node(input).shape)?;
            if shape != layout.shape {
                return mismatch(format!("input #{slot} expects {shape:?}, got {:?}", layout.shape));
            }
        }
        for (_, node) in graph.nodes() {
            dims.shape(symbols, &node.shape)?;
            dims.shape(symbols, node.domain())?;
        }
        Ok(dims)
    }

    pub fn extent(&self, symbols: &Symbols, dim: &Dim) -> Result<usize> {
        let dim = symbols.canon(dim);
        dim.eval(&|s| self.values.get(s).copied().flatten()).ok_or_else(|| {
            let mut vars = vec![];
            dim.vars(&mut vars);
            match vars.iter().find(|&&s| self.values[s].is_none()) {
                Some(s) => Error::ShapeUnresolvable(format!("dimension s{s} is not bound by any input")),
                None => Error::ShapeMismatch(format!("dimension {dim} has no valid extent")),
            }
        })
    }

    pub fn shape(&self, symbols: &Symbols, shape: &Shape) -> Result<Vec<usize>> {
        shape.dims().iter().map(|d| self.extent(symbols, d)).collect()
    }

    /// Flat values for kernels, unknown symbols read as zero.
    pub fn flat(&self) -> Vec<usize> {
        self.values.iter().map(|v| v.unwrap_or(0)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    fn layout(shape: &[usize], dtype: DType) -> Layout { Layout { shape: shape.to_vec(), dtype } }

    fn graph() -> Graph {
        Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[-1, 4], F32)?;
            let b = t.input(&[-1], F32)?;
            let n = a.shape().dim(0).clone();
            let b2 = t.input_shaped(Shape::new([n]), F32)?;
            Ok(vec![a.sum(-1)? + b2, b])
        }).unwrap()
    }

    #[test]
    fn dynamic_dims_bind_from_inputs() {
        let g = graph();
        let dims = Dims::resolve(&g, &[layout(&[3, 4], F32), layout(&[7], F32), layout(&[3], F32)]).unwrap();
        assert_eq!(dims.flat(), vec![3, 7]);
        assert_eq!(dims.extent(g.symbols(), &(Dim::Var(0) * 2)).unwrap(), 6);
    }

    #[test]
    fn inconsistent_sizes_conflict() {
        let g = graph();
        let r = Dims::resolve(&g, &[layout(&[3, 4], F32), layout(&[7], F32), layout(&[5], F32)]);
        assert!(matches!(r, Err(Error::ShapeConflict(_))), "{r:?}");
    }

    #[test]
    fn fixed_dims_and_types_are_checked() {
        let g = graph();
        let r = Dims::resolve(&g, &[layout(&[3, 5], F32), layout(&[7], F32), layout(&[3], F32)]);
        assert!(matches!(r, Err(Error::ShapeMismatch(_))));
        let r = Dims::resolve(&g, &[layout(&[3, 4], I32), layout(&[7], F32), layout(&[3], F32)]);
        assert!(matches!(r, Err(Error::TypeMismatch(_))));
        let r = Dims::resolve(&g, &[layout(&[3, 4], F32)]);
        assert!(matches!(r, Err(Error::ShapeMismatch(_))));
    }
}
