use std::collections::HashMap;
use std::sync::PoisonError;

use super::*;

// buffers bound in one block, each entry owning one reference
struct Frame<'p> {
    values: HashMap<NodeId, Memory>,
    parent: Option<&'p Frame<'p>>,
}

impl<'p> Frame<'p> {
    fn root() -> Self { Frame { values: HashMap::new(), parent: None } }
    fn child(parent: &'p Frame<'p>) -> Self { Frame { values: HashMap::new(), parent: Some(parent) } }
    fn get(&self, n: NodeId) -> Result<Memory> {
        match (self.values.get(&n), self.parent) {
            (Some(m), _) => Ok(*m),
            (None, Some(p)) => p.get(n),
            (None, None) => invalid(format!("{n} has no buffer at this point of the program")),
        }
    }
}

pub(crate) struct Runner<'a> {
    compiled: &'a CompiledProgram,
    memory: &'a MemoryManager,
    dims: Dims,
    flat: Vec<usize>,
}

impl<'a> Runner<'a> {
    /// Check the inputs against the program and bind its dimensions.
    pub(crate) fn new(compiled: &'a CompiledProgram, memory: &'a MemoryManager, inputs: &[Memory]) -> Result<Self> {
        let layouts = inputs.iter().map(|&m| memory.layout(m)).collect::<Result<Vec<_>>>()?;
        let dims = Dims::resolve(compiled.program.graph(), &layouts)?;
        let flat = dims.flat();
        Ok(Runner { compiled, memory, dims, flat })
    }

    fn graph(&self) -> &'a Graph { self.compiled.program.graph() }

    pub(crate) fn run(&self, inputs: &[Memory]) -> Result<Vec<Memory>> {
        let mut frame = Frame::root();
        let result = self.bind_inputs(&mut frame, inputs)
            .and_then(|_| self.block(&self.compiled.program.main, &mut frame))
            .and_then(|_| self.collect(&frame));
        self.release_frame(frame)?;
        result
    }

    fn bind_inputs(&self, frame: &mut Frame, inputs: &[Memory]) -> Result<()> {
        for (&node, &m) in self.graph().inputs().iter().zip(inputs) {
            self.memory.retain(m)?;
            if let Some(old) = frame.values.insert(node, m) { self.memory.release(old)? }
        }
        Ok(())
    }

    // one new reference per output; none survive a failure
    fn collect(&self, frame: &Frame) -> Result<Vec<Memory>> {
        let mut outputs = vec![];
        for &n in self.graph().outputs() {
            let kept = frame.get(n).and_then(|m| self.memory.retain(m).map(|_| m));
            match kept {
                Ok(m) => outputs.push(m),
                Err(err) => {
                    self.release_all(outputs)?;
                    return Err(err);
                }
            }
        }
        Ok(outputs)
    }

    fn release_all(&self, memories: impl IntoIterator<Item = Memory>) -> Result<()> {
        memories.into_iter().try_for_each(|m| self.memory.release(m))
    }

    fn release_frame(&self, frame: Frame) -> Result<()> {
        self.release_all(frame.values.into_values())
    }

    fn block(&self, block: &Block, frame: &mut Frame) -> Result<()> {
        for (step, frees) in block.steps.iter().zip(&block.frees) {
            match step {
                Step::Kernel(k) => self.kernel(*k, frame)?,
                Step::Loop(l) => self.repeat(l, frame)?,
            }
            for n in frees {
                if let Some(m) = frame.values.remove(n) { self.memory.release(m)? }
            }
        }
        Ok(())
    }

    fn kernel(&self, k: usize, frame: &mut Frame) -> Result<()> {
        let kernel = &self.compiled.program.kernels[k];
        let graph = self.graph();
        let symbols = graph.symbols();
        let mut buffers = Vec::with_capacity(kernel.inputs.len() + kernel.outputs.len());
        for &n in &kernel.inputs { buffers.push(self.memory.storage(frame.get(n)?)?) }

        let mut outputs = Vec::with_capacity(kernel.outputs.len());
        let filled = (|| -> Result<()> {
            for out in &kernel.outputs {
                let node = graph.node(out.node);
                let m = self.memory.allocate(&self.dims.shape(symbols, &node.shape)?, node.dtype);
                outputs.push(m);
                let storage = self.memory.storage(m)?;
                match out.init {
                    Some(Init::Fill(value)) => {
                        let bits = value.cast(node.dtype).to_bits();
                        storage.write().unwrap_or_else(PoisonError::into_inner).iter_mut().for_each(|w| *w = bits);
                    }
                    Some(Init::Copy(src)) => {
                        let src = self.memory.storage(frame.get(src)?)?;
                        let words = src.read().unwrap_or_else(PoisonError::into_inner).clone();
                        storage.write().unwrap_or_else(PoisonError::into_inner).copy_from_slice(&words);
                    }
                    None => {},
                }
                buffers.push(storage);
            }
            log::trace!("dispatch kernel {k} over {}", kernel.domain);
            self.compiled.kernels[k].dispatch(&Launch { dims: &self.flat, buffers: &buffers })
        })();
        // drop our handles on the storage before any release can recycle it
        drop(buffers);
        if let Err(err) = filled {
            self.release_all(outputs)?;
            return Err(err);
        }
        for (out, m) in kernel.outputs.iter().zip(outputs) {
            if let Some(old) = frame.values.insert(out.node, m) { self.memory.release(old)? }
        }
        Ok(())
    }

    fn trip_count(&self, end: Extent, frame: &Frame) -> Result<usize> {
        match end {
            Extent::Fixed(n) => Ok(n),
            Extent::Node(n) => {
                let storage = self.memory.storage(frame.get(n)?)?;
                let words = storage.read().unwrap_or_else(PoisonError::into_inner);
                Ok(words.first().map_or(0, |&w| (w as i32).max(0) as usize))
            }
        }
    }

    fn repeat(&self, step: &LoopStep, frame: &mut Frame) -> Result<()> {
        let region = self.graph().region(step.region);
        let trips = self.trip_count(region.end, frame)?;
        let mut carried = vec![];
        for c in &region.carries {
            let m = frame.get(c.init)?;
            self.memory.retain(m)?;
            carried.push(m);
        }
        for it in 0..trips {
            let mut body = Frame::child(frame);
            let counter = self.memory.allocate(&[], DType::I32);
            let started = (|| -> Result<()> {
                self.memory.storage(counter)?.write().unwrap_or_else(PoisonError::into_inner)[0] = it as u32;
                Ok(())
            })();
            body.values.insert(region.counter, counter);
            let ran = started.and_then(|_| {
                for (c, &m) in region.carries.iter().zip(&carried) {
                    self.memory.retain(m)?;
                    body.values.insert(c.param, m);
                }
                self.block(&step.body, &mut body)?;
                // every lookup before any retain, so a missing value leaks nothing
                let next = region.carries.iter().map(|c| body.get(c.next)).collect::<Result<Vec<_>>>()?;
                for &m in &next { self.memory.retain(m)? }
                Ok(next)
            });
            self.release_frame(body)?;
            // the previous carried values are dropped once the next ones are final
            self.release_all(std::mem::take(&mut carried))?;
            carried = ran?;
        }
        for (c, m) in region.carries.iter().zip(carried) {
            if let Some(old) = frame.values.insert(c.result, m) { self.memory.release(old)? }
        }
        Ok(())
    }
}
