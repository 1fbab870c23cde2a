//! Compiling kernels through a toolchain and running planned programs.

mod interp;
mod resolve;
mod runner;

use std::fmt;
use std::sync::Arc;

use frost_pool::Storage;

use crate::codegen::{self, Target};
use crate::error::*;
use crate::ker::*;
use crate::memory::*;
use crate::pre::*;

pub use interp::Interpreter;
pub use resolve::Dims;

/// Everything a toolchain gets to build one kernel.
#[derive(Debug, Clone)]
pub struct KernelUnit {
    pub target: Target,
    pub entry: String,
    pub source: String,
    pub graph: Arc<Graph>,
    pub kernel: Kernel,
}

/// Arguments of one kernel launch: symbol extents and the kernel's buffers,
/// inputs first, then outputs.
pub struct Launch<'a> {
    pub dims: &'a [usize],
    pub buffers: &'a [Storage],
}

/// A built kernel.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, launch: &Launch) -> Result<()>;
}

/// Backend compiler turning generated source into dispatchable kernels.
/// A rejected unit is reported as a message; it becomes a cached compile failure.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, unit: &KernelUnit, flags: &str) -> Result<Arc<dyn Dispatch>, String>;
}

/// A program with one built kernel per planned kernel.
pub struct CompiledProgram {
    program: Program,
    target: Target,
    flags: String,
    units: Vec<KernelUnit>,
    kernels: Vec<Arc<dyn Dispatch>>,
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("signature", &self.program.signature())
            .field("target", &self.target)
            .field("flags", &self.flags)
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl CompiledProgram {
    /// Generate and build every kernel. The first rejected unit fails the whole program.
    pub fn build(program: &Program, target: Target, flags: &str, toolchain: &dyn Toolchain) -> Result<CompiledProgram> {
        let mut units = Vec::with_capacity(program.kernels().len());
        let mut kernels = Vec::with_capacity(program.kernels().len());
        for kernel in program.kernels() {
            let unit = KernelUnit {
                target,
                entry: codegen::entry_name(kernel),
                source: codegen::render(program.graph(), kernel, target)?,
                graph: program.graph.clone(),
                kernel: kernel.clone(),
            };
            log::info!("{}: building {} ({} bytes of {target})", toolchain.name(), unit.entry, unit.source.len());
            let built = toolchain.build(&unit, flags).map_err(|message| Error::BackendCompileFailure {
                target: target.name().to_string(), message, source_text: unit.source.clone(),
            })?;
            units.push(unit);
            kernels.push(built);
        }
        Ok(CompiledProgram { program: program.clone(), target, flags: flags.to_string(), units, kernels })
    }

    pub fn program(&self) -> &Program { &self.program }
    pub fn target(&self) -> Target { self.target }
    pub fn flags(&self) -> &str { &self.flags }
    pub fn units(&self) -> &[KernelUnit] { &self.units }

    /// Generated source of every kernel, in kernel order.
    pub fn source(&self) -> String {
        self.units.iter().map(|u| u.source.as_str()).collect::<Vec<_>>().join("\n")
    }

    /// Run with the given input buffers, returning one new reference per output.
    /// On failure no output survives and the inputs are left as they were.
    pub fn run(&self, memory: &MemoryManager, inputs: &[Memory]) -> Result<Vec<Memory>> {
        runner::Runner::new(self, memory, inputs)?.run(inputs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use DType::*;

    struct Rejecting;

    impl Toolchain for Rejecting {
        fn name(&self) -> &str { "rejecting" }
        fn build(&self, _unit: &KernelUnit, flags: &str) -> Result<Arc<dyn Dispatch>, String> {
            Err(format!("unknown flag {flags}"))
        }
    }

    struct Counting(AtomicUsize);

    impl Toolchain for Counting {
        fn name(&self) -> &str { "counting" }
        fn build(&self, unit: &KernelUnit, flags: &str) -> Result<Arc<dyn Dispatch>, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Interpreter.build(unit, flags)
        }
    }

    fn program() -> Program {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let x = t.input(&[3], F32)?;
            Ok(vec![x.exp()?.sum(0)?])
        }).unwrap();
        Program::plan(&g, FusionMode::Max).unwrap()
    }

    #[test]
    fn rejected_units_carry_their_source() {
        let err = CompiledProgram::build(&program(), Target::C, "-Ofast", &Rejecting).unwrap_err();
        let Error::BackendCompileFailure { target, message, source_text } = err else { panic!("expected a compile failure") };
        assert_eq!(target, "c");
        assert_eq!(message, "unknown flag -Ofast");
        assert!(source_text.contains("void kernel_0("));
    }

    #[test]
    fn toolchains_work_through_references() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let compiled = CompiledProgram::build(&program(), Target::Hlsl, "", &counting).unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(compiled.units().len(), 1);
        assert!(compiled.source().contains("[numthreads("));
        let memory = MemoryManager::new();
        let x = memory.from_host(&HostArray::f32(&[3], vec![0.0; 3]).unwrap()).unwrap();
        let out = compiled.run(&memory, &[x]).unwrap();
        assert_eq!(memory.to_host(out[0]).unwrap().as_f32(), Some(&[3.0f32][..]));
    }
}
