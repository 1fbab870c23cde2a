//! The compiler context: active configuration, compile cache and buffer pool.
//!
//! A [`Context`] is created once by the caller and passed to every trace, compile
//! and run. It is `Sync`; the cache and the pool each sit behind one lock, kernel
//! dispatch runs outside both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::codegen::{self, Target};
use crate::error::*;
use crate::exec::*;
use crate::ker::*;
use crate::memory::*;
use crate::pre::*;

/// Settings applied to every later trace and compile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub target: Target,
    /// passed through to the toolchain
    pub flags: String,
    pub boundary: Boundary,
    pub fusion: FusionMode,
}

impl Config {
    /// Defaults overridden by `FROST_TARGET`, `FROST_FLAGS`, `FROST_BOUNDARY` and
    /// `FROST_FUSION`. Unknown values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        let var = |name: &str| std::env::var(name).ok();
        if let Some(v) = var("FROST_TARGET") {
            match Target::parse(&v) {
                Some(t) => config.target = t,
                None => log::warn!("ignoring FROST_TARGET={v}"),
            }
        }
        if let Some(v) = var("FROST_FLAGS") { config.flags = v }
        if let Some(v) = var("FROST_BOUNDARY") {
            match Boundary::parse(&v) {
                Some(b) => config.boundary = b,
                None => log::warn!("ignoring FROST_BOUNDARY={v}"),
            }
        }
        if let Some(v) = var("FROST_FUSION") {
            match FusionMode::parse(&v) {
                Some(f) => config.fusion = f,
                None => log::warn!("ignoring FROST_FUSION={v}"),
            }
        }
        config
    }

    pub fn target(mut self, target: Target) -> Self { self.target = target; self }
    pub fn flags(mut self, flags: impl Into<String>) -> Self { self.flags = flags.into(); self }
    pub fn boundary(mut self, boundary: Boundary) -> Self { self.boundary = boundary; self }
    pub fn fusion(mut self, fusion: FusionMode) -> Self { self.fusion = fusion; self }
}

#[derive(Clone)]
enum Entry {
    Ready(Arc<CompiledProgram>),
    // rejected units stay rejected for the same signature
    Failed(Error),
}

impl Entry {
    fn into_result(self) -> Result<Arc<CompiledProgram>> {
        match self { Entry::Ready(c) => Ok(c), Entry::Failed(e) => Err(e) }
    }
}

type Key = (String, Target, String);

pub struct Context {
    config: RwLock<Config>,
    memory: MemoryManager,
    cache: Mutex<HashMap<Key, Entry>>,
    toolchain: Box<dyn Toolchain>,
}

impl Default for Context {
    fn default() -> Self { Context::new(Config::default()) }
}

impl Context {
    /// A context building kernels with the [`Interpreter`].
    pub fn new(config: Config) -> Self { Context::with_toolchain(config, Interpreter) }

    pub fn with_toolchain(config: Config, toolchain: impl Toolchain + 'static) -> Self {
        Context {
            config: RwLock::new(config),
            memory: MemoryManager::new(),
            cache: Mutex::new(HashMap::new()),
            toolchain: Box::new(toolchain),
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Choose the backend and toolchain flags for all later compiles.
    pub fn set_target(&self, target: Target, flags: &str) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.target = target;
        config.flags = flags.to_string();
        log::info!("target set to {target} with flags {flags:?}");
    }

    pub fn set_boundary(&self, boundary: Boundary) {
        self.config.write().unwrap_or_else(PoisonError::into_inner).boundary = boundary;
    }

    pub fn set_fusion(&self, fusion: FusionMode) {
        self.config.write().unwrap_or_else(PoisonError::into_inner).fusion = fusion;
    }

    pub fn memory(&self) -> &MemoryManager { &self.memory }

    /// Record a graph with the configured boundary policy.
    pub fn trace<F>(&self, f: F) -> Result<Graph>
        where F: for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>
    {
        Graph::trace(self.config().boundary, f)
    }

    /// Trace and plan a program with the configured fusion mode.
    pub fn program<F>(&self, f: F) -> Result<Program>
        where F: for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>
    {
        Program::plan(&self.trace(f)?, self.config().fusion)
    }

    /// Compile for the active target, reusing the cached result for a structurally
    /// identical program, including a cached failure.
    pub fn compile(&self, program: &Program) -> Result<Arc<CompiledProgram>> {
        let config = self.config();
        let key = (program.signature().to_string(), config.target, config.flags.clone());
        let hit = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned();
        if let Some(entry) = hit {
            log::debug!("compile cache hit for {}", &key.0[..12]);
            return entry.into_result();
        }
        // built without the lock held
        log::info!("compile cache miss for {}, {} kernels for {}", &key.0[..12], program.kernels().len(), config.target);
        let built = match CompiledProgram::build(program, config.target, &config.flags, &*self.toolchain) {
            Ok(c) => Entry::Ready(Arc::new(c)),
            Err(e) => {
                log::warn!("compile failed for {}: {e}", &key.0[..12]);
                Entry::Failed(e)
            }
        };
        // a racing compile of the same key may have finished first; its entry wins
        let entry = self.cache.lock().unwrap_or_else(PoisonError::into_inner).entry(key).or_insert(built).clone();
        entry.into_result()
    }

    /// Number of cached compile results.
    pub fn cached(&self) -> usize { self.cache.lock().unwrap_or_else(PoisonError::into_inner).len() }

    /// Forget every cached compile, failures included.
    pub fn clear_cache(&self) { self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear() }

    pub fn run(&self, compiled: &CompiledProgram, inputs: &[Memory]) -> Result<Vec<Memory>> {
        compiled.run(&self.memory, inputs)
    }

    /// Source text of every kernel of a program for a target, independent of the cache.
    pub fn source(&self, program: &Program, target: Target) -> Result<String> {
        codegen::render_program(program, target)
    }

    pub fn memory_from(&self, array: &HostArray) -> Result<Memory> { self.memory.from_host(array) }
    pub fn to_host(&self, memory: Memory) -> Result<HostArray> { self.memory.to_host(memory) }
    pub fn allocate(&self, shape: &[usize], dtype: DType) -> Memory { self.memory.allocate(shape, dtype) }
    pub fn retain(&self, memory: Memory) -> Result<()> { self.memory.retain(memory) }
    pub fn release(&self, memory: Memory) -> Result<()> { self.memory.release(memory) }

    /// Bytes held by live buffers.
    pub fn used_memory(&self) -> usize { self.memory.used_memory() }
}
