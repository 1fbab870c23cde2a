//! Kernel compiler for traced tensor programs.
//!
//! A program is built by running a closure against a [`Tracer`], which records a
//! [`Graph`]. [`Program::plan`] fuses the graph into [`Kernel`]s and orders them,
//! [`Context::compile`] generates kernel source and builds it through a
//! [`Toolchain`], and [`Context::run`] executes the result against [`Memory`] buffers.
//!
//! ```ignore
//! let ctx = Context::default();
//! let program = ctx.program(|t| {
//!     let a = t.input(&[-1, 4], DType::F32)?;
//!     let b = t.input(&[-1, 4], DType::F32)?;
//!     Ok(vec![a + b])
//! })?;
//! let compiled = ctx.compile(&program)?;
//! let out = ctx.run(&compiled, &[x, y])?;
//! ```

mod error;
pub use error::{Error, Result};

pub mod pre;
pub use pre::*;

pub mod ker;
pub use ker::{Block, FusionMode, Init, Inner, Kernel, LoopStep, Output, Program, Step};

pub mod codegen;
pub use codegen::Target;

pub mod memory;
pub use memory::{HostArray, HostData, Layout, Memory, MemoryManager};

pub mod exec;
pub use exec::{CompiledProgram, Dispatch, Interpreter, KernelUnit, Launch, Toolchain};

pub mod context;
pub use context::{Config, Context};
