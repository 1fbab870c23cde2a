use frost_pool::PoolError;

/// Failures of tracing, planning, compiling and running a program.
///
/// Trace-time and shape failures abort before any Program exists, run-time failures
/// abort the whole `run` call. Memory faults are programming errors of the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("shape conflict: {0}")]
    ShapeConflict(String),
    #[error("shape unresolvable: {0}")]
    ShapeUnresolvable(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("index {index} out of domain [0, {extent}) on axis {axis}")]
    IndexOutOfDomain { axis: usize, index: i64, extent: usize },
    #[error("double free: {0}")]
    DoubleFree(String),
    #[error("use after release: {0}")]
    UseAfterRelease(String),
    #[error("backend `{target}` rejected generated source: {message}")]
    BackendCompileFailure { target: String, message: String, source_text: String },
    #[error("invalid trace: {0}")]
    InvalidTrace(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::DoubleFree(_) => Error::DoubleFree(err.to_string()),
            PoolError::UseAfterRelease(_) => Error::UseAfterRelease(err.to_string()),
        }
    }
}

// shorthands used by the shape and type checks
pub(crate) fn mismatch<T>(msg: impl Into<String>) -> Result<T> { Err(Error::ShapeMismatch(msg.into())) }
pub(crate) fn type_mismatch<T>(msg: impl Into<String>) -> Result<T> { Err(Error::TypeMismatch(msg.into())) }
pub(crate) fn invalid<T>(msg: impl Into<String>) -> Result<T> { Err(Error::InvalidTrace(msg.into())) }
