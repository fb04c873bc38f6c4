//! Error kinds the engine distinguishes, and how they map to exit codes.
//!
//! Per-target failures (eval, timeout) are captured and reported through the
//! scheduler; everything else aborts the run.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A command or sub-document failed to parse.  Fatal at plan load.
    #[error("parse error: {0}")]
    Parse(String),

    /// Duplicate target/import names.  Fatal at graph build.
    #[error("name collision: {0:?} declared more than once")]
    NameCollision(String),

    /// The plan graph has a cycle of length >= 2.  Fatal at graph build.
    #[error("cyclic plan: {}", .0.join(" -> "))]
    CyclicPlan(Vec<String>),

    /// A command references an identifier that resolves to nothing.
    /// Warning by default; fatal under strict mode.
    #[error("target {target:?} depends on unknown identifier {name:?}")]
    MissingDependency { target: String, name: String },

    /// A target command failed at runtime.  Per-target; obeys keep_going.
    #[error("target {target:?} failed: {message}")]
    Eval { target: String, message: String },

    /// Cache read/write failed.  Fatal.
    #[error("cache error at {path:?}: {message}")]
    Cache { path: PathBuf, message: String },

    /// Dispatch or worker supervision failed.  Retried once, then treated
    /// as an eval failure.
    #[error("backend {backend:?} failed for {target:?}: {message}")]
    Backend {
        backend: String,
        target: String,
        message: String,
    },

    /// A target exceeded its time budget.  Treated as an eval failure.
    #[error("target {target:?} timed out after {seconds}s")]
    TargetTimeout { target: String, seconds: u64 },

    /// User interrupt; the run drains cleanly.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Process exit code for the driver layer.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Eval { .. }
            | EngineError::TargetTimeout { .. }
            | EngineError::Backend { .. } => 1,
            EngineError::Cancelled => 130,
            _ => 2,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
