//! Unified error handling for recpipe
//!
//! Every fallible operation in the crate returns [`PipelineResult`]. Errors are
//! grouped into categories so callers can tell a misconfigured pipeline apart
//! from a broken call protocol or a failing collective:
//! - User errors (invalid or unsupported configuration)
//! - Internal errors (choreography and context-invariant violations)
//! - Backend errors (stream and communication failures)
//! - Model errors (graph, value and module lookup failures)
//! - Recoverable errors (best-effort passes such as compilation)

use std::fmt;

pub use thiserror;

/// Unified error type for recpipe
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // ========== Protocol Errors ==========
    /// A phase was invoked out of order, e.g. a pipelined forward ran before
    /// the distribution for that batch was started.
    #[error("Pipeline choreography violated: {0}")]
    ChoreographyViolation(String),

    /// Debug-mode context invariant check failed
    #[error("Context {index} invariant violated: {map} expected {expected}, found {actual}")]
    ContextInvariantViolated {
        index: i64,
        map: &'static str,
        expected: String,
        actual: String,
    },

    // ========== Configuration Errors ==========
    /// Combination of options the pipeline cannot run with
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Malformed configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Compilation Errors ==========
    /// Ahead-of-time compilation of a module failed
    #[error("Compilation of '{module}' failed: {reason}")]
    CompilationFailed { module: String, reason: String },

    // ========== Backend Errors ==========
    /// Collective communication failed
    #[error("Communication failed: {0}")]
    CommunicationFailed(String),

    /// Stream ordering or recording failed
    #[error("Stream error: {0}")]
    StreamError(String),

    // ========== Model / Graph Errors ==========
    /// No module registered under the given qualified name
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Value had a different kind than the operation expected
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    /// Attribute lookup failed on a value
    #[error("Missing attribute '{attr}' on {on}")]
    MissingAttribute { attr: String, on: String },

    /// Dictionary key lookup failed
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Positional lookup out of range
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    /// Malformed graph or failed interpretation
    #[error("Graph error: {0}")]
    GraphError(String),

    // ========== I/O Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialisation error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========== Internal Errors ==========
    /// Lock poisoned
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::UnsupportedConfiguration(_) | PipelineError::InvalidConfiguration(_) => {
                ErrorCategory::User
            }

            PipelineError::CompilationFailed { .. } => ErrorCategory::Recoverable,

            PipelineError::ChoreographyViolation(_)
            | PipelineError::ContextInvariantViolated { .. }
            | PipelineError::LockPoisoned(_)
            | PipelineError::Internal(_) => ErrorCategory::Internal,

            PipelineError::CommunicationFailed(_) | PipelineError::StreamError(_) => {
                ErrorCategory::Backend
            }

            PipelineError::ModuleNotFound(_)
            | PipelineError::TypeMismatch { .. }
            | PipelineError::MissingAttribute { .. }
            | PipelineError::KeyNotFound(_)
            | PipelineError::IndexOutOfRange { .. }
            | PipelineError::GraphError(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_) => ErrorCategory::Model,
        }
    }

    /// Recoverable errors leave the pipeline usable; the caller may fall back
    /// to an uncompiled or unpipelined path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Internal errors are fatal to the current training step.
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: fix the configuration
/// - Recoverable: continue on a slower path
/// - Internal: protocol bug in the caller or the pipeline
/// - Backend: stream or collective failure
/// - Model: the model or batch does not have the expected structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    Recoverable,
    Internal,
    Backend,
    Model,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Model => write!(f, "Model"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PipelineError::LockPoisoned(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

// ========== Helper Macros ==========

/// Create a choreography violation with context
///
/// # Examples
/// ```ignore
/// return Err(choreography_violation!("no request for module {}", name));
/// ```
#[macro_export]
macro_rules! choreography_violation {
    ($msg:expr) => {
        $crate::error::PipelineError::ChoreographyViolation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::PipelineError::ChoreographyViolation(format!($fmt, $($arg)*))
    };
}

/// Create an unsupported-configuration error with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::PipelineError::UnsupportedConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::PipelineError::UnsupportedConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create a graph error with context
#[macro_export]
macro_rules! graph_error {
    ($msg:expr) => {
        $crate::error::PipelineError::GraphError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::PipelineError::GraphError(format!($fmt, $($arg)*))
    };
}

// ========== Helper Functions ==========

pub fn internal_err(msg: &str) -> PipelineError {
    PipelineError::Internal(msg.to_string())
}

pub fn type_mismatch(expected: &str, got: &str) -> PipelineError {
    PipelineError::TypeMismatch {
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

/// Wrap an IO error with the path or action that produced it
pub fn io_context(err: std::io::Error, msg: &str) -> PipelineError {
    PipelineError::Io(std::io::Error::new(err.kind(), format!("{}: {}", msg, err)))
}
