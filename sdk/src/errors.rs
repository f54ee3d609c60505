//! Error types and handling
//!
//! This module provides the error types used throughout the Inkwell engine.
//! All errors implement the `StudioErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! Model failures have their own enum, [`ModelError`], because they are the
//! only failures the engine retries automatically. Everything else is
//! surfaced to the caller as an [`EngineError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Trait for Inkwell error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait StudioErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display in the UI and never echoes model output
    /// or file contents.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors require manual intervention (for example repairing a corrupt
    /// state file).
    fn is_recoverable(&self) -> bool;
}

/// Failure at the model call boundary (chat completion or embedding).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model call timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Malformed model response: {0}")]
    Response(String),

    #[error("Model server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Model connection error: {0}")]
    Connection(String),
}

impl ModelError {
    /// Timeouts and 5xx responses are worth another attempt. A malformed
    /// body or a refused connection will not fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Server { .. })
    }

    /// Short stable tag used in audit payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Response(_) => "response",
            Self::Server { .. } => "server",
            Self::Connection(_) => "connection",
        }
    }
}

impl StudioErrorExt for ModelError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Timeout { .. } => "The model took too long to respond. Try again",
            Self::Response(_) => "The model returned an unexpected response",
            Self::Server { .. } => "The model server reported an error. Check its logs",
            Self::Connection(_) => "Could not reach the model server. Is it running?",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Model**: Generation or embedding failures after retries
/// - **Validation**: Bad pipeline input, rejected before any step runs
/// - **Corrupt state**: A persisted project file could not be parsed
/// - **Pipeline step**: Any other failure inside a single step
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, StudioErrorExt};
/// use std::path::PathBuf;
///
/// let error = EngineError::Validation("idea must not be empty".into());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::CorruptState {
///     path: PathBuf::from("state.json"),
///     reason: "expected value at line 1".into(),
/// };
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Corrupt state file {path:?}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Step {step_index} ({agent}) failed: {message}")]
    PipelineStep {
        step_index: usize,
        agent: String,
        message: String,
    },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Pipeline run not found: {0}")]
    RunNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable error-type tag written into `task_failed` audit payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Model(_) => "model",
            Self::Validation(_) => "validation",
            Self::CorruptState { .. } => "corrupt_state",
            Self::PipelineStep { .. } => "pipeline_step",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::RunNotFound(_) => "run_not_found",
            Self::TaskNotFound(_) => "task_not_found",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl StudioErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Model(inner) => inner.user_hint(),
            Self::Validation(_) => "Fix the pipeline input and start it again",
            Self::CorruptState { .. } => {
                "A project file is damaged. Restore it from a backup or move it aside"
            }
            Self::PipelineStep { .. } => "A pipeline step failed. See the audit log for details",
            Self::InvalidTransition(_) => "That action is not allowed in the run's current state",
            Self::RunNotFound(_) => "No such pipeline run for this project",
            Self::TaskNotFound(_) => "No such task for this project",
            Self::Serialization(_) => "Data could not be encoded or decoded",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CorruptState { .. } | Self::Config(_))
    }
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;
