//! Inkwell SDK
//!
//! Shared library providing error types and wire types for Inkwell components.
//! This crate is used by the engine and by any front-end talking to it.

/// Error types and handling
pub mod errors;

/// Bus addressing and feedback types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, EngineResult, ModelError, StudioErrorExt};
pub use types::{FeedbackPriority, Recipient};
