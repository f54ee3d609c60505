//! Inkwell Engine Library
//!
//! Event coordination and persistence for a multi-agent creative-writing
//! studio. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Atomic JSON file helpers
pub mod persist;

/// In-memory per-project event bus
pub mod event_bus;

/// Append-only audit log
pub mod audit;

/// Persisted project state and storage layout
pub mod state;

/// Model call boundary
pub mod llm;

/// Semantic memory store
pub mod memory;

/// Knowledge graph and canon rules
pub mod graph;

/// Durable task records
pub mod tasks;

/// Chapter and draft files
pub mod outputs;

/// Writing agents
pub mod agents;

/// Pipeline orchestration
pub mod conductor;

/// Per-project resource registry
pub mod registry;

/// Multi-project scheduler
pub mod scheduler;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
