//! Core types for the tool hub engine.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ToolId, GroupId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the engine and janitor

mod config;
mod errors;
mod ids;

pub use config::{
    Config, EngineConfig, JanitorConfig, ObservabilityConfig, UngroupedPolicy, CONFIG_ENV,
};
pub use errors::{Error, Result};
pub use ids::{CallLogId, DependencyId, GroupId, InvocationId, ToolId};
