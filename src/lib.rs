//! # Tool Hub - Tool Execution Engine
//!
//! Runs catalog-registered tools on behalf of callers:
//! - Command-line tools, buffered or streamed, with timeouts and partial output
//! - Per-group FIFO concurrency limits
//! - Install-once dependency verification with testcases
//! - Long-running service tools with a supervised lifecycle
//! - Testcase validation (`exact`, `contains`, `regex`, `prefix`, `suffix`)
//!
//! ## Architecture
//!
//! ```text
//!                   ┌──────────────────────────────────────┐
//!   invoke/test  →  │               ToolHub                │
//!                   │  ┌─────────┐ ┌──────────┐ ┌────────┐ │
//!                   │  │ Catalog │ │ Verifier │ │Governor│ │
//!                   │  └─────────┘ └──────────┘ └────────┘ │
//!                   │  ┌──────────┐ ┌─────────────────────┐│
//!                   │  │ Executor │ │   Service Manager   ││
//!                   │  └──────────┘ └─────────────────────┘│
//!                   └──────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod tools;
pub mod types;

pub mod observability;

pub use engine::{CallContext, Invocation, TestReport, ToolHub};
pub use tools::{MemoryCatalog, ToolRepository};
pub use types::{Config, Error, Result};
