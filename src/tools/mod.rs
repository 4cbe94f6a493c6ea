//! Tool records and the catalog they live in.
//!
//! The engine reads tools, dependencies and concurrency groups through
//! [`ToolRepository`] and only ever writes status/error fields and calling
//! logs back.

pub mod catalog;
pub mod model;
pub mod template;

#[cfg(test)]
pub use catalog::MockToolRepository;
pub use catalog::{CatalogSnapshot, MemoryCatalog, ToolRepository, ToolSpec};
pub use model::{
    CallingLog, CmdToolInput, CmdToolTestcase, CommandLineTool, ConcurrencyGroup, Dependency,
    ServiceTool, TestcaseForDependency, Tool, ToolKind, ToolMeta, ToolStatus,
};
pub use template::Dirs;
