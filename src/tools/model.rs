//! Catalog records: tools, dependencies, testcases, concurrency groups.
//!
//! Tools are a closed two-variant union; dependencies are shared between tools
//! through `Arc` and outlive any single tool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::validator::MatchType;
use crate::types::{CallLogId, DependencyId, GroupId, ToolId};

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status written back to the catalog by the engine.
///
/// Command-line tools move between `Active`, `Ready` and `Error`; service
/// tools use the remaining variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Registered, not yet certified by its testcases.
    #[default]
    Active,
    /// Testcases passed.
    Ready,
    /// Last verification failed.
    Error,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ToolStatus {
    /// Statuses that cannot coexist with a non-empty error string.
    pub fn is_healthy(self) -> bool {
        matches!(self, ToolStatus::Ready | ToolStatus::Running)
    }
}

// =============================================================================
// Tool records
// =============================================================================

/// Fields shared by every tool variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMeta {
    #[serde(default)]
    pub id: ToolId,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the invocation arguments. Opaque to the engine.
    #[serde(default)]
    pub parameters: Value,
    /// How long calling logs for this tool are kept; zero keeps them forever.
    #[serde(default, with = "humantime_serde")]
    pub log_retention: Duration,
}

impl ToolMeta {
    pub fn named(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ToolId::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            description: String::new(),
            parameters: Value::Null,
            log_retention: Duration::ZERO,
        }
    }
}

/// A one-shot command run once per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLineTool {
    #[serde(flatten)]
    pub meta: ToolMeta,
    #[serde(default)]
    pub working_dir: String,
    /// Argument template, e.g. `["node", "dist/index.js", "--model", "$model"]`.
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub dependencies: Vec<Arc<Dependency>>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default)]
    pub testcases: Vec<CmdToolTestcase>,
    #[serde(default)]
    pub concurrency_group_id: Option<GroupId>,
}

impl CommandLineTool {
    pub fn new(name: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            meta: ToolMeta::named(name),
            working_dir: String::new(),
            cmd,
            env: HashMap::new(),
            timeout: None,
            is_stream: false,
            dependencies: Vec::new(),
            error: String::new(),
            status: ToolStatus::Active,
            testcases: Vec::new(),
            concurrency_group_id: None,
        }
    }
}

/// A long-running process with its own start/stop lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTool {
    #[serde(flatten)]
    pub meta: ToolMeta,
    pub start_cmd: String,
    #[serde(default)]
    pub error: String,
    #[serde(default = "stopped")]
    pub status: ToolStatus,
    #[serde(default)]
    pub concurrency_group_id: Option<GroupId>,
}

fn stopped() -> ToolStatus {
    ToolStatus::Stopped
}

impl ServiceTool {
    pub fn new(name: impl Into<String>, start_cmd: impl Into<String>) -> Self {
        Self {
            meta: ToolMeta::named(name),
            start_cmd: start_cmd.into(),
            error: String::new(),
            status: ToolStatus::Stopped,
            concurrency_group_id: None,
        }
    }
}

/// Type discriminator of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CommandLine,
    Service,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::CommandLine => "command_line",
            ToolKind::Service => "service",
        }
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
    CommandLine(CommandLineTool),
    Service(ServiceTool),
}

impl Tool {
    pub fn meta(&self) -> &ToolMeta {
        match self {
            Tool::CommandLine(t) => &t.meta,
            Tool::Service(t) => &t.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ToolMeta {
        match self {
            Tool::CommandLine(t) => &mut t.meta,
            Tool::Service(t) => &mut t.meta,
        }
    }

    pub fn id(&self) -> ToolId {
        self.meta().id
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            Tool::CommandLine(_) => ToolKind::CommandLine,
            Tool::Service(_) => ToolKind::Service,
        }
    }

    pub fn status(&self) -> ToolStatus {
        match self {
            Tool::CommandLine(t) => t.status,
            Tool::Service(t) => t.status,
        }
    }

    pub fn error(&self) -> &str {
        match self {
            Tool::CommandLine(t) => &t.error,
            Tool::Service(t) => &t.error,
        }
    }

    pub fn concurrency_group_id(&self) -> Option<GroupId> {
        match self {
            Tool::CommandLine(t) => t.concurrency_group_id,
            Tool::Service(t) => t.concurrency_group_id,
        }
    }

    pub(crate) fn set_status(&mut self, status: ToolStatus, error: String) {
        match self {
            Tool::CommandLine(t) => {
                t.status = status;
                t.error = error;
            }
            Tool::Service(t) => {
                t.status = status;
                t.error = error;
            }
        }
    }
}

// =============================================================================
// Invocation input and testcases
// =============================================================================

/// Invocation-time input for a command-line tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmdToolInput {
    /// Values for `$name` placeholders in the argument template.
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default)]
    pub stdin: String,
    /// Overrides for the tool's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Name of the calling tool, if the caller is itself a catalog tool.
    #[serde(default)]
    pub caller: Option<String>,
}

impl CmdToolInput {
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Self-certification case for a command-line tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdToolTestcase {
    #[serde(default)]
    pub input: CmdToolInput,
    pub expect: String,
    pub match_type: MatchType,
}

/// Certification case for a dependency: a literal command and its expected output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseForDependency {
    pub cmd: Vec<String>,
    pub expect: String,
    pub match_type: MatchType,
}

// =============================================================================
// Dependencies and groups
// =============================================================================

/// An installable precondition shared across tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default)]
    pub id: DependencyId,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub url: String,
    /// Shell command, e.g. `brew install python`.
    pub install_cmd: String,
    #[serde(default)]
    pub testcases: Vec<TestcaseForDependency>,
}

impl Dependency {
    pub fn new(name: impl Into<String>, install_cmd: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DependencyId::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            description: String::new(),
            doc: String::new(),
            url: String::new(),
            install_cmd: install_cmd.into(),
            testcases: Vec::new(),
        }
    }
}

/// Admission-control bucket shared by any number of tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyGroup {
    #[serde(default)]
    pub id: GroupId,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub max_concurrency: usize,
}

impl ConcurrencyGroup {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        let now = Utc::now();
        Self {
            id: GroupId::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            description: String::new(),
            max_concurrency,
        }
    }
}

// =============================================================================
// Calling log
// =============================================================================

/// Record of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallingLog {
    #[serde(default)]
    pub id: CallLogId,
    pub created_at: DateTime<Utc>,
    /// `None` when the caller is outside the catalog.
    pub caller_id: Option<ToolId>,
    pub caller_type: Option<ToolKind>,
    pub callee_id: ToolId,
    pub callee_type: ToolKind,
    pub input: String,
    pub output: String,
    pub error: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}
