//! Tool execution engine.
//!
//! `ToolHub` ties the pieces together. For a command-line invocation:
//! catalog lookup → argument templating → concurrency-group lookup →
//! dependency verification → admission → process execution → calling log.
//! Service tools go through the [`ServiceManager`] instead.

pub mod context;
pub mod executor;
pub mod governor;
pub mod janitor;
pub mod services;
pub mod status;
pub mod validator;
pub mod verifier;

pub use context::CallContext;
pub use executor::{
    CommandExecutor, CommandOutput, CommandSpec, OutputChunk, OutputEvent, OutputStream,
    StreamKind,
};
pub use governor::{ConcurrencyGovernor, GateKey, GateSnapshot, Permit};
pub use janitor::{CallLogJanitor, JanitorStats};
pub use services::{ServiceInfo, ServiceManager, ServiceState};
pub use status::StatusWriter;
pub use validator::{matches, matches_named, normalize_output, MatchType};
pub use verifier::DependencyVerifier;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::tools::{
    CallingLog, CmdToolInput, CmdToolTestcase, CommandLineTool, ConcurrencyGroup, Dependency, Dirs,
    ServiceTool, Tool, ToolKind, ToolRepository, ToolStatus,
};
use crate::types::{EngineConfig, Error, GroupId, InvocationId, Result, ToolId};

// =============================================================================
// Results
// =============================================================================

/// Outcome of a successful command-line invocation.
#[derive(Debug)]
pub enum Invocation {
    Buffered(CommandOutput),
    /// For tools flagged `is_stream`. The concurrency slot is held until
    /// the process exits.
    Streamed(OutputStream),
}

impl Invocation {
    /// Whole output, draining the stream if there is one.
    pub async fn collect(self) -> Result<CommandOutput> {
        match self {
            Invocation::Buffered(output) => Ok(output),
            Invocation::Streamed(stream) => stream.collect_output().await,
        }
    }
}

/// Outcome of one tool testcase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseResult {
    /// 1-based position in the tool's testcase list.
    pub index: usize,
    pub passed: bool,
    pub expect: String,
    pub match_type: MatchType,
    pub actual: String,
    pub exit_code: Option<i32>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Why the testcase failed, when it did.
    pub error: Option<String>,
}

/// Pass/fail report of [`ToolHub::run_testcases`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub tool_id: ToolId,
    pub tool_name: String,
    pub passed: bool,
    /// Set when a dependency could not be satisfied; no testcase ran.
    pub dependency_error: Option<String>,
    pub results: Vec<TestcaseResult>,
}

impl TestReport {
    /// One-line description of the first failure.
    pub fn summary(&self) -> String {
        if let Some(dep) = &self.dependency_error {
            return dep.clone();
        }
        let failed: Vec<_> = self.results.iter().filter(|r| !r.passed).collect();
        match failed.first() {
            None => format!("{} testcases passed", self.results.len()),
            Some(first) => format!(
                "{} of {} testcases failed; testcase {}: {}",
                failed.len(),
                self.results.len(),
                first.index,
                first.error.as_deref().unwrap_or("failed")
            ),
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Entry point for invoking, testing and managing catalog tools.
pub struct ToolHub {
    repo: Arc<dyn ToolRepository>,
    governor: Arc<ConcurrencyGovernor>,
    verifier: DependencyVerifier,
    executor: CommandExecutor,
    services: ServiceManager,
    status: Arc<StatusWriter>,
    dirs: Dirs,
    shutdown: CancellationToken,
}

impl ToolHub {
    pub fn new(repo: Arc<dyn ToolRepository>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let governor = Arc::new(ConcurrencyGovernor::new(config.ungrouped));
        let executor = CommandExecutor::new(config);
        let status = Arc::new(StatusWriter::new(repo.clone()));
        Ok(Self {
            verifier: DependencyVerifier::with_shutdown(executor.clone(), shutdown.child_token()),
            services: ServiceManager::new(executor.clone(), governor.clone(), status.clone()),
            status,
            repo,
            governor,
            executor,
            dirs: Dirs::detect(),
            shutdown,
        })
    }

    /// Override the directories used for working-directory templating.
    pub fn with_dirs(mut self, dirs: Dirs) -> Self {
        self.dirs = dirs;
        self
    }

    pub fn repository(&self) -> &Arc<dyn ToolRepository> {
        &self.repo
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn verifier(&self) -> &DependencyVerifier {
        &self.verifier
    }

    /// Home and temp directories as seen by this engine.
    pub fn get_dirs(&self) -> Dirs {
        self.dirs.clone()
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    async fn command_tool(&self, id: ToolId) -> Result<CommandLineTool> {
        match self.repo.get_tool(id).await? {
            Tool::CommandLine(tool) => Ok(tool),
            Tool::Service(svc) => Err(Error::validation(format!(
                "'{}' is a service tool; use start_service/stop_service",
                svc.meta.name
            ))),
        }
    }

    async fn service_tool(&self, id: ToolId) -> Result<ServiceTool> {
        match self.repo.get_tool(id).await? {
            Tool::Service(svc) => Ok(svc),
            Tool::CommandLine(tool) => Err(Error::validation(format!(
                "'{}' is a command-line tool, not a service",
                tool.meta.name
            ))),
        }
    }

    /// The tool's concurrency group; a dangling reference is a configuration error.
    async fn group(&self, tool: &str, id: Option<GroupId>) -> Result<Option<ConcurrencyGroup>> {
        let Some(id) = id else {
            return Ok(None);
        };
        match self.repo.get_concurrency_group(id).await {
            Ok(group) => Ok(Some(group)),
            Err(Error::NotFound(_)) => Err(Error::configuration(format!(
                "tool '{}' references missing concurrency group {}",
                tool, id
            ))),
            Err(e) => Err(e),
        }
    }

    async fn caller(&self, name: Option<&str>) -> Result<Option<Tool>> {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        match self.repo.get_tool_by_name(name).await {
            Ok(tool) => Ok(Some(tool)),
            Err(Error::NotFound(_)) => Err(Error::validation(format!("unknown caller '{}'", name))),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Invocation
    // -------------------------------------------------------------------------

    /// Invoke a command-line tool.
    ///
    /// Dependencies are certified before a slot is requested, and the tool's
    /// own command is never spawned if that fails.
    pub async fn invoke(
        &self,
        id: ToolId,
        input: CmdToolInput,
        ctx: &CallContext,
    ) -> Result<Invocation> {
        let tool = self.command_tool(id).await?;
        let caller = self.caller(input.caller.as_deref()).await?;
        let invocation = InvocationId::new();
        tracing::debug!(
            tool = %tool.meta.name,
            invocation = %invocation,
            caller = ?input.caller,
            "invoking tool"
        );

        let started = Instant::now();
        let result = self.execute(&tool, &input, ctx).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(Invocation::Buffered(output)) => {
                self.record(&tool, caller.as_ref(), &input, &output.stdout, "", elapsed)
                    .await;
            }
            Ok(Invocation::Streamed(_)) => {}
            Err(e) => {
                tracing::warn!(
                    tool = %tool.meta.name,
                    invocation = %invocation,
                    kind = e.kind(),
                    error = %e,
                    "invocation failed"
                );
                let stdout = e.output().map(|o| o.stdout.as_str()).unwrap_or("");
                self.record(&tool, caller.as_ref(), &input, stdout, &e.to_string(), elapsed)
                    .await;
            }
        }
        result
    }

    /// Invoke a command-line tool by its catalog name.
    pub async fn invoke_by_name(
        &self,
        name: &str,
        input: CmdToolInput,
        ctx: &CallContext,
    ) -> Result<Invocation> {
        let id = self.repo.get_tool_by_name(name).await?.id();
        self.invoke(id, input, ctx).await
    }

    async fn execute(
        &self,
        tool: &CommandLineTool,
        input: &CmdToolInput,
        ctx: &CallContext,
    ) -> Result<Invocation> {
        let spec = self.executor.prepare(tool, input, &self.dirs)?;
        let group = self.group(&tool.meta.name, tool.concurrency_group_id).await?;
        self.verifier.ensure_all(&tool.dependencies, ctx).await?;
        let permit = self.governor.acquire(group.as_ref(), ctx).await?;

        if tool.is_stream {
            let stream = self.executor.run_streaming(spec, ctx.clone(), permit)?;
            Ok(Invocation::Streamed(stream))
        } else {
            let output = self.executor.run(&spec, ctx).await;
            drop(permit);
            output.map(Invocation::Buffered)
        }
    }

    async fn record(
        &self,
        tool: &CommandLineTool,
        caller: Option<&Tool>,
        input: &CmdToolInput,
        output: &str,
        error: &str,
        duration: Duration,
    ) {
        let log = CallingLog {
            id: Default::default(),
            created_at: Utc::now(),
            caller_id: caller.map(Tool::id),
            caller_type: caller.map(Tool::kind),
            callee_id: tool.meta.id,
            callee_type: ToolKind::CommandLine,
            input: serde_json::to_string(input).unwrap_or_default(),
            output: output.to_string(),
            error: error.to_string(),
            duration,
        };
        if let Err(e) = self.repo.record_call(log).await {
            tracing::warn!(tool = %tool.meta.name, error = %e, "failed to record calling log");
        }
    }

    // -------------------------------------------------------------------------
    // Catalog updates
    // -------------------------------------------------------------------------

    /// Replace a dependency record and drop its cached certification, so the
    /// next tool that needs it reinstalls and revalidates it.
    pub async fn update_dependency(&self, dep: Dependency) -> Result<Arc<Dependency>> {
        let dep = self.repo.update_dependency(dep).await?;
        if self.verifier.invalidate(dep.id) {
            tracing::info!(dependency = %dep.name, "dependency changed; certification dropped");
        }
        Ok(dep)
    }

    /// Replace a concurrency group record and apply its limit to the live gate.
    pub async fn update_group(&self, group: ConcurrencyGroup) -> Result<ConcurrencyGroup> {
        let group = self.repo.update_group(group).await?;
        self.governor.resize(group.id, group.max_concurrency);
        Ok(group)
    }

    // -------------------------------------------------------------------------
    // Dependencies and testcases
    // -------------------------------------------------------------------------

    /// Certify every dependency of a command-line tool.
    pub async fn verify_dependencies(&self, id: ToolId, ctx: &CallContext) -> Result<()> {
        let tool = self.command_tool(id).await?;
        self.verifier.ensure_all(&tool.dependencies, ctx).await
    }

    /// Run a tool's own testcases and mark it `Ready` or `Error`.
    ///
    /// Testcase failures are reported, not returned as errors. Cancellation
    /// and configuration errors are returned; the latter also mark the tool
    /// `Error`.
    pub async fn run_testcases(&self, id: ToolId, ctx: &CallContext) -> Result<TestReport> {
        let tool = self.command_tool(id).await?;
        tracing::info!(tool = %tool.meta.name, testcases = tool.testcases.len(), "running testcases");

        let report = match self.certify(&tool, ctx).await {
            Ok(report) => report,
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                self.status
                    .write(tool.meta.id, ToolStatus::Error, e.to_string())
                    .await?;
                return Err(e);
            }
        };

        if report.passed {
            self.status.write(tool.meta.id, ToolStatus::Ready, "").await?;
        } else {
            self.status
                .write(tool.meta.id, ToolStatus::Error, report.summary())
                .await?;
        }
        tracing::info!(tool = %tool.meta.name, passed = report.passed, "testcases finished");
        Ok(report)
    }

    async fn certify(&self, tool: &CommandLineTool, ctx: &CallContext) -> Result<TestReport> {
        let mut report = TestReport {
            tool_id: tool.meta.id,
            tool_name: tool.meta.name.clone(),
            passed: false,
            dependency_error: None,
            results: Vec::with_capacity(tool.testcases.len()),
        };

        let group = self.group(&tool.meta.name, tool.concurrency_group_id).await?;
        match self.verifier.ensure_all(&tool.dependencies, ctx).await {
            Ok(()) => {}
            Err(e @ (Error::InstallFailed { .. } | Error::ValidationFailed { .. })) => {
                report.dependency_error = Some(e.to_string());
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        for (index, testcase) in tool.testcases.iter().enumerate() {
            let result = self
                .run_testcase(tool, index + 1, testcase, group.as_ref(), ctx)
                .await?;
            report.results.push(result);
        }
        report.passed = report.results.iter().all(|r| r.passed);
        Ok(report)
    }

    async fn run_testcase(
        &self,
        tool: &CommandLineTool,
        index: usize,
        testcase: &CmdToolTestcase,
        group: Option<&ConcurrencyGroup>,
        ctx: &CallContext,
    ) -> Result<TestcaseResult> {
        let spec = self.executor.prepare(tool, &testcase.input, &self.dirs)?;
        let permit = self.governor.acquire(group, ctx).await?;
        let started = Instant::now();
        let run = self.executor.run_capture(&spec, ctx).await;
        drop(permit);

        let mut result = TestcaseResult {
            index,
            passed: false,
            expect: testcase.expect.clone(),
            match_type: testcase.match_type,
            actual: String::new(),
            exit_code: None,
            elapsed: started.elapsed(),
            error: None,
        };
        match run {
            Ok(output) => {
                result.actual = normalize_output(&output.stdout).to_string();
                result.exit_code = output.exit_code;
                result.elapsed = output.elapsed;
                result.passed = matches(&result.actual, &testcase.expect, testcase.match_type)?;
                if !result.passed {
                    result.error = Some(format!(
                        "expected {} {:?}, got {:?}",
                        testcase.match_type, testcase.expect, result.actual
                    ));
                }
            }
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                if let Some(partial) = e.output() {
                    result.actual = normalize_output(&partial.stdout).to_string();
                }
                result.error = Some(e.to_string());
            }
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Services
    // -------------------------------------------------------------------------

    pub async fn start_service(&self, id: ToolId, ctx: &CallContext) -> Result<ServiceInfo> {
        let svc = self.service_tool(id).await?;
        let group = self.group(&svc.meta.name, svc.concurrency_group_id).await?;
        self.services.start(&svc, group.as_ref(), ctx).await
    }

    pub async fn stop_service(&self, id: ToolId, ctx: &CallContext) -> Result<ServiceInfo> {
        let svc = self.service_tool(id).await?;
        self.services.stop(&svc, ctx).await
    }

    pub fn service_info(&self, id: ToolId) -> ServiceInfo {
        self.services.info(id)
    }

    /// Stop all services and cancel dependency installs in flight.
    pub async fn shutdown(&self) {
        tracing::info!("tool hub shutting down");
        self.shutdown.cancel();
        self.services.shutdown().await;
    }
}

impl std::fmt::Debug for ToolHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHub")
            .field("dirs", &self.dirs)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
