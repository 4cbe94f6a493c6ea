//! Command executor: one OS process per invocation.
//!
//! Output is either buffered and returned whole, or forwarded as chunks over
//! a bounded channel. A full channel stops the pipe readers, which in turn
//! blocks the child on its next write, so a slow consumer never causes
//! unbounded buffering. On timeout the whole process group gets SIGTERM,
//! then SIGKILL after the grace period.

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::context::CallContext;
use crate::tools::template::{render_command, render_working_dir, Dirs};
use crate::tools::{CmdToolInput, CommandLineTool};
use crate::types::{EngineConfig, Error, Result};

/// How long pipe readers may keep draining after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

// =============================================================================
// Command spec and output
// =============================================================================

/// A fully resolved command, ready to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Applied on top of the inherited process environment.
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn from_argv(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::configuration("command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            working_dir: None,
            env: HashMap::new(),
            stdin: None,
            timeout,
        })
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.into()],
            working_dir: None,
            env: HashMap::new(),
            stdin: None,
            timeout,
        }
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of one process run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Some output was dropped because it exceeded the capture limit.
    pub truncated: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut all = String::with_capacity(self.stdout.len() + self.stderr.len());
        all.push_str(&self.stdout);
        all.push_str(&self.stderr);
        all
    }
}

// =============================================================================
// Streaming types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A slice of output as it was read from the child.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

/// Item of an [`OutputStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Chunk(OutputChunk),
    /// Final item of a successful run.
    Exited { exit_code: Option<i32>, elapsed: Duration },
}

/// Incremental output of a running process.
///
/// Finite and not restartable: chunks in arrival order, then exactly one
/// terminal item (`Ok(OutputEvent::Exited)` or an error such as `Timeout`
/// or `NonZeroExit`). Dropping the stream terminates the process.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<Result<OutputEvent>>,
    _abandon: DropGuard,
}

impl OutputStream {
    pub async fn next_event(&mut self) -> Option<Result<OutputEvent>> {
        self.rx.recv().await
    }

    /// Drain the stream into a single output, for callers that want the whole thing.
    pub async fn collect_output(mut self) -> Result<CommandOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = self.next_event().await {
            match event? {
                OutputEvent::Chunk(chunk) => match chunk.stream {
                    StreamKind::Stdout => stdout.extend_from_slice(&chunk.data),
                    StreamKind::Stderr => stderr.extend_from_slice(&chunk.data),
                },
                OutputEvent::Exited { exit_code, elapsed } => {
                    return Ok(CommandOutput {
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                        exit_code,
                        elapsed,
                        truncated: false,
                    });
                }
            }
        }
        Err(Error::internal("output stream ended without an exit event"))
    }
}

impl Stream for OutputStream {
    type Item = Result<OutputEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Output capture
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureMode {
    /// Keep everything up to the limit.
    Head,
    /// Keep only the most recent bytes (streams, services).
    Tail,
}

#[derive(Debug)]
pub(crate) struct Capture {
    buf: Vec<u8>,
    limit: usize,
    mode: CaptureMode,
    truncated: bool,
}

pub(crate) type SharedCapture = Arc<Mutex<Capture>>;

impl Capture {
    fn shared(limit: usize, mode: CaptureMode) -> SharedCapture {
        Arc::new(Mutex::new(Capture {
            buf: Vec::new(),
            limit,
            mode,
            truncated: false,
        }))
    }

    pub(crate) fn tail(limit: usize) -> SharedCapture {
        Self::shared(limit, CaptureMode::Tail)
    }

    fn push(&mut self, data: &[u8]) {
        match self.mode {
            CaptureMode::Head => {
                let room = self.limit.saturating_sub(self.buf.len());
                if data.len() > room {
                    self.truncated = true;
                }
                self.buf.extend_from_slice(&data[..data.len().min(room)]);
            }
            CaptureMode::Tail => {
                self.buf.extend_from_slice(data);
                if self.buf.len() > self.limit {
                    let excess = self.buf.len() - self.limit;
                    self.buf.drain(..excess);
                    self.truncated = true;
                }
            }
        }
    }

    pub(crate) fn snapshot(shared: &SharedCapture) -> (String, bool) {
        let cap = shared.lock().unwrap_or_else(PoisonError::into_inner);
        (String::from_utf8_lossy(&cap.buf).into_owned(), cap.truncated)
    }
}

type EventSender = mpsc::Sender<Result<OutputEvent>>;

/// Copy one pipe into its capture buffer (and the stream, if any) until EOF.
pub(crate) async fn pump<R>(
    mut reader: R,
    kind: StreamKind,
    capture: SharedCapture,
    sink: Option<EventSender>,
    chunk_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_bytes];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(stream = ?kind, error = %e, "pipe read failed");
                break;
            }
        };
        capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&buf[..n]);
        if let Some(tx) = &sink {
            let chunk = OutputChunk {
                stream: kind,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            if tx.send(Ok(OutputEvent::Chunk(chunk))).await.is_err() {
                break;
            }
        }
    }
}

/// Wait for reader tasks up to `grace`, aborting any that are still blocked
/// (e.g. a detached grandchild still holds the pipe).
pub(crate) async fn finish_readers(readers: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    for mut handle in readers {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

// =============================================================================
// Process control
// =============================================================================

#[cfg(unix)]
async fn signal_group(pgid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::debug!(pgid, signal, error = %e, "failed to signal process group");
    }
}

/// SIGTERM the child's process group, SIGKILL after `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, "TERM").await;
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        // Leftover group members would keep our pipes open.
        signal_group(pid, "KILL").await;
        if exited {
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "kill failed; process already gone");
    }
    let _ = child.wait().await;
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled(Error),
}

// =============================================================================
// Executor
// =============================================================================

/// Runs command-line tool invocations.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: Arc<EngineConfig>,
}

impl CommandExecutor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve a tool's template against invocation input.
    ///
    /// Environment: tool defaults overridden by the input. Working directory:
    /// input override, else the tool's. Timeout: input, else tool, else the
    /// engine default.
    pub fn prepare(
        &self,
        tool: &CommandLineTool,
        input: &CmdToolInput,
        dirs: &Dirs,
    ) -> Result<CommandSpec> {
        let argv = render_command(&tool.cmd, &input.args)?;
        let timeout = input
            .timeout
            .filter(|t| !t.is_zero())
            .or(tool.timeout.filter(|t| !t.is_zero()))
            .unwrap_or(self.config.default_timeout);
        let mut spec = CommandSpec::from_argv(argv, timeout)?;

        spec.env = tool.env.clone();
        spec.env
            .extend(input.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let raw_dir = input
            .working_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&tool.working_dir);
        if !raw_dir.is_empty() {
            spec.working_dir = Some(PathBuf::from(render_working_dir(raw_dir, dirs)));
        }
        if !input.stdin.is_empty() {
            spec.stdin = Some(input.stdin.as_bytes().to_vec());
        }
        Ok(spec)
    }

    pub(crate) fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: spec.display(),
            source,
        })?;
        tracing::debug!(command = %spec.display(), pid = ?child.id(), "spawned process");
        Ok(child)
    }

    /// Run to completion and return the buffered output.
    ///
    /// A non-zero exit comes back as `Error::NonZeroExit` with the full output.
    pub async fn run(&self, spec: &CommandSpec, ctx: &CallContext) -> Result<CommandOutput> {
        if ctx.is_done() {
            return Err(ctx.done().await);
        }
        let started = Instant::now();
        let child = self.spawn(spec)?;
        self.supervise(child, spec, ctx, None, None, CaptureMode::Head, started)
            .await
    }

    /// Like [`run`](Self::run), but a non-zero exit is returned as plain output.
    ///
    /// Testcases judge output and exit code separately.
    pub async fn run_capture(&self, spec: &CommandSpec, ctx: &CallContext) -> Result<CommandOutput> {
        match self.run(spec, ctx).await {
            Err(Error::NonZeroExit { output }) => Ok(*output),
            other => other,
        }
    }

    /// Spawn and return an incremental output stream.
    ///
    /// `guard` is held until the process has finished (used to keep a
    /// concurrency permit for the lifetime of the run).
    pub fn run_streaming<G>(
        &self,
        spec: CommandSpec,
        ctx: CallContext,
        guard: G,
    ) -> Result<OutputStream>
    where
        G: Send + 'static,
    {
        if ctx.is_done() {
            return Err(Error::cancelled("caller gave up before spawn"));
        }
        let started = Instant::now();
        let child = self.spawn(&spec)?;
        let (tx, rx) = mpsc::channel(self.config.stream_channel_capacity);
        let abandon = CancellationToken::new();
        let abandoned = abandon.clone();
        let executor = self.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let result = executor
                .supervise(
                    child,
                    &spec,
                    &ctx,
                    Some(tx.clone()),
                    Some(abandoned),
                    CaptureMode::Tail,
                    started,
                )
                .await;
            let last = result.map(|out| OutputEvent::Exited {
                exit_code: out.exit_code,
                elapsed: out.elapsed,
            });
            // Receiver may already be gone.
            let _ = tx.send(last).await;
        });

        Ok(OutputStream {
            rx,
            _abandon: abandon.drop_guard(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        mut child: Child,
        spec: &CommandSpec,
        ctx: &CallContext,
        sink: Option<EventSender>,
        abandon: Option<CancellationToken>,
        mode: CaptureMode,
        started: Instant,
    ) -> Result<CommandOutput> {
        if let (Some(mut stdin), Some(data)) = (child.stdin.take(), spec.stdin.clone()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    tracing::debug!(error = %e, "stdin closed early");
                }
                // Dropping stdin closes the pipe.
            });
        }

        let limit = match mode {
            CaptureMode::Head => self.config.max_output_bytes,
            CaptureMode::Tail => self.config.tail_bytes,
        };
        let stdout_cap = Capture::shared(limit, mode);
        let stderr_cap = Capture::shared(limit, mode);
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                out,
                StreamKind::Stdout,
                stdout_cap.clone(),
                sink.clone(),
                self.config.chunk_bytes,
            )));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                err,
                StreamKind::Stderr,
                stderr_cap.clone(),
                sink.clone(),
                self.config.chunk_bytes,
            )));
        }
        let streaming = sink.is_some();
        drop(sink);

        let abandon = abandon.as_ref();
        let abandoned = move || async move {
            match abandon {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = started + spec.timeout;
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            err = ctx.done() => Waited::Cancelled(err),
            _ = abandoned() => Waited::Cancelled(Error::cancelled("output stream dropped")),
        };

        let collect = |exit_code: Option<i32>| {
            let (stdout, out_trunc) = Capture::snapshot(&stdout_cap);
            let (stderr, err_trunc) = Capture::snapshot(&stderr_cap);
            CommandOutput {
                stdout,
                stderr,
                exit_code,
                elapsed: started.elapsed(),
                truncated: out_trunc || err_trunc,
            }
        };

        match waited {
            Waited::Exited(status) => {
                let status = status?;
                if streaming {
                    // Readers may be parked on a full channel with output still
                    // in the pipe; they finish at the consumer's pace.
                    let aborts: Vec<AbortHandle> =
                        readers.iter().map(JoinHandle::abort_handle).collect();
                    let interrupted = tokio::select! {
                        _ = futures::future::join_all(readers) => None,
                        _ = tokio::time::sleep_until(deadline) => {
                            let partial = collect(status.code());
                            Some(Error::Timeout {
                                elapsed: partial.elapsed,
                                partial: Box::new(partial),
                            })
                        }
                        err = ctx.done() => Some(err),
                        _ = abandoned() => Some(Error::cancelled("output stream dropped")),
                    };
                    if let Some(err) = interrupted {
                        aborts.iter().for_each(AbortHandle::abort);
                        tracing::warn!(
                            command = %spec.display(),
                            error = %err,
                            "stream drain interrupted"
                        );
                        return Err(err);
                    }
                } else {
                    finish_readers(readers, self.config.kill_grace).await;
                }
                let output = collect(status.code());
                tracing::debug!(
                    command = %spec.display(),
                    exit_code = ?output.exit_code,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "process exited"
                );
                if output.success() {
                    Ok(output)
                } else {
                    Err(Error::NonZeroExit {
                        output: Box::new(output),
                    })
                }
            }
            Waited::TimedOut => {
                terminate(&mut child, self.config.kill_grace).await;
                finish_readers(readers, DRAIN_GRACE).await;
                let partial = collect(None);
                tracing::warn!(
                    command = %spec.display(),
                    timeout_ms = spec.timeout.as_millis() as u64,
                    "process timed out"
                );
                Err(Error::Timeout {
                    elapsed: partial.elapsed,
                    partial: Box::new(partial),
                })
            }
            Waited::Cancelled(err) => {
                terminate(&mut child, self.config.kill_grace).await;
                finish_readers(readers, DRAIN_GRACE).await;
                tracing::info!(command = %spec.display(), "process cancelled by caller");
                Err(err)
            }
        }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::shell(script, Duration::from_secs(10))
    }

    fn tool(cmd: &[&str]) -> CommandLineTool {
        CommandLineTool::new("t", cmd.iter().map(|s| s.to_string()).collect())
    }

    fn dirs() -> Dirs {
        Dirs {
            home: "/home/test".to_string(),
            temp: "/tmp".to_string(),
        }
    }

    #[tokio::test]
    async fn test_simple_command() {
        let exec = CommandExecutor::default();
        let spec = exec
            .prepare(
                &tool(&["echo", "$message"]),
                &CmdToolInput::default().with_arg("message", "Hello World"),
                &dirs(),
            )
            .unwrap();
        let out = exec.run(&spec, &CallContext::new()).await.unwrap();
        assert_eq!(out.stdout, "Hello World\n");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_pipeline_with_placeholder() {
        let exec = CommandExecutor::default();
        let spec = exec
            .prepare(
                &tool(&[
                    "/bin/sh",
                    "-c",
                    "echo $text | tr '[:lower:]' '[:upper:]' | sed 's/WORLD/UNIVERSE/g'",
                ]),
                &CmdToolInput::default().with_arg("text", "hello world"),
                &dirs(),
            )
            .unwrap();
        let out = exec.run(&spec, &CallContext::new()).await.unwrap();
        assert_eq!(out.stdout.trim(), "HELLO UNIVERSE");
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let exec = CommandExecutor::default();
        let input = CmdToolInput {
            stdin: "line one\nline two\n".to_string(),
            ..CmdToolInput::default()
        };
        let spec = exec.prepare(&tool(&["wc", "-l"]), &input, &dirs()).unwrap();
        let out = exec.run(&spec, &CallContext::new()).await.unwrap();
        assert_eq!(out.stdout.trim(), "2");
    }

    #[tokio::test]
    async fn test_env_override_wins() {
        let exec = CommandExecutor::default();
        let mut t = tool(&["sh", "-c", "echo $GREETING-$TARGET"]);
        t.env.insert("GREETING".to_string(), "hi".to_string());
        t.env.insert("TARGET".to_string(), "tool".to_string());
        let mut input = CmdToolInput::default();
        input.env.insert("TARGET".to_string(), "caller".to_string());

        let spec = exec.prepare(&t, &input, &dirs()).unwrap();
        let out = exec.run(&spec, &CallContext::new()).await.unwrap();
        assert_eq!(out.stdout.trim(), "hi-caller");
    }

    #[tokio::test]
    async fn test_working_dir_override() {
        let exec = CommandExecutor::default();
        let tool_dir = tempfile::tempdir().unwrap();
        let call_dir = tempfile::tempdir().unwrap();
        let mut t = tool(&["pwd"]);
        t.working_dir = tool_dir.path().to_string_lossy().into_owned();

        let spec = exec.prepare(&t, &CmdToolInput::default(), &dirs()).unwrap();
        assert_eq!(spec.working_dir.as_deref(), Some(tool_dir.path()));

        let input = CmdToolInput {
            working_dir: Some(call_dir.path().to_string_lossy().into_owned()),
            ..CmdToolInput::default()
        };
        let spec = exec.prepare(&t, &input, &dirs()).unwrap();
        let out = exec.run(&spec, &CallContext::new()).await.unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(call_dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_precedence() {
        let exec = CommandExecutor::default();
        let mut t = tool(&["true"]);
        let spec = exec.prepare(&t, &CmdToolInput::default(), &dirs()).unwrap();
        assert_eq!(spec.timeout, EngineConfig::default().default_timeout);

        t.timeout = Some(Duration::from_secs(5));
        let spec = exec.prepare(&t, &CmdToolInput::default(), &dirs()).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(5));

        let input = CmdToolInput {
            timeout: Some(Duration::from_secs(1)),
            ..CmdToolInput::default()
        };
        let spec = exec.prepare(&t, &input, &dirs()).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let exec = CommandExecutor::default();
        let spec = CommandSpec::shell("echo partial; sleep 5", Duration::from_secs(1));
        let started = std::time::Instant::now();
        let err = exec.run(&spec, &CallContext::new()).await.unwrap_err();

        match err {
            Error::Timeout { elapsed, partial } => {
                assert!(elapsed >= Duration::from_secs(1));
                assert!(partial.stdout.contains("partial"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_structured() {
        let exec = CommandExecutor::default();
        let err = exec
            .run(&sh("echo out; echo err >&2; exit 3"), &CallContext::new())
            .await
            .unwrap_err();
        match err {
            Error::NonZeroExit { output } => {
                assert_eq!(output.exit_code, Some(3));
                assert_eq!(output.stdout, "out\n");
                assert_eq!(output.stderr, "err\n");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let exec = CommandExecutor::default();
        let spec = CommandSpec::from_argv(
            vec!["definitely-not-a-real-binary-xyz".to_string()],
            Duration::from_secs(1),
        )
        .unwrap();
        let err = exec.run(&spec, &CallContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_is_configuration_error() {
        let exec = CommandExecutor::default();
        let err = exec
            .prepare(&tool(&[]), &CmdToolInput::default(), &dirs())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_caller_cancellation_kills_process() {
        let exec = CommandExecutor::default();
        let ctx = CallContext::with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = exec.run(&sh("sleep 5"), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let config = EngineConfig {
            max_output_bytes: 4,
            ..EngineConfig::default()
        };
        let exec = CommandExecutor::new(config);
        let out = exec
            .run(&sh("printf 0123456789"), &CallContext::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "0123");
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_streaming_delivers_chunks_then_exit() {
        let exec = CommandExecutor::default();
        let mut stream = exec
            .run_streaming(sh("echo one; sleep 0.1; echo two"), CallContext::new(), ())
            .unwrap();

        let mut text = String::new();
        let mut exit = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                OutputEvent::Chunk(chunk) => {
                    assert_eq!(chunk.stream, StreamKind::Stdout);
                    text.push_str(&String::from_utf8_lossy(&chunk.data));
                }
                OutputEvent::Exited { exit_code, .. } => exit = Some(exit_code),
            }
        }
        assert_eq!(text, "one\ntwo\n");
        assert_eq!(exit, Some(Some(0)));
    }

    #[tokio::test]
    async fn test_streaming_timeout_is_terminal_error() {
        let exec = CommandExecutor::default();
        let spec = CommandSpec::shell("echo early; sleep 5", Duration::from_millis(300));
        let stream = exec.run_streaming(spec, CallContext::new(), ()).unwrap();
        let err = stream.collect_output().await.unwrap_err();
        match err {
            Error::Timeout { partial, .. } => assert!(partial.stdout.contains("early")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_guard_held_until_exit() {
        let exec = CommandExecutor::default();
        let (guard_tx, mut guard_rx) = tokio::sync::oneshot::channel::<()>();
        let stream = exec
            .run_streaming(sh("sleep 0.2; echo done"), CallContext::new(), guard_tx)
            .unwrap();
        // Guard still alive while the process runs.
        assert!(guard_rx.try_recv().is_err());
        let out = stream.collect_output().await.unwrap();
        assert_eq!(out.stdout, "done\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            guard_rx.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_slow_consumer_bounds_buffering() {
        let config = EngineConfig {
            stream_channel_capacity: 2,
            chunk_bytes: 16,
            ..EngineConfig::default()
        };
        let exec = CommandExecutor::new(config);
        let mut stream = exec
            .run_streaming(sh("yes | head -c 100000"), CallContext::new(), ())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only a bounded number of chunks can be queued while nobody reads.
        let mut queued = 0usize;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(1), stream.next_event()).await
        {
            queued += 1;
            if queued > 2 {
                break;
            }
        }
        assert!(queued >= 1);

        let out = stream.collect_output().await.unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.len(), 100_000);
    }

    #[tokio::test]
    async fn test_late_consumer_receives_all_output() {
        let config = EngineConfig {
            stream_channel_capacity: 2,
            chunk_bytes: 1024,
            kill_grace: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let exec = CommandExecutor::new(config);

        for size in [20_000usize, 60_000] {
            let script = format!("head -c {} /dev/zero", size);
            let stream = exec
                .run_streaming(sh(&script), CallContext::new(), ())
                .unwrap();
            // The child exits long before anyone reads.
            tokio::time::sleep(Duration::from_millis(500)).await;

            let out = stream.collect_output().await.unwrap();
            assert_eq!(out.exit_code, Some(0));
            assert_eq!(out.stdout.len(), size, "output lost for {} bytes", size);
        }
    }

    #[tokio::test]
    async fn test_undrained_stream_still_times_out() {
        let config = EngineConfig {
            stream_channel_capacity: 1,
            chunk_bytes: 64,
            ..EngineConfig::default()
        };
        let exec = CommandExecutor::new(config);
        let mut stream = exec
            .run_streaming(
                CommandSpec::shell("head -c 200000 /dev/zero", Duration::from_millis(300)),
                CallContext::new(),
                (),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut terminal = None;
        while let Some(event) = stream.next_event().await {
            if let Err(e) = event {
                terminal = Some(e);
            }
        }
        assert!(matches!(terminal, Some(Error::Timeout { .. })), "{:?}", terminal);
    }

    #[tokio::test]
    async fn test_dropping_stream_terminates_process() {
        let exec = CommandExecutor::default();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch {}", marker.display());
        let stream = exec
            .run_streaming(sh(&script), CallContext::new(), ())
            .unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
