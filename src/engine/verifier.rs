//! Dependency verifier.
//!
//! A dependency is satisfied once its install command has succeeded in this
//! process and all of its testcases pass. Satisfaction lives in memory only,
//! so every process start re-verifies. Failures are never cached.
//!
//! At most one install+validate attempt runs per dependency id. The attempt
//! is a spawned task behind a shared future: concurrent callers await the same
//! outcome, and a caller that gives up only stops its own wait.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::context::CallContext;
use super::executor::{CommandExecutor, CommandSpec};
use super::validator::{matches, normalize_output};
use crate::tools::{Dependency, TestcaseForDependency};
use crate::types::{DependencyId, Error, Result};

/// How much of an install command's stderr is quoted in `InstallFailed`.
const REASON_TAIL_CHARS: usize = 512;

/// Cloneable failure shared by every caller of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DependencyFailure {
    Install(String),
    Validation(String),
    Cancelled(String),
}

impl DependencyFailure {
    fn into_error(self, dependency: &str) -> Error {
        match self {
            DependencyFailure::Install(reason) => Error::install_failed(dependency, reason),
            DependencyFailure::Validation(reason) => Error::validation_failed(dependency, reason),
            DependencyFailure::Cancelled(reason) => Error::cancelled(reason),
        }
    }
}

type Outcome = std::result::Result<(), DependencyFailure>;
type Attempt = Shared<BoxFuture<'static, Outcome>>;

enum Entry {
    Satisfied,
    Pending { generation: u64, attempt: Attempt },
}

struct Inner {
    entries: Mutex<HashMap<DependencyId, Entry>>,
    next_generation: Mutex<u64>,
    executor: CommandExecutor,
    shutdown: CancellationToken,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<DependencyId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome unless the entry was invalidated or replaced meanwhile.
    fn settle(&self, id: DependencyId, generation: u64, outcome: &Outcome) {
        let mut entries = self.entries();
        let current = matches!(
            entries.get(&id),
            Some(Entry::Pending { generation: g, .. }) if *g == generation
        );
        if !current {
            return;
        }
        match outcome {
            Ok(()) => {
                entries.insert(id, Entry::Satisfied);
            }
            Err(_) => {
                entries.remove(&id);
            }
        }
    }

    async fn install_and_validate(&self, dep: &Dependency) -> Outcome {
        let ctx = CallContext::with_token(self.shutdown.child_token());
        let config = self.executor.config();

        if dep.install_cmd.trim().is_empty() {
            tracing::debug!(dependency = %dep.name, "no install command; validating only");
        } else {
            tracing::info!(dependency = %dep.name, install_cmd = %dep.install_cmd, "installing dependency");
            let install = CommandSpec::shell(dep.install_cmd.clone(), config.install_timeout);
            match self.executor.run(&install, &ctx).await {
                Ok(_) => {}
                Err(Error::Cancelled(reason)) => return Err(DependencyFailure::Cancelled(reason)),
                Err(e) => {
                    let reason = install_failure_reason(&e);
                    tracing::warn!(dependency = %dep.name, reason = %reason, "install failed");
                    return Err(DependencyFailure::Install(reason));
                }
            }
        }

        for (index, testcase) in dep.testcases.iter().enumerate() {
            if let Err(failure) = self.check(index, testcase, &ctx).await {
                tracing::warn!(dependency = %dep.name, failure = ?failure, "dependency testcase failed");
                return Err(failure);
            }
        }

        tracing::info!(
            dependency = %dep.name,
            testcases = dep.testcases.len(),
            "dependency satisfied"
        );
        Ok(())
    }

    /// Run one dependency testcase; its stdout and stderr are matched together.
    async fn check(
        &self,
        index: usize,
        testcase: &TestcaseForDependency,
        ctx: &CallContext,
    ) -> Outcome {
        let number = index + 1;
        let spec = CommandSpec::from_argv(testcase.cmd.clone(), self.executor.config().testcase_timeout)
            .map_err(|e| DependencyFailure::Validation(format!("testcase {}: {}", number, e)))?;

        let output = match self.executor.run_capture(&spec, ctx).await {
            Ok(output) => output,
            Err(Error::Cancelled(reason)) => return Err(DependencyFailure::Cancelled(reason)),
            Err(e) => {
                return Err(DependencyFailure::Validation(format!(
                    "testcase {} `{}`: {}",
                    number,
                    spec.display(),
                    e
                )))
            }
        };

        let combined = output.combined();
        let actual = normalize_output(&combined);
        match matches(actual, &testcase.expect, testcase.match_type) {
            Ok(true) => Ok(()),
            Ok(false) => Err(DependencyFailure::Validation(format!(
                "testcase {} `{}`: expected {} {:?}, got {:?}",
                number,
                spec.display(),
                testcase.match_type,
                testcase.expect,
                actual
            ))),
            Err(e) => Err(DependencyFailure::Validation(format!(
                "testcase {}: {}",
                number, e
            ))),
        }
    }
}

fn install_failure_reason(err: &Error) -> String {
    match err {
        Error::NonZeroExit { output } => {
            let stderr = output.stderr.trim();
            let start = stderr
                .char_indices()
                .rev()
                .nth(REASON_TAIL_CHARS.saturating_sub(1))
                .map_or(0, |(i, _)| i);
            if stderr.is_empty() {
                err.to_string()
            } else {
                format!("{}: {}", err, &stderr[start..])
            }
        }
        other => other.to_string(),
    }
}

/// Ensures dependencies are installed and certified before a tool runs.
#[derive(Clone)]
pub struct DependencyVerifier {
    inner: Arc<Inner>,
}

impl DependencyVerifier {
    pub fn new(executor: CommandExecutor) -> Self {
        Self::with_shutdown(executor, CancellationToken::new())
    }

    /// Attempts in flight are cancelled when `shutdown` fires.
    pub fn with_shutdown(executor: CommandExecutor, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                executor,
                shutdown,
            }),
        }
    }

    /// Satisfied, or fails with `InstallFailed` / `ValidationFailed`.
    ///
    /// Returns immediately when already satisfied. The caller's context only
    /// bounds this caller's wait; the shared attempt keeps running.
    pub async fn ensure(&self, dep: &Arc<Dependency>, ctx: &CallContext) -> Result<()> {
        let attempt = {
            let mut entries = self.inner.entries();
            match entries.get(&dep.id) {
                Some(Entry::Satisfied) => return Ok(()),
                Some(Entry::Pending { attempt, .. }) => {
                    tracing::debug!(dependency = %dep.name, "joining in-flight attempt");
                    attempt.clone()
                }
                None => {
                    let generation = self.next_generation();
                    let attempt = self.start_attempt(dep.clone(), generation);
                    entries.insert(
                        dep.id,
                        Entry::Pending {
                            generation,
                            attempt: attempt.clone(),
                        },
                    );
                    attempt
                }
            }
        };

        ctx.run(attempt)
            .await?
            .map_err(|failure| failure.into_error(&dep.name))
    }

    /// Ensure every dependency in declaration order, stopping at the first failure.
    pub async fn ensure_all(&self, deps: &[Arc<Dependency>], ctx: &CallContext) -> Result<()> {
        for dep in deps {
            self.ensure(dep, ctx).await?;
        }
        Ok(())
    }

    pub fn is_satisfied(&self, id: DependencyId) -> bool {
        matches!(self.inner.entries().get(&id), Some(Entry::Satisfied))
    }

    /// Forget cached satisfaction (e.g. after the dependency record changed).
    ///
    /// An attempt already in flight finishes for its current waiters but its
    /// result is not cached.
    pub fn invalidate(&self, id: DependencyId) -> bool {
        self.inner.entries().remove(&id).is_some()
    }

    fn next_generation(&self) -> u64 {
        let mut next = self
            .inner
            .next_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }

    fn start_attempt(&self, dep: Arc<Dependency>, generation: u64) -> Attempt {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outcome = inner.install_and_validate(&dep).await;
            inner.settle(dep.id, generation, &outcome);
            outcome
        });
        async move {
            handle.await.unwrap_or_else(|e| {
                Err(DependencyFailure::Install(format!(
                    "install task aborted: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for DependencyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyVerifier")
            .field("tracked", &self.inner.entries().len())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::validator::MatchType;
    use std::path::Path;
    use std::time::Duration;

    fn verifier() -> DependencyVerifier {
        DependencyVerifier::new(CommandExecutor::default())
    }

    fn counting_dep(id: u64, counter: &Path, tail: &str) -> Arc<Dependency> {
        let mut dep = Dependency::new(
            format!("dep-{}", id),
            format!("echo run >> {}{}", counter.display(), tail),
        );
        dep.id = DependencyId::new(id);
        Arc::new(dep)
    }

    fn runs(counter: &Path) -> usize {
        std::fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn testcase(cmd: &[&str], expect: &str, match_type: MatchType) -> TestcaseForDependency {
        TestcaseForDependency {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            expect: expect.to_string(),
            match_type,
        }
    }

    #[tokio::test]
    async fn test_satisfied_dependency_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let dep = counting_dep(1, &counter, "");
        let v = verifier();

        v.ensure(&dep, &CallContext::new()).await.unwrap();
        v.ensure(&dep, &CallContext::new()).await.unwrap();

        assert!(v.is_satisfied(dep.id));
        assert_eq!(runs(&counter), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_installs_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let dep = counting_dep(2, &counter, "; sleep 0.2");
        let v = verifier();

        let calls = (0..8).map(|_| {
            let v = v.clone();
            let dep = dep.clone();
            tokio::spawn(async move { v.ensure(&dep, &CallContext::new()).await })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }
        assert_eq!(runs(&counter), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_failure() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let dep = counting_dep(3, &counter, "; sleep 0.2; exit 1");
        let v = verifier();

        let calls = (0..5).map(|_| {
            let v = v.clone();
            let dep = dep.clone();
            tokio::spawn(async move { v.ensure(&dep, &CallContext::new()).await })
        });
        for result in futures::future::join_all(calls).await {
            let err = result.unwrap().unwrap_err();
            assert!(matches!(err, Error::InstallFailed { .. }));
        }
        assert_eq!(runs(&counter), 1);
    }

    #[tokio::test]
    async fn test_install_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let dep = counting_dep(4, &counter, "; echo 'no such package' >&2; exit 1");
        let v = verifier();

        let err = v.ensure(&dep, &CallContext::new()).await.unwrap_err();
        match &err {
            Error::InstallFailed { dependency, reason } => {
                assert_eq!(dependency, "dep-4");
                assert!(reason.contains("no such package"));
            }
            other => panic!("expected install failure, got {other:?}"),
        }
        assert!(!v.is_satisfied(dep.id));

        v.ensure(&dep, &CallContext::new()).await.unwrap_err();
        assert_eq!(runs(&counter), 2);
    }

    #[tokio::test]
    async fn test_validation_failure_reruns_install() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let mut dep = (*counting_dep(5, &counter, "")).clone();
        dep.testcases = vec![testcase(&["echo", "hello"], "bye", MatchType::Exact)];
        let dep = Arc::new(dep);
        let v = verifier();

        let err = v.ensure(&dep, &CallContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
        assert!(err.to_string().contains("bye"));

        v.ensure(&dep, &CallContext::new()).await.unwrap_err();
        assert_eq!(runs(&counter), 2);
    }

    #[tokio::test]
    async fn test_testcases_match_combined_output() {
        let mut dep = Dependency::new("python", "true");
        dep.id = DependencyId::new(6);
        dep.testcases = vec![
            testcase(&["sh", "-c", "echo 'Python 3.12.1' >&2"], "Python 3.", MatchType::Prefix),
            testcase(&["echo", "ok"], "ok", MatchType::Exact),
        ];
        let dep = Arc::new(dep);
        let v = verifier();

        v.ensure(&dep, &CallContext::new()).await.unwrap();
        assert!(v.is_satisfied(dep.id));
    }

    #[tokio::test]
    async fn test_missing_testcase_binary_is_validation_failure() {
        let mut dep = Dependency::new("ghost", "");
        dep.id = DependencyId::new(7);
        dep.testcases = vec![testcase(&["ghost-binary-xyz", "--version"], "1", MatchType::Contains)];
        let err = verifier()
            .ensure(&Arc::new(dep), &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_abort_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let dep = counting_dep(8, &counter, "; sleep 0.3");
        let v = verifier();

        let err = v
            .ensure(&dep, &CallContext::with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        v.ensure(&dep, &CallContext::new()).await.unwrap();
        assert_eq!(runs(&counter), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reinstall() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let dep = counting_dep(9, &counter, "");
        let v = verifier();

        v.ensure(&dep, &CallContext::new()).await.unwrap();
        assert!(v.invalidate(dep.id));
        assert!(!v.is_satisfied(dep.id));
        v.ensure(&dep, &CallContext::new()).await.unwrap();
        assert_eq!(runs(&counter), 2);
    }

    #[tokio::test]
    async fn test_ensure_all_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let deps = vec![
            counting_dep(10, &first, "; exit 2"),
            counting_dep(11, &second, ""),
        ];
        let err = verifier()
            .ensure_all(&deps, &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstallFailed { .. }));
        assert_eq!(runs(&second), 0);
    }
}
