//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and carry
//! enough structured detail (captured output, exit code, elapsed time) for the
//! caller to act on.

use std::time::Duration;
use thiserror::Error;

use crate::engine::executor::CommandOutput;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the tool hub engine.
#[derive(Error, Debug)]
pub enum Error {
    /// The process could not be started. Never retried automatically.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process outlived its deadline and was terminated.
    #[error("timed out after {elapsed:?}")]
    Timeout {
        elapsed: Duration,
        /// Output collected before termination.
        partial: Box<CommandOutput>,
    },

    /// The process exited with a non-zero code (or was killed by a signal).
    #[error("process exited with {}", describe_exit(.output.exit_code))]
    NonZeroExit { output: Box<CommandOutput> },

    /// A dependency's install command failed.
    #[error("install failed for dependency '{dependency}': {reason}")]
    InstallFailed { dependency: String, reason: String },

    /// A testcase (dependency or tool) did not match its expectation.
    #[error("validation failed for '{subject}': {reason}")]
    ValidationFailed { subject: String, reason: String },

    /// Caller-initiated cancellation or caller deadline.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Bad tool configuration (unknown match strategy, dangling group reference, empty command).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A service exited during its startup grace window.
    #[error("service '{tool}' exited during startup with {}", describe_exit(.output.exit_code))]
    ServiceExited {
        tool: String,
        output: Box<CommandOutput>,
    },

    /// Invalid catalog write or invocation input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid service state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

// Convenience constructors
impl Error {
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn install_failed(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InstallFailed {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    pub fn validation_failed(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used for call logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Spawn { .. } => "spawn_error",
            Error::Timeout { .. } => "timeout",
            Error::NonZeroExit { .. } => "non_zero_exit",
            Error::InstallFailed { .. } => "install_failed",
            Error::ValidationFailed { .. } => "validation_failed",
            Error::Cancelled(_) => "cancelled",
            Error::Configuration(_) => "configuration_error",
            Error::ServiceExited { .. } => "service_exited",
            Error::Validation(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::StateTransition(_) => "state_transition",
            Error::Internal(_) => "internal",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }

    /// Captured process output attached to this error, if any.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            Error::Timeout { partial, .. } => Some(partial),
            Error::NonZeroExit { output } | Error::ServiceExited { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_message_includes_code() {
        let err = Error::NonZeroExit {
            output: Box::new(CommandOutput {
                exit_code: Some(3),
                ..CommandOutput::default()
            }),
        };
        assert_eq!(err.to_string(), "process exited with code 3");
        assert_eq!(err.kind(), "non_zero_exit");
        assert_eq!(err.output().and_then(|o| o.exit_code), Some(3));
    }

    #[test]
    fn test_signal_exit_message() {
        let err = Error::NonZeroExit {
            output: Box::new(CommandOutput::default()),
        };
        assert_eq!(err.to_string(), "process exited with a signal");
    }

    #[test]
    fn test_constructors_map_to_kinds() {
        assert_eq!(Error::cancelled("x").kind(), "cancelled");
        assert_eq!(Error::configuration("x").kind(), "configuration_error");
        assert_eq!(Error::install_failed("py", "exit 1").kind(), "install_failed");
        assert!(Error::validation_failed("py", "mismatch")
            .to_string()
            .contains("'py'"));
        assert!(Error::not_found("tool 1").output().is_none());
    }
}
