//! Serialized status/error write-back.
//!
//! The catalog's status fields are last-writer-wins, but two writers for the
//! same tool must never interleave. Each tool id gets its own async lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::tools::{ToolRepository, ToolStatus};
use crate::types::{Error, Result, ToolId};

pub struct StatusWriter {
    repo: Arc<dyn ToolRepository>,
    locks: Mutex<HashMap<ToolId, Arc<tokio::sync::Mutex<()>>>>,
}

impl StatusWriter {
    pub fn new(repo: Arc<dyn ToolRepository>) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: ToolId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    /// Write `status` and `error` for one tool.
    pub async fn write(&self, id: ToolId, status: ToolStatus, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        if status.is_healthy() && !error.is_empty() {
            return Err(Error::validation(format!(
                "status {:?} cannot carry an error",
                status
            )));
        }
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.repo.update_status(id, status, &error).await?;
        tracing::info!(tool_id = %id, status = ?status, error = %error, "tool status updated");
        Ok(())
    }
}

impl std::fmt::Debug for StatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWriter").finish_non_exhaustive()
    }
}
