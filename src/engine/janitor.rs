//! Background pruning of calling logs.
//!
//! Every `interval`, each tool with a non-zero `log_retention` has its calling
//! logs older than that retention deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::interval;

use crate::tools::ToolRepository;
use crate::types::{JanitorConfig, Result};

/// Statistics from one pruning cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JanitorStats {
    /// Tools with a retention policy
    pub tools_scanned: usize,
    pub calls_pruned: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct CallLogJanitor {
    repo: Arc<dyn ToolRepository>,
    config: JanitorConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CallLogJanitor {
    pub fn new(repo: Arc<dyn ToolRepository>, config: JanitorConfig) -> Self {
        Self {
            repo,
            config,
            stop_tx: None,
        }
    }

    /// Start the pruning loop in the background.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let repo = self.repo.clone();
        let period = self.config.interval;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::run_cycle(repo.as_ref(), Utc::now()).await {
                            tracing::error!(error = %e, "call log pruning failed");
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("call log janitor stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single pruning cycle as of `now`.
    pub async fn run_cycle(repo: &dyn ToolRepository, now: DateTime<Utc>) -> Result<JanitorStats> {
        let mut stats = JanitorStats::default();

        for tool in repo.list_tools().await? {
            let retention = tool.meta().log_retention;
            if retention.is_zero() {
                continue;
            }
            let Ok(retention) = chrono::Duration::from_std(retention) else {
                tracing::warn!(tool = %tool.name(), "log retention out of range; skipping");
                continue;
            };
            stats.tools_scanned += 1;
            let cutoff = now - retention;
            stats.calls_pruned += repo.prune_calls(tool.id(), cutoff).await?;
        }

        tracing::debug!(
            tools = stats.tools_scanned,
            pruned = stats.calls_pruned,
            "call log pruning completed"
        );
        stats.completed_at = Some(Utc::now());
        Ok(stats)
    }
}

impl std::fmt::Debug for CallLogJanitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLogJanitor")
            .field("config", &self.config)
            .field("running", &self.stop_tx.is_some())
            .finish()
    }
}

impl Drop for CallLogJanitor {
    fn drop(&mut self) {
        self.stop();
    }
}
