//! Progress tracking for long-running calls.
//!
//! Each record lives from `start` until `complete` or `cancel` and owns a
//! cancellation scope derived from the caller's. Updates are pushed to a sink
//! which the server turns into `notifications/progress`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    errors::{MCPError, MCPResult},
    protocol::ProgressToken,
};

/// `notifications/progress` params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotification {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

/// Receives every progress update. Must not block.
pub type ProgressSink = Arc<dyn Fn(ProgressNotification) + Send + Sync>;

/// Snapshot of one tracked operation
#[derive(Debug, Clone)]
pub struct TrackedProgress {
    pub token: ProgressToken,
    /// Fraction complete, within `[0, 1]`
    pub progress: f64,
    pub total: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Scope cancelled when the record is cancelled or replaced
    pub cancel: CancellationToken,
}

/// Registry of in-flight progress records
pub struct ProgressTracker {
    records: RwLock<HashMap<ProgressToken, TrackedProgress>>,
    sink: Option<ProgressSink>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sink: None,
        }
    }

    /// Tracker that forwards every update and completion to `sink`
    pub fn with_sink(sink: ProgressSink) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Begin tracking `token` under a child scope of `parent`.
    ///
    /// A record already using the token is cancelled and replaced.
    pub fn start(&self, parent: &CancellationToken, token: ProgressToken) -> CancellationToken {
        let cancel = parent.child_token();
        let now = Utc::now();
        let record = TrackedProgress {
            token: token.clone(),
            progress: 0.0,
            total: None,
            started_at: now,
            updated_at: now,
            cancel: cancel.clone(),
        };

        let previous = self.records.write().insert(token.clone(), record);
        if let Some(previous) = previous {
            debug!("Replacing progress record {}", token);
            previous.cancel.cancel();
        }
        debug!("Progress {} started", token);
        cancel
    }

    /// Record new progress and notify the sink
    pub fn update(&self, token: &ProgressToken, progress: f64, total: Option<f64>) -> MCPResult<()> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(MCPError::invalid_params(format!(
                "Progress must lie in [0, 1], got {}",
                progress
            )));
        }

        {
            let mut records = self.records.write();
            let record = records
                .get_mut(token)
                .ok_or_else(|| unknown_token(token))?;
            record.progress = progress;
            if total.is_some() {
                record.total = total;
            }
            record.updated_at = Utc::now();
        }

        self.emit(ProgressNotification {
            progress_token: token.clone(),
            progress,
            total,
        });
        Ok(())
    }

    /// Force progress to 1.0, notify, and stop tracking
    pub fn complete(&self, token: &ProgressToken) -> MCPResult<()> {
        let record = self
            .records
            .write()
            .remove(token)
            .ok_or_else(|| unknown_token(token))?;

        debug!("Progress {} completed", token);
        self.emit(ProgressNotification {
            progress_token: record.token,
            progress: 1.0,
            total: record.total,
        });
        Ok(())
    }

    /// Cancel the record's scope and stop tracking; no notification is sent
    pub fn cancel(&self, token: &ProgressToken) -> MCPResult<()> {
        let record = self
            .records
            .write()
            .remove(token)
            .ok_or_else(|| unknown_token(token))?;

        debug!("Progress {} cancelled", token);
        record.cancel.cancel();
        Ok(())
    }

    /// Copy of a live record; completed or cancelled tokens are unknown
    pub fn get(&self, token: &ProgressToken) -> MCPResult<TrackedProgress> {
        self.records
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| unknown_token(token))
    }

    pub fn list(&self) -> Vec<TrackedProgress> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn emit(&self, notification: ProgressNotification) {
        if let Some(sink) = &self.sink {
            sink(notification);
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_token(token: &ProgressToken) -> MCPError {
    MCPError::invalid_request(format!("Unknown progress token '{}'", token))
}

/// Handle given to a tool handler for reporting on its own call
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    token: ProgressToken,
}

impl ProgressReporter {
    pub fn new(tracker: Arc<ProgressTracker>, token: ProgressToken) -> Self {
        Self { tracker, token }
    }

    pub fn token(&self) -> &ProgressToken {
        &self.token
    }

    pub fn report(&self, progress: f64, total: Option<f64>) -> MCPResult<()> {
        self.tracker.update(&self.token, progress, total)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("token", &self.token)
            .finish()
    }
}
