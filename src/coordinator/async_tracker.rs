//! Async request tracking
//!
//! Callers that pass an async id get an immediate answer and poll the
//! outcome here later. One entry per async id; an entry only moves out of
//! `Running` once. Past the retention limit the oldest finished entries are
//! evicted; running entries are never evicted.

use crate::common::{Error, ErrorKind, Result};
use crate::coordinator::dispatcher::OperationResults;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncState {
    Running,
    Completed,
    Failed,
}

/// Status record of one async request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncStatus {
    pub async_id: String,
    pub operation: String,
    pub state: AsyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub results: OperationResults,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub submitted_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
}

const DEFAULT_RETENTION: usize = 1_000;

pub struct AsyncTracker {
    entries: Mutex<HashMap<String, AsyncStatus>>,
    retention: usize,
}

impl Default for AsyncTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl AsyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    /// Register a new running request; an id may only be in use once
    pub fn submit(&self, async_id: &str, operation: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(async_id) {
            return Err(Error::BadRequest(format!(
                "Task with the same requestid already exists: {}",
                async_id
            )));
        }
        if entries.len() >= self.retention {
            let excess = entries.len() + 1 - self.retention;
            evict_finished(&mut entries, excess);
        }
        entries.insert(
            async_id.to_string(),
            AsyncStatus {
                async_id: async_id.to_string(),
                operation: operation.to_string(),
                state: AsyncState::Running,
                message: None,
                error_kind: None,
                results: OperationResults::default(),
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(())
    }

    /// Record the outcome; ignored for unknown or already finished ids
    pub fn finish(&self, async_id: &str, results: OperationResults, error: Option<&Error>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(async_id) else {
            return;
        };
        if entry.state != AsyncState::Running {
            return;
        }
        entry.results = results;
        entry.finished_at = Some(Utc::now());
        match error {
            None => entry.state = AsyncState::Completed,
            Some(e) => {
                entry.state = AsyncState::Failed;
                entry.message = Some(e.to_string());
                entry.error_kind = Some(e.kind());
            }
        }
        tracing::info!(async_id, state = ?entry.state, "async request finished");
    }

    pub fn get(&self, async_id: &str) -> Option<AsyncStatus> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(async_id)
            .cloned()
    }

    pub fn remove(&self, async_id: &str) -> Option<AsyncStatus> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(async_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop up to `count` finished entries, oldest first
fn evict_finished(entries: &mut HashMap<String, AsyncStatus>, count: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = entries
        .values()
        .filter_map(|e| e.finished_at.map(|at| (at, e.async_id.clone())))
        .collect();
    finished.sort();
    for (_, async_id) in finished.into_iter().take(count) {
        entries.remove(&async_id);
        tracing::debug!(async_id, "evicted finished async status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_rejected() {
        let tracker = AsyncTracker::new();
        tracker.submit("job-1", "add_replica").unwrap();
        assert!(matches!(
            tracker.submit("job-1", "add_replica"),
            Err(Error::BadRequest(_))
        ));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_finish_only_once() {
        let tracker = AsyncTracker::new();
        tracker.submit("job-1", "add_replica").unwrap();

        let mut results = OperationResults::default();
        results.record_failure("n1", "disk full");
        tracker.finish("job-1", results, Some(&Error::Internal("disk full".into())));
        tracker.finish("job-1", OperationResults::default(), None);

        let status = tracker.get("job-1").unwrap();
        assert_eq!(status.state, AsyncState::Failed);
        assert_eq!(status.error_kind, Some(ErrorKind::ServerError));
        assert_eq!(status.results.failure["n1"], "disk full");
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn test_status_json_and_remove() {
        let tracker = AsyncTracker::new();
        tracker.submit("job-2", "add_replica").unwrap();
        tracker.finish("job-2", OperationResults::default(), None);

        let json = serde_json::to_value(tracker.get("job-2").unwrap()).unwrap();
        assert_eq!(json["state"], "completed");
        assert!(json.get("message").is_none());

        assert!(tracker.remove("job-2").is_some());
        assert!(tracker.is_empty());
        tracker.finish("job-2", OperationResults::default(), None);
        assert!(tracker.get("job-2").is_none());
    }

    #[test]
    fn test_retention_evicts_oldest_finished_only() {
        let tracker = AsyncTracker::with_retention(2);
        tracker.submit("old", "add_replica").unwrap();
        tracker.submit("running", "add_replica").unwrap();
        tracker.finish("old", OperationResults::default(), None);

        tracker.submit("new", "add_replica").unwrap();
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("running").is_some());
        assert!(tracker.get("new").is_some());

        // nothing finished: running entries stay even past the limit
        tracker.submit("newer", "add_replica").unwrap();
        assert_eq!(tracker.len(), 3);
    }
}
