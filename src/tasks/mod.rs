pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::DownloadError;

/// Task lifecycle: preparing -> downloading -> {completed | error}.
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Preparing,
    Downloading,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Downloading)
                | (Self::Preparing, Self::Error)
                | (Self::Downloading, Self::Completed)
                | (Self::Downloading, Self::Error)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl From<&DownloadError> for TaskErrorDetail {
    fn from(err: &DownloadError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retry_after: err.retry_after(),
            suggestions: err.suggestions(),
        }
    }
}

/// Where the finished bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Per-task temp area, streamed to the client, then removed.
    Direct,
    /// Durable downloads directory, fetched later by name.
    Staged,
}

/// The mutable unit of orchestration state. Owned exclusively by the
/// `TaskStore`; workers mutate it only through the store.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub status: TaskStatus,
    pub message: String,
    pub mode: DeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_format_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_format_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorDetail>,
    pub downloaded_files: Vec<String>,
    pub cancelled: bool,
    // Worker-internal bookkeeping, not part of the API projection.
    #[serde(skip)]
    pub format_spec: Option<String>,
    #[serde(skip)]
    pub remux: bool,
    #[serde(skip)]
    pub file_stem: Option<String>,
    #[serde(skip)]
    pub staging_dir: Option<PathBuf>,
}

/// What a new task starts from.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub url: String,
    pub mode: Option<DeliveryMode>,
    pub quality: Option<String>,
    pub video_format_id: Option<String>,
    pub audio_format_id: Option<String>,
}

/// In-memory task registry; the single source of truth for
/// orchestration state. Safe for concurrent workers and pollers, and
/// explicitly non-durable: records die with the process.
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self, new: NewTask) -> Task {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            url: new.url,
            status: TaskStatus::Preparing,
            message: "Download started".to_string(),
            mode: new.mode.unwrap_or(DeliveryMode::Staged),
            quality: new.quality,
            video_format_id: new.video_format_id,
            audio_format_id: new.audio_format_id,
            title: None,
            safe_title: None,
            file_extension: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            downloaded_files: Vec::new(),
            cancelled: false,
            format_spec: None,
            remux: false,
            file_stem: None,
            staging_dir: None,
        };
        self.tasks.write().insert(task.id.clone(), task.clone());
        task
    }

    pub fn get(&self, id: &str) -> Result<Task, DownloadError> {
        self.tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound(format!("task {}", id)))
    }

    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Apply a mutation atomically. Terminal tasks reject all mutation;
    /// hitting that is a logic error upstream, not a user failure.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<(), DownloadError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| DownloadError::NotFound(format!("task {}", id)))?;
        if task.status.is_terminal() {
            return Err(DownloadError::Conflict(format!(
                "task {} is already {:?}",
                id, task.status
            )));
        }
        mutate(task);
        Ok(())
    }

    fn transition(&self, id: &str, next: TaskStatus, message: String) -> Result<(), DownloadError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| DownloadError::NotFound(format!("task {}", id)))?;
        if !task.status.can_transition_to(next) {
            return Err(DownloadError::Conflict(format!(
                "task {} cannot move {:?} -> {:?}",
                id, task.status, next
            )));
        }
        task.status = next;
        task.message = message;
        match next {
            TaskStatus::Downloading => task.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Error => task.completed_at = Some(Utc::now()),
            TaskStatus::Preparing => {}
        }
        Ok(())
    }

    pub fn mark_downloading(&self, id: &str, message: &str) -> Result<(), DownloadError> {
        self.transition(id, TaskStatus::Downloading, message.to_string())
    }

    pub fn complete(&self, id: &str, files: Vec<String>, message: &str) -> Result<(), DownloadError> {
        self.update(id, |task| task.downloaded_files = files)?;
        self.transition(id, TaskStatus::Completed, message.to_string())
    }

    pub fn fail(&self, id: &str, error: &DownloadError) -> Result<(), DownloadError> {
        let detail = TaskErrorDetail::from(error);
        let message = format!("Failed to download: {}", error);
        self.update(id, |task| task.error = Some(detail))?;
        self.transition(id, TaskStatus::Error, message)
    }

    /// Cooperative cancellation: flips the flag; the worker notices at
    /// its next checkpoint.
    pub fn request_cancel(&self, id: &str) -> Result<(), DownloadError> {
        self.update(id, |task| {
            task.cancelled = true;
            task.message = "Cancellation requested".to_string();
        })
    }

    pub fn cancel_requested(&self, id: &str) -> bool {
        self.tasks
            .read()
            .get(id)
            .map(|t| t.cancelled)
            .unwrap_or(false)
    }

    /// (running, total) for diagnostics.
    pub fn counts(&self) -> (usize, usize) {
        let tasks = self.tasks.read();
        let running = tasks.values().filter(|t| !t.status.is_terminal()).count();
        (running, tasks.len())
    }

    /// Drop terminal records older than `ttl`, then enforce `capacity`
    /// by evicting the oldest terminal records. Running tasks are never
    /// evicted. Returns the evicted tasks so the caller can clean up
    /// any staging directories they still own.
    pub fn evict(&self, ttl: Duration, capacity: usize) -> Vec<Task> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut tasks = self.tasks.write();

        let mut evicted: Vec<Task> = Vec::new();
        let expired: Vec<String> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .filter(|t| t.completed_at.map_or(false, |done| now - done > ttl))
            .map(|t| t.id.clone())
            .collect();
        for id in expired {
            if let Some(task) = tasks.remove(&id) {
                evicted.push(task);
            }
        }

        if tasks.len() > capacity {
            let mut terminal: Vec<(String, DateTime<Utc>)> = tasks
                .values()
                .filter(|t| t.status.is_terminal())
                .map(|t| (t.id.clone(), t.created_at))
                .collect();
            terminal.sort_by_key(|(_, created)| *created);
            let overflow = tasks.len() - capacity;
            for (id, _) in terminal.into_iter().take(overflow) {
                if let Some(task) = tasks.remove(&id) {
                    evicted.push(task);
                }
            }
        }

        if !evicted.is_empty() {
            log::debug!("Evicted {} finished tasks", evicted.len());
        }
        evicted
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(url: &str) -> NewTask {
        NewTask {
            url: url.to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = TaskStore::new();
        let task = store.create(staged("https://example.com/v"));
        let fetched = store.get(&task.id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Preparing);
        assert_eq!(fetched.url, "https://example.com/v");
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let store = TaskStore::new();
        let err = store.get("nope").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_status_sequence_is_monotonic() {
        let store = TaskStore::new();
        let task = store.create(staged("u"));

        store.mark_downloading(&task.id, "transferring").unwrap();
        store
            .complete(&task.id, vec!["out.mp4".to_string()], "done")
            .unwrap();

        let done = store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        // No edge leads out of a terminal state.
        assert!(store.mark_downloading(&task.id, "again").is_err());
    }

    #[test]
    fn test_cannot_complete_from_preparing() {
        let store = TaskStore::new();
        let task = store.create(staged("u"));
        let err = store.complete(&task.id, vec![], "done").unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_terminal_tasks_reject_mutation() {
        let store = TaskStore::new();
        let task = store.create(staged("u"));
        store.mark_downloading(&task.id, "transferring").unwrap();
        store.fail(&task.id, &DownloadError::Cancelled).unwrap();

        let err = store
            .update(&task.id, |t| t.message = "sneaky".to_string())
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        assert!(store.request_cancel(&task.id).is_err());
    }

    #[test]
    fn test_terminal_poll_is_idempotent() {
        let store = TaskStore::new();
        let task = store.create(staged("u"));
        store.mark_downloading(&task.id, "transferring").unwrap();
        store
            .fail(&task.id, &DownloadError::UpstreamThrottled { retry_after: 30 })
            .unwrap();

        let first = serde_json::to_value(store.get(&task.id).unwrap()).unwrap();
        let second = serde_json::to_value(store.get(&task.id).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first["error"]["kind"], "upstream_throttled");
        assert_eq!(first["error"]["retry_after"], 30);
    }

    #[test]
    fn test_cancel_flag_roundtrip() {
        let store = TaskStore::new();
        let task = store.create(staged("u"));
        assert!(!store.cancel_requested(&task.id));
        store.request_cancel(&task.id).unwrap();
        assert!(store.cancel_requested(&task.id));
    }

    #[test]
    fn test_eviction_by_age_spares_running_tasks() {
        let store = TaskStore::new();
        let done = store.create(staged("a"));
        store.mark_downloading(&done.id, "t").unwrap();
        store.complete(&done.id, vec![], "done").unwrap();
        // Backdate completion past the TTL.
        {
            let mut tasks = store.tasks.write();
            tasks.get_mut(&done.id).unwrap().completed_at =
                Some(Utc::now() - chrono::Duration::seconds(7200));
        }
        let running = store.create(staged("b"));

        let evicted = store.evict(Duration::from_secs(3600), 256);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, done.id);
        assert!(store.get(&running.id).is_ok());
        assert_eq!(store.get(&done.id).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_eviction_by_capacity() {
        let store = TaskStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let task = store.create(staged(&format!("u{}", i)));
            store.mark_downloading(&task.id, "t").unwrap();
            store.complete(&task.id, vec![], "done").unwrap();
            ids.push(task.id);
        }
        let evicted = store.evict(Duration::from_secs(3600), 3);
        assert_eq!(evicted.len(), 2);
        let (_, total) = store.counts();
        assert_eq!(total, 3);
    }
}
