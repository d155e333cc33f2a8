//! Background task queue for Bistro POS.
//!
//! Fire-and-forget execution for work triggered by user actions that
//! must not block the terminal (inventory write-offs, most of all).
//! Callers get a task id back immediately; per-task state moves
//! `pending -> running -> completed|failed` with timestamps and the
//! captured error text. Task state lives only in process memory —
//! durability across restarts belongs to the write-off pipeline's
//! persisted idempotency flag, not to this queue.

use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Lifecycle of one queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// In-memory record of a queued task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
}

/// Bounded-interval polling defaults.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Concurrency-safe registry of background tasks.
///
/// Cloning shares the registry; construct one per process and pass it
/// by reference. The registry is what makes fire-and-forget work
/// supervisable (the recovery sweep and tests both need to observe
/// task completion).
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<Mutex<Vec<TaskRecord>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a named unit of work and return its id immediately.
    ///
    /// The future runs on the tokio runtime; its `Err` text is captured
    /// on the task record. The caller never blocks on completion.
    pub fn enqueue<F>(&self, name: &str, work: F) -> String
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.enqueue_with_callbacks(name, work, |_| {}, |_, _| {})
    }

    /// Queue work with typed success/error callbacks, invoked after the
    /// task record is finalized.
    pub fn enqueue_with_callbacks<F, S, E>(
        &self,
        name: &str,
        work: F,
        on_success: S,
        on_error: E,
    ) -> String
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
        S: FnOnce(&str) + Send + 'static,
        E: FnOnce(&str, &str) + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            tasks.push(TaskRecord {
                id: task_id.clone(),
                name: name.to_string(),
                status: TaskStatus::Pending,
                started_at: None,
                finished_at: None,
                last_error: None,
            });
        }
        debug!(task_id = %task_id, name = %name, "Task queued");

        let registry = self.tasks.clone();
        let id = task_id.clone();
        let task_name = name.to_string();
        tokio::spawn(async move {
            set_status(&registry, &id, TaskStatus::Running, None);
            let result = work.await;
            match result {
                Ok(()) => {
                    set_status(&registry, &id, TaskStatus::Completed, None);
                    info!(task_id = %id, name = %task_name, "Task completed");
                    on_success(&id);
                }
                Err(message) => {
                    set_status(&registry, &id, TaskStatus::Failed, Some(message.clone()));
                    error!(task_id = %id, name = %task_name, error = %message, "Task failed");
                    on_error(&id, &message);
                }
            }
        });

        task_id
    }

    /// Snapshot a task's current record.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.iter().find(|t| t.id == task_id).cloned()
    }

    /// Snapshot of every tracked task.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// True while any task is pending or running.
    pub fn has_active_tasks(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
    }

    /// Poll until the task completes. Returns `true` only on
    /// completion; failure, an unknown id, and timeout all return
    /// `false` rather than hanging.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get(task_id) {
                None => return false,
                Some(task) => match task.status {
                    TaskStatus::Completed => return true,
                    TaskStatus::Failed => return false,
                    _ => {}
                },
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until every task has settled. Returns `true` when all
    /// settled tasks completed successfully within the timeout.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.has_active_tasks() {
                let tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                return !tasks.iter().any(|t| t.status == TaskStatus::Failed);
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Drop settled task records.
    pub fn clear_finished(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running));
    }
}

fn set_status(
    registry: &Arc<Mutex<Vec<TaskRecord>>>,
    task_id: &str,
    status: TaskStatus,
    error: Option<String>,
) {
    let mut tasks = registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
        let now = Utc::now().to_rfc3339();
        match status {
            TaskStatus::Running => task.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => task.finished_at = Some(now),
            TaskStatus::Pending => {}
        }
        task.status = status;
        if error.is_some() {
            task.last_error = error;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_enqueue_returns_immediately_and_completes() {
        let queue = TaskQueue::new();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();

        let task_id = queue.enqueue("slow work", async move {
            sleep(Duration::from_millis(20)).await;
            done_clone.store(true, Ordering::SeqCst);
            Ok(())
        });

        // Fire-and-forget: the work has not run synchronously.
        assert!(!done.load(Ordering::SeqCst));

        assert!(queue.wait_for_task(&task_id, Duration::from_secs(2)).await);
        assert!(done.load(Ordering::SeqCst));

        let record = queue.get(&task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_task_captures_error() {
        let queue = TaskQueue::new();
        let task_id = queue.enqueue("doomed", async { Err("ledger unavailable".to_string()) });

        assert!(!queue.wait_for_task(&task_id, Duration::from_secs(2)).await);
        let record = queue.get(&task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("ledger unavailable"));
    }

    #[tokio::test]
    async fn test_error_callback_fires() {
        let queue = TaskQueue::new();
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let s = successes.clone();
        let ok_id = queue.enqueue_with_callbacks(
            "fine",
            async { Ok(()) },
            move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            },
            |_, _| {},
        );
        let f = failures.clone();
        let bad_id = queue.enqueue_with_callbacks(
            "broken",
            async { Err("boom".to_string()) },
            |_| {},
            move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );

        queue.wait_for_task(&ok_id, Duration::from_secs(2)).await;
        queue.wait_for_task(&bad_id, Duration::from_secs(2)).await;
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_all_and_cleanup() {
        let queue = TaskQueue::new();
        for i in 0..5 {
            queue.enqueue(&format!("job {i}"), async move {
                sleep(Duration::from_millis(5 * i as u64)).await;
                Ok(())
            });
        }
        assert!(queue.wait_for_all(Duration::from_secs(2)).await);
        assert_eq!(queue.snapshot().len(), 5);
        queue.clear_finished();
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task_is_false() {
        let queue = TaskQueue::new();
        assert!(!queue.wait_for_task("no-such-task", Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_wait_for_all_reports_failures() {
        let queue = TaskQueue::new();
        queue.enqueue("good", async { Ok(()) });
        queue.enqueue("bad", async { Err("nope".to_string()) });
        assert!(!queue.wait_for_all(Duration::from_secs(2)).await);
    }
}
