//! Bounded fire-and-forget task queue.
//!
//! Each task gets an isolated working directory and a status file; a
//! semaphore caps how many run at once, so a burst of enqueues queues
//! instead of forking without bound. Output is captured per task and the
//! whole directory is removed once the result has been delivered; nothing
//! accumulates on disk after completion.

use crate::supervise::{self, Completion, CompletionSender, ExitSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;
use uuid::Uuid;
use warden_common::fs::atomic_write;

const TASKS_DIR: &str = "tasks";
const STATUS_FILE: &str = "task.json";
const OUTPUT_FILE: &str = "output.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub label: String,
    pub command: String,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

pub struct TaskQueue {
    root: PathBuf,
    permits: Arc<Semaphore>,
    tx: CompletionSender,
}

impl TaskQueue {
    pub fn new(data_dir: &Path, max_concurrent: usize, tx: CompletionSender) -> Self {
        Self {
            root: data_dir.join(TASKS_DIR),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tx,
        }
    }

    /// Register a task and hand it to the runner. Returns immediately with
    /// the task id; the command starts once a permit frees up.
    pub fn enqueue(&self, label: &str, command: &str) -> Result<String> {
        let id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let work_dir = self.root.join(&id);
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("failed to create task dir '{}'", work_dir.display()))?;

        let record = TaskRecord {
            id: id.clone(),
            label: label.to_string(),
            command: command.to_string(),
            status: TaskStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
        };
        write_record(&work_dir, &record)?;

        let permits = self.permits.clone();
        let tx = self.tx.clone();
        tokio::spawn(run_task(record, work_dir, permits, tx));

        Ok(id)
    }

    /// Remove a delivered task's working directory.
    pub fn cleanup(work_dir: &Path) {
        if let Err(err) = std::fs::remove_dir_all(work_dir) {
            warn!("failed to remove task dir '{}': {}", work_dir.display(), err);
        }
    }
}

async fn run_task(
    mut record: TaskRecord,
    work_dir: PathBuf,
    permits: Arc<Semaphore>,
    tx: CompletionSender,
) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    record.status = TaskStatus::Running;
    record.started_at = Some(Utc::now());
    if let Err(err) = write_record(&work_dir, &record) {
        warn!(id = %record.id, "failed to update task status: {:#}", err);
    }

    let output_path = work_dir.join(OUTPUT_FILE);
    let exit = match supervise::spawn_shell(&record.command, &work_dir, &output_path) {
        Ok(job) => job.wait().await,
        Err(err) => {
            let _ = std::fs::write(&output_path, format!("{:#}\n", err));
            ExitSummary::spawn_failure()
        }
    };

    record.status = TaskStatus::Done;
    if let Err(err) = write_record(&work_dir, &record) {
        warn!(id = %record.id, "failed to update task status: {:#}", err);
    }

    let _ = tx.send(Completion::Task {
        id: record.id,
        label: record.label,
        exit,
        output_path,
        work_dir,
    });
}

fn write_record(work_dir: &Path, record: &TaskRecord) -> Result<()> {
    atomic_write(
        &work_dir.join(STATUS_FILE),
        &serde_json::to_vec_pretty(record)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn read_record(work_dir: &Path) -> TaskRecord {
        let raw = std::fs::read_to_string(work_dir.join(STATUS_FILE)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn task_runs_and_work_dir_is_removable() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(dir.path(), 2, tx);

        let id = queue.enqueue("backup", "echo ok").unwrap();

        let completion = rx.recv().await.expect("task completion");
        match completion {
            Completion::Task {
                id: done_id,
                label,
                exit,
                output_path,
                work_dir,
            } => {
                assert_eq!(done_id, id);
                assert_eq!(label, "backup");
                assert!(exit.success());

                let output = std::fs::read_to_string(&output_path).unwrap();
                assert!(output.contains("ok"));
                assert_eq!(read_record(&work_dir).status, TaskStatus::Done);

                TaskQueue::cleanup(&work_dir);
                assert!(!work_dir.exists());
            }
            other => panic!("expected Task completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_permit_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(dir.path(), 1, tx);

        // With one permit the slow task must finish before the fast one starts.
        queue.enqueue("slow", "sleep 1; echo slow").unwrap();
        queue.enqueue("fast", "echo fast").unwrap();

        let first = rx.recv().await.expect("first completion");
        let second = rx.recv().await.expect("second completion");

        let label_of = |completion: &Completion| match completion {
            Completion::Task { label, .. } => label.clone(),
            other => panic!("expected Task completion, got {:?}", other),
        };
        assert_eq!(label_of(&first), "slow");
        assert_eq!(label_of(&second), "fast");
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(dir.path(), 2, tx);

        queue.enqueue("broken", "echo bad >&2; exit 3").unwrap();

        match rx.recv().await.expect("completion") {
            Completion::Task {
                exit, output_path, ..
            } => {
                assert_eq!(exit.code, Some(3));
                let output = std::fs::read_to_string(&output_path).unwrap();
                assert!(output.contains("bad"));
            }
            other => panic!("expected Task completion, got {:?}", other),
        }
    }
}
