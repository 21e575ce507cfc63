//! Persistent interactive shell session.
//!
//! At most one session per host. The session is a logical working directory
//! plus, at most, one live background command: `cd` mutates the directory
//! string, every other input is spawned detached in it. A session start
//! force-kills whatever the previous session left running.

use crate::errors::{validation, CommandError};
use crate::supervise::{self, JobHandle, SpawnedJob};
use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::info;

const OUTPUT_DIR: &str = "session";

pub struct ShellSession {
    pub cwd: PathBuf,
    pub job: Option<JobHandle>,
}

/// What `execute` decided to do with an input line.
pub enum ExecOutcome {
    /// The previous command is still running; nothing was spawned.
    Busy { pid: u32 },
    Spawned(SpawnedJob),
}

pub struct SessionManager {
    home: PathBuf,
    output_dir: PathBuf,
    session: Option<ShellSession>,
}

impl SessionManager {
    pub fn new(data_dir: &Path, home: PathBuf) -> Self {
        Self {
            home,
            output_dir: data_dir.join(OUTPUT_DIR),
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.cwd.as_path())
    }

    /// Open a fresh session. Any previous session's background command is
    /// killed before the new one accepts input.
    pub fn start(&mut self) -> bool {
        let killed_previous = self.kill_current_job();
        self.session = Some(ShellSession {
            cwd: self.home.clone(),
            job: None,
        });
        info!(killed_previous, "shell session started");
        killed_previous
    }

    /// Tear the session down. Returns whether one was active.
    pub fn stop(&mut self) -> bool {
        let was_active = self.session.is_some();
        self.kill_current_job();
        self.session = None;
        was_active
    }

    fn kill_current_job(&mut self) -> bool {
        match self.session.as_mut().and_then(|s| s.job.take()) {
            Some(job) => supervise::kill_group(&job),
            None => false,
        }
    }

    /// Logical `cd`: no argument goes home, anything else must name an
    /// existing directory (relative paths resolve against the session cwd).
    pub fn change_dir(&mut self, arg: Option<&str>) -> Result<PathBuf, CommandError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| validation("no active shell session"))?;

        let target = match arg {
            None => self.home.clone(),
            Some(path) => {
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    candidate
                } else {
                    session.cwd.join(candidate)
                }
            }
        };

        let resolved = std::fs::canonicalize(&target)
            .map_err(|_| validation(format!("no such directory: {}", target.display())))?;
        if !resolved.is_dir() {
            return Err(validation(format!("not a directory: {}", resolved.display())));
        }

        session.cwd = resolved.clone();
        Ok(resolved)
    }

    /// Spawn `command` detached in the session cwd, unless a previous
    /// command is still alive.
    pub fn execute(&mut self, command: &str) -> Result<ExecOutcome, CommandError> {
        let output_dir = self.output_dir.clone();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| validation("no active shell session"))?;

        if let Some(job) = &session.job {
            if supervise::job_alive(job) {
                return Ok(ExecOutcome::Busy { pid: job.pid });
            }
            // Dead but not yet drained; the slot is free again.
            session.job = None;
        }

        let output_path =
            output_dir.join(format!("job-{}.log", Utc::now().format("%Y%m%d%H%M%S%6f")));
        let job = supervise::spawn_shell(command, &session.cwd, &output_path)
            .map_err(CommandError::Other)?;
        session.job = Some(job.handle.clone());
        Ok(ExecOutcome::Spawned(job))
    }

    /// Clear the job slot once its completion has been delivered.
    pub fn job_finished(&mut self, job_id: u64) {
        if let Some(session) = self.session.as_mut() {
            if session.job.as_ref().map(|j| j.id) == Some(job_id) {
                session.job = None;
            }
        }
    }

    /// Where inbound file transfers land: the session cwd, or home when no
    /// session is open.
    pub fn download_dir(&self) -> &Path {
        self.cwd().unwrap_or(&self.home)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::new(dir.path(), dir.path().to_path_buf())
    }

    #[test]
    fn start_and_stop_transition_state() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);

        assert!(!mgr.is_active());
        mgr.start();
        assert!(mgr.is_active());
        assert_eq!(mgr.cwd(), Some(dir.path()));
        assert!(mgr.stop());
        assert!(!mgr.is_active());
        assert!(!mgr.stop());
    }

    #[test]
    fn change_dir_resolves_and_validates() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();

        let mut mgr = manager(&dir);
        mgr.start();

        let resolved = mgr.change_dir(Some("sub")).unwrap();
        assert!(resolved.ends_with("sub"));

        // Bare cd goes home.
        let home = mgr.change_dir(None).unwrap();
        assert_eq!(home, dir.path().canonicalize().unwrap());

        assert!(matches!(
            mgr.change_dir(Some("missing")),
            Err(CommandError::Validation(_))
        ));
        assert!(matches!(
            mgr.change_dir(Some("file")),
            Err(CommandError::Validation(_))
        ));
    }

    #[test]
    fn change_dir_without_session_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        assert!(matches!(
            mgr.change_dir(Some("/")),
            Err(CommandError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn second_command_is_refused_while_busy() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        mgr.start();

        let spawned = match mgr.execute("sleep 30").unwrap() {
            ExecOutcome::Spawned(job) => job,
            ExecOutcome::Busy { .. } => panic!("fresh session cannot be busy"),
        };
        let pid = spawned.handle.pid;

        match mgr.execute("echo blocked").unwrap() {
            ExecOutcome::Busy { pid: busy_pid } => assert_eq!(busy_pid, pid),
            ExecOutcome::Spawned(_) => panic!("busy session accepted a command"),
        }

        // Cleanup.
        assert!(mgr.stop());
        spawned.wait().await;
    }

    #[tokio::test]
    async fn restarting_kills_the_previous_job() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        mgr.start();

        let spawned = match mgr.execute("sleep 30").unwrap() {
            ExecOutcome::Spawned(job) => job,
            ExecOutcome::Busy { .. } => panic!("fresh session cannot be busy"),
        };

        // A new session must terminate the old session's background job.
        assert!(mgr.start());
        let exit = spawned.wait().await;
        assert!(!exit.success());

        match mgr.execute("echo free").unwrap() {
            ExecOutcome::Spawned(job) => {
                job.wait().await;
            }
            ExecOutcome::Busy { .. } => panic!("new session inherited busy state"),
        }
    }
}
