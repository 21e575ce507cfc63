//! Supervised background commands.
//!
//! Everything the loop must not block on (session commands, queued tasks,
//! confirmed actions, deploy pipelines) runs as a detached process group
//! with combined output captured to a file. Spawning returns a handle; a
//! watcher task awaits the child and pushes a [`Completion`] onto the loop's
//! channel, which drains it on the next cycle. Termination is only ever a
//! forceful process-group kill, gated on start-ticks validation so a reused
//! pid is never signalled.

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::warn;
use warden_common::process::{read_proc_stat, validate_start_ticks};

pub type CompletionSender = mpsc::UnboundedSender<Completion>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Finished background work, delivered to the operator by the control loop.
#[derive(Debug)]
pub enum Completion {
    /// A shell-session background command finished.
    SessionJob {
        job_id: u64,
        exit: ExitSummary,
        output_path: PathBuf,
    },
    /// A queued task finished; its output file is attached, then the work
    /// dir is removed.
    Task {
        id: String,
        label: String,
        exit: ExitSummary,
        output_path: PathBuf,
        work_dir: PathBuf,
    },
    /// A confirmed destructive action finished.
    Action {
        label: String,
        exit: ExitSummary,
        output: String,
    },
    /// A deploy or rollback pipeline finished; summary text plus an
    /// optional log to upload.
    Release {
        project: String,
        summary: String,
        attachment: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitSummary {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(target_family = "unix")]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(target_family = "unix"))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit used when the process could not be spawned or awaited at all.
    pub fn spawn_failure() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit {}", code),
            (None, Some(sig)) => format!("killed by signal {}", sig),
            (None, None) => "failed to run".to_string(),
        }
    }
}

/// Identity of a spawned background command, enough to kill it safely.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: u64,
    pub pid: u32,
    pub start_ticks: u64,
    pub output_path: PathBuf,
}

/// A just-spawned job: the cloneable handle plus the owned child to await.
pub struct SpawnedJob {
    pub handle: JobHandle,
    child: Child,
}

impl SpawnedJob {
    /// Await the child and summarize how it exited.
    pub async fn wait(mut self) -> ExitSummary {
        match self.child.wait().await {
            Ok(status) => ExitSummary::from_status(status),
            Err(err) => {
                warn!(pid = self.handle.pid, "failed to await child: {}", err);
                ExitSummary::spawn_failure()
            }
        }
    }
}

/// Spawn `sh -c <command>` detached in `cwd`, output captured to `output_path`.
pub fn spawn_shell(command: &str, cwd: &Path, output_path: &Path) -> Result<SpawnedJob> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    spawn_inner(cmd, cwd, output_path)
}

/// Spawn `argv[0]` with fixed arguments, no shell in between.
pub fn spawn_argv(argv: &[String], cwd: &Path, output_path: &Path) -> Result<SpawnedJob> {
    let (program, args) = argv
        .split_first()
        .context("empty argv for background command")?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    spawn_inner(cmd, cwd, output_path)
}

fn spawn_inner(mut cmd: Command, cwd: &Path, output_path: &Path) -> Result<SpawnedJob> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create '{}'", parent.display()))?;
    }
    let stdout = std::fs::File::create(output_path)
        .with_context(|| format!("failed to create '{}'", output_path.display()))?;
    let stderr = stdout
        .try_clone()
        .context("failed to clone output handle")?;

    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(target_family = "unix")]
    cmd.process_group(0);

    let child = cmd.spawn().context("failed to spawn background command")?;
    let pid = child.id().context("spawned child has no pid")?;
    // Captured immediately so later kills can reject a reused pid.
    let start_ticks = read_proc_stat(pid).map(|stat| stat.starttime).unwrap_or(0);

    Ok(SpawnedJob {
        handle: JobHandle {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            start_ticks,
            output_path: output_path.to_path_buf(),
        },
        child,
    })
}

/// Is the job's recorded pid still the process we started?
pub fn job_alive(handle: &JobHandle) -> bool {
    validate_start_ticks(handle.pid, handle.start_ticks)
}

/// Force-kill a job's whole process group. Returns false when the job is
/// already gone, or its pid was reused and nothing may be signalled.
pub fn kill_group(handle: &JobHandle) -> bool {
    if !job_alive(handle) {
        return false;
    }
    match signal::killpg(Pid::from_raw(handle.pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(err) => {
            warn!(pid = handle.pid, "killpg failed: {}", err);
            false
        }
    }
}

/// SIGKILL a single operator-named pid (confirmed `/kill`).
pub fn kill_pid(pid: u32) -> Result<()> {
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .with_context(|| format!("failed to signal pid {}", pid))
}

/// Read captured output, stripping ANSI escapes; unreadable output becomes "".
pub async fn read_output(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode_and_strip(&bytes),
        Err(err) => {
            warn!("failed to read output '{}': {}", path.display(), err);
            String::new()
        }
    }
}

fn decode_and_strip(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    let decode = |data: &[u8]| String::from_utf8_lossy(data).to_string();

    if !bytes.contains(&b'\x1b') {
        return decode(bytes);
    }

    match strip_ansi_escapes::strip(bytes) {
        Ok(clean) => decode(&clean),
        Err(err) => {
            warn!(?err, "failed to strip ANSI escapes from output");
            decode(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn shell_command_output_is_captured() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.log");

        let job = spawn_shell("echo captured; echo err >&2", dir.path(), &out)?;
        let exit = job.wait().await;
        assert!(exit.success());

        let output = read_output(&out).await;
        assert!(output.contains("captured"));
        assert!(output.contains("err"));
        Ok(())
    }

    #[tokio::test]
    async fn argv_command_reports_exit_code() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.log");

        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let job = spawn_argv(&argv, dir.path(), &out)?;
        let exit = job.wait().await;
        assert_eq!(exit.code, Some(7));
        assert!(!exit.success());
        assert_eq!(exit.describe(), "exit 7");
        Ok(())
    }

    #[tokio::test]
    async fn kill_group_terminates_a_running_job() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.log");

        let job = spawn_shell("sleep 30", dir.path(), &out)?;
        let handle = job.handle.clone();
        assert!(job_alive(&handle));
        assert!(kill_group(&handle));

        let exit = job.wait().await;
        assert_eq!(exit.signal, Some(libc_sigkill()));
        assert!(!kill_group(&handle));
        Ok(())
    }

    fn libc_sigkill() -> i32 {
        Signal::SIGKILL as i32
    }

    #[test]
    fn ansi_escapes_are_stripped() {
        let input = b"\x1b[31mred\x1b[0m plain";
        assert_eq!(decode_and_strip(input), "red plain");
        assert_eq!(decode_and_strip(b"no escapes"), "no escapes");
        assert_eq!(decode_and_strip(b""), "");
    }
}
