//! Single-instance advisory lock.
//!
//! Exactly one control loop may run per host: a second instance finding the
//! lock held treats the first as authoritative and exits 0.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

const LOCK_FILE: &str = "wardend.lock";

/// Holds the flock for the lifetime of the process.
pub struct InstanceLock {
    _file: File,
}

pub enum LockOutcome {
    Acquired(InstanceLock),
    AlreadyHeld,
}

pub fn acquire(data_dir: &Path) -> Result<LockOutcome> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create '{}'", data_dir.display()))?;
    let path = data_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .with_context(|| format!("failed to open lock file '{}'", path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(LockOutcome::Acquired(InstanceLock { _file: file })),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(LockOutcome::AlreadyHeld),
        Err(err) => {
            Err(err).with_context(|| format!("failed to lock '{}'", path.display()))
        }
    }
}
