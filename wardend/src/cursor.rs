//! Offset tracker: the last fully-processed update id, persisted across restarts.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;
use warden_common::fs::{atomic_write, read_trimmed};

const OFFSET_FILE: &str = "offset";

pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(OFFSET_FILE),
        }
    }

    /// Highest update id already dispatched; 0 before the first message.
    pub fn load(&self) -> Result<i64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = read_trimmed(&self.path)?;
        raw.parse::<i64>()
            .with_context(|| format!("corrupt offset file '{}': '{}'", self.path.display(), raw))
    }

    /// Like `load`, but a corrupt file degrades to 0 instead of aborting the
    /// loop (duplicate delivery is tolerated, silent skipping is not).
    pub fn load_or_zero(&self) -> i64 {
        match self.load() {
            Ok(value) => value,
            Err(err) => {
                warn!("offset unreadable, restarting from 0: {:#}", err);
                0
            }
        }
    }

    /// Persist after a message has been dispatched, success or failure.
    pub fn save(&self, update_id: i64) -> Result<()> {
        atomic_write(&self.path, format!("{}\n", update_id).as_bytes())
    }
}
