//! Two-phase confirmation for destructive actions.
//!
//! A handler that wants confirmation stores a typed [`PendingAction`] under a
//! random 8-byte hex code and tells the operator to echo it back. Tokens are
//! single-use and time-limited: expiry is enforced at read time, and a sweep
//! deletes anything past the garbage-collection window even if never consumed.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use warden_common::fs::atomic_write;

/// Accept window, enforced when the code is echoed back.
pub const TOKEN_TTL_SECS: i64 = 900;
/// Sweep window: unconsumed tokens older than this are deleted.
const SWEEP_AFTER_SECS: i64 = 1200;

const CONFIRM_DIR: &str = "confirm";

/// The destructive operations that require a confirmation round-trip.
///
/// Stored as a tagged enum, not a command string: nothing the operator types
/// is ever re-executed verbatim at confirmation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAction {
    Reboot,
    Kill { pid: u32 },
    DeleteUser { name: String },
    Rollback { project: String, release: String },
}

impl PendingAction {
    pub fn describe(&self) -> String {
        match self {
            PendingAction::Reboot => "reboot the host".to_string(),
            PendingAction::Kill { pid } => format!("kill pid {}", pid),
            PendingAction::DeleteUser { name } => format!("delete user '{}'", name),
            PendingAction::Rollback { project, release } => {
                format!("roll back '{}' to release {}", project, release)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    code: String,
    issued_at: DateTime<Utc>,
    /// base64 of the serialized action: opaque on disk, typed in memory.
    action: String,
}

/// Result of echoing a code back.
#[derive(Debug)]
pub enum ConfirmOutcome {
    Confirmed(PendingAction),
    Invalid,
    Expired,
}

pub struct ConfirmStore {
    dir: PathBuf,
}

impl ConfirmStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(CONFIRM_DIR),
        }
    }

    /// Persist `action` under a fresh code and return the code.
    pub fn create(&self, action: &PendingAction) -> Result<String> {
        let mut raw = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut raw);
        let code = hex::encode(raw);

        let encoded = general_purpose::STANDARD.encode(serde_json::to_vec(action)?);
        let record = TokenRecord {
            code: code.clone(),
            issued_at: Utc::now(),
            action: encoded,
        };
        atomic_write(&self.token_path(&code), &serde_json::to_vec_pretty(&record)?)?;
        Ok(code)
    }

    /// Consume a code. The token file is deleted on every terminal outcome,
    /// so a second call with the same code is always `Invalid`.
    pub fn execute(&self, code: &str) -> Result<ConfirmOutcome> {
        if !is_valid_code(code) {
            return Ok(ConfirmOutcome::Invalid);
        }
        let path = self.token_path(code);
        if !path.exists() {
            return Ok(ConfirmOutcome::Invalid);
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read token '{}'", path.display()))?;
        // Single use: gone before anything else can happen.
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove token '{}'", path.display()))?;

        let record: TokenRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!("corrupt confirmation token '{}': {}", path.display(), err);
                return Ok(ConfirmOutcome::Invalid);
            }
        };

        let age = Utc::now().signed_duration_since(record.issued_at);
        if age > Duration::seconds(TOKEN_TTL_SECS) {
            return Ok(ConfirmOutcome::Expired);
        }

        let decoded = general_purpose::STANDARD
            .decode(&record.action)
            .context("token action is not valid base64")?;
        let action: PendingAction =
            serde_json::from_slice(&decoded).context("token action does not decode")?;
        Ok(ConfirmOutcome::Confirmed(action))
    }

    /// Delete tokens past the GC window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = match std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<TokenRecord>(&raw).ok())
            {
                Some(record) => {
                    Utc::now().signed_duration_since(record.issued_at)
                        > Duration::seconds(SWEEP_AFTER_SECS)
                }
                // Unreadable tokens can never be confirmed; reclaim them.
                None => true,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn token_path(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{}.json", code))
    }
}

/// Codes are exactly 16 lowercase hex chars; anything else is rejected
/// before it can touch the filesystem.
fn is_valid_code(code: &str) -> bool {
    code.len() == 16 && code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
