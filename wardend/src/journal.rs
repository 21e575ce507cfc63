//! HMAC-chained audit journal.
//!
//! Append-only, one fact per line: every operator-visible action (dispatch,
//! confirmation, deploy, rollback, task, session change) lands here. Each
//! entry is HMAC-signed and chained to its predecessor so after-the-fact
//! edits are detectable.

use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Journal entry with HMAC chain
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Entry {
    pub seq: u64,
    pub ts: u64,
    /// Event type: recv, dispatch, confirm.create, confirm.exec, deploy, rollback, task, session
    pub ev: String,
    /// Operator id the event was triggered by ("-" for loop-internal events).
    pub actor: String,
    /// What the event acted on (command token, project, task id, code).
    pub subject: String,
    pub meta: serde_json::Value,
    /// Previous entry hash (base64)
    pub prev: String,
    /// This entry hash (base64)
    pub hash: String,
}

pub struct Journal {
    file: Mutex<File>,
    key: Vec<u8>,
    seq: Mutex<u64>,
    last_hash: Mutex<String>,
}

impl Journal {
    /// Open or create the journal, resuming the chain from the last entry.
    pub fn open(path: &Path, key: &[u8]) -> Result<Self> {
        let (seq, last_hash) = match read_tail(path) {
            Ok(tail) => tail,
            Err(err) => {
                warn!("journal tail unreadable, chain restarts: {:#}", err);
                (0, String::new())
            }
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            key: key.to_vec(),
            seq: Mutex::new(seq),
            last_hash: Mutex::new(last_hash),
        })
    }

    /// Append a new entry, returning its chain hash.
    pub fn append(
        &self,
        event: &str,
        actor: &str,
        subject: &str,
        meta: serde_json::Value,
    ) -> Result<String> {
        let ts = now_ts();

        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        let current_seq = *seq;

        let prev_hash = self.last_hash.lock().unwrap().clone();

        let canonical = format!("{}|{}|{}|{}|{}", current_seq, ts, event, actor, subject);

        let mut mac = HmacSha256::new_from_slice(&self.key)?;
        mac.update(prev_hash.as_bytes());
        mac.update(canonical.as_bytes());
        mac.update(serde_json::to_string(&meta)?.as_bytes());
        let current_hash = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let entry = Entry {
            seq: current_seq,
            ts,
            ev: event.to_string(),
            actor: actor.to_string(),
            subject: subject.to_string(),
            meta,
            prev: prev_hash,
            hash: current_hash.clone(),
        };

        let line = serde_json::to_string(&entry)? + "\n";
        {
            let mut file = self.file.lock().unwrap();
            file.write_all(line.as_bytes())?;
            file.sync_all()?;
        }

        *self.last_hash.lock().unwrap() = current_hash.clone();

        Ok(current_hash)
    }

    #[allow(dead_code)]
    pub fn current_seq(&self) -> u64 {
        *self.seq.lock().unwrap()
    }
}

/// Recover (seq, hash) of the final entry so restarts extend the chain.
fn read_tail(path: &Path) -> Result<(u64, String)> {
    if !path.exists() {
        return Ok((0, String::new()));
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut tail = (0, String::new());
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(&line)?;
        tail = (entry.seq, entry.hash);
    }
    Ok(tail)
}

/// Journal verification utility
#[allow(dead_code)]
pub struct JournalVerifier {
    key: Vec<u8>,
}

#[allow(dead_code)]
impl JournalVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// Verify journal integrity
    pub fn verify_file(&self, path: &Path) -> Result<bool> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut prev_hash = String::new();
        let mut expected_seq = 1u64;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: Entry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(_) => return Ok(false),
            };

            if entry.seq != expected_seq {
                return Ok(false);
            }
            if entry.prev != prev_hash {
                return Ok(false);
            }

            let canonical = format!(
                "{}|{}|{}|{}|{}",
                entry.seq, entry.ts, entry.ev, entry.actor, entry.subject
            );

            let mut mac = HmacSha256::new_from_slice(&self.key)?;
            mac.update(prev_hash.as_bytes());
            mac.update(canonical.as_bytes());
            mac.update(serde_json::to_string(&entry.meta)?.as_bytes());
            let expected_hash = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

            if entry.hash != expected_hash {
                return Ok(false);
            }

            prev_hash = entry.hash;
            expected_seq += 1;
        }

        Ok(true)
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn chain_appends_and_verifies() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let key = b"test-key-123";
        let journal = Journal::open(temp_file.path(), key)?;

        let hash1 = journal.append(
            "dispatch",
            "42",
            "/deploy",
            serde_json::json!({"project": "api"}),
        )?;
        let hash2 = journal.append(
            "deploy",
            "-",
            "api",
            serde_json::json!({"release": "20260807120000"}),
        )?;

        assert_ne!(hash1, hash2);
        assert_eq!(journal.current_seq(), 2);

        let verifier = JournalVerifier::new(key);
        assert!(verifier.verify_file(temp_file.path())?);
        Ok(())
    }

    #[test]
    fn reopen_extends_the_chain() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let key = b"test-key-123";

        {
            let journal = Journal::open(temp_file.path(), key)?;
            journal.append("dispatch", "42", "/status", serde_json::json!({}))?;
        }
        {
            let journal = Journal::open(temp_file.path(), key)?;
            assert_eq!(journal.current_seq(), 1);
            journal.append("dispatch", "42", "/top", serde_json::json!({}))?;
        }

        let verifier = JournalVerifier::new(key);
        assert!(verifier.verify_file(temp_file.path())?);
        Ok(())
    }

    #[test]
    fn tampering_is_detected() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let key = b"test-key-123";
        let journal = Journal::open(temp_file.path(), key)?;

        journal.append("confirm.create", "42", "a1b2c3d4e5f60718", serde_json::json!({}))?;

        {
            let mut file = OpenOptions::new().append(true).open(temp_file.path())?;
            file.write_all(b"{\"seq\":2,\"hash\":\"invalid\"}\n")?;
        }

        let verifier = JournalVerifier::new(key);
        assert!(!verifier.verify_file(temp_file.path())?);
        Ok(())
    }
}
