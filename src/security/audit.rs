//! Append-only, hash-chained audit log of privileged operations.
//!
//! Stored at `<state_dir>/helper.audit.jsonl`. Each line is one JSON
//! object carrying the SHA-256 of the previous raw line, so editing or
//! removing an entry breaks the chain at the following line.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `delete_file`, `run_command`, `flush_dns`, ... |
//! | `outcome` | `ok` or the error code returned to the caller |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//! | `source` | Who asked: `uid:<n>`, `cli`, or `audit_system` |
//! | `detail` | Target path or command line |
//!
//! The first entry links to [`GENESIS_HASH`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::errors::ErrorCode;

const AUDIT_FILENAME: &str = "helper.audit.jsonl";

/// Link value for the first entry in the chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    pub outcome: String,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ServerStarted,
    DeleteFile,
    RunCommand,
    FlushDns,
    RebuildSearchIndex,
    PurgeMemory,
    /// Connection refused by the peer uid check.
    PeerRejected,
    /// Previous entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Outcome string for an entry.
pub fn outcome_label(error: Option<ErrorCode>) -> String {
    match error {
        None => "ok".to_string(),
        Some(code) => code.to_string(),
    }
}

/// Shared handle used by the RPC service.
///
/// The hash of the last line is kept in memory after the first append, so
/// each record costs one write. Appends run on the blocking pool and are
/// serialized by the head lock; this handle must be the file's only writer.
#[derive(Debug, Clone)]
pub struct AuditLog {
    state_dir: PathBuf,
    enabled: bool,
    head: Arc<Mutex<Option<String>>>,
}

impl AuditLog {
    pub fn new(state_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            state_dir: state_dir.into(),
            enabled,
            head: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> PathBuf {
        audit_file_path(&self.state_dir)
    }

    /// Best effort: a failed append is logged, never returned to the caller.
    pub async fn record(
        &self,
        action: AuditAction,
        error: Option<ErrorCode>,
        source: &str,
        detail: Option<&str>,
    ) {
        if !self.enabled {
            return;
        }
        let log = self.clone();
        let outcome = outcome_label(error);
        let source = source.to_string();
        let detail = detail.map(str::to_string);
        let appended = tokio::task::spawn_blocking(move || {
            log.append(action, &outcome, &source, detail.as_deref())
        })
        .await;

        match appended {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("audit append failed: {e:#}"),
            Err(e) => warn!("audit task failed: {e}"),
        }
    }

    fn append(
        &self,
        action: AuditAction,
        outcome: &str,
        source: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let mut head = self.head.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path();
        let prev_hash = match head.take() {
            Some(hash) => hash,
            None => chain_head(&path)?,
        };
        // On failure the head stays unset and is re-read from disk next time.
        let hash = write_entry(&path, action, outcome, prev_hash, source, detail)?;
        *head = Some(hash);
        Ok(())
    }
}

/// Append one entry, inserting a `ChainRecovery` entry first when the
/// current last line is not valid JSON.
pub fn append_audit_entry(
    state_dir: &Path,
    action: AuditAction,
    outcome: &str,
    source: &str,
    detail: Option<&str>,
) -> Result<()> {
    let path = audit_file_path(state_dir);
    let prev_hash = chain_head(&path)?;
    write_entry(&path, action, outcome, prev_hash, source, detail)?;
    Ok(())
}

/// Hash the next entry must link to, read from the file's last line.
fn chain_head(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(GENESIS_HASH.to_string());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    match content.lines().last() {
        Some(last_line) if !last_line.is_empty() => {
            if serde_json::from_str::<AuditEntry>(last_line).is_ok() {
                return Ok(sha256_hex(last_line.as_bytes()));
            }
            let recovery = AuditEntry {
                ts: chrono::Utc::now().to_rfc3339(),
                action: AuditAction::ChainRecovery,
                outcome: "ok".to_string(),
                prev_entry_sha256: sha256_hex(last_line.as_bytes()),
                source: "audit_system".to_string(),
                detail: Some(format!(
                    "Previous entry corrupted ({} bytes), new chain segment",
                    last_line.len()
                )),
            };
            let recovery_json =
                serde_json::to_string(&recovery).context("Failed to serialize recovery entry")?;
            append_line(path, &recovery_json)?;
            Ok(sha256_hex(recovery_json.as_bytes()))
        }
        _ => Ok(GENESIS_HASH.to_string()),
    }
}

/// Writes one entry and returns the hash of the written line.
fn write_entry(
    path: &Path,
    action: AuditAction,
    outcome: &str,
    prev_hash: String,
    source: &str,
    detail: Option<&str>,
) -> Result<String> {
    let entry = AuditEntry {
        ts: chrono::Utc::now().to_rfc3339(),
        action,
        outcome: outcome.to_string(),
        prev_entry_sha256: prev_hash,
        source: source.to_string(),
        detail: detail.map(str::to_string),
    };

    let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
    append_line(path, &json)?;
    Ok(sha256_hex(json.as_bytes()))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open audit log {}", path.display()))?;
    writeln!(file, "{line}").context("Failed to write audit entry")?;
    Ok(())
}

/// All parseable entries; corrupted lines are skipped.
pub fn read_audit_log(state_dir: &Path) -> Result<Vec<AuditEntry>> {
    let path = audit_file_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Indices of lines whose link does not match the previous line, or that
/// do not parse. Empty means the chain is intact.
pub fn verify_audit_chain(state_dir: &Path) -> Result<Vec<usize>> {
    let path = audit_file_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

pub fn audit_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_FILENAME)
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
