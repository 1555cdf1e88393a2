use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single accepted solution, appended as one line of JSON.
/// The receipts log is the durable record the orchestrator replays on
/// startup to rebuild `SolvedSet`/`SubmittedHashes` and the dev-fee cadence
/// counter without re-submitting anything already accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEntry {
    pub ts: DateTime<Utc>,
    pub address: String,
    pub address_index: i64,
    pub challenge_id: String,
    pub nonce: String,
    pub hash: String,
    pub crypto_receipt: Option<serde_json::Value>,
    pub is_dev_fee: bool,
}

/// A single submission failure, kept alongside the receipts for postmortem
/// review; unlike receipts these are never replayed into in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub address: String,
    pub challenge_id: String,
    pub kind: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only line-delimited store for receipts and submission errors.
///
/// Appends are serialized through a mutex so concurrent workers never
/// interleave partial lines; each write is a single `write_all` of one
/// JSON object plus a trailing newline, which is as close to atomic as a
/// plain file append gets without fighting OS buffering for fsync timing.
pub struct ReceiptsStore {
    receipts_path: PathBuf,
    errors_path: PathBuf,
    write_lock: Mutex<()>,
}

impl ReceiptsStore {
    pub fn new(receipts_path: impl Into<PathBuf>, errors_path: impl Into<PathBuf>) -> Self {
        Self {
            receipts_path: receipts_path.into(),
            errors_path: errors_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn append_receipt(&self, entry: &ReceiptEntry) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        append_line(&self.receipts_path, entry)
    }

    pub fn append_error(&self, entry: &ErrorRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        append_line(&self.errors_path, entry)
    }

    pub fn read_all_receipts(&self) -> Result<Vec<ReceiptEntry>> {
        read_lines(&self.receipts_path)
    }

    pub fn read_all_errors(&self) -> Result<Vec<ErrorRecord>> {
        read_lines(&self.errors_path)
    }

    /// Last `n` receipts, in file order (oldest of the tail first).
    pub fn recent_receipts(&self, n: usize) -> Result<Vec<ReceiptEntry>> {
        let mut all = self.read_all_receipts()?;
        if all.len() > n {
            all.drain(0..all.len() - n);
        }
        Ok(all)
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {:?} for append", path))?;
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path).with_context(|| format!("opening {:?}", path))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(v) => out.push(v),
            Err(e) => warn!("skipping malformed line {} in {:?}: {}", lineno + 1, path, e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(challenge_id: &str, nonce_hex: &str) -> ReceiptEntry {
        ReceiptEntry {
            ts: Utc::now(),
            address: "addr1test".into(),
            address_index: 0,
            challenge_id: challenge_id.into(),
            nonce: nonce_hex.into(),
            hash: format!("hash-{}", nonce_hex),
            crypto_receipt: None,
            is_dev_fee: false,
        }
    }

    #[test]
    fn append_and_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = ReceiptsStore::new(dir.path().join("receipts.jsonl"), dir.path().join("errors.jsonl"));
        store.append_receipt(&entry("C1", "0000000000000001")).unwrap();
        store.append_receipt(&entry("C1", "0000000000000002")).unwrap();

        let all = store.read_all_receipts().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].nonce, "0000000000000001");
        assert_eq!(all[1].nonce, "0000000000000002");
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = ReceiptsStore::new(dir.path().join("receipts.jsonl"), dir.path().join("errors.jsonl"));
        assert!(store.read_all_receipts().unwrap().is_empty());
    }

    #[test]
    fn recent_receipts_returns_only_the_tail() {
        let dir = tempdir().unwrap();
        let store = ReceiptsStore::new(dir.path().join("receipts.jsonl"), dir.path().join("errors.jsonl"));
        for i in 0..5u64 {
            store
                .append_receipt(&entry("C1", &format!("{:016x}", i)))
                .unwrap();
        }
        let recent = store.recent_receipts(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].nonce, format!("{:016x}", 3u64));
        assert_eq!(recent[1].nonce, format!("{:016x}", 4u64));
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("receipts.jsonl");
        store_write_raw(&path, "not json\n");
        let store = ReceiptsStore::new(&path, dir.path().join("errors.jsonl"));
        store.append_receipt(&entry("C1", "0000000000000001")).unwrap();
        let all = store.read_all_receipts().unwrap();
        assert_eq!(all.len(), 1);
    }

    fn store_write_raw(path: &std::path::Path, content: &str) {
        use std::io::Write as _;
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }
}
