//! Hash-chained append-only audit log. Appends are serialized under a
//! single mutex; the in-memory tail hash is primed from the log's last line
//! on open so a restart doesn't break the chain.

use forgeos_core::{sha256_hex, to_canonical_json, SchedulerError};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::PathBuf;

pub struct AuditLog {
    path: PathBuf,
    tail_hash: Mutex<Option<String>>,
}

impl AuditLog {
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let tail_hash = match std::fs::File::open(&path) {
            Ok(f) => std::io::BufReader::new(f)
                .lines()
                .filter_map(|l| l.ok())
                .filter(|l| !l.trim().is_empty())
                .last()
                .and_then(|line| serde_json::from_str::<Value>(&line).ok())
                .and_then(|v| v.get("record_hash").and_then(|h| h.as_str()).map(String::from)),
            Err(_) => None,
        };
        Ok(Self {
            path,
            tail_hash: Mutex::new(tail_hash),
        })
    }

    /// Appends `record` (without `record_hash`/`prev_record_hash`) to the
    /// chain, filling in both fields, and returns the stored record.
    pub fn append(&self, mut record: Value) -> Result<Value, SchedulerError> {
        let mut tail = self.tail_hash.lock();
        let prev = tail.clone();
        if let Some(obj) = record.as_object_mut() {
            obj.insert(
                "prev_record_hash".to_string(),
                prev.clone().map(Value::String).unwrap_or(Value::Null),
            );
            obj.insert("record_hash_algo".to_string(), Value::String("sha256".to_string()));
        }
        let hash = sha256_hex(&to_canonical_json(&record));
        if let Some(obj) = record.as_object_mut() {
            obj.insert("record_hash".to_string(), Value::String(hash.clone()));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SchedulerError::Internal(format!("audit log open: {e}")))?;
        let line = serde_json::to_string(&record)
            .map_err(|e| SchedulerError::Internal(format!("audit log encode: {e}")))?;
        writeln!(file, "{line}").map_err(|e| SchedulerError::Internal(format!("audit log write: {e}")))?;

        *tail = Some(hash);
        Ok(record)
    }

    pub fn tail(&self, limit: usize) -> Result<Vec<Value>, SchedulerError> {
        let file = std::fs::File::open(&self.path)
            .map_err(|e| SchedulerError::Internal(format!("audit log read: {e}")))?;
        let lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .filter_map(|l| l.ok())
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..]
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chains_record_hashes() {
        let dir = std::env::temp_dir().join(format!("forgeos-audit-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("audit.jsonl");
        let _ = std::fs::remove_file(&path);
        let log = AuditLog::open(path.clone()).unwrap();

        let first = log.append(json!({"n": 1})).unwrap();
        assert_eq!(first["prev_record_hash"], Value::Null);

        let second = log.append(json!({"n": 2})).unwrap();
        assert_eq!(second["prev_record_hash"], first["record_hash"]);

        let lines = log.tail(10).unwrap();
        assert_eq!(lines.len(), 2);
        std::fs::remove_file(&path).unwrap();
    }
}
