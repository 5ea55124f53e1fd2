//! JSONL audit log for authenticated admin requests.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

/// One line of the audit log. Field names are wire contract.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub remote_addr: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    pub authorized: bool,
    /// First four characters of the presented token, masked.
    pub token: String,
    pub status_code: u16,
    pub duration_ms: u64,
}

/// Append-only JSONL audit writer.
pub struct AuditLog {
    path: PathBuf,
    // Serializes appends so concurrent requests don't interleave lines.
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "audit record serialization failed");
                return;
            }
        };

        let _guard = self.lock.lock().expect("audit lock poisoned");
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }
}

/// Mask a bearer token for the audit trail: first four characters + `****`.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}****")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_keeps_four_chars() {
        assert_eq!(mask_token("s3cret-token"), "s3cr****");
        assert_eq!(mask_token("ab"), "ab****");
        assert_eq!(mask_token(""), "****");
    }

    #[test]
    fn append_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path);

        let record = AuditRecord {
            timestamp: "2026-08-01T00:00:00Z".into(),
            remote_addr: "127.0.0.1:5000".into(),
            method: "POST".into(),
            path: "/scheduler/pause".into(),
            user_agent: "curl/8".into(),
            authorized: true,
            token: mask_token("s3cret"),
            status_code: 200,
            duration_ms: 3,
        };
        log.append(&record);
        log.append(&record);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["token"], "s3cr****");
        assert_eq!(parsed["authorized"], true);
        assert_eq!(parsed["status_code"], 200);
    }
}
