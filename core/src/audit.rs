use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_MEM_EVENTS: usize = 10_000;
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            outcome: outcome.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

enum Backing {
    File(PathBuf),
    Memory(VecDeque<AuditEvent>),
}

/// Append-only audit trail. Backed by a JSONL file when a path is
/// configured, or an in-memory ring buffer otherwise. A single lock guards
/// both the append and list paths; a write failure is swallowed rather than
/// surfaced, since an audit-log outage must never fail the request it's
/// documenting.
pub struct AuditStore {
    backing: Mutex<Backing>,
}

impl AuditStore {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Mutex::new(Backing::File(path.into())),
        }
    }

    pub fn memory() -> Self {
        Self {
            backing: Mutex::new(Backing::Memory(VecDeque::new())),
        }
    }

    /// Chooses file-backed or in-memory storage based on whether `path` is
    /// non-empty, matching the original config convention of an empty
    /// `CP_AUDIT_LOG_PATH` meaning "don't persist".
    pub fn from_path(path: &str) -> Self {
        if path.trim().is_empty() {
            Self::memory()
        } else {
            Self::file(path.trim())
        }
    }

    pub fn append(&self, event: AuditEvent) {
        let mut backing = self.backing.lock().expect("audit lock poisoned");
        match &mut *backing {
            Backing::Memory(events) => {
                events.push_back(event);
                while events.len() > MAX_MEM_EVENTS {
                    events.pop_front();
                }
            }
            Backing::File(path) => {
                if let Err(e) = append_to_file(path, &event) {
                    eprintln!("warning: audit append failed: {e}");
                }
            }
        }
    }

    pub fn list(&self, limit: Option<usize>) -> Vec<AuditEvent> {
        let limit = clamp_limit(limit);
        let backing = self.backing.lock().expect("audit lock poisoned");
        match &*backing {
            Backing::Memory(events) => events
                .iter()
                .rev()
                .take(limit)
                .rev()
                .cloned()
                .collect(),
            Backing::File(path) => read_from_file(path, limit),
        }
    }
}

fn clamp_limit(limit: Option<usize>) -> usize {
    match limit {
        None | Some(0) => DEFAULT_LIST_LIMIT,
        Some(n) => n.min(MAX_LIST_LIMIT),
    }
}

fn append_to_file(path: &std::path::Path, event: &AuditEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o600)
                .open(path)?
        }
        #[cfg(not(unix))]
        {
            OpenOptions::new().append(true).create(true).open(path)?
        }
    };
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")?;
    file.sync_all()
}

fn read_from_file(path: &std::path::Path, limit: usize) -> Vec<AuditEvent> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let mut out: VecDeque<AuditEvent> = VecDeque::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<AuditEvent>(&line) else {
            continue; // skip malformed lines rather than fail the whole scan
        };
        out.push_back(event);
        while out.len() > limit {
            out.pop_front();
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_trims_to_cap() {
        let store = AuditStore::memory();
        for i in 0..3 {
            store.append(AuditEvent::new("tester", "noop", "run", i.to_string(), "allowed"));
        }
        assert_eq!(store.list(Some(2)).len(), 2);
    }

    #[test]
    fn list_clamps_limit_to_one_thousand_and_defaults_to_one_hundred() {
        assert_eq!(clamp_limit(None), 100);
        assert_eq!(clamp_limit(Some(0)), 100);
        assert_eq!(clamp_limit(Some(5000)), 1000);
        assert_eq!(clamp_limit(Some(7)), 7);
    }

    #[test]
    fn file_store_round_trips_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let store = AuditStore::file(&path);
        store.append(AuditEvent::new("tester", "harness-run.start", "run", "r1", "allowed"));
        store.append(AuditEvent::new("tester", "harness-run.stop", "run", "r1", "allowed"));
        let events = store.list(None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "harness-run.start");
    }

    #[test]
    fn file_store_skips_malformed_lines_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "not json\n{\"bad\":true}\n").unwrap();
        let store = AuditStore::file(&path);
        assert_eq!(store.list(None).len(), 0);
    }

    #[test]
    fn missing_file_returns_empty_not_error() {
        let store = AuditStore::file("/nonexistent/path/audit.jsonl");
        assert_eq!(store.list(None).len(), 0);
    }

    #[test]
    fn from_path_empty_string_is_in_memory() {
        let store = AuditStore::from_path("");
        store.append(AuditEvent::new("tester", "noop", "run", "r1", "allowed"));
        assert_eq!(store.list(None).len(), 1);
    }
}
