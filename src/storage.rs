//! [`EventLogStore`] implementations: in-memory and JSON-lines files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::error::{EngineError, StateError, StoreError};
use crate::history::{Event, EventKind, EventLogStore};

fn check_expected(instance_id: &str, expected: u64, actual: u64) -> Result<(), EngineError> {
    if expected != actual {
        return Err(StateError::ConcurrencyConflict {
            instance_id: instance_id.to_string(),
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}

/// An [`EventLogStore`] that keeps histories in memory.
///
/// Cloning the `Arc` around it and handing it to a second orchestrator is how
/// tests simulate a process restart against the same durable history.
#[derive(Default)]
pub struct InMemoryEventLog {
    logs: Mutex<HashMap<String, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded for `instance_id`.
    pub fn len(&self, instance_id: &str) -> usize {
        self.logs
            .lock()
            .expect("lock poisoned")
            .get(instance_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl EventLogStore for InMemoryEventLog {
    async fn append(
        &self,
        instance_id: &str,
        expected_seq: u64,
        kind: EventKind,
    ) -> Result<Event, EngineError> {
        let mut logs = self.logs.lock().expect("lock poisoned");
        let log = logs.entry(instance_id.to_string()).or_default();
        let actual = log.last().map_or(0, |e| e.seq);
        check_expected(instance_id, expected_seq, actual)?;

        let event = Event {
            instance_id: instance_id.to_string(),
            seq: actual + 1,
            recorded_at: Utc::now(),
            kind,
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn read_all(&self, instance_id: &str) -> Result<Vec<Event>, EngineError> {
        let logs = self.logs.lock().expect("lock poisoned");
        Ok(logs.get(instance_id).cloned().unwrap_or_default())
    }

    async fn list_instances(&self) -> Result<Vec<String>, EngineError> {
        let logs = self.logs.lock().expect("lock poisoned");
        let mut ids: Vec<String> = logs
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

const LOG_EXTENSION: &str = "jsonl";

/// An [`EventLogStore`] persisting one JSON-lines file per instance.
///
/// Every append re-reads the file tail for the sequence check, writes one
/// line and syncs it to disk before returning, so the history is shared
/// correctly between processes pointing at the same directory.
pub struct FileEventLog {
    dir: PathBuf,
    /// Serializes appends within this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileEventLog {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log file for `instance_id`, or `None` if the id cannot name a file
    /// in the store directory. Such an id has no history.
    fn path_for(&self, instance_id: &str) -> Option<PathBuf> {
        let valid = !instance_id.is_empty()
            && instance_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !instance_id.starts_with('.');
        valid.then(|| self.dir.join(format!("{instance_id}.{LOG_EXTENSION}")))
    }

    async fn read_raw(&self, path: &Path) -> Result<String, EngineError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(unavailable(path, e)),
        }
    }
}

fn parse_log(path: &Path, contents: &str) -> Result<Vec<Event>, EngineError> {
    let total = contents.lines().count();
    let mut events = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            // A torn final line means the process died mid-write; the event
            // was never acknowledged, so it is not part of history.
            Err(e) if line_no + 1 == total && !contents.ends_with('\n') => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring torn trailing event");
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "{}:{}: undecodable event: {e}",
                    path.display(),
                    line_no + 1
                ))
                .into());
            }
        }
    }
    Ok(events)
}

fn unavailable(path: &Path, e: std::io::Error) -> EngineError {
    StoreError::Unavailable(format!("{}: {e}", path.display())).into()
}

#[async_trait::async_trait]
impl EventLogStore for FileEventLog {
    async fn append(
        &self,
        instance_id: &str,
        expected_seq: u64,
        kind: EventKind,
    ) -> Result<Event, EngineError> {
        let path = self.path_for(instance_id).ok_or_else(|| {
            StoreError::Unavailable(format!(
                "instance id {instance_id:?} is not usable as a file name"
            ))
        })?;
        let _guard = self.write_lock.lock().await;

        let contents = self.read_raw(&path).await?;
        let existing = parse_log(&path, &contents)?;
        let actual = existing.last().map_or(0, |e| e.seq);
        check_expected(instance_id, expected_seq, actual)?;

        let event = Event {
            instance_id: instance_id.to_string(),
            seq: actual + 1,
            recorded_at: Utc::now(),
            kind,
        };
        let encoded = serde_json::to_string(&event)
            .map_err(|e| StoreError::Unavailable(format!("failed to encode event: {e}")))?;
        let mut line = encoded;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| unavailable(&path, e))?;
        // Drop a torn write left behind by a crash before appending after it.
        let intact = contents.rfind('\n').map_or(0, |i| i + 1);
        if intact < contents.len() {
            tracing::warn!(path = %path.display(), "truncating torn trailing event");
            file.set_len(intact as u64)
                .await
                .map_err(|e| unavailable(&path, e))?;
        }
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| unavailable(&path, e))?;
        file.sync_data().await.map_err(|e| unavailable(&path, e))?;

        Ok(event)
    }

    async fn read_all(&self, instance_id: &str) -> Result<Vec<Event>, EngineError> {
        let Some(path) = self.path_for(instance_id) else {
            return Ok(Vec::new());
        };
        let contents = self.read_raw(&path).await?;
        parse_log(&path, &contents)
    }

    async fn list_instances(&self) -> Result<Vec<String>, EngineError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| unavailable(&self.dir, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
