//! Append-only JSONL event log
//!
//! Each lifecycle event is one compact JSON line, flushed to stable
//! storage before `append` returns. A crash mid-write can leave at most
//! one torn trailing line; replay skips it and keeps everything else.

use crate::error::TelemetryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Kind of lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    FallbackUsed,
}

/// One line of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            run_id: None,
            task_id: None,
            invocation_id: None,
            agent: None,
            status: None,
            summary: None,
            data: None,
        }
    }

    pub fn run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = Some(id.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Events recovered from disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Lines that could not be parsed (torn writes, foreign text)
    pub skipped: usize,
}

/// Writer and reader for one JSONL event file
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    rotate_bytes: Option<u64>,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rotate_bytes: None,
            lock: Mutex::new(()),
        }
    }

    /// Rotate to `<file>.1` once the active file reaches `bytes`
    pub fn with_rotation(mut self, bytes: u64) -> Self {
        self.rotate_bytes = Some(bytes);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous generation lives after rotation
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".1");
        PathBuf::from(name)
    }

    /// Append one event and sync it to disk
    pub fn append(&self, event: &Event) -> Result<(), TelemetryError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let io_err = |source| TelemetryError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        self.rotate_if_needed().map_err(io_err)?;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .map_err(io_err)?;
        if ends_with_torn_line(&mut file).map_err(io_err)? {
            warn!(path = %self.path.display(), "terminating torn trailing line before append");
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        debug!(event = ?event.event_type, path = %self.path.display(), "event appended");
        Ok(())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let Some(limit) = self.rotate_bytes else {
            return Ok(());
        };
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if size >= limit {
            let rotated = self.rotated_path();
            std::fs::rename(&self.path, &rotated)?;
            debug!(from = %self.path.display(), to = %rotated.display(), "rotated event log");
        }
        Ok(())
    }

    /// Read the rotated generation (if any), then the active file
    pub fn replay(&self) -> Result<Replay, TelemetryError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut replay = Replay::default();
        for path in [self.rotated_path(), self.path.clone()] {
            read_events(&path, &mut replay)?;
        }
        Ok(replay)
    }
}

/// True when the file is non-empty and its last byte is not a newline
fn ends_with_torn_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_events(path: &Path, replay: &mut Replay) -> Result<(), TelemetryError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TelemetryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    for (lineno, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = line.map_err(|source| TelemetryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(text) {
            Ok(event) => replay.events.push(event),
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping unreadable event line");
                replay.skipped += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn task_event(n: usize) -> Event {
        Event::new(EventType::TaskCompleted)
            .run_id("run-1")
            .task_id(format!("task-{n}"))
            .status("success")
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        for n in 0..3 {
            log.append(&task_event(n)).unwrap();
        }

        let replay = log.replay().unwrap();
        assert_eq!(replay.events.len(), 3);
        assert_eq!(replay.skipped, 0);
        assert_eq!(replay.events[2].task_id.as_deref(), Some("task-2"));
    }

    #[test]
    fn test_lines_are_compact_and_independent() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        log.append(&Event::new(EventType::RunStarted).data(json!({"k": [1, 2]}))).unwrap();
        log.append(&Event::new(EventType::RunCompleted)).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: Value = serde_json::from_str(line).unwrap();
            assert!(value.get("type").is_some());
            assert!(value.get("run_id").is_none());
        }
        assert!(contents.contains(r#""type":"run_started""#));
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        for n in 0..5 {
            log.append(&task_event(n)).unwrap();
        }
        // Simulate a crash halfway through writing event six.
        let full = serde_json::to_string(&task_event(5)).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(&full.as_bytes()[..full.len() / 2]).unwrap();
        drop(file);

        let replay = log.replay().unwrap();
        assert_eq!(replay.events.len(), 5);
        assert_eq!(replay.skipped, 1);

        // The next append must not be glued onto the torn fragment.
        log.append(&task_event(6)).unwrap();
        let replay = log.replay().unwrap();
        assert_eq!(replay.events.len(), 6);
        assert_eq!(replay.events[5].task_id.as_deref(), Some("task-6"));
        assert_eq!(replay.skipped, 1);
    }

    #[test]
    fn test_rotation_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let line_len = serde_json::to_string(&task_event(0)).unwrap().len() as u64 + 1;
        // Timestamps vary slightly in width, so rotate at one and a half lines.
        let log = EventLog::new(&path).with_rotation(line_len * 3 / 2);

        for n in 0..3 {
            log.append(&task_event(n)).unwrap();
        }

        assert!(log.rotated_path().exists());
        let rotated = std::fs::read_to_string(log.rotated_path()).unwrap();
        assert_eq!(rotated.lines().count(), 2);
        let active = std::fs::read_to_string(&path).unwrap();
        assert_eq!(active.lines().count(), 1);

        let ids: Vec<String> = log
            .replay()
            .unwrap()
            .events
            .into_iter()
            .filter_map(|e| e.task_id)
            .collect();
        assert_eq!(ids, vec!["task-0", "task-1", "task-2"]);
    }

    #[test]
    fn test_replay_missing_files_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("none.jsonl"));
        assert_eq!(log.replay().unwrap(), Replay::default());
    }
}
