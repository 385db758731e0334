#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging and append-only JSONL record logs shared by the
//! serving, learning and server crates.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log (e.g. `retrain`).
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Short machine-friendly message such as `retrain.failed`.
    pub message: String,
    /// Arbitrary JSON fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Copies the fields of a JSON object into the record metadata.
    /// Non-object values are stored under a `value` key.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata = map,
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("value".into(), other);
            }
        }
        self
    }
}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only JSONL store for typed records.
///
/// Writers are serialised through a mutex so concurrent appends never
/// interleave within a line. Readers open the file independently and skip a
/// torn trailing line left by an interrupted write.
#[derive(Debug)]
pub struct RecordLog<T> {
    path: PathBuf,
    writer: Mutex<File>,
    _record: PhantomData<fn() -> T>,
}

impl<T> RecordLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Opens or creates the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
            _record: PhantomData,
        })
    }

    /// Appends a single record.
    pub fn append(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        writer
            .write_all(&line)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        writer.flush()?;
        Ok(())
    }

    /// Reads every well-formed record in insertion order.
    pub fn read_all(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("opening record log {}", self.path.display()))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<T>(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Returns the latest `limit` records, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<T>> {
        let mut records = self.read_all()?;
        if records.len() > limit {
            records.drain(0..records.len() - limit);
        }
        Ok(records)
    }

    /// Returns the log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        label: String,
        score: f32,
    }

    #[test]
    fn writes_json_lines_with_metadata() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("nested/test.log")).unwrap();
        logger
            .log(
                &LogRecord::new("retrain", LogLevel::Info, "retrain.started")
                    .with_metadata(json!({ "samples": 12 })),
            )
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"retrain.started\""));
        assert!(content.contains("\"samples\":12"));
        assert!(content.contains("\"level\":\"INFO\""));
    }

    #[test]
    fn record_log_appends_and_tails() {
        let dir = tempdir().unwrap();
        let log = RecordLog::<Sample>::open(dir.path().join("records.jsonl")).unwrap();
        for (idx, label) in ["cats", "dogs", "cats"].iter().enumerate() {
            log.append(&Sample {
                label: (*label).to_string(),
                score: idx as f32,
            })
            .unwrap();
        }
        assert_eq!(log.read_all().unwrap().len(), 3);
        let tail = log.tail(2).unwrap();
        assert_eq!(tail[0].label, "dogs");
        assert_eq!(tail[1].label, "cats");
    }

    #[test]
    fn record_log_skips_torn_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let log = RecordLog::<Sample>::open(&path).unwrap();
        log.append(&Sample {
            label: "dogs".into(),
            score: 0.9,
        })
        .unwrap();
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"label\":\"ca").unwrap();
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "dogs");
    }

    #[test]
    fn missing_record_log_reads_empty() {
        let dir = tempdir().unwrap();
        let log = RecordLog::<Sample>::open(dir.path().join("a.jsonl")).unwrap();
        fs::remove_file(log.path()).unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }
}
