//! minder-logstore: append-only structured event log.
//!
//! One JSONL file per UTC day under the log directory. This is the durable
//! audit trail for scheduler decisions; callers on hot paths discard write
//! errors so logging can never abort a tick.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Append-only event log writing one JSON object per line.
pub struct LogStore {
    base_dir: PathBuf,
    mu: Mutex<()>,
}

impl LogStore {
    /// Create the log directory if needed and return a store rooted there.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            mu: Mutex::new(()),
        })
    }

    /// Append one event record. `fields` must be a JSON object (or Null for
    /// no extra fields); its entries are merged beside ts/component/event.
    pub fn write(&self, component: &str, event: &str, fields: Value) -> Result<()> {
        let _guard = self.mu.lock().unwrap();

        let now = Utc::now();
        let path = self
            .base_dir
            .join(format!("events-{}.jsonl", now.format("%Y-%m-%d")));

        let mut record = Map::new();
        record.insert(
            "ts".into(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        record.insert("component".into(), Value::String(component.to_string()));
        record.insert("event".into(), Value::String(event.to_string()));
        if let Value::Object(extra) = fields {
            for (k, v) in extra {
                record.insert(k, v);
            }
        }

        let line = serde_json::to_string(&Value::Object(record))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
