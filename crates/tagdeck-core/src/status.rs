//! Append-only status records shown by the clock renderer.
//!
//! One JSON object per line:
//! `{"status": "NFC is up!", "timestamp": "2024-05-01 12:00:00", "level": "info"}`.
//! The timestamp is local wall time because it is displayed on screen.

use std::path::PathBuf;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::Result;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: String,
    pub timestamp: String,
    #[serde(default = "default_level")]
    pub level: StatusLevel,
}

fn default_level() -> StatusLevel {
    StatusLevel::Info
}

impl StatusRecord {
    pub fn now(level: StatusLevel, status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            level,
        }
    }

    pub fn parsed_timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()
    }
}

pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn info(&self, status: impl Into<String>) {
        self.record(StatusRecord::now(StatusLevel::Info, status));
    }

    pub fn error(&self, status: impl Into<String>) {
        self.record(StatusRecord::now(StatusLevel::Error, status));
    }

    /// Append a record. A failed append is logged and otherwise ignored; the
    /// status channel never interrupts the control loop.
    pub fn record(&self, record: StatusRecord) {
        match record.level {
            StatusLevel::Info => info!("status: {}", record.status),
            StatusLevel::Error => error!("status: {}", record.status),
        }
        if let Err(e) = self.append(&record) {
            warn!("failed to append status to {}: {e}", self.path.display());
        }
    }

    fn append(&self, record: &StatusRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        crate::io::append_text(&self.path, &line)
    }

    /// Newest record by timestamp. Malformed lines are skipped.
    pub fn latest(&self) -> Result<Option<StatusRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let latest = data
            .lines()
            .filter_map(|line| serde_json::from_str::<StatusRecord>(line).ok())
            .filter_map(|r| r.parsed_timestamp().map(|t| (t, r)))
            .max_by_key(|(t, _)| *t)
            .map(|(_, r)| r);
        Ok(latest)
    }
}
