//! Playback snapshot written by the external media listener.
//!
//! The file is replaced wholesale by its writer. [`SnapshotStore::poll`]
//! stats it every tick and only parses when the modification time or length
//! moved, so an idle snapshot costs one `stat` per tick.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TagdeckError};

// ---------------------------------------------------------------------------
// PlaybackEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEvent {
    Unknown,
    Play,
    Resume,
    Pause,
    Stop,
}

impl PlaybackEvent {
    /// Map a media-server event name (`media.play`, ...) onto the enum.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "media.play" => Self::Play,
            "media.resume" => Self::Resume,
            "media.pause" => Self::Pause,
            "media.stop" => Self::Stop,
            _ => Self::Unknown,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Play => "media.play",
            Self::Resume => "media.resume",
            Self::Pause => "media.pause",
            Self::Stop => "media.stop",
        }
    }

    /// Events that mean something is audibly playing.
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Play | Self::Resume)
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Pause | Self::Stop)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// On-disk record as written by the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub player: PlayerInfo,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// PlaybackSnapshot
// ---------------------------------------------------------------------------

/// Parsed, read-only view of the latest playback record.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub event: PlaybackEvent,
    pub player: Option<String>,
    pub metadata: serde_json::Value,
    /// Writer-side timestamp, when present and parseable.
    pub observed_at: Option<NaiveDateTime>,
}

impl PlaybackSnapshot {
    pub fn new(event: PlaybackEvent) -> Self {
        Self {
            event,
            player: None,
            metadata: serde_json::Value::Null,
            observed_at: None,
        }
    }

    pub fn from_record(record: SnapshotRecord) -> Self {
        Self {
            event: record
                .event
                .as_deref()
                .map(PlaybackEvent::from_wire)
                .unwrap_or(PlaybackEvent::Unknown),
            player: record.player.title,
            metadata: record.metadata,
            observed_at: record.timestamp.as_deref().and_then(parse_timestamp),
        }
    }

    pub fn to_record(&self) -> SnapshotRecord {
        SnapshotRecord {
            event: Some(self.event.as_wire().to_string()),
            player: PlayerInfo {
                title: self.player.clone(),
            },
            metadata: self.metadata.clone(),
            timestamp: self
                .observed_at
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
        }
    }

    /// Track title for status output (`metadata.title`).
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(|v| v.as_str())
    }

    /// Artist for status output (`metadata.grandparentTitle`).
    pub fn artist(&self) -> Option<&str> {
        self.metadata
            .get("grandparentTitle")
            .and_then(|v| v.as_str())
    }
}

/// Accepts RFC 3339 and the offset-less ISO form (`2024-05-01T12:00:00.123456`).
fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// File version used for cheap change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

pub struct SnapshotStore {
    path: PathBuf,
    player_filter: Option<String>,
    /// `None` until the first successful stat; `Some(None)` after the file
    /// has been seen missing.
    last_version: Option<Option<SnapshotVersion>>,
    last_timestamp: Option<NaiveDateTime>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            player_filter: None,
            last_version: None,
            last_timestamp: None,
        }
    }

    /// Ignore records whose `player.title` differs from `player`.
    pub fn with_player_filter(mut self, player: Option<String>) -> Self {
        self.player_filter = player;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the snapshot if it changed since the previous poll.
    ///
    /// `Ok(None)` covers "unchanged", "filtered out" and "still missing".
    /// Errors are reported once per file version; the caller keeps its last
    /// known event.
    pub fn poll(&mut self) -> Result<Option<PlaybackSnapshot>> {
        let version = match std::fs::metadata(&self.path) {
            Ok(meta) => Some(SnapshotVersion {
                modified: meta.modified().ok(),
                len: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(TagdeckError::Io(e)),
        };

        if self.last_version == Some(version) {
            return Ok(None);
        }
        let previous = self.last_version.replace(version);

        let Some(_) = version else {
            return match previous {
                // Disappeared after having been present.
                Some(Some(_)) => Err(TagdeckError::SnapshotRead(format!(
                    "{} was removed",
                    self.path.display()
                ))),
                _ => {
                    debug!("snapshot {} not present yet", self.path.display());
                    Ok(None)
                }
            };
        };

        let snapshot = self.read()?.ok_or_else(|| {
            TagdeckError::SnapshotRead(format!("{} vanished mid-read", self.path.display()))
        })?;

        if let (Some(filter), player) = (&self.player_filter, &snapshot.player) {
            if player.as_deref() != Some(filter.as_str()) {
                debug!(
                    "ignoring snapshot for player {:?} (want {filter})",
                    player.as_deref()
                );
                return Ok(None);
            }
        }

        // Same embedded timestamp means the writer rewrote identical content.
        if snapshot.observed_at.is_some() && snapshot.observed_at == self.last_timestamp {
            return Ok(None);
        }
        self.last_timestamp = snapshot.observed_at;

        Ok(Some(snapshot))
    }

    /// Read and parse the file without touching change tracking.
    pub fn read(&self) -> Result<Option<PlaybackSnapshot>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TagdeckError::Io(e)),
        };
        let record: SnapshotRecord = serde_json::from_str(&data).map_err(|e| {
            TagdeckError::SnapshotRead(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Some(PlaybackSnapshot::from_record(record)))
    }

    /// Replace the file atomically. Used by tooling and tests; in production
    /// the external listener is the writer.
    pub fn write(&self, snapshot: &PlaybackSnapshot) -> Result<()> {
        let data = serde_json::to_string_pretty(&snapshot.to_record())?;
        crate::io::atomic_write(&self.path, data.as_bytes())
    }
}
