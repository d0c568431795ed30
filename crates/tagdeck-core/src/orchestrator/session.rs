use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::snapshot::{PlaybackEvent, PlaybackSnapshot};
use crate::supervisor::{RendererHandle, RendererKind};
use crate::tag::{TagFault, TagId};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One reader sample. A fault is kept distinct from `Absent` so that a bad
/// read is never mistaken for the tag being lifted off the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSample {
    Present(TagId),
    Absent,
    Fault(TagFault),
}

impl From<Result<Option<TagId>, TagFault>> for TagSample {
    fn from(poll: Result<Option<TagId>, TagFault>) -> Self {
        match poll {
            Ok(Some(tag)) => TagSample::Present(tag),
            Ok(None) => TagSample::Absent,
            Err(fault) => TagSample::Fault(fault),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickInput {
    /// Monotonic time of the sample.
    pub now: Instant,
    pub tag: TagSample,
    /// `Some` only when the snapshot changed since the previous tick.
    pub playback: Option<PlaybackSnapshot>,
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ShowingClock,
    ShowingNowPlaying,
    /// A tag was just removed and may still come back.
    GraceWaitingForTag,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::ShowingClock => "showing_clock",
            Mode::ShowingNowPlaying => "showing_now_playing",
            Mode::GraceWaitingForTag => "grace_waiting_for_tag",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// What a tick did. Steady-state ticks return none.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    NewTag(TagId),
    TagLost(TagId),
    TagRepresented(TagId),
    GraceExpired,
    PlaybackChanged {
        from: Option<PlaybackEvent>,
        to: PlaybackEvent,
    },
    RendererStarted(RendererKind),
    /// The watchdog found the renderer dead and started it again.
    RendererRespawned(RendererKind),
    ReaderFaults(u32),
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_seen_tag: Option<TagId>,
    /// `None` before start and whenever a spawn or stop failed; the next
    /// tick retries `desired_renderer`.
    pub active_renderer: Option<RendererHandle>,
    pub desired_renderer: RendererKind,
    pub card_removed_at: Option<Instant>,
    pub last_playback_event: Option<PlaybackEvent>,
    pub consecutive_faults: u32,
    pub last_watchdog_at: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            last_seen_tag: None,
            active_renderer: None,
            desired_renderer: RendererKind::Clock,
            card_removed_at: None,
            last_playback_event: None,
            consecutive_faults: 0,
            last_watchdog_at: None,
        }
    }
}

impl SessionState {
    pub fn mode(&self) -> Mode {
        if self.card_removed_at.is_some() {
            return Mode::GraceWaitingForTag;
        }
        match self.desired_renderer {
            RendererKind::Clock => Mode::ShowingClock,
            RendererKind::NowPlaying => Mode::ShowingNowPlaying,
        }
    }

    /// A faulted read keeps the previous answer, so this is the last known
    /// presence rather than the raw sample.
    pub fn tag_present(&self) -> bool {
        self.last_seen_tag.is_some()
    }

    pub fn grace_active(&self, now: Instant, window: Duration) -> bool {
        self.card_removed_at
            .is_some_and(|removed| now.saturating_duration_since(removed) <= window)
    }

    pub fn active_kind(&self) -> Option<RendererKind> {
        self.active_renderer.as_ref().map(|h| h.kind)
    }
}
