//! Renderer process supervision.
//!
//! The display is a single shared device, so the supervisor owns at most one
//! renderer child at a time and always stops the current one before spawning
//! the next. Companions (listener helpers) are supervised separately and do
//! not count towards that limit.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CompanionConfig, RenderersConfig};
use crate::error::Result;
use crate::process::ManagedChild;

// ---------------------------------------------------------------------------
// RendererKind / RendererHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    Clock,
    NowPlaying,
}

impl RendererKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RendererKind::Clock => "clock",
            RendererKind::NowPlaying => "now_playing",
        }
    }
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a spawned renderer. Only the supervisor holds the process
/// itself; handles are plain values that can go stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererHandle {
    pub kind: RendererKind,
    pub pid: u32,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------------
// RendererControl
// ---------------------------------------------------------------------------

pub trait RendererControl {
    /// Return the live renderer of `kind`, spawning it (after stopping any
    /// other renderer) when none is alive.
    fn ensure_running(&mut self, kind: RendererKind) -> Result<RendererHandle>;

    /// Terminate the renderer behind `handle` and wait for it to exit.
    /// A stale handle is a no-op.
    fn stop(&mut self, handle: &RendererHandle) -> Result<()>;

    /// Non-blocking liveness probe.
    fn is_live(&mut self, handle: &RendererHandle) -> bool;

    /// Stop whatever is running.
    fn shutdown(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

pub struct ProcessSupervisor {
    clock: Vec<String>,
    now_playing: Vec<String>,
    stop_timeout: Duration,
    cwd: Option<PathBuf>,
    current: Option<(RendererHandle, ManagedChild)>,
}

impl ProcessSupervisor {
    pub fn new(config: &RenderersConfig) -> Self {
        Self {
            clock: config.clock.command.clone(),
            now_playing: config.now_playing.command.clone(),
            stop_timeout: config.stop_timeout(),
            cwd: None,
            current: None,
        }
    }

    /// Working directory for spawned renderers.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn argv(&self, kind: RendererKind) -> &[String] {
        match kind {
            RendererKind::Clock => &self.clock,
            RendererKind::NowPlaying => &self.now_playing,
        }
    }

    /// The renderer currently owned, if any (may have exited since the last
    /// probe).
    pub fn current(&self) -> Option<&RendererHandle> {
        self.current.as_ref().map(|(h, _)| h)
    }

    fn terminate_current(&mut self) -> Result<()> {
        let Some((handle, mut child)) = self.current.take() else {
            return Ok(());
        };
        info!("stopping {} renderer (pid {})", handle.kind, handle.pid);
        match child.terminate(self.stop_timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Still possibly alive: keep ownership so the next call retries.
                self.current = Some((handle, child));
                Err(e)
            }
        }
    }
}

impl RendererControl for ProcessSupervisor {
    fn ensure_running(&mut self, kind: RendererKind) -> Result<RendererHandle> {
        if let Some((handle, child)) = self.current.as_mut() {
            let alive = child.is_alive();
            if alive && handle.kind == kind {
                return Ok(handle.clone());
            }
            if !alive {
                warn!(
                    "{} renderer (pid {}) is no longer running",
                    handle.kind, handle.pid
                );
                self.current = None;
            }
        }
        // Anything still owned here is the other renderer.
        self.terminate_current()?;

        let argv = self.argv(kind).to_vec();
        let child = ManagedChild::spawn(kind.as_str(), &argv, self.cwd.as_deref())?;
        let handle = RendererHandle {
            kind,
            pid: child.pid(),
            started_at: child.started_at(),
        };
        info!("started {kind} renderer (pid {})", handle.pid);
        self.current = Some((handle.clone(), child));
        Ok(handle)
    }

    fn stop(&mut self, handle: &RendererHandle) -> Result<()> {
        match &self.current {
            Some((current, _)) if current.pid == handle.pid => self.terminate_current(),
            _ => Ok(()),
        }
    }

    fn is_live(&mut self, handle: &RendererHandle) -> bool {
        match self.current.as_mut() {
            Some((current, child)) if current.pid == handle.pid => child.is_alive(),
            _ => false,
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.terminate_current()
    }
}

// ---------------------------------------------------------------------------
// CompanionSet
// ---------------------------------------------------------------------------

struct Companion {
    config: CompanionConfig,
    child: Option<ManagedChild>,
}

/// Helper processes started at boot and restarted when they exit.
pub struct CompanionSet {
    companions: Vec<Companion>,
    stop_timeout: Duration,
    cwd: Option<PathBuf>,
}

impl CompanionSet {
    pub fn new(configs: &[CompanionConfig], stop_timeout: Duration) -> Self {
        Self {
            companions: configs
                .iter()
                .map(|c| Companion {
                    config: c.clone(),
                    child: None,
                })
                .collect(),
            stop_timeout,
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn len(&self) -> usize {
        self.companions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.companions.is_empty()
    }

    pub fn start_all(&mut self) {
        self.ensure_all();
    }

    /// Spawn every companion that is not running. Returns how many were
    /// (re)started.
    pub fn ensure_all(&mut self) -> usize {
        let mut started = 0;
        for companion in &mut self.companions {
            if let Some(child) = companion.child.as_mut() {
                if child.is_alive() {
                    continue;
                }
                warn!("companion {} exited, restarting", companion.config.name);
            }
            match ManagedChild::spawn(
                companion.config.name.as_str(),
                &companion.config.command,
                self.cwd.as_deref(),
            ) {
                Ok(child) => {
                    info!(
                        "started companion {} (pid {})",
                        companion.config.name,
                        child.pid()
                    );
                    companion.child = Some(child);
                    started += 1;
                }
                Err(e) => {
                    warn!("companion {} failed to start: {e}", companion.config.name);
                    companion.child = None;
                }
            }
        }
        started
    }

    /// Pids of companions currently alive.
    pub fn live_pids(&mut self) -> Vec<u32> {
        self.companions
            .iter_mut()
            .filter_map(|c| c.child.as_mut())
            .filter_map(|child| child.is_alive().then(|| child.pid()))
            .collect()
    }

    pub fn stop_all(&mut self) {
        for companion in &mut self.companions {
            if let Some(mut child) = companion.child.take() {
                if let Err(e) = child.terminate(self.stop_timeout) {
                    warn!("companion {} did not stop: {e}", companion.config.name);
                }
            }
        }
    }
}
