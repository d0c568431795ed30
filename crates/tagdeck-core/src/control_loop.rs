//! Fixed-period driver.
//!
//! Each tick polls the snapshot store, samples the reader and feeds both into
//! the [`Orchestrator`]. A panicking tick is logged and followed by the error
//! back-off; nothing short of the shutdown flag ends the loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::orchestrator::{Orchestrator, TickInput, Transition};
use crate::snapshot::{PlaybackSnapshot, SnapshotStore};
use crate::supervisor::CompanionSet;

/// Upper bound on a single sleep so a shutdown request is seen promptly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

pub struct ControlLoop {
    orchestrator: Orchestrator,
    snapshots: SnapshotStore,
    /// Polled snapshot not yet applied by a completed tick.
    pending: Option<PlaybackSnapshot>,
    companions: Option<CompanionSet>,
    tick: Duration,
    error_backoff: Duration,
    watchdog_interval: Duration,
    last_companion_check: Option<Instant>,
}

impl ControlLoop {
    pub fn new(orchestrator: Orchestrator, snapshots: SnapshotStore, config: &Config) -> Self {
        Self {
            orchestrator,
            snapshots,
            pending: None,
            companions: None,
            tick: config.tick(),
            error_backoff: config.error_backoff(),
            watchdog_interval: config.watchdog_interval(),
            last_companion_check: None,
        }
    }

    /// Hand over companion processes; they are restarted on the watchdog
    /// interval and stopped when the loop ends.
    pub fn with_companions(mut self, companions: CompanionSet) -> Self {
        self.companions = Some(companions);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// One tick at `now`. A snapshot change is only consumed once the tick
    /// completes, so a panic mid-tick replays it on the next one.
    pub fn run_once(&mut self, now: Instant) -> Vec<Transition> {
        match self.snapshots.poll() {
            Ok(Some(snapshot)) => self.pending = Some(snapshot),
            Ok(None) => {}
            Err(e) => warn!("snapshot unreadable, keeping last event: {e}"),
        }
        let tag = self.orchestrator.sample();
        let playback = self.pending.clone();
        let transitions = self.orchestrator.tick(TickInput { now, tag, playback });
        self.pending = None;
        for transition in &transitions {
            debug!("transition: {transition:?}");
        }
        transitions
    }

    /// Tick until `shutdown` is set, then stop the renderer and companions.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(
            "control loop starting (tick {}ms, mode {})",
            self.tick.as_millis(),
            self.orchestrator.mode()
        );
        self.orchestrator.start(Instant::now());
        if let Some(companions) = self.companions.as_mut() {
            companions.start_all();
        }
        self.last_companion_check = Some(Instant::now());

        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_once(started)));
            let pause = match outcome {
                Ok(_) => self.tick.saturating_sub(started.elapsed()),
                Err(payload) => {
                    error!("tick panicked: {}", panic_message(payload.as_ref()));
                    self.error_backoff
                }
            };
            self.check_companions(Instant::now());
            sleep_unless(pause, shutdown);
        }

        info!("shutdown requested, stopping renderers");
        self.shutdown()
    }

    /// Stop the active renderer and every companion.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(companions) = self.companions.as_mut() {
            companions.stop_all();
        }
        self.orchestrator.shutdown()
    }

    fn check_companions(&mut self, now: Instant) {
        let Some(companions) = self.companions.as_mut() else {
            return;
        };
        let due = self
            .last_companion_check
            .map_or(true, |at| now.saturating_duration_since(at) >= self.watchdog_interval);
        if due {
            self.last_companion_check = Some(now);
            let restarted = companions.ensure_all();
            if restarted > 0 {
                info!("restarted {restarted} companion process(es)");
            }
        }
    }
}

fn sleep_unless(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        std::thread::sleep(left.min(SHUTDOWN_POLL));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
