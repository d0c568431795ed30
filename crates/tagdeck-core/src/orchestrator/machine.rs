//! The orchestration state machine.
//!
//! Each tick applies, in order:
//!
//! 1. new tag, or 2. tag lost (at most one of the two),
//! 3. grace window: re-presentation of the removed tag, or expiry,
//! 4. playback event change.
//!
//! A tick whose inputs match the session changes nothing and makes no
//! supervisor calls. Nothing fails a tick: a renderer failure marks the
//! renderer unknown for the next tick to retry, and a side failure (card
//! store, tag action, playback request) is logged and skipped.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::action::{NoopTagAction, TagAction};
use crate::card::CardStore;
use crate::config::Config;
use crate::error::Result;
use crate::playback::{PlaybackCommand, PlaybackControl};
use crate::snapshot::{PlaybackEvent, PlaybackSnapshot};
use crate::status::StatusLog;
use crate::supervisor::{RendererControl, RendererKind};
use crate::tag::{TagId, TagReader};

use super::session::{Mode, SessionState, TagSample, TickInput, Transition};

// ---------------------------------------------------------------------------
// OrchestratorSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub grace_window: Duration,
    pub reader_timeout: Duration,
    pub fault_threshold: u32,
    pub watchdog_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            grace_window: config.grace_window(),
            reader_timeout: config.reader.timeout(),
            fault_threshold: config.reader.fault_threshold,
            watchdog_interval: config.watchdog_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: OrchestratorSettings,
    session: SessionState,
    reader: Box<dyn TagReader + Send>,
    renderers: Box<dyn RendererControl + Send>,
    cards: Box<dyn CardStore + Send>,
    action: Box<dyn TagAction + Send>,
    playback: Option<Box<dyn PlaybackControl + Send>>,
    status: Option<StatusLog>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        reader: Box<dyn TagReader + Send>,
        renderers: Box<dyn RendererControl + Send>,
        cards: Box<dyn CardStore + Send>,
    ) -> Self {
        Self {
            settings,
            session: SessionState::default(),
            reader,
            renderers,
            cards,
            action: Box::new(NoopTagAction),
            playback: None,
            status: None,
        }
    }

    pub fn with_tag_action(mut self, action: Box<dyn TagAction + Send>) -> Self {
        self.action = action;
        self
    }

    pub fn with_playback(mut self, playback: Box<dyn PlaybackControl + Send>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn with_status_log(mut self, status: StatusLog) -> Self {
        self.status = Some(status);
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn mode(&self) -> Mode {
        self.session.mode()
    }

    /// Bring up the clock renderer. A failed spawn is retried by the next tick.
    pub fn start(&mut self, now: Instant) -> Vec<Transition> {
        self.session.last_watchdog_at = Some(now);
        let mut out = Vec::new();
        self.switch_to(RendererKind::Clock, &mut out);
        out
    }

    /// Take one reader sample with the configured timeout.
    pub fn sample(&mut self) -> TagSample {
        self.reader.poll(self.settings.reader_timeout).into()
    }

    pub fn tick(&mut self, input: TickInput) -> Vec<Transition> {
        let TickInput { now, tag, playback } = input;
        let mut out = Vec::new();

        self.reconcile(now, &mut out);

        let mut removed_now = false;
        match self.observe(tag, &mut out) {
            Some(Some(tag)) if self.session.last_seen_tag.as_ref() != Some(&tag) => {
                if self.session.grace_active(now, self.settings.grace_window)
                    && self.is_last_card(&tag)
                {
                    self.represent(tag, &mut out);
                } else {
                    self.new_tag(tag, &mut out);
                }
            }
            Some(None) => {
                if let Some(tag) = self.session.last_seen_tag.take() {
                    self.tag_lost(now, tag, &mut out);
                    removed_now = true;
                }
            }
            _ => {}
        }

        if !removed_now {
            self.grace(now, &mut out);
        }

        if let Some(snapshot) = playback {
            self.playback_changed(snapshot, &mut out);
        }

        out
    }

    /// Stop the active renderer. Used once on the way out.
    pub fn shutdown(&mut self) -> Result<()> {
        self.session.active_renderer = None;
        self.renderers.shutdown()
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// Fault accounting. Returns `None` for a faulted read so the caller
    /// keeps the previous presence.
    fn observe(&mut self, sample: TagSample, out: &mut Vec<Transition>) -> Option<Option<TagId>> {
        let observed = match sample {
            TagSample::Present(tag) => Some(tag),
            TagSample::Absent => None,
            TagSample::Fault(fault) => {
                self.session.consecutive_faults += 1;
                let count = self.session.consecutive_faults;
                if count == self.settings.fault_threshold {
                    warn!("{count} consecutive reader faults: {fault}");
                    if let Some(status) = &self.status {
                        status.error(format!("Error reading NFC card: {fault}"));
                    }
                    out.push(Transition::ReaderFaults(count));
                } else {
                    debug!("reader fault ({count} in a row): {fault}");
                }
                return None;
            }
        };
        if self.session.consecutive_faults >= self.settings.fault_threshold
            && self.settings.fault_threshold > 0
        {
            info!(
                "reader recovered after {} faulted reads",
                self.session.consecutive_faults
            );
        }
        self.session.consecutive_faults = 0;
        Some(observed)
    }

    fn new_tag(&mut self, tag: TagId, out: &mut Vec<Transition>) {
        info!("new tag {tag}");
        if let Err(e) = self.cards.record(&tag) {
            warn!("failed to persist card id {tag}: {e}");
        }
        match self.action.execute(&tag) {
            Ok(0) => debug!("tag action for {tag} finished"),
            Ok(code) => warn!("tag action for {tag} exited with code {code}"),
            Err(e) => warn!("tag action for {tag} failed: {e}"),
        }
        out.push(Transition::NewTag(tag.clone()));
        self.switch_to(RendererKind::NowPlaying, out);
        self.session.card_removed_at = None;
        self.session.last_seen_tag = Some(tag);
    }

    fn tag_lost(&mut self, now: Instant, tag: TagId, out: &mut Vec<Transition>) {
        info!("tag {tag} removed");
        out.push(Transition::TagLost(tag));
        self.send_playback(PlaybackCommand::Pause);
        self.switch_to(RendererKind::Clock, out);
        self.session.card_removed_at = Some(now);
    }

    fn grace(&mut self, now: Instant, out: &mut Vec<Transition>) {
        let Some(removed) = self.session.card_removed_at else {
            return;
        };
        if now.saturating_duration_since(removed) > self.settings.grace_window {
            info!(
                "grace window of {}s elapsed without the tag returning",
                self.settings.grace_window.as_secs()
            );
            self.session.card_removed_at = None;
            out.push(Transition::GraceExpired);
            return;
        }

        // The primary sample showed no tag (or faulted); look once more.
        match self.sample() {
            TagSample::Present(tag) if self.is_last_card(&tag) => self.represent(tag, out),
            TagSample::Present(tag) => debug!("tag {tag} seen on re-poll, handled next tick"),
            TagSample::Absent => {}
            TagSample::Fault(fault) => debug!("re-poll during grace window failed: {fault}"),
        }
    }

    fn represent(&mut self, tag: TagId, out: &mut Vec<Transition>) {
        info!("tag {tag} presented again within the grace window");
        self.session.card_removed_at = None;
        self.session.last_seen_tag = Some(tag.clone());
        out.push(Transition::TagRepresented(tag));
        if self.session.last_playback_event == Some(PlaybackEvent::Play) {
            self.switch_to(RendererKind::NowPlaying, out);
        } else {
            self.send_playback(PlaybackCommand::Play);
        }
    }

    fn playback_changed(&mut self, snapshot: PlaybackSnapshot, out: &mut Vec<Transition>) {
        let event = snapshot.event;
        if self.session.last_playback_event == Some(event) {
            return;
        }
        let from = self.session.last_playback_event.replace(event);
        info!(
            "playback event {} -> {}",
            from.map_or("none", |e| e.as_wire()),
            event.as_wire()
        );
        out.push(Transition::PlaybackChanged { from, to: event });

        if event.is_playing() {
            self.switch_to(RendererKind::NowPlaying, out);
        } else if event.is_halted() {
            if self.session.tag_present() {
                debug!("tag still on the reader, keeping now-playing view");
            } else {
                self.switch_to(RendererKind::Clock, out);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Renderer plumbing
    // -----------------------------------------------------------------------

    /// Watchdog probe and retry of a renderer left unknown by a failure.
    fn reconcile(&mut self, now: Instant, out: &mut Vec<Transition>) {
        let watchdog_due = self
            .session
            .last_watchdog_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.settings.watchdog_interval);
        if watchdog_due {
            self.session.last_watchdog_at = Some(now);
            if let Some(handle) = self.session.active_renderer.clone() {
                if !self.renderers.is_live(&handle) {
                    warn!(
                        "{} renderer (pid {}) exited unexpectedly",
                        handle.kind, handle.pid
                    );
                    self.session.active_renderer = None;
                    let kind = self.session.desired_renderer;
                    if self.ensure(kind) {
                        out.push(Transition::RendererRespawned(kind));
                    }
                    return;
                }
            }
        }

        if self.session.active_renderer.is_none() {
            let kind = self.session.desired_renderer;
            debug!("retrying {kind} renderer");
            if self.ensure(kind) {
                out.push(Transition::RendererStarted(kind));
            }
        }
    }

    /// Stop whatever is showing, then start `kind`. No-op when `kind` is
    /// already active.
    fn switch_to(&mut self, kind: RendererKind, out: &mut Vec<Transition>) {
        self.session.desired_renderer = kind;
        if self.session.active_kind() == Some(kind) {
            return;
        }
        if let Some(handle) = self.session.active_renderer.take() {
            if let Err(e) = self.renderers.stop(&handle) {
                warn!("failed to stop {} renderer: {e}", handle.kind);
            }
        }
        if self.ensure(kind) {
            out.push(Transition::RendererStarted(kind));
        }
    }

    fn ensure(&mut self, kind: RendererKind) -> bool {
        match self.renderers.ensure_running(kind) {
            Ok(handle) => {
                self.session.active_renderer = Some(handle);
                true
            }
            Err(e) => {
                warn!("could not start {kind} renderer, retrying next tick: {e}");
                self.session.active_renderer = None;
                false
            }
        }
    }

    fn send_playback(&mut self, command: PlaybackCommand) {
        let Some(playback) = self.playback.as_mut() else {
            debug!("no playback endpoint, skipping {command}");
            return;
        };
        if let Err(e) = playback.send(command) {
            warn!("playback {command} failed: {e}");
        }
    }

    /// An unreadable card store counts as a different card, so the tag takes
    /// the new-tag path.
    fn is_last_card(&self, tag: &TagId) -> bool {
        match self.cards.last() {
            Ok(last) => last.as_ref() == Some(tag),
            Err(e) => {
                warn!("cannot read last card id, treating {tag} as new: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::TagdeckError;
    use crate::supervisor::RendererHandle;
    use crate::tag::TagFault;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Ensure(RendererKind),
        Stop(RendererKind),
        StopFailed(RendererKind),
        Shutdown,
        Action(String),
        Playback(PlaybackCommand),
    }

    #[derive(Clone, Default)]
    struct Harness {
        log: Arc<Mutex<Vec<Call>>>,
        repolls: Arc<Mutex<VecDeque<std::result::Result<Option<TagId>, TagFault>>>>,
        spawn_failures: Arc<Mutex<u32>>,
        /// Termination attempts that time out before one succeeds.
        stuck_stops: Arc<Mutex<u32>>,
        spawned: Arc<Mutex<Vec<RendererKind>>>,
        crashed: Arc<Mutex<bool>>,
        card: Arc<Mutex<Option<TagId>>>,
        card_unreadable: Arc<Mutex<bool>>,
    }

    struct FakeReader(Harness);

    impl TagReader for FakeReader {
        fn poll(&mut self, _timeout: Duration) -> std::result::Result<Option<TagId>, TagFault> {
            self.0.repolls.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    /// Single-slot fake that, like the process supervisor, keeps owning a
    /// renderer whose termination timed out.
    struct FakeRenderers {
        h: Harness,
        live: Option<RendererHandle>,
        next_pid: u32,
    }

    impl FakeRenderers {
        fn terminate(&mut self) -> Result<()> {
            let Some(live) = &self.live else {
                return Ok(());
            };
            let mut stuck = self.h.stuck_stops.lock().unwrap();
            if *stuck > 0 {
                *stuck -= 1;
                self.h.log.lock().unwrap().push(Call::StopFailed(live.kind));
                return Err(TagdeckError::StopTimeout {
                    pid: live.pid,
                    waited_ms: 4000,
                });
            }
            self.h.log.lock().unwrap().push(Call::Stop(live.kind));
            self.live = None;
            Ok(())
        }
    }

    impl RendererControl for FakeRenderers {
        fn ensure_running(&mut self, kind: RendererKind) -> Result<RendererHandle> {
            self.h.log.lock().unwrap().push(Call::Ensure(kind));
            {
                let mut failures = self.h.spawn_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TagdeckError::SpawnFailed {
                        program: kind.to_string(),
                        reason: "no such file".to_string(),
                    });
                }
            }
            let crashed = *self.h.crashed.lock().unwrap();
            if let Some(live) = &self.live {
                if live.kind == kind && !crashed {
                    return Ok(live.clone());
                }
                if live.kind != kind && !crashed {
                    // Left over from a stop that timed out.
                    self.terminate()?;
                }
            }
            self.next_pid += 1;
            *self.h.crashed.lock().unwrap() = false;
            self.h.spawned.lock().unwrap().push(kind);
            let handle = RendererHandle {
                kind,
                pid: self.next_pid,
                started_at: Instant::now(),
            };
            self.live = Some(handle.clone());
            Ok(handle)
        }

        fn stop(&mut self, handle: &RendererHandle) -> Result<()> {
            if self.live.as_ref().map(|l| l.pid) == Some(handle.pid) {
                self.terminate()
            } else {
                self.h.log.lock().unwrap().push(Call::Stop(handle.kind));
                Ok(())
            }
        }

        fn is_live(&mut self, handle: &RendererHandle) -> bool {
            self.live.as_ref().map(|l| l.pid) == Some(handle.pid) && !*self.h.crashed.lock().unwrap()
        }

        fn shutdown(&mut self) -> Result<()> {
            self.h.log.lock().unwrap().push(Call::Shutdown);
            self.live = None;
            Ok(())
        }
    }

    struct FakeAction(Harness);

    impl TagAction for FakeAction {
        fn execute(&mut self, tag: &TagId) -> Result<i32> {
            self.0.log.lock().unwrap().push(Call::Action(tag.to_string()));
            Ok(0)
        }
    }

    struct FakePlayback(Harness);

    impl PlaybackControl for FakePlayback {
        fn send(&mut self, command: PlaybackCommand) -> Result<()> {
            self.0.log.lock().unwrap().push(Call::Playback(command));
            Err(TagdeckError::Playback {
                command: command.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    struct FakeCards(Harness);

    impl CardStore for FakeCards {
        fn record(&mut self, tag: &TagId) -> Result<()> {
            *self.0.card.lock().unwrap() = Some(tag.clone());
            Ok(())
        }

        fn last(&self) -> Result<Option<TagId>> {
            if *self.0.card_unreadable.lock().unwrap() {
                return Err(TagdeckError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "stream did not contain valid UTF-8",
                )));
            }
            Ok(self.0.card.lock().unwrap().clone())
        }
    }

    impl Harness {
        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(
                OrchestratorSettings::default(),
                Box::new(FakeReader(self.clone())),
                Box::new(FakeRenderers {
                    h: self.clone(),
                    live: None,
                    next_pid: 100,
                }),
                Box::new(FakeCards(self.clone())),
            )
            .with_tag_action(Box::new(FakeAction(self.clone())))
            .with_playback(Box::new(FakePlayback(self.clone())))
        }

        fn calls(&self) -> Vec<Call> {
            self.log.lock().unwrap().clone()
        }

        fn mark(&self) -> usize {
            self.log.lock().unwrap().len()
        }

        fn calls_since(&self, mark: usize) -> Vec<Call> {
            self.log.lock().unwrap()[mark..].to_vec()
        }

        fn queue_repoll(&self, tag: &str) {
            self.repolls
                .lock()
                .unwrap()
                .push_back(Ok(Some(TagId::new(tag))));
        }
    }

    fn input(now: Instant, tag: TagSample) -> TickInput {
        TickInput {
            now,
            tag,
            playback: None,
        }
    }

    fn present(tag: &str) -> TagSample {
        TagSample::Present(TagId::new(tag))
    }

    fn fault() -> TagSample {
        TagSample::Fault(TagFault("timeout waiting for ACK".to_string()))
    }

    fn with_event(now: Instant, tag: TagSample, event: PlaybackEvent) -> TickInput {
        TickInput {
            now,
            tag,
            playback: Some(PlaybackSnapshot::new(event)),
        }
    }

    fn secs(t0: Instant, s: u64) -> Instant {
        t0 + Duration::from_secs(s)
    }

    /// Replays supervisor calls and fails if a renderer was started while
    /// the other one had not been stopped.
    fn assert_one_renderer_at_a_time(calls: &[Call]) {
        let mut running: Option<RendererKind> = None;
        for call in calls {
            match call {
                Call::Ensure(kind) => {
                    if let Some(other) = running {
                        assert_eq!(other, *kind, "started {kind} while {other} running: {calls:?}");
                    }
                    running = Some(*kind);
                }
                Call::Stop(_) | Call::Shutdown => running = None,
                Call::StopFailed(kind) => running = Some(*kind),
                _ => {}
            }
        }
    }

    #[test]
    fn start_shows_clock() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let out = orch.start(Instant::now());
        assert_eq!(out, vec![Transition::RendererStarted(RendererKind::Clock)]);
        assert_eq!(h.calls(), vec![Call::Ensure(RendererKind::Clock)]);
        assert_eq!(orch.mode(), Mode::ShowingClock);
        assert_eq!(orch.session().active_kind(), Some(RendererKind::Clock));
    }

    #[test]
    fn unchanged_inputs_make_no_supervisor_calls() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        let mark = h.mark();
        for i in 1..=20 {
            let now = t0 + Duration::from_millis(100 * i);
            assert!(orch.tick(input(now, TagSample::Absent)).is_empty());
        }
        assert!(h.calls_since(mark).is_empty());

        orch.tick(input(secs(t0, 3), present("aa:bb")));
        let mark = h.mark();
        for i in 1..=20 {
            let now = secs(t0, 3) + Duration::from_millis(100 * i);
            assert!(orch.tick(input(now, present("aa:bb"))).is_empty());
        }
        assert!(h.calls_since(mark).is_empty());
    }

    #[test]
    fn new_tag_stops_clock_then_starts_now_playing() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        let mark = h.mark();

        let out = orch.tick(input(t0, present("04:A1:B2:C3")));

        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Action("04:a1:b2:c3".to_string()),
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
        assert_eq!(
            out,
            vec![
                Transition::NewTag(TagId::new("04:a1:b2:c3")),
                Transition::RendererStarted(RendererKind::NowPlaying),
            ]
        );
        assert_eq!(
            orch.session().last_seen_tag,
            Some(TagId::new("04:a1:b2:c3"))
        );
        assert_eq!(*h.card.lock().unwrap(), Some(TagId::new("04:a1:b2:c3")));
        assert_eq!(orch.mode(), Mode::ShowingNowPlaying);
    }

    #[test]
    fn swapping_tags_runs_action_without_switching() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("aa:01")));
        let mark = h.mark();

        orch.tick(input(secs(t0, 1), present("aa:02")));
        assert_eq!(h.calls_since(mark), vec![Call::Action("aa:02".to_string())]);
        assert_eq!(orch.session().last_seen_tag, Some(TagId::new("aa:02")));
    }

    #[test]
    fn removal_then_representation_resumes_without_second_action() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(with_event(t0, present("x1"), PlaybackEvent::Play));

        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 1), TagSample::Absent));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Playback(PlaybackCommand::Pause),
                Call::Stop(RendererKind::NowPlaying),
                Call::Ensure(RendererKind::Clock),
            ]
        );
        assert_eq!(out[0], Transition::TagLost(TagId::new("x1")));
        assert_eq!(orch.mode(), Mode::GraceWaitingForTag);
        assert_eq!(orch.session().last_seen_tag, None);

        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 30), present("x1")));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
        assert_eq!(out[0], Transition::TagRepresented(TagId::new("x1")));
        assert_eq!(orch.mode(), Mode::ShowingNowPlaying);
        assert!(orch.session().card_removed_at.is_none());

        let actions = h
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Action(_)))
            .count();
        assert_eq!(actions, 1);
        assert_one_renderer_at_a_time(&h.calls());
    }

    #[test]
    fn representation_while_paused_requests_play() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("x1")));
        orch.tick(input(secs(t0, 1), TagSample::Absent));

        // Primary sample misses the tag; the grace re-poll sees it.
        h.queue_repoll("x1");
        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 10), TagSample::Absent));

        assert_eq!(
            h.calls_since(mark),
            vec![Call::Playback(PlaybackCommand::Play)]
        );
        assert_eq!(out, vec![Transition::TagRepresented(TagId::new("x1"))]);
        assert_eq!(orch.mode(), Mode::ShowingClock);
        assert_eq!(orch.session().last_seen_tag, Some(TagId::new("x1")));

        // The media server then reports play and the view follows.
        let mark = h.mark();
        orch.tick(with_event(secs(t0, 11), present("x1"), PlaybackEvent::Play));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
    }

    #[test]
    fn grace_expiry_then_different_tag_is_new() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("x1")));
        orch.tick(input(secs(t0, 1), TagSample::Absent));

        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 182), TagSample::Absent));
        assert_eq!(out, vec![Transition::GraceExpired]);
        assert!(h.calls_since(mark).is_empty());
        assert_eq!(orch.mode(), Mode::ShowingClock);

        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 183), present("y2")));
        assert_eq!(out[0], Transition::NewTag(TagId::new("y2")));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Action("y2".to_string()),
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
    }

    #[test]
    fn same_tag_after_expiry_runs_action_again() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("x1")));
        orch.tick(input(secs(t0, 1), TagSample::Absent));

        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 200), present("x1")));
        assert!(out.contains(&Transition::NewTag(TagId::new("x1"))));
        assert_eq!(h.calls_since(mark)[0], Call::Action("x1".to_string()));
    }

    #[test]
    fn playback_changes_switch_renderer_without_tag() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);

        let mark = h.mark();
        orch.tick(with_event(t0, TagSample::Absent, PlaybackEvent::Pause));
        assert!(h.calls_since(mark).is_empty(), "clock already showing");

        let mark = h.mark();
        let out = orch
            .tick(with_event(secs(t0, 1), TagSample::Absent, PlaybackEvent::Play));
        assert_eq!(
            out[0],
            Transition::PlaybackChanged {
                from: Some(PlaybackEvent::Pause),
                to: PlaybackEvent::Play,
            }
        );
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );

        let mark = h.mark();
        orch.tick(with_event(secs(t0, 2), TagSample::Absent, PlaybackEvent::Pause));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Stop(RendererKind::NowPlaying),
                Call::Ensure(RendererKind::Clock),
            ]
        );
        assert_eq!(
            orch.session().last_playback_event,
            Some(PlaybackEvent::Pause)
        );
    }

    #[test]
    fn pause_with_tag_present_keeps_now_playing() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(with_event(t0, present("x1"), PlaybackEvent::Play));

        let mark = h.mark();
        orch.tick(with_event(secs(t0, 1), present("x1"), PlaybackEvent::Pause));
        assert!(h.calls_since(mark).is_empty());
        assert_eq!(orch.mode(), Mode::ShowingNowPlaying);
        assert_eq!(
            orch.session().last_playback_event,
            Some(PlaybackEvent::Pause)
        );
    }

    #[test]
    fn unchanged_snapshot_event_is_ignored() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(with_event(t0, TagSample::Absent, PlaybackEvent::Play));
        let mark = h.mark();
        let out = orch
            .tick(with_event(secs(t0, 1), TagSample::Absent, PlaybackEvent::Play));
        assert!(out.is_empty());
        assert!(h.calls_since(mark).is_empty());
    }

    #[test]
    fn transient_faults_do_not_remove_tag() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("04:a1:b2:c3")));
        let mark = h.mark();

        for i in 1..=3 {
            let out = orch
                .tick(input(t0 + Duration::from_millis(100 * i), fault()));
            assert!(out.is_empty());
        }

        assert!(h.calls_since(mark).is_empty());
        assert_eq!(
            orch.session().last_seen_tag,
            Some(TagId::new("04:a1:b2:c3"))
        );
        assert_eq!(
            orch.session().active_kind(),
            Some(RendererKind::NowPlaying)
        );
        assert_eq!(orch.session().consecutive_faults, 3);
    }

    #[test]
    fn repeated_faults_escalate_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let status = StatusLog::new(dir.path().join("status.jsonl"));
        let h = Harness::default();
        let mut orch = h.orchestrator().with_status_log(status);
        let t0 = Instant::now();
        orch.start(t0);

        let mut escalations = 0;
        for i in 1..=7 {
            let out = orch
                .tick(input(t0 + Duration::from_millis(100 * i), fault()));
            escalations += out
                .iter()
                .filter(|t| matches!(t, Transition::ReaderFaults(5)))
                .count();
        }
        assert_eq!(escalations, 1);

        let latest = StatusLog::new(dir.path().join("status.jsonl"))
            .latest()
            .unwrap()
            .unwrap();
        assert!(latest.status.starts_with("Error reading NFC card"));

        orch.tick(input(secs(t0, 1), TagSample::Absent));
        assert_eq!(orch.session().consecutive_faults, 0);
    }

    #[test]
    fn spawn_failure_is_retried_next_tick() {
        let h = Harness::default();
        *h.spawn_failures.lock().unwrap() = 1;
        let mut orch = h.orchestrator();
        let t0 = Instant::now();

        assert!(orch.start(t0).is_empty());
        assert!(orch.session().active_renderer.is_none());

        let out = orch
            .tick(input(t0 + Duration::from_millis(100), TagSample::Absent));
        assert_eq!(out, vec![Transition::RendererStarted(RendererKind::Clock)]);
        assert_eq!(
            h.calls(),
            vec![
                Call::Ensure(RendererKind::Clock),
                Call::Ensure(RendererKind::Clock),
            ]
        );

        let mark = h.mark();
        orch.tick(input(t0 + Duration::from_millis(200), TagSample::Absent));
        assert!(h.calls_since(mark).is_empty());
    }

    #[test]
    fn watchdog_respawns_crashed_renderer() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        *h.crashed.lock().unwrap() = true;

        let mark = h.mark();
        orch.tick(input(secs(t0, 1), TagSample::Absent));
        assert!(h.calls_since(mark).is_empty(), "watchdog not due yet");

        let out = orch.tick(input(secs(t0, 6), TagSample::Absent));
        assert_eq!(out, vec![Transition::RendererRespawned(RendererKind::Clock)]);
        assert_eq!(h.calls_since(mark), vec![Call::Ensure(RendererKind::Clock)]);
        assert_eq!(orch.session().active_kind(), Some(RendererKind::Clock));
    }

    #[test]
    fn shutdown_stops_renderer() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        orch.start(Instant::now());
        orch.shutdown().unwrap();
        assert_eq!(h.calls().last(), Some(&Call::Shutdown));
        assert!(orch.session().active_renderer.is_none());
    }

    #[test]
    fn resume_event_shows_now_playing() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);

        let mark = h.mark();
        orch.tick(with_event(t0, TagSample::Absent, PlaybackEvent::Resume));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
        assert_eq!(orch.mode(), Mode::ShowingNowPlaying);
    }

    #[test]
    fn different_tag_during_grace_is_new() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("x1")));
        orch.tick(input(secs(t0, 1), TagSample::Absent));

        let mark = h.mark();
        let out = orch.tick(input(secs(t0, 30), present("y2")));
        assert_eq!(
            out,
            vec![
                Transition::NewTag(TagId::new("y2")),
                Transition::RendererStarted(RendererKind::NowPlaying),
            ]
        );
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Action("y2".to_string()),
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
        assert!(orch.session().card_removed_at.is_none());
        assert_eq!(*h.card.lock().unwrap(), Some(TagId::new("y2")));

        // The window is closed, so nothing expires later.
        let out = orch.tick(input(secs(t0, 400), present("y2")));
        assert!(out.is_empty());
    }

    #[test]
    fn unreadable_card_store_takes_new_tag_path_and_keeps_playback() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("x1")));
        orch.tick(input(secs(t0, 1), TagSample::Absent));
        *h.card_unreadable.lock().unwrap() = true;

        let mark = h.mark();
        let out = orch.tick(with_event(secs(t0, 30), present("x1"), PlaybackEvent::Play));
        assert_eq!(out[0], Transition::NewTag(TagId::new("x1")));
        assert!(out.contains(&Transition::PlaybackChanged {
            from: None,
            to: PlaybackEvent::Play,
        }));
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Action("x1".to_string()),
                Call::Stop(RendererKind::Clock),
                Call::Ensure(RendererKind::NowPlaying),
            ]
        );
        assert_eq!(orch.session().last_playback_event, Some(PlaybackEvent::Play));
        assert_eq!(orch.session().last_seen_tag, Some(TagId::new("x1")));
        assert_eq!(orch.session().active_kind(), Some(RendererKind::NowPlaying));
        assert!(orch.session().card_removed_at.is_none());
    }

    #[test]
    fn unreadable_card_store_during_grace_repoll() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        orch.tick(input(t0, present("x1")));
        orch.tick(input(secs(t0, 1), TagSample::Absent));
        *h.card_unreadable.lock().unwrap() = true;
        h.queue_repoll("x1");

        let out = orch.tick(with_event(secs(t0, 10), TagSample::Absent, PlaybackEvent::Pause));
        assert_eq!(
            out,
            vec![Transition::PlaybackChanged {
                from: None,
                to: PlaybackEvent::Pause,
            }]
        );
        assert_eq!(orch.session().last_playback_event, Some(PlaybackEvent::Pause));

        // The tag is still on the reader next tick and is treated as new.
        let out = orch.tick(input(secs(t0, 11), present("x1")));
        assert_eq!(out[0], Transition::NewTag(TagId::new("x1")));
    }

    #[test]
    fn stop_timeout_leaves_renderer_unknown_and_never_double_drives() {
        let h = Harness::default();
        let mut orch = h.orchestrator();
        let t0 = Instant::now();
        orch.start(t0);
        *h.stuck_stops.lock().unwrap() = 2;

        let out = orch.tick(input(t0, present("x1")));
        assert_eq!(out, vec![Transition::NewTag(TagId::new("x1"))]);
        assert!(orch.session().active_renderer.is_none());
        assert_eq!(orch.session().desired_renderer, RendererKind::NowPlaying);
        assert_eq!(*h.spawned.lock().unwrap(), vec![RendererKind::Clock]);
        assert_eq!(
            h.calls()
                .iter()
                .filter(|c| matches!(c, Call::StopFailed(RendererKind::Clock)))
                .count(),
            2
        );

        // Next tick retries; the stuck clock is stopped before the spawn.
        let mark = h.mark();
        let out = orch.tick(input(t0 + Duration::from_millis(100), present("x1")));
        assert_eq!(out, vec![Transition::RendererStarted(RendererKind::NowPlaying)]);
        assert_eq!(
            h.calls_since(mark),
            vec![
                Call::Ensure(RendererKind::NowPlaying),
                Call::Stop(RendererKind::Clock),
            ]
        );
        assert_eq!(
            *h.spawned.lock().unwrap(),
            vec![RendererKind::Clock, RendererKind::NowPlaying]
        );
        assert_eq!(orch.session().active_kind(), Some(RendererKind::NowPlaying));

        let mark = h.mark();
        orch.tick(input(t0 + Duration::from_millis(200), present("x1")));
        assert!(h.calls_since(mark).is_empty());
    }
}
