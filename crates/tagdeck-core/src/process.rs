//! Child process plumbing shared by the renderer supervisor, companions, the
//! tag reader helper and the tag action.
//!
//! Every wait here is bounded: graceful termination is SIGTERM followed by a
//! polled wait, escalating to SIGKILL when the grace period runs out.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Result, TagdeckError};

/// Interval between `try_wait` probes while waiting on a deadline.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on the wait after SIGKILL. The kernel reaps quickly; anything
/// longer means the process is stuck in uninterruptible sleep.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Minimum time given to collect stdout once a one-shot command has exited.
const DRAIN_FLOOR: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// ManagedChild
// ---------------------------------------------------------------------------

/// A spawned long-running child owned by exactly one supervisor.
#[derive(Debug)]
pub struct ManagedChild {
    label: String,
    child: Child,
    started_at: Instant,
}

impl ManagedChild {
    /// Spawn `argv` with stdin closed and stdout/stderr inherited.
    pub fn spawn(label: impl Into<String>, argv: &[String], cwd: Option<&Path>) -> Result<Self> {
        let label = label.into();
        let mut cmd = build_command(argv)?;
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| TagdeckError::SpawnFailed {
            program: argv[0].clone(),
            reason: e.to_string(),
        })?;
        debug!("spawned {label} (pid {})", child.id());
        Ok(Self {
            label,
            child,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Non-blocking liveness probe. Reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} (pid {}) exited: {status}", self.label, self.pid());
                false
            }
            Err(e) => {
                warn!("{} (pid {}) liveness probe failed: {e}", self.label, self.pid());
                false
            }
        }
    }

    /// Poll until the child exits or `timeout` elapses. `Ok(None)` means it
    /// is still running.
    pub fn wait_deadline(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        wait_child(&mut self.child, timeout)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. On `Ok` the process has
    /// been reaped and is guaranteed gone.
    pub fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let pid = self.pid();
        debug!("sending SIGTERM to {} (pid {pid})", self.label);
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {}
            // Exited between the probe and the signal.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => return Err(TagdeckError::Signal(e)),
        }

        if self.wait_deadline(grace)?.is_some() {
            return Ok(());
        }

        warn!(
            "{} (pid {pid}) ignored SIGTERM for {}ms, sending SIGKILL",
            self.label,
            grace.as_millis()
        );
        // kill() on an already-reaped child returns InvalidInput; treat as gone.
        if let Err(e) = self.child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(TagdeckError::Io(e));
            }
        }
        match self.wait_deadline(KILL_WAIT)? {
            Some(_) => Ok(()),
            None => Err(TagdeckError::StopTimeout {
                pid,
                waited_ms: (grace + KILL_WAIT).as_millis() as u64,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

/// Result of a bounded one-shot command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or timed out.
    pub code: Option<i32>,
    pub stdout: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

/// Run `argv` to completion with a hard deadline, capturing stdout.
///
/// The command runs in its own process group. If it outlives `timeout` the
/// whole group is killed, so helpers that fork cannot hold the caller past
/// the deadline. Output still held open by a background process after the
/// command exits is given up at the deadline.
pub fn run_with_deadline(
    argv: &[String],
    env: &[(&str, &str)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let deadline = Instant::now() + timeout;
    let mut cmd = build_command(argv)?;
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| TagdeckError::SpawnFailed {
        program: argv[0].clone(),
        reason: e.to_string(),
    })?;
    let stdout = drain_stdout(&mut child);

    let (code, timed_out) = match wait_child(&mut child, timeout)? {
        Some(status) => (status.code(), false),
        None => {
            kill_group(&mut child)?;
            wait_child(&mut child, KILL_WAIT)?;
            (None, true)
        }
    };

    let wait = deadline.saturating_duration_since(Instant::now()).max(DRAIN_FLOOR);
    let stdout = match stdout.recv_timeout(wait) {
        Ok(text) => text,
        Err(_) => {
            debug!("{} left its stdout open, output dropped", argv[0]);
            String::new()
        }
    };

    Ok(CommandOutput {
        code,
        stdout,
        timed_out,
    })
}

/// Run a setup command to completion; non-zero exit is an error.
pub fn run_checked(argv: &[String], timeout: Duration) -> Result<()> {
    let output = run_with_deadline(argv, &[], timeout)?;
    if output.success() {
        return Ok(());
    }
    let reason = if output.timed_out {
        format!("timed out after {}ms", timeout.as_millis())
    } else {
        match output.code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        }
    };
    Err(TagdeckError::SpawnFailed {
        program: argv[0].clone(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        TagdeckError::InvalidConfig("command must have at least one element".to_string())
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) -> Result<()> {
    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => {
            warn!("killpg({}) failed: {e}", child.id());
            match child.kill() {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(TagdeckError::Io(e)),
            }
        }
    }
}

/// Read stdout to EOF on a separate thread so the caller can stop waiting.
fn drain_stdout(child: &mut Child) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut out) = child.stdout.take() {
        std::thread::spawn(move || {
            let mut text = String::new();
            if let Err(e) = out.read_to_string(&mut text) {
                debug!("stdout read failed: {e}");
            }
            let _ = tx.send(text);
        });
    } else {
        let _ = tx.send(String::new());
    }
    rx
}

fn wait_child(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn spawn_and_terminate_sleep() {
        let mut child = ManagedChild::spawn("sleeper", &argv(&["sleep", "30"]), None).unwrap();
        assert!(child.is_alive());
        child.terminate(Duration::from_secs(2)).unwrap();
        assert!(!child.is_alive());
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let mut child = ManagedChild::spawn(
            "stubborn",
            &argv(&["sh", "-c", "trap '' TERM; sleep 30"]),
            None,
        )
        .unwrap();
        // Give the shell a moment to install the trap.
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        child.terminate(Duration::from_millis(200)).unwrap();
        assert!(!child.is_alive());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn terminate_exited_child_is_ok() {
        let mut child = ManagedChild::spawn("quick", &argv(&["true"]), None).unwrap();
        child.wait_deadline(Duration::from_secs(2)).unwrap();
        assert!(!child.is_alive());
        child.terminate(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn spawn_missing_binary_is_spawn_error() {
        let err = ManagedChild::spawn("ghost", &argv(&["__nonexistent_renderer_xyz__"]), None)
            .unwrap_err();
        match err {
            TagdeckError::SpawnFailed { program, .. } => {
                assert_eq!(program, "__nonexistent_renderer_xyz__")
            }
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(matches!(
            ManagedChild::spawn("empty", &[], None),
            Err(TagdeckError::InvalidConfig(_))
        ));
    }

    #[test]
    fn run_with_deadline_captures_stdout() {
        let out = run_with_deadline(
            &argv(&["sh", "-c", "echo \"$TAG\""]),
            &[("TAG", "04:a1")],
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "04:a1");
    }

    #[test]
    fn run_with_deadline_kills_on_timeout() {
        let started = Instant::now();
        let out = run_with_deadline(&argv(&["sleep", "30"]), &[], Duration::from_millis(100))
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn run_with_deadline_kills_forked_helpers() {
        let started = Instant::now();
        let out = run_with_deadline(
            &argv(&["sh", "-c", "sleep 3; echo done"]),
            &[],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(out.timed_out);
        assert!(out.stdout.is_empty());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "blocked for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn run_with_deadline_does_not_wait_on_background_output() {
        let started = Instant::now();
        let out = run_with_deadline(
            &argv(&["sh", "-c", "sleep 3 & exit 0"]),
            &[],
            Duration::from_millis(300),
        )
        .unwrap();
        assert!(!out.timed_out);
        assert_eq!(out.code, Some(0));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn run_checked_reports_exit_code() {
        let err = run_checked(&argv(&["sh", "-c", "exit 3"]), Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("exited with code 3"), "{err}");
        run_checked(&argv(&["true"]), Duration::from_secs(5)).unwrap();
    }
}
