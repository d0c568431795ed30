//! Presence/playback orchestration.
//!
//! `session` holds the per-process state and the values that flow in and out
//! of a tick; `machine` holds the [`Orchestrator`] that applies the transition
//! rules and drives the renderer supervisor.

pub mod machine;
pub mod session;

pub use machine::{Orchestrator, OrchestratorSettings};
pub use session::{Mode, SessionState, TagSample, TickInput, Transition};
