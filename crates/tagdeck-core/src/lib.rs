pub mod action;
pub mod card;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod playback;
pub mod process;
pub mod snapshot;
pub mod status;
pub mod supervisor;
pub mod tag;

pub use error::{Result, TagdeckError};
