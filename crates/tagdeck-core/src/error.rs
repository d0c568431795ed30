use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagdeckError {
    #[error("not initialized: run 'tagdeck init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("process {pid} did not exit within {waited_ms}ms")]
    StopTimeout { pid: u32, waited_ms: u64 },

    #[error("snapshot read failed: {0}")]
    SnapshotRead(String),

    #[error("playback request '{command}' failed: {reason}")]
    Playback { command: String, reason: String },

    #[error("tag action failed: {0}")]
    TagAction(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, TagdeckError>;
