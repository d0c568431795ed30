use crate::error::{Result, TagdeckError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ReaderConfig
// ---------------------------------------------------------------------------

/// Tag reader poll helper. The helper is run once per poll with the timeout
/// in milliseconds as its last argument and prints the tag UID (or nothing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_reader_command")]
    pub command: Vec<String>,
    #[serde(default = "default_reader_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive faulted reads before a status record is raised.
    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,
}

fn default_reader_command() -> Vec<String> {
    vec!["tagdeck-nfc-poll".to_string()]
}

fn default_reader_timeout_ms() -> u64 {
    100
}

fn default_fault_threshold() -> u32 {
    5
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            command: default_reader_command(),
            timeout_ms: default_reader_timeout_ms(),
            fault_threshold: default_fault_threshold(),
        }
    }
}

impl ReaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// RenderersConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderersConfig {
    #[serde(default = "default_clock")]
    pub clock: ProgramConfig,
    #[serde(default = "default_now_playing")]
    pub now_playing: ProgramConfig,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_clock() -> ProgramConfig {
    ProgramConfig {
        command: vec!["python".to_string(), "Time.py".to_string()],
    }
}

fn default_now_playing() -> ProgramConfig {
    ProgramConfig {
        command: vec!["python".to_string(), "fb.py".to_string()],
    }
}

fn default_stop_timeout_ms() -> u64 {
    3000
}

impl Default for RenderersConfig {
    fn default() -> Self {
        Self {
            clock: default_clock(),
            now_playing: default_now_playing(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl RenderersConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// TagActionConfig
// ---------------------------------------------------------------------------

/// Program run once per newly detected tag. Receives the tag id as its last
/// argument and in `TAGDECK_TAG_ID`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagActionConfig {
    pub command: Vec<String>,
    #[serde(default = "default_action_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_action_timeout_secs() -> u64 {
    15
}

impl TagActionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// PlaybackConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_playback_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:32500".to_string()
}

fn default_playback_timeout_ms() -> u64 {
    1000
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_playback_timeout_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// SnapshotConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
    /// Only events from this player title count. `None` accepts every player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(paths::SNAPSHOT_FILE)
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
            player: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DisplayConfig / CompanionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisplayConfig {
    /// Run once before the first renderer starts (e.g. `fbset`). Startup
    /// aborts if it exits non-zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_command: Option<Vec<String>>,
}

/// Long-running helper kept alive next to the renderers, such as the
/// webhook listener that writes the playback snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanionConfig {
    pub name: String,
    pub command: Vec<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_persist_card_id")]
    pub persist_card_id: bool,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub renderers: RenderersConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_action: Option<TagActionConfig>,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub companions: Vec<CompanionConfig>,
}

fn default_version() -> u32 {
    1
}

fn default_tick_ms() -> u64 {
    100
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_grace_secs() -> u64 {
    180
}

fn default_watchdog_secs() -> u64 {
    5
}

fn default_persist_card_id() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            tick_ms: default_tick_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            grace_secs: default_grace_secs(),
            watchdog_secs: default_watchdog_secs(),
            persist_card_id: default_persist_card_id(),
            reader: ReaderConfig::default(),
            renderers: RenderersConfig::default(),
            tag_action: None,
            playback: PlaybackConfig::default(),
            snapshot: SnapshotConfig::default(),
            display: DisplayConfig::default(),
            companions: Vec::new(),
        }
    }
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn snapshot_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.snapshot.path)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(TagdeckError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Like [`Config::load`] but fails on error-level validation findings.
    pub fn load_validated(root: &Path) -> Result<Self> {
        let cfg = Self::load(root)?;
        let errors: Vec<String> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(TagdeckError::InvalidConfig(errors.join("; ")));
        }
        Ok(cfg)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Every program must have an argv[0]; missing binaries only warn
        //    because the supervisor retries spawns every tick.
        let mut programs: Vec<(String, &[String])> = vec![
            ("reader".to_string(), self.reader.command.as_slice()),
            ("renderers.clock".to_string(), self.renderers.clock.command.as_slice()),
            (
                "renderers.now_playing".to_string(),
                self.renderers.now_playing.command.as_slice(),
            ),
        ];
        if let Some(action) = &self.tag_action {
            programs.push(("tag_action".to_string(), action.command.as_slice()));
        }
        if let Some(setup) = &self.display.setup_command {
            programs.push(("display.setup_command".to_string(), setup.as_slice()));
        }
        for companion in &self.companions {
            programs.push((
                format!("companions.{}", companion.name),
                companion.command.as_slice(),
            ));
        }

        for (label, argv) in programs {
            match argv.first() {
                None => warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("{label} has an empty command"),
                }),
                Some(program) if program.trim().is_empty() => warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("{label} has an empty command"),
                }),
                Some(program) => {
                    if which::which(program).is_err() && !Path::new(program).exists() {
                        warnings.push(ConfigWarning {
                            level: WarnLevel::Warning,
                            message: format!("{label}: '{program}' not found on PATH"),
                        });
                    }
                }
            }
        }

        // 2. Timing sanity
        if self.tick_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "tick_ms must be greater than zero".to_string(),
            });
        }
        if self.reader.timeout_ms > self.tick_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "reader.timeout_ms ({}) exceeds tick_ms ({}); ticks will overrun",
                    self.reader.timeout_ms, self.tick_ms
                ),
            });
        }
        if self.reader.fault_threshold == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "reader.fault_threshold is 0; every faulted read raises a status record"
                    .to_string(),
            });
        }
        if self.playback.timeout_ms > 5000 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "playback.timeout_ms ({}) is above 5000; pause/play calls stall the loop",
                    self.playback.timeout_ms
                ),
            });
        }

        // 3. Playback endpoint
        if !self.playback.base_url.starts_with("http://")
            && !self.playback.base_url.starts_with("https://")
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "playback.base_url '{}' must start with http:// or https://",
                    self.playback.base_url
                ),
            });
        }

        // 4. Companion names must be unique
        let mut seen = std::collections::HashSet::new();
        for companion in &self.companions {
            if !seen.insert(companion.name.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("duplicate companion name '{}'", companion.name),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
