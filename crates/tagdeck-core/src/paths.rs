use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TAGDECK_DIR: &str = ".tagdeck";

pub const CONFIG_FILE: &str = ".tagdeck/config.yaml";
pub const SNAPSHOT_FILE: &str = ".tagdeck/currentlyplaying.json";
pub const CARD_ID_FILE: &str = ".tagdeck/card_id.txt";
pub const STATUS_FILE: &str = ".tagdeck/status.jsonl";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn tagdeck_dir(root: &Path) -> PathBuf {
    root.join(TAGDECK_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn card_id_path(root: &Path) -> PathBuf {
    root.join(CARD_ID_FILE)
}

pub fn status_path(root: &Path) -> PathBuf {
    root.join(STATUS_FILE)
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// joined onto the project root.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
