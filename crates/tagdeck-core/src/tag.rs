//! Tag identity and the reader adapter seam.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::process;

// ---------------------------------------------------------------------------
// TagId
// ---------------------------------------------------------------------------

/// Opaque tag identifier in canonical text form: lowercase hex octets
/// joined by `:` (e.g. `04:a1:b2:c3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(String);

impl TagId {
    /// Normalize reader output. Bare even-length hex (`04A1B2C3`) gains
    /// separators; anything else is trimmed and lowercased as-is.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim().to_ascii_lowercase();
        let bare_hex = !trimmed.is_empty()
            && trimmed.len() % 2 == 0
            && trimmed.chars().all(|c| c.is_ascii_hexdigit());
        if bare_hex && trimmed.len() > 2 {
            let octets: Vec<&str> = (0..trimmed.len())
                .step_by(2)
                .map(|i| &trimmed[i..i + 2])
                .collect();
            return Self(octets.join(":"));
        }
        Self(trimmed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TagId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// TagFault / TagReader
// ---------------------------------------------------------------------------

/// A failed read. Never the same thing as "no tag present".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TagFault(pub String);

/// Hardware polling primitive.
pub trait TagReader {
    /// Sample the reader once. Must return within `timeout`.
    fn poll(&mut self, timeout: Duration) -> Result<Option<TagId>, TagFault>;
}

// ---------------------------------------------------------------------------
// CommandTagReader
// ---------------------------------------------------------------------------

/// Slack on top of the poll timeout for process start-up and teardown.
const SPAWN_SLACK: Duration = Duration::from_millis(50);

/// Reader backed by an external poll helper.
///
/// The helper receives the timeout in milliseconds as its last argument and
/// prints the tag UID on the first stdout line, or nothing when no tag is in
/// the field. A non-zero exit, a timeout or a spawn failure is a fault.
pub struct CommandTagReader {
    command: Vec<String>,
}

impl CommandTagReader {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Check the helper can be found before the loop starts.
    pub fn probe(&self) -> Result<(), TagFault> {
        let program = self
            .command
            .first()
            .ok_or_else(|| TagFault("reader command is empty".to_string()))?;
        if which::which(program).is_err() && !std::path::Path::new(program).exists() {
            return Err(TagFault(format!("reader helper '{program}' not found")));
        }
        Ok(())
    }
}

impl TagReader for CommandTagReader {
    fn poll(&mut self, timeout: Duration) -> Result<Option<TagId>, TagFault> {
        let mut argv = self.command.clone();
        argv.push(timeout.as_millis().to_string());

        let output = process::run_with_deadline(&argv, &[], timeout + SPAWN_SLACK)
            .map_err(|e| TagFault(e.to_string()))?;
        if output.timed_out {
            return Err(TagFault(format!(
                "reader helper exceeded {}ms",
                timeout.as_millis()
            )));
        }
        if !output.success() {
            return Err(TagFault(match output.code {
                Some(code) => format!("reader helper exited with code {code}"),
                None => "reader helper terminated by signal".to_string(),
            }));
        }

        let line = output.stdout.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(None);
        }
        let tag = TagId::new(line);
        debug!("reader saw tag {tag}");
        Ok(Some(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_id_normalizes_case_and_separators() {
        assert_eq!(TagId::new("04:A1:B2:C3").as_str(), "04:a1:b2:c3");
        assert_eq!(TagId::new(" 04a1b2c3\n").as_str(), "04:a1:b2:c3");
        assert_eq!(TagId::new("04a1b2c3"), TagId::new("04:A1:B2:C3"));
    }

    #[test]
    fn tag_id_keeps_non_hex_text() {
        assert_eq!(TagId::new("Card-X").as_str(), "card-x");
        assert_eq!(TagId::new("x").as_str(), "x");
    }

    fn sh(script: &str) -> CommandTagReader {
        // The timeout argument lands in $0 of the inline script.
        CommandTagReader::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn command_reader_returns_tag() {
        let mut reader = sh("echo 04A1B2C3");
        let tag = reader.poll(Duration::from_millis(500)).unwrap();
        assert_eq!(tag, Some(TagId::new("04:a1:b2:c3")));
    }

    #[test]
    fn command_reader_empty_output_is_no_tag() {
        let mut reader = sh("true");
        assert_eq!(reader.poll(Duration::from_millis(500)).unwrap(), None);
    }

    #[test]
    fn command_reader_nonzero_exit_is_fault() {
        let mut reader = sh("exit 2");
        let fault = reader.poll(Duration::from_millis(500)).unwrap_err();
        assert!(fault.0.contains("code 2"), "{fault}");
    }

    #[test]
    fn command_reader_timeout_is_fault() {
        let mut reader = sh("exec sleep 5");
        let fault = reader.poll(Duration::from_millis(50)).unwrap_err();
        assert!(fault.0.contains("exceeded"), "{fault}");
    }

    #[test]
    fn command_reader_forking_helper_returns_within_timeout() {
        let mut reader = sh("sleep 3; echo done");
        let started = std::time::Instant::now();
        let fault = reader.poll(Duration::from_millis(100)).unwrap_err();
        assert!(fault.0.contains("exceeded 100ms"), "{fault}");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "poll blocked for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn command_reader_missing_helper_is_fault() {
        let mut reader = CommandTagReader::new(vec!["__no_such_reader_xyz__".to_string()]);
        assert!(reader.probe().is_err());
        assert!(reader.poll(Duration::from_millis(50)).is_err());
    }
}
