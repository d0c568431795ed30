//! Side effect run once per newly detected tag (typically: open the stream
//! the tag points at).

use std::time::Duration;

use tracing::debug;

use crate::config::TagActionConfig;
use crate::error::{Result, TagdeckError};
use crate::process;
use crate::tag::TagId;

pub trait TagAction {
    /// Run the action to completion and return its exit code.
    fn execute(&mut self, tag: &TagId) -> Result<i32>;
}

/// External program invoked as `<command...> <tag-id>` with
/// `TAGDECK_TAG_ID` set.
pub struct CommandTagAction {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandTagAction {
    pub fn new(config: &TagActionConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
        }
    }
}

impl TagAction for CommandTagAction {
    fn execute(&mut self, tag: &TagId) -> Result<i32> {
        let mut argv = self.command.clone();
        argv.push(tag.to_string());
        debug!("running tag action {:?}", argv);

        let output = process::run_with_deadline(
            &argv,
            &[("TAGDECK_TAG_ID", tag.as_str())],
            self.timeout,
        )?;
        if output.timed_out {
            return Err(TagdeckError::TagAction(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        output
            .code
            .ok_or_else(|| TagdeckError::TagAction("terminated by signal".to_string()))
    }
}

/// Used when no tag action is configured.
pub struct NoopTagAction;

impl TagAction for NoopTagAction {
    fn execute(&mut self, _tag: &TagId) -> Result<i32> {
        Ok(0)
    }
}
