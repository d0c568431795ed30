//! Client for the local media-control endpoint
//! (`{base_url}/player/playback/{command}`).

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::config::PlaybackConfig;
use crate::error::{Result, TagdeckError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    Pause,
    Play,
    PlayPause,
    SkipNext,
    SkipPrevious,
}

impl PlaybackCommand {
    /// Path segment understood by the media server.
    pub fn as_path(&self) -> &'static str {
        match self {
            PlaybackCommand::Pause => "pause",
            PlaybackCommand::Play => "play",
            PlaybackCommand::PlayPause => "playPause",
            PlaybackCommand::SkipNext => "skipNext",
            PlaybackCommand::SkipPrevious => "skipPrevious",
        }
    }
}

impl fmt::Display for PlaybackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_path())
    }
}

impl FromStr for PlaybackCommand {
    type Err = TagdeckError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pause" => Ok(Self::Pause),
            "play" | "resume" => Ok(Self::Play),
            "toggle" | "playPause" | "play-pause" => Ok(Self::PlayPause),
            "next" | "skipNext" => Ok(Self::SkipNext),
            "previous" | "prev" | "skipPrevious" => Ok(Self::SkipPrevious),
            other => Err(TagdeckError::Playback {
                command: other.to_string(),
                reason: "unknown playback command".to_string(),
            }),
        }
    }
}

pub trait PlaybackControl {
    fn send(&mut self, command: PlaybackCommand) -> Result<()>;
}

pub struct HttpPlaybackClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpPlaybackClient {
    pub fn new(config: &PlaybackConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, command: PlaybackCommand) -> String {
        format!("{}/player/playback/{}", self.base_url, command.as_path())
    }
}

impl PlaybackControl for HttpPlaybackClient {
    fn send(&mut self, command: PlaybackCommand) -> Result<()> {
        let url = self.url_for(command);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| TagdeckError::Playback {
                command: command.to_string(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        info!("playback {command}: {status}");
        if !status.is_success() {
            return Err(TagdeckError::Playback {
                command: command.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> HttpPlaybackClient {
        HttpPlaybackClient::new(&PlaybackConfig {
            base_url: base_url.to_string(),
            timeout_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn parses_cli_names() {
        assert_eq!("pause".parse::<PlaybackCommand>().unwrap(), PlaybackCommand::Pause);
        assert_eq!(
            "toggle".parse::<PlaybackCommand>().unwrap(),
            PlaybackCommand::PlayPause
        );
        assert_eq!(
            "next".parse::<PlaybackCommand>().unwrap(),
            PlaybackCommand::SkipNext
        );
        assert_eq!(
            "previous".parse::<PlaybackCommand>().unwrap(),
            PlaybackCommand::SkipPrevious
        );
        assert!("rewind".parse::<PlaybackCommand>().is_err());
    }

    #[test]
    fn builds_urls_without_double_slash() {
        let c = client("http://localhost:32500/");
        assert_eq!(
            c.url_for(PlaybackCommand::SkipNext),
            "http://localhost:32500/player/playback/skipNext"
        );
    }

    #[test]
    fn sends_pause_request() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/player/playback/pause")
            .with_status(200)
            .create();
        client(&server.url()).send(PlaybackCommand::Pause).unwrap();
        mock.assert();
    }

    #[test]
    fn non_success_status_is_error() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/player/playback/play")
            .with_status(500)
            .create();
        let err = client(&server.url())
            .send(PlaybackCommand::Play)
            .unwrap_err();
        assert!(err.to_string().contains("500"), "{err}");
        mock.assert();
    }

    #[test]
    fn unreachable_endpoint_is_error() {
        // Port 9 (discard) is closed on test hosts.
        let err = client("http://127.0.0.1:9")
            .send(PlaybackCommand::Pause)
            .unwrap_err();
        assert!(matches!(err, TagdeckError::Playback { .. }));
    }
}
