use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use tagdeck_core::{
    config::Config,
    playback::{HttpPlaybackClient, PlaybackCommand, PlaybackControl},
};

pub fn run(root: &Path, command: &str, json: bool) -> anyhow::Result<()> {
    let command: PlaybackCommand = command.parse()?;
    let config = Config::load(root).context("failed to load config")?;
    let mut client =
        HttpPlaybackClient::new(&config.playback).context("failed to build playback client")?;
    let url = client.url_for(command);
    client.send(command)?;

    if json {
        print_json(&serde_json::json!({ "command": command.as_path(), "url": url, "ok": true }))
    } else {
        println!("sent {command} -> {url}");
        Ok(())
    }
}
