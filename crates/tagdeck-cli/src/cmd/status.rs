use crate::output::{print_fields, print_json};
use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use tagdeck_core::{
    card::{CardStore, FileCardStore},
    config::Config,
    paths,
    snapshot::SnapshotStore,
    status::{StatusLog, StatusRecord},
};

#[derive(Serialize)]
struct SnapshotView {
    event: String,
    player: Option<String>,
    title: Option<String>,
    artist: Option<String>,
    timestamp: Option<String>,
}

#[derive(Serialize)]
struct StatusView {
    snapshot_path: String,
    snapshot: Option<SnapshotView>,
    snapshot_error: Option<String>,
    last_card: Option<String>,
    status: Option<StatusRecord>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = SnapshotStore::new(config.snapshot_path(root));

    let (snapshot, snapshot_error) = match store.read() {
        Ok(snap) => (snap, None),
        Err(e) => (None, Some(e.to_string())),
    };
    let view = StatusView {
        snapshot_path: store.path().display().to_string(),
        snapshot: snapshot.map(|s| SnapshotView {
            event: s.event.as_wire().to_string(),
            player: s.player.clone(),
            title: s.title().map(str::to_string),
            artist: s.artist().map(str::to_string),
            timestamp: s.observed_at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
        }),
        snapshot_error,
        last_card: FileCardStore::new(paths::card_id_path(root))
            .last()
            .context("failed to read card id")?
            .map(|t| t.to_string()),
        status: StatusLog::new(paths::status_path(root))
            .latest()
            .context("failed to read status log")?,
    };

    if json {
        return print_json(&view);
    }

    let none = || "-".to_string();
    let mut rows = vec![("snapshot", view.snapshot_path.clone())];
    match (&view.snapshot, &view.snapshot_error) {
        (Some(s), _) => {
            rows.push(("event", s.event.clone()));
            rows.push(("player", s.player.clone().unwrap_or_else(none)));
            rows.push(("title", s.title.clone().unwrap_or_else(none)));
            rows.push(("artist", s.artist.clone().unwrap_or_else(none)));
            rows.push(("updated", s.timestamp.clone().unwrap_or_else(none)));
        }
        (None, Some(err)) => rows.push(("event", format!("unreadable: {err}"))),
        (None, None) => rows.push(("event", none())),
    }
    rows.push(("last card", view.last_card.clone().unwrap_or_else(none)));
    rows.push((
        "status",
        view.status
            .as_ref()
            .map(|r| format!("{} ({})", r.status, r.timestamp))
            .unwrap_or_else(none),
    ));
    print_fields(&rows);
    Ok(())
}
