use anyhow::{anyhow, Context};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagdeck_core::{
    action::CommandTagAction,
    card::{CardStore, FileCardStore, MemoryCardStore},
    config::Config,
    control_loop::ControlLoop,
    orchestrator::{Orchestrator, OrchestratorSettings},
    paths,
    playback::HttpPlaybackClient,
    process,
    snapshot::SnapshotStore,
    status::StatusLog,
    supervisor::{CompanionSet, ProcessSupervisor},
    tag::CommandTagReader,
};
use tracing::info;

use crate::signals::wait_for_shutdown_signal;

/// Bound on the one-off display setup command.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run(root: &Path) -> anyhow::Result<()> {
    let config = Config::load_validated(root).context("failed to load config")?;
    let status = StatusLog::new(paths::status_path(root));

    if let Some(setup) = &config.display.setup_command {
        info!("display setup: {}", setup.join(" "));
        process::run_checked(setup, SETUP_TIMEOUT).context("display setup failed")?;
    }

    let reader = CommandTagReader::new(config.reader.command.clone());
    match reader.probe() {
        Ok(()) => status.info("NFC is up!"),
        // Keep going: the clock still runs and faults are retried each tick.
        Err(e) => status.error(format!("NFC is down!: {e}")),
    }

    let mut control = build_loop(root, &config, reader)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let worker = std::thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || control.run(&flag))
        .context("failed to start control loop thread")?;

    let waited = rt.block_on(wait_for_shutdown_signal());
    shutdown.store(true, Ordering::SeqCst);
    waited.context("failed to install signal handlers")?;

    worker
        .join()
        .map_err(|_| anyhow!("control loop thread panicked"))?
        .context("failed to stop renderers")?;
    info!("tagdeck stopped");
    Ok(())
}

fn build_loop(root: &Path, config: &Config, reader: CommandTagReader) -> anyhow::Result<ControlLoop> {
    let cards: Box<dyn CardStore + Send> = if config.persist_card_id {
        Box::new(FileCardStore::new(paths::card_id_path(root)))
    } else {
        Box::new(MemoryCardStore::default())
    };
    let renderers = ProcessSupervisor::new(&config.renderers).with_cwd(root);
    let playback =
        HttpPlaybackClient::new(&config.playback).context("failed to build playback client")?;

    let mut orchestrator = Orchestrator::new(
        OrchestratorSettings::from_config(config),
        Box::new(reader),
        Box::new(renderers),
        cards,
    )
    .with_playback(Box::new(playback))
    .with_status_log(StatusLog::new(paths::status_path(root)));
    if let Some(action) = &config.tag_action {
        orchestrator = orchestrator.with_tag_action(Box::new(CommandTagAction::new(action)));
    }

    let snapshots = SnapshotStore::new(config.snapshot_path(root))
        .with_player_filter(config.snapshot.player.clone());
    let companions =
        CompanionSet::new(&config.companions, config.renderers.stop_timeout()).with_cwd(root);

    info!(
        "snapshot {}, {} companion(s), grace {}s",
        snapshots.path().display(),
        companions.len(),
        config.grace_secs
    );
    let control = ControlLoop::new(orchestrator, snapshots, config);
    if companions.is_empty() {
        return Ok(control);
    }
    Ok(control.with_companions(companions))
}
