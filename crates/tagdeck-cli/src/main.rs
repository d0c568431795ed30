mod cmd;
mod output;
mod root;
mod signals;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tagdeck",
    about = "Tag-driven clock / now-playing display controller",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .tagdeck/)
    #[arg(long, global = true, env = "TAGDECK_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .tagdeck/ and a default config.yaml
    Init,

    /// Drive the display until SIGINT/SIGTERM/SIGQUIT
    Run,

    /// Show the playback snapshot, last card and latest status record
    Status,

    /// Inspect or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Send a command to the media-control endpoint
    Playback {
        /// pause, play, toggle, next or previous
        command: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run => cmd::run::run(&root),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Playback { command } => cmd::playback::run(&root, &command, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
