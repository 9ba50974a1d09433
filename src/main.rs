use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use media_sync::config::{CliOverrides, EnvOverrides, MediaSyncConfig};
use media_sync::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "media-sync")]
#[command(
    version,
    about = "Pull generated images and videos from Forge/ComfyUI hosts and VastAI instances"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print command results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Override [local] media_root
    #[arg(long, global = true)]
    pub media_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the JSON HTTP API
    Serve {
        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Permissive CORS for a UI dev server
        #[arg(long)]
        dev: bool,
    },
    /// Pull one target, or every target with --all
    Sync {
        target: Option<String>,

        #[arg(long, conflicts_with = "target")]
        all: bool,
    },
    /// Show recent sync runs
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Show one run with the tail of its rsync log
    Run {
        id: i64,

        #[arg(short, long, default_value = "20")]
        lines: usize,
    },
    /// List configured targets and their last run
    Targets,
    /// Summarize media already pulled into the media root
    Media {
        /// How many of the newest files to list
        #[arg(short, long, default_value = "10")]
        recent: usize,
    },
    /// SSH helpers
    Ssh {
        #[command(subcommand)]
        command: SshCommands,
    },
    /// Manage VastAI instances
    Vast {
        #[command(subcommand)]
        command: VastCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SshCommands {
    /// Check that a target accepts our key
    Test { target: String },
    /// Read UI_HOME on a target, or set it with --set
    UiHome {
        target: String,

        #[arg(long)]
        set: Option<String>,
    },
    /// Probe the usual install roots and persist the match as UI_HOME
    DetectUiHome {
        target: String,

        /// Only report, do not write UI_HOME
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the SSH key pair if it does not exist and print the public key
    EnsureKey {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum VastCommands {
    /// List your instances
    Instances,
    /// Show one instance
    Show { id: u64 },
    /// Search rentable offers, cheapest first
    Offers {
        /// e.g. RTX_4090
        #[arg(long)]
        gpu: Option<String>,

        #[arg(long)]
        num_gpus: Option<u32>,

        /// Maximum $/hour
        #[arg(long)]
        max_price: Option<f64>,

        #[arg(long)]
        min_reliability: Option<f64>,

        #[arg(long)]
        min_gpu_ram: Option<f64>,

        /// Minimum download speed in Mbps
        #[arg(long)]
        min_inet_down: Option<f64>,

        /// Include unverified machines
        #[arg(long)]
        unverified: bool,

        /// Interruptible (bid) pricing
        #[arg(long)]
        interruptible: bool,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Rent an offer
    Create {
        offer_id: u64,

        #[arg(long)]
        image: Option<String>,

        #[arg(long)]
        disk_gb: Option<f64>,

        #[arg(long)]
        label: Option<String>,

        /// Container port to publish (repeatable)
        #[arg(short, long = "port")]
        ports: Vec<u16>,

        /// KEY=VALUE environment variable (repeatable)
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Attach the local public key once the instance exists
        #[arg(long)]
        attach_key: bool,
    },
    /// Destroy an instance (irreversible)
    Destroy {
        id: u64,

        #[arg(long)]
        yes: bool,
    },
    /// Attach a public key to an instance
    AttachKey {
        id: u64,

        /// Private key whose .pub is attached; defaults to the configured key
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a starter media-sync.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn load_config(cli: &Cli, project_dir: PathBuf, port: Option<u16>) -> Result<Arc<MediaSyncConfig>> {
    let config = MediaSyncConfig::with_overrides(
        project_dir,
        EnvOverrides::from_env(),
        CliOverrides {
            media_root: cli.media_root.clone(),
            port,
            verbose: cli.verbose,
        },
    )?;
    Ok(Arc::new(config))
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work even when the file does not parse.
    if let Commands::Config { command } = &cli.command {
        let overrides = CliOverrides {
            media_root: cli.media_root.clone(),
            port: None,
            verbose: cli.verbose,
        };
        return cmd::cmd_config(&project_dir, command.clone(), overrides);
    }

    let port = match &cli.command {
        Commands::Serve { port, .. } => *port,
        _ => None,
    };
    let config = load_config(&cli, project_dir.clone(), port)?;

    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json || config.toml.logging.json,
        file_dir: config
            .toml
            .logging
            .file
            .then(|| config.log_dir()),
    })?;

    match &cli.command {
        Commands::Serve { dev, .. } => cmd::cmd_serve(config, *dev).await?,
        Commands::Sync { target, all } => {
            cmd::cmd_sync(config, target.as_deref(), *all, cli.json).await?
        }
        Commands::Runs { limit } => cmd::cmd_runs(config, *limit, cli.json).await?,
        Commands::Run { id, lines } => cmd::cmd_run(config, *id, *lines, cli.json).await?,
        Commands::Targets => cmd::cmd_targets(config, cli.json).await?,
        Commands::Media { recent } => cmd::cmd_media(&config, *recent, cli.json)?,
        Commands::Ssh { command } => cmd::cmd_ssh(config, command.clone(), cli.json).await?,
        Commands::Vast { command } => cmd::cmd_vast(config, command.clone(), cli.json).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
