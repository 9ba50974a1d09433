//! Configuration view and validation commands: `media-sync config`.

use anyhow::{Context, Result};
use std::path::Path;

use media_sync::config::{CliOverrides, EnvOverrides, MediaSyncConfig, MediaSyncToml, config_path};

use super::super::ConfigCommands;

/// Render the file contents with the API key masked.
fn render_masked(toml: &MediaSyncToml) -> Result<String> {
    let mut masked = toml.clone();
    if masked.vast.api_key.is_some() {
        masked.vast.api_key = Some("********".to_string());
    }
    toml::to_string_pretty(&masked).context("Failed to render configuration")
}

pub fn cmd_config(
    project_dir: &Path,
    command: Option<ConfigCommands>,
    overrides: CliOverrides,
) -> Result<()> {
    let config_path = config_path(project_dir);
    let load = || {
        MediaSyncConfig::with_overrides(
            project_dir.to_path_buf(),
            EnvOverrides::from_env(),
            overrides.clone(),
        )
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("media-sync Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No media-sync.toml found at {}", config_path.display());
                println!("Using default configuration (run 'media-sync config init' to create one).");
            }
            println!();

            let config = load()?;
            print!("{}", render_masked(&config.toml)?);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  media_root = \"{}\"", config.media_root().display());
            println!("  state_dir = \"{}\"", config.state_dir().display());
            println!("  database = \"{}\"", config.db_path().display());
            println!(
                "  identity_file = \"{}\"",
                config.default_identity_file().display()
            );
            println!("  rsync = \"{}\"", config.toml.rsync.binary);
            println!(
                "  vast_api_key = {}",
                if config.api_key().is_some() { "set" } else { "unset" }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No media-sync.toml found; checking defaults.");
            }

            let config = load()?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("media-sync.toml already exists at {}", config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            MediaSyncToml::starter().save(&config_path)?;

            println!("Created media-sync.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [[targets]] name, kind, host/port or instance_id");
            println!("  - [local] media_root, state_dir");
            println!("  - [ssh] user, identity_file, timeouts");
            println!("  - [vast] api_key, image, disk_gb, onstart");
            println!();
        }
    }

    Ok(())
}
