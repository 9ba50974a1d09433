//! SSH helpers: `media-sync ssh ...`.

use anyhow::{Result, bail};
use console::style;
use std::sync::Arc;

use media_sync::config::MediaSyncConfig;
use media_sync::ssh::keys::{ensure_keypair, public_key_path, read_public_key};
use media_sync::ssh::remote::{detect_ui_home, read_ui_home, set_ui_home, test_connection};
use media_sync::sync::SyncService;

use super::super::SshCommands;
use super::print_json;

pub async fn cmd_ssh(config: Arc<MediaSyncConfig>, command: SshCommands, json: bool) -> Result<()> {
    if let SshCommands::EnsureKey { path } = command {
        let path = path.unwrap_or_else(|| config.default_identity_file());
        let created = ensure_keypair(&path).await?;
        let public_key = read_public_key(&path)?;
        if json {
            return print_json(&serde_json::json!({
                "private_key": path,
                "public_key_file": public_key_path(&path),
                "public_key": public_key,
                "created": created,
            }));
        }
        if created {
            println!("{} {}", style("Created").green().bold(), path.display());
        } else {
            println!("Using existing key {}", path.display());
        }
        println!("{}", public_key);
        return Ok(());
    }

    let service = SyncService::from_config(config)?;
    let shell = service.shell();

    match command {
        SshCommands::Test { target } => {
            let target = service.target(&target)?;
            let endpoint = service.resolve_endpoint(target).await?;
            let report = test_connection(shell, &endpoint).await;
            if json {
                print_json(&report)?;
            } else if report.ok {
                println!(
                    "{} {}:{} ({} ms)",
                    style("OK").green().bold(),
                    report.host,
                    report.port,
                    report.latency_ms
                );
            } else {
                println!(
                    "{} {}:{}: {}",
                    style("FAILED").red().bold(),
                    report.host,
                    report.port,
                    report.message
                );
            }
            if !report.ok {
                bail!("SSH connection to '{}' failed", target.name);
            }
        }
        SshCommands::UiHome { target, set } => {
            let target = service.target(&target)?;
            let endpoint = service.resolve_endpoint(target).await?;
            let ui_home = match set {
                Some(path) => {
                    set_ui_home(shell, &endpoint, &path).await?;
                    Some(path.trim_end_matches('/').to_string())
                }
                None => read_ui_home(shell, &endpoint).await?,
            };
            if json {
                print_json(&serde_json::json!({"target": target.name, "ui_home": ui_home}))?;
            } else {
                match ui_home {
                    Some(home) => println!("UI_HOME={}", home),
                    None => println!(
                        "UI_HOME is not set on '{}' (try 'media-sync ssh detect-ui-home {}')",
                        target.name, target.name
                    ),
                }
            }
        }
        SshCommands::DetectUiHome { target, dry_run } => {
            let target = service.target(&target)?;
            let endpoint = service.resolve_endpoint(target).await?;
            let Some(found) = detect_ui_home(shell, &endpoint, target.kind).await? else {
                bail!(
                    "No {} install found on '{}' (looked in {})",
                    target.kind.as_str(),
                    target.name,
                    target.kind.ui_home_candidates().join(", ")
                );
            };
            if !dry_run {
                set_ui_home(shell, &endpoint, &found).await?;
            }
            if json {
                print_json(&serde_json::json!({
                    "target": target.name,
                    "ui_home": found,
                    "persisted": !dry_run,
                }))?;
            } else if dry_run {
                println!("Found {} (not saved)", found);
            } else {
                println!("{} UI_HOME={}", style("Saved").green().bold(), found);
            }
        }
        SshCommands::EnsureKey { .. } => {}
    }
    Ok(())
}
