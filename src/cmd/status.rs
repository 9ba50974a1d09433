//! Read-only views: run history, targets and the local media inventory.

use anyhow::Result;
use console::style;
use std::sync::Arc;

use media_sync::config::MediaSyncConfig;
use media_sync::history::SyncRun;
use media_sync::media::{MediaKind, scan_media};
use media_sync::sync::{SyncService, SyncStatus};
use media_sync::util::tail_lines;

use super::{format_bytes, print_json};

fn styled_status(status: SyncStatus) -> String {
    let text = format!("{:<9}", status.as_str());
    match status {
        SyncStatus::Completed => style(text).green().to_string(),
        SyncStatus::Failed => style(text).red().to_string(),
        SyncStatus::Running => style(text).cyan().to_string(),
        SyncStatus::Queued | SyncStatus::Cancelled => style(text).dim().to_string(),
    }
}

fn print_run_row(run: &SyncRun) {
    println!(
        "{:>6}  {:<16} {} {:>6} {:>10}  {}",
        run.id,
        run.target,
        styled_status(run.status),
        run.files_transferred,
        format_bytes(run.bytes_transferred.max(0) as u64),
        run.started_at
    );
}

pub async fn cmd_runs(config: Arc<MediaSyncConfig>, limit: i64, json: bool) -> Result<()> {
    let service = SyncService::from_config(config)?;
    let runs = service.list_runs(limit).await?;

    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No sync runs recorded yet.");
        return Ok(());
    }
    println!(
        "{:>6}  {:<16} {:<9} {:>6} {:>10}  {}",
        "ID", "TARGET", "STATUS", "FILES", "BYTES", "STARTED"
    );
    for run in &runs {
        print_run_row(run);
    }
    Ok(())
}

pub async fn cmd_run(config: Arc<MediaSyncConfig>, id: i64, lines: usize, json: bool) -> Result<()> {
    let service = SyncService::from_config(config)?;
    let run = service.get_run(id).await?;
    let log_path = service.runner().log_path(id);
    let log = if log_path.exists() {
        tail_lines(&log_path, lines)?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&serde_json::json!({
            "run": run,
            "progress": service.progress_store().read(id)?,
            "log": log,
        }));
    }

    println!("Run {} ({})", style(run.id).bold(), run.target);
    println!("  status:      {}", styled_status(run.status));
    if let Some(source) = &run.source {
        println!("  source:      {}", source);
    }
    println!("  destination: {}", run.destination);
    println!(
        "  transferred: {} files, {}",
        run.files_transferred,
        format_bytes(run.bytes_transferred.max(0) as u64)
    );
    println!("  started:     {}", run.started_at);
    if let Some(done) = &run.completed_at {
        println!("  finished:    {}", done);
    }
    if let Some(error) = &run.error {
        println!("  error:       {}", style(error).red());
    }
    if !log.is_empty() {
        println!();
        println!("{}", style(format!("Last {} log line(s):", log.len())).dim());
        for line in &log {
            println!("  {}", line);
        }
    }
    Ok(())
}

pub async fn cmd_targets(config: Arc<MediaSyncConfig>, json: bool) -> Result<()> {
    let service = SyncService::from_config(config)?;
    let statuses = service.target_statuses().await?;

    if json {
        return print_json(&statuses);
    }
    if statuses.is_empty() {
        println!("No targets configured. Add [[targets]] to media-sync.toml.");
        return Ok(());
    }
    for status in &statuses {
        let target = &status.target;
        let address = match (target.instance_id, &target.host) {
            (Some(id), _) => format!("vast instance {}", id),
            (None, Some(host)) => format!("{}:{}", host, target.port),
            (None, None) => style("no host").red().to_string(),
        };
        let busy = if status.busy {
            style(" (syncing)").cyan().to_string()
        } else {
            String::new()
        };
        println!(
            "{} [{}] {}{}",
            style(&target.name).bold(),
            target.kind.as_str(),
            address,
            busy
        );
        println!("  -> {}", status.destination.display());
        match &status.last_run {
            Some(run) => println!(
                "  last run #{} {} at {}",
                run.id,
                run.status,
                run.started_at
            ),
            None => println!("  never synced"),
        }
    }
    Ok(())
}

pub fn cmd_media(config: &MediaSyncConfig, recent: usize, json: bool) -> Result<()> {
    let root = config.media_root();
    let inventory = scan_media(&root, &config.toml.rsync.extensions, recent)?;

    if json {
        return print_json(&inventory);
    }

    println!(
        "{} files, {} under {}",
        style(inventory.total_files).bold(),
        format_bytes(inventory.total_bytes),
        root.display()
    );
    for target in &inventory.targets {
        println!(
            "  {:<16} {:>6} images {:>5} videos {:>10}",
            target.name,
            target.images,
            target.videos,
            format_bytes(target.bytes)
        );
    }
    if !inventory.recent.is_empty() {
        println!();
        println!("Most recent:");
        for file in &inventory.recent {
            let kind = match file.kind {
                MediaKind::Image => "img",
                MediaKind::Video => "vid",
            };
            println!(
                "  {} {} {}",
                style(file.modified.format("%Y-%m-%d %H:%M")).dim(),
                kind,
                file.path
            );
        }
    }
    Ok(())
}
