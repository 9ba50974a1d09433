//! Foreground pulls: `media-sync sync <target>` and `media-sync sync --all`.

use anyhow::{Result, bail};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use media_sync::config::MediaSyncConfig;
use media_sync::sync::{
    NoopObserver, SyncObserver, SyncOutcome, SyncProgress, SyncService, SyncStatus,
};

use super::{format_bytes, print_json};

/// Draws one progress bar per run.
struct ProgressObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<i64, ProgressBar>>,
}

impl ProgressObserver {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }

    fn with_bar(&self, run_id: i64, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(&run_id) {
                f(bar);
            }
        }
    }
}

impl SyncObserver for ProgressObserver {
    fn on_started(&self, run_id: i64, target: &str) {
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(Self::bar_style());
        bar.set_prefix(format!("[{}]", target));
        bar.set_message("connecting...");
        bar.enable_steady_tick(Duration::from_millis(120));
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(run_id, bar);
        }
    }

    fn on_progress(&self, progress: &SyncProgress) {
        self.with_bar(progress.run_id, |bar| {
            bar.set_position(u64::from(progress.percent));
            let mut message = format!(
                "{} files, {}",
                progress.files_transferred,
                format_bytes(progress.bytes_transferred)
            );
            if let Some(rate) = &progress.rate {
                message.push_str(&format!(" @ {}", rate));
            }
            if let Some(eta) = &progress.eta {
                message.push_str(&format!(" eta {}", eta));
            }
            bar.set_message(message);
        });
    }

    fn on_file(&self, run_id: i64, file: &str) {
        self.with_bar(run_id, |bar| bar.println(format!("  {} {}", style("+").green(), file)));
    }

    fn on_finished(&self, outcome: &SyncOutcome) {
        let bar = match self.bars.lock() {
            Ok(mut bars) => bars.remove(&outcome.run_id),
            Err(_) => None,
        };
        let Some(bar) = bar else { return };
        let summary = match outcome.status {
            SyncStatus::Completed => format!(
                "{} {} files, {}",
                style("done").green().bold(),
                outcome.files.len(),
                format_bytes(outcome.bytes_transferred)
            ),
            SyncStatus::Cancelled => style("cancelled").yellow().to_string(),
            _ => format!(
                "{} {}",
                style("failed").red().bold(),
                outcome.error.as_deref().unwrap_or("")
            ),
        };
        if outcome.status == SyncStatus::Completed {
            bar.set_position(100);
        }
        bar.finish_with_message(summary);
    }
}

pub async fn cmd_sync(
    config: Arc<MediaSyncConfig>,
    target: Option<&str>,
    all: bool,
    json: bool,
) -> Result<()> {
    if target.is_none() && !all {
        bail!("Specify a target name or --all");
    }

    let service = SyncService::from_config(config)?;
    let progress = ProgressObserver::new();
    let observer: &dyn SyncObserver = if json { &NoopObserver } else { &progress };

    let outcomes = match target {
        Some(name) => vec![service.sync_now(name, observer).await?],
        None => service.sync_all(observer).await?,
    };

    if json {
        print_json(&outcomes)?;
    } else if outcomes.is_empty() {
        println!("Nothing to sync: every target is busy or none are configured.");
    } else {
        let files: usize = outcomes.iter().map(|o| o.files.len()).sum();
        let bytes: u64 = outcomes.iter().map(|o| o.bytes_transferred).sum();
        println!();
        println!(
            "{} {} run(s), {} new file(s), {}",
            style("Synced").bold(),
            outcomes.len(),
            files,
            format_bytes(bytes)
        );
    }

    let failed = outcomes
        .iter()
        .filter(|o| o.status == SyncStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{} of {} sync run(s) failed", failed, outcomes.len());
    }
    Ok(())
}
