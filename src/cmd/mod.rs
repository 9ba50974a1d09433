//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `serve`   | `Serve`                                   |
//! | `sync`    | `Sync`                                    |
//! | `status`  | `Runs`, `Run`, `Targets`, `Media`         |
//! | `ssh`     | `Ssh`                                     |
//! | `vast`    | `Vast`                                    |
//! | `config`  | `Config`                                  |

pub mod config;
pub mod serve;
pub mod ssh;
pub mod status;
pub mod sync;
pub mod vast;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use ssh::cmd_ssh;
pub use status::{cmd_media, cmd_run, cmd_runs, cmd_targets};
pub use sync::cmd_sync;
pub use vast::cmd_vast;

use anyhow::Result;
use serde::Serialize;

/// Pretty-print any serializable value for `--json`.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Human-readable byte count, binary units.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
