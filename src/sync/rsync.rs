use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::RsyncConfig;
use crate::ssh::SshEndpoint;

/// Prefix that `--out-format` puts in front of every transferred path so
/// file lines can be told apart from progress records.
pub const FILE_MARKER: &str = "FILE:";

/// Argument vector for pulling one remote directory into a local one.
#[derive(Debug, Clone)]
pub struct RsyncCommand {
    binary: String,
    remote_shell: String,
    source: String,
    destination: PathBuf,
    extensions: Vec<String>,
    bwlimit_kbps: Option<u32>,
    extra_args: Vec<String>,
}

impl RsyncCommand {
    pub fn new(endpoint: &SshEndpoint, remote_dir: &str, destination: &Path) -> Self {
        Self {
            binary: "rsync".to_string(),
            remote_shell: endpoint.rsync_shell(),
            source: endpoint.rsync_source(remote_dir),
            destination: destination.to_path_buf(),
            extensions: crate::config::default_extensions(),
            bwlimit_kbps: None,
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(
        config: &RsyncConfig,
        endpoint: &SshEndpoint,
        remote_dir: &str,
        destination: &Path,
    ) -> Self {
        Self {
            binary: config.binary.clone(),
            extensions: config.extensions.clone(),
            bwlimit_kbps: config.bwlimit_kbps,
            extra_args: config.extra_args.clone(),
            ..Self::new(endpoint, remote_dir, destination)
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Include rules: every directory, each media extension in lower and
    /// upper case, then exclude everything else.
    fn filter_args(&self) -> Vec<String> {
        let mut args = vec!["--include=*/".to_string()];
        for ext in &self.extensions {
            let ext = ext.trim_start_matches('.');
            if ext.is_empty() {
                continue;
            }
            let lower = ext.to_lowercase();
            let upper = ext.to_uppercase();
            args.push(format!("--include=*.{}", lower));
            if upper != lower {
                args.push(format!("--include=*.{}", upper));
            }
        }
        args.push("--exclude=*".to_string());
        args
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-rt".to_string(),
            "--partial".to_string(),
            "--prune-empty-dirs".to_string(),
            "--no-inc-recursive".to_string(),
            "--info=progress2".to_string(),
            format!("--out-format={}%n", FILE_MARKER),
            "-e".to_string(),
            self.remote_shell.clone(),
        ];
        args.extend(self.filter_args());
        if let Some(limit) = self.bwlimit_kbps {
            args.push(format!("--bwlimit={}", limit));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.source.clone());

        let mut dest = self.destination.to_string_lossy().to_string();
        if !dest.ends_with('/') {
            dest.push('/');
        }
        args.push(dest);
        args
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.binary.clone())
            .chain(self.args().iter().map(|a| crate::util::shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args());
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> RsyncCommand {
        let endpoint = SshEndpoint::new("10.0.0.5", 2222, "root");
        RsyncCommand::new(&endpoint, "/workspace/ComfyUI/output", Path::new("/media/comfy"))
    }

    #[test]
    fn test_args_end_with_source_and_destination() {
        let args = command().args();
        let n = args.len();
        assert_eq!(args[n - 2], "root@10.0.0.5:/workspace/ComfyUI/output/");
        assert_eq!(args[n - 1], "/media/comfy/");
    }

    #[test]
    fn test_args_use_progress2_and_file_marker() {
        let args = command().args();
        assert!(args.contains(&"--info=progress2".to_string()));
        assert!(args.contains(&"--out-format=FILE:%n".to_string()));
        let e = args.iter().position(|a| a == "-e").unwrap();
        assert!(args[e + 1].starts_with("ssh -p 2222"));
    }

    #[test]
    fn test_filters_cover_both_cases_and_exclude_rest() {
        let config = RsyncConfig {
            extensions: vec!["png".into(), ".MP4".into(), "".into()],
            ..RsyncConfig::default()
        };
        let endpoint = SshEndpoint::new("h", 22, "root");
        let args = RsyncCommand::from_config(&config, &endpoint, "/out", Path::new("/m")).args();
        let filters: Vec<_> = args
            .iter()
            .filter(|a| a.starts_with("--include") || a.starts_with("--exclude"))
            .cloned()
            .collect();
        assert_eq!(
            filters,
            vec![
                "--include=*/",
                "--include=*.png",
                "--include=*.PNG",
                "--include=*.mp4",
                "--include=*.MP4",
                "--exclude=*",
            ]
        );
    }

    #[test]
    fn test_bwlimit_and_extra_args_precede_source() {
        let config = RsyncConfig {
            bwlimit_kbps: Some(2000),
            extra_args: vec!["--ignore-existing".into()],
            binary: "/opt/rsync".into(),
            ..RsyncConfig::default()
        };
        let endpoint = SshEndpoint::new("h", 22, "root");
        let cmd = RsyncCommand::from_config(&config, &endpoint, "/out", Path::new("/m/"));
        let args = cmd.args();
        let n = args.len();
        assert_eq!(args[n - 4], "--bwlimit=2000");
        assert_eq!(args[n - 3], "--ignore-existing");
        assert_eq!(args[n - 1], "/m/");
        assert_eq!(cmd.binary(), "/opt/rsync");
        assert!(cmd.display().starts_with("/opt/rsync -rt"));
    }
}
