use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{MediaSyncConfig, SyncTarget};
use crate::util::shell_quote;

/// Everything needed to open an SSH session to one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub known_hosts_file: Option<PathBuf>,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            identity_file: None,
            connect_timeout_secs: 10,
            known_hosts_file: None,
        }
    }

    /// Build the endpoint for a host-based target. VastAI targets get theirs
    /// from the instance record instead.
    pub fn for_target(config: &MediaSyncConfig, target: &SyncTarget, host: &str, port: u16) -> Self {
        let user = target
            .user
            .clone()
            .unwrap_or_else(|| config.toml.ssh.user.clone());
        Self {
            host: host.to_string(),
            port,
            user,
            identity_file: Some(config.identity_file_for(target)),
            connect_timeout_secs: config.toml.ssh.connect_timeout_secs,
            known_hosts_file: config.toml.ssh.known_hosts_file.clone(),
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and rsync's remote shell. Host keys are
    /// accepted on first contact and never prompted for.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.extend(
            [
                "BatchMode=yes".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                format!("ConnectTimeout={}", self.connect_timeout_secs),
                "ServerAliveInterval=15".to_string(),
            ]
            .into_iter()
            .flat_map(|opt| ["-o".to_string(), opt]),
        );
        if let Some(known_hosts) = &self.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        args
    }

    /// The same options rendered as one `rsync -e` argument.
    pub fn rsync_shell(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.ssh_args().iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }

    /// `user@host:path/` source spec for rsync; the trailing slash copies
    /// directory contents rather than the directory itself.
    pub fn rsync_source(&self, remote_dir: &str) -> String {
        format!(
            "{}:{}/",
            self.destination(),
            remote_dir.trim_end_matches('/')
        )
    }
}
