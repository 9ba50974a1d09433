//! Unified configuration for media-sync.
//!
//! Settings are read from `.media-sync/media-sync.toml` inside the project
//! directory, then overlaid with environment variables and finally with CLI
//! flags (file → environment → CLI).
//!
//! # Configuration File Format
//!
//! ```toml
//! [local]
//! media_root = "media"
//! state_dir = ".media-sync"
//!
//! [ssh]
//! identity_file = "~/.ssh/id_ed25519"
//! user = "root"
//! connect_timeout_secs = 10
//!
//! [rsync]
//! binary = "rsync"
//! extensions = ["png", "jpg", "webp", "mp4"]
//! bwlimit_kbps = 20000
//!
//! [vast]
//! image = "vastai/comfy:latest"
//! disk_gb = 40
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8642
//!
//! [[targets]]
//! name = "comfy"
//! kind = "comfy"
//! host = "192.168.1.20"
//! port = 2222
//!
//! [[targets]]
//! name = "rented"
//! kind = "forge"
//! instance_id = 1234567
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::util::resolve_path;

/// Directory (relative to the project) holding the config file.
pub const CONFIG_DIR: &str = ".media-sync";
/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "media-sync.toml";

pub const DEFAULT_VAST_BASE_URL: &str = "https://console.vast.ai/api/v0";

/// Which UI produced the media on a target host.
///
/// The kind decides where the outputs live relative to `UI_HOME` and which
/// install roots are tried when `UI_HOME` is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Comfy,
    Forge,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comfy => "comfy",
            Self::Forge => "forge",
        }
    }

    /// Output directory name under `UI_HOME`.
    pub fn output_dir(&self) -> &'static str {
        match self {
            Self::Comfy => "output",
            Self::Forge => "outputs",
        }
    }

    /// Install roots tried (in order) when the host has no `UI_HOME`.
    pub fn ui_home_candidates(&self) -> &'static [&'static str] {
        match self {
            Self::Comfy => &[
                "/workspace/ComfyUI",
                "/opt/ComfyUI",
                "/root/ComfyUI",
                "/ComfyUI",
            ],
            Self::Forge => &[
                "/workspace/stable-diffusion-webui-forge",
                "/opt/stable-diffusion-webui-forge",
                "/root/stable-diffusion-webui-forge",
                "/workspace/forge",
            ],
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "comfy" | "comfyui" => Ok(Self::Comfy),
            "forge" => Ok(Self::Forge),
            _ => anyhow::bail!("Invalid target kind '{}'. Valid values: comfy, forge", s),
        }
    }
}

/// A named host whose UI output directory is pulled into local storage.
///
/// Either `host` (a container or machine reachable over SSH) or
/// `instance_id` (a VastAI instance whose SSH endpoint is looked up through
/// the API at sync time) must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub name: String,
    #[serde(default)]
    pub kind: TargetKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    /// Explicit remote directory; skips `UI_HOME` resolution when set.
    #[serde(default)]
    pub remote_path: Option<String>,
    /// Directory under the media root; defaults to the target name.
    #[serde(default)]
    pub local_subdir: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub instance_id: Option<u64>,
}

impl SyncTarget {
    pub fn is_vast(&self) -> bool {
        self.instance_id.is_some()
    }

    pub fn local_dir_name(&self) -> &str {
        self.local_subdir.as_deref().unwrap_or(&self.name)
    }

    /// Why `local_dir_name` cannot be joined onto the media root, if it
    /// cannot. Only plain relative paths are accepted.
    pub fn local_subdir_problem(&self) -> Option<String> {
        let dir = Path::new(self.local_dir_name());
        if dir.as_os_str().is_empty() {
            return Some("local directory name is empty".to_string());
        }
        if dir.is_absolute() {
            return Some(format!(
                "local directory '{}' must be relative to the media root",
                dir.display()
            ));
        }
        if !dir.components().all(|c| matches!(c, Component::Normal(_))) {
            return Some(format!(
                "local directory '{}' must stay inside the media root",
                dir.display()
            ));
        }
        None
    }
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_media_root() -> PathBuf {
    PathBuf::from("media")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR)
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            media_root: default_media_root(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Private key used for every target without its own `identity_file`.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound for one remote command (not for rsync transfers).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            user: default_ssh_user(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            known_hosts_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsyncConfig {
    #[serde(default = "default_rsync_binary")]
    pub binary: String,
    /// File extensions (without the dot) that are pulled; everything else is skipped.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub bwlimit_kbps: Option<u32>,
}

fn default_rsync_binary() -> String {
    "rsync".to_string()
}

pub fn default_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "webp", "gif", "mp4", "webm", "mov", "mkv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            binary: default_rsync_binary(),
            extensions: default_extensions(),
            extra_args: Vec::new(),
            bwlimit_kbps: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VastConfig {
    #[serde(default = "default_vast_base_url")]
    pub base_url: String,
    /// Prefer `VAST_API_KEY` over storing the key in the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_vast_image")]
    pub image: String,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: f64,
    #[serde(default)]
    pub onstart: Option<String>,
}

fn default_vast_base_url() -> String {
    DEFAULT_VAST_BASE_URL.to_string()
}

fn default_vast_image() -> String {
    "vastai/comfy:latest".to_string()
}

fn default_disk_gb() -> f64 {
    32.0
}

impl Default for VastConfig {
    fn default() -> Self {
        Self {
            base_url: default_vast_base_url(),
            api_key: None,
            image: default_vast_image(),
            disk_gb: default_disk_gb(),
            onstart: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8642
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Also write a daily-rolling log file under `<state_dir>/logs`.
    #[serde(default)]
    pub file: bool,
    #[serde(default)]
    pub json: bool,
}

/// The on-disk `media-sync.toml` model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaSyncToml {
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub rsync: RsyncConfig,
    #[serde(default)]
    pub vast: VastConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub targets: Vec<SyncTarget>,
}

impl MediaSyncToml {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse media-sync.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Starter file written by `config init`, with one example target per kind.
    pub fn starter() -> Self {
        Self {
            targets: vec![
                SyncTarget {
                    name: "comfy".to_string(),
                    kind: TargetKind::Comfy,
                    host: Some("127.0.0.1".to_string()),
                    port: 2222,
                    user: None,
                    remote_path: None,
                    local_subdir: None,
                    identity_file: None,
                    instance_id: None,
                },
                SyncTarget {
                    name: "forge".to_string(),
                    kind: TargetKind::Forge,
                    host: Some("127.0.0.1".to_string()),
                    port: 2223,
                    user: None,
                    remote_path: None,
                    local_subdir: None,
                    identity_file: None,
                    instance_id: None,
                },
            ],
            ..Self::default()
        }
    }
}

/// Environment overrides, captured once so resolution stays testable.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub vast_api_key: Option<String>,
    pub media_root: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
    pub rsync_binary: Option<String>,
    pub port: Option<u16>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            vast_api_key: non_empty("VAST_API_KEY"),
            media_root: non_empty("MEDIA_SYNC_MEDIA_ROOT").map(PathBuf::from),
            ssh_key: non_empty("MEDIA_SYNC_SSH_KEY").map(PathBuf::from),
            rsync_binary: non_empty("MEDIA_SYNC_RSYNC"),
            port: non_empty("MEDIA_SYNC_PORT").and_then(|v| v.parse().ok()),
        }
    }
}

/// Flag-level overrides from the CLI.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub media_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub verbose: bool,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct MediaSyncConfig {
    pub project_dir: PathBuf,
    pub toml: MediaSyncToml,
    pub verbose: bool,
}

impl MediaSyncConfig {
    /// Load the project config with environment overrides applied.
    pub fn with_overrides(
        project_dir: PathBuf,
        env: EnvOverrides,
        cli: CliOverrides,
    ) -> Result<Self> {
        let path = config_path(&project_dir);
        let toml = MediaSyncToml::load(&path)?;
        Ok(Self::from_toml(project_dir, toml, env, cli))
    }

    pub fn from_toml(
        project_dir: PathBuf,
        mut toml: MediaSyncToml,
        env: EnvOverrides,
        cli: CliOverrides,
    ) -> Self {
        if let Some(key) = env.vast_api_key {
            toml.vast.api_key = Some(key);
        }
        if let Some(root) = env.media_root {
            toml.local.media_root = root;
        }
        if let Some(key) = env.ssh_key {
            toml.ssh.identity_file = Some(key);
        }
        if let Some(binary) = env.rsync_binary {
            toml.rsync.binary = binary;
        }
        if let Some(port) = env.port {
            toml.server.port = port;
        }

        if let Some(root) = cli.media_root {
            toml.local.media_root = root;
        }
        if let Some(port) = cli.port {
            toml.server.port = port;
        }

        Self {
            project_dir,
            toml,
            verbose: cli.verbose,
        }
    }

    pub fn media_root(&self) -> PathBuf {
        resolve_path(&self.project_dir, &self.toml.local.media_root)
    }

    pub fn state_dir(&self) -> PathBuf {
        resolve_path(&self.project_dir, &self.toml.local.state_dir)
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.state_dir().join("progress")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("media-sync.db")
    }

    /// Key used when a target does not name its own.
    pub fn default_identity_file(&self) -> PathBuf {
        match &self.toml.ssh.identity_file {
            Some(path) => resolve_path(&self.project_dir, path),
            None => crate::ssh::keys::default_key_path(),
        }
    }

    pub fn identity_file_for(&self, target: &SyncTarget) -> PathBuf {
        match &target.identity_file {
            Some(path) => resolve_path(&self.project_dir, path),
            None => self.default_identity_file(),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.toml.vast.api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.toml.targets
    }

    pub fn target(&self, name: &str) -> Option<&SyncTarget> {
        self.toml.targets.iter().find(|t| t.name == name)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.media_root(),
            self.progress_dir(),
            self.log_dir(),
            self.lock_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Problems worth reporting; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut seen = HashSet::new();
        for target in &self.toml.targets {
            if !seen.insert(target.name.as_str()) {
                warnings.push(format!("Duplicate target name '{}'", target.name));
            }
            if target.name.trim().is_empty() || target.name.contains('/') {
                warnings.push(format!("Invalid target name '{}'", target.name));
            }
            match (&target.host, target.instance_id) {
                (None, None) => warnings.push(format!(
                    "Target '{}' needs either host or instance_id",
                    target.name
                )),
                (Some(_), Some(_)) => warnings.push(format!(
                    "Target '{}' sets both host and instance_id; instance_id wins",
                    target.name
                )),
                _ => {}
            }
            if let Some(problem) = target.local_subdir_problem() {
                warnings.push(format!("Target '{}': {}", target.name, problem));
            }
            if target.is_vast() && self.api_key().is_none() {
                warnings.push(format!(
                    "Target '{}' is a VastAI instance but no API key is configured",
                    target.name
                ));
            }
        }

        if self.toml.targets.is_empty() {
            warnings.push("No [[targets]] configured".to_string());
        }
        if !self.default_identity_file().exists() {
            warnings.push(format!(
                "SSH key {} does not exist (run 'media-sync ssh ensure-key')",
                self.default_identity_file().display()
            ));
        }
        if self.toml.local.media_root.is_relative()
            && !self.toml.local.media_root.starts_with("~")
        {
            warnings.push(format!(
                "[local] media_root '{}' is relative; it resolves to {}",
                self.toml.local.media_root.display(),
                self.media_root().display()
            ));
        }
        if self.toml.server.port == 0 {
            warnings.push("[server] port must not be 0".to_string());
        }
        if self.toml.rsync.extensions.is_empty() {
            warnings.push("[rsync] extensions is empty; nothing would be synced".to_string());
        }

        warnings
    }
}

pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}
