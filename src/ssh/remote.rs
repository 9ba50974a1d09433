//! Remote command execution over SSH and the `UI_HOME` helpers built on it.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

use super::endpoint::SshEndpoint;
use crate::config::{SyncTarget, TargetKind};
use crate::errors::RemoteError;
use crate::util::shell_quote;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over "run a shell command on a host" for testability.
/// Real implementation: `SshRemoteShell`.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, endpoint: &SshEndpoint, command: &str)
    -> Result<RemoteOutput, RemoteError>;
}

/// Runs commands through the system `ssh` client.
pub struct SshRemoteShell {
    command_timeout: Duration,
}

impl SshRemoteShell {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl RemoteShell for SshRemoteShell {
    async fn run(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        tracing::debug!(host = %endpoint.host, port = endpoint.port, %command, "ssh exec");

        let child = Command::new("ssh")
            .args(endpoint.ssh_args())
            .arg(endpoint.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RemoteError::SpawnFailed)?;

        let output = match timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for ssh")?,
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: endpoint.host.clone(),
                    secs: self.command_timeout.as_secs(),
                });
            }
        };

        Ok(RemoteOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Run `command` and turn a non-zero exit into `RemoteError::CommandFailed`.
async fn run_checked(
    shell: &dyn RemoteShell,
    endpoint: &SshEndpoint,
    command: &str,
) -> Result<RemoteOutput, RemoteError> {
    let output = shell.run(endpoint, command).await?;
    if !output.success() {
        return Err(RemoteError::CommandFailed {
            host: endpoint.host.clone(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub host: String,
    pub port: u16,
    pub ok: bool,
    pub latency_ms: u64,
    pub message: String,
}

/// Run a trivial command to check reachability and key auth.
pub async fn test_connection(shell: &dyn RemoteShell, endpoint: &SshEndpoint) -> ConnectionReport {
    let started = Instant::now();
    let result = shell.run(endpoint, "echo ok").await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let (ok, message) = match result {
        Ok(out) if out.success() && out.stdout.trim() == "ok" => (true, "connected".to_string()),
        Ok(out) => (
            false,
            format!("exit {}: {}", out.exit_code, out.stderr.trim()),
        ),
        Err(e) => (false, e.to_string()),
    };

    ConnectionReport {
        host: endpoint.host.clone(),
        port: endpoint.port,
        ok,
        latency_ms,
        message,
    }
}

fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Read `UI_HOME` on the host: the live environment first, then the last
/// `export UI_HOME=` line in `~/.bashrc` (non-interactive shells often skip it).
pub async fn read_ui_home(
    shell: &dyn RemoteShell,
    endpoint: &SshEndpoint,
) -> Result<Option<String>, RemoteError> {
    let command = r#"if [ -n "${UI_HOME:-}" ]; then printf '%s' "$UI_HOME"; else sed -n 's/^export UI_HOME=//p' ~/.bashrc 2>/dev/null | tail -n 1; fi"#;
    let output = run_checked(shell, endpoint, command).await?;
    let value = strip_quotes(&output.stdout).trim_end_matches('/').to_string();
    Ok(if value.is_empty() { None } else { Some(value) })
}

/// Persist `UI_HOME` on the host. Earlier `export UI_HOME=` lines in
/// `~/.bashrc` are replaced; `/etc/environment` is updated only when writable.
pub async fn set_ui_home(
    shell: &dyn RemoteShell,
    endpoint: &SshEndpoint,
    path: &str,
) -> Result<(), RemoteError> {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return Err(anyhow::anyhow!("UI_HOME must not be empty").into());
    }
    let bashrc_line = format!("export UI_HOME={}", shell_quote(path));
    let env_line = format!("UI_HOME=\"{}\"", path.replace('"', ""));
    let command = format!(
        "touch ~/.bashrc && sed -i '/^export UI_HOME=/d' ~/.bashrc && printf '%s\\n' {} >> ~/.bashrc \
         && if [ -w /etc/environment ]; then sed -i '/^UI_HOME=/d' /etc/environment && printf '%s\\n' {} >> /etc/environment; fi",
        shell_quote(&bashrc_line),
        shell_quote(&env_line),
    );
    run_checked(shell, endpoint, &command).await?;
    tracing::info!(host = %endpoint.host, ui_home = %path, "UI_HOME set");
    Ok(())
}

/// Probe the usual install roots for `kind` and return the first that exists.
pub async fn detect_ui_home(
    shell: &dyn RemoteShell,
    endpoint: &SshEndpoint,
    kind: TargetKind,
) -> Result<Option<String>, RemoteError> {
    let candidates = kind
        .ui_home_candidates()
        .iter()
        .map(|c| shell_quote(c))
        .collect::<Vec<_>>()
        .join(" ");
    let command = format!(
        "for d in {}; do if [ -d \"$d\" ]; then printf '%s' \"$d\"; break; fi; done",
        candidates
    );
    let output = run_checked(shell, endpoint, &command).await?;
    let found = output.stdout.trim().to_string();
    Ok(if found.is_empty() { None } else { Some(found) })
}

/// Work out which remote directory to pull for `target`.
///
/// An explicit `remote_path` wins (a leading `$UI_HOME` is expanded).
/// Otherwise `UI_HOME` is read, or detected and then persisted, and the
/// kind's output directory is appended.
pub async fn resolve_remote_source(
    shell: &dyn RemoteShell,
    endpoint: &SshEndpoint,
    target: &SyncTarget,
) -> Result<String, RemoteError> {
    if let Some(path) = &target.remote_path {
        if !path.starts_with("$UI_HOME") && !path.starts_with("${UI_HOME}") {
            return Ok(path.clone());
        }
    }

    let ui_home = match read_ui_home(shell, endpoint).await? {
        Some(home) => home,
        None => {
            let detected = detect_ui_home(shell, endpoint, target.kind)
                .await?
                .ok_or_else(|| RemoteError::UiHomeNotFound {
                    host: endpoint.host.clone(),
                })?;
            set_ui_home(shell, endpoint, &detected).await?;
            detected
        }
    };

    let source = match &target.remote_path {
        Some(path) => {
            let rest = path
                .trim_start_matches("${UI_HOME}")
                .trim_start_matches("$UI_HOME");
            format!("{}{}", ui_home, rest)
        }
        None => format!("{}/{}", ui_home, target.kind.output_dir()),
    };
    Ok(source)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays scripted outputs in order and records every command.
    pub struct ScriptedShell {
        pub responses: Mutex<Vec<RemoteOutput>>,
        pub commands: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedShell {
        pub fn new(responses: Vec<RemoteOutput>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                commands: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        /// Every command takes `delay` before answering, like a slow host.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn ok(stdout: &str) -> RemoteOutput {
            RemoteOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        async fn run(
            &self,
            _endpoint: &SshEndpoint,
            command: &str,
        ) -> Result<RemoteOutput, RemoteError> {
            self.commands.lock().unwrap().push(command.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ScriptedShell::ok("")))
        }
    }

    fn endpoint() -> SshEndpoint {
        SshEndpoint::new("10.0.0.5", 22, "root")
    }

    fn target(kind: TargetKind, remote_path: Option<&str>) -> SyncTarget {
        SyncTarget {
            name: "t".into(),
            kind,
            host: Some("10.0.0.5".into()),
            port: 22,
            user: None,
            remote_path: remote_path.map(String::from),
            local_subdir: None,
            identity_file: None,
            instance_id: None,
        }
    }

    #[tokio::test]
    async fn test_connection_ok() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok("ok\n")]);
        let report = test_connection(&shell, &endpoint()).await;
        assert!(report.ok);
        assert_eq!(report.message, "connected");
    }

    #[tokio::test]
    async fn test_connection_reports_failure() {
        let shell = ScriptedShell::new(vec![RemoteOutput {
            exit_code: 255,
            stdout: String::new(),
            stderr: "Permission denied (publickey).".into(),
        }]);
        let report = test_connection(&shell, &endpoint()).await;
        assert!(!report.ok);
        assert!(report.message.contains("255"));
        assert!(report.message.contains("publickey"));
    }

    #[tokio::test]
    async fn test_read_ui_home_strips_quotes_and_slash() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok("'/workspace/ComfyUI/'\n")]);
        let home = read_ui_home(&shell, &endpoint()).await.unwrap();
        assert_eq!(home.as_deref(), Some("/workspace/ComfyUI"));
    }

    #[tokio::test]
    async fn test_read_ui_home_empty_is_none() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok("")]);
        assert_eq!(read_ui_home(&shell, &endpoint()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_ui_home_replaces_existing_line() {
        let shell = ScriptedShell::new(vec![]);
        set_ui_home(&shell, &endpoint(), "/opt/my ui/").await.unwrap();
        let commands = shell.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("sed -i '/^export UI_HOME=/d' ~/.bashrc"));
        assert!(commands[0].contains("export UI_HOME="));
        assert!(commands[0].contains("/opt/my ui"));
        assert!(!commands[0].contains("/opt/my ui/"));
    }

    #[tokio::test]
    async fn test_set_ui_home_rejects_empty() {
        let shell = ScriptedShell::new(vec![]);
        assert!(set_ui_home(&shell, &endpoint(), "/").await.is_err());
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_detect_ui_home_tries_kind_candidates() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok(
            "/workspace/stable-diffusion-webui-forge",
        )]);
        let found = detect_ui_home(&shell, &endpoint(), TargetKind::Forge)
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("/workspace/stable-diffusion-webui-forge"));
        assert!(shell.commands()[0].contains("/opt/stable-diffusion-webui-forge"));
        assert!(!shell.commands()[0].contains("ComfyUI"));
    }

    #[tokio::test]
    async fn test_resolve_explicit_remote_path_skips_ssh() {
        let shell = ScriptedShell::new(vec![]);
        let source = resolve_remote_source(
            &shell,
            &endpoint(),
            &target(TargetKind::Comfy, Some("/data/out")),
        )
        .await
        .unwrap();
        assert_eq!(source, "/data/out");
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_uses_existing_ui_home() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok("/opt/ComfyUI")]);
        let source = resolve_remote_source(&shell, &endpoint(), &target(TargetKind::Comfy, None))
            .await
            .unwrap();
        assert_eq!(source, "/opt/ComfyUI/output");
        assert_eq!(shell.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_detects_and_persists_ui_home() {
        let shell = ScriptedShell::new(vec![
            ScriptedShell::ok(""),
            ScriptedShell::ok("/workspace/stable-diffusion-webui-forge"),
            ScriptedShell::ok(""),
        ]);
        let source = resolve_remote_source(&shell, &endpoint(), &target(TargetKind::Forge, None))
            .await
            .unwrap();
        assert_eq!(source, "/workspace/stable-diffusion-webui-forge/outputs");
        let commands = shell.commands();
        assert_eq!(commands.len(), 3);
        assert!(commands[2].contains("export UI_HOME="));
    }

    #[tokio::test]
    async fn test_resolve_expands_ui_home_prefix() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok("/opt/ComfyUI")]);
        let source = resolve_remote_source(
            &shell,
            &endpoint(),
            &target(TargetKind::Comfy, Some("$UI_HOME/output/videos")),
        )
        .await
        .unwrap();
        assert_eq!(source, "/opt/ComfyUI/output/videos");
    }

    #[tokio::test]
    async fn test_resolve_fails_when_nothing_found() {
        let shell = ScriptedShell::new(vec![ScriptedShell::ok(""), ScriptedShell::ok("")]);
        let err = resolve_remote_source(&shell, &endpoint(), &target(TargetKind::Comfy, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::UiHomeNotFound { .. }));
    }
}
