use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::lock::TargetLock;
use super::progress::{ProgressStore, SyncProgress};
use super::runner::{SyncJob, SyncObserver, SyncOutcome, SyncRunner};
use super::SyncStatus;
use crate::config::{MediaSyncConfig, SyncTarget};
use crate::errors::{ServiceError, SyncError, VastError};
use crate::history::{DbHandle, HistoryDb, SyncRun};
use crate::ssh::remote::resolve_remote_source;
use crate::ssh::{RemoteShell, SshEndpoint, SshRemoteShell};
use crate::vast::{VastApi, VastClient};

/// A configured target together with its most recent run.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    #[serde(flatten)]
    pub target: SyncTarget,
    pub destination: PathBuf,
    pub busy: bool,
    pub last_run: Option<SyncRun>,
}

/// Ties configuration, run history, remote resolution and the rsync runner
/// together. Shared by the CLI and the HTTP server.
pub struct SyncService {
    config: Arc<MediaSyncConfig>,
    db: DbHandle,
    runner: Arc<SyncRunner>,
    shell: Arc<dyn RemoteShell>,
    vast: Option<Arc<dyn VastApi>>,
}

impl SyncService {
    pub fn new(
        config: Arc<MediaSyncConfig>,
        db: DbHandle,
        runner: Arc<SyncRunner>,
        shell: Arc<dyn RemoteShell>,
        vast: Option<Arc<dyn VastApi>>,
    ) -> Self {
        Self {
            config,
            db,
            runner,
            shell,
            vast,
        }
    }

    /// Wire up the real collaborators: SQLite history under the state
    /// directory, the system `ssh` client, and a VastAI client when an API
    /// key is configured.
    pub fn from_config(config: Arc<MediaSyncConfig>) -> anyhow::Result<Self> {
        config.ensure_directories()?;
        let db = DbHandle::new(HistoryDb::new(&config.db_path())?);
        let runner = Arc::new(SyncRunner::new(
            config.toml.rsync.clone(),
            ProgressStore::new(config.progress_dir()),
            config.log_dir(),
            config.lock_dir(),
        ));
        let shell: Arc<dyn RemoteShell> = Arc::new(SshRemoteShell::new(Duration::from_secs(
            config.toml.ssh.command_timeout_secs,
        )));
        let vast = match config.api_key() {
            Some(key) => {
                let client = VastClient::new(config.toml.vast.base_url.clone(), key)
                    .context("Failed to create VastAI client")?;
                Some(Arc::new(client) as Arc<dyn VastApi>)
            }
            None => None,
        };
        Ok(Self::new(config, db, runner, shell, vast))
    }

    pub fn config(&self) -> &MediaSyncConfig {
        &self.config
    }

    pub fn runner(&self) -> &SyncRunner {
        &self.runner
    }

    pub fn progress_store(&self) -> &ProgressStore {
        self.runner.progress_store()
    }

    pub fn shell(&self) -> &dyn RemoteShell {
        self.shell.as_ref()
    }

    pub fn vast(&self) -> Result<&dyn VastApi, VastError> {
        self.vast.as_deref().ok_or(VastError::MissingApiKey)
    }

    pub fn target(&self, name: &str) -> Result<&SyncTarget, SyncError> {
        self.config
            .target(name)
            .ok_or_else(|| SyncError::UnknownTarget(name.to_string()))
    }

    pub fn destination_for(&self, target: &SyncTarget) -> PathBuf {
        self.config.media_root().join(target.local_dir_name())
    }

    /// Busy when this process has a run queued or running for the target,
    /// or another process holds its lock.
    pub fn is_busy(&self, name: &str) -> bool {
        self.runner.is_target_active(name) || TargetLock::is_held(self.runner.lock_dir(), name)
    }

    pub async fn target_statuses(&self) -> Result<Vec<TargetStatus>, ServiceError> {
        let mut statuses = Vec::with_capacity(self.config.targets().len());
        for target in self.config.targets() {
            let name = target.name.clone();
            let last_run = self
                .db
                .call(move |db| db.last_run_for_target(&name))
                .await?;
            statuses.push(TargetStatus {
                target: target.clone(),
                destination: self.destination_for(target),
                busy: self.is_busy(&target.name),
                last_run,
            });
        }
        Ok(statuses)
    }

    /// SSH endpoint for a target. VastAI targets are looked up through the
    /// API every time since the proxy port changes across restarts.
    pub async fn resolve_endpoint(&self, target: &SyncTarget) -> Result<SshEndpoint, ServiceError> {
        if let Some(id) = target.instance_id {
            let instance = self.vast()?.show_instance(id).await?;
            if !instance.is_running() {
                return Err(ServiceError::BadRequest(format!(
                    "VastAI instance {} is not running (status: {})",
                    id,
                    instance.actual_status.as_deref().unwrap_or("unknown")
                )));
            }
            let user = target
                .user
                .clone()
                .unwrap_or_else(|| self.config.toml.ssh.user.clone());
            let mut endpoint =
                instance.ssh_endpoint(&user, Some(self.config.identity_file_for(target)))?;
            endpoint.connect_timeout_secs = self.config.toml.ssh.connect_timeout_secs;
            endpoint.known_hosts_file = self.config.toml.ssh.known_hosts_file.clone();
            return Ok(endpoint);
        }

        let host = target.host.as_deref().ok_or_else(|| {
            ServiceError::BadRequest(format!(
                "Target '{}' has neither host nor instance_id",
                target.name
            ))
        })?;
        Ok(SshEndpoint::for_target(&self.config, target, host, target.port))
    }

    /// Record a new queued run for `name` and reserve the target until the
    /// run finishes. Fails fast when the target is unknown, has an unsafe
    /// `local_subdir`, or is already being pulled.
    pub async fn queue(&self, name: &str) -> Result<SyncRun, ServiceError> {
        let target = self.target(name)?;
        if let Some(problem) = target.local_subdir_problem() {
            return Err(ServiceError::BadRequest(format!(
                "Target '{}': {}",
                target.name, problem
            )));
        }
        if self.is_busy(name) {
            return Err(SyncError::TargetBusy {
                target: name.to_string(),
            }
            .into());
        }
        let target_name = target.name.clone();
        let destination = self.destination_for(target).to_string_lossy().to_string();
        let run = self
            .db
            .call(move |db| db.create_run(&target_name, &destination))
            .await?;

        // Two requests can both pass the busy check; only one reservation wins.
        if let Err(e) = self.runner.reserve(run.id, &run.target) {
            let run_id = run.id;
            self.db.call(move |db| db.delete_run(run_id)).await?;
            return Err(e.into());
        }
        tracing::info!(run_id = run.id, target = %run.target, "sync run queued");
        Ok(run)
    }

    /// Queue every configured target, skipping the ones that are busy or
    /// misconfigured.
    pub async fn queue_all(&self) -> Result<Vec<SyncRun>, ServiceError> {
        let mut runs = Vec::new();
        for target in self.config.targets() {
            match self.queue(&target.name).await {
                Ok(run) => runs.push(run),
                Err(ServiceError::Sync(SyncError::TargetBusy { target })) => {
                    tracing::warn!(target = %target, "skipping busy target");
                }
                Err(ServiceError::BadRequest(reason)) => {
                    tracing::warn!(target = %target.name, %reason, "skipping misconfigured target");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(runs)
    }

    /// Carry a queued run through resolution, rsync and bookkeeping.
    ///
    /// Failures before or around rsync are written to the history row and
    /// the progress file before being returned, so pollers always see a
    /// terminal state.
    pub async fn execute(
        &self,
        run: SyncRun,
        observer: &dyn SyncObserver,
    ) -> Result<SyncOutcome, ServiceError> {
        let run_id = run.id;
        let _guard = self.runner.guard(run_id);
        let current = self.db.call(move |db| db.get_run(run_id)).await?;
        if let Some(current) = current.filter(|r| r.status.is_terminal()) {
            tracing::info!(run_id, status = %current.status, "run already finished, skipping");
            return Ok(SyncOutcome::ended(run_id, current.status, current.error));
        }

        observer.on_started(run_id, &run.target);

        let prepared = async {
            let target = self.target(&run.target)?;
            let endpoint = self.resolve_endpoint(target).await?;
            let remote_dir = resolve_remote_source(self.shell(), &endpoint, target).await?;
            Ok::<_, ServiceError>((endpoint, remote_dir, self.destination_for(target)))
        }
        .await;

        let (endpoint, remote_dir, destination) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.record_failure(&run, e, observer).await),
        };

        let source = endpoint.rsync_source(&remote_dir);
        let started = self
            .db
            .call(move |db| db.mark_running(run_id, &source))
            .await?;
        if started.is_none() {
            return self.cancelled_while_preparing(&run, observer).await;
        }

        let job = SyncJob {
            run_id,
            target: run.target.clone(),
            endpoint,
            remote_dir,
            destination,
        };

        match self.runner.run(&job, observer).await {
            Ok(outcome) => {
                let status = outcome.status;
                let files = outcome.files.len() as i64;
                let bytes = outcome.bytes_transferred as i64;
                let error = outcome.error.clone();
                self.db
                    .call(move |db| db.finish_run(run_id, status, files, bytes, error.as_deref()))
                    .await?;
                observer.on_finished(&outcome);
                Ok(outcome)
            }
            Err(e) => Err(self.record_failure(&run, e.into(), observer).await),
        }
    }

    /// The run was cancelled while its endpoint was being resolved.
    async fn cancelled_while_preparing(
        &self,
        run: &SyncRun,
        observer: &dyn SyncObserver,
    ) -> Result<SyncOutcome, ServiceError> {
        let run_id = run.id;
        let current = self.db.call(move |db| db.get_run(run_id)).await?;
        let (status, error) = current
            .map(|r| (r.status, r.error))
            .unwrap_or((SyncStatus::Cancelled, None));
        tracing::info!(run_id, target = %run.target, status = %status, "run left the queue before rsync started");

        let mut progress = SyncProgress::new(run_id, &run.target);
        progress.finish(status, error.clone());
        if let Err(e) = self.progress_store().write(&progress) {
            tracing::warn!(run_id, error = %e, "failed to write progress file");
        }
        observer.on_progress(&progress);
        let outcome = SyncOutcome::ended(run_id, status, error);
        observer.on_finished(&outcome);
        Ok(outcome)
    }

    async fn record_failure(
        &self,
        run: &SyncRun,
        error: ServiceError,
        observer: &dyn SyncObserver,
    ) -> ServiceError {
        let message = error.to_string();
        tracing::error!(run_id = run.id, target = %run.target, error = %message, "sync run failed");

        let run_id = run.id;
        let db_message = message.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.finish_run(run_id, SyncStatus::Failed, 0, 0, Some(&db_message)))
            .await
        {
            tracing::warn!(run_id, error = %e, "failed to record run failure");
        }

        let mut progress = SyncProgress::new(run.id, &run.target);
        progress.finish(SyncStatus::Failed, Some(message.clone()));
        if let Err(e) = self.progress_store().write(&progress) {
            tracing::warn!(run_id, error = %e, "failed to write progress file");
        }
        observer.on_progress(&progress);
        observer.on_finished(&SyncOutcome::failed(run.id, message));
        error
    }

    /// Queue and run one target in the foreground.
    pub async fn sync_now(
        &self,
        name: &str,
        observer: &dyn SyncObserver,
    ) -> Result<SyncOutcome, ServiceError> {
        let run = self.queue(name).await?;
        self.execute(run, observer).await
    }

    /// Run already-queued runs one after another. A failing run does not
    /// stop the rest.
    pub async fn run_queued(
        &self,
        runs: Vec<SyncRun>,
        observer: &dyn SyncObserver,
    ) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::with_capacity(runs.len());
        for run in runs {
            let run_id = run.id;
            match self.execute(run, observer).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(SyncOutcome::failed(run_id, e.to_string())),
            }
        }
        outcomes
    }

    pub async fn sync_all(&self, observer: &dyn SyncObserver) -> Result<Vec<SyncOutcome>, ServiceError> {
        let runs = self.queue_all().await?;
        Ok(self.run_queued(runs, observer).await)
    }

    /// Cancel a run. Active runs get their rsync killed; runs still queued
    /// are marked cancelled so they never start, even if their executor is
    /// already resolving the endpoint. Returns `false` when the run had
    /// already finished.
    pub async fn cancel(&self, run_id: i64) -> Result<bool, ServiceError> {
        let run = self
            .db
            .call(move |db| db.get_run(run_id))
            .await?
            .ok_or(ServiceError::RunNotFound { id: run_id })?;
        if run.status.is_terminal() {
            return Ok(false);
        }

        let signalled = self.runner.cancel(run_id);
        let message = SyncError::Cancelled { run_id }.to_string();
        let dequeued = self
            .db
            .call(move |db| db.cancel_queued(run_id, &message))
            .await?;
        if dequeued {
            let mut progress = SyncProgress::new(run_id, &run.target);
            progress.finish(SyncStatus::Cancelled, None);
            self.progress_store().write(&progress)?;
        }
        tracing::info!(run_id, signalled, dequeued, "cancel requested");
        Ok(signalled || dequeued)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<SyncRun, ServiceError> {
        self.db
            .call(move |db| db.get_run(run_id))
            .await?
            .ok_or(ServiceError::RunNotFound { id: run_id })
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<SyncRun>, ServiceError> {
        let limit = limit.clamp(1, 1000);
        Ok(self.db.call(move |db| db.list_runs(limit)).await?)
    }

    /// Fail runs a previous process left active. Called once at startup.
    pub async fn recover_interrupted(&self) -> Result<usize, ServiceError> {
        let changed = self.db.call(|db| db.mark_interrupted()).await?;
        if changed > 0 {
            tracing::warn!(count = changed, "marked interrupted sync runs as failed");
        }
        Ok(changed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{CliOverrides, EnvOverrides, MediaSyncToml, TargetKind};
    use crate::errors::RemoteError;
    use crate::ssh::remote::tests::ScriptedShell;
    use crate::sync::NoopObserver;
    use crate::vast::tests::{FakeVast, running_instance};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    pub fn fake_rsync(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-rsync.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    pub fn target(name: &str, remote_path: Option<&str>) -> SyncTarget {
        SyncTarget {
            name: name.into(),
            kind: TargetKind::Comfy,
            host: Some("10.0.0.5".into()),
            port: 2222,
            user: None,
            remote_path: remote_path.map(String::from),
            local_subdir: None,
            identity_file: None,
            instance_id: None,
        }
    }

    pub fn service(
        dir: &TempDir,
        rsync_body: &str,
        targets: Vec<SyncTarget>,
        shell: ScriptedShell,
        vast: Option<FakeVast>,
    ) -> SyncService {
        let mut toml = MediaSyncToml::default();
        toml.local.media_root = dir.path().join("media");
        toml.local.state_dir = dir.path().join("state");
        toml.rsync.binary = fake_rsync(dir.path(), rsync_body);
        toml.targets = targets;
        let config = Arc::new(MediaSyncConfig::from_toml(
            dir.path().to_path_buf(),
            toml,
            EnvOverrides::default(),
            CliOverrides::default(),
        ));
        let runner = Arc::new(SyncRunner::new(
            config.toml.rsync.clone(),
            ProgressStore::new(config.progress_dir()),
            config.log_dir(),
            config.lock_dir(),
        ));
        SyncService::new(
            config,
            DbHandle::new(HistoryDb::new_in_memory().unwrap()),
            runner,
            Arc::new(shell),
            vast.map(|v| Arc::new(v) as Arc<dyn VastApi>),
        )
    }

    #[tokio::test]
    async fn test_sync_now_records_completed_run() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            "printf 'FILE:a.png\\n'\nexit 0",
            vec![target("comfy", Some("/workspace/ComfyUI/output"))],
            ScriptedShell::new(vec![]),
            None,
        );

        let outcome = svc.sync_now("comfy", &NoopObserver).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Completed);
        assert_eq!(outcome.files, vec!["a.png"]);

        let run = svc.get_run(outcome.run_id).await.unwrap();
        assert_eq!(run.status, SyncStatus::Completed);
        assert_eq!(run.files_transferred, 1);
        assert_eq!(
            run.source.as_deref(),
            Some("root@10.0.0.5:/workspace/ComfyUI/output/")
        );
        assert!(run.destination.ends_with("media/comfy"));
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, "exit 0", vec![], ScriptedShell::new(vec![]), None);
        let err = svc.queue("nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::Sync(SyncError::UnknownTarget(_))));
    }

    #[tokio::test]
    async fn test_busy_target_is_rejected_and_skipped_by_queue_all() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            "exit 0",
            vec![target("comfy", Some("/o")), target("forge", Some("/o"))],
            ScriptedShell::new(vec![]),
            None,
        );
        let _held = TargetLock::acquire(svc.runner().lock_dir(), "comfy").unwrap();
        let err = svc.queue("comfy").await.unwrap_err();
        assert!(matches!(err, ServiceError::Sync(SyncError::TargetBusy { .. })));

        let runs = svc.queue_all().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].target, "forge");
    }

    #[tokio::test]
    async fn test_unresolvable_ui_home_fails_run_and_progress() {
        let dir = tempdir().unwrap();
        // read_ui_home and detect_ui_home both come back empty.
        let svc = service(
            &dir,
            "exit 0",
            vec![target("comfy", None)],
            ScriptedShell::new(vec![ScriptedShell::ok(""), ScriptedShell::ok("")]),
            None,
        );
        let run = svc.queue("comfy").await.unwrap();
        let err = svc.execute(run.clone(), &NoopObserver).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Remote(RemoteError::UiHomeNotFound { .. })
        ));

        let stored = svc.get_run(run.id).await.unwrap();
        assert_eq!(stored.status, SyncStatus::Failed);
        assert!(stored.error.unwrap().contains("UI_HOME"));
        let progress = svc.progress_store().read(run.id).unwrap().unwrap();
        assert_eq!(progress.status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_vast_target_resolves_through_api() {
        let dir = tempdir().unwrap();
        let mut vast_target = target("gpu", Some("/workspace/ComfyUI/output"));
        vast_target.host = None;
        vast_target.instance_id = Some(77);
        let svc = service(
            &dir,
            "exit 0",
            vec![vast_target.clone()],
            ScriptedShell::new(vec![]),
            Some(FakeVast::with_instance(running_instance(77, "ssh4.vast.ai", 31000))),
        );

        let endpoint = svc.resolve_endpoint(&vast_target).await.unwrap();
        assert_eq!(endpoint.host, "ssh4.vast.ai");
        assert_eq!(endpoint.port, 31000);
        assert!(endpoint.identity_file.is_some());

        let outcome = svc.sync_now("gpu", &NoopObserver).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn test_vast_target_without_client_is_missing_key() {
        let dir = tempdir().unwrap();
        let mut vast_target = target("gpu", Some("/o"));
        vast_target.host = None;
        vast_target.instance_id = Some(1);
        let svc = service(&dir, "exit 0", vec![vast_target.clone()], ScriptedShell::new(vec![]), None);
        let err = svc.resolve_endpoint(&vast_target).await.unwrap_err();
        assert!(matches!(err, ServiceError::Vast(VastError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_cancel_queued_run_prevents_execution() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            "printf 'FILE:a.png\\n'\nexit 0",
            vec![target("comfy", Some("/o"))],
            ScriptedShell::new(vec![]),
            None,
        );
        let run = svc.queue("comfy").await.unwrap();
        assert!(svc.cancel(run.id).await.unwrap());

        let outcome = svc.execute(run.clone(), &NoopObserver).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Cancelled);
        assert!(outcome.files.is_empty());
        assert!(!svc.cancel(run.id).await.unwrap());
        assert!(matches!(
            svc.cancel(9999).await,
            Err(ServiceError::RunNotFound { id: 9999 })
        ));
    }

    #[tokio::test]
    async fn test_cancel_while_resolving_ui_home_never_starts_rsync() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("rsync-started");
        let svc = service(
            &dir,
            &format!("touch {}\nexit 0", marker.display()),
            vec![target("comfy", None)],
            ScriptedShell::new(vec![ScriptedShell::ok("/workspace/ComfyUI")])
                .with_delay(Duration::from_millis(300)),
            None,
        );
        let run = svc.queue("comfy").await.unwrap();
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            svc.cancel(run.id).await
        };

        let (outcome, cancelled) = tokio::join!(svc.execute(run.clone(), &NoopObserver), cancel);
        assert!(cancelled.unwrap());
        assert_eq!(outcome.unwrap().status, SyncStatus::Cancelled);

        let stored = svc.get_run(run.id).await.unwrap();
        assert_eq!(stored.status, SyncStatus::Cancelled);
        assert!(stored.source.is_none());
        assert!(!marker.exists());
        assert!(!svc.is_busy("comfy"));
    }

    #[tokio::test]
    async fn test_second_queue_for_same_target_is_busy_until_run_finishes() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            "exit 0",
            vec![target("comfy", Some("/o"))],
            ScriptedShell::new(vec![]),
            None,
        );
        let first = svc.queue("comfy").await.unwrap();
        assert!(svc.is_busy("comfy"));
        let err = svc.queue("comfy").await.unwrap_err();
        assert!(matches!(err, ServiceError::Sync(SyncError::TargetBusy { .. })));
        assert_eq!(svc.list_runs(10).await.unwrap().len(), 1);

        svc.execute(first, &NoopObserver).await.unwrap();
        assert!(!svc.is_busy("comfy"));
        assert!(svc.queue("comfy").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_preparation_releases_target() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            "exit 0",
            vec![target("comfy", None)],
            ScriptedShell::new(vec![ScriptedShell::ok(""), ScriptedShell::ok("")]),
            None,
        );
        let run = svc.queue("comfy").await.unwrap();
        assert!(svc.execute(run, &NoopObserver).await.is_err());
        assert!(!svc.is_busy("comfy"));
    }

    #[tokio::test]
    async fn test_queue_rejects_local_subdir_outside_media_root() {
        let dir = tempdir().unwrap();
        let mut escaping = target("comfy", Some("/o"));
        escaping.local_subdir = Some("../../outside".into());
        let svc = service(&dir, "exit 0", vec![escaping], ScriptedShell::new(vec![]), None);

        let err = svc.queue("comfy").await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(ref msg) if msg.contains("inside the media root")));
        assert!(svc.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_target_statuses_include_last_run() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            "exit 0",
            vec![target("comfy", Some("/o")), target("forge", Some("/o"))],
            ScriptedShell::new(vec![]),
            None,
        );
        svc.sync_now("comfy", &NoopObserver).await.unwrap();
        let statuses = svc.target_statuses().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(
            statuses[0].last_run.as_ref().map(|r| r.status),
            Some(SyncStatus::Completed)
        );
        assert!(statuses[1].last_run.is_none());
        assert!(!statuses[0].busy);
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, "exit 0", vec![target("comfy", Some("/o"))], ScriptedShell::new(vec![]), None);
        svc.queue("comfy").await.unwrap();
        assert_eq!(svc.recover_interrupted().await.unwrap(), 1);
        assert_eq!(svc.recover_interrupted().await.unwrap(), 0);
    }
}
