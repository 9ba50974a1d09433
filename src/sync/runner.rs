use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::lock::TargetLock;
use super::progress::{LineSplitter, ProgressStore, RsyncLine, SyncProgress, classify_line};
use super::rsync::RsyncCommand;
use super::SyncStatus;
use crate::config::RsyncConfig;
use crate::errors::SyncError;
use crate::ssh::SshEndpoint;

/// Minimum gap between progress-file rewrites for plain progress records.
const PROGRESS_WRITE_INTERVAL: Duration = Duration::from_millis(250);

/// rsync exit code for "some source files vanished before they could be
/// transferred"; the UIs delete temp previews mid-run, so this is not a failure.
const RSYNC_VANISHED: i32 = 24;

/// How long to keep draining output after a cancel before giving up on EOF.
const CANCEL_DRAIN: Duration = Duration::from_secs(5);

/// How many stderr lines are kept to explain a failure.
const STDERR_TAIL: usize = 20;

/// How long to keep retrying a contended target lock. Busy checks from other
/// processes take the lock for an instant.
const LOCK_RETRY: Duration = Duration::from_millis(250);
const LOCK_RETRY_STEP: Duration = Duration::from_millis(20);

/// Receives live updates from a running sync.
pub trait SyncObserver: Send + Sync {
    fn on_started(&self, _run_id: i64, _target: &str) {}
    fn on_progress(&self, _progress: &SyncProgress) {}
    fn on_file(&self, _run_id: i64, _file: &str) {}
    fn on_finished(&self, _outcome: &SyncOutcome) {}
}

pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Everything the runner needs for one pull.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub run_id: i64,
    pub target: String,
    pub endpoint: SshEndpoint,
    pub remote_dir: String,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: i64,
    pub status: SyncStatus,
    pub files: Vec<String>,
    pub bytes_transferred: u64,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl SyncOutcome {
    /// Outcome for a run that ended before rsync produced a result.
    pub fn failed(run_id: i64, error: impl Into<String>) -> Self {
        Self::ended(run_id, SyncStatus::Failed, Some(error.into()))
    }

    /// Outcome for a run cancelled before rsync was spawned.
    pub fn cancelled(run_id: i64) -> Self {
        Self::ended(
            run_id,
            SyncStatus::Cancelled,
            Some(SyncError::Cancelled { run_id }.to_string()),
        )
    }

    pub(crate) fn ended(run_id: i64, status: SyncStatus, error: Option<String>) -> Self {
        Self {
            run_id,
            status,
            files: Vec::new(),
            bytes_transferred: 0,
            exit_code: None,
            error,
        }
    }
}

/// Cancellation flag for one queued or running sync.
#[derive(Debug)]
pub struct RunHandle {
    run_id: i64,
    target: String,
    cancel: watch::Sender<bool>,
}

impl RunHandle {
    fn new(run_id: i64, target: &str) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            run_id,
            target: target.to_string(),
            cancel,
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once `cancel` has been called, including before this call.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs reserved in this process, from queueing until they finish. At most
/// one run per target.
#[derive(Debug, Default)]
pub struct ActiveRuns {
    runs: Mutex<HashMap<i64, Arc<RunHandle>>>,
}

impl ActiveRuns {
    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Arc<RunHandle>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `target` for `run_id`. Reserving the same run twice returns
    /// the existing handle.
    pub fn reserve(&self, run_id: i64, target: &str) -> Result<Arc<RunHandle>, SyncError> {
        let mut runs = self.lock();
        if let Some(handle) = runs.get(&run_id) {
            return Ok(Arc::clone(handle));
        }
        if runs.values().any(|handle| handle.target == target) {
            return Err(SyncError::TargetBusy {
                target: target.to_string(),
            });
        }
        let handle = Arc::new(RunHandle::new(run_id, target));
        runs.insert(run_id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, run_id: i64) -> Option<Arc<RunHandle>> {
        self.lock().get(&run_id).cloned()
    }

    pub fn release(&self, run_id: i64) {
        self.lock().remove(&run_id);
    }

    pub fn is_target_active(&self, target: &str) -> bool {
        self.lock().values().any(|handle| handle.target == target)
    }
}

/// Releases a reservation when dropped, on every exit path.
pub struct ActiveGuard {
    runs: Arc<ActiveRuns>,
    run_id: i64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.runs.release(self.run_id);
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Spawns rsync for a job, streams its output into the run log and the
/// progress file, and supports cancellation by run id.
pub struct SyncRunner {
    rsync: RsyncConfig,
    progress: ProgressStore,
    log_dir: PathBuf,
    lock_dir: PathBuf,
    active: Arc<ActiveRuns>,
}

impl SyncRunner {
    pub fn new(
        rsync: RsyncConfig,
        progress: ProgressStore,
        log_dir: impl Into<PathBuf>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            rsync,
            progress,
            log_dir: log_dir.into(),
            lock_dir: lock_dir.into(),
            active: Arc::new(ActiveRuns::default()),
        }
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn log_path(&self, run_id: i64) -> PathBuf {
        self.log_dir.join(format!("sync-{}.log", run_id))
    }

    /// Whether `run_id` is queued or running in this process.
    pub fn is_running(&self, run_id: i64) -> bool {
        self.active.get(run_id).is_some()
    }

    pub fn is_target_active(&self, target: &str) -> bool {
        self.active.is_target_active(target)
    }

    /// Reserve `target` for a freshly queued run so a second request for
    /// the same target is refused until this one finishes.
    pub fn reserve(&self, run_id: i64, target: &str) -> Result<Arc<RunHandle>, SyncError> {
        self.active.reserve(run_id, target)
    }

    /// Keep the reservation of `run_id` until the guard is dropped.
    pub fn guard(&self, run_id: i64) -> ActiveGuard {
        ActiveGuard {
            runs: Arc::clone(&self.active),
            run_id,
        }
    }

    /// Ask a queued or running job to stop. Returns `false` if the run is
    /// not active in this process.
    pub fn cancel(&self, run_id: i64) -> bool {
        match self.active.get(run_id) {
            Some(handle) => {
                tracing::debug!(run_id = handle.run_id(), "cancel signalled");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    async fn lock_target(&self, target: &str) -> Result<TargetLock, SyncError> {
        let deadline = Instant::now() + LOCK_RETRY;
        loop {
            match TargetLock::acquire(&self.lock_dir, target) {
                Err(SyncError::TargetBusy { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(LOCK_RETRY_STEP).await;
                }
                result => return result,
            }
        }
    }

    /// Run one pull to completion.
    ///
    /// Infrastructure problems (target busy, rsync missing, unwritable log)
    /// are returned as errors. A transfer that rsync itself reports as
    /// failed, or that was cancelled, is a normal `SyncOutcome`.
    pub async fn run(
        &self,
        job: &SyncJob,
        observer: &dyn SyncObserver,
    ) -> Result<SyncOutcome, SyncError> {
        let handle = self.active.reserve(job.run_id, &job.target)?;
        let _guard = self.guard(job.run_id);
        if handle.is_cancelled() {
            return Ok(self.cancelled_before_start(job, observer));
        }

        let _lock = self.lock_target(&job.target).await?;

        std::fs::create_dir_all(&job.destination).with_context(|| {
            format!("Failed to create destination {}", job.destination.display())
        })?;
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create log dir {}", self.log_dir.display()))?;

        let command = RsyncCommand::from_config(
            &self.rsync,
            &job.endpoint,
            &job.remote_dir,
            &job.destination,
        );
        let log_path = self.log_path(job.run_id);
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("Failed to open run log {}", log_path.display()))?;
        log.write_all(format!("$ {}\n", command.display()).as_bytes())
            .await
            .context("Failed to write run log")?;

        tracing::info!(
            run_id = job.run_id,
            target = %job.target,
            source = %job.endpoint.rsync_source(&job.remote_dir),
            destination = %job.destination.display(),
            "starting rsync"
        );

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SyncError::SpawnFailed {
                binary: command.binary().to_string(),
                source,
            })?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(Stream, String)>();
        let readers = [
            child
                .stdout
                .take()
                .map(|out| spawn_reader(out, Stream::Stdout, line_tx.clone())),
            child
                .stderr
                .take()
                .map(|err| spawn_reader(err, Stream::Stderr, line_tx.clone())),
        ];
        drop(line_tx);

        let mut progress = SyncProgress::new(job.run_id, &job.target);
        progress.status = SyncStatus::Running;
        self.persist(&progress, observer);
        let mut last_write = Instant::now();

        let mut files = Vec::new();
        let mut stderr_tail: Vec<String> = Vec::new();
        let mut cancelled = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                line = line_rx.recv() => {
                    let Some((stream, line)) = line else { break };
                    let prefix = match stream {
                        Stream::Stdout => "",
                        Stream::Stderr => "[stderr] ",
                    };
                    if let Err(e) = log.write_all(format!("{}{}\n", prefix, line).as_bytes()).await {
                        tracing::warn!(run_id = job.run_id, error = %e, "failed to append to run log");
                    }

                    if let Stream::Stderr = stream {
                        if stderr_tail.len() == STDERR_TAIL {
                            stderr_tail.remove(0);
                        }
                        stderr_tail.push(line);
                        continue;
                    }

                    let parsed = classify_line(&line);
                    let file_done = progress.apply(&parsed);
                    if file_done {
                        if let RsyncLine::File(name) = &parsed {
                            observer.on_file(job.run_id, name);
                            files.push(name.clone());
                        }
                    }
                    if file_done || last_write.elapsed() >= PROGRESS_WRITE_INTERVAL {
                        self.persist(&progress, observer);
                        last_write = Instant::now();
                    }
                }
                _ = handle.cancelled(), if !cancelled => {
                    tracing::info!(run_id = job.run_id, "cancelling rsync");
                    cancelled = true;
                    drain_deadline = Some(tokio::time::Instant::now() + CANCEL_DRAIN);
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(run_id = job.run_id, error = %e, "failed to kill rsync");
                    }
                }
                _ = sleep_until_opt(drain_deadline) => {
                    // rsync's ssh child can hold the pipes open after the kill.
                    break;
                }
            }
        }

        for reader in readers.into_iter().flatten() {
            reader.abort();
        }
        let status = child.wait().await.context("Failed to wait for rsync")?;

        let exit_code = status.code();
        let (final_status, error) = if cancelled {
            (
                SyncStatus::Cancelled,
                Some(SyncError::Cancelled { run_id: job.run_id }.to_string()),
            )
        } else {
            match exit_code {
                Some(0) => (SyncStatus::Completed, None),
                Some(RSYNC_VANISHED) => {
                    tracing::warn!(run_id = job.run_id, "some source files vanished during transfer");
                    (SyncStatus::Completed, None)
                }
                code => {
                    let code = code.unwrap_or(-1);
                    let message = stderr_tail
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "no error output".to_string());
                    (
                        SyncStatus::Failed,
                        Some(SyncError::RsyncFailed { code, message }.to_string()),
                    )
                }
            }
        };

        progress.finish(final_status, error.clone());
        self.persist(&progress, observer);
        let _ = log
            .write_all(format!("# exit {:?} -> {}\n", exit_code, final_status).as_bytes())
            .await;
        if let Err(e) = log.flush().await {
            tracing::warn!(run_id = job.run_id, error = %e, "failed to flush run log");
        }

        tracing::info!(
            run_id = job.run_id,
            target = %job.target,
            status = %final_status,
            files = files.len(),
            bytes = progress.bytes_transferred,
            "rsync finished"
        );

        Ok(SyncOutcome {
            run_id: job.run_id,
            status: final_status,
            files,
            bytes_transferred: progress.bytes_transferred,
            exit_code,
            error,
        })
    }

    fn cancelled_before_start(&self, job: &SyncJob, observer: &dyn SyncObserver) -> SyncOutcome {
        tracing::info!(run_id = job.run_id, target = %job.target, "run cancelled before rsync started");
        let outcome = SyncOutcome::cancelled(job.run_id);
        let mut progress = SyncProgress::new(job.run_id, &job.target);
        progress.finish(SyncStatus::Cancelled, outcome.error.clone());
        self.persist(&progress, observer);
        outcome
    }

    fn persist(&self, progress: &SyncProgress, observer: &dyn SyncObserver) {
        if let Err(e) = self.progress.write(progress) {
            tracing::warn!(run_id = progress.run_id, error = %format!("{:#}", e), "failed to write progress file");
        }
        observer.on_progress(progress);
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader<R>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        if tx.send((stream, line)).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send((stream, line));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex as StdMutex;
    use tempfile::{TempDir, tempdir};

    /// Write an executable stand-in for rsync that prints `body`.
    fn fake_rsync(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-rsync.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn runner_with(dir: &TempDir, binary: String) -> SyncRunner {
        let rsync = RsyncConfig {
            binary,
            ..RsyncConfig::default()
        };
        SyncRunner::new(
            rsync,
            ProgressStore::new(dir.path().join("progress")),
            dir.path().join("logs"),
            dir.path().join("locks"),
        )
    }

    fn job(dir: &TempDir, run_id: i64) -> SyncJob {
        SyncJob {
            run_id,
            target: "comfy".into(),
            endpoint: SshEndpoint::new("127.0.0.1", 2222, "root"),
            remote_dir: "/workspace/ComfyUI/output".into(),
            destination: dir.path().join("media/comfy"),
        }
    }

    #[derive(Default)]
    struct Recorder {
        files: StdMutex<Vec<String>>,
        updates: StdMutex<usize>,
    }

    impl SyncObserver for Recorder {
        fn on_progress(&self, _progress: &SyncProgress) {
            *self.updates.lock().unwrap() += 1;
        }
        fn on_file(&self, _run_id: i64, file: &str) {
            self.files.lock().unwrap().push(file.to_string());
        }
    }

    #[tokio::test]
    async fn test_successful_run_records_files_and_progress() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(
            dir.path(),
            r#"printf 'FILE:day1/\n'
printf '      1,024  50%%    1.00MB/s    0:00:01\r'
printf 'FILE:day1/a.png\n'
printf '      2,048 100%%    1.00MB/s    0:00:00 (xfr#2, to-chk=0/3)\r'
printf 'FILE:day1/b.mp4\n'
exit 0"#,
        );
        let runner = runner_with(&dir, script);
        let recorder = Recorder::default();

        let outcome = runner.run(&job(&dir, 7), &recorder).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Completed);
        assert_eq!(outcome.files, vec!["day1/a.png", "day1/b.mp4"]);
        assert_eq!(outcome.bytes_transferred, 2048);
        assert_eq!(*recorder.files.lock().unwrap(), outcome.files);
        assert!(*recorder.updates.lock().unwrap() >= 2);

        let progress = runner.progress_store().read(7).unwrap().unwrap();
        assert_eq!(progress.status, SyncStatus::Completed);
        assert_eq!(progress.percent, 100);
        assert_eq!(progress.files_transferred, 2);

        let log = std::fs::read_to_string(runner.log_path(7)).unwrap();
        assert!(log.contains("FILE:day1/a.png"));
        assert!(log.contains("--info=progress2"));
        assert!(dir.path().join("media/comfy").is_dir());
        assert!(!runner.is_running(7));
    }

    #[tokio::test]
    async fn test_vanished_files_exit_counts_as_success() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(dir.path(), "echo 'file has vanished: x.png' >&2\nexit 24");
        let runner = runner_with(&dir, script);
        let outcome = runner.run(&job(&dir, 1), &NoopObserver).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Completed);
        assert_eq!(outcome.exit_code, Some(24));
    }

    #[tokio::test]
    async fn test_failed_run_reports_last_stderr_line() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(
            dir.path(),
            "echo 'ssh: connect to host 127.0.0.1 port 2222: Connection refused' >&2\nexit 255",
        );
        let runner = runner_with(&dir, script);
        let outcome = runner.run(&job(&dir, 2), &NoopObserver).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Failed);
        let error = outcome.error.unwrap();
        assert!(error.contains("255"));
        assert!(error.contains("Connection refused"));

        let progress = runner.progress_store().read(2).unwrap().unwrap();
        assert_eq!(progress.status, SyncStatus::Failed);
        let log = std::fs::read_to_string(runner.log_path(2)).unwrap();
        assert!(log.contains("[stderr] ssh: connect"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempdir().unwrap();
        let runner = runner_with(&dir, dir.path().join("no-such-rsync").to_string_lossy().to_string());
        let err = runner.run(&job(&dir, 3), &NoopObserver).await.unwrap_err();
        assert!(matches!(err, SyncError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_busy_target_is_rejected() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(dir.path(), "exit 0");
        let runner = runner_with(&dir, script);
        let _held = TargetLock::acquire(runner.lock_dir(), "comfy").unwrap();
        let err = runner.run(&job(&dir, 4), &NoopObserver).await.unwrap_err();
        assert!(matches!(err, SyncError::TargetBusy { .. }));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_transfer() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(dir.path(), "printf 'FILE:a.png\\n'\nexec sleep 30");
        let runner = Arc::new(runner_with(&dir, script));

        let handle = {
            let runner = Arc::clone(&runner);
            let job = job(&dir, 5);
            tokio::spawn(async move { runner.run(&job, &NoopObserver).await })
        };

        let mut registered = false;
        for _ in 0..100 {
            if runner.is_running(5) && runner.progress_store().read(5).unwrap().is_some() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registered);
        assert!(runner.cancel(5));

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, SyncStatus::Cancelled);
        assert!(!runner.cancel(5));
    }

    #[tokio::test]
    async fn test_cancel_before_run_never_spawns_rsync() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let script = fake_rsync(dir.path(), &format!("touch {}\nexit 0", marker.display()));
        let runner = runner_with(&dir, script);

        runner.reserve(8, "comfy").unwrap();
        assert!(runner.cancel(8));
        let outcome = runner.run(&job(&dir, 8), &NoopObserver).await.unwrap();

        assert_eq!(outcome.status, SyncStatus::Cancelled);
        assert!(!marker.exists());
        let progress = runner.progress_store().read(8).unwrap().unwrap();
        assert_eq!(progress.status, SyncStatus::Cancelled);
        assert!(!runner.is_running(8));
    }

    #[tokio::test]
    async fn test_reservation_is_released_on_early_error() {
        let dir = tempdir().unwrap();
        let runner = runner_with(&dir, dir.path().join("no-such-rsync").to_string_lossy().to_string());
        runner.reserve(9, "comfy").unwrap();
        assert!(runner.run(&job(&dir, 9), &NoopObserver).await.is_err());

        assert!(!runner.is_running(9));
        assert!(!runner.is_target_active("comfy"));
        assert!(!runner.cancel(9));
    }

    #[test]
    fn test_one_reservation_per_target() {
        let runs = ActiveRuns::default();
        let first = runs.reserve(1, "comfy").unwrap();
        assert_eq!(runs.reserve(1, "comfy").unwrap().run_id(), first.run_id());
        assert!(matches!(
            runs.reserve(2, "comfy"),
            Err(SyncError::TargetBusy { ref target }) if target == "comfy"
        ));
        assert!(runs.reserve(3, "forge").is_ok());

        runs.release(1);
        assert!(!runs.is_target_active("comfy"));
        assert!(runs.reserve(2, "comfy").is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_earlier_cancel() {
        let handle = RunHandle::new(1, "comfy");
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
            .await
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_momentary_lock_holder_is_waited_out() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(dir.path(), "exit 0");
        let runner = runner_with(&dir, script);
        let held = TargetLock::acquire(runner.lock_dir(), "comfy").unwrap();
        let release = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        };

        let job = job(&dir, 10);
        let (outcome, _) = tokio::join!(runner.run(&job, &NoopObserver), release);
        assert_eq!(outcome.unwrap().status, SyncStatus::Completed);
    }

    /// Emits `count` progress records back to back.
    fn chatty_rsync(count: usize) -> String {
        format!(
            "i=0\nwhile [ $i -lt {} ]; do\n  printf '      %d  10%%    1.00MB/s    0:00:09\\r' $i\n  i=$((i+1))\ndone\nexit 0",
            count
        )
    }

    #[tokio::test]
    async fn test_progress_records_are_throttled() {
        let dir = tempdir().unwrap();
        let script = fake_rsync(dir.path(), &chatty_rsync(200));
        let runner = runner_with(&dir, script);
        let recorder = Recorder::default();

        let outcome = runner.run(&job(&dir, 11), &recorder).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Completed);
        // Initial write, final write, and at most a few interval writes.
        let updates = *recorder.updates.lock().unwrap();
        assert!(updates >= 2);
        assert!(updates < 20, "expected throttled writes, got {}", updates);
    }
}
