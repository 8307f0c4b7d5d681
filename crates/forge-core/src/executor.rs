//! Ephemeral execution orchestrator.
//!
//! One call to [`Executor::execute`] owns exactly one container:
//!
//! ```text
//! pack → create → copy → start → race(exit | daemon error | deadline) → logs → remove
//! ```
//!
//! Removal is tied to an [`InstanceGuard`] created right after the daemon
//! hands back the container id, so every exit path (errors, timeout, or the
//! caller dropping the future) tears the container down.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use forge_config::Config;
use forge_types::{ExecutionRequest, ExecutionResult, ForgeError, InstanceState, Result};
use tokio::sync::Semaphore;
use tokio::time::Instant as Deadline;
use tracing::{debug, error, info, warn};

use crate::archive::{pack, PackedArchive};
use crate::image::ensure_image;
use crate::output::{collect_output, CollectedOutput};
use crate::runtime::{ping_within, ContainerRuntime};
use crate::utils::{with_retry, RetryConfig};

/// Per-service execution settings.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Name the payload gets inside the container.
    pub source_file: String,
    /// Directory the archive is extracted into.
    pub work_dir: String,
    pub max_output_size: usize,
    pub max_concurrent: usize,
    pub removal_retry: RetryConfig,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_file: config.source_file.clone(),
            work_dir: config.work_dir.clone(),
            max_output_size: config.max_output_size,
            max_concurrent: config.max_concurrent,
            removal_retry: RetryConfig::with_max_retries(config.removal_max_retries),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Runs submissions in throwaway containers on a shared runtime.
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ExecutorSettings,
    verified_images: Mutex<HashSet<String>>,
    permits: Semaphore,
}

impl Executor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ExecutorSettings) -> Self {
        let permits = Semaphore::new(settings.max_concurrent.max(1));
        Self {
            runtime,
            settings,
            verified_images: Mutex::new(HashSet::new()),
            permits,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Startup checks: the daemon answers within `ping_timeout`, then the
    /// image exists. Nothing else is touched if the ping fails.
    pub async fn preflight(&self, image: &str, ping_timeout: Duration) -> Result<()> {
        ping_within(self.runtime.as_ref(), ping_timeout).await?;
        self.verify_image(image).await
    }

    /// Check `image` on the daemon and remember it as usable.
    pub async fn verify_image(&self, image: &str) -> Result<()> {
        ensure_image(self.runtime.as_ref(), image).await?;
        self.verified_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image.to_string());
        Ok(())
    }

    pub fn is_verified(&self, image: &str) -> bool {
        self.verified_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(image)
    }

    /// Run `request` in a fresh container, giving up after `timeout`.
    ///
    /// Any exit code counts as completion; compiler and runtime failures of
    /// the payload come back as output. The container is removed before this
    /// returns, whatever the outcome.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let deadline = Deadline::now() + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        if !self.is_verified(request.image()) {
            self.verify_image(request.image()).await?;
        }

        let archive = pack(&self.settings.source_file, request.code())?;

        let _permit = within_deadline(deadline, timeout_ms, async {
            self.permits
                .acquire()
                .await
                .map_err(|_| ForgeError::Create("executor is closed".to_string()))
        })
        .await?;

        // Not deadline-bounded, and detached from this future: the guard is
        // built inside the task, so a create that finishes after the caller
        // went away is still removed when the unclaimed guard drops.
        let creation = tokio::spawn(create_guarded(
            Arc::clone(&self.runtime),
            request.image().to_string(),
            request.command().to_vec(),
            self.settings.removal_retry.clone(),
        ));
        let mut guard = creation
            .await
            .map_err(|e| ForgeError::Create(format!("create task failed: {e}")))??;
        let instance_id = guard.id().to_string();

        let outcome = self.drive(&mut guard, &archive, deadline, timeout_ms).await;
        let settled = guard.state();
        guard.release().await;

        let elapsed = started.elapsed();
        match outcome {
            Ok((collected, exit_code)) => {
                info!(
                    instance_id = %instance_id,
                    image = request.image(),
                    exit_code = ?exit_code,
                    bytes = collected.bytes.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Execution completed"
                );
                Ok(ExecutionResult {
                    output: collected.bytes,
                    exit_code,
                    truncated: collected.truncated,
                    duration: elapsed,
                })
            }
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    image = request.image(),
                    state = %settled,
                    kind = e.kind(),
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Execution failed"
                );
                Err(e)
            }
        }
    }

    /// Everything between creation and removal.
    async fn drive(
        &self,
        guard: &mut InstanceGuard,
        archive: &PackedArchive,
        deadline: Deadline,
        timeout_ms: u64,
    ) -> Result<(CollectedOutput, Option<i64>)> {
        let id = guard.id().to_string();
        let runtime = self.runtime.as_ref();

        within_deadline(
            deadline,
            timeout_ms,
            runtime.copy_archive(&id, &self.settings.work_dir, archive),
        )
        .await?;

        guard.transition(InstanceState::Starting);
        within_deadline(deadline, timeout_ms, runtime.start_instance(&id)).await?;
        guard.transition(InstanceState::Running);

        // First signal wins; the losing branch is dropped.
        let status = tokio::select! {
            waited = runtime.wait_for_not_running(&id) => match waited {
                Ok(status) => {
                    guard.transition(InstanceState::Completed);
                    status
                }
                Err(e) => {
                    guard.transition(InstanceState::DaemonError);
                    return Err(match e {
                        ForgeError::Daemon(_) => e,
                        other => ForgeError::Daemon(other.to_string()),
                    });
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                guard.transition(InstanceState::TimedOut);
                return Err(ForgeError::Timeout(timeout_ms));
            }
        };

        let collected = within_deadline(
            deadline,
            timeout_ms,
            collect_output(runtime.fetch_logs(&id), self.settings.max_output_size),
        )
        .await?;

        Ok((collected, status.exit_code))
    }
}

async fn create_guarded(
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    command: Vec<String>,
    retry: RetryConfig,
) -> Result<InstanceGuard> {
    let id = runtime.create_instance(&image, &command).await?;
    Ok(InstanceGuard::new(runtime, id, retry))
}

async fn within_deadline<T>(
    deadline: Deadline,
    timeout_ms: u64,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| ForgeError::Timeout(timeout_ms))?
}

/// Exclusive handle on one created container.
///
/// `release` removes it; dropping an unreleased guard schedules the removal
/// on the current tokio runtime instead.
pub struct InstanceGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    state: InstanceState,
    retry: RetryConfig,
    released: bool,
}

impl InstanceGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String, retry: RetryConfig) -> Self {
        debug!(instance_id = %id, state = %InstanceState::Created, "Instance acquired");
        Self {
            runtime,
            id,
            state: InstanceState::Created,
            retry,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    fn transition(&mut self, next: InstanceState) {
        debug!(instance_id = %self.id, from = %self.state, to = %next, "Instance state change");
        self.state = next;
    }

    /// Force-remove the container. Failures are retried and logged, never
    /// returned.
    ///
    /// The removal runs as its own task, so dropping this future midway does
    /// not cut the retries short.
    pub async fn release(mut self) {
        self.released = true;
        let removal = tokio::spawn(remove_with_retry(
            Arc::clone(&self.runtime),
            self.id.clone(),
            self.retry.clone(),
        ));
        if let Err(e) = removal.await {
            error!(instance_id = %self.id, error = %e, "Removal task failed");
        }
        self.transition(InstanceState::Removed);
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let runtime = Arc::clone(&self.runtime);
        let id = std::mem::take(&mut self.id);
        let retry = self.retry.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(instance_id = %id, state = %self.state, "Execution abandoned, removing container in background");
                handle.spawn(remove_with_retry(runtime, id, retry));
            }
            Err(_) => {
                error!(instance_id = %id, "No async runtime to remove container, it is leaked");
            }
        }
    }
}

async fn remove_with_retry(runtime: Arc<dyn ContainerRuntime>, id: String, retry: RetryConfig) {
    let name = format!("remove_instance({id})");
    match with_retry(&retry, &name, || runtime.remove_instance(&id)).await {
        Ok(()) => debug!(instance_id = %id, "Container removed"),
        Err(e) => error!(instance_id = %id, error = %e, "Giving up on container removal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RuntimeCall, WaitBehavior};
    use forge_types::LogChunk;

    const IMAGE: &str = "forge-cpp-runner";

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code, IMAGE, forge_config::config::shell_command("./main"))
    }

    fn executor(mock: &Arc<MockRuntime>) -> Executor {
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();
        Executor::new(runtime, ExecutorSettings::default())
    }

    #[tokio::test]
    async fn completed_run_returns_merged_output() {
        let mock = Arc::new(MockRuntime::new().with_logs(vec![
            LogChunk::stdout("Hello "),
            LogChunk::stderr("(warn) "),
            LogChunk::stdout("Forge"),
        ]));
        let result = executor(&mock)
            .execute(&request("int main(){}"), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.output, b"Hello (warn) Forge");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.truncated);
        assert_eq!(mock.create_count(), 1);
        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test]
    async fn call_order_is_create_copy_start_wait_logs_remove() {
        let mock = Arc::new(MockRuntime::new());
        let exec = executor(&mock);
        exec.verify_image(IMAGE).await.unwrap();
        exec.execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap();

        let calls = mock.calls();
        let id = "mock-0001".to_string();
        assert_eq!(
            calls[1..],
            [
                RuntimeCall::CreateInstance {
                    image: IMAGE.to_string(),
                    command: forge_config::config::shell_command("./main"),
                },
                RuntimeCall::CopyArchive {
                    instance_id: id.clone(),
                    target_dir: "/app/".to_string(),
                },
                RuntimeCall::StartInstance(id.clone()),
                RuntimeCall::WaitForNotRunning(id.clone()),
                RuntimeCall::FetchLogs(id.clone()),
                RuntimeCall::RemoveInstance(id),
            ]
        );
    }

    #[tokio::test]
    async fn uploaded_archive_holds_the_code() {
        let mock = Arc::new(MockRuntime::new());
        executor(&mock)
            .execute(&request("int main() { return 0; }"), Duration::from_secs(10))
            .await
            .unwrap();

        let uploads = mock.uploads();
        assert_eq!(uploads.len(), 1);
        let entries = uploads[0].read_entries().unwrap();
        assert_eq!(entries[0].name, "main.cpp");
        assert_eq!(entries[0].body, b"int main() { return 0; }");
    }

    #[tokio::test]
    async fn nonzero_exit_is_still_a_result() {
        let mock = Arc::new(
            MockRuntime::new()
                .with_wait(WaitBehavior::Exit(1))
                .with_logs(vec![LogChunk::stderr(
                    "main.cpp:1:1: error: 'x' does not name a type\n",
                )]),
        );
        let result = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert!(result.output_lossy().contains("does not name a type"));
        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_wins_over_hanging_container() {
        let mock = Arc::new(MockRuntime::new().with_wait(WaitBehavior::Hang));
        let started = tokio::time::Instant::now();
        let err = executor(&mock)
            .execute(&request("while(true){}"), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, ForgeError::Timeout(2000)));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(mock.remove_count(), 1);
        assert_eq!(
            mock.count(|c| matches!(c, RuntimeCall::FetchLogs(_))),
            0,
            "timeout must skip log collection"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exit_before_deadline_completes() {
        let mock = Arc::new(MockRuntime::new().with_wait(WaitBehavior::ExitAfter {
            code: 0,
            after: Duration::from_millis(1500),
        }));
        let started = tokio::time::Instant::now();
        let result = executor(&mock)
            .execute(&request("x"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test]
    async fn daemon_error_while_waiting_is_surfaced() {
        let mock =
            Arc::new(MockRuntime::new().with_wait(WaitBehavior::DaemonError("daemon restarted".into())));
        let err = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Daemon(ref m) if m.contains("daemon restarted")));
        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test]
    async fn create_failure_needs_no_cleanup() {
        let mock = Arc::new(MockRuntime::new().with_create_error("no space left on device"));
        let err = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Create(_)));
        assert_eq!(mock.create_count(), 1);
        assert_eq!(mock.remove_count(), 0);
    }

    #[tokio::test]
    async fn copy_failure_still_removes() {
        let mock = Arc::new(MockRuntime::new().with_copy_error("archive rejected"));
        let err = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Copy(_)));
        assert_eq!(mock.remove_count(), 1);
        assert_eq!(mock.count(|c| matches!(c, RuntimeCall::StartInstance(_))), 0);
    }

    #[tokio::test]
    async fn start_failure_still_removes() {
        let mock = Arc::new(MockRuntime::new().with_start_error("exec format error"));
        let err = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Start(_)));
        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test]
    async fn log_fetch_failure_still_removes() {
        let mock = Arc::new(MockRuntime::new().with_log_error("stream reset"));
        let err = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::LogFetch(_)));
        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_failure_is_retried_not_escalated() {
        let mock = Arc::new(MockRuntime::new().with_remove_failures(1));
        let result = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await;
        assert!(result.is_ok());
        assert_eq!(mock.remove_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_removal_failure_is_swallowed() {
        let mock = Arc::new(MockRuntime::new().with_remove_failures(100));
        let result = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await;
        assert!(result.is_ok());
        // 1 attempt + default 2 retries
        assert_eq!(mock.remove_count(), 3);
    }

    #[tokio::test]
    async fn missing_image_blocks_creation() {
        let mock = Arc::new(MockRuntime::new().with_missing_image(IMAGE));
        let err = executor(&mock)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ImageNotFound(_)));
        assert_eq!(mock.create_count(), 0);
    }

    #[tokio::test]
    async fn verified_image_is_checked_once() {
        let mock = Arc::new(MockRuntime::new());
        let exec = executor(&mock);
        for _ in 0..3 {
            exec.execute(&request("x"), Duration::from_secs(10))
                .await
                .unwrap();
        }
        assert_eq!(
            mock.count(|c| matches!(c, RuntimeCall::InspectImage(_))),
            1
        );
        assert_eq!(mock.create_count(), 3);
        assert_eq!(mock.remove_count(), 3);
    }

    #[tokio::test]
    async fn preflight_stops_at_failed_ping() {
        let mock = Arc::new(MockRuntime::new().with_unreachable_daemon());
        let err = executor(&mock)
            .preflight(IMAGE, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Connection(_)));
        assert_eq!(mock.calls(), vec![RuntimeCall::Ping]);
    }

    #[tokio::test]
    async fn preflight_marks_image_verified() {
        let mock = Arc::new(MockRuntime::new());
        let exec = executor(&mock);
        exec.preflight(IMAGE, Duration::from_secs(5)).await.unwrap();
        assert!(exec.is_verified(IMAGE));
    }

    #[tokio::test]
    async fn output_limit_truncates() {
        let mock = Arc::new(MockRuntime::new().with_logs(vec![LogChunk::stdout(vec![b'y'; 64])]));
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();
        let settings = ExecutorSettings {
            max_output_size: 16,
            ..ExecutorSettings::default()
        };
        let result = Executor::new(runtime, settings)
            .execute(&request("x"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.output.len(), 16);
        assert!(result.truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_execution_still_removes_container() {
        let mock = Arc::new(MockRuntime::new().with_wait(WaitBehavior::Hang));
        let exec = Arc::new(executor(&mock));

        let task_exec = Arc::clone(&exec);
        let handle = tokio::spawn(async move {
            task_exec
                .execute(&request("for(;;);"), Duration::from_secs(60))
                .await
        });

        // Let the execution reach the wait race.
        while mock.count(|c| matches!(c, RuntimeCall::WaitForNotRunning(_))) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        let _ = handle.await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(mock.remove_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_during_create_still_removes_container() {
        let mock = Arc::new(MockRuntime::new().with_create_delay(Duration::from_secs(1)));
        let exec = Arc::new(executor(&mock));

        let task_exec = Arc::clone(&exec);
        let handle = tokio::spawn(async move {
            task_exec
                .execute(&request("int main(){}"), Duration::from_secs(10))
                .await
        });

        while mock.create_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        // The daemon answers the create after the caller is gone.
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(mock.remove_count(), 1);
        assert_eq!(mock.count(|c| matches!(c, RuntimeCall::StartInstance(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_during_removal_backoff_keeps_retrying() {
        let mock = Arc::new(MockRuntime::new().with_remove_failures(1));
        let exec = Arc::new(executor(&mock));

        let task_exec = Arc::clone(&exec);
        let handle = tokio::spawn(async move {
            task_exec
                .execute(&request("int main(){}"), Duration::from_secs(10))
                .await
        });

        // First removal attempt has failed; the retry is sleeping on backoff.
        while mock.remove_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.abort();
        let _ = handle.await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.remove_count(), 2);
    }

    #[tokio::test]
    async fn guard_release_marks_removed_once() {
        let mock = Arc::new(MockRuntime::new());
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();
        let guard = InstanceGuard::new(runtime, "abc".to_string(), RetryConfig::default());
        assert_eq!(guard.state(), InstanceState::Created);
        guard.release().await;
        assert_eq!(mock.calls(), vec![RuntimeCall::RemoveInstance("abc".to_string())]);
    }
}
