//! Scripted in-memory runtime.
//!
//! Records every call so tests (and dry runs without a daemon) can check
//! ordering and cleanup. Behavior is configured with the `with_*` builders.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use forge_types::{ForgeError, LogChunk, Result};

use super::{ContainerRuntime, LogStream, WaitStatus};
use crate::archive::PackedArchive;
use crate::output::demux_frames;

/// One recorded runtime operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Ping,
    InspectImage(String),
    CreateInstance { image: String, command: Vec<String> },
    CopyArchive { instance_id: String, target_dir: String },
    StartInstance(String),
    WaitForNotRunning(String),
    FetchLogs(String),
    RemoveInstance(String),
    Close,
}

/// How the scripted container stops.
#[derive(Debug, Clone)]
pub enum WaitBehavior {
    /// Stops immediately with this exit code.
    Exit(i64),
    /// Stops with `code` once `after` has elapsed.
    ExitAfter { code: i64, after: Duration },
    /// Never stops (an infinite loop in the payload).
    Hang,
    /// The daemon fails while waiting.
    DaemonError(String),
}

#[derive(Debug, Clone)]
enum PingBehavior {
    Ok,
    Unreachable,
    Hang,
}

#[derive(Debug, Clone)]
enum LogScript {
    Chunks(Vec<LogChunk>),
    Raw(Vec<u8>),
    Error(String),
}

/// In-memory [`ContainerRuntime`] with scripted responses.
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    uploads: Mutex<Vec<PackedArchive>>,
    ping: PingBehavior,
    missing_images: HashSet<String>,
    image_check_error: Option<String>,
    create_error: Option<String>,
    create_delay: Option<Duration>,
    copy_error: Option<String>,
    start_error: Option<String>,
    wait: WaitBehavior,
    logs: LogScript,
    remove_failures: AtomicU32,
    next_id: AtomicU64,
}

impl MockRuntime {
    /// A healthy daemon where every image exists and containers exit 0
    /// without output.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            ping: PingBehavior::Ok,
            missing_images: HashSet::new(),
            image_check_error: None,
            create_error: None,
            create_delay: None,
            copy_error: None,
            start_error: None,
            wait: WaitBehavior::Exit(0),
            logs: LogScript::Chunks(Vec::new()),
            remove_failures: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_unreachable_daemon(mut self) -> Self {
        self.ping = PingBehavior::Unreachable;
        self
    }

    pub fn with_hanging_ping(mut self) -> Self {
        self.ping = PingBehavior::Hang;
        self
    }

    pub fn with_missing_image(mut self, image: &str) -> Self {
        self.missing_images.insert(image.to_string());
        self
    }

    pub fn with_image_check_error(mut self, msg: &str) -> Self {
        self.image_check_error = Some(msg.to_string());
        self
    }

    pub fn with_create_error(mut self, msg: &str) -> Self {
        self.create_error = Some(msg.to_string());
        self
    }

    /// Hold each create for `delay` before the daemon answers.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn with_copy_error(mut self, msg: &str) -> Self {
        self.copy_error = Some(msg.to_string());
        self
    }

    pub fn with_start_error(mut self, msg: &str) -> Self {
        self.start_error = Some(msg.to_string());
        self
    }

    pub fn with_wait(mut self, wait: WaitBehavior) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_logs(mut self, chunks: Vec<LogChunk>) -> Self {
        self.logs = LogScript::Chunks(chunks);
        self
    }

    /// Serve logs as a raw multiplexed frame stream.
    pub fn with_raw_logs(mut self, raw: Vec<u8>) -> Self {
        self.logs = LogScript::Raw(raw);
        self
    }

    pub fn with_log_error(mut self, msg: &str) -> Self {
        self.logs = LogScript::Error(msg.to_string());
        self
    }

    /// Fail the next `n` removal attempts.
    pub fn with_remove_failures(self, n: u32) -> Self {
        self.remove_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Snapshot of all recorded calls, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    pub fn create_count(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::CreateInstance { .. }))
    }

    pub fn remove_count(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::RemoveInstance(_)))
    }

    /// Archives received through `copy_archive`.
    pub fn uploads(&self) -> Vec<PackedArchive> {
        lock(&self.uploads).clone()
    }

    fn record(&self, call: RuntimeCall) {
        lock(&self.calls).push(call);
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        self.record(RuntimeCall::Ping);
        match self.ping {
            PingBehavior::Ok => Ok(()),
            PingBehavior::Unreachable => Err(ForgeError::Connection(
                "connection refused: /var/run/docker.sock".to_string(),
            )),
            PingBehavior::Hang => futures::future::pending().await,
        }
    }

    async fn inspect_image(&self, image: &str) -> Result<bool> {
        self.record(RuntimeCall::InspectImage(image.to_string()));
        if let Some(msg) = &self.image_check_error {
            return Err(ForgeError::ImageCheck(msg.clone()));
        }
        Ok(!self.missing_images.contains(image))
    }

    async fn create_instance(&self, image: &str, command: &[String]) -> Result<String> {
        self.record(RuntimeCall::CreateInstance {
            image: image.to_string(),
            command: command.to_vec(),
        });
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = &self.create_error {
            return Err(ForgeError::Create(msg.clone()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock-{n:04}"))
    }

    async fn copy_archive(
        &self,
        instance_id: &str,
        target_dir: &str,
        archive: &PackedArchive,
    ) -> Result<()> {
        self.record(RuntimeCall::CopyArchive {
            instance_id: instance_id.to_string(),
            target_dir: target_dir.to_string(),
        });
        if let Some(msg) = &self.copy_error {
            return Err(ForgeError::Copy(msg.clone()));
        }
        lock(&self.uploads).push(archive.clone());
        Ok(())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.record(RuntimeCall::StartInstance(instance_id.to_string()));
        match &self.start_error {
            Some(msg) => Err(ForgeError::Start(msg.clone())),
            None => Ok(()),
        }
    }

    async fn wait_for_not_running(&self, instance_id: &str) -> Result<WaitStatus> {
        self.record(RuntimeCall::WaitForNotRunning(instance_id.to_string()));
        match &self.wait {
            WaitBehavior::Exit(code) => Ok(WaitStatus {
                exit_code: Some(*code),
            }),
            WaitBehavior::ExitAfter { code, after } => {
                tokio::time::sleep(*after).await;
                Ok(WaitStatus {
                    exit_code: Some(*code),
                })
            }
            WaitBehavior::Hang => futures::future::pending().await,
            WaitBehavior::DaemonError(msg) => Err(ForgeError::Daemon(msg.clone())),
        }
    }

    fn fetch_logs(&self, instance_id: &str) -> LogStream {
        self.record(RuntimeCall::FetchLogs(instance_id.to_string()));
        let items: Vec<Result<LogChunk>> = match &self.logs {
            LogScript::Chunks(chunks) => chunks.iter().cloned().map(Ok).collect(),
            LogScript::Raw(raw) => match demux_frames(raw) {
                Ok(chunks) => chunks.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            },
            LogScript::Error(msg) => vec![Err(ForgeError::LogFetch(msg.clone()))],
        };
        Box::pin(futures::stream::iter(items))
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        self.record(RuntimeCall::RemoveInstance(instance_id.to_string()));
        let failed = self
            .remove_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ForgeError::Removal(format!(
                "removal of {instance_id} is already in progress"
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(RuntimeCall::Close);
    }
}
