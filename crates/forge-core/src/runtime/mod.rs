//! Capability interface over the container daemon.
//!
//! The executor only talks to a `ContainerRuntime`, so another isolation
//! backend can stand in for Docker without touching the orchestration.

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockRuntime, RuntimeCall, WaitBehavior};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use forge_types::{ForgeError, LogChunk, Result};
use futures::Stream;
use tracing::debug;

use crate::archive::PackedArchive;

/// Demultiplexed container log stream.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogChunk>> + Send>>;

/// What the daemon reported once the container stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus {
    pub exit_code: Option<i64>,
}

/// Operations the executor needs from a container daemon.
///
/// Implementations hold no per-execution state and must be safe to share
/// between concurrent executions.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Liveness probe. Unbounded; use [`ping_within`] for a deadline.
    async fn ping(&self) -> Result<()>;

    /// Metadata lookup. `Ok(false)` means the image does not exist;
    /// `Err` means the lookup itself failed.
    async fn inspect_image(&self, image: &str) -> Result<bool>;

    /// Create a stopped container and return its daemon-assigned id.
    async fn create_instance(&self, image: &str, command: &[String]) -> Result<String>;

    /// Extract `archive` into `target_dir` inside the container.
    async fn copy_archive(
        &self,
        instance_id: &str,
        target_dir: &str,
        archive: &PackedArchive,
    ) -> Result<()>;

    async fn start_instance(&self, instance_id: &str) -> Result<()>;

    /// Resolve once the container is no longer running. Any exit code is a
    /// normal stop; `Err` is a daemon fault while waiting.
    async fn wait_for_not_running(&self, instance_id: &str) -> Result<WaitStatus>;

    /// Combined stdout/stderr log of a stopped container.
    fn fetch_logs(&self, instance_id: &str) -> LogStream;

    /// Force-remove the container, whether or not it is still running.
    async fn remove_instance(&self, instance_id: &str) -> Result<()>;

    /// Release the daemon connection. Safe to call more than once.
    async fn close(&self);
}

/// Ping the daemon, failing with `Connection` once `timeout` elapses.
pub async fn ping_within(runtime: &dyn ContainerRuntime, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, runtime.ping()).await {
        Ok(Ok(())) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "Daemon ping ok");
            Ok(())
        }
        Ok(Err(ForgeError::Connection(msg))) => Err(ForgeError::Connection(msg)),
        Ok(Err(other)) => Err(ForgeError::Connection(other.to_string())),
        Err(_) => Err(ForgeError::Connection(format!(
            "no ping response within {}ms",
            timeout.as_millis()
        ))),
    }
}
