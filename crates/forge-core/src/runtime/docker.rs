use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, ContainerWaitResponse};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, UploadToContainerOptionsBuilder, WaitContainerOptionsBuilder,
};
use bollard::Docker;
use forge_types::{ForgeError, LogChunk, Result, StreamKind};
use futures::StreamExt;
use tracing::{debug, info};

use super::{ContainerRuntime, LogStream, WaitStatus};
use crate::archive::PackedArchive;

/// Docker Engine backend.
///
/// Cheap to share: the underlying client is a connection pool, and no
/// execution-specific state lives here. After [`close`](ContainerRuntime::close)
/// the client is dropped and every operation fails with `Connection`.
pub struct DockerRuntime {
    docker: RwLock<Option<Docker>>,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` (or the platform default socket/pipe) and
    /// negotiate the API version with the daemon.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_defaults().map_err(|e| {
            ForgeError::Connection(format!("Failed to create docker client: {e}"))
        })?;
        let docker = docker.negotiate_version().await.map_err(|e| {
            ForgeError::Connection(format!("API version negotiation failed: {e}"))
        })?;

        info!(api_version = ?docker.client_version(), "Connected to Docker daemon");
        Ok(Self::from_client(docker))
    }

    /// Wrap an already configured client.
    pub fn from_client(docker: Docker) -> Self {
        Self {
            docker: RwLock::new(Some(docker)),
        }
    }

    /// Handle for one call; fails once the connection is closed.
    fn client(&self) -> Result<Docker> {
        self.docker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ForgeError::Connection("connection closed".to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client()?
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ForgeError::Connection(e.to_string()))
    }

    async fn inspect_image(&self, image: &str) -> Result<bool> {
        match self.client()?.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ForgeError::ImageCheck(e.to_string())),
        }
    }

    async fn create_instance(&self, image: &str, command: &[String]) -> Result<String> {
        let name = format!("forge-{}", uuid::Uuid::new_v4());
        // No host config: resource limits are not applied.
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(command.to_vec()),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..ContainerCreateBody::default()
        };

        let created = self
            .client()?
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(|e| ForgeError::Create(e.to_string()))?;

        debug!(instance_id = %created.id, name = %name, image, "Container created");
        Ok(created.id)
    }

    async fn copy_archive(
        &self,
        instance_id: &str,
        target_dir: &str,
        archive: &PackedArchive,
    ) -> Result<()> {
        let options = UploadToContainerOptionsBuilder::new()
            .path(target_dir)
            .build();
        self.client()?
            .upload_to_container(
                instance_id,
                Some(options),
                bollard::body_full(archive.as_bytes().to_vec().into()),
            )
            .await
            .map_err(|e| ForgeError::Copy(e.to_string()))?;

        debug!(
            instance_id,
            entry = archive.entry_name(),
            bytes = archive.payload_size(),
            target_dir,
            "Archive uploaded"
        );
        Ok(())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.client()?
            .start_container(instance_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| ForgeError::Start(e.to_string()))
    }

    async fn wait_for_not_running(&self, instance_id: &str) -> Result<WaitStatus> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let docker = self.client()?;
        let mut waiter = docker.wait_container(instance_id, Some(options));
        wait_status(waiter.next().await)
    }

    fn fetch_logs(&self, instance_id: &str) -> LogStream {
        let docker = match self.client() {
            Ok(docker) => docker,
            Err(e) => return Box::pin(futures::stream::iter([Err(e)])),
        };
        let instance_id = instance_id.to_string();

        Box::pin(async_stream::stream! {
            let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
            let mut logs = docker.logs(&instance_id, Some(options));
            while let Some(item) = logs.next().await {
                yield item
                    .map(log_chunk)
                    .map_err(|e| ForgeError::LogFetch(e.to_string()));
            }
        })
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        let removed = self
            .client()?
            .remove_container(instance_id, Some(options))
            .await;
        removal_result(removed)
    }

    async fn close(&self) {
        let taken = self
            .docker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            info!("Docker connection closed");
        }
    }
}

/// Interpret the first item of a "not-running" wait stream.
fn wait_status(
    item: Option<std::result::Result<ContainerWaitResponse, BollardError>>,
) -> Result<WaitStatus> {
    match item {
        Some(Ok(response)) => Ok(WaitStatus {
            exit_code: Some(response.status_code),
        }),
        // bollard reports a non-zero exit as an error; it is still a stop.
        Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(WaitStatus {
            exit_code: Some(code),
        }),
        Some(Err(e)) => Err(ForgeError::Daemon(e.to_string())),
        None => Err(ForgeError::Daemon(
            "wait stream closed without a status".to_string(),
        )),
    }
}

fn removal_result(removed: std::result::Result<(), BollardError>) -> Result<()> {
    match removed {
        Ok(()) => Ok(()),
        // Already gone counts as removed.
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(ForgeError::Removal(e.to_string())),
    }
}

fn log_chunk(output: LogOutput) -> LogChunk {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => (StreamKind::Stdout, message),
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::StdIn { message } => (StreamKind::Stdin, message),
        LogOutput::Console { message } => (StreamKind::Console, message),
    };
    LogChunk {
        stream,
        data: message.to_vec(),
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
