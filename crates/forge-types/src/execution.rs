use std::time::Duration;

use serde::{Serialize, Serializer};

/// A single piece of code to run inside a fresh container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    code: Vec<u8>,
    image: String,
    command: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<Vec<u8>>, image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            code: code.into(),
            image: image.into(),
            command,
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

/// Output of a run that reached a natural exit.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// stdout and stderr merged in arrival order.
    #[serde(serialize_with = "lossy_utf8")]
    pub output: Vec<u8>,
    /// Exit status reported by the daemon. Informational only.
    pub exit_code: Option<i64>,
    /// Set when output was cut at the configured limit.
    pub truncated: bool,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Lifecycle of an ephemeral container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Completed,
    TimedOut,
    DaemonError,
    Removed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::DaemonError => "daemon_error",
            Self::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

/// Which container stream a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Raw TTY output, no stream attribution.
    Console,
}

/// One demultiplexed log frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl LogChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            data: data.into(),
        }
    }
}
