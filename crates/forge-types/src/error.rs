use thiserror::Error;

/// Top-level error type for Forge.
///
/// Every failure of the execution core maps to exactly one variant so callers
/// can tell them apart. Failures of the submitted program itself are not
/// errors; they show up as captured output.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Docker daemon is unreachable: {0}")]
    Connection(String),

    #[error("Docker image '{0}' not found. Did you run 'docker build'?")]
    ImageNotFound(String),

    #[error("Failed to check Docker image: {0}")]
    ImageCheck(String),

    #[error("Failed to create tar archive: {0}")]
    Packaging(String),

    #[error("Failed to create container: {0}")]
    Create(String),

    #[error("Failed to copy code to container: {0}")]
    Copy(String),

    #[error("Failed to start container: {0}")]
    Start(String),

    #[error("Execution timed out after {0}ms")]
    Timeout(u64),

    #[error("Error while waiting for container: {0}")]
    Daemon(String),

    #[error("Failed to fetch logs: {0}")]
    LogFetch(String),

    #[error("Failed to remove container: {0}")]
    Removal(String),
}

impl ForgeError {
    /// Stable label for logs and response mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection(_) => "connection",
            Self::ImageNotFound(_) => "image_not_found",
            Self::ImageCheck(_) => "image_check",
            Self::Packaging(_) => "packaging",
            Self::Create(_) => "create",
            Self::Copy(_) => "copy",
            Self::Start(_) => "start",
            Self::Timeout(_) => "timed_out",
            Self::Daemon(_) => "daemon",
            Self::LogFetch(_) => "log_fetch",
            Self::Removal(_) => "removal",
        }
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, ForgeError>;
