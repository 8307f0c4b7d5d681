use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use forge_types::{ForgeError, Result};
use tracing::warn;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Execution image
    pub image: String,
    pub command: Vec<String>,
    pub source_file: String,
    pub work_dir: String,

    // Limits
    pub execution_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub max_output_size: usize,
    pub max_code_size: usize,
    pub max_concurrent: usize,
    pub removal_max_retries: u32,

    // Web
    pub web_host: String,
    pub web_port: u16,

    // Logging
    pub log_level: String,
    pub log_json: bool,
    pub log_file: Option<PathBuf>,
}

/// Build-and-run line executed by the default C++ runner image.
pub const DEFAULT_RUN_LINE: &str = "g++ main.cpp -o main && ./main";

impl Default for Config {
    fn default() -> Self {
        Self {
            image: "forge-cpp-runner".to_string(),
            command: shell_command(DEFAULT_RUN_LINE),
            source_file: "main.cpp".to_string(),
            work_dir: "/app/".to_string(),
            execution_timeout_ms: 10_000,
            ping_timeout_ms: 5_000,
            max_output_size: 1024 * 1024,
            max_code_size: 64 * 1024,
            max_concurrent: 4,
            removal_max_retries: 2,
            web_host: "0.0.0.0".to_string(),
            web_port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Load a specific env file first, then read the environment.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        dotenvy::from_path(path).map_err(|e| {
            ForgeError::Config(format!("Failed to read env file {}: {e}", path.display()))
        })?;
        Self::from_env()
    }

    /// Build a config from the current process environment only.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let command = env_opt("FORGE_COMMAND")
            .map(|line| shell_command(&line))
            .unwrap_or(defaults.command);

        let config = Config {
            image: env_or("FORGE_IMAGE", defaults.image),
            command,
            source_file: env_or("FORGE_SOURCE_FILE", defaults.source_file),
            work_dir: env_or("FORGE_WORK_DIR", defaults.work_dir),

            execution_timeout_ms: env_parse("EXECUTION_TIMEOUT_MS", defaults.execution_timeout_ms),
            ping_timeout_ms: env_parse("PING_TIMEOUT_MS", defaults.ping_timeout_ms),
            max_output_size: env_parse("MAX_OUTPUT_SIZE", defaults.max_output_size),
            max_code_size: env_parse("MAX_CODE_SIZE", defaults.max_code_size),
            max_concurrent: env_parse("MAX_CONCURRENT_EXECUTIONS", defaults.max_concurrent),
            removal_max_retries: env_parse("REMOVAL_MAX_RETRIES", defaults.removal_max_retries),

            web_host: env_or("WEB_HOST", defaults.web_host),
            web_port: env_parse("WEB_PORT", defaults.web_port),

            log_level: env_or("LOG_LEVEL", defaults.log_level),
            log_json: env_bool("LOG_JSON", defaults.log_json),
            log_file: env_opt("LOG_FILE").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the executor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(ForgeError::Config("FORGE_IMAGE must not be empty".to_string()));
        }
        if self.command.is_empty() || self.command.iter().all(|part| part.trim().is_empty()) {
            return Err(ForgeError::Config("FORGE_COMMAND must not be empty".to_string()));
        }
        if self.source_file.is_empty()
            || self.source_file.contains('/')
            || self.source_file.contains('\\')
            || self.source_file == ".."
        {
            return Err(ForgeError::Config(format!(
                "FORGE_SOURCE_FILE must be a plain file name, got '{}'",
                self.source_file
            )));
        }
        if !self.work_dir.starts_with('/') {
            return Err(ForgeError::Config(format!(
                "FORGE_WORK_DIR must be an absolute path, got '{}'",
                self.work_dir
            )));
        }
        if self.execution_timeout_ms == 0 {
            return Err(ForgeError::Config("EXECUTION_TIMEOUT_MS must be positive".to_string()));
        }
        if self.ping_timeout_ms == 0 {
            return Err(ForgeError::Config("PING_TIMEOUT_MS must be positive".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(ForgeError::Config(
                "MAX_CONCURRENT_EXECUTIONS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// `host:port` the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.web_host, self.web_port)
    }
}

/// Wrap a run line so the image shell can chain steps with `&&`.
pub fn shell_command(line: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), line.to_string()]
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: String) -> String {
    env_opt(key).unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}
