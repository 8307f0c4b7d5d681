use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use forge_config::Config;
use forge_core::{
    init_logging, ContainerRuntime, DockerRuntime, Executor, ExecutorSettings, GracefulShutdown,
};
use forge_types::ExecutionRequest;
use forge_web::AppState;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "forge", about = "Forge - ephemeral container code runner", version)]
struct Cli {
    /// Read this env file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP submission server (default)
    Serve,
    /// Run a single source file and print its output
    Run {
        file: PathBuf,
        /// Override EXECUTION_TIMEOUT_MS
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print a JSON summary instead of raw output
        #[arg(long)]
        json: bool,
    },
    /// Check daemon connectivity and image availability
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.env_file {
        Some(path) => Config::load_from_file(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_logging(&config.log_level, config.log_file.as_deref(), config.log_json);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Run {
            file,
            timeout_ms,
            json,
        } => run(config, file, timeout_ms, json).await,
        Commands::Check => check(config).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<(Arc<dyn ContainerRuntime>, Executor)> {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to connect to the container daemon")?,
    );
    let executor = Executor::new(runtime.clone(), ExecutorSettings::from_config(config));
    Ok((runtime, executor))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(image = %config.image, "Forge starting...");

    let (runtime, executor) = connect(&config).await?;
    executor
        .preflight(&config.image, config.ping_timeout())
        .await
        .context("Pre-flight check failed")?;
    info!(image = %config.image, "Daemon reachable and image present");

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    let shutdown = Arc::new(GracefulShutdown::new());
    let mut shutdown_rx = shutdown.subscribe();
    let signal_waiter = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    let state = AppState::from_config(Arc::new(executor), &config);
    info!("Forge is running. Press Ctrl+C to stop.");
    let served = forge_web::serve(listener, state, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await;

    signal_waiter.abort();
    runtime.close().await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server error");
    }
    info!("Forge stopped.");
    served
}

async fn run(
    config: Config,
    file: PathBuf,
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let code = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.execution_timeout());

    let (runtime, executor) = connect(&config).await?;
    let outcome = async {
        executor
            .preflight(&config.image, config.ping_timeout())
            .await?;
        let request = ExecutionRequest::new(code, config.image.clone(), config.command.clone());
        executor.execute(&request, timeout).await
    }
    .await;
    runtime.close().await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) if json => {
            let report = serde_json::json!({ "error": e.kind(), "message": e.to_string() });
            println!("{}", serde_json::to_string_pretty(&report)?);
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("Execution failed"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.output_lossy());
        if result.truncated {
            eprintln!("\n[output truncated]");
        }
    }

    match result.exit_code {
        Some(code) if code != 0 => std::process::exit(code as i32),
        _ => Ok(()),
    }
}

async fn check(config: Config) -> anyhow::Result<()> {
    let (runtime, executor) = connect(&config).await?;
    let checked = executor
        .preflight(&config.image, config.ping_timeout())
        .await;
    runtime.close().await;

    checked.with_context(|| format!("Check failed for image '{}'", config.image))?;
    println!("Daemon reachable, image '{}' present.", config.image);
    Ok(())
}
