use std::path::PathBuf;

use packflow::logging::init_logging;
use packflow::{Engine, EngineConfig, StepRegistry, load_models_dir};
use tokio_util::sync::CancellationToken;

/// Optional directory for rolling log files.
const ENV_LOG_DIR: &str = "PACKFLOW_LOG_DIR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = std::env::var(ENV_LOG_DIR).ok().map(PathBuf::from);
    let logging = init_logging(log_dir.as_deref())?;
    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    let config = EngineConfig::from_env()?;

    let registry = StepRegistry::with_builtins();
    let models = match &config.models_dir {
        Some(dir) => load_models_dir(dir, &registry)?,
        None => {
            tracing::warn!("No models directory configured, starting without models");
            Vec::new()
        }
    };

    let engine = Engine::new(config, models)?;
    tracing::info!(
        root = %engine.config().packages_root.display(),
        "packflow initialized successfully"
    );

    shutdown_signal().await?;

    engine.close().await;
    background.cancel();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!(signal = "SIGINT", "Signal received");
        }
        _ = sigterm.recv() => {
            tracing::info!(signal = "SIGTERM", "Signal received");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(signal = "ctrl-c", "Signal received");
    Ok(())
}
