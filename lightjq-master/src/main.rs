use std::process::ExitCode;

use lightjq::{config::MasterConfig, Master, MasterError};
use lightjq_redis::RedisTransport;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

mod config;
mod shutdown;

use config::{ConfigError, RedisConfig};

#[derive(Debug, Error)]
enum StartupError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error("Failed to connect to redis")]
    Connect(#[source] lightjq::transport::TransportError),
    #[error(transparent)]
    Master(#[from] MasterError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(?err, "Master exited with error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = RedisConfig::from_env()?;
    tracing::info!(
        addr = %config.addr,
        port = config.port,
        database = config.database,
        namespace = %config.namespace,
        "Connecting to redis at {}:{}",
        config.addr,
        config.port
    );
    let transport = RedisTransport::connect(config.connection_info()?, &config.namespace)
        .await
        .map_err(StartupError::Connect)?;

    let token = shutdown::install_shutdown_handler();
    Master::new(transport)
        .with_config(MasterConfig::default())
        .run(token)
        .await?;

    tracing::info!("Master shut down");
    Ok(())
}
