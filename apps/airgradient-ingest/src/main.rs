use airgradient_ingest::{cli, config::Config, lifecycle};
use anyhow::Result;
use clap::Parser;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,airgradient_ingest=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing()?;

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(op = "main.load_configuration", error = %err, "failed to load configuration");
            return Err(err.into());
        }
    };

    if let Err(err) = lifecycle::run(config).await {
        let detail = format!("{err:#}");
        tracing::error!(op = "main", error = %detail, "failed to initialize ingest");
        return Err(err);
    }
    Ok(())
}
