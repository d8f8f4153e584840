use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "airgradient-ingest",
    version,
    about = "Receives AirGradient pushes over HTTP and writes them to InfluxDB"
)]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}
