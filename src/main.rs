//! IoT ingestion - Kafka telemetry enrichment pipeline
//!
//! Main entry point for the ingestion service.

use anyhow::Result;

use iot_ingestion::cli::{Cli, Commands};
use iot_ingestion::commands;
use iot_ingestion::config::Config;
use iot_ingestion::logging::{init_logging, with_bootstrap_logging};
use iot_ingestion::metrics::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration; its warnings go to STDERR until logging is set up
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = with_bootstrap_logging(|| Config::load(config_path, &cli))?;

    // Initialize tracing from the resolved logging settings
    init_logging(&config.logging)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Run { no_drain } => {
            init_metrics_exporter();
            let drain = config.shutdown.drain && !no_drain;
            tracing::info!(
                landscape = %config.landscape,
                tenant = %config.tenant,
                drain,
                "Starting ingestion"
            );
            commands::run::run_ingestion(config, drain).await
        }
        Commands::Topics => commands::topics::list_topics(config).await,
        Commands::CheckConfig => commands::check_config::check_config(&config),
    }
}
