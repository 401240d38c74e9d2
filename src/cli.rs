//! Command-line interface definition for the ingestion service
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the pipeline, inspect the topic working set,
//! and check the resolved configuration.

use clap::{Parser, Subcommand};

/// IoT ingestion - Kafka telemetry enrichment pipeline
///
/// Consumes raw device telemetry from every tenant topic, resolves the
/// device and writes raw-data, location and last-contact records.
#[derive(Parser, Debug, Clone)]
#[command(name = "iot-ingestion")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the landscape name
    #[arg(long, global = true)]
    pub landscape: Option<String>,

    /// Override the tenant name
    #[arg(long, global = true)]
    pub tenant: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Consume every matched topic until SIGINT or SIGTERM
    Run {
        /// Abandon in-flight writes on shutdown instead of waiting for them
        #[arg(long)]
        no_drain: bool,
    },

    /// List the topics this landscape and tenant would consume
    Topics,

    /// Validate and print the resolved configuration
    CheckConfig,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            landscape: None,
            tenant: None,
            command: Commands::Run { no_drain: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/config.yaml".to_string()));
        assert!(!cli.verbose);
        assert_eq!(cli.command, Commands::Run { no_drain: false });
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["iot-ingestion", "run"]).unwrap();
        assert_eq!(cli.command, Commands::Run { no_drain: false });
        assert_eq!(cli.config.as_deref(), Some("config/config.yaml"));
    }

    #[test]
    fn test_cli_parse_run_no_drain() {
        let cli = Cli::try_parse_from(["iot-ingestion", "run", "--no-drain"]).unwrap();
        assert_eq!(cli.command, Commands::Run { no_drain: true });
    }

    #[test]
    fn test_cli_parse_topics_with_overrides() {
        let cli = Cli::try_parse_from([
            "iot-ingestion",
            "--config",
            "custom.yaml",
            "topics",
            "--landscape",
            "prod",
            "--tenant",
            "globex",
        ])
        .unwrap();
        assert_eq!(cli.command, Commands::Topics);
        assert_eq!(cli.config.as_deref(), Some("custom.yaml"));
        assert_eq!(cli.landscape.as_deref(), Some("prod"));
        assert_eq!(cli.tenant.as_deref(), Some("globex"));
    }

    #[test]
    fn test_cli_parse_check_config_verbose() {
        let cli = Cli::try_parse_from(["iot-ingestion", "-v", "check-config"]).unwrap();
        assert_eq!(cli.command, Commands::CheckConfig);
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["iot-ingestion"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["iot-ingestion", "chat"]).is_err());
    }
}
