use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the cachekeeper binary.
#[derive(Debug, Parser)]
#[command(name = "cachekeeper", version, about = "Cache consistency and warming service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CACHEKEEPER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache engine and its HTTP endpoints.
    Serve(Box<ServeArgs>),
    /// Validate configuration and invalidation rules, then exit.
    Check(CheckArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckArgs {
    /// Print the resolved rule set as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub print_rules: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the per-call store timeout.
    #[arg(long = "cache-store-timeout-ms", value_name = "MILLIS")]
    pub store_timeout_ms: Option<u64>,

    /// Override the TTL jitter percentage (0-50).
    #[arg(long = "cache-jitter-percent", value_name = "PERCENT")]
    pub jitter_percent: Option<u8>,

    /// Toggle cache warming.
    #[arg(
        long = "warming-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub warming_enabled: Option<bool>,

    /// Override the CDN purge endpoint.
    #[arg(long = "edge-purge-endpoint", value_name = "URL")]
    pub edge_purge_endpoint: Option<String>,
}
