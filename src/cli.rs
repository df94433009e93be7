//! Command-line interface for the proxy.
//!
//! Provides argument parsing and subcommand handling for the binary.

use clap::{Parser, Subcommand};

/// Reverse-forwarding proxy with failover across Claude-compatible endpoints
#[derive(Parser)]
#[command(name = "claudefront")]
#[command(version)]
#[command(about = "Forwards Claude-compatible API traffic across a pool of upstream endpoints")]
#[command(
    long_about = "claudefront forwards client requests to a pool of Claude-compatible upstream \
    endpoints organized into priority groups, retrying and failing over across endpoints and \
    groups, suspending requests when every group is exhausted, and recording a full lifecycle \
    with token usage and cost for every request."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# claudefront Configuration
# =========================
#
# This file configures the HTTP server, upstream endpoint pool, retry/failover
# policy, suspension queue, usage tracking and observability settings.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER CONFIGURATION
# ─────────────────────────────────────────────────────────────────────────────

[server]
# IP address to bind to (0.0.0.0 for all interfaces, 127.0.0.1 for localhost only)
host = "0.0.0.0"

# Port to listen on
port = 3000

# Default per-attempt upstream forward timeout, in seconds
request_timeout_seconds = 30

# ─────────────────────────────────────────────────────────────────────────────
# RETRY / FAILOVER POLICY
# ─────────────────────────────────────────────────────────────────────────────

[retry]
# Maximum attempts against a single endpoint before switching
max_attempts = 3

# Base backoff delay in milliseconds: delay = min(max_delay, base_delay * multiplier^(n-1))
base_delay_ms = 1000
max_delay_ms = 30000
multiplier = 2.0

# ─────────────────────────────────────────────────────────────────────────────
# REQUEST SUSPENSION
# ─────────────────────────────────────────────────────────────────────────────
#
# When every group is exhausted, a request can be suspended until a group
# recovers instead of failing immediately.

[request_suspend]
enabled = true
timeout_seconds = 300
max_suspended_requests = 100

# ─────────────────────────────────────────────────────────────────────────────
# ENDPOINTS
# ─────────────────────────────────────────────────────────────────────────────
#
# Each endpoint belongs to a named group. Within a group, lower `priority`
# is tried first. Groups themselves are tried in ascending `group_priority`
# order, skipping paused or in-cooldown groups.

[[endpoints]]
name = "primary"
url = "https://api.anthropic.com"
token = "sk-ant-your-token"
priority = 1
group = "main"
group_priority = 1

# Add a failover endpoint in the same group:
# [[endpoints]]
# name = "primary-backup"
# url = "https://api.anthropic.com"
# token = "sk-ant-another-token"
# priority = 2
# group = "main"
# group_priority = 1

# Add a whole failover group, tried only once "main" is exhausted:
# [[endpoints]]
# name = "backup"
# url = "https://backup.example.com"
# token = "sk-ant-backup-token"
# priority = 1
# group = "backup"
# group_priority = 2

# ─────────────────────────────────────────────────────────────────────────────
# MODEL PRICING (USD per 1M tokens)
# ─────────────────────────────────────────────────────────────────────────────

[model_pricing."claude-3-5-haiku-20241022"]
input = 0.80
output = 4.00
cache_creation = 1.00
cache_read = 0.08

[model_pricing."claude-3-5-sonnet-20241022"]
input = 3.00
output = 15.00
cache_creation = 3.75
cache_read = 0.30

# ─────────────────────────────────────────────────────────────────────────────
# USAGE TRACKING
# ─────────────────────────────────────────────────────────────────────────────

[tracking]
enabled = true
database_path = "claudefront.db"
batch_size = 100
buffer_size = 1000
# IANA timezone used to format stored timestamps
timezone = "UTC"

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error"
log_level = "info"

# Prometheus metrics are always exposed at /metrics when enabled
metrics_enabled = true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_config_path() {
        let cli = Cli::parse_from(["claudefront"]);
        assert_eq!(cli.config, "config.toml");
        assert!(cli.command.is_none());
    }

    #[test]
    fn custom_config_path() {
        let cli = Cli::parse_from(["claudefront", "--config", "custom.toml"]);
        assert_eq!(cli.config, "custom.toml");
    }

    #[test]
    fn config_subcommand() {
        let cli = Cli::parse_from(["claudefront", "config"]);
        assert!(matches!(cli.command, Some(Command::Config { output: None })));
    }

    #[test]
    fn config_subcommand_with_output() {
        let cli = Cli::parse_from(["claudefront", "config", "-o", "my-config.toml"]);
        assert!(matches!(
            cli.command,
            Some(Command::Config { output: Some(ref path) }) if path == "my-config.toml"
        ));
    }

    #[test]
    fn template_is_valid_toml() {
        let template = generate_config_template();
        let result: Result<toml::Value, _> = toml::from_str(template);
        assert!(result.is_ok(), "Template should be valid TOML: {:?}", result.err());
    }

    #[test]
    fn template_has_all_sections() {
        let template = generate_config_template();
        for section in [
            "[server]",
            "[retry]",
            "[request_suspend]",
            "[[endpoints]]",
            "[tracking]",
            "[observability]",
        ] {
            assert!(template.contains(section), "missing section {section}");
        }
    }

    #[test]
    fn template_parses_as_valid_config() {
        let template = generate_config_template();
        let config: crate::config::Config = toml::from_str(template).unwrap();
        assert!(config.validate().is_ok());
    }
}
