// crates/keygate-server/src/cli.rs
// CLI argument definitions and command entry points

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use keygate::config::GatewayConfig;

#[derive(Parser)]
#[command(name = "keygate", version, about = "Credential and tool gateway for AI agents")]
pub struct Cli {
    /// Path to the config file (default: ~/.keygate/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway (default)
    Serve,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
}

/// Start the gateway and serve until interrupted.
pub async fn run_serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = GatewayConfig::load(config_path.as_deref());
    keygate::server::run(config).await
}

/// Print the effective configuration with credential fields redacted.
pub fn run_config_show(config_path: Option<PathBuf>) -> Result<()> {
    let config = GatewayConfig::load(config_path.as_deref());
    println!("{}", config.redacted_toml()?);
    Ok(())
}
