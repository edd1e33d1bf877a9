// crates/keygate-server/src/main.rs
// Keygate - credential and tool gateway for AI agents

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands, ConfigAction};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.keygate/.env only (never from CWD — a hostile working
    // directory could override upstream credentials)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".keygate/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Some(Commands::Config { .. }) => Level::WARN,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None | Some(Commands::Serve) => {
            cli::run_serve(cli.config).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => cli::run_config_show(cli.config)?,
        },
    }

    Ok(())
}
