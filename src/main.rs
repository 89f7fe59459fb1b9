//! Options relay - turns short text commands into broker orders
//!
//! # WARNING
//! - Orders placed through a live brokerage adapter trade real money.
//! - The bundled broker is a paper broker; nothing leaves the process.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use options_relay::cli::commands;
use options_relay::config::Config;

/// Options relay - text commands in, orders out
#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml", env = "RELAY_CONFIG")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay `sender: command` lines from stdin against the paper broker
    Run,

    /// Parse a command and print the result
    Parse {
        /// Command text, e.g. "BUY NIFTY 24000 CE 2"
        text: String,
    },

    /// Run a trade command through the risk gate without placing it
    Check {
        /// Command text, e.g. "BUY NIFTY 24000 CE 2"
        text: String,
    },

    /// Show persisted positions
    Status,

    /// Show current configuration (secrets masked)
    Config,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("options_relay=info".parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing(cli.json_logs)?;

    // Parsing needs no configuration
    if let Commands::Parse { text } = &cli.command {
        return commands::parse_command(text);
    }

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run => commands::run(&config).await,
        Commands::Parse { .. } => Ok(()),
        Commands::Check { text } => commands::check(&config, &text),
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
