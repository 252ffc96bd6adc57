//! DTC bridge - main entry point
//!
//! Subcommands:
//! - run: Connect to the gateway and maintain trading state
//! - trades: List closed trades from the store
//! - positions: List open positions from the store
//! - balance: Show derived per-scope balances

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "dtc-bridge")]
#[command(about = "DTC trading gateway bridge with durable position and balance state", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the gateway and run the bridge
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/bridge.json")]
        config: String,

        /// State database path (overrides config)
        #[arg(long)]
        state_db: Option<String>,
    },

    /// List closed trades
    Trades {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/bridge.json")]
        config: String,

        /// Only show trades for this account
        #[arg(short, long)]
        account: Option<String>,
    },

    /// List open positions
    Positions {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/bridge.json")]
        config: String,
    },

    /// Show per-scope balances
    Balance {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/bridge.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, with_console: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if with_console {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    } else {
        // Reporting commands keep stdout clean for their tables
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, with_console) = match &cli.command {
        Commands::Run { .. } => ("run", true),
        Commands::Trades { .. } => ("trades", false),
        Commands::Positions { .. } => ("positions", false),
        Commands::Balance { .. } => ("balance", false),
    };

    setup_logging(cli.verbose, command_name, with_console)?;

    match cli.command {
        Commands::Run { config, state_db } => commands::run::run(config, state_db),
        Commands::Trades { config, account } => commands::report::trades(config, account),
        Commands::Positions { config } => commands::report::positions(config),
        Commands::Balance { config } => commands::report::balance(config),
    }
}
