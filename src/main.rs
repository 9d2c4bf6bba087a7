//! Gateway CLI entry point.
//!
//! `run` drives a configured gateway until Ctrl+C; `list-drivers` and
//! `example` help bootstrap a configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datagw::core::error::Result;
use datagw::core::metadata::get_driver_registry;
use datagw::gateway::{Gateway, GatewayConfig};

/// Industrial data gateway with durable store-and-forward caching.
#[derive(Parser, Debug)]
#[command(name = "datagw", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway from a configuration file
    Run {
        /// Configuration file path
        config: PathBuf,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available south and north drivers
    ListDrivers,

    /// Print an example configuration
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, verbose } => run(config, verbose).await,
        Commands::ListDrivers => {
            list_drivers();
            Ok(())
        }
        Commands::Example => {
            println!("{}", GatewayConfig::example_toml());
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf, verbose: bool) -> Result<()> {
    let default_filter = if verbose { "info,datagw=debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !config_path.exists() {
        eprintln!("Error: config file not found: {}", config_path.display());
        std::process::exit(1);
    }

    let config = GatewayConfig::load(&config_path).await?;
    let gateway = Gateway::from_config(config)?;

    gateway.start().await?;
    eprintln!("Gateway started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");

    gateway.stop().await;
    Ok(())
}

fn list_drivers() {
    let registry = get_driver_registry();

    println!("South drivers (sources):");
    for driver in registry.south_drivers() {
        let history = if driver.supports_history {
            " [history]"
        } else {
            ""
        };
        println!("  {} - {}{}", driver.name, driver.display_name, history);
        println!("    {}", driver.description);
    }
    println!();

    println!("North drivers (destinations):");
    for driver in registry.north_drivers() {
        println!("  {} - {}", driver.name, driver.display_name);
        println!("    {}", driver.description);
    }
    println!();

    println!("Generate a starting configuration:");
    println!("  datagw example > config.toml");
}
