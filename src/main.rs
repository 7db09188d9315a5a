use anyhow::Context;
use appman::AppManConfig;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "appman")]
#[command(about = "Install, update and remove portable Windows programs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print debug logs
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file (default: <config dir>/appman/appman.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install programs or groups, dependencies first
    Install {
        #[arg(required = true)]
        programs: Vec<String>,
    },

    /// Update installed programs ("all" for every one of them)
    Update {
        #[arg(required = true)]
        programs: Vec<String>,
    },

    /// Remove installed programs
    Remove {
        #[arg(required = true)]
        programs: Vec<String>,
    },

    /// List available profiles and groups
    Available,

    /// List installed programs
    Installed,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let start = Instant::now();

    match run(cli).await {
        Ok(true) => {
            println!(
                "\n{} Completed in {:.2}s",
                "✓".green().bold(),
                start.elapsed().as_secs_f64()
            );
        }
        Ok(false) => {
            eprintln!("\n{} Completed with failures", "✗".red().bold());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every profile succeeded
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = AppManConfig::load_or_default(cli.config.as_deref())
        .await
        .context("Cannot load configuration")?;

    let report = match cli.command {
        Commands::Install { programs } => appman::cli::install::execute(&config, programs).await?,
        Commands::Update { programs } => appman::cli::update::execute(&config, programs).await?,
        Commands::Remove { programs } => appman::cli::remove::execute(&config, programs).await?,
        Commands::Available => {
            appman::cli::available::execute(&config).await?;
            return Ok(true);
        }
        Commands::Installed => {
            appman::cli::installed::execute(&config).await?;
            return Ok(true);
        }
    };

    Ok(!report.has_failures())
}
