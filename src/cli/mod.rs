//! Command implementations behind the `appman` binary

pub mod available;
pub mod install;
pub mod installed;
pub mod remove;
pub mod update;

use crate::{AppManError, Result};
use crate::core::config::{AppManConfig, PathStoreKind};
use crate::core::database::ProgramDatabase;
use crate::core::orchestrator::{Orchestrator, Outcome, RunReport};
use crate::core::path_env::{CommandNotifier, EnvNotifier, FileStore, NoopNotifier, PathEnvironment, PathStore, RegistryStore};
use crate::core::registry::ProfileRegistry;
use crate::net::client::WebClient;
use crate::profiles;
use colored::Colorize;

pub async fn load_registry(config: &AppManConfig) -> Result<ProfileRegistry> {
    profiles::build_registry(&config.profiles_dir()?, &config.groups).await
}

pub async fn load_database(config: &AppManConfig) -> Result<ProgramDatabase> {
    ProgramDatabase::load(&config.database_path()?).await
}

pub fn open_path_env(config: &AppManConfig) -> Result<PathEnvironment> {
    let store: Box<dyn PathStore> = match config.path.store {
        PathStoreKind::Registry => Box::new(RegistryStore::new()),
        PathStoreKind::File => Box::new(FileStore::new(config.path_file()?)),
    };
    let notifier: Box<dyn EnvNotifier> = match CommandNotifier::from_command_line(&config.path.refresh_command) {
        Some(notifier) => Box::new(notifier),
        None => Box::new(NoopNotifier),
    };
    PathEnvironment::load(store, notifier)
}

/// Wire every component described by `config` into an orchestrator
pub async fn open_orchestrator(config: &AppManConfig) -> Result<Orchestrator> {
    let registry = load_registry(config).await?;
    let database = load_database(config).await?;
    let path_env = open_path_env(config)?;
    let client = WebClient::new(&config.network)?;

    let temp_root = config.temp_dir();
    tokio::fs::create_dir_all(&temp_root)
        .await
        .map_err(|e| AppManError::fs(&temp_root, e))?;

    Ok(Orchestrator::new(registry, database, path_env, client, config.network.chunk_size)
        .architecture(config.architecture())
        .temp_root(temp_root)
        .keep_failed_temp(config.keep_failed_temp))
}

/// One colored line per profile, then a summary
pub fn print_report(report: &RunReport) {
    if report.profiles.is_empty() {
        println!("Nothing to {}.", report.mode);
        return;
    }

    for profile in &report.profiles {
        let (mark, text) = match &profile.outcome {
            Outcome::Installed(_) | Outcome::Updated { .. } | Outcome::Removed => {
                ("✓".green(), profile.outcome.to_string().green())
            }
            Outcome::UpToDate(_) => ("=".blue(), profile.outcome.to_string().normal()),
            Outcome::Skipped(_) => ("-".yellow(), profile.outcome.to_string().yellow()),
            Outcome::Failed(_) => ("✗".red().bold(), profile.outcome.to_string().red()),
        };
        println!(
            "{} {} {} {}",
            mark,
            profile.name.cyan(),
            text,
            format!("({:.2}s)", profile.elapsed.as_secs_f64()).dimmed()
        );
        for warning in &profile.warnings {
            println!("    {} {}", "⚠".yellow(), warning.yellow());
        }
    }

    println!("{}", "─".repeat(50));
    println!(
        "{} succeeded, {} skipped, {} failed in {:.2}s",
        report.succeeded().to_string().green(),
        report.skipped().to_string().yellow(),
        report.failed().to_string().red(),
        report.elapsed.as_secs_f64()
    );
}
