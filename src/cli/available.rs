use crate::Result;
use crate::cli::{load_database, load_registry};
use crate::core::config::AppManConfig;
use colored::Colorize;

pub async fn execute(config: &AppManConfig) -> Result<()> {
    let registry = load_registry(config).await?;
    let database = load_database(config).await?;

    if registry.is_empty() {
        println!("No profiles available.");
        println!("Add profile manifests to {}", config.profiles_dir()?.display());
        return Ok(());
    }

    println!("Profiles available:");
    println!("{}", "─".repeat(50));
    for name in registry.names() {
        match database.installed_version(&name) {
            Some(version) => println!(
                "{} {}",
                name.cyan(),
                format!("(installed v{})", version).green()
            ),
            None => println!("{}", name.cyan()),
        }
    }

    println!();
    if registry.groups().is_empty() {
        println!("No groups available");
    } else {
        println!("Groups available:");
        println!("{}", "─".repeat(50));
        for (group, members) in registry.groups() {
            println!("{} -> {}", group.magenta(), members.join(", "));
        }
    }

    Ok(())
}
