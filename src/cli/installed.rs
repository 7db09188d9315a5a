use crate::Result;
use crate::cli::{load_database, load_registry};
use crate::core::config::AppManConfig;
use crate::utils::fs::dir_size;
use colored::Colorize;

pub async fn execute(config: &AppManConfig) -> Result<()> {
    let database = load_database(config).await?;

    let installed: Vec<_> = database.installed().collect();
    if installed.is_empty() {
        println!("No programs installed.");
        return Ok(());
    }

    // A missing profile only matters for later updates
    let registry = load_registry(config).await.ok();

    println!("Installed programs:");
    println!("{}", "─".repeat(50));
    for (name, program) in &installed {
        let size = dir_size(&program.path);
        println!(
            "{} {} {} {}",
            name.cyan(),
            format!("v{}", program.version).green(),
            program.path.display(),
            format!("({:.1} MB)", size as f64 / 1_048_576.0).dimmed()
        );
        if registry.as_ref().is_some_and(|r| !r.contains(name)) {
            println!("    {} profile not found, updates unavailable", "⚠".yellow());
        }
    }

    println!("{}", "─".repeat(50));
    println!("Total: {} programs", installed.len().to_string().bold());

    Ok(())
}
