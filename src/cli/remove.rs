use crate::Result;
use crate::cli::{open_orchestrator, print_report};
use crate::core::config::AppManConfig;
use crate::core::orchestrator::{RunReport, Selection};
use colored::Colorize;

pub async fn execute(config: &AppManConfig, programs: Vec<String>) -> Result<RunReport> {
    let mut orchestrator = open_orchestrator(config).await?;

    println!("{} Removing {}...", "🗑".bright_red(), programs.join(", ").cyan());
    let report = orchestrator.remove(Selection::Names(programs)).await;
    print_report(&report);

    Ok(report)
}
