use crate::{AppManError, Result};
use crate::cli::{open_orchestrator, print_report};
use crate::core::config::AppManConfig;
use crate::core::orchestrator::{RunReport, Selection};
use colored::Colorize;

pub async fn execute(config: &AppManConfig, programs: Vec<String>) -> Result<RunReport> {
    let selection = selection(programs)?;
    let mut orchestrator = open_orchestrator(config).await?;

    match &selection {
        Selection::All => println!("{} Updating all installed programs...", "⚡".bright_yellow()),
        Selection::Names(names) => {
            println!("{} Updating {}...", "⚡".bright_yellow(), names.join(", ").cyan())
        }
    }
    let report = orchestrator.update(selection).await;
    print_report(&report);

    Ok(report)
}

/// `all` stands for every installed program and must come alone
fn selection(programs: Vec<String>) -> Result<Selection> {
    let has_all = programs.iter().any(|p| p.eq_ignore_ascii_case("all"));
    match (has_all, programs.len()) {
        (true, 1) => Ok(Selection::All),
        (true, _) => Err(AppManError::Config(
            "\"all\" cannot be combined with program names".to_string(),
        )),
        (false, _) => Ok(Selection::Names(programs)),
    }
}
