//! Taskpilot CLI - run a goal against configured tool providers
//!
//! Plans come from a JSON file and reflection is rule-based, so the binary
//! works without a language model attached.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use taskpilot_core::config::ConfigManager;
use taskpilot_core::{
    AgentContext, HeuristicReflector, Orchestrator, ProviderReport, ProviderStatus, StaticPlanner,
    TaskEvent, TaskStatus,
};

#[derive(Parser)]
#[command(name = "taskpilot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Plan, run and reflect on goals using tool providers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a goal with a plan read from a JSON file
    Run {
        /// Natural-language goal
        goal: String,

        /// Plan file: `{"subtasks": [...]}`
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Start providers and show the tools they register
    Tools,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;

    // RUST_LOG wins over --verbose and the configured level
    let default_filter = if cli.verbose {
        "info,taskpilot_core=debug"
    } else {
        manager.config().general.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { goal, plan } => run_goal(manager, &goal, &plan, cli.verbose).await,
        Commands::Tools => show_tools(manager).await,
        Commands::Config => show_config(&manager),
    }
}

fn build_context(manager: ConfigManager, plan: Option<&Path>) -> anyhow::Result<AgentContext> {
    let planner = match plan {
        Some(path) => StaticPlanner::from_file(path)?,
        None => StaticPlanner::new(Default::default()),
    };

    Ok(AgentContext::builder(manager.config().clone())
        .planner(Arc::new(planner))
        .reflector(Arc::new(HeuristicReflector))
        .build()?)
}

async fn run_goal(
    manager: ConfigManager,
    goal: &str,
    plan: &Path,
    verbose: bool,
) -> anyhow::Result<()> {
    let context = Arc::new(build_context(manager, Some(plan))?);
    let reports = context.start_providers().await;
    print_degraded(&reports);

    let (tx, rx) = mpsc::channel(64);
    let orchestrator = Orchestrator::new(Arc::clone(&context)).with_events(tx);
    let progress = tokio::spawn(print_progress(rx, verbose));

    let handle = orchestrator.spawn_task(goal);
    let task_id = handle.id.clone();
    tracing::info!(task_id = %task_id, plan = %plan.display(), "Running goal");
    let join = handle.join();
    tokio::pin!(join);

    let result = tokio::select! {
        result = &mut join => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", style("Interrupted, cancelling task...").yellow());
            // The task may have just finished; the join below reports either way
            let _ = orchestrator.cancel_task(&task_id);
            join.await?
        }
    };

    drop(orchestrator);
    let _ = progress.await;
    context.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.status != TaskStatus::Succeeded {
        anyhow::bail!("task {}: {}", status_label(result.status), result.rationale);
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<TaskEvent>, verbose: bool) {
    while let Some(event) = rx.recv().await {
        match event {
            TaskEvent::SubtaskStarted {
                subtask_id, run, ..
            } => {
                eprintln!("{} {} (run {})", style("▶").cyan(), subtask_id, run);
            }
            TaskEvent::SubtaskFinished {
                subtask_id,
                success,
                ..
            } => {
                let mark = if success {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                eprintln!("{} {}", mark, subtask_id);
            }
            TaskEvent::Reflected {
                subtask_id,
                verdict,
                rationale,
                ..
            } if verbose => {
                eprintln!(
                    "  {} {}: {:?} - {}",
                    style("reflect").dim(),
                    subtask_id,
                    verdict,
                    rationale
                );
            }
            TaskEvent::Replanned {
                round, subtasks, ..
            } => {
                eprintln!(
                    "{} round {} with {} subtasks",
                    style("Replanned").yellow(),
                    round,
                    subtasks
                );
            }
            TaskEvent::PhaseChanged { phase, .. } if verbose => {
                eprintln!("  {} {:?}", style("phase").dim(), phase);
            }
            _ => {}
        }
    }
}

fn print_degraded(reports: &[ProviderReport]) {
    for report in reports.iter().filter(|r| r.is_degraded()) {
        let reason = report
            .error
            .clone()
            .unwrap_or_else(|| format!("missing tools: {}", report.missing_tools.join(", ")));
        let fallback = report
            .fallback
            .map(|f| format!(" (falling back to {:?})", f).to_lowercase())
            .unwrap_or_default();
        eprintln!(
            "{} provider '{}' degraded: {}{}",
            style("Warning:").yellow(),
            report.name,
            reason,
            fallback
        );
    }
}

async fn show_tools(manager: ConfigManager) -> anyhow::Result<()> {
    let context = build_context(manager, None)?;
    let reports = context.start_providers().await;

    println!("{}", style("Providers:").bold());
    println!();
    if reports.is_empty() {
        println!("  {}", style("none configured").dim());
    }
    for report in &reports {
        let status = match &report.status {
            ProviderStatus::Running => style("running".to_string()).green(),
            ProviderStatus::Failed(e) => style(format!("failed: {}", e)).red(),
            other => style(format!("{:?}", other).to_lowercase()).dim(),
        };
        println!("  {:<20} {}", style(&report.name).cyan(), status);
        if !report.missing_tools.is_empty() {
            println!(
                "  {:<20} missing: {}",
                "",
                style(report.missing_tools.join(", ")).yellow()
            );
        }
    }

    println!();
    println!("{}", style("Tools:").bold());
    println!();
    for tool in context.registry.snapshot() {
        println!(
            "  {:<24} {:<16} {}",
            style(&tool.name).cyan(),
            tool.backend.to_string(),
            tool.description
        );
    }

    context.shutdown().await;
    Ok(())
}

fn show_config(manager: &ConfigManager) -> anyhow::Result<()> {
    println!("{}", style("Configuration:").bold());
    println!();
    let source = if manager.config_path().exists() {
        style(manager.config_path().display().to_string()).green()
    } else {
        style(format!("{} (not found, using defaults)", manager.config_path().display())).dim()
    };
    println!("  Config file: {}", source);
    println!();
    print!("{}", toml::to_string_pretty(manager.config())?);
    Ok(())
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        _ => "did not finish",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "taskpilot",
            "--verbose",
            "run",
            "read file README.md",
            "--plan",
            "plan.json",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { goal, plan } => {
                assert_eq!(goal, "read file README.md");
                assert_eq!(plan, PathBuf::from("plan.json"));
            }
            _ => panic!("expected run"),
        }
    }
}
