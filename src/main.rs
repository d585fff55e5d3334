use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use testloop::config::{Config, CONFIG_FILE};
use testloop::watcher::{print_event, TestWatcher};
use testloop::{logging, ContinuousSession, RunEvent, RunSummary};

#[derive(Parser)]
#[command(name = "testloop")]
#[command(about = "Continuous test runner for JVM projects")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: testloop.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run impacted tests on every change until Ctrl+C
    Watch,

    /// Run every eligible test once
    Run,

    /// List eligible test classes
    List,

    /// Show which tests the given class files would trigger
    Affected {
        /// Compiled class files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let config_path = std::fs::canonicalize(&config_path)
        .with_context(|| format!("Could not find config file: {}", config_path.display()))?;

    let config = Config::load(&config_path)
        .with_context(|| format!("Could not load {}", config_path.display()))?;
    let session = Arc::new(ContinuousSession::from_config(&config)?);

    match cli.command {
        Commands::Watch => TestWatcher::new(session, config.debounce()).start().await,
        Commands::Run => cmd_run(&session).await,
        Commands::List => cmd_list(&session).await,
        Commands::Affected { files } => cmd_affected(&session, files).await,
    }
}

async fn cmd_run(session: &Arc<ContinuousSession>) -> Result<()> {
    let mut rx = session.subscribe();

    println!("{} Indexing {}...", "🔍".cyan(), session.name().bold());
    let scan = session.clone();
    let update = tokio::task::spawn_blocking(move || scan.run_all())
        .await
        .context("Indexing task failed")??;

    let Some(session_id) = update.session_id else {
        println!("{}", "No tests to run".dimmed());
        return Ok(());
    };
    println!("{} Running {} test(s)...\n", "→".blue(), update.tests.len());

    let summary: RunSummary = loop {
        match rx.recv().await {
            Ok(RunEvent::BatchComplete { session_id: done, summary }) if done == session_id => break summary,
            Ok(event) => print_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("{} {} events dropped", "⚠".yellow(), skipped);
            }
            Err(RecvError::Closed) => anyhow::bail!("Event stream closed before the run finished"),
        }
    };

    session.shutdown().await;
    testloop::watcher::print_summary(&summary);

    if !summary.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_list(session: &Arc<ContinuousSession>) -> Result<()> {
    let scan = session.clone();
    let tests = tokio::task::spawn_blocking(move || {
        scan.index_all();
        scan.current_tests()
    })
    .await
    .context("Indexing task failed")??;

    println!("\n{} {}\n", "📦".cyan(), session.name().bold());
    if tests.is_empty() {
        println!("  {}", "No tests found".dimmed());
        return Ok(());
    }

    println!("{}", "Tests:".bold());
    for test in &tests {
        println!("  {} {}", "•".green(), test.cyan());
    }
    println!("\n{} {} test(s), {} classes indexed", "✓".green(), tests.len(), session.index().size());
    Ok(())
}

async fn cmd_affected(session: &Arc<ContinuousSession>, files: Vec<PathBuf>) -> Result<()> {
    let cwd = std::env::current_dir().context("Could not read current directory")?;
    let files: Vec<PathBuf> = files
        .into_iter()
        .map(|f| if f.is_absolute() { f } else { cwd.join(f) })
        .collect();

    let scan = session.clone();
    let tests = tokio::task::spawn_blocking(move || {
        scan.index_all();
        scan.tests_affected_by(&files)
    })
    .await
    .context("Indexing task failed")??;

    if tests.is_empty() {
        println!("{}", "No affected tests".dimmed());
        return Ok(());
    }

    println!("{} {} affected test(s):", "→".blue(), tests.len());
    for test in &tests {
        println!("  {} {}", "•".green(), test);
    }
    Ok(())
}
