//! File watcher for continuous test runs
//!
//! Watches the class output directories and, once the build has settled,
//! re-runs the tests impacted by the changed classes.

use anyhow::{Context, Result};
use colored::Colorize;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{RunEvent, RunSummary};
use crate::session::{ContinuousSession, Update};

const CLASS_EXTENSION: &str = "class";

/// Continuous test watcher
pub struct TestWatcher {
    session: Arc<ContinuousSession>,
    debounce: Duration,
}

impl TestWatcher {
    pub fn new(session: Arc<ContinuousSession>, debounce: Duration) -> Self {
        Self { session, debounce }
    }

    pub async fn start(&self) -> Result<()> {
        let printer = tokio::spawn(print_events(self.session.subscribe()));

        println!("{} Indexing classes...", "🔍".cyan());
        let first = self.run_blocking(|session| session.run_all()).await?;
        println!(
            "{} Indexed {} classes, {} tests eligible",
            "✓".green(),
            self.session.index().size(),
            first.tests.len()
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        for dir in self.session.class_dirs() {
            if dir.is_dir() {
                watcher
                    .watch(&dir, RecursiveMode::Recursive)
                    .with_context(|| format!("Failed to watch {}", dir.display()))?;
            } else {
                warn!(dir = %dir.display(), "class directory does not exist, not watching it");
            }
        }

        println!(
            "\n{} {} {}\n",
            "👀".cyan(),
            "Watching classes of".bold(),
            self.session.name()
        );
        println!("{}", "Press Ctrl+C to stop\n".dimmed());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if !is_class_change(&event) {
                        continue;
                    }
                    debug!(files = ?changed_classes(&event), "class files touched");
                    self.settle(&mut rx).await;

                    match self.run_blocking(|session| session.update()).await {
                        Ok(update) => report_update(&update),
                        Err(e) => println!("{} {}", "✗".red(), e),
                    }
                }
            }
        }

        println!("\n{} Stopping...", "■".yellow());
        drop(watcher);
        self.session.shutdown().await;
        printer.abort();
        Ok(())
    }

    /// Swallow events until the file system has been quiet for the
    /// debounce interval
    async fn settle(&self, rx: &mut mpsc::UnboundedReceiver<Event>) {
        while let Ok(Some(_)) = tokio::time::timeout(self.debounce, rx.recv()).await {}
    }

    async fn run_blocking<F>(&self, f: F) -> Result<Update>
    where
        F: FnOnce(&ContinuousSession) -> Result<Update, crate::error::SelectionError> + Send + 'static,
    {
        let session = self.session.clone();
        let update = tokio::task::spawn_blocking(move || f(&session))
            .await
            .context("Indexing task failed")??;
        Ok(update)
    }
}

fn is_class_change(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event
            .paths
            .iter()
            .any(|p| p.extension().is_some_and(|ext| ext == CLASS_EXTENSION) || p.is_dir())
}

fn report_update(update: &Update) {
    if update.changes.is_empty() {
        debug!("no class file changes after settling");
        return;
    }

    println!(
        "\n{} {} {} changed, {} removed",
        "↻".yellow(),
        "Classes:".bold(),
        update.changes.changed.len(),
        update.changes.removed.len()
    );
    if update.tests.is_empty() {
        println!("{}", "No affected tests to run".dimmed());
    } else {
        println!("{} Running {} affected test(s)...\n", "→".blue(), update.tests.len());
    }
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<RunEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                print_event(&event);
                if matches!(event, RunEvent::BatchComplete { .. }) {
                    println!("\n{}", "Watching for changes...".dimmed());
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Print one run event the way the CLI shows progress
pub fn print_event(event: &RunEvent) {
    match event {
        RunEvent::TestStarted { test_name, .. } => {
            debug!(test = %test_name, "started");
        }
        RunEvent::TestFinished(result) => {
            let symbol = result.outcome.symbol();
            let symbol = match result.outcome {
                crate::events::Outcome::Pass => symbol.green(),
                crate::events::Outcome::NotRun => symbol.dimmed(),
                _ => symbol.red(),
            };
            let duration = result
                .duration_ms
                .map(|ms| format!(" ({} ms)", ms))
                .unwrap_or_default();
            println!("  {} {}{}", symbol, result.test_name, duration.dimmed());

            if let Some(ref diagnostic) = result.diagnostic {
                if !result.outcome.is_pass() {
                    println!("      {}", diagnostic.message.red());
                    if let Some(ref stack) = diagnostic.stack {
                        for line in stack.lines().take(8) {
                            println!("      {}", line.dimmed());
                        }
                    }
                }
            }
        }
        RunEvent::BatchComplete { summary, .. } => print_summary(summary),
        RunEvent::Diagnostic { message, .. } => {
            println!("{} {}", "⚠".yellow(), message.yellow());
        }
    }
}

pub fn print_summary(summary: &RunSummary) {
    let duration = summary
        .duration_ms()
        .map(|ms| format!(" in {} ms", ms))
        .unwrap_or_default();

    println!();
    if summary.all_passed() {
        println!(
            "{} {} test(s) passed{}",
            "✓".green(),
            summary.passed.to_string().green(),
            duration
        );
    } else {
        println!(
            "{} {} passed, {} failed, {} errors, {} crashed, {} not run{}",
            "✗".red(),
            summary.passed.to_string().green(),
            summary.failed.to_string().red(),
            summary.errors.to_string().red(),
            summary.crashed.to_string().red(),
            summary.not_run,
            duration
        );
    }
}

/// Class files a batch of events touched, for logging
pub fn changed_classes(event: &Event) -> Vec<&Path> {
    event
        .paths
        .iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == CLASS_EXTENSION))
        .map(|p| p.as_path())
        .collect()
}
