//! One continuous testing session for one project
//!
//! Ties the pipeline together: change detection feeds the index, the
//! selector turns the changes into tests and the runner executes them.
//! The detector and index persist for the whole session.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::changedetect::{ChangeDetector, ChangeSet};
use crate::classfile::{ClassFileParser, ClassParser};
use crate::config::Config;
use crate::error::SelectionError;
use crate::events::RunEvent;
use crate::execution::{ProcessConnectionFactory, TestRunner};
use crate::filter::FilterChain;
use crate::graph::ClassIndex;
use crate::selector::TestSelector;

/// What one update pass found and queued
#[derive(Debug, Default)]
pub struct Update {
    pub changes: ChangeSet,
    pub tests: BTreeSet<String>,
    /// `None` when nothing was queued
    pub session_id: Option<Uuid>,
}

pub struct ContinuousSession {
    name: String,
    detector: ChangeDetector,
    selector: TestSelector,
    runner: TestRunner,
}

impl ContinuousSession {
    pub fn new(
        name: impl Into<String>,
        class_dirs: Vec<PathBuf>,
        parser: Arc<dyn ClassParser>,
        filters: Arc<FilterChain>,
        runner: TestRunner,
    ) -> Self {
        let index = Arc::new(ClassIndex::new(parser));
        Self {
            name: name.into(),
            detector: ChangeDetector::new(class_dirs.clone()),
            selector: TestSelector::new(index, filters, class_dirs),
            runner,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let class_dirs = config.class_dirs()?;
        let parser = Arc::new(ClassFileParser::new(class_dirs.clone()));
        let filters = Arc::new(FilterChain::from_file(config.filter_file()));

        let factory = ProcessConnectionFactory::new(config.worker_command()?)
            .working_dir(config.base_dir().to_path_buf())
            .env("TESTLOOP_PROJECT", config.project.name.clone())
            .reuse(config.worker.reuse)
            .shutdown_timeout(config.shutdown_timeout());
        let runner = TestRunner::new(Arc::new(factory), config.runner_options());

        debug!(dirs = ?class_dirs, "class output directories");
        Ok(Self::new(config.project.name.clone(), class_dirs, parser, filters, runner))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_dirs(&self) -> Vec<PathBuf> {
        self.detector.roots()
    }

    pub fn index(&self) -> &Arc<ClassIndex> {
        self.selector.index()
    }

    pub fn runner(&self) -> &TestRunner {
        &self.runner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.runner.subscribe()
    }

    /// Bring the index up to date without selecting anything
    pub fn index_all(&self) -> ChangeSet {
        let changes = self.detector.find_changed_files();
        if !changes.is_empty() {
            self.index().parse_and_index(&changes.all_paths());
        }
        changes
    }

    /// Detect changes and queue the tests they impact
    pub fn update(&self) -> Result<Update, SelectionError> {
        let changes = self.detector.find_changed_files();
        if changes.is_empty() {
            return Ok(Update::default());
        }
        info!(
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            "class files changed"
        );

        let tests = self.report(self.selector.find_tests_to_run(&changes.all_paths()))?;
        let session_id = self.runner.run_tests(tests.iter().cloned());
        Ok(Update {
            changes,
            tests,
            session_id,
        })
    }

    /// Index everything and queue every eligible test
    pub fn run_all(&self) -> Result<Update, SelectionError> {
        let changes = self.index_all();
        let tests = self.report(self.current_tests())?;
        let session_id = self.runner.run_tests(tests.iter().cloned());
        Ok(Update {
            changes,
            tests,
            session_id,
        })
    }

    /// Every test eligible to run right now, filters reloaded
    pub fn current_tests(&self) -> Result<BTreeSet<String>, SelectionError> {
        let filters = self.selector.filters();
        filters.update_filter_list()?;
        if filters.accepts_none() {
            return Ok(BTreeSet::new());
        }
        Ok(self.selector.get_current_tests())
    }

    /// Tests the given files would trigger, without running them
    pub fn tests_affected_by(&self, files: &[PathBuf]) -> Result<BTreeSet<String>, SelectionError> {
        self.report(self.selector.find_tests_to_run(files))
    }

    /// Forget all timestamps and classes, as after a classpath change
    pub fn clear(&self) {
        self.detector.clear();
        self.index().clear();
    }

    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }

    fn report<T>(&self, result: Result<T, SelectionError>) -> Result<T, SelectionError> {
        if let Err(ref e) = result {
            warn!(project = %self.name, "selection failed: {}", e);
            self.runner.events().diagnostic(None, e.to_string());
        }
        result
    }
}
