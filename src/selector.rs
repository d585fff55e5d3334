//! Test selection
//!
//! Turns a batch of changed class files into the set of test classes to
//! run: the classes behind the files, everything that transitively depends
//! on them, narrowed to tests the filter rules let through and that belong
//! to this project's class output directories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::SelectionError;
use crate::filter::FilterChain;
use crate::graph::ClassIndex;
use crate::java_class::{ClassSet, JavaClass};

pub struct TestSelector {
    index: Arc<ClassIndex>,
    filters: Arc<FilterChain>,
    class_dirs: Vec<PathBuf>,
}

impl TestSelector {
    pub fn new(index: Arc<ClassIndex>, filters: Arc<FilterChain>, class_dirs: Vec<PathBuf>) -> Self {
        Self {
            index,
            filters,
            class_dirs,
        }
    }

    pub fn index(&self) -> &Arc<ClassIndex> {
        &self.index
    }

    pub fn filters(&self) -> &Arc<FilterChain> {
        &self.filters
    }

    pub fn set_class_dirs(&mut self, class_dirs: Vec<PathBuf>) {
        self.class_dirs = class_dirs;
    }

    /// Qualified names of the tests impacted by the changed files
    pub fn find_tests_to_run(&self, changed_files: &[PathBuf]) -> Result<BTreeSet<String>, SelectionError> {
        self.filters.update_filter_list()?;
        if self.filters.accepts_none() {
            debug!("filters accept no class, skipping selection");
            return Ok(BTreeSet::new());
        }

        let mut changed = self.index.find_classes(changed_files);
        let impacted = self.index.find_changed_parents(&changed);
        debug!(
            changed = changed.len(),
            impacted = impacted.len(),
            "total changeset"
        );
        changed.extend(impacted);

        let tests = self.eligible(&changed);
        info!(tests = tests.len(), "selected tests to run");
        Ok(tests)
    }

    /// Every eligible test in the index, for "run everything"
    pub fn get_current_tests(&self) -> BTreeSet<String> {
        self.eligible(&self.index.get_indexed_classes())
    }

    fn eligible(&self, classes: &ClassSet) -> BTreeSet<String> {
        classes
            .values()
            .filter(|class| {
                let keep = self.should_run(class);
                if !keep {
                    trace!(class = class.name(), "filtered");
                }
                keep
            })
            .map(|class| class.name().to_string())
            .collect()
    }

    fn should_run(&self, class: &JavaClass) -> bool {
        class.is_test()
            && !class.is_unparsable()
            && !self.filters.matches(class)
            && self.in_current_project(class)
    }

    fn in_current_project(&self, class: &JavaClass) -> bool {
        class
            .source_file()
            .is_some_and(|file| self.class_dirs.iter().any(|dir| is_under(file, dir)))
    }
}

fn is_under(file: &Path, dir: &Path) -> bool {
    file.starts_with(dir)
}
