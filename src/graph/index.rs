//! Class index
//!
//! Owns the dependency graph for one project and keeps it in step with the
//! class files on disk. All graph mutation for a batch of changed files
//! happens inside one write-lock section, so a concurrent reverse
//! reachability query sees either the old or the new state of a class,
//! never a half-relinked one. Decoding and on-demand resolution run before
//! the lock is taken.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dependency::ClassGraph;
use crate::classfile::ClassParser;
use crate::java_class::{ClassSet, JavaClass};

#[derive(Default)]
struct IndexState {
    graph: ClassGraph,
    by_file: HashMap<PathBuf, Arc<JavaClass>>,
}

impl IndexState {
    fn evict_file(&mut self, file: &Path) {
        if let Some(old) = self.by_file.remove(file) {
            debug!(class = old.name(), file = %file.display(), "evicting class");
            self.graph.remove(old.name());
        }
    }

    /// Make sure a vertex exists for `name`, inserting the pre-resolved
    /// class or a bare placeholder.
    fn resolve_or_create(
        &mut self,
        name: &str,
        resolved: &mut HashMap<String, Arc<JavaClass>>,
    ) -> Arc<JavaClass> {
        if let Some(existing) = self.graph.find_vertex_by_name(name) {
            return existing.clone();
        }

        let class = resolved
            .remove(name)
            .unwrap_or_else(|| Arc::new(JavaClass::placeholder(name)));
        if let Some(file) = class.source_file() {
            self.by_file
                .entry(file.to_path_buf())
                .or_insert_with(|| class.clone());
        }
        self.graph.add_or_reset_vertex(class.clone());
        class
    }
}

pub struct ClassIndex {
    parser: Arc<dyn ClassParser>,
    state: RwLock<IndexState>,
}

impl ClassIndex {
    pub fn new(parser: Arc<dyn ClassParser>) -> Self {
        Self {
            parser,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn clear(&self) {
        *self.state.write() = IndexState::default();
    }

    /// Number of vertices, placeholders included
    pub fn size(&self) -> usize {
        self.state.read().graph.len()
    }

    pub fn get_indexed_classes(&self) -> ClassSet {
        self.state.read().graph.classes()
    }

    /// Reparse changed files and bring the graph up to date. Returns the
    /// classes produced by files that still exist and decoded cleanly.
    pub fn parse_and_index(&self, changed_files: &[PathBuf]) -> ClassSet {
        let mut parsed = Vec::new();
        let mut gone = Vec::new();

        for file in changed_files {
            debug!(file = %file.display(), "file changed");
            if file.exists() {
                parsed.push((file.clone(), self.parser.parse(file)));
            } else {
                gone.push(file.clone());
            }
        }

        let mut resolved = self.resolve_missing_imports(&parsed);

        let mut state = self.state.write();

        for file in &gone {
            state.evict_file(file);
        }

        let mut changed = ClassSet::new();
        for (file, class) in parsed {
            if class.is_unparsable() {
                warn!(file = %file.display(), "excluding unparsable class from the index");
                state.evict_file(&file);
                continue;
            }

            let class = Arc::new(class);
            if let Some(old) = state.by_file.insert(file, class.clone()) {
                if old.name() != class.name() {
                    state.graph.remove(old.name());
                }
            }
            changed.insert(class.name().to_string(), class);
        }

        let to_link: Vec<Arc<JavaClass>> = changed
            .values()
            .filter(|class| state.graph.add_or_reset_vertex((*class).clone()).needs_linking())
            .cloned()
            .collect();

        for class in &to_link {
            for import in class.imports() {
                state.resolve_or_create(import, &mut resolved);
                state.graph.add_edge(class.name(), import);
            }
        }

        info!(
            changed = changed.len(),
            relinked = to_link.len(),
            removed = gone.len(),
            indexed = state.graph.len(),
            "index updated"
        );

        changed
    }

    /// Reparse, update the graph and return the classes whose files
    /// changed. Dependents are not included; see
    /// [`find_changed_parents`](Self::find_changed_parents).
    pub fn find_classes(&self, changed_files: &[PathBuf]) -> ClassSet {
        self.parse_and_index(changed_files)
    }

    /// Classes currently indexed for the given files, without reparsing
    pub fn classes_for_files(&self, files: &[PathBuf]) -> ClassSet {
        let state = self.state.read();
        files
            .iter()
            .filter_map(|file| state.by_file.get(file))
            .map(|class| (class.name().to_string(), class.clone()))
            .collect()
    }

    /// Transitive dependents of the given classes, the classes included
    pub fn find_changed_parents(&self, classes: &ClassSet) -> ClassSet {
        self.state
            .read()
            .graph
            .find_parents(classes.keys().map(String::as_str))
    }

    pub fn find_or_create_class(&self, name: &str) -> Arc<JavaClass> {
        if let Some(existing) = self.state.read().graph.find_vertex_by_name(name) {
            return existing.clone();
        }

        let mut resolved = HashMap::new();
        resolved.insert(name.to_string(), Arc::new(self.parser.resolve(name)));
        self.state.write().resolve_or_create(name, &mut resolved)
    }

    /// Resolve, outside the write lock, every import not yet in the graph
    fn resolve_missing_imports(
        &self,
        parsed: &[(PathBuf, JavaClass)],
    ) -> HashMap<String, Arc<JavaClass>> {
        let incoming: BTreeSet<&str> = parsed.iter().map(|(_, class)| class.name()).collect();

        let state = self.state.read();
        let missing: BTreeSet<String> = parsed
            .iter()
            .filter(|(_, class)| !class.is_unparsable())
            .flat_map(|(_, class)| class.imports().iter())
            .filter(|name| !incoming.contains(name.as_str()) && !state.graph.contains(name))
            .cloned()
            .collect();
        drop(state);

        missing
            .into_iter()
            .map(|name| {
                let class = Arc::new(self.parser.resolve(&name));
                (name, class)
            })
            .collect()
    }
}
