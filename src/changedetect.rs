//! Change detection for class output directories
//!
//! Tracks the last-seen modification time of every class file under the
//! configured roots. Each scan updates that index, so a second scan with
//! nothing touched on disk reports nothing.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const CLASS_EXTENSION: &str = "class";

/// Result of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// New or modified class files
    pub changed: BTreeSet<PathBuf>,
    /// Previously tracked files that are gone from disk
    pub removed: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Every path the index needs to look at
    pub fn all_paths(&self) -> Vec<PathBuf> {
        self.changed.iter().chain(self.removed.iter()).cloned().collect()
    }
}

/// Timestamp-based class file change detector
pub struct ChangeDetector {
    roots: Mutex<Vec<PathBuf>>,
    timestamps: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl ChangeDetector {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots: Mutex::new(roots),
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the scanned roots. The classpath changed, so everything is
    /// forgotten and the next scan reports all files again.
    pub fn set_roots(&self, roots: Vec<PathBuf>) {
        *self.roots.lock() = roots;
        self.clear();
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.lock().clone()
    }

    pub fn clear(&self) {
        self.timestamps.lock().clear();
    }

    pub fn tracked_files(&self) -> usize {
        self.timestamps.lock().len()
    }

    /// Scan all roots and report what changed since the previous scan
    pub fn find_changed_files(&self) -> ChangeSet {
        let roots = self.roots();
        let mut timestamps = self.timestamps.lock();
        let mut changes = ChangeSet::default();
        let mut seen = BTreeSet::new();

        for root in &roots {
            scan_directory(root, &mut timestamps, &mut seen, &mut changes.changed);
        }

        let gone: Vec<PathBuf> = timestamps
            .keys()
            .filter(|path| !seen.contains(*path) && !path.exists())
            .cloned()
            .collect();
        for path in gone {
            timestamps.remove(&path);
            changes.removed.insert(path);
        }

        debug!(
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            tracked = timestamps.len(),
            "scanned class directories"
        );

        changes
    }

    /// Probe for deleted files without touching the index
    pub fn files_were_removed(&self) -> bool {
        self.timestamps.lock().keys().any(|path| !path.exists())
    }
}

fn scan_directory(
    dir: &Path,
    timestamps: &mut HashMap<PathBuf, SystemTime>,
    seen: &mut BTreeSet<PathBuf>,
    changed: &mut BTreeSet<PathBuf>,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            if is_package_directory(&path) {
                scan_directory(&path, timestamps, seen, changed);
            }
        } else if is_class_file(&path) {
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            seen.insert(path.clone());
            let previous = timestamps.insert(path.clone(), modified);
            if previous != Some(modified) {
                changed.insert(path);
            }
        }
    }
}

fn is_class_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == CLASS_EXTENSION)
}

/// Package directories start like an identifier; anything else (e.g. a
/// generated directory named with a leading digit) is not descended into.
fn is_package_directory(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.chars().next())
        .is_some_and(is_identifier_start)
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}
