//! Class model
//!
//! A `JavaClass` is the unit the dependency graph is built from. It is
//! immutable once constructed: a reparse produces a fresh value that
//! replaces the old one wholesale.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name-ordered set of shared classes
pub type ClassSet = BTreeMap<String, Arc<JavaClass>>;

/// Whether the class artifact could be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStatus {
    #[default]
    Parsed,
    Unparsable,
}

/// A parsed (or referenced-only) compiled class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaClass {
    name: String,
    imports: BTreeSet<String>,
    is_test: bool,
    source_file: Option<PathBuf>,
    status: ParseStatus,
}

impl JavaClass {
    pub fn new(
        name: impl Into<String>,
        imports: impl IntoIterator<Item = String>,
        is_test: bool,
        source_file: Option<PathBuf>,
    ) -> Self {
        let name = name.into();
        let imports = imports.into_iter().filter(|i| *i != name).collect();

        Self {
            name,
            imports,
            is_test,
            source_file,
            status: ParseStatus::Parsed,
        }
    }

    /// Class known only because something references it by name
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: BTreeSet::new(),
            is_test: false,
            source_file: None,
            status: ParseStatus::Parsed,
        }
    }

    /// A file that could not be decoded. The name is a best guess taken
    /// from the file stem.
    pub fn unparsable(source_file: &Path) -> Self {
        let name = source_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            name,
            imports: BTreeSet::new(),
            is_test: false,
            source_file: Some(source_file.to_path_buf()),
            status: ParseStatus::Unparsable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn imports(&self) -> &BTreeSet<String> {
        &self.imports
    }

    pub fn is_test(&self) -> bool {
        self.is_test
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// True when the class came from a class file rather than a reference
    pub fn located_in_class_file(&self) -> bool {
        self.source_file.is_some()
    }

    pub fn status(&self) -> ParseStatus {
        self.status
    }

    pub fn is_unparsable(&self) -> bool {
        self.status == ParseStatus::Unparsable
    }
}

impl fmt::Display for JavaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_reference_is_not_an_import() {
        let class = JavaClass::new(
            "com.acme.Foo",
            vec!["com.acme.Foo".to_string(), "com.acme.Bar".to_string()],
            false,
            None,
        );

        assert_eq!(class.imports().len(), 1);
        assert!(class.imports().contains("com.acme.Bar"));
    }

    #[test]
    fn test_unparsable_takes_name_from_file() {
        let class = JavaClass::unparsable(Path::new("/out/com/acme/Broken.class"));
        assert_eq!(class.name(), "Broken");
        assert!(class.is_unparsable());
        assert!(!class.is_test());
    }

    #[test]
    fn test_placeholder_has_no_source() {
        let class = JavaClass::placeholder("com.acme.Later");
        assert!(!class.located_in_class_file());
        assert_eq!(class.status(), ParseStatus::Parsed);
    }
}
