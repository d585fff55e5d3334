//! Class file decoding
//!
//! Reads just enough of a compiled JVM class (the constant pool and the
//! class header) to learn its name, the classes it references and whether
//! it looks like a test.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::java_class::JavaClass;

const MAGIC: u32 = 0xCAFE_BABE;

const ACC_INTERFACE: u16 = 0x0200;
const ACC_ABSTRACT: u16 = 0x0400;
const ACC_ANNOTATION: u16 = 0x2000;
const ACC_MODULE: u16 = 0x8000;

const TEST_ANNOTATIONS: &[&str] = &[
    "Lorg/junit/Test;",
    "Lorg/junit/jupiter/api/Test;",
    "Lorg/junit/jupiter/params/ParameterizedTest;",
    "Lorg/junit/jupiter/api/TestFactory;",
    "Lorg/testng/annotations/Test;",
];

const TEST_SUPERCLASSES: &[&str] = &["junit.framework.TestCase"];

/// Produces classes from class files
///
/// Parsing never fails outright: a file that cannot be decoded comes back
/// as an unparsable class so the index can drop it.
pub trait ClassParser: Send + Sync {
    fn parse(&self, path: &Path) -> JavaClass;

    /// Find a class by name when it is referenced before its own file has
    /// been seen. Falls back to a placeholder.
    fn resolve(&self, name: &str) -> JavaClass {
        JavaClass::placeholder(name)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a class file (bad magic {0:#010x})")]
    BadMagic(u32),
    #[error("class file truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown constant pool tag {tag} at entry {index}")]
    UnknownTag { tag: u8, index: usize },
    #[error("constant pool index {0} is not a valid entry")]
    BadIndex(u16),
}

/// Parser reading class files from disk, resolving names under a set of
/// class output directories
#[derive(Debug, Clone, Default)]
pub struct ClassFileParser {
    roots: Vec<PathBuf>,
}

impl ClassFileParser {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        let relative = format!("{}.class", name.replace('.', "/"));
        self.roots
            .iter()
            .map(|root| root.join(&relative))
            .find(|path| path.is_file())
    }
}

impl ClassParser for ClassFileParser {
    fn parse(&self, path: &Path) -> JavaClass {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "could not read class file");
                return JavaClass::unparsable(path);
            }
        };

        match decode(&bytes, Some(path.to_path_buf())) {
            Ok(class) => class,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unparsable class file");
                JavaClass::unparsable(path)
            }
        }
    }

    fn resolve(&self, name: &str) -> JavaClass {
        if let Some(path) = self.locate(name) {
            let class = self.parse(&path);
            if !class.is_unparsable() && class.name() == name {
                debug!(class = name, file = %path.display(), "resolved referenced class on demand");
                return class;
            }
        }
        JavaClass::placeholder(name)
    }
}

enum Constant {
    Utf8(String),
    Class(u16),
    NameAndType(u16),
    MethodType(u16),
    Other,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated(self.pos))?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = reader.u16()? as usize;
        // Slot 0 is unused; long and double take two slots.
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Other);

        while entries.len() < count {
            let index = entries.len();
            let tag = reader.u8()?;
            let entry = match tag {
                1 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(String::from_utf8_lossy(reader.take(len)?).to_string())
                }
                3 | 4 => {
                    reader.take(4)?;
                    Constant::Other
                }
                5 | 6 => {
                    reader.take(8)?;
                    // second, unusable slot
                    entries.push(Constant::Other);
                    Constant::Other
                }
                7 => Constant::Class(reader.u16()?),
                16 => Constant::MethodType(reader.u16()?),
                8 | 19 | 20 => {
                    reader.u16()?;
                    Constant::Other
                }
                9 | 10 | 11 | 17 | 18 => {
                    reader.take(4)?;
                    Constant::Other
                }
                12 => {
                    reader.u16()?;
                    Constant::NameAndType(reader.u16()?)
                }
                15 => {
                    reader.take(3)?;
                    Constant::Other
                }
                tag => return Err(DecodeError::UnknownTag { tag, index }),
            };
            entries.push(entry);
        }

        // A trailing long/double may have pushed one slot past the count.
        entries.truncate(count.max(1));
        Ok(Self { entries })
    }

    fn utf8(&self, index: u16) -> Result<&str, DecodeError> {
        match self.entries.get(index as usize) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(DecodeError::BadIndex(index)),
        }
    }

    fn class_name(&self, index: u16) -> Result<String, DecodeError> {
        match self.entries.get(index as usize) {
            Some(Constant::Class(name_index)) => Ok(binary_name(self.utf8(*name_index)?)),
            _ => Err(DecodeError::BadIndex(index)),
        }
    }

    fn referenced_classes(&self) -> Vec<String> {
        let mut names = Vec::new();
        for entry in &self.entries {
            match entry {
                Constant::Class(name_index) => {
                    if let Ok(raw) = self.utf8(*name_index) {
                        if raw.starts_with('[') {
                            names.extend(descriptor_classes(raw));
                        } else {
                            names.push(binary_name(raw));
                        }
                    }
                }
                Constant::NameAndType(descriptor) | Constant::MethodType(descriptor) => {
                    if let Ok(raw) = self.utf8(*descriptor) {
                        names.extend(descriptor_classes(raw));
                    }
                }
                _ => {}
            }
        }
        names
    }

    fn mentions_any(&self, needles: &[&str]) -> bool {
        self.entries.iter().any(|entry| match entry {
            Constant::Utf8(s) => needles.contains(&s.as_str()),
            _ => false,
        })
    }
}

/// Decode class file bytes
pub fn decode(bytes: &[u8], source_file: Option<PathBuf>) -> Result<JavaClass, DecodeError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let _minor = reader.u16()?;
    let _major = reader.u16()?;

    let pool = ConstantPool::read(&mut reader)?;

    let access_flags = reader.u16()?;
    let name = pool.class_name(reader.u16()?)?;
    let super_index = reader.u16()?;
    let super_class = if super_index == 0 {
        None
    } else {
        Some(pool.class_name(super_index)?)
    };

    let concrete = access_flags & (ACC_INTERFACE | ACC_ABSTRACT | ACC_ANNOTATION | ACC_MODULE) == 0;
    let is_test = concrete
        && (pool.mentions_any(TEST_ANNOTATIONS)
            || super_class
                .as_deref()
                .is_some_and(|s| TEST_SUPERCLASSES.contains(&s)));

    Ok(JavaClass::new(name, pool.referenced_classes(), is_test, source_file))
}

/// `com/acme/Foo` -> `com.acme.Foo`
fn binary_name(internal: &str) -> String {
    internal.replace('/', ".")
}

/// Class names mentioned in a field or method descriptor
fn descriptor_classes(descriptor: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = descriptor;

    while let Some(start) = rest.find('L') {
        let after = &rest[start + 1..];
        match after.find(';') {
            Some(end) => {
                names.push(binary_name(&after[..end]));
                rest = &after[end + 1..];
            }
            None => break,
        }
    }

    names
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Hand-assembled class files for tests

    pub struct ClassFileBuilder {
        pool: Vec<Vec<u8>>,
        access_flags: u16,
        this_class: u16,
        super_class: u16,
    }

    impl ClassFileBuilder {
        pub fn new(name: &str) -> Self {
            let mut builder = Self {
                pool: Vec::new(),
                access_flags: 0x0021,
                this_class: 0,
                super_class: 0,
            };
            builder.this_class = builder.class(name);
            builder.super_class = builder.class("java/lang/Object");
            builder
        }

        fn push(&mut self, entry: Vec<u8>) -> u16 {
            self.pool.push(entry);
            self.pool.len() as u16
        }

        pub fn utf8(&mut self, s: &str) -> u16 {
            let mut entry = vec![1];
            entry.extend((s.len() as u16).to_be_bytes());
            entry.extend(s.as_bytes());
            self.push(entry)
        }

        pub fn class(&mut self, internal_name: &str) -> u16 {
            let name = self.utf8(internal_name);
            let mut entry = vec![7];
            entry.extend(name.to_be_bytes());
            self.push(entry)
        }

        pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
            let name = self.utf8(name);
            let descriptor = self.utf8(descriptor);
            let mut entry = vec![12];
            entry.extend(name.to_be_bytes());
            entry.extend(descriptor.to_be_bytes());
            self.push(entry)
        }

        /// Long constants occupy two pool slots
        pub fn long(&mut self, value: i64) -> u16 {
            let mut entry = vec![5];
            entry.extend(value.to_be_bytes());
            let index = self.push(entry);
            self.pool.push(Vec::new());
            index
        }

        pub fn superclass(mut self, internal_name: &str) -> Self {
            self.super_class = self.class(internal_name);
            self
        }

        pub fn imports(mut self, internal_names: &[&str]) -> Self {
            for name in internal_names {
                self.class(name);
            }
            self
        }

        pub fn annotated_test(mut self) -> Self {
            self.utf8("Lorg/junit/Test;");
            self
        }

        pub fn abstract_class(mut self) -> Self {
            self.access_flags |= 0x0400;
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend(0xCAFE_BABEu32.to_be_bytes());
            out.extend(0u16.to_be_bytes());
            out.extend(52u16.to_be_bytes());
            out.extend((self.pool.len() as u16 + 1).to_be_bytes());
            for entry in &self.pool {
                out.extend(entry);
            }
            out.extend(self.access_flags.to_be_bytes());
            out.extend(self.this_class.to_be_bytes());
            out.extend(self.super_class.to_be_bytes());
            out.extend(0u16.to_be_bytes()); // interfaces
            out.extend(0u16.to_be_bytes()); // fields
            out.extend(0u16.to_be_bytes()); // methods
            out.extend(0u16.to_be_bytes()); // attributes
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::ClassFileBuilder;
    use super::*;

    #[test]
    fn test_decode_name_and_imports() {
        let bytes = ClassFileBuilder::new("com/acme/Foo")
            .imports(&["com/acme/Bar", "[Lcom/acme/Baz;"])
            .build();

        let class = decode(&bytes, None).unwrap();
        assert_eq!(class.name(), "com.acme.Foo");
        assert!(class.imports().contains("com.acme.Bar"));
        assert!(class.imports().contains("com.acme.Baz"));
        assert!(class.imports().contains("java.lang.Object"));
        assert!(!class.imports().contains("com.acme.Foo"));
        assert!(!class.is_test());
    }

    #[test]
    fn test_descriptor_references_are_imports() {
        let mut builder = ClassFileBuilder::new("com/acme/Foo");
        builder.name_and_type("helper", "(Lcom/acme/Helper;I[Lcom/acme/Item;)Lcom/acme/Out;");
        let class = decode(&builder.build(), None).unwrap();

        assert!(class.imports().contains("com.acme.Helper"));
        assert!(class.imports().contains("com.acme.Item"));
        assert!(class.imports().contains("com.acme.Out"));
    }

    #[test]
    fn test_long_constants_take_two_slots() {
        let mut builder = ClassFileBuilder::new("com/acme/Foo");
        builder.long(42);
        builder.class("com/acme/AfterLong");
        let class = decode(&builder.build(), None).unwrap();

        assert!(class.imports().contains("com.acme.AfterLong"));
    }

    #[test]
    fn test_annotated_class_is_a_test() {
        let bytes = ClassFileBuilder::new("com/acme/FooTest").annotated_test().build();
        assert!(decode(&bytes, None).unwrap().is_test());
    }

    #[test]
    fn test_abstract_class_is_not_a_test() {
        let bytes = ClassFileBuilder::new("com/acme/AbstractTest")
            .annotated_test()
            .abstract_class()
            .build();
        assert!(!decode(&bytes, None).unwrap().is_test());
    }

    #[test]
    fn test_junit3_superclass_is_a_test() {
        let bytes = ClassFileBuilder::new("com/acme/LegacyTest")
            .superclass("junit/framework/TestCase")
            .build();
        assert!(decode(&bytes, None).unwrap().is_test());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let err = decode(b"not a class", None).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic(_)));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let bytes = ClassFileBuilder::new("com/acme/Foo").build();
        let err = decode(&bytes[..12], None).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(_)));
    }

    #[test]
    fn test_parser_reports_unparsable_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Broken.class");
        std::fs::write(&path, b"garbage").unwrap();

        let class = ClassFileParser::new(vec![dir.path().to_path_buf()]).parse(&path);
        assert!(class.is_unparsable());
        assert_eq!(class.source_file(), Some(path.as_path()));
    }

    #[test]
    fn test_resolve_finds_class_under_roots() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("com/acme");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("Bar.class"), ClassFileBuilder::new("com/acme/Bar").build()).unwrap();

        let parser = ClassFileParser::new(vec![dir.path().to_path_buf()]);
        let found = parser.resolve("com.acme.Bar");
        assert!(found.located_in_class_file());

        let missing = parser.resolve("com.acme.Missing");
        assert!(!missing.located_in_class_file());
        assert_eq!(missing.name(), "com.acme.Missing");
    }
}
