//! testloop - continuous testing for JVM projects
//!
//! A library for keeping tests running while code changes:
//! - Class file change detection by timestamp
//! - Class dependency graph built from compiled class files
//! - Rule-file based test filtering
//! - Selection of the tests impacted by a change
//! - Bounded, out-of-process test execution with streamed results

pub mod changedetect;
pub mod classfile;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod filter;
pub mod graph;
pub mod java_class;
pub mod logging;
pub mod selector;
pub mod session;
pub mod watcher;

pub use changedetect::{ChangeDetector, ChangeSet};
pub use classfile::{ClassFileParser, ClassParser};
pub use config::Config;
pub use error::{FilterError, SelectionError, WorkerError};
pub use events::{Diagnostic, EventBus, Outcome, RunEvent, RunSummary, TestResult};
pub use execution::{ConcurrencyController, RunnerOptions, TestRunner};
pub use filter::{FilterChain, FilterRule, RuleKind};
pub use graph::{ClassGraph, ClassIndex, VertexChange};
pub use java_class::{ClassSet, JavaClass, ParseStatus};
pub use selector::TestSelector;
pub use session::{ContinuousSession, Update};
