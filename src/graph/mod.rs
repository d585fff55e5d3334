//! Class dependency graph and the index that maintains it
//!
//! Provides:
//! - The vertex arena with parent/child relation sets
//! - Change-driven reparsing and relinking
//! - Reverse reachability ("who depends on this?") queries

pub mod dependency;
pub mod index;

pub use dependency::{ClassGraph, VertexChange};
pub use index::ClassIndex;
