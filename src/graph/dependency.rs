//! Class dependency graph
//!
//! Vertices live in a flat map keyed by class name. Each vertex records
//! `parents` (classes importing it) and `children` (classes it imports);
//! there is no separate edge list. An edge `A imports B` is stored as
//! `B.parents ∋ A` and `A.children ∋ B`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::java_class::{ClassSet, JavaClass};

/// Outcome of [`ClassGraph::add_or_reset_vertex`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexChange {
    /// No vertex existed under this name
    Added,
    /// The stored class is the very same value
    Unchanged,
    /// A new payload replaced the old one; outgoing edges were dropped
    Reset,
}

impl VertexChange {
    pub fn needs_linking(self) -> bool {
        !matches!(self, VertexChange::Unchanged)
    }
}

#[derive(Debug)]
struct Vertex {
    class: Arc<JavaClass>,
    parents: HashSet<String>,
    children: HashSet<String>,
}

impl Vertex {
    fn new(class: Arc<JavaClass>) -> Self {
        Self {
            class,
            parents: HashSet::new(),
            children: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ClassGraph {
    vertices: HashMap<String, Vertex>,
}

impl ClassGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vertices.contains_key(name)
    }

    pub fn find_vertex_by_name(&self, name: &str) -> Option<&Arc<JavaClass>> {
        self.vertices.get(name).map(|v| &v.class)
    }

    pub fn classes(&self) -> ClassSet {
        self.vertices
            .iter()
            .map(|(name, v)| (name.clone(), v.class.clone()))
            .collect()
    }

    pub fn add_or_reset_vertex(&mut self, class: Arc<JavaClass>) -> VertexChange {
        let name = class.name().to_string();

        let Some(existing) = self.vertices.get_mut(&name) else {
            self.vertices.insert(name, Vertex::new(class));
            return VertexChange::Added;
        };

        if Arc::ptr_eq(&existing.class, &class) {
            return VertexChange::Unchanged;
        }

        existing.class = class;
        let children = std::mem::take(&mut existing.children);
        for child in children {
            if let Some(child) = self.vertices.get_mut(&child) {
                child.parents.remove(&name);
            }
        }

        VertexChange::Reset
    }

    /// Record `from imports to`. Both vertices must already exist; self
    /// references are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        if from == to || !self.contains(from) || !self.contains(to) {
            return false;
        }

        if let Some(target) = self.vertices.get_mut(to) {
            target.parents.insert(from.to_string());
        }
        if let Some(source) = self.vertices.get_mut(from) {
            source.children.insert(to.to_string());
        }
        true
    }

    /// Drop a vertex and every edge touching it
    pub fn remove(&mut self, name: &str) -> Option<Arc<JavaClass>> {
        let vertex = self.vertices.remove(name)?;

        for child in &vertex.children {
            if let Some(child) = self.vertices.get_mut(child) {
                child.parents.remove(name);
            }
        }
        for parent in &vertex.parents {
            if let Some(parent) = self.vertices.get_mut(parent) {
                parent.children.remove(name);
            }
        }

        Some(vertex.class)
    }

    pub fn parents_of(&self, name: &str) -> Vec<&str> {
        let mut parents: Vec<&str> = self
            .vertices
            .get(name)
            .map(|v| v.parents.iter().map(String::as_str).collect())
            .unwrap_or_default();
        parents.sort_unstable();
        parents
    }

    pub fn children_of(&self, name: &str) -> Vec<&str> {
        let mut children: Vec<&str> = self
            .vertices
            .get(name)
            .map(|v| v.children.iter().map(String::as_str).collect())
            .unwrap_or_default();
        children.sort_unstable();
        children
    }

    /// Every class reachable from the seeds through parent links, seeds
    /// included. Seeds not in the graph are ignored.
    pub fn find_parents<'a, I>(&self, seeds: I) -> ClassSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut found = ClassSet::new();
        let mut stack: Vec<&str> = seeds
            .into_iter()
            .filter(|name| self.contains(name))
            .collect();

        while let Some(name) = stack.pop() {
            if found.contains_key(name) {
                continue;
            }
            let Some(vertex) = self.vertices.get(name) else {
                continue;
            };
            found.insert(name.to_string(), vertex.class.clone());
            stack.extend(
                vertex
                    .parents
                    .iter()
                    .map(String::as_str)
                    .filter(|parent| !found.contains_key(*parent)),
            );
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn class(name: &str) -> Arc<JavaClass> {
        Arc::new(JavaClass::placeholder(name))
    }

    fn names(set: &ClassSet) -> Vec<&str> {
        set.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_find_parent() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("Hello"));
        graph.add_or_reset_vertex(class("HelloTest"));
        graph.add_edge("HelloTest", "Hello");

        assert_eq!(names(&graph.find_parents(["Hello"])), vec!["Hello", "HelloTest"]);
    }

    #[test]
    fn test_find_self() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("Hello"));
        graph.add_or_reset_vertex(class("HelloTest"));
        graph.add_edge("HelloTest", "Hello");

        assert_eq!(names(&graph.find_parents(["HelloTest"])), vec!["HelloTest"]);
    }

    #[test]
    fn test_find_grand_parent() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("A"));
        graph.add_or_reset_vertex(class("B"));
        graph.add_or_reset_vertex(class("C"));
        graph.add_edge("A", "B");
        graph.add_edge("B", "C");

        assert_eq!(names(&graph.find_parents(["C"])), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("Ping"));
        graph.add_or_reset_vertex(class("Pong"));
        graph.add_edge("Ping", "Pong");
        graph.add_edge("Pong", "Ping");

        assert_eq!(names(&graph.find_parents(["Ping"])), vec!["Ping", "Pong"]);
    }

    #[test]
    fn test_unknown_seed_is_ignored() {
        let graph = ClassGraph::new();
        assert!(graph.find_parents(["Nope"]).is_empty());
    }

    #[test]
    fn test_same_payload_is_unchanged() {
        let mut graph = ClassGraph::new();
        let hello = class("Hello");
        assert_eq!(graph.add_or_reset_vertex(hello.clone()), VertexChange::Added);
        graph.add_or_reset_vertex(class("World"));
        graph.add_edge("Hello", "World");

        assert_eq!(graph.add_or_reset_vertex(hello), VertexChange::Unchanged);
        assert_eq!(graph.children_of("Hello"), vec!["World"]);
        assert_eq!(graph.parents_of("World"), vec!["Hello"]);
    }

    #[test]
    fn test_reset_drops_children_keeps_parents() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("Test"));
        graph.add_or_reset_vertex(class("Hello"));
        graph.add_or_reset_vertex(class("World"));
        graph.add_edge("Test", "Hello");
        graph.add_edge("Hello", "World");

        let change = graph.add_or_reset_vertex(class("Hello"));
        assert_eq!(change, VertexChange::Reset);
        assert!(change.needs_linking());
        assert!(graph.children_of("Hello").is_empty());
        assert!(graph.parents_of("World").is_empty());
        assert_eq!(graph.parents_of("Hello"), vec!["Test"]);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_no_self_loops() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("Solo"));
        assert!(!graph.add_edge("Solo", "Solo"));
        assert!(graph.parents_of("Solo").is_empty());
    }

    #[test]
    fn test_edge_requires_both_vertices() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("A"));
        assert!(!graph.add_edge("A", "Missing"));
        assert!(graph.children_of("A").is_empty());
    }

    #[test]
    fn test_remove_detaches_both_directions() {
        let mut graph = ClassGraph::new();
        graph.add_or_reset_vertex(class("A"));
        graph.add_or_reset_vertex(class("B"));
        graph.add_or_reset_vertex(class("C"));
        graph.add_edge("A", "B");
        graph.add_edge("B", "C");

        assert!(graph.remove("B").is_some());
        assert!(graph.children_of("A").is_empty());
        assert!(graph.parents_of("C").is_empty());
        assert!(!graph.contains("B"));
        assert!(graph.remove("B").is_none());
    }
}
