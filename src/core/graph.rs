//! Container dependency graph
//!
//! Nodes are container ids in insertion order; an edge `a -> b` means `b`
//! needs `a` started first. Sorting is Kahn's algorithm with a FIFO frontier,
//! so independent containers keep their request order.

use crate::core::error::{Error, Result};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
struct Node {
    id: String,
    incoming: usize,
    children: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` unless present; returns its index.
    pub fn add_node(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(Node {
            id: id.to_string(),
            ..Node::default()
        });
        self.index.insert(id.to_string(), i);
        i
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records that `dependent` must start after `dependency`. Both nodes are
    /// created as needed; repeated edges are ignored.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) {
        let from = self.add_node(dependency);
        let to = self.add_node(dependent);
        if self.nodes[from].children.contains(&to) {
            return;
        }
        self.nodes[from].children.push(to);
        self.nodes[to].incoming += 1;
    }

    /// Node ids with every dependency ahead of its dependents.
    ///
    /// A cycle leaves some nodes unsorted and is [`Error::DependencyCycle`].
    pub fn sorted(&self) -> Result<Vec<String>> {
        let mut incoming: Vec<usize> = self.nodes.iter().map(|n| n.incoming).collect();
        let mut frontier: VecDeque<usize> = incoming
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = frontier.pop_front() {
            order.push(self.nodes[i].id.clone());
            for &child in &self.nodes[i].children {
                incoming[child] -= 1;
                if incoming[child] == 0 {
                    frontier.push_back(child);
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(Error::DependencyCycle {
                sorted: order.len(),
                total: self.nodes.len(),
            });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_keeps_request_order_for_independent_nodes() {
        let mut graph = DependencyGraph::new();
        for id in ["c", "a", "b"] {
            graph.add_node(id);
        }
        assert_eq!(graph.sorted().unwrap(), ["c", "a", "b"]);
    }

    #[test]
    fn test_sorted_puts_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.add_node("web");
        graph.add_node("db");
        graph.add_edge("db", "web");
        graph.add_edge("data", "db");
        graph.add_edge("db", "web");

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.sorted().unwrap(), ["data", "db", "web"]);
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut graph = DependencyGraph::new();
        graph.add_node("free");
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "a");

        let err = graph.sorted().unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { sorted: 1, total: 4 }));
        assert!(err.is_fatal());
    }
}
