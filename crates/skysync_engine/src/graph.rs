//! Entity dependency graph.
//!
//! Vertices are sync-enabled entity names. An edge `A -> B` means objects of
//! `A` reference objects of `B`, so records of `B` should be materialised
//! before records of `A` during a pull. A to-many relationship whose inverse
//! is to-one adds no edge: the to-one side already orders the pair, and
//! counting both directions would turn every inverse pair into a cycle.

use crate::attributes::SyncSchema;
use skysync_store::Schema;
use std::collections::{BTreeMap, BTreeSet};

/// Result of analysing a dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphOrder {
    /// Entities with dependencies before dependents. Cycles are broken at
    /// the edge that closes them.
    pub order: Vec<String>,
    /// Entities that sit on a cycle.
    pub cyclic: BTreeSet<String>,
    /// Upper bound on the length of any cycle: the size of the largest set
    /// of mutually reachable entities. Zero for an acyclic graph.
    pub longest_cycle: usize,
}

impl GraphOrder {
    /// Returns true if the graph has at least one cycle.
    pub fn is_cyclic(&self) -> bool {
        !self.cyclic.is_empty()
    }

    /// Number of conversion passes needed to reach a fixed point.
    pub fn passes(&self) -> usize {
        self.longest_cycle + 1
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Directed graph of entity dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph of sync-enabled entities from a schema.
    pub fn from_schema(schema: &Schema, sync: &SyncSchema) -> Self {
        let mut graph = Self::new();
        for entity in schema.entities().filter(|e| sync.is_enabled(&e.name)) {
            graph.add_vertex(&entity.name);
            for relationship in &entity.relationships {
                if !sync.is_enabled(&relationship.destination) {
                    continue;
                }
                let inverse_is_to_one = relationship
                    .inverse
                    .as_deref()
                    .and_then(|inverse| {
                        schema
                            .entity(&relationship.destination)?
                            .relationship(inverse)
                    })
                    .map(|inverse| !inverse.to_many)
                    .unwrap_or(false);
                if relationship.to_many && inverse_is_to_one {
                    continue;
                }
                graph.add_edge(&entity.name, &relationship.destination);
            }
        }
        graph
    }

    /// Adds a vertex.
    pub fn add_vertex(&mut self, name: &str) {
        self.edges.entry(name.to_string()).or_default();
    }

    /// Adds an edge `from -> to`: `from` depends on `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_vertex(to);
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Sorts the graph and detects cycles.
    pub fn analyze(&self) -> GraphOrder {
        let mut marks: BTreeMap<&str, Mark> =
            self.edges.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
        let mut order = Vec::with_capacity(self.edges.len());
        let mut has_cycle = false;

        for start in self.edges.keys() {
            let start = start.as_str();
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // Iterative three-color DFS; each frame holds the vertex and the
            // neighbours still to visit.
            let mut stack: Vec<(&str, Vec<&str>)> = Vec::new();
            marks.insert(start, Mark::InProgress);
            stack.push((start, self.neighbours(start)));

            while let Some((vertex, remaining)) = stack.last_mut() {
                match remaining.pop() {
                    Some(next) => match marks.get(next).copied().unwrap_or(Mark::Done) {
                        Mark::Unvisited => {
                            marks.insert(next, Mark::InProgress);
                            let neighbours = self.neighbours(next);
                            stack.push((next, neighbours));
                        }
                        Mark::InProgress => has_cycle = true,
                        Mark::Done => {}
                    },
                    None => {
                        let vertex = *vertex;
                        marks.insert(vertex, Mark::Done);
                        order.push(vertex.to_string());
                        stack.pop();
                    }
                }
            }
        }

        let (cyclic, longest_cycle) = if has_cycle {
            self.cycles()
        } else {
            (BTreeSet::new(), 0)
        };
        GraphOrder {
            order,
            cyclic,
            longest_cycle,
        }
    }

    fn neighbours(&self, vertex: &str) -> Vec<&str> {
        // Reversed so that popping visits neighbours in name order.
        self.edges
            .get(vertex)
            .map(|n| n.iter().rev().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn reachable(&self, from: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut stack = self.neighbours(from);
        while let Some(vertex) = stack.pop() {
            if seen.insert(vertex) {
                stack.extend(self.neighbours(vertex));
            }
        }
        seen
    }

    /// Vertices on a cycle and the size of the largest strongly connected set.
    fn cycles(&self) -> (BTreeSet<String>, usize) {
        let reach: BTreeMap<&str, BTreeSet<&str>> = self
            .edges
            .keys()
            .map(|v| (v.as_str(), self.reachable(v)))
            .collect();

        let mut cyclic = BTreeSet::new();
        let mut longest = 0;
        for (vertex, reachable) in &reach {
            if !reachable.contains(vertex) {
                continue;
            }
            cyclic.insert(vertex.to_string());
            let component = reachable
                .iter()
                .filter(|other| reach.get(*other).is_some_and(|r| r.contains(vertex)))
                .count();
            longest = longest.max(component);
        }
        (cyclic, longest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &GraphOrder, name: &str) -> usize {
        order.order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("Employee", "Company");
        graph.add_edge("Badge", "Employee");
        graph.add_vertex("Tag");

        let order = graph.analyze();
        assert_eq!(order.order.len(), 4);
        assert!(position(&order, "Company") < position(&order, "Employee"));
        assert!(position(&order, "Employee") < position(&order, "Badge"));
        assert!(!order.is_cyclic());
        assert_eq!(order.passes(), 1);
    }

    #[test]
    fn two_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("Author", "Book");
        graph.add_edge("Book", "Author");
        graph.add_edge("Review", "Book");

        let order = graph.analyze();
        assert_eq!(order.order.len(), 3);
        assert_eq!(
            order.cyclic,
            ["Author".to_string(), "Book".to_string()].into()
        );
        assert_eq!(order.longest_cycle, 2);
        assert_eq!(order.passes(), 3);
    }

    #[test]
    fn self_reference_is_a_cycle_of_one() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("Folder", "Folder");
        let order = graph.analyze();
        assert_eq!(order.longest_cycle, 1);
        assert!(order.cyclic.contains("Folder"));
    }

    #[test]
    fn cycle_through_cross_edge() {
        // A -> B -> A and A -> C -> B: C sits on the cycle A -> C -> B -> A.
        let mut graph = DependencyGraph::new();
        graph.add_edge("A", "B");
        graph.add_edge("B", "A");
        graph.add_edge("A", "C");
        graph.add_edge("C", "B");

        let order = graph.analyze();
        assert_eq!(order.cyclic.len(), 3);
        assert_eq!(order.longest_cycle, 3);
    }

    #[test]
    fn inverse_pairs_are_not_cycles() {
        use crate::config::AttributeNames;
        use skysync_store::{
            AttributeDescriptor, AttributeType, EntityDescriptor, RelationshipDescriptor,
        };

        let synced = |e: EntityDescriptor| {
            e.with_attribute(AttributeDescriptor::new("recordName", AttributeType::Text))
                .with_attribute(AttributeDescriptor::new(
                    "privateRecordData",
                    AttributeType::Bytes,
                ))
        };
        let schema = Schema::new()
            .with_entity(synced(EntityDescriptor::new("Company")).with_relationship(
                RelationshipDescriptor::to_many("employees", "Employee").with_inverse("company"),
            ))
            .with_entity(synced(EntityDescriptor::new("Employee")).with_relationship(
                RelationshipDescriptor::to_one("company", "Company").with_inverse("employees"),
            ));
        let sync = SyncSchema::resolve(&schema, &AttributeNames::default());

        let order = DependencyGraph::from_schema(&schema, &sync).analyze();
        assert!(!order.is_cyclic());
        assert_eq!(order.order, vec!["Company".to_string(), "Employee".to_string()]);
    }
}
