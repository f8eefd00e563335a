//! An owned image graph snapshot.

use std::collections::BTreeMap;

use cnet_core::{GraphElement, GraphObject, GraphSource, ObjectId};

/// Nodes and edges captured once, iterated in id order.
#[derive(Debug, Clone, Default)]
pub struct StaticGraph {
    nodes: BTreeMap<i64, GraphElement>,
    edges: BTreeMap<(i64, i64), GraphElement>,
}

impl StaticGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an element, keyed by its identity.
    pub fn insert(&mut self, element: GraphElement) {
        match element.id {
            ObjectId::Node(id) => {
                self.nodes.insert(id, element);
            }
            ObjectId::Edge(s, d) => {
                self.edges.insert((s, d), element);
            }
        }
    }

    pub fn with(mut self, element: GraphElement) -> Self {
        self.insert(element);
        self
    }

    /// Snapshot any collection of graph objects.
    pub fn from_objects<'a, T, I>(objects: I) -> Self
    where
        T: GraphObject + 'a + ?Sized,
        I: IntoIterator<Item = &'a T>,
    {
        let mut graph = Self::new();
        for obj in objects {
            graph.insert(GraphElement::from_object(obj));
        }
        graph
    }

    /// Mark an element ignored so dispatch skips it.
    pub fn set_ignore(&mut self, id: ObjectId, ignore: bool) -> bool {
        let element = match id {
            ObjectId::Node(n) => self.nodes.get_mut(&n),
            ObjectId::Edge(s, d) => self.edges.get_mut(&(s, d)),
        };
        match element {
            Some(e) => {
                e.ignore = ignore;
                true
            }
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

impl GraphSource for StaticGraph {
    fn nodes(&self) -> Vec<GraphElement> {
        self.nodes.values().cloned().collect()
    }

    fn edges(&self) -> Vec<GraphElement> {
        self.edges.values().cloned().collect()
    }

    fn contains(&self, id: ObjectId) -> bool {
        match id {
            ObjectId::Node(n) => self.nodes.contains_key(&n),
            ObjectId::Edge(s, d) => self.edges.contains_key(&(s, d)),
        }
    }
}
