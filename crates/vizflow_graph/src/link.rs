// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parameter links between nodes.
//!
//! A link copies a parameter value from one node to another whenever the
//! source parameter changes, and invalidates the node that received it.
//! Links are directed; two opposite links keep a pair of parameters in sync.
//! A change visits every parameter at most once, so loops of links end.

use crate::graph::{Graph, GraphError, Result};
use crate::invalidation::InvalidationLevel;
use crate::node::NodeId;
use crate::observer::GraphEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;

/// Value of a processor parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Text(String),
}

impl ParamValue {
    /// Name of the value kind, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::Text(_) => "Text",
        }
    }

    /// Whether both values are of the same kind
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Identity of a parameter inside a graph: owning node plus parameter name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamRef {
    /// Owning node
    pub node: NodeId,
    /// Parameter name
    pub param: String,
}

impl ParamRef {
    /// Create a new parameter reference
    pub fn new(node: impl Into<NodeId>, param: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            param: param.into(),
        }
    }
}

impl fmt::Display for ParamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.param)
    }
}

/// A directed parameter link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Parameter whose changes are copied
    pub source: ParamRef,
    /// Parameter receiving the copies
    pub target: ParamRef,
}

impl Link {
    /// Create a new link
    pub fn new(source: ParamRef, target: ParamRef) -> Self {
        Self { source, target }
    }

    /// Check if this link touches a node
    pub fn involves_node(&self, node_id: &NodeId) -> bool {
        self.source.node == *node_id || self.target.node == *node_id
    }

    /// Check if this link runs between two nodes, in either direction
    pub fn connects_nodes(&self, a: &NodeId, b: &NodeId) -> bool {
        (self.source.node == *a && self.target.node == *b)
            || (self.source.node == *b && self.target.node == *a)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.source, self.target)
    }
}

impl Graph {
    /// Current value of a parameter
    pub fn parameter(&self, param: &ParamRef) -> Result<ParamValue> {
        let node = self
            .nodes
            .get(&param.node)
            .ok_or_else(|| GraphError::NotFound(param.node.clone()))?;
        node.processor()
            .parameter(&param.param)
            .ok_or_else(|| GraphError::ParameterNotFound(param.clone()))
    }

    /// Link `source` to `target`. Returns false if the link already exists.
    pub fn add_link(&mut self, source: ParamRef, target: ParamRef) -> Result<bool> {
        if source == target {
            return Err(GraphError::SelfLink(source));
        }
        let from = self.parameter(&source)?;
        let to = self.parameter(&target)?;
        if !from.same_kind(&to) {
            return Err(GraphError::ParameterMismatch {
                param: target,
                expected: to.kind_name(),
                found: from.kind_name(),
            });
        }

        let link = Link::new(source, target);
        if self.links.contains(&link) {
            return Ok(false);
        }
        tracing::debug!("Linking {link}");
        self.links.insert(link.clone());
        self.emit(GraphEvent::LinkAdded(link));
        Ok(true)
    }

    /// Remove a link. Returns false if there was none.
    pub fn remove_link(&mut self, source: &ParamRef, target: &ParamRef) -> bool {
        let link = Link::new(source.clone(), target.clone());
        if !self.links.shift_remove(&link) {
            return false;
        }
        tracing::debug!("Unlinking {link}");
        self.emit(GraphEvent::LinkRemoved(link));
        true
    }

    /// Whether `source` is linked to `target`
    pub fn is_linked(&self, source: &ParamRef, target: &ParamRef) -> bool {
        self.links
            .iter()
            .any(|l| l.source == *source && l.target == *target)
    }

    /// Whether two parameters are linked both ways
    pub fn is_linked_bidirectional(&self, a: &ParamRef, b: &ParamRef) -> bool {
        self.is_linked(a, b) && self.is_linked(b, a)
    }

    /// Get all links, in the order they were made
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Get the number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links running between two nodes, in either direction
    pub fn links_between(&self, a: &NodeId, b: &NodeId) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|l| l.connects_nodes(a, b))
            .collect()
    }

    /// Every parameter a change of `param` reaches through links, sorted
    pub fn linked_parameters(&self, param: &ParamRef) -> Vec<ParamRef> {
        let mut found = BTreeSet::new();
        let mut stack = vec![param.clone()];
        while let Some(current) = stack.pop() {
            for link in self.links.iter().filter(|l| l.source == current) {
                if link.target != *param && found.insert(link.target.clone()) {
                    stack.push(link.target.clone());
                }
            }
        }
        found.into_iter().collect()
    }

    /// Set a parameter and push the value through its links.
    ///
    /// Every parameter whose value changes invalidates its node with
    /// [`InvalidationLevel::InvalidOutput`]. Setting the current value is a
    /// no-op. Returns how many parameters changed.
    pub fn set_parameter(&mut self, param: &ParamRef, value: ParamValue) -> Result<usize> {
        let current = self.parameter(param)?;
        if !current.same_kind(&value) {
            return Err(GraphError::ParameterMismatch {
                param: param.clone(),
                expected: current.kind_name(),
                found: value.kind_name(),
            });
        }
        if current == value {
            return Ok(0);
        }

        self.write_parameter(param, &value)?;
        self.batch(|graph| {
            graph.invalidate_direct(&param.node, InvalidationLevel::InvalidOutput);
            graph.evaluate_links_from(param).map(|linked| linked + 1)
        })
    }

    /// Copy the value of `source` along outgoing links, breadth first.
    /// Returns how many linked parameters changed.
    pub fn evaluate_links_from(&mut self, source: &ParamRef) -> Result<usize> {
        let value = self.parameter(source)?;
        let mut visited = HashSet::from([source.clone()]);
        let mut queue = VecDeque::from([(source.clone(), value)]);
        let mut changed = 0;

        self.batch(|graph| {
            while let Some((current, value)) = queue.pop_front() {
                let targets: Vec<ParamRef> = graph
                    .links
                    .iter()
                    .filter(|l| l.source == current && !visited.contains(&l.target))
                    .map(|l| l.target.clone())
                    .collect();

                for target in targets {
                    visited.insert(target.clone());
                    match graph.parameter(&target) {
                        Ok(existing) if existing == value => {}
                        Ok(_) => {
                            if let Err(e) = graph.write_parameter(&target, &value) {
                                tracing::warn!("Link {current} => {target} not applied: {e}");
                                continue;
                            }
                            graph.invalidate_direct(&target.node, InvalidationLevel::InvalidOutput);
                            changed += 1;
                        }
                        Err(e) => {
                            tracing::warn!("Link {current} => {target} not applied: {e}");
                            continue;
                        }
                    }
                    queue.push_back((target, value.clone()));
                }
            }
        });
        Ok(changed)
    }

    fn write_parameter(&mut self, param: &ParamRef, value: &ParamValue) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&param.node)
            .ok_or_else(|| GraphError::NotFound(param.node.clone()))?;
        node.processor_mut()
            .set_parameter(&param.param, value)
            .map_err(|e| GraphError::ParameterRejected {
                param: param.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{ProcessContext, ProcessError};
    use crate::node::{Node, Processor};
    use crate::observer::GraphEventKind;
    use crate::port::{Port, PortRef, PortType};
    use crate::test_util::{counter, sink};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::result::Result;

    /// Holds named parameters and publishes nothing
    struct Knobs(BTreeMap<String, ParamValue>);

    impl Processor for Knobs {
        fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
            if ctx.has_output("out") {
                ctx.set_output("out", 0_i64)?;
            }
            Ok(())
        }

        fn parameter(&self, name: &str) -> Option<ParamValue> {
            self.0.get(name).cloned()
        }

        fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), ProcessError> {
            match self.0.get_mut(name) {
                Some(slot) => {
                    *slot = value.clone();
                    Ok(())
                }
                None => Err(ProcessError::UnknownParameter(name.to_string())),
            }
        }
    }

    fn knobs(id: &str) -> Node {
        let params = BTreeMap::from([
            ("iso".to_string(), ParamValue::Float(0.5)),
            ("label".to_string(), ParamValue::Text(String::new())),
        ]);
        Node::new(id, "Knobs", Box::new(Knobs(params)))
            .with_output(Port::output("out", PortType::Int))
    }

    fn iso(node: &str) -> ParamRef {
        ParamRef::new(node, "iso")
    }

    fn network() -> Graph {
        let mut graph = Graph::new("links");
        for id in ["a", "b", "c"] {
            graph.add_node(knobs(id)).unwrap();
        }
        for node in graph.nodes.values_mut() {
            node.set_valid();
        }
        graph
    }

    #[test]
    fn add_link_validates_and_is_idempotent() {
        let mut graph = network();
        assert!(graph.add_link(iso("a"), iso("b")).unwrap());
        assert!(!graph.add_link(iso("a"), iso("b")).unwrap());
        assert_eq!(graph.link_count(), 1);

        assert!(matches!(
            graph.add_link(iso("a"), iso("a")),
            Err(GraphError::SelfLink(_))
        ));
        assert!(matches!(
            graph.add_link(iso("a"), ParamRef::new("b", "missing")),
            Err(GraphError::ParameterNotFound(_))
        ));
        assert!(matches!(
            graph.add_link(iso("ghost"), iso("b")),
            Err(GraphError::NotFound(_))
        ));
        assert!(matches!(
            graph.add_link(iso("a"), ParamRef::new("c", "label")),
            Err(GraphError::ParameterMismatch { expected: "Text", found: "Float", .. })
        ));
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn changes_follow_links_and_invalidate_targets() {
        let mut graph = network();
        graph.add_link(iso("a"), iso("b")).unwrap();
        graph.add_link(iso("b"), iso("c")).unwrap();

        assert_eq!(graph.set_parameter(&iso("a"), ParamValue::Float(0.75)).unwrap(), 3);
        for id in ["a", "b", "c"] {
            assert_eq!(graph.parameter(&iso(id)).unwrap(), ParamValue::Float(0.75));
            assert_eq!(
                graph.node(&NodeId::new(id)).unwrap().level(),
                InvalidationLevel::InvalidOutput
            );
        }

        // Setting the same value again changes nothing.
        assert_eq!(graph.set_parameter(&iso("a"), ParamValue::Float(0.75)).unwrap(), 0);
        assert!(matches!(
            graph.set_parameter(&iso("a"), ParamValue::Bool(true)),
            Err(GraphError::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn bidirectional_links_terminate() {
        let mut graph = network();
        graph.add_link(iso("a"), iso("b")).unwrap();
        graph.add_link(iso("b"), iso("a")).unwrap();
        graph.add_link(iso("b"), iso("c")).unwrap();
        graph.add_link(iso("c"), iso("a")).unwrap();
        assert!(graph.is_linked_bidirectional(&iso("a"), &iso("b")));
        assert!(!graph.is_linked_bidirectional(&iso("b"), &iso("c")));

        assert_eq!(graph.set_parameter(&iso("b"), ParamValue::Float(2.0)).unwrap(), 3);
        assert_eq!(graph.parameter(&iso("a")).unwrap(), ParamValue::Float(2.0));
        assert_eq!(graph.linked_parameters(&iso("b")), vec![iso("a"), iso("c")]);
    }

    #[test]
    fn link_changes_only_invalidate_downstream() {
        let calls = counter();
        let mut graph = network();
        graph.add_node(sink("view", &calls)).unwrap();
        graph
            .connect(PortRef::new("b", "out"), PortRef::new("view", "in"))
            .unwrap();
        graph.add_link(iso("a"), iso("b")).unwrap();
        for node in graph.nodes.values_mut() {
            node.set_valid();
        }

        let requests = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&requests);
        graph
            .observers()
            .subscribe(GraphEventKind::EvaluationRequested, move |_| *seen.lock() += 1);

        graph.set_parameter(&iso("a"), ParamValue::Float(0.1)).unwrap();
        assert_eq!(
            graph.node(&NodeId::new("view")).unwrap().level(),
            InvalidationLevel::InvalidOutput
        );
        assert_eq!(
            graph.node(&NodeId::new("c")).unwrap().level(),
            InvalidationLevel::Valid
        );
        assert_eq!(*requests.lock(), 1);
    }

    #[test]
    fn removing_nodes_and_links_updates_the_table() {
        let mut graph = network();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        graph
            .observers()
            .subscribe(GraphEventKind::LinkRemoved, move |e| seen.lock().push(e.clone()));

        graph.add_link(iso("a"), iso("b")).unwrap();
        graph.add_link(iso("b"), iso("a")).unwrap();
        graph.add_link(iso("a"), iso("c")).unwrap();
        assert_eq!(graph.links_between(&NodeId::new("b"), &NodeId::new("a")).len(), 2);

        assert!(graph.remove_link(&iso("a"), &iso("c")));
        assert!(!graph.remove_link(&iso("a"), &iso("c")));
        graph.remove_node(&NodeId::new("b")).unwrap();
        assert_eq!(graph.link_count(), 0);
        assert_eq!(events.lock().len(), 3);
    }
}
