// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions for the graph framework.
//!
//! A [`Node`] is the graph-owned shell around a user-supplied [`Processor`]:
//! it holds the ports, the invalidation level and the status, while the
//! processor only implements the computation and interaction hooks.

use crate::evaluation::{ProcessContext, ProcessError};
use crate::event::{default_should_propagate, Event};
use crate::invalidation::{InvalidationLevel, ProcessorStatus};
use crate::link::ParamValue;
use crate::port::{Port, PortDirection, PortType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a node within a graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

/// The computation behind a node.
///
/// This is the narrow capability interface user node kinds implement. Ports,
/// invalidation and status are managed by the owning [`Node`] and the graph.
pub trait Processor: Send {
    /// Recompute outputs from inputs.
    ///
    /// Called at most once per evaluation pass, only while the node is ready
    /// and invalid. Errors and panics are captured as
    /// [`ProcessorStatus::Error`].
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError>;

    /// Handle an interaction event. Mark it used to stop propagation.
    fn handle_event(&mut self, _event: &mut Event) {}

    /// Decide whether an event that arrived through `source` continues into `inport`.
    fn should_propagate_to(&self, inport: &Port, source: Option<&Port>, event: &Event) -> bool {
        default_should_propagate(inport, source, event)
    }

    /// Opaque persisted state; the format belongs to the processor
    fn serialize_state(&self) -> Option<String> {
        None
    }

    /// Restore state previously produced by [`Processor::serialize_state`]
    fn deserialize_state(&mut self, _state: &str) -> Result<(), ProcessError> {
        Ok(())
    }

    /// Current value of a named parameter, if the processor has one
    fn parameter(&self, _name: &str) -> Option<ParamValue> {
        None
    }

    /// Change a named parameter. Called by the graph, which handles
    /// invalidation and links.
    fn set_parameter(&mut self, name: &str, _value: &ParamValue) -> Result<(), ProcessError> {
        Err(ProcessError::UnknownParameter(name.to_string()))
    }
}

/// Node type category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCategory {
    /// Data sources (readers, generators)
    Source,
    /// Data transformations
    Filter,
    /// Renderers producing images
    Render,
    /// Sinks (canvases, exporters)
    Sink,
    /// Utility nodes
    Utility,
    /// Custom/user-defined
    Custom,
}

/// Node type definition
#[derive(Debug, Clone)]
pub struct NodeType {
    /// Unique type identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Category
    pub category: NodeCategory,
    /// Description
    pub description: String,
    /// Default input ports
    pub inputs: Vec<Port>,
    /// Default output ports
    pub outputs: Vec<Port>,
}

impl NodeType {
    /// Create a node type with no ports
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: NodeCategory) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a default input port
    pub fn with_input(mut self, port: Port) -> Self {
        self.inputs.push(port);
        self
    }

    /// Add a default output port
    pub fn with_output(mut self, port: Port) -> Self {
        self.outputs.push(port);
        self
    }
}

/// A node instance in the graph
pub struct Node {
    id: NodeId,
    type_id: String,
    /// Display name (can be customized)
    pub name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    level: InvalidationLevel,
    status: ProcessorStatus,
    processor: Box<dyn Processor>,
}

impl Node {
    /// Create a node without ports around a processor
    pub fn new(
        id: impl Into<NodeId>,
        type_id: impl Into<String>,
        processor: Box<dyn Processor>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            type_id: type_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            level: InvalidationLevel::InvalidResources,
            status: ProcessorStatus::Ready,
            processor,
        }
    }

    /// Create a node from a type definition
    pub fn from_type(
        id: impl Into<NodeId>,
        node_type: &NodeType,
        processor: Box<dyn Processor>,
    ) -> Self {
        let mut node = Self::new(id, node_type.id.clone(), processor);
        node.name = node_type.name.clone();
        for port in &node_type.inputs {
            node = node.with_input(port.clone());
        }
        for port in &node_type.outputs {
            node = node.with_output(port.clone());
        }
        node
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an input port
    pub fn with_input(mut self, mut port: Port) -> Self {
        port.direction = PortDirection::Input;
        port.set_owner(self.id.clone());
        self.inputs.push(port);
        self
    }

    /// Add an output port
    pub fn with_output(mut self, mut port: Port) -> Self {
        port.direction = PortDirection::Output;
        port.multi_connect = true;
        port.set_owner(self.id.clone());
        self.outputs.push(port);
        self
    }

    /// Get the node's identifier
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Get the node type identifier
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Input ports in declaration order
    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    /// Output ports in declaration order
    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    /// Get an input port by name
    pub fn input(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Get an output port by name
    pub fn output(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub(crate) fn output_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.outputs.iter_mut().find(|p| p.name == name)
    }

    /// Get a port by name
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.input(name).or_else(|| self.output(name))
    }

    /// Get all ports
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    /// First port name that appears twice, if any
    pub(crate) fn duplicate_port(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.ports()
            .map(|p| p.name.as_str())
            .find(|name| !seen.insert(*name))
    }

    /// Current invalidation level
    pub fn level(&self) -> InvalidationLevel {
        self.level
    }

    /// Current status
    pub fn status(&self) -> &ProcessorStatus {
        &self.status
    }

    /// Whether the node has no inputs
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Whether the node has no outputs
    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Merge a level into this node only. Returns true if the level rose.
    pub(crate) fn merge_level(&mut self, level: InvalidationLevel) -> bool {
        let merged = self.level.merge(level);
        let raised = merged != self.level;
        self.level = merged;
        raised
    }

    pub(crate) fn set_valid(&mut self) {
        self.level = InvalidationLevel::Valid;
    }

    pub(crate) fn set_status(&mut self, status: ProcessorStatus) -> bool {
        let changed = self.status != status;
        self.status = status;
        changed
    }

    /// The processor behind this node
    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    /// Mutable access to the processor
    pub fn processor_mut(&mut self) -> &mut dyn Processor {
        self.processor.as_mut()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type_id", &self.type_id)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("level", &self.level)
            .field("status", &self.status)
            .finish()
    }
}

/// Port summary for UI display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name
    pub name: String,
    /// Help text
    pub help: String,
    /// Data type
    pub port_type: PortType,
    /// Port group
    pub group: String,
    /// Optional input
    pub optional: bool,
    /// Accepts several connections
    pub multi_connect: bool,
    /// Number of live connections
    pub connections: usize,
}

/// Structured node description for UI display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier
    pub id: NodeId,
    /// Node type identifier
    pub type_id: String,
    /// Display name
    pub name: String,
    /// Invalidation level
    pub level: InvalidationLevel,
    /// Status (with reason for tooltips)
    pub status: ProcessorStatus,
    /// Input ports
    pub inputs: Vec<PortInfo>,
    /// Output ports
    pub outputs: Vec<PortInfo>,
}

/// Factory producing fresh processors for a node type
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// Registry of available node types
#[derive(Clone, Default)]
pub struct NodeRegistry {
    types: IndexMap<String, (NodeType, ProcessorFactory)>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type with its processor factory
    pub fn register<F>(&mut self, node_type: NodeType, factory: F)
    where
        F: Fn() -> Box<dyn Processor> + Send + Sync + 'static,
    {
        self.types
            .insert(node_type.id.clone(), (node_type, Arc::new(factory)));
    }

    /// Get a node type by ID
    pub fn get(&self, id: &str) -> Option<&NodeType> {
        self.types.get(id).map(|(node_type, _)| node_type)
    }

    /// Get all registered types
    pub fn types(&self) -> impl Iterator<Item = &NodeType> {
        self.types.values().map(|(node_type, _)| node_type)
    }

    /// Get types by category
    pub fn types_in_category(&self, category: NodeCategory) -> impl Iterator<Item = &NodeType> {
        self.types().filter(move |t| t.category == category)
    }

    /// Create a node from a type ID
    pub fn create_node(&self, type_id: &str, id: impl Into<NodeId>) -> Option<Node> {
        self.types
            .get(type_id)
            .map(|(node_type, factory)| Node::from_type(id, node_type, factory()))
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Processor for Noop {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    fn volume_source() -> NodeType {
        NodeType::new("VolumeSource", "Volume Source", NodeCategory::Source)
            .with_description("Reads a volume")
            .with_output(Port::output("volume", PortType::Volume))
    }

    #[test]
    fn new_nodes_start_invalid_and_ready() {
        let node = Node::new("a", "Noop", Box::new(Noop));
        assert_eq!(node.level(), InvalidationLevel::InvalidResources);
        assert!(node.status().is_ready());
        assert!(node.is_source());
        assert!(node.is_sink());
    }

    #[test]
    fn ports_get_owner_back_reference() {
        let node = Node::new("a", "Noop", Box::new(Noop))
            .with_input(Port::input("in", PortType::Volume))
            .with_output(Port::output("out", PortType::Image));
        assert_eq!(node.input("in").and_then(Port::owner), Some(&NodeId::new("a")));
        assert_eq!(node.output("out").and_then(Port::owner), Some(&NodeId::new("a")));
        assert!(node.port("out").is_some());
        assert!(node.port("missing").is_none());
    }

    #[test]
    fn duplicate_ports_are_found() {
        let node = Node::new("a", "Noop", Box::new(Noop))
            .with_input(Port::input("data", PortType::Volume))
            .with_output(Port::output("data", PortType::Volume));
        assert_eq!(node.duplicate_port(), Some("data"));
    }

    #[test]
    fn merge_level_reports_rises() {
        let mut node = Node::new("a", "Noop", Box::new(Noop));
        node.set_valid();
        assert!(node.merge_level(InvalidationLevel::InvalidOutput));
        assert!(!node.merge_level(InvalidationLevel::InvalidOutput));
        assert!(!node.merge_level(InvalidationLevel::Valid));
        assert_eq!(node.level(), InvalidationLevel::InvalidOutput);
    }

    #[test]
    fn registry_creates_nodes_from_types() {
        let mut registry = NodeRegistry::new();
        registry.register(volume_source(), || Box::new(Noop));

        let node = registry.create_node("VolumeSource", "source").unwrap();
        assert_eq!(node.type_id(), "VolumeSource");
        assert_eq!(node.name, "Volume Source");
        assert_eq!(node.outputs().len(), 1);
        assert!(registry.create_node("Missing", "x").is_none());
        assert_eq!(registry.types_in_category(NodeCategory::Source).count(), 1);
        assert_eq!(registry.types_in_category(NodeCategory::Sink).count(), 0);
    }
}
