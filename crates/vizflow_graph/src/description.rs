// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted structure of a graph.
//!
//! A description lists node identifiers, their types and opaque processor
//! state, plus the edges and parameter links. Loading replays "add all
//! nodes, then all edges, then all links".

use crate::graph::{Graph, GraphError, Result};
use crate::link::Link;
use crate::node::{NodeId, NodeRegistry};
use crate::port::PortRef;
use serde::{Deserialize, Serialize};

/// Current description format version
pub const DESCRIPTION_FORMAT_VERSION: u32 = 1;

/// A node entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Node identifier
    pub identifier: NodeId,
    /// Registered node type
    pub type_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Processor state from `serialize_state()`
    #[serde(default)]
    pub state: Option<String>,
}

/// An edge entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    /// Source output port
    pub from: PortRef,
    /// Destination input port
    pub to: PortRef,
}

/// Structural description of a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescription {
    /// Format version
    pub version: u32,
    /// Graph name
    pub name: String,
    /// Nodes in insertion order
    pub nodes: Vec<NodeDescription>,
    /// Edges in insertion order
    pub connections: Vec<ConnectionDescription>,
    /// Parameter links in insertion order
    #[serde(default)]
    pub links: Vec<Link>,
}

impl GraphDescription {
    /// Serialize to pretty RON
    pub fn to_ron(&self) -> Result<String> {
        let config = ron::ser::PrettyConfig::default()
            .struct_names(true)
            .enumerate_arrays(false);
        ron::ser::to_string_pretty(self, config)
            .map_err(|e| GraphError::Description(format!("Failed to serialize graph: {e}")))
    }

    /// Parse from RON, rejecting newer format versions
    pub fn from_ron(content: &str) -> Result<Self> {
        let description: Self = ron::from_str(content)
            .map_err(|e| GraphError::Description(format!("Failed to parse graph: {e}")))?;
        if description.version > DESCRIPTION_FORMAT_VERSION {
            return Err(GraphError::Description(format!(
                "Graph format version {} is newer than supported version {}",
                description.version, DESCRIPTION_FORMAT_VERSION
            )));
        }
        Ok(description)
    }
}

impl Graph {
    /// Capture the graph structure
    pub fn describe(&self) -> GraphDescription {
        GraphDescription {
            version: DESCRIPTION_FORMAT_VERSION,
            name: self.name.clone(),
            nodes: self
                .nodes()
                .map(|node| NodeDescription {
                    identifier: node.id().clone(),
                    type_id: node.type_id().to_string(),
                    name: node.name.clone(),
                    state: node.processor().serialize_state(),
                })
                .collect(),
            connections: self
                .connections()
                .map(|c| ConnectionDescription {
                    from: c.from.clone(),
                    to: c.to.clone(),
                })
                .collect(),
            links: self.links().cloned().collect(),
        }
    }

    /// Rebuild a graph from a description.
    ///
    /// Unknown node types and duplicate identifiers fail the whole load.
    /// Connections and links that cannot be made are logged and skipped.
    pub fn from_description(description: &GraphDescription, registry: &NodeRegistry) -> Result<Self> {
        if description.version > DESCRIPTION_FORMAT_VERSION {
            return Err(GraphError::Description(format!(
                "Graph format version {} is newer than supported version {}",
                description.version, DESCRIPTION_FORMAT_VERSION
            )));
        }

        let mut graph = Graph::new(description.name.clone());
        graph.batch(|graph| {
            for entry in &description.nodes {
                let mut node = registry
                    .create_node(&entry.type_id, entry.identifier.clone())
                    .ok_or_else(|| GraphError::UnknownNodeType(entry.type_id.clone()))?;
                if !entry.name.is_empty() {
                    node.name = entry.name.clone();
                }
                if let Some(state) = &entry.state {
                    if let Err(e) = node.processor_mut().deserialize_state(state) {
                        tracing::warn!("Failed to restore state of {}: {e}", entry.identifier);
                    }
                }
                graph.add_node(node)?;
            }

            for entry in &description.connections {
                if let Err(e) = graph.connect(entry.from.clone(), entry.to.clone()) {
                    tracing::warn!("Skipping connection {} -> {}: {e}", entry.from, entry.to);
                }
            }
            for link in &description.links {
                if let Err(e) = graph.add_link(link.source.clone(), link.target.clone()) {
                    tracing::warn!("Skipping link {link}: {e}");
                }
            }
            Ok::<(), GraphError>(())
        })?;

        tracing::info!(
            "Loaded graph '{}' ({} nodes, {} connections, {} links)",
            graph.name,
            graph.node_count(),
            graph.connection_count(),
            graph.link_count()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeCategory, NodeType};
    use crate::port::{Port, PortType};
    use crate::test_util::{counter, probe};

    fn registry() -> NodeRegistry {
        let calls = counter();
        let mut registry = NodeRegistry::new();
        let source_calls = calls.clone();
        registry.register(
            NodeType::new("Source", "Source", NodeCategory::Source)
                .with_output(Port::output("out", PortType::Int)),
            move || probe(&source_calls),
        );
        registry.register(
            NodeType::new("Sink", "Sink", NodeCategory::Sink)
                .with_input(Port::input("in", PortType::Int)),
            move || probe(&calls),
        );
        registry
    }

    fn sample(registry: &NodeRegistry) -> Graph {
        let mut graph = Graph::new("sample");
        let mut source = registry.create_node("Source", "volume").unwrap();
        source.processor_mut().deserialize_state("iso=0.5").unwrap();
        graph.add_node(source).unwrap();
        graph
            .add_node(registry.create_node("Sink", "canvas").unwrap().with_name("Canvas"))
            .unwrap();
        graph
            .connect(PortRef::new("volume", "out"), PortRef::new("canvas", "in"))
            .unwrap();
        graph
    }

    #[test]
    fn describe_then_rebuild_gives_an_equivalent_graph() {
        let registry = registry();
        let graph = sample(&registry);
        let description = graph.describe();
        assert_eq!(description.nodes.len(), 2);
        assert_eq!(description.nodes[0].state.as_deref(), Some("iso=0.5"));

        let text = description.to_ron().unwrap();
        let parsed = GraphDescription::from_ron(&text).unwrap();
        assert_eq!(parsed, description);

        let rebuilt = Graph::from_description(&parsed, &registry).unwrap();
        assert_eq!(rebuilt.describe(), description);
        assert_eq!(rebuilt.node(&NodeId::new("canvas")).unwrap().name, "Canvas");
    }

    #[test]
    fn node_order_does_not_matter() {
        let registry = registry();
        let mut description = sample(&registry).describe();
        description.nodes.reverse();
        let rebuilt = Graph::from_description(&description, &registry).unwrap();
        assert_eq!(rebuilt.connection_count(), 1);
    }

    #[test]
    fn bad_connections_are_skipped() {
        let registry = registry();
        let mut description = sample(&registry).describe();
        description.connections.push(ConnectionDescription {
            from: PortRef::new("volume", "out"),
            to: PortRef::new("ghost", "in"),
        });
        let rebuilt = Graph::from_description(&description, &registry).unwrap();
        assert_eq!(rebuilt.connection_count(), 1);
    }

    #[test]
    fn unknown_types_and_versions_fail() {
        let registry = registry();
        let mut description = sample(&registry).describe();
        description.nodes[0].type_id = "Mystery".to_string();
        assert!(matches!(
            Graph::from_description(&description, &registry),
            Err(GraphError::UnknownNodeType(t)) if t == "Mystery"
        ));

        description.version = DESCRIPTION_FORMAT_VERSION + 1;
        let text = ron::ser::to_string(&description).unwrap();
        assert!(matches!(
            GraphDescription::from_ron(&text),
            Err(GraphError::Description(_))
        ));
    }

    #[test]
    fn links_survive_the_round_trip() {
        let registry = registry();
        let mut graph = sample(&registry);
        let (volume, canvas) = (
            crate::link::ParamRef::new("volume", "label"),
            crate::link::ParamRef::new("canvas", "label"),
        );
        graph.add_link(volume.clone(), canvas.clone()).unwrap();

        let mut description = graph.describe();
        assert_eq!(description.links, vec![Link::new(volume.clone(), canvas.clone())]);
        description.links.push(Link::new(
            canvas.clone(),
            crate::link::ParamRef::new("canvas", "missing"),
        ));

        let text = description.to_ron().unwrap();
        let mut rebuilt =
            Graph::from_description(&GraphDescription::from_ron(&text).unwrap(), &registry)
                .unwrap();
        assert_eq!(rebuilt.link_count(), 1);
        assert!(rebuilt.is_linked(&volume, &canvas));

        rebuilt
            .set_parameter(&volume, crate::link::ParamValue::Text("iso=0.9".into()))
            .unwrap();
        assert_eq!(
            rebuilt.node(&NodeId::new("canvas")).unwrap().processor().serialize_state(),
            Some("iso=0.9".to_string())
        );
    }

    #[test]
    fn descriptions_without_links_still_load() {
        let text = r#"GraphDescription(version: 1, name: "old", nodes: [], connections: [])"#;
        let description = GraphDescription::from_ron(text).unwrap();
        assert!(description.links.is_empty());
    }

    #[test]
    fn stateless_processors_have_no_state_entry() {
        let calls = counter();
        let mut graph = Graph::default();
        graph
            .add_node(Node::new("n", "Plain", probe(&calls)))
            .unwrap();
        assert_eq!(graph.describe().nodes[0].state, None);
    }
}
