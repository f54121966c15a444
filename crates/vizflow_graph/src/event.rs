// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interaction events and their upstream routing.
//!
//! An event enters at a node (usually a canvas) and bubbles toward the graph
//! sources: each node handles it, then forwards it through the input ports its
//! processor accepts to the producers connected there. Marking the event used
//! stops the walk.

use crate::graph::{Graph, GraphError, Result};
use crate::node::NodeId;
use crate::port::{Port, PortRef};
use serde::{Deserialize, Serialize};

/// Phase of a picking interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PickingState {
    /// The pointer entered or pressed a pickable object
    Started,
    /// The pointer moved while on (or latched to) the object
    Updated,
    /// The pointer left or released the object
    Finished,
}

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Pointer moved or a button changed
    Pointer {
        /// Position in canvas pixels
        position: [f64; 2],
        /// Pressed buttons as a bitmask
        buttons: u8,
        /// Whether this sample is a press
        pressed: bool,
    },
    /// Scroll wheel
    Wheel {
        /// Scroll delta
        delta: [f64; 2],
    },
    /// Keyboard key
    Key {
        /// Key name
        code: String,
        /// Pressed or released
        pressed: bool,
    },
    /// Canvas or viewport resize
    Resize {
        /// New size in pixels
        size: [u32; 2],
    },
    /// Picking interaction on a global picking id
    Picking {
        /// Global picking id
        id: u32,
        /// Interaction phase
        state: PickingState,
    },
    /// Application specific event
    Custom(String),
}

/// Whether a node reached again through another branch handles the event twice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevisitPolicy {
    /// Each node handles an event at most once per propagation
    #[default]
    Deduplicate,
    /// Nodes on several branches handle the event once per branch
    Revisit,
}

/// An interaction event travelling through the graph
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    used: bool,
    visited: Vec<NodeId>,
}

impl Event {
    /// Create an unused event
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            used: false,
            visited: Vec::new(),
        }
    }

    /// Event payload
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Mark the event consumed; propagation stops
    pub fn mark_used(&mut self) {
        self.used = true;
    }

    /// Whether some handler consumed the event
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Nodes reached so far, each listed once, in first-visit order
    pub fn visited(&self) -> &[NodeId] {
        &self.visited
    }

    /// Whether a node has been reached
    pub fn has_visited(&self, node: &NodeId) -> bool {
        self.visited.contains(node)
    }

    fn mark_visited(&mut self, node: &NodeId) {
        if !self.has_visited(node) {
            self.visited.push(node.clone());
        }
    }
}

/// Default forwarding rule: resize events stay within the port group they
/// arrived through, everything else passes every input.
pub fn default_should_propagate(inport: &Port, source: Option<&Port>, event: &Event) -> bool {
    match (event.kind(), source) {
        (EventKind::Resize { .. }, Some(source)) => inport.group == source.group,
        _ => true,
    }
}

impl Graph {
    /// Propagate an event arriving at an output port.
    ///
    /// The port's node handles it first, then it walks upstream depth-first in
    /// connection order until used.
    pub fn propagate(&mut self, event: &mut Event, origin: &PortRef) -> Result<()> {
        let node = self
            .nodes
            .get(&origin.node)
            .ok_or_else(|| GraphError::NotFound(origin.node.clone()))?;
        let port = node
            .port(&origin.port)
            .ok_or_else(|| GraphError::PortNotFound(origin.clone()))?;
        if !port.is_output() {
            return Err(GraphError::WrongDirection {
                from: origin.clone(),
                to: origin.clone(),
            });
        }
        self.propagate_into(event, &origin.node, Some(origin.port.as_str()));
        Ok(())
    }

    /// Propagate an event starting at a node, for sinks without outputs
    pub fn propagate_from_node(&mut self, event: &mut Event, node: &NodeId) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(GraphError::NotFound(node.clone()));
        }
        self.propagate_into(event, node, None);
        Ok(())
    }

    fn propagate_into(&mut self, event: &mut Event, node_id: &NodeId, source: Option<&str>) {
        if event.has_visited(node_id) && self.revisit == RevisitPolicy::Deduplicate {
            return;
        }
        event.mark_visited(node_id);

        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        node.processor_mut().handle_event(event);
        if event.is_used() {
            tracing::debug!("Event used by {node_id}");
            return;
        }

        let inport_count = self.nodes.get(node_id).map_or(0, |n| n.inputs().len());
        for index in 0..inport_count {
            let Some(node) = self.nodes.get(node_id) else {
                return;
            };
            let inport = &node.inputs()[index];
            let source_port = source.and_then(|name| node.output(name));
            if !node.processor().should_propagate_to(inport, source_port, event) {
                continue;
            }

            let inport_ref = PortRef::new(node_id, inport.name.as_str());
            let upstream: Vec<PortRef> = self
                .connections_to(&inport_ref)
                .map(|c| c.from.clone())
                .collect();
            for outport in upstream {
                self.propagate_into(event, &outport.node, Some(outport.port.as_str()));
                if event.is_used() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{ProcessContext, ProcessError};
    use crate::node::{Node, Processor};
    use crate::port::PortType;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every event it sees and optionally consumes it.
    struct Recorder {
        name: &'static str,
        log: Log,
        consume: bool,
    }

    impl Processor for Recorder {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> std::result::Result<(), ProcessError> {
            Ok(())
        }

        fn handle_event(&mut self, event: &mut Event) {
            self.log.lock().push(self.name.to_string());
            if self.consume {
                event.mark_used();
            }
        }
    }

    fn recorder(name: &'static str, log: &Log, consume: bool) -> Box<dyn Processor> {
        Box::new(Recorder {
            name,
            log: Arc::clone(log),
            consume,
        })
    }

    fn chain(log: &Log, mid_consumes: bool) -> Graph {
        let mut graph = Graph::default();
        graph
            .add_node(
                Node::new("source", "Source", recorder("source", log, false))
                    .with_output(Port::output("out", PortType::Image)),
            )
            .unwrap();
        graph
            .add_node(
                Node::new("mid", "Mid", recorder("mid", log, mid_consumes))
                    .with_input(Port::input("in", PortType::Image))
                    .with_output(Port::output("out", PortType::Image)),
            )
            .unwrap();
        graph
            .add_node(
                Node::new("sink", "Sink", recorder("sink", log, false))
                    .with_input(Port::input("in", PortType::Image))
                    .with_output(Port::output("out", PortType::Image)),
            )
            .unwrap();
        graph
            .connect(PortRef::new("source", "out"), PortRef::new("mid", "in"))
            .unwrap();
        graph
            .connect(PortRef::new("mid", "out"), PortRef::new("sink", "in"))
            .unwrap();
        graph
    }

    fn click() -> Event {
        Event::new(EventKind::Pointer {
            position: [10.0, 20.0],
            buttons: 1,
            pressed: true,
        })
    }

    #[test]
    fn unused_events_reach_the_source() {
        let log = Log::default();
        let mut graph = chain(&log, false);
        let mut event = click();
        graph
            .propagate(&mut event, &PortRef::new("sink", "out"))
            .unwrap();
        assert_eq!(*log.lock(), ["sink", "mid", "source"]);
        assert!(!event.is_used());
        let visited: Vec<&str> = event.visited().iter().map(NodeId::as_str).collect();
        assert_eq!(visited, ["sink", "mid", "source"]);
    }

    #[test]
    fn used_events_stop_before_the_source() {
        let log = Log::default();
        let mut graph = chain(&log, true);
        let mut event = click();
        graph
            .propagate(&mut event, &PortRef::new("sink", "out"))
            .unwrap();
        assert_eq!(*log.lock(), ["sink", "mid"]);
        assert!(event.is_used());
    }

    #[test]
    fn propagate_rejects_input_ports() {
        let log = Log::default();
        let mut graph = chain(&log, false);
        let mut event = click();
        assert!(matches!(
            graph.propagate(&mut event, &PortRef::new("sink", "in")),
            Err(GraphError::WrongDirection { .. })
        ));
        assert!(matches!(
            graph.propagate_from_node(&mut event, &NodeId::new("ghost")),
            Err(GraphError::NotFound(_))
        ));
        assert!(log.lock().is_empty());
    }

    /// Diamond: top feeds left and right, both feed bottom (multi input).
    fn diamond(log: &Log, policy: RevisitPolicy) -> Graph {
        let mut graph = Graph::default().with_revisit_policy(policy);
        graph
            .add_node(
                Node::new("top", "Top", recorder("top", log, false))
                    .with_output(Port::output("out", PortType::Image)),
            )
            .unwrap();
        for side in ["left", "right"] {
            graph
                .add_node(
                    Node::new(side, "Side", recorder(side, log, false))
                        .with_input(Port::input("in", PortType::Image))
                        .with_output(Port::output("out", PortType::Image)),
                )
                .unwrap();
            graph
                .connect(PortRef::new("top", "out"), PortRef::new(side, "in"))
                .unwrap();
        }
        graph
            .add_node(
                Node::new("bottom", "Bottom", recorder("bottom", log, false))
                    .with_input(Port::input("in", PortType::Image).multi()),
            )
            .unwrap();
        for side in ["left", "right"] {
            graph
                .connect(PortRef::new(side, "out"), PortRef::new("bottom", "in"))
                .unwrap();
        }
        graph
    }

    #[test]
    fn fan_in_is_deduplicated_by_default() {
        let log = Log::default();
        let mut graph = diamond(&log, RevisitPolicy::default());
        let mut event = click();
        graph
            .propagate_from_node(&mut event, &NodeId::new("bottom"))
            .unwrap();
        assert_eq!(*log.lock(), ["bottom", "left", "top", "right"]);
    }

    #[test]
    fn revisit_policy_lets_shared_producers_see_every_branch() {
        let log = Log::default();
        let mut graph = diamond(&log, RevisitPolicy::Revisit);
        let mut event = click();
        graph
            .propagate_from_node(&mut event, &NodeId::new("bottom"))
            .unwrap();
        assert_eq!(*log.lock(), ["bottom", "left", "top", "right", "top"]);
        assert_eq!(event.visited().len(), 4);
    }

    #[test]
    fn resize_stays_in_its_port_group() {
        let image = Port::input("image", PortType::Image).in_group("view");
        let overlay = Port::input("overlay", PortType::Image).in_group("overlay");
        let outport = Port::output("out", PortType::Image).in_group("view");
        let resize = Event::new(EventKind::Resize { size: [640, 480] });

        assert!(default_should_propagate(&image, Some(&outport), &resize));
        assert!(!default_should_propagate(&overlay, Some(&outport), &resize));
        assert!(default_should_propagate(&overlay, None, &resize));
        assert!(default_should_propagate(&overlay, Some(&outport), &click()));
    }
}
