// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph data structure containing nodes and connections.
//!
//! The graph is the single writer for its nodes and edges. Every structural
//! mutation is validated up front and either fully applied or rejected, and
//! every mutation that changes what a node reads feeds the invalidation
//! protocol so the next [`Graph::evaluate`] pass recomputes exactly the stale
//! part of the network.

use crate::connection::{Connection, ConnectionId};
use crate::evaluation::{InvalidationHandle, SchedulerToken};
use crate::event::RevisitPolicy;
use crate::invalidation::{InvalidationLevel, ProcessorStatus};
use crate::link::{Link, ParamRef};
use crate::node::{Node, NodeId, NodeInfo, PortInfo};
use crate::observer::{GraphEvent, GraphObservers};
use crate::port::{Port, PortRef, PortType, TypeRules};
use indexmap::{IndexMap, IndexSet};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// Errors raised by structural graph operations
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Node identifier already used in this graph
    #[error("Node identifier already in use: {0}")]
    DuplicateIdentifier(NodeId),

    /// Node not found
    #[error("Node not found: {0}")]
    NotFound(NodeId),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(PortRef),

    /// Connection not found
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// A node declares the same port name twice
    #[error("Node {node} declares port '{port}' twice")]
    DuplicatePort {
        /// Offending node
        node: NodeId,
        /// Repeated port name
        port: String,
    },

    /// Connections run from an output port into an input port
    #[error("Connections must go from an output into an input: {from} -> {to}")]
    WrongDirection {
        /// Requested source
        from: PortRef,
        /// Requested destination
        to: PortRef,
    },

    /// The connection would close a cycle
    #[error("Connecting {from} -> {to} would create a cycle")]
    CycleDetected {
        /// Requested source
        from: PortRef,
        /// Requested destination
        to: PortRef,
    },

    /// Incompatible port types
    #[error("Incompatible port types: {from} ({from_type:?}) -> {to} ({to_type:?})")]
    TypeMismatch {
        /// Requested source
        from: PortRef,
        /// Requested destination
        to: PortRef,
        /// Source data type
        from_type: PortType,
        /// Destination data type
        to_type: PortType,
    },

    /// Single input already bound, or the same edge exists
    #[error("Input port already connected: {0}")]
    AlreadyConnected(PortRef),

    /// No factory registered for a node type
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// `evaluate()` called while an evaluation holding the same scheduler token runs
    #[error("Evaluation is already running on this scheduler")]
    Reentrancy,

    /// No parameter with that name on the node
    #[error("Parameter not found: {0}")]
    ParameterNotFound(ParamRef),

    /// A parameter cannot be linked to itself
    #[error("Cannot link parameter {0} to itself")]
    SelfLink(ParamRef),

    /// Parameter values of different kinds
    #[error("Parameter {param} holds {expected}, got {found}")]
    ParameterMismatch {
        /// Parameter being written or linked to
        param: ParamRef,
        /// Kind it holds
        expected: &'static str,
        /// Kind offered
        found: &'static str,
    },

    /// The processor refused a parameter value
    #[error("Parameter {param} rejected the value: {reason}")]
    ParameterRejected {
        /// Parameter being written
        param: ParamRef,
        /// Processor's reason
        reason: String,
    },

    /// Reading or writing a structural description failed
    #[error("Graph description error: {0}")]
    Description(String),
}

/// Result alias for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// A dataflow network
#[derive(Debug)]
pub struct Graph {
    /// Graph name
    pub name: String,
    /// Nodes in the graph
    pub(crate) nodes: IndexMap<NodeId, Node>,
    /// Connections between nodes, in insertion order
    pub(crate) connections: IndexMap<ConnectionId, Connection>,
    /// Parameter links, in insertion order
    pub(crate) links: IndexSet<Link>,
    type_rules: TypeRules,
    pub(crate) revisit: RevisitPolicy,
    observers: GraphObservers,
    pub(crate) pending: InvalidationHandle,
    pub(crate) scheduler: SchedulerToken,
    batch_depth: usize,
    evaluation_suppressed: bool,
}

impl Graph {
    /// Create a new empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: IndexMap::new(),
            connections: IndexMap::new(),
            links: IndexSet::new(),
            type_rules: TypeRules::new(),
            revisit: RevisitPolicy::default(),
            observers: GraphObservers::new(),
            pending: InvalidationHandle::default(),
            scheduler: SchedulerToken::new(),
            batch_depth: 0,
            evaluation_suppressed: false,
        }
    }

    /// Use extra type conversion rules for `connect`
    pub fn with_type_rules(mut self, rules: TypeRules) -> Self {
        self.type_rules = rules;
        self
    }

    /// Share a scheduler token with other graphs (e.g. nested networks)
    pub fn with_scheduler(mut self, token: SchedulerToken) -> Self {
        self.scheduler = token;
        self
    }

    /// Set how events treat nodes reached through several branches
    pub fn with_revisit_policy(mut self, policy: RevisitPolicy) -> Self {
        self.revisit = policy;
        self
    }

    /// Type conversion rules
    pub fn type_rules_mut(&mut self) -> &mut TypeRules {
        &mut self.type_rules
    }

    /// Event revisit policy
    pub fn revisit_policy(&self) -> RevisitPolicy {
        self.revisit
    }

    /// Change the event revisit policy
    pub fn set_revisit_policy(&mut self, policy: RevisitPolicy) {
        self.revisit = policy;
    }

    /// Scheduler token guarding `evaluate()`
    pub fn scheduler(&self) -> &SchedulerToken {
        &self.scheduler
    }

    /// Change notifications
    pub fn observers(&self) -> &GraphObservers {
        &self.observers
    }

    /// Thread-safe handle for queueing invalidations from outside the owning thread
    pub fn invalidation_handle(&self) -> InvalidationHandle {
        self.pending.clone()
    }

    pub(crate) fn emit(&self, event: GraphEvent) {
        self.observers.notify(&event);
    }

    /// Add a node to the graph
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateIdentifier(id));
        }
        if let Some(port) = node.duplicate_port() {
            return Err(GraphError::DuplicatePort {
                node: id,
                port: port.to_string(),
            });
        }

        let is_sink = node.is_sink();
        tracing::debug!("Adding node {id} ({})", node.type_id());
        self.nodes.insert(id.clone(), node);
        self.emit(GraphEvent::NodeAdded(id.clone()));
        if is_sink {
            self.request_evaluation();
        }
        Ok(id)
    }

    /// Remove a node and its connections
    pub fn remove_node(&mut self, node_id: &NodeId) -> Result<Node> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphError::NotFound(node_id.clone()));
        }

        let successors = self.direct_successors(node_id);
        let touching: Vec<ConnectionId> = self
            .connections_for_node(node_id)
            .map(|c| c.id)
            .collect();
        for id in touching {
            if let Some(connection) = self.connections.shift_remove(&id) {
                tracing::debug!("Removing connection {connection}");
                self.emit(GraphEvent::ConnectionRemoved(connection));
            }
        }

        let linked: Vec<Link> = self
            .links
            .iter()
            .filter(|l| l.involves_node(node_id))
            .cloned()
            .collect();
        for link in linked {
            self.links.shift_remove(&link);
            self.emit(GraphEvent::LinkRemoved(link));
        }

        let node = self
            .nodes
            .shift_remove(node_id)
            .ok_or_else(|| GraphError::NotFound(node_id.clone()))?;
        tracing::debug!("Removed node {node_id}");
        self.emit(GraphEvent::NodeRemoved(node_id.clone()));

        // Successors lost an input.
        for successor in successors {
            self.invalidate_direct(&successor, InvalidationLevel::InvalidResources);
        }
        Ok(node)
    }

    /// Remove every node, connection and link.
    ///
    /// Queued invalidations are dropped. Name, type rules, observers and the
    /// scheduler token stay.
    pub fn clear(&mut self) {
        for link in std::mem::take(&mut self.links) {
            self.emit(GraphEvent::LinkRemoved(link));
        }
        for connection in std::mem::take(&mut self.connections).into_values() {
            self.emit(GraphEvent::ConnectionRemoved(connection));
        }
        for node_id in std::mem::take(&mut self.nodes).into_keys() {
            self.emit(GraphEvent::NodeRemoved(node_id));
        }
        let dropped = self.pending.take().len();
        tracing::debug!("Cleared graph '{}' ({dropped} queued invalidations dropped)", self.name);
    }

    /// Check whether a node exists
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Get a node by ID
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Get a mutable node by ID
    pub fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    /// Get all nodes
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get all node IDs
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Suggest an identifier not yet used in this graph.
    ///
    /// Returns `base` when free, otherwise appends or bumps a numeric suffix:
    /// `"Volume"` becomes `"Volume 2"`, `"Volume 3"` becomes `"Volume 4"`.
    pub fn unique_identifier(&self, base: &str) -> NodeId {
        let base = base.trim();
        if !self.nodes.contains_key(base) {
            return NodeId::new(base);
        }

        let (stem, mut counter) = base
            .rsplit_once(' ')
            .and_then(|(stem, n)| {
                let next = n.parse::<u64>().ok()?.checked_add(1)?;
                Some((stem, next))
            })
            .unwrap_or((base, 2));
        loop {
            let candidate = format!("{stem} {counter}");
            if !self.nodes.contains_key(candidate.as_str()) {
                return NodeId::new(candidate);
            }
            counter += 1;
        }
    }

    fn port(&self, port: &PortRef) -> Result<&Port> {
        let node = self
            .nodes
            .get(&port.node)
            .ok_or_else(|| GraphError::NotFound(port.node.clone()))?;
        node.port(&port.port)
            .ok_or_else(|| GraphError::PortNotFound(port.clone()))
    }

    /// Add a connection from an output port to an input port
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<ConnectionId> {
        if !self.nodes.contains_key(&from.node) {
            return Err(GraphError::NotFound(from.node));
        }
        if !self.nodes.contains_key(&to.node) {
            return Err(GraphError::NotFound(to.node));
        }
        let source = self.port(&from)?;
        let target = self.port(&to)?;

        if !source.is_output() || !target.is_input() {
            return Err(GraphError::WrongDirection { from, to });
        }
        if !source.can_connect(target, &self.type_rules) {
            let (from_type, to_type) = (source.port_type.clone(), target.port_type.clone());
            return Err(GraphError::TypeMismatch {
                from,
                to,
                from_type,
                to_type,
            });
        }

        let duplicate = {
            let mut existing = self.connections_to(&to);
            if target.multi_connect {
                existing.any(|c| c.from == from)
            } else {
                existing.next().is_some()
            }
        };
        if duplicate {
            return Err(GraphError::AlreadyConnected(to));
        }

        if from.node == to.node || self.reaches(&to.node, &from.node) {
            return Err(GraphError::CycleDetected { from, to });
        }

        let connection = Connection::new(from, to);
        let id = connection.id;
        let target_node = connection.to.node.clone();
        tracing::debug!("Connecting {connection}");
        self.connections.insert(id, connection.clone());
        self.emit(GraphEvent::ConnectionAdded(connection));
        self.invalidate_direct(&target_node, InvalidationLevel::InvalidResources);
        Ok(id)
    }

    /// Remove a connection
    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Result<Connection> {
        let connection = self
            .connections
            .shift_remove(&connection_id)
            .ok_or(GraphError::ConnectionNotFound(connection_id))?;
        tracing::debug!("Disconnecting {connection}");
        self.emit(GraphEvent::ConnectionRemoved(connection.clone()));
        self.invalidate_direct(&connection.to.node, InvalidationLevel::InvalidResources);
        Ok(connection)
    }

    /// Get a connection by ID
    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    /// Get all connections in insertion order
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Get connections leaving an output port
    pub fn connections_from<'a>(
        &'a self,
        port: &'a PortRef,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.values().filter(move |c| c.from == *port)
    }

    /// Get connections entering an input port, in the order they were made
    pub fn connections_to<'a>(
        &'a self,
        port: &'a PortRef,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.values().filter(move |c| c.to == *port)
    }

    /// Get connections involving a node
    pub fn connections_for_node<'a>(
        &'a self,
        node_id: &'a NodeId,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .values()
            .filter(move |c| c.involves_node(node_id))
    }

    /// Get the number of connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a port has at least one connection
    pub fn is_port_connected(&self, port: &PortRef) -> bool {
        self.connections.values().any(|c| c.involves_port(port))
    }

    /// Whether a port can deliver (output) or receive (input) valid data
    pub fn is_port_ready(&self, port: &PortRef) -> Result<bool> {
        let resolved = self.port(port)?;
        if resolved.is_output() {
            return Ok(self.is_output_ready(port));
        }
        let mut sources = self.connections_to(port).peekable();
        Ok(sources.peek().is_some() && sources.all(|c| self.is_output_ready(&c.from)))
    }

    fn is_output_ready(&self, port: &PortRef) -> bool {
        self.nodes
            .get(&port.node)
            .is_some_and(|n| n.status().is_ready() && !n.level().is_invalid())
    }

    /// Readiness of a node given the current state of its producers.
    ///
    /// Every required input must be connected and every producer feeding it
    /// must be ready and valid. Optional inputs never block.
    pub(crate) fn readiness(&self, node: &Node) -> ProcessorStatus {
        for port in node.inputs() {
            if port.optional {
                continue;
            }
            let port_ref = PortRef::new(node.id(), port.name.as_str());
            let mut sources = self.connections_to(&port_ref).peekable();
            if sources.peek().is_none() {
                return ProcessorStatus::NotReady(format!(
                    "input '{}' is not connected",
                    port.name
                ));
            }
            if let Some(blocked) = sources.find(|c| !self.is_output_ready(&c.from)) {
                return ProcessorStatus::NotReady(format!(
                    "input '{}' waits on '{}'",
                    port.name, blocked.from.node
                ));
            }
        }
        ProcessorStatus::Ready
    }

    /// Nodes feeding directly into a node
    pub fn direct_predecessors(&self, node_id: &NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.connections
            .values()
            .filter(|c| c.to.node == *node_id)
            .map(|c| c.from.node.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Nodes fed directly by a node
    pub fn direct_successors(&self, node_id: &NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.connections
            .values()
            .filter(|c| c.from.node == *node_id)
            .map(|c| c.to.node.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// All nodes upstream of a node, sorted by identifier
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.closure(node_id, Self::direct_predecessors)
    }

    /// All nodes downstream of a node, sorted by identifier
    pub fn successors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.closure(node_id, Self::direct_successors)
    }

    fn closure(&self, start: &NodeId, step: fn(&Self, &NodeId) -> Vec<NodeId>) -> Vec<NodeId> {
        let mut found = BTreeSet::new();
        let mut stack = step(self, start);
        while let Some(id) = stack.pop() {
            if found.insert(id.clone()) {
                stack.extend(step(self, &id));
            }
        }
        found.into_iter().collect()
    }

    /// Whether `target` is reachable from `start` along edges
    fn reaches(&self, start: &NodeId, target: &NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start.clone()];
        while let Some(id) = stack.pop() {
            if id == *target {
                return true;
            }
            if visited.insert(id.clone()) {
                stack.extend(self.direct_successors(&id));
            }
        }
        false
    }

    /// Nodes without input ports
    pub fn sources(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_source())
            .map(|n| n.id().clone())
            .collect()
    }

    /// Nodes without output ports
    pub fn sinks(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_sink())
            .map(|n| n.id().clone())
            .collect()
    }

    /// Get nodes in topological order (for evaluation).
    ///
    /// Kahn's algorithm; among nodes whose inputs are all placed, the smallest
    /// identifier goes first, so the order is deterministic.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<&NodeId, usize> =
            self.nodes.keys().map(|id| (id, 0)).collect();
        let mut edges: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for connection in self.connections.values() {
            *in_degree.entry(&connection.to.node).or_default() += 1;
            edges
                .entry(&connection.from.node)
                .or_default()
                .push(&connection.to.node);
        }

        let mut ready: BinaryHeap<Reverse<&NodeId>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id.clone());
            for next in edges.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(*next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(*next));
                    }
                }
            }
        }
        order
    }

    /// Merge `level` into a node and propagate downstream.
    ///
    /// A direct invalidation also lifts an `Error` status so the node gets
    /// another chance on the next pass.
    pub fn invalidate(&mut self, node_id: &NodeId, level: InvalidationLevel) -> Result<()> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphError::NotFound(node_id.clone()));
        }
        self.invalidate_direct(node_id, level);
        Ok(())
    }

    pub(crate) fn invalidate_direct(&mut self, node_id: &NodeId, level: InvalidationLevel) {
        if !level.is_invalid() {
            return;
        }
        let cleared = self
            .nodes
            .get_mut(node_id)
            .is_some_and(|n| n.status().is_error() && n.set_status(ProcessorStatus::Ready));
        if cleared {
            self.emit(GraphEvent::StatusChanged {
                node: node_id.clone(),
                status: ProcessorStatus::Ready,
            });
        }
        self.propagate_invalidation(node_id, level);
    }

    fn propagate_invalidation(&mut self, origin: &NodeId, level: InvalidationLevel) {
        let mut visited = HashSet::new();
        let mut stack = vec![(origin.clone(), level)];
        let mut reached_sink = false;

        while let Some((id, level)) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let raised = node.merge_level(level);
            let merged = node.level();
            reached_sink |= node.is_sink();

            if raised {
                tracing::debug!("Invalidated {id}: {merged}");
                self.emit(GraphEvent::NodeInvalidated {
                    node: id.clone(),
                    level: merged,
                });
            }
            let downstream = level.downstream();
            stack.extend(
                self.direct_successors(&id)
                    .into_iter()
                    .map(|next| (next, downstream)),
            );
        }

        if reached_sink {
            self.request_evaluation();
        }
    }

    /// Apply invalidations queued through [`InvalidationHandle`]s.
    /// Returns how many were applied.
    pub fn apply_pending_invalidations(&mut self) -> usize {
        let pending = self.pending.take();
        let mut applied = 0;
        for (node_id, level) in pending {
            if self.nodes.contains_key(&node_id) {
                self.invalidate_direct(&node_id, level);
                applied += 1;
            } else {
                tracing::warn!("Dropping queued invalidation for unknown node {node_id}");
            }
        }
        applied
    }

    fn request_evaluation(&mut self) {
        if self.batch_depth > 0 {
            self.evaluation_suppressed = true;
        } else {
            self.emit(GraphEvent::EvaluationRequested);
        }
    }

    /// Run several mutations, emitting at most one evaluation request at the end
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 && std::mem::take(&mut self.evaluation_suppressed) {
            self.emit(GraphEvent::EvaluationRequested);
        }
        result
    }

    /// Structured description of a node for UI display
    pub fn node_info(&self, node_id: &NodeId) -> Option<NodeInfo> {
        let node = self.nodes.get(node_id)?;
        let info = |port: &Port| {
            let port_ref = PortRef::new(node_id, port.name.as_str());
            PortInfo {
                name: port.name.clone(),
                help: port.help.clone(),
                port_type: port.port_type.clone(),
                group: port.group.clone(),
                optional: port.optional,
                multi_connect: port.multi_connect,
                connections: self
                    .connections
                    .values()
                    .filter(|c| c.involves_port(&port_ref))
                    .count(),
            }
        };

        Some(NodeInfo {
            id: node_id.clone(),
            type_id: node.type_id().to_string(),
            name: node.name.clone(),
            level: node.level(),
            status: node.status().clone(),
            inputs: node.inputs().iter().map(&info).collect(),
            outputs: node.outputs().iter().map(&info).collect(),
        })
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new("Untitled")
    }
}
