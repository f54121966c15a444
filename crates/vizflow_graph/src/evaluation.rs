// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph evaluation and execution.
//!
//! One [`Graph::evaluate`] pass visits nodes in topological order, refreshes
//! each node's readiness from its producers and calls `process()` on every
//! ready node whose level is above `Valid`. Failures are captured per node.

use crate::graph::{Graph, GraphError, Result};
use crate::invalidation::{InvalidationLevel, ProcessorStatus};
use crate::node::NodeId;
use crate::observer::GraphEvent;
use crate::port::{PortData, PortRef};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error returned by [`Processor::process`](crate::node::Processor::process)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// Missing required input
    #[error("Missing input on port '{0}'")]
    MissingInput(String),

    /// Input holds a different type than requested
    #[error("Input '{port}' holds {found}, expected {expected}")]
    InputType {
        /// Port name
        port: String,
        /// Requested type
        expected: &'static str,
        /// Stored type
        found: &'static str,
    },

    /// No output port with that name
    #[error("No output port named '{0}'")]
    UnknownOutput(String),

    /// No parameter with that name
    #[error("No parameter named '{0}'")]
    UnknownParameter(String),

    /// Custom error
    #[error("{0}")]
    Failed(String),
}

/// What a processor sees during `process()`.
///
/// Inputs are snapshots of the connected producers' outputs taken before the
/// call. Outputs and invalidation requests are staged and applied by the
/// graph once `process()` succeeds.
pub struct ProcessContext<'a> {
    node: &'a NodeId,
    level: InvalidationLevel,
    inputs: HashMap<String, Vec<PortData>>,
    outputs: Vec<String>,
    staged: Vec<(String, Option<PortData>)>,
    invalidations: Vec<(NodeId, InvalidationLevel)>,
}

impl<'a> ProcessContext<'a> {
    /// Build a context by hand, for driving a processor outside a graph
    pub fn new(
        node: &'a NodeId,
        level: InvalidationLevel,
        inputs: HashMap<String, Vec<PortData>>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            node,
            level,
            inputs,
            outputs,
            staged: Vec::new(),
            invalidations: Vec::new(),
        }
    }

    /// Identifier of the node being processed
    pub fn node_id(&self) -> &NodeId {
        self.node
    }

    /// Invalidation level that triggered this call
    pub fn level(&self) -> InvalidationLevel {
        self.level
    }

    /// Whether an input port currently delivers data
    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.get(port).is_some_and(|data| !data.is_empty())
    }

    /// Whether the node declares an output port with this name
    pub fn has_output(&self, port: &str) -> bool {
        self.outputs.iter().any(|name| name == port)
    }

    /// First value delivered to an input port
    pub fn input<T: Any + Send + Sync>(&self, port: &str) -> std::result::Result<Arc<T>, ProcessError> {
        let data = self
            .inputs
            .get(port)
            .and_then(|data| data.first())
            .ok_or_else(|| ProcessError::MissingInput(port.to_string()))?;
        downcast(port, data)
    }

    /// Every value delivered to a (multi) input port, in connection order
    pub fn inputs<T: Any + Send + Sync>(
        &self,
        port: &str,
    ) -> std::result::Result<Vec<Arc<T>>, ProcessError> {
        self.inputs
            .get(port)
            .map(|data| data.iter().map(|d| downcast(port, d)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Publish a value on an output port
    pub fn set_output<T: Any + Send + Sync>(
        &mut self,
        port: &str,
        value: T,
    ) -> std::result::Result<(), ProcessError> {
        self.set_output_data(port, Some(PortData::new(value)))
    }

    /// Publish (or clear, with `None`) raw data on an output port
    pub fn set_output_data(
        &mut self,
        port: &str,
        data: Option<PortData>,
    ) -> std::result::Result<(), ProcessError> {
        if !self.has_output(port) {
            return Err(ProcessError::UnknownOutput(port.to_string()));
        }
        self.staged.push((port.to_string(), data));
        Ok(())
    }

    /// Ask the graph to invalidate a node once this call returns.
    ///
    /// Nodes later in the current pass pick the change up immediately; the
    /// node itself and nodes already visited are handled on the next pass.
    pub fn invalidate(&mut self, node: impl Into<NodeId>, level: InvalidationLevel) {
        self.invalidations.push((node.into(), level));
    }

    /// Staged outputs, in the order they were set
    pub fn staged_outputs(&self) -> &[(String, Option<PortData>)] {
        &self.staged
    }
}

fn downcast<T: Any + Send + Sync>(
    port: &str,
    data: &PortData,
) -> std::result::Result<Arc<T>, ProcessError> {
    data.downcast::<T>().ok_or_else(|| ProcessError::InputType {
        port: port.to_string(),
        expected: std::any::type_name::<T>(),
        found: data.type_name(),
    })
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    /// Nodes whose `process()` succeeded, in call order
    pub processed: Vec<NodeId>,
    /// Invalid nodes held back because an input was not ready
    pub not_ready: Vec<NodeId>,
    /// Nodes whose `process()` failed during this pass
    pub errored: Vec<NodeId>,
    /// Nodes skipped because they were already in the error state
    pub skipped: Vec<NodeId>,
}

impl EvaluationReport {
    /// Number of `process()` calls made, successful or not
    pub fn process_calls(&self) -> usize {
        self.processed.len() + self.errored.len()
    }

    /// Whether the pass did no work at all
    pub fn is_idle(&self) -> bool {
        self.process_calls() == 0
    }
}

/// Single-writer token guarding `evaluate()`.
///
/// Graphs sharing a token cannot evaluate inside one another.
#[derive(Debug, Clone, Default)]
pub struct SchedulerToken {
    busy: Arc<AtomicBool>,
}

impl SchedulerToken {
    /// Create a fresh token
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an evaluation holding this token is running
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Option<SchedulerGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SchedulerGuard { token: self })
    }
}

struct SchedulerGuard<'a> {
    token: &'a SchedulerToken,
}

impl Drop for SchedulerGuard<'_> {
    fn drop(&mut self) {
        self.token.busy.store(false, Ordering::Release);
    }
}

/// Cloneable, thread-safe queue of invalidations for a graph.
///
/// External callbacks and worker threads push here; the owning thread applies
/// the queue at the start of `evaluate()` or through
/// [`Graph::apply_pending_invalidations`].
#[derive(Debug, Clone, Default)]
pub struct InvalidationHandle {
    queue: Arc<Mutex<Vec<(NodeId, InvalidationLevel)>>>,
}

impl InvalidationHandle {
    /// Queue an invalidation
    pub fn invalidate(&self, node: impl Into<NodeId>, level: InvalidationLevel) {
        self.queue.lock().push((node.into(), level));
    }

    /// Number of queued invalidations
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn take(&self) -> Vec<(NodeId, InvalidationLevel)> {
        std::mem::take(&mut *self.queue.lock())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "processor panicked".to_string()
    }
}

impl Graph {
    /// Run one evaluation pass.
    ///
    /// Fails only with [`GraphError::Reentrancy`] when another evaluation
    /// holding the same scheduler token is in progress.
    pub fn evaluate(&mut self) -> Result<EvaluationReport> {
        let token = self.scheduler.clone();
        let _guard = token.acquire().ok_or(GraphError::Reentrancy)?;

        self.apply_pending_invalidations();
        let order = self.topological_order();
        let position: HashMap<NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();

        let mut report = EvaluationReport::default();
        let mut deferred = Vec::new();

        for (index, id) in order.iter().enumerate() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if node.status().is_error() {
                report.skipped.push(id.clone());
                continue;
            }

            let status = self.readiness(node);
            let ready = status.is_ready();
            self.update_status(id, status);
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if !node.level().is_invalid() {
                continue;
            }
            if !ready {
                report.not_ready.push(id.clone());
                continue;
            }

            let inputs = self.gather_inputs(id);
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            let outputs = node.outputs().iter().map(|p| p.name.clone()).collect();
            let mut ctx = ProcessContext::new(id, node.level(), inputs, outputs);
            let processor = node.processor_mut();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&mut ctx)));

            let ProcessContext {
                staged,
                invalidations,
                ..
            } = ctx;
            match outcome {
                Ok(Ok(())) => {
                    for (port, data) in staged {
                        if let Some(port) = node.output_mut(&port) {
                            port.set_data(data);
                        }
                    }
                    node.set_valid();
                    tracing::debug!("Processed {id}");
                    report.processed.push(id.clone());
                }
                Ok(Err(err)) => self.fail(id, err.to_string(), &mut report),
                Err(payload) => {
                    let message = format!("panic: {}", panic_message(payload.as_ref()));
                    self.fail(id, message, &mut report);
                }
            }

            for (target, level) in invalidations {
                match position.get(&target) {
                    Some(&later) if later > index => self.invalidate_direct(&target, level),
                    Some(_) => deferred.push((target, level)),
                    None => {
                        tracing::warn!("{id} invalidated unknown node {target}");
                    }
                }
            }
        }

        for (target, level) in deferred {
            self.invalidate_direct(&target, level);
        }

        Ok(report)
    }

    fn update_status(&mut self, id: &NodeId, status: ProcessorStatus) {
        let changed = self
            .nodes
            .get_mut(id)
            .is_some_and(|n| n.set_status(status.clone()));
        if changed {
            tracing::debug!("{id} is now {status}");
            self.observers().notify(&GraphEvent::StatusChanged {
                node: id.clone(),
                status,
            });
        }
    }

    fn fail(&mut self, id: &NodeId, message: String, report: &mut EvaluationReport) {
        tracing::warn!("Processor {id} failed: {message}");
        if let Some(node) = self.nodes.get_mut(id) {
            node.merge_level(InvalidationLevel::Error);
        }
        self.update_status(id, ProcessorStatus::Error(message));
        report.errored.push(id.clone());
    }

    fn gather_inputs(&self, id: &NodeId) -> HashMap<String, Vec<PortData>> {
        let Some(node) = self.nodes.get(id) else {
            return HashMap::new();
        };
        node.inputs()
            .iter()
            .map(|port| {
                let port_ref = PortRef::new(id, port.name.as_str());
                let data = self
                    .connections_to(&port_ref)
                    .filter_map(|c| {
                        self.nodes
                            .get(&c.from.node)
                            .and_then(|n| n.output(&c.from.port))
                            .and_then(|p| p.data().cloned())
                    })
                    .collect();
                (port.name.clone(), data)
            })
            .collect()
    }
}
