// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dataflow graph engine for vizflow.
//!
//! This crate provides the execution core of a visualization network:
//! - Typed input/output ports and connection validation
//! - Cycle-free graph mutation with transactional errors
//! - Invalidation-driven, topologically ordered evaluation
//! - Upstream routing of interaction events
//! - Parameter links that keep node settings in sync
//!
//! ## Architecture
//!
//! A [`Graph`] owns [`Node`]s. Each node wraps a user-supplied [`Processor`]
//! and carries an [`InvalidationLevel`] and a [`ProcessorStatus`]. Mutations
//! raise levels and propagate them downstream; [`Graph::evaluate`] then calls
//! `process()` exactly once on every stale node that is ready.

pub mod connection;
pub mod description;
pub mod evaluation;
pub mod event;
pub mod graph;
pub mod invalidation;
pub mod link;
pub mod node;
pub mod observer;
pub mod port;

#[cfg(test)]
mod test_util;

pub use connection::{Connection, ConnectionId};
pub use description::{GraphDescription, DESCRIPTION_FORMAT_VERSION};
pub use evaluation::{
    EvaluationReport, InvalidationHandle, ProcessContext, ProcessError, SchedulerToken,
};
pub use event::{Event, EventKind, PickingState, RevisitPolicy};
pub use graph::{Graph, GraphError, Result};
pub use invalidation::{InvalidationLevel, ProcessorStatus};
pub use link::{Link, ParamRef, ParamValue};
pub use node::{Node, NodeCategory, NodeId, NodeInfo, NodeRegistry, NodeType, Processor};
pub use observer::{GraphEvent, GraphEventKind, GraphObservers, SubscriptionId};
pub use port::{Port, PortData, PortDirection, PortRef, PortType, TypeRules};
