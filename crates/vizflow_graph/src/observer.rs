// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed change notifications for a graph.
//!
//! Subscribers are called in subscription order. Dispatch works on a snapshot
//! of the subscriber list, so a subscriber may subscribe or unsubscribe while
//! being notified; the change takes effect from the next notification.

use crate::connection::Connection;
use crate::invalidation::{InvalidationLevel, ProcessorStatus};
use crate::link::Link;
use crate::node::NodeId;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Kind of graph change, used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphEventKind {
    /// A node was added
    NodeAdded,
    /// A node was removed
    NodeRemoved,
    /// A connection was added
    ConnectionAdded,
    /// A connection was removed
    ConnectionRemoved,
    /// A parameter link was added
    LinkAdded,
    /// A parameter link was removed
    LinkRemoved,
    /// A node's invalidation level rose
    NodeInvalidated,
    /// A node's status changed
    StatusChanged,
    /// Some sink became invalid and the graph wants an evaluation pass
    EvaluationRequested,
}

/// A graph change
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A node was added
    NodeAdded(NodeId),
    /// A node was removed
    NodeRemoved(NodeId),
    /// A connection was added
    ConnectionAdded(Connection),
    /// A connection was removed
    ConnectionRemoved(Connection),
    /// A parameter link was added
    LinkAdded(Link),
    /// A parameter link was removed
    LinkRemoved(Link),
    /// A node's invalidation level rose
    NodeInvalidated {
        /// Affected node
        node: NodeId,
        /// Level after the merge
        level: InvalidationLevel,
    },
    /// A node's status changed
    StatusChanged {
        /// Affected node
        node: NodeId,
        /// New status
        status: ProcessorStatus,
    },
    /// Some sink became invalid and the graph wants an evaluation pass
    EvaluationRequested,
}

impl GraphEvent {
    /// Subscription key of this event
    pub fn kind(&self) -> GraphEventKind {
        match self {
            Self::NodeAdded(_) => GraphEventKind::NodeAdded,
            Self::NodeRemoved(_) => GraphEventKind::NodeRemoved,
            Self::ConnectionAdded(_) => GraphEventKind::ConnectionAdded,
            Self::ConnectionRemoved(_) => GraphEventKind::ConnectionRemoved,
            Self::LinkAdded(_) => GraphEventKind::LinkAdded,
            Self::LinkRemoved(_) => GraphEventKind::LinkRemoved,
            Self::NodeInvalidated { .. } => GraphEventKind::NodeInvalidated,
            Self::StatusChanged { .. } => GraphEventKind::StatusChanged,
            Self::EvaluationRequested => GraphEventKind::EvaluationRequested,
        }
    }
}

/// Handle returned by [`GraphObservers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&GraphEvent) + Send + Sync>;

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    subscribers: IndexMap<SubscriptionId, (GraphEventKind, Subscriber)>,
}

/// Registry of subscriber closures keyed by [`GraphEventKind`].
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct GraphObservers {
    table: Arc<Mutex<SubscriberTable>>,
}

impl GraphObservers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `f` for every event of `kind`
    pub fn subscribe<F>(&self, kind: GraphEventKind, f: F) -> SubscriptionId
    where
        F: Fn(&GraphEvent) + Send + Sync + 'static,
    {
        let mut table = self.table.lock();
        let id = SubscriptionId(table.next_id);
        table.next_id += 1;
        table.subscribers.insert(id, (kind, Arc::new(f)));
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.table.lock().subscribers.shift_remove(&id).is_some()
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.table.lock().subscribers.len()
    }

    /// Whether nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to the subscribers of its kind
    pub fn notify(&self, event: &GraphEvent) {
        let kind = event.kind();
        let snapshot: Vec<Subscriber> = self
            .table
            .lock()
            .subscribers
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, f)| Arc::clone(f))
            .collect();

        for subscriber in snapshot {
            subscriber(event);
        }
    }
}

impl fmt::Debug for GraphObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphObservers")
            .field("subscriptions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn only_matching_kinds_are_notified() {
        let observers = GraphObservers::new();
        let added = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&added);
        observers.subscribe(GraphEventKind::NodeAdded, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observers.notify(&GraphEvent::NodeAdded(NodeId::new("a")));
        observers.notify(&GraphEvent::NodeRemoved(NodeId::new("a")));
        observers.notify(&GraphEvent::EvaluationRequested);
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_during_dispatch_is_safe() {
        let observers = GraphObservers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(Mutex::new(None::<SubscriptionId>));

        let handle = observers.clone();
        let own_id = Arc::clone(&slot);
        let counter = Arc::clone(&calls);
        let id = observers.subscribe(GraphEventKind::EvaluationRequested, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own_id.lock() {
                handle.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        let counter = Arc::clone(&calls);
        observers.subscribe(GraphEventKind::EvaluationRequested, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observers.notify(&GraphEvent::EvaluationRequested);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(observers.len(), 1);

        observers.notify(&GraphEvent::EvaluationRequested);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribe_twice_reports_missing() {
        let observers = GraphObservers::new();
        let id = observers.subscribe(GraphEventKind::NodeAdded, |_| {});
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        assert!(observers.is_empty());
    }
}
