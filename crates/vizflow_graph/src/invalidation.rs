// SPDX-License-Identifier: MIT OR Apache-2.0
//! Invalidation levels and processor status.
//!
//! Every node carries an [`InvalidationLevel`] describing how stale it is and a
//! [`ProcessorStatus`] describing whether it may be scheduled at all.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How stale a node is.
///
/// Levels are totally ordered and merge by taking the maximum, so `Valid` is
/// the identity of [`InvalidationLevel::merge`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum InvalidationLevel {
    /// Up to date, nothing to do
    #[default]
    Valid,
    /// The node's output values must be recomputed
    InvalidOutput,
    /// The node's internal resources must be rebuilt before recomputing
    InvalidResources,
    /// The last `process()` failed; the node is re-processed once it is allowed to run again
    Error,
}

impl InvalidationLevel {
    /// Merge two levels (maximum)
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether the node needs work
    pub fn is_invalid(self) -> bool {
        self != Self::Valid
    }

    /// Level seen by downstream nodes when this level is raised on a producer.
    ///
    /// Anything above `Valid` means the producer's output changed. Resource
    /// rebuilds stay local to the producer.
    pub fn downstream(self) -> Self {
        match self {
            Self::Valid => Self::Valid,
            Self::InvalidOutput | Self::InvalidResources | Self::Error => Self::InvalidOutput,
        }
    }
}

impl fmt::Display for InvalidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "valid",
            Self::InvalidOutput => "invalid output",
            Self::InvalidResources => "invalid resources",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Whether a node may be scheduled for `process()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorStatus {
    /// All required inputs are satisfied
    #[default]
    Ready,
    /// Some required input is missing or its producer is not ready
    NotReady(String),
    /// The last `process()` failed
    Error(String),
}

impl ProcessorStatus {
    /// Only ready nodes are processed
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the node is in the error state
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Reason string for display as a status tooltip
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::NotReady(reason) | Self::Error(reason) => Some(reason),
        }
    }
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::NotReady(reason) => write!(f, "not ready: {reason}"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(InvalidationLevel::Valid < InvalidationLevel::InvalidOutput);
        assert!(InvalidationLevel::InvalidOutput < InvalidationLevel::InvalidResources);
        assert!(InvalidationLevel::InvalidResources < InvalidationLevel::Error);
    }

    #[test]
    fn merge_is_max_with_valid_identity() {
        use InvalidationLevel::*;
        for level in [Valid, InvalidOutput, InvalidResources, Error] {
            assert_eq!(Valid.merge(level), level);
            assert_eq!(level.merge(Valid), level);
            assert_eq!(level.merge(level), level);
        }
        assert_eq!(InvalidOutput.merge(InvalidResources), InvalidResources);
        assert_eq!(InvalidResources.merge(InvalidOutput), InvalidResources);
    }

    #[test]
    fn resources_do_not_leak_downstream() {
        assert_eq!(
            InvalidationLevel::InvalidResources.downstream(),
            InvalidationLevel::InvalidOutput
        );
        assert_eq!(InvalidationLevel::Valid.downstream(), InvalidationLevel::Valid);
    }

    #[test]
    fn status_reason() {
        assert_eq!(ProcessorStatus::Ready.reason(), None);
        let status = ProcessorStatus::Error("boom".to_string());
        assert!(status.is_error());
        assert_eq!(status.reason(), Some("boom"));
        assert_eq!(status.to_string(), "error: boom");
    }
}
