// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime services around the vizflow graph.
//!
//! - [`IdAllocator`]: dense integer ids with range allocation and reuse
//! - [`PickingRegistry`]: picking id ranges, color encoding and callbacks
//! - [`PickingController`]: pointer samples to picking interactions
//! - [`WorkerPool`]: background threads draining a task queue
//! - [`MainThreadQueue`]: hand-back of worker results to the graph's thread

pub mod dispatch;
pub mod ids;
pub mod picking;
pub mod picking_controller;
pub mod pool;

pub use dispatch::MainThreadQueue;
pub use ids::IdAllocator;
pub use picking::{
    color_from_index, index_from_color, ActionId, PickingAction, PickingCallback, PickingError,
    PickingEvent, PickingRegistry, ResizeOutcome, PICKING_ID_MAX,
};
pub use picking_controller::{PickingController, PointerSample};
pub use pool::{PoolError, TaskHandle, WorkerPool, WorkerState};
