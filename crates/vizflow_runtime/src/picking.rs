// SPDX-License-Identifier: MIT OR Apache-2.0
//! Picking id registry and color encoding.
//!
//! Renderers reserve a contiguous range of global picking ids, draw each
//! object with the color of its id into a picking buffer, and the readback
//! layer maps the color under the pointer back to the owning action.
//!
//! Id `0` means "nothing picked". Valid ids are `1..=PICKING_ID_MAX`.

use crate::ids::IdAllocator;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use vizflow_graph::{Event, EventKind, PickingState};

/// Largest valid picking id
pub const PICKING_ID_MAX: u32 = (1 << 24) - 2;

/// Encode a picking id as an RGB color.
///
/// The bits are interleaved across the channels starting from each channel's
/// most significant bit: index bit `3 * b + c` lands in channel `c` at bit
/// `7 - b`. Neighbouring ids therefore differ in high bits and stay
/// distinguishable after 8-bit quantization and filtering.
pub fn color_from_index(index: u32) -> [u8; 3] {
    let mut color = [0_u8; 3];
    for bit in 0..24 {
        if index & (1 << bit) != 0 {
            color[bit % 3] |= 1 << (7 - bit / 3);
        }
    }
    color
}

/// Decode a color produced by [`color_from_index`]
pub fn index_from_color(color: [u8; 3]) -> u32 {
    let mut index = 0_u32;
    for bit in 0..24 {
        if color[bit % 3] & (1 << (7 - bit / 3)) != 0 {
            index |= 1 << bit;
        }
    }
    index
}

/// Picking errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PickingError {
    /// No contiguous range of the requested size is left below the id ceiling
    #[error("Picking ids exhausted: cannot reserve {0} ids")]
    PoolExhausted(u32),

    /// The action is not registered here
    #[error("Unknown picking action")]
    UnknownAction,
}

/// Interaction on a picked object, delivered to the action's callback
#[derive(Debug, Clone, PartialEq)]
pub struct PickingEvent {
    /// Global picking id under (or latched to) the pointer
    pub global_id: u32,
    /// Index inside the owning action's range
    pub local_index: u32,
    /// Interaction phase
    pub state: PickingState,
    /// Pointer position
    pub position: [f64; 2],
    /// Pointer position of the previous sample
    pub previous_position: [f64; 2],
    /// Where the current press started, if a button is held
    pub press_position: Option<[f64; 2]>,
    /// Pressed buttons as a bitmask
    pub buttons: u8,
    used: bool,
}

impl PickingEvent {
    /// Create an unused event
    pub fn new(global_id: u32, state: PickingState, position: [f64; 2]) -> Self {
        Self {
            global_id,
            local_index: 0,
            state,
            position,
            previous_position: position,
            press_position: None,
            buttons: 0,
            used: false,
        }
    }

    /// Mark the event consumed
    pub fn mark_used(&mut self) {
        self.used = true;
    }

    /// Whether a callback consumed the event
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Graph event carrying this interaction, for upstream propagation
    pub fn to_graph_event(&self) -> Event {
        Event::new(EventKind::Picking {
            id: self.global_id,
            state: self.state,
        })
    }
}

/// Callback invoked with picking events for an action's ids
pub type PickingCallback = Arc<dyn Fn(&mut PickingEvent) + Send + Sync>;

/// Stable identity of a registered action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

/// How `resize` satisfied the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The range kept its start; previously encoded colors stay valid
    InPlace,
    /// The range moved; cached colors must be refreshed
    Relocated,
}

struct Entry {
    range: Range<u32>,
    callback: PickingCallback,
}

struct Inner {
    ids: IdAllocator,
    actions: HashMap<ActionId, Entry>,
    by_start: BTreeMap<u32, ActionId>,
    next_action: u64,
    enabled: bool,
}

impl Inner {
    fn remove(&mut self, id: ActionId) -> Option<Entry> {
        let entry = self.actions.remove(&id)?;
        if !entry.range.is_empty() {
            self.by_start.remove(&entry.range.start);
        }
        self.ids.release_range(entry.range.clone());
        Some(entry)
    }

    fn set_range(&mut self, id: ActionId, range: Range<u32>) {
        if let Some(entry) = self.actions.get_mut(&id) {
            if !entry.range.is_empty() {
                self.by_start.remove(&entry.range.start);
            }
            if !range.is_empty() {
                self.by_start.insert(range.start, id);
            }
            entry.range = range;
        }
    }

    fn find(&self, global_id: u32) -> Option<(ActionId, &Entry)> {
        let (_, &action) = self.by_start.range(..=global_id).next_back()?;
        let entry = self.actions.get(&action)?;
        entry.range.contains(&global_id).then_some((action, entry))
    }
}

/// Registry of picking actions.
///
/// Cloning yields another handle to the same registry. All state sits behind
/// one lock.
#[derive(Clone)]
pub struct PickingRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PickingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PickingRegistry {
    /// Create an empty registry with picking enabled
    pub fn new() -> Self {
        Self::with_limit(PICKING_ID_MAX + 1)
    }

    /// Create a registry whose ids stay below `limit` (capped at the 24-bit ceiling)
    pub fn with_limit(limit: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ids: IdAllocator::new(1, limit.min(PICKING_ID_MAX + 1)),
                actions: HashMap::new(),
                by_start: BTreeMap::new(),
                next_action: 0,
                enabled: true,
            })),
        }
    }

    /// Reserve `count` contiguous ids for a callback
    pub fn allocate<F>(&self, count: u32, callback: F) -> Result<PickingAction, PickingError>
    where
        F: Fn(&mut PickingEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let range = inner
            .ids
            .allocate_range(count)
            .ok_or(PickingError::PoolExhausted(count))?;
        let range = if range.is_empty() { 0..0 } else { range };

        let id = ActionId(inner.next_action);
        inner.next_action += 1;
        if !range.is_empty() {
            inner.by_start.insert(range.start, id);
        }
        inner.actions.insert(
            id,
            Entry {
                range: range.clone(),
                callback: Arc::new(callback),
            },
        );
        tracing::debug!("Picking action {id:?} reserved ids {range:?}");

        Ok(PickingAction {
            id,
            range,
            registry: Arc::clone(&self.inner),
        })
    }

    /// Change the number of ids an action owns.
    ///
    /// Shrinking frees the trailing ids. Growing extends in place when the
    /// following ids are free and relocates the whole range otherwise. On
    /// failure the action keeps its old range.
    pub fn resize(
        &self,
        action: &mut PickingAction,
        count: u32,
    ) -> Result<ResizeOutcome, PickingError> {
        if !Arc::ptr_eq(&action.registry, &self.inner) {
            return Err(PickingError::UnknownAction);
        }
        let mut inner = self.inner.lock();
        if !inner.actions.contains_key(&action.id) {
            return Err(PickingError::UnknownAction);
        }

        let old = action.range.clone();
        let len = old.end - old.start;
        let outcome = if count <= len {
            let keep = if count == 0 { 0..0 } else { old.start..old.start + count };
            inner.ids.release_range(old.start + count..old.end);
            inner.set_range(action.id, keep.clone());
            action.range = keep;
            ResizeOutcome::InPlace
        } else if !old.is_empty() && inner.ids.try_extend(&old, count - len) {
            let grown = old.start..old.start + count;
            inner.set_range(action.id, grown.clone());
            action.range = grown;
            ResizeOutcome::InPlace
        } else {
            let fresh = inner
                .ids
                .allocate_range(count)
                .ok_or(PickingError::PoolExhausted(count))?;
            inner.ids.release_range(old);
            inner.set_range(action.id, fresh.clone());
            action.range = fresh;
            ResizeOutcome::Relocated
        };

        tracing::debug!("Picking action {:?} now owns {:?} ({outcome:?})", action.id, action.range);
        Ok(outcome)
    }

    /// Free an action's ids. Dropping the action does the same.
    pub fn release(&self, action: PickingAction) {
        drop(action);
    }

    /// Map a global id to its action and local index
    pub fn lookup(&self, global_id: u32) -> Option<(ActionId, u32)> {
        let inner = self.inner.lock();
        inner
            .find(global_id)
            .map(|(action, entry)| (action, global_id - entry.range.start))
    }

    /// Map a color read back from the picking buffer to its action and local index
    pub fn lookup_color(&self, color: [u8; 3]) -> Option<(ActionId, u32)> {
        match index_from_color(color) {
            0 => None,
            id => self.lookup(id),
        }
    }

    /// Deliver an event to the action owning `event.global_id`.
    ///
    /// Fills in `local_index`. The callback runs without the registry lock
    /// held. Returns false if no action owns the id.
    pub fn dispatch(&self, event: &mut PickingEvent) -> bool {
        let callback = {
            let inner = self.inner.lock();
            match inner.find(event.global_id) {
                Some((_, entry)) => {
                    event.local_index = event.global_id - entry.range.start;
                    Arc::clone(&entry.callback)
                }
                None => return false,
            }
        };
        callback(event);
        true
    }

    /// Whether picking is globally enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Enable or disable picking globally
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().enabled = enabled;
    }

    /// Number of registered actions
    pub fn action_count(&self) -> usize {
        self.inner.lock().actions.len()
    }

    /// Number of live ids
    pub fn live_ids(&self) -> u32 {
        self.inner.lock().ids.allocated()
    }
}

impl fmt::Debug for PickingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PickingRegistry")
            .field("actions", &inner.actions.len())
            .field("live_ids", &inner.ids.allocated())
            .field("enabled", &inner.enabled)
            .finish()
    }
}

/// Owner of a contiguous range of picking ids. Dropping it frees the ids.
pub struct PickingAction {
    id: ActionId,
    range: Range<u32>,
    registry: Arc<Mutex<Inner>>,
}

impl PickingAction {
    /// Stable identity, unchanged by relocation
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Global ids owned by this action
    pub fn range(&self) -> Range<u32> {
        self.range.clone()
    }

    /// Number of ids owned
    pub fn len(&self) -> u32 {
        self.range.end - self.range.start
    }

    /// Whether the action owns no ids
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Global id of a local index
    pub fn global_id(&self, local: u32) -> Option<u32> {
        (local < self.len()).then(|| self.range.start + local)
    }

    /// Picking color of a local index
    pub fn color(&self, local: u32) -> Option<[u8; 3]> {
        self.global_id(local).map(color_from_index)
    }
}

impl fmt::Debug for PickingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickingAction")
            .field("id", &self.id)
            .field("range", &self.range)
            .finish()
    }
}

impl Drop for PickingAction {
    fn drop(&mut self) {
        if self.registry.lock().remove(self.id).is_some() {
            tracing::debug!("Picking action {:?} released {:?}", self.id, self.range);
        }
    }
}
