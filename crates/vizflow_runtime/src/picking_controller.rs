// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pointer samples to picking events.

use crate::picking::{index_from_color, PickingEvent, PickingRegistry};
use vizflow_graph::PickingState;

/// One pointer observation together with the picking buffer texel under it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerSample {
    /// Pointer position in canvas pixels
    pub position: [f64; 2],
    /// Pressed buttons as a bitmask; zero means released
    pub buttons: u8,
    /// RGBA read back from the picking buffer. Zero alpha is a miss.
    pub color: [u8; 4],
}

impl PointerSample {
    /// Global id under the pointer, `0` when nothing pickable is hit
    pub fn picked_id(&self) -> u32 {
        let [r, g, b, a] = self.color;
        if a == 0 {
            0
        } else {
            index_from_color([r, g, b])
        }
    }
}

/// Tracks hover and press state across pointer samples.
///
/// A press latches the id under the pointer: until the buttons are released,
/// every sample is routed to that id even when the pointer leaves it. Moving
/// from one id to another finishes the old interaction before starting the
/// new one.
#[derive(Debug)]
pub struct PickingController {
    registry: PickingRegistry,
    previous_id: u32,
    previous_position: Option<[f64; 2]>,
    latched: Option<(u32, [f64; 2])>,
}

impl PickingController {
    /// Create a controller dispatching into `registry`
    pub fn new(registry: PickingRegistry) -> Self {
        Self {
            registry,
            previous_id: 0,
            previous_position: None,
            latched: None,
        }
    }

    /// Registry events are dispatched to
    pub fn registry(&self) -> &PickingRegistry {
        &self.registry
    }

    /// Id currently hovered or latched, `0` for none
    pub fn current_id(&self) -> u32 {
        self.previous_id
    }

    /// Feed a pointer sample. Returns the events delivered to actions, in
    /// delivery order.
    pub fn handle(&mut self, sample: &PointerSample) -> Vec<PickingEvent> {
        if !self.registry.is_enabled() {
            return Vec::new();
        }

        if sample.buttons != 0 {
            if self.latched.is_none() {
                self.latched = Some((sample.picked_id(), sample.position));
            }
        } else {
            self.latched = None;
        }

        let current = match self.latched {
            Some((id, _)) => id,
            None => sample.picked_id(),
        };

        let mut delivered = Vec::new();
        if self.previous_id != 0 && current != self.previous_id {
            self.deliver(self.previous_id, PickingState::Finished, sample, &mut delivered);
        }
        if current != 0 {
            let state = if current == self.previous_id {
                PickingState::Updated
            } else {
                PickingState::Started
            };
            self.deliver(current, state, sample, &mut delivered);
        }

        self.previous_id = current;
        self.previous_position = Some(sample.position);
        delivered
    }

    fn deliver(
        &self,
        id: u32,
        state: PickingState,
        sample: &PointerSample,
        delivered: &mut Vec<PickingEvent>,
    ) {
        let mut event = PickingEvent::new(id, state, sample.position);
        event.previous_position = self.previous_position.unwrap_or(sample.position);
        event.press_position = self.latched.map(|(_, position)| position);
        event.buttons = sample.buttons;

        if self.registry.dispatch(&mut event) {
            delivered.push(event);
        } else {
            tracing::debug!("No picking action owns id {id}");
        }
    }
}
