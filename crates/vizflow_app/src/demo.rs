// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sample visualization network
//!
//! `volume` (generated sphere) -> `threshold` (iso-surface mask, computed on
//! the worker pool) -> `canvas` (draws the mask into a picking buffer).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vizflow_graph::{
    Event, EventKind, Graph, InvalidationHandle, InvalidationLevel, NodeCategory, NodeId,
    NodeRegistry, NodeType, ParamValue, PickingState, Port, PortData, PortRef, PortType,
    ProcessContext, ProcessError, Processor,
};
use vizflow_runtime::{MainThreadQueue, PickingAction, PickingRegistry, PointerSample, WorkerPool};

/// Edge length of the generated volume and of the canvas
pub const GRID: usize = 16;

/// Identifier of the source node
pub const VOLUME: &str = "volume";
/// Identifier of the filter node
pub const THRESHOLD: &str = "threshold";
/// Identifier of the canvas node
pub const CANVAS: &str = "canvas";

/// Scalar volume, x fastest
#[derive(Debug, Clone)]
pub struct Volume {
    /// Edge length
    pub size: usize,
    /// Source generation that produced it
    pub generation: u64,
    /// Voxel values
    pub voxels: Vec<f32>,
}

impl Volume {
    /// Signed distance style sphere: positive inside, 1.0 at the center
    pub fn sphere(size: usize, radius: f32, generation: u64) -> Self {
        let center = (size as f32 - 1.0) / 2.0;
        let mut voxels = Vec::with_capacity(size * size * size);
        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    let d = [x, y, z]
                        .iter()
                        .map(|&c| (c as f32 - center).powi(2))
                        .sum::<f32>()
                        .sqrt();
                    voxels.push((radius - d) / radius);
                }
            }
        }
        Self {
            size,
            generation,
            voxels,
        }
    }
}

/// Maximum projection of a thresholded volume along z
#[derive(Debug, Clone)]
pub struct Mask {
    /// Edge length
    pub size: usize,
    /// Generation of the volume it was computed from
    pub generation: u64,
    /// Iso value it was computed with
    pub iso: f32,
    /// Lit pixels, x fastest
    pub pixels: Vec<bool>,
}

impl Mask {
    /// Project every column whose maximum exceeds `iso`
    pub fn project(volume: &Volume, iso: f32) -> Self {
        let size = volume.size;
        let mut pixels = vec![false; size * size];
        for (i, value) in volume.voxels.iter().enumerate() {
            if *value > iso {
                pixels[i % (size * size)] = true;
            }
        }
        Self {
            size,
            generation: volume.generation,
            iso,
            pixels,
        }
    }

    /// Indices of the lit pixels
    pub fn lit(&self) -> Vec<usize> {
        self.pixels
            .iter()
            .enumerate()
            .filter_map(|(i, lit)| lit.then_some(i))
            .collect()
    }
}

/// RGBA picking texels the canvas renders, read back by the pointer loop
#[derive(Debug, Clone, Default)]
pub struct PickingBuffer {
    /// Edge length
    pub size: usize,
    /// Texels, x fastest; zero alpha where nothing is pickable
    pub texels: Vec<[u8; 4]>,
}

impl PickingBuffer {
    /// Texel under a pixel position, transparent outside the buffer
    pub fn texel(&self, x: usize, y: usize) -> [u8; 4] {
        if x < self.size && y < self.size {
            self.texels[y * self.size + x]
        } else {
            [0; 4]
        }
    }

    /// Pointer samples sweeping row `y` left to right, ending outside the
    /// buffer with the buttons released
    pub fn sweep(&self, y: usize, buttons: u8) -> Vec<PointerSample> {
        let mut samples: Vec<PointerSample> = (0..self.size)
            .map(|x| PointerSample {
                position: [x as f64, y as f64],
                buttons,
                color: self.texel(x, y),
            })
            .collect();
        samples.push(PointerSample {
            position: [self.size as f64, y as f64],
            buttons: 0,
            color: [0; 4],
        });
        samples
    }
}

/// Services the demo processors share
#[derive(Clone)]
pub struct DemoContext {
    /// Background workers
    pub pool: Arc<WorkerPool>,
    /// Hand-back queue drained by the graph's thread
    pub queue: MainThreadQueue<Graph>,
    /// Picking ids for the canvas
    pub picking: PickingRegistry,
    /// Invalidations raised by event handlers
    pub invalidations: InvalidationHandle,
    /// Canvas picking buffer
    pub buffer: Arc<Mutex<PickingBuffer>>,
    /// Picking interactions that started on a canvas pixel
    pub picks: Arc<AtomicUsize>,
}

impl DemoContext {
    /// Bundle the shared services
    pub fn new(
        pool: Arc<WorkerPool>,
        queue: MainThreadQueue<Graph>,
        picking: PickingRegistry,
        invalidations: InvalidationHandle,
    ) -> Self {
        Self {
            pool,
            queue,
            picking,
            invalidations,
            buffer: Arc::default(),
            picks: Arc::default(),
        }
    }
}

struct VolumeSource {
    radius: f32,
    generation: u64,
    id: Option<NodeId>,
    invalidations: InvalidationHandle,
}

impl Processor for VolumeSource {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        self.id = Some(ctx.node_id().clone());
        self.generation += 1;
        ctx.set_output("volume", Volume::sphere(GRID, self.radius, self.generation))
    }

    fn handle_event(&mut self, event: &mut Event) {
        let EventKind::Wheel { delta } = event.kind() else {
            return;
        };
        self.radius = (self.radius + delta[1] as f32).clamp(1.0, GRID as f32 / 2.0);
        event.mark_used();
        if let Some(id) = &self.id {
            self.invalidations
                .invalidate(id.clone(), InvalidationLevel::InvalidOutput);
        }
    }

    fn serialize_state(&self) -> Option<String> {
        Some(format!("radius={}", self.radius))
    }

    fn deserialize_state(&mut self, state: &str) -> Result<(), ProcessError> {
        self.radius = state
            .strip_prefix("radius=")
            .and_then(|r| r.parse().ok())
            .ok_or_else(|| ProcessError::Failed(format!("Invalid volume source state '{state}'")))?;
        Ok(())
    }

    fn parameter(&self, name: &str) -> Option<ParamValue> {
        (name == "radius").then(|| ParamValue::Float(f64::from(self.radius)))
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), ProcessError> {
        match (name, value) {
            ("radius", ParamValue::Float(r)) => {
                self.radius = (*r as f32).clamp(1.0, GRID as f32 / 2.0);
                Ok(())
            }
            _ => Err(ProcessError::UnknownParameter(name.to_string())),
        }
    }
}

struct Threshold {
    iso: f32,
    pool: Arc<WorkerPool>,
    queue: MainThreadQueue<Graph>,
    slot: Arc<Mutex<Option<Arc<Mask>>>>,
    requested: Option<(u64, f32)>,
}

impl Threshold {
    fn ready(&self, generation: u64) -> Option<Arc<Mask>> {
        self.slot
            .lock()
            .as_ref()
            .filter(|mask| mask.generation == generation && mask.iso.to_bits() == self.iso.to_bits())
            .cloned()
    }
}

impl Processor for Threshold {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let volume = ctx.input::<Volume>("volume")?;

        let key = (volume.generation, self.iso);
        if self.requested != Some(key) && self.ready(volume.generation).is_none() {
            self.requested = Some(key);
            let slot = Arc::clone(&self.slot);
            let queue = self.queue.clone();
            let node = ctx.node_id().clone();
            let iso = self.iso;
            let input = Arc::clone(&volume);
            self.pool.enqueue(move || {
                *slot.lock() = Some(Arc::new(Mask::project(&input, iso)));
                queue.push(move |graph: &mut Graph| {
                    if let Err(e) = graph.invalidate(&node, InvalidationLevel::InvalidOutput) {
                        tracing::warn!("Dropping mask for {node}: {e}");
                    }
                });
            });
        }

        // Until the worker reports back the canvas sees no mask.
        let mask = self.ready(volume.generation).map(PortData::from_arc);
        ctx.set_output_data("mask", mask)
    }

    fn serialize_state(&self) -> Option<String> {
        Some(format!("iso={}", self.iso))
    }

    fn deserialize_state(&mut self, state: &str) -> Result<(), ProcessError> {
        self.iso = state
            .strip_prefix("iso=")
            .and_then(|r| r.parse().ok())
            .ok_or_else(|| ProcessError::Failed(format!("Invalid threshold state '{state}'")))?;
        Ok(())
    }

    fn parameter(&self, name: &str) -> Option<ParamValue> {
        (name == "iso").then(|| ParamValue::Float(f64::from(self.iso)))
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), ProcessError> {
        match (name, value) {
            ("iso", ParamValue::Float(iso)) if (-1.0..=1.0).contains(iso) => {
                self.iso = *iso as f32;
                Ok(())
            }
            ("iso", _) => Err(ProcessError::Failed(format!("iso {value:?} outside -1..=1"))),
            _ => Err(ProcessError::UnknownParameter(name.to_string())),
        }
    }
}

struct Canvas {
    picking: PickingRegistry,
    action: Option<PickingAction>,
    buffer: Arc<Mutex<PickingBuffer>>,
    picks: Arc<AtomicUsize>,
}

impl Processor for Canvas {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let masks = ctx.inputs::<Mask>("image")?;
        let Some(mask) = masks.first() else {
            *self.buffer.lock() = PickingBuffer::default();
            return Ok(());
        };

        let lit = mask.lit();
        let count = lit.len() as u32;
        let picking_failed = |e: vizflow_runtime::PickingError| ProcessError::Failed(e.to_string());
        match self.action.as_mut() {
            Some(action) => {
                self.picking.resize(action, count).map_err(picking_failed)?;
            }
            None => {
                let picks = Arc::clone(&self.picks);
                let action = self
                    .picking
                    .allocate(count, move |event| {
                        if event.state == PickingState::Started {
                            picks.fetch_add(1, Ordering::Relaxed);
                        }
                        event.mark_used();
                    })
                    .map_err(picking_failed)?;
                self.action = Some(action);
            }
        }
        let Some(action) = self.action.as_ref() else {
            return Ok(());
        };

        let mut buffer = PickingBuffer {
            size: mask.size,
            texels: vec![[0; 4]; mask.size * mask.size],
        };
        for (local, &pixel) in lit.iter().enumerate() {
            if let Some([r, g, b]) = action.color(local as u32) {
                buffer.texels[pixel] = [r, g, b, 255];
            }
        }
        tracing::debug!("Canvas drew {} pickable pixels", lit.len());
        *self.buffer.lock() = buffer;
        Ok(())
    }
}

/// Node types of the demo network
pub fn node_registry(demo: &DemoContext) -> NodeRegistry {
    let mut registry = NodeRegistry::new();

    let invalidations = demo.invalidations.clone();
    registry.register(
        NodeType::new("VolumeSource", "Volume Source", NodeCategory::Source)
            .with_description("Generates a sphere volume")
            .with_output(Port::output("volume", PortType::Volume)),
        move || {
            Box::new(VolumeSource {
                radius: 5.0,
                generation: 0,
                id: None,
                invalidations: invalidations.clone(),
            })
        },
    );

    let (pool, queue) = (Arc::clone(&demo.pool), demo.queue.clone());
    registry.register(
        NodeType::new("Threshold", "Threshold", NodeCategory::Filter)
            .with_description("Projects voxels above an iso value")
            .with_input(Port::input("volume", PortType::Volume))
            .with_output(Port::output("mask", PortType::Image)),
        move || {
            Box::new(Threshold {
                iso: 0.0,
                pool: Arc::clone(&pool),
                queue: queue.clone(),
                slot: Arc::default(),
                requested: None,
            })
        },
    );

    let (picking, buffer, picks) = (
        demo.picking.clone(),
        Arc::clone(&demo.buffer),
        Arc::clone(&demo.picks),
    );
    registry.register(
        NodeType::new("Canvas", "Canvas", NodeCategory::Sink)
            .with_description("Draws a mask into a picking buffer")
            .with_input(Port::input("image", PortType::Image)),
        move || {
            Box::new(Canvas {
                picking: picking.clone(),
                action: None,
                buffer: Arc::clone(&buffer),
                picks: Arc::clone(&picks),
            })
        },
    );

    registry
}

/// Add the demo nodes to `graph` and wire them up
pub fn build_network(graph: &mut Graph, registry: &NodeRegistry) -> vizflow_graph::Result<()> {
    graph.batch(|graph| {
        for (id, type_id) in [(VOLUME, "VolumeSource"), (THRESHOLD, "Threshold"), (CANVAS, "Canvas")] {
            let node = registry
                .create_node(type_id, id)
                .ok_or_else(|| vizflow_graph::GraphError::UnknownNodeType(type_id.to_string()))?;
            graph.add_node(node)?;
        }
        graph.connect(PortRef::new(VOLUME, "volume"), PortRef::new(THRESHOLD, "volume"))?;
        graph.connect(PortRef::new(THRESHOLD, "mask"), PortRef::new(CANVAS, "image"))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(workers: usize) -> (DemoContext, Graph) {
        let graph = Graph::new("demo");
        let demo = DemoContext::new(
            Arc::new(WorkerPool::new(workers).unwrap()),
            MainThreadQueue::new(),
            PickingRegistry::new(),
            graph.invalidation_handle(),
        );
        (demo, graph)
    }

    fn settle(demo: &DemoContext, graph: &mut Graph) -> usize {
        let mut calls = 0;
        for _ in 0..8 {
            let report = graph.evaluate().unwrap();
            calls += report.process_calls();
            demo.pool.wait_idle();
            if demo.queue.drain(graph) == 0 && report.is_idle() {
                break;
            }
        }
        calls
    }

    #[test]
    fn sphere_projection_is_a_disc() {
        let mask = Mask::project(&Volume::sphere(GRID, 5.0, 1), 0.0);
        let center = GRID / 2 * GRID + GRID / 2;
        assert!(mask.pixels[center]);
        assert!(!mask.pixels[0]);
        assert!(mask.lit().len() > 20);
    }

    #[test]
    fn network_draws_pickable_pixels_with_worker_threads() {
        let (demo, mut graph) = context(2);
        let registry = node_registry(&demo);
        build_network(&mut graph, &registry).unwrap();

        settle(&demo, &mut graph);
        let buffer = demo.buffer.lock().clone();
        let lit = buffer.texels.iter().filter(|t| t[3] == 255).count();
        assert!(lit > 0);
        assert_eq!(demo.picking.live_ids(), lit as u32);
    }

    #[test]
    fn network_settles_without_worker_threads() {
        let (demo, mut graph) = context(0);
        let registry = node_registry(&demo);
        build_network(&mut graph, &registry).unwrap();

        assert!(settle(&demo, &mut graph) >= 3);
        assert!(graph.evaluate().unwrap().is_idle());
        assert!(demo.picking.live_ids() > 0);
    }

    #[test]
    fn wheel_events_reach_the_source() {
        let (demo, mut graph) = context(1);
        let registry = node_registry(&demo);
        build_network(&mut graph, &registry).unwrap();
        settle(&demo, &mut graph);
        let before = demo.picking.live_ids();

        let mut wheel = Event::new(EventKind::Wheel { delta: [0.0, 2.0] });
        graph
            .propagate_from_node(&mut wheel, &NodeId::new(CANVAS))
            .unwrap();
        assert!(wheel.is_used());
        assert_eq!(graph.invalidation_handle().pending(), 1);

        settle(&demo, &mut graph);
        assert_eq!(
            graph.node(&NodeId::new(VOLUME)).unwrap().level(),
            InvalidationLevel::Valid
        );
        assert!(demo.picking.live_ids() > before);
    }

    #[test]
    fn raising_iso_recomputes_a_smaller_mask() {
        let (demo, mut graph) = context(2);
        let registry = node_registry(&demo);
        build_network(&mut graph, &registry).unwrap();
        settle(&demo, &mut graph);
        let before = demo.picking.live_ids();

        let iso = vizflow_graph::ParamRef::new(THRESHOLD, "iso");
        assert_eq!(graph.set_parameter(&iso, ParamValue::Float(0.5)).unwrap(), 1);
        assert!(graph.set_parameter(&iso, ParamValue::Float(3.0)).is_err());
        settle(&demo, &mut graph);

        let after = demo.picking.live_ids();
        assert!(after > 0 && after < before);
        assert_eq!(graph.parameter(&iso).unwrap(), ParamValue::Float(0.5));
    }

    #[test]
    fn state_survives_a_description_round_trip() {
        let (demo, mut graph) = context(0);
        let registry = node_registry(&demo);
        build_network(&mut graph, &registry).unwrap();

        let description = graph.describe();
        assert_eq!(description.nodes[0].state.as_deref(), Some("radius=5"));
        let rebuilt = Graph::from_description(&description, &registry).unwrap();
        assert_eq!(rebuilt.describe(), description);
    }
}
