// SPDX-License-Identifier: MIT OR Apache-2.0
//! vizflow demo runner
//!
//! Loads the engine configuration, sets up logging and runs a small
//! visualization network for a few frames:
//! - Evaluation passes driven by evaluation requests
//! - Threshold work offloaded to the worker pool and handed back through the
//!   main-thread queue
//! - Pointer sweeps over the canvas picking buffer, routed as picking events
//! - A wheel event bubbling up to the volume source
//!
//! A JSON status report goes to stdout; logs go to stderr.

mod config;
mod demo;

use clap::Parser;
use config::{ConfigError, EngineConfig};
use demo::DemoContext;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vizflow_graph::{
    Event, EventKind, Graph, GraphDescription, GraphError, GraphEvent, GraphEventKind,
    InvalidationLevel, NodeId, NodeInfo, ParamRef, ParamValue,
};
use vizflow_runtime::{
    MainThreadQueue, PickingController, PickingRegistry, PoolError, WorkerPool,
};

/// Evaluation passes allowed before a frame is considered unsettled
const MAX_SETTLE_PASSES: usize = 16;

/// Iso value the run switches to after the first frame
const TIGHT_ISO: f64 = 0.25;

/// Top-level errors
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Failed to write report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run a sample visualization network and print a JSON report
#[derive(Debug, Default, Parser)]
#[command(name = "vizflow", about = "vizflow demo runner")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $VIZFLOW_CONFIG, then ./vizflow.ron)
    config: Option<PathBuf>,

    /// Write the final graph description to this file
    #[arg(long)]
    save_graph: Option<PathBuf>,

    /// Write the effective config to this file
    #[arg(long)]
    write_config: Option<PathBuf>,
}

/// Summary printed after the run
#[derive(Debug, Serialize)]
struct RunReport {
    graph: String,
    frames: u32,
    worker_threads: usize,
    evaluations: usize,
    process_calls: usize,
    picking_events: usize,
    picks_started: usize,
    live_picking_ids: u32,
    description_round_trip: bool,
    nodes: Vec<NodeInfo>,
}

#[derive(Debug, Default)]
struct RunStats {
    evaluations: usize,
    process_calls: usize,
    picking_events: usize,
}

fn main() {
    let cli = Cli::parse();

    let loaded = EngineConfig::discover(cli.config.as_deref());
    let log_filter = loaded
        .as_ref()
        .map_or_else(|_| EngineConfig::default().log_filter, |(c, _)| c.log_filter.clone());
    init_logging(&log_filter);

    let config = match loaded {
        Ok((config, Some(path))) => {
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        Ok((config, None)) => {
            tracing::info!("No config file found, using defaults");
            config
        }
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting vizflow v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&config, &cli) {
        tracing::error!("vizflow failed: {e}");
        std::process::exit(1);
    }
}

fn init_logging(fallback: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(config: &EngineConfig, cli: &Cli) -> Result<(), AppError> {
    if let Some(path) = &cli.write_config {
        config.save(path)?;
        tracing::info!("Wrote config to {}", path.display());
    }

    let pool = Arc::new(WorkerPool::new(config.worker_threads)?);
    let queue = MainThreadQueue::new();
    let picking = PickingRegistry::new();
    picking.set_enabled(config.picking_enabled);

    let mut graph = Graph::new("demo").with_revisit_policy(config.event_revisit);
    let requested = Arc::new(AtomicBool::new(false));
    {
        let requested = Arc::clone(&requested);
        graph
            .observers()
            .subscribe(GraphEventKind::EvaluationRequested, move |_| {
                requested.store(true, Ordering::SeqCst);
            });
    }
    graph
        .observers()
        .subscribe(GraphEventKind::StatusChanged, |event| {
            if let GraphEvent::StatusChanged { node, status } = event {
                tracing::info!("Node {node} status: {status:?}");
            }
        });

    let demo = DemoContext::new(
        Arc::clone(&pool),
        queue.clone(),
        picking.clone(),
        graph.invalidation_handle(),
    );
    let registry = demo::node_registry(&demo);
    demo::build_network(&mut graph, &registry)?;

    let volume = NodeId::new(demo::VOLUME);
    let canvas = NodeId::new(demo::CANVAS);
    let mut controller = PickingController::new(picking.clone());
    let mut stats = RunStats::default();

    for frame in 0..config.frames {
        if frame > 0 {
            graph.invalidate(&volume, InvalidationLevel::InvalidOutput)?;
        }
        if frame == 1 {
            let iso = ParamRef::new(demo::THRESHOLD, "iso");
            let changed = graph.set_parameter(&iso, ParamValue::Float(TIGHT_ISO))?;
            tracing::info!("Set {iso} to {TIGHT_ISO} ({changed} parameters changed)");
        }
        settle(&mut graph, &demo, &requested, &mut stats)?;

        // Odd frames drag across the canvas instead of hovering.
        let buttons = u8::from(frame % 2 == 1);
        let buffer = demo.buffer.lock().clone();
        for sample in buffer.sweep(buffer.size / 2, buttons) {
            for picked in controller.handle(&sample) {
                stats.picking_events += 1;
                let mut event = picked.to_graph_event();
                graph.propagate_from_node(&mut event, &canvas)?;
            }
        }

        if frame == 0 {
            let mut wheel = Event::new(EventKind::Wheel { delta: [0.0, 1.0] });
            graph.propagate_from_node(&mut wheel, &canvas)?;
            tracing::debug!("Wheel event visited {:?}", wheel.visited());
        }
    }
    settle(&mut graph, &demo, &requested, &mut stats)?;

    let description = graph.describe();
    let text = description.to_ron()?;
    if let Some(path) = &cli.save_graph {
        std::fs::write(path, &text).map_err(|source| AppError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::info!("Saved graph description to {}", path.display());
    }
    let reloaded = Graph::from_description(&GraphDescription::from_ron(&text)?, &registry)?;

    let report = RunReport {
        graph: graph.name.clone(),
        frames: config.frames,
        worker_threads: pool.size(),
        evaluations: stats.evaluations,
        process_calls: stats.process_calls,
        picking_events: stats.picking_events,
        picks_started: demo.picks.load(Ordering::Relaxed),
        live_picking_ids: picking.live_ids(),
        description_round_trip: reloaded.describe() == description,
        nodes: graph
            .node_ids()
            .filter_map(|id| graph.node_info(id))
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Evaluate until no evaluation is requested and no background work is
/// waiting to be handed back
fn settle(
    graph: &mut Graph,
    demo: &DemoContext,
    requested: &AtomicBool,
    stats: &mut RunStats,
) -> Result<(), AppError> {
    for _ in 0..MAX_SETTLE_PASSES {
        let pending = graph.invalidation_handle().pending();
        if !requested.swap(false, Ordering::SeqCst) && pending == 0 {
            return Ok(());
        }

        let report = graph.evaluate()?;
        stats.evaluations += 1;
        stats.process_calls += report.process_calls();
        for node in &report.errored {
            tracing::warn!("Node {node} failed this pass");
        }

        demo.pool.wait_idle();
        demo.queue.drain(graph);
    }
    tracing::warn!("Graph did not settle after {MAX_SETTLE_PASSES} passes");
    Ok(())
}
