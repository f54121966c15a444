// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared processors for unit tests.

use crate::evaluation::{ProcessContext, ProcessError};
use crate::link::ParamValue;
use crate::node::{Node, Processor};
use crate::port::{Port, PortType};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts `process()` calls and publishes `1 + sum(inputs)` on `out`.
/// Its state doubles as the `label` parameter.
pub(crate) struct Probe {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    state: String,
}

impl Probe {
    pub(crate) fn new(calls: &Arc<AtomicUsize>) -> Self {
        Self {
            calls: Arc::clone(calls),
            fail: Arc::new(AtomicBool::new(false)),
            state: String::new(),
        }
    }

    pub(crate) fn fail_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail)
    }
}

impl Processor for Probe {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProcessError::Failed("probe failure".to_string()));
        }
        let sum: i64 = ctx.inputs::<i64>("in")?.iter().map(|v| **v).sum();
        if ctx.has_output("out") {
            ctx.set_output("out", sum + 1)?;
        }
        Ok(())
    }

    fn serialize_state(&self) -> Option<String> {
        (!self.state.is_empty()).then(|| self.state.clone())
    }

    fn deserialize_state(&mut self, state: &str) -> Result<(), ProcessError> {
        self.state = state.to_string();
        Ok(())
    }

    fn parameter(&self, name: &str) -> Option<ParamValue> {
        (name == "label").then(|| ParamValue::Text(self.state.clone()))
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), ProcessError> {
        match (name, value) {
            ("label", ParamValue::Text(text)) => {
                self.state = text.clone();
                Ok(())
            }
            _ => Err(ProcessError::UnknownParameter(name.to_string())),
        }
    }
}

pub(crate) fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub(crate) fn probe(calls: &Arc<AtomicUsize>) -> Box<dyn Processor> {
    Box::new(Probe::new(calls))
}

pub(crate) fn source(id: &str, calls: &Arc<AtomicUsize>) -> Node {
    Node::new(id, "Source", probe(calls)).with_output(Port::output("out", PortType::Int))
}

pub(crate) fn filter(id: &str, calls: &Arc<AtomicUsize>) -> Node {
    Node::new(id, "Filter", probe(calls))
        .with_input(Port::input("in", PortType::Int))
        .with_output(Port::output("out", PortType::Int))
}

pub(crate) fn sink(id: &str, calls: &Arc<AtomicUsize>) -> Node {
    Node::new(id, "Sink", probe(calls)).with_input(Port::input("in", PortType::Int))
}
