//! Monotonic progress accumulator owned by one request.

use super::bus::SharedEventBus;
use super::types::{Phase, ProgressEvent};

/// First percent of the per-task span.
pub const TASK_SPAN_START: u8 = 10;
/// Last percent of the per-task span.
pub const TASK_SPAN_END: u8 = 70;

/// Collects progress events, never letting the percentage go backwards.
#[derive(Default)]
pub struct ProgressTracker {
    bus: Option<SharedEventBus>,
    events: Vec<ProgressEvent>,
    percent: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also publish every event on `bus`.
    pub fn with_bus(bus: SharedEventBus) -> Self {
        Self {
            bus: Some(bus),
            ..Self::default()
        }
    }

    /// Record a transition. `percent` is raised to the last value reported.
    pub fn emit(&mut self, source: &str, phase: Phase, percent: u8, detail: impl Into<String>) {
        self.percent = percent.min(100).max(self.percent);
        let event = ProgressEvent::new(source, phase, self.percent, detail);
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        self.events.push(event);
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<ProgressEvent> {
        self.events
    }
}

/// Percent at `fraction` (0..=1) of task `index` out of `total`.
pub fn task_percent(index: usize, total: usize, fraction: f64) -> u8 {
    let total = total.max(1) as f64;
    let span = f64::from(TASK_SPAN_END - TASK_SPAN_START) / total;
    let offset = span * (index as f64 + fraction.clamp(0.0, 1.0));
    (f64::from(TASK_SPAN_START) + offset).round().min(f64::from(TASK_SPAN_END)) as u8
}
