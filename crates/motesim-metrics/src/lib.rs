//! Metrics infrastructure for the motesim simulation controller.
//!
//! This crate provides metric label helpers and declares all metrics used
//! by the simulator as structured [`Metric`] constants, avoiding typos and
//! keeping metadata in one place. It re-exports the `metrics` crate for
//! convenience.
//!
//! # Example
//!
//! ```rust,ignore
//! use motesim_metrics::{metric_defs, MetricLabels, describe_metrics};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new("3");
//! metrics::counter!(metric_defs::MEDIUM_TX_PACKETS.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_histogram, Unit};

/// The kind of metric (counter or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "motesim.medium.tx_packets").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description of the metric.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys for this metric.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Register this metric's description with the installed recorder.
    pub fn describe(&self) {
        match self.kind {
            MetricKind::Counter => match self.unit {
                Some(unit) => describe_counter!(self.name, unit, self.description),
                None => describe_counter!(self.name, self.description),
            },
            MetricKind::Histogram => match self.unit {
                Some(unit) => describe_histogram!(self.name, unit, self.description),
                None => describe_histogram!(self.name, self.description),
            },
        }
    }
}

/// All metrics emitted by the simulator.
pub mod metric_defs {
    use super::Metric;
    use metrics::Unit;

    /// Events dispatched by the scheduler.
    pub const SCHEDULER_EVENTS: Metric = Metric::counter("motesim.scheduler.events")
        .with_description("Events dispatched by the event scheduler")
        .with_unit(Unit::Count)
        .with_labels(&["kind"]);

    /// Dispatches that raised a firmware error.
    pub const SCHEDULER_DISPATCH_ERRORS: Metric =
        Metric::counter("motesim.scheduler.dispatch_errors")
            .with_description("Event dispatches that raised a firmware error")
            .with_unit(Unit::Count)
            .with_labels(&["node"]);

    /// Packets handed to the radio medium.
    pub const MEDIUM_TX_PACKETS: Metric = Metric::counter("motesim.medium.tx_packets")
        .with_description("Packets transmitted into the radio medium")
        .with_unit(Unit::Count)
        .with_labels(&["node"]);

    /// Packets delivered intact to a receiver.
    pub const MEDIUM_DELIVERED: Metric = Metric::counter("motesim.medium.delivered")
        .with_description("Packets delivered intact to a receiver")
        .with_unit(Unit::Count)
        .with_labels(&["node"]);

    /// Packets dropped by the noise model.
    pub const MEDIUM_DROPPED: Metric = Metric::counter("motesim.medium.dropped")
        .with_description("Packets dropped in flight by the noise model")
        .with_unit(Unit::Count)
        .with_labels(&["node"]);

    /// Packets corrupted in flight.
    pub const MEDIUM_CORRUPTED: Metric = Metric::counter("motesim.medium.corrupted")
        .with_description("Packets corrupted in flight by the noise model")
        .with_unit(Unit::Count)
        .with_labels(&["node"]);

    /// Deliveries suppressed because the receiver was powered off.
    pub const MOTE_SUPPRESSED: Metric = Metric::counter("motesim.mote.suppressed")
        .with_description("Events suppressed at a powered-off mote")
        .with_unit(Unit::Count)
        .with_labels(&["node", "kind"]);

    /// Log lines routed to a subscribed channel.
    pub const LOG_LINES_ROUTED: Metric = Metric::counter("motesim.log.lines_routed")
        .with_description("Log lines captured on subscribed channels")
        .with_unit(Unit::Count)
        .with_labels(&["channel"]);

    /// Propagation delay applied to delivered packets.
    pub const MEDIUM_DELAY: Metric = Metric::histogram("motesim.medium.delay_us")
        .with_description("Sampled propagation delay of delivered packets")
        .with_unit(Unit::Microseconds);

    /// All metric declarations, for listing and registration.
    pub const ALL: &[&Metric] = &[
        &SCHEDULER_EVENTS,
        &SCHEDULER_DISPATCH_ERRORS,
        &MEDIUM_TX_PACKETS,
        &MEDIUM_DELIVERED,
        &MEDIUM_DROPPED,
        &MEDIUM_CORRUPTED,
        &MOTE_SUPPRESSED,
        &LOG_LINES_ROUTED,
        &MEDIUM_DELAY,
    ];
}

/// Register all metric descriptions with the installed recorder.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

/// Labels attached to per-mote metrics.
#[derive(Debug, Clone)]
pub struct MetricLabels {
    /// Mote address, rendered as a string.
    pub node: String,
}

impl MetricLabels {
    /// Create labels for a mote.
    pub fn new(node: impl Into<String>) -> Self {
        MetricLabels { node: node.into() }
    }

    /// Convert into the label vector expected by the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_declarations() {
        assert_eq!(metric_defs::MEDIUM_TX_PACKETS.kind, MetricKind::Counter);
        assert_eq!(metric_defs::MEDIUM_DELAY.kind, MetricKind::Histogram);
        assert!(!metric_defs::SCHEDULER_EVENTS.description.is_empty());
    }

    #[test]
    fn test_all_names_unique() {
        let mut names: Vec<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_labels() {
        let labels = MetricLabels::new("12");
        assert_eq!(labels.to_labels(), vec![("node", "12".to_string())]);
    }
}
