//! # motesim-runner library
//!
//! The event scheduler and control facade of the motesim simulation
//! controller.
//!
//! The [`EventLoop`] owns the virtual clock, the time-ordered event queue,
//! the radio medium and every mote runtime. It is strictly single-threaded
//! and cooperative: dispatching one event (including any events it
//! synchronously enqueues) completes before the next event is popped, so
//! shared simulation state needs no locking and the total event order is
//! the sole determinism contract.
//!
//! The [`Sim`] facade wraps the loop with the surface driving scripts use:
//! load topology and noise, boot motes, subscribe to channels, advance
//! virtual time, and inject debug commands.

pub mod facade;
pub mod trace;

pub use facade::Sim;
pub use motesim_common::SimTime;

use motesim_common::channel::ChannelRouter;
use motesim_common::{
    Command, Event, EventHandle, EventPayload, NodeAddr, Packet, ScheduledEvent,
};
use motesim_firmware::{MoteOutput, MoteRuntime};
use motesim_medium::{LinkModel, NoiseModel, RadioMedium};
use motesim_metrics::{metric_defs, metrics};
use motesim_model::{BuiltSimulation, NodeInfo};
use serde::Serialize;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use thiserror::Error;
use trace::{TraceEntry, TraceRecorder};

// ============================================================================
// Error Types
// ============================================================================

/// Fatal scheduler misuse.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An event was scheduled behind the virtual clock. This is a logic
    /// bug in event generation, not a recoverable condition.
    #[error("ordering violation: scheduled {scheduled} behind current clock {now}")]
    OrderingViolation {
        /// Requested timestamp.
        scheduled: SimTime,
        /// Current virtual clock.
        now: SimTime,
    },
}

/// Errors surfaced by the runner and the control facade.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] motesim_model::ModelError),

    /// Scheduler misuse.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A command targeted a non-existent or non-booted mote.
    #[error("Unknown mote address: {0}")]
    UnknownAddress(NodeAddr),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Events dispatched.
    pub events_dispatched: u64,
    /// Scheduled events skipped because they were cancelled.
    pub events_cancelled: u64,
    /// Dispatches that raised a firmware error.
    pub dispatch_errors: u64,
    /// Packets handed to the radio medium.
    pub packets_transmitted: u64,
    /// Deliveries scheduled intact.
    pub packets_delivered: u64,
    /// Link attempts dropped by the noise model.
    pub packets_dropped: u64,
    /// Deliveries scheduled corrupted.
    pub packets_corrupted: u64,
    /// Commands injected through the facade.
    pub commands_injected: u64,
    /// Final virtual clock in microseconds.
    pub simulation_time_us: u64,
}

// ============================================================================
// Event Loop
// ============================================================================

/// The discrete-event scheduler.
///
/// Events are totally ordered by (timestamp, insertion sequence); equal
/// timestamps dispatch in FIFO order. The clock only moves inside
/// [`advance_to`](EventLoop::advance_to), and scheduling behind it fails
/// fast with [`SchedulerError::OrderingViolation`].
pub struct EventLoop {
    queue: BinaryHeap<ScheduledEvent>,
    /// Insertion sequence numbers of cancelled, not-yet-fired events.
    cancelled: HashSet<u64>,
    next_seq: u64,
    clock: SimTime,
    medium: RadioMedium,
    motes: BTreeMap<NodeAddr, MoteRuntime>,
    node_infos: Vec<NodeInfo>,
    stats: SimulationStats,
    trace: TraceRecorder,
}

impl EventLoop {
    /// Create an empty loop: no motes, no links, clock at zero.
    ///
    /// Time can be advanced before a topology is installed; driving
    /// scripts routinely run the clock on an empty network first.
    pub fn new(trace_output: Option<Box<dyn std::io::Write>>) -> Self {
        EventLoop {
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
            clock: SimTime::ZERO,
            medium: RadioMedium::new(LinkModel::new(), NoiseModel::new(0)),
            motes: BTreeMap::new(),
            node_infos: Vec::new(),
            stats: SimulationStats::default(),
            trace: TraceRecorder::new(trace_output),
        }
    }

    /// Install a built simulation (medium and motes).
    ///
    /// Called once by the facade when the first mote boots; the topology
    /// and noise model are immutable from then on.
    pub fn install(&mut self, built: BuiltSimulation) {
        self.medium = built.medium;
        self.motes = built.motes;
        self.node_infos = built.node_infos;
    }

    /// Current virtual clock.
    pub fn clock(&self) -> SimTime {
        self.clock
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Number of not-yet-dispatched events.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Information about the installed nodes.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.node_infos
    }

    /// Whether a mote exists.
    pub fn has_mote(&self, addr: NodeAddr) -> bool {
        self.motes.contains_key(&addr)
    }

    /// Whether a mote exists and has booted.
    pub fn is_booted(&self, addr: NodeAddr) -> bool {
        self.motes.get(&addr).map(|m| m.is_booted()).unwrap_or(false)
    }

    /// Whether a mote exists, has booted and is powered on.
    pub fn is_active(&self, addr: NodeAddr) -> bool {
        self.motes.get(&addr).map(|m| m.is_active()).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Schedule an event for dispatch at `time`.
    ///
    /// Fails fast if `time` is behind the virtual clock.
    pub fn schedule_at(
        &mut self,
        time: SimTime,
        event: Event,
    ) -> Result<EventHandle, SchedulerError> {
        if time < self.clock {
            return Err(SchedulerError::OrderingViolation {
                scheduled: time,
                now: self.clock,
            });
        }
        Ok(self.push_event(time, event))
    }

    /// Schedule an event at the current virtual time.
    pub fn schedule_now(&mut self, event: Event) -> EventHandle {
        self.push_event(self.clock, event)
    }

    fn push_event(&mut self, time: SimTime, event: Event) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledEvent { time, seq, event });
        EventHandle::from_seq(seq)
    }

    /// Cancel a not-yet-fired event. No-op if it already dispatched.
    pub fn cancel(&mut self, handle: EventHandle) {
        self.cancelled.insert(handle.seq());
    }

    // ------------------------------------------------------------------
    // Time advancement
    // ------------------------------------------------------------------

    /// Advance the clock by `duration`, dispatching everything due.
    pub fn advance_by(&mut self, duration: SimTime) -> Result<(), SchedulerError> {
        self.advance_to(self.clock + duration)
    }

    /// Drain and dispatch all events with timestamp <= `target` in
    /// (timestamp, insertion) order, then set the clock to `target` even
    /// if nothing fired.
    pub fn advance_to(&mut self, target: SimTime) -> Result<(), SchedulerError> {
        if target < self.clock {
            return Err(SchedulerError::OrderingViolation {
                scheduled: target,
                now: self.clock,
            });
        }

        while let Some(head) = self.queue.peek() {
            if head.time > target {
                break;
            }
            let scheduled = self.queue.pop().expect("peeked event");
            if self.cancelled.remove(&scheduled.seq) {
                self.stats.events_cancelled += 1;
                continue;
            }
            self.clock = scheduled.time;
            self.dispatch(scheduled);
        }

        self.clock = target;
        self.stats.simulation_time_us = self.clock.as_micros();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, scheduled: ScheduledEvent) {
        let ScheduledEvent { time, event, .. } = scheduled;
        let target = event.target;

        self.stats.events_dispatched += 1;
        let kind_labels = [("kind", event.payload.label().to_string())];
        metrics::counter!(metric_defs::SCHEDULER_EVENTS.name, &kind_labels).increment(1);
        self.trace.record(TraceEntry::for_event(time, &event));

        let Some(mote) = self.motes.get_mut(&target) else {
            // Addresses are validated at injection time; a missing mote
            // here means the event outlived a topology it was built for.
            tracing::warn!(node = %target, "dropping event for unknown mote");
            return;
        };

        let result = match &event.payload {
            EventPayload::Timer { timer_id } => mote.fire_timer(*timer_id, time),
            EventPayload::PacketDelivery { packet, corrupted } => {
                mote.deliver_packet(packet, *corrupted, time)
            }
            EventPayload::Command(command) => mote.inject_command(command, time),
        };

        match result {
            Ok(output) => self.apply_output(target, output),
            Err(err) => {
                // A firmware fault must not stall the drain loop: record
                // it and continue with the next event.
                tracing::error!(node = %target, error = %err, "firmware error during dispatch");
                self.stats.dispatch_errors += 1;
                let labels = [("node", target.to_string())];
                metrics::counter!(metric_defs::SCHEDULER_DISPATCH_ERRORS.name, &labels)
                    .increment(1);
            }
        }
    }

    /// Convert a firmware callback's output into scheduled events.
    fn apply_output(&mut self, source: NodeAddr, output: MoteOutput) {
        for timer in output.timers {
            // now + delay can never precede now.
            self.push_event(
                self.clock + timer.delay,
                Event {
                    target: source,
                    payload: EventPayload::Timer {
                        timer_id: timer.timer_id,
                    },
                },
            );
        }
        for packet in output.transmissions {
            self.transmit(source, packet);
        }
    }

    /// Offer a transmission to the radio medium and schedule the
    /// resulting deliveries.
    ///
    /// Receivers that are powered off at transmission time are excluded;
    /// the mote runtime re-checks power at delivery time, covering motes
    /// that power down while a packet is in flight.
    fn transmit(&mut self, sender: NodeAddr, packet: Packet) {
        self.stats.packets_transmitted += 1;
        let sender_labels = [("node", sender.to_string())];
        metrics::counter!(metric_defs::MEDIUM_TX_PACKETS.name, &sender_labels).increment(1);
        self.trace.record(TraceEntry::for_transmit(self.clock, &packet));

        let candidates = self.medium.links().receivers(sender).count() as u64;
        let plans = self.medium.plan_transmission(sender, self.clock);
        self.stats.packets_dropped += candidates - plans.len() as u64;

        for plan in plans {
            if !self.is_active(plan.dest) {
                continue;
            }
            let dest_labels = [("node", plan.dest.to_string())];
            if plan.corrupted {
                self.stats.packets_corrupted += 1;
                metrics::counter!(metric_defs::MEDIUM_CORRUPTED.name, &dest_labels).increment(1);
            } else {
                self.stats.packets_delivered += 1;
                metrics::counter!(metric_defs::MEDIUM_DELIVERED.name, &dest_labels).increment(1);
            }
            metrics::histogram!(metric_defs::MEDIUM_DELAY.name)
                .record((plan.deliver_at - self.clock).as_micros() as f64);

            self.push_event(
                plan.deliver_at,
                Event {
                    target: plan.dest,
                    payload: EventPayload::PacketDelivery {
                        packet: packet.clone(),
                        corrupted: plan.corrupted,
                    },
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Facade entry points
    // ------------------------------------------------------------------

    /// Boot a mote synchronously: firmware resets and may arm timers, but
    /// nothing is dispatched until the next time advancement.
    pub fn boot_mote(&mut self, addr: NodeAddr) -> Result<(), RunnerError> {
        let clock = self.clock;
        let Some(mote) = self.motes.get_mut(&addr) else {
            return Err(RunnerError::UnknownAddress(addr));
        };
        match mote.boot(clock) {
            Ok(output) => {
                self.apply_output(addr, output);
                Ok(())
            }
            Err(err) => {
                tracing::error!(node = %addr, error = %err, "firmware error during boot");
                self.stats.dispatch_errors += 1;
                Ok(())
            }
        }
    }

    /// Inject a command, scheduled at the current virtual time so its
    /// effects interleave in order with organic traffic.
    pub fn inject(
        &mut self,
        addr: NodeAddr,
        command: Command,
    ) -> Result<EventHandle, RunnerError> {
        if !self.is_booted(addr) {
            return Err(RunnerError::UnknownAddress(addr));
        }
        self.stats.commands_injected += 1;
        Ok(self.schedule_now(Event {
            target: addr,
            payload: EventPayload::Command(command),
        }))
    }

    /// Flush the trace recorder.
    pub fn flush_trace(&mut self) -> Result<(), RunnerError> {
        self.trace.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motesim_common::channel::channels;
    use motesim_firmware::{Firmware, FirmwareError, MoteCtx};
    use motesim_model::{build_simulation_with, load_topology_from_str, NoiseSpec};

    const TWO_NODE_TOPO: &str = r#"
nodes:
  - address: 1
  - address: 2
edges:
  - from: 1
    to: 2
    symmetric: true
"#;

    fn timer_event(target: u16, timer_id: u64) -> Event {
        Event {
            target: NodeAddr::new(target),
            payload: EventPayload::Timer { timer_id },
        }
    }

    fn install_two_nodes(event_loop: &mut EventLoop, router: &ChannelRouter) {
        let topo = load_topology_from_str(TWO_NODE_TOPO).unwrap();
        let built =
            motesim_model::build_simulation(&topo, &NoiseSpec::perfect(), 1, router).unwrap();
        event_loop.install(built);
    }

    #[test]
    fn test_clock_advances_without_events() {
        let mut event_loop = EventLoop::new(None);
        event_loop.advance_by(SimTime::from_secs(5.0)).unwrap();
        assert_eq!(event_loop.clock(), SimTime::from_secs(5.0));
        assert_eq!(event_loop.stats().events_dispatched, 0);
    }

    #[test]
    fn test_schedule_into_past_fails() {
        let mut event_loop = EventLoop::new(None);
        event_loop.advance_by(SimTime::from_secs(10.0)).unwrap();
        let err = event_loop
            .schedule_at(SimTime::from_secs(5.0), timer_event(1, 1))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::OrderingViolation { .. }));
    }

    #[test]
    fn test_advance_to_past_fails() {
        let mut event_loop = EventLoop::new(None);
        event_loop.advance_to(SimTime::from_secs(10.0)).unwrap();
        assert!(event_loop.advance_to(SimTime::from_secs(9.0)).is_err());
    }

    #[test]
    fn test_events_beyond_target_stay_queued() {
        let mut event_loop = EventLoop::new(None);
        let router = ChannelRouter::new();
        install_two_nodes(&mut event_loop, &router);
        event_loop.boot_mote(NodeAddr::new(1)).unwrap();

        event_loop
            .schedule_at(SimTime::from_secs(30.0), timer_event(1, 99))
            .unwrap();
        let pending_before = event_loop.pending_events();

        event_loop.advance_by(SimTime::from_secs(1.0)).unwrap();
        // The far-future timer is still queued.
        assert!(event_loop.pending_events() >= 1);
        assert!(pending_before >= 1);
        assert_eq!(event_loop.clock(), SimTime::from_secs(1.0));
    }

    #[test]
    fn test_cancel_before_dispatch() {
        let mut event_loop = EventLoop::new(None);
        let router = ChannelRouter::new();
        install_two_nodes(&mut event_loop, &router);
        event_loop.boot_mote(NodeAddr::new(1)).unwrap();

        let handle = event_loop
            .schedule_at(SimTime::from_millis(100), timer_event(1, 7))
            .unwrap();
        event_loop.cancel(handle);
        let dispatched_before = event_loop.stats().events_dispatched;
        event_loop.advance_by(SimTime::from_millis(200)).unwrap();

        assert_eq!(event_loop.stats().events_cancelled, 1);
        // Only organic (beacon) events may have fired; the cancelled
        // timer did not.
        assert!(event_loop.stats().events_dispatched >= dispatched_before);
    }

    #[test]
    fn test_cancel_after_dispatch_is_noop() {
        let mut event_loop = EventLoop::new(None);
        let router = ChannelRouter::new();
        install_two_nodes(&mut event_loop, &router);
        event_loop.boot_mote(NodeAddr::new(1)).unwrap();

        let handle = event_loop
            .schedule_at(SimTime::from_millis(10), timer_event(1, 7))
            .unwrap();
        event_loop.advance_by(SimTime::from_millis(20)).unwrap();
        event_loop.cancel(handle);
        event_loop.advance_by(SimTime::from_millis(20)).unwrap();
        assert_eq!(event_loop.stats().events_cancelled, 0);
    }

    #[test]
    fn test_inject_unknown_address_fails() {
        let mut event_loop = EventLoop::new(None);
        let router = ChannelRouter::new();
        install_two_nodes(&mut event_loop, &router);

        // Exists but not booted
        let err = event_loop
            .inject(NodeAddr::new(1), Command::RouteDump)
            .unwrap_err();
        assert!(matches!(err, RunnerError::UnknownAddress(_)));

        // Does not exist at all
        let err = event_loop
            .inject(NodeAddr::new(42), Command::RouteDump)
            .unwrap_err();
        assert!(matches!(err, RunnerError::UnknownAddress(_)));
    }

    /// Firmware that fails on every command, for dispatch-isolation tests.
    struct FaultyFirmware;

    impl Firmware for FaultyFirmware {
        fn boot(&mut self, _ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            Ok(())
        }
        fn on_packet(&mut self, _p: &Packet, _ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            Ok(())
        }
        fn on_timer(&mut self, _t: u64, _ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            Ok(())
        }
        fn on_command(&mut self, _c: &Command, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            ctx.emit_log(channels::GENERAL, "about to fail");
            Err(FirmwareError::Fault("injected fault".to_string()))
        }
    }

    #[test]
    fn test_faulting_dispatch_does_not_stall_drain_loop() {
        let mut event_loop = EventLoop::new(None);
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);

        let topo = load_topology_from_str(TWO_NODE_TOPO).unwrap();
        let built = build_simulation_with(&topo, &NoiseSpec::perfect(), 1, &router, |_| {
            Box::new(FaultyFirmware)
        })
        .unwrap();
        event_loop.install(built);
        event_loop.boot_mote(NodeAddr::new(1)).unwrap();

        event_loop.inject(NodeAddr::new(1), Command::RouteDump).unwrap();
        event_loop.inject(NodeAddr::new(1), Command::NeighborDump).unwrap();
        event_loop.advance_by(SimTime::from_secs(1.0)).unwrap();

        // Both commands dispatched despite the first one failing.
        assert_eq!(event_loop.stats().dispatch_errors, 2);
        assert_eq!(event_loop.stats().events_dispatched, 2);
        assert_eq!(router.lines(channels::GENERAL).len(), 2);
    }
}
