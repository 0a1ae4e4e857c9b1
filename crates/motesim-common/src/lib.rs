//! # motesim-common
//!
//! Common types for the motesim simulation controller.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Mote addressing ([`NodeAddr`], [`Destination`])
//! - Radio packets ([`Packet`])
//! - The injectable command vocabulary ([`Command`])
//! - Scheduled-event types ([`Event`], [`EventPayload`], [`ScheduledEvent`])
//! - Channel log routing ([`channel`])

pub mod channel;

use serde::{Deserialize, Serialize};

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in microseconds since simulation start.
///
/// The virtual clock is the only notion of "now" in the simulator. It is
/// owned by the event scheduler and is monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds (float).
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0) as u64)
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Add a duration, failing on overflow.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Unique address of a simulated mote, stable for the simulation lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub u16);

impl NodeAddr {
    /// Create a new mote address.
    pub fn new(addr: u16) -> Self {
        NodeAddr(addr)
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for NodeAddr {
    fn from(addr: u16) -> Self {
        NodeAddr(addr)
    }
}

/// Link-layer destination of a packet.
///
/// The radio medium always offers a transmission to every adjacent mote;
/// firmware uses the destination to decide whether a received packet is
/// addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// All motes in radio range.
    Broadcast,
    /// A single mote.
    Node(NodeAddr),
}

impl Destination {
    /// Whether a mote with the given address should accept this packet.
    pub fn accepts(&self, addr: NodeAddr) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::Node(dest) => *dest == addr,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Broadcast => write!(f, "*"),
            Destination::Node(addr) => write!(f, "{}", addr),
        }
    }
}

// ============================================================================
// Packets
// ============================================================================

/// A radio packet as seen by the simulation controller.
///
/// The payload is opaque to the controller; only firmware interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Transmitting mote.
    pub src: NodeAddr,
    /// Link-layer destination.
    pub dest: Destination,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a broadcast packet.
    pub fn broadcast(src: NodeAddr, payload: Vec<u8>) -> Self {
        Packet {
            src,
            dest: Destination::Broadcast,
            payload,
        }
    }

    /// Create a unicast packet.
    pub fn unicast(src: NodeAddr, dest: NodeAddr, payload: Vec<u8>) -> Self {
        Packet {
            src,
            dest: Destination::Node(dest),
            payload,
        }
    }
}

// ============================================================================
// Command Vocabulary
// ============================================================================

/// A debug command injected into mote firmware by the control facade.
///
/// Commands are delivered as ordinary scheduled events at the virtual time
/// of injection, so their effects interleave correctly with organic
/// traffic. `SetPower` is the one exception handled by the mote runtime
/// itself rather than firmware, since a powered-off mote must still be
/// able to power back on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a ping to a destination mote with an opaque payload.
    Ping {
        /// Destination address.
        dest: NodeAddr,
        /// Payload carried by the ping.
        payload: String,
    },
    /// Dump the neighbor table to the NEIGHBOR channel.
    NeighborDump,
    /// Dump the routing table to the ROUTING channel.
    RouteDump,
    /// Open a listening transport server on a port.
    TestServer {
        /// Listening port.
        port: u8,
    },
    /// Open a transport client connection and transfer bytes.
    TestClient {
        /// Server mote address.
        dest: NodeAddr,
        /// Client-side port.
        src_port: u8,
        /// Server-side port.
        dest_port: u8,
        /// Number of bytes to transfer.
        transfer_len: u16,
    },
    /// Close a previously opened transport client connection.
    CloseClient {
        /// Server mote address.
        dest: NodeAddr,
        /// Client-side port.
        src_port: u8,
        /// Server-side port.
        dest_port: u8,
    },
    /// Toggle mote power without resetting firmware state.
    SetPower(bool),
}

impl Command {
    /// Short label for traces and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Ping { .. } => "ping",
            Command::NeighborDump => "neighbor_dump",
            Command::RouteDump => "route_dump",
            Command::TestServer { .. } => "test_server",
            Command::TestClient { .. } => "test_client",
            Command::CloseClient { .. } => "close_client",
            Command::SetPower(_) => "set_power",
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Payload of a scheduled simulation event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A firmware timer fires.
    Timer {
        /// Firmware-defined timer ID.
        timer_id: u64,
    },
    /// A radio packet arrives at a mote.
    PacketDelivery {
        /// The delivered packet.
        packet: Packet,
        /// Whether the noise model corrupted the packet in flight.
        corrupted: bool,
    },
    /// A command injected by the control facade.
    Command(Command),
}

impl EventPayload {
    /// Short label for traces and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EventPayload::Timer { .. } => "timer",
            EventPayload::PacketDelivery { .. } => "packet_delivery",
            EventPayload::Command(_) => "command",
        }
    }
}

/// A simulation event targeted at one mote.
#[derive(Debug, Clone)]
pub struct Event {
    /// The mote this event is dispatched to.
    pub target: NodeAddr,
    /// The event payload.
    pub payload: EventPayload,
}

/// Handle to a scheduled event, usable to cancel it before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub(crate) u64);

impl EventHandle {
    /// Create a handle from a raw insertion sequence number.
    pub fn from_seq(seq: u64) -> Self {
        EventHandle(seq)
    }

    /// The insertion sequence number backing this handle.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

/// An event queued for dispatch at a virtual timestamp.
///
/// Total order is (time, insertion sequence): equal-timestamp events are
/// dispatched in the order they were scheduled.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// Dispatch time.
    pub time: SimTime,
    /// Insertion sequence number, unique per scheduler.
    pub seq: u64,
    /// The event to dispatch.
    pub event: Event,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then FIFO)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
