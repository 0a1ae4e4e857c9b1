//! JSON trace recording for dispatched simulation events.
//!
//! When enabled, every dispatched event and transmission is buffered as a
//! [`TraceEntry`] and written out as one pretty-printed JSON array when
//! the recorder is flushed.

use motesim_common::{Event, EventPayload, Packet, SimTime};
use serde::Serialize;
use std::io::Write;

/// Payload types for different trace events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    /// A firmware timer fired.
    #[serde(rename = "TIMER")]
    Timer {
        /// Firmware-defined timer ID.
        timer_id: u64,
    },
    /// A packet was delivered to a mote.
    #[serde(rename = "PACKET")]
    PacketDelivery {
        /// Transmitting mote.
        src: String,
        /// Raw packet payload (hex-encoded).
        packet_hex: String,
        /// Whether the packet arrived corrupted.
        corrupted: bool,
    },
    /// A command was dispatched.
    #[serde(rename = "COMMAND")]
    Command {
        /// Command label.
        command: String,
    },
    /// A packet was handed to the radio medium.
    #[serde(rename = "TX")]
    Transmit {
        /// Link-layer destination.
        dest: String,
        /// Raw packet payload (hex-encoded).
        packet_hex: String,
    },
}

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Virtual time in seconds.
    pub time_s: f64,
    /// Mote the entry is attributed to.
    pub node: String,
    /// Event-specific payload (flattened into this object).
    #[serde(flatten)]
    pub payload: TracePayload,
}

impl TraceEntry {
    /// Build an entry for a dispatched event.
    pub fn for_event(time: SimTime, event: &Event) -> Self {
        let payload = match &event.payload {
            EventPayload::Timer { timer_id } => TracePayload::Timer {
                timer_id: *timer_id,
            },
            EventPayload::PacketDelivery { packet, corrupted } => TracePayload::PacketDelivery {
                src: packet.src.to_string(),
                packet_hex: hex::encode(&packet.payload),
                corrupted: *corrupted,
            },
            EventPayload::Command(command) => TracePayload::Command {
                command: command.label().to_string(),
            },
        };
        TraceEntry {
            time_s: time.as_secs_f64(),
            node: event.target.to_string(),
            payload,
        }
    }

    /// Build an entry for a transmission entering the medium.
    pub fn for_transmit(time: SimTime, packet: &Packet) -> Self {
        TraceEntry {
            time_s: time.as_secs_f64(),
            node: packet.src.to_string(),
            payload: TracePayload::Transmit {
                dest: packet.dest.to_string(),
                packet_hex: hex::encode(&packet.payload),
            },
        }
    }
}

/// Trace recorder buffering entries for a single JSON document.
///
/// With no output sink, recording is a no-op.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a recorder; `output` of `None` disables recording.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// Whether recording is enabled.
    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an entry.
    pub fn record(&mut self, entry: TraceEntry) {
        if self.output.is_some() {
            self.entries.push(entry);
        }
    }

    /// Write all buffered entries to the output.
    pub fn flush(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
        }
        Ok(())
    }
}
