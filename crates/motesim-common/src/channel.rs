//! Channel-filtered log routing for firmware diagnostic output.
//!
//! Firmware emits log lines tagged with a named logical channel (COMMAND,
//! GENERAL, NEIGHBOR, ROUTING, TRANSPORT, ...). The router buffers lines
//! only for channels the driving script has subscribed to; routing to an
//! unsubscribed channel is a silent no-op, not an error, so scripts can
//! observe any subset of the network's chatter.
//!
//! The router is a shared handle: clone it into every component that emits
//! logs. Arrival order is preserved per channel; there is no cross-channel
//! ordering guarantee.

use crate::{NodeAddr, SimTime};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Well-known channel names used by the stock firmware.
///
/// The channel namespace is an open set of strings; these constants only
/// cover the channels the reference firmware emits on.
pub mod channels {
    /// Command acknowledgements and injection diagnostics.
    pub const COMMAND: &str = "COMMAND";
    /// General firmware output (boot, ping delivery, drops).
    pub const GENERAL: &str = "GENERAL";
    /// Neighbor discovery output.
    pub const NEIGHBOR: &str = "NEIGHBOR";
    /// Routing table output.
    pub const ROUTING: &str = "ROUTING";
    /// Transport connection output.
    pub const TRANSPORT: &str = "TRANSPORT";
}

/// A captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Virtual time at which the line was emitted.
    pub time: SimTime,
    /// Mote that emitted the line.
    pub source: NodeAddr,
    /// Channel the line was routed on.
    pub channel: String,
    /// The line text.
    pub line: String,
}

#[derive(Debug, Default)]
struct RouterInner {
    /// Active channel subscriptions.
    subscribed: BTreeSet<String>,
    /// Captured lines per channel, in arrival order.
    captured: BTreeMap<String, Vec<LogLine>>,
}

/// Shared channel log router.
///
/// Cloning produces another handle to the same subscription set and
/// capture buffers.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    inner: Arc<Mutex<RouterInner>>,
    echo: bool,
}

impl ChannelRouter {
    /// Create a router with no subscriptions.
    pub fn new() -> Self {
        ChannelRouter::default()
    }

    /// Create a router that also echoes every captured line to stderr.
    pub fn with_echo() -> Self {
        ChannelRouter {
            inner: Arc::new(Mutex::new(RouterInner::default())),
            echo: true,
        }
    }

    /// Subscribe to a channel. Idempotent; returns true if newly added.
    pub fn subscribe(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .expect("channel router lock")
            .subscribed
            .insert(channel.to_string())
    }

    /// Unsubscribe from a channel. Idempotent; returns true if removed.
    ///
    /// Lines already captured on the channel remain readable.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .expect("channel router lock")
            .subscribed
            .remove(channel)
    }

    /// Whether a channel currently has a subscriber.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .expect("channel router lock")
            .subscribed
            .contains(channel)
    }

    /// The currently subscribed channel names.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("channel router lock")
            .subscribed
            .iter()
            .cloned()
            .collect()
    }

    /// Route a log line emitted by a mote.
    ///
    /// Silently drops the line if the channel has no subscriber.
    pub fn route(&self, channel: &str, source: NodeAddr, time: SimTime, line: &str) {
        let mut inner = self.inner.lock().expect("channel router lock");
        if !inner.subscribed.contains(channel) {
            return;
        }
        let entry = LogLine {
            time,
            source,
            channel: channel.to_string(),
            line: sanitize_for_display(line),
        };
        if self.echo {
            eprintln!(
                "[{}] {} @ {:.3}s: {}",
                entry.channel,
                entry.source,
                entry.time.as_secs_f64(),
                entry.line
            );
        }
        inner.captured.entry(channel.to_string()).or_default().push(entry);
    }

    /// Captured lines for a channel, in arrival order.
    pub fn lines(&self, channel: &str) -> Vec<LogLine> {
        self.inner
            .lock()
            .expect("channel router lock")
            .captured
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Take (drain) the captured lines for a channel.
    pub fn take_lines(&self, channel: &str) -> Vec<LogLine> {
        self.inner
            .lock()
            .expect("channel router lock")
            .captured
            .get_mut(channel)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Total number of captured lines across all channels.
    pub fn total_captured(&self) -> usize {
        self.inner
            .lock()
            .expect("channel router lock")
            .captured
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// Drop all captured lines, keeping subscriptions.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("channel router lock")
            .captured
            .clear();
    }
}

/// Sanitize a line for display, replacing control characters with escape
/// sequences so binary garbage from firmware cannot mangle a terminal.
fn sanitize_for_display(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' {
            result.push_str("\\\\");
        } else if c == '\t' {
            result.push_str("\\t");
        } else if c == '\n' {
            result.push_str("\\n");
        } else if c == '\r' {
            result.push_str("\\r");
        } else if c.is_ascii_control() {
            result.push_str(&format!("\\x{:02x}", c as u32));
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_texts(router: &ChannelRouter, channel: &str) -> Vec<String> {
        router.lines(channel).into_iter().map(|l| l.line).collect()
    }

    #[test]
    fn test_subscribe_idempotent() {
        let router = ChannelRouter::new();
        assert!(router.subscribe(channels::ROUTING));
        assert!(!router.subscribe(channels::ROUTING));
        assert!(router.is_subscribed(channels::ROUTING));
        assert!(router.unsubscribe(channels::ROUTING));
        assert!(!router.unsubscribe(channels::ROUTING));
    }

    #[test]
    fn test_unsubscribed_channel_drops_silently() {
        let router = ChannelRouter::new();
        router.subscribe(channels::ROUTING);

        router.route(channels::NEIGHBOR, NodeAddr::new(1), SimTime::ZERO, "n");
        router.route(channels::ROUTING, NodeAddr::new(1), SimTime::ZERO, "r");

        assert!(router.lines(channels::NEIGHBOR).is_empty());
        assert_eq!(line_texts(&router, channels::ROUTING), vec!["r"]);
        assert_eq!(router.total_captured(), 1);
    }

    #[test]
    fn test_arrival_order_preserved_per_channel() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);

        for i in 0..5 {
            router.route(
                channels::GENERAL,
                NodeAddr::new(i),
                SimTime::from_millis(u64::from(i)),
                &format!("line {}", i),
            );
        }

        let lines = router.lines(channels::GENERAL);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line.line, format!("line {}", i));
        }
    }

    #[test]
    fn test_take_lines_drains() {
        let router = ChannelRouter::new();
        router.subscribe(channels::COMMAND);
        router.route(channels::COMMAND, NodeAddr::new(1), SimTime::ZERO, "a");

        assert_eq!(router.take_lines(channels::COMMAND).len(), 1);
        assert!(router.take_lines(channels::COMMAND).is_empty());
    }

    #[test]
    fn test_sanitize_control_characters() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        router.route(
            channels::GENERAL,
            NodeAddr::new(1),
            SimTime::ZERO,
            "a\tb\x07c",
        );
        assert_eq!(line_texts(&router, channels::GENERAL), vec!["a\\tb\\x07c"]);
    }
}
