//! Reference firmware for exercising the simulation controller.
//!
//! Implements just enough protocol to drive every injectable command:
//! - periodic beacons building a neighbor table,
//! - a distance-vector route table (piggybacked on beacons) for the
//!   ROUTING/NEIGHBOR diagnostics,
//! - hop-limited flood forwarding with duplicate suppression for pings
//!   and transport segments,
//! - a stop-and-wait transport (SYN/ACK/FIN/DATA) between a listening
//!   server and client connections.
//!
//! Protocol state lives entirely inside this type; the controller only
//! observes the log lines it emits.

use crate::wire::{
    FloodMessage, FloodPayload, PacketBody, RouteAdvert, Segment, SegmentFlag, MAX_ROUTE_ADVERTS,
    TRANSPORT_PAYLOAD_MAX,
};
use crate::{Firmware, FirmwareError, MoteCtx};
use motesim_common::channel::channels;
use motesim_common::{Command, Destination, NodeAddr, Packet, SimTime};
use rand::Rng;
use std::collections::BTreeMap;

/// Timer id base for the beacon chain; the current epoch is added so that
/// timers armed before a reboot or power cycle fire as stale no-ops.
const TIMER_BEACON_BASE: u64 = 0x1000;
/// Timer id base for the transport retransmit chain.
const TIMER_RETRY_BASE: u64 = 0x2000;

/// Route entries expire after this many beacon periods without refresh.
const MAX_ROUTE_TTL: u8 = 20;

/// Bound on the duplicate-suppression cache.
const MAX_SEEN_FLOODS: usize = 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the reference firmware.
#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    /// Interval between neighbor beacons.
    pub beacon_interval: SimTime,
    /// Neighbors not heard for this long are pruned.
    pub neighbor_timeout: SimTime,
    /// Hop budget for flooded messages.
    pub flood_ttl: u8,
    /// Retransmit interval for unacknowledged transport segments.
    pub retry_interval: SimTime,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            beacon_interval: SimTime::from_secs(5.0),
            neighbor_timeout: SimTime::from_secs(15.0),
            flood_ttl: 16,
            retry_interval: SimTime::from_secs(1.0),
        }
    }
}

// ============================================================================
// Protocol State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Neighbor {
    last_heard: SimTime,
    beacons: u32,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    next_hop: NodeAddr,
    cost: u8,
    ttl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    SynSent,
    Established,
    FinSent,
}

#[derive(Debug, Clone)]
struct ClientConn {
    state: ClientState,
    transfer_len: u16,
    bytes_acked: u16,
    next_data_seq: u16,
    /// Last sent, not yet acknowledged segment (stop-and-wait window of 1).
    outstanding: Option<Segment>,
}

#[derive(Debug, Clone, Copy)]
struct ServerConn {
    expected_seq: u16,
    bytes_received: u32,
}

/// The reference firmware.
pub struct ReferenceFirmware {
    config: ReferenceConfig,
    beacon_seq: u16,
    beacon_epoch: u64,
    retry_epoch: u64,
    retry_armed: bool,
    next_flood_id: u16,
    neighbors: BTreeMap<NodeAddr, Neighbor>,
    routes: BTreeMap<NodeAddr, Route>,
    seen_floods: BTreeMap<(NodeAddr, u16), ()>,
    /// Listening server ports, each with connections keyed by
    /// (peer, peer port).
    servers: BTreeMap<u8, BTreeMap<(NodeAddr, u8), ServerConn>>,
    /// Client connections keyed by (server, local port, server port).
    clients: BTreeMap<(NodeAddr, u8, u8), ClientConn>,
}

impl ReferenceFirmware {
    /// Create firmware with the given configuration.
    pub fn new(config: ReferenceConfig) -> Self {
        ReferenceFirmware {
            config,
            beacon_seq: 0,
            beacon_epoch: 0,
            retry_epoch: 0,
            retry_armed: false,
            next_flood_id: 0,
            neighbors: BTreeMap::new(),
            routes: BTreeMap::new(),
            seen_floods: BTreeMap::new(),
            servers: BTreeMap::new(),
            clients: BTreeMap::new(),
        }
    }

    fn arm_beacon(&mut self, ctx: &mut MoteCtx, first: bool) {
        self.beacon_epoch += 1;
        let interval_us = self.config.beacon_interval.as_micros();
        // Stagger the first beacon so simultaneously booted motes do not
        // transmit in lockstep.
        let delay_us = if first {
            ctx.rng().gen_range(interval_us / 2..=interval_us)
        } else {
            interval_us
        };
        ctx.set_timer(
            SimTime::from_micros(delay_us),
            TIMER_BEACON_BASE + self.beacon_epoch,
        );
    }

    fn arm_retry(&mut self, ctx: &mut MoteCtx, new_chain: bool) {
        if new_chain {
            self.retry_epoch += 1;
        }
        self.retry_armed = true;
        ctx.set_timer(
            self.config.retry_interval,
            TIMER_RETRY_BASE + self.retry_epoch,
        );
    }

    fn send_flood(&mut self, ctx: &mut MoteCtx, payload: FloodPayload) -> u16 {
        let flood_id = self.next_flood_id;
        self.next_flood_id = self.next_flood_id.wrapping_add(1);
        let body = PacketBody::Flood(FloodMessage {
            origin: ctx.addr(),
            flood_id,
            ttl: self.config.flood_ttl,
            payload,
        });
        ctx.transmit(Destination::Broadcast, body.encode());
        flood_id
    }

    // ------------------------------------------------------------------
    // Beacons and routing
    // ------------------------------------------------------------------

    fn beacon_fire(&mut self, ctx: &mut MoteCtx) {
        let now = ctx.now();

        // Prune neighbors we have not heard from, and routes through them.
        let timeout = self.config.neighbor_timeout;
        let stale: Vec<NodeAddr> = self
            .neighbors
            .iter()
            .filter(|(_, n)| now - n.last_heard > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            self.neighbors.remove(&addr);
            self.routes
                .retain(|_, route| route.next_hop != addr);
        }

        // Age route entries.
        self.routes.retain(|_, route| {
            route.ttl -= 1;
            route.ttl > 0
        });

        self.beacon_seq = self.beacon_seq.wrapping_add(1);
        let adverts: Vec<RouteAdvert> = self
            .routes
            .iter()
            .take(MAX_ROUTE_ADVERTS)
            .map(|(dest, route)| RouteAdvert {
                dest: *dest,
                cost: route.cost,
            })
            .collect();
        let body = PacketBody::Beacon {
            seq: self.beacon_seq,
            routes: adverts,
        };
        ctx.transmit(Destination::Broadcast, body.encode());

        // Continue the chain within the same epoch.
        let epoch = self.beacon_epoch;
        ctx.set_timer(self.config.beacon_interval, TIMER_BEACON_BASE + epoch);
    }

    fn handle_beacon(&mut self, sender: NodeAddr, adverts: &[RouteAdvert], ctx: &mut MoteCtx) {
        let entry = self.neighbors.entry(sender).or_insert(Neighbor {
            last_heard: ctx.now(),
            beacons: 0,
        });
        entry.last_heard = ctx.now();
        entry.beacons += 1;

        // Direct route to the beaconing neighbor.
        self.routes.insert(
            sender,
            Route {
                next_hop: sender,
                cost: 1,
                ttl: MAX_ROUTE_TTL,
            },
        );

        // Distance-vector merge of the piggybacked adverts.
        let me = ctx.addr();
        for advert in adverts {
            if advert.dest == me {
                continue;
            }
            let candidate = Route {
                next_hop: sender,
                cost: advert.cost.saturating_add(1),
                ttl: MAX_ROUTE_TTL,
            };
            match self.routes.get(&advert.dest) {
                Some(existing) if existing.next_hop != sender && existing.cost <= candidate.cost => {
                }
                _ => {
                    self.routes.insert(advert.dest, candidate);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Flood relaying
    // ------------------------------------------------------------------

    fn handle_flood(&mut self, msg: &FloodMessage, ctx: &mut MoteCtx) {
        let me = ctx.addr();
        if msg.origin == me {
            return;
        }
        if self
            .seen_floods
            .insert((msg.origin, msg.flood_id), ())
            .is_some()
        {
            return;
        }
        if self.seen_floods.len() > MAX_SEEN_FLOODS {
            self.seen_floods.clear();
        }

        if msg.payload.target() == me {
            self.handle_flood_payload(msg, ctx);
            return;
        }

        // Not for us: relay with a decremented hop budget.
        if msg.ttl > 1 {
            let body = PacketBody::Flood(FloodMessage {
                origin: msg.origin,
                flood_id: msg.flood_id,
                ttl: msg.ttl - 1,
                payload: msg.payload.clone(),
            });
            ctx.transmit(Destination::Broadcast, body.encode());
        }
    }

    fn handle_flood_payload(&mut self, msg: &FloodMessage, ctx: &mut MoteCtx) {
        match &msg.payload {
            FloodPayload::Ping { data, .. } => {
                ctx.emit_log(
                    channels::GENERAL,
                    format!("received ping from {}: {}", msg.origin, data),
                );
                let reply = FloodPayload::PingReply {
                    target: msg.origin,
                    echo_id: msg.flood_id,
                };
                self.send_flood(ctx, reply);
            }
            FloodPayload::PingReply { echo_id, .. } => {
                ctx.emit_log(
                    channels::GENERAL,
                    format!("ping reply from {} (seq {})", msg.origin, echo_id),
                );
            }
            FloodPayload::Transport { segment, .. } => {
                self.handle_segment(msg.origin, segment.clone(), ctx);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    fn send_segment(&mut self, ctx: &mut MoteCtx, target: NodeAddr, segment: Segment) {
        self.send_flood(ctx, FloodPayload::Transport { target, segment });
    }

    fn data_chunk(offset: u16, transfer_len: u16) -> Vec<u8> {
        let remaining = (transfer_len - offset) as usize;
        let len = remaining.min(TRANSPORT_PAYLOAD_MAX);
        (0..len).map(|i| ((offset as usize + i) % 251) as u8).collect()
    }

    fn client_send_next_data(
        &mut self,
        key: (NodeAddr, u8, u8),
        ctx: &mut MoteCtx,
    ) {
        let (dest, src_port, dest_port) = key;
        let Some(conn) = self.clients.get_mut(&key) else {
            return;
        };
        let payload = Self::data_chunk(conn.bytes_acked, conn.transfer_len);
        let segment = Segment {
            src_port,
            dest_port,
            seq: conn.next_data_seq,
            ack: 0,
            advert_window: 1,
            flag: SegmentFlag::Data,
            payload,
        };
        conn.next_data_seq += 1;
        conn.outstanding = Some(segment.clone());
        self.send_segment(ctx, dest, segment);
    }

    fn client_handle_ack(
        &mut self,
        key: (NodeAddr, u8, u8),
        segment: &Segment,
        ctx: &mut MoteCtx,
    ) {
        let (dest, _src_port, dest_port) = key;
        let Some(conn) = self.clients.get_mut(&key) else {
            return;
        };
        match conn.state {
            ClientState::SynSent => {
                if segment.ack != 0 {
                    return;
                }
                conn.state = ClientState::Established;
                conn.outstanding = None;
                ctx.emit_log(
                    channels::TRANSPORT,
                    format!("connection to {}:{} established", dest, dest_port),
                );
                if conn.bytes_acked >= conn.transfer_len {
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!("transfer to {}:{} complete (0 bytes)", dest, dest_port),
                    );
                } else {
                    self.client_send_next_data(key, ctx);
                }
            }
            ClientState::Established => {
                let Some(outstanding) = &conn.outstanding else {
                    return;
                };
                if segment.ack != outstanding.seq {
                    return;
                }
                conn.bytes_acked += outstanding.payload.len() as u16;
                conn.outstanding = None;
                if conn.bytes_acked >= conn.transfer_len {
                    let total = conn.bytes_acked;
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!(
                            "transfer to {}:{} complete ({} bytes)",
                            dest, dest_port, total
                        ),
                    );
                } else {
                    self.client_send_next_data(key, ctx);
                }
            }
            ClientState::FinSent => {
                self.clients.remove(&key);
                ctx.emit_log(
                    channels::TRANSPORT,
                    format!("connection to {}:{} closed", dest, dest_port),
                );
            }
        }
    }

    fn handle_segment(&mut self, peer: NodeAddr, segment: Segment, ctx: &mut MoteCtx) {
        // A reply to one of our client connections?
        let client_key = (peer, segment.dest_port, segment.src_port);
        if self.clients.contains_key(&client_key) {
            if segment.flag == SegmentFlag::Ack {
                self.client_handle_ack(client_key, &segment, ctx);
            }
            return;
        }

        // Otherwise a segment for a listening server.
        let Some(conns) = self.servers.get_mut(&segment.dest_port) else {
            return;
        };
        let conn_key = (peer, segment.src_port);
        let reply_ack = match segment.flag {
            SegmentFlag::Syn => {
                // A retransmitted SYN re-acknowledges without resetting
                // the connection.
                if !conns.contains_key(&conn_key) {
                    conns.insert(
                        conn_key,
                        ServerConn {
                            expected_seq: 1,
                            bytes_received: 0,
                        },
                    );
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!("accepted connection from {}:{}", peer, segment.src_port),
                    );
                }
                Some(segment.seq)
            }
            SegmentFlag::Data => match conns.get_mut(&conn_key) {
                Some(conn) if segment.seq == conn.expected_seq => {
                    conn.expected_seq += 1;
                    conn.bytes_received += segment.payload.len() as u32;
                    let total = conn.bytes_received;
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!(
                            "received {} bytes from {}:{} (total {})",
                            segment.payload.len(),
                            peer,
                            segment.src_port,
                            total
                        ),
                    );
                    Some(segment.seq)
                }
                // Duplicate or out-of-order: re-acknowledge the last
                // in-order segment without logging.
                Some(conn) => Some(conn.expected_seq - 1),
                None => None,
            },
            SegmentFlag::Fin => match conns.remove(&conn_key) {
                Some(conn) => {
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!(
                            "connection from {}:{} closed ({} bytes received)",
                            peer, segment.src_port, conn.bytes_received
                        ),
                    );
                    Some(segment.seq)
                }
                None => None,
            },
            SegmentFlag::Ack => None,
        };

        if let Some(ack) = reply_ack {
            let reply = Segment {
                src_port: segment.dest_port,
                dest_port: segment.src_port,
                seq: 0,
                ack,
                advert_window: 1,
                flag: SegmentFlag::Ack,
                payload: Vec::new(),
            };
            self.send_segment(ctx, peer, reply);
        }
    }

    fn retry_fire(&mut self, ctx: &mut MoteCtx) {
        if self.clients.is_empty() {
            self.retry_armed = false;
            return;
        }
        let pending: Vec<(NodeAddr, Segment)> = self
            .clients
            .iter()
            .filter_map(|((dest, _, _), conn)| {
                conn.outstanding.clone().map(|seg| (*dest, seg))
            })
            .collect();
        for (dest, segment) in pending {
            self.send_segment(ctx, dest, segment);
        }
        self.arm_retry(ctx, false);
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn command(&mut self, command: &Command, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        match command {
            Command::Ping { dest, payload } => {
                ctx.emit_log(
                    channels::COMMAND,
                    format!("ping sent to {}: {}", dest, payload),
                );
                self.send_flood(
                    ctx,
                    FloodPayload::Ping {
                        target: *dest,
                        data: payload.clone(),
                    },
                );
            }
            Command::NeighborDump => {
                ctx.emit_log(
                    channels::NEIGHBOR,
                    format!("neighbor table: {} entries", self.neighbors.len()),
                );
                let now = ctx.now();
                let entries: Vec<String> = self
                    .neighbors
                    .iter()
                    .map(|(addr, n)| {
                        format!(
                            "neighbor {} last_heard={:.1}s beacons={}",
                            addr,
                            (now - n.last_heard).as_secs_f64(),
                            n.beacons
                        )
                    })
                    .collect();
                for line in entries {
                    ctx.emit_log(channels::NEIGHBOR, line);
                }
            }
            Command::RouteDump => {
                ctx.emit_log(
                    channels::ROUTING,
                    format!("route table: {} entries", self.routes.len()),
                );
                let entries: Vec<String> = self
                    .routes
                    .iter()
                    .map(|(dest, route)| {
                        format!(
                            "dest={} next_hop={} cost={} ttl={}",
                            dest, route.next_hop, route.cost, route.ttl
                        )
                    })
                    .collect();
                for line in entries {
                    ctx.emit_log(channels::ROUTING, line);
                }
            }
            Command::TestServer { port } => {
                if self.servers.contains_key(port) {
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!("server already listening on port {}", port),
                    );
                } else {
                    self.servers.insert(*port, BTreeMap::new());
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!("server listening on port {}", port),
                    );
                }
            }
            Command::TestClient {
                dest,
                src_port,
                dest_port,
                transfer_len,
            } => {
                let key = (*dest, *src_port, *dest_port);
                if self.clients.contains_key(&key) {
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!("client to {}:{} already open", dest, dest_port),
                    );
                    return Ok(());
                }
                ctx.emit_log(
                    channels::TRANSPORT,
                    format!(
                        "connecting to {}:{} from port {} ({} bytes)",
                        dest, dest_port, src_port, transfer_len
                    ),
                );
                let syn = Segment {
                    src_port: *src_port,
                    dest_port: *dest_port,
                    seq: 0,
                    ack: 0,
                    advert_window: 1,
                    flag: SegmentFlag::Syn,
                    payload: Vec::new(),
                };
                self.clients.insert(
                    key,
                    ClientConn {
                        state: ClientState::SynSent,
                        transfer_len: *transfer_len,
                        bytes_acked: 0,
                        next_data_seq: 1,
                        outstanding: Some(syn.clone()),
                    },
                );
                self.send_segment(ctx, *dest, syn);
                if !self.retry_armed {
                    self.arm_retry(ctx, true);
                }
            }
            Command::CloseClient {
                dest,
                src_port,
                dest_port,
            } => {
                let key = (*dest, *src_port, *dest_port);
                let Some(conn) = self.clients.get_mut(&key) else {
                    ctx.emit_log(
                        channels::TRANSPORT,
                        format!("no open connection to {}:{}", dest, dest_port),
                    );
                    return Ok(());
                };
                let fin = Segment {
                    src_port: *src_port,
                    dest_port: *dest_port,
                    seq: conn.next_data_seq,
                    ack: 0,
                    advert_window: 1,
                    flag: SegmentFlag::Fin,
                    payload: Vec::new(),
                };
                conn.state = ClientState::FinSent;
                conn.outstanding = Some(fin.clone());
                ctx.emit_log(
                    channels::TRANSPORT,
                    format!("closing connection to {}:{}", dest, dest_port),
                );
                self.send_segment(ctx, *dest, fin);
            }
            // The mote runtime handles power directly; firmware never
            // sees this command.
            Command::SetPower(_) => {
                return Err(FirmwareError::UnsupportedCommand("set_power"));
            }
        }
        Ok(())
    }
}

impl Default for ReferenceFirmware {
    fn default() -> Self {
        ReferenceFirmware::new(ReferenceConfig::default())
    }
}

impl Firmware for ReferenceFirmware {
    fn boot(&mut self, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        let config = self.config.clone();
        let beacon_epoch = self.beacon_epoch;
        let retry_epoch = self.retry_epoch;
        *self = ReferenceFirmware::new(config);
        // Epochs survive the reset so timers armed before a reboot stay
        // stale.
        self.beacon_epoch = beacon_epoch;
        self.retry_epoch = retry_epoch;

        ctx.emit_log(channels::GENERAL, "booted");
        self.arm_beacon(ctx, true);
        Ok(())
    }

    fn on_packet(&mut self, packet: &Packet, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        if !packet.dest.accepts(ctx.addr()) {
            return Ok(());
        }
        // Undecodable payloads are foreign traffic, not a fault.
        let Ok(body) = PacketBody::decode(&packet.payload) else {
            return Ok(());
        };
        match body {
            PacketBody::Beacon { routes, .. } => {
                self.handle_beacon(packet.src, &routes, ctx);
            }
            PacketBody::Flood(msg) => {
                self.handle_flood(&msg, ctx);
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, timer_id: u64, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        if timer_id == TIMER_BEACON_BASE + self.beacon_epoch {
            self.beacon_fire(ctx);
        } else if timer_id == TIMER_RETRY_BASE + self.retry_epoch {
            self.retry_fire(ctx);
        }
        // Anything else is a stale timer from a previous epoch.
        Ok(())
    }

    fn on_command(&mut self, command: &Command, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        self.command(command, ctx)
    }

    fn powered_on(&mut self, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        ctx.emit_log(channels::GENERAL, "power restored");
        self.arm_beacon(ctx, true);
        if !self.clients.is_empty() {
            self.arm_retry(ctx, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MoteRuntime;
    use motesim_common::channel::ChannelRouter;

    fn mote(addr: u16, router: &ChannelRouter) -> MoteRuntime {
        MoteRuntime::new(
            NodeAddr::new(addr),
            Box::new(ReferenceFirmware::default()),
            u64::from(addr),
            router.clone(),
        )
    }

    /// Deliver every transmission in `out` to `to`, returning its output.
    fn shuttle(
        out: crate::MoteOutput,
        to: &mut MoteRuntime,
        now: SimTime,
    ) -> crate::MoteOutput {
        let mut result = crate::MoteOutput::default();
        for packet in out.transmissions {
            let next = to.deliver_packet(&packet, false, now).unwrap();
            result.transmissions.extend(next.transmissions);
            result.timers.extend(next.timers);
        }
        result
    }

    fn beacon_from(mote: &mut MoteRuntime, now: SimTime) -> crate::MoteOutput {
        // The boot output's first timer is the beacon chain.
        let out = mote.boot(SimTime::ZERO).unwrap();
        let beacon_timer = out.timers[0];
        mote.fire_timer(beacon_timer.timer_id, now).unwrap()
    }

    #[test]
    fn test_beacon_builds_neighbor_and_route() {
        let router = ChannelRouter::new();
        router.subscribe(channels::NEIGHBOR);
        router.subscribe(channels::ROUTING);

        let mut a = mote(1, &router);
        let mut b = mote(2, &router);
        b.boot(SimTime::ZERO).unwrap();

        let now = SimTime::from_secs(5.0);
        let beacon = beacon_from(&mut a, now);
        assert_eq!(beacon.transmissions.len(), 1);
        shuttle(beacon, &mut b, now);

        b.inject_command(&Command::NeighborDump, now).unwrap();
        b.inject_command(&Command::RouteDump, now).unwrap();

        let neighbor_lines = router.lines(channels::NEIGHBOR);
        assert_eq!(neighbor_lines[0].line, "neighbor table: 1 entries");
        assert!(neighbor_lines[1].line.starts_with("neighbor 1"));

        let route_lines = router.lines(channels::ROUTING);
        assert_eq!(route_lines[0].line, "route table: 1 entries");
        assert_eq!(route_lines[1].line, "dest=1 next_hop=1 cost=1 ttl=20");
    }

    #[test]
    fn test_empty_route_dump_emits_single_line() {
        let router = ChannelRouter::new();
        router.subscribe(channels::ROUTING);
        let mut a = mote(1, &router);
        a.boot(SimTime::ZERO).unwrap();

        a.inject_command(&Command::RouteDump, SimTime::ZERO).unwrap();
        let lines = router.lines(channels::ROUTING);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "route table: 0 entries");
    }

    #[test]
    fn test_ping_and_reply() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        router.subscribe(channels::COMMAND);

        let mut a = mote(1, &router);
        let mut b = mote(9, &router);
        a.boot(SimTime::ZERO).unwrap();
        b.boot(SimTime::ZERO).unwrap();

        let now = SimTime::from_secs(1.0);
        let ping_out = a
            .inject_command(
                &Command::Ping {
                    dest: NodeAddr::new(9),
                    payload: "Test".to_string(),
                },
                now,
            )
            .unwrap();

        // b receives the ping and emits a reply, which a receives.
        let reply = shuttle(ping_out, &mut b, now);
        shuttle(reply, &mut a, now);

        let general: Vec<String> = router
            .lines(channels::GENERAL)
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert!(general.contains(&"received ping from 1: Test".to_string()));
        assert!(general.iter().any(|l| l.starts_with("ping reply from 9")));
    }

    #[test]
    fn test_flood_duplicate_suppression_and_ttl() {
        let router = ChannelRouter::new();
        let mut relay = mote(5, &router);
        relay.boot(SimTime::ZERO).unwrap();

        let body = PacketBody::Flood(FloodMessage {
            origin: NodeAddr::new(1),
            flood_id: 3,
            ttl: 4,
            payload: FloodPayload::Ping {
                target: NodeAddr::new(9),
                data: "x".to_string(),
            },
        });
        let packet = Packet::broadcast(NodeAddr::new(1), body.encode());

        let now = SimTime::from_secs(1.0);
        let first = relay.deliver_packet(&packet, false, now).unwrap();
        assert_eq!(first.transmissions.len(), 1);
        let relayed = PacketBody::decode(&first.transmissions[0].payload).unwrap();
        match relayed {
            PacketBody::Flood(msg) => assert_eq!(msg.ttl, 3),
            other => panic!("expected flood, got {:?}", other),
        }

        // Same (origin, flood_id) again: suppressed.
        let second = relay.deliver_packet(&packet, false, now).unwrap();
        assert!(second.transmissions.is_empty());
    }

    #[test]
    fn test_transport_transfer_and_close() {
        let router = ChannelRouter::new();
        router.subscribe(channels::TRANSPORT);

        let mut server = mote(10, &router);
        let mut client = mote(2, &router);
        server.boot(SimTime::ZERO).unwrap();
        client.boot(SimTime::ZERO).unwrap();

        let now = SimTime::from_secs(1.0);
        server
            .inject_command(&Command::TestServer { port: 33 }, now)
            .unwrap();
        let mut pending = client
            .inject_command(
                &Command::TestClient {
                    dest: NodeAddr::new(10),
                    src_port: 20,
                    dest_port: 33,
                    transfer_len: 25,
                },
                now,
            )
            .unwrap();

        // Shuttle packets until the exchange goes quiet.
        for _ in 0..32 {
            if pending.transmissions.is_empty() {
                break;
            }
            let at_server = shuttle(pending, &mut server, now);
            pending = shuttle(at_server, &mut client, now);
        }

        pending = client
            .inject_command(
                &Command::CloseClient {
                    dest: NodeAddr::new(10),
                    src_port: 20,
                    dest_port: 33,
                },
                now,
            )
            .unwrap();
        let at_server = shuttle(pending, &mut server, now);
        shuttle(at_server, &mut client, now);

        let lines: Vec<String> = router
            .lines(channels::TRANSPORT)
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert!(lines.contains(&"server listening on port 33".to_string()));
        assert!(lines.contains(&"accepted connection from 2:20".to_string()));
        assert!(lines.contains(&"transfer to 10:33 complete (25 bytes)".to_string()));
        assert!(lines.contains(&"connection from 2:20 closed (25 bytes received)".to_string()));
        assert!(lines.contains(&"connection to 10:33 closed".to_string()));
    }
}
