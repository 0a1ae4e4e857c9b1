//! # motesim-firmware
//!
//! Node runtime and firmware seam for the motesim simulation controller.
//!
//! The controller treats firmware state as an opaque black box. Firmware
//! is driven exclusively through the [`Firmware`] capability trait
//! (deliver packet, fire timer, inject command, plus boot and a power-up
//! hook), and its only externally observable output is log lines emitted
//! through the channel router. Each mote is wrapped in a [`MoteRuntime`]
//! that owns power state and a per-mote seeded RNG, and suppresses all
//! dispatch while the mote is powered off.

pub mod wire;

mod reference;

pub use reference::{ReferenceConfig, ReferenceFirmware};

use motesim_common::channel::ChannelRouter;
use motesim_common::{Command, Destination, NodeAddr, Packet, SimTime};
use motesim_metrics::{metric_defs, metrics};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by firmware while handling a dispatch.
///
/// A firmware error never stalls the scheduler; the drain loop logs it and
/// continues with the next event.
#[derive(Debug, Error)]
pub enum FirmwareError {
    /// The firmware does not implement the given command.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(&'static str),

    /// An internal firmware invariant was violated.
    #[error("firmware fault: {0}")]
    Fault(String),
}

// ============================================================================
// Firmware Outputs
// ============================================================================

/// A request to fire a firmware timer after a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    /// Delay from the current virtual time.
    pub delay: SimTime,
    /// Firmware-defined timer ID.
    pub timer_id: u64,
}

/// Everything a firmware callback produced: packets to transmit and timers
/// to arm. Collected per callback and converted into scheduled events by
/// the event scheduler.
#[derive(Debug, Default)]
pub struct MoteOutput {
    /// Packets handed to the radio medium.
    pub transmissions: Vec<Packet>,
    /// Timers to arm.
    pub timers: Vec<TimerRequest>,
}

impl MoteOutput {
    /// Whether the callback produced nothing.
    pub fn is_empty(&self) -> bool {
        self.transmissions.is_empty() && self.timers.is_empty()
    }
}

// ============================================================================
// Mote Context
// ============================================================================

/// The capability surface a firmware callback sees.
///
/// Everything firmware can do to the outside world goes through here:
/// emit a log line, transmit a packet, arm a timer, read the clock, draw
/// deterministic randomness.
pub struct MoteCtx<'a> {
    addr: NodeAddr,
    now: SimTime,
    router: &'a ChannelRouter,
    rng: &'a mut ChaCha8Rng,
    output: &'a mut MoteOutput,
}

impl<'a> MoteCtx<'a> {
    /// This mote's address.
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Deterministic per-mote RNG.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        self.rng
    }

    /// Emit a log line on a named channel.
    ///
    /// A no-op if the channel has no subscriber.
    pub fn emit_log(&mut self, channel: &str, line: impl AsRef<str>) {
        if self.router.is_subscribed(channel) {
            let labels = [("channel", channel.to_string())];
            metrics::counter!(metric_defs::LOG_LINES_ROUTED.name, &labels).increment(1);
        }
        self.router.route(channel, self.addr, self.now, line.as_ref());
    }

    /// Hand a packet to the radio medium.
    pub fn transmit(&mut self, dest: Destination, payload: Vec<u8>) {
        self.output.transmissions.push(Packet {
            src: self.addr,
            dest,
            payload,
        });
    }

    /// Arm a timer to fire after `delay`.
    pub fn set_timer(&mut self, delay: SimTime, timer_id: u64) {
        self.output.timers.push(TimerRequest { delay, timer_id });
    }
}

// ============================================================================
// Firmware Trait
// ============================================================================

/// The firmware capability seam.
///
/// Implementations hold all protocol state (neighbor tables, routes,
/// sequence counters) privately; the controller never inspects it, only
/// the log lines it emits.
pub trait Firmware: Send {
    /// Reset firmware state to its boot condition.
    ///
    /// Invoked on every boot, including re-boots of a previously running
    /// mote. May arm timers and emit logs.
    fn boot(&mut self, ctx: &mut MoteCtx) -> Result<(), FirmwareError>;

    /// A packet arrived intact from the radio medium.
    fn on_packet(&mut self, packet: &Packet, ctx: &mut MoteCtx) -> Result<(), FirmwareError>;

    /// A previously armed timer fired.
    fn on_timer(&mut self, timer_id: u64, ctx: &mut MoteCtx) -> Result<(), FirmwareError>;

    /// A debug command was injected by the control facade.
    fn on_command(&mut self, command: &Command, ctx: &mut MoteCtx) -> Result<(), FirmwareError>;

    /// Power was restored after a power-off.
    ///
    /// Firmware state is preserved across a power cycle, but any timer
    /// that fired while the mote was off was suppressed; this hook lets
    /// firmware re-arm its periodic timers. Default: do nothing.
    fn powered_on(&mut self, _ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
        Ok(())
    }
}

// ============================================================================
// Mote Runtime
// ============================================================================

/// Power state of a mote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Receiving events and radio traffic.
    On,
    /// All dispatch suppressed; firmware state preserved.
    Off,
}

/// One simulated mote: firmware behind the capability seam, plus power
/// state and a per-mote seeded RNG.
///
/// Motes are created powered off and unbooted; `boot` powers them on and
/// resets firmware. Powering off suppresses packet delivery, timer fires
/// and command injection without touching firmware state.
pub struct MoteRuntime {
    addr: NodeAddr,
    power: PowerState,
    booted: bool,
    firmware: Box<dyn Firmware>,
    rng: ChaCha8Rng,
    router: ChannelRouter,
}

impl MoteRuntime {
    /// Create a mote wrapping the given firmware.
    pub fn new(
        addr: NodeAddr,
        firmware: Box<dyn Firmware>,
        rng_seed: u64,
        router: ChannelRouter,
    ) -> Self {
        MoteRuntime {
            addr,
            power: PowerState::Off,
            booted: false,
            firmware,
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
            router,
        }
    }

    /// This mote's address.
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// Current power state.
    pub fn power(&self) -> PowerState {
        self.power
    }

    /// Whether the mote has ever booted.
    pub fn is_booted(&self) -> bool {
        self.booted
    }

    /// Whether the mote is booted and powered on.
    pub fn is_active(&self) -> bool {
        self.booted && self.power == PowerState::On
    }

    fn run_callback<F>(&mut self, now: SimTime, f: F) -> Result<MoteOutput, FirmwareError>
    where
        F: FnOnce(&mut dyn Firmware, &mut MoteCtx) -> Result<(), FirmwareError>,
    {
        let mut output = MoteOutput::default();
        let mut ctx = MoteCtx {
            addr: self.addr,
            now,
            router: &self.router,
            rng: &mut self.rng,
            output: &mut output,
        };
        f(self.firmware.as_mut(), &mut ctx)?;
        Ok(output)
    }

    fn suppressed(&self, kind: &'static str) -> MoteOutput {
        tracing::debug!(node = %self.addr, kind, "dispatch suppressed at powered-off mote");
        let labels = [("node", self.addr.to_string()), ("kind", kind.to_string())];
        metrics::counter!(metric_defs::MOTE_SUPPRESSED.name, &labels).increment(1);
        MoteOutput::default()
    }

    /// Boot the mote: power on and reset firmware to its boot state.
    pub fn boot(&mut self, now: SimTime) -> Result<MoteOutput, FirmwareError> {
        self.power = PowerState::On;
        self.booted = true;
        self.run_callback(now, |fw, ctx| fw.boot(ctx))
    }

    /// Toggle power without resetting firmware state.
    ///
    /// Powering on a booted mote invokes the firmware's `powered_on` hook
    /// so it can re-arm timers. Idempotent in both directions.
    pub fn set_power(&mut self, on: bool, now: SimTime) -> Result<MoteOutput, FirmwareError> {
        match (self.power, on) {
            (PowerState::Off, true) => {
                self.power = PowerState::On;
                if self.booted {
                    self.run_callback(now, |fw, ctx| fw.powered_on(ctx))
                } else {
                    Ok(MoteOutput::default())
                }
            }
            (PowerState::On, false) => {
                self.power = PowerState::Off;
                Ok(MoteOutput::default())
            }
            _ => Ok(MoteOutput::default()),
        }
    }

    /// Deliver a packet from the radio medium.
    ///
    /// Suppressed while powered off; corrupted packets are dropped here,
    /// modeling a failed CRC check, and never reach firmware.
    pub fn deliver_packet(
        &mut self,
        packet: &Packet,
        corrupted: bool,
        now: SimTime,
    ) -> Result<MoteOutput, FirmwareError> {
        if !self.is_active() {
            return Ok(self.suppressed("packet_delivery"));
        }
        if corrupted {
            tracing::debug!(node = %self.addr, src = %packet.src, "dropping corrupted packet");
            return Ok(MoteOutput::default());
        }
        self.run_callback(now, |fw, ctx| fw.on_packet(packet, ctx))
    }

    /// Fire a firmware timer.
    pub fn fire_timer(&mut self, timer_id: u64, now: SimTime) -> Result<MoteOutput, FirmwareError> {
        if !self.is_active() {
            return Ok(self.suppressed("timer"));
        }
        self.run_callback(now, |fw, ctx| fw.on_timer(timer_id, ctx))
    }

    /// Inject a debug command.
    ///
    /// `SetPower` is handled by the runtime itself: a powered-off mote
    /// must still be able to power back on. All other commands are
    /// suppressed while off.
    pub fn inject_command(
        &mut self,
        command: &Command,
        now: SimTime,
    ) -> Result<MoteOutput, FirmwareError> {
        if let Command::SetPower(on) = command {
            return self.set_power(*on, now);
        }
        if !self.is_active() {
            return Ok(self.suppressed("command"));
        }
        self.run_callback(now, |fw, ctx| fw.on_command(command, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motesim_common::channel::{channels, ChannelRouter};

    /// Minimal firmware that logs every callback it receives.
    struct ProbeFirmware;

    impl Firmware for ProbeFirmware {
        fn boot(&mut self, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            ctx.emit_log(channels::GENERAL, "boot");
            ctx.set_timer(SimTime::from_millis(10), 1);
            Ok(())
        }

        fn on_packet(&mut self, packet: &Packet, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            ctx.emit_log(channels::GENERAL, format!("packet from {}", packet.src));
            Ok(())
        }

        fn on_timer(&mut self, timer_id: u64, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            ctx.emit_log(channels::GENERAL, format!("timer {}", timer_id));
            Ok(())
        }

        fn on_command(&mut self, command: &Command, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            ctx.emit_log(channels::GENERAL, format!("command {}", command.label()));
            Ok(())
        }

        fn powered_on(&mut self, ctx: &mut MoteCtx) -> Result<(), FirmwareError> {
            ctx.emit_log(channels::GENERAL, "powered on");
            Ok(())
        }
    }

    fn probe_mote(router: &ChannelRouter) -> MoteRuntime {
        MoteRuntime::new(NodeAddr::new(1), Box::new(ProbeFirmware), 7, router.clone())
    }

    fn packet() -> Packet {
        Packet::broadcast(NodeAddr::new(2), vec![1, 2, 3])
    }

    #[test]
    fn test_boot_powers_on_and_runs_firmware() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        let mut mote = probe_mote(&router);

        assert!(!mote.is_active());
        let out = mote.boot(SimTime::ZERO).unwrap();
        assert!(mote.is_active());
        assert_eq!(out.timers.len(), 1);
        assert_eq!(router.lines(channels::GENERAL).len(), 1);
    }

    #[test]
    fn test_power_off_suppresses_dispatch() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        let mut mote = probe_mote(&router);
        mote.boot(SimTime::ZERO).unwrap();
        mote.set_power(false, SimTime::ZERO).unwrap();

        let now = SimTime::from_millis(1);
        assert!(mote.deliver_packet(&packet(), false, now).unwrap().is_empty());
        assert!(mote.fire_timer(1, now).unwrap().is_empty());
        assert!(mote
            .inject_command(&Command::NeighborDump, now)
            .unwrap()
            .is_empty());

        // Only the boot line was captured
        assert_eq!(router.lines(channels::GENERAL).len(), 1);
    }

    #[test]
    fn test_power_on_invokes_hook_and_preserves_state() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        let mut mote = probe_mote(&router);
        mote.boot(SimTime::ZERO).unwrap();
        mote.set_power(false, SimTime::ZERO).unwrap();

        // SetPower is honored even while off
        mote.inject_command(&Command::SetPower(true), SimTime::from_millis(5))
            .unwrap();
        assert!(mote.is_active());

        let lines = router.lines(channels::GENERAL);
        assert_eq!(lines.last().unwrap().line, "powered on");
    }

    #[test]
    fn test_set_power_idempotent() {
        let router = ChannelRouter::new();
        let mut mote = probe_mote(&router);
        mote.boot(SimTime::ZERO).unwrap();

        mote.set_power(true, SimTime::ZERO).unwrap();
        assert_eq!(mote.power(), PowerState::On);
        mote.set_power(false, SimTime::ZERO).unwrap();
        mote.set_power(false, SimTime::ZERO).unwrap();
        assert_eq!(mote.power(), PowerState::Off);
    }

    #[test]
    fn test_corrupted_packet_dropped_before_firmware() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        let mut mote = probe_mote(&router);
        mote.boot(SimTime::ZERO).unwrap();

        let out = mote
            .deliver_packet(&packet(), true, SimTime::from_millis(1))
            .unwrap();
        assert!(out.is_empty());
        // No "packet from" line: firmware never saw it
        assert_eq!(router.lines(channels::GENERAL).len(), 1);
    }

    #[test]
    fn test_unbooted_mote_suppresses_power_on_hook() {
        let router = ChannelRouter::new();
        router.subscribe(channels::GENERAL);
        let mut mote = probe_mote(&router);

        mote.set_power(true, SimTime::ZERO).unwrap();
        assert!(router.lines(channels::GENERAL).is_empty());
    }
}
