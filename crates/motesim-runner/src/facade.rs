//! The control facade driving scripts use.
//!
//! One operation per concept: load topology and noise (immutable once the
//! simulation starts), boot motes, toggle channel subscriptions, advance
//! virtual time, and inject debug commands. The facade validates inputs
//! and delegates; it holds no simulation logic of its own.

use crate::{EventLoop, RunnerError, SimulationStats};
use motesim_common::channel::{ChannelRouter, LogLine};
use motesim_common::{Command, EventHandle, NodeAddr, SimTime};
use motesim_model::{
    build_simulation, load_noise, load_noise_from_str, load_topology, load_topology_from_str,
    NodeInfo, NoiseSpec, TopologyModel,
};
use std::path::Path;

/// The simulation control facade.
///
/// ```rust,ignore
/// let mut sim = Sim::new(42);
/// sim.load_topology_str(TOPOLOGY_YAML)?;
/// sim.load_noise_str(NOISE_YAML)?;
/// sim.boot_all()?;
/// sim.add_channel("ROUTING");
/// sim.route_dump(1)?;
/// sim.run_time(5.0)?;
/// for line in sim.lines("ROUTING") { /* ... */ }
/// ```
pub struct Sim {
    seed: u64,
    event_loop: EventLoop,
    router: ChannelRouter,
    topology: Option<TopologyModel>,
    noise: Option<NoiseSpec>,
    /// True once the first mote has booted; topology and noise are
    /// immutable from then on.
    started: bool,
}

impl Sim {
    /// Create a simulation with the given seed.
    pub fn new(seed: u64) -> Self {
        Self::with_parts(seed, ChannelRouter::new(), None)
    }

    /// Create a simulation with an explicit router and optional trace
    /// output.
    pub fn with_parts(
        seed: u64,
        router: ChannelRouter,
        trace_output: Option<Box<dyn std::io::Write>>,
    ) -> Self {
        Sim {
            seed,
            event_loop: EventLoop::new(trace_output),
            router,
            topology: None,
            noise: None,
            started: false,
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn reject_if_started(&self, what: &str) -> Result<(), RunnerError> {
        if self.started {
            return Err(RunnerError::Config(format!(
                "{} is immutable once the simulation has started",
                what
            )));
        }
        Ok(())
    }

    /// Load the network topology from a YAML file.
    pub fn load_topology(&mut self, path: &Path) -> Result<(), RunnerError> {
        self.reject_if_started("topology")?;
        self.topology = Some(load_topology(path)?);
        Ok(())
    }

    /// Load the network topology from a YAML string.
    pub fn load_topology_str(&mut self, yaml: &str) -> Result<(), RunnerError> {
        self.reject_if_started("topology")?;
        self.topology = Some(load_topology_from_str(yaml)?);
        Ok(())
    }

    /// Load the noise model from a YAML file.
    pub fn load_noise(&mut self, path: &Path) -> Result<(), RunnerError> {
        self.reject_if_started("noise model")?;
        self.noise = Some(load_noise(path)?);
        Ok(())
    }

    /// Load the noise model from a YAML string.
    pub fn load_noise_str(&mut self, yaml: &str) -> Result<(), RunnerError> {
        self.reject_if_started("noise model")?;
        self.noise = Some(load_noise_from_str(yaml)?);
        Ok(())
    }

    /// Build the medium and motes on first boot. Without a loaded noise
    /// model, links are perfect.
    fn ensure_started(&mut self) -> Result<(), RunnerError> {
        if self.started {
            return Ok(());
        }
        let Some(topology) = &self.topology else {
            return Err(RunnerError::Config(
                "no topology loaded; call load_topology before booting".to_string(),
            ));
        };
        let noise = self.noise.clone().unwrap_or_else(NoiseSpec::perfect);
        let built = build_simulation(topology, &noise, self.seed, &self.router)?;
        self.event_loop.install(built);
        self.started = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Booting and power
    // ------------------------------------------------------------------

    /// Boot every mote in the topology.
    pub fn boot_all(&mut self) -> Result<(), RunnerError> {
        self.ensure_started()?;
        let addrs: Vec<NodeAddr> = self
            .event_loop
            .node_infos()
            .iter()
            .map(|info| info.address)
            .collect();
        for addr in addrs {
            self.event_loop.boot_mote(addr)?;
        }
        Ok(())
    }

    /// Boot a single mote.
    pub fn boot_node(&mut self, addr: impl Into<NodeAddr>) -> Result<(), RunnerError> {
        self.ensure_started()?;
        self.event_loop.boot_mote(addr.into())
    }

    /// Toggle a mote's power, scheduled at the current virtual time.
    pub fn set_power(
        &mut self,
        addr: impl Into<NodeAddr>,
        on: bool,
    ) -> Result<EventHandle, RunnerError> {
        self.event_loop.inject(addr.into(), Command::SetPower(on))
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Subscribe to a log channel. Idempotent.
    pub fn add_channel(&mut self, channel: &str) {
        self.router.subscribe(channel);
    }

    /// Unsubscribe from a log channel. Idempotent.
    pub fn remove_channel(&mut self, channel: &str) {
        self.router.unsubscribe(channel);
    }

    /// Captured lines for a channel, in arrival order.
    pub fn lines(&self, channel: &str) -> Vec<LogLine> {
        self.router.lines(channel)
    }

    /// Drain the captured lines for a channel.
    pub fn take_lines(&mut self, channel: &str) -> Vec<LogLine> {
        self.router.take_lines(channel)
    }

    // ------------------------------------------------------------------
    // Time control
    // ------------------------------------------------------------------

    /// Advance virtual time by `duration`, dispatching everything due.
    ///
    /// The only way time progresses.
    pub fn advance_time(&mut self, duration: SimTime) -> Result<(), RunnerError> {
        self.event_loop.advance_by(duration)?;
        Ok(())
    }

    /// Advance virtual time by a number of seconds.
    pub fn run_time(&mut self, secs: f64) -> Result<(), RunnerError> {
        self.advance_time(SimTime::from_secs(secs))
    }

    // ------------------------------------------------------------------
    // Command injection
    // ------------------------------------------------------------------

    /// Inject a ping from `src` to `dest`.
    pub fn ping(
        &mut self,
        src: impl Into<NodeAddr>,
        dest: impl Into<NodeAddr>,
        payload: &str,
    ) -> Result<EventHandle, RunnerError> {
        self.event_loop.inject(
            src.into(),
            Command::Ping {
                dest: dest.into(),
                payload: payload.to_string(),
            },
        )
    }

    /// Ask a mote to dump its neighbor table to the NEIGHBOR channel.
    pub fn neighbor_dump(&mut self, addr: impl Into<NodeAddr>) -> Result<EventHandle, RunnerError> {
        self.event_loop.inject(addr.into(), Command::NeighborDump)
    }

    /// Ask a mote to dump its routing table to the ROUTING channel.
    pub fn route_dump(&mut self, addr: impl Into<NodeAddr>) -> Result<EventHandle, RunnerError> {
        self.event_loop.inject(addr.into(), Command::RouteDump)
    }

    /// Open a listening transport server on a mote.
    pub fn test_server(
        &mut self,
        addr: impl Into<NodeAddr>,
        port: u8,
    ) -> Result<EventHandle, RunnerError> {
        self.event_loop
            .inject(addr.into(), Command::TestServer { port })
    }

    /// Open a transport client connection and transfer bytes.
    pub fn test_client(
        &mut self,
        client: impl Into<NodeAddr>,
        dest: impl Into<NodeAddr>,
        src_port: u8,
        dest_port: u8,
        transfer_len: u16,
    ) -> Result<EventHandle, RunnerError> {
        self.event_loop.inject(
            client.into(),
            Command::TestClient {
                dest: dest.into(),
                src_port,
                dest_port,
                transfer_len,
            },
        )
    }

    /// Close a previously opened transport client connection.
    pub fn close_client(
        &mut self,
        client: impl Into<NodeAddr>,
        dest: impl Into<NodeAddr>,
        src_port: u8,
        dest_port: u8,
    ) -> Result<EventHandle, RunnerError> {
        self.event_loop.inject(
            client.into(),
            Command::CloseClient {
                dest: dest.into(),
                src_port,
                dest_port,
            },
        )
    }

    /// Cancel a not-yet-fired scheduled event. No-op if dispatched.
    pub fn cancel(&mut self, handle: EventHandle) {
        self.event_loop.cancel(handle);
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.event_loop.clock()
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        self.event_loop.stats()
    }

    /// The channel router handle.
    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Information about the installed nodes (empty before first boot).
    pub fn node_infos(&self) -> &[NodeInfo] {
        self.event_loop.node_infos()
    }

    /// Whether a mote is booted and powered on.
    pub fn is_active(&self, addr: impl Into<NodeAddr>) -> bool {
        self.event_loop.is_active(addr.into())
    }

    /// Flush the trace recorder, if one was configured.
    pub fn flush_trace(&mut self) -> Result<(), RunnerError> {
        self.event_loop.flush_trace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODE_TOPO: &str = r#"
nodes:
  - address: 1
  - address: 2
edges:
  - from: 1
    to: 2
    symmetric: true
"#;

    #[test]
    fn test_load_after_boot_rejected() {
        let mut sim = Sim::new(1);
        sim.load_topology_str(TWO_NODE_TOPO).unwrap();
        sim.boot_all().unwrap();

        assert!(matches!(
            sim.load_topology_str(TWO_NODE_TOPO),
            Err(RunnerError::Config(_))
        ));
        assert!(matches!(
            sim.load_noise_str("defaults:\n  loss: 0.5\n"),
            Err(RunnerError::Config(_))
        ));
    }

    #[test]
    fn test_boot_without_topology_rejected() {
        let mut sim = Sim::new(1);
        assert!(matches!(sim.boot_all(), Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_run_time_before_topology_is_legal() {
        let mut sim = Sim::new(1);
        sim.run_time(1.0).unwrap();
        assert_eq!(sim.now(), SimTime::from_secs(1.0));
        sim.load_topology_str(TWO_NODE_TOPO).unwrap();
        sim.boot_all().unwrap();
        assert!(sim.is_active(1u16));
    }

    #[test]
    fn test_command_to_unbooted_mote_rejected() {
        let mut sim = Sim::new(1);
        sim.load_topology_str(TWO_NODE_TOPO).unwrap();
        sim.boot_node(1u16).unwrap();

        assert!(sim.route_dump(1u16).is_ok());
        assert!(matches!(
            sim.route_dump(2u16),
            Err(RunnerError::UnknownAddress(_))
        ));
        assert!(matches!(
            sim.ping(42u16, 1u16, "x"),
            Err(RunnerError::UnknownAddress(_))
        ));
    }
}
