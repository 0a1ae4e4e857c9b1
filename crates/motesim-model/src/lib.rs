//! # motesim-model
//!
//! YAML topology/noise loading and simulation building for motesim.
//!
//! This crate provides:
//! - YAML schema types for topology and noise inputs
//! - Loading from files and strings with fail-fast validation
//! - `build_simulation`, which turns validated inputs into the radio
//!   medium and mote runtimes the event scheduler drives
//!
//! Topology and noise are consumed once; the control facade rejects
//! re-loading after any mote has booted.

use motesim_common::channel::ChannelRouter;
use motesim_common::NodeAddr;
use motesim_firmware::{Firmware, MoteRuntime, ReferenceFirmware};
use motesim_medium::{LinkModel, MediumError, NoiseModel, NoiseParams, RadioMedium};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading or building a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Two nodes share an address.
    #[error("Duplicate node address: {0}")]
    DuplicateNode(NodeAddr),

    /// An edge references an unknown node or itself.
    #[error("Invalid edge: {from} -> {to}")]
    InvalidEdge {
        /// Source address.
        from: NodeAddr,
        /// Destination address.
        to: NodeAddr,
    },

    /// A parameter failed range validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A noise parameter is out of range.
    #[error(transparent)]
    Medium(#[from] MediumError),
}

// ============================================================================
// Topology Schema
// ============================================================================

/// Planar position of a node, carried for display and future propagation
/// models; the controller itself only uses explicit edges.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Position {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeYaml {
    /// Unique mote address.
    address: u16,
    /// Optional human-readable name.
    #[serde(default)]
    name: Option<String>,
    /// Optional position.
    #[serde(default)]
    position: Option<Position>,
}

fn default_gain_db() -> f64 {
    -54.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EdgeYaml {
    from: u16,
    to: u16,
    /// Link gain in dB.
    #[serde(default = "default_gain_db")]
    gain_db: f64,
    /// When true, also adds the reverse edge with the same gain.
    #[serde(default)]
    symmetric: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TopologyYaml {
    #[serde(default)]
    nodes: Vec<NodeYaml>,
    #[serde(default)]
    edges: Vec<EdgeYaml>,
}

/// One node of a validated topology.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Mote address.
    pub address: NodeAddr,
    /// Display name; defaults to the address.
    pub name: String,
    /// Optional planar position.
    pub position: Option<Position>,
}

/// A validated topology: node identities plus directed link adjacency.
#[derive(Debug, Clone)]
pub struct TopologyModel {
    nodes: BTreeMap<NodeAddr, NodeSpec>,
    edges: Vec<(NodeAddr, NodeAddr, f64)>,
}

impl TopologyModel {
    /// The nodes of the topology, in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    /// Whether a node address exists.
    pub fn contains(&self, addr: NodeAddr) -> bool {
        self.nodes.contains_key(&addr)
    }

    /// The directed edges (from, to, gain_db).
    pub fn edges(&self) -> &[(NodeAddr, NodeAddr, f64)] {
        &self.edges
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the topology has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Load a topology from a YAML file.
pub fn load_topology(path: &Path) -> Result<TopologyModel, ModelError> {
    load_topology_from_str(&std::fs::read_to_string(path)?)
}

/// Parse a topology from a YAML string.
pub fn load_topology_from_str(yaml: &str) -> Result<TopologyModel, ModelError> {
    let parsed: TopologyYaml = serde_yaml::from_str(yaml)?;

    let mut nodes = BTreeMap::new();
    for node in parsed.nodes {
        let addr = NodeAddr::new(node.address);
        let spec = NodeSpec {
            address: addr,
            name: node.name.unwrap_or_else(|| addr.to_string()),
            position: node.position,
        };
        if nodes.insert(addr, spec).is_some() {
            return Err(ModelError::DuplicateNode(addr));
        }
    }

    let mut edges = Vec::new();
    for edge in parsed.edges {
        let from = NodeAddr::new(edge.from);
        let to = NodeAddr::new(edge.to);
        if from == to || !nodes.contains_key(&from) || !nodes.contains_key(&to) {
            return Err(ModelError::InvalidEdge { from, to });
        }
        if !edge.gain_db.is_finite() {
            return Err(ModelError::InvalidConfig(format!(
                "gain_db for edge {} -> {} is not finite",
                from, to
            )));
        }
        edges.push((from, to, edge.gain_db));
        if edge.symmetric {
            edges.push((to, from, edge.gain_db));
        }
    }

    Ok(TopologyModel { nodes, edges })
}

// ============================================================================
// Noise Schema
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoiseLinkYaml {
    from: u16,
    to: u16,
    #[serde(default)]
    loss: Option<f64>,
    #[serde(default)]
    corruption: Option<f64>,
    #[serde(default)]
    delay_ms: Option<f64>,
    #[serde(default)]
    delay_jitter_ms: Option<f64>,
    /// When true, also applies to the reverse link.
    #[serde(default)]
    symmetric: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoiseYaml {
    /// Parameters applied to every link without an override.
    #[serde(default)]
    defaults: Option<NoiseParams>,
    /// Per-link overrides of individual fields.
    #[serde(default)]
    links: Vec<NoiseLinkYaml>,
}

/// A validated noise specification.
#[derive(Debug, Clone)]
pub struct NoiseSpec {
    /// Default parameters for links without an override.
    pub defaults: NoiseParams,
    /// Per-link overrides, fully resolved against the defaults.
    pub links: Vec<(NodeAddr, NodeAddr, NoiseParams)>,
}

impl NoiseSpec {
    /// A specification describing perfect links.
    pub fn perfect() -> Self {
        NoiseSpec {
            defaults: NoiseParams::perfect(),
            links: Vec::new(),
        }
    }
}

/// Load a noise specification from a YAML file.
pub fn load_noise(path: &Path) -> Result<NoiseSpec, ModelError> {
    load_noise_from_str(&std::fs::read_to_string(path)?)
}

/// Parse a noise specification from a YAML string.
pub fn load_noise_from_str(yaml: &str) -> Result<NoiseSpec, ModelError> {
    let parsed: NoiseYaml = serde_yaml::from_str(yaml)?;
    let defaults = parsed.defaults.unwrap_or_else(NoiseParams::perfect);
    defaults.validate()?;

    let mut links = Vec::new();
    for link in parsed.links {
        let from = NodeAddr::new(link.from);
        let to = NodeAddr::new(link.to);
        if from == to {
            return Err(ModelError::InvalidEdge { from, to });
        }
        // Resolve: defaults, overridden by whichever fields are present.
        let params = NoiseParams {
            loss: link.loss.unwrap_or(defaults.loss),
            corruption: link.corruption.unwrap_or(defaults.corruption),
            delay_ms: link.delay_ms.unwrap_or(defaults.delay_ms),
            delay_jitter_ms: link.delay_jitter_ms.unwrap_or(defaults.delay_jitter_ms),
        };
        params.validate()?;
        links.push((from, to, params));
        if link.symmetric {
            links.push((to, from, params));
        }
    }

    Ok(NoiseSpec { defaults, links })
}

// ============================================================================
// Simulation Building
// ============================================================================

/// Information about a built node for display purposes.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Mote address.
    pub address: NodeAddr,
    /// Display name.
    pub name: String,
    /// Optional planar position.
    pub position: Option<Position>,
}

/// Result of building a simulation from topology and noise inputs.
pub struct BuiltSimulation {
    /// The radio medium.
    pub medium: RadioMedium,
    /// Mote runtimes, keyed by address.
    pub motes: BTreeMap<NodeAddr, MoteRuntime>,
    /// Information about each node for display.
    pub node_infos: Vec<NodeInfo>,
}

/// Build a simulation with the stock reference firmware on every mote.
pub fn build_simulation(
    topology: &TopologyModel,
    noise: &NoiseSpec,
    seed: u64,
    router: &ChannelRouter,
) -> Result<BuiltSimulation, ModelError> {
    build_simulation_with(topology, noise, seed, router, |_| {
        Box::new(ReferenceFirmware::default())
    })
}

/// Build a simulation with a custom firmware per mote.
///
/// The factory decouples the controller from any specific protocol stack:
/// tests and alternative firmwares plug in here.
pub fn build_simulation_with<F>(
    topology: &TopologyModel,
    noise: &NoiseSpec,
    seed: u64,
    router: &ChannelRouter,
    firmware_factory: F,
) -> Result<BuiltSimulation, ModelError>
where
    F: Fn(NodeAddr) -> Box<dyn Firmware>,
{
    // Deterministic build RNG: per-mote seeds and the noise seed derive
    // from the simulation seed.
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut links = LinkModel::new();
    for (from, to, gain_db) in topology.edges() {
        links.add_link(*from, *to, *gain_db);
    }

    let mut noise_model = NoiseModel::new(rng.gen());
    noise_model.set_defaults(noise.defaults);
    for (from, to, params) in &noise.links {
        if !topology.contains(*from) || !topology.contains(*to) {
            return Err(ModelError::InvalidEdge {
                from: *from,
                to: *to,
            });
        }
        noise_model.set_link_params(*from, *to, *params);
    }

    // BTreeMap iteration keeps per-mote seed assignment deterministic.
    let mut motes = BTreeMap::new();
    let mut node_infos = Vec::new();
    for spec in topology.nodes() {
        let mote_seed: u64 = rng.gen();
        log::debug!("mote {} ({}): seed {:#x}", spec.address, spec.name, mote_seed);
        motes.insert(
            spec.address,
            MoteRuntime::new(
                spec.address,
                firmware_factory(spec.address),
                mote_seed,
                router.clone(),
            ),
        );
        node_infos.push(NodeInfo {
            address: spec.address,
            name: spec.name.clone(),
            position: spec.position,
        });
    }

    Ok(BuiltSimulation {
        medium: RadioMedium::new(links, noise_model),
        motes,
        node_infos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODE_TOPO: &str = r#"
nodes:
  - address: 1
  - address: 2
    name: "relay"
edges:
  - from: 1
    to: 2
    gain_db: -50.0
    symmetric: true
"#;

    #[test]
    fn test_load_topology() {
        let topo = load_topology_from_str(TWO_NODE_TOPO).unwrap();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo.edges().len(), 2);
        assert!(topo.contains(NodeAddr::new(1)));
        let names: Vec<&str> = topo.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["1", "relay"]);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let yaml = "nodes:\n  - address: 1\n  - address: 1\n";
        assert!(matches!(
            load_topology_from_str(yaml),
            Err(ModelError::DuplicateNode(addr)) if addr == NodeAddr::new(1)
        ));
    }

    #[test]
    fn test_edge_to_unknown_node_rejected() {
        let yaml = "nodes:\n  - address: 1\nedges:\n  - from: 1\n    to: 5\n";
        assert!(matches!(
            load_topology_from_str(yaml),
            Err(ModelError::InvalidEdge { .. })
        ));
    }

    #[test]
    fn test_self_edge_rejected() {
        let yaml = "nodes:\n  - address: 1\nedges:\n  - from: 1\n    to: 1\n";
        assert!(matches!(
            load_topology_from_str(yaml),
            Err(ModelError::InvalidEdge { .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "nodes:\n  - address: 1\n    battery: 3\n";
        assert!(matches!(
            load_topology_from_str(yaml),
            Err(ModelError::Yaml(_))
        ));
    }

    #[test]
    fn test_noise_defaults_and_overrides() {
        let yaml = r#"
defaults:
  loss: 0.1
  delay_ms: 2.0
links:
  - from: 1
    to: 2
    loss: 0.5
    symmetric: true
"#;
        let spec = load_noise_from_str(yaml).unwrap();
        assert!((spec.defaults.loss - 0.1).abs() < 1e-9);
        assert_eq!(spec.links.len(), 2);
        let (_, _, params) = spec.links[0];
        // Overridden field
        assert!((params.loss - 0.5).abs() < 1e-9);
        // Inherited from defaults
        assert!((params.delay_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_noise_invalid_probability_rejected() {
        let yaml = "defaults:\n  loss: 1.5\n";
        assert!(matches!(
            load_noise_from_str(yaml),
            Err(ModelError::Medium(_))
        ));
    }

    #[test]
    fn test_build_simulation() {
        let topo = load_topology_from_str(TWO_NODE_TOPO).unwrap();
        let router = ChannelRouter::new();
        let built = build_simulation(&topo, &NoiseSpec::perfect(), 42, &router).unwrap();
        assert_eq!(built.motes.len(), 2);
        assert_eq!(built.medium.links().len(), 2);
        assert_eq!(built.node_infos.len(), 2);
        // Motes start unbooted
        assert!(!built.motes[&NodeAddr::new(1)].is_active());
    }

    #[test]
    fn test_build_rejects_noise_for_unknown_node() {
        let topo = load_topology_from_str(TWO_NODE_TOPO).unwrap();
        let noise = NoiseSpec {
            defaults: NoiseParams::perfect(),
            links: vec![(NodeAddr::new(1), NodeAddr::new(42), NoiseParams::perfect())],
        };
        let router = ChannelRouter::new();
        assert!(matches!(
            build_simulation(&topo, &noise, 42, &router),
            Err(ModelError::InvalidEdge { .. })
        ));
    }
}
