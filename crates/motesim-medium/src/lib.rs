//! # motesim-medium
//!
//! Radio medium simulation for motesim.
//!
//! This crate provides:
//! - Link adjacency with per-link gain ([`LinkModel`])
//! - Per-link stochastic loss/corruption/delay parameters ([`NoiseParams`])
//! - The seeded noise sampler ([`NoiseModel`])
//! - Delivery planning for transmissions ([`RadioMedium`])
//!
//! ## Determinism
//!
//! Every stochastic decision is drawn from a ChaCha8 RNG owned by the
//! noise model and seeded explicitly at construction; there is no ambient
//! randomness anywhere. Candidate receivers iterate in `BTreeMap` order
//! and each link keeps an attempt counter, so a replay with the same seed
//! and the same event order reproduces identical delivery outcomes.

use motesim_common::{NodeAddr, SimTime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised when configuring the medium.
#[derive(Debug, Error)]
pub enum MediumError {
    /// A probability parameter is outside [0, 1].
    #[error("{name} must be within [0, 1], got {value}")]
    InvalidProbability {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// A delay parameter is negative or not finite.
    #[error("{name} must be a non-negative finite number, got {value}")]
    InvalidDelay {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },
}

// ============================================================================
// Link Model
// ============================================================================

/// Static parameters of a directed radio link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkParams {
    /// Link gain in dB, as recorded in the topology input.
    pub gain_db: f64,
}

/// Directed link adjacency between motes.
///
/// Uses `BTreeMap` for deterministic iteration order, which is critical
/// for simulation reproducibility: the order in which receivers are
/// considered fixes the order of noise-model RNG draws.
#[derive(Debug, Clone, Default)]
pub struct LinkModel {
    edges: BTreeMap<(NodeAddr, NodeAddr), LinkParams>,
}

impl LinkModel {
    /// Create an empty link model.
    pub fn new() -> Self {
        LinkModel::default()
    }

    /// Add a directed link between two motes.
    pub fn add_link(&mut self, from: NodeAddr, to: NodeAddr, gain_db: f64) {
        self.edges.insert((from, to), LinkParams { gain_db });
    }

    /// Get the parameters of a directed link, if present.
    pub fn get_link(&self, from: NodeAddr, to: NodeAddr) -> Option<&LinkParams> {
        self.edges.get(&(from, to))
    }

    /// All motes that can hear a given transmitter, in address order.
    pub fn receivers(&self, from: NodeAddr) -> impl Iterator<Item = (NodeAddr, &LinkParams)> {
        self.edges
            .iter()
            .filter(move |((f, _), _)| *f == from)
            .map(|((_, to), params)| (*to, params))
    }

    /// Number of directed links.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the model has no links.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

// ============================================================================
// Noise Parameters
// ============================================================================

/// Stochastic parameters of a directed link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NoiseParams {
    /// Probability that a transmission on this link is lost entirely.
    #[serde(default)]
    pub loss: f64,
    /// Probability that a delivered transmission arrives corrupted.
    #[serde(default)]
    pub corruption: f64,
    /// Mean propagation delay in milliseconds.
    #[serde(default = "NoiseParams::default_delay_ms")]
    pub delay_ms: f64,
    /// Standard deviation of the Gaussian delay jitter in milliseconds.
    #[serde(default)]
    pub delay_jitter_ms: f64,
}

impl NoiseParams {
    fn default_delay_ms() -> f64 {
        1.0
    }

    /// Parameters for a perfect link: no loss, no corruption, fixed delay.
    pub fn perfect() -> Self {
        NoiseParams {
            loss: 0.0,
            corruption: 0.0,
            delay_ms: Self::default_delay_ms(),
            delay_jitter_ms: 0.0,
        }
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<(), MediumError> {
        for (name, value) in [("loss", self.loss), ("corruption", self.corruption)] {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(MediumError::InvalidProbability { name, value });
            }
        }
        for (name, value) in [
            ("delay_ms", self.delay_ms),
            ("delay_jitter_ms", self.delay_jitter_ms),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(MediumError::InvalidDelay { name, value });
            }
        }
        Ok(())
    }
}

impl Default for NoiseParams {
    fn default() -> Self {
        NoiseParams::perfect()
    }
}

// ============================================================================
// Noise Model
// ============================================================================

/// Outcome of sampling the noise model for one link attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkOutcome {
    /// The transmission is lost on this link.
    Dropped,
    /// The transmission arrives after the given delay.
    Delivered {
        /// Whether the payload was corrupted in flight.
        corrupted: bool,
        /// Sampled propagation delay.
        delay: SimTime,
    },
}

/// Seeded stochastic signal model, sampled per (link, attempt).
///
/// Owns its RNG so that noise decisions are a pure function of the seed,
/// the link, the per-link attempt count, and the draw order fixed by the
/// scheduler's total event order.
pub struct NoiseModel {
    defaults: NoiseParams,
    links: BTreeMap<(NodeAddr, NodeAddr), NoiseParams>,
    rng: ChaCha8Rng,
    attempts: BTreeMap<(NodeAddr, NodeAddr), u64>,
}

impl NoiseModel {
    /// Create a noise model with perfect-link defaults.
    pub fn new(seed: u64) -> Self {
        NoiseModel {
            defaults: NoiseParams::perfect(),
            links: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            attempts: BTreeMap::new(),
        }
    }

    /// Replace the default parameters applied to links without overrides.
    pub fn set_defaults(&mut self, defaults: NoiseParams) {
        self.defaults = defaults;
    }

    /// Override the parameters of one directed link.
    pub fn set_link_params(&mut self, from: NodeAddr, to: NodeAddr, params: NoiseParams) {
        self.links.insert((from, to), params);
    }

    /// Effective parameters for a directed link.
    pub fn params_for(&self, from: NodeAddr, to: NodeAddr) -> &NoiseParams {
        self.links.get(&(from, to)).unwrap_or(&self.defaults)
    }

    /// Number of attempts sampled so far on a directed link.
    pub fn attempts_for(&self, from: NodeAddr, to: NodeAddr) -> u64 {
        self.attempts.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Sample the outcome of one transmission attempt on a link.
    pub fn decide(&mut self, from: NodeAddr, to: NodeAddr) -> LinkOutcome {
        *self.attempts.entry((from, to)).or_insert(0) += 1;
        let params = *self.links.get(&(from, to)).unwrap_or(&self.defaults);

        if params.loss > 0.0 && self.rng.gen::<f64>() < params.loss {
            return LinkOutcome::Dropped;
        }

        let corrupted = params.corruption > 0.0 && self.rng.gen::<f64>() < params.corruption;

        let delay_ms = if params.delay_jitter_ms > 0.0 {
            // Normal::new only fails for non-finite or negative std dev,
            // which validate() has already rejected.
            let normal = Normal::new(params.delay_ms, params.delay_jitter_ms)
                .expect("validated delay distribution");
            normal.sample(&mut self.rng).max(0.0)
        } else {
            params.delay_ms
        };

        LinkOutcome::Delivered {
            corrupted,
            delay: SimTime::from_micros((delay_ms * 1000.0) as u64),
        }
    }
}

// ============================================================================
// Radio Medium
// ============================================================================

/// One planned packet delivery resulting from a transmission.
#[derive(Debug, Clone)]
pub struct DeliveryPlan {
    /// Receiving mote.
    pub dest: NodeAddr,
    /// Virtual time at which the packet arrives.
    pub deliver_at: SimTime,
    /// Whether the packet arrives corrupted.
    pub corrupted: bool,
    /// Gain of the link the packet traversed.
    pub gain_db: f64,
}

/// The radio medium: applies topology adjacency and the noise model to
/// decide, for each transmission, which motes receive it and with what
/// fidelity and delay.
///
/// The medium knows nothing about mote power state; the scheduler filters
/// out powered-off receivers when converting plans into delivery events.
pub struct RadioMedium {
    links: LinkModel,
    noise: NoiseModel,
}

impl RadioMedium {
    /// Create a medium from a link model and a noise model.
    pub fn new(links: LinkModel, noise: NoiseModel) -> Self {
        RadioMedium { links, noise }
    }

    /// The link adjacency.
    pub fn links(&self) -> &LinkModel {
        &self.links
    }

    /// Plan the deliveries for a transmission started at `at`.
    ///
    /// Consults adjacency for candidate receivers (in address order) and
    /// the noise model per candidate link. Dropped links produce no plan.
    pub fn plan_transmission(&mut self, sender: NodeAddr, at: SimTime) -> Vec<DeliveryPlan> {
        let mut plans = Vec::new();
        // Collect receivers first: the noise model needs &mut self.
        let candidates: Vec<(NodeAddr, f64)> = self
            .links
            .receivers(sender)
            .map(|(to, params)| (to, params.gain_db))
            .collect();

        for (dest, gain_db) in candidates {
            match self.noise.decide(sender, dest) {
                LinkOutcome::Dropped => {}
                LinkOutcome::Delivered { corrupted, delay } => {
                    plans.push(DeliveryPlan {
                        dest,
                        deliver_at: at + delay,
                        corrupted,
                        gain_db,
                    });
                }
            }
        }

        plans
    }
}
