//! Determinism tests for the motesim controller.
//!
//! Running the same simulation with the same seed must produce identical
//! results, down to the captured log transcript. Noise decisions come
//! from an explicitly seeded RNG drawn in scheduler order, so a replay
//! with the same seed and the same command sequence is bit-reproducible.

use motesim_common::channel::channels;
use motesim_runner::Sim;
use serial_test::serial;
use std::path::Path;

const CHANNELS: &[&str] = &[
    channels::COMMAND,
    channels::GENERAL,
    channels::NEIGHBOR,
    channels::ROUTING,
];

/// Everything observable from one run, for comparison across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Transcript {
    stats_json: String,
    lines: Vec<String>,
}

/// Run a fixed lossy-network workload and capture the full transcript.
fn run_transcript(seed: u64) -> Transcript {
    let mut sim = Sim::new(seed);
    sim.load_topology(Path::new("tests/line_topology.yaml"))
        .expect("topology fixture");
    sim.load_noise(Path::new("tests/lossy_noise.yaml"))
        .expect("noise fixture");
    for channel in CHANNELS {
        sim.add_channel(channel);
    }
    sim.boot_all().expect("boot");

    sim.run_time(60.0).expect("settle");
    for addr in 1u16..=9 {
        sim.route_dump(addr).expect("route dump");
        sim.neighbor_dump(addr).expect("neighbor dump");
        sim.run_time(5.0).expect("advance");
    }
    sim.ping(1u16, 9u16, "Test").expect("ping");
    sim.run_time(10.0).expect("advance");

    let stats_json = serde_json::to_string(sim.stats()).expect("stats serialize");
    let mut lines = Vec::new();
    for channel in CHANNELS {
        for line in sim.lines(channel) {
            lines.push(format!(
                "{} {} {} {}",
                line.time.as_micros(),
                line.channel,
                line.source,
                line.line
            ));
        }
    }

    Transcript { stats_json, lines }
}

/// Identical seeds must produce identical stats and identical captured
/// log transcripts.
#[test]
#[serial]
fn test_determinism_same_seed() {
    let first = run_transcript(12345);
    let second = run_transcript(12345);

    assert_eq!(
        first.stats_json, second.stats_json,
        "statistics should be identical for identical seeds"
    );
    assert_eq!(
        first.lines, second.lines,
        "captured log transcript should be identical for identical seeds"
    );
}

/// Different seeds on a lossy topology must produce observably different
/// outcomes, proving the seed actually reaches the noise model.
#[test]
#[serial]
fn test_determinism_different_seeds_diverge() {
    let first = run_transcript(1);
    let second = run_transcript(2);

    assert_ne!(
        first, second,
        "different seeds should diverge on a lossy topology"
    );
}

/// Repeated runs stay consistent, not just a lucky pair.
#[test]
#[serial]
fn test_determinism_multiple_runs() {
    let reference = run_transcript(777);
    for _ in 0..2 {
        assert_eq!(reference, run_transcript(777));
    }
}
