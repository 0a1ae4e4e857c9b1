//! # motesim
//!
//! CLI runner for the motesim simulation controller.
//!
//! Loads a topology (and optionally a noise model), boots the network,
//! subscribes to log channels, and either advances virtual time for a
//! fixed duration or executes a scenario file of timed commands.

use clap::{Parser, Subcommand};
use motesim_common::channel::ChannelRouter;
use motesim_metrics::metric_defs;
use motesim_runner::{RunnerError, Sim, SimTime};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Supported formats:
/// - Plain number: `60` (interpreted as seconds)
/// - With unit suffix: `60s`, `10m`, `2h`, `1d`
/// - Combined units: `1h30m`, `2d12h`
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
        } else {
            if current_number.is_empty() {
                return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
            }
            let value: f64 = current_number
                .parse()
                .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
            let multiplier = match c {
                's' => 1.0,
                'm' => 60.0,
                'h' => 3600.0,
                'd' => 86400.0,
                _ => {
                    return Err(format!(
                        "Unknown duration unit '{}' in '{}'. Use s, m, h, or d.",
                        c, s
                    ))
                }
            };
            total_seconds += value * multiplier;
            current_number.clear();
        }
    }

    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if total_seconds == 0.0 && !s.is_empty() {
        return Err(format!("Invalid duration format: '{}'", s));
    }

    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// motesim - wireless sensor network simulation controller
#[derive(Parser, Debug)]
#[command(name = "motesim")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation from a topology file
    Run(RunConfig),
    /// List all metrics with descriptions and labels
    Metrics,
}

/// Configuration for running a simulation
#[derive(Parser, Debug)]
struct RunConfig {
    /// Path to the topology YAML file
    topology: PathBuf,

    /// Path to the noise model YAML file (perfect links if omitted)
    #[arg(long)]
    noise: Option<PathBuf>,

    /// Random seed for reproducible runs
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Virtual duration to simulate (e.g. 600, 600s, 10m); ignored when
    /// a scenario file drives the clock
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    duration: f64,

    /// Log channel to subscribe to (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Scenario file of timed commands; when given, the scenario is in
    /// full control of booting and time advancement
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Write a JSON event trace to this file
    #[arg(long)]
    trace: Option<PathBuf>,
}

// ============================================================================
// Scenario Files
// ============================================================================

/// One step of a scenario file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum Step {
    /// Advance virtual time by this many seconds.
    RunTime(f64),
    /// Subscribe to a log channel.
    AddChannel(String),
    /// Unsubscribe from a log channel.
    RemoveChannel(String),
    /// Boot every mote.
    BootAll,
    /// Boot a single mote.
    BootNode(u16),
    /// Inject a ping.
    Ping { from: u16, to: u16, payload: String },
    /// Dump a mote's neighbor table.
    NeighborDump { address: u16 },
    /// Dump a mote's routing table.
    RouteDump { address: u16 },
    /// Open a transport server.
    TestServer { address: u16, port: u8 },
    /// Open a transport client connection.
    TestClient {
        client: u16,
        dest: u16,
        src_port: u8,
        dest_port: u8,
        transfer: u16,
    },
    /// Close a transport client connection.
    CloseClient {
        client: u16,
        dest: u16,
        src_port: u8,
        dest_port: u8,
    },
    /// Toggle a mote's power.
    SetPower { address: u16, powered: bool },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    steps: Vec<Step>,
}

fn run_scenario(sim: &mut Sim, path: &Path, stop: &AtomicBool) -> Result<(), RunnerError> {
    let yaml = std::fs::read_to_string(path)?;
    let scenario: Scenario = serde_yaml::from_str(&yaml)
        .map_err(|e| RunnerError::Config(format!("scenario parse error: {}", e)))?;

    for step in scenario.steps {
        if stop.load(Ordering::Relaxed) {
            tracing::info!("stop requested, abandoning scenario");
            break;
        }
        match step {
            Step::RunTime(secs) => sim.run_time(secs)?,
            Step::AddChannel(name) => sim.add_channel(&name),
            Step::RemoveChannel(name) => sim.remove_channel(&name),
            Step::BootAll => sim.boot_all()?,
            Step::BootNode(addr) => sim.boot_node(addr)?,
            Step::Ping { from, to, payload } => {
                sim.ping(from, to, &payload)?;
            }
            Step::NeighborDump { address } => {
                sim.neighbor_dump(address)?;
            }
            Step::RouteDump { address } => {
                sim.route_dump(address)?;
            }
            Step::TestServer { address, port } => {
                sim.test_server(address, port)?;
            }
            Step::TestClient {
                client,
                dest,
                src_port,
                dest_port,
                transfer,
            } => {
                sim.test_client(client, dest, src_port, dest_port, transfer)?;
            }
            Step::CloseClient {
                client,
                dest,
                src_port,
                dest_port,
            } => {
                sim.close_client(client, dest, src_port, dest_port)?;
            }
            Step::SetPower { address, powered } => {
                sim.set_power(address, powered)?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Run Command
// ============================================================================

fn run(config: RunConfig) -> Result<(), RunnerError> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let trace_output: Option<Box<dyn std::io::Write>> = match &config.trace {
        Some(path) => Some(Box::new(std::fs::File::create(path)?)),
        None => None,
    };

    let router = ChannelRouter::with_echo();
    let mut sim = Sim::with_parts(config.seed, router, trace_output);

    sim.load_topology(&config.topology)?;
    if let Some(noise) = &config.noise {
        sim.load_noise(noise)?;
    }
    for channel in &config.channels {
        sim.add_channel(channel);
    }

    if let Some(scenario) = &config.scenario {
        run_scenario(&mut sim, scenario, &stop)?;
    } else {
        sim.boot_all()?;
        // Advance in one-second slices so Ctrl-C stays responsive.
        let mut remaining = config.duration;
        while remaining > 0.0 && !stop.load(Ordering::Relaxed) {
            let slice = remaining.min(1.0);
            sim.advance_time(SimTime::from_secs(slice))?;
            remaining -= slice;
        }
    }

    sim.flush_trace()?;

    let stats = sim.stats();
    println!();
    println!("Simulation complete:");
    println!("  virtual time:       {:.3}s", sim.now().as_secs_f64());
    println!("  events dispatched:  {}", stats.events_dispatched);
    println!("  commands injected:  {}", stats.commands_injected);
    println!("  packets tx:         {}", stats.packets_transmitted);
    println!("  packets delivered:  {}", stats.packets_delivered);
    println!("  packets dropped:    {}", stats.packets_dropped);
    println!("  packets corrupted:  {}", stats.packets_corrupted);
    println!("  dispatch errors:    {}", stats.dispatch_errors);
    println!("  log lines captured: {}", sim.router().total_captured());

    Ok(())
}

fn list_metrics() {
    for metric in metric_defs::ALL {
        println!("{} ({})", metric.name, metric.kind);
        if !metric.description.is_empty() {
            println!("    {}", metric.description);
        }
        if !metric.labels.is_empty() {
            println!("    labels: {}", metric.labels.join(", "));
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => {
            if let Err(err) = run(config) {
                eprintln!("error: {}", err);
                std::process::exit(1);
            }
        }
        Commands::Metrics => list_metrics(),
    }
}
