use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gbn_abstract::{EngineConfig, SimConfig, TestScenario};
use gbn_engine::{EngineStats, Rdt};
use gbn_simulator::{NodeId, Simulator, scenario_runner};
use gbn_udp::{UdpOptions, UdpSubstrate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Deterministic virtual-time simulation.
    Sim,
    /// Two threaded endpoints over loopback UDP.
    Udp,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Go-Back-N transport simulator")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Sim)]
    mode: Mode,

    /// Load a scenario from disk (sim mode only).
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Write a JSON trace of the finished run.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Protocol window size.
    #[arg(long)]
    window: Option<u16>,

    /// Retransmission timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Packet loss probability applied in both directions.
    #[arg(long)]
    loss: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Number of payloads to transfer when no scenario is given.
    #[arg(long, default_value_t = 30)]
    count: u32,
}

/// Result of a run over real sockets.
#[derive(Debug, Serialize)]
struct UdpReport {
    engine: EngineConfig,
    drop_rate: f64,
    seed: u64,
    payloads: u32,
    elapsed_ms: u128,
    delivered_in_order: bool,
    sender_stats: EngineStats,
    receiver_stats: EngineStats,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("gbn-sim starting…");

    match args.mode {
        Mode::Sim => {
            let sim = if let Some(path) = &args.scenario {
                let mut scenario = load_scenario(path)?;
                args.override_scenario(&mut scenario);
                scenario_runner::run(&scenario)?
            } else {
                run_default_sim(&args)?
            };
            print_summary(&sim);
            if let Some(trace_path) = &args.trace_out {
                write_trace(trace_path, &sim.export_report())?;
            }
        }
        Mode::Udp => {
            if args.scenario.is_some() {
                bail!("--scenario is only supported in sim mode");
            }
            let report = run_udp(&args)?;
            info!(
                "UDP transfer of {} payloads finished in {} ms (in order: {})",
                report.payloads, report.elapsed_ms, report.delivered_in_order
            );
            if let Some(trace_path) = &args.trace_out {
                write_trace(trace_path, &report)?;
            }
        }
    }

    Ok(())
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(w) = self.window {
            config.window_size = w;
        }
        if let Some(t) = self.timeout_ms {
            config.timeout_ms = t;
        }
        config
    }

    /// Command-line flags win over the values in the scenario file.
    fn override_scenario(&self, scenario: &mut TestScenario) {
        if self.window.is_some() {
            scenario.engine.window_size = self.window;
        }
        if self.timeout_ms.is_some() {
            scenario.engine.timeout_ms = self.timeout_ms;
        }
        if self.loss.is_some() {
            scenario.config.loss_rate = self.loss;
        }
        if self.seed.is_some() {
            scenario.config.seed = self.seed;
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn run_default_sim(args: &Args) -> Result<Simulator> {
    let mut sim = build_default_sim(args)?;
    info!("Starting default headless simulation…");
    let limit = scenario_runner::DEFAULT_MAX_DURATION_MS.max(u64::from(args.count) * 10);
    if !sim.run_for(limit)? {
        bail!("Simulation did not finish within {limit} ms");
    }
    info!("Simulation complete.");
    Ok(sim)
}

fn build_default_sim(args: &Args) -> Result<Simulator> {
    let config = SimConfig {
        loss_rate: args.loss.unwrap_or(0.1),
        min_latency: 10,
        max_latency: 100,
        seed: args.seed.unwrap_or(42),
        ..Default::default()
    };
    let mut sim = Simulator::new(config, args.engine_config())?;
    for i in 0..args.count {
        sim.schedule_app_send(u64::from(i) * 10, format!("Packet {i}").into_bytes());
    }
    Ok(sim)
}

fn print_summary(sim: &Simulator) {
    let stats = sim.engine(NodeId::Sender).stats();
    info!(
        "{} of {} payloads delivered in {} ms; {} DATA packets on the wire ({} timeout bursts, {} fast retransmits)",
        sim.delivered(NodeId::Receiver).len(),
        sim.sent(NodeId::Sender).len(),
        sim.current_time(),
        sim.sender_packet_count,
        stats.timeout_bursts,
        stats.fast_retransmit_bursts
    );
}

fn run_udp(args: &Args) -> Result<UdpReport> {
    let engine = args.engine_config();
    let options = UdpOptions {
        drop_rate: args.loss.unwrap_or(0.0),
        seed: args.seed.unwrap_or(42),
        ..Default::default()
    };
    let (a, b) =
        UdpSubstrate::loopback_pair(options.clone()).context("Failed to open UDP sockets")?;
    info!(
        sender = %a.local_addr()?,
        receiver = %b.local_addr()?,
        "running over loopback UDP"
    );

    let mut sender = Rdt::new(engine.clone(), a)?;
    let mut receiver = Rdt::new(engine.clone(), b)?;
    sender.start()?;
    receiver.start()?;

    let count = args.count;
    let started = Instant::now();
    let reader = thread::spawn(move || -> Result<_> {
        let mut in_order = true;
        for i in 0..count {
            let payload = receiver.receive()?;
            in_order &= payload == format!("Packet {i}").into_bytes();
        }
        Ok((receiver, in_order))
    });

    for i in 0..count {
        sender.send(format!("Packet {i}").into_bytes())?;
    }

    let (mut receiver, delivered_in_order) = reader
        .join()
        .map_err(|_| anyhow!("receiver thread panicked"))??;
    let sender_stats = sender.stop()?;
    let receiver_stats = receiver.stop()?;

    Ok(UdpReport {
        engine,
        drop_rate: options.drop_rate,
        seed: options.seed,
        payloads: count,
        elapsed_ms: started.elapsed().as_millis(),
        delivered_in_order,
        sender_stats,
        receiver_stats,
    })
}

fn load_scenario(path: &Path) -> Result<TestScenario> {
    scenario_runner::load_scenario(path)
        .with_context(|| format!("Failed to load scenario {}", path.display()))
}

fn write_trace(path: &Path, report: &impl Serialize) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sim_delivers_everything() {
        let args = Args::parse_from(["gbn-sim", "--count", "5", "--seed", "3"]);
        let sim = run_default_sim(&args).unwrap();
        assert_eq!(sim.delivered(NodeId::Receiver).len(), 5);
    }

    #[test]
    fn default_sim_gives_up_on_a_dead_link() {
        let args = Args::parse_from(["gbn-sim", "--loss", "1.0", "--count", "1"]);
        let err = run_default_sim(&args).err().expect("run should time out");
        assert!(err.to_string().contains("did not finish"), "{err}");
    }
}
