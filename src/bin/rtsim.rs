//! rtsim: run energy-aware real-time scheduling simulations.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use rtsim::scenario::{self, Scenario};
use rtsim::taskgen::random_taskset;
use rtsim::{Platform, SimFormat, Simulator};

/// Run energy-aware real-time scheduling simulations.
#[derive(Parser)]
#[command(name = "rtsim")]
struct Cli {
    /// Path to a JSON scenario file.
    scenario: Option<PathBuf>,

    /// Simulate a random periodic task set with this many tasks on the
    /// reference big.LITTLE board instead of loading a scenario.
    #[arg(long, value_name = "N", conflicts_with = "scenario")]
    random: Option<usize>,

    /// Total utilization of the random task set (at the top big speed).
    #[arg(long, default_value_t = 1.0)]
    util: f64,

    /// Seed of the random task set.
    #[arg(long, env = "RTSIM_SEED", default_value_t = 42)]
    seed: u64,

    /// Big and LITTLE CPU counts of the random board.
    #[arg(long, num_args = 2, value_names = ["BIG", "LITTLE"], default_values_t = [4, 4])]
    cores: Vec<u32>,

    /// Simulation end time in ticks (overrides the scenario duration).
    #[arg(long, value_name = "TICKS")]
    end_time: Option<u64>,

    /// Never migrate entities between cores.
    #[arg(long)]
    no_migration: bool,

    /// Kill instances that miss their deadline.
    #[arg(long)]
    kill_on_miss: bool,

    /// Context switch duration in ticks.
    #[arg(long, value_name = "TICKS")]
    csw_overhead: Option<u64>,

    /// Print trace events to stderr.
    #[arg(long)]
    dump_trace: bool,

    /// Print the per-entity history to stderr.
    #[arg(long)]
    dump_history: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn load(cli: &Cli) -> Result<Scenario> {
    if let Some(path) = &cli.scenario {
        return scenario::load_json(path);
    }
    let Some(n) = cli.random else {
        bail!("missing required argument: <SCENARIO> (or --random N)");
    };
    let tasks = random_taskset(cli.seed, n, cli.util, &[100, 200, 250, 400, 500, 1000]);
    Ok(Scenario::builder()
        .platform(Platform::big_little(cli.cores[0], cli.cores[1]))
        .tasks(tasks)
        .duration(10_000)
        .build())
}

/// `RTSIM_*` variables first, then command line flags.
fn apply_overrides(cli: &Cli, scenario: &mut Scenario) {
    scenario.policy = std::mem::take(&mut scenario.policy).with_env_overrides();
    if let Some(t) = cli.end_time {
        scenario.duration = t;
    }
    if cli.no_migration {
        scenario.policy.disable_migration();
    }
    if cli.kill_on_miss {
        scenario.policy.kill_on_miss = true;
    }
    if let Some(o) = cli.csw_overhead {
        scenario.policy.context_switch_overhead = o;
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut scenario = load(cli)?;
    apply_overrides(cli, &mut scenario);

    let mut sim = Simulator::new(scenario).context("invalid scenario")?;
    sim.run().context("simulation aborted")?;

    if cli.dump_trace {
        sim.trace().dump();
    }
    if cli.dump_history {
        for (entity, rec) in sim.history().iter() {
            eprintln!("[{:>10}] {:<4} {:?}", rec.time, entity.to_string(), rec.kind);
        }
    }
    println!("{}", sim.report());
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .try_init();
}
