//! Batch front-end for the CMIP-IMR engine.
//!
//! Exit codes: 0 success, 2 ingestion error, 3 discovery oracle failure,
//! 4 evaluation failure.

use anyhow::Context;
use clap::Parser;
use cmip_imr::{run_cmip_imr, to_dot, to_pnml, CmipError, CmipImrOptions};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cmip-imr", version, about = "Cross-department collaborative process mining with Petri net repair")]
struct Cli {
    /// Path to the CSV event log
    log: PathBuf,

    /// Inductive-miner noise threshold (infrequent variant when > 0)
    #[arg(long, default_value_t = 0.2, env = "CMIP_NOISE_THRESHOLD")]
    noise_threshold: f64,

    /// F-measure at which repair stops
    #[arg(long, default_value_t = 0.95)]
    target_f_measure: f64,

    /// Maximum CE-PNR iterations
    #[arg(long, default_value_t = 3)]
    max_iterations: usize,

    /// Fitness below which resource removal is considered
    #[arg(long, default_value_t = 0.8)]
    fitness_threshold: f64,

    /// Never drop resource constraints, even when fitness is low
    #[arg(long)]
    keep_resources: bool,

    /// Write the full result as JSON to this path
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write DOT renderings of N0 and N1 to this directory
    #[arg(long)]
    dot_dir: Option<PathBuf>,

    /// Write PNML files for N0 and N1 to this directory
    #[arg(long)]
    pnml_dir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = try_main() {
        eprintln!("error: {:#}", err);
        let code = err
            .downcast_ref::<CmipError>()
            .map(CmipError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = CmipImrOptions::default()
        .with_noise_threshold(cli.noise_threshold)
        .with_target_f_measure(cli.target_f_measure)
        .with_max_iterations(cli.max_iterations)
        .with_fitness_threshold(cli.fitness_threshold)
        .with_remove_resources_if_low_fitness(!cli.keep_resources);

    let result = run_cmip_imr(&cli.log, &options)?;

    println!("{}", result.verification_report());

    if let Some(path) = &cli.output {
        let json = serde_json::to_string_pretty(&result).map_err(CmipError::from)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("result written to {}", path.display());
    }
    if let Some(dir) = &cli.dot_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for (name, snapshot) in [("n0", &result.n0), ("n1", &result.n1)] {
            let path = dir.join(format!("{}.dot", name));
            let dot = to_dot(&snapshot.net, &snapshot.initial_marking, &snapshot.final_marking);
            fs::write(&path, dot).with_context(|| format!("writing {}", path.display()))?;
        }
        println!("dot files written to {}", dir.display());
    }
    if let Some(dir) = &cli.pnml_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for (name, snapshot) in [("n0", &result.n0), ("n1", &result.n1)] {
            let path = dir.join(format!("{}.pnml", name));
            let pnml = to_pnml(&snapshot.net, &snapshot.initial_marking, &snapshot.final_marking);
            fs::write(&path, pnml).with_context(|| format!("writing {}", path.display()))?;
        }
        println!("pnml files written to {}", dir.display());
    }

    Ok(())
}
