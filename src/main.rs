// Kickstart - curiosity-driven sensorimotor curriculum trainer
// Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use kickstart::config::{load_config, MAX_SEED};
use kickstart::model::PrototypeModel;
use kickstart::sim::{PlanarArmAgent, PlanarArmFactory};
use kickstart::training::{TrainOutcome, Trainer};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "kickstart")]
#[command(about = "Curiosity-driven sensorimotor curriculum trainer", version)]
struct Args {
    /// Wall-clock budget for this invocation, in seconds
    #[arg(short = 't', long = "time")]
    time: Option<f64>,

    /// Base seed for a fresh run (default 1, at most 2^63 - 1)
    #[arg(short = 's', long = "seed", value_parser = clap::value_parser!(u64).range(..=MAX_SEED))]
    seed: Option<u64>,

    /// Write competence maps at every checkpoint
    #[arg(short = 'x', long = "plots")]
    plots: bool,

    /// Run name; the run lives in simulations/<NAME> with demo episodes and
    /// trajectories enabled
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// TOML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Parameter override, KEY=VALUE (repeatable)
    #[arg(short = 'o', long = "opt", value_name = "KEY=VALUE")]
    opts: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    // Resolve the config file before changing into the run directory
    let config_path = match &args.config {
        Some(path) => Some(
            std::fs::canonicalize(path).with_context(|| format!("Config file not found: {}", path.display()))?,
        ),
        None => None,
    };

    let mut overrides = Vec::new();
    if let Some(seed) = args.seed {
        overrides.push(format!("seed={}", seed));
    }
    if args.plots {
        overrides.push("plots=true".to_string());
    }
    if let Some(name) = &args.name {
        let run_dir = PathBuf::from("simulations").join(name);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;
        std::env::set_current_dir(&run_dir)
            .with_context(|| format!("Failed to enter run directory: {}", run_dir.display()))?;
        overrides.push("plot_sims=true".to_string());
        overrides.push("compute_trajectories=true".to_string());
    }
    overrides.extend(args.opts.iter().cloned());

    let config = load_config(config_path.as_deref(), &overrides)?;
    let budget = match args.time {
        Some(secs) => Some(Duration::try_from_secs_f64(secs).context("Time budget must be a non-negative number of seconds")?),
        None => None,
    };

    let model = PrototypeModel::new(&config);
    let factory = PlanarArmFactory::new(&config)?;
    let agent = PlanarArmAgent::new(&config);
    let mut trainer = Trainer::launch(config, model, factory, agent)?;

    println!("Starting at epoch {}", trainer.epoch());

    match trainer.train(budget)? {
        TrainOutcome::Completed { .. } => {
            println!("Done!!");
        }
        TrainOutcome::BudgetExceeded { epoch } => {
            println!("Epoch {}. end", epoch);
            if let Err(e) = trainer.final_checkpoint() {
                tracing::warn!(epoch, error = %e, "Final checkpoint failed");
            }
        }
    }

    Ok(())
}

/// Initialize tracing with an env filter and a stderr fmt layer
///
/// `RUST_LOG` controls the level (default info); `KICKSTART_DEBUG=1`
/// switches to debug when `RUST_LOG` is unset.
fn init_tracing() {
    let show_debug = std::env::var("KICKSTART_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if show_debug { "debug" } else { "info" })
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    // Bridge log crate → tracing (for dependencies using log crate)
    tracing_log::LogTracer::init().ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_limited_to_toml_integers() {
        let args = Args::try_parse_from(["kickstart", "-s", "9223372036854775807"]).unwrap();
        assert_eq!(args.seed, Some(MAX_SEED));
        assert!(Args::try_parse_from(["kickstart", "-s", "18446744073709551615"]).is_err());
    }

    #[test]
    fn test_max_seed_survives_overrides() {
        let overrides = vec![format!("seed={}", MAX_SEED)];
        let config = load_config(None, &overrides).unwrap();
        assert_eq!(config.seed, MAX_SEED);
    }
}
