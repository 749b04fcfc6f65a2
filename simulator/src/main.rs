mod args;
mod backend;
mod driver;
mod logging;
mod model;
mod oracle;
mod scheduler;

use std::process::ExitCode;

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::Level;

use crate::args::{Args, SimConfig};

fn main() -> ExitCode {
    let config = SimConfig::from_args(Args::parse());
    let writer = match logging::step_writer(config.log.as_deref()) {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!("cannot open simulator log: {err}");
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    match serde_json::to_string(&config) {
        Ok(json) => tracing::info!(seed = config.seed, "simulating pool: {json}"),
        Err(err) => tracing::warn!(seed = config.seed, "config not serializable: {err}"),
    }

    let seed = config.seed;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    match driver::run(config, &mut rng) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => {
            tracing::error!("replay with --seed {seed}");
            ExitCode::FAILURE
        }
    }
}
