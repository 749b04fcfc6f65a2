use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Deterministic sql-pool simulator")]
pub(crate) struct Args {
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) duration: Option<Duration>,
    #[arg(long)]
    pub(crate) iterations: Option<u64>,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    #[arg(long, default_value_t = 8)]
    pub(crate) pool_size: usize,
    #[arg(long, default_value_t = 16)]
    pub(crate) tasks: usize,
    /// Idle connection lifetime in simulated milliseconds.
    #[arg(long, default_value_t = 2_000)]
    pub(crate) lifetime_ms: u64,
    /// Busy timeout in simulated milliseconds.
    #[arg(long, default_value_t = 500)]
    pub(crate) busy_timeout_ms: u64,
    #[arg(long, default_value_t = 0.01)]
    pub(crate) break_rate: f64,
    #[arg(long, default_value_t = 0.005)]
    pub(crate) leak_rate: f64,
    #[arg(long, default_value_t = 0.02)]
    pub(crate) sweep_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) sleep_rate: f64,
    #[arg(long, default_value_t = 4)]
    pub(crate) max_in_flight_tx: usize,
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) duration_ms: Option<u64>,
    pub(crate) iterations: Option<u64>,
    pub(crate) seed: u64,
    pub(crate) pool_size: usize,
    pub(crate) tasks: usize,
    pub(crate) lifetime_ms: u64,
    pub(crate) busy_timeout_ms: u64,
    pub(crate) break_rate: f64,
    pub(crate) leak_rate: f64,
    pub(crate) sweep_rate: f64,
    pub(crate) sleep_rate: f64,
    pub(crate) max_in_flight_tx: usize,
    pub(crate) log: Option<PathBuf>,
    pub(crate) preset: Option<String>,
    pub(crate) first_steps: usize,
    pub(crate) tail_steps: usize,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let mut config = SimConfig {
            duration_ms: args
                .duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            iterations: args.iterations,
            seed: args.seed.unwrap_or_else(random_seed),
            pool_size: args.pool_size.max(1),
            tasks: args.tasks.max(1),
            lifetime_ms: args.lifetime_ms,
            busy_timeout_ms: args.busy_timeout_ms,
            break_rate: clamp_rate(args.break_rate),
            leak_rate: clamp_rate(args.leak_rate),
            sweep_rate: clamp_rate(args.sweep_rate),
            sleep_rate: clamp_rate(args.sleep_rate),
            max_in_flight_tx: args.max_in_flight_tx.max(1),
            log: args.log,
            preset: None,
            first_steps: 30,
            tail_steps: 80,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }

        config
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.iterations = Some(10_000);
        self.duration_ms = None;
        self.pool_size = 4;
        self.tasks = 4;
        self.break_rate = 0.01;
        self.leak_rate = 0.005;
        self.sweep_rate = 0.02;
        self.sleep_rate = 0.05;
        self.max_in_flight_tx = 2;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.iterations = Some(250_000);
        self.duration_ms = None;
        self.pool_size = 16;
        self.tasks = 64;
        self.lifetime_ms = 800;
        self.busy_timeout_ms = 200;
        self.break_rate = 0.03;
        self.leak_rate = 0.01;
        self.sweep_rate = 0.05;
        self.sleep_rate = 0.08;
        self.max_in_flight_tx = 8;
    }
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_limits_bounds() {
        assert_eq!(clamp_rate(-1.0), 0.0);
        assert_eq!(clamp_rate(2.0), 1.0);
        assert_eq!(clamp_rate(0.5), 0.5);
        assert_eq!(clamp_rate(f64::NAN), 0.0);
    }

    #[test]
    fn stress_preset_shortens_timeouts() {
        let args = Args::parse_from(["simulator", "--stress", "--seed", "7"]);
        let config = SimConfig::from_args(args);
        assert_eq!(config.seed, 7);
        assert_eq!(config.preset.as_deref(), Some("stress"));
        assert!(config.busy_timeout_ms < config.lifetime_ms);
    }
}
