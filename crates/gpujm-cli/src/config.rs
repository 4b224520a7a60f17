use std::time::Duration;

use anyhow::{ensure, Context as _};
use clap::Parser;
use gpujm::JmConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "gpujm-sim", version, about = "Drive the job manager against a simulated GPU")]
struct Args {
    /// Number of hardware job slots.
    ///
    /// Environment variable: `GPUJM_SLOTS`.
    #[arg(long, env = "GPUJM_SLOTS", default_value_t = 3)]
    slots: usize,

    /// Atoms to run through the simulator.
    ///
    /// Environment variable: `GPUJM_JOBS`.
    #[arg(long, env = "GPUJM_JOBS", default_value_t = 200)]
    jobs: u32,

    /// Chance per step that a running job faults.
    ///
    /// Environment variable: `GPUJM_FAULT_RATE`.
    #[arg(long, env = "GPUJM_FAULT_RATE", default_value_t = 0.05)]
    fault_rate: f64,

    /// Chance per step that a running job is soft-stopped.
    ///
    /// Environment variable: `GPUJM_STOP_RATE`.
    #[arg(long, env = "GPUJM_STOP_RATE", default_value_t = 0.1)]
    stop_rate: f64,

    /// RNG seed; the same seed replays the same workload.
    ///
    /// Environment variable: `GPUJM_SEED`.
    #[arg(long, env = "GPUJM_SEED", default_value_t = 1)]
    seed: u64,

    /// Reset watchdog in milliseconds.
    ///
    /// Environment variable: `GPUJM_RESET_TIMEOUT_MS`.
    #[arg(long, env = "GPUJM_RESET_TIMEOUT_MS", default_value_t = 500)]
    reset_timeout_ms: u64,

    /// Context teardown timeout in milliseconds.
    ///
    /// Environment variable: `GPUJM_ZAP_TIMEOUT_MS`.
    #[arg(long, env = "GPUJM_ZAP_TIMEOUT_MS", default_value_t = 200)]
    zap_timeout_ms: u64,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `GPUJM_LOG`.
    #[arg(long, env = "GPUJM_LOG", default_value = "warn")]
    log: String,

    /// Print the summary as JSON.
    #[arg(long, env = "GPUJM_JSON")]
    json: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jm: JmConfig,
    pub jobs: u32,
    pub fault_rate: f64,
    pub stop_rate: f64,
    pub seed: u64,
    pub log: String,
    pub json: bool,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> anyhow::Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&args.fault_rate),
            "fault rate must be within 0..=1"
        );
        ensure!(
            (0.0..=1.0).contains(&args.stop_rate),
            "stop rate must be within 0..=1"
        );
        ensure!(
            args.fault_rate + args.stop_rate <= 1.0,
            "fault and stop rates add up to more than 1"
        );
        ensure!(args.jobs > 0, "at least one job is required");

        let jm = JmConfig {
            nr_slots: args.slots,
            reset_timeout: Duration::from_millis(args.reset_timeout_ms),
            zap_timeout: Duration::from_millis(args.zap_timeout_ms),
            ..JmConfig::default()
        };
        jm.validate().context("invalid job manager config")?;

        Ok(Self {
            jm,
            jobs: args.jobs,
            fault_rate: args.fault_rate,
            stop_rate: args.stop_rate,
            seed: args.seed,
            log: args.log,
            json: args.json,
        })
    }
}
