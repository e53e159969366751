mod bench;
mod cache;
mod oracle;
mod regs;
mod stats;
mod vadd;

use accel_core::{PlatformConfig, Runtime, TransferMode};
use accel_hw::{SimDevice, SimOptions};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Simulated device memory per runtime.
const SIM_MEMORY: usize = 16 << 20;

#[derive(Parser)]
struct Cli {
    /// Platform configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Element-wise vector add checked against the golden model.
    Vadd {
        #[arg(short, long, default_value_t = 32)]
        len: usize,
        /// Use the word-granular transfer fallback.
        #[arg(long)]
        word: bool,
        /// Force manual cache maintenance.
        #[arg(long)]
        manual: bool,
        #[arg(long)]
        unreliable_bulk: bool,
        #[arg(short, long)]
        a: Option<PathBuf>,
        #[arg(short, long)]
        b: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Control register access.
    Regs {
        #[command(subcommand)]
        op: regs::RegsOp,
    },
    /// Bulk against word transfer round trips.
    Bench {
        #[arg(short, long, default_value_t = 4096)]
        size: usize,
        #[arg(short = 'n', long, default_value_t = 200)]
        iterations: usize,
        #[arg(long)]
        unreliable_bulk: bool,
    },
    /// Flush/invalidate probe.
    Cache {
        #[arg(short, long, default_value_t = 4096)]
        size: usize,
    },
}

/// Parses a decimal or `0x` hex integer argument.
pub(crate) fn parse_int(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}

/// Builds a runtime over a fresh simulated accelerator.
///
/// Register window failures terminate the process; every other error is
/// returned to the caller.
pub(crate) fn sim_runtime(config: PlatformConfig, options: SimOptions) -> Result<Runtime> {
    let sim = Arc::new(SimDevice::with_options(SIM_MEMORY, options)?);
    match Runtime::with_device(config, sim) {
        Ok(rt) => Ok(rt),
        Err(e) if e.is_fatal() => {
            tracing::error!("{e}");
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = accel_io::config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Vadd {
            len,
            word,
            manual,
            unreliable_bulk,
            a,
            b,
            output,
        } => {
            if word {
                config = config.with_transfer_mode(TransferMode::Word);
            }
            if manual {
                config = config.with_manual_cache_flush(true);
            }
            let options = SimOptions {
                unreliable_bulk,
                ..SimOptions::default()
            };
            vadd::run_vadd(config, options, len, a, b, output)?;
        }
        Commands::Regs { op } => {
            regs::run_regs(&config, op)?;
        }
        Commands::Bench {
            size,
            iterations,
            unreliable_bulk,
        } => {
            bench::run_bench(config, size, iterations, unreliable_bulk)?;
        }
        Commands::Cache { size } => {
            cache::run_cache(config, size)?;
        }
    }
    Ok(())
}
