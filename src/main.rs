use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gpubench::config::{BenchConfig, LoggingConfig};
use gpubench::runtime::{self, Backend};

#[derive(Parser)]
#[command(
    name = "gpubench",
    about = "Accelerator compute benchmark: device discovery, timed kernel dispatch, verified results",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (otherwise $GPUBENCH_CONFIG, then ./gpubench.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Accelerator backend: host or opencl
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List platforms and devices exposed by the backend
    Devices {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run the elementwise-add benchmark on the selected device
    Run {
        /// Elements per array
        #[arg(long)]
        elements: Option<usize>,

        /// Work-group size
        #[arg(long)]
        work_group_size: Option<usize>,

        /// Timed kernel dispatches
        #[arg(long)]
        repetitions: Option<usize>,

        /// Catalog index of the device, bypassing GPU-then-CPU selection
        #[arg(long)]
        device: Option<usize>,

        /// Kernel source file
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Input data seed
        #[arg(long)]
        seed: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.log_json);
    if let Some(backend) = cli.backend {
        config.device.backend = backend;
    }

    match cli.command {
        Commands::Devices { json } => {
            let rt = runtime::init(config.device.backend)?;
            let catalog = gpubench::catalog::enumerate(rt.as_ref())
                .context("device enumeration failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&catalog)?);
            } else {
                print!("{}", gpubench::report::format_catalog(&catalog));
            }
        }
        Commands::Run {
            elements,
            work_group_size,
            repetitions,
            device,
            kernel,
            seed,
            json,
        } => {
            let b = &mut config.benchmark;
            if let Some(v) = elements {
                b.elements = v;
            }
            if let Some(v) = work_group_size {
                b.work_group_size = v;
            }
            if let Some(v) = repetitions {
                b.repetitions = v;
                b.transfer_repetitions = v;
            }
            if let Some(v) = seed {
                b.seed = v;
            }
            if let Some(path) = kernel {
                config.kernel.source_path = path;
            }
            if device.is_some() {
                config.device.index = device;
            }

            tracing::info!(backend = %config.device.backend, "running benchmark");
            let rt = runtime::init(config.device.backend)?;
            let report = gpubench::bench::run(rt.as_ref(), &config).context("benchmark failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== gpubench ===");
                println!("{}", gpubench::report::format_summary(&report));
            }
        }
    }

    Ok(())
}
