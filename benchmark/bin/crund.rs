// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::path::PathBuf;

use anyhow::{bail, Context};
use benchmark::{run_crund_bench, SystemUnderTest};
use clap::Parser;
use crund::Config;
use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "crund")]
#[command(about = "CRUD benchmark over interchangeable data access layers", long_about = None)]
struct Args {
    /// Benchmark settings in TOML
    #[arg(short, long, default_value = "benchmark/crund.toml")]
    config: PathBuf,

    /// Systems to benchmark, in order
    #[arg(short, long, value_enum, default_values_t = [SystemUnderTest::Memory])]
    sut: Vec<SystemUnderTest>,

    /// Overrides `results_dir` from the config file
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Each system runs to completion before the next starts. A failed system
/// is logged and skipped; with `fail_on_error` the process exits non-zero
/// once all systems were tried.
fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::new_with_config_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(dir) = &args.results_dir {
        config.results_dir(dir);
    }

    let mut failed = Vec::new();
    for sut in &args.sut {
        match run_crund_bench(*sut, &config) {
            Ok(report) => {
                print!("{report}");
                let dir = report
                    .write(config.get_results_dir())
                    .with_context(|| format!("writing {sut} results"))?;
                info!(%sut, dir = %dir.display(), "results written");
            }
            Err(e) => {
                error!(%sut, error = %format!("{e:#}"), "benchmark failed");
                failed.push(*sut);
            }
        }
    }

    if !failed.is_empty() && config.get_fail_on_error() {
        bail!("{} system(s) failed: {failed:?}", failed.len());
    }
    Ok(())
}
