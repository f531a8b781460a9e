//! ffs-indexd — shared directory-image writer.
//!
//! Usage:
//!   ffs-indexd /path/to/root [--region NAME] [--max-size BYTES]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ffs_image::layout::DEFAULT_MAX_SIZE;
use ffs_indexd::{run_daemon, IndexConfig, WatchFilter};

/// Maintain a shared, navigable directory index for one subtree.
#[derive(Parser)]
#[command(name = "ffs-indexd", version, about)]
struct Cli {
    /// Root of the subtree to index.
    root: PathBuf,

    /// Shared region name (derived from the root when omitted).
    #[arg(long)]
    region: Option<String>,

    /// Region reservation in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_SIZE)]
    max_size: u32,

    /// Ignore name-shaped changes (create, remove, rename).
    #[arg(long)]
    no_watch_names: bool,

    /// Ignore content-shaped changes (write time, size).
    #[arg(long)]
    no_watch_writes: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match configure(cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            // The writer's 0/1/2/3/6 contract covers failures after a
            // valid configuration; a bad argument exits with EX_USAGE.
            return ExitCode::from(64);
        }
    };

    match run_daemon(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "writer terminated");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn configure(cli: Cli) -> anyhow::Result<IndexConfig> {
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("cannot resolve root {}", cli.root.display()))?;
    let mut config = IndexConfig::from_root(root);
    if let Some(region) = cli.region {
        config.region_name = region;
    }
    config.max_size = cli.max_size;
    config.filter = WatchFilter {
        name: !cli.no_watch_names,
        creation: !cli.no_watch_names,
        write_time: !cli.no_watch_writes,
        size: !cli.no_watch_writes,
    };
    Ok(config)
}
