//! # ffs
//!
//! Read-only consumer of a shared directory image. Attaches to the named
//! region, never mutates it, and answers from the image alone.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use ffs_image::region::region_name_for_root;
use ffs_image::ReaderRegion;

#[derive(Parser)]
#[command(name = "ffs", version, about)]
struct Cli {
    /// Shared region name, as printed by the writer.
    #[arg(long, conflicts_with = "root")]
    region: Option<String>,

    /// Indexed root path; resolves to the derived region name.
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print image status and counters as JSON.
    Status,
    /// Resolve a path through the image.
    Lookup {
        /// Absolute path inside the indexed subtree.
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct StatusReport {
    status: String,
    num_nodes: u32,
    num_dirs: u32,
    bytes: u32,
    root_offset: u32,
}

#[derive(Serialize)]
struct LookupReport {
    offset: u32,
    kind: &'static str,
    size: u64,
    write_time_nanos: u64,
    path: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let name = match (&cli.region, &cli.root) {
        (Some(region), _) => region.clone(),
        (None, Some(root)) => region_name_for_root(root),
        (None, None) => bail!("pass --region NAME or --root PATH"),
    };
    let reader = ReaderRegion::attach(&name)
        .with_context(|| format!("cannot attach to region '{name}'"))?;

    match cli.command {
        Commands::Status => status(&reader),
        Commands::Lookup { path } => lookup(&reader, &path),
    }
}

fn status(reader: &ReaderRegion) -> Result<()> {
    let header = reader.header();
    let status = match reader.status() {
        Some(status) => format!("{status:?}").to_lowercase(),
        None => "unknown".to_string(),
    };
    let report = StatusReport {
        status,
        num_nodes: header.num_nodes,
        num_dirs: header.num_dirs,
        bytes: header.bytes,
        root_offset: header.root_offset,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn lookup(reader: &ReaderRegion, path: &std::path::Path) -> Result<()> {
    match reader.status() {
        Some(status) if status.readable() => {}
        other => bail!("image is not readable yet (status {other:?})"),
    }

    let view = reader.view();
    let Some(offset) = view.get_node(path) else {
        bail!("no match for {}", path.display());
    };
    let record = view
        .record(offset)
        .context("image returned an unreadable offset")?;
    let kind = if record.is_reparse() {
        "reparse"
    } else if record.is_directory() {
        "directory"
    } else {
        "file"
    };
    let report = LookupReport {
        offset,
        kind,
        size: record.size(),
        write_time_nanos: record.write_time.as_nanos(),
        path: String::from_utf8_lossy(&view.reconstruct_path(offset).unwrap_or_default())
            .into_owned(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
