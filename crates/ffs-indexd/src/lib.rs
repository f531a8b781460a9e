//! # ffs-indexd
//!
//! Writer daemon for a shared directory image.
//!
//! ## Architecture
//!
//! One process per enumeration root:
//! - maps the named region and lays down the header,
//! - subscribes to change notifications (so nothing is lost during the
//!   sweep; events queue behind the build),
//! - sweeps the tree breadth-first into the image,
//! - then drains notification batches forever, framing each with the
//!   `updating`/`finished` handshake.
//!
//! The whole writer is a single mutator: the builder runs to completion
//! before the first batch is applied, and batches are processed one at a
//! time on the same thread. Readers are separate processes that attach
//! read-only by region name.

pub mod builder;
pub mod iterate;
pub mod updater;
pub mod writer;

use std::path::PathBuf;

use tracing::info;

use ffs_image::layout::{Status, DEFAULT_MAX_SIZE};
use ffs_image::region::region_name_for_root;
use ffs_image::{ImageError, Region};

/// Which change classes the subscription reports.
#[derive(Debug, Clone, Copy)]
pub struct WatchFilter {
    pub name: bool,
    pub write_time: bool,
    pub creation: bool,
    pub size: bool,
}

impl Default for WatchFilter {
    fn default() -> Self {
        Self {
            name: true,
            write_time: true,
            creation: true,
            size: true,
        }
    }
}

impl WatchFilter {
    /// Name-shaped events: create, remove, rename.
    pub fn names(&self) -> bool {
        self.name || self.creation
    }

    /// Content-shaped events: write time, size.
    pub fn writes(&self) -> bool {
        self.write_time || self.size
    }
}

/// Daemon configuration for one monitored root.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Absolute enumeration root.
    pub root: PathBuf,
    /// Shared region name readers attach to.
    pub region_name: String,
    /// Region reservation in bytes.
    pub max_size: u32,
    /// Notification filter.
    pub filter: WatchFilter,
}

impl IndexConfig {
    /// Derive the well-known configuration for a root path.
    pub fn from_root(root: PathBuf) -> Self {
        let region_name = region_name_for_root(&root);
        Self {
            root,
            region_name,
            max_size: DEFAULT_MAX_SIZE,
            filter: WatchFilter::default(),
        }
    }
}

/// Fatal daemon failures. Codes 1, 2, 3, and 6 are the writer's
/// published exit-code contract; a failure while applying a live update
/// batch is a different phase than the initial sweep and exits with 4,
/// outside the reserved set.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to map shared region: {0}")]
    RegionMap(#[source] ImageError),

    #[error("failed to subscribe to change notifications: {0}")]
    Watch(#[from] notify::Error),

    #[error("initial build failed: {0}")]
    Build(#[source] ImageError),

    #[error("update failed: {0}")]
    Update(#[source] ImageError),

    #[error("region reservation exhausted: {0}")]
    RegionExhausted(#[source] ImageError),
}

impl DaemonError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::RegionMap(_) => 1,
            DaemonError::Watch(_) => 2,
            DaemonError::Build(_) => 3,
            DaemonError::Update(_) => 4,
            DaemonError::RegionExhausted(_) => 6,
        }
    }
}

/// Build the image and keep it fresh until the watcher goes away.
pub fn run_daemon(config: &IndexConfig) -> Result<(), DaemonError> {
    info!(
        root = %config.root.display(),
        region = %config.region_name,
        max_size = config.max_size,
        "starting index writer"
    );

    let region =
        Region::create(&config.region_name, config.max_size).map_err(DaemonError::RegionMap)?;
    let mut writer = writer::ImageWriter::create(region).map_err(DaemonError::RegionMap)?;

    // Subscribe before the sweep: the builder runs to completion before
    // the first batch is applied, and events raised meanwhile queue up.
    let watch = updater::Watch::subscribe(&config.root, config.filter)?;

    let result =
        builder::build(&mut writer, &config.root).and_then(|_| updater::run(&mut writer, &watch));
    match &result {
        // An exhausted reservation leaves the status at its last value;
        // readers keep whatever consistency it advertised.
        Err(DaemonError::RegionExhausted(_)) => {}
        Err(_) => writer.set_status(Status::Error),
        Ok(()) => {}
    }
    result
}
