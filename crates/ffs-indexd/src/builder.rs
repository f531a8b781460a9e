//! Initial breadth-first sweep.
//!
//! The builder walks the tree one wave of directories at a time, appending
//! each listing's records (dot first) and stuffing every record's
//! parent-offset with the group id handed down through the worklist: the
//! offset of the directory's own record in its parent's listing, or the
//! synthetic root's offset for the top directory. Dot-entry offsets are
//! accumulated per bucket and flushed into the on-image table after the
//! sweep.
//!
//! Directories that fail to open mid-sweep are counted and skipped; the
//! build never aborts for them.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use ffs_image::hash::bucket_of;
use ffs_image::layout::{Status, ATTR_DIRECTORY, ATTR_ROOT, BUCKET_COUNT};
use ffs_image::ImageError;

use crate::iterate::{self, EntryMeta};
use crate::writer::ImageWriter;
use crate::DaemonError;

/// Bucket populations outside 5..=67 are suspect for source-code trees.
const BUCKET_HIGH_WATER: usize = 67;
const BUCKET_LOW_WATER: usize = 5;
const SUSPECT_BUCKET_LIMIT: usize = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct BuildStats {
    pub num_nodes: u32,
    pub num_dirs: u32,
    pub pending_fixes: u32,
    pub reparse_points: u32,
}

/// Sweep `root` into the image and leave it at `status = finished`.
pub fn build(writer: &mut ImageWriter, root: &Path) -> Result<BuildStats, DaemonError> {
    let root_entry = EntryMeta {
        name: root.as_os_str().to_os_string(),
        attributes: ATTR_ROOT | ATTR_DIRECTORY,
        create_nanos: 0,
        access_nanos: 0,
        write_nanos: 0,
        size: 0,
    };
    let root_offset = writer.append_record(&root_entry, 0).map_err(build_error)?;
    writer.set_root_offset(root_offset);
    writer.set_status(Status::InProgress);

    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); BUCKET_COUNT];
    let mut stats = BuildStats::default();
    let mut pending: Vec<(PathBuf, u32)> = vec![(root.to_path_buf(), root_offset)];
    let mut found: Vec<(PathBuf, u32)> = Vec::new();

    while !pending.is_empty() {
        for (path, parent_offset) in pending.drain(..) {
            let entries = match iterate::list_directory(&path) {
                Ok(entries) => entries,
                Err(err) => {
                    stats.pending_fixes += 1;
                    debug!(path = %path.display(), error = %err, "directory vanished mid-sweep");
                    continue;
                }
            };

            let mut offsets = Vec::with_capacity(entries.len());
            for (index, entry) in entries.iter().enumerate() {
                let offset = writer
                    .append_record(entry, parent_offset)
                    .map_err(build_error)?;
                offsets.push(offset);
                stats.num_nodes += 1;

                if index == 0 {
                    buckets[bucket_of(path.as_os_str().as_encoded_bytes())].push(offset);
                } else if entry.is_reparse() {
                    stats.reparse_points += 1;
                } else if entry.is_directory() {
                    found.push((path.join(&entry.name), offset));
                }
            }
            writer.link_siblings(&offsets);
            stats.num_dirs += 1;
        }
        std::mem::swap(&mut pending, &mut found);
    }

    writer.set_counts(stats.num_nodes, stats.num_dirs);
    writer.set_status(Status::Updating);

    check_bucket_quality(&buckets, stats.num_dirs);
    writer.emit_bucket_table(&buckets).map_err(build_error)?;
    writer.set_status(Status::Finished);

    info!(
        nodes = stats.num_nodes,
        dirs = stats.num_dirs,
        pending_fixes = stats.pending_fixes,
        reparse_points = stats.reparse_points,
        bytes = writer.region().header().bytes,
        "initial sweep finished"
    );
    Ok(stats)
}

fn build_error(err: ImageError) -> DaemonError {
    match err {
        ImageError::RegionExhausted { .. } => DaemonError::RegionExhausted(err),
        other => DaemonError::Build(other),
    }
}

fn check_bucket_quality(buckets: &[Vec<u32>], num_dirs: u32) {
    // Trees too small to populate every bucket cannot satisfy the low
    // water mark; the diagnostic only means something at workload scale.
    if (num_dirs as usize) < BUCKET_COUNT * BUCKET_LOW_WATER {
        return;
    }
    let over = buckets.iter().filter(|b| b.len() > BUCKET_HIGH_WATER).count();
    let under = buckets.iter().filter(|b| b.len() < BUCKET_LOW_WATER).count();
    if over > SUSPECT_BUCKET_LIMIT || under > SUSPECT_BUCKET_LIMIT {
        warn!(
            over,
            under, "bucket populations outside the expected band; hash quality is suspect"
        );
    }
}
