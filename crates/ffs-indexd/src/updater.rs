//! Incremental maintenance from change notifications.
//!
//! Events arrive in batches over the watcher channel; the updater frames
//! each batch with `status = updating` / `status = finished` so readers
//! can detect the inconsistency window. Within a batch:
//!
//! - *modified* overwrites timestamps and size in place;
//! - *added* appends a record, patches the previous last sibling's step,
//!   and for directories also appends a dot record and registers it in
//!   its bucket;
//! - *removed* sets the tombstone attribute, reclaiming nothing;
//! - *renamed* is delivered as removed-old then added-new.
//!
//! The handshake is a signal, not a lock: a reader sampling mid-batch
//! either retries or accepts possibly-stale results.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, trace, warn};

use ffs_image::hash::bucket_of;
use ffs_image::layout::{FileTime, Status, ATTR_DOT, ATTR_TOMBSTONE};
use ffs_image::ImageError;

use crate::iterate::{self, EntryMeta};
use crate::writer::ImageWriter;
use crate::{DaemonError, WatchFilter};

/// One change against the indexed subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    RenamedFrom,
    RenamedTo,
}

/// Recursive watch over the enumeration root.
pub struct Watch {
    // Dropping the watcher cancels the subscription.
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    filter: WatchFilter,
}

impl Watch {
    pub fn subscribe(root: &Path, filter: WatchFilter) -> notify::Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(path = %root.display(), "change notifications subscribed");
        Ok(Self {
            _watcher: watcher,
            rx,
            filter,
        })
    }

    /// Block for the next batch: the first available event plus everything
    /// already queued behind it. The subscription stays armed between
    /// batches. `None` once the channel is gone.
    pub fn next_batch(&self) -> Option<Vec<Change>> {
        let first = self.rx.recv().ok()?;
        let mut changes = Vec::new();
        collect(&mut changes, first, self.filter);
        loop {
            match self.rx.try_recv() {
                Ok(event) => collect(&mut changes, event, self.filter),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Some(changes)
    }
}

fn collect(changes: &mut Vec<Change>, event: notify::Result<Event>, filter: WatchFilter) {
    match event {
        Ok(event) => changes.extend(map_event(event, filter)),
        Err(err) => warn!(error = %err, "watcher delivered an error"),
    }
}

/// Translate a host notification into the updater's change model. Rename
/// pairs keep their order: old name first, new name second.
pub fn map_event(event: Event, filter: WatchFilter) -> Vec<Change> {
    let mut changes = Vec::new();
    match event.kind {
        EventKind::Create(_) if filter.names() => {
            for path in event.paths {
                changes.push(Change {
                    kind: ChangeKind::Added,
                    path,
                });
            }
        }
        EventKind::Remove(_) if filter.names() => {
            for path in event.paths {
                changes.push(Change {
                    kind: ChangeKind::Removed,
                    path,
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) if filter.names() => match mode {
            RenameMode::From => {
                for path in event.paths {
                    changes.push(Change {
                        kind: ChangeKind::RenamedFrom,
                        path,
                    });
                }
            }
            RenameMode::To => {
                for path in event.paths {
                    changes.push(Change {
                        kind: ChangeKind::RenamedTo,
                        path,
                    });
                }
            }
            _ => {
                // Both halves in one event, or a backend that cannot say
                // which side this is: a live path is the new name.
                for path in event.paths {
                    let kind = if fs::symlink_metadata(&path).is_ok() {
                        ChangeKind::RenamedTo
                    } else {
                        ChangeKind::RenamedFrom
                    };
                    changes.push(Change { kind, path });
                }
            }
        },
        // A rename with name watching off must not degrade to a modify.
        EventKind::Modify(ModifyKind::Name(_)) => {}
        EventKind::Modify(_) if filter.writes() => {
            for path in event.paths {
                changes.push(Change {
                    kind: ChangeKind::Modified,
                    path,
                });
            }
        }
        _ => {}
    }
    changes
}

/// Consume batches until the watcher goes away, then park the image at
/// `frozen`.
pub fn run(writer: &mut ImageWriter, watch: &Watch) -> Result<(), DaemonError> {
    while let Some(batch) = watch.next_batch() {
        if batch.is_empty() {
            continue;
        }
        apply_batch(writer, &batch)?;
    }
    writer.set_status(Status::Frozen);
    info!("watcher closed; image frozen");
    Ok(())
}

/// Apply one batch inside an `updating` window.
pub fn apply_batch(writer: &mut ImageWriter, batch: &[Change]) -> Result<(), DaemonError> {
    writer.set_status(Status::Updating);
    for change in batch {
        apply_change(writer, change).map_err(update_error)?;
    }
    writer.set_status(Status::Finished);
    trace!(events = batch.len(), "batch applied");
    Ok(())
}

/// Apply a single change. Events against paths the image cannot resolve
/// are dropped with a debug note; the next full rebuild reconciles them.
pub fn apply_change(writer: &mut ImageWriter, change: &Change) -> Result<(), ImageError> {
    match change.kind {
        ChangeKind::Modified => apply_modified(writer, &change.path),
        ChangeKind::Added | ChangeKind::RenamedTo => apply_added(writer, &change.path),
        ChangeKind::Removed | ChangeKind::RenamedFrom => apply_removed(writer, &change.path),
    }
}

fn apply_modified(writer: &mut ImageWriter, path: &Path) -> Result<(), ImageError> {
    let Some(offset) = writer.view().get_node(path) else {
        debug!(path = %path.display(), "modify event for an unindexed path");
        return Ok(());
    };
    let Ok(meta) = fs::symlink_metadata(path) else {
        debug!(path = %path.display(), "modified path vanished before stat");
        return Ok(());
    };
    let entry = EntryMeta::from_metadata(iterate::leaf_name(path), 0, &meta);
    let record = writer.record_mut(offset);
    record.create_time = FileTime::from_nanos(entry.create_nanos);
    record.access_time = FileTime::from_nanos(entry.access_nanos);
    record.write_time = FileTime::from_nanos(entry.write_nanos);
    record.set_size(entry.size);
    Ok(())
}

fn apply_added(writer: &mut ImageWriter, path: &Path) -> Result<(), ImageError> {
    if writer.view().get_node(path).is_some() {
        // Some backends report a create for a path already indexed;
        // degrade to a metadata refresh.
        return apply_modified(writer, path);
    }
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let Some(dot_entry) = writer.view().get_directory(parent) else {
        debug!(path = %path.display(), "add event outside any indexed directory");
        return Ok(());
    };
    let Ok(meta) = fs::symlink_metadata(path) else {
        debug!(path = %path.display(), "added path vanished before stat");
        return Ok(());
    };

    let group = match writer.view().record(dot_entry) {
        Some(dot) => dot.parent_offset,
        None => return Ok(()),
    };
    let entry = EntryMeta::from_metadata(
        iterate::leaf_name(path),
        iterate::attributes_of(meta.file_type()),
        &meta,
    );
    let offset = writer.append_record(&entry, group)?;
    writer.patch_last_sibling(dot_entry, offset);
    writer.bump_counts(1, 0);

    if entry.is_directory() {
        let dot = EntryMeta {
            attributes: entry.attributes | ATTR_DOT,
            ..entry.clone()
        };
        let dot_offset = writer.append_record(&dot, offset)?;
        writer.extend_bucket(bucket_of(path.as_os_str().as_encoded_bytes()), dot_offset)?;
        writer.bump_counts(1, 1);
    }
    debug!(path = %path.display(), offset, "record appended");
    Ok(())
}

fn apply_removed(writer: &mut ImageWriter, path: &Path) -> Result<(), ImageError> {
    let Some(offset) = writer.view().get_node(path) else {
        debug!(path = %path.display(), "remove event for an unindexed path");
        return Ok(());
    };
    writer.record_mut(offset).attributes |= ATTR_TOMBSTONE;
    debug!(path = %path.display(), offset, "record tombstoned");
    Ok(())
}

fn update_error(err: ImageError) -> DaemonError {
    match err {
        ImageError::RegionExhausted { .. } => DaemonError::RegionExhausted(err),
        other => DaemonError::Update(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn creates_map_to_added() {
        let changes = map_event(
            event(EventKind::Create(CreateKind::File), &["/t/c.txt"]),
            WatchFilter::default(),
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Added);
    }

    #[test]
    fn removes_map_to_removed() {
        let changes = map_event(
            event(EventKind::Remove(RemoveKind::File), &["/t/c.txt"]),
            WatchFilter::default(),
        );
        assert_eq!(changes[0].kind, ChangeKind::Removed);
    }

    #[test]
    fn data_modifications_map_to_modified() {
        let changes = map_event(
            event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
                &["/t/a.txt"],
            ),
            WatchFilter::default(),
        );
        assert_eq!(changes[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn rename_halves_keep_old_then_new_order() {
        let from = map_event(
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/t/a.txt"],
            ),
            WatchFilter::default(),
        );
        let to = map_event(
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/t/z.txt"],
            ),
            WatchFilter::default(),
        );
        assert_eq!(from[0].kind, ChangeKind::RenamedFrom);
        assert_eq!(to[0].kind, ChangeKind::RenamedTo);
    }

    #[test]
    fn filter_masks_event_classes() {
        let no_writes = WatchFilter {
            write_time: false,
            size: false,
            ..WatchFilter::default()
        };
        let changes = map_event(
            event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
                &["/t/a.txt"],
            ),
            no_writes,
        );
        assert!(changes.is_empty());

        let no_names = WatchFilter {
            name: false,
            creation: false,
            ..WatchFilter::default()
        };
        let changes = map_event(
            event(EventKind::Create(CreateKind::File), &["/t/c.txt"]),
            no_names,
        );
        assert!(changes.is_empty());
    }
}
