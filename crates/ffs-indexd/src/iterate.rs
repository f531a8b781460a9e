//! Directory enumeration.
//!
//! Wraps the host's directory listing into the shape the builder and
//! updater consume: one record per entry, the directory's self-reference
//! first. The self-record carries the directory's leaf name (not `.`) so
//! the navigator's suffix match can verify it directly; an attribute bit
//! marks it as the dot entry. Symlinks are reported as reparse points and
//! never followed.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ffs_image::layout::{ATTR_DIRECTORY, ATTR_DOT, ATTR_REPARSE};

/// One enumerated entry, not yet written to the image.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub name: OsString,
    pub attributes: u32,
    pub create_nanos: u64,
    pub access_nanos: u64,
    pub write_nanos: u64,
    pub size: u64,
}

impl EntryMeta {
    pub fn from_metadata(name: OsString, attributes: u32, meta: &fs::Metadata) -> Self {
        Self {
            name,
            attributes,
            create_nanos: nanos_of(meta.created()),
            access_nanos: nanos_of(meta.accessed()),
            write_nanos: nanos_of(meta.modified()),
            size: meta.len(),
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        self.name.as_encoded_bytes()
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_reparse(&self) -> bool {
        self.attributes & ATTR_REPARSE != 0
    }
}

/// Attribute bits for a filesystem object that was stat'ed without
/// following symlinks.
pub fn attributes_of(file_type: fs::FileType) -> u32 {
    if file_type.is_symlink() {
        ATTR_REPARSE
    } else if file_type.is_dir() {
        ATTR_DIRECTORY
    } else {
        0
    }
}

/// Enumerate one directory: the self-record first, then each child in
/// listing order. Children that disappear or deny access mid-listing are
/// skipped; failure to open the directory itself is the caller's
/// pending-fix.
pub fn list_directory(path: &Path) -> io::Result<Vec<EntryMeta>> {
    let own = fs::symlink_metadata(path)?;
    let mut entries = Vec::with_capacity(16);
    entries.push(EntryMeta::from_metadata(
        leaf_name(path),
        ATTR_DIRECTORY | ATTR_DOT,
        &own,
    ));

    for entry in fs::read_dir(path)?.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        entries.push(EntryMeta::from_metadata(
            entry.file_name(),
            attributes_of(file_type),
            &meta,
        ));
    }
    Ok(entries)
}

/// Final path component, or the path itself when there is none (`/`).
pub fn leaf_name(path: &Path) -> OsString {
    path.file_name()
        .map(OsString::from)
        .unwrap_or_else(|| path.as_os_str().to_os_string())
}

fn nanos_of(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
