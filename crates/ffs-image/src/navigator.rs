//! Read-only navigation over a mapped image.
//!
//! All lookups are pure functions over the image bytes: hash a directory
//! path into a bucket, verify candidates against the parent chain, then
//! walk sibling chains for leaves. Lookup cost is
//! `O(bucket_length + depth * name_length)` worst case; with 1543 buckets
//! and healthy hash statistics it is a few dereferences per query.
//!
//! A miss is `None`, never an error. Tombstoned records are invisible.

use std::path::Path;

use crate::hash::bucket_of;
use crate::layout::{
    advance, ImageHeader, NodeRecord, BUCKET_COUNT, FIRST_RECORD_OFFSET, RECORD_PREFIX,
};

/// Borrowed view of an image, valid for both writer and reader mappings.
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    bytes: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn header(&self) -> &'a ImageHeader {
        unsafe { &*(self.bytes.as_ptr() as *const ImageHeader) }
    }

    /// Record at `offset`, or `None` when the offset cannot name a record
    /// inside the written image.
    pub fn record(&self, offset: u32) -> Option<&'a NodeRecord> {
        let end = self.header().bytes.min(self.bytes.len() as u32);
        let prefix_end = offset.checked_add(RECORD_PREFIX)?;
        if offset < FIRST_RECORD_OFFSET || offset % 8 != 0 || prefix_end > end {
            return None;
        }
        let rec = unsafe { &*(self.bytes.as_ptr().add(offset as usize) as *const NodeRecord) };
        if prefix_end.checked_add(rec.name_len)? > end {
            return None;
        }
        Some(rec)
    }

    /// Name bytes of the record at `offset`.
    pub fn name(&self, offset: u32) -> &'a [u8] {
        match self.record(offset) {
            Some(rec) => {
                let start = (offset + RECORD_PREFIX) as usize;
                &self.bytes[start..start + rec.name_len as usize]
            }
            None => &[],
        }
    }

    /// Offset of the next record in the same directory, `None` at chain end.
    pub fn next_sibling(&self, offset: u32) -> Option<u32> {
        let rec = self.record(offset)?;
        if rec.sibling_step == 0 {
            return None;
        }
        offset
            .checked_add(RECORD_PREFIX)?
            .checked_add(rec.sibling_step)
    }

    /// Offsets stored in one bucket's zero-terminated list.
    pub fn bucket_entries(&self, bucket: usize) -> impl Iterator<Item = u32> + 'a {
        let head = self.header().bucket_heads[bucket];
        BucketIter {
            bytes: self.bytes,
            cursor: head,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Resolve an absolute directory path to its dot-entry record offset.
    pub fn get_directory(&self, path: &Path) -> Option<u32> {
        self.get_directory_bytes(path.as_os_str().as_encoded_bytes())
    }

    pub fn get_directory_bytes(&self, path: &[u8]) -> Option<u32> {
        let path = strip_trailing_separators(path);
        if path.is_empty() {
            return None;
        }
        for offset in self.bucket_entries(bucket_of(path)) {
            let Some(rec) = self.record(offset) else {
                debug_assert!(false, "bucket entry does not name a record");
                continue;
            };
            if rec.is_tombstoned() || !rec.is_directory() {
                debug_assert!(rec.is_directory(), "bucket entry is not a directory");
                continue;
            }
            if self.matches_dir_chain(offset, path) {
                return Some(offset);
            }
        }
        None
    }

    /// Find `name` among the siblings of `dot_entry`'s directory.
    ///
    /// Membership is the shared group id: every record of the directory's
    /// listing carries the dot-entry's own `parent_offset`. Dot records
    /// are skipped so a child sharing its directory's name still resolves.
    pub fn get_leaf(&self, dot_entry: u32, name: &[u8]) -> Option<u32> {
        let group = self.record(dot_entry)?.parent_offset;
        let mut offset = dot_entry;
        loop {
            let rec = self.record(offset)?;
            if rec.parent_offset == group
                && !rec.is_dot()
                && !rec.is_tombstoned()
                && self.name(offset) == name
            {
                return Some(offset);
            }
            offset = self.next_sibling(offset)?;
        }
    }

    /// Resolve an absolute path to a directory dot-entry, a file record,
    /// or nothing. A trailing separator forces directory resolution.
    pub fn get_node(&self, path: &Path) -> Option<u32> {
        let bytes = path.as_os_str().as_encoded_bytes();
        if bytes.len() < 2 || bytes[0] != b'/' {
            return None;
        }
        let trimmed = strip_trailing_separators(bytes);
        if trimmed.len() < bytes.len() {
            return self.get_directory_bytes(trimmed);
        }
        let split = trimmed.iter().rposition(|&b| b == b'/')?;
        let (parent, leaf) = (&trimmed[..split], &trimmed[split + 1..]);
        if leaf.is_empty() {
            return None;
        }
        let parent = if parent.is_empty() { &b"/"[..] } else { parent };
        let dot = self.get_directory_bytes(parent)?;
        self.get_leaf(dot, leaf)
    }

    /// Absolute path of the record at `offset`, rebuilt from the parent
    /// chain. The synthetic root contributes the enumeration-root path.
    pub fn reconstruct_path(&self, offset: u32) -> Option<Vec<u8>> {
        let mut names: Vec<Vec<u8>> = Vec::new();
        let mut cursor = offset;
        for _ in 0..MAX_CHAIN_HOPS {
            let rec = self.record(cursor)?;
            names.push(self.name(cursor).to_vec());
            if rec.parent_offset == 0 {
                let mut path = Vec::new();
                for (i, name) in names.iter().rev().enumerate() {
                    if i > 0 && path.last() != Some(&b'/') {
                        path.push(b'/');
                    }
                    path.extend_from_slice(name);
                }
                return Some(path);
            }
            cursor = rec.parent_offset;
        }
        None
    }

    /// Verify a bucket candidate against `path` by walking the parent
    /// chain: the dot's name must close the path, then each ancestor
    /// consumes one trailing component, and the synthetic root must match
    /// the remainder in full.
    fn matches_dir_chain(&self, dot_entry: u32, path: &[u8]) -> bool {
        let Some(dot) = self.record(dot_entry) else {
            return false;
        };
        if dot.parent_offset == 0 {
            return self.name(dot_entry) == path;
        }
        if !ends_with_component(path, self.name(dot_entry)) {
            return false;
        }
        // The dot and the directory's record in its parent's listing share
        // a name, so the first ancestor hop consumes nothing.
        let mut offset = dot.parent_offset;
        let mut rest = path;
        for _ in 0..MAX_CHAIN_HOPS {
            let Some(rec) = self.record(offset) else {
                return false;
            };
            if rec.is_tombstoned() {
                return false;
            }
            let name = self.name(offset);
            if rec.parent_offset == 0 {
                return rest == name;
            }
            if !ends_with_component(rest, name) {
                return false;
            }
            rest = &rest[..rest.len() - name.len() - 1];
            if rest.is_empty() {
                // The consumed separator was the leading one: the
                // remaining ancestor path is the filesystem root.
                rest = b"/";
            }
            offset = rec.parent_offset;
        }
        debug_assert!(false, "parent chain did not terminate");
        false
    }
}

/// Hop bound for parent-chain walks; a chain longer than this means a
/// corrupt image, not a deep tree.
const MAX_CHAIN_HOPS: usize = 4096;

fn strip_trailing_separators(mut path: &[u8]) -> &[u8] {
    while path.len() > 1 && path[path.len() - 1] == b'/' {
        path = &path[..path.len() - 1];
    }
    path
}

fn ends_with_component(path: &[u8], name: &[u8]) -> bool {
    !name.is_empty()
        && path.len() > name.len()
        && path.ends_with(name)
        && path[path.len() - name.len() - 1] == b'/'
}

struct BucketIter<'a> {
    bytes: &'a [u8],
    cursor: u32,
}

impl Iterator for BucketIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let at = self.cursor as usize;
        if self.cursor == 0 || at + 4 > self.bytes.len() {
            return None;
        }
        let value = u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap());
        if value == 0 {
            return None;
        }
        self.cursor += 4;
        Some(value)
    }
}

/// Records in image order: the sweep run, then (skipping the bucket
/// table) anything the updater appended.
pub struct RecordIter<'a> {
    view: ImageView<'a>,
    cursor: u32,
    table_seen: bool,
}

impl<'a> ImageView<'a> {
    pub fn records(&self) -> RecordIter<'a> {
        RecordIter {
            view: *self,
            cursor: FIRST_RECORD_OFFSET,
            table_seen: false,
        }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        use crate::layout::BUCKET_SENTINEL;

        let end = self.view.header().bytes;
        loop {
            // The bucket table (and every bucket list the updater later
            // relocates) opens with the sentinel at a 16-byte boundary:
            // skip the zero-terminated lists behind it, then realign.
            let aligned = self.cursor.next_multiple_of(16);
            if aligned + 4 <= end && self.view.read_u32(aligned) == Some(BUCKET_SENTINEL) {
                let mut at = aligned + 4;
                let mut lists = 0usize;
                let expected = if self.table_seen { 1 } else { BUCKET_COUNT };
                while lists < expected {
                    match self.view.read_u32(at) {
                        Some(0) => lists += 1,
                        Some(_) => {}
                        None => return None,
                    }
                    at += 4;
                }
                self.table_seen = true;
                self.cursor = at.next_multiple_of(8);
                continue;
            }
            let offset = self.cursor;
            let rec = self.view.record(offset)?;
            self.cursor = advance(offset, rec.name_len);
            return Some(offset);
        }
    }
}

impl ImageView<'_> {
    fn read_u32(&self, offset: u32) -> Option<u32> {
        let at = offset as usize;
        if at + 4 > self.bytes.len() {
            return None;
        }
        Some(u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_suffix_requires_separator() {
        assert!(ends_with_component(b"/t/d", b"d"));
        assert!(ends_with_component(b"/t", b"t"));
        assert!(!ends_with_component(b"/td", b"d"));
        assert!(!ends_with_component(b"d", b"d"));
        assert!(!ends_with_component(b"/t/d", b""));
        assert!(!ends_with_component(b"/t/dd", b"d"));
    }

    #[test]
    fn trailing_separators_are_stripped() {
        assert_eq!(strip_trailing_separators(b"/t/d/"), b"/t/d");
        assert_eq!(strip_trailing_separators(b"/t/d//"), b"/t/d");
        assert_eq!(strip_trailing_separators(b"/"), b"/");
    }
}
