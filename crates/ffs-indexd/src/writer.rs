//! Append-side access to the image.
//!
//! [`ImageWriter`] owns the region and the write cursor. Records are
//! appended and never moved; `header.bytes` tracks the cursor after every
//! append so in-process navigation stays inside the written range. The
//! status word is the only thing readers synchronize on, so callers frame
//! mutation windows with [`ImageWriter::set_status`].

use ffs_image::layout::{
    padded_name_len, FileTime, Status, BUCKET_COUNT, BUCKET_SENTINEL, FIRST_RECORD_OFFSET,
    IMAGE_MAGIC, IMAGE_VERSION, NodeRecord, RECORD_PREFIX,
};
use ffs_image::{ImageView, Region, Result};

use crate::iterate::EntryMeta;

pub struct ImageWriter {
    region: Region,
    cursor: u32,
}

impl ImageWriter {
    /// Initialize a fresh image: header with `status = booting`, zeros
    /// elsewhere, cursor parked at the first record slot.
    pub fn create(mut region: Region) -> Result<Self> {
        region.fault_in(0, FIRST_RECORD_OFFSET)?;
        let header = region.header_mut();
        header.magic = IMAGE_MAGIC;
        header.version = IMAGE_VERSION;
        header.status = Status::Booting as u32;
        header.num_nodes = 0;
        header.num_dirs = 0;
        header.bytes = FIRST_RECORD_OFFSET;
        header.root_offset = 0;
        header.reserved = 0;
        header.bucket_heads.fill(0);
        Ok(Self {
            region,
            cursor: FIRST_RECORD_OFFSET,
        })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn view(&self) -> ImageView<'_> {
        self.region.view()
    }

    pub fn set_status(&self, status: Status) {
        self.region.set_status(status);
    }

    /// Append one record; returns its permanent offset.
    pub fn append_record(&mut self, entry: &EntryMeta, parent_offset: u32) -> Result<u32> {
        let name = entry.name_bytes();
        let name_len = name.len() as u32;
        let total = RECORD_PREFIX + padded_name_len(name_len);
        self.region.fault_in(self.cursor, total)?;

        let offset = self.cursor;
        *self.region.record_mut(offset) = NodeRecord {
            attributes: entry.attributes,
            create_time: FileTime::from_nanos(entry.create_nanos),
            access_time: FileTime::from_nanos(entry.access_nanos),
            write_time: FileTime::from_nanos(entry.write_nanos),
            size_high: (entry.size >> 32) as u32,
            size_low: entry.size as u32,
            parent_offset,
            sibling_step: 0,
            name_len,
        };
        self.region.write_bytes(offset + RECORD_PREFIX, name);
        let pad_start = offset + RECORD_PREFIX + name_len;
        let pad_len = (padded_name_len(name_len) - name_len) as usize;
        self.region.write_bytes(pad_start, &[0u8; 8][..pad_len]);

        self.cursor += total;
        self.region.header_mut().bytes = self.cursor;
        Ok(offset)
    }

    /// Fill the sibling steps of one directory's freshly written run; the
    /// last record keeps step 0.
    pub fn link_siblings(&mut self, offsets: &[u32]) {
        for pair in offsets.windows(2) {
            self.region.record_mut(pair[0]).sibling_step = pair[1] - (pair[0] + RECORD_PREFIX);
        }
    }

    /// Point the directory's current last sibling at a newly appended
    /// record.
    pub fn patch_last_sibling(&mut self, dot_entry: u32, new_offset: u32) {
        let mut last = dot_entry;
        {
            let view = self.view();
            while let Some(next) = view.next_sibling(last) {
                last = next;
            }
        }
        self.region.record_mut(last).sibling_step = new_offset - (last + RECORD_PREFIX);
    }

    pub fn record_mut(&mut self, offset: u32) -> &mut NodeRecord {
        self.region.record_mut(offset)
    }

    pub fn set_root_offset(&mut self, offset: u32) {
        self.region.header_mut().root_offset = offset;
    }

    pub fn set_counts(&mut self, num_nodes: u32, num_dirs: u32) {
        let header = self.region.header_mut();
        header.num_nodes = num_nodes;
        header.num_dirs = num_dirs;
    }

    pub fn bump_counts(&mut self, nodes: u32, dirs: u32) {
        let header = self.region.header_mut();
        header.num_nodes += nodes;
        header.num_dirs += dirs;
    }

    /// Emit the bucket table: the sentinel at the next 16-byte boundary,
    /// then one zero-terminated offset run per bucket, heads recorded in
    /// the header's inline array.
    pub fn emit_bucket_table(&mut self, buckets: &[Vec<u32>]) -> Result<()> {
        debug_assert_eq!(buckets.len(), BUCKET_COUNT);
        let sentinel_at = self.cursor.next_multiple_of(16);
        self.region.fault_in(self.cursor, sentinel_at - self.cursor + 4)?;
        self.region.write_u32(sentinel_at, BUCKET_SENTINEL);

        let mut at = sentinel_at + 4;
        for (bucket, offsets) in buckets.iter().enumerate() {
            let len = (offsets.len() as u32 + 1) * 4;
            self.region.fault_in(at, len)?;
            let head = at;
            for &offset in offsets {
                self.region.write_u32(at, offset);
                at += 4;
            }
            self.region.write_u32(at, 0);
            at += 4;
            self.region.header_mut().bucket_heads[bucket] = head;
        }

        self.cursor = at.next_multiple_of(8);
        self.region.header_mut().bytes = self.cursor;
        Ok(())
    }

    /// Register a new directory in its bucket. The list is rewritten at
    /// the cursor (sentinel, old offsets, the new one, terminating zero)
    /// and the header head repointed; the stale list bytes stay behind,
    /// unreachable.
    pub fn extend_bucket(&mut self, bucket: usize, new_offset: u32) -> Result<()> {
        let old: Vec<u32> = self.view().bucket_entries(bucket).collect();

        let sentinel_at = self.cursor.next_multiple_of(16);
        let total = sentinel_at - self.cursor + 4 + (old.len() as u32 + 2) * 4;
        self.region.fault_in(self.cursor, total)?;
        self.region.write_u32(sentinel_at, BUCKET_SENTINEL);

        let head = sentinel_at + 4;
        let mut at = head;
        for &offset in &old {
            self.region.write_u32(at, offset);
            at += 4;
        }
        self.region.write_u32(at, new_offset);
        at += 4;
        self.region.write_u32(at, 0);
        at += 4;

        self.region.header_mut().bucket_heads[bucket] = head;
        self.cursor = at.next_multiple_of(8);
        self.region.header_mut().bytes = self.cursor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_image::layout::advance;
    use tempfile::tempdir;

    fn entry(name: &str, size: u64) -> EntryMeta {
        EntryMeta {
            name: name.into(),
            attributes: 0,
            create_nanos: 1,
            access_nanos: 2,
            write_nanos: 3,
            size,
        }
    }

    fn fresh_writer(dir: &tempfile::TempDir) -> ImageWriter {
        let region = Region::create_at(&dir.path().join("img.ffs"), 8 * 1024 * 1024).unwrap();
        ImageWriter::create(region).unwrap()
    }

    #[test]
    fn records_append_contiguously() {
        let dir = tempdir().unwrap();
        let mut writer = fresh_writer(&dir);

        let a = writer.append_record(&entry("alpha", 10), 0).unwrap();
        let b = writer.append_record(&entry("b", 20), 0).unwrap();
        assert_eq!(a, FIRST_RECORD_OFFSET);
        assert_eq!(b, advance(a, 5));
        assert_eq!(writer.region().header().bytes, writer.cursor());

        let view = writer.view();
        assert_eq!(view.name(a), b"alpha");
        assert_eq!(view.record(b).unwrap().size(), 20);
    }

    #[test]
    fn sibling_runs_link_and_patch() {
        let dir = tempdir().unwrap();
        let mut writer = fresh_writer(&dir);

        let run: Vec<u32> = ["one", "two", "three"]
            .into_iter()
            .map(|n| writer.append_record(&entry(n, 0), 0).unwrap())
            .collect();
        writer.link_siblings(&run);

        let view = writer.view();
        assert_eq!(view.next_sibling(run[0]), Some(run[1]));
        assert_eq!(view.next_sibling(run[1]), Some(run[2]));
        assert_eq!(view.next_sibling(run[2]), None);

        let appended = writer.append_record(&entry("four", 0), 0).unwrap();
        writer.patch_last_sibling(run[0], appended);
        let view = writer.view();
        assert_eq!(view.next_sibling(run[2]), Some(appended));
        assert_eq!(view.next_sibling(appended), None);
    }

    #[test]
    fn bucket_table_round_trips_through_the_view() {
        let dir = tempdir().unwrap();
        let mut writer = fresh_writer(&dir);
        let offset = writer.append_record(&entry("somedir", 0), 0).unwrap();

        let mut buckets = vec![Vec::new(); BUCKET_COUNT];
        buckets[7].push(offset);
        writer.emit_bucket_table(&buckets).unwrap();

        let view = writer.view();
        assert_eq!(view.bucket_entries(7).collect::<Vec<_>>(), vec![offset]);
        assert_eq!(view.bucket_entries(8).count(), 0);
        assert_eq!(view.bucket_entries(BUCKET_COUNT - 1).count(), 0);
    }

    #[test]
    fn extended_buckets_keep_old_entries() {
        let dir = tempdir().unwrap();
        let mut writer = fresh_writer(&dir);
        let first = writer.append_record(&entry("d1", 0), 0).unwrap();
        let second = writer.append_record(&entry("d2", 0), 0).unwrap();

        let mut buckets = vec![Vec::new(); BUCKET_COUNT];
        buckets[3].push(first);
        writer.emit_bucket_table(&buckets).unwrap();

        writer.extend_bucket(3, second).unwrap();
        let view = writer.view();
        assert_eq!(view.bucket_entries(3).collect::<Vec<_>>(), vec![first, second]);
        // Appends after the table stay 8-aligned.
        assert_eq!(writer.cursor() % 8, 0);
    }
}
