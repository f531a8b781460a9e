//! Shared-memory region management.
//!
//! The writer reserves the full region up front as a sparse file under
//! `/dev/shm` (or the system temp directory) and maps it shared. Physical
//! pages are committed lazily: a commit watermark trails the write cursor
//! and is advanced in at-least-1-MiB chunks as writes approach it. A write
//! that would land beyond the reservation is the out-of-range fault and is
//! fatal to the writer. Offsets never move under either condition.
//!
//! Readers map the same object read-only by name and see writer updates
//! through the shared pages; the status word at header offset 8 is the
//! only coordination primitive.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{Mmap, MmapMut};
use tracing::{debug, trace};

use crate::layout::{
    ImageHeader, NodeRecord, Status, FIRST_RECORD_OFFSET, HEADER_SIZE, IMAGE_MAGIC, IMAGE_VERSION,
    RECORD_PREFIX, STATUS_OFFSET,
};
use crate::{ImageError, Result};

/// Commit granularity for lazy page backing.
pub const COMMIT_CHUNK: u32 = 1024 * 1024;

const PAGE: u32 = 4096;

/// Well-known region name for an enumeration root, reference form
/// `ffs_<root with separators replaced by '!'>`.
pub fn region_name_for_root(root: &Path) -> String {
    let mut name = String::from("ffs_");
    for b in root.as_os_str().as_encoded_bytes() {
        match b {
            b'/' | b'\\' => name.push('!'),
            &c if c.is_ascii_alphanumeric() || c == b'.' || c == b'-' || c == b'_' => {
                name.push(c as char)
            }
            _ => name.push('~'),
        }
    }
    name
}

/// Filesystem path backing a named region object.
pub fn region_object_path(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

// ---------------------------------------------------------------------------
// Writer side
// ---------------------------------------------------------------------------

/// Writer mapping of a named region. Exactly one per region name.
pub struct Region {
    map: MmapMut,
    max_size: u32,
    committed: u32,
    chunk: u32,
    path: PathBuf,
}

impl Region {
    /// Create (or reset) the named region and map it read-write.
    pub fn create(name: &str, max_size: u32) -> Result<Self> {
        Self::create_at(&region_object_path(name), max_size)
    }

    /// Create a region backed by an explicit file path.
    pub fn create_at(path: &Path, max_size: u32) -> Result<Self> {
        if (max_size as usize) < HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(max_size))?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!(path = %path.display(), max_size, "region reserved");
        Ok(Self {
            map,
            max_size,
            committed: 0,
            chunk: COMMIT_CHUNK,
            path: path.to_path_buf(),
        })
    }

    /// Override the commit granularity (growth tests use small chunks).
    pub fn with_commit_chunk(mut self, chunk: u32) -> Self {
        self.chunk = chunk.max(PAGE);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Bytes currently committed behind the watermark.
    pub fn committed(&self) -> u32 {
        self.committed
    }

    /// Ensure `[offset, offset + len)` is committed, advancing the
    /// watermark chunk-wise. An end past the reservation is the
    /// out-of-range fault: the caller must treat it as fatal.
    pub fn fault_in(&mut self, offset: u32, len: u32) -> Result<()> {
        let end = offset.checked_add(len).ok_or(ImageError::RegionExhausted {
            offset,
            len,
            max: self.max_size,
        })?;
        if end > self.max_size {
            return Err(ImageError::RegionExhausted {
                offset,
                len,
                max: self.max_size,
            });
        }
        while self.committed < end {
            let next = self
                .committed
                .saturating_add(self.chunk.max(end - self.committed))
                .min(self.max_size);
            let mut page = self.committed;
            while page < next {
                self.map[page as usize] = 0;
                page = page.saturating_add(PAGE);
            }
            trace!(from = self.committed, to = next, "committed region chunk");
            self.committed = next;
        }
        Ok(())
    }

    pub fn header(&self) -> &ImageHeader {
        unsafe { &*(self.map.as_ptr() as *const ImageHeader) }
    }

    pub fn header_mut(&mut self) -> &mut ImageHeader {
        unsafe { &mut *(self.map.as_mut_ptr() as *mut ImageHeader) }
    }

    /// Record at `offset`. The caller is responsible for `offset` naming
    /// a record start inside the committed range.
    pub fn record(&self, offset: u32) -> &NodeRecord {
        debug_assert!(offset >= FIRST_RECORD_OFFSET && offset % 8 == 0);
        debug_assert!(offset + RECORD_PREFIX <= self.committed);
        unsafe { &*(self.map.as_ptr().add(offset as usize) as *const NodeRecord) }
    }

    pub fn record_mut(&mut self, offset: u32) -> &mut NodeRecord {
        debug_assert!(offset >= FIRST_RECORD_OFFSET && offset % 8 == 0);
        debug_assert!(offset + RECORD_PREFIX <= self.committed);
        unsafe { &mut *(self.map.as_mut_ptr().add(offset as usize) as *mut NodeRecord) }
    }

    /// Copy raw bytes into the region. The range must already be
    /// committed via [`Region::fault_in`].
    pub fn write_bytes(&mut self, offset: u32, src: &[u8]) {
        let start = offset as usize;
        self.map[start..start + src.len()].copy_from_slice(src);
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Publish a new status. Release ordering makes every preceding
    /// record and header write visible to readers that acquire the word.
    pub fn set_status(&self, status: Status) {
        self.status_word().store(status as u32, Ordering::Release);
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_raw(self.status_word().load(Ordering::Acquire))
    }

    fn status_word(&self) -> &AtomicU32 {
        unsafe { &*(self.map.as_ptr().add(STATUS_OFFSET) as *const AtomicU32) }
    }

    /// Read-only view for in-process navigation.
    pub fn view(&self) -> crate::navigator::ImageView<'_> {
        crate::navigator::ImageView::new(&self.map)
    }
}

// ---------------------------------------------------------------------------
// Reader side
// ---------------------------------------------------------------------------

/// Read-only mapping of a named region from another process.
#[derive(Debug)]
pub struct ReaderRegion {
    map: Mmap,
}

impl ReaderRegion {
    /// Attach to the named region read-only.
    pub fn attach(name: &str) -> Result<Self> {
        Self::attach_at(&region_object_path(name))
    }

    /// Attach to a region backed by an explicit file path. Magic and
    /// version are validated before any offset is dereferenced.
    pub fn attach_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        let this = Self { map };
        let header = this.header();
        if header.magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic {
                found: header.magic,
                expected: IMAGE_MAGIC,
            });
        }
        if header.version != IMAGE_VERSION {
            return Err(ImageError::VersionMismatch {
                found: header.version,
                supported: IMAGE_VERSION,
            });
        }
        Ok(this)
    }

    pub fn header(&self) -> &ImageHeader {
        unsafe { &*(self.map.as_ptr() as *const ImageHeader) }
    }

    /// Acquire-load the status word; pairs with the writer's release
    /// stores, so a `Finished` observation covers all published writes.
    pub fn status(&self) -> Option<Status> {
        let word = unsafe { &*(self.map.as_ptr().add(STATUS_OFFSET) as *const AtomicU32) };
        Status::from_raw(word.load(Ordering::Acquire))
    }

    pub fn view(&self) -> crate::navigator::ImageView<'_> {
        crate::navigator::ImageView::new(&self.map)
    }
}
