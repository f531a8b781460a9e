//! # ffs-image
//!
//! Single source of truth for the shared directory image.
//!
//! The image is a flat byte range inside a named shared-memory region:
//! a fixed header (magic, version, status word, counters, bucket heads),
//! followed by variable-length node records navigated via raw 32-bit
//! offsets, followed by the hash bucket table. The writer daemon appends
//! through [`region::Region`]; reader processes attach with
//! [`region::ReaderRegion`] and resolve paths with [`navigator::ImageView`].
//!
//! Everything stored inside the region is an offset relative to the mapping
//! base, so writer and readers may map the object at different addresses
//! without fixups. Any field change in [`layout`] MUST maintain `#[repr(C)]`
//! ABI stability.

pub mod hash;
pub mod layout;
pub mod navigator;
pub mod region;

pub use layout::{ImageHeader, NodeRecord, Status};
pub use navigator::ImageView;
pub use region::{ReaderRegion, Region};

/// Errors surfaced by region management and image access.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write of {len} bytes at {offset:#x} exceeds the {max:#x}-byte region reservation")]
    RegionExhausted { offset: u32, len: u32, max: u32 },

    #[error("shared object carries magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("image format version {found} is not supported (this build speaks {supported})")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("shared object is too small to hold an image header")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, ImageError>;
