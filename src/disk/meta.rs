//! Serialized object metadata.
//!
//! Every on-disk object file begins with a fixed-length [`SwapMeta`]
//! header; the raw response bytes follow immediately at offset
//! [`SwapMeta::SIZE`]. The header is written as the first write of a
//! swap-out, possibly before the final object size is known.

use crate::error::{StoreError, StoreResult};
use crate::key::{KEY_LEN, StoreKey};

/// Magic bytes identifying a stash object file.
pub const META_MAGIC: [u8; 8] = *b"STASHOBJ";

/// Current header format version.
pub const META_VERSION: u32 = 1;

/// Sentinel for an object size not yet known at header-write time.
pub const SIZE_UNKNOWN: u64 = u64::MAX;

/// Metadata header stored at the beginning of each object file.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapMeta {
    /// Magic bytes: "STASHOBJ"
    pub magic: [u8; 8],
    /// Header format version
    pub version: u32,
    /// Creation time, coarse Unix seconds
    pub created: u32,
    /// Expiry time, coarse Unix seconds (0 = none)
    pub expires: u32,
    /// Last-modified time, coarse Unix seconds (0 = unknown)
    pub last_modified: u32,
    /// Body length in bytes, or [`SIZE_UNKNOWN`]
    pub object_size: u64,
    /// Content key of the stored object
    pub key: [u8; KEY_LEN],
    /// Reserved for future use
    pub _reserved: [u8; 16],
}

/// Header size in bytes (cache line aligned).
pub const META_SIZE: usize = 64;

impl SwapMeta {
    /// Header size in bytes.
    pub const SIZE: usize = META_SIZE;

    /// Create a header for `key` stamped with the current time.
    pub fn new(key: StoreKey, object_size: Option<u64>) -> Self {
        Self {
            magic: META_MAGIC,
            version: META_VERSION,
            created: now_secs(),
            expires: 0,
            last_modified: 0,
            object_size: object_size.unwrap_or(SIZE_UNKNOWN),
            key: *key.as_bytes(),
            _reserved: [0u8; 16],
        }
    }

    /// The content key recorded in the header.
    pub fn key(&self) -> StoreKey {
        StoreKey::from_bytes(self.key)
    }

    /// The body length recorded in the header, if it was known.
    pub fn object_size(&self) -> Option<u64> {
        (self.object_size != SIZE_UNKNOWN).then_some(self.object_size)
    }

    /// Validate magic and version.
    pub fn validate(&self) -> StoreResult<()> {
        if self.magic != META_MAGIC {
            return Err(StoreError::Corrupt);
        }
        if self.version != META_VERSION {
            return Err(StoreError::Corrupt);
        }
        Ok(())
    }

    /// Read a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < META_SIZE {
            return Err(StoreError::Corrupt);
        }
        // Safety: we're reading into a repr(C) struct with known layout
        let meta = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const SwapMeta) };
        meta.validate()?;
        Ok(meta)
    }

    /// Write the header to bytes.
    pub fn to_bytes(&self) -> [u8; META_SIZE] {
        let mut bytes = [0u8; META_SIZE];
        // Safety: we're writing from a repr(C) struct with known layout
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const SwapMeta as *const u8,
                bytes.as_mut_ptr(),
                std::mem::size_of::<SwapMeta>(),
            );
        }
        bytes
    }
}

/// Current time as coarse Unix seconds.
pub fn now_secs() -> u32 {
    clocksource::coarse::UnixInstant::now()
        .duration_since(clocksource::coarse::UnixInstant::EPOCH)
        .as_secs()
}
