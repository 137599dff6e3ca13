//! The per-directory swap log.
//!
//! An append-only log of `(add | remove)` events, one fixed-size record
//! per committed or released object. The swap-out driver emits exactly one
//! `add` record per successful commit and none for rollbacks; `remove` is
//! emitted when a committed object is released. Replaying the log rebuilds
//! the key → slot index after a crash or restart.

use crate::error::{StoreError, StoreResult};
use crate::key::{KEY_LEN, StoreKey};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Log file name within a swap directory.
pub const SWAP_LOG_NAME: &str = "swap.log";

/// Size of one serialized log record.
pub const RECORD_SIZE: usize = 40;

/// A swap log operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapLogOp {
    /// Object committed to disk.
    Add = 1,
    /// Committed object released.
    Remove = 2,
}

/// One swap log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapLogRecord {
    /// The operation.
    pub op: SwapLogOp,
    /// File number within the directory.
    pub filen: u32,
    /// Total on-disk size (header + body); meaningful for `Add`.
    pub swap_file_sz: u64,
    /// Record time, coarse Unix seconds.
    pub created: u32,
    /// Content key.
    pub key: StoreKey,
}

impl SwapLogRecord {
    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0] = self.op as u8;
        out[4..8].copy_from_slice(&self.filen.to_le_bytes());
        out[8..16].copy_from_slice(&self.swap_file_sz.to_le_bytes());
        out[16..20].copy_from_slice(&self.created.to_le_bytes());
        out[24..24 + KEY_LEN].copy_from_slice(self.key.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> StoreResult<Self> {
        let op = match bytes[0] {
            1 => SwapLogOp::Add,
            2 => SwapLogOp::Remove,
            _ => return Err(StoreError::Corrupt),
        };
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[24..24 + KEY_LEN]);
        Ok(Self {
            op,
            filen: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            swap_file_sz: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            created: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            key: StoreKey::from_bytes(key),
        })
    }
}

/// Append-only swap log for one directory.
pub struct SwapLog {
    path: PathBuf,
    file: File,
}

impl SwapLog {
    /// Open (or create) the log under `dir`.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = dir.join(SWAP_LOG_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Append a record. Log failures are warned about, not propagated:
    /// the object itself is already safely on disk (or gone).
    pub fn append(&mut self, record: SwapLogRecord) {
        if let Err(e) = self.file.write_all(&record.to_bytes()) {
            warn!(path = %self.path.display(), error = %e, "swap log append failed");
        }
    }

    /// Read all records back, oldest first. A truncated trailing record
    /// (torn write at crash) is tolerated and ignored; an invalid op byte
    /// means the log itself is damaged.
    pub fn replay(dir: &Path) -> StoreResult<Vec<SwapLogRecord>> {
        let path = dir.join(SWAP_LOG_NAME);
        let mut data = Vec::new();
        match File::open(&path) {
            Ok(mut f) => {
                if let Err(e) = f.read_to_end(&mut data) {
                    warn!(path = %path.display(), error = %e, "swap log read failed");
                    return Err(StoreError::DiskError);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "swap log open failed");
                return Err(StoreError::DiskError);
            }
        }

        let mut records = Vec::with_capacity(data.len() / RECORD_SIZE);
        for chunk in data.chunks(RECORD_SIZE) {
            let Ok(raw) = <&[u8; RECORD_SIZE]>::try_from(chunk) else {
                warn!(path = %path.display(), "ignoring truncated swap log tail");
                break;
            };
            records.push(SwapLogRecord::from_bytes(raw)?);
        }
        Ok(records)
    }
}
