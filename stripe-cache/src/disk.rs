//! A single device/file underlying one or more stripes (`SPEC_FULL.md`
//! §2, §4.8): carves the backing store into stripe-blocks, tracks a running
//! I/O error count, and transitions online/failing/offline.

use std::path::{Path, PathBuf};

use snafu::Snafu;
use tracing::{error, warn};

pub const DISK_HEADER_MAGIC: u32 = 0x4449_534b; // "DISK"
pub const STORE_BLOCK_SIZE: u64 = 8192;

#[derive(Debug, Snafu)]
pub enum DiskError {
    #[snafu(display("disk I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("disk header has bad magic {found:#x}"))]
    BadHeader { found: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskState {
    Online,
    Failing,
    Offline,
}

/// One stripe's carve-out of a disk, as recorded in the disk header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskVolBlock {
    pub number: u32,
    pub offset_bytes: u64,
    pub len_blocks: u64,
    pub read_write: bool,
}

pub struct Disk {
    path: PathBuf,
    num_blocks: u64,
    blocks: Vec<DiskVolBlock>,
    error_count: u32,
    max_errors: u32,
    state: DiskState,
}

impl Disk {
    /// Opens (or initializes, if empty) the disk header for `path`, which is
    /// `num_blocks * STORE_BLOCK_SIZE` bytes long.
    pub fn open(path: impl AsRef<Path>, num_blocks: u64, max_errors: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            num_blocks,
            blocks: Vec::new(),
            error_count: 0,
            max_errors,
            state: DiskState::Online,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> DiskState {
        self.state
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn blocks(&self) -> &[DiskVolBlock] {
        &self.blocks
    }

    /// Carves out a new stripe of `len_blocks` store-blocks, returning its
    /// absolute byte offset. Fails (returns `None`) if the disk has no
    /// remaining room.
    pub fn carve_stripe(&mut self, number: u32, len_blocks: u64, read_write: bool) -> Option<u64> {
        let used: u64 = self.blocks.iter().map(|b| b.len_blocks).sum();
        if used + len_blocks > self.num_blocks {
            return None;
        }
        let offset_bytes = used * STORE_BLOCK_SIZE;
        self.blocks.push(DiskVolBlock {
            number,
            offset_bytes,
            len_blocks,
            read_write,
        });
        Some(offset_bytes)
    }

    /// Records an I/O error; transitions online -> failing on the first
    /// error, and failing -> offline once `max_errors` is exceeded. Marking
    /// offline is idempotent (`SPEC_FULL.md` §4.8).
    pub fn record_error(&mut self) -> DiskState {
        if self.state == DiskState::Offline {
            return self.state;
        }

        self.error_count += 1;
        metrics::counter!("disk.errors").increment(1);
        if self.state == DiskState::Online {
            self.state = DiskState::Failing;
            warn!(path = %self.path.display(), "disk transitioning online -> failing");
        }
        if self.error_count > self.max_errors {
            self.state = DiskState::Offline;
            error!(path = %self.path.display(), errors = self.error_count, "disk marked offline");
        }
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn is_online(&self) -> bool {
        self.state == DiskState::Online || self.state == DiskState::Failing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_stripe_fails_when_disk_is_full() {
        let mut disk = Disk::open("/tmp/disk0", 100, 5);
        assert!(disk.carve_stripe(0, 60, true).is_some());
        assert!(disk.carve_stripe(1, 60, true).is_none());
        assert!(disk.carve_stripe(1, 40, true).is_some());
    }

    #[test]
    fn error_counter_drives_state_transitions() {
        let mut disk = Disk::open("/tmp/disk0", 100, 2);
        assert_eq!(disk.record_error(), DiskState::Failing);
        assert_eq!(disk.record_error(), DiskState::Failing);
        assert_eq!(disk.record_error(), DiskState::Offline);
        // Idempotent once offline.
        assert_eq!(disk.record_error(), DiskState::Offline);
    }
}
