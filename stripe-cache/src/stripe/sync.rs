//! Periodic directory sync bookkeeping (`SPEC_FULL.md` §4.4).
//!
//! The actual disk write (header, body, footer in three pieces, to the
//! alternate on-disk copy) is driven from [`super::Stripe`]; this module
//! decides *whether* a sync should run and which copy it targets.

use tracing::trace;

use super::header::sync_target_is_copy_a;

#[derive(Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing dirty, or a sync already in flight; skip this tick.
    Skip,
    /// The aggregation buffer still has unflushed bytes; ask the write
    /// engine to flush once before retrying the sync.
    FlushFirst,
    /// Snapshot and write the directory now, to copy A or copy B.
    Run { target_copy_a: bool, new_sync_serial: u64 },
}

pub struct SyncState {
    dirty: bool,
    in_progress: bool,
    current_sync_serial: u64,
}

impl SyncState {
    pub fn new(current_sync_serial: u64) -> Self {
        Self {
            dirty: false,
            in_progress: false,
            current_sync_serial,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn current_sync_serial(&self) -> u64 {
        self.current_sync_serial
    }

    /// Decides what this tick of the periodic sync task should do.
    pub fn tick(&self, agg_buffer_has_bytes: bool, io_in_progress: bool) -> SyncAction {
        if !self.dirty && !self.in_progress {
            return SyncAction::Skip;
        }
        if agg_buffer_has_bytes || io_in_progress {
            return SyncAction::FlushFirst;
        }
        let new_sync_serial = self.current_sync_serial + 1;
        SyncAction::Run {
            target_copy_a: sync_target_is_copy_a(new_sync_serial),
            new_sync_serial,
        }
    }

    pub fn begin(&mut self) {
        self.in_progress = true;
    }

    /// Called once the write to the target copy completes successfully.
    pub fn complete(&mut self, new_sync_serial: u64) {
        trace!(new_sync_serial, "directory sync completed");
        self.current_sync_serial = new_sync_serial;
        self.dirty = false;
        self.in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_stripe_is_skipped() {
        let state = SyncState::new(4);
        assert_eq!(state.tick(false, false), SyncAction::Skip);
    }

    #[test]
    fn dirty_stripe_with_pending_bytes_flushes_first() {
        let mut state = SyncState::new(4);
        state.mark_dirty();
        assert_eq!(state.tick(true, false), SyncAction::FlushFirst);
    }

    #[test]
    fn dirty_stripe_syncs_to_alternating_copy() {
        let mut state = SyncState::new(4);
        state.mark_dirty();
        assert_eq!(
            state.tick(false, false),
            SyncAction::Run {
                target_copy_a: false,
                new_sync_serial: 5
            }
        );
    }
}
