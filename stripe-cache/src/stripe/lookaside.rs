//! Lookaside buffer (`SPEC_FULL.md` §3, §4.6): during evacuation of a
//! multi-fragment object, the head fragment's directory entry is withheld
//! here (keyed by `earliest_key`) until every later fragment has been
//! rewritten, so readers can still find the object mid-evacuation.

use std::collections::HashMap;

use stripe_cache_common::CacheKey;

use crate::directory::DirEntry;

pub struct Lookaside {
    pending: HashMap<CacheKey, DirEntry>,
}

impl Lookaside {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn hold(&mut self, earliest_key: CacheKey, pending_head: DirEntry) {
        self.pending.insert(earliest_key, pending_head);
    }

    pub fn get(&self, earliest_key: CacheKey) -> Option<&DirEntry> {
        self.pending.get(&earliest_key)
    }

    /// Installs the withheld head entry once the last fragment has been
    /// rewritten, returning it for the caller to install into the on-disk
    /// directory atomically.
    pub fn take(&mut self, earliest_key: CacheKey) -> Option<DirEntry> {
        self.pending.remove(&earliest_key)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every pending entry; called when a wrap makes any withheld
    /// head stale regardless of evacuation progress.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for Lookaside {
    fn default() -> Self {
        Self::new()
    }
}
