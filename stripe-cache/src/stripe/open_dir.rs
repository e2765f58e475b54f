//! Open-directory coordination table (`SPEC_FULL.md` §4.5): per-`first_key`
//! in-flight state for concurrent writers and read-while-writers.

use std::collections::HashMap;
use std::sync::Arc;

use stripe_cache_common::CacheKey;
use tokio::sync::Notify;
use tracing::trace;

/// A writer registered against an open-directory entry.
pub struct WriterHandle {
    pub id: u64,
    /// Bytes of the alternate's body the writer has accumulated so far;
    /// tailing readers poll this under the entry's notify.
    pub bytes_written: u64,
    pub closed: bool,
}

pub struct OpenDirEntry {
    pub writers: Vec<WriterHandle>,
    pub delayed_readers: u32,
    /// Where the alternate-vector Doc is (or will be) written.
    pub first_dir_offset: Option<u32>,
    pub vector_rereading: bool,
    pub vector_writing: bool,
    pub resident_alt_relocating: bool,
    notify: Arc<Notify>,
    next_writer_id: u64,
}

impl OpenDirEntry {
    fn new() -> Self {
        Self {
            writers: Vec::new(),
            delayed_readers: 0,
            first_dir_offset: None,
            vector_rereading: false,
            vector_writing: false,
            resident_alt_relocating: false,
            notify: Arc::new(Notify::new()),
            next_writer_id: 0,
        }
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

/// Table of open-directory entries, keyed by `first_key`; at most one entry
/// exists per key at a time.
pub struct OpenDirectory {
    entries: HashMap<CacheKey, OpenDirEntry>,
}

impl OpenDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a new writer for `first_key`. Returns the new writer's id
    /// and a handle to the entry's wakeup `Notify`, or `None` if an entry
    /// already exists and `allow_multiple` is false or `max_writers` is hit.
    pub fn open_write(
        &mut self,
        first_key: CacheKey,
        allow_multiple: bool,
        max_writers: usize,
    ) -> Option<(u64, Arc<Notify>)> {
        let entry = self.entries.entry(first_key).or_insert_with(OpenDirEntry::new);
        if !entry.writers.is_empty() && (!allow_multiple || entry.writers.len() >= max_writers) {
            return None;
        }
        let id = entry.next_writer_id;
        entry.next_writer_id += 1;
        entry.writers.push(WriterHandle {
            id,
            bytes_written: 0,
            closed: false,
        });
        Some((id, entry.notify_handle()))
    }

    /// Removes a writer; when the last writer leaves, the entry is cleared
    /// entirely (any delayed readers are expected to have already been
    /// notified via the entry's `Notify`).
    pub fn close_write(&mut self, first_key: CacheKey, writer_id: u64) {
        if let Some(entry) = self.entries.get_mut(&first_key) {
            entry.writers.retain(|w| w.id != writer_id);
            entry.notify.notify_waiters();
            if entry.writers.is_empty() {
                trace!(?first_key, "open-directory entry retired, last writer left");
                self.entries.remove(&first_key);
            }
        }
    }

    pub fn advance_writer(&mut self, first_key: CacheKey, writer_id: u64, bytes_written: u64) {
        if let Some(entry) = self.entries.get_mut(&first_key) {
            if let Some(w) = entry.writers.iter_mut().find(|w| w.id == writer_id) {
                w.bytes_written = bytes_written;
            }
            entry.notify.notify_waiters();
        }
    }

    pub fn get(&self, first_key: CacheKey) -> Option<&OpenDirEntry> {
        self.entries.get(&first_key)
    }

    pub fn get_mut(&mut self, first_key: CacheKey) -> Option<&mut OpenDirEntry> {
        self.entries.get_mut(&first_key)
    }

    pub fn is_open(&self, first_key: CacheKey) -> bool {
        self.entries.contains_key(&first_key)
    }
}

impl Default for OpenDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_rejected_without_allow_multiple() {
        let mut table = OpenDirectory::new();
        let key = CacheKey::from_words([1, 0, 0, 0]);
        assert!(table.open_write(key, false, 1).is_some());
        assert!(table.open_write(key, false, 1).is_none());
    }

    #[test]
    fn entry_retired_when_last_writer_closes() {
        let mut table = OpenDirectory::new();
        let key = CacheKey::from_words([1, 0, 0, 0]);
        let (id, _) = table.open_write(key, false, 1).unwrap();
        assert!(table.is_open(key));
        table.close_write(key, id);
        assert!(!table.is_open(key));
    }
}
