//! Strict LRU RAM cache policy (`SPEC_FULL.md` §4.9).

use std::collections::HashMap;

use bytes::Bytes;
use stripe_cache_common::{ByteSizeOf, CacheKey};
use tracing::trace;

use super::seen_filter::SeenFilter;
use super::{Aux, RamCache};

struct Entry {
    buf: Bytes,
    aux: Aux,
    /// Monotonic counter standing in for "doubly linked LRU list" position;
    /// the smallest value is evicted first.
    last_touched: u64,
}

pub struct LruCache {
    max_bytes: u64,
    used_bytes: u64,
    entries: HashMap<CacheKey, Entry>,
    clock: u64,
    seen_filter: Option<SeenFilter>,
}

impl LruCache {
    pub fn new(max_bytes: u64, use_seen_filter: bool) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            entries: HashMap::new(),
            clock: 0,
            seen_filter: use_seen_filter.then(SeenFilter::new),
        }
    }

    fn evict_until_fits(&mut self, incoming: u64) {
        while self.used_bytes + incoming > self.max_bytes && !self.entries.is_empty() {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_touched)
                .map(|(k, _)| *k);
            if let Some(key) = victim {
                if let Some(removed) = self.entries.remove(&key) {
                    self.used_bytes = self.used_bytes.saturating_sub(removed.buf.allocated_bytes() as u64);
                    trace!(?key, "lru evicting entry");
                }
            } else {
                break;
            }
        }
    }
}

impl RamCache for LruCache {
    fn get(&mut self, key: CacheKey, aux: Aux) -> Option<Bytes> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(&key)?;
        if entry.aux != aux {
            return None;
        }
        entry.last_touched = clock;
        Some(entry.buf.clone())
    }

    fn put(&mut self, key: CacheKey, buf: Bytes, aux: Aux, copy: bool) {
        if let Some(filter) = &mut self.seen_filter {
            if !filter.record(key) {
                return;
            }
        }

        let buf = if copy {
            Bytes::copy_from_slice(&buf)
        } else {
            buf
        };

        let incoming = buf.allocated_bytes() as u64;
        if incoming > self.max_bytes {
            return;
        }

        if let Some(old) = self.entries.remove(&key) {
            self.used_bytes = self.used_bytes.saturating_sub(old.buf.allocated_bytes() as u64);
        }

        self.evict_until_fits(incoming);
        self.clock += 1;
        self.used_bytes += incoming;
        self.entries.insert(
            key,
            Entry {
                buf,
                aux,
                last_touched: self.clock,
            },
        );
    }

    fn fixup(&mut self, key: CacheKey, old_aux: Aux, new_aux: Aux) -> bool {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.aux == old_aux {
                entry.aux = new_aux;
                return true;
            }
        }
        false
    }

    fn len_bytes(&self) -> u64 {
        self.used_bytes
    }

    fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_over_budget() {
        let mut cache = LruCache::new(16, false);
        cache.put(CacheKey::from_words([1, 0, 0, 0]), Bytes::from_static(b"0123456789"), (false, 0), false);
        cache.put(CacheKey::from_words([2, 0, 0, 0]), Bytes::from_static(b"0123456789"), (false, 0), false);
        assert!(cache.get(CacheKey::from_words([1, 0, 0, 0]), (false, 0)).is_none());
        assert!(cache.get(CacheKey::from_words([2, 0, 0, 0]), (false, 0)).is_some());
    }

    #[test]
    fn aux_mismatch_misses() {
        let mut cache = LruCache::new(1024, false);
        let key = CacheKey::from_words([1, 0, 0, 0]);
        cache.put(key, Bytes::from_static(b"hi"), (false, 5), false);
        assert!(cache.get(key, (false, 6)).is_none());
        assert!(cache.get(key, (false, 5)).is_some());
    }

    #[test]
    fn seen_filter_suppresses_first_touch() {
        let mut cache = LruCache::new(1024, true);
        let key = CacheKey::from_words([1, 0, 0, 0]);
        cache.put(key, Bytes::from_static(b"hi"), (false, 0), false);
        assert!(cache.get(key, (false, 0)).is_none());
        cache.put(key, Bytes::from_static(b"hi"), (false, 0), false);
        assert!(cache.get(key, (false, 0)).is_some());
    }
}
