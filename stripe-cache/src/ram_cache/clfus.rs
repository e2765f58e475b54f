//! Clocked LFU by Size RAM cache policy (`SPEC_FULL.md` §4.9).
//!
//! Two queues: `lru[0]` holds resident entries, `lru[1]` holds metadata-only
//! ghosts of recent victims. Admission and eviction are driven by the value
//! function `V(e) = (hits + 1) / (size + overhead)` compared against a
//! running average.

use std::collections::HashMap;

use bytes::Bytes;
use stripe_cache_common::{ByteSizeOf, CacheKey};
use tracing::trace;

use super::seen_filter::SeenFilter;
use super::{Aux, RamCache};

/// Fixed per-entry bookkeeping overhead folded into the value function's
/// denominator so that very small objects don't dominate purely on size.
const OVERHEAD_BYTES: u64 = 48;
const REQUEUE_LIMIT: u32 = 8;
/// Ghosts older than this many `tick()` calls without a hit are dropped.
const GHOST_MAX_AGE: u32 = 10_000;

struct Resident {
    buf: Bytes,
    aux: Aux,
    hits: u32,
    size: u64,
    requeues: u32,
}

struct Ghost {
    size: u64,
    hits: u32,
    age: u32,
}

fn value(hits: u32, size: u64) -> f64 {
    f64::from(hits + 1) / (size + OVERHEAD_BYTES) as f64
}

pub struct ClfusCache {
    max_bytes: u64,
    used_bytes: u64,
    resident: HashMap<CacheKey, Resident>,
    /// Insertion order within `lru[0]`, oldest first; used as the eviction
    /// scan order (a clock hand over `resident`).
    order: Vec<CacheKey>,
    ghosts: HashMap<CacheKey, Ghost>,
    ghost_order: Vec<CacheKey>,
    running_avg_v: f64,
    seen_filter: Option<SeenFilter>,
}

impl ClfusCache {
    pub fn new(max_bytes: u64, use_seen_filter: bool) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            resident: HashMap::new(),
            order: Vec::new(),
            ghosts: HashMap::new(),
            ghost_order: Vec::new(),
            running_avg_v: 0.0,
            seen_filter: use_seen_filter.then(SeenFilter::new),
        }
    }

    fn update_running_avg(&mut self, sample: f64) {
        // Exponential moving average; a fixed literal smoothing factor
        // (no configuration knob in the source either).
        self.running_avg_v = self.running_avg_v * 0.99 + sample * 0.01;
    }

    fn push_ghost(&mut self, key: CacheKey, size: u64, hits: u32) {
        self.ghosts.insert(
            key,
            Ghost {
                size,
                hits,
                age: 0,
            },
        );
        self.ghost_order.push(key);
    }

    /// Ages every ghost by one tick, dropping ones that have sat too long.
    pub fn tick(&mut self) {
        let mut still_alive = Vec::with_capacity(self.ghost_order.len());
        for key in self.ghost_order.drain(..) {
            if let Some(ghost) = self.ghosts.get_mut(&key) {
                ghost.age += 1;
                if ghost.age <= GHOST_MAX_AGE {
                    still_alive.push(key);
                    continue;
                }
            }
            self.ghosts.remove(&key);
        }
        self.ghost_order = still_alive;
    }

    fn evict_until_fits(&mut self, incoming: u64) {
        let mut requeue_counts: HashMap<CacheKey, u32> = HashMap::new();
        while self.used_bytes + incoming > self.max_bytes && !self.order.is_empty() {
            let key = self.order.remove(0);
            let Some(entry) = self.resident.get(&key) else {
                continue;
            };
            let v = value(entry.hits, entry.size);
            let count = requeue_counts.entry(key).or_insert(0);
            if v > self.running_avg_v && *count < REQUEUE_LIMIT {
                *count += 1;
                self.order.push(key);
                continue;
            }

            let entry = self.resident.remove(&key).expect("checked above");
            self.used_bytes = self.used_bytes.saturating_sub(entry.size);
            trace!(?key, v, "clfus evicting resident entry");
            self.push_ghost(key, entry.size, entry.hits);
        }
    }
}

impl RamCache for ClfusCache {
    fn get(&mut self, key: CacheKey, aux: Aux) -> Option<Bytes> {
        if let Some(entry) = self.resident.get_mut(&key) {
            if entry.aux != aux {
                return None;
            }
            entry.hits += 1;
            let v = value(entry.hits, entry.size);
            let buf = entry.buf.clone();
            if v > self.running_avg_v {
                if let Some(pos) = self.order.iter().position(|k| *k == key) {
                    let k = self.order.remove(pos);
                    self.order.push(k);
                }
            }
            self.update_running_avg(v);
            return Some(buf);
        }

        if self.ghosts.contains_key(&key) {
            // Ghost hit: counts as a miss to the caller, but records the hit
            // so a subsequent `put` can decide whether to promote.
            if let Some(ghost) = self.ghosts.get_mut(&key) {
                ghost.hits += 1;
            }
        }
        None
    }

    fn put(&mut self, key: CacheKey, buf: Bytes, aux: Aux, copy: bool) {
        if let Some(filter) = &mut self.seen_filter {
            if !filter.record(key) && !self.ghosts.contains_key(&key) {
                return;
            }
        }

        let buf = if copy {
            Bytes::copy_from_slice(&buf)
        } else {
            buf
        };

        let size = buf.allocated_bytes() as u64;
        if size > self.max_bytes {
            return;
        }

        let ghost_hits = self.ghosts.remove(&key).map(|g| g.hits).unwrap_or(0);
        if ghost_hits > 0 {
            self.ghost_order.retain(|k| *k != key);
        }

        if let Some(old) = self.resident.remove(&key) {
            self.used_bytes = self.used_bytes.saturating_sub(old.size);
            self.order.retain(|k| *k != key);
        }

        self.evict_until_fits(size);
        self.used_bytes += size;
        self.order.push(key);
        self.resident.insert(
            key,
            Resident {
                buf,
                aux,
                hits: ghost_hits,
                size,
                requeues: 0,
            },
        );
    }

    fn fixup(&mut self, key: CacheKey, old_aux: Aux, new_aux: Aux) -> bool {
        if let Some(entry) = self.resident.get_mut(&key) {
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

    fn key(n: u32) -> CacheKey {
        CacheKey::from_words([n, 0, 0, 0])
    }

    #[test]
    fn frequently_hit_entry_survives_eviction_pressure() {
        let mut cache = ClfusCache::new(64, false);
        cache.put(key(1), Bytes::from_static(b"0123456789"), (false, 0), false);
        for _ in 0..20 {
            cache.get(key(1), (false, 0));
        }
        cache.put(key(2), Bytes::from_static(b"0123456789"), (false, 0), false);
        cache.put(key(3), Bytes::from_static(b"0123456789"), (false, 0), false);
        assert!(cache.get(key(1), (false, 0)).is_some());
    }

    #[test]
    fn eviction_creates_a_ghost() {
        let mut cache = ClfusCache::new(16, false);
        cache.put(key(1), Bytes::from_static(b"0123456789"), (false, 0), false);
        cache.put(key(2), Bytes::from_static(b"0123456789"), (false, 0), false);
        assert!(cache.ghosts.contains_key(&key(1)) || cache.ghosts.contains_key(&key(2)));
    }

    #[test]
    fn ghost_ages_out_after_many_ticks() {
        let mut cache = ClfusCache::new(16, false);
        cache.put(key(1), Bytes::from_static(b"0123456789"), (false, 0), false);
        cache.put(key(2), Bytes::from_static(b"0123456789"), (false, 0), false);
        for _ in 0..GHOST_MAX_AGE + 1 {
            cache.tick();
        }
        assert!(cache.ghosts.is_empty());
    }
}
