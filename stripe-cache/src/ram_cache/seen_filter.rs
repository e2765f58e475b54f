//! A cheap, lossy "seen before" filter (`SPEC_FULL.md` §4.9): on first
//! sighting of a key a `put` is refused and only the fingerprint recorded; on
//! second sighting the put proceeds. Shared between the LRU and CLFUS
//! policies.

use stripe_cache_common::CacheKey;

const DEFAULT_SLOTS: usize = 1 << 16;

pub struct SeenFilter {
    slots: Vec<u16>,
}

impl SeenFilter {
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_SLOTS)
    }

    pub fn with_slots(slots: usize) -> Self {
        Self {
            slots: vec![0; slots.max(1)],
        }
    }

    fn index_and_tag(&self, key: CacheKey) -> (usize, u16) {
        let h = key.slice32(0) as usize;
        let index = h % self.slots.len();
        let tag = (key.slice32(1) & 0xffff) as u16 | 1; // never 0, 0 means "unseen"
        (index, tag)
    }

    /// Records a sighting; returns `true` if this key had already been
    /// recorded (a collision with a different key also reads as "seen" —
    /// the filter is deliberately lossy).
    pub fn record(&mut self, key: CacheKey) -> bool {
        let (index, tag) = self.index_and_tag(key);
        let seen = self.slots[index] == tag;
        self.slots[index] = tag;
        seen
    }
}

impl Default for SeenFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_unseen_second_is_seen() {
        let mut filter = SeenFilter::with_slots(1024);
        let key = CacheKey::from_words([1, 2, 3, 4]);
        assert!(!filter.record(key));
        assert!(filter.record(key));
    }
}
