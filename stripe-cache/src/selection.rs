//! Stripe selection: host-suffix matching plus a consistent-hashing
//! assignment table (`SPEC_FULL.md` §4.10).

use std::collections::HashMap;

use stripe_cache_common::CacheKey;

pub const VOL_HASH_TABLE_SIZE: usize = 32768;
const TAG_WIDTH: u32 = 16;

/// One stripe's contribution to the hash table: its index plus the number
/// of points it claims, proportional to `len / alloc_size`.
#[derive(Clone, Copy, Debug)]
pub struct StripeWeight {
    pub stripe_index: usize,
    pub len_bytes: u64,
}

/// Deterministic 32-bit generator seeded by a stripe's `hash_id`, standing
/// in for the source's seeded PRNG: points must be reproducible from the
/// stripe identity alone so the table is rebuildable without persisting it.
fn point_value(seed: u64, point: u64) -> u32 {
    let mut x = seed ^ point.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    (x >> 32) as u32
}

/// Builds the `VOL_HASH_TABLE_SIZE`-slot assignment table for a set of
/// stripes. Each stripe contributes `len_bytes / alloc_size` points; slots
/// are assigned to the stripe whose nearest point (by sorted position) wins.
pub fn build_vol_hash_table(stripes: &[StripeWeight], alloc_size: u64, hash_seed: u64) -> Vec<usize> {
    let alloc_size = alloc_size.max(1);
    let mut points: Vec<(u32, usize)> = Vec::new();
    for stripe in stripes {
        let n_points = (stripe.len_bytes / alloc_size).max(1);
        for p in 0..n_points {
            let seed = hash_seed ^ (stripe.stripe_index as u64).wrapping_mul(0x1000_0000_01b3);
            points.push((point_value(seed, p), stripe.stripe_index));
        }
    }
    points.sort_unstable_by_key(|(v, _)| *v);

    if points.is_empty() {
        return Vec::new();
    }

    let mut table = vec![0usize; VOL_HASH_TABLE_SIZE];
    let slot_span = (u32::MAX as u64 / VOL_HASH_TABLE_SIZE as u64).max(1) as u32;
    let mut point_idx = 0usize;
    for (slot, owner) in table.iter_mut().enumerate() {
        let nominal = (slot as u64 * slot_span as u64) as u32;
        while point_idx + 1 < points.len() && points[point_idx].0 < nominal {
            point_idx += 1;
        }
        *owner = points[point_idx].1;
    }
    table
}

pub fn lookup_stripe(table: &[usize], key: CacheKey) -> Option<usize> {
    if table.is_empty() {
        return None;
    }
    let idx = (key.slice32(2) >> TAG_WIDTH) as usize % table.len();
    Some(table[idx])
}

/// A rule's stripe subset plus the weighted hash table built over just that
/// subset, so host-scoped lookups get the same stability property (removing
/// one stripe perturbs only ~1/N of slots) as the global table.
struct HostRule {
    stripe_indices: Vec<usize>,
    hash_table: Vec<usize>,
}

/// A hostname-to-stripe-subset rule set, matched by longest suffix.
#[derive(Default)]
pub struct HostTable {
    /// Reversed-label suffix (e.g. `"com.example."`) -> rule.
    rules: HashMap<String, HostRule>,
}

fn reverse_labels(host: &str) -> String {
    let mut labels: Vec<&str> = host.split('.').collect();
    labels.reverse();
    let mut out = labels.join(".");
    out.push('.');
    out
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a suffix rule scoping `hostname`s under `suffix` to
    /// `stripes`, building a weighted hash table over just that subset the
    /// same way [`build_vol_hash_table`] builds the global one.
    pub fn add_rule(&mut self, suffix: &str, stripes: &[StripeWeight], alloc_size: u64, hash_seed: u64) {
        let hash_table = build_vol_hash_table(stripes, alloc_size, hash_seed);
        let stripe_indices = stripes.iter().map(|s| s.stripe_index).collect();
        self.rules
            .insert(reverse_labels(suffix), HostRule { stripe_indices, hash_table });
    }

    fn matching_rule(&self, hostname: &str) -> Option<&HostRule> {
        let reversed = reverse_labels(hostname);
        self.rules
            .iter()
            .filter(|(suffix, _)| reversed.starts_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, rule)| rule)
    }

    /// Returns the stripe subset for the longest matching suffix rule, if any.
    pub fn stripes_for(&self, hostname: &str) -> Option<&[usize]> {
        self.matching_rule(hostname).map(|rule| rule.stripe_indices.as_slice())
    }

    /// Resolves `key` within the longest matching suffix rule's weighted
    /// table, or `None` if no rule matches this hostname.
    pub fn lookup(&self, hostname: &str, key: CacheKey) -> Option<usize> {
        let rule = self.matching_rule(hostname)?;
        lookup_stripe(&rule.hash_table, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stripe_claims_every_slot() {
        let stripes = vec![StripeWeight {
            stripe_index: 0,
            len_bytes: 1 << 30,
        }];
        let table = build_vol_hash_table(&stripes, 1 << 20, 42);
        assert!(table.iter().all(|&owner| owner == 0));
    }

    #[test]
    fn removing_one_stripe_perturbs_a_small_fraction_of_slots() {
        let stripes: Vec<StripeWeight> = (0..8)
            .map(|i| StripeWeight {
                stripe_index: i,
                len_bytes: 1 << 30,
            })
            .collect();
        let before = build_vol_hash_table(&stripes, 1 << 20, 7);

        let mut after_stripes = stripes.clone();
        after_stripes[3].len_bytes = (1 << 30) / 2;
        let after = build_vol_hash_table(&after_stripes, 1 << 20, 7);

        let changed = before.iter().zip(after.iter()).filter(|(a, b)| a != b).count();
        // Shrinking one of eight stripes by half should only perturb a
        // minority of slots, not a wholesale reshuffle.
        assert!(changed < before.len() / 2);
    }

    #[test]
    fn host_table_matches_longest_suffix() {
        let mut table = HostTable::new();
        let broad = [
            StripeWeight { stripe_index: 0, len_bytes: 1 << 30 },
            StripeWeight { stripe_index: 1, len_bytes: 1 << 30 },
        ];
        let narrow = [StripeWeight { stripe_index: 2, len_bytes: 1 << 30 }];
        table.add_rule("example.com", &broad, 1 << 20, 1);
        table.add_rule("images.example.com", &narrow, 1 << 20, 1);

        let key = CacheKey::from_words([9, 9, 9, 9]);
        assert_eq!(table.stripes_for("images.example.com"), Some(&[2][..]));
        assert_eq!(table.lookup("images.example.com", key), Some(2));

        let www_owner = table.lookup("www.example.com", key);
        assert!(matches!(www_owner, Some(0) | Some(1)));

        assert_eq!(table.stripes_for("other.org"), None);
        assert_eq!(table.lookup("other.org", key), None);
    }
}
