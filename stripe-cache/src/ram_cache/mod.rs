//! RAM cache fronting a stripe (`SPEC_FULL.md` §4.9): two interchangeable
//! policies behind one trait, selected by [`crate::config::RamCacheAlgorithm`].

pub mod clfus;
pub mod lru;
pub mod seen_filter;

use bytes::Bytes;
use stripe_cache_common::CacheKey;

/// `(dir_phase, dir_offset)` — used to invalidate an entry that refers to a
/// directory slot that has since been overwritten.
pub type Aux = (bool, u32);

pub trait RamCache: Send {
    /// Returns the cached bytes if present and `aux` still matches.
    fn get(&mut self, key: CacheKey, aux: Aux) -> Option<Bytes>;

    /// Inserts or updates an entry, possibly evicting others to stay under
    /// the configured byte budget. `copy` mirrors the source's distinction
    /// between taking ownership of a caller buffer and cloning it.
    fn put(&mut self, key: CacheKey, buf: Bytes, aux: Aux, copy: bool);

    /// Relocates an entry to a new `aux` without touching its bytes.
    fn fixup(&mut self, key: CacheKey, old_aux: Aux, new_aux: Aux) -> bool;

    fn len_bytes(&self) -> u64;

    fn max_bytes(&self) -> u64;
}
