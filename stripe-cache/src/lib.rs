//! Persistent, crash-safe HTTP object cache engine: the on-disk stripe
//! (directory, write aggregation, recovery, evacuation, RAM cache) and the
//! per-operation `vc` entry points layered on top of it.
//!
//! Out of scope (external collaborators): HTTP parsing and alternate
//! selection, configuration-file text formats, block-device async I/O
//! primitives below `tokio::fs`, and administrative RPC plumbing.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod directory;
pub mod disk;
pub mod doc;
pub mod error;
pub mod ram_cache;
pub mod selection;
pub mod stripe;
pub mod vc;

pub use config::{CacheConfig, StripeConfig};
pub use doc::{Doc, DocType};
pub use error::{CacheError, CacheResult};
pub use stripe::Stripe;

use std::collections::HashMap;
use std::sync::Arc;

use stripe_cache_common::CacheKey;

use selection::{build_vol_hash_table, lookup_stripe, HostTable, StripeWeight};

/// Process-wide context tying together every open stripe and the stripe
/// selection table (`SPEC_FULL.md` §9 "Global singletons": the source's
/// `cacheProcessor`/`cacheDirSync`/global volume list collapse into one
/// context object instead of process-wide statics).
pub struct Cache {
    stripes: Vec<Arc<Stripe>>,
    vol_hash_table: Vec<usize>,
    host_table: HostTable,
    alloc_size: u64,
    hash_seed: u64,
}

impl Cache {
    pub fn new(stripes: Vec<Arc<Stripe>>, alloc_size: u64, hash_seed: u64, host_table: HostTable) -> Self {
        let weights: Vec<StripeWeight> = stripes
            .iter()
            .enumerate()
            .map(|(i, s)| StripeWeight {
                stripe_index: i,
                len_bytes: s.config().len(),
            })
            .collect();
        let vol_hash_table = build_vol_hash_table(&weights, alloc_size, hash_seed);
        for stripe in &stripes {
            stripe.spawn_periodic_sync();
        }
        Self {
            stripes,
            vol_hash_table,
            host_table,
            alloc_size,
            hash_seed,
        }
    }

    /// Rebuilds the selection table, e.g. after a disk is marked offline
    /// (`SPEC_FULL.md` §4.8) and its stripes are excluded.
    pub fn rebuild_selection_table(&mut self, live_stripes: &[usize]) {
        let weights: Vec<StripeWeight> = live_stripes
            .iter()
            .map(|&i| StripeWeight {
                stripe_index: i,
                len_bytes: self.stripes[i].config().len(),
            })
            .collect();
        self.vol_hash_table = build_vol_hash_table(&weights, self.alloc_size, self.hash_seed);
    }

    /// Resolves `key` (optionally scoped by `hostname`) to its owning stripe.
    pub fn select_stripe(&self, key: CacheKey, hostname: Option<&str>) -> Option<&Arc<Stripe>> {
        if let Some(hostname) = hostname {
            if let Some(idx) = self.host_table.lookup(hostname, key) {
                return self.stripes.get(idx);
            }
        }
        let idx = lookup_stripe(&self.vol_hash_table, key)?;
        self.stripes.get(idx)
    }

    pub fn stripes(&self) -> &[Arc<Stripe>] {
        &self.stripes
    }
}

/// Per-disk/process error and stripe-liveness tracking, used to decide when
/// to call [`Cache::rebuild_selection_table`] (`SPEC_FULL.md` §4.8).
#[derive(Default)]
pub struct DiskHealthRegistry {
    bad_disks: HashMap<String, u32>,
}

impl DiskHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_bad(&mut self, disk_path: &str) {
        *self.bad_disks.entry(disk_path.to_string()).or_insert(0) += 1;
    }

    pub fn is_bad(&self, disk_path: &str) -> bool {
        self.bad_disks.contains_key(disk_path)
    }
}
