//! Configuration surface consumed by the core (`SPEC_FULL.md` §6, §4.12).
//!
//! Parsing the surrounding hosting-file / volume-config-file text formats is
//! an out-of-scope collaborator; these structs are what that collaborator
//! would populate. Builder shape follows
//! `vector_buffers::disk_v2::common::{DiskBufferConfig, DiskBufferConfigBuilder}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CACHE_BLOCK_SIZE: u64 = 512;
pub const DEFAULT_AGG_SIZE: u64 = 4 * 1024 * 1024;
pub const MAX_FRAG_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_TARGET_FRAGMENT_SIZE: u64 = 1024 * 1024;
pub const EVACUATION_SIZE_MULTIPLIER: u64 = 2;

/// Which RAM cache policy fronts a stripe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RamCacheAlgorithm {
    Lru,
    Clfus,
}

impl Default for RamCacheAlgorithm {
    fn default() -> Self {
        RamCacheAlgorithm::Clfus
    }
}

/// Background compression codec used only by the CLFUS policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RamCacheCompression {
    None,
    Fast,
    Libz,
    Liblzma,
}

impl Default for RamCacheCompression {
    fn default() -> Self {
        RamCacheCompression::None
    }
}

/// Process-wide configuration: RAM cache sizing/policy plus the knobs that
/// apply identically to every stripe.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total RAM cache bytes across all stripes; `None` means "auto", sized
    /// as a fixed multiplier of each stripe's directory bytes.
    pub ram_cache_size: Option<u64>,
    pub ram_cache_algorithm: RamCacheAlgorithm,
    pub ram_cache_compress: RamCacheCompression,
    pub ram_cache_use_seen_filter: bool,
    /// Per-doc size above which the RAM cache is bypassed entirely.
    pub ram_cache_cutoff: u64,
    pub dir_sync_frequency: Duration,
    pub target_fragment_size: u64,
    pub agg_write_backlog: u64,
    /// `0` disables the limit.
    pub max_doc_size: u64,
    pub enable_checksum: bool,
    pub min_average_object_size: u64,
    pub hit_evacuate_percent: u8,
    pub hit_evacuate_size_limit: Option<u64>,
    pub permit_pinning: bool,
    pub max_disk_errors: u32,
    pub enable_read_while_writer: bool,
    pub read_while_writer_max_retries: u32,
    pub read_while_writer_retry_delay: Duration,
    pub mutex_retry_delay: Duration,
    pub http_max_alts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ram_cache_size: None,
            ram_cache_algorithm: RamCacheAlgorithm::default(),
            ram_cache_compress: RamCacheCompression::default(),
            ram_cache_use_seen_filter: true,
            ram_cache_cutoff: 4 * 1024 * 1024,
            dir_sync_frequency: Duration::from_secs(60),
            target_fragment_size: DEFAULT_TARGET_FRAGMENT_SIZE,
            agg_write_backlog: DEFAULT_AGG_SIZE,
            max_doc_size: 0,
            enable_checksum: true,
            min_average_object_size: 8 * 1024,
            hit_evacuate_percent: 0,
            hit_evacuate_size_limit: None,
            permit_pinning: true,
            max_disk_errors: 5,
            enable_read_while_writer: true,
            read_while_writer_max_retries: 5,
            read_while_writer_retry_delay: Duration::from_millis(50),
            mutex_retry_delay: Duration::from_millis(10),
            http_max_alts: 5,
        }
    }
}

/// Per-stripe configuration: identity (path + byte range) plus the
/// aggregation/sizing knobs that are fixed at stripe-open time.
#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub(crate) path: PathBuf,
    pub(crate) skip: u64,
    pub(crate) len: u64,
    pub(crate) agg_size: u64,
    pub(crate) min_average_object_size: u64,
    pub(crate) directory_entry_depth: u8,
    pub(crate) cache: CacheConfig,
}

impl StripeConfig {
    pub fn builder<P: AsRef<Path>>(path: P, skip: u64, len: u64) -> StripeConfigBuilder {
        StripeConfigBuilder {
            path: path.as_ref().to_path_buf(),
            skip,
            len,
            agg_size: None,
            min_average_object_size: None,
            directory_entry_depth: None,
            cache: CacheConfig::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn agg_size(&self) -> u64 {
        self.agg_size
    }

    pub fn min_average_object_size(&self) -> u64 {
        self.min_average_object_size
    }

    pub fn directory_entry_depth(&self) -> u8 {
        self.directory_entry_depth
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }
}

/// Builder for [`StripeConfig`], mirroring `DiskBufferConfigBuilder`.
pub struct StripeConfigBuilder {
    path: PathBuf,
    skip: u64,
    len: u64,
    agg_size: Option<u64>,
    min_average_object_size: Option<u64>,
    directory_entry_depth: Option<u8>,
    cache: CacheConfig,
}

impl StripeConfigBuilder {
    /// Sets the in-memory aggregation buffer size. Defaults to 4 MiB.
    pub fn agg_size(mut self, bytes: u64) -> Self {
        self.agg_size = Some(bytes);
        self
    }

    /// Sets the average object size used to size the directory at open time.
    pub fn min_average_object_size(mut self, bytes: u64) -> Self {
        self.min_average_object_size = Some(bytes);
        self
    }

    /// Sets the number of rows (depth) per directory bucket. Defaults to 4.
    pub fn directory_entry_depth(mut self, depth: u8) -> Self {
        self.directory_entry_depth = Some(depth);
        self
    }

    pub fn cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn build(self) -> StripeConfig {
        StripeConfig {
            path: self.path,
            skip: self.skip,
            len: self.len,
            agg_size: self.agg_size.unwrap_or(DEFAULT_AGG_SIZE),
            min_average_object_size: self
                .min_average_object_size
                .unwrap_or_else(|| self.cache.min_average_object_size),
            directory_entry_depth: self.directory_entry_depth.unwrap_or(4),
            cache: self.cache,
        }
    }
}

/// One entry of the (out-of-scope-to-parse) volume configuration file: a
/// volume number plus either an absolute size in megabytes or a percentage
/// of the containing disk. Percentages are rounded down to 128 MiB
/// multiples; the caller is responsible for rejecting totals over 100%.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeSize {
    Megabytes(u64),
    Percent(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeConfigEntry {
    pub volume_number: u32,
    pub size: VolumeSize,
}

const VOLUME_PERCENT_ROUNDING_MB: u64 = 128;

/// Resolves a list of volume-config entries against a disk of `disk_mb`
/// megabytes, rounding percentage entries down to 128 MiB multiples.
/// Returns `None` if the total would exceed the disk (percentages summing
/// over 100%, or absolute sizes exceeding what remains).
pub fn resolve_volume_sizes(entries: &[VolumeConfigEntry], disk_mb: u64) -> Option<Vec<u64>> {
    let percent_total: u64 = entries
        .iter()
        .filter_map(|e| match e.size {
            VolumeSize::Percent(p) => Some(u64::from(p)),
            VolumeSize::Megabytes(_) => None,
        })
        .sum();
    if percent_total > 100 {
        return None;
    }

    let mut out = Vec::with_capacity(entries.len());
    let mut used_mb = 0u64;
    for entry in entries {
        let mb = match entry.size {
            VolumeSize::Megabytes(mb) => mb,
            VolumeSize::Percent(p) => {
                let raw = disk_mb * u64::from(p) / 100;
                (raw / VOLUME_PERCENT_ROUNDING_MB) * VOLUME_PERCENT_ROUNDING_MB
            }
        };
        used_mb += mb;
        if used_mb > disk_mb {
            return None;
        }
        out.push(mb);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_down_to_128mb_multiples() {
        let entries = vec![VolumeConfigEntry {
            volume_number: 1,
            size: VolumeSize::Percent(50),
        }];
        // 50% of 1000 MiB = 500, rounded down to a 128 multiple -> 384.
        let sizes = resolve_volume_sizes(&entries, 1000).unwrap();
        assert_eq!(sizes, vec![384]);
    }

    #[test]
    fn percent_total_over_100_is_rejected() {
        let entries = vec![
            VolumeConfigEntry {
                volume_number: 1,
                size: VolumeSize::Percent(60),
            },
            VolumeConfigEntry {
                volume_number: 2,
                size: VolumeSize::Percent(50),
            },
        ];
        assert_eq!(resolve_volume_sizes(&entries, 10_000), None);
    }

    #[test]
    fn builder_defaults_apply() {
        let cfg = StripeConfig::builder("/tmp/stripe0", 0, 256 * 1024 * 1024).build();
        assert_eq!(cfg.agg_size(), DEFAULT_AGG_SIZE);
        assert_eq!(cfg.directory_entry_depth(), 4);
    }
}
