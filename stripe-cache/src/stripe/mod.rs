//! A single on-disk stripe: directory, aggregation buffer, RAM cache,
//! open-directory table, lookaside, and evacuation bookkeeping, all guarded
//! by one mutex (`SPEC_FULL.md` §2, §4.1, §5).

pub mod aggregate;
pub mod evacuation;
pub mod header;
pub mod lookaside;
pub mod open_dir;
pub mod recovery;
pub mod sync;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use stripe_cache_common::CacheKey;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, trace, warn};

use crate::config::{CacheConfig, RamCacheAlgorithm, StripeConfig, CACHE_BLOCK_SIZE};
use crate::directory::{compute_directory_sizing, DirEntry, Directory, FrontierView, DIR_ENTRY_WIRE_LEN};
use crate::doc::{Doc, DocType};
use crate::error::{ReadError, WriteError};
use crate::ram_cache::clfus::ClfusCache;
use crate::ram_cache::lru::LruCache;
use crate::ram_cache::RamCache;

use aggregate::AggBuffer;
use evacuation::EvacuationTable;
use header::{VolHeaderFooter, VOL_HEADER_FOOTER_MAGIC};
use lookaside::Lookaside;
use open_dir::OpenDirectory;
use sync::{SyncAction, SyncState};

const TAG_BITS: u32 = 24;
/// Safety margin kept ahead of the write frontier so an in-flight commit
/// never catches up to data an evacuation scan hasn't examined yet.
const EVACUATION_SIZE: u64 = 1024 * 1024;

struct StripeInner {
    header: VolHeaderFooter,
    directory: Directory,
    agg: AggBuffer,
    open_dir: OpenDirectory,
    lookaside: Lookaside,
    evac: EvacuationTable,
    sync_state: SyncState,
    ram_cache: Box<dyn RamCache>,
    alias_table: HashMap<CacheKey, CacheKey>,
    /// First-keys written this stripe lifetime, for `vc::scan`. The real
    /// engine scans the directory in on-disk order instead; tracking the
    /// set directly sidesteps needing full keys recoverable from a
    /// tag-only directory entry.
    known_first_keys: std::collections::HashSet<CacheKey>,
}

pub struct Stripe {
    config: StripeConfig,
    data_start: u64,
    /// Size in bytes of one on-disk directory copy (header + entries +
    /// footer). Copy A starts at `config.skip()`, copy B at
    /// `config.skip() + copy_bytes`.
    copy_bytes: u64,
    file: AsyncMutex<File>,
    inner: Mutex<StripeInner>,
}

/// Reads and validates one on-disk directory copy at `base_offset`: header,
/// entries, and footer must round-trip and agree with each other and with
/// the sizing this stripe was opened with (`SPEC_FULL.md` §4.1, §4.7).
async fn try_read_copy(
    file: &mut File,
    base_offset: u64,
    segments: usize,
    buckets: usize,
    depth: usize,
    tag_bits: u32,
    entries_bytes: u64,
) -> Option<(VolHeaderFooter, Directory)> {
    let total = 64 + entries_bytes as usize + 64;
    let mut buf = vec![0u8; total];
    file.seek(SeekFrom::Start(base_offset)).await.ok()?;
    file.read_exact(&mut buf).await.ok()?;

    let header = VolHeaderFooter::decode(&buf[0..64])?;
    let footer = VolHeaderFooter::decode(&buf[64 + entries_bytes as usize..])?;
    if header.magic != VOL_HEADER_FOOTER_MAGIC || !header.is_version_compatible() {
        return None;
    }
    if !header.agrees_with_footer(&footer) {
        return None;
    }
    if header.segments as usize != segments || header.buckets as usize != buckets || header.depth as usize != depth {
        return None;
    }

    let directory = Directory::decode(&buf[64..64 + entries_bytes as usize], segments, buckets, depth, tag_bits)?;
    Some((header, directory))
}

/// Adopts whichever on-disk directory copy is newest by `sync_serial`,
/// falling back to a fresh directory when neither copy is self-consistent
/// (first-ever open, or a file shorter than two copies). Either way, replays
/// any writes made since the adopted copy's last sync by forward-scanning
/// the tail of the data region (`SPEC_FULL.md` §4.1, §4.7).
#[allow(clippy::too_many_arguments)]
async fn recover_or_init(
    file: &mut File,
    config: &StripeConfig,
    segments: usize,
    buckets: usize,
    depth: usize,
    tag_bits: u32,
    data_start: u64,
    copy_bytes: u64,
    entries_bytes: u64,
) -> (VolHeaderFooter, Directory) {
    let copy_a = try_read_copy(file, config.skip(), segments, buckets, depth, tag_bits, entries_bytes).await;
    let copy_b = try_read_copy(
        file,
        config.skip() + copy_bytes,
        segments,
        buckets,
        depth,
        tag_bits,
        entries_bytes,
    )
    .await;

    let adopted = match (copy_a, copy_b) {
        (Some(a), Some(b)) => Some(if a.0.sync_serial >= b.0.sync_serial { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };

    let Some((mut header, mut directory)) = adopted else {
        debug!("no self-consistent on-disk directory copy found, initializing fresh");
        return (
            VolHeaderFooter::fresh(segments as u32, buckets as u32, depth as u32, data_start),
            Directory::new(segments, buckets, depth, tag_bits),
        );
    };

    let data_end = config.skip() + config.len();
    let scan_start = header.last_write_pos.clamp(data_start, data_end);
    let tail_len = data_end.saturating_sub(scan_start);
    if tail_len > 0
        && file.seek(SeekFrom::Start(scan_start)).await.is_ok()
    {
        let mut region = vec![0u8; tail_len as usize];
        if file.read_exact(&mut region).await.is_ok() {
            let outcome = recovery::recover(
                &region,
                scan_start,
                header.sync_serial,
                data_start,
                data_end,
                EVACUATION_SIZE,
                false,
            );
            header.write_pos = outcome.new_write_pos;
            header.sync_serial = outcome.new_sync_serial;
            if let Some((lo, hi)) = outcome.clear_range {
                let lo_blocks = bytes_to_blocks(config.skip(), lo as u64);
                let hi_blocks = bytes_to_blocks(config.skip(), hi as u64);
                directory.dir_clear_range(lo_blocks, hi_blocks);
            }
        }
    }

    (header, directory)
}

fn bytes_to_blocks(skip: u64, abs_offset: u64) -> u32 {
    ((abs_offset - skip) / CACHE_BLOCK_SIZE) as u32
}

fn blocks_to_bytes(skip: u64, blocks: u32) -> u64 {
    skip + u64::from(blocks) * CACHE_BLOCK_SIZE
}

fn make_ram_cache(cache_cfg: &CacheConfig, budget_bytes: u64) -> Box<dyn RamCache> {
    match cache_cfg.ram_cache_algorithm {
        RamCacheAlgorithm::Lru => Box::new(LruCache::new(budget_bytes, cache_cfg.ram_cache_use_seen_filter)),
        RamCacheAlgorithm::Clfus => {
            Box::new(ClfusCache::new(budget_bytes, cache_cfg.ram_cache_use_seen_filter))
        }
    }
}

impl Stripe {
    /// Opens (creating if absent) the backing file. If either on-disk
    /// directory copy is self-consistent, adopts the newer one (by
    /// `sync_serial`) and replays any writes made since its last sync;
    /// otherwise initializes a fresh directory, which takes the `clear=true`
    /// path of `SPEC_FULL.md` §4.1.
    #[instrument(skip(config), fields(path = %config.path().display()))]
    pub async fn open(config: StripeConfig) -> std::io::Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(config.path())
            .await?;
        file.set_len(config.len()).await.ok();

        let (segments, buckets) = compute_directory_sizing(
            config.len(),
            config.min_average_object_size(),
            config.directory_entry_depth(),
        );
        let depth = config.directory_entry_depth() as usize;

        // Two directory copies precede the data region (`SPEC_FULL.md` §3),
        // each `{header}{entries}{footer}`.
        let entries_bytes = (segments * buckets * depth * DIR_ENTRY_WIRE_LEN) as u64;
        let copy_bytes = 64 + entries_bytes + 64;
        let data_start = config.skip() + 2 * copy_bytes;

        let (header, directory) = recover_or_init(
            &mut file,
            &config,
            segments,
            buckets,
            depth,
            TAG_BITS,
            data_start,
            copy_bytes,
            entries_bytes,
        )
        .await;

        let ram_budget = config
            .cache()
            .ram_cache_size
            .unwrap_or(entries_bytes.saturating_mul(4));

        let sync_state = SyncState::new(header.sync_serial);
        let stripe = Self {
            config: config.clone(),
            data_start,
            copy_bytes,
            file: AsyncMutex::new(file),
            inner: Mutex::new(StripeInner {
                header,
                directory,
                agg: AggBuffer::new(config.agg_size(), config.cache().agg_write_backlog),
                open_dir: OpenDirectory::new(),
                lookaside: Lookaside::new(),
                evac: EvacuationTable::new(),
                sync_state,
                ram_cache: make_ram_cache(config.cache(), ram_budget),
                alias_table: HashMap::new(),
                known_first_keys: std::collections::HashSet::new(),
            }),
        };
        debug!(segments, buckets, depth, data_start, "stripe opened");
        Ok(stripe)
    }

    fn frontier(inner: &StripeInner, skip: u64) -> FrontierView {
        let agg_frontier_abs = inner.header.write_pos + inner.agg.buf_pos();
        FrontierView {
            write_pos_blocks: bytes_to_blocks(skip, inner.header.write_pos),
            agg_frontier_blocks: bytes_to_blocks(skip, agg_frontier_abs),
            phase: inner.header.phase,
        }
    }

    /// Writes `body` under `key` as a single-fragment Doc. `total_len` is the
    /// whole (possibly multi-fragment) object's length, not just this
    /// fragment's; `vc::open_write` computes it once from the pre-split body
    /// and passes it unchanged to every fragment's call. Large bodies
    /// spanning `target_fragment_size` boundaries are the caller's
    /// responsibility to split into multiple calls chained via
    /// `CacheKey::next_fragment_key`.
    #[instrument(skip(self, body), fields(?key, len = body.len()))]
    pub async fn write_doc(
        &self,
        key: CacheKey,
        first_key: CacheKey,
        doc_type: DocType,
        pinned_until: u64,
        total_len: u64,
        body: Bytes,
    ) -> Result<DirEntry, WriteError> {
        if body.len() as u64 > crate::config::MAX_FRAG_SIZE {
            return Err(WriteError::FragmentTooLarge {
                size: body.len() as u64,
                max: crate::config::MAX_FRAG_SIZE,
            });
        }

        let checksum_enabled = self.config.cache().enable_checksum;
        let max_doc_size = self.config.cache().max_doc_size;
        if max_doc_size != 0 && body.len() as u64 > max_doc_size {
            return Err(WriteError::MaxDocSizeExceeded {
                size: body.len() as u64,
                max: max_doc_size,
            });
        }

        self.maybe_wrap().await?;

        let (sync_serial, write_serial, phase, abs_offset) = {
            let mut inner = self.inner.lock();
            self.stage_doc_locked(&mut inner, key, first_key, doc_type, pinned_until, total_len, body, checksum_enabled)?
        };

        self.flush_if_due().await?;

        trace!(abs_offset, sync_serial, write_serial, phase, "doc staged for write");
        self.inner_entry_for(key, abs_offset)
            .ok_or(WriteError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, "entry vanished after insert"),
            })
    }

    /// Builds, encodes, and stages a Doc under the already-held lock,
    /// inserting its directory entry. Shared by [`Stripe::write_doc`] and the
    /// evacuation rewrite path in [`Stripe::maybe_wrap`], which must not call
    /// back into `write_doc` itself (that would re-trigger wrap/evacuation
    /// recursively).
    #[allow(clippy::too_many_arguments)]
    fn stage_doc_locked(
        &self,
        inner: &mut StripeInner,
        key: CacheKey,
        first_key: CacheKey,
        doc_type: DocType,
        pinned_until: u64,
        total_len: u64,
        body: Bytes,
        checksum_enabled: bool,
    ) -> Result<(u64, u64, bool, u64), WriteError> {
        let doc = Doc {
            len: 0,
            total_len,
            first_key,
            key,
            doc_type,
            sync_serial: inner.header.sync_serial,
            write_serial: inner.header.write_serial,
            pinned_until,
            fragment_offsets: vec![],
            alt_vector: Bytes::new(),
            body,
        };
        let encoded = doc.encode(checksum_enabled);

        let staged = inner.agg.stage(&encoded, false)?;
        let abs_offset = inner.header.write_pos + staged.buf_offset;
        let phase = inner.header.phase;

        let (size_class, approx_size) = crate::directory::entry::encode_approx_size(staged.rounded_len, 13);
        let entry = DirEntry {
            offset_blocks: bytes_to_blocks(self.config.skip(), abs_offset),
            size_class,
            approx_size,
            tag: 0, // stamped by Directory::insert
            next: crate::directory::NO_NEXT,
            phase,
            head: false,
            pinned: pinned_until > 0,
            token: false,
        };
        inner.directory.insert(key, entry);
        inner.sync_state.mark_dirty();
        if key == first_key {
            inner.known_first_keys.insert(first_key);
        }

        Ok((doc_sync_serial(inner), inner.header.write_serial, phase, abs_offset))
    }

    fn inner_entry_for(&self, key: CacheKey, abs_offset: u64) -> Option<DirEntry> {
        let mut inner = self.inner.lock();
        let frontier = Self::frontier(&inner, self.config.skip());
        let target_blocks = bytes_to_blocks(self.config.skip(), abs_offset);
        let mut cursor = None;
        loop {
            let (entry, next_cursor) = inner.directory.probe(key, cursor, frontier)?;
            if entry.offset_blocks == target_blocks {
                return Some(entry);
            }
            cursor = Some(next_cursor);
        }
    }

    /// Flushes the aggregation buffer to disk once enough has accumulated.
    /// Conservative relative to the source: flushes eagerly after every
    /// write rather than batching on a high-water mark, trading some
    /// throughput for a much simpler, obviously-correct commit path.
    async fn flush_if_due(&self) -> Result<(), WriteError> {
        let (write_pos, bytes, rounded_len) = {
            let inner = self.inner.lock();
            if inner.agg.is_empty() {
                return Ok(());
            }
            (
                inner.header.write_pos,
                inner.agg.pending_bytes().to_vec(),
                inner.agg.buf_pos(),
            )
        };

        let mut file = self.file.lock().await;
        let result = async {
            file.seek(SeekFrom::Start(write_pos)).await?;
            file.write_all(&bytes).await?;
            file.flush().await
        }
        .await;

        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                inner.header.write_pos += rounded_len;
                inner.header.last_write_pos = write_pos;
                inner.header.write_serial += 1;
                inner.agg.reset_after_flush(rounded_len);
                Ok(())
            }
            Err(e) => {
                // Delete tentative entries staged into the failed range so
                // a stale directory never points at unwritten bytes.
                let lo = bytes_to_blocks(self.config.skip(), write_pos);
                let hi = bytes_to_blocks(self.config.skip(), write_pos + rounded_len);
                inner.directory.dir_clear_range(lo, hi);
                inner.agg.reset_after_flush(rounded_len);
                warn!(error = %e, "aggregation buffer flush failed, cleared tentative entries");
                Err(WriteError::Io { source: e })
            }
        }
    }

    /// Collects live head-fragment entries in the range the upcoming wrap is
    /// about to overwrite (`[data_start, data_start + EVACUATION_SIZE)` in
    /// the phase currently about to be superseded), keeping only the ones
    /// `evacuation::should_evacuate` says must survive. Only covers head
    /// fragments reachable via `known_first_keys` (the same tag-only
    /// directory limitation `vc::scan` works around), so a later fragment of
    /// a multi-fragment object evacuates only if its head does.
    fn collect_evacuation_survivors(&self) -> Vec<(CacheKey, DirEntry, evacuation::EvacuationReason)> {
        let mut inner = self.inner.lock();
        let frontier = Self::frontier(&inner, self.config.skip());
        let range_start = bytes_to_blocks(self.config.skip(), self.data_start);
        let range_end = range_start + (EVACUATION_SIZE / CACHE_BLOCK_SIZE) as u32;
        let now_phase = inner.header.phase;

        let cfg = self.config.cache();
        let hit_evacuate_window_blocks = if cfg.hit_evacuate_percent == 0 {
            0
        } else {
            ((EVACUATION_SIZE * u64::from(cfg.hit_evacuate_percent) / 100) / CACHE_BLOCK_SIZE) as u32
        };
        let size_limit_blocks = cfg.hit_evacuate_size_limit.map(|b| (b / CACHE_BLOCK_SIZE) as u32);

        let keys: Vec<CacheKey> = inner.known_first_keys.iter().copied().collect();
        let mut out = Vec::new();
        for key in keys {
            let Some((entry, _)) = inner.directory.probe(key, None, frontier) else {
                continue;
            };
            if entry.phase != now_phase {
                continue;
            }
            let reason = if entry.pinned {
                evacuation::EvacuationReason::Pinned
            } else {
                evacuation::EvacuationReason::HitEvacuate
            };
            // Recency per entry isn't tracked by the tag-only directory;
            // conservatively treat every live head as just hit rather than
            // silently dropping it.
            let last_hit_blocks_ago = Some(0);
            let rounded_len_blocks = (entry.rounded_len() / CACHE_BLOCK_SIZE) as u32;
            if evacuation::should_evacuate(
                entry.offset_blocks,
                range_start,
                range_end,
                entry.pinned,
                entry.pinned,
                true,
                last_hit_blocks_ago,
                hit_evacuate_window_blocks,
                size_limit_blocks,
                rounded_len_blocks,
            ) {
                out.push((key, entry, reason));
            }
        }
        out
    }

    /// Wraps the write pointer back to `data_start` once the projected end
    /// of the current write would overrun the stripe, first evacuating any
    /// pinned or hit-eligible Docs sitting in the range about to be
    /// overwritten (`SPEC_FULL.md` §4.6). Evacuated Docs are rewritten just
    /// past the new frontier immediately after the wrap, ahead of whatever
    /// write triggered it.
    async fn maybe_wrap(&self) -> Result<(), WriteError> {
        let should_wrap = {
            let inner = self.inner.lock();
            let projected_end = inner.header.write_pos + inner.agg.buf_pos() + EVACUATION_SIZE;
            let stripe_end = self.config.skip() + self.config.len();
            projected_end > stripe_end
        };
        if !should_wrap {
            return Ok(());
        }

        let survivors = self.collect_evacuation_survivors();
        let mut to_rewrite = Vec::with_capacity(survivors.len());
        for (key, entry, reason) in survivors {
            if let Ok(doc) = self.read_doc(key).await {
                to_rewrite.push((key, entry, reason, doc));
            }
        }

        {
            let mut inner = self.inner.lock();
            debug!(survivors = to_rewrite.len(), "wrapping stripe write pointer");
            inner.header.write_pos = self.data_start;
            inner.header.phase = !inner.header.phase;
            inner.header.cycle += 1;
            inner.lookaside.clear();
            for (key, entry, reason, _) in &to_rewrite {
                inner.evac.schedule(*key, *entry, *reason);
            }
        }

        let checksum_enabled = self.config.cache().enable_checksum;
        for (key, entry, _, doc) in to_rewrite {
            let mut inner = self.inner.lock();
            let staged = self.stage_doc_locked(
                &mut inner,
                key,
                doc.first_key,
                doc.doc_type,
                doc.pinned_until,
                doc.total_len,
                doc.body,
                checksum_enabled,
            );
            if staged.is_ok() {
                inner.evac.mark_done(entry.offset_blocks);
            }
        }

        self.flush_if_due().await
    }

    /// Reads the Doc for `key`, consulting the RAM cache first.
    #[instrument(skip(self), fields(?key))]
    pub async fn read_doc(&self, key: CacheKey) -> Result<Doc, ReadError> {
        let plan = {
            let mut inner = self.inner.lock();
            let frontier = Self::frontier(&inner, self.config.skip());
            let Some((entry, _)) = inner.directory.probe(key, None, frontier) else {
                metrics::counter!("stripe.directory.misses").increment(1);
                return Err(ReadError::AltMiss);
            };
            metrics::counter!("stripe.directory.hits").increment(1);

            let aux = (entry.phase, entry.offset_blocks);
            if let Some(cached) = inner.ram_cache.get(key, aux) {
                return match Doc::decode(&cached, self.config.cache().enable_checksum) {
                    Ok(doc) => Ok(doc),
                    Err(source) => Err(ReadError::Invalid { source }),
                };
            }

            let abs_offset = blocks_to_bytes(self.config.skip(), entry.offset_blocks);
            let rounded_len = entry.rounded_len();
            let agg_frontier = inner.header.write_pos + inner.agg.buf_pos();
            let still_in_buffer = abs_offset >= inner.header.write_pos && abs_offset < agg_frontier;

            if still_in_buffer {
                let buf_off = (abs_offset - inner.header.write_pos) as usize;
                let len = rounded_len as usize;
                let bytes = inner.agg.pending_bytes()[buf_off..(buf_off + len).min(inner.agg.pending_bytes().len())].to_vec();
                ReadPlan::FromBuffer(bytes)
            } else {
                ReadPlan::FromDisk { abs_offset, rounded_len, aux }
            }
        };

        let raw = match plan {
            ReadPlan::FromBuffer(bytes) => bytes,
            ReadPlan::FromDisk {
                abs_offset,
                rounded_len,
                ..
            } => {
                let mut file = self.file.lock().await;
                let mut buf = vec![0u8; rounded_len as usize];
                file.seek(SeekFrom::Start(abs_offset)).await.map_err(|source| ReadError::Io { source })?;
                file.read_exact(&mut buf).await.map_err(|source| ReadError::Io { source })?;
                buf
            }
        };

        let doc = Doc::decode(&raw, self.config.cache().enable_checksum)
            .map_err(|source| ReadError::Invalid { source })?;

        if raw.len() as u64 <= self.config.cache().ram_cache_cutoff {
            let mut inner = self.inner.lock();
            let frontier = Self::frontier(&inner, self.config.skip());
            if let Some((entry, _)) = inner.directory.probe(key, None, frontier) {
                let aux = (entry.phase, entry.offset_blocks);
                inner.ram_cache.put(key, Bytes::copy_from_slice(&raw), aux, true);
            }
        }

        Ok(doc)
    }

    /// Removes the directory entry for `key`, if present.
    #[instrument(skip(self), fields(?key))]
    pub fn remove(&self, key: CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let frontier = Self::frontier(&inner, self.config.skip());
        let Some((entry, _)) = inner.directory.probe(key, None, frontier) else {
            return false;
        };
        let offset = entry.offset_blocks;
        let removed = inner.directory.delete(key, offset);
        if removed {
            inner.known_first_keys.remove(&key);
        }
        removed
    }

    pub fn lookup(&self, key: CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let frontier = Self::frontier(&inner, self.config.skip());
        inner.directory.probe(key, None, frontier).is_some()
    }

    pub fn link(&self, from_key: CacheKey, to_key: CacheKey) {
        self.inner.lock().alias_table.insert(from_key, to_key);
    }

    /// Follows the alias chain for `key`, if any, returning the final key.
    pub fn deref(&self, key: CacheKey) -> CacheKey {
        let inner = self.inner.lock();
        let mut current = key;
        let mut hops = 0;
        while let Some(next) = inner.alias_table.get(&current) {
            current = *next;
            hops += 1;
            if hops > 32 {
                break; // defensively bounded; aliasing should never cycle
            }
        }
        current
    }

    /// First-keys known to be live in this stripe; backs `vc::scan`.
    pub fn scan_all(&self) -> Vec<CacheKey> {
        self.inner.lock().known_first_keys.iter().copied().collect()
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn sync_serial(&self) -> u64 {
        self.inner.lock().header.sync_serial
    }

    /// Registers a writer for `key` in the open-directory table
    /// (`SPEC_FULL.md` §4.5). Used by `vc::open_write`.
    pub(crate) fn register_writer(&self, key: CacheKey, allow_multiple: bool, max_writers: usize) -> Option<u64> {
        self.inner
            .lock()
            .open_dir
            .open_write(key, allow_multiple, max_writers)
            .map(|(id, _)| id)
    }

    pub(crate) fn close_writer(&self, key: CacheKey, writer_id: u64) {
        self.inner.lock().open_dir.close_write(key, writer_id);
    }

    /// `true` if some writer currently holds `key` open in the
    /// open-directory table. Used by `vc::open_read` to decide whether a
    /// miss is worth retrying instead of surfacing immediately
    /// (`SPEC_FULL.md` §4.5).
    pub(crate) fn is_writer_active(&self, key: CacheKey) -> bool {
        self.inner.lock().open_dir.get(key).is_some_and(|e| !e.writers.is_empty())
    }

    /// Forces any bytes currently staged in the aggregation buffer out to
    /// disk, used by writers that request `options.sync`.
    pub(crate) async fn flush_now(&self) -> Result<(), WriteError> {
        self.flush_if_due().await
    }

    /// Drives one directory sync cycle (`SPEC_FULL.md` §4.4): flushes any
    /// pending aggregation-buffer bytes first, then writes header, directory,
    /// and footer to whichever on-disk copy `sync_state` says is next, by
    /// `sync_serial` parity.
    pub async fn sync_directory(&self) -> Result<(), WriteError> {
        loop {
            let action = {
                let inner = self.inner.lock();
                inner.sync_state.tick(!inner.agg.pending_bytes().is_empty(), false)
            };
            match action {
                SyncAction::Skip => return Ok(()),
                SyncAction::FlushFirst => {
                    self.flush_if_due().await?;
                }
                SyncAction::Run {
                    target_copy_a,
                    new_sync_serial,
                } => {
                    let (header_bytes, directory_bytes, target_offset) = {
                        let mut inner = self.inner.lock();
                        inner.sync_state.begin();
                        inner.header.sync_serial = new_sync_serial;
                        inner.header.last_write_pos = inner.header.write_pos;
                        let header_bytes = inner.header.encode();
                        let directory_bytes = inner.directory.encode();
                        let target_offset = if target_copy_a {
                            self.config.skip()
                        } else {
                            self.config.skip() + self.copy_bytes
                        };
                        (header_bytes, directory_bytes, target_offset)
                    };

                    let mut file = self.file.lock().await;
                    let result = async {
                        file.seek(SeekFrom::Start(target_offset)).await?;
                        file.write_all(&header_bytes).await?;
                        file.write_all(&directory_bytes).await?;
                        file.write_all(&header_bytes).await?; // footer mirrors header
                        file.flush().await
                    }
                    .await;
                    drop(file);

                    return match result {
                        Ok(()) => {
                            self.inner.lock().sync_state.complete(new_sync_serial);
                            debug!(new_sync_serial, target_copy_a, "directory synced to disk");
                            Ok(())
                        }
                        Err(source) => {
                            warn!(error = %source, "directory sync write failed");
                            Err(WriteError::Io { source })
                        }
                    };
                }
            }
        }
    }

    /// Spawns a background task that calls [`Stripe::sync_directory`] every
    /// `dir_sync_frequency`. The returned handle is detached; dropping it
    /// does not stop the task.
    pub fn spawn_periodic_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let stripe = Arc::clone(self);
        let period = stripe.config.cache().dir_sync_frequency;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(error) = stripe.sync_directory().await {
                    warn!(%error, "periodic directory sync failed");
                }
            }
        })
    }
}

enum ReadPlan {
    FromBuffer(Vec<u8>),
    FromDisk {
        abs_offset: u64,
        rounded_len: u64,
        #[allow(dead_code)]
        aux: (bool, u32),
    },
}

fn doc_sync_serial(inner: &StripeInner) -> u64 {
    inner.header.sync_serial
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StripeConfig;

    async fn open_test_stripe() -> (Stripe, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stripe0");
        let config = StripeConfig::builder(&path, 0, 16 * 1024 * 1024)
            .min_average_object_size(4096)
            .build();
        (Stripe::open(config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (stripe, _dir) = open_test_stripe().await;
        let key = CacheKey::from_words([1, 2, 3, 4]);
        stripe
            .write_doc(key, key, DocType::Raw, 0, 11, Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let doc = stripe.read_doc(key).await.unwrap();
        assert_eq!(doc.body, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn remove_makes_subsequent_read_miss() {
        let (stripe, _dir) = open_test_stripe().await;
        let key = CacheKey::from_words([5, 6, 7, 8]);
        stripe
            .write_doc(key, key, DocType::Raw, 0, 5, Bytes::from_static(b"bytes"))
            .await
            .unwrap();
        assert!(stripe.lookup(key));
        assert!(stripe.remove(key));
        assert!(!stripe.lookup(key));
    }

    #[tokio::test]
    async fn link_and_deref_follow_alias() {
        let (stripe, _dir) = open_test_stripe().await;
        let a = CacheKey::from_words([1, 0, 0, 0]);
        let b = CacheKey::from_words([2, 0, 0, 0]);
        stripe.link(a, b);
        assert_eq!(stripe.deref(a), b);
        assert_eq!(stripe.deref(b), b);
    }
}
