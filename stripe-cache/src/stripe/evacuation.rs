//! Evacuation of live Docs ahead of the write frontier (`SPEC_FULL.md`
//! §4.6): preserves pinned objects and recently-hit head fragments that
//! would otherwise be overwritten by the next wrap of the write pointer.

use std::collections::BTreeMap;

use stripe_cache_common::CacheKey;
use tracing::debug;

use crate::directory::DirEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvacuationReason {
    Pinned,
    HitEvacuate,
}

#[derive(Clone, Copy, Debug)]
pub struct EvacuationBlock {
    pub key: CacheKey,
    pub entry: DirEntry,
    pub reason: EvacuationReason,
    pub done: bool,
}

/// Per-stripe table of pending evacuations, bucketed by the offset (in
/// blocks) of the Doc being preserved.
pub struct EvacuationTable {
    blocks: BTreeMap<u32, EvacuationBlock>,
}

impl EvacuationTable {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    pub fn schedule(&mut self, key: CacheKey, entry: DirEntry, reason: EvacuationReason) {
        debug!(?key, offset = entry.offset_blocks, ?reason, "scheduling evacuation");
        metrics::counter!("stripe.evacuations").increment(1);
        self.blocks.insert(
            entry.offset_blocks,
            EvacuationBlock {
                key,
                entry,
                reason,
                done: false,
            },
        );
    }

    pub fn mark_done(&mut self, offset_blocks: u32) {
        if let Some(block) = self.blocks.get_mut(&offset_blocks) {
            block.done = true;
        }
    }

    /// Evacuation blocks whose range has passed the write frontier in the
    /// new phase are cleaned up opportunistically.
    pub fn sweep_done_before(&mut self, frontier_blocks: u32) {
        self.blocks
            .retain(|offset, block| !(block.done && *offset < frontier_blocks));
    }

    pub fn pending(&self) -> impl Iterator<Item = &EvacuationBlock> {
        self.blocks.values().filter(|b| !b.done)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for EvacuationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a directory entry at `offset_blocks` inside the soon-to-be
/// overwritten range `[range_start, range_end)` qualifies for evacuation.
///
/// `last_hit_blocks_ago` is `None` when the object's recency isn't tracked
/// (e.g. it has never been read since being written).
pub fn should_evacuate(
    offset_blocks: u32,
    range_start: u32,
    range_end: u32,
    pinned: bool,
    pinned_until_after_now: bool,
    is_head_fragment: bool,
    last_hit_blocks_ago: Option<u32>,
    hit_evacuate_window_blocks: u32,
    hit_evacuate_size_limit_blocks: Option<u32>,
    rounded_len_blocks: u32,
) -> bool {
    let in_range = offset_blocks >= range_start && offset_blocks < range_end;
    if !in_range {
        return false;
    }

    if pinned && pinned_until_after_now {
        return true;
    }

    if is_head_fragment {
        if let Some(limit) = hit_evacuate_size_limit_blocks {
            if rounded_len_blocks > limit {
                return false;
            }
        }
        if let Some(ago) = last_hit_blocks_ago {
            return ago <= hit_evacuate_window_blocks;
        }
    }

    false
}
