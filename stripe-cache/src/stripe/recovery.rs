//! Crash recovery by forward-scanning from the last synced write position
//! (`SPEC_FULL.md` §4.1, §4.7, §9 "danger zone" heuristic).

use tracing::{debug, warn};

use crate::config::CACHE_BLOCK_SIZE;
use crate::doc::{Doc, DOC_MAGIC};

/// Outcome of a recovery scan: where the write pointer should resume from,
/// the sync_serial the repaired directory should carry, and (if any) the
/// byte range whose directory entries must be erased.
#[derive(Debug, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub new_write_pos: u64,
    pub new_sync_serial: u64,
    pub clear_range: Option<(u32, u32)>,
}

/// Scans `region` (bytes read starting at `scan_start`, the last synced
/// write position) for Docs whose `sync_serial` is plausibly part of this
/// generation, stopping at the first gap, torn record, or serial
/// regression. `data_end` is the stripe's data-region end (`skip + len`);
/// `data_start` is where the data region begins (after both directory
/// copies) — scanning wraps there once ("danger zone" heuristic) before
/// giving up.
pub fn recover(
    region: &[u8],
    scan_start: u64,
    header_sync_serial: u64,
    data_start: u64,
    data_end: u64,
    evacuation_size: u64,
    already_wrapped: bool,
) -> RecoveryOutcome {
    let mut pos = 0usize;
    let mut last_sync_serial = 0u64;
    let mut advanced_to = scan_start;

    loop {
        if pos + 4 > region.len() {
            break;
        }
        let magic = u32::from_be_bytes(region[pos..pos + 4].try_into().unwrap());
        if magic != DOC_MAGIC {
            debug!(pos, "recovery scan found non-magic bytes, stopping");
            break;
        }

        match Doc::decode(&region[pos..], true) {
            Ok(doc) => {
                let in_window = doc.sync_serial > last_sync_serial
                    && doc.sync_serial <= header_sync_serial + 1;
                if !in_window {
                    debug!(
                        found = doc.sync_serial,
                        last_sync_serial,
                        header_sync_serial,
                        "recovery scan hit a sync_serial outside the acceptance window"
                    );
                    break;
                }
                last_sync_serial = doc.sync_serial;
                let wire_len = doc.wire_len() as u64;
                let rounded = wire_len.div_ceil(CACHE_BLOCK_SIZE) * CACHE_BLOCK_SIZE;
                pos += rounded as usize;
                advanced_to = scan_start + pos as u64;
            }
            Err(_) => {
                debug!(pos, "recovery scan found a torn record, stopping");
                break;
            }
        }
    }

    if advanced_to >= data_end && !already_wrapped {
        warn!("recovery reached the end of the stripe, wrapping once to continue the scan");
        return RecoveryOutcome {
            new_write_pos: data_start,
            new_sync_serial: header_sync_serial + 2,
            clear_range: Some((data_start as u32, data_end as u32)),
        };
    }

    let clear_from = advanced_to;
    let clear_to = (clear_from + evacuation_size).min(data_end);

    RecoveryOutcome {
        new_write_pos: advanced_to,
        // Differing parity so the next directory sync does not clobber the
        // good on-disk copy (`SPEC_FULL.md` §4.1).
        new_sync_serial: header_sync_serial + 2,
        clear_range: if clear_to > clear_from {
            Some((clear_from as u32, clear_to as u32))
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stripe_cache_common::CacheKey;

    use crate::doc::DocType;

    fn encode_doc(sync_serial: u64, body: &[u8]) -> Bytes {
        Doc {
            len: 0,
            total_len: body.len() as u64,
            first_key: CacheKey::from_words([1, 2, 3, 4]),
            key: CacheKey::from_words([1, 2, 3, 4]),
            doc_type: DocType::Raw,
            sync_serial,
            write_serial: 0,
            pinned_until: 0,
            fragment_offsets: vec![],
            alt_vector: Bytes::new(),
            body: Bytes::copy_from_slice(body),
        }
        .encode(true)
    }

    #[test]
    fn stops_cleanly_at_non_magic_bytes() {
        let mut region = encode_doc(5, b"hello").to_vec();
        region.extend_from_slice(&[0u8; 64]);
        let outcome = recover(&region, 0, 4, 0, 1_000_000, 4096, false);
        assert!(outcome.new_write_pos > 0);
        assert!(outcome.clear_range.is_some());
    }

    #[test]
    fn torn_record_triggers_clear_range() {
        let mut region = encode_doc(5, b"hello").to_vec();
        let cut = region.len() - 3;
        region.truncate(cut);
        let outcome = recover(&region, 0, 4, 0, 1_000_000, 4096, false);
        assert!(outcome.clear_range.is_some());
    }
}
