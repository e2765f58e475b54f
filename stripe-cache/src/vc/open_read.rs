//! `open_read` (`SPEC_FULL.md` §6): probes the RAM cache then the
//! directory, reassembling a multi-fragment object by following
//! `CacheKey::next_fragment_key` chains.

use bytes::{Bytes, BytesMut};
use stripe_cache_common::CacheKey;
use tracing::instrument;

use crate::error::{CacheError, CacheResult, ReadError};
use crate::stripe::Stripe;

/// Reads `key`'s Doc, retrying a miss while a writer is known to hold `key`
/// open, per `enable_read_while_writer`/`read_while_writer_max_retries`/
/// `read_while_writer_retry_delay` (`SPEC_FULL.md` §4.5). A miss with no
/// active writer is returned immediately.
async fn read_doc_while_writer(stripe: &Stripe, key: CacheKey) -> CacheResult<crate::doc::Doc> {
    let cfg = stripe.config().cache();
    let mut attempt = 0;
    loop {
        match stripe.read_doc(key).await {
            Ok(doc) => return Ok(doc),
            Err(ReadError::AltMiss) if cfg.enable_read_while_writer && stripe.is_writer_active(key) && attempt < cfg.read_while_writer_max_retries => {
                attempt += 1;
                tokio::time::sleep(cfg.read_while_writer_retry_delay).await;
            }
            Err(source) => return Err(CacheError::from(source)),
        }
    }
}

/// Reads the whole object stored under `key`, concatenating fragments.
#[instrument(skip(stripe), fields(?key))]
pub async fn open_read(stripe: &Stripe, key: CacheKey) -> CacheResult<Bytes> {
    let head = read_doc_while_writer(stripe, key).await?;

    if head.is_single_fragment() {
        return Ok(head.body);
    }

    let mut out = BytesMut::with_capacity(head.total_len as usize);
    out.extend_from_slice(&head.body);
    let mut next_key = key.next_fragment_key();

    while (out.len() as u64) < head.total_len {
        let frag = read_doc_while_writer(stripe, next_key).await?;
        out.extend_from_slice(&frag.body);
        next_key = next_key.next_fragment_key();
    }

    Ok(out.freeze())
}

/// Reads exactly `len` bytes of the object starting at `offset`, without
/// materializing the whole object (`SPEC_FULL.md` §8 scenario 4).
#[instrument(skip(stripe), fields(?key, offset, len))]
pub async fn open_io_pread(stripe: &Stripe, key: CacheKey, offset: u64, len: u64) -> CacheResult<Bytes> {
    let head = read_doc_while_writer(stripe, key).await?;
    if offset + len > head.total_len {
        return Err(CacheError::BadReadRequest {
            reason: "pread range exceeds object length",
        });
    }

    if head.is_single_fragment() {
        return Ok(head.body.slice(offset as usize..(offset + len) as usize));
    }

    let mut consumed = 0u64;
    let mut cur = head;
    let mut cur_key = key;
    loop {
        let frag_len = cur.body.len() as u64;
        if offset < consumed + frag_len {
            let start_in_frag = offset.saturating_sub(consumed);
            let mut collected = BytesMut::new();
            let take = (frag_len - start_in_frag).min(len);
            collected.extend_from_slice(&cur.body[start_in_frag as usize..(start_in_frag + take) as usize]);
            let mut remaining = len - take;
            while remaining > 0 {
                cur_key = cur_key.next_fragment_key();
                cur = read_doc_while_writer(stripe, cur_key).await?;
                let take = remaining.min(cur.body.len() as u64);
                collected.extend_from_slice(&cur.body[..take as usize]);
                remaining -= take;
            }
            return Ok(collected.freeze());
        }
        consumed += frag_len;
        cur_key = cur_key.next_fragment_key();
        cur = read_doc_while_writer(stripe, cur_key).await?;
    }
}
