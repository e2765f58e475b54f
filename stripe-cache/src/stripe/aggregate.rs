//! In-memory write aggregation buffer (`SPEC_FULL.md` §4.3).
//!
//! One buffer per stripe; writers stage Docs into it under the stripe
//! mutex, and the whole buffer is submitted as a single physical write when
//! enough has accumulated. Only the staging/backpressure bookkeeping lives
//! here — the actual `tokio::fs` write and directory wiring live in
//! [`super::Stripe`].

use bytes::BytesMut;
use tracing::trace;

use crate::config::CACHE_BLOCK_SIZE;
use crate::error::WriteError;

/// A Doc staged into the aggregation buffer but not yet physically written.
#[derive(Clone, Copy, Debug)]
pub struct StagedDoc {
    /// Byte offset within the aggregation buffer.
    pub buf_offset: u64,
    /// Rounded (block-aligned) length this Doc consumes.
    pub rounded_len: u64,
}

pub struct AggBuffer {
    data: BytesMut,
    capacity: u64,
    buf_pos: u64,
    /// Total rounded bytes currently staged across the whole write pipeline,
    /// including bytes already handed to an in-flight physical write.
    agg_todo_size: u64,
    backlog: u64,
}

fn round_up_block(len: u64) -> u64 {
    len.div_ceil(CACHE_BLOCK_SIZE) * CACHE_BLOCK_SIZE
}

impl AggBuffer {
    pub fn new(capacity: u64, backlog: u64) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity as usize),
            capacity,
            buf_pos: 0,
            agg_todo_size: 0,
            backlog,
        }
    }

    pub fn buf_pos(&self) -> u64 {
        self.buf_pos
    }

    pub fn agg_todo_size(&self) -> u64 {
        self.agg_todo_size
    }

    pub fn is_empty(&self) -> bool {
        self.buf_pos == 0
    }

    /// Stages `doc_bytes` at the current buffer position, enforcing the
    /// per-write and backlog limits of `SPEC_FULL.md` §4.3. `is_reader` marks
    /// a sync-marker/evacuation write that is exempt from the backlog check.
    pub fn stage(&mut self, doc_bytes: &[u8], is_reader: bool) -> Result<StagedDoc, WriteError> {
        let rounded_len = round_up_block(doc_bytes.len() as u64);

        if rounded_len > self.capacity {
            return Err(WriteError::RecordTooLarge {
                size: doc_bytes.len(),
                agg_size: self.capacity as usize,
            });
        }

        if !is_reader && self.agg_todo_size + rounded_len > self.capacity + self.backlog {
            return Err(WriteError::BacklogExceeded {
                pending: self.agg_todo_size,
                backlog: self.backlog,
            });
        }

        if self.buf_pos + rounded_len > self.capacity {
            return Err(WriteError::RecordTooLarge {
                size: doc_bytes.len(),
                agg_size: self.capacity as usize,
            });
        }

        let offset = self.buf_pos;
        self.data.resize((offset + rounded_len) as usize, 0);
        self.data[offset as usize..offset as usize + doc_bytes.len()].copy_from_slice(doc_bytes);

        self.buf_pos += rounded_len;
        self.agg_todo_size += rounded_len;

        trace!(offset, rounded_len, "staged doc in aggregation buffer");
        Ok(StagedDoc {
            buf_offset: offset,
            rounded_len,
        })
    }

    /// Bytes currently staged, ready to hand to a physical write.
    pub fn pending_bytes(&self) -> &[u8] {
        &self.data[..self.buf_pos as usize]
    }

    /// Called once the physical write of `flushed_len` bytes completes
    /// (successfully or not); clears the buffer so new writers can stage
    /// into it from position zero.
    pub fn reset_after_flush(&mut self, flushed_len: u64) {
        self.agg_todo_size = self.agg_todo_size.saturating_sub(flushed_len);
        self.data.clear();
        self.buf_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_rejects_oversized_record() {
        let mut buf = AggBuffer::new(512, 0);
        let big = vec![0u8; 1024];
        let err = buf.stage(&big, false).unwrap_err();
        assert!(matches!(err, WriteError::RecordTooLarge { .. }));
    }

    #[test]
    fn stage_rounds_up_to_block_size() {
        let mut buf = AggBuffer::new(CACHE_BLOCK_SIZE * 4, 0);
        let staged = buf.stage(&[1, 2, 3], false).unwrap();
        assert_eq!(staged.rounded_len, CACHE_BLOCK_SIZE);
        assert_eq!(buf.buf_pos(), CACHE_BLOCK_SIZE);
    }

    #[test]
    fn backlog_exceeded_is_reported() {
        let mut buf = AggBuffer::new(CACHE_BLOCK_SIZE, 0);
        buf.stage(&[1], false).unwrap();
        let err = buf.stage(&[2], false).unwrap_err();
        assert!(matches!(err, WriteError::BacklogExceeded { .. }));
    }

    #[test]
    fn reset_after_flush_clears_buffer() {
        let mut buf = AggBuffer::new(CACHE_BLOCK_SIZE * 4, 0);
        let staged = buf.stage(&[1, 2, 3], false).unwrap();
        buf.reset_after_flush(staged.rounded_len);
        assert!(buf.is_empty());
        assert_eq!(buf.agg_todo_size(), 0);
    }
}
