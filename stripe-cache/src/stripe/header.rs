//! On-disk stripe header/footer layout (`SPEC_FULL.md` §3, §6).
//!
//! Two back-to-back directory copies precede the data region; each copy is
//! `{header}{entries}{footer}`. Header and footer share every field listed
//! here and must agree for a copy to be considered self-consistent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::doc::{CACHE_DB_MAJOR_VERSION, CACHE_DB_MAJOR_VERSION_COMPATIBLE, DOC_MAGIC};

pub const VOL_HEADER_FOOTER_MAGIC: u32 = DOC_MAGIC ^ 0x5a5a_5a5a;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolHeaderFooter {
    pub magic: u32,
    pub version_major: u16,
    pub sync_serial: u64,
    pub write_pos: u64,
    pub last_write_pos: u64,
    pub write_serial: u64,
    pub phase: bool,
    pub cycle: u64,
    pub segments: u32,
    pub buckets: u32,
    pub depth: u32,
}

impl VolHeaderFooter {
    pub fn fresh(segments: u32, buckets: u32, depth: u32, start: u64) -> Self {
        Self {
            magic: VOL_HEADER_FOOTER_MAGIC,
            version_major: CACHE_DB_MAJOR_VERSION,
            sync_serial: 0,
            write_pos: start,
            last_write_pos: start,
            write_serial: 0,
            phase: false,
            cycle: 0,
            segments,
            buckets,
            depth,
        }
    }

    pub fn is_version_compatible(&self) -> bool {
        (CACHE_DB_MAJOR_VERSION_COMPATIBLE..=CACHE_DB_MAJOR_VERSION).contains(&self.version_major)
    }

    /// `true` iff this header and the paired footer agree on every field
    /// that must match (`SPEC_FULL.md` §4.1: "self-consistent").
    pub fn agrees_with_footer(&self, footer: &VolHeaderFooter) -> bool {
        self == footer
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(self.magic);
        buf.put_u16(self.version_major);
        buf.put_u64(self.sync_serial);
        buf.put_u64(self.write_pos);
        buf.put_u64(self.last_write_pos);
        buf.put_u64(self.write_serial);
        buf.put_u8(self.phase as u8);
        buf.put_u64(self.cycle);
        buf.put_u32(self.segments);
        buf.put_u32(self.buckets);
        buf.put_u32(self.depth);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < 64 {
            return None;
        }
        let magic = buf.get_u32();
        let version_major = buf.get_u16();
        let sync_serial = buf.get_u64();
        let write_pos = buf.get_u64();
        let last_write_pos = buf.get_u64();
        let write_serial = buf.get_u64();
        let phase = buf.get_u8() != 0;
        let cycle = buf.get_u64();
        let segments = buf.get_u32();
        let buckets = buf.get_u32();
        let depth = buf.get_u32();
        Some(Self {
            magic,
            version_major,
            sync_serial,
            write_pos,
            last_write_pos,
            write_serial,
            phase,
            cycle,
            segments,
            buckets,
            depth,
        })
    }
}

/// Picks which on-disk copy (`A` or `B`) a fresh directory sync should
/// target: the alternate of whichever copy is currently adopted, selected by
/// `sync_serial` parity (`SPEC_FULL.md` §4.4).
pub fn sync_target_is_copy_a(new_sync_serial: u64) -> bool {
    new_sync_serial % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = VolHeaderFooter::fresh(4, 16, 4, 8192);
        let encoded = header.encode();
        let decoded = VolHeaderFooter::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn parity_alternates_copy_selection() {
        assert!(sync_target_is_copy_a(0));
        assert!(!sync_target_is_copy_a(1));
    }
}
