//! The fixed, small directory entry and its approximate-size encoding
//! (`SPEC_FULL.md` §3, §6, §9 — "Approximate-size directory encoding").

use bytes::{Buf, BufMut};

use crate::config::CACHE_BLOCK_SIZE;

/// On-disk size of one packed [`DirEntry`] row.
pub const DIR_ENTRY_WIRE_LEN: usize = 16;

/// Number of distinct block-size classes; entries store a 3-bit class plus a
/// size field, and `(size + 1) * BLOCK_SIZE(class)` is the rounded disk
/// footprint. This is on-disk-visible and must not be replaced with a plain
/// byte count.
pub const NUM_SIZE_CLASSES: u8 = 8;

/// `BLOCK_SIZE(class)`: each class doubles the previous class's block unit,
/// starting from [`CACHE_BLOCK_SIZE`].
pub fn class_block_size(class: u8) -> u64 {
    debug_assert!(class < NUM_SIZE_CLASSES);
    CACHE_BLOCK_SIZE << u32::from(class)
}

/// Chooses the smallest `(class, size)` pair whose rounded footprint
/// `(size + 1) * BLOCK_SIZE(class)` is `>= bytes`, and the `size` field fits
/// in `size_bits`.
pub fn encode_approx_size(bytes: u64, size_bits: u32) -> (u8, u32) {
    let max_size = (1u64 << size_bits) - 1;
    for class in 0..NUM_SIZE_CLASSES {
        let block = class_block_size(class);
        let size = bytes.div_ceil(block).saturating_sub(1);
        if size <= max_size {
            return (class, size as u32);
        }
    }
    // Bytes too large even at the widest class/size: saturate.
    (NUM_SIZE_CLASSES - 1, max_size as u32)
}

pub fn decode_approx_size(class: u8, size: u32) -> u64 {
    (u64::from(size) + 1) * class_block_size(class)
}

/// A single directory row.
///
/// Logical fields per `SPEC_FULL.md` §3: offset-in-stripe (in blocks),
/// approximate-size class, tag (truncated key bits), next-in-chain index,
/// phase bit, head bit, pinned bit, token bit. Packed tightly since this is
/// mirrored to disk in bulk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirEntry {
    /// Offset in blocks from the start of the stripe's data region. `0` means empty.
    pub offset_blocks: u32,
    pub size_class: u8,
    pub approx_size: u32,
    /// Truncated key bits used to disambiguate entries within a bucket chain.
    pub tag: u32,
    /// Index, local to this segment, of the next row in this bucket's chain. `u32::MAX` = none.
    pub next: u32,
    pub phase: bool,
    pub head: bool,
    pub pinned: bool,
    pub token: bool,
}

pub const NO_NEXT: u32 = u32::MAX;

impl DirEntry {
    pub fn empty() -> Self {
        Self {
            next: NO_NEXT,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offset_blocks == 0
    }

    pub fn rounded_len(&self) -> u64 {
        decode_approx_size(self.size_class, self.approx_size)
    }

    /// Packs this row into its fixed 16-byte on-disk form
    /// (`offset_blocks | tag | next | size_class | flags | approx_size`).
    pub fn encode(&self) -> [u8; DIR_ENTRY_WIRE_LEN] {
        let mut buf = [0u8; DIR_ENTRY_WIRE_LEN];
        let mut w = &mut buf[..];
        w.put_u32(self.offset_blocks);
        w.put_u32(self.tag);
        w.put_u32(self.next);
        w.put_u8(self.size_class);
        let flags = (self.phase as u8) | (self.head as u8) << 1 | (self.pinned as u8) << 2 | (self.token as u8) << 3;
        w.put_u8(flags);
        w.put_u16(self.approx_size as u16);
        buf
    }

    /// Unpacks a row from `buf`, which must be at least
    /// [`DIR_ENTRY_WIRE_LEN`] bytes.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < DIR_ENTRY_WIRE_LEN {
            return None;
        }
        let offset_blocks = buf.get_u32();
        let tag = buf.get_u32();
        let next = buf.get_u32();
        let size_class = buf.get_u8();
        let flags = buf.get_u8();
        let approx_size = buf.get_u16() as u32;
        Some(Self {
            offset_blocks,
            size_class,
            approx_size,
            tag,
            next,
            phase: flags & 0x1 != 0,
            head: flags & 0x2 != 0,
            pinned: flags & 0x4 != 0,
            token: flags & 0x8 != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_size_round_trips_within_rounding() {
        for &bytes in &[1u64, 511, 512, 513, 4096, 1_000_000, 10_000_000] {
            let (class, size) = encode_approx_size(bytes, 13);
            let rounded = decode_approx_size(class, size);
            assert!(rounded >= bytes, "{rounded} < {bytes}");
            // Rounded footprint should not wildly overshoot: within one block
            // unit of this class.
            assert!(rounded - bytes < class_block_size(class));
        }
    }

    #[test]
    fn empty_entry_has_zero_offset() {
        assert!(DirEntry::empty().is_empty());
    }

    #[test]
    fn entry_round_trips_through_wire_encoding() {
        let entry = DirEntry {
            offset_blocks: 123,
            size_class: 3,
            approx_size: 42,
            tag: 0xabcd,
            next: 7,
            phase: true,
            head: false,
            pinned: true,
            token: false,
        };
        let decoded = DirEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }
}
