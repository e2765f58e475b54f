//! The on-disk record ("Doc") framing (`SPEC_FULL.md` §3, §9).
//!
//! Unlike `vector_buffers::disk_v2::record::Record`, which is serialized
//! through `rkyv` for zero-copy archives, the Doc layout is on-disk-visible
//! and must stay bit-exact across a crash/reopen cycle, so it is framed by
//! hand with `bytes::{Buf, BufMut}` rather than through an archive format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::Snafu;
use stripe_cache_common::CacheKey;

pub const DOC_MAGIC: u32 = 0x0141_5443; // "ATC" tag, distinguishes a live Doc header from garbage.
pub const DOC_VERSION_MAJOR: u16 = 1;
pub const DOC_VERSION_MINOR: u16 = 0;
pub const CACHE_DB_MAJOR_VERSION: u16 = DOC_VERSION_MAJOR;
pub const CACHE_DB_MAJOR_VERSION_COMPATIBLE: u16 = 1;

/// Fixed prefix size, in bytes, before the variable fragment-offset table,
/// alt-vector bytes, and body. Includes the `len` field added after `magic`.
const DOC_FIXED_PREFIX_LEN: usize = 4 + 4 + 4 + 8 + 16 + 16 + 2 + 1 + 2 + 8 + 8 + 8 + 4;

#[derive(Debug, Snafu)]
pub enum DocValidationError {
    #[snafu(display("bad magic: expected {DOC_MAGIC:#x}, got {found:#x}"))]
    BadMagic { found: u32 },
    #[snafu(display(
        "incompatible version: major {major} not in [{CACHE_DB_MAJOR_VERSION_COMPATIBLE}, {CACHE_DB_MAJOR_VERSION}]"
    ))]
    IncompatibleVersion { major: u16 },
    #[snafu(display("truncated record: need {need} bytes, have {have}"))]
    Truncated { need: usize, have: usize },
    #[snafu(display("checksum mismatch: expected {expected:#x}, got {actual:#x}"))]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Kind of payload a Doc carries. HTTP objects additionally carry an
/// alternate vector ahead of the body on their head fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DocType {
    HttpDoc = 0,
    HttpRedirect = 1,
    Raw = 2,
}

impl DocType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DocType::HttpDoc),
            1 => Some(DocType::HttpRedirect),
            2 => Some(DocType::Raw),
            _ => None,
        }
    }
}

/// A decoded on-disk record.
#[derive(Clone, Debug)]
pub struct Doc {
    /// This record's own wire length (`magic` through the end of its body),
    /// unrounded. Distinct from `total_len`, which is the whole
    /// multi-fragment object's length.
    pub len: u64,
    pub total_len: u64,
    pub first_key: CacheKey,
    pub key: CacheKey,
    pub doc_type: DocType,
    pub sync_serial: u64,
    pub write_serial: u64,
    pub pinned_until: u64,
    pub fragment_offsets: Vec<u32>,
    pub alt_vector: Bytes,
    pub body: Bytes,
}

impl Doc {
    /// `true` iff this Doc is the entirety of the object (no further fragments).
    pub fn is_single_fragment(&self) -> bool {
        self.total_len == self.body.len() as u64
    }

    /// Unrounded wire length: everything from `magic` through the end of `body`.
    pub fn wire_len(&self) -> usize {
        DOC_FIXED_PREFIX_LEN
            + self.fragment_offsets.len() * 4
            + self.alt_vector.len()
            + self.body.len()
    }

    /// Encodes this Doc, appending the optional checksum accumulated from
    /// the fixed prefix, fragment table, alt vector, and body.
    pub fn encode(&self, checksum_enabled: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32(DOC_MAGIC);
        buf.put_u32(self.wire_len() as u32);
        buf.put_u32((DOC_VERSION_MAJOR as u32) << 16 | DOC_VERSION_MINOR as u32);
        buf.put_u64(self.total_len);
        buf.extend_from_slice(&self.first_key.to_bytes());
        buf.extend_from_slice(&self.key.to_bytes());
        buf.put_u16(self.fragment_offsets.len() as u16);
        buf.put_u8(self.doc_type as u8);
        buf.put_u16(self.alt_vector.len() as u16);
        buf.put_u64(self.sync_serial);
        buf.put_u64(self.write_serial);
        buf.put_u64(self.pinned_until);

        let checksum_pos = buf.len();
        buf.put_u32(0); // placeholder, patched below

        for off in &self.fragment_offsets {
            buf.put_u32(*off);
        }
        buf.extend_from_slice(&self.alt_vector);
        buf.extend_from_slice(&self.body);

        if checksum_enabled {
            let checksum = additive_checksum(&buf[checksum_pos + 4..]);
            buf[checksum_pos..checksum_pos + 4].copy_from_slice(&checksum.to_be_bytes());
        }

        buf.freeze()
    }

    /// Decodes a Doc from `buf`, validating magic, version, and (if
    /// `checksum_enabled`) the checksum. `buf` may contain trailing bytes
    /// beyond the end of this record (e.g. the rest of the aggregation
    /// buffer); only the prefix actually needed is consumed.
    pub fn decode(mut buf: &[u8], checksum_enabled: bool) -> Result<Self, DocValidationError> {
        if buf.len() < DOC_FIXED_PREFIX_LEN {
            return Err(DocValidationError::Truncated {
                need: DOC_FIXED_PREFIX_LEN,
                have: buf.len(),
            });
        }

        let magic = buf.get_u32();
        if magic != DOC_MAGIC {
            return Err(DocValidationError::BadMagic { found: magic });
        }

        let len = buf.get_u32() as u64;

        let version = buf.get_u32();
        let major = (version >> 16) as u16;
        if !(CACHE_DB_MAJOR_VERSION_COMPATIBLE..=CACHE_DB_MAJOR_VERSION).contains(&major) {
            return Err(DocValidationError::IncompatibleVersion { major });
        }

        let total_len = buf.get_u64();

        let mut first_key_bytes = [0u8; 16];
        first_key_bytes.copy_from_slice(&buf[..16]);
        buf.advance(16);
        let first_key = CacheKey::from_bytes(first_key_bytes);

        let mut key_bytes = [0u8; 16];
        key_bytes.copy_from_slice(&buf[..16]);
        buf.advance(16);
        let key = CacheKey::from_bytes(key_bytes);

        let ft_len = buf.get_u16() as usize;
        let doc_type = DocType::from_u8(buf.get_u8()).unwrap_or(DocType::Raw);
        let alt_len = buf.get_u16() as usize;
        let sync_serial = buf.get_u64();
        let write_serial = buf.get_u64();
        let pinned_until = buf.get_u64();
        let expected_checksum = buf.get_u32();

        let checksum_region_start_from_here = buf;

        let variable_len = ft_len * 4 + alt_len;
        if buf.len() < variable_len {
            return Err(DocValidationError::Truncated {
                need: variable_len,
                have: buf.len(),
            });
        }

        let mut fragment_offsets = Vec::with_capacity(ft_len);
        for _ in 0..ft_len {
            fragment_offsets.push(buf.get_u32());
        }

        let alt_vector = Bytes::copy_from_slice(&buf[..alt_len]);
        buf.advance(alt_len);

        // `len` is this record's own wire length, so the body is exactly
        // whatever's left after the fixed prefix and the variable table.
        let body_len = (len as usize)
            .checked_sub(DOC_FIXED_PREFIX_LEN)
            .and_then(|rem| rem.checked_sub(variable_len))
            .ok_or(DocValidationError::Truncated {
                need: DOC_FIXED_PREFIX_LEN + variable_len,
                have: len as usize,
            })?;
        if body_len > buf.len() {
            return Err(DocValidationError::Truncated {
                need: body_len,
                have: buf.len(),
            });
        }
        let body = Bytes::copy_from_slice(&buf[..body_len]);

        if checksum_enabled {
            let checksum_region_len = variable_len + body_len;
            let actual = additive_checksum(&checksum_region_start_from_here[..checksum_region_len]);
            if actual != expected_checksum {
                return Err(DocValidationError::ChecksumMismatch {
                    expected: expected_checksum,
                    actual,
                });
            }
        }

        Ok(Doc {
            len,
            total_len,
            first_key,
            key,
            doc_type,
            sync_serial,
            write_serial,
            pinned_until,
            fragment_offsets,
            alt_vector,
            body,
        })
    }
}

/// Deliberately weak checksum: a running sum of bytes, not a CRC. It catches
/// torn writes (the usual crash failure mode) but is not adversarially
/// robust, matching the source's documented tradeoff.
pub fn additive_checksum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in bytes {
        sum = sum.wrapping_add(u32::from(b));
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Doc {
        Doc {
            len: 0,
            total_len: 5,
            first_key: CacheKey::from_words([1, 2, 3, 4]),
            key: CacheKey::from_words([1, 2, 3, 4]),
            doc_type: DocType::HttpDoc,
            sync_serial: 7,
            write_serial: 9,
            pinned_until: 0,
            fragment_offsets: vec![],
            alt_vector: Bytes::new(),
            body: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn round_trips_with_checksum() {
        let doc = sample_doc();
        let encoded = doc.encode(true);
        let decoded = Doc::decode(&encoded, true).unwrap();
        assert_eq!(decoded.body, doc.body);
        assert_eq!(decoded.first_key, doc.first_key);
        assert_eq!(decoded.sync_serial, doc.sync_serial);
        assert!(decoded.is_single_fragment());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let doc = sample_doc();
        let mut encoded = doc.encode(true).to_vec();
        encoded[0] ^= 0xff;
        let err = Doc::decode(&encoded, true).unwrap_err();
        assert!(matches!(err, DocValidationError::BadMagic { .. }));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let doc = sample_doc();
        let mut encoded = doc.encode(true).to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = Doc::decode(&encoded, true).unwrap_err();
        assert!(matches!(err, DocValidationError::ChecksumMismatch { .. }));
    }

    #[test]
    fn checksum_disabled_ignores_corruption() {
        let doc = sample_doc();
        let mut encoded = doc.encode(true).to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Doc::decode(&encoded, false).is_ok());
    }
}
