use std::fmt;

/// A 128-bit cache key.
///
/// Identifies either a whole object (`first_key`) or a single fragment of a
/// multi-fragment object (`key`). Stored as four big-endian `u32` words so
/// that `slice32(n)` matches the on-disk byte order used by the directory
/// hash and the stripe-selection hash table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CacheKey([u32; 4]);

impl CacheKey {
    pub const ZERO: CacheKey = CacheKey([0; 4]);

    pub fn from_words(words: [u32; 4]) -> Self {
        Self(words)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_be_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self(words)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// The `n`th 32-bit word, matching the source's `slice32(n)` accessor.
    pub fn slice32(self, n: usize) -> u32 {
        self.0[n]
    }

    /// Derives a key for a hostname, so per-host stripe subsets can be
    /// consulted before falling back to the full key.
    pub fn from_hash_of(data: &[u8]) -> Self {
        let mut hasher = KeyHasher::new();
        hasher.write(data);
        hasher.finish_key()
    }

    /// Deterministic fixed-permutation "successor" used to derive each
    /// non-head fragment's `key` from the previous fragment's `key`. This is
    /// intentionally not a cryptographic hash: it only needs to be a
    /// bijection so that successive fragment keys never collide with the
    /// `first_key` or with each other for the same object.
    pub fn next_fragment_key(self) -> Self {
        let [a, b, c, d] = self.0;
        Self([
            a.rotate_left(13) ^ 0x9E37_79B9,
            b.rotate_left(7).wrapping_add(0x8542_3A1F),
            c.rotate_right(11) ^ 0x27D4_EB2F,
            d.wrapping_add(1).rotate_left(17),
        ])
    }

    /// Truncated tag used inside a directory bucket to disambiguate entries
    /// without needing to re-fetch the full key.
    pub fn tag(self, bits: u32) -> u32 {
        debug_assert!(bits <= 32);
        if bits == 0 {
            0
        } else {
            self.0[1] >> (32 - bits)
        }
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheKey({:08x}{:08x}{:08x}{:08x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// FNV-1a based accumulator producing the 128-bit [`CacheKey`] space used for
/// hostnames and ad hoc strings that need to be addressed as cache keys.
pub struct KeyHasher {
    state: [u64; 2],
}

impl KeyHasher {
    const OFFSET: [u64; 2] = [0xcbf2_9ce4_8422_2325, 0x1000_0000_01b3];
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self {
            state: Self::OFFSET,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state[0] ^= u64::from(byte);
            self.state[0] = self.state[0].wrapping_mul(Self::PRIME);
            self.state[1] ^= self.state[0].rotate_left(17);
            self.state[1] = self.state[1].wrapping_mul(Self::PRIME);
        }
    }

    pub fn finish_key(&self) -> CacheKey {
        let hi = self.state[0];
        let lo = self.state[1];
        CacheKey::from_words([
            (hi >> 32) as u32,
            hi as u32,
            (lo >> 32) as u32,
            lo as u32,
        ])
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let key = CacheKey::from_words([1, 2, 3, 4]);
        assert_eq!(CacheKey::from_bytes(key.to_bytes()), key);
    }

    #[test]
    fn next_fragment_key_is_a_bijection_on_sample() {
        let k = CacheKey::from_words([1, 2, 3, 4]);
        let k2 = k.next_fragment_key();
        let k3 = k2.next_fragment_key();
        assert_ne!(k, k2);
        assert_ne!(k2, k3);
        assert_ne!(k, k3);
    }

    #[test]
    fn hash_of_is_deterministic() {
        let a = CacheKey::from_hash_of(b"example.com");
        let b = CacheKey::from_hash_of(b"example.com");
        assert_eq!(a, b);
        let c = CacheKey::from_hash_of(b"other.com");
        assert_ne!(a, c);
    }
}
