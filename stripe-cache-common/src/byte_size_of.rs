/// Reports the number of bytes an instance actually occupies, including heap
/// allocations it owns — not merely `size_of::<Self>()`.
///
/// The RAM cache and the write-aggregation backlog both account in terms of
/// this value rather than logical payload length, since the overhead of
/// owning a `Vec<u8>` or similar buffer is part of what has to fit in the
/// configured budget.
pub trait ByteSizeOf {
    /// Bytes allocated on the heap by this value, excluding `size_of::<Self>()`.
    fn allocated_bytes(&self) -> usize;

    /// Total size of this value: its stack footprint plus anything it owns on the heap.
    fn size_of(&self) -> usize {
        std::mem::size_of_val(self) + self.allocated_bytes()
    }
}

impl ByteSizeOf for Vec<u8> {
    fn allocated_bytes(&self) -> usize {
        self.capacity()
    }
}

impl ByteSizeOf for bytes::Bytes {
    fn allocated_bytes(&self) -> usize {
        self.len()
    }
}

impl<T: ByteSizeOf> ByteSizeOf for Box<T> {
    fn allocated_bytes(&self) -> usize {
        std::mem::size_of::<T>() + self.as_ref().allocated_bytes()
    }
}

impl<T: ByteSizeOf> ByteSizeOf for Option<T> {
    fn allocated_bytes(&self) -> usize {
        self.as_ref().map_or(0, ByteSizeOf::allocated_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_size_includes_capacity() {
        let v: Vec<u8> = Vec::with_capacity(128);
        assert_eq!(v.allocated_bytes(), 128);
        assert_eq!(v.size_of(), std::mem::size_of::<Vec<u8>>() + 128);
    }

    #[test]
    fn bytes_size_tracks_len() {
        let b = bytes::Bytes::from_static(b"hello world");
        assert_eq!(b.allocated_bytes(), 11);
    }
}
