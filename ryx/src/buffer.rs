/// Raw byte payload with the classic amortized growth policy: doubling for
/// small requests, exact oversize for large one-shot requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    pub fn with_length(length: usize) -> Self {
        Self {
            bytes: vec![0; length],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Length a growth to at least `min_length` will allocate: if the
    /// request exceeds the current length, grow by exactly that much in one
    /// step; otherwise double.
    pub fn grown_length(&self, min_length: usize) -> usize {
        let current = self.bytes.len();
        if min_length > current {
            current + min_length
        } else {
            current * 2
        }
    }

    /// Returns a new, larger buffer with the old content copied into its
    /// front. The old buffer is untouched; the caller discards it.
    pub fn expanded(&self, min_length: usize) -> Buffer {
        let new_length = self.grown_length(min_length);
        let mut bytes = vec![0; new_length];
        bytes[..self.bytes.len()].copy_from_slice(&self.bytes);
        Self { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_request_doubles() {
        let mut buffer = Buffer::with_length(16);
        buffer.data_mut().copy_from_slice(&[7u8; 16]);

        let grown = buffer.expanded(4);
        assert_eq!(grown.length(), 32);
        assert_eq!(&grown.data()[..16], &[7u8; 16]);
        assert_eq!(&grown.data()[16..], &[0u8; 16]);
        // old buffer untouched
        assert_eq!(buffer.length(), 16);
    }

    #[test]
    fn request_equal_to_length_doubles() {
        let buffer = Buffer::with_length(8);
        assert_eq!(buffer.expanded(8).length(), 16);
    }

    #[test]
    fn large_request_grows_exactly_once() {
        let mut buffer = Buffer::with_length(10);
        for (i, b) in buffer.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }

        let grown = buffer.expanded(100);
        assert_eq!(grown.length(), 110);
        for (i, b) in grown.data()[..10].iter().enumerate() {
            assert_eq!(*b, i as u8);
        }
    }

    #[test]
    fn growth_is_monotonic_over_request_sizes() {
        for old in [1usize, 4, 16, 33] {
            let buffer = Buffer::with_length(old);
            for n in 1..=old {
                let grown = buffer.expanded(n);
                assert!(grown.length() >= n.max(2 * old));
            }
            let grown = buffer.expanded(old + 5);
            assert_eq!(grown.length(), old + old + 5);
        }
    }

    #[test]
    fn empty_buffer_grows_by_request() {
        let buffer = Buffer::with_length(0);
        assert_eq!(buffer.expanded(12).length(), 12);
    }
}
