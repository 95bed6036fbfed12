//! Bounded byte buffer used as filter output.

/// Default capacity for filter stages and read/write buffers.
pub const IO_BUFFER_SIZE_DEFAULT: usize = 64 * 1024;

/// A byte buffer with a hard capacity limit.
///
/// Filters write into a `FilterBuf` and must stop once it is full; a full buffer is what makes a
/// filter report `input_same`.
#[derive(Debug, Clone)]
pub struct FilterBuf {
    data: Vec<u8>,
    limit: usize,
}

impl FilterBuf {
    /// Create an empty buffer holding at most `limit` bytes (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            data: Vec::with_capacity(limit.min(IO_BUFFER_SIZE_DEFAULT)),
            limit,
        }
    }

    /// Capacity limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when no more bytes fit.
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.limit
    }

    /// Free space left.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }

    /// Copy as much of `bytes` as fits and return the number of bytes copied.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Held bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop all held bytes, keeping the limit.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_limit() {
        let mut buf = FilterBuf::new(4);
        assert_eq!(buf.push(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.as_slice(), b"abcd");
        assert_eq!(buf.push(b"x"), 0);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn test_zero_limit_becomes_one() {
        let buf = FilterBuf::new(0);
        assert_eq!(buf.limit(), 1);
    }
}
