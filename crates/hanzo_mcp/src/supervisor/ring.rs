//! Bounded ring over the combined output stream of one child process.
//!
//! The ring holds the most recent bytes of the arrival-order interleave of
//! stdout and stderr. Offsets are absolute positions in that combined
//! stream; once bytes rotate out of the ring, readers fall back to the
//! spill files via the session's chunk index.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OutputRing {
    buf: VecDeque<u8>,
    start: u64,
    cap: usize,
}

impl OutputRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            start: 0,
            cap: cap.max(1),
        }
    }

    /// Append bytes, evicting from the front past capacity.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
            self.start += excess as u64;
        }
    }

    /// Absolute offset of the oldest byte still held.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// Absolute offset one past the newest byte.
    pub fn end_offset(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    /// Read from an absolute offset, up to `max` bytes. `None` when the
    /// offset has already rotated out.
    pub fn read_from(&self, offset: u64, max: usize) -> Option<Vec<u8>> {
        if offset < self.start {
            return None;
        }
        let skip = (offset - self.start) as usize;
        if skip >= self.buf.len() {
            return Some(Vec::new());
        }
        Some(self.buf.iter().skip(skip).take(max).copied().collect())
    }

    /// The trailing `n` bytes, for session previews.
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_without_eviction() {
        let mut ring = OutputRing::new(64);
        ring.push(b"hello ");
        ring.push(b"world");

        assert_eq!(ring.start_offset(), 0);
        assert_eq!(ring.end_offset(), 11);
        assert_eq!(ring.read_from(0, 1024).unwrap(), b"hello world");
        assert_eq!(ring.read_from(6, 1024).unwrap(), b"world");
    }

    #[test]
    fn eviction_advances_start_offset() {
        let mut ring = OutputRing::new(8);
        ring.push(b"0123456789abcdef");

        assert_eq!(ring.start_offset(), 8);
        assert_eq!(ring.end_offset(), 16);
        assert_eq!(ring.read_from(8, 1024).unwrap(), b"89abcdef");
        assert!(ring.read_from(4, 1024).is_none());
    }

    #[test]
    fn read_past_end_is_empty_not_none() {
        let mut ring = OutputRing::new(8);
        ring.push(b"abc");
        assert_eq!(ring.read_from(3, 16).unwrap(), b"");
    }

    #[test]
    fn read_respects_max() {
        let mut ring = OutputRing::new(64);
        ring.push(b"abcdefgh");
        assert_eq!(ring.read_from(0, 3).unwrap(), b"abc");
    }

    #[test]
    fn tail_returns_trailing_bytes() {
        let mut ring = OutputRing::new(64);
        ring.push(b"abcdefgh");
        assert_eq!(ring.tail(3), b"fgh");
        assert_eq!(ring.tail(100), b"abcdefgh");
    }
}
