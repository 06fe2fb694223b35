//! # I/O Buffer
//!
//! Fixed-capacity byte region with a write cursor.
//!
//! The transfer engine keeps one buffer per direction and mutates it in place:
//! reads append at the cursor, partial writes drop a prefix, and the USC codec
//! opens or closes an 8-byte gap in the middle of the buffered data. Every
//! operation here is bounds-checked, and bytes vacated by a shift are zeroed
//! so stale plaintext never lingers past the cursor.

use crate::error::{Result, TunnelError};

/// Fixed-capacity buffer; `len` bytes starting at offset 0 are in flight
pub struct IoBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl IoBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Free space after the cursor
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Bytes currently buffered
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Free region after the cursor, for reading directly into the buffer
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Advance the cursor after `n` bytes were written into [`spare_mut`](Self::spare_mut)
    pub fn commit(&mut self, n: usize) -> Result<()> {
        self.check_room(n)?;
        self.len += n;
        Ok(())
    }

    /// Append bytes at the cursor
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_room(bytes.len())?;
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Overwrite bytes already in flight, starting at `offset`
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset.checked_add(bytes.len()).ok_or(TunnelError::BufferOverflow {
            requested: bytes.len(),
            available: 0,
        })?;
        if end > self.len {
            return Err(TunnelError::BufferOverflow {
                requested: end,
                available: self.len,
            });
        }
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Remove the first `n` bytes, moving the rest to the start
    pub fn shift_left(&mut self, n: usize) -> Result<()> {
        self.shift_left_at(0, n)
    }

    /// Remove `n` bytes at `offset`, closing the gap
    pub fn shift_left_at(&mut self, offset: usize, n: usize) -> Result<()> {
        let end = offset.saturating_add(n);
        if end > self.len {
            return Err(TunnelError::BufferOverflow {
                requested: end,
                available: self.len,
            });
        }
        self.data.copy_within(end..self.len, offset);
        let new_len = self.len - n;
        self.data[new_len..self.len].fill(0);
        self.len = new_len;
        Ok(())
    }

    /// Open an `n`-byte gap at the start, moving the buffered bytes forward
    pub fn shift_right(&mut self, n: usize) -> Result<()> {
        self.shift_right_at(0, n)
    }

    /// Open an `n`-byte zeroed gap at `offset`, moving bytes `offset..len` forward
    pub fn shift_right_at(&mut self, offset: usize, n: usize) -> Result<()> {
        if offset > self.len {
            return Err(TunnelError::BufferOverflow {
                requested: offset,
                available: self.len,
            });
        }
        self.check_room(n)?;
        self.data.copy_within(offset..self.len, offset + n);
        self.data[offset..offset + n].fill(0);
        self.len += n;
        Ok(())
    }

    /// Drop everything and zero the used region
    pub fn clear(&mut self) {
        self.data[..self.len].fill(0);
        self.len = 0;
    }

    fn check_room(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(TunnelError::BufferOverflow {
                requested: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(bytes: &[u8], capacity: usize) -> IoBuffer {
        let mut buf = IoBuffer::with_capacity(capacity);
        buf.extend_from_slice(bytes).expect("fill");
        buf
    }

    #[test]
    fn test_partial_consume_keeps_tail_contiguous() {
        let original: Vec<u8> = (0..208u16).map(|i| i as u8).collect();
        let mut buf = filled(&original, 1024);

        buf.shift_left(50).expect("shift");
        assert_eq!(buf.len(), 158);
        assert_eq!(buf.as_slice(), &original[50..208]);
    }

    #[test]
    fn test_vacated_tail_is_zeroed() {
        let mut buf = filled(&[7u8; 16], 16);
        buf.shift_left(10).expect("shift");
        buf.commit(10).expect("commit");
        assert_eq!(&buf.as_slice()[6..], &[0u8; 10]);
    }

    #[test]
    fn test_shift_right_at_opens_gap() {
        let mut buf = filled(b"abcdef", 32);
        buf.shift_right_at(2, 3).expect("shift");
        assert_eq!(buf.as_slice(), b"ab\0\0\0cdef");
        buf.shift_left_at(2, 3).expect("close");
        assert_eq!(buf.as_slice(), b"abcdef");
    }

    #[test]
    fn test_overflow_rejected() {
        let mut buf = filled(b"abcd", 6);
        assert!(matches!(
            buf.shift_right(3),
            Err(TunnelError::BufferOverflow { requested: 3, available: 2 })
        ));
        assert!(buf.shift_left(5).is_err());
        assert!(buf.commit(3).is_err());
        assert_eq!(buf.as_slice(), b"abcd");
    }

    #[test]
    fn test_write_at_bounds() {
        let mut buf = filled(b"abcd", 8);
        buf.write_at(1, b"XY").expect("write");
        assert_eq!(buf.as_slice(), b"aXYd");
        assert!(buf.write_at(3, b"XY").is_err());
    }
}
