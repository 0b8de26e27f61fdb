// SPDX-License-Identifier: GPL-3.0-or-later
//! A growable byte arena with a read/write cursor, used to build and parse the request and
//! response bodies that cross the data socket.

use crate::error::{ExecutorError, Result};

/// Contiguous buffer with a cursor. Reads never return past `capacity`; writes grow the
/// backing storage rather than truncate.
#[derive(Debug, Default)]
pub struct ByteStream {
    data: Vec<u8>,
    position: usize,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    /// Wrap an existing buffer for reading, cursor at the start.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Read `n` bytes from the cursor, advancing it. Fails if fewer than `n` bytes remain.
    pub fn read(&mut self, n: usize) -> Result<&[u8]> {
        if self.position + n > self.data.len() {
            return Err(ExecutorError::Marshal(format!(
                "short read: requested {n} bytes at position {}, only {} available",
                self.position,
                self.data.len() - self.position
            )));
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..self.position])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.read(n)?.to_vec())
    }

    /// Append bytes at the end of the buffer. Growth is handled by `Vec`; this never
    /// truncates existing content.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let pos = self.data.len();
        self.data.extend_from_slice(bytes);
        pos
    }

    pub fn write_u8(&mut self, value: u8) -> usize {
        self.write(&[value])
    }

    pub fn write_u32(&mut self, value: u32) -> usize {
        self.write(&value.to_le_bytes())
    }

    /// Reserve `n` zero bytes the caller promises to back-patch before the buffer is sent,
    /// enabling the "size prefix computed at the end" pattern used by the GP response
    /// serializer. Returns the position of the hole.
    pub fn write_placeholder(&mut self, n: usize) -> usize {
        let pos = self.data.len();
        self.data.resize(pos + n, 0);
        pos
    }

    /// Back-patch a 4-byte placeholder written earlier with a little-endian `u32`.
    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Zero the buffer and reset the cursor to the start.
    pub fn reset(&mut self) {
        self.data.clear();
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_advances_cursor_and_returns_requested_bytes() {
        let mut ds = ByteStream::from_vec(vec![1, 2, 3, 4, 5]);
        assert_eq!(ds.read(2).unwrap(), &[1, 2]);
        assert_eq!(ds.position(), 2);
        assert_eq!(ds.read(3).unwrap(), &[3, 4, 5]);
    }

    #[test]
    fn read_past_capacity_fails() {
        let mut ds = ByteStream::from_vec(vec![1, 2, 3]);
        assert!(ds.read(4).is_err());
    }

    #[test]
    fn write_grows_rather_than_truncates() {
        let mut ds = ByteStream::new();
        ds.write(b"hello");
        ds.write(b" world");
        assert_eq!(ds.as_slice(), b"hello world");
    }

    #[test]
    fn placeholder_round_trips_with_patch() {
        let mut ds = ByteStream::new();
        let hole = ds.write_placeholder(4);
        ds.write(b"payload");
        ds.patch_u32(hole, 7);
        let mut reread = ByteStream::from_vec(ds.into_inner());
        assert_eq!(reread.read_u32().unwrap(), 7);
        assert_eq!(reread.read(7).unwrap(), b"payload");
    }

    #[test]
    fn reset_clears_buffer_and_cursor() {
        let mut ds = ByteStream::from_vec(vec![1, 2, 3]);
        ds.read(1).unwrap();
        ds.reset();
        assert_eq!(ds.position(), 0);
        assert!(ds.is_empty());
    }
}
