// SPDX-License-Identifier: MPL-2.0

//! This module provides the buffer type that carries cached payloads.
//!
//! An `Abd` owns a byte buffer whose *length* is the payload size (a
//! physical or logical block size) while its *capacity* is rounded up to
//! an alignment suitable for device I/O. Bytes between the length and the
//! capacity are kept zero, so a payload can be handed to a device at its
//! allocated (aligned) size without leaking stale memory.

use crate::prelude::*;

/// An owned, alignment-padded byte buffer.
pub struct Abd {
    data: Box<[u8]>,
    len: usize,
}

impl Abd {
    /// Allocate a zeroed buffer of `len` bytes, padded to `SECTOR_SIZE`.
    pub fn alloc(len: usize) -> Result<Self> {
        Self::alloc_aligned(len, SECTOR_SIZE)
    }

    /// Allocate a zeroed buffer of `len` bytes, padded to `align`.
    pub fn alloc_aligned(len: usize, align: usize) -> Result<Self> {
        if len == 0 || align == 0 || !align.is_power_of_two() {
            return_errno_with_msg!(InvalidArgs, "bad Abd length or alignment");
        }
        let cap = align_up(len, align);
        Ok(Self {
            data: alloc::vec![0u8; cap].into_boxed_slice(),
            len,
        })
    }

    /// Allocate a buffer holding a copy of `src`.
    pub fn from_slice(src: &[u8]) -> Result<Self> {
        let mut abd = Self::alloc(src.len())?;
        abd.as_mut_slice().copy_from_slice(src);
        Ok(abd)
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the payload is empty. Always false: empty buffers
    /// cannot be allocated.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the padded capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the payload as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Returns the payload as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Returns the payload together with its zero tail, `padded_len` bytes
    /// in total. Used when writing a payload at its device-aligned size.
    pub fn as_padded_slice(&self, padded_len: usize) -> Result<&[u8]> {
        if padded_len < self.len || padded_len > self.capacity() {
            return_errno_with_msg!(InvalidArgs, "padded length is out of the Abd capacity");
        }
        Ok(&self.data[..padded_len])
    }

    /// Shrinks the payload length without releasing capacity, zeroing the
    /// abandoned tail to preserve the zero-padding invariant.
    pub fn truncate(&mut self, new_len: usize) {
        debug_assert!(new_len > 0 && new_len <= self.len);
        self.data[new_len..self.len].fill(0);
        self.len = new_len;
    }
}

impl Debug for Abd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Abd")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_pads_to_alignment() {
        let abd = Abd::alloc(700).unwrap();
        assert_eq!(abd.len(), 700);
        assert_eq!(abd.capacity(), 1024);
        assert_eq!(abd.as_slice().len(), 700);
        assert_eq!(abd.as_padded_slice(1024).unwrap().len(), 1024);
        assert!(abd.as_padded_slice(512).is_err());
    }

    #[test]
    fn padding_stays_zero() {
        let mut abd = Abd::alloc_aligned(600, 4096).unwrap();
        abd.as_mut_slice().fill(0xaa);
        let padded = abd.as_padded_slice(4096).unwrap();
        assert!(padded[..600].iter().all(|b| *b == 0xaa));
        assert!(padded[600..].iter().all(|b| *b == 0));
    }

    #[test]
    fn truncate_rezeroes_tail() {
        let mut abd = Abd::from_slice(&[5u8; 512]).unwrap();
        abd.truncate(100);
        assert_eq!(abd.len(), 100);
        assert!(abd.as_padded_slice(512).unwrap()[100..].iter().all(|b| *b == 0));
    }
}
