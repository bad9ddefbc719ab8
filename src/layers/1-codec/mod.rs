// SPDX-License-Identifier: MPL-2.0

//! The codec seam.
//!
//! Compression and encryption are performed by external codecs; the cache
//! only needs to invoke them when materializing a consumer view of a
//! payload (decompress/decrypt on fill) and when staging payloads for the
//! second-level device (log-block compression). This module defines the
//! interface and binds the algorithms the cache must be able to name.

use lz4_flex::block;

use crate::prelude::*;

/// A compression algorithm identifier, as recorded in block pointers,
/// buffer headers and on-device log entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    /// Payload is stored uncompressed.
    #[default]
    Off = 0,
    /// LZ4 block format.
    Lz4 = 1,
}

impl Compression {
    /// Returns the wire value, which must fit the 5-bit field of a log
    /// entry's packed properties.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a wire value.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Off),
            1 => Ok(Self::Lz4),
            _ => Err(Error::with_msg(Unsupported, "unknown compression value")),
        }
    }
}

/// A compression codec.
pub trait Compressor {
    /// Compress `src` into `dst`. Returns the compressed length, or `None`
    /// when the result would not fit in `dst` (i.e., compression yields no
    /// saving worth keeping).
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Option<usize>;

    /// Decompress `src` into exactly `dst.len()` bytes.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

struct Lz4;

impl Compressor for Lz4 {
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Option<usize> {
        block::compress_into(src, dst).ok()
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let n = block::decompress_into(src, dst)
            .map_err(|_| Error::with_msg(IoFailed, "lz4 decompression failed"))?;
        if n != dst.len() {
            return_errno_with_msg!(IoFailed, "lz4 output is shorter than the logical size");
        }
        Ok(())
    }
}

/// Compress `src` with `alg` into `dst`, returning the compressed length
/// or `None` when the payload is incompressible within `dst`.
pub fn compress(alg: Compression, src: &[u8], dst: &mut [u8]) -> Option<usize> {
    match alg {
        Compression::Off => None,
        Compression::Lz4 => Lz4.compress(src, dst),
    }
}

/// Decompress an `alg`-compressed `src` into exactly `dst.len()` bytes.
pub fn decompress(alg: Compression, src: &[u8], dst: &mut [u8]) -> Result<()> {
    match alg {
        Compression::Off => {
            if src.len() < dst.len() {
                return_errno_with_msg!(InvalidArgs, "source is shorter than the logical size");
            }
            dst.copy_from_slice(&src[..dst.len()]);
            Ok(())
        }
        Compression::Lz4 => Lz4.decompress(src, dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trip() {
        let src = alloc::vec![7u8; 4096];
        let mut dst = alloc::vec![0u8; 4096];
        let clen = compress(Compression::Lz4, &src, &mut dst).unwrap();
        assert!(clen < src.len());

        let mut out = alloc::vec![0u8; 4096];
        decompress(Compression::Lz4, &dst[..clen], &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn incompressible_returns_none() {
        // High-entropy bytes do not shrink; a `dst` of the same size as
        // `src` forces the codec to give up.
        let src: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 7) as u8)
            .collect();
        let mut dst = alloc::vec![0u8; 512];
        assert!(compress(Compression::Lz4, &src, &mut dst).is_none());
    }

    #[test]
    fn off_copies_prefix() {
        let src = [9u8; 128];
        let mut dst = [0u8; 64];
        decompress(Compression::Off, &src, &mut dst).unwrap();
        assert_eq!(dst, [9u8; 64]);
    }
}
