// SPDX-License-Identifier: MPL-2.0

//! On-device structures of the second-level cache.
//!
//! A cache device carries, after its header, a rotary region of data
//! payloads interleaved with *log blocks*: fixed-shape records listing
//! recently cached entries. Log blocks chain backward through block
//! pointers carried in the device header, letting an import walk from the
//! newest block to the oldest and reconstruct in-memory headers.
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────────────────┐
//! │ dev header │ payload │ payload │ log blk │ payload │ log blk │ ...│
//! │ (>= 4 KiB) │◄──────────────── start .. end (rotary) ─────────────►│
//! └────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are stored in native byte order; a magic mismatch whose
//! byte-swapped form matches tells the decoder to swap every field.
//! Integrity is a Fletcher-4 checksum over the on-disk (possibly
//! compressed, padded) form, stored in the *parent* pointer, so a torn
//! write anywhere breaks the chain cleanly.

use bytemuck::{Pod, Zeroable};

use crate::{
    layers::codec::{self, Compression},
    prelude::*,
    util::{fletcher4, fletcher4_byteswapped},
};

/// Magic of the device header ("ARCCACHE").
pub const DEV_HDR_MAGIC: u64 = 0x4152_4343_4143_4845;
/// Magic of a log block ("LOGBLKHD").
pub const LOG_BLK_MAGIC: u64 = 0x4c4f_4742_4c4b_4844;
/// Format version written by this implementation.
pub const DEV_HDR_VERSION: u64 = 1;
/// Entries per log block.
pub const LOG_BLK_MAX_ENTRIES: usize = 1022;

/// Device-header flag: the write hand has wrapped at least once.
pub const DH_FLAG_WRAPPED: u64 = 1;

/// Trim progress persisted across import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TrimState {
    None = 0,
    InProgress = 1,
    Complete = 2,
}

impl TrimState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::InProgress,
            2 => Self::Complete,
            _ => Self::None,
        }
    }
}

/// A pointer to one log block, stored in the device header and in each
/// block's `prev_lbp`. The checksum covers the pointee's on-disk form.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct LogBlkPtrPhys {
    /// Byte offset of the block on the device; 0 terminates the chain.
    pub daddr: u64,
    /// Byte offset of the oldest payload the pointee describes.
    pub payload_start: u64,
    /// Total allocated payload bytes the pointee describes.
    pub payload_asize: u64,
    /// Packed: bits 0..31 = on-disk size (asize), 32..36 = compression.
    pub prop: u64,
    /// Fletcher-4 of the pointee's on-disk form.
    pub cksum: [u64; 4],
}

impl LogBlkPtrPhys {
    pub fn is_null(&self) -> bool {
        self.daddr == 0
    }

    pub fn asize(&self) -> u64 {
        self.prop & 0xffff_ffff
    }

    pub fn compress(&self) -> Result<Compression> {
        Compression::from_u8(((self.prop >> 32) & 0x1f) as u8)
    }

    pub fn pack_prop(asize: u64, compress: Compression) -> u64 {
        (asize & 0xffff_ffff) | ((compress.as_u8() as u64) << 32)
    }

    fn byteswap(&mut self) {
        self.daddr = self.daddr.swap_bytes();
        self.payload_start = self.payload_start.swap_bytes();
        self.payload_asize = self.payload_asize.swap_bytes();
        self.prop = self.prop.swap_bytes();
        for w in &mut self.cksum {
            *w = w.swap_bytes();
        }
    }
}

/// One cached-block record inside a log block. A zero DVA marks an
/// unused slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct LogEntryPhys {
    pub dva: [u64; 2],
    pub birth: u64,
    /// Byte offset of the payload on the device.
    pub daddr: u64,
    /// Packed properties; see `EntryProps`.
    pub prop: u64,
    pub complevel: u8,
    pub pad: [u8; 7],
}

impl LogEntryPhys {
    pub fn is_empty(&self) -> bool {
        self.dva == [0, 0] && self.birth == 0
    }

    fn byteswap(&mut self) {
        self.dva[0] = self.dva[0].swap_bytes();
        self.dva[1] = self.dva[1].swap_bytes();
        self.birth = self.birth.swap_bytes();
        self.daddr = self.daddr.swap_bytes();
        self.prop = self.prop.swap_bytes();
    }
}

/// Unpacked form of `LogEntryPhys::prop`:
/// lsize:20 | psize:20 | compress:5 | type:4 | protected:1 | prefetch:1 |
/// state:3 | reserved:10.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryProps {
    pub lsize: u32,
    pub psize: u32,
    pub compress: u8,
    pub blk_type: u8,
    pub protected: bool,
    pub prefetch: bool,
    pub state: u8,
}

impl EntryProps {
    pub fn pack(&self) -> u64 {
        debug_assert!(self.lsize < (1 << 20) && self.psize < (1 << 20));
        (self.lsize as u64)
            | ((self.psize as u64) << 20)
            | (((self.compress & 0x1f) as u64) << 40)
            | (((self.blk_type & 0xf) as u64) << 45)
            | ((self.protected as u64) << 49)
            | ((self.prefetch as u64) << 50)
            | (((self.state & 0x7) as u64) << 51)
    }

    pub fn unpack(prop: u64) -> Self {
        Self {
            lsize: (prop & 0xf_ffff) as u32,
            psize: ((prop >> 20) & 0xf_ffff) as u32,
            compress: ((prop >> 40) & 0x1f) as u8,
            blk_type: ((prop >> 45) & 0xf) as u8,
            protected: (prop >> 49) & 1 != 0,
            prefetch: (prop >> 50) & 1 != 0,
            state: ((prop >> 51) & 0x7) as u8,
        }
    }
}

/// One log block as stored (before compression and padding).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LogBlockPhys {
    pub magic: u64,
    /// The next-older block of the same chain.
    pub prev_lbp: LogBlkPtrPhys,
    pub entries: [LogEntryPhys; LOG_BLK_MAX_ENTRIES],
}

pub const LOG_BLK_RAW_SIZE: usize = core::mem::size_of::<LogBlockPhys>();

impl LogBlockPhys {
    pub fn empty() -> Self {
        let mut lb: Self = Zeroable::zeroed();
        lb.magic = LOG_BLK_MAGIC;
        lb
    }

    fn byteswap(&mut self) {
        self.magic = self.magic.swap_bytes();
        self.prev_lbp.byteswap();
        for e in &mut self.entries {
            e.byteswap();
        }
    }
}

/// The persistent device header, stored at the front of the device and
/// written atomically as one labelled block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DeviceHeaderPhys {
    pub magic: u64,
    pub version: u64,
    pub spa_guid: u64,
    pub vdev_guid: u64,
    /// Entries per log block on this device.
    pub log_entries: u64,
    /// Byte offset up to which prior-epoch content is invalidated.
    pub evict: u64,
    pub start: u64,
    pub end: u64,
    /// Total allocated bytes of reachable log blocks (diagnostic).
    pub lb_asize: u64,
    /// Count of reachable log blocks (diagnostic).
    pub lb_count: u64,
    pub flags: u64,
    pub trim_action_time: u64,
    pub trim_state: u32,
    pub pad: u32,
    /// The two chain heads; [0] is the most recently committed block.
    pub start_lbps: [LogBlkPtrPhys; 2],
    /// Fletcher-4 over all preceding bytes.
    pub cksum: [u64; 4],
}

pub const DEV_HDR_RAW_SIZE: usize = core::mem::size_of::<DeviceHeaderPhys>();

/// The on-disk size of the device header for a given `ashift`.
pub fn dev_hdr_asize(ashift: u32) -> usize {
    (4096usize).max(1 << ashift)
}

impl DeviceHeaderPhys {
    pub fn new(spa_guid: u64, vdev_guid: u64, start: u64, end: u64) -> Self {
        let mut dh: Self = Zeroable::zeroed();
        dh.magic = DEV_HDR_MAGIC;
        dh.version = DEV_HDR_VERSION;
        dh.spa_guid = spa_guid;
        dh.vdev_guid = vdev_guid;
        dh.log_entries = LOG_BLK_MAX_ENTRIES as u64;
        dh.evict = start;
        dh.start = start;
        dh.end = end;
        dh
    }

    fn byteswap(&mut self) {
        self.magic = self.magic.swap_bytes();
        self.version = self.version.swap_bytes();
        self.spa_guid = self.spa_guid.swap_bytes();
        self.vdev_guid = self.vdev_guid.swap_bytes();
        self.log_entries = self.log_entries.swap_bytes();
        self.evict = self.evict.swap_bytes();
        self.start = self.start.swap_bytes();
        self.end = self.end.swap_bytes();
        self.lb_asize = self.lb_asize.swap_bytes();
        self.lb_count = self.lb_count.swap_bytes();
        self.flags = self.flags.swap_bytes();
        self.trim_action_time = self.trim_action_time.swap_bytes();
        self.trim_state = self.trim_state.swap_bytes();
        for lbp in &mut self.start_lbps {
            lbp.byteswap();
        }
        for w in &mut self.cksum {
            *w = w.swap_bytes();
        }
    }

    /// Serializes into an `asize`-sized labelled block with its checksum
    /// sealed in.
    pub fn encode(&self, asize: usize) -> Vec<u8> {
        let mut out = alloc::vec![0u8; asize];
        let mut sealed = *self;
        sealed.cksum = [0; 4];
        let cksum = fletcher4(&bytemuck::bytes_of(&sealed)[..DEV_HDR_RAW_SIZE - 32]).words();
        sealed.cksum = cksum;
        out[..DEV_HDR_RAW_SIZE].copy_from_slice(bytemuck::bytes_of(&sealed));
        out
    }

    /// Decodes and verifies a device header, byte-swapping a
    /// foreign-endian one.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEV_HDR_RAW_SIZE {
            return_errno_with_msg!(ChecksumMismatched, "device header block too small");
        }
        let mut dh: DeviceHeaderPhys =
            bytemuck::pod_read_unaligned(&bytes[..DEV_HDR_RAW_SIZE]);
        let swapped = dh.magic == DEV_HDR_MAGIC.swap_bytes();
        if swapped {
            dh.byteswap();
        }
        if dh.magic != DEV_HDR_MAGIC {
            return_errno_with_msg!(ChecksumMismatched, "bad device header magic");
        }

        // The checksum covers the on-disk bytes up to the checksum field,
        // read in the writer's byte order.
        let body = &bytes[..DEV_HDR_RAW_SIZE - 32];
        let actual = if swapped {
            fletcher4_byteswapped(body).words()
        } else {
            fletcher4(body).words()
        };
        if actual != dh.cksum {
            return_errno_with_msg!(ChecksumMismatched, "device header checksum mismatch");
        }
        Ok(dh)
    }
}

/// Encodes a log block for commit: LZ4 when it helps, raw otherwise,
/// padded to `ashift` granularity. Returns the padded bytes and the
/// pointer fields describing them (checksum over the padded form).
pub fn encode_log_blk(lb: &LogBlockPhys, ashift: u32) -> (Vec<u8>, u64, Compression) {
    let raw = bytemuck::bytes_of(lb);
    let mut compressed = alloc::vec![0u8; raw.len() - 1];
    let (mut out, compress) = match codec::compress(Compression::Lz4, raw, &mut compressed) {
        Some(clen) => {
            compressed.truncate(clen);
            (compressed, Compression::Lz4)
        }
        None => (raw.to_vec(), Compression::Off),
    };
    let asize = align_up(out.len(), 1 << ashift);
    out.resize(asize, 0);
    (out, asize as u64, compress)
}

/// Reads back a committed log block given its parent pointer.
pub fn decode_log_blk(bytes: &[u8], lbp: &LogBlkPtrPhys) -> Result<LogBlockPhys> {
    if bytes.len() != lbp.asize() as usize {
        return_errno_with_msg!(ChecksumMismatched, "log block size mismatch");
    }
    // The writer checksummed the on-disk form in its own byte order; a
    // foreign-endian block matches the swapped reading.
    if fletcher4(bytes).words() != lbp.cksum
        && fletcher4_byteswapped(bytes).words() != lbp.cksum
    {
        return_errno_with_msg!(ChecksumMismatched, "log block checksum mismatch");
    }

    let raw: Vec<u8> = match lbp.compress()? {
        Compression::Off => bytes[..LOG_BLK_RAW_SIZE.min(bytes.len())].to_vec(),
        alg => {
            let mut out = alloc::vec![0u8; LOG_BLK_RAW_SIZE];
            codec::decompress(alg, bytes, &mut out)?;
            out
        }
    };
    if raw.len() < LOG_BLK_RAW_SIZE {
        return_errno_with_msg!(ChecksumMismatched, "log block truncated");
    }

    let mut lb: LogBlockPhys = bytemuck::pod_read_unaligned(&raw[..LOG_BLK_RAW_SIZE]);
    if lb.magic == LOG_BLK_MAGIC.swap_bytes() {
        lb.byteswap();
    }
    if lb.magic != LOG_BLK_MAGIC {
        return_errno_with_msg!(ChecksumMismatched, "bad log block magic");
    }
    Ok(lb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_props_round_trip() {
        let props = EntryProps {
            lsize: 0x1_0000,
            psize: 0x8000,
            compress: 1,
            blk_type: 1,
            protected: true,
            prefetch: false,
            state: 3,
        };
        assert_eq!(EntryProps::unpack(props.pack()), props);
    }

    #[test]
    fn log_blk_encode_decode_round_trip() {
        let mut lb = LogBlockPhys::empty();
        for i in 0..10u64 {
            lb.entries[i as usize] = LogEntryPhys {
                dva: [i + 1, 0],
                birth: 100 + i,
                daddr: 4096 * i,
                prop: EntryProps {
                    lsize: 4096,
                    psize: 4096,
                    compress: 0,
                    blk_type: 0,
                    protected: false,
                    prefetch: false,
                    state: 1,
                }
                .pack(),
                complevel: 0,
                pad: [0; 7],
            };
        }

        let (bytes, asize, compress) = encode_log_blk(&lb, 9);
        assert_eq!(bytes.len() as u64, asize);
        assert_eq!(asize % 512, 0);
        // A mostly-zero block must compress well.
        assert_eq!(compress, Compression::Lz4);

        let lbp = LogBlkPtrPhys {
            daddr: 8192,
            payload_start: 4096,
            payload_asize: 40960,
            prop: LogBlkPtrPhys::pack_prop(asize, compress),
            cksum: fletcher4(&bytes).words(),
        };
        let decoded = decode_log_blk(&bytes, &lbp).unwrap();
        assert_eq!(decoded.magic, LOG_BLK_MAGIC);
        for i in 0..10usize {
            assert_eq!(decoded.entries[i].dva, lb.entries[i].dva);
            assert_eq!(decoded.entries[i].birth, lb.entries[i].birth);
        }
        assert!(decoded.entries[10].is_empty());
    }

    #[test]
    fn log_blk_detects_corruption() {
        let lb = LogBlockPhys::empty();
        let (mut bytes, asize, compress) = encode_log_blk(&lb, 9);
        let lbp = LogBlkPtrPhys {
            daddr: 512,
            payload_start: 0,
            payload_asize: 0,
            prop: LogBlkPtrPhys::pack_prop(asize, compress),
            cksum: fletcher4(&bytes).words(),
        };
        bytes[17] ^= 0x40;
        let err = decode_log_blk(&bytes, &lbp).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::ChecksumMismatched);
    }

    #[test]
    fn dev_hdr_encode_decode_round_trip() {
        let mut dh = DeviceHeaderPhys::new(11, 22, 4096, 64 * 1024 * 1024);
        dh.lb_count = 3;
        dh.flags = DH_FLAG_WRAPPED;
        let bytes = dh.encode(dev_hdr_asize(9));
        let decoded = DeviceHeaderPhys::decode(&bytes).unwrap();
        assert_eq!(decoded.spa_guid, 11);
        assert_eq!(decoded.vdev_guid, 22);
        assert_eq!(decoded.lb_count, 3);
        assert_eq!(decoded.flags, DH_FLAG_WRAPPED);

        let mut torn = bytes.clone();
        torn[100] ^= 1;
        assert!(DeviceHeaderPhys::decode(&torn).is_err());
    }
}
