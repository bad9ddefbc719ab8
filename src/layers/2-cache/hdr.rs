// SPDX-License-Identifier: MPL-2.0

//! Buffer headers: the cache entity.
//!
//! A header carries a block's immutable identity, its decoding parameters
//! and, depending on where the block currently lives, an L1 payload
//! (in-memory data and list membership) and/or an L2 payload (its slot on
//! a cache device). Headers holding only an L2 payload keep the small
//! allocation; promotion and demotion move the boxed L1 part in and out.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use super::state::StateKind;
use crate::{
    layers::{bio::Abd, codec::Compression, l2::L2Device},
    os::{AeadIv, AeadMac, Condvar, CvarMutex, Mutex, MutexGuard},
    prelude::*,
    util::{cityhash4, RefTag, TaggedRefcount},
};

/// A 128-bit disk virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Dva(pub [u64; 2]);

impl Dva {
    /// Returns whether this is the all-zero (unallocated) address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0, 0]
    }
}

/// A block identity: `(dva, birth_txg)`, unique for the block's lifetime
/// within one pool. The all-zero identity denotes an anonymous header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlkIdentity {
    pub dva: Dva,
    pub birth: u64,
}

impl BlkIdentity {
    pub const ANON: Self = Self {
        dva: Dva([0, 0]),
        birth: 0,
    };

    /// Returns whether the identity is the anonymous (zero) identity.
    pub fn is_anon(&self) -> bool {
        self.dva.is_zero() && self.birth == 0
    }
}

/// Hashes a block identity, together with its pool load guid, into the
/// value that indexes the hash table.
pub fn identity_hash(guid: u64, ident: &BlkIdentity) -> u64 {
    cityhash4(guid, ident.dva.0[0], ident.dva.0[1], ident.birth)
}

/// The payload class of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlkType {
    Data = 0,
    Metadata = 1,
}

impl BlkType {
    pub const ALL: [BlkType; 2] = [BlkType::Data, BlkType::Metadata];

    /// Index into per-type arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Decodes a wire value.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Data),
            1 => Ok(Self::Metadata),
            _ => Err(Error::with_msg(Unsupported, "unknown block type value")),
        }
    }
}

bitflags! {
    /// Header state bits. Mutated under the header's hash bucket lock
    /// (or while the header is undiscoverable); readable lock-free.
    pub struct HdrFlags: u32 {
        const IN_HASH            = 1 << 0;
        const IO_IN_PROGRESS     = 1 << 1;
        const IO_ERROR           = 1 << 2;
        const PREFETCH           = 1 << 3;
        const PRESCIENT_PREFETCH = 1 << 4;
        const INDIRECT           = 1 << 5;
        const PRIO_ASYNC_READ    = 1 << 6;
        const COMPRESSED_ARC     = 1 << 7;
        const L2CACHE            = 1 << 8;
        const UNCACHED           = 1 << 9;
        const PROTECTED          = 1 << 10;
        const NOAUTH             = 1 << 11;
        const SHARED_DATA        = 1 << 12;
        const HAS_L1             = 1 << 13;
        const HAS_L2             = 1 << 14;
        const L2_READING         = 1 << 15;
        const L2_WRITING         = 1 << 16;
        const L2_EVICTED         = 1 << 17;
        const L2_WRITE_HEAD      = 1 << 18;
    }
}

/// Encryption parameters of a protected block, carried from its block
/// pointer so a raw payload can later be authenticated and decrypted.
#[derive(Clone, Debug)]
pub struct CryptParams {
    pub salt: [u8; 8],
    pub iv: AeadIv,
    pub mac: AeadMac,
}

/// A block pointer: everything needed to name, fetch and decode one block.
#[derive(Clone, Debug)]
pub struct BlockPtr {
    pub dva: Dva,
    pub birth: u64,
    pub lsize: u32,
    pub psize: u32,
    pub compress: Compression,
    pub complevel: u8,
    pub blk_type: BlkType,
    pub byteswap: bool,
    /// Present iff the block is encrypted on disk.
    pub crypt: Option<CryptParams>,
    /// Short payloads may be embedded in the pointer itself; such blocks
    /// bypass the cache entirely.
    pub embedded: Option<Box<[u8]>>,
    pub hole: bool,
}

impl BlockPtr {
    /// Returns the identity named by this pointer.
    pub fn identity(&self) -> BlkIdentity {
        BlkIdentity {
            dva: self.dva,
            birth: self.birth,
        }
    }

    /// Returns whether the payload is stored encrypted.
    pub fn is_protected(&self) -> bool {
        self.crypt.is_some()
    }

    /// Structural sanity check applied before the pointer is trusted.
    pub fn verify(&self) -> Result<()> {
        if self.hole {
            return_errno_with_msg!(InvalidArgs, "cannot read a hole block pointer");
        }
        if self.embedded.is_none() {
            if self.psize == 0 || self.lsize == 0 {
                return_errno_with_msg!(InvalidArgs, "block pointer with zero size");
            }
            if self.psize > self.lsize {
                return_errno_with_msg!(InvalidArgs, "psize exceeds lsize");
            }
            if self.identity().is_anon() {
                return_errno_with_msg!(InvalidArgs, "block pointer with zero identity");
            }
        }
        if self.compress == Compression::Off && self.embedded.is_none() && self.psize != self.lsize
        {
            return_errno_with_msg!(InvalidArgs, "uncompressed block with psize != lsize");
        }
        Ok(())
    }
}

/// A consumer buffer's payload: either its own allocation or an alias of
/// the header's physical payload.
#[derive(Debug)]
pub enum BufPayload {
    Owned(Abd),
    SharedWithHdr,
}

/// One consumer buffer hanging off a header.
#[derive(Debug)]
pub struct BufEntry {
    pub id: u64,
    pub payload: BufPayload,
    /// The buffer view is compressed (psize bytes).
    pub compressed: bool,
    /// The buffer view is raw ciphertext.
    pub encrypted: bool,
}

impl BufEntry {
    pub fn is_shared(&self) -> bool {
        matches!(self.payload, BufPayload::SharedWithHdr)
    }
}

/// The L1 part of a header: present while the block has in-memory state.
#[derive(Debug)]
pub struct L1Hdr {
    pub state: StateKind,
    /// Physical payload, as stored on disk minus encryption (compressed
    /// when the header is `COMPRESSED_ARC`).
    pub pabd: Option<Abd>,
    /// Raw (encrypted) payload, only for `PROTECTED` headers.
    pub rabd: Option<Abd>,
    /// Consumer buffers; an uncompressed shared buffer must be last.
    pub bufs: Vec<BufEntry>,
    /// Membership in the owning state's multi-list (only while evictable).
    pub node: Option<super::multilist::ListLink>,
    /// Last access, in clock milliseconds.
    pub access_ms: u64,
    /// Callback records of an in-flight read.
    pub acbs: Vec<super::read::AcbEntry>,
    pub mru_hits: u32,
    pub mru_ghost_hits: u32,
    pub mfu_hits: u32,
    pub mfu_ghost_hits: u32,
}

impl L1Hdr {
    fn new(state: StateKind) -> Self {
        Self {
            state,
            pabd: None,
            rabd: None,
            bufs: Vec::new(),
            node: None,
            access_ms: 0,
            acbs: Vec::new(),
            mru_hits: 0,
            mru_ghost_hits: 0,
            mfu_hits: 0,
            mfu_ghost_hits: 0,
        }
    }
}

/// The L2 part of a header: present while the block owns a slot on a
/// cache device.
#[derive(Debug)]
pub struct L2Hdr {
    pub dev: Weak<L2Device>,
    /// Byte offset of the payload on the device.
    pub daddr: u64,
    /// Allocated (ashift-aligned) size on the device.
    pub asize: u32,
    pub hits: u32,
    /// Snapshot of the L1 state at feed time, persisted in log entries and
    /// kept meaningful after the L1 part is gone.
    pub arcs_state: StateKind,
    /// Key into the device buflist arena.
    pub node: Option<usize>,
}

/// The mutable core of a header, guarded by its mutex; the locking
/// protocol additionally requires the hash bucket lock for any mutation
/// that a concurrent hash lookup could observe.
#[derive(Debug)]
pub struct HdrCore {
    pub ident: BlkIdentity,
    pub psize: u32,
    pub lsize: u32,
    pub compress: Compression,
    pub complevel: u8,
    pub byteswap: bool,
    pub crypt: Option<CryptParams>,
    pub l1: Option<Box<L1Hdr>>,
    pub l2: Option<L2Hdr>,
}

impl HdrCore {
    /// Returns the L1 part.
    ///
    /// # Panics
    ///
    /// Panics if the header has no L1 part.
    pub fn l1(&self) -> &L1Hdr {
        self.l1.as_ref().expect("header has no L1 part")
    }

    /// Returns the L1 part mutably.
    ///
    /// # Panics
    ///
    /// Panics if the header has no L1 part.
    pub fn l1_mut(&mut self) -> &mut L1Hdr {
        self.l1.as_mut().expect("header has no L1 part")
    }

    /// Returns the current state, `L2cOnly` when no L1 part exists.
    pub fn state(&self) -> StateKind {
        self.l1
            .as_ref()
            .map(|l1| l1.state)
            .unwrap_or(StateKind::L2cOnly)
    }

    /// Bytes of in-memory payload this header contributes to its live
    /// state: physical and raw payloads plus owned consumer buffers.
    pub fn l1_payload_size(&self) -> u64 {
        let Some(l1) = self.l1.as_ref() else {
            return 0;
        };
        let mut total = 0u64;
        if let Some(pabd) = &l1.pabd {
            total += pabd.len() as u64;
        }
        if let Some(rabd) = &l1.rabd {
            total += rabd.len() as u64;
        }
        for entry in &l1.bufs {
            if let BufPayload::Owned(abd) = &entry.payload {
                total += abd.len() as u64;
            }
        }
        total
    }
}

/// A cache buffer header.
pub struct BufHdr {
    spa: u64,
    blk_type: BlkType,
    flags: AtomicU32,
    refcnt: TaggedRefcount,
    core: Mutex<HdrCore>,
    /// Signalled when an in-flight read completes.
    io_done: CvarMutex<u64>,
    io_cv: Condvar,
}

impl BufHdr {
    pub fn spa(&self) -> u64 {
        self.spa
    }

    pub fn blk_type(&self) -> BlkType {
        self.blk_type
    }

    pub fn refcnt(&self) -> &TaggedRefcount {
        &self.refcnt
    }

    /// Locks the mutable core.
    pub fn core(&self) -> MutexGuard<'_, HdrCore> {
        self.core.lock()
    }

    /// Attempts to lock the mutable core without blocking.
    pub fn try_core(&self) -> Option<MutexGuard<'_, HdrCore>> {
        self.core.try_lock()
    }

    pub fn flags(&self) -> HdrFlags {
        HdrFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn test_flags(&self, f: HdrFlags) -> bool {
        self.flags().intersects(f)
    }

    pub fn set_flags(&self, f: HdrFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, f: HdrFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    /// Adds a tagged reference; the caller is responsible for the
    /// evictability side effects (see `state::add_ref`).
    pub(super) fn refcnt_add(&self, tag: RefTag) -> u64 {
        self.refcnt.add(tag)
    }

    pub(super) fn refcnt_remove(&self, tag: RefTag) -> u64 {
        self.refcnt.remove(tag)
    }

    /// Advances the I/O generation and wakes anyone parked on this
    /// header's completion.
    pub(super) fn signal_io_done(&self) {
        *self.io_done.lock().unwrap() += 1;
        self.io_cv.notify_all();
    }
}

impl Debug for BufHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufHdr")
            .field("spa", &self.spa)
            .field("blk_type", &self.blk_type)
            .field("flags", &self.flags())
            .field("refcnt", &self.refcnt.count())
            .finish_non_exhaustive()
    }
}

/// Parameters for allocating a full (L1-present) header.
pub struct HdrAlloc {
    pub spa: u64,
    pub blk_type: BlkType,
    pub psize: u32,
    pub lsize: u32,
    pub compress: Compression,
    pub complevel: u8,
    pub byteswap: bool,
    pub crypt: Option<CryptParams>,
    pub flags: HdrFlags,
}

/// Allocates an anonymous full header in the `Anon` state.
pub fn alloc_full(a: HdrAlloc) -> Arc<BufHdr> {
    let mut flags = a.flags | HdrFlags::HAS_L1;
    if a.crypt.is_some() {
        flags |= HdrFlags::PROTECTED;
    }
    Arc::new(BufHdr {
        spa: a.spa,
        blk_type: a.blk_type,
        flags: AtomicU32::new(flags.bits()),
        refcnt: TaggedRefcount::new(),
        core: Mutex::new(HdrCore {
            ident: BlkIdentity::ANON,
            psize: a.psize,
            lsize: a.lsize,
            compress: a.compress,
            complevel: a.complevel,
            byteswap: a.byteswap,
            crypt: a.crypt,
            l1: Some(Box::new(L1Hdr::new(StateKind::Anon))),
            l2: None,
        }),
        io_done: CvarMutex::new(0),
        io_cv: Condvar::new(),
    })
}

/// Allocates a minimal L2-only header, used during rebuild.
#[allow(clippy::too_many_arguments)]
pub fn alloc_l2only(
    a: HdrAlloc,
    ident: BlkIdentity,
    dev: &Arc<L2Device>,
    daddr: u64,
    asize: u32,
    arcs_state: StateKind,
) -> Arc<BufHdr> {
    let flags = (a.flags | HdrFlags::HAS_L2) - HdrFlags::HAS_L1;
    Arc::new(BufHdr {
        spa: a.spa,
        blk_type: a.blk_type,
        flags: AtomicU32::new(flags.bits()),
        refcnt: TaggedRefcount::new(),
        core: Mutex::new(HdrCore {
            ident,
            psize: a.psize,
            lsize: a.lsize,
            compress: a.compress,
            complevel: a.complevel,
            byteswap: a.byteswap,
            crypt: a.crypt,
            l1: None,
            l2: Some(L2Hdr {
                dev: Arc::downgrade(dev),
                daddr,
                asize,
                hits: 0,
                arcs_state,
                node: None,
            }),
        }),
        io_done: CvarMutex::new(0),
        io_cv: Condvar::new(),
    })
}

/// Attaches an L1 part to an L2-only header, promoting it to the full
/// variant in the given state.
pub fn promote_to_full(hdr: &BufHdr, core: &mut HdrCore, state: StateKind) {
    debug_assert!(core.l1.is_none());
    core.l1 = Some(Box::new(L1Hdr::new(state)));
    hdr.set_flags(HdrFlags::HAS_L1);
}

/// Releases the L1 part of a header, demoting it to the small L2-only
/// variant. The L1 payload must already have been dropped and accounted.
pub fn demote_to_l2only(hdr: &BufHdr, core: &mut HdrCore) {
    let l1 = core.l1.take().expect("demoting a header without L1");
    debug_assert!(l1.pabd.is_none() && l1.rabd.is_none());
    debug_assert!(l1.bufs.is_empty() && l1.acbs.is_empty());
    debug_assert!(l1.node.is_none());
    debug_assert!(core.l2.is_some());
    hdr.clear_flags(HdrFlags::HAS_L1 | HdrFlags::SHARED_DATA);
}

/// In-memory footprint of the full header variant, used for the
/// eviction engine's real-bytes accounting.
pub fn hdr_full_size() -> u64 {
    (core::mem::size_of::<BufHdr>() + core::mem::size_of::<L1Hdr>()) as u64
}

/// In-memory footprint of the L2-only header variant.
pub fn hdr_l2only_size() -> u64 {
    core::mem::size_of::<BufHdr>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_alloc() -> HdrAlloc {
        HdrAlloc {
            spa: 1,
            blk_type: BlkType::Data,
            psize: 4096,
            lsize: 4096,
            compress: Compression::Off,
            complevel: 0,
            byteswap: false,
            crypt: None,
            flags: HdrFlags::empty(),
        }
    }

    #[test]
    fn anon_identity_and_flags() {
        let hdr = alloc_full(test_alloc());
        assert!(hdr.core().ident.is_anon());
        assert!(hdr.test_flags(HdrFlags::HAS_L1));
        assert!(!hdr.test_flags(HdrFlags::IN_HASH));
        assert_eq!(hdr.core().state(), StateKind::Anon);
    }

    #[test]
    fn identity_hash_varies_by_guid() {
        let ident = BlkIdentity {
            dva: Dva([0x10, 0x20]),
            birth: 7,
        };
        assert_ne!(identity_hash(1, &ident), identity_hash(2, &ident));
    }

    #[test]
    fn payload_size_counts_owned_only() {
        let hdr = alloc_full(test_alloc());
        let mut core = hdr.core();
        core.l1_mut().pabd = Some(Abd::alloc(4096).unwrap());
        core.l1_mut().bufs.push(BufEntry {
            id: 1,
            payload: BufPayload::SharedWithHdr,
            compressed: false,
            encrypted: false,
        });
        core.l1_mut().bufs.push(BufEntry {
            id: 2,
            payload: BufPayload::Owned(Abd::alloc(4096).unwrap()),
            compressed: false,
            encrypted: false,
        });
        assert_eq!(core.l1_payload_size(), 8192);
    }

    #[test]
    fn bp_verify_rejects_bad_sizes() {
        let bp = BlockPtr {
            dva: Dva([1, 0]),
            birth: 1,
            lsize: 512,
            psize: 1024,
            compress: Compression::Lz4,
            complevel: 0,
            blk_type: BlkType::Data,
            byteswap: false,
            crypt: None,
            embedded: None,
            hole: false,
        };
        assert!(bp.verify().is_err());
    }
}
