// SPDX-License-Identifier: MPL-2.0

//! The read path.
//!
//! A read resolves against the hash table under the bucket lock: a hit
//! with data fills a consumer buffer in place; a hit on an in-flight
//! header joins its callback list; anything else allocates (or promotes)
//! a header, marks it in-flight and issues the physical read, preferring
//! a live second-level device over the primary pool. Completion runs
//! under the bucket lock again, attaches the payload, then fires the
//! accumulated callbacks outside all locks.

use bitflags::bitflags;

use super::{
    buf::{ArcBuf, FillKind},
    hdr::{self, BlkIdentity, BlockPtr, BufHdr, HdrFlags},
    state::StateKind,
    ArcInner,
};
use crate::{
    layers::{bio::Abd, codec},
    os::{Condvar, CvarMutex},
    prelude::*,
    util::RefTag,
};

bitflags! {
    /// Caller-supplied read behavior.
    pub struct ReadFlags: u32 {
        /// Block until the data is resident; callbacks fire before return.
        const WAIT               = 1 << 0;
        /// Predictive prefetch: no promotion credit, short lifespan floor.
        const PREFETCH           = 1 << 1;
        /// Prescient prefetch: known-future access, longer floor.
        const PRESCIENT_PREFETCH = 1 << 2;
        /// Block is indirect (metadata chain).
        const INDIRECT           = 1 << 3;
        /// Eligible for the second-level cache.
        const L2CACHE            = 1 << 4;
        /// One-shot data: admit to the uncached state.
        const UNCACHED           = 1 << 5;
        /// Serve only if resident; never issue I/O.
        const CACHED_ONLY        = 1 << 6;
        /// Return the payload as stored (compressed and/or encrypted).
        const RAW                = 1 << 7;
        /// Skip authentication for objects that carry none.
        const NOAUTH             = 1 << 8;
        /// Low-priority asynchronous read.
        const PRIO_ASYNC_READ    = 1 << 9;
    }
}

/// The buffer-delivery callback of one read.
pub type ReadDone = Box<dyn FnOnce(Result<ArcBuf>) + Send + 'static>;

/// Synchronization for `WAIT` joiners of an in-flight read.
#[derive(Debug)]
pub(super) struct AcbWaiter {
    fired: CvarMutex<bool>,
    cv: Condvar,
}

impl AcbWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: CvarMutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn fire(&self) {
        *self.fired.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cv.wait(fired).unwrap();
        }
    }
}

/// One pending read callback attached to an in-flight header.
pub struct AcbEntry {
    pub(super) done: Option<ReadDone>,
    pub(super) kind: FillKind,
    pub(super) tag: RefTag,
    pub(super) waiter: Option<Arc<AcbWaiter>>,
}

impl Debug for AcbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcbEntry")
            .field("kind", &self.kind)
            .field("waiting", &self.waiter.is_some())
            .finish_non_exhaustive()
    }
}

/// What kind of access this is, for the hit/miss statistics.
#[derive(Clone, Copy)]
enum AccessKind {
    Hit,
    IoHit,
    Miss,
}

fn fill_kind(bp: &BlockPtr, flags: ReadFlags) -> FillKind {
    if flags.contains(ReadFlags::RAW) {
        if bp.is_protected() {
            return FillKind {
                want_compressed: false,
                want_encrypted: true,
            };
        }
        if bp.compress != codec::Compression::Off {
            return FillKind {
                want_compressed: true,
                want_encrypted: false,
            };
        }
    }
    FillKind::default()
}

impl ArcInner {
    /// The demand-read entry point. `done` is invoked exactly once with
    /// the resulting buffer or the read's error; with `WAIT` that happens
    /// before this function returns.
    pub(super) fn read_impl(
        &self,
        spa: u64,
        bp: &BlockPtr,
        flags: ReadFlags,
        tag: RefTag,
        done: ReadDone,
    ) -> Result<()> {
        bp.verify()?;

        // Embedded payloads live in the pointer itself and bypass the
        // cache entirely.
        if bp.embedded.is_some() {
            return self.read_embedded(spa, bp, flags, tag, done);
        }

        let ident = bp.identity();
        let kind = fill_kind(bp, flags);

        loop {
            let found = self.table.find(spa, &ident);
            let (hdr, mut bucket) = match found {
                Some(pair) => pair,
                None => {
                    if flags.contains(ReadFlags::CACHED_ONLY) {
                        let err = Error::with_msg(NotFound, "block not resident");
                        done(Err(err.clone()));
                        return Err(err);
                    }
                    // Allocate a header and race it into the table.
                    let hdr = self.alloc_hdr_for_bp(spa, bp, flags);
                    hdr.core().ident = ident;
                    let mut bucket = self.table.lock_bucket(spa, &ident);
                    if self.table.insert(&hdr, &mut bucket, &self.stats).is_some() {
                        // Lost the race; retry against the winner.
                        self.discard_unused_hdr(&hdr);
                        continue;
                    }
                    (hdr, bucket)
                }
            };

            let mut core = hdr.core();

            if hdr.test_flags(HdrFlags::IO_IN_PROGRESS) {
                if flags.contains(ReadFlags::CACHED_ONLY) {
                    drop(core);
                    drop(bucket);
                    let err = Error::with_msg(NotFound, "block not resident");
                    done(Err(err.clone()));
                    return Err(err);
                }
                // Join the in-flight read. A demand read upgrades the
                // priority of an asynchronous one.
                if hdr.test_flags(HdrFlags::PRIO_ASYNC_READ)
                    && !flags.contains(ReadFlags::PRIO_ASYNC_READ)
                {
                    hdr.clear_flags(HdrFlags::PRIO_ASYNC_READ);
                }
                self.bump_access_stats(&hdr, flags, AccessKind::IoHit);
                self.access(&hdr, &mut core, flags, false);
                let waiter = flags.contains(ReadFlags::WAIT).then(AcbWaiter::new);
                core.l1_mut().acbs.push(AcbEntry {
                    done: Some(done),
                    kind,
                    tag,
                    waiter: waiter.clone(),
                });
                drop(core);
                drop(bucket);
                if let Some(waiter) = waiter {
                    waiter.wait();
                }
                return Ok(());
            }

            let has_data = core
                .l1
                .as_ref()
                .map(|l1| l1.pabd.is_some() || l1.rabd.is_some())
                .unwrap_or(false);

            if has_data {
                self.bump_access_stats(&hdr, flags, AccessKind::Hit);
                self.access(&hdr, &mut core, flags, true);
                let result = self.alloc_buf_impl(&hdr, &mut core, tag, kind);
                drop(core);
                drop(bucket);
                let result = result.map_err(|e| self.convert_fill_error(spa, &ident, e));
                let ret = result.as_ref().err().cloned();
                done(result);
                return match ret {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            // Hit without data (ghost or L2-only) or fresh miss: promote
            // and issue the physical read.
            if flags.contains(ReadFlags::CACHED_ONLY) {
                drop(core);
                drop(bucket);
                let err = Error::with_msg(NotFound, "block not resident");
                done(Err(err.clone()));
                return Err(err);
            }
            if core.l1.is_none() {
                hdr::promote_to_full(&hdr, &mut core, StateKind::L2cOnly);
            }
            // Restored headers carry no encryption parameters; adopt them
            // from the pointer that is naming the block now.
            if core.crypt.is_none() && bp.crypt.is_some() {
                core.crypt = bp.crypt.clone();
                hdr.set_flags(HdrFlags::PROTECTED);
            }
            if flags.contains(ReadFlags::PRIO_ASYNC_READ) {
                hdr.set_flags(HdrFlags::PRIO_ASYNC_READ);
            }
            hdr.set_flags(HdrFlags::IO_IN_PROGRESS);
            super::state::add_ref(&self.states, &hdr, &mut core, IO_TAG);
            self.bump_access_stats(&hdr, flags, AccessKind::Miss);
            self.access(&hdr, &mut core, flags, false);

            let waiter = flags.contains(ReadFlags::WAIT).then(AcbWaiter::new);
            core.l1_mut().acbs.push(AcbEntry {
                done: Some(done),
                kind,
                tag,
                waiter: waiter.clone(),
            });

            // Prefer a live cache device that still holds the range.
            let l2_route = self.l2_route(&hdr, &core);
            if l2_route.is_some() {
                hdr.set_flags(HdrFlags::L2_READING);
            }
            drop(core);
            drop(bucket);

            let inner = self.strong();
            let hdr_for_io = hdr.clone();
            let bp_for_io = bp.clone();
            let io = move || {
                let result = inner.physical_read(&hdr_for_io, &bp_for_io, l2_route);
                inner.read_done(&hdr_for_io, spa, result);
            };
            if flags.contains(ReadFlags::WAIT) {
                io();
                if let Some(waiter) = waiter {
                    waiter.wait();
                }
            } else {
                self.io_pool.execute(io);
            }
            return Ok(());
        }
    }

    /// Decodes an embedded block pointer synchronously.
    fn read_embedded(
        &self,
        spa: u64,
        bp: &BlockPtr,
        flags: ReadFlags,
        tag: RefTag,
        done: ReadDone,
    ) -> Result<()> {
        let payload = bp.embedded.as_ref().unwrap();
        let hdr = self.alloc_hdr_for_bp(spa, bp, flags);
        {
            let mut core = hdr.core();
            let pabd = match Abd::from_slice(payload) {
                Ok(abd) => abd,
                Err(e) => {
                    done(Err(e.clone()));
                    return Err(e);
                }
            };
            self.account_payload(&hdr, StateKind::Anon, pabd.len() as i64);
            core.l1_mut().pabd = Some(pabd);
        }
        self.stats.hits.inc();
        let mut core = hdr.core();
        let result = self.alloc_buf_impl(&hdr, &mut core, tag, fill_kind(bp, flags));
        drop(core);
        let ret = result.as_ref().err().cloned();
        done(result);
        match ret {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Builds a fresh anonymous header matching a block pointer.
    fn alloc_hdr_for_bp(&self, spa: u64, bp: &BlockPtr, flags: ReadFlags) -> Arc<BufHdr> {
        let mut hflags = HdrFlags::empty();
        if self.tunables.compressed_arc_enabled && bp.compress != codec::Compression::Off {
            hflags |= HdrFlags::COMPRESSED_ARC;
        }
        if flags.contains(ReadFlags::L2CACHE) {
            hflags |= HdrFlags::L2CACHE;
        }
        if flags.contains(ReadFlags::UNCACHED) {
            hflags |= HdrFlags::UNCACHED;
        }
        if flags.contains(ReadFlags::NOAUTH) {
            hflags |= HdrFlags::NOAUTH;
        }
        if flags.contains(ReadFlags::INDIRECT) {
            hflags |= HdrFlags::INDIRECT;
        }
        hdr::alloc_full(hdr::HdrAlloc {
            spa,
            blk_type: bp.blk_type,
            psize: bp.psize,
            lsize: bp.lsize,
            compress: bp.compress,
            complevel: bp.complevel,
            byteswap: bp.byteswap,
            crypt: bp.crypt.clone(),
            flags: hflags,
        })
    }

    /// Frees a header that lost an insertion race before becoming
    /// discoverable.
    fn discard_unused_hdr(&self, hdr: &Arc<BufHdr>) {
        debug_assert!(!hdr.test_flags(HdrFlags::IN_HASH));
        debug_assert!(hdr.refcnt().is_zero());
    }

    /// Picks the L2 device route for a miss, if any.
    fn l2_route(
        &self,
        hdr: &Arc<BufHdr>,
        core: &hdr::HdrCore,
    ) -> Option<(Arc<crate::layers::l2::L2Device>, u64, u32)> {
        let l2 = core.l2.as_ref()?;
        let dev = l2.dev.upgrade()?;
        if !dev.is_alive() {
            return None;
        }
        if hdr.test_flags(HdrFlags::L2_WRITING | HdrFlags::L2_EVICTED) {
            self.stats.l2_rw_clash.inc();
            return None;
        }
        if !dev.range_holds(l2.daddr, l2.asize as u64) {
            return None;
        }
        Some((dev, l2.daddr, core.psize))
    }

    /// Issues the physical read, falling back from the cache device to
    /// the primary pool on any device-side failure.
    fn physical_read(
        &self,
        hdr: &Arc<BufHdr>,
        bp: &BlockPtr,
        l2_route: Option<(Arc<crate::layers::l2::L2Device>, u64, u32)>,
    ) -> Result<Vec<u8>> {
        if let Some((dev, daddr, psize)) = l2_route {
            let mut out = alloc::vec![0u8; psize as usize];
            match dev.read_payload(daddr, &mut out) {
                Ok(()) if !hdr.test_flags(HdrFlags::L2_EVICTED) => {
                    self.stats.l2_hits.inc();
                    self.stats.l2_read_bytes.add(psize as i64);
                    let mut core = hdr.core();
                    if let Some(l2) = core.l2.as_mut() {
                        l2.hits += 1;
                    }
                    return Ok(out);
                }
                Ok(()) => {
                    // Evicted while we were reading: the bytes may belong
                    // to a newer tenant of that slot.
                    self.stats.l2_evict_reading.inc();
                }
                Err(_) => {
                    self.stats.l2_io_error.inc();
                }
            }
            self.stats.l2_misses.inc();
        }

        let mut out = alloc::vec![0u8; bp.psize as usize];
        self.pool.read_phys(bp, &mut out)?;
        Ok(out)
    }

    /// Read completion: attaches the payload, clears the in-flight mark,
    /// fills every queued callback and fires them outside the locks.
    fn read_done(&self, hdr: &Arc<BufHdr>, spa: u64, result: Result<Vec<u8>>) {
        let ident = hdr.core().ident;
        let mut bucket = self.table.lock_bucket(spa, &ident);
        let mut core = hdr.core();
        hdr.clear_flags(HdrFlags::L2_READING);

        let attach_result = result.and_then(|bytes| self.attach_payload(hdr, &mut core, bytes));

        let mut acbs = core::mem::take(&mut core.l1_mut().acbs);
        let mut deliveries: Vec<(ReadDone, Result<ArcBuf>, Option<Arc<AcbWaiter>>)> = Vec::new();

        match &attach_result {
            Ok(()) => {
                hdr.clear_flags(HdrFlags::IO_IN_PROGRESS);
                for acb in acbs.iter_mut() {
                    let fill = self
                        .alloc_buf_impl(hdr, &mut core, acb.tag, acb.kind)
                        .map_err(|e| self.convert_fill_error(spa, &ident, e));
                    deliveries.push((acb.done.take().unwrap(), fill, acb.waiter.take()));
                }
            }
            Err(e) => {
                hdr.set_flags(HdrFlags::IO_ERROR);
                hdr.clear_flags(HdrFlags::IO_IN_PROGRESS);
                error!("read of {:?} failed: {}", ident, e);
                for acb in acbs.iter_mut() {
                    deliveries.push((acb.done.take().unwrap(), Err(e.clone()), acb.waiter.take()));
                }
            }
        }

        let remaining = super::state::remove_ref(&self.states, hdr, &mut core, IO_TAG);
        if attach_result.is_err() && remaining == 0 {
            // A failed read leaves nothing worth keeping.
            super::state::change_state(&self.states, &self.sizer, hdr, &mut core, StateKind::Anon);
            self.destroy_hdr(hdr, &mut core, Some(&mut bucket));
        }
        drop(core);
        drop(bucket);

        hdr.signal_io_done();
        for (done, fill, waiter) in deliveries {
            done(fill);
            if let Some(waiter) = waiter {
                waiter.fire();
            }
        }
    }

    /// Stores freshly read bytes on the header in the representation the
    /// header was configured for.
    fn attach_payload(
        &self,
        hdr: &Arc<BufHdr>,
        core: &mut hdr::HdrCore,
        bytes: Vec<u8>,
    ) -> Result<()> {
        if bytes.len() != core.psize as usize {
            return_errno_with_msg!(IoFailed, "physical read returned a short payload");
        }
        let state = core.state();
        if hdr.test_flags(HdrFlags::PROTECTED) {
            let rabd = Abd::from_slice(&bytes)?;
            self.account_payload(hdr, state, rabd.len() as i64);
            core.l1_mut().rabd = Some(rabd);
            return Ok(());
        }
        let pabd = if hdr.test_flags(HdrFlags::COMPRESSED_ARC)
            || core.compress == codec::Compression::Off
        {
            Abd::from_slice(&bytes)?
        } else {
            // Uncompressed-in-memory policy: decode now, cache decoded.
            let mut out = Abd::alloc(core.lsize as usize)?;
            codec::decompress(core.compress, &bytes, out.as_mut_slice())?;
            core.compress = codec::Compression::Off;
            core.psize = core.lsize;
            out
        };
        self.account_payload(hdr, state, pabd.len() as i64);
        core.l1_mut().pabd = Some(pabd);
        Ok(())
    }

    /// Authentication failures surface as checksum errors from the fill
    /// path; the API boundary reports and converts them to I/O errors.
    /// Key absence passes through as a permission problem.
    fn convert_fill_error(&self, spa: u64, ident: &BlkIdentity, e: Error) -> Error {
        if e.errno() == MacMismatched {
            error!(
                "authentication failed for {:?} in pool {:#x}: {}",
                ident, spa, e
            );
            return Error::with_msg(IoFailed, "payload failed authentication");
        }
        e
    }

    fn bump_access_stats(&self, hdr: &Arc<BufHdr>, flags: ReadFlags, kind: AccessKind) {
        let prefetch =
            flags.intersects(ReadFlags::PREFETCH | ReadFlags::PRESCIENT_PREFETCH);
        let meta = hdr.blk_type() == hdr::BlkType::Metadata;
        match kind {
            AccessKind::Hit => {
                self.stats.hits.inc();
                match (prefetch, meta) {
                    (false, false) => self.stats.demand_data_hits.inc(),
                    (false, true) => self.stats.demand_metadata_hits.inc(),
                    (true, false) => self.stats.prefetch_data_hits.inc(),
                    (true, true) => self.stats.prefetch_metadata_hits.inc(),
                }
            }
            AccessKind::IoHit => self.stats.iohits.inc(),
            AccessKind::Miss => {
                self.stats.misses.inc();
                match (prefetch, meta) {
                    (false, false) => self.stats.demand_data_misses.inc(),
                    (false, true) => self.stats.demand_metadata_misses.inc(),
                    (true, false) => self.stats.prefetch_data_misses.inc(),
                    (true, true) => self.stats.prefetch_metadata_misses.inc(),
                }
            }
        }
    }
}

/// The reference tag held by in-flight I/O.
pub(super) const IO_TAG: RefTag = RefTag("arc-io");
