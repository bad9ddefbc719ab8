// SPDX-License-Identifier: MPL-2.0

//! Per-device state of the second-level cache.
//!
//! The device is used as a ring: `hand` is the next write offset, `evict`
//! the offset up to which prior-epoch content has been invalidated ahead
//! of the hand. Until the first wrap the whole tail of the device is
//! virgin and nothing needs invalidation.
//!
//! # Locking
//!
//! The device mutex protects the rotary cursors, the buffer list, the
//! log-block pointer list and the accumulating log block. It sits above
//! the hash bucket locks in the ordering: a thread holding the device
//! mutex may only *try* a bucket lock (dropping the device mutex and
//! restarting on failure), while a thread holding a bucket lock may block
//! on the device mutex.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytemuck::Zeroable;

use super::log_blk::{
    dev_hdr_asize, DeviceHeaderPhys, LogBlkPtrPhys, LogBlockPhys, TrimState, DH_FLAG_WRAPPED,
};
use crate::{
    layers::{
        bio::BlockSet,
        cache::{
            hdr::{HdrFlags, L2Hdr},
            multilist::{LinkedArena, ListPayload},
            ArcInner,
        },
    },
    os::{Mutex, MutexGuard},
    prelude::*,
};

/// The accumulating in-memory log block.
pub(super) struct LogBlkBuilder {
    pub lb: Box<LogBlockPhys>,
    pub idx: usize,
    pub payload_start: u64,
    pub payload_asize: u64,
}

impl LogBlkBuilder {
    fn new() -> Self {
        Self {
            lb: Box::new(LogBlockPhys::empty()),
            idx: 0,
            payload_start: 0,
            payload_asize: 0,
        }
    }

    pub(super) fn reset(&mut self) {
        *self.lb = LogBlockPhys::empty();
        self.idx = 0;
        self.payload_start = 0;
        self.payload_asize = 0;
    }
}

/// Mutable device state under the device mutex.
pub(super) struct L2DevInner {
    pub hand: u64,
    pub evict: u64,
    pub first: bool,
    /// Every header this device backs; head = most recently written.
    pub buflist: LinkedArena,
    /// Every reachable log-block pointer; front = most recently written.
    pub lbptrs: VecDeque<LogBlkPtrPhys>,
    pub builder: LogBlkBuilder,
    pub dev_hdr: DeviceHeaderPhys,
    pub trim_state: TrimState,
}

/// One attached cache device.
pub struct L2Device {
    spa_guid: u64,
    vdev_guid: u64,
    storage: Arc<dyn BlockSet>,
    ashift: u32,
    start: u64,
    end: u64,
    log_entries: usize,
    alive: AtomicBool,
    rebuilding: AtomicBool,
    inner: Mutex<L2DevInner>,
    /// Logical bytes of all backed headers.
    l2_size: AtomicU64,
    /// Allocated device bytes of all backed headers.
    l2_asize: AtomicU64,
}

impl L2Device {
    /// Creates the in-memory state for a cache device. `log_entries`
    /// bounds entries per log block (the on-disk maximum in production;
    /// smaller in tests to exercise commits cheaply).
    pub(super) fn create(
        spa_guid: u64,
        vdev_guid: u64,
        storage: Arc<dyn BlockSet>,
        ashift: u32,
        log_entries: usize,
    ) -> Result<Arc<Self>> {
        let start = dev_hdr_asize(ashift) as u64;
        let end = (storage.nsectors() * SECTOR_SIZE) as u64;
        if end <= start * 2 {
            return_errno_with_msg!(InvalidArgs, "cache device too small");
        }
        let mut dev_hdr = DeviceHeaderPhys::new(spa_guid, vdev_guid, start, end);
        dev_hdr.log_entries = log_entries as u64;
        Ok(Arc::new(Self {
            spa_guid,
            vdev_guid,
            storage,
            ashift,
            start,
            end,
            log_entries,
            alive: AtomicBool::new(true),
            rebuilding: AtomicBool::new(false),
            inner: Mutex::new(L2DevInner {
                hand: start,
                evict: start,
                first: true,
                buflist: LinkedArena::new(),
                lbptrs: VecDeque::new(),
                builder: LogBlkBuilder::new(),
                dev_hdr,
                trim_state: TrimState::None,
            }),
            l2_size: AtomicU64::new(0),
            l2_asize: AtomicU64::new(0),
        }))
    }

    pub fn spa_guid(&self) -> u64 {
        self.spa_guid
    }

    pub fn vdev_guid(&self) -> u64 {
        self.vdev_guid
    }

    pub fn ashift(&self) -> u32 {
        self.ashift
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub(super) fn log_entries(&self) -> usize {
        self.log_entries
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(super) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    pub(super) fn set_rebuilding(&self, v: bool) {
        self.rebuilding.store(v, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.l2_size.load(Ordering::Acquire)
    }

    pub fn asize(&self) -> u64 {
        self.l2_asize.load(Ordering::Acquire)
    }

    pub(super) fn storage(&self) -> &Arc<dyn BlockSet> {
        &self.storage
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, L2DevInner> {
        self.inner.lock()
    }

    /// Allocated size of a payload on this device.
    pub fn asize_of(&self, psize: u32) -> u64 {
        align_up(psize as usize, 1 << self.ashift) as u64
    }

    /// Whether bytes at `daddr` belong to the live window of the ring.
    fn addr_live(inner: &L2DevInner, start: u64, end: u64, daddr: u64, len: u64) -> bool {
        if daddr < start || daddr + len > end {
            return false;
        }
        if inner.first {
            daddr + len <= inner.hand
        } else {
            daddr + len <= inner.hand || daddr >= inner.evict
        }
    }

    /// Whether a read of `len` bytes at `daddr` can still be served.
    pub fn range_holds(&self, daddr: u64, len: u64) -> bool {
        let inner = self.inner.lock();
        Self::addr_live(&inner, self.start, self.end, daddr, len)
    }

    /// Reads a payload from the device.
    pub fn read_payload(&self, daddr: u64, out: &mut [u8]) -> Result<()> {
        self.storage.read_slice(daddr as usize, out)
    }

    /// Accounts a newly attached header.
    pub(super) fn note_hdr(&self, lsize: u32, asize: u64) {
        self.l2_size.fetch_add(lsize as u64, Ordering::AcqRel);
        self.l2_asize.fetch_add(asize, Ordering::AcqRel);
    }

    /// Severs a header's association (hash-lock side): unlinks the
    /// buflist node and returns the accounting.
    pub(crate) fn forget_hdr(&self, l2: &L2Hdr, lsize: u32, _psize: u32) {
        let mut inner = self.inner.lock();
        if let Some(key) = l2.node {
            let _ = inner.buflist.remove(key);
        }
        self.l2_size.fetch_sub(lsize as u64, Ordering::AcqRel);
        self.l2_asize.fetch_sub(l2.asize as u64, Ordering::AcqRel);
    }

    /// Trims the write window ahead of the hand, persisting trim
    /// progress before and after so an interrupted trim is detectable at
    /// rebuild.
    pub(super) fn trim_ahead(&self, window: u64) {
        let mut inner = self.inner.lock();
        let from = inner.hand;
        let to = (from + window).min(self.end);
        if to <= from {
            return;
        }
        inner.trim_state = TrimState::InProgress;
        let _ = self.write_dev_hdr(&mut inner);
        let res = self
            .storage
            .trim(from as usize / SECTOR_SIZE..to as usize / SECTOR_SIZE);
        inner.trim_state = if res.is_ok() {
            TrimState::Complete
        } else {
            TrimState::None
        };
        let _ = self.write_dev_hdr(&mut inner);
    }

    /// Persists the device header.
    pub(super) fn write_dev_hdr(&self, inner: &mut L2DevInner) -> Result<()> {
        inner.dev_hdr.evict = inner.evict;
        inner.dev_hdr.flags = if inner.first { 0 } else { DH_FLAG_WRAPPED };
        inner.dev_hdr.trim_state = inner.trim_state as u32;
        let bytes = inner.dev_hdr.encode(dev_hdr_asize(self.ashift));
        self.storage.write_slice(0, &bytes)?;
        self.storage.flush()
    }

    /// Invalidates `distance` bytes ahead of the write hand (everything
    /// when `all`), dropping overlapped log-block pointers and headers.
    /// Wrapping past the device end resets the ring and re-runs once.
    pub(crate) fn evict_bytes(&self, arc: &ArcInner, distance: u64, all: bool) {
        'epoch: loop {
            let mut inner = self.inner.lock();

            if !all && inner.hand + distance > self.end {
                // The window passes the device end: wrap the ring first,
                // then invalidate ahead of the new hand position.
                inner.hand = self.start;
                inner.evict = self.start;
                inner.first = false;
                debug!("cache device {:#x} write hand wrapped", self.vdev_guid);
                drop(inner);
                continue 'epoch;
            }

            if inner.first && !all {
                // Virgin tail ahead; nothing to invalidate yet.
                return;
            }

            let taddr = if all {
                self.end
            } else {
                inner.hand + distance
            };

            // Drop log-block pointers whose blocks fall inside the
            // invalidated window, oldest first.
            while let Some(oldest) = inner.lbptrs.back().copied() {
                let dead = all || (oldest.daddr >= inner.evict && oldest.daddr < taddr);
                if !dead {
                    break;
                }
                inner.lbptrs.pop_back();
                inner.dev_hdr.lb_count = inner.dev_hdr.lb_count.saturating_sub(1);
                inner.dev_hdr.lb_asize =
                    inner.dev_hdr.lb_asize.saturating_sub(oldest.asize());
                arc.stats.l2_log_blk_count.add(-1);
            }
            if inner.lbptrs.is_empty() {
                inner.dev_hdr.start_lbps = [LogBlkPtrPhys::zeroed(); 2];
            }

            // Walk the buffer list from the oldest end.
            loop {
                let Some(tail_key) = inner.buflist.tail() else {
                    break;
                };
                let hdr = match inner.buflist.payload(tail_key) {
                    ListPayload::Hdr(hdr) => hdr.clone(),
                    ListPayload::Marker(_) => unreachable!("marker on a device buflist"),
                };

                let Some(peek) = hdr.try_core() else {
                    drop(inner);
                    arc.stats.l2_evict_lock_retry.inc();
                    std::thread::yield_now();
                    continue 'epoch;
                };
                let ident = peek.ident;
                let (daddr, hdr_asize) = match peek.l2.as_ref() {
                    Some(l2) => (l2.daddr, l2.asize as u64),
                    None => {
                        // Stale node; already severed elsewhere.
                        drop(peek);
                        inner.buflist.remove(tail_key);
                        continue;
                    }
                };
                drop(peek);

                if !all && daddr >= taddr {
                    // Everything newer lives beyond the window.
                    break;
                }

                let Some(mut bucket) = arc.table.try_lock_bucket(hdr.spa(), &ident) else {
                    drop(inner);
                    arc.stats.l2_evict_lock_retry.inc();
                    std::thread::yield_now();
                    continue 'epoch;
                };
                let mut core = hdr.core();
                if core.ident != ident || core.l2.is_none() {
                    // Stale node; drop it and move on.
                    inner.buflist.remove(tail_key);
                    continue;
                }

                inner.buflist.remove(tail_key);
                let lsize = core.lsize;
                core.l2 = None;
                hdr.clear_flags(HdrFlags::HAS_L2);
                self.l2_size.fetch_sub(lsize as u64, Ordering::AcqRel);
                self.l2_asize.fetch_sub(hdr_asize, Ordering::AcqRel);

                if hdr.test_flags(HdrFlags::HAS_L1) {
                    if hdr.test_flags(HdrFlags::L2_READING) {
                        // The in-flight read must discard its result.
                        hdr.set_flags(HdrFlags::L2_EVICTED);
                        arc.stats.l2_evict_reading.inc();
                    } else {
                        arc.stats.l2_evict_l1cached.inc();
                    }
                } else {
                    // L2-only header: nothing left anywhere.
                    arc.destroy_hdr(&hdr, &mut core, Some(&mut bucket));
                }
            }

            inner.evict = inner.evict.max(taddr);
            return;
        }
    }

    /// Reserves `asize` bytes at the hand for a payload write. Returns
    /// the address, or `None` when the hand would pass the device end
    /// (the next feed cycle wraps via `evict_bytes`).
    pub(super) fn reserve(inner: &mut L2DevInner, end: u64, asize: u64) -> Option<u64> {
        if inner.hand + asize > end {
            return None;
        }
        let daddr = inner.hand;
        inner.hand += asize;
        Some(daddr)
    }
}

impl Debug for L2Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2Device")
            .field("vdev_guid", &self.vdev_guid)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
