// SPDX-License-Identifier: MPL-2.0

//! The eviction engine.
//!
//! A single background task runs eviction passes when the sizer reports
//! overflow, when an admission explicitly asks, or on its periodic tick
//! (which also drains the uncached state). A pass recomputes the split
//! fractions from ghost hits, spreads the overage across the four
//! (state, type) quotas, evicts sublists in parallel on a task pool, trims
//! the ghost lists, and dispatches prune callbacks when pinned metadata
//! crowds its share.
//!
//! Scans never block on a bucket lock: a contended bucket is a skipped
//! victim and a `mutex_miss` tick. Progress is published through a
//! cumulative freed-bytes counter on which blocked admissions wait.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{
    hdr::{self, BlkType, BufHdr, HdrFlags},
    multilist::ListPayload,
    sizer::OverflowLevel,
    state::{self, StateKind},
    ArcInner,
};
use crate::{
    os::{Condvar, CvarMutex, Mutex, TaskPool},
    prelude::*,
};

/// A blocked admission: satisfied once the cumulative freed-bytes counter
/// reaches `count`, or when the cache stops overflowing.
struct EvictWaiter {
    count: u64,
    satisfied: CvarMutex<bool>,
    cv: Condvar,
}

/// Shared state of the eviction task.
pub(crate) struct EvictEngine {
    /// Pending-work flag; the evictor consumes it each cycle.
    need: CvarMutex<bool>,
    pub(super) cv: Condvar,
    pub(super) shutdown: AtomicBool,
    waiters: Mutex<VecDeque<Arc<EvictWaiter>>>,
    /// Highest freed-bytes target handed to any waiter.
    last_count: AtomicU64,
    /// Cumulative real bytes freed by eviction.
    evict_count: AtomicU64,
    /// Worker pool; `None` runs passes single-threaded.
    workers: Option<TaskPool>,
    num_workers: usize,
    /// Marker owner ids for sublist cursors.
    marker_seq: AtomicU64,
}

impl EvictEngine {
    pub(super) fn new(num_workers: usize) -> Self {
        Self {
            need: CvarMutex::new(false),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            waiters: Mutex::new(VecDeque::new()),
            last_count: AtomicU64::new(0),
            evict_count: AtomicU64::new(0),
            workers: (num_workers > 1).then(|| TaskPool::new(num_workers)),
            num_workers,
            marker_seq: AtomicU64::new(1),
        }
    }

    pub(super) fn evict_count(&self) -> u64 {
        self.evict_count.load(Ordering::Acquire)
    }

    fn note_freed(&self, real: u64) {
        self.evict_count.fetch_add(real, Ordering::AcqRel);
    }

    /// Marks work pending and wakes the evictor.
    pub(super) fn signal(&self) {
        *self.need.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Consumes the pending-work flag; called by the evictor each cycle.
    pub(super) fn take_need(&self) -> bool {
        core::mem::take(&mut *self.need.lock().unwrap())
    }

    /// Parks the evictor until work is signalled or `timeout` elapses.
    pub(super) fn wait_for_work(&self, timeout: core::time::Duration) {
        let need = self.need.lock().unwrap();
        if !*need {
            let _ = self.cv.wait_timeout(need, timeout);
        }
    }

    pub(super) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
        if let Some(pool) = &self.workers {
            pool.shutdown();
        }
    }
}

impl Debug for EvictEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictEngine")
            .field("evict_count", &self.evict_count())
            .field("num_workers", &self.num_workers)
            .finish_non_exhaustive()
    }
}

/// Simple completion latch for fanned-out sublist workers.
struct Latch {
    remaining: CvarMutex<usize>,
    cv: Condvar,
}

impl Latch {
    fn new(n: usize) -> Self {
        Self {
            remaining: CvarMutex::new(n),
            cv: Condvar::new(),
        }
    }

    fn arrive(&self) {
        let mut left = self.remaining.lock().unwrap();
        *left -= 1;
        if *left == 0 {
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut left = self.remaining.lock().unwrap();
        while *left != 0 {
            left = self.cv.wait(left).unwrap();
        }
    }
}

impl ArcInner {
    /// One full eviction pass. Returns total logical bytes evicted.
    pub(super) fn evict_cycle(&self) -> u64 {
        self.adapter
            .recompute(&self.states, &self.sizer, self.tunables.meta_balance);

        let states = &self.states;
        let anon = states.state(StateKind::Anon);
        let mru = states.state(StateKind::Mru);
        let mfu = states.state(StateKind::Mfu);

        let mut mrum =
            (mru.size_of(BlkType::Metadata) + anon.size_of(BlkType::Metadata)) as i64;
        let mrud = (mru.size_of(BlkType::Data) + anon.size_of(BlkType::Data)) as i64;
        let mfum = mfu.size_of(BlkType::Metadata) as i64;
        let mfud = mfu.size_of(BlkType::Data) as i64;
        let m = mrum + mfum;
        let t = mrud + mfud + m;

        let mut asize = self.sizer.size() as i64;
        let c = self.sizer.c() as i64;
        let meta = self.sizer.meta() as u64;
        let pd = self.sizer.pd() as u64;
        let pm = self.sizer.pm() as u64;
        let mut total: u64 = 0;

        // Bytes we would like to keep: the current working set minus the
        // overage.
        let mut wt = t - (asize - c);

        self.maybe_prune(wt, meta);

        // Evict MRU metadata.
        let w = (wt * (((meta * pm) >> 48) as i64)) >> 16;
        let e = (asize - c).min(mrum - w);
        let bytes = self.evict_state(StateKind::Mru, BlkType::Metadata, 0, clamp(e));
        total += bytes;
        mrum -= bytes as i64;
        asize -= bytes as i64;

        // Evict MFU metadata.
        let w = (wt * ((meta >> 16) as i64)) >> 16;
        let e = (asize - c).min(m - total as i64 - w);
        let bytes = self.evict_state(StateKind::Mfu, BlkType::Metadata, 0, clamp(e));
        total += bytes;
        asize -= bytes as i64;

        // Evict MRU data.
        wt -= m - total as i64;
        let w = (wt * ((pd >> 16) as i64)) >> 16;
        let e = (asize - c).min(mrud - w);
        let bytes = self.evict_state(StateKind::Mru, BlkType::Data, 0, clamp(e));
        total += bytes;
        asize -= bytes as i64;

        // Evict MFU data: whatever overage remains.
        let e = asize - c;
        let bytes = self.evict_state(StateKind::Mfu, BlkType::Data, 0, clamp(e));
        total += bytes;

        // Keep each ghost list at no more than half the live footprint,
        // so that ancient identities cannot fake recency.
        let ghost_bound = (anon.total_size() + mru.total_size() + mfu.total_size()) / 2;
        for ghost in [StateKind::MruGhost, StateKind::MfuGhost] {
            for ty in BlkType::ALL {
                let excess = states.state(ghost).size_of(ty).saturating_sub(ghost_bound);
                if excess > 0 {
                    total += self.evict_state(ghost, ty, 0, excess);
                }
            }
        }

        // The uncached state holds one-shot blocks; drain it every pass
        // (young prefetches are protected by their minimum lifetime).
        for ty in BlkType::ALL {
            total += self.evict_state(StateKind::Uncached, ty, 0, u64::MAX);
        }

        self.wake_waiters();
        total
    }

    /// Dispatches prune callbacks when unevictable metadata crowds its
    /// share of the target (spec: over 3/4 of the metadata want, or over
    /// the dnode sub-limit).
    fn maybe_prune(&self, wt: i64, meta: u64) {
        let states = &self.states;
        let mru = states.state(StateKind::Mru);
        let mfu = states.state(StateKind::Mfu);
        let dn = self.sizer.dnode_size() as i64;
        let nem = (mru.size_of(BlkType::Metadata) + mfu.size_of(BlkType::Metadata)) as i64
            - (mru.esize_of(BlkType::Metadata) + mfu.esize_of(BlkType::Metadata)) as i64;
        let w = (wt * ((meta >> 16) as i64)) >> 16;

        if nem <= w * 3 / 4 {
            return;
        }
        let pct = self.tunables.dnode_reduce_percent as i64;
        let mut amount = dn * pct / 100;
        if nem < w && dn > self.sizer.dnode_limit() as i64 {
            amount = amount.max((dn - self.sizer.dnode_limit() as i64) * pct / 100);
        }
        if amount > 0 {
            self.prune_async(amount as u64);
        }
    }

    /// Evicts up to `bytes` logical bytes from one (state, type) list.
    /// `spa` of 0 matches every pool.
    pub(crate) fn evict_state(
        &self,
        kind: StateKind,
        ty: BlkType,
        spa: u64,
        bytes: u64,
    ) -> u64 {
        if bytes == 0 {
            return 0;
        }
        let num_sublists = self.states.state(kind).lists[ty.index()].num_sublists();
        let nworkers = self.evict.num_workers.min(num_sublists);

        if nworkers > 1 && self.evict.workers.is_some() {
            // Fan sublists out across the worker pool; each worker owns a
            // stripe and a proportional share of the byte quota.
            let latch = Arc::new(Latch::new(nworkers));
            let evicted = Arc::new(AtomicU64::new(0));
            let share = if bytes == u64::MAX {
                u64::MAX
            } else {
                (bytes / nworkers as u64).max(1)
            };
            let pool = self.evict.workers.as_ref().unwrap();
            for worker in 0..nworkers {
                let inner = self.strong();
                let latch = latch.clone();
                let evicted = evicted.clone();
                pool.execute(move || {
                    let sublists: Vec<usize> = (worker..num_sublists)
                        .step_by(nworkers)
                        .collect();
                    let n = inner.evict_sublists(kind, ty, spa, &sublists, share);
                    evicted.fetch_add(n, Ordering::AcqRel);
                    latch.arrive();
                });
            }
            latch.wait();
            evicted.load(Ordering::Acquire)
        } else {
            let sublists: Vec<usize> = (0..num_sublists).collect();
            self.evict_sublists(kind, ty, spa, &sublists, bytes)
        }
    }

    /// Round-robins over `sublists` in batches until the quota is met or
    /// a full round frees nothing.
    fn evict_sublists(
        &self,
        kind: StateKind,
        ty: BlkType,
        spa: u64,
        sublists: &[usize],
        bytes: u64,
    ) -> u64 {
        let worker = self.evict.marker_seq.fetch_add(1, Ordering::Relaxed);
        let mut total: u64 = 0;
        loop {
            let mut progressed = false;
            for &idx in sublists {
                if total >= bytes {
                    return total;
                }
                let want = bytes.saturating_sub(total).max(1);
                let evicted = self.evict_sublist(kind, ty, idx, worker, spa, want);
                if evicted > 0 {
                    progressed = true;
                }
                total += evicted;
            }
            if !progressed {
                if bytes != u64::MAX && total < bytes {
                    self.stats.evict_not_enough.inc();
                }
                return total;
            }
        }
    }

    /// One marker-guided batch over a single sublist.
    fn evict_sublist(
        &self,
        kind: StateKind,
        ty: BlkType,
        idx: usize,
        worker: u64,
        spa: u64,
        bytes: u64,
    ) -> u64 {
        let ml = &self.states.state(kind).lists[ty.index()];
        let mut guard = ml.lock(idx);
        let marker = guard.insert_tail(ListPayload::Marker(worker));
        let mut evicted: u64 = 0;
        let mut victims = 0usize;

        while victims < self.tunables.evict_batch_limit && evicted < bytes {
            let Some(prev) = guard.prev(marker) else {
                break;
            };
            let hdr = match guard.payload(prev) {
                // Another worker's cursor: step past it.
                ListPayload::Marker(_) => {
                    guard.move_marker_forward(marker);
                    continue;
                }
                ListPayload::Hdr(hdr) => hdr.clone(),
            };

            if spa != 0 && hdr.spa() != spa {
                guard.move_marker_forward(marker);
                self.stats.evict_skip.inc();
                continue;
            }

            // Never block on a bucket while holding a sublist: a missed
            // try-lock is a skipped victim, not a stall.
            let ident = match hdr.try_core() {
                Some(core) => core.ident,
                None => {
                    self.stats.mutex_miss.inc();
                    guard.move_marker_forward(marker);
                    continue;
                }
            };
            let Some(mut bucket) = self.table.try_lock_bucket(hdr.spa(), &ident) else {
                self.stats.mutex_miss.inc();
                guard.move_marker_forward(marker);
                continue;
            };
            let mut core = hdr.core();

            // Revalidate under the locks.
            if core.ident != ident || core.state() != kind || core.l1().node.is_none() {
                guard.move_marker_forward(marker);
                continue;
            }
            if !self.evictable_now(&hdr, &core) {
                self.stats.evict_skip.inc();
                guard.move_marker_forward(marker);
                continue;
            }

            // Commit: pull the victim off this sublist ourselves (the
            // lock is ours), then tear it down.
            let link = core.l1_mut().node.take().unwrap();
            debug_assert_eq!(link.sublist, idx);
            guard.remove(link.key);
            self.states
                .state(kind)
                .sub_esize_for(ty, state::contribution(&core, kind));

            let (logical, real) = self.evict_hdr(&hdr, &mut core, &mut bucket);
            drop(core);
            drop(bucket);
            evicted += logical;
            victims += 1;
            self.evict.note_freed(real);
        }

        let removed = guard.remove(marker);
        debug_assert!(removed.is_marker());
        drop(guard);
        self.wake_waiters();
        evicted
    }

    /// Whether a header may be torn down right now.
    fn evictable_now(&self, hdr: &Arc<BufHdr>, core: &super::hdr::HdrCore) -> bool {
        if !hdr.refcnt().is_zero() || hdr.test_flags(HdrFlags::IO_IN_PROGRESS) {
            return false;
        }
        let state = core.state();
        if state.is_ghost() {
            // A writer still holds the L1 view hostage.
            return !hdr.test_flags(HdrFlags::L2_WRITING);
        }
        // Enforce the prefetch minimum lifespan.
        if hdr.test_flags(HdrFlags::PREFETCH | HdrFlags::INDIRECT) {
            let floor = if hdr.test_flags(HdrFlags::PRESCIENT_PREFETCH) {
                self.tunables.min_prescient_prefetch_ms
            } else {
                self.tunables.min_prefetch_ms
            };
            let age = self.clock.ticks_ms().saturating_sub(core.l1().access_ms);
            if age < floor {
                return false;
            }
        }
        true
    }

    /// Tears one header down. The victim is already off its sublist; the
    /// bucket lock is held. Returns (logical, real) bytes freed.
    fn evict_hdr(
        &self,
        hdr: &Arc<BufHdr>,
        core: &mut super::hdr::HdrCore,
        bucket: &mut super::hash_table::BucketGuard<'_>,
    ) -> (u64, u64) {
        // The sublist scan was the only reference path to this header;
        // with the bucket lock held that is still true.
        debug_assert!(hdr.refcnt().is_zero());
        debug_assert!(!hdr.test_flags(HdrFlags::IO_IN_PROGRESS));

        let state = core.state();
        let lsize = core.lsize as u64;

        if state.is_ghost() {
            self.states.state(state).sub_size_for(hdr.blk_type(), lsize);
            self.sizer.add_size(-(lsize as i64));
            if hdr.test_flags(HdrFlags::HAS_L2) {
                // Still cached on a device: shrink to the small variant.
                core.l1_mut().state = StateKind::L2cOnly;
                hdr::demote_to_l2only(hdr, core);
                let real = hdr::hdr_full_size() - hdr::hdr_l2only_size();
                return (lsize, real);
            }
            core.l1_mut().state = StateKind::Anon;
            self.destroy_hdr(hdr, core, Some(bucket));
            return (lsize, hdr::hdr_full_size());
        }

        // Live state: account L2 eligibility for observability.
        let psize = core.psize as u64;
        if hdr.test_flags(HdrFlags::HAS_L2) {
            self.stats.evict_l2_cached.add(psize as i64);
        } else if hdr.test_flags(HdrFlags::L2CACHE) {
            self.stats.evict_l2_eligible.add(lsize as i64);
            match state {
                StateKind::Mru => self.stats.evict_l2_eligible_mru.add(lsize as i64),
                StateKind::Mfu => self.stats.evict_l2_eligible_mfu.add(lsize as i64),
                _ => {}
            }
        } else {
            self.stats.evict_l2_ineligible.add(lsize as i64);
        }

        // Discard payloads.
        debug_assert!(core.l1().bufs.is_empty() && core.l1().acbs.is_empty());
        let mut freed: u64 = 0;
        if let Some(pabd) = core.l1_mut().pabd.take() {
            freed += pabd.len() as u64;
        }
        if let Some(rabd) = core.l1_mut().rabd.take() {
            freed += rabd.len() as u64;
        }
        self.account_payload(hdr, state, -(freed as i64));
        hdr.clear_flags(HdrFlags::SHARED_DATA);

        match state {
            StateKind::Uncached => {
                state::change_state(&self.states, &self.sizer, hdr, core, StateKind::Anon);
                self.destroy_hdr(hdr, core, Some(bucket));
            }
            StateKind::Mru => {
                state::change_state(&self.states, &self.sizer, hdr, core, StateKind::MruGhost)
            }
            StateKind::Mfu => {
                state::change_state(&self.states, &self.sizer, hdr, core, StateKind::MfuGhost)
            }
            other => unreachable!("evicting from state {:?}", other),
        }
        (freed, freed)
    }

    /// Requests or waits for room for `amount` new bytes, per the graded
    /// overflow level.
    pub(super) fn wait_for_eviction(&self, amount: u64, lax: bool, use_reserve: bool) {
        match self.sizer.is_overflowing(lax, use_reserve) {
            OverflowLevel::None => {}
            OverflowLevel::Some => {
                self.evict.signal();
            }
            OverflowLevel::Severe => {
                self.stats.overflow_waits.inc();
                let goal = amount * self.tunables.eviction_pct / 100;
                let base = self
                    .evict
                    .last_count
                    .load(Ordering::Acquire)
                    .max(self.evict.evict_count());
                let count = base + goal.max(1);
                self.evict.last_count.store(count, Ordering::Release);

                let waiter = Arc::new(EvictWaiter {
                    count,
                    satisfied: CvarMutex::new(false),
                    cv: Condvar::new(),
                });
                self.evict.waiters.lock().push_back(waiter.clone());
                self.evict.signal();

                let mut done = waiter.satisfied.lock().unwrap();
                while !*done {
                    // Re-check the overflow level periodically in case a
                    // wakeup raced with our enqueue.
                    let (guard, timed_out) = waiter
                        .cv
                        .wait_timeout(done, core::time::Duration::from_millis(100))
                        .unwrap();
                    done = guard;
                    if timed_out
                        && self.sizer.is_overflowing(lax, use_reserve) != OverflowLevel::Severe
                    {
                        break;
                    }
                    if self.evict.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
    }

    /// Releases waiters whose targets have been met, and everyone once
    /// the cache is back under its target or shutting down.
    pub(super) fn wake_waiters(&self) {
        let evicted = self.evict.evict_count();
        let flushed = self.sizer.is_overflowing(true, true) == OverflowLevel::None
            || self.evict.shutdown.load(Ordering::Acquire);
        let mut waiters = self.evict.waiters.lock();
        while let Some(front) = waiters.front() {
            if !flushed && front.count > evicted {
                break;
            }
            let waiter = waiters.pop_front().unwrap();
            *waiter.satisfied.lock().unwrap() = true;
            waiter.cv.notify_all();
        }
    }

    /// Asynchronously asks registered consumers to drop roughly `amount`
    /// bytes of pinned metadata references.
    pub(super) fn prune_async(&self, amount: u64) {
        let callbacks = self.prune_callbacks.lock().clone();
        for cb in callbacks {
            let stats_tick = amount;
            self.io_pool.execute(move || (cb.func)(stats_tick));
            self.stats.prune.inc();
        }
    }
}

fn clamp(v: i64) -> u64 {
    v.max(0) as u64
}
