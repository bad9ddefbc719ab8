// SPDX-License-Identifier: MPL-2.0

//! Target-size tracking: the current/target cache size, the
//! metadata and MRU split fractions, overflow detection and the
//! pipeline's in-flight reservation.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{
    config::ArcTunables,
    os::Clock,
    prelude::*,
};

/// How far current size has outrun the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowLevel {
    /// Within one block of the target.
    None,
    /// Beyond the target but within the acceptable slack.
    Some,
    /// Beyond the slack; admissions must block.
    Severe,
}

/// A platform collaborator reporting memory pressure. Negative values
/// mean the system wants memory back.
pub trait MemoryMonitor: Send + Sync {
    fn available_memory(&self) -> i64;
}

/// The default monitor: never under pressure.
#[derive(Debug, Default)]
pub struct NoPressure;

impl MemoryMonitor for NoPressure {
    fn available_memory(&self) -> i64 {
        i64::MAX
    }
}

/// All target-size scalars, shared across the cache.
pub struct Sizer {
    /// Current target size.
    c: AtomicU64,
    c_min: u64,
    c_max: u64,
    /// 32-bit fixed-point fraction of `c` that is metadata.
    meta: AtomicU32,
    /// 32-bit fixed-point MRU share of data.
    pd: AtomicU32,
    /// 32-bit fixed-point MRU share of metadata.
    pm: AtomicU32,
    /// Total bytes: payloads plus header overhead.
    size: AtomicU64,
    dnode_size: AtomicU64,
    dnode_limit: u64,
    tempreserve: AtomicU64,
    loaned: AtomicU64,
    /// Millisecond tick before which the target must not grow.
    growtime_ms: AtomicU64,
    overflow_shift: u32,
    shrink_shift: u32,
    no_grow_shift: u32,
    max_recordsize: u64,
    grow_retry_ms: u64,
    clock: Arc<dyn Clock>,
}

impl Sizer {
    pub fn new(tunables: &ArcTunables, clock: Arc<dyn Clock>) -> Self {
        let c_min = tunables.effective_min();
        let c_max = tunables.effective_max();
        let dnode_limit = if tunables.dnode_limit != 0 {
            tunables.dnode_limit
        } else {
            c_max / 4 * tunables.dnode_limit_percent / 100
        };
        Self {
            c: AtomicU64::new(c_min.max(c_max / 32)),
            c_min,
            c_max,
            // Initially 1/4 metadata, both MRU shares at 1/2.
            meta: AtomicU32::new(1 << 30),
            pd: AtomicU32::new(1 << 31),
            pm: AtomicU32::new(1 << 31),
            size: AtomicU64::new(0),
            dnode_size: AtomicU64::new(0),
            dnode_limit,
            tempreserve: AtomicU64::new(0),
            loaned: AtomicU64::new(0),
            growtime_ms: AtomicU64::new(0),
            overflow_shift: tunables.overflow_shift,
            shrink_shift: tunables.shrink_shift,
            no_grow_shift: tunables.no_grow_shift,
            max_recordsize: tunables.max_recordsize,
            grow_retry_ms: tunables.grow_retry * 1000,
            clock,
        }
    }

    pub fn c(&self) -> u64 {
        self.c.load(Ordering::Acquire)
    }

    pub fn c_min(&self) -> u64 {
        self.c_min
    }

    pub fn c_max(&self) -> u64 {
        self.c_max
    }

    pub fn meta(&self) -> u32 {
        self.meta.load(Ordering::Acquire)
    }

    pub fn pd(&self) -> u32 {
        self.pd.load(Ordering::Acquire)
    }

    pub fn pm(&self) -> u32 {
        self.pm.load(Ordering::Acquire)
    }

    pub(super) fn set_meta(&self, v: u32) {
        self.meta.store(v, Ordering::Release);
    }

    pub(super) fn set_pd(&self, v: u32) {
        self.pd.store(v, Ordering::Release);
    }

    pub(super) fn set_pm(&self, v: u32) {
        self.pm.store(v, Ordering::Release);
    }

    /// Total accounted bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(super) fn add_size(&self, delta: i64) {
        if delta >= 0 {
            self.size.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            let prev = self.size.fetch_sub((-delta) as u64, Ordering::AcqRel);
            debug_assert!(prev >= (-delta) as u64, "cache size underflow");
        }
    }

    pub fn dnode_size(&self) -> u64 {
        self.dnode_size.load(Ordering::Acquire)
    }

    pub fn dnode_limit(&self) -> u64 {
        self.dnode_limit
    }

    /// Accounts dnode bytes pinned by external consumers.
    pub fn adjust_dnode_size(&self, delta: i64) {
        if delta >= 0 {
            self.dnode_size.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.dnode_size.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    pub fn loaned(&self) -> u64 {
        self.loaned.load(Ordering::Acquire)
    }

    pub(super) fn adjust_loaned(&self, delta: i64) {
        if delta >= 0 {
            self.loaned.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.loaned.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    /// Grades how far the cache has outrun its target.
    ///
    /// `lax` applies the graded slack; without it any overage is severe.
    /// `use_reserve` widens the slack for callers admitted from reserved
    /// paths.
    pub fn is_overflowing(&self, lax: bool, use_reserve: bool) -> OverflowLevel {
        let over = self.size() as i64 - self.c() as i64 - self.max_recordsize as i64;
        let dn_over = self.dnode_size() as i64 - self.dnode_limit as i64;

        // Always allow at least one block of overflow.
        if over < 0 && dn_over <= 0 {
            return OverflowLevel::None;
        }

        // Under memory pressure any overage is severe.
        if !lax {
            return OverflowLevel::Severe;
        }

        let mut overflow = ((self.c() >> self.overflow_shift) / 2) as i64;
        if use_reserve {
            overflow *= 3;
        }
        if over < overflow {
            OverflowLevel::Some
        } else {
            OverflowLevel::Severe
        }
    }

    /// Called on each admission of `bytes`. Returns whether the reaper
    /// should run (memory went negative).
    pub(super) fn adapt(&self, bytes: u64, mem: &dyn MemoryMonitor) -> bool {
        let avail = mem.available_memory();
        if avail < 0 {
            // Hold off growth for a while after pressure.
            self.growtime_ms.store(
                self.clock.ticks_ms() + self.grow_retry_ms,
                Ordering::Release,
            );
            return true;
        }

        let c = self.c();
        if c >= self.c_max {
            return false;
        }
        // Inside the no-grow band of free memory the target stays put.
        if (avail as u64) < c >> self.no_grow_shift {
            return false;
        }
        if self.clock.ticks_ms() < self.growtime_ms.load(Ordering::Acquire) {
            return false;
        }
        // Only grow once the cache is actually close to its target.
        if self.size() + 2 * self.max_recordsize < c {
            return false;
        }
        let grown = c
            .saturating_add(bytes.max(self.max_recordsize))
            .min(self.c_max);
        let _ = self
            .c
            .compare_exchange(c, grown, Ordering::AcqRel, Ordering::Acquire);
        false
    }

    /// Shrinks the target by `to_free`, never below the floor. Returns
    /// whether the cache is still above the new target (the eviction
    /// engine should be signalled).
    pub(super) fn reduce_target_size(&self, to_free: u64) -> bool {
        let mut c = self.c();
        loop {
            let new_c = c.saturating_sub(to_free).max(self.c_min);
            match self
                .c
                .compare_exchange(c, new_c, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(cur) => c = cur,
            }
        }
        self.growtime_ms.store(
            self.clock.ticks_ms() + self.grow_retry_ms,
            Ordering::Release,
        );
        self.size() > self.c()
    }

    /// Reserves room for `reserve` bytes of in-flight dirty data.
    ///
    /// `anon_size` is the current anonymous-state footprint (including
    /// loaned buffers).
    pub(super) fn tempreserve_space(&self, reserve: u64, anon_size: u64) -> Result<()> {
        if reserve > self.c() / 4 {
            // Large reservations pull the target up before being judged.
            let want = (reserve * 4).min(self.c_max);
            self.c.fetch_max(want, Ordering::AcqRel);
        }
        if reserve > self.c() {
            return_errno_with_msg!(OutOfSpace, "reservation exceeds the cache target");
        }

        // Throttle when in-flight writes crowd the cache: the sum of the
        // reservation and anonymous data may not pass half the target
        // while anonymous data alone passes a quarter.
        let tempreserve = self.tempreserve.load(Ordering::Acquire);
        if reserve + tempreserve + anon_size > self.c() / 2 && anon_size > self.c() / 4 {
            trace!(
                "tempreserve throttled: reserve={} inflight={} anon={}",
                reserve,
                tempreserve,
                anon_size
            );
            return_errno_with_msg!(Throttled, "anonymous data too close to the cache target");
        }

        self.tempreserve.fetch_add(reserve, Ordering::AcqRel);
        Ok(())
    }

    /// Returns a reservation made by `tempreserve_space`.
    pub(super) fn tempreserve_clear(&self, reserve: u64) {
        let prev = self.tempreserve.fetch_sub(reserve, Ordering::AcqRel);
        debug_assert!(prev >= reserve, "tempreserve underflow");
    }

    pub fn tempreserve(&self) -> u64 {
        self.tempreserve.load(Ordering::Acquire)
    }

    /// How much one reclaim pass sheds from the target at minimum.
    pub(super) fn shrink_bytes(&self) -> u64 {
        self.c() >> self.shrink_shift
    }
}

impl Debug for Sizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sizer")
            .field("c", &self.c())
            .field("c_min", &self.c_min)
            .field("c_max", &self.c_max)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::SystemClock;

    fn new_sizer() -> Sizer {
        let tunables = ArcTunables {
            min: 32 * 1024 * 1024,
            max: 64 * 1024 * 1024,
            max_recordsize: 1024 * 1024,
            ..Default::default()
        };
        Sizer::new(&tunables, Arc::new(SystemClock))
    }

    #[test]
    fn overflow_levels() {
        let sizer = new_sizer();
        assert_eq!(sizer.is_overflowing(true, false), OverflowLevel::None);

        // One max-record of slack is always allowed.
        sizer.add_size(sizer.c() as i64 + 1024);
        assert_eq!(sizer.is_overflowing(true, false), OverflowLevel::None);

        // Past the slack but within the graded window.
        sizer.add_size(1024 * 1024 as i64);
        assert_eq!(sizer.is_overflowing(true, false), OverflowLevel::Some);
        assert_eq!(sizer.is_overflowing(false, false), OverflowLevel::Severe);

        // Far past the window.
        sizer.add_size(64 * 1024 * 1024);
        assert_eq!(sizer.is_overflowing(true, false), OverflowLevel::Severe);
    }

    #[test]
    fn reduce_respects_floor() {
        let sizer = new_sizer();
        let c0 = sizer.c();
        sizer.reduce_target_size(c0 * 2);
        assert_eq!(sizer.c(), sizer.c_min());
    }

    #[test]
    fn tempreserve_throttles_anon_heavy_load() {
        let sizer = new_sizer();
        let c = sizer.c();
        assert!(sizer.tempreserve_space(c / 8, 0).is_ok());
        let err = sizer
            .tempreserve_space(c / 2, c / 2)
            .expect_err("anon-heavy reservation must throttle");
        assert_eq!(err.errno(), crate::error::Errno::Throttled);
        sizer.tempreserve_clear(c / 8);
        assert_eq!(sizer.tempreserve(), 0);
    }
}
