// SPDX-License-Identifier: MPL-2.0

//! Cache tunables.
//!
//! The property plumbing that feeds these values at runtime lives outside
//! this crate; here the struct itself is the interface. Defaults mirror
//! the shipped module defaults.

/// Tunables controlling both cache levels. All sizes are in bytes, all
/// times in the unit their name says.
#[derive(Clone, Debug)]
pub struct ArcTunables {
    /// Lower bound on the target size `c`. 0 picks the built-in floor.
    pub min: u64,
    /// Upper bound on the target size `c`. 0 picks the built-in default.
    pub max: u64,
    /// Sub-limit on bytes pinned by dnode metadata. 0 derives it from
    /// `dnode_limit_percent` of the metadata share.
    pub dnode_limit: u64,
    /// Percent of the metadata share used when `dnode_limit` is 0.
    pub dnode_limit_percent: u64,
    /// Percent of pinned dnodes asked to be pruned per pass.
    pub dnode_reduce_percent: u64,
    /// Seconds after a reclaim before the target may grow again.
    pub grow_retry: u64,
    /// log2 fraction of `c` to shed per shrink request.
    pub shrink_shift: u32,
    /// log2 fraction of free memory below which the target stops growing.
    pub no_grow_shift: u32,
    /// Average block size used to dimension the hash table.
    pub average_blocksize: u64,
    /// Largest single block the pool can hand us; slack term of the
    /// overflow check and of target growth.
    pub max_recordsize: u64,
    /// Keep physical payloads compressed in memory.
    pub compressed_arc_enabled: bool,
    /// Data/metadata rebalance rate divisor.
    pub meta_balance: u64,
    /// log2 fraction of `c` considered acceptable overflow slack.
    pub overflow_shift: u32,
    /// Percent of a blocked admission's bytes the evictor aims beyond.
    pub eviction_pct: u64,
    /// Max victims examined per sublist visit.
    pub evict_batch_limit: usize,
    /// Eviction worker threads: 0 = auto, 1 = single, N = fixed.
    pub evict_threads: usize,
    /// Number of sublists per state/type multi-list. 0 = auto.
    pub num_sublists: usize,
    /// Floor lifetime of a predictive-prefetched block, in ms.
    pub min_prefetch_ms: u64,
    /// Floor lifetime of a prescient-prefetched block, in ms.
    pub min_prescient_prefetch_ms: u64,

    /// Max bytes fed to one cache device per interval.
    pub l2arc_write_max: u64,
    /// Extra feed bytes while the device is cold.
    pub l2arc_write_boost: u64,
    /// Multiple of the feed target scanned for eligible buffers.
    pub l2arc_headroom: u64,
    /// Percent boost of headroom while compressing.
    pub l2arc_headroom_boost: u64,
    /// Seconds between feed cycles.
    pub l2arc_feed_secs: u64,
    /// Floor on the feed interval, in ms, when re-feeding quickly.
    pub l2arc_feed_min_ms: u64,
    /// Re-feed immediately after a full write.
    pub l2arc_feed_again: bool,
    /// Do not feed prefetched buffers.
    pub l2arc_noprefetch: bool,
    /// Feed only from the MFU lists.
    pub l2arc_mfuonly: bool,
    /// Percent of the feed target trimmed ahead of the write hand.
    /// 0 disables trimming.
    pub l2arc_trim_ahead: u64,
    /// Rebuild device contents at attach.
    pub l2arc_rebuild_enabled: bool,
    /// Devices smaller than this skip log-block writing and rebuild.
    pub l2arc_rebuild_blocks_min_l2size: u64,
    /// Cap on restored-header memory, in percent of the target size.
    pub l2arc_meta_percent: u64,
}

impl Default for ArcTunables {
    fn default() -> Self {
        Self {
            min: 0,
            max: 0,
            dnode_limit: 0,
            dnode_limit_percent: 10,
            dnode_reduce_percent: 10,
            grow_retry: 5,
            shrink_shift: 7,
            no_grow_shift: 5,
            average_blocksize: 8 * 1024,
            max_recordsize: 16 * 1024 * 1024,
            compressed_arc_enabled: true,
            meta_balance: 500,
            overflow_shift: 8,
            eviction_pct: 200,
            evict_batch_limit: 10,
            evict_threads: 0,
            num_sublists: 0,
            min_prefetch_ms: 1000,
            min_prescient_prefetch_ms: 6000,

            l2arc_write_max: 32 * 1024 * 1024,
            l2arc_write_boost: 32 * 1024 * 1024,
            l2arc_headroom: 8,
            l2arc_headroom_boost: 200,
            l2arc_feed_secs: 1,
            l2arc_feed_min_ms: 200,
            l2arc_feed_again: true,
            l2arc_noprefetch: true,
            l2arc_mfuonly: false,
            l2arc_trim_ahead: 0,
            l2arc_rebuild_enabled: true,
            l2arc_rebuild_blocks_min_l2size: 1024 * 1024 * 1024,
            l2arc_meta_percent: 33,
        }
    }
}

impl ArcTunables {
    /// The effective target floor. An explicit `min` is honored as
    /// given; only the automatic default applies the built-in floor.
    pub fn effective_min(&self) -> u64 {
        const FLOOR: u64 = 32 * 1024 * 1024;
        if self.min == 0 {
            FLOOR
        } else {
            self.min
        }
    }

    /// The effective target ceiling.
    pub fn effective_max(&self) -> u64 {
        const DEFAULT_MAX: u64 = 1024 * 1024 * 1024;
        if self.max == 0 {
            DEFAULT_MAX.max(self.effective_min() * 2)
        } else {
            self.max.max(self.effective_min())
        }
    }

    /// The effective number of sublists per multi-list.
    pub fn effective_num_sublists(&self) -> usize {
        if self.num_sublists == 0 {
            8
        } else {
            self.num_sublists
        }
    }

    /// The effective number of eviction workers for `ncpus`.
    pub fn effective_evict_threads(&self, ncpus: usize) -> usize {
        match self.evict_threads {
            0 if ncpus < 6 => 1,
            0 => (ncpus.ilog2() as usize + ncpus / 32).max(1),
            n => n,
        }
    }

    /// Buckets for the hash table: enough for the cache ceiling at the
    /// average block size.
    pub fn hash_table_buckets(&self) -> usize {
        let want = (self.effective_max() / self.average_blocksize.max(512)) as usize;
        want.next_power_of_two().clamp(1 << 11, 1 << 22)
    }
}

#[cfg(test)]
mod tests {
    use super::ArcTunables;

    #[test]
    fn defaults_are_sane() {
        let t = ArcTunables::default();
        assert!(t.effective_min() >= 32 * 1024 * 1024);
        assert!(t.effective_max() >= t.effective_min());
        assert!(t.hash_table_buckets().is_power_of_two());
    }

    #[test]
    fn evict_threads_scale_with_cpus() {
        let t = ArcTunables::default();
        assert_eq!(t.effective_evict_threads(4), 1);
        assert_eq!(t.effective_evict_threads(8), 3);
        assert_eq!(t.effective_evict_threads(64), 8);
        let fixed = ArcTunables {
            evict_threads: 2,
            ..Default::default()
        };
        assert_eq!(fixed.effective_evict_threads(64), 2);
    }
}
