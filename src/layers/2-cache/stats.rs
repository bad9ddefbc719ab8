// SPDX-License-Identifier: MPL-2.0

//! Cache statistics.
//!
//! Hot-path counters are striped sums; totals are folded lazily into a
//! snapshot for the external kstat consumer.

use core::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::util::StripedSum;

/// All cache counters.
#[derive(Debug, Default)]
pub struct ArcStats {
    pub hits: StripedSum,
    pub misses: StripedSum,
    pub iohits: StripedSum,
    pub demand_data_hits: StripedSum,
    pub demand_data_misses: StripedSum,
    pub demand_metadata_hits: StripedSum,
    pub demand_metadata_misses: StripedSum,
    pub prefetch_data_hits: StripedSum,
    pub prefetch_data_misses: StripedSum,
    pub prefetch_metadata_hits: StripedSum,
    pub prefetch_metadata_misses: StripedSum,
    pub mru_hits: StripedSum,
    pub mru_ghost_hits: StripedSum,
    pub mfu_hits: StripedSum,
    pub mfu_ghost_hits: StripedSum,
    pub uncached_hits: StripedSum,
    pub demand_hit_predictive_prefetch: StripedSum,
    pub demand_iohit_predictive_prefetch: StripedSum,
    pub demand_hit_prescient_prefetch: StripedSum,
    pub demand_iohit_prescient_prefetch: StripedSum,

    pub hash_collisions: StripedSum,
    pub hash_chains: StripedSum,
    pub hash_chain_max: AtomicU64,

    pub evict_skip: StripedSum,
    pub evict_not_enough: StripedSum,
    pub mutex_miss: StripedSum,
    pub evict_l2_cached: StripedSum,
    pub evict_l2_eligible: StripedSum,
    pub evict_l2_eligible_mru: StripedSum,
    pub evict_l2_eligible_mfu: StripedSum,
    pub evict_l2_ineligible: StripedSum,
    pub prune: StripedSum,
    pub overflow_waits: StripedSum,
    pub memory_throttle_count: StripedSum,

    pub l2_hits: StripedSum,
    pub l2_misses: StripedSum,
    pub l2_feeds: StripedSum,
    pub l2_rw_clash: StripedSum,
    pub l2_read_bytes: StripedSum,
    pub l2_write_bytes: StripedSum,
    pub l2_writes_sent: StripedSum,
    pub l2_writes_done: StripedSum,
    pub l2_writes_error: StripedSum,
    pub l2_writes_lock_retry: StripedSum,
    pub l2_evict_lock_retry: StripedSum,
    pub l2_evict_reading: StripedSum,
    pub l2_evict_l1cached: StripedSum,
    pub l2_abort_lowmem: StripedSum,
    pub l2_io_error: StripedSum,
    pub l2_log_blk_writes: StripedSum,
    pub l2_log_blk_count: StripedSum,

    pub l2_rebuild_success: StripedSum,
    pub l2_rebuild_unsupported: StripedSum,
    pub l2_rebuild_io_errors: StripedSum,
    pub l2_rebuild_dh_errors: StripedSum,
    pub l2_rebuild_cksum_lb_errors: StripedSum,
    pub l2_rebuild_lowmem: StripedSum,
    pub l2_rebuild_size: StripedSum,
    pub l2_rebuild_asize: StripedSum,
    pub l2_rebuild_bufs: StripedSum,
    pub l2_rebuild_bufs_precached: StripedSum,
    pub l2_rebuild_log_blks: StripedSum,
}

impl ArcStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new chain length, keeping the maximum.
    pub fn note_chain_len(&self, len: usize) {
        self.hash_chain_max
            .fetch_max(len as u64, Ordering::Relaxed);
    }

    /// Folds all counters into a snapshot.
    pub fn snapshot(&self) -> ArcStatsSnapshot {
        ArcStatsSnapshot {
            hits: self.hits.value(),
            misses: self.misses.value(),
            iohits: self.iohits.value(),
            demand_data_hits: self.demand_data_hits.value(),
            demand_data_misses: self.demand_data_misses.value(),
            demand_metadata_hits: self.demand_metadata_hits.value(),
            demand_metadata_misses: self.demand_metadata_misses.value(),
            prefetch_data_hits: self.prefetch_data_hits.value(),
            prefetch_data_misses: self.prefetch_data_misses.value(),
            prefetch_metadata_hits: self.prefetch_metadata_hits.value(),
            prefetch_metadata_misses: self.prefetch_metadata_misses.value(),
            mru_hits: self.mru_hits.value(),
            mru_ghost_hits: self.mru_ghost_hits.value(),
            mfu_hits: self.mfu_hits.value(),
            mfu_ghost_hits: self.mfu_ghost_hits.value(),
            uncached_hits: self.uncached_hits.value(),
            demand_hit_predictive_prefetch: self.demand_hit_predictive_prefetch.value(),
            demand_iohit_predictive_prefetch: self.demand_iohit_predictive_prefetch.value(),
            demand_hit_prescient_prefetch: self.demand_hit_prescient_prefetch.value(),
            demand_iohit_prescient_prefetch: self.demand_iohit_prescient_prefetch.value(),
            hash_collisions: self.hash_collisions.value(),
            hash_chains: self.hash_chains.value(),
            hash_chain_max: self.hash_chain_max.load(Ordering::Relaxed),
            evict_skip: self.evict_skip.value(),
            evict_not_enough: self.evict_not_enough.value(),
            mutex_miss: self.mutex_miss.value(),
            evict_l2_cached: self.evict_l2_cached.value(),
            evict_l2_eligible: self.evict_l2_eligible.value(),
            evict_l2_eligible_mru: self.evict_l2_eligible_mru.value(),
            evict_l2_eligible_mfu: self.evict_l2_eligible_mfu.value(),
            evict_l2_ineligible: self.evict_l2_ineligible.value(),
            prune: self.prune.value(),
            overflow_waits: self.overflow_waits.value(),
            memory_throttle_count: self.memory_throttle_count.value(),
            l2_hits: self.l2_hits.value(),
            l2_misses: self.l2_misses.value(),
            l2_feeds: self.l2_feeds.value(),
            l2_rw_clash: self.l2_rw_clash.value(),
            l2_read_bytes: self.l2_read_bytes.value(),
            l2_write_bytes: self.l2_write_bytes.value(),
            l2_writes_sent: self.l2_writes_sent.value(),
            l2_writes_done: self.l2_writes_done.value(),
            l2_writes_error: self.l2_writes_error.value(),
            l2_writes_lock_retry: self.l2_writes_lock_retry.value(),
            l2_evict_lock_retry: self.l2_evict_lock_retry.value(),
            l2_evict_reading: self.l2_evict_reading.value(),
            l2_evict_l1cached: self.l2_evict_l1cached.value(),
            l2_abort_lowmem: self.l2_abort_lowmem.value(),
            l2_io_error: self.l2_io_error.value(),
            l2_log_blk_writes: self.l2_log_blk_writes.value(),
            l2_log_blk_count: self.l2_log_blk_count.value(),
            l2_rebuild_success: self.l2_rebuild_success.value(),
            l2_rebuild_unsupported: self.l2_rebuild_unsupported.value(),
            l2_rebuild_io_errors: self.l2_rebuild_io_errors.value(),
            l2_rebuild_dh_errors: self.l2_rebuild_dh_errors.value(),
            l2_rebuild_cksum_lb_errors: self.l2_rebuild_cksum_lb_errors.value(),
            l2_rebuild_lowmem: self.l2_rebuild_lowmem.value(),
            l2_rebuild_size: self.l2_rebuild_size.value(),
            l2_rebuild_asize: self.l2_rebuild_asize.value(),
            l2_rebuild_bufs: self.l2_rebuild_bufs.value(),
            l2_rebuild_bufs_precached: self.l2_rebuild_bufs_precached.value(),
            l2_rebuild_log_blks: self.l2_rebuild_log_blks.value(),
        }
    }
}

/// A point-in-time copy of all counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ArcStatsSnapshot {
    pub hits: i64,
    pub misses: i64,
    pub iohits: i64,
    pub demand_data_hits: i64,
    pub demand_data_misses: i64,
    pub demand_metadata_hits: i64,
    pub demand_metadata_misses: i64,
    pub prefetch_data_hits: i64,
    pub prefetch_data_misses: i64,
    pub prefetch_metadata_hits: i64,
    pub prefetch_metadata_misses: i64,
    pub mru_hits: i64,
    pub mru_ghost_hits: i64,
    pub mfu_hits: i64,
    pub mfu_ghost_hits: i64,
    pub uncached_hits: i64,
    pub demand_hit_predictive_prefetch: i64,
    pub demand_iohit_predictive_prefetch: i64,
    pub demand_hit_prescient_prefetch: i64,
    pub demand_iohit_prescient_prefetch: i64,
    pub hash_collisions: i64,
    pub hash_chains: i64,
    pub hash_chain_max: u64,
    pub evict_skip: i64,
    pub evict_not_enough: i64,
    pub mutex_miss: i64,
    pub evict_l2_cached: i64,
    pub evict_l2_eligible: i64,
    pub evict_l2_eligible_mru: i64,
    pub evict_l2_eligible_mfu: i64,
    pub evict_l2_ineligible: i64,
    pub prune: i64,
    pub overflow_waits: i64,
    pub memory_throttle_count: i64,
    pub l2_hits: i64,
    pub l2_misses: i64,
    pub l2_feeds: i64,
    pub l2_rw_clash: i64,
    pub l2_read_bytes: i64,
    pub l2_write_bytes: i64,
    pub l2_writes_sent: i64,
    pub l2_writes_done: i64,
    pub l2_writes_error: i64,
    pub l2_writes_lock_retry: i64,
    pub l2_evict_lock_retry: i64,
    pub l2_evict_reading: i64,
    pub l2_evict_l1cached: i64,
    pub l2_abort_lowmem: i64,
    pub l2_io_error: i64,
    pub l2_log_blk_writes: i64,
    pub l2_log_blk_count: i64,
    pub l2_rebuild_success: i64,
    pub l2_rebuild_unsupported: i64,
    pub l2_rebuild_io_errors: i64,
    pub l2_rebuild_dh_errors: i64,
    pub l2_rebuild_cksum_lb_errors: i64,
    pub l2_rebuild_lowmem: i64,
    pub l2_rebuild_size: i64,
    pub l2_rebuild_asize: i64,
    pub l2_rebuild_bufs: i64,
    pub l2_rebuild_bufs_precached: i64,
    pub l2_rebuild_log_blks: i64,
}

#[cfg(test)]
mod tests {
    use super::ArcStats;

    #[test]
    fn snapshot_folds_counters() {
        let stats = ArcStats::new();
        stats.hits.inc();
        stats.hits.inc();
        stats.l2_hits.add(5);
        stats.note_chain_len(3);
        stats.note_chain_len(2);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.l2_hits, 5);
        assert_eq!(snap.hash_chain_max, 3);
    }
}
