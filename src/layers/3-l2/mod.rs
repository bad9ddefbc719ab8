// SPDX-License-Identifier: MPL-2.0

//! The second-level cache.
//!
//! Cache devices extend the in-memory cache with a persistent,
//! rotary-allocated spillover area. A feed task periodically copies the
//! tails of the MRU/MFU lists onto the current device and journals what
//! it wrote in chained log blocks, which the rebuild path replays at the
//! next import.

mod device;
mod feeder;
pub mod log_blk;
mod rebuild;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use self::{device::L2Device, rebuild::RebuildStats};
use self::log_blk::{LOG_BLK_MAX_ENTRIES, LOG_BLK_RAW_SIZE};
use crate::{
    config::ArcTunables,
    layers::{bio::BlockSet, cache::ArcInner},
    os::{self, Condvar, CvarMutex, JoinHandle, Mutex, RwLock},
    prelude::*,
};

/// The device registry and feed task of the second-level cache.
pub struct L2Arc {
    arc: Weak<ArcInner>,
    devices: RwLock<Vec<Arc<L2Device>>>,
    rotor: AtomicUsize,
    feed_stop: CvarMutex<bool>,
    feed_cv: Condvar,
    feed_task: Mutex<Option<JoinHandle<()>>>,
    rebuild_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set after a productive cycle; the next wait uses the short
    /// interval so a hot device keeps filling.
    feed_fast: AtomicBool,
}

impl L2Arc {
    pub(crate) fn new(arc: Weak<ArcInner>, _tunables: &ArcTunables) -> Self {
        Self {
            arc,
            devices: RwLock::new(Vec::new()),
            rotor: AtomicUsize::new(0),
            feed_stop: CvarMutex::new(false),
            feed_cv: Condvar::new(),
            feed_task: Mutex::new(None),
            rebuild_tasks: Mutex::new(Vec::new()),
            feed_fast: AtomicBool::new(false),
        }
    }

    /// Starts the periodic feed task.
    pub(crate) fn start_feeder(&self) {
        let Some(arc) = self.arc.upgrade() else {
            return;
        };
        let weak = self.arc.clone();
        let task = os::spawn(move || loop {
            let Some(arc) = weak.upgrade() else {
                return;
            };
            let interval = if arc.l2.feed_fast.swap(false, Ordering::AcqRel) {
                core::time::Duration::from_millis(arc.tunables.l2arc_feed_min_ms.max(1))
            } else {
                core::time::Duration::from_secs(arc.tunables.l2arc_feed_secs.max(1))
            };
            {
                let stop = arc.l2.feed_stop.lock().unwrap();
                if *stop {
                    return;
                }
                let (stop, _) = arc.l2.feed_cv.wait_timeout(stop, interval).unwrap();
                if *stop {
                    return;
                }
            }
            if arc.is_shutting_down() {
                return;
            }
            arc.l2.feed_cycle(&arc);
        });
        drop(arc);
        *self.feed_task.lock() = Some(task);
    }

    /// Stops the feed task and joins any rebuild still running.
    pub(crate) fn stop(&self) {
        *self.feed_stop.lock().unwrap() = true;
        self.feed_cv.notify_all();
        if let Some(task) = self.feed_task.lock().take() {
            let _ = task.join();
        }
        for dev in self.devices.read().iter() {
            dev.set_alive(false);
        }
        for task in self.rebuild_tasks.lock().drain(..) {
            let _ = task.join();
        }
    }

    /// Attaches a cache device and schedules its persistent rebuild.
    pub(crate) fn add_vdev(
        &self,
        spa_guid: u64,
        vdev_guid: u64,
        storage: Arc<dyn BlockSet>,
        ashift: u32,
    ) -> Result<()> {
        let dev = L2Device::create(spa_guid, vdev_guid, storage, ashift, LOG_BLK_MAX_ENTRIES)?;
        self.attach_device(dev)
    }

    /// Registers an already constructed device (tests use a smaller
    /// log-block capacity).
    pub(crate) fn attach_device(&self, dev: Arc<L2Device>) -> Result<()> {
        let Some(arc) = self.arc.upgrade() else {
            return_errno_with_msg!(Cancelled, "cache context is gone");
        };
        self.devices.write().push(dev.clone());

        dev.set_rebuilding(true);
        let task = os::spawn(move || {
            if let Err(e) = rebuild::rebuild_device(&arc, &dev) {
                warn!("rebuild of {:#x} incomplete: {}", dev.vdev_guid(), e);
            }
            dev.set_rebuilding(false);
        });
        self.rebuild_tasks.lock().push(task);
        Ok(())
    }

    /// Detaches a device, invalidating everything it backs.
    pub(crate) fn remove_vdev(&self, vdev_guid: u64) {
        let Some(dev) = self.device_by_guid(vdev_guid) else {
            return;
        };
        dev.set_alive(false);
        if let Some(arc) = self.arc.upgrade() {
            dev.evict_bytes(&arc, 0, true);
        }
        self.devices.write().retain(|d| d.vdev_guid() != vdev_guid);
        info!("cache device {:#x} detached", vdev_guid);
    }

    /// Re-runs the persistent rebuild of an attached device.
    pub(crate) fn rebuild_vdev(&self, vdev_guid: u64) -> Result<()> {
        let Some(arc) = self.arc.upgrade() else {
            return_errno_with_msg!(Cancelled, "cache context is gone");
        };
        let Some(dev) = self.device_by_guid(vdev_guid) else {
            return_errno_with_msg!(NotFound, "no such cache device");
        };
        dev.set_rebuilding(true);
        let res = rebuild::rebuild_device(&arc, &dev).map(|_| ());
        dev.set_rebuilding(false);
        res
    }

    pub(crate) fn device_by_guid(&self, vdev_guid: u64) -> Option<Arc<L2Device>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.vdev_guid() == vdev_guid)
            .cloned()
    }

    /// Runs one feed cycle immediately (tests and explicit kicks).
    pub(crate) fn feed_now(&self) {
        if let Some(arc) = self.arc.upgrade() {
            self.feed_cycle(&arc);
        }
    }

    /// Picks the next feedable device round-robin.
    fn next_device(&self) -> Option<Arc<L2Device>> {
        let devices = self.devices.read();
        if devices.is_empty() {
            return None;
        }
        let n = devices.len();
        let base = self.rotor.fetch_add(1, Ordering::Relaxed);
        for off in 0..n {
            let dev = &devices[(base + off) % n];
            if dev.is_alive() && !dev.is_rebuilding() {
                return Some(dev.clone());
            }
        }
        None
    }

    /// One feed cycle: pick a device, open a write window ahead of the
    /// hand, optionally trim it, then spill eligible buffers.
    fn feed_cycle(&self, arc: &Arc<ArcInner>) {
        let Some(dev) = self.next_device() else {
            return;
        };
        arc.stats.l2_feeds.inc();

        let tunables = &arc.tunables;
        let cold = dev.lock().first;
        let mut target = tunables.l2arc_write_max;
        if cold {
            target += tunables.l2arc_write_boost;
        }
        // Cap at a quarter of the device so one cycle cannot churn it.
        target = target.min((dev.end() - dev.start()) / 4).max(1);

        // Worst-case log-block overhead for this window.
        let lb_asize = align_up(LOG_BLK_RAW_SIZE, 1 << dev.ashift()) as u64;
        let max_entries = dev.log_entries() as u64;
        let overhead = (target / (SECTOR_SIZE as u64 * max_entries) + 1) * lb_asize;

        let mut window = target + overhead;
        if tunables.l2arc_trim_ahead > 0 {
            window = window * (100 + tunables.l2arc_trim_ahead) / 100;
        }
        dev.evict_bytes(arc, window, false);

        if tunables.l2arc_trim_ahead > 0 {
            dev.trim_ahead(window);
        }

        let wrote = feeder::write_buffers(arc, &dev, target);
        if wrote > 0 {
            debug!(
                "fed {} bytes to cache device {:#x}",
                wrote,
                dev.vdev_guid()
            );
            if tunables.l2arc_feed_again {
                self.feed_fast.store(true, Ordering::Release);
            }
        }
    }
}

impl Debug for L2Arc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2Arc")
            .field("devices", &self.devices.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{
        bio::MemDisk,
        cache::{
            hdr::HdrFlags,
            state::StateKind,
            testutil::{self, TestCache, SPA, TAG},
            BlkType, BlockPtr, MemPool, ReadFlags, WriteRequest,
        },
    };

    fn l2_tunables() -> ArcTunables {
        let mut tunables = testutil::small_tunables();
        tunables.l2arc_write_max = 512 * 1024;
        tunables.l2arc_write_boost = 0;
        tunables
    }

    fn block_payload(seed: u64, size: usize) -> Vec<u8> {
        (0..size).map(|j| (seed as u8) ^ (j as u8)).collect()
    }

    /// Writes `count` cache-device-eligible blocks and returns their
    /// pointers.
    fn write_l2_blocks(tc: &TestCache, base: u64, count: u64, size: u32) -> Vec<BlockPtr> {
        (0..count)
            .map(|i| {
                let mut buf = tc.cache.alloc_buf(SPA, BlkType::Data, size, TAG).unwrap();
                buf.write_from_slice(&block_payload(base + i, size as usize))
                    .unwrap();
                let bp = tc
                    .cache
                    .write(
                        &buf,
                        WriteRequest {
                            txg: base + i,
                            l2cache: true,
                            ..Default::default()
                        },
                    )
                    .unwrap();
                tc.cache.destroy_buf(buf, TAG);
                bp
            })
            .collect()
    }

    fn attach(
        tc: &TestCache,
        sectors: usize,
        log_entries: usize,
        guid: u64,
    ) -> (Arc<L2Device>, MemDisk) {
        let disk = MemDisk::create(sectors).unwrap();
        attach_disk(tc, disk, log_entries, guid)
    }

    fn attach_disk(
        tc: &TestCache,
        disk: MemDisk,
        log_entries: usize,
        guid: u64,
    ) -> (Arc<L2Device>, MemDisk) {
        let dev =
            L2Device::create(SPA, guid, Arc::new(disk.clone()), 9, log_entries).unwrap();
        tc.cache.inner().l2.attach_device(dev.clone()).unwrap();
        for _ in 0..1000 {
            if !dev.is_rebuilding() {
                break;
            }
            std::thread::sleep(core::time::Duration::from_millis(5));
        }
        assert!(!dev.is_rebuilding(), "rebuild did not finish");
        (dev, disk)
    }

    #[test]
    fn feed_then_hit_from_device() {
        let tc = testutil::new_cache(l2_tunables());
        let bps = write_l2_blocks(&tc, 1, 8, 16384);
        let (dev, _disk) = attach(&tc, 16384, 8, 0x1001);

        tc.cache.inner().l2.feed_now();
        assert!(dev.asize() > 0, "nothing was fed to the device");
        assert!(tc.cache.stats_snapshot().l2_writes_done >= 1);

        // Drop the L1 copies; the next read must be served by the device.
        let inner = tc.cache.inner().clone();
        inner.evict_state(StateKind::Mru, BlkType::Data, 0, u64::MAX);
        {
            let (hdr, _guard) = inner.table.find(SPA, &bps[0].identity()).unwrap();
            assert!(hdr.test_flags(HdrFlags::HAS_L2));
        }

        let buf = tc
            .cache
            .read_wait(SPA, &bps[0], ReadFlags::empty(), TAG)
            .unwrap();
        let mut out = alloc::vec![0u8; 16384];
        buf.copy_to_slice(&mut out);
        assert_eq!(out, block_payload(1, 16384));
        tc.cache.destroy_buf(buf, TAG);
        assert!(tc.cache.stats_snapshot().l2_hits >= 1);
        testutil::check_invariants(&tc);
    }

    #[test]
    fn hand_wraps_after_device_fills() {
        let mut tunables = l2_tunables();
        tunables.l2arc_write_max = 128 * 1024;
        let tc = testutil::new_cache(tunables);
        let (dev, _disk) = attach(&tc, 2048, 64, 0x1002);

        let mut max_hand = 0u64;
        let mut wrapped_hand = None;
        for round in 0..40u64 {
            write_l2_blocks(&tc, 1000 * (round + 1), 8, 16384);
            tc.cache.inner().l2.feed_now();
            let (hand, first) = {
                let inner = dev.lock();
                (inner.hand, inner.first)
            };
            if !first && hand < max_hand {
                wrapped_hand = Some(hand);
                break;
            }
            max_hand = max_hand.max(hand);
        }

        let hand = wrapped_hand.expect("the write hand never wrapped");
        assert!(hand < max_hand);
        assert!(!dev.lock().first);
    }

    #[test]
    fn rebuild_restores_headers_after_reimport() {
        let pool = Arc::new(MemPool::new());
        let (bps, disk) = {
            let tc = testutil::new_cache_with_pool(l2_tunables(), pool.clone());
            let bps = write_l2_blocks(&tc, 1, 12, 16384);
            let (_dev, disk) = attach(&tc, 16384, 8, 0x1003);
            tc.cache.inner().l2.feed_now();
            let snap = tc.cache.stats_snapshot();
            assert!(snap.l2_log_blk_writes >= 2, "expected a full and a partial commit");
            (bps, disk)
            // Dropping the cache here is the "export".
        };

        // "Import": a fresh cache over the same pool and the same device
        // contents.
        let tc = testutil::new_cache_with_pool(l2_tunables(), pool);
        let (_dev, _disk) = attach_disk(&tc, disk, 8, 0x1003);

        let snap = tc.cache.stats_snapshot();
        assert!(snap.l2_rebuild_success >= 1);
        assert_eq!(snap.l2_rebuild_bufs, 12);
        assert!(snap.l2_rebuild_log_blks >= 2);

        for (i, bp) in bps.iter().enumerate() {
            {
                let inner = tc.cache.inner();
                let (hdr, _guard) = inner
                    .table
                    .find(SPA, &bp.identity())
                    .expect("restored identity missing from the hash table");
                assert!(hdr.test_flags(HdrFlags::HAS_L2));
                assert!(!hdr.test_flags(HdrFlags::HAS_L1));
            }
            let buf = tc.cache.read_wait(SPA, bp, ReadFlags::empty(), TAG).unwrap();
            let mut out = alloc::vec![0u8; 16384];
            buf.copy_to_slice(&mut out);
            assert_eq!(out, block_payload(1 + i as u64, 16384));
            tc.cache.destroy_buf(buf, TAG);
        }
        assert!(tc.cache.stats_snapshot().l2_hits >= bps.len() as i64);
        testutil::check_invariants(&tc);
    }

    #[test]
    fn corrupt_device_header_reinitializes() {
        let tc = testutil::new_cache(l2_tunables());
        let disk = MemDisk::create(16384).unwrap();
        disk.write_slice(0, &[0xffu8; 4096]).unwrap();

        let (dev, _disk) = attach_disk(&tc, disk, 8, 0x1004);
        assert!(tc.cache.stats_snapshot().l2_rebuild_dh_errors >= 1);
        assert!(dev.lock().first);

        // The device is usable after reinitialization.
        write_l2_blocks(&tc, 50, 4, 16384);
        tc.cache.inner().l2.feed_now();
        assert!(dev.asize() > 0);
    }

    #[test]
    fn remove_vdev_severs_all_mappings() {
        let tc = testutil::new_cache(l2_tunables());
        let bps = write_l2_blocks(&tc, 1, 6, 16384);
        let (dev, _disk) = attach(&tc, 16384, 8, 0x1005);
        tc.cache.inner().l2.feed_now();
        assert!(dev.asize() > 0);

        tc.cache.l2_remove_vdev(0x1005);
        assert_eq!(dev.asize(), 0);
        let inner = tc.cache.inner();
        for bp in &bps {
            let (hdr, _guard) = inner.table.find(SPA, &bp.identity()).unwrap();
            assert!(!hdr.test_flags(HdrFlags::HAS_L2));
        }
        testutil::check_invariants(&tc);
    }
}
