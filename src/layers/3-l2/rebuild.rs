// SPDX-License-Identifier: MPL-2.0

//! Persistent rebuild.
//!
//! At device attach the on-device header is validated and the log-block
//! chain walked newest-to-oldest. Each block is read, verified against
//! the checksum carried by its parent pointer, and its entries restored
//! as small L2-only headers in the hash table. While one block's entries
//! are being restored, the read of the next block is already in flight
//! (a two-deep pipeline), so decode overlaps I/O.
//!
//! Rebuild is opportunistic: any validation failure stops the walk and
//! reinitializes cleanly; a torn final write simply terminates the chain.

use super::{
    device::L2Device,
    log_blk::{
        dev_hdr_asize, DeviceHeaderPhys, LogBlkPtrPhys, LogEntryPhys, TrimState,
        DEV_HDR_VERSION, DH_FLAG_WRAPPED, LOG_BLK_MAX_ENTRIES, LOG_BLK_RAW_SIZE,
    },
};
use crate::{
    layers::{
        cache::{
            hdr::{self, BlkIdentity, BlkType, Dva, HdrFlags, L2Hdr},
            multilist::ListPayload,
            state::StateKind,
            ArcInner,
        },
        codec::Compression,
    },
    os::{self, JoinHandle},
    prelude::*,
};

/// Outcome of one rebuild attempt, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildStats {
    pub log_blks: u64,
    pub restored: u64,
    pub precached: u64,
}

/// Rebuilds the in-memory picture of one cache device from its header
/// and log chain. Never fails the attach: unusable contents are
/// reinitialized instead.
pub(super) fn rebuild_device(arc: &Arc<ArcInner>, dev: &Arc<L2Device>) -> Result<RebuildStats> {
    let mut stats = RebuildStats::default();

    let dh = match read_and_validate_hdr(arc, dev) {
        Some(dh) => dh,
        None => {
            reinitialize(dev)?;
            return Ok(stats);
        }
    };

    // Adopt the persisted cursors. The hand resumes after the newest
    // committed log block; anything written past it did not survive.
    {
        let newest = dh.start_lbps[0];
        let mut inner = dev.lock();
        inner.hand = if newest.is_null() {
            dh.evict
        } else {
            newest.daddr + newest.asize()
        };
        inner.evict = dh.evict.max(inner.hand);
        inner.first = dh.flags & DH_FLAG_WRAPPED == 0;
        inner.trim_state = TrimState::from_u32(dh.trim_state);
        inner.dev_hdr = dh;
        inner.lbptrs.clear();
    }

    if !arc.tunables.l2arc_rebuild_enabled {
        return Ok(stats);
    }
    if dev.end() - dev.start() < arc.tunables.l2arc_rebuild_blocks_min_l2size {
        debug!(
            "cache device {:#x} below the rebuild size floor; skipping",
            dev.vdev_guid()
        );
        return Ok(stats);
    }

    let entries_per_blk = (dh.log_entries as usize).min(LOG_BLK_MAX_ENTRIES);
    let mut lbps = [dh.start_lbps[0], dh.start_lbps[1]];
    let mut pending: Option<JoinHandle<Result<Vec<u8>>>> = None;
    let mut restored_mem = 0u64;

    // `lb_count` bounds the walk; a chain that loops through recycled
    // space cannot run forever.
    for _ in 0..dh.lb_count {
        if !dev.is_alive() || arc.is_shutting_down() {
            info!("rebuild of {:#x} cancelled", dev.vdev_guid());
            arc.stats.l2_rebuild_io_errors.inc();
            return Err(Error::with_msg(Cancelled, "rebuild cancelled"));
        }
        if lbps[0].is_null() || !lbptr_valid(dev, &lbps[0]) {
            break;
        }

        // Respect the restored-header memory cap.
        let warm = arc.sizer.size() > arc.sizer.c() / 2;
        let cap_base = if warm { arc.sizer.c() } else { arc.sizer.c_max() };
        if restored_mem > cap_base * arc.tunables.l2arc_meta_percent / 100 {
            arc.stats.l2_rebuild_lowmem.inc();
            warn!("rebuild of {:#x} stopped by the memory cap", dev.vdev_guid());
            break;
        }

        let io = pending.take().unwrap_or_else(|| issue_read(dev, lbps[0]));
        let bytes = match io.join() {
            Ok(Ok(bytes)) => bytes,
            _ => {
                arc.stats.l2_rebuild_io_errors.inc();
                break;
            }
        };
        let lb = match super::log_blk::decode_log_blk(&bytes, &lbps[0]) {
            Ok(lb) => lb,
            Err(e) => {
                // A torn tail write of the last epoch ends the chain.
                debug!("log block at {:#x} rejected: {}", lbps[0].daddr, e);
                arc.stats.l2_rebuild_cksum_lb_errors.inc();
                break;
            }
        };

        // Kick off the next read before decoding this block's entries.
        let next = [lbps[1], lb.prev_lbp];
        if !next[0].is_null() && lbptr_valid(dev, &next[0]) {
            pending = Some(issue_read(dev, next[0]));
        }

        // Newest entries first, so the device buflist keeps newest-at-
        // head ordering as older blocks append at the tail.
        for entry in lb.entries[..entries_per_blk].iter().rev() {
            if entry.is_empty() {
                continue;
            }
            restored_mem += hdr::hdr_l2only_size();
            match restore_entry(arc, dev, entry) {
                Restored::New => {
                    stats.restored += 1;
                    arc.stats.l2_rebuild_bufs.inc();
                }
                Restored::Attached => {
                    stats.precached += 1;
                    arc.stats.l2_rebuild_bufs_precached.inc();
                }
                Restored::Skipped => {}
            }
        }

        {
            let mut inner = dev.lock();
            inner.lbptrs.push_back(lbps[0]);
        }
        stats.log_blks += 1;
        arc.stats.l2_rebuild_log_blks.inc();
        lbps = next;
    }

    arc.stats.l2_rebuild_success.inc();
    info!(
        "rebuilt cache device {:#x}: {} log blocks, {} headers ({} pre-cached)",
        dev.vdev_guid(),
        stats.log_blks,
        stats.restored,
        stats.precached
    );
    Ok(stats)
}

/// Reads the device header and applies every acceptance check of the
/// rebuild contract. `None` means "reinitialize".
fn read_and_validate_hdr(arc: &ArcInner, dev: &Arc<L2Device>) -> Option<DeviceHeaderPhys> {
    let mut bytes = alloc::vec![0u8; dev_hdr_asize(dev.ashift())];
    if dev.storage().read_slice(0, &mut bytes).is_err() {
        arc.stats.l2_rebuild_io_errors.inc();
        return None;
    }
    let dh = match DeviceHeaderPhys::decode(&bytes) {
        Ok(dh) => dh,
        Err(_) => {
            arc.stats.l2_rebuild_dh_errors.inc();
            return None;
        }
    };
    if dh.version > DEV_HDR_VERSION {
        arc.stats.l2_rebuild_unsupported.inc();
        return None;
    }
    if dh.spa_guid != dev.spa_guid()
        || dh.vdev_guid != dev.vdev_guid()
        || dh.log_entries == 0
        || dh.log_entries > LOG_BLK_MAX_ENTRIES as u64
        || dh.start != dev.start()
        || dh.end != dev.end()
        || dh.evict < dh.start
        || dh.evict > dh.end
    {
        arc.stats.l2_rebuild_dh_errors.inc();
        return None;
    }
    // An interrupted trim may have destroyed arbitrary ranges.
    if TrimState::from_u32(dh.trim_state) == TrimState::InProgress
        && arc.tunables.l2arc_trim_ahead > 0
    {
        arc.stats.l2_rebuild_unsupported.inc();
        return None;
    }
    Some(dh)
}

/// Writes a fresh header, discarding any previous epoch.
fn reinitialize(dev: &Arc<L2Device>) -> Result<()> {
    let mut inner = dev.lock();
    inner.hand = dev.start();
    inner.evict = dev.start();
    inner.first = true;
    inner.dev_hdr = DeviceHeaderPhys::new(dev.spa_guid(), dev.vdev_guid(), dev.start(), dev.end());
    inner.dev_hdr.log_entries = dev.log_entries() as u64;
    inner.lbptrs.clear();
    dev.write_dev_hdr(&mut inner)
}

/// Structural validity of a log-block pointer: wholly inside the rotary
/// region, of a sane size, and not in recycled space.
fn lbptr_valid(dev: &Arc<L2Device>, lbp: &LogBlkPtrPhys) -> bool {
    let asize = lbp.asize();
    if asize == 0 || asize as usize > align_up(LOG_BLK_RAW_SIZE, 1 << dev.ashift()) {
        return false;
    }
    if lbp.daddr < dev.start() || lbp.daddr + asize > dev.end() {
        return false;
    }
    dev.range_holds(lbp.daddr, asize)
}

fn issue_read(dev: &Arc<L2Device>, lbp: LogBlkPtrPhys) -> JoinHandle<Result<Vec<u8>>> {
    let storage = dev.storage().clone();
    os::spawn(move || {
        let mut buf = alloc::vec![0u8; lbp.asize() as usize];
        storage.read_slice(lbp.daddr as usize, &mut buf)?;
        Ok(buf)
    })
}

enum Restored {
    New,
    Attached,
    Skipped,
}

/// Reconstructs one log entry as an L2-only header, or re-attaches the
/// device mapping to an already cached header.
fn restore_entry(arc: &Arc<ArcInner>, dev: &Arc<L2Device>, entry: &LogEntryPhys) -> Restored {
    let props = super::log_blk::EntryProps::unpack(entry.prop);
    let Ok(compress) = Compression::from_u8(props.compress) else {
        return Restored::Skipped;
    };
    let Ok(blk_type) = BlkType::from_u8(props.blk_type) else {
        return Restored::Skipped;
    };
    let arcs_state = match StateKind::from_u8(props.state) {
        Ok(s) if matches!(s, StateKind::Mru | StateKind::Mfu | StateKind::Uncached) => s,
        _ => StateKind::Mru,
    };
    if props.psize == 0 || props.psize > props.lsize {
        return Restored::Skipped;
    }
    let asize = dev.asize_of(props.psize);
    if !dev.range_holds(entry.daddr, asize) {
        return Restored::Skipped;
    }

    let ident = BlkIdentity {
        dva: Dva(entry.dva),
        birth: entry.birth,
    };
    let mut flags = HdrFlags::L2CACHE;
    if props.prefetch {
        flags |= HdrFlags::PREFETCH;
    }
    if props.protected {
        flags |= HdrFlags::PROTECTED;
    }
    if arc.tunables.compressed_arc_enabled && compress != Compression::Off {
        flags |= HdrFlags::COMPRESSED_ARC;
    }

    let restored = hdr::alloc_l2only(
        hdr::HdrAlloc {
            spa: dev.spa_guid(),
            blk_type,
            psize: props.psize,
            lsize: props.lsize,
            compress,
            complevel: entry.complevel,
            byteswap: false,
            crypt: None,
            flags,
        },
        ident,
        dev,
        entry.daddr,
        asize as u32,
        arcs_state,
    );

    let mut bucket = arc.table.lock_bucket(dev.spa_guid(), &ident);
    match arc.table.insert(&restored, &mut bucket, &arc.stats) {
        None => {
            let mut core = restored.core();
            let key = dev.lock().buflist.insert_tail(ListPayload::Hdr(restored.clone()));
            core.l2.as_mut().unwrap().node = Some(key);
            dev.note_hdr(props.lsize, asize);
            arc.stats.l2_rebuild_size.add(props.lsize as i64);
            arc.stats.l2_rebuild_asize.add(asize as i64);
            Restored::New
        }
        Some(existing) => {
            if existing.test_flags(HdrFlags::HAS_L2) {
                // Already mapped (or restored by the other chain head).
                return Restored::Skipped;
            }
            let mut core = existing.core();
            let key = dev.lock().buflist.insert_tail(ListPayload::Hdr(existing.clone()));
            core.l2 = Some(L2Hdr {
                dev: Arc::downgrade(dev),
                daddr: entry.daddr,
                asize: asize as u32,
                hits: 0,
                arcs_state: core.state(),
                node: Some(key),
            });
            existing.set_flags(HdrFlags::HAS_L2);
            dev.note_hdr(props.lsize, asize);
            Restored::Attached
        }
    }
}
