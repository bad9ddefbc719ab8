// SPDX-License-Identifier: MPL-2.0

//! The feed path of the second-level cache.
//!
//! A periodic task selects the next live device, invalidates a write
//! window ahead of the hand, then scans the tails of the MFU and MRU
//! lists for eligible headers and copies their physical payloads onto the
//! device. Every written header is recorded in the accumulating log
//! block; full log blocks (and, at the end of each cycle, a partial one)
//! are committed so that the device contents survive reboot.
//!
//! Payload bytes are staged under the bucket lock, so a concurrent
//! overwrite can never change data an in-flight device write is reading.

use super::{
    device::L2Device,
    log_blk::{EntryProps, LogBlkPtrPhys, LogEntryPhys},
};
use crate::{
    layers::cache::{
        hdr::{BlkType, BufHdr, HdrFlags, L2Hdr},
        multilist::ListPayload,
        state::StateKind,
        ArcInner,
    },
    prelude::*,
    util::fletcher4,
};

/// Upper bound on headers snapshotted per sublist visit.
const SCAN_CHUNK: usize = 512;

/// One feed pass over a device. Returns bytes written.
pub(super) fn write_buffers(arc: &ArcInner, dev: &Arc<L2Device>, target: u64) -> u64 {
    let passes: &[(StateKind, BlkType)] = if arc.tunables.l2arc_mfuonly {
        &[
            (StateKind::Mfu, BlkType::Metadata),
            (StateKind::Mfu, BlkType::Data),
        ]
    } else {
        &[
            (StateKind::Mfu, BlkType::Metadata),
            (StateKind::Mru, BlkType::Metadata),
            (StateKind::Mfu, BlkType::Data),
            (StateKind::Mru, BlkType::Data),
        ]
    };

    let mut headroom = arc.tunables.l2arc_headroom.saturating_mul(target);
    if headroom != 0 && arc.tunables.compressed_arc_enabled {
        // Compressed payloads pack denser; scan proportionally further.
        headroom = headroom * arc.tunables.l2arc_headroom_boost / 100;
    }
    let cold = dev.lock().first;
    let mut wrote = 0u64;
    let mut scanned = 0u64;

    'passes: for &(kind, ty) in passes {
        let ml = &arc.states.state(kind).lists[ty.index()];
        let n = ml.num_sublists();
        let first_sub = random_u64() as usize % n;

        for off in 0..n {
            let sub = (first_sub + off) % n;
            let candidates: Vec<Arc<BufHdr>> = {
                let guard = ml.lock(sub);
                let mut v = Vec::new();
                // A cold device fills from the fresh end of the lists;
                // a warm one takes the about-to-be-evicted tail.
                let mut cur = if cold { guard.head() } else { guard.tail() };
                while let Some(key) = cur {
                    if let ListPayload::Hdr(hdr) = guard.payload(key) {
                        v.push(hdr.clone());
                    }
                    cur = if cold { guard.next(key) } else { guard.prev(key) };
                    if v.len() >= SCAN_CHUNK {
                        break;
                    }
                }
                v
            };

            for hdr in candidates {
                if wrote >= target {
                    break 'passes;
                }
                if headroom != 0 && scanned >= headroom {
                    break 'passes;
                }
                let (s, w) = feed_one(arc, dev, &hdr, kind);
                scanned += s;
                wrote += w;
            }
        }
    }

    // Seal the cycle: commit the partial log block and persist the
    // device header so a crash from here rebuilds everything written.
    let mut inner = dev.lock();
    if inner.builder.idx > 0 {
        if let Err(e) = commit_log_blk(arc, dev, &mut inner) {
            warn!("log block commit failed: {}", e);
        }
    }
    if let Err(e) = dev.write_dev_hdr(&mut inner) {
        warn!("device header update failed: {}", e);
    }
    wrote
}

/// Attempts to feed one header. Returns (scanned, written) bytes.
fn feed_one(
    arc: &ArcInner,
    dev: &Arc<L2Device>,
    hdr: &Arc<BufHdr>,
    expected_state: StateKind,
) -> (u64, u64) {
    if !dev.is_alive() {
        return (0, 0);
    }
    let Some(peek) = hdr.try_core() else {
        arc.stats.l2_writes_lock_retry.inc();
        return (0, 0);
    };
    let ident = peek.ident;
    let scanned = peek.lsize as u64;
    drop(peek);
    if ident.is_anon() {
        return (scanned, 0);
    }

    let Some(_bucket) = arc.table.try_lock_bucket(hdr.spa(), &ident) else {
        arc.stats.l2_writes_lock_retry.inc();
        return (scanned, 0);
    };
    let mut core = hdr.core();

    // Revalidate and judge eligibility under the lock.
    if core.ident != ident || core.state() != expected_state {
        return (scanned, 0);
    }
    if hdr.spa() != dev.spa_guid() {
        return (scanned, 0);
    }
    if hdr.test_flags(HdrFlags::HAS_L2 | HdrFlags::IO_IN_PROGRESS) {
        return (scanned, 0);
    }
    if !hdr.test_flags(HdrFlags::L2CACHE) {
        return (scanned, 0);
    }
    if arc.tunables.l2arc_noprefetch
        && hdr.test_flags(HdrFlags::PREFETCH | HdrFlags::PRESCIENT_PREFETCH)
    {
        return (scanned, 0);
    }
    let payload = if hdr.test_flags(HdrFlags::PROTECTED) {
        core.l1().rabd.as_ref()
    } else {
        core.l1().pabd.as_ref()
    };
    let Some(payload) = payload else {
        return (scanned, 0);
    };

    // Stage the exact on-device bytes now, zero-padded to the allocated
    // size. The padded tail is written as-is; integrity of the payload
    // rests on the consumer's block-pointer checksum, so silent device
    // corruption surfaces as an ordinary checksum miss and falls back to
    // the primary pool.
    let asize = dev.asize_of(core.psize);
    let mut staged = payload.as_slice().to_vec();
    staged.resize(asize as usize, 0);

    let daddr = {
        let mut inner = dev.lock();
        let Some(daddr) = L2Device::reserve(&mut inner, dev.end(), asize) else {
            // Out of room this epoch; the next cycle wraps the hand.
            return (scanned, 0);
        };
        let node = inner.buflist.insert_head(ListPayload::Hdr(hdr.clone()));
        core.l2 = Some(L2Hdr {
            dev: Arc::downgrade(dev),
            daddr,
            asize: asize as u32,
            hits: 0,
            arcs_state: core.state(),
            node: Some(node),
        });
        hdr.set_flags(HdrFlags::HAS_L2 | HdrFlags::L2_WRITING);
        dev.note_hdr(core.lsize, asize);

        // Record the entry in the accumulating log block.
        let slot = inner.builder.idx;
        inner.builder.lb.entries[slot] = LogEntryPhys {
            dva: ident.dva.0,
            birth: ident.birth,
            daddr,
            prop: EntryProps {
                lsize: core.lsize,
                psize: core.psize,
                compress: core.compress.as_u8(),
                blk_type: hdr.blk_type() as u8,
                protected: hdr.test_flags(HdrFlags::PROTECTED),
                prefetch: hdr.test_flags(HdrFlags::PREFETCH),
                state: core.state() as u8,
            }
            .pack(),
            complevel: core.complevel,
            pad: [0; 7],
        };
        if inner.builder.idx == 0 {
            inner.builder.payload_start = daddr;
        }
        inner.builder.idx += 1;
        inner.builder.payload_asize += asize;
        daddr
    };
    drop(core);
    drop(_bucket);

    arc.stats.l2_writes_sent.inc();
    match dev.storage().write_slice(daddr as usize, &staged) {
        Ok(()) => {
            arc.stats.l2_writes_done.inc();
            arc.stats.l2_write_bytes.add(asize as i64);
            hdr.clear_flags(HdrFlags::L2_WRITING);
            // A full log block may only be committed once every payload
            // it describes is on the device.
            let mut inner = dev.lock();
            if inner.builder.idx >= dev.log_entries() {
                if let Err(e) = commit_log_blk(arc, dev, &mut inner) {
                    warn!("log block commit failed: {}", e);
                }
            }
            (scanned, asize)
        }
        Err(e) => {
            warn!("cache device write at {:#x} failed: {}", daddr, e);
            arc.stats.l2_writes_error.inc();
            backout_failed_write(arc, dev, hdr, daddr);
            (scanned, 0)
        }
    }
}

/// Reverts the header and log-entry effects of a failed device write.
fn backout_failed_write(arc: &ArcInner, dev: &Arc<L2Device>, hdr: &Arc<BufHdr>, daddr: u64) {
    let ident = hdr.core().ident;
    let _bucket = arc.table.lock_bucket(hdr.spa(), &ident);
    let mut core = hdr.core();
    if let Some(l2) = core.l2.take() {
        dev.forget_hdr(&l2, core.lsize, core.psize);
    }
    hdr.clear_flags(HdrFlags::HAS_L2 | HdrFlags::L2_WRITING);
    drop(core);

    // Drop the uncommitted log entry so rebuild never resurrects it.
    let mut inner = dev.lock();
    for i in 0..inner.builder.idx {
        if inner.builder.lb.entries[i].daddr == daddr {
            inner.builder.lb.entries[i] = LogEntryPhys::default();
        }
    }
}

/// Commits the accumulated log block: compress, pad, checksum, write at
/// the hand, and advance the two-entry chain-head window.
pub(super) fn commit_log_blk(
    arc: &ArcInner,
    dev: &Arc<L2Device>,
    inner: &mut super::device::L2DevInner,
) -> Result<()> {
    debug_assert!(inner.builder.idx > 0);
    inner.builder.lb.prev_lbp = inner.dev_hdr.start_lbps[0];

    let (bytes, asize, compress) = super::log_blk::encode_log_blk(&inner.builder.lb, dev.ashift());
    let Some(daddr) = L2Device::reserve(inner, dev.end(), asize) else {
        return_errno_with_msg!(OutOfSpace, "no room for a log block this epoch");
    };
    dev.storage().write_slice(daddr as usize, &bytes)?;

    let lbp = LogBlkPtrPhys {
        daddr,
        payload_start: inner.builder.payload_start,
        payload_asize: inner.builder.payload_asize,
        prop: LogBlkPtrPhys::pack_prop(asize, compress),
        cksum: fletcher4(&bytes).words(),
    };
    inner.dev_hdr.start_lbps[1] = inner.dev_hdr.start_lbps[0];
    inner.dev_hdr.start_lbps[0] = lbp;
    inner.dev_hdr.lb_count += 1;
    inner.dev_hdr.lb_asize += asize;
    inner.lbptrs.push_front(lbp);
    inner.builder.reset();

    arc.stats.l2_log_blk_writes.inc();
    arc.stats.l2_log_blk_count.inc();
    arc.stats.l2_write_bytes.add(asize as i64);
    trace!("committed log block at {:#x} ({} bytes)", daddr, asize);
    Ok(())
}

fn random_u64() -> u64 {
    use crate::util::Rng as _;
    let mut bytes = [0u8; 8];
    let _ = crate::os::Rng::new(&[]).fill_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}
