// SPDX-License-Identifier: MPL-2.0

//! Cache states and the change-state protocol.
//!
//! Seven states partition all headers. Live states (`Mru`, `Mfu`,
//! `Uncached`) and ghost states keep their evictable members on per-type
//! multi-lists; `Anon` and `L2cOnly` headers are reachable only through
//! references or the hash table. Every movement of a header between
//! states funnels through `change_state`, which keeps the per-state size
//! and evictable-size accounting exact.
//!
//! Payload bytes of a header may only change while the header is *off*
//! its state list (some reference is held) or inside the eviction path,
//! which compensates the accounting itself. This keeps `esize` equal to
//! the bytes of refcnt-zero headers on each list.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{
    hdr::{identity_hash, BlkType, BufHdr, HdrCore, HdrFlags},
    multilist::{ListPayload, MultiList},
    read::ReadFlags,
    ArcInner,
};
use crate::{prelude::*, util::{RefTag, StripedSum}};

/// Minimum residency before an MRU hit promotes to MFU, in milliseconds.
pub(super) const ARC_MINTIME_MS: u64 = 62;

/// The seven cache states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StateKind {
    Anon = 0,
    Mru = 1,
    MruGhost = 2,
    Mfu = 3,
    MfuGhost = 4,
    L2cOnly = 5,
    Uncached = 6,
}

impl StateKind {
    pub const ALL: [StateKind; 7] = [
        StateKind::Anon,
        StateKind::Mru,
        StateKind::MruGhost,
        StateKind::Mfu,
        StateKind::MfuGhost,
        StateKind::L2cOnly,
        StateKind::Uncached,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Decodes a wire value (log entries persist the state in 3 bits).
    pub fn from_u8(v: u8) -> Result<Self> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(Error::with_msg(Unsupported, "unknown state value"))
    }

    /// Ghost states account identity without payload.
    pub fn is_ghost(self) -> bool {
        matches!(self, StateKind::MruGhost | StateKind::MfuGhost)
    }

    /// States that keep their evictable members on multi-lists.
    pub fn has_lists(self) -> bool {
        !matches!(self, StateKind::Anon | StateKind::L2cOnly)
    }
}

/// One cache state: per-type multi-lists plus size accounting.
pub struct ArcState {
    pub kind: StateKind,
    /// Per-type member lists; indexed by `BlkType::index`.
    pub lists: [MultiList; 2],
    /// Bytes held by members, per type.
    size: [AtomicU64; 2],
    /// Bytes held by refcnt-zero (listed) members, per type.
    esize: [AtomicU64; 2],
    /// Ghost re-reference bytes, per type; consumed by the adapter.
    pub ghost_hits: [StripedSum; 2],
}

impl ArcState {
    fn new(kind: StateKind, num_sublists: usize) -> Self {
        Self {
            kind,
            lists: [MultiList::new(num_sublists), MultiList::new(num_sublists)],
            size: [AtomicU64::new(0), AtomicU64::new(0)],
            esize: [AtomicU64::new(0), AtomicU64::new(0)],
            ghost_hits: [StripedSum::new(), StripedSum::new()],
        }
    }

    pub fn size_of(&self, ty: BlkType) -> u64 {
        self.size[ty.index()].load(Ordering::Acquire)
    }

    pub fn esize_of(&self, ty: BlkType) -> u64 {
        self.esize[ty.index()].load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> u64 {
        self.size_of(BlkType::Data) + self.size_of(BlkType::Metadata)
    }

    pub(super) fn add_size_for(&self, ty: BlkType, bytes: u64) {
        self.add_size(ty.index(), bytes);
    }

    pub(super) fn sub_size_for(&self, ty: BlkType, bytes: u64) {
        self.sub_size(ty.index(), bytes);
    }

    pub(super) fn sub_esize_for(&self, ty: BlkType, bytes: u64) {
        self.sub_esize(ty.index(), bytes);
    }

    fn add_size(&self, ty: usize, bytes: u64) {
        self.size[ty].fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub_size(&self, ty: usize, bytes: u64) {
        let prev = self.size[ty].fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "state size underflow");
    }

    fn add_esize(&self, ty: usize, bytes: u64) {
        self.esize[ty].fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub_esize(&self, ty: usize, bytes: u64) {
        let prev = self.esize[ty].fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "state esize underflow");
    }
}

impl Debug for ArcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcState")
            .field("kind", &self.kind)
            .field("data_size", &self.size_of(BlkType::Data))
            .field("metadata_size", &self.size_of(BlkType::Metadata))
            .finish_non_exhaustive()
    }
}

/// The container of all seven states.
#[derive(Debug)]
pub struct StateSet {
    states: [ArcState; 7],
}

impl StateSet {
    pub fn new(num_sublists: usize) -> Self {
        Self {
            states: StateKind::ALL.map(|kind| ArcState::new(kind, num_sublists)),
        }
    }

    pub fn state(&self, kind: StateKind) -> &ArcState {
        &self.states[kind.index()]
    }

    /// Sum of all state sizes; must equal the sizer's payload gauge.
    pub fn total_size(&self) -> u64 {
        self.states.iter().map(|s| s.total_size()).sum()
    }
}

/// Bytes a header contributes to the state it is in.
pub(super) fn contribution(core: &HdrCore, state: StateKind) -> u64 {
    if state.is_ghost() {
        core.lsize as u64
    } else {
        core.l1_payload_size()
    }
}

/// Moves a header between states, carrying list membership and size
/// accounting along.
///
/// The caller must hold the header's bucket lock, or the header must be
/// undiscoverable (anonymous identity).
pub(super) fn change_state(
    set: &StateSet,
    sizer: &super::sizer::Sizer,
    hdr: &Arc<BufHdr>,
    core: &mut HdrCore,
    new: StateKind,
) {
    let old = core.state();
    if old == new {
        return;
    }
    debug_assert!(core.l1.is_some(), "change_state on an L2-only header");
    let ty = hdr.blk_type().index();
    let evictable = hdr.refcnt().is_zero();

    // Leave the old list.
    if old.has_lists() {
        if let Some(link) = core.l1_mut().node.take() {
            debug_assert!(evictable);
            set.state(old).lists[ty].remove(link);
            set.state(old).sub_esize(ty, contribution(core, old));
        }
    }

    // Move the size contribution. Ghost membership is charged at the
    // logical size, so the global gauge moves with it.
    let old_contrib = contribution(core, old);
    let new_contrib = contribution(core, new);
    set.state(old).sub_size(ty, old_contrib);
    set.state(new).add_size(ty, new_contrib);
    sizer.add_size(new_contrib as i64 - old_contrib as i64);
    core.l1_mut().state = new;

    // Join the new list.
    if new.has_lists() && evictable {
        let hash = identity_hash(hdr.spa(), &core.ident);
        let link = set.state(new).lists[ty].insert_head(hash, hdr.clone());
        core.l1_mut().node = Some(link);
        set.state(new).add_esize(ty, contribution(core, new));
    }

    // Keep the persisted state snapshot fresh for the L2 log.
    if matches!(new, StateKind::Mru | StateKind::Mfu | StateKind::Uncached)
        && hdr.test_flags(HdrFlags::IN_HASH)
    {
        if let Some(l2) = core.l2.as_mut() {
            l2.arcs_state = new;
        }
    }
}

/// Adds a tagged reference; a 0 -> 1 transition pulls the header off its
/// state list (it is no longer evictable).
pub(super) fn add_ref(set: &StateSet, hdr: &Arc<BufHdr>, core: &mut HdrCore, tag: RefTag) -> u64 {
    let count = hdr.refcnt_add(tag);
    if count == 1 {
        let state = core.state();
        if state.has_lists() && core.l1.is_some() {
            if let Some(link) = core.l1_mut().node.take() {
                let ty = hdr.blk_type().index();
                set.state(state).lists[ty].remove(link);
                set.state(state).sub_esize(ty, contribution(core, state));
            }
        }
    }
    count
}

/// Drops a tagged reference; a 1 -> 0 transition re-inserts the header at
/// the head of its state list. The caller handles destruction for states
/// that do not retain unreferenced headers (`Anon`, `Uncached`).
pub(super) fn remove_ref(
    set: &StateSet,
    hdr: &Arc<BufHdr>,
    core: &mut HdrCore,
    tag: RefTag,
) -> u64 {
    let count = hdr.refcnt_remove(tag);
    if count == 0 {
        let state = core.state();
        if state.has_lists() && core.l1.is_some() {
            debug_assert!(core.l1().node.is_none());
            let ty = hdr.blk_type().index();
            let hash = identity_hash(hdr.spa(), &core.ident);
            let link = set.state(state).lists[ty].insert_head(hash, hdr.clone());
            core.l1_mut().node = Some(link);
            set.state(state).add_esize(ty, contribution(core, state));
        }
    }
    count
}

/// Adjusts state size for payload bytes attached to (positive) or
/// detached from (negative) an off-list header.
pub(super) fn payload_size_changed(
    set: &StateSet,
    hdr: &BufHdr,
    state: StateKind,
    delta: i64,
) {
    let ty = hdr.blk_type().index();
    if delta >= 0 {
        set.state(state).add_size(ty, delta as u64);
    } else {
        set.state(state).sub_size(ty, (-delta) as u64);
    }
}

impl ArcInner {
    /// The access-path state machine, executed under the bucket lock.
    ///
    /// `hit` is true when the access was served from memory; false for an
    /// access that had to start (or join) an I/O.
    pub(super) fn access(
        &self,
        hdr: &Arc<BufHdr>,
        core: &mut HdrCore,
        flags: ReadFlags,
        hit: bool,
    ) {
        let now = self.clock.ticks_ms();
        let new_prefetch = flags.intersects(ReadFlags::PREFETCH | ReadFlags::PRESCIENT_PREFETCH);
        let was_prefetch = hdr.test_flags(HdrFlags::PREFETCH | HdrFlags::PRESCIENT_PREFETCH);
        let lsize = core.lsize as i64;
        let ty = hdr.blk_type();

        match core.state() {
            StateKind::Anon => {
                // First access: set the prefetch provenance and admit.
                if new_prefetch {
                    let f = if flags.contains(ReadFlags::PRESCIENT_PREFETCH) {
                        HdrFlags::PRESCIENT_PREFETCH
                    } else {
                        HdrFlags::PREFETCH
                    };
                    hdr.set_flags(f);
                }
                core.l1_mut().access_ms = now;
                let target = if hdr.test_flags(HdrFlags::UNCACHED) {
                    StateKind::Uncached
                } else {
                    StateKind::Mru
                };
                change_state(&self.states, &self.sizer, hdr, core, target);
            }
            StateKind::Mru => {
                core.l1_mut().mru_hits += 1;
                self.stats.mru_hits.inc();
                if hdr.test_flags(HdrFlags::IO_IN_PROGRESS) {
                    // The in-flight read carries the promotion decision;
                    // just refresh recency.
                    core.l1_mut().access_ms = now;
                } else if was_prefetch {
                    // A prefetched block stays in MRU on its first real
                    // access; demand converts its provenance.
                    if !new_prefetch {
                        self.note_prefetch_conversion(hdr, hit);
                        hdr.clear_flags(HdrFlags::PREFETCH | HdrFlags::PRESCIENT_PREFETCH);
                    }
                    core.l1_mut().access_ms = now;
                } else if now.saturating_sub(core.l1().access_ms) >= ARC_MINTIME_MS {
                    core.l1_mut().access_ms = now;
                    change_state(&self.states, &self.sizer, hdr, core, StateKind::Mfu);
                } else {
                    core.l1_mut().access_ms = now;
                }
            }
            StateKind::MruGhost => {
                self.stats.mru_ghost_hits.inc();
                core.l1_mut().mru_ghost_hits += 1;
                self.states
                    .state(StateKind::MruGhost)
                    .ghost_hits[ty.index()]
                    .add(lsize);
                core.l1_mut().access_ms = now;
                let target = if new_prefetch {
                    StateKind::Mru
                } else {
                    StateKind::Mfu
                };
                change_state(&self.states, &self.sizer, hdr, core, target);
            }
            StateKind::Mfu => {
                core.l1_mut().mfu_hits += 1;
                self.stats.mfu_hits.inc();
                if was_prefetch && !new_prefetch && !hdr.test_flags(HdrFlags::IO_IN_PROGRESS) {
                    self.note_prefetch_conversion(hdr, hit);
                    hdr.clear_flags(HdrFlags::PREFETCH | HdrFlags::PRESCIENT_PREFETCH);
                }
                core.l1_mut().access_ms = now;
            }
            StateKind::MfuGhost => {
                self.stats.mfu_ghost_hits.inc();
                core.l1_mut().mfu_ghost_hits += 1;
                self.states
                    .state(StateKind::MfuGhost)
                    .ghost_hits[ty.index()]
                    .add(lsize);
                core.l1_mut().access_ms = now;
                change_state(&self.states, &self.sizer, hdr, core, StateKind::Mfu);
            }
            StateKind::L2cOnly => {
                // The caller attached a fresh L1 part; treat as new.
                core.l1_mut().access_ms = now;
                change_state(&self.states, &self.sizer, hdr, core, StateKind::Mru);
            }
            StateKind::Uncached => {
                self.stats.uncached_hits.inc();
                core.l1_mut().access_ms = now;
            }
        }
    }

    fn note_prefetch_conversion(&self, hdr: &BufHdr, hit: bool) {
        let prescient = hdr.test_flags(HdrFlags::PRESCIENT_PREFETCH);
        match (prescient, hit) {
            (true, true) => self.stats.demand_hit_prescient_prefetch.inc(),
            (true, false) => self.stats.demand_iohit_prescient_prefetch.inc(),
            (false, true) => self.stats.demand_hit_predictive_prefetch.inc(),
            (false, false) => self.stats.demand_iohit_predictive_prefetch.inc(),
        }
    }
}
