// SPDX-License-Identifier: MPL-2.0

//! Ghost-driven target tuning.
//!
//! Re-references of ghost-state identities are the signal that a list was
//! evicted too aggressively. Before each eviction pass the adapter turns
//! the ghost-hit byte counters accumulated since the previous pass into
//! nudges of the three fixed-point split fractions: metadata share of the
//! target, and the MRU share of data and of metadata.

use super::{hdr::BlkType, sizer::Sizer, state::StateKind, state::StateSet};
use crate::{os::Mutex, prelude::*};

/// Saved ghost-hit totals from the previous pass:
/// `[mru_data, mru_meta, mfu_data, mfu_meta]`.
#[derive(Debug, Default)]
pub struct Adapter {
    saved: Mutex<[i64; 4]>,
}

/// Nudges a 32-bit fixed-point fraction by `up` and `down` byte weights
/// observed against `total` bytes of ghost size. Small totals leave the
/// fraction unchanged (hysteresis); internal rescaling keeps maximal
/// dynamic range without overflow.
pub(super) fn adjust(frac: u32, total: u64, up: u64, down: u64, balance: u64) -> u32 {
    if total < 8 || up + down == 0 {
        return frac;
    }
    let (mut up, mut down) = (up, down);

    // There should not be more ghost hits than ghost size, but they may
    // get close; restrict the maximum adjustment in that case.
    if up + down >= total / 4 {
        let scale = (up + down) / (total / 8);
        up /= scale;
        down /= scale;
    }

    // Get maximal dynamic range by choosing optimal shifts.
    let highbit = 64 - total.leading_zeros();
    let s = (64 - highbit).min(32);

    let frac64 = frac as u64;
    let ofrac = (1u64 << 32) - frac64;

    if frac64 >= 4 * ofrac {
        up /= frac64 / (2 * ofrac + 1);
    }
    up = (up << s) / (total >> (32 - s));
    if ofrac >= 4 * frac64 {
        down /= ofrac / (2 * frac64 + 1);
    }
    down = (down << s) / (total >> (32 - s));
    down = down * 100 / balance;

    (frac64 + up).saturating_sub(down).min(u32::MAX as u64) as u32
}

impl Adapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes `meta`, `pd` and `pm` from the ghost hits accumulated
    /// since the previous call. Runs before each eviction pass.
    pub(super) fn recompute(&self, states: &StateSet, sizer: &Sizer, meta_balance: u64) {
        let hit = |kind: StateKind, ty: BlkType| -> i64 {
            states.state(kind).ghost_hits[ty.index()].value()
        };
        let new = [
            hit(StateKind::MruGhost, BlkType::Data),
            hit(StateKind::MruGhost, BlkType::Metadata),
            hit(StateKind::MfuGhost, BlkType::Data),
            hit(StateKind::MfuGhost, BlkType::Metadata),
        ];

        let mut saved = self.saved.lock();
        let delta = |i: usize| -> u64 { new[i].saturating_sub(saved[i]).max(0) as u64 };
        let (grd, grm, gfd, gfm) = (delta(0), delta(1), delta(2), delta(3));
        *saved = new;
        drop(saved);

        let gsrd = states.state(StateKind::MruGhost).size_of(BlkType::Data);
        let gsrm = states.state(StateKind::MruGhost).size_of(BlkType::Metadata);
        let gsfd = states.state(StateKind::MfuGhost).size_of(BlkType::Data);
        let gsfm = states.state(StateKind::MfuGhost).size_of(BlkType::Metadata);

        sizer.set_meta(adjust(
            sizer.meta(),
            gsrd + gsrm + gsfd + gsfm,
            grm + gfm,
            grd + gfd,
            meta_balance,
        ));
        sizer.set_pd(adjust(sizer.pd(), gsrd + gsfd, grd, gfd, 100));
        sizer.set_pm(adjust(sizer.pm(), gsrm + gsfm, grm, gfm, 100));

        trace!(
            "adapter: meta={:#x} pd={:#x} pm={:#x}",
            sizer.meta(),
            sizer.pd(),
            sizer.pm()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::adjust;

    #[test]
    fn small_totals_are_hysteretic() {
        assert_eq!(adjust(1 << 30, 4, 100, 0, 500), 1 << 30);
        assert_eq!(adjust(1 << 30, 1 << 20, 0, 0, 500), 1 << 30);
    }

    #[test]
    fn up_hits_raise_the_fraction() {
        let frac = 1 << 30;
        let adjusted = adjust(frac, 10 << 20, 1 << 20, 0, 500);
        assert!(adjusted > frac);
    }

    #[test]
    fn down_hits_lower_the_fraction() {
        let frac = 1 << 30;
        let adjusted = adjust(frac, 10 << 20, 0, 1 << 20, 100);
        assert!(adjusted < frac);
    }

    #[test]
    fn heavy_hits_are_rescaled_not_overflowing() {
        let frac = u32::MAX - 1;
        // Hits close to the total trip the rescale path.
        let adjusted = adjust(frac, 1 << 20, 1 << 19, 1 << 19, 500);
        assert!(adjusted <= u32::MAX);
    }
}
