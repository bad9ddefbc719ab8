// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicI64, Ordering};

use crate::os::CurrentThread;

const NUM_STRIPES: usize = 16;

/// A write-mostly counter striped across cells to keep hot-path updates
/// from contending on one cache line. Totals are summed lazily.
pub struct StripedSum {
    cells: [AtomicI64; NUM_STRIPES],
}

impl StripedSum {
    /// Creates a zeroed sum.
    pub const fn new() -> Self {
        const ZERO: AtomicI64 = AtomicI64::new(0);
        Self {
            cells: [ZERO; NUM_STRIPES],
        }
    }

    /// Adds `delta` to the counter.
    pub fn add(&self, delta: i64) {
        let stripe = CurrentThread::id() as usize % NUM_STRIPES;
        self.cells[stripe].fetch_add(delta, Ordering::Relaxed);
    }

    /// Increments the counter by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Returns the current total.
    pub fn value(&self) -> i64 {
        self.cells
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for StripedSum {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for StripedSum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("StripedSum").field(&self.value()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::StripedSum;

    #[test]
    fn concurrent_adds_sum_up() {
        let sum = std::sync::Arc::new(StripedSum::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sum = sum.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        sum.add(3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sum.value(), 8 * 1000 * 3);
    }
}
