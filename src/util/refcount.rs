// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(debug_assertions)]
use crate::os::{HashMap, Mutex};

/// An opaque holder identity for a tagged reference.
///
/// Tags let debug builds verify that every `add` is matched by a `remove`
/// from the same holder; release builds keep only the bare count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RefTag(pub &'static str);

/// A reference count whose acquisitions are attributed to holders.
pub struct TaggedRefcount {
    count: AtomicU64,
    #[cfg(debug_assertions)]
    tags: Mutex<HashMap<&'static str, u64>>,
}

impl TaggedRefcount {
    /// Creates a zero count with no holders.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            tags: Mutex::new(HashMap::new()),
        }
    }

    /// Adds one reference held by `tag`, returning the new count.
    pub fn add(&self, tag: RefTag) -> u64 {
        #[cfg(debug_assertions)]
        {
            *self.tags.lock().entry(tag.0).or_insert(0) += 1;
        }
        #[cfg(not(debug_assertions))]
        let _ = tag;
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Removes one reference held by `tag`, returning the new count.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `tag` holds no reference.
    pub fn remove(&self, tag: RefTag) -> u64 {
        #[cfg(debug_assertions)]
        {
            let mut tags = self.tags.lock();
            let held = tags
                .get_mut(tag.0)
                .unwrap_or_else(|| panic!("removing untracked ref tag {:?}", tag.0));
            *held -= 1;
            if *held == 0 {
                tags.remove(tag.0);
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = tag;
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow");
        prev - 1
    }

    /// Returns the current count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns whether no references are held.
    pub fn is_zero(&self) -> bool {
        self.count() == 0
    }
}

impl Default for TaggedRefcount {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for TaggedRefcount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaggedRefcount")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_matches() {
        let rc = TaggedRefcount::new();
        assert!(rc.is_zero());
        assert_eq!(rc.add(RefTag("io")), 1);
        assert_eq!(rc.add(RefTag("consumer")), 2);
        assert_eq!(rc.remove(RefTag("io")), 1);
        assert_eq!(rc.remove(RefTag("consumer")), 0);
        assert!(rc.is_zero());
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn unmatched_tag_panics() {
        let rc = TaggedRefcount::new();
        rc.add(RefTag("a"));
        rc.remove(RefTag("b"));
    }
}
