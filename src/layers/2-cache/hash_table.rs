// SPDX-License-Identifier: MPL-2.0

//! The identity-keyed hash table.
//!
//! Open chaining over a fixed number of buckets; each chain is guarded by
//! a mutex drawn from a small fixed shard array indexed by bucket bits.
//! `find` follows the return-with-lock protocol: on a hit the bucket lock
//! is returned held, and every mutation of a discoverable header happens
//! under it.

use super::{
    hdr::{identity_hash, BlkIdentity, BufHdr, HdrFlags},
    stats::ArcStats,
};
use crate::{
    os::{Mutex, MutexGuard},
    prelude::*,
};

/// Number of bucket locks; buckets map onto locks by their low bits.
const HT_LOCK_COUNT: usize = 2048;

struct Shard {
    /// The chains of every bucket owned by this shard, indexed by
    /// `bucket / HT_LOCK_COUNT`.
    chains: Vec<Vec<Arc<BufHdr>>>,
}

/// The bucket lock held across a find/insert/remove sequence.
pub struct BucketGuard<'a> {
    shard: MutexGuard<'a, Shard>,
    /// Index of the chain within the shard.
    chain: usize,
    /// The hash that selected the bucket; inserts must agree.
    hash: u64,
}

pub struct HashTable {
    shards: Vec<Mutex<Shard>>,
    nbuckets: usize,
}

impl HashTable {
    /// Creates a table with at least `nbuckets` buckets (rounded up to a
    /// power of two, floor `HT_LOCK_COUNT`).
    pub fn new(nbuckets: usize) -> Self {
        let nbuckets = nbuckets.next_power_of_two().max(HT_LOCK_COUNT);
        let chains_per_shard = nbuckets / HT_LOCK_COUNT;
        let shards = (0..HT_LOCK_COUNT)
            .map(|_| {
                Mutex::new(Shard {
                    chains: (0..chains_per_shard).map(|_| Vec::new()).collect(),
                })
            })
            .collect();
        Self { shards, nbuckets }
    }

    pub fn nbuckets(&self) -> usize {
        self.nbuckets
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.nbuckets - 1)
    }

    /// Locks the bucket an identity maps to.
    pub fn lock_bucket(&self, guid: u64, ident: &BlkIdentity) -> BucketGuard<'_> {
        let hash = identity_hash(guid, ident);
        let bucket = self.bucket_of(hash);
        let shard = self.shards[bucket % HT_LOCK_COUNT].lock();
        BucketGuard {
            shard,
            chain: bucket / HT_LOCK_COUNT,
            hash,
        }
    }

    /// Attempts to lock the bucket an identity maps to without blocking.
    pub fn try_lock_bucket(&self, guid: u64, ident: &BlkIdentity) -> Option<BucketGuard<'_>> {
        let hash = identity_hash(guid, ident);
        let bucket = self.bucket_of(hash);
        let shard = self.shards[bucket % HT_LOCK_COUNT].try_lock()?;
        Some(BucketGuard {
            shard,
            chain: bucket / HT_LOCK_COUNT,
            hash,
        })
    }

    /// Looks up an identity. On a hit, returns the header together with
    /// its bucket lock held; on a miss the lock is dropped.
    pub fn find(&self, guid: u64, ident: &BlkIdentity) -> Option<(Arc<BufHdr>, BucketGuard<'_>)> {
        let guard = self.lock_bucket(guid, ident);
        let hdr = Self::find_in(&guard, guid, ident)?;
        Some((hdr, guard))
    }

    /// Looks up an identity in an already locked bucket.
    pub fn find_in(guard: &BucketGuard<'_>, guid: u64, ident: &BlkIdentity) -> Option<Arc<BufHdr>> {
        guard.shard.chains[guard.chain]
            .iter()
            .find(|hdr| hdr.spa() == guid && hdr.core().ident == *ident)
            .cloned()
    }

    /// Inserts `hdr` at the chain head. If an equal header already exists,
    /// returns it without inserting; the lock is kept held either way.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the guard does not correspond to the
    /// header's identity.
    pub fn insert(
        &self,
        hdr: &Arc<BufHdr>,
        guard: &mut BucketGuard<'_>,
        stats: &ArcStats,
    ) -> Option<Arc<BufHdr>> {
        let (guid, ident) = (hdr.spa(), hdr.core().ident);
        debug_assert!(!ident.is_anon(), "inserting an anonymous header");
        debug_assert_eq!(guard.hash, identity_hash(guid, &ident));

        if let Some(existing) = Self::find_in(guard, guid, &ident) {
            return Some(existing);
        }

        let chain = &mut guard.shard.chains[guard.chain];
        if !chain.is_empty() {
            stats.hash_collisions.inc();
            if chain.len() == 1 {
                stats.hash_chains.inc();
            }
        }
        chain.insert(0, hdr.clone());
        stats.note_chain_len(chain.len());
        hdr.set_flags(HdrFlags::IN_HASH);
        None
    }

    /// Unlinks `hdr` from its chain.
    ///
    /// # Panics
    ///
    /// Panics if the header is not in the table.
    pub fn remove(&self, hdr: &Arc<BufHdr>, guard: &mut BucketGuard<'_>, stats: &ArcStats) {
        debug_assert!(hdr.test_flags(HdrFlags::IN_HASH));
        let chain = &mut guard.shard.chains[guard.chain];
        let pos = chain
            .iter()
            .position(|h| Arc::ptr_eq(h, hdr))
            .expect("header not found in its hash chain");
        chain.remove(pos);
        if chain.len() == 1 {
            stats.hash_chains.add(-1);
        }
        hdr.clear_flags(HdrFlags::IN_HASH);
    }
}

impl Debug for HashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("nbuckets", &self.nbuckets)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{
        cache::hdr::{alloc_full, BlkType, Dva, HdrAlloc},
        codec::Compression,
    };

    fn new_hdr(spa: u64, dva_lo: u64, birth: u64) -> Arc<BufHdr> {
        let hdr = alloc_full(HdrAlloc {
            spa,
            blk_type: BlkType::Data,
            psize: 512,
            lsize: 512,
            compress: Compression::Off,
            complevel: 0,
            byteswap: false,
            crypt: None,
            flags: HdrFlags::empty(),
        });
        hdr.core().ident = BlkIdentity {
            dva: Dva([dva_lo, 0]),
            birth,
        };
        hdr
    }

    #[test]
    fn insert_find_remove() {
        let table = HashTable::new(1 << 12);
        let stats = ArcStats::new();
        let hdr = new_hdr(1, 0x1000, 5);
        let ident = hdr.core().ident;

        assert!(table.find(1, &ident).is_none());

        let mut guard = table.lock_bucket(1, &ident);
        assert!(table.insert(&hdr, &mut guard, &stats).is_none());
        assert!(hdr.test_flags(HdrFlags::IN_HASH));
        drop(guard);

        let (found, guard) = table.find(1, &ident).unwrap();
        assert!(Arc::ptr_eq(&found, &hdr));
        drop(guard);

        // Same identity in a different pool is a distinct block.
        assert!(table.find(2, &ident).is_none());

        let mut guard = table.lock_bucket(1, &ident);
        table.remove(&hdr, &mut guard, &stats);
        drop(guard);
        assert!(!hdr.test_flags(HdrFlags::IN_HASH));
        assert!(table.find(1, &ident).is_none());
    }

    #[test]
    fn insert_returns_existing_without_duplicating() {
        let table = HashTable::new(1 << 12);
        let stats = ArcStats::new();
        let first = new_hdr(1, 0x2000, 9);
        let second = new_hdr(1, 0x2000, 9);
        let ident = first.core().ident;

        let mut guard = table.lock_bucket(1, &ident);
        assert!(table.insert(&first, &mut guard, &stats).is_none());
        let existing = table.insert(&second, &mut guard, &stats).unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
        assert!(!second.test_flags(HdrFlags::IN_HASH));
    }
}
