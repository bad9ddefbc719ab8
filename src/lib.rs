// SPDX-License-Identifier: MPL-2.0

#![deny(unsafe_code)]
#![allow(dead_code, unused_imports)]

mod config;
mod error;
mod layers;
mod os;
mod prelude;
mod util;

extern crate alloc;

pub use self::{
    config::ArcTunables,
    error::{Errno, Error},
    layers::{
        bio::{Abd, BlockSet, MemDisk, SectorId, SECTOR_SIZE},
        cache::{
            ArcBuf, ArcCache, ArcOptions, ArcStatsSnapshot, BlkIdentity, BlkType, BlockPtr,
            CryptParams, Dva, MemPool, MemoryMonitor, NoPressure, PoolIo, ReadDone, ReadFlags,
            RefTag, WriteProps, WriteRequest,
        },
        codec::Compression,
        l2::{L2Device, RebuildStats},
    },
    os::{Aead, AeadIv, AeadKey, AeadMac, Clock, ManualClock, Rng, SystemClock},
    util::{Aead as _, RandomInit, Rng as _},
};
