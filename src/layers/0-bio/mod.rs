// SPDX-License-Identifier: MPL-2.0

//! The layer of untrusted block I/O.

mod abd;
mod block_set;

use static_assertions::const_assert;

pub use self::{
    abd::Abd,
    block_set::{BlockSet, MemDisk},
};

pub type SectorId = usize;
pub const SECTOR_SIZE: usize = 512;
pub const SID_SIZE: usize = core::mem::size_of::<SectorId>();

// This definition of `SectorId` assumes the target architecture is 64-bit.
const_assert!(SID_SIZE == 8);
