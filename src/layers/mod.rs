// SPDX-License-Identifier: MPL-2.0

#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "2-cache/mod.rs"]
pub mod cache;
#[path = "1-codec/mod.rs"]
pub mod codec;
#[path = "3-l2/mod.rs"]
pub mod l2;
