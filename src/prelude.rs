// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};

pub(crate) use crate::{
    error::{Errno::*, Error},
    layers::bio::{SectorId, SECTOR_SIZE},
    return_errno, return_errno_with_msg,
    util::{align_down, align_up},
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use core::fmt::{self, Debug};

pub(crate) use log::{debug, error, info, trace, warn};
