// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;

use crate::{error::Errno, os::Mutex, prelude::*};

/// A fixed set of storage sectors that can support random reads and writes.
///
/// # Thread safety
///
/// `BlockSet` is a data structure of interior mutability.
/// It is ok to perform I/O on a `BlockSet` concurrently in multiple threads.
/// `BlockSet` promises the atomicity of reading and writing individual
/// sectors.
pub trait BlockSet: Send + Sync {
    /// Read one or multiple sectors at a specified position.
    ///
    /// The buffer length must be a multiple of `SECTOR_SIZE`.
    fn read(&self, pos: SectorId, buf: &mut [u8]) -> Result<()>;

    /// Read a slice of bytes at a specified byte offset.
    ///
    /// Runs of whole sectors transfer straight into `buf`; a ragged edge
    /// bounces through a one-sector scratch.
    fn read_slice(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() > self.nsectors() * SECTOR_SIZE {
            return_errno_with_msg!(Errno::InvalidArgs, "read_slice goes past the device");
        }

        let mut pos = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let sector = pos / SECTOR_SIZE;
            let skew = pos % SECTOR_SIZE;
            if skew == 0 && buf.len() - filled >= SECTOR_SIZE {
                let run = (buf.len() - filled) / SECTOR_SIZE * SECTOR_SIZE;
                self.read(sector, &mut buf[filled..filled + run])?;
                pos += run;
                filled += run;
                continue;
            }
            let take = (SECTOR_SIZE - skew).min(buf.len() - filled);
            let mut scratch = [0u8; SECTOR_SIZE];
            self.read(sector, &mut scratch)?;
            buf[filled..filled + take].copy_from_slice(&scratch[skew..skew + take]);
            pos += take;
            filled += take;
        }
        Ok(())
    }

    /// Write one or multiple sectors at a specified position.
    ///
    /// The buffer length must be a multiple of `SECTOR_SIZE`.
    fn write(&self, pos: SectorId, buf: &[u8]) -> Result<()>;

    /// Write a slice of bytes at a specified byte offset.
    ///
    /// Runs of whole sectors are written directly; a ragged edge is
    /// merged into the sector's existing bytes via read-modify-write.
    fn write_slice(&self, offset: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() > self.nsectors() * SECTOR_SIZE {
            return_errno_with_msg!(Errno::InvalidArgs, "write_slice goes past the device");
        }

        let mut pos = offset;
        let mut taken = 0;
        while taken < buf.len() {
            let sector = pos / SECTOR_SIZE;
            let skew = pos % SECTOR_SIZE;
            if skew == 0 && buf.len() - taken >= SECTOR_SIZE {
                let run = (buf.len() - taken) / SECTOR_SIZE * SECTOR_SIZE;
                self.write(sector, &buf[taken..taken + run])?;
                pos += run;
                taken += run;
                continue;
            }
            let span = (SECTOR_SIZE - skew).min(buf.len() - taken);
            let mut scratch = [0u8; SECTOR_SIZE];
            self.read(sector, &mut scratch)?;
            scratch[skew..skew + span].copy_from_slice(&buf[taken..taken + span]);
            self.write(sector, &scratch)?;
            pos += span;
            taken += span;
        }
        Ok(())
    }

    /// Get a subset of the sectors in the block set.
    fn subset(&self, range: Range<SectorId>) -> Result<Self>
    where
        Self: Sized;

    /// Discard a range of sectors, hinting the device that their contents
    /// are no longer needed. Contents of a trimmed range are undefined.
    fn trim(&self, _range: Range<SectorId>) -> Result<()> {
        Ok(())
    }

    /// Ensure that sectors are persisted to the device.
    fn flush(&self) -> Result<()>;

    /// Returns the number of sectors.
    fn nsectors(&self) -> usize;
}

/// An in-memory disk that impls `BlockSet`.
///
/// The `region` is the accessible subset.
#[derive(Clone)]
pub struct MemDisk {
    disk: Arc<Mutex<Vec<u8>>>,
    region: Range<SectorId>,
}

impl MemDisk {
    /// Create a `MemDisk` with the number of sectors.
    pub fn create(num_sectors: usize) -> Result<Self> {
        if num_sectors == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "empty MemDisk is not allowed");
        }
        Ok(Self {
            disk: Arc::new(Mutex::new(alloc::vec![0u8; num_sectors * SECTOR_SIZE])),
            region: Range {
                start: 0,
                end: num_sectors,
            },
        })
    }

    fn check_rw_args(&self, pos: SectorId, len: usize) -> Result<()> {
        if len % SECTOR_SIZE != 0 {
            return_errno_with_msg!(Errno::NotSectorAligned, "I/O length is not sector aligned");
        }
        if pos + len / SECTOR_SIZE > self.region.len() {
            return_errno_with_msg!(Errno::InvalidArgs, "I/O position is out of range");
        }
        Ok(())
    }
}

impl BlockSet for MemDisk {
    fn read(&self, pos: SectorId, buf: &mut [u8]) -> Result<()> {
        self.check_rw_args(pos, buf.len())?;
        let offset = (self.region.start + pos) * SECTOR_SIZE;

        let disk = self.disk.lock();
        buf.copy_from_slice(&disk[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, pos: SectorId, buf: &[u8]) -> Result<()> {
        self.check_rw_args(pos, buf.len())?;
        let offset = (self.region.start + pos) * SECTOR_SIZE;

        let mut disk = self.disk.lock();
        disk[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn subset(&self, range: Range<SectorId>) -> Result<Self> {
        if self.region.start + range.end > self.region.end {
            return_errno_with_msg!(Errno::InvalidArgs, "subset is out of range");
        }

        Ok(MemDisk {
            disk: self.disk.clone(),
            region: Range {
                start: self.region.start + range.start,
                end: self.region.start + range.end,
            },
        })
    }

    fn trim(&self, range: Range<SectorId>) -> Result<()> {
        if self.region.start + range.end > self.region.end {
            return_errno_with_msg!(Errno::InvalidArgs, "trim range is out of range");
        }
        let offset = (self.region.start + range.start) * SECTOR_SIZE;
        let len = range.len() * SECTOR_SIZE;

        let mut disk = self.disk.lock();
        disk[offset..offset + len].fill(0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nsectors(&self) -> usize {
        self.region.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsets_window_the_same_bytes() {
        let disk = MemDisk::create(16).unwrap();
        assert_eq!(disk.nsectors(), 16);

        let sector = [0x11u8; SECTOR_SIZE];
        disk.write(3, &sector).unwrap();

        let subset = disk.subset(2..6).unwrap();
        assert_eq!(subset.nsectors(), 4);
        let mut back = [0u8; SECTOR_SIZE];
        subset.read(1, &mut back).unwrap();
        assert_eq!(back, sector);

        assert!(disk.subset(10..17).is_err());
        assert!(disk.read(16, &mut back).is_err());
        assert!(disk.write(0, &sector[..100]).is_err());
    }

    #[test]
    fn ragged_slices_merge_into_existing_sectors() {
        let disk = MemDisk::create(4).unwrap();

        // A span straddling a sector boundary, aligned at neither end.
        let span: Vec<u8> = (0..SECTOR_SIZE + 100).map(|i| i as u8).collect();
        let at = SECTOR_SIZE - 50;
        disk.write_slice(at, &span).unwrap();

        let mut back = alloc::vec![0u8; span.len()];
        disk.read_slice(at, &mut back).unwrap();
        assert_eq!(back, span);

        // Bytes on either side of the span were left untouched.
        let mut edge = [0xa5u8; 8];
        disk.read_slice(at - 8, &mut edge).unwrap();
        assert_eq!(edge, [0u8; 8]);
        disk.read_slice(at + span.len(), &mut edge).unwrap();
        assert_eq!(edge, [0u8; 8]);

        // Past-the-end slices are rejected outright.
        let mut tail = [0u8; 8];
        assert!(disk.read_slice(4 * SECTOR_SIZE - 4, &mut tail).is_err());
        assert!(disk.write_slice(4 * SECTOR_SIZE - 4, &tail).is_err());
    }

    #[test]
    fn trim_zeroes_range() {
        let disk = MemDisk::create(8).unwrap();
        disk.write(0, &[3u8; 2 * SECTOR_SIZE]).unwrap();
        disk.trim(0..1).unwrap();

        let mut buf = [0xffu8; SECTOR_SIZE];
        disk.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
        disk.read(1, &mut buf).unwrap();
        assert_eq!(buf, [3u8; SECTOR_SIZE]);
    }
}
