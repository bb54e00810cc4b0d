//! # Block Device Layer
//!
//! The engine talks to storage through the [`BlockDev`] trait: sector-addressed
//! reads and writes of opaque buffers, plus flush and discard. Writes are not
//! ordered against each other unless fenced by a flush; the journal relies on
//! this contract for its durability boundary.
//!
//! Two implementations are provided:
//!
//! - [`FileDev`]: a file- or block-device-backed device. Reads go through a
//!   lazily (re)established memory map; writes use positional I/O on the file
//!   descriptor and flush maps to `sync_all`. The map is invalidated on grow,
//!   mirroring the read-mmap / write-fd split of the storage layer this
//!   engine grew out of.
//! - [`MemDev`]: an in-memory device for tests and crash simulation. Its
//!   `snapshot`/`restore` pair lets a test capture the exact byte state at a
//!   simulated crash point and remount from it.
//!
//! All I/O failures are reported as `Error::IoRead`/`Error::IoWrite` with the
//! failing sector range in the message; replica retry happens above this
//! layer.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::config::SECTOR_SIZE;
use crate::errors::{Error, Result};

/// Sector-addressed block device contract.
///
/// `buf` lengths must be sector multiples; implementations may assume it.
pub trait BlockDev: Send + Sync {
    fn nr_sectors(&self) -> u64;

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Durability fence: all writes submitted before the flush are stable
    /// before any write submitted after it.
    fn flush(&self) -> Result<()>;

    /// Advisory: the given sectors no longer hold live data.
    fn discard(&self, _sector: u64, _nr_sectors: u64) -> Result<()> {
        Ok(())
    }
}

fn check_range(nr_sectors: u64, sector: u64, len: usize) -> Result<()> {
    if len % SECTOR_SIZE != 0 {
        return Err(Error::IoRead(format!(
            "buffer length {len} is not a sector multiple"
        )));
    }
    let end = sector + (len / SECTOR_SIZE) as u64;
    if end > nr_sectors {
        return Err(Error::IoRead(format!(
            "sectors {sector}..{end} out of device bounds ({nr_sectors})"
        )));
    }
    Ok(())
}

/// File-backed block device: mmap reads, positional writes.
pub struct FileDev {
    file: File,
    nr_sectors: u64,
    map: RwLock<Option<Mmap>>,
}

impl FileDev {
    /// Create (or truncate) a device file of `nr_sectors` sectors.
    pub fn create(path: &Path, nr_sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::IoWrite(format!("create {path:?}: {e}")))?;
        file.set_len(nr_sectors * SECTOR_SIZE as u64)
            .map_err(|e| Error::IoWrite(format!("resize {path:?}: {e}")))?;
        Ok(Self {
            file,
            nr_sectors,
            map: RwLock::new(None),
        })
    }

    /// Open an existing device file, deriving the sector count from its size.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::IoRead(format!("open {path:?}: {e}")))?;
        let len = file
            .metadata()
            .map_err(|e| Error::IoRead(format!("stat {path:?}: {e}")))?
            .len();
        Ok(Self {
            file,
            nr_sectors: len / SECTOR_SIZE as u64,
            map: RwLock::new(None),
        })
    }

    fn with_map<T>(&self, f: impl FnOnce(&Mmap) -> T) -> Result<T> {
        {
            let guard = self.map.read();
            if let Some(map) = guard.as_ref() {
                return Ok(f(map));
            }
        }
        let mut guard = self.map.write();
        if guard.is_none() {
            let map = unsafe { Mmap::map(&self.file) }
                .map_err(|e| Error::IoRead(format!("mmap device: {e}")))?;
            *guard = Some(map);
        }
        Ok(f(guard.as_ref().unwrap()))
    }
}

impl BlockDev for FileDev {
    fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.nr_sectors, sector, buf.len())?;
        let off = sector as usize * SECTOR_SIZE;
        self.with_map(|map| buf.copy_from_slice(&map[off..off + buf.len()]))
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()> {
        check_range(self.nr_sectors, sector, buf.len())
            .map_err(|e| Error::IoWrite(e.to_string()))?;
        self.file
            .write_all_at(buf, sector * SECTOR_SIZE as u64)
            .map_err(|e| Error::IoWrite(format!("sector {sector}: {e}")))
    }

    fn flush(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::IoWrite(format!("flush: {e}")))
    }
}

/// In-memory block device for tests.
pub struct MemDev {
    sectors: Mutex<Vec<u8>>,
    nr_sectors: u64,
}

impl MemDev {
    pub fn new(nr_sectors: u64) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![0u8; nr_sectors as usize * SECTOR_SIZE]),
            nr_sectors,
        })
    }

    /// Capture the entire device contents, e.g. at a simulated crash point.
    pub fn snapshot(&self) -> Vec<u8> {
        self.sectors.lock().clone()
    }

    /// Replace the device contents with a previously captured snapshot.
    pub fn restore(&self, bytes: Vec<u8>) {
        let mut guard = self.sectors.lock();
        assert_eq!(guard.len(), bytes.len(), "snapshot size mismatch");
        *guard = bytes;
    }

    /// Corrupt a byte, for checksum-failure tests.
    pub fn corrupt(&self, sector: u64, offset: usize) {
        let mut guard = self.sectors.lock();
        let idx = sector as usize * SECTOR_SIZE + offset;
        guard[idx] ^= 0xff;
    }
}

impl BlockDev for MemDev {
    fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.nr_sectors, sector, buf.len())?;
        let guard = self.sectors.lock();
        let off = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&guard[off..off + buf.len()]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()> {
        check_range(self.nr_sectors, sector, buf.len())
            .map_err(|e| Error::IoWrite(e.to_string()))?;
        let mut guard = self.sectors.lock();
        let off = sector as usize * SECTOR_SIZE;
        guard[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memdev_round_trip() {
        let dev = MemDev::new(16);
        let data = vec![0xabu8; SECTOR_SIZE * 2];
        dev.write(3, &data).unwrap();

        let mut out = vec![0u8; SECTOR_SIZE * 2];
        dev.read(3, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn memdev_rejects_out_of_bounds() {
        let dev = MemDev::new(4);
        let mut buf = vec![0u8; SECTOR_SIZE];
        assert!(dev.read(4, &mut buf).is_err());
        assert!(dev.write(5, &buf).is_err());
    }

    #[test]
    fn memdev_snapshot_restore() {
        let dev = MemDev::new(4);
        dev.write(0, &vec![1u8; SECTOR_SIZE]).unwrap();
        let snap = dev.snapshot();

        dev.write(0, &vec![2u8; SECTOR_SIZE]).unwrap();
        dev.restore(snap);

        let mut buf = vec![0u8; SECTOR_SIZE];
        dev.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
    }

    #[test]
    fn filedev_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        let dev = FileDev::create(&path, 32).unwrap();

        let data = vec![0x5au8; SECTOR_SIZE];
        dev.write(10, &data).unwrap();
        dev.flush().unwrap();

        let mut out = vec![0u8; SECTOR_SIZE];
        dev.read(10, &mut out).unwrap();
        assert_eq!(out, data);

        drop(dev);
        let reopened = FileDev::open(&path).unwrap();
        assert_eq!(reopened.nr_sectors(), 32);
        let mut out2 = vec![0u8; SECTOR_SIZE];
        reopened.read(10, &mut out2).unwrap();
        assert_eq!(out2, data);
    }
}
