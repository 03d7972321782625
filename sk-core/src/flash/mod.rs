//! SPI NOR flash access
//!
//! The chip sits behind the [`SpiFlash`] trait; the shared bus (flash and
//! the TFT display are peers on the same SPI pins) is arbitrated by
//! [`SpiBus`], a recursive mutex held across every bus transaction. The
//! filesystem write path re-enters the bus lock page-by-page, which is why
//! the mutex must be reentrant.
//!
//! - `MemFlash` - in-memory chip with NOR programming semantics, for tests
//! - `FileFlash` - file-backed 16 MB image, for running the daemon on a host

pub mod fs;

pub use fs::FlashFs;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use sk_error::{Result, SmokehouseError};

use crate::constants::{flash as cfg, locks};

/// Recursive arbitration for the shared SPI bus.
///
/// Every transaction - flash read/program/erase or a display transfer -
/// runs under this lock with only its own chip-select asserted.
pub struct SpiBus {
    lock: ReentrantMutex<()>,
}

impl SpiBus {
    pub fn new() -> Self {
        SpiBus {
            lock: ReentrantMutex::new(()),
        }
    }

    /// Bounded-wait acquisition; timing out is an operation failure,
    /// never a silent retry.
    pub fn acquire(&self) -> Result<ReentrantMutexGuard<'_, ()>> {
        self.lock.try_lock_for(locks::TIMEOUT).ok_or_else(|| {
            tracing::error!("SPI bus acquisition timed out");
            SmokehouseError::MutexTimeout {
                name: "spi",
                waited_ms: locks::TIMEOUT.as_millis() as u64,
            }
        })
    }
}

impl Default for SpiBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw NOR chip operations.
///
/// Implementations use interior mutability (`&self` methods) so a single
/// `Arc<dyn SpiFlash>` can be shared; callers are responsible for holding
/// the [`SpiBus`] lock around every call.
pub trait SpiFlash: Send + Sync {
    /// Chip capacity in bytes
    fn capacity(&self) -> u32;

    /// Read `buf.len()` bytes starting at `addr`
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Program up to one page (256 bytes, not crossing a page boundary).
    /// NOR semantics: programming can only clear bits.
    fn program_page(&self, addr: u32, data: &[u8]) -> Result<()>;

    /// Erase one 4 KB sector to 0xFF
    fn erase_sector(&self, sector: u16) -> Result<()>;

    /// True while an erase/program is still in progress
    fn is_busy(&self) -> bool {
        false
    }
}

fn check_page_bounds(addr: u32, len: usize, capacity: u32) -> Result<()> {
    if len > cfg::PAGE_SIZE as usize {
        return Err(SmokehouseError::generic(format!(
            "Page program of {len} bytes exceeds page size"
        )));
    }
    let page = addr / cfg::PAGE_SIZE;
    let end_page = (addr + len.max(1) as u32 - 1) / cfg::PAGE_SIZE;
    if page != end_page {
        return Err(SmokehouseError::generic(format!(
            "Page program at {addr:#x} crosses a page boundary"
        )));
    }
    if addr + len as u32 > capacity {
        return Err(SmokehouseError::generic(format!(
            "Program at {addr:#x}+{len} past end of chip"
        )));
    }
    Ok(())
}

// ============================================================================
// In-memory chip (tests)
// ============================================================================

/// In-memory NOR chip with faithful program/erase semantics plus fault
/// injection hooks for the write-path error tests.
pub struct MemFlash {
    data: Mutex<Vec<u8>>,
    /// Sectors whose erase silently leaves a stuck-low byte
    stuck_sectors: Mutex<HashSet<u16>>,
}

impl MemFlash {
    pub fn new() -> Self {
        MemFlash {
            data: Mutex::new(vec![0xFF; cfg::CHIP_SIZE as usize]),
            stuck_sectors: Mutex::new(HashSet::new()),
        }
    }

    /// Make `sector` fail erase verification (a stuck-low bit)
    pub fn poison_sector(&self, sector: u16) {
        self.stuck_sectors.lock().insert(sector);
    }

    pub fn heal_sector(&self, sector: u16) {
        self.stuck_sectors.lock().remove(&sector);
    }

    /// Stomp raw bytes, bypassing NOR semantics (corruption injection)
    pub fn write_raw(&self, addr: u32, bytes: &[u8]) {
        let mut data = self.data.lock();
        let addr = addr as usize;
        data[addr..addr + bytes.len()].copy_from_slice(bytes);
    }
}

impl Default for MemFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiFlash for MemFlash {
    fn capacity(&self) -> u32 {
        cfg::CHIP_SIZE
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let addr = addr as usize;
        if addr + buf.len() > data.len() {
            return Err(SmokehouseError::generic("Read past end of chip"));
        }
        buf.copy_from_slice(&data[addr..addr + buf.len()]);
        Ok(())
    }

    fn program_page(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        check_page_bounds(addr, bytes.len(), self.capacity())?;
        let mut data = self.data.lock();
        for (offset, byte) in bytes.iter().enumerate() {
            // Programming can only clear bits
            data[addr as usize + offset] &= *byte;
        }
        Ok(())
    }

    fn erase_sector(&self, sector: u16) -> Result<()> {
        if sector >= cfg::SECTOR_COUNT {
            return Err(SmokehouseError::generic(format!("Erase of sector {sector} past end")));
        }
        let mut data = self.data.lock();
        let start = sector as usize * cfg::SECTOR_SIZE as usize;
        data[start..start + cfg::SECTOR_SIZE as usize].fill(0xFF);
        if self.stuck_sectors.lock().contains(&sector) {
            data[start] = 0x00;
        }
        Ok(())
    }
}

// ============================================================================
// File-backed chip (host runs)
// ============================================================================

/// 16 MB flash image persisted to a host file
pub struct FileFlash {
    file: Mutex<File>,
    capacity: u32,
}

impl FileFlash {
    /// Open or create the image; a fresh image is fully erased (0xFF)
    pub fn open(path: &Path) -> Result<Self> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if !existed || file.metadata()?.len() != cfg::CHIP_SIZE as u64 {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            let blank = vec![0xFFu8; cfg::SECTOR_SIZE as usize];
            for _ in 0..cfg::SECTOR_COUNT {
                file.write_all(&blank)?;
            }
            file.sync_all()?;
            tracing::info!(?path, "Created blank flash image");
        }
        Ok(FileFlash {
            file: Mutex::new(file),
            capacity: cfg::CHIP_SIZE,
        })
    }
}

impl SpiFlash for FileFlash {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(addr as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn program_page(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        check_page_bounds(addr, bytes.len(), self.capacity)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(addr as u64))?;
        let mut current = vec![0u8; bytes.len()];
        file.read_exact(&mut current)?;
        for (cur, new) in current.iter_mut().zip(bytes) {
            *cur &= *new;
        }
        file.seek(SeekFrom::Start(addr as u64))?;
        file.write_all(&current)?;
        Ok(())
    }

    fn erase_sector(&self, sector: u16) -> Result<()> {
        if sector >= cfg::SECTOR_COUNT {
            return Err(SmokehouseError::generic(format!("Erase of sector {sector} past end")));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector as u64 * cfg::SECTOR_SIZE as u64))?;
        file.write_all(&vec![0xFFu8; cfg::SECTOR_SIZE as usize])?;
        Ok(())
    }
}
