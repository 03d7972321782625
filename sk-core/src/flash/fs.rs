//! Sector-allocated file abstraction over the raw NOR chip
//!
//! A file is a contiguous run of 4 KB sectors inside a fixed partition.
//! Sector 0 holds the FAT (8-byte header + up to 64 fixed 60-byte
//! descriptors), sector 1 a shadow copy of the previous snapshot. Writes
//! replace files atomically: data lands in fresh sectors first, then the
//! FAT is persisted shadow-first so a crash between the two FAT writes is
//! recovered by the boot-time magic check (primary fails, shadow wins).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sk_error::{Result, SmokehouseError};
use sk_protocol::{FileEntryInfo, FlashInfo};
use tracing::{debug, error, info, warn};

use super::{SpiBus, SpiFlash};
use crate::constants::flash as cfg;

/// One FAT descriptor slot (in-RAM form)
#[derive(Debug, Clone)]
struct FatEntry {
    name: String,
    start_sector: u16,
    sector_count: u16,
    file_size: u32,
    valid: u8,
}

impl FatEntry {
    fn is_live(&self) -> bool {
        self.valid == cfg::ENTRY_ACTIVE
    }

    fn covers(&self, sector: u16) -> bool {
        sector >= self.start_sector && sector < self.start_sector + self.sector_count
    }

    fn to_bytes(&self) -> [u8; cfg::ENTRY_SIZE] {
        let mut out = [0u8; cfg::ENTRY_SIZE];
        let name = self.name.as_bytes();
        let len = name.len().min(cfg::NAME_LEN - 1);
        out[..len].copy_from_slice(&name[..len]);
        out[48..50].copy_from_slice(&self.start_sector.to_le_bytes());
        out[50..52].copy_from_slice(&self.sector_count.to_le_bytes());
        out[52..56].copy_from_slice(&self.file_size.to_le_bytes());
        out[56] = self.valid;
        out
    }

    fn from_bytes(raw: &[u8]) -> FatEntry {
        let name_end = raw[..cfg::NAME_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(cfg::NAME_LEN);
        FatEntry {
            name: String::from_utf8_lossy(&raw[..name_end]).into_owned(),
            start_sector: u16::from_le_bytes([raw[48], raw[49]]),
            sector_count: u16::from_le_bytes([raw[50], raw[51]]),
            file_size: u32::from_le_bytes([raw[52], raw[53], raw[54], raw[55]]),
            valid: raw[56],
        }
    }
}

/// Static content-class partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Profiles,
    Backups,
    Logs,
    /// Unclassified paths may use the union of all partitions
    Default,
}

impl Partition {
    pub fn classify(path: &str) -> Partition {
        if path.starts_with("/profiles/") {
            Partition::Profiles
        } else if path.starts_with("/backup/") {
            Partition::Backups
        } else if path.starts_with("/logs/") {
            Partition::Logs
        } else {
            Partition::Default
        }
    }

    /// Inclusive sector range
    pub fn range(self) -> (u16, u16) {
        match self {
            Partition::Profiles => (cfg::PROFILE_FIRST, cfg::PROFILE_LAST),
            Partition::Backups => (cfg::BACKUP_FIRST, cfg::BACKUP_LAST),
            Partition::Logs => (cfg::LOG_FIRST, cfg::LOG_LAST),
            Partition::Default => (cfg::PROFILE_FIRST, cfg::LOG_LAST),
        }
    }
}

/// Flash filesystem over one NOR chip
pub struct FlashFs {
    chip: Arc<dyn SpiFlash>,
    bus: Arc<SpiBus>,
    fat: Vec<FatEntry>,
}

impl FlashFs {
    /// Mount the filesystem, applying the FAT load policy: primary first,
    /// shadow on failure (rewriting primary), empty start if both fail.
    pub fn mount(chip: Arc<dyn SpiFlash>, bus: Arc<SpiBus>) -> Result<FlashFs> {
        if chip.capacity() < cfg::CHIP_SIZE {
            return Err(SmokehouseError::FlashInitFail(format!(
                "Chip too small: {} bytes",
                chip.capacity()
            )));
        }
        let mut fs = FlashFs {
            chip,
            bus,
            fat: Vec::new(),
        };

        match fs.read_fat_sector(cfg::FAT_SECTOR) {
            Ok(entries) => {
                fs.fat = entries;
                info!("FAT loaded: {} live entries", fs.live_count());
            }
            Err(primary_err) => {
                warn!("Primary FAT rejected ({primary_err}), trying shadow");
                match fs.read_fat_sector(cfg::FAT_SHADOW_SECTOR) {
                    Ok(entries) => {
                        fs.fat = entries;
                        info!("Shadow FAT loaded: {} live entries", fs.live_count());
                        // Primary must be healthy again before any file
                        // operation is accepted.
                        fs.write_fat_sector(cfg::FAT_SECTOR)?;
                        info!("Primary FAT rewritten from shadow");
                    }
                    Err(shadow_err) => {
                        error!("Both FATs unreadable (primary: {primary_err}, shadow: {shadow_err}); starting empty");
                        fs.fat.clear();
                    }
                }
            }
        }
        Ok(fs)
    }

    pub fn live_count(&self) -> usize {
        self.fat.iter().filter(|e| e.is_live()).count()
    }

    // ------------------------------------------------------------------
    // FAT persistence
    // ------------------------------------------------------------------

    fn read_fat_sector(&self, sector: u16) -> Result<Vec<FatEntry>> {
        let _guard = self.bus.acquire()?;
        let base = sector as u32 * cfg::SECTOR_SIZE;

        let mut header = [0u8; 8];
        self.chip.read(base, &mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != cfg::FAT_MAGIC {
            return Err(SmokehouseError::generic(format!(
                "bad FAT magic {magic:#010x}"
            )));
        }
        let entry_count = u16::from_le_bytes([header[4], header[5]]) as usize;
        if entry_count > cfg::MAX_ENTRIES {
            return Err(SmokehouseError::generic(format!(
                "FAT entry count {entry_count} exceeds {}",
                cfg::MAX_ENTRIES
            )));
        }

        let mut entries = Vec::with_capacity(entry_count);
        let mut raw = [0u8; cfg::ENTRY_SIZE];
        for slot in 0..entry_count {
            self.chip
                .read(base + 8 + (slot * cfg::ENTRY_SIZE) as u32, &mut raw)?;
            let entry = FatEntry::from_bytes(&raw);
            match entry.valid {
                cfg::ENTRY_ACTIVE => {
                    if Self::entry_sane(&entry, &raw) {
                        entries.push(entry);
                    } else {
                        warn!(slot, name = %entry.name, "Dropping insane FAT entry");
                    }
                }
                // Tombstones reserve their slot; keep iterating
                cfg::ENTRY_TOMBSTONE => entries.push(entry),
                cfg::ENTRY_HIDDEN => {
                    // An in-progress marker should never be persisted;
                    // treat the slot as dead.
                    warn!(slot, name = %entry.name, "Dropping in-progress FAT entry");
                }
                _ => {}
            }
        }
        Ok(entries)
    }

    /// Entry-level sanity check, applied to primary and shadow alike so a
    /// subtly damaged shadow cannot propagate garbage into primary.
    fn entry_sane(entry: &FatEntry, raw: &[u8]) -> bool {
        if raw[..cfg::NAME_LEN].iter().all(|b| *b != 0) {
            return false; // Filename not NUL-terminated within 48 bytes
        }
        if entry.name.is_empty() || !entry.name.starts_with('/') {
            return false;
        }
        if entry.sector_count == 0 {
            return false;
        }
        if entry.start_sector < cfg::PROFILE_FIRST {
            return false; // Would overlap the FAT sectors
        }
        let end = entry.start_sector as u32 + entry.sector_count as u32;
        if end > cfg::SECTOR_COUNT as u32 {
            return false;
        }
        if entry.file_size > entry.sector_count as u32 * cfg::SECTOR_SIZE {
            return false;
        }
        true
    }

    fn write_fat_sector(&self, sector: u16) -> Result<()> {
        let _guard = self.bus.acquire()?;
        self.chip.erase_sector(sector)?;
        self.wait_ready();

        let live: Vec<&FatEntry> = self.fat.iter().filter(|e| e.is_live()).collect();
        let mut buf = vec![0u8; 8 + live.len() * cfg::ENTRY_SIZE];
        buf[0..4].copy_from_slice(&cfg::FAT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&(live.len() as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&[0, 0]);
        for (slot, entry) in live.iter().enumerate() {
            let offset = 8 + slot * cfg::ENTRY_SIZE;
            buf[offset..offset + cfg::ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }

        self.write_pages(sector as u32 * cfg::SECTOR_SIZE, &buf)
    }

    /// Persist the FAT: the serialized form is compacted to live slots,
    /// written to the shadow sector first, then to primary. A crash
    /// between the two leaves a stale primary that fails the magic check
    /// on the next boot, so the shadow wins. The in-RAM table is only
    /// compacted once both writes landed, keeping caller rollback indices
    /// valid on failure.
    fn persist_fat(&mut self) -> Result<()> {
        self.write_fat_sector(cfg::FAT_SHADOW_SECTOR)?;
        self.write_fat_sector(cfg::FAT_SECTOR)?;
        self.fat.retain(|e| e.is_live());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn sector_live(&self, sector: u16) -> bool {
        self.fat.iter().any(|e| e.is_live() && e.covers(sector))
    }

    /// Scan a partition for a contiguous run of free sectors
    fn find_free_run(&self, partition: Partition, sectors: usize) -> Option<u16> {
        let (first, last) = partition.range();
        let mut run_start = first;
        let mut run_len = 0usize;
        for sector in first..=last {
            if self.sector_live(sector) {
                run_start = sector + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == sectors {
                    return Some(run_start);
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    fn find_live(&self, path: &str) -> Option<usize> {
        // Linear scan across all slots, tombstones included
        self.fat
            .iter()
            .position(|e| e.valid == cfg::ENTRY_ACTIVE && e.name == path)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.find_live(path).is_some()
    }

    pub fn file_size(&self, path: &str) -> Option<u32> {
        self.find_live(path).map(|i| self.fat[i].file_size)
    }

    // ------------------------------------------------------------------
    // Read / write / delete
    // ------------------------------------------------------------------

    /// Read at most `max_size` bytes of a file
    pub fn file_read(&self, path: &str, max_size: usize) -> Result<Vec<u8>> {
        let idx = self
            .find_live(path)
            .ok_or_else(|| SmokehouseError::FlashFileNotFound(path.to_string()))?;
        let entry = &self.fat[idx];
        let len = (entry.file_size as usize).min(max_size);
        let mut buf = vec![0u8; len];
        let _guard = self.bus.acquire()?;
        self.chip
            .read(entry.start_sector as u32 * cfg::SECTOR_SIZE, &mut buf)?;
        Ok(buf)
    }

    /// Atomic file replace.
    ///
    /// Data is fully written and verified in fresh sectors before the FAT
    /// changes hands; any failure restores the previous file untouched.
    pub fn file_write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        Self::check_path(path)?;
        if data.is_empty() {
            return Err(SmokehouseError::flash_write(path, "empty write"));
        }
        let sectors_needed = data.len().div_ceil(cfg::SECTOR_SIZE as usize);
        if sectors_needed > cfg::MAX_FILE_SECTORS {
            return Err(SmokehouseError::FlashNoSpace {
                path: path.to_string(),
                sectors: sectors_needed,
            });
        }

        let old_idx = self.find_live(path);
        if old_idx.is_none() && self.live_count() >= cfg::MAX_ENTRIES {
            return Err(SmokehouseError::FatFull {
                max: cfg::MAX_ENTRIES,
            });
        }

        // First try a run that leaves the old data untouched; only when the
        // partition is too tight is the old entry hidden (0xFE) so its own
        // sectors count as free for the search.
        let partition = Partition::classify(path);
        let mut start = self.find_free_run(partition, sectors_needed);
        if let Some(idx) = old_idx {
            self.fat[idx].valid = cfg::ENTRY_HIDDEN;
        }
        if start.is_none() {
            start = self.find_free_run(partition, sectors_needed);
        }
        let Some(start) = start else {
            if let Some(idx) = old_idx {
                self.fat[idx].valid = cfg::ENTRY_ACTIVE;
            }
            return Err(SmokehouseError::FlashNoSpace {
                path: path.to_string(),
                sectors: sectors_needed,
            });
        };

        let burn = self.burn_data(start, sectors_needed, data);
        if let Err(e) = burn {
            if let Some(idx) = old_idx {
                self.fat[idx].valid = cfg::ENTRY_ACTIVE;
            }
            return Err(e);
        }

        // Data is safely on flash; swap the FAT entries and persist.
        if let Some(idx) = old_idx {
            self.fat[idx].valid = cfg::ENTRY_TOMBSTONE;
        }
        self.fat.push(FatEntry {
            name: path.to_string(),
            start_sector: start,
            sector_count: sectors_needed as u16,
            file_size: data.len() as u32,
            valid: cfg::ENTRY_ACTIVE,
        });

        if let Err(e) = self.persist_fat() {
            // On-disk FAT still describes the old file; put RAM back in step.
            self.fat.pop();
            if let Some(idx) = old_idx {
                self.fat[idx].valid = cfg::ENTRY_ACTIVE;
            }
            return Err(e);
        }
        debug!(path, bytes = data.len(), start, "Flash file written");
        Ok(())
    }

    /// Erase, verify, program and read back the data sectors.
    /// The bus lock is held across the entire operation; partial
    /// interleaving with display traffic corrupts the chip.
    fn burn_data(&self, start: u16, sectors: usize, data: &[u8]) -> Result<()> {
        let _guard = self.bus.acquire()?;

        for sector in start..start + sectors as u16 {
            self.erase_and_verify(sector)?;
        }

        self.write_pages(start as u32 * cfg::SECTOR_SIZE, data)?;

        let mut first = [0u8; 1];
        self.chip.read(start as u32 * cfg::SECTOR_SIZE, &mut first)?;
        if first[0] != data[0] {
            return Err(SmokehouseError::flash_write(
                "",
                format!("readback mismatch: wrote {:#04x}, got {:#04x}", data[0], first[0]),
            ));
        }
        Ok(())
    }

    /// Erase one sector and verify its leading bytes read blank.
    /// A failed verify retries the erase once before giving up.
    fn erase_and_verify(&self, sector: u16) -> Result<()> {
        for attempt in 0..2 {
            self.chip.erase_sector(sector)?;
            self.wait_ready();
            let mut head = [0u8; 16];
            self.chip.read(sector as u32 * cfg::SECTOR_SIZE, &mut head)?;
            if head.iter().all(|b| *b == 0xFF) {
                return Ok(());
            }
            warn!(sector, attempt, "Erase verify failed");
        }
        Err(SmokehouseError::flash_write(
            "",
            format!("sector {sector} failed erase verification twice"),
        ))
    }

    /// Program data in 256-byte page units. Each page transaction
    /// re-acquires the (recursive) bus lock on top of the caller's guard.
    fn write_pages(&self, addr: u32, data: &[u8]) -> Result<()> {
        for (index, chunk) in data.chunks(cfg::PAGE_SIZE as usize).enumerate() {
            let _guard = self.bus.acquire()?;
            self.chip
                .program_page(addr + (index as u32 * cfg::PAGE_SIZE), chunk)?;
        }
        Ok(())
    }

    fn wait_ready(&self) {
        while self.chip.is_busy() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Tombstone a file and persist the FAT
    pub fn file_delete(&mut self, path: &str) -> Result<()> {
        let idx = self
            .find_live(path)
            .ok_or_else(|| SmokehouseError::FlashFileNotFound(path.to_string()))?;
        self.fat[idx].valid = cfg::ENTRY_TOMBSTONE;
        if let Err(e) = self.persist_fat() {
            self.fat[idx].valid = cfg::ENTRY_ACTIVE;
            return Err(e);
        }
        debug!(path, "Flash file deleted");
        Ok(())
    }

    /// Append text to a file, trimming to half once it grows past 8 KB
    pub fn file_append(&mut self, path: &str, text: &str) -> Result<()> {
        let mut combined = match self.find_live(path) {
            Some(_) => {
                let existing = self.file_read(path, cfg::APPEND_LIMIT * 2)?;
                String::from_utf8_lossy(&existing).into_owned()
            }
            None => String::new(),
        };
        combined.push_str(text);
        if combined.len() > cfg::APPEND_LIMIT {
            let keep_from = combined.len() - cfg::APPEND_LIMIT / 2;
            // Cut at a char boundary at or after the midpoint
            let cut = (keep_from..combined.len())
                .find(|i| combined.is_char_boundary(*i))
                .unwrap_or(combined.len());
            combined = combined.split_off(cut);
        }
        self.file_write(path, combined.as_bytes())
    }

    // ------------------------------------------------------------------
    // Format
    // ------------------------------------------------------------------

    /// Erase both FAT sectors and write empty headers, shadow first
    pub fn format(&mut self) -> Result<()> {
        info!("Formatting flash filesystem");
        self.fat.clear();
        {
            let _guard = self.bus.acquire()?;
            self.chip.erase_sector(cfg::FAT_SECTOR)?;
            self.wait_ready();
            self.chip.erase_sector(cfg::FAT_SHADOW_SECTOR)?;
            self.wait_ready();
        }
        self.write_fat_sector(cfg::FAT_SHADOW_SECTOR)?;
        self.write_fat_sector(cfg::FAT_SECTOR)?;
        Ok(())
    }

    /// Full chip erase. The bus is handed back between bursts and chip
    /// status polled on a coarse cadence so the display task can make
    /// progress during the long erase.
    pub fn erase_chip(&mut self) -> Result<()> {
        info!("Erasing entire chip");
        for sector in 0..cfg::SECTOR_COUNT {
            {
                let _guard = self.bus.acquire()?;
                self.chip.erase_sector(sector)?;
            }
            while self.chip.is_busy() {
                thread::sleep(Duration::from_millis(cfg::ERASE_POLL_MS));
            }
        }
        self.fat.clear();
        self.write_fat_sector(cfg::FAT_SHADOW_SECTOR)?;
        self.write_fat_sector(cfg::FAT_SECTOR)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory emulation
    // ------------------------------------------------------------------

    /// List live files under a prefix, excluding directory markers
    pub fn list(&self, prefix: &str) -> Vec<FileEntryInfo> {
        self.fat
            .iter()
            .filter(|e| e.is_live() && e.name.starts_with(prefix) && !e.name.ends_with("/.dir"))
            .map(|e| FileEntryInfo {
                name: e.name.clone(),
                size: e.file_size,
                sectors: e.sector_count,
            })
            .collect()
    }

    /// A directory is a naming convention: mkdir drops a one-byte marker
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let marker = format!("{}/.dir", path.trim_end_matches('/'));
        if self.file_exists(&marker) {
            return Ok(());
        }
        self.file_write(&marker, &[1])
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.fat
            .iter()
            .any(|e| e.is_live() && e.name.starts_with(&prefix))
    }

    // ------------------------------------------------------------------
    // Info
    // ------------------------------------------------------------------

    pub fn info(&self) -> FlashInfo {
        let free_in = |p: Partition| {
            let (first, last) = p.range();
            (first..=last).filter(|s| !self.sector_live(*s)).count()
        };
        FlashInfo {
            chip_size_bytes: self.chip.capacity() as u64,
            sector_size: cfg::SECTOR_SIZE,
            live_entries: self.live_count(),
            profile_sectors_free: free_in(Partition::Profiles),
            backup_sectors_free: free_in(Partition::Backups),
            log_sectors_free: free_in(Partition::Logs),
        }
    }

    fn check_path(path: &str) -> Result<()> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(SmokehouseError::invalid_path(path, "must be absolute"));
        }
        if path.len() >= cfg::NAME_LEN {
            return Err(SmokehouseError::invalid_path(path, "name too long"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    fn fresh_fs() -> (Arc<MemFlash>, Arc<SpiBus>, FlashFs) {
        let chip = Arc::new(MemFlash::new());
        let bus = Arc::new(SpiBus::new());
        let fs = FlashFs::mount(chip.clone(), bus.clone()).unwrap();
        (chip, bus, fs)
    }

    fn remount(chip: &Arc<MemFlash>, bus: &Arc<SpiBus>) -> FlashFs {
        FlashFs::mount(chip.clone() as Arc<dyn SpiFlash>, bus.clone()).unwrap()
    }

    #[test]
    fn test_empty_mount() {
        let (_, _, fs) = fresh_fs();
        assert_eq!(fs.live_count(), 0);
        assert!(!fs.file_exists("/profiles/x"));
    }

    #[test]
    fn test_write_read_round_trip() {
        let (chip, bus, mut fs) = fresh_fs();
        fs.file_write("/profiles/kielbasa.txt", b"Drying;55;0;90;2;0;2;10;60;0\n")
            .unwrap();
        let data = fs.file_read("/profiles/kielbasa.txt", 4096).unwrap();
        assert_eq!(data, b"Drying;55;0;90;2;0;2;10;60;0\n");

        // Survives a remount
        let fs2 = remount(&chip, &bus);
        assert_eq!(fs2.live_count(), 1);
        let data = fs2.file_read("/profiles/kielbasa.txt", 4096).unwrap();
        assert_eq!(data, b"Drying;55;0;90;2;0;2;10;60;0\n");
    }

    #[test]
    fn test_replace_keeps_single_live_slot() {
        let (_, _, mut fs) = fresh_fs();
        fs.file_write("/profiles/p.txt", b"AAAA").unwrap();
        fs.file_write("/profiles/p.txt", b"AAAA").unwrap();
        assert_eq!(fs.live_count(), 1);
        assert_eq!(fs.file_read("/profiles/p.txt", 16).unwrap(), b"AAAA");
    }

    #[test]
    fn test_replace_swaps_contents() {
        let (_, _, mut fs) = fresh_fs();
        fs.file_write("/profiles/p.txt", b"old contents").unwrap();
        fs.file_write("/profiles/p.txt", b"new").unwrap();
        assert_eq!(fs.file_read("/profiles/p.txt", 64).unwrap(), b"new");
        assert_eq!(fs.live_count(), 1);
    }

    #[test]
    fn test_delete() {
        let (chip, bus, mut fs) = fresh_fs();
        fs.file_write("/profiles/p.txt", b"x").unwrap();
        fs.file_delete("/profiles/p.txt").unwrap();
        assert!(!fs.file_exists("/profiles/p.txt"));
        assert!(matches!(
            fs.file_read("/profiles/p.txt", 16),
            Err(SmokehouseError::FlashFileNotFound(_))
        ));
        // Deletion is durable
        let fs2 = remount(&chip, &bus);
        assert!(!fs2.file_exists("/profiles/p.txt"));
    }

    #[test]
    fn test_size_limits() {
        let (_, _, mut fs) = fresh_fs();
        assert!(fs.file_write("/profiles/empty", b"").is_err());
        let too_big = vec![0u8; (cfg::MAX_FILE_SECTORS + 1) * cfg::SECTOR_SIZE as usize];
        assert!(matches!(
            fs.file_write("/profiles/big", &too_big),
            Err(SmokehouseError::FlashNoSpace { .. })
        ));
        let max_ok = vec![7u8; cfg::MAX_FILE_SECTORS * cfg::SECTOR_SIZE as usize];
        fs.file_write("/profiles/max", &max_ok).unwrap();
        assert_eq!(fs.file_size("/profiles/max"), Some(max_ok.len() as u32));
    }

    #[test]
    fn test_partition_guard() {
        let (_, _, mut fs) = fresh_fs();
        // The backup partition has 20 sectors; fill it with two 10-sector
        // files, then a third must fail without spilling elsewhere.
        let blob = vec![1u8; cfg::MAX_FILE_SECTORS * cfg::SECTOR_SIZE as usize];
        fs.file_write("/backup/a", &blob).unwrap();
        fs.file_write("/backup/b", &blob).unwrap();
        assert!(matches!(
            fs.file_write("/backup/c", b"tiny"),
            Err(SmokehouseError::FlashNoSpace { .. })
        ));
        // Profile partition is unaffected
        fs.file_write("/profiles/still-fine", b"ok").unwrap();
    }

    #[test]
    fn test_allocator_reuses_hidden_sectors() {
        let (_, _, mut fs) = fresh_fs();
        // Fill the backup partition completely, then replace one file:
        // the run search must treat the old file's sectors as free.
        let blob = vec![1u8; cfg::MAX_FILE_SECTORS * cfg::SECTOR_SIZE as usize];
        fs.file_write("/backup/a", &blob).unwrap();
        fs.file_write("/backup/b", &blob).unwrap();
        fs.file_write("/backup/b", &blob).unwrap();
        assert_eq!(fs.live_count(), 2);
    }

    #[test]
    fn test_erase_verify_failure_aborts_and_restores() {
        let (chip, _, mut fs) = fresh_fs();
        fs.file_write("/profiles/p.txt", b"original").unwrap();
        let start = fs.fat.iter().find(|e| e.is_live()).unwrap().start_sector;
        // Poison every sector the replacement could land on except the
        // current file's own (hidden) run start.
        for s in cfg::PROFILE_FIRST..=cfg::PROFILE_LAST {
            if s != start {
                chip.poison_sector(s);
            }
        }
        let err = fs.file_write("/profiles/p.txt", b"replacement");
        assert!(err.is_err());
        // Old file still intact and live
        assert_eq!(fs.file_read("/profiles/p.txt", 64).unwrap(), b"original");
        assert_eq!(fs.live_count(), 1);
    }

    #[test]
    fn test_append_and_truncate() {
        let (_, _, mut fs) = fresh_fs();
        fs.file_append("/logs/run.log", "line one\n").unwrap();
        fs.file_append("/logs/run.log", "line two\n").unwrap();
        let text = String::from_utf8(fs.file_read("/logs/run.log", 8192).unwrap()).unwrap();
        assert_eq!(text, "line one\nline two\n");

        // Grow past the cap; the head is dropped to half the cap
        let chunk = "x".repeat(1024);
        for _ in 0..9 {
            fs.file_append("/logs/run.log", &chunk).unwrap();
        }
        let size = fs.file_size("/logs/run.log").unwrap() as usize;
        assert!(size <= cfg::APPEND_LIMIT, "size = {size}");
        // The head was dropped at some point: far less than the raw total
        assert!(size < 9 * 1024);
    }

    #[test]
    fn test_format() {
        let (chip, bus, mut fs) = fresh_fs();
        fs.file_write("/profiles/p.txt", b"x").unwrap();
        fs.format().unwrap();
        assert_eq!(fs.live_count(), 0);
        let fs2 = remount(&chip, &bus);
        assert_eq!(fs2.live_count(), 0);
    }

    #[test]
    fn test_directory_emulation() {
        let (_, _, mut fs) = fresh_fs();
        assert!(!fs.dir_exists("/profiles"));
        fs.mkdir("/profiles").unwrap();
        assert!(fs.dir_exists("/profiles"));
        fs.file_write("/profiles/a.txt", b"a").unwrap();
        fs.file_write("/profiles/b.txt", b"b").unwrap();
        let listed = fs.list("/profiles/");
        // Marker excluded from listings
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|f| !f.name.ends_with("/.dir")));
    }

    #[test]
    fn test_shadow_recovery_after_primary_corruption() {
        let (chip, bus, mut fs) = fresh_fs();
        for name in ["/profiles/a", "/profiles/b", "/profiles/c"] {
            fs.file_write(name, b"data").unwrap();
        }
        drop(fs);
        // Stomp the primary magic
        chip.write_raw(0, &0xDEADBEEFu32.to_le_bytes());

        let fs2 = remount(&chip, &bus);
        assert_eq!(fs2.live_count(), 3);
        assert_eq!(fs2.file_read("/profiles/b", 16).unwrap(), b"data");

        // Primary was rewritten and passes the magic check again
        let mut head = [0u8; 4];
        chip.read(0, &mut head).unwrap();
        assert_eq!(u32::from_le_bytes(head), cfg::FAT_MAGIC);
    }

    #[test]
    fn test_both_fats_bad_starts_empty() {
        let (chip, bus, mut fs) = fresh_fs();
        fs.file_write("/profiles/a", b"data").unwrap();
        drop(fs);
        chip.write_raw(0, &[0u8; 8]);
        chip.write_raw(cfg::SECTOR_SIZE, &[0u8; 8]);
        let fs2 = remount(&chip, &bus);
        assert_eq!(fs2.live_count(), 0);
    }

    #[test]
    fn test_insane_shadow_entries_are_dropped() {
        let (chip, bus, mut fs) = fresh_fs();
        fs.file_write("/profiles/good", b"data").unwrap();
        drop(fs);

        // Corrupt primary, then plant a garbage-but-active entry in the
        // shadow: start sector far past the end of the chip.
        chip.write_raw(0, &0xDEADBEEFu32.to_le_bytes());
        let shadow = cfg::SECTOR_SIZE;
        chip.write_raw(shadow + 4, &2u16.to_le_bytes());
        let mut bad = [0u8; cfg::ENTRY_SIZE];
        bad[..5].copy_from_slice(b"/bad\0");
        bad[48..50].copy_from_slice(&0xFFF0u16.to_le_bytes());
        bad[50..52].copy_from_slice(&64u16.to_le_bytes());
        bad[56] = cfg::ENTRY_ACTIVE;
        chip.write_raw(shadow + 8 + cfg::ENTRY_SIZE as u32, &bad);

        let fs2 = remount(&chip, &bus);
        assert_eq!(fs2.live_count(), 1);
        assert!(fs2.file_exists("/profiles/good"));
        assert!(!fs2.file_exists("/bad"));
    }

    #[test]
    fn test_power_loss_between_data_and_fat_keeps_old_file() {
        let (chip, bus, mut fs) = fresh_fs();
        fs.file_write("/profiles/x", b"A").unwrap();

        // Simulate the crash point of an interrupted replace: the new data
        // is fully burned into fresh sectors, but the FAT was never
        // persisted (power was lost first).
        let free_sector = (cfg::PROFILE_FIRST..=cfg::PROFILE_LAST)
            .find(|s| !fs.sector_live(*s))
            .unwrap();
        drop(fs);
        chip.erase_sector(free_sector).unwrap();
        chip.program_page(free_sector as u32 * cfg::SECTOR_SIZE, b"BBBBBBBB")
            .unwrap();

        let fs2 = remount(&chip, &bus);
        assert_eq!(fs2.file_read("/profiles/x", 16).unwrap(), b"A");
        assert_eq!(fs2.live_count(), 1);
    }
}
