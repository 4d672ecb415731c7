//! Fixed-capacity, file-backed key/value map.
//!
//! The whole file is memory mapped. Geometry is decided once at creation
//! from the declared entry count and average key/value sizes and never
//! changes afterwards:
//!
//! ```text
//! +--------------+---------------------+-------------+------------------+
//! | header (64)  | slot table          | cell bitmap | data cells       |
//! +--------------+---------------------+-------------+------------------+
//! ```
//!
//! The slot table is an open-addressing hash table with linear probing and
//! backward-shift deletion. An entry stores `key ‖ value` in a contiguous
//! run of cells taken first-fit from the bitmap.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use crate::constants::{CELL_OVERHEAD, MAP_HEADER_SIZE, MAP_MAGIC, MAP_VERSION, SLOT_SIZE};
use crate::error::{Error, Result};

// Header field offsets
const HDR_VERSION: usize = 8;
const HDR_CELL_SIZE: usize = 12;
const HDR_MAX_ENTRIES: usize = 16;
const HDR_SLOT_COUNT: usize = 24;
const HDR_CELL_COUNT: usize = 32;
const HDR_LEN: usize = 40;
const HDR_AVG_KEY: usize = 48;
const HDR_AVG_VALUE: usize = 52;

/// Declared capacity of a bounded map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// Average key size in bytes
    pub avg_key_size: usize,
    /// Average value size in bytes
    pub avg_value_size: usize,
}

impl MapOptions {
    /// Bytes per data cell
    pub fn cell_size(&self) -> usize {
        self.avg_key_size + self.avg_value_size + CELL_OVERHEAD
    }

    /// Cells taken by entries of the given `key ‖ value` byte sizes
    pub fn cells_needed(&self, entry_sizes: &[usize]) -> usize {
        let cell_size = self.cell_size();
        entry_sizes.iter().map(|&size| cells_for(size, cell_size)).sum()
    }
}

/// Decoded slot of the hash table
#[derive(Debug, Clone, Copy)]
struct Slot {
    hash: u64,
    first_cell: usize,
    key_len: usize,
    value_len: usize,
}

impl Slot {
    fn cells(&self, cell_size: usize) -> usize {
        cells_for(self.key_len + self.value_len, cell_size)
    }
}

/// Persistent bounded hash map over a memory-mapped file
#[derive(Debug)]
pub struct BoundedMap {
    /// Path of the backing file
    path: PathBuf,
    /// Backing file, kept open for the lifetime of the map
    _file: File,
    /// Memory map over the whole file
    map: MmapMut,
    max_entries: usize,
    slot_count: usize,
    cell_count: usize,
    cell_size: usize,
    avg_key_size: usize,
    avg_value_size: usize,
    /// Number of live entries
    len: usize,
    /// Cells currently allocated to entries
    used_cells: usize,
    /// No free cell exists below this index
    free_hint: usize,
}

impl BoundedMap {
    /// Create a new map file, truncating any existing file at `path`
    pub fn create<P: AsRef<Path>>(path: P, options: MapOptions) -> Result<Self> {
        Self::create_with_cells(path, options, 0)
    }

    /// Create a new map file with room for at least `min_cells` data cells.
    ///
    /// The cell region never holds fewer than `2 × max_entries` cells.
    pub fn create_with_cells<P: AsRef<Path>>(
        path: P,
        options: MapOptions,
        min_cells: usize,
    ) -> Result<Self> {
        if options.max_entries == 0 {
            return Err(Error::InvalidArgument("max_entries must be positive".into()));
        }
        let path = path.as_ref().to_path_buf();
        let cell_size = options.cell_size();
        let slot_count = (options.max_entries * 2).next_power_of_two();
        let cell_count = (options.max_entries * 2).max(min_cells);
        let file_len = file_len(slot_count, cell_count, cell_size);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(file_len as u64)?;

        let mut map = unsafe { MmapOptions::new().len(file_len).map_mut(&file)? };
        map[..MAP_MAGIC.len()].copy_from_slice(&MAP_MAGIC);
        write_u32(&mut map, HDR_VERSION, MAP_VERSION);
        write_u32(&mut map, HDR_CELL_SIZE, cell_size as u32);
        write_u64(&mut map, HDR_MAX_ENTRIES, options.max_entries as u64);
        write_u64(&mut map, HDR_SLOT_COUNT, slot_count as u64);
        write_u64(&mut map, HDR_CELL_COUNT, cell_count as u64);
        write_u64(&mut map, HDR_LEN, 0);
        write_u32(&mut map, HDR_AVG_KEY, options.avg_key_size as u32);
        write_u32(&mut map, HDR_AVG_VALUE, options.avg_value_size as u32);

        debug!(
            "created bounded map {:?}: {} entries, {} slots, {} cells of {} bytes",
            path, options.max_entries, slot_count, cell_count, cell_size
        );

        Ok(BoundedMap {
            path,
            _file: file,
            map,
            max_entries: options.max_entries,
            slot_count,
            cell_count,
            cell_size,
            avg_key_size: options.avg_key_size,
            avg_value_size: options.avg_value_size,
            len: 0,
            used_cells: 0,
            free_hint: 0,
        })
    }

    /// Open an existing map file, reading its geometry from the header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let actual_len = file.metadata()?.len() as usize;
        if actual_len < MAP_HEADER_SIZE {
            return Err(Error::InvalidFile(path));
        }

        let map = unsafe { MmapOptions::new().len(actual_len).map_mut(&file)? };
        if map[..MAP_MAGIC.len()] != MAP_MAGIC {
            return Err(Error::InvalidFile(path));
        }
        let version = read_u32(&map, HDR_VERSION);
        if version != MAP_VERSION {
            return Err(Error::VersionMismatch {
                found: version,
                expected: MAP_VERSION,
            });
        }

        let cell_size = read_u32(&map, HDR_CELL_SIZE) as usize;
        let max_entries = read_u64(&map, HDR_MAX_ENTRIES) as usize;
        let slot_count = read_u64(&map, HDR_SLOT_COUNT) as usize;
        let cell_count = read_u64(&map, HDR_CELL_COUNT) as usize;
        let len = read_u64(&map, HDR_LEN) as usize;
        if cell_size == 0
            || !slot_count.is_power_of_two()
            || file_len(slot_count, cell_count, cell_size) != actual_len
            || len > max_entries
        {
            return Err(Error::InvalidFile(path));
        }

        let mut bounded = BoundedMap {
            path,
            _file: file,
            max_entries,
            slot_count,
            cell_count,
            cell_size,
            avg_key_size: read_u32(&map, HDR_AVG_KEY) as usize,
            avg_value_size: read_u32(&map, HDR_AVG_VALUE) as usize,
            map,
            len,
            used_cells: 0,
            free_hint: 0,
        };
        let bitmap = bounded.bitmap_base()..bounded.cells_base();
        bounded.used_cells = bounded.map[bitmap]
            .iter()
            .map(|byte| byte.count_ones() as usize)
            .sum();
        bounded.free_hint = bounded.first_free_cell(0);
        Ok(bounded)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of live entries declared at creation
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Capacity this map was created with
    pub fn options(&self) -> MapOptions {
        MapOptions {
            max_entries: self.max_entries,
            avg_key_size: self.avg_key_size,
            avg_value_size: self.avg_value_size,
        }
    }

    /// Data cells not allocated to any entry
    pub fn free_cells(&self) -> usize {
        self.cell_count - self.used_cells
    }

    /// Cells taken by entries of the given `key ‖ value` byte sizes
    pub fn cells_needed(&self, entry_sizes: &[usize]) -> usize {
        entry_sizes
            .iter()
            .map(|&size| cells_for(size, self.cell_size))
            .sum()
    }

    /// Whether new entries of the given sizes fit the remaining slots and
    /// cells. Fragmented free cells can still make a write fail.
    pub fn can_fit(&self, entry_sizes: &[usize]) -> bool {
        self.len + entry_sizes.len() <= self.max_entries
            && self.cells_needed(entry_sizes) <= self.free_cells()
    }

    /// Get a copy of the value stored under `key`
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.find(key).map(|(_, slot)| {
            let start = self.cell_offset(slot.first_cell) + slot.key_len;
            self.map[start..start + slot.value_len].to_vec()
        })
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Insert or overwrite the value stored under `key`
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let needed = cells_for(key.len() + value.len(), self.cell_size);

        if let Some((idx, old)) = self.find(key) {
            let old_cells = old.cells(self.cell_size);
            self.release(old.first_cell, old_cells);
            let first_cell = match self.allocate(needed) {
                Ok(first_cell) => first_cell,
                Err(err) => {
                    // Old cells are untouched until the new run is written
                    self.reserve(old.first_cell, old_cells);
                    return Err(err);
                }
            };
            self.write_entry(first_cell, key, value);
            self.write_slot(
                idx,
                Slot {
                    hash: old.hash,
                    first_cell,
                    key_len: key.len(),
                    value_len: value.len(),
                },
            );
            return Ok(());
        }

        if self.len >= self.max_entries {
            return Err(Error::MapFull(self.path.clone()));
        }
        let hash = hash_key(key);
        let idx = self.probe_empty(hash)?;
        let first_cell = self.allocate(needed)?;
        self.write_entry(first_cell, key, value);
        self.write_slot(
            idx,
            Slot {
                hash,
                first_cell,
                key_len: key.len(),
                value_len: value.len(),
            },
        );
        self.set_len(self.len + 1);
        Ok(())
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let (idx, slot) = match self.find(key) {
            Some(found) => found,
            None => return false,
        };
        self.release(slot.first_cell, slot.cells(self.cell_size));

        let mask = self.slot_count - 1;
        let mut hole = idx;
        let mut next = idx;
        loop {
            next = (next + 1) & mask;
            let candidate = self.read_slot(next);
            if candidate.hash == 0 {
                break;
            }
            let home = candidate.hash as usize & mask;
            let stays = if hole <= next {
                hole < home && home <= next
            } else {
                hole < home || home <= next
            };
            if !stays {
                self.write_slot(hole, candidate);
                hole = next;
            }
        }
        self.clear_slot(hole);
        self.set_len(self.len - 1);
        true
    }

    /// All keys currently stored, in slot order
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.len);
        for idx in 0..self.slot_count {
            let slot = self.read_slot(idx);
            if slot.hash != 0 {
                let start = self.cell_offset(slot.first_cell);
                keys.push(self.map[start..start + slot.key_len].to_vec());
            }
        }
        keys
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        let start = MAP_HEADER_SIZE;
        let end = self.cells_base();
        self.map[start..end].fill(0);
        self.set_len(0);
        self.used_cells = 0;
        self.free_hint = 0;
    }

    /// Flush outstanding changes to disk
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    fn find(&self, key: &[u8]) -> Option<(usize, Slot)> {
        let hash = hash_key(key);
        let mask = self.slot_count - 1;
        let mut idx = hash as usize & mask;
        for _ in 0..self.slot_count {
            let slot = self.read_slot(idx);
            if slot.hash == 0 {
                return None;
            }
            if slot.hash == hash && slot.key_len == key.len() {
                let start = self.cell_offset(slot.first_cell);
                if &self.map[start..start + slot.key_len] == key {
                    return Some((idx, slot));
                }
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    fn probe_empty(&self, hash: u64) -> Result<usize> {
        let mask = self.slot_count - 1;
        let mut idx = hash as usize & mask;
        for _ in 0..self.slot_count {
            if self.read_slot(idx).hash == 0 {
                return Ok(idx);
            }
            idx = (idx + 1) & mask;
        }
        Err(Error::MapFull(self.path.clone()))
    }

    /// First-fit allocation of `count` contiguous free cells
    fn allocate(&mut self, count: usize) -> Result<usize> {
        let mut start = self.first_free_cell(self.free_hint);
        while start + count <= self.cell_count {
            let used = (start..start + count).find(|&cell| self.cell_used(cell));
            match used {
                None => {
                    for cell in start..start + count {
                        self.set_cell_used(cell, true);
                    }
                    if start == self.free_hint {
                        self.free_hint = self.first_free_cell(start + count);
                    }
                    return Ok(start);
                }
                Some(used) => start = self.first_free_cell(used + 1),
            }
        }
        Err(Error::MapFull(self.path.clone()))
    }

    fn reserve(&mut self, first_cell: usize, count: usize) {
        for cell in first_cell..first_cell + count {
            self.set_cell_used(cell, true);
        }
        if (first_cell..first_cell + count).contains(&self.free_hint) {
            self.free_hint = self.first_free_cell(first_cell + count);
        }
    }

    fn release(&mut self, first_cell: usize, count: usize) {
        for cell in first_cell..first_cell + count {
            self.set_cell_used(cell, false);
        }
        self.free_hint = self.free_hint.min(first_cell);
    }

    fn first_free_cell(&self, from: usize) -> usize {
        (from..self.cell_count)
            .find(|&cell| !self.cell_used(cell))
            .unwrap_or(self.cell_count)
    }

    fn cell_used(&self, cell: usize) -> bool {
        let byte = self.map[self.bitmap_base() + cell / 8];
        byte & (1 << (cell % 8)) != 0
    }

    fn set_cell_used(&mut self, cell: usize, used: bool) {
        if self.cell_used(cell) == used {
            return;
        }
        let pos = self.bitmap_base() + cell / 8;
        if used {
            self.map[pos] |= 1 << (cell % 8);
            self.used_cells += 1;
        } else {
            self.map[pos] &= !(1 << (cell % 8));
            self.used_cells -= 1;
        }
    }

    fn write_entry(&mut self, first_cell: usize, key: &[u8], value: &[u8]) {
        let start = self.cell_offset(first_cell);
        self.map[start..start + key.len()].copy_from_slice(key);
        let start = start + key.len();
        self.map[start..start + value.len()].copy_from_slice(value);
    }

    fn read_slot(&self, idx: usize) -> Slot {
        let base = MAP_HEADER_SIZE + idx * SLOT_SIZE;
        Slot {
            hash: read_u64(&self.map, base),
            first_cell: read_u64(&self.map, base + 8) as usize,
            key_len: read_u32(&self.map, base + 16) as usize,
            value_len: read_u32(&self.map, base + 20) as usize,
        }
    }

    fn write_slot(&mut self, idx: usize, slot: Slot) {
        let base = MAP_HEADER_SIZE + idx * SLOT_SIZE;
        write_u64(&mut self.map, base, slot.hash);
        write_u64(&mut self.map, base + 8, slot.first_cell as u64);
        write_u32(&mut self.map, base + 16, slot.key_len as u32);
        write_u32(&mut self.map, base + 20, slot.value_len as u32);
    }

    fn clear_slot(&mut self, idx: usize) {
        let base = MAP_HEADER_SIZE + idx * SLOT_SIZE;
        self.map[base..base + SLOT_SIZE].fill(0);
    }

    fn set_len(&mut self, len: usize) {
        self.len = len;
        write_u64(&mut self.map, HDR_LEN, len as u64);
    }

    fn bitmap_base(&self) -> usize {
        MAP_HEADER_SIZE + self.slot_count * SLOT_SIZE
    }

    fn cells_base(&self) -> usize {
        self.bitmap_base() + bitmap_len(self.cell_count)
    }

    fn cell_offset(&self, cell: usize) -> usize {
        self.cells_base() + cell * self.cell_size
    }
}

fn file_len(slot_count: usize, cell_count: usize, cell_size: usize) -> usize {
    MAP_HEADER_SIZE + slot_count * SLOT_SIZE + bitmap_len(cell_count) + cell_count * cell_size
}

fn bitmap_len(cell_count: usize) -> usize {
    (cell_count + 7) / 8
}

fn cells_for(bytes: usize, cell_size: usize) -> usize {
    ((bytes + cell_size - 1) / cell_size).max(1)
}

/// FNV-1a over the key; the low bit is forced so that 0 marks an empty slot
fn hash_key(key: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    let hash = key
        .iter()
        .fold(OFFSET, |h, &b| (h ^ b as u64).wrapping_mul(PRIME));
    hash | 1
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_options() -> MapOptions {
        MapOptions {
            max_entries: 16,
            avg_key_size: 8,
            avg_value_size: 16,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let mut map = BoundedMap::create(dir.path().join("m.dat"), small_options()).unwrap();

        map.insert(b"alpha", b"one").unwrap();
        map.insert(b"beta", b"two").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(b"alpha"), Some(b"one".to_vec()));
        assert_eq!(map.get(b"gamma"), None);

        map.insert(b"alpha", b"a much longer value spanning cells").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get(b"alpha"),
            Some(b"a much longer value spanning cells".to_vec())
        );

        assert!(map.remove(b"alpha"));
        assert!(!map.remove(b"alpha"));
        assert!(!map.contains_key(b"alpha"));
        assert_eq!(map.get(b"beta"), Some(b"two".to_vec()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_rejects_entries_beyond_capacity() {
        let dir = TempDir::new().unwrap();
        let mut map = BoundedMap::create(dir.path().join("m.dat"), small_options()).unwrap();

        for i in 0..16 {
            map.insert(format!("key{}", i).as_bytes(), b"v").unwrap();
        }
        let result = map.insert(b"overflow", b"v");
        assert!(matches!(result, Err(Error::MapFull(_))));

        // Overwriting an existing key is still allowed when full
        map.insert(b"key3", b"replaced").unwrap();
        assert_eq!(map.get(b"key3"), Some(b"replaced".to_vec()));
    }

    #[test]
    fn test_probe_chains_survive_removal() {
        let dir = TempDir::new().unwrap();
        let mut map = BoundedMap::create(dir.path().join("m.dat"), small_options()).unwrap();

        for i in 0..16 {
            map.insert(format!("k{}", i).as_bytes(), &[i as u8]).unwrap();
        }
        for i in (0..16).step_by(2) {
            assert!(map.remove(format!("k{}", i).as_bytes()));
        }
        for i in (1..16).step_by(2) {
            assert_eq!(map.get(format!("k{}", i).as_bytes()), Some(vec![i as u8]));
        }
        assert_eq!(map.keys().len(), 8);
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.dat");
        {
            let mut map = BoundedMap::create(&path, small_options()).unwrap();
            map.insert(b"persist", b"me").unwrap();
            map.flush().unwrap();
        }

        let map = BoundedMap::open(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.options(), small_options());
        assert_eq!(map.get(b"persist"), Some(b"me".to_vec()));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.dat");
        std::fs::write(&path, vec![7u8; 128]).unwrap();

        assert!(matches!(BoundedMap::open(&path), Err(Error::InvalidFile(_))));
    }

    #[test]
    fn test_overwrite_reuses_its_own_cells() {
        let dir = TempDir::new().unwrap();
        let mut map = BoundedMap::create(dir.path().join("m.dat"), small_options()).unwrap();
        // 32 cells of 32 bytes: one entry takes them all
        map.insert(b"list", &[1u8; 32 * 32 - 4]).unwrap();
        assert_eq!(map.free_cells(), 0);

        map.insert(b"list", &[2u8; 32 * 32 - 4]).unwrap();
        assert_eq!(map.get(b"list"), Some(vec![2u8; 32 * 32 - 4]));

        // A failed grow leaves the old value in place
        let result = map.insert(b"list", &[3u8; 32 * 32]);
        assert!(matches!(result, Err(Error::MapFull(_))));
        assert_eq!(map.get(b"list"), Some(vec![2u8; 32 * 32 - 4]));
        assert_eq!(map.free_cells(), 0);
    }

    #[test]
    fn test_capacity_accounts_for_long_keys() {
        let dir = TempDir::new().unwrap();
        let options = small_options();
        let long_entry = 100;
        assert_eq!(options.cells_needed(&[long_entry, 10]), 4 + 1);

        let mut map = BoundedMap::create(dir.path().join("m.dat"), options).unwrap();
        assert!(!map.can_fit(&[long_entry; 9]));
        assert!(map.can_fit(&[long_entry; 8]));
        map.insert(&[b'k'; 90], &[0u8; 10]).unwrap();
        assert_eq!(map.free_cells(), 28);

        let sized = BoundedMap::create_with_cells(dir.path().join("big.dat"), options, 64).unwrap();
        assert_eq!(sized.free_cells(), 64);
        assert!(sized.can_fit(&[long_entry; 16]));
    }

    #[test]
    fn test_reopen_restores_cell_usage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.dat");
        {
            let mut map = BoundedMap::create_with_cells(&path, small_options(), 40).unwrap();
            map.insert(b"wide", &[5u8; 70]).unwrap();
            map.insert(b"narrow", b"x").unwrap();
        }

        let mut map = BoundedMap::open(&path).unwrap();
        assert_eq!(map.free_cells(), 40 - 3 - 1);
        map.insert(b"more", b"y").unwrap();
        assert_eq!(map.get(b"wide"), Some(vec![5u8; 70]));
    }

    #[test]
    fn test_clear_frees_cells() {
        let dir = TempDir::new().unwrap();
        let mut map = BoundedMap::create(dir.path().join("m.dat"), small_options()).unwrap();

        for i in 0..16 {
            map.insert(format!("key{}", i).as_bytes(), &[0u8; 20]).unwrap();
        }
        map.clear();
        assert!(map.is_empty());
        assert!(map.keys().is_empty());
        for i in 0..16 {
            map.insert(format!("again{}", i).as_bytes(), &[1u8; 20]).unwrap();
        }
        assert_eq!(map.len(), 16);
    }
}
