use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::bounded_map::{BoundedMap, MapOptions};
use crate::constants::{CONTENT_FILE_PREFIX, DELETE_ATTEMPTS, DELETE_BACKOFF_MS, MAP_FILE_SUFFIX};
use crate::error::{Error, Result};

/// A content map together with the numeric suffix of its file
#[derive(Debug)]
pub(crate) struct ContentMap {
    pub(crate) id: u32,
    pub(crate) map: BoundedMap,
}

/// Growable pool of content maps, one file each
#[derive(Debug)]
pub(crate) struct MapPool {
    folder: PathBuf,
    options: MapOptions,
    maps: Vec<ContentMap>,
}

pub(crate) fn content_file_name(id: u32) -> String {
    format!("{}{}{}", CONTENT_FILE_PREFIX, id, MAP_FILE_SUFFIX)
}

fn parse_content_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(CONTENT_FILE_PREFIX)?
        .strip_suffix(MAP_FILE_SUFFIX)?
        .parse()
        .ok()
}

impl MapPool {
    /// An empty pool creating its maps under `folder`
    pub(crate) fn new<P: AsRef<Path>>(folder: P, options: MapOptions) -> Self {
        MapPool {
            folder: folder.as_ref().to_path_buf(),
            options,
            maps: Vec::new(),
        }
    }

    /// Rebuild the pool from the content-map files found in `folder`
    pub(crate) fn reload<P: AsRef<Path>>(folder: P, options: MapOptions) -> Result<Self> {
        let mut pool = MapPool::new(folder, options);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&pool.folder)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_content_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        for id in ids {
            let map = BoundedMap::open(pool.folder.join(content_file_name(id)))?;
            pool.maps.push(ContentMap { id, map });
        }
        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.maps.len()
    }

    /// Entries stored across all maps
    pub(crate) fn entries(&self) -> usize {
        self.maps.iter().map(|content| content.map.len()).sum()
    }

    pub(crate) fn maps(&self) -> &[ContentMap] {
        &self.maps
    }

    pub(crate) fn map_mut(&mut self, index: usize) -> &mut BoundedMap {
        &mut self.maps[index].map
    }

    /// First map, in pool order, with room for `entries_needed` more entries
    /// and free cells for entries of `entry_sizes` bytes
    pub(crate) fn find_with_free_capacity(
        &self,
        entries_needed: usize,
        entry_sizes: &[usize],
    ) -> Option<usize> {
        self.maps.iter().position(|content| {
            content.map.len() + entries_needed < content.map.max_entries()
                && content.map.cells_needed(entry_sizes) <= content.map.free_cells()
        })
    }

    /// Cells that entries of `entry_sizes` bytes take in this pool's maps
    pub(crate) fn cells_needed(&self, entry_sizes: &[usize]) -> usize {
        self.options.cells_needed(entry_sizes)
    }

    /// Create a map with the next unused suffix and at least `min_cells`
    /// data cells, and append it to the pool
    pub(crate) fn create_map(&mut self, min_cells: usize) -> Result<usize> {
        let id = self
            .maps
            .iter()
            .map(|content| content.id + 1)
            .max()
            .unwrap_or(0);
        let path = self.folder.join(content_file_name(id));
        let map = BoundedMap::create_with_cells(&path, self.options, min_cells)?;
        debug!("content map {:?} added to pool", path);
        self.maps.push(ContentMap { id, map });
        Ok(self.maps.len() - 1)
    }

    /// Take empty maps out of the pool.
    ///
    /// With `keep_one` set nothing happens unless at least two maps are
    /// empty, and the first empty map stays in the pool.
    pub(crate) fn detach_empty(&mut self, keep_one: bool) -> Vec<ContentMap> {
        let empty = self.maps.iter().filter(|c| c.map.is_empty()).count();
        if empty == 0 || (keep_one && empty < 2) {
            return Vec::new();
        }

        let mut kept_one = !keep_one;
        let mut detached = Vec::new();
        let mut remaining = Vec::with_capacity(self.maps.len());
        for content in self.maps.drain(..) {
            if content.map.is_empty() && kept_one {
                detached.push(content);
            } else {
                kept_one |= content.map.is_empty();
                remaining.push(content);
            }
        }
        self.maps = remaining;
        detached
    }

    /// Take every map out of the pool
    pub(crate) fn detach_all(&mut self) -> Vec<ContentMap> {
        self.maps.drain(..).collect()
    }

    pub(crate) fn flush(&self) -> Result<()> {
        for content in &self.maps {
            content.map.flush()?;
        }
        Ok(())
    }
}

/// Close a detached map and delete its file, retrying on failure
pub(crate) fn delete_map_file(content: ContentMap) -> Result<()> {
    let path = content.map.path().to_path_buf();
    drop(content);

    for attempt in 1..=DELETE_ATTEMPTS {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("content map {:?} reclaimed", path);
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                warn!(
                    "attempt {}/{} to delete {:?} failed: {}",
                    attempt, DELETE_ATTEMPTS, path, err
                );
                if attempt < DELETE_ATTEMPTS {
                    thread::sleep(Duration::from_millis(DELETE_BACKOFF_MS));
                }
            }
        }
    }
    Err(Error::DeleteFailed {
        path,
        attempts: DELETE_ATTEMPTS,
    })
}
