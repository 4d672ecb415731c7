//! Store logic shared by both store variants.
//!
//! The pool sits behind a read/write lock: saving, removing and reclaiming
//! take the write lock, chunk lookups take the read lock. The reference
//! index has its own mutex and is always locked after the pool.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use lazy_static::lazy_static;
use log::{debug, info, warn};

use crate::chunk::Chunk;
use crate::codec::ChunkCodec;
use crate::config::StoreConfig;
use crate::constants::{StoreFlags, REF_FILE_NAME};
use crate::error::{Error, Result};
use crate::map_pool::{delete_map_file, ContentMap, MapPool};
use crate::reference::ReferenceIndex;
use crate::serializer::ItemSerializer;
use crate::types::StoreStat;

lazy_static! {
    static ref CHANGEABLE: StoreFlags = StoreFlags::REUSE_CONTENT_MAPS | StoreFlags::NOSYNC;
}

pub(crate) fn check_collection_id(collection_id: &str) -> Result<()> {
    if collection_id.is_empty() {
        return Err(Error::InvalidArgument("collection id must not be empty".into()));
    }
    Ok(())
}

pub(crate) struct StoreEngine<I> {
    config: StoreConfig,
    folder: PathBuf,
    flags: AtomicU32,
    codec: ChunkCodec<I>,
    pool: RwLock<Option<MapPool>>,
    refs: Mutex<Option<ReferenceIndex>>,
}

impl<I> StoreEngine<I> {
    pub(crate) fn new(config: StoreConfig, serializer: Arc<dyn ItemSerializer<I>>) -> Result<Self> {
        config.validate()?;
        Ok(StoreEngine {
            folder: config.folder(),
            flags: AtomicU32::new(config.flags.bits()),
            codec: ChunkCodec::new(serializer, config.avg_item_size),
            pool: RwLock::new(None),
            refs: Mutex::new(None),
            config,
        })
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn flags(&self) -> StoreFlags {
        StoreFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn set_flags(&self, flags: StoreFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::FlagsImmutable);
        }
        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        }
        Ok(())
    }

    pub(crate) fn start(&self) -> Result<()> {
        let mut pool = self.pool.write()?;
        let mut refs = self.refs.lock()?;
        if pool.is_some() || refs.is_some() {
            return Err(Error::AlreadyStarted);
        }

        fs::create_dir_all(&self.folder)?;
        let index = ReferenceIndex::open_or_create(
            self.folder.join(REF_FILE_NAME),
            self.config.reference_options(),
        )?;
        let reloaded = MapPool::reload(&self.folder, self.config.content_options())?;
        info!(
            "store {:?} started with {} content maps",
            self.folder,
            reloaded.len()
        );

        *refs = Some(index);
        *pool = Some(reloaded);
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        let mut pool = self.pool.write()?;
        let mut refs = self.refs.lock()?;
        let sync = !self.flags().contains(StoreFlags::NOSYNC);

        if let Some(pool) = pool.take() {
            if sync {
                pool.flush()?;
            }
        }
        if let Some(refs) = refs.take() {
            if sync {
                refs.flush()?;
            }
        }
        info!("store {:?} stopped", self.folder);
        Ok(())
    }

    pub(crate) fn destroy(&self) -> Result<()> {
        self.stop()?;
        if self.folder.exists() {
            fs::remove_dir_all(&self.folder)?;
        }
        info!("store {:?} destroyed", self.folder);
        Ok(())
    }

    /// Save a chunk, returning the byte delta to add to the store-wide
    /// total, or `None` when the ordinal was already saved.
    pub(crate) fn save(&self, collection_id: &str, chunk: &Chunk<I>) -> Result<Option<i64>> {
        check_collection_id(collection_id)?;
        if self.with_refs(|refs| refs.has_chunk(collection_id, chunk.ordinal))? {
            return Ok(None);
        }

        let encoded = self.codec.encode(chunk)?;
        let max_entries = self.config.max_items_per_file;
        if encoded.num_entries >= max_entries {
            return Err(Error::ChunkTooLarge {
                needed: encoded.num_entries as u64,
                max_entries: max_entries as u64,
            });
        }

        let mut guard = self.pool.write()?;
        let pool = guard.as_mut().ok_or(Error::NotStarted)?;
        let mut refs = self.refs()?;
        let refs = refs.as_mut().ok_or(Error::NotStarted)?;
        if refs.has_chunk(collection_id, chunk.ordinal)? {
            return Ok(None);
        }

        // The strict capacity check leaves room for the numItems entry
        let sizes = self.codec.entry_sizes(collection_id, &encoded);
        let cells = pool.cells_needed(&sizes);
        let mut index = match pool.find_with_free_capacity(encoded.num_entries, &sizes) {
            Some(index) => index,
            None => pool.create_map(cells)?,
        };
        if let Err(err) = self.codec.write(pool.map_mut(index), collection_id, &encoded) {
            if !matches!(err, Error::MapFull(_)) {
                return Err(err);
            }
            // Free cells too fragmented for the entry runs; a fresh map
            // sized for the chunk always holds it
            debug!(
                "chunk {} of {} does not fit {:?}, adding a content map",
                chunk.ordinal,
                collection_id,
                pool.maps()[index].map.path()
            );
            index = pool.create_map(cells)?;
            self.codec.write(pool.map_mut(index), collection_id, &encoded)?;
        }

        if let Err(err) = refs.record_saved_chunk(
            collection_id,
            chunk.ordinal,
            encoded.num_items() as i64,
            encoded.size_in_bytes as i64,
        ) {
            self.codec.discard(pool.map_mut(index), collection_id, &encoded);
            return Err(err);
        }
        Ok(Some(encoded.size_in_bytes as i64))
    }

    /// Read chunk `ordinal`, or `None` when it was never saved
    pub(crate) fn read_chunk(&self, collection_id: &str, ordinal: u32) -> Result<Option<Chunk<I>>> {
        let guard = self.pool.read()?;
        let pool = guard.as_ref().ok_or(Error::NotStarted)?;
        if !self.with_refs(|refs| refs.has_chunk(collection_id, ordinal))? {
            return Ok(None);
        }

        let content = pool
            .maps()
            .iter()
            .find(|content| self.codec.holds_chunk(&content.map, collection_id, ordinal))
            .ok_or_else(|| {
                Error::MissingEntry(format!("{}_chunk{}_numItems", collection_id, ordinal))
            })?;
        self.codec.read(&content.map, collection_id, ordinal).map(Some)
    }

    pub(crate) fn has_chunk(&self, collection_id: &str, ordinal: u32) -> Result<bool> {
        self.with_refs(|refs| refs.has_chunk(collection_id, ordinal))
    }

    /// Remove a collection, returning the (non-positive) byte delta for the
    /// store-wide total
    pub(crate) fn remove(&self, collection_id: &str) -> Result<i64> {
        check_collection_id(collection_id)?;
        let (detached, delta) = {
            let mut guard = self.pool.write()?;
            let pool = guard.as_mut().ok_or(Error::NotStarted)?;
            let mut refs = self.refs()?;
            let refs = refs.as_mut().ok_or(Error::NotStarted)?;
            if !refs.contains(collection_id) {
                // A collection only flagged as completed has no chunks
                refs.remove_collection(collection_id);
                return Ok(0);
            }

            let bytes = refs.size_in_bytes(collection_id)?;
            let mut removed = 0;
            for ordinal in refs.chunk_ordinals(collection_id)? {
                let index = pool.maps().iter().position(|content| {
                    self.codec.holds_chunk(&content.map, collection_id, ordinal)
                });
                match index {
                    Some(index) => {
                        removed += self.codec.remove(pool.map_mut(index), collection_id, ordinal)?
                    }
                    None => warn!("chunk {} of {} not found in any content map", ordinal, collection_id),
                }
            }
            refs.remove_collection(collection_id);
            debug!("removed {} entries of collection {}", removed, collection_id);

            let reclaim = !self.flags().contains(StoreFlags::REUSE_CONTENT_MAPS);
            let detached = if reclaim { pool.detach_empty(true) } else { Vec::new() };
            (detached, -(bytes as i64))
        };

        delete_maps(detached)?;
        Ok(delta)
    }

    pub(crate) fn add_to_total_size(&self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut refs = self.refs()?;
        refs.as_mut()
            .ok_or(Error::NotStarted)?
            .add_to_total_size(delta)
    }

    pub(crate) fn register_as_completed(&self, collection_id: &str) -> Result<()> {
        check_collection_id(collection_id)?;
        let mut refs = self.refs()?;
        refs.as_mut()
            .ok_or(Error::NotStarted)?
            .mark_complete(collection_id)
    }

    pub(crate) fn is_completed(&self, collection_id: &str) -> Result<bool> {
        self.with_refs(|refs| Ok(refs.is_complete(collection_id)))
    }

    pub(crate) fn size(&self, collection_id: &str) -> Result<u64> {
        self.with_refs(|refs| refs.size(collection_id))
    }

    pub(crate) fn size_in_bytes(&self, collection_id: &str) -> Result<u64> {
        self.with_refs(|refs| refs.size_in_bytes(collection_id))
    }

    pub(crate) fn total_size_in_bytes(&self) -> Result<u64> {
        self.with_refs(|refs| refs.total_size())
    }

    pub(crate) fn collection_ids(&self) -> Result<Vec<String>> {
        self.with_refs(|refs| Ok(refs.collection_ids()))
    }

    pub(crate) fn contains(&self, collection_id: &str) -> Result<bool> {
        self.with_refs(|refs| Ok(refs.contains(collection_id)))
    }

    /// Empty the reference index and delete every content map
    pub(crate) fn clear(&self) -> Result<()> {
        let detached = {
            let mut guard = self.pool.write()?;
            let pool = guard.as_mut().ok_or(Error::NotStarted)?;
            let mut refs = self.refs()?;
            refs.as_mut().ok_or(Error::NotStarted)?.clear();
            pool.detach_all()
        };
        info!("clearing store {:?}: {} content maps", self.folder, detached.len());
        delete_maps(detached)
    }

    /// Delete every empty content map
    pub(crate) fn compact(&self) -> Result<()> {
        let detached = {
            let mut guard = self.pool.write()?;
            guard.as_mut().ok_or(Error::NotStarted)?.detach_empty(false)
        };
        debug!("compacting store {:?}: {} empty content maps", self.folder, detached.len());
        delete_maps(detached)
    }

    pub(crate) fn stat(&self) -> Result<StoreStat> {
        let guard = self.pool.read()?;
        let pool = guard.as_ref().ok_or(Error::NotStarted)?;
        let refs = self.refs()?;
        let refs = refs.as_ref().ok_or(Error::NotStarted)?;
        Ok(StoreStat {
            content_maps: pool.len(),
            content_entries: pool.entries(),
            collections: refs.collection_count(),
            total_size_in_bytes: refs.total_size()?,
        })
    }

    fn refs(&self) -> Result<MutexGuard<'_, Option<ReferenceIndex>>> {
        Ok(self.refs.lock()?)
    }

    fn with_refs<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReferenceIndex) -> Result<T>,
    {
        let refs = self.refs()?;
        f(refs.as_ref().ok_or(Error::NotStarted)?)
    }
}

fn delete_maps(detached: Vec<ContentMap>) -> Result<()> {
    for content in detached {
        delete_map_file(content)?;
    }
    Ok(())
}
