use std::sync::{Arc, Mutex, MutexGuard};

use crate::chunk::Chunk;
use crate::config::StoreConfig;
use crate::constants::StoreFlags;
use crate::error::Result;
use crate::iter::ChunkIter;
use crate::serializer::ItemSerializer;
use crate::store::engine::{check_collection_id, StoreEngine};
use crate::store::BigCollectionChunksStore;
use crate::types::StoreStat;

/// Store variant serializing every operation behind one mutex.
///
/// Fully linearizable: a large `remove` blocks concurrent saves for its
/// whole duration.
pub struct ChunksStore<I> {
    engine: Arc<StoreEngine<I>>,
    lock: Mutex<()>,
}

impl<I> ChunksStore<I> {
    pub fn new(config: StoreConfig, serializer: Arc<dyn ItemSerializer<I>>) -> Result<Self> {
        Ok(ChunksStore {
            engine: Arc::new(StoreEngine::new(config, serializer)?),
            lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        self.engine.config()
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.lock.lock()?)
    }
}

impl<I> BigCollectionChunksStore<I> for ChunksStore<I> {
    fn start(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.engine.start()
    }

    fn stop(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.engine.stop()
    }

    fn destroy(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.engine.destroy()
    }

    fn save(&self, collection_id: &str, chunk: &Chunk<I>) -> Result<bool> {
        let _guard = self.guard()?;
        match self.engine.save(collection_id, chunk)? {
            Some(delta) => {
                self.engine.add_to_total_size(delta)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, collection_id: &str) -> Result<()> {
        let _guard = self.guard()?;
        let delta = self.engine.remove(collection_id)?;
        self.engine.add_to_total_size(delta)
    }

    fn register_as_completed(&self, collection_id: &str) -> Result<()> {
        let _guard = self.guard()?;
        self.engine.register_as_completed(collection_id)
    }

    fn is_completed(&self, collection_id: &str) -> Result<bool> {
        let _guard = self.guard()?;
        self.engine.is_completed(collection_id)
    }

    fn get_chunks(&self, collection_id: &str) -> Result<ChunkIter<I>> {
        check_collection_id(collection_id)?;
        Ok(ChunkIter::new(Arc::clone(&self.engine), collection_id))
    }

    fn size(&self, collection_id: &str) -> Result<u64> {
        let _guard = self.guard()?;
        self.engine.size(collection_id)
    }

    fn size_in_bytes(&self, collection_id: &str) -> Result<u64> {
        let _guard = self.guard()?;
        self.engine.size_in_bytes(collection_id)
    }

    fn total_size_in_bytes(&self) -> Result<u64> {
        let _guard = self.guard()?;
        self.engine.total_size_in_bytes()
    }

    fn collection_ids(&self) -> Result<Vec<String>> {
        let _guard = self.guard()?;
        self.engine.collection_ids()
    }

    fn contains(&self, collection_id: &str) -> Result<bool> {
        let _guard = self.guard()?;
        self.engine.contains(collection_id)
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.engine.clear()
    }

    fn compact(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.engine.compact()
    }

    fn stat(&self) -> Result<StoreStat> {
        let _guard = self.guard()?;
        self.engine.stat()
    }

    fn flags(&self) -> StoreFlags {
        self.engine.flags()
    }

    fn set_flags(&self, flags: StoreFlags, onoff: bool) -> Result<()> {
        self.engine.set_flags(flags, onoff)
    }
}
