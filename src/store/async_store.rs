//! Store variant deferring removals and store-wide size accounting to
//! background workers.
//!
//! `remove` only queues the collection id; one worker drains that queue.
//! Every change to the store-wide byte counter goes through a second queue
//! and a second worker, so `total_size_in_bytes` may lag behind the
//! per-collection counters, which are always updated inline.

use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error};

use crate::chunk::Chunk;
use crate::config::StoreConfig;
use crate::constants::StoreFlags;
use crate::error::{Error, Result};
use crate::iter::ChunkIter;
use crate::serializer::ItemSerializer;
use crate::store::engine::{check_collection_id, StoreEngine};
use crate::store::BigCollectionChunksStore;
use crate::types::StoreStat;

/// Message for a background worker
enum Task<T> {
    Run(T),
    /// Acknowledge once every earlier task has been handled
    Barrier(Sender<()>),
    /// Stop after every earlier task has been handled
    Shutdown,
}

/// Handles on the two running workers
struct Workers {
    removals: Sender<Task<String>>,
    sizes: Sender<Task<i64>>,
    removal_handle: JoinHandle<()>,
    size_handle: JoinHandle<()>,
}

impl Workers {
    fn spawn<I: 'static>(engine: &Arc<StoreEngine<I>>) -> Result<Self> {
        let store_id = &engine.config().store_id;
        let (removals, removal_rx) = unbounded();
        let (sizes, size_rx) = unbounded();

        let size_engine = Arc::clone(engine);
        let size_handle = thread::Builder::new()
            .name(format!("{}-sizes", store_id))
            .spawn(move || size_worker(size_engine, size_rx))?;

        let removal_engine = Arc::clone(engine);
        let removal_sizes = sizes.clone();
        let removal_handle = thread::Builder::new()
            .name(format!("{}-removals", store_id))
            .spawn(move || removal_worker(removal_engine, removal_rx, removal_sizes))?;

        Ok(Workers {
            removals,
            sizes,
            removal_handle,
            size_handle,
        })
    }

    fn sync(&self) -> Result<()> {
        barrier(&self.removals)?;
        barrier(&self.sizes)
    }

    /// Drain both queues and join the workers. Removals go first since they
    /// feed the size queue.
    fn shutdown(self) -> Result<()> {
        let _ = self.removals.send(Task::Shutdown);
        self.removal_handle
            .join()
            .map_err(|_| Error::WorkerStopped)?;
        let _ = self.sizes.send(Task::Shutdown);
        self.size_handle.join().map_err(|_| Error::WorkerStopped)
    }
}

fn barrier<T>(queue: &Sender<Task<T>>) -> Result<()> {
    let (ack, done) = bounded(1);
    queue
        .send(Task::Barrier(ack))
        .map_err(|_| Error::WorkerStopped)?;
    done.recv().map_err(|_| Error::WorkerStopped)
}

fn removal_worker<I>(
    engine: Arc<StoreEngine<I>>,
    tasks: Receiver<Task<String>>,
    sizes: Sender<Task<i64>>,
) {
    for task in tasks.iter() {
        match task {
            Task::Run(collection_id) => match engine.remove(&collection_id) {
                Ok(0) => {}
                Ok(delta) => {
                    if sizes.send(Task::Run(delta)).is_err() {
                        error!("size worker gone, dropping delta {} of {}", delta, collection_id);
                    }
                }
                Err(err) => error!("removing collection {} failed: {}", collection_id, err),
            },
            Task::Barrier(ack) => {
                let _ = ack.send(());
            }
            Task::Shutdown => break,
        }
    }
    debug!("removal worker exiting");
}

fn size_worker<I>(engine: Arc<StoreEngine<I>>, tasks: Receiver<Task<i64>>) {
    for task in tasks.iter() {
        match task {
            Task::Run(delta) => {
                if let Err(err) = engine.add_to_total_size(delta) {
                    error!("applying size delta {} failed: {}", delta, err);
                }
            }
            Task::Barrier(ack) => {
                let _ = ack.send(());
            }
            Task::Shutdown => break,
        }
    }
    debug!("size worker exiting");
}

/// Store variant with deferred removal and size accounting.
///
/// Right after `remove` returns, `contains` may still report the
/// collection; call `sync_pending` to wait for the workers.
pub struct AsyncChunksStore<I> {
    engine: Arc<StoreEngine<I>>,
    /// Read-locked by operations feeding the queues, write-locked by
    /// `start` and `stop`
    workers: RwLock<Option<Workers>>,
}

impl<I: 'static> AsyncChunksStore<I> {
    pub fn new(config: StoreConfig, serializer: Arc<dyn ItemSerializer<I>>) -> Result<Self> {
        Ok(AsyncChunksStore {
            engine: Arc::new(StoreEngine::new(config, serializer)?),
            workers: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        self.engine.config()
    }

    fn with_workers<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Workers) -> Result<T>,
    {
        let workers = self.workers.read()?;
        f(workers.as_ref().ok_or(Error::NotStarted)?)
    }
}

impl<I: 'static> BigCollectionChunksStore<I> for AsyncChunksStore<I> {
    fn start(&self) -> Result<()> {
        let mut workers = self.workers.write()?;
        if workers.is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.engine.start()?;
        match Workers::spawn(&self.engine) {
            Ok(spawned) => {
                *workers = Some(spawned);
                Ok(())
            }
            Err(err) => {
                self.engine.stop()?;
                Err(err)
            }
        }
    }

    fn stop(&self) -> Result<()> {
        let workers = self.workers.write()?.take();
        if let Some(workers) = workers {
            workers.shutdown()?;
        }
        self.engine.stop()
    }

    fn destroy(&self) -> Result<()> {
        self.stop()?;
        self.engine.destroy()
    }

    /// `stop` cannot take the workers between persisting the chunk and
    /// queueing its size delta
    fn save(&self, collection_id: &str, chunk: &Chunk<I>) -> Result<bool> {
        self.with_workers(|workers| match self.engine.save(collection_id, chunk)? {
            Some(delta) => {
                workers
                    .sizes
                    .send(Task::Run(delta))
                    .map_err(|_| Error::WorkerStopped)?;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn remove(&self, collection_id: &str) -> Result<()> {
        check_collection_id(collection_id)?;
        self.with_workers(|workers| {
            workers
                .removals
                .send(Task::Run(collection_id.to_string()))
                .map_err(|_| Error::WorkerStopped)
        })
    }

    fn register_as_completed(&self, collection_id: &str) -> Result<()> {
        self.engine.register_as_completed(collection_id)
    }

    fn is_completed(&self, collection_id: &str) -> Result<bool> {
        self.engine.is_completed(collection_id)
    }

    fn get_chunks(&self, collection_id: &str) -> Result<ChunkIter<I>> {
        check_collection_id(collection_id)?;
        Ok(ChunkIter::new(Arc::clone(&self.engine), collection_id))
    }

    fn size(&self, collection_id: &str) -> Result<u64> {
        self.engine.size(collection_id)
    }

    fn size_in_bytes(&self, collection_id: &str) -> Result<u64> {
        self.engine.size_in_bytes(collection_id)
    }

    fn total_size_in_bytes(&self) -> Result<u64> {
        self.engine.total_size_in_bytes()
    }

    fn collection_ids(&self) -> Result<Vec<String>> {
        self.engine.collection_ids()
    }

    fn contains(&self, collection_id: &str) -> Result<bool> {
        self.engine.contains(collection_id)
    }

    /// Queued work is applied first so no stale delta lands on the
    /// emptied counter
    fn clear(&self) -> Result<()> {
        self.sync_pending()?;
        self.engine.clear()
    }

    fn compact(&self) -> Result<()> {
        self.engine.compact()
    }

    fn stat(&self) -> Result<StoreStat> {
        self.engine.stat()
    }

    fn flags(&self) -> StoreFlags {
        self.engine.flags()
    }

    fn set_flags(&self, flags: StoreFlags, onoff: bool) -> Result<()> {
        self.engine.set_flags(flags, onoff)
    }

    fn sync_pending(&self) -> Result<()> {
        self.with_workers(Workers::sync)
    }
}

impl<I> Drop for AsyncChunksStore<I> {
    fn drop(&mut self) {
        if let Ok(workers) = self.workers.get_mut() {
            if let Some(workers) = workers.take() {
                if let Err(err) = workers.shutdown() {
                    error!("stopping store workers failed: {}", err);
                }
            }
        }
    }
}
