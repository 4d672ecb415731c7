use std::sync::Arc;

use crate::chunk::Chunk;
use crate::error::Result;
use crate::store::engine::StoreEngine;

/// Forward-only iterator over the chunks of a collection.
///
/// Walks ordinals 0, 1, 2, … and stops at the first ordinal that was never
/// saved. Every step takes the store locks anew, so removing the collection
/// while iterating surfaces as a missing-entry error.
pub struct ChunkIter<I> {
    engine: Arc<StoreEngine<I>>,
    collection_id: String,
    next_ordinal: u32,
    done: bool,
}

impl<I> ChunkIter<I> {
    pub(crate) fn new(engine: Arc<StoreEngine<I>>, collection_id: &str) -> Self {
        ChunkIter {
            engine,
            collection_id: collection_id.to_string(),
            next_ordinal: 0,
            done: false,
        }
    }

    /// Whether the next contiguous ordinal has been saved
    pub fn has_next(&self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        self.engine.has_chunk(&self.collection_id, self.next_ordinal)
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }
}

impl<I> Iterator for ChunkIter<I> {
    type Item = Result<Chunk<I>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.engine.read_chunk(&self.collection_id, self.next_ordinal) {
            Ok(Some(chunk)) => {
                self.next_ordinal += 1;
                Some(Ok(chunk))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
