//! Chunk <-> content-map entries.
//!
//! Every item is written as `numPartials (u32 BE) ‖ serialized item`, cut
//! into `avg_item_size` slices when it doesn't fit a single entry:
//!
//! ```text
//! {id}_chunk{n}_numItems        -> item count (u32 BE)
//! {id}_chunk{n}_item{i}_{p}     -> slice p of item i
//! ```

use std::io::Cursor;
use std::sync::Arc;

use log::warn;

use crate::bounded_map::BoundedMap;
use crate::chunk::Chunk;
use crate::constants::PARTIAL_PREFIX_SIZE;
use crate::error::{Error, Result};
use crate::serializer::ItemSerializer;

pub(crate) fn num_items_key(collection_id: &str, ordinal: u32) -> String {
    format!("{}_chunk{}_numItems", collection_id, ordinal)
}

pub(crate) fn item_key(collection_id: &str, ordinal: u32, item: usize, partial: usize) -> String {
    format!("{}_chunk{}_item{}_{}", collection_id, ordinal, item, partial)
}

/// A chunk serialized in memory, ready to be written to one content map
#[derive(Debug)]
pub(crate) struct EncodedChunk {
    pub(crate) ordinal: u32,
    /// Prefixed payload of every item
    pub(crate) items: Vec<Vec<u8>>,
    /// Sum of the partial counts of all items
    pub(crate) num_entries: usize,
    /// Serialized item bytes, prefixes excluded
    pub(crate) size_in_bytes: u64,
}

impl EncodedChunk {
    pub(crate) fn num_items(&self) -> usize {
        self.items.len()
    }
}

/// Splits items into partials on write and reassembles them on read
pub(crate) struct ChunkCodec<I> {
    serializer: Arc<dyn ItemSerializer<I>>,
    avg_item_size: usize,
}

impl<I> ChunkCodec<I> {
    pub(crate) fn new(serializer: Arc<dyn ItemSerializer<I>>, avg_item_size: usize) -> Self {
        ChunkCodec {
            serializer,
            avg_item_size,
        }
    }

    /// Number of entries needed to hold `len` serialized bytes plus the prefix
    pub(crate) fn partials_for(&self, len: usize) -> usize {
        (PARTIAL_PREFIX_SIZE + len + self.avg_item_size - 1) / self.avg_item_size
    }

    /// Serialize every item of the chunk up front
    pub(crate) fn encode(&self, chunk: &Chunk<I>) -> Result<EncodedChunk> {
        let mut items = Vec::with_capacity(chunk.items.len());
        let mut num_entries = 0;
        let mut size_in_bytes = 0u64;

        for item in &chunk.items {
            let mut payload = vec![0u8; PARTIAL_PREFIX_SIZE];
            self.serializer.serialize(item, &mut payload)?;
            let len = payload.len() - PARTIAL_PREFIX_SIZE;
            let partials = self.partials_for(len);
            let prefix = u32::try_from(partials)
                .map_err(|_| Error::InvalidArgument(format!("item of {} bytes is too large", len)))?;
            payload[..PARTIAL_PREFIX_SIZE].copy_from_slice(&prefix.to_be_bytes());

            num_entries += partials;
            size_in_bytes += len as u64;
            items.push(payload);
        }

        Ok(EncodedChunk {
            ordinal: chunk.ordinal,
            items,
            num_entries,
            size_in_bytes,
        })
    }

    /// `key ‖ value` byte size of every entry `write` adds, item count first
    pub(crate) fn entry_sizes(&self, collection_id: &str, chunk: &EncodedChunk) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(chunk.num_entries + 1);
        sizes.push(num_items_key(collection_id, chunk.ordinal).len() + 4);
        for (index, payload) in chunk.items.iter().enumerate() {
            for (partial, slice) in payload.chunks(self.avg_item_size).enumerate() {
                sizes.push(item_key(collection_id, chunk.ordinal, index, partial).len() + slice.len());
            }
        }
        sizes
    }

    /// Write the item count, then every item partial. On failure the
    /// entries written so far are removed again.
    pub(crate) fn write(
        &self,
        map: &mut BoundedMap,
        collection_id: &str,
        chunk: &EncodedChunk,
    ) -> Result<()> {
        let written = self.write_entries(map, collection_id, chunk);
        if written.is_err() {
            self.discard(map, collection_id, chunk);
        }
        written
    }

    /// Remove every entry `write` would have added for the chunk
    pub(crate) fn discard(&self, map: &mut BoundedMap, collection_id: &str, chunk: &EncodedChunk) {
        map.remove(num_items_key(collection_id, chunk.ordinal).as_bytes());
        for (index, payload) in chunk.items.iter().enumerate() {
            for partial in 0..payload.len().div_ceil(self.avg_item_size) {
                map.remove(item_key(collection_id, chunk.ordinal, index, partial).as_bytes());
            }
        }
    }

    fn write_entries(
        &self,
        map: &mut BoundedMap,
        collection_id: &str,
        chunk: &EncodedChunk,
    ) -> Result<()> {
        let count = chunk.num_items() as u32;
        map.insert(
            num_items_key(collection_id, chunk.ordinal).as_bytes(),
            &count.to_be_bytes(),
        )?;

        for (index, payload) in chunk.items.iter().enumerate() {
            for (partial, slice) in payload.chunks(self.avg_item_size).enumerate() {
                let key = item_key(collection_id, chunk.ordinal, index, partial);
                map.insert(key.as_bytes(), slice)?;
            }
        }
        Ok(())
    }

    /// Whether `map` holds the given chunk
    pub(crate) fn holds_chunk(&self, map: &BoundedMap, collection_id: &str, ordinal: u32) -> bool {
        map.contains_key(num_items_key(collection_id, ordinal).as_bytes())
    }

    pub(crate) fn read(
        &self,
        map: &BoundedMap,
        collection_id: &str,
        ordinal: u32,
    ) -> Result<Chunk<I>> {
        let count = read_item_count(map, collection_id, ordinal)?;
        let mut items = Vec::with_capacity(count);
        for index in 0..count {
            items.push(self.read_item(map, collection_id, ordinal, index)?);
        }
        Ok(Chunk::new(ordinal, items))
    }

    fn read_item(
        &self,
        map: &BoundedMap,
        collection_id: &str,
        ordinal: u32,
        index: usize,
    ) -> Result<I> {
        let first = read_entry(map, &item_key(collection_id, ordinal, index, 0))?;
        let partials = decode_prefix(&first)?;

        let limit = self.avg_item_size * partials;
        let mut payload = Vec::with_capacity(limit);
        payload.extend_from_slice(&first);
        for partial in 1..partials {
            let slice = read_entry(map, &item_key(collection_id, ordinal, index, partial))?;
            payload.extend_from_slice(&slice);
        }
        if payload.len() > limit {
            return Err(Error::Corrupted(format!(
                "item {} of {}_chunk{} spans {} bytes, more than {} partials allow",
                index,
                collection_id,
                ordinal,
                payload.len(),
                partials
            )));
        }

        let mut source = Cursor::new(&payload[PARTIAL_PREFIX_SIZE..]);
        self.serializer.deserialize(&mut source)
    }

    /// Delete every entry of the chunk, returning how many were removed
    pub(crate) fn remove(
        &self,
        map: &mut BoundedMap,
        collection_id: &str,
        ordinal: u32,
    ) -> Result<usize> {
        let count = read_item_count(map, collection_id, ordinal)?;
        let mut removed = 0;
        for index in 0..count {
            let first_key = item_key(collection_id, ordinal, index, 0);
            let partials = match map.get(first_key.as_bytes()) {
                Some(first) => decode_prefix(&first)?,
                None => {
                    warn!("{} already gone while removing chunk", first_key);
                    continue;
                }
            };
            for partial in 0..partials {
                if map.remove(item_key(collection_id, ordinal, index, partial).as_bytes()) {
                    removed += 1;
                }
            }
        }
        if map.remove(num_items_key(collection_id, ordinal).as_bytes()) {
            removed += 1;
        }
        Ok(removed)
    }
}

fn read_entry(map: &BoundedMap, key: &str) -> Result<Vec<u8>> {
    map.get(key.as_bytes())
        .ok_or_else(|| Error::MissingEntry(key.to_string()))
}

fn read_item_count(map: &BoundedMap, collection_id: &str, ordinal: u32) -> Result<usize> {
    let key = num_items_key(collection_id, ordinal);
    let value = read_entry(map, &key)?;
    let bytes: [u8; 4] = value
        .as_slice()
        .try_into()
        .map_err(|_| Error::Corrupted(format!("{} holds {} bytes", key, value.len())))?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

fn decode_prefix(entry: &[u8]) -> Result<usize> {
    if entry.len() < PARTIAL_PREFIX_SIZE {
        return Err(Error::Corrupted(format!(
            "first partial holds {} bytes, shorter than its prefix",
            entry.len()
        )));
    }
    let mut prefix = [0u8; PARTIAL_PREFIX_SIZE];
    prefix.copy_from_slice(&entry[..PARTIAL_PREFIX_SIZE]);
    match u32::from_be_bytes(prefix) {
        0 => Err(Error::Corrupted("partial count of zero".into())),
        partials => Ok(partials as usize),
    }
}
