use std::path::Path;

use log::{debug, warn};

use crate::bounded_map::{BoundedMap, MapOptions};
use crate::constants::{
    CHUNKS_SUFFIX, COMPLETED_SUFFIX, SIZE_IN_BYTES_SUFFIX, SIZE_SUFFIX, TOTAL_SIZE_KEY,
};
use crate::error::{Error, Result};

fn key(collection_id: &str, suffix: &str) -> String {
    format!("{}{}", collection_id, suffix)
}

/// Per-collection metadata and the store-wide byte counter
#[derive(Debug)]
pub(crate) struct ReferenceIndex {
    map: BoundedMap,
}

impl ReferenceIndex {
    /// Open the index file at `path`, creating it if missing
    pub(crate) fn open_or_create<P: AsRef<Path>>(path: P, options: MapOptions) -> Result<Self> {
        let path = path.as_ref();
        let map = if path.exists() {
            BoundedMap::open(path)?
        } else {
            debug!("creating reference index {:?}", path);
            BoundedMap::create(path, options)?
        };
        Ok(ReferenceIndex { map })
    }

    /// Ordinals saved for the collection, in the order they were recorded
    pub(crate) fn chunk_ordinals(&self, collection_id: &str) -> Result<Vec<u32>> {
        match self.map.get(key(collection_id, CHUNKS_SUFFIX).as_bytes()) {
            Some(value) => decode_ordinals(&value),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn has_chunk(&self, collection_id: &str, ordinal: u32) -> Result<bool> {
        Ok(self.chunk_ordinals(collection_id)?.contains(&ordinal))
    }

    /// Append `ordinal` to the collection's ordinal list
    pub(crate) fn record_chunk(&mut self, collection_id: &str, ordinal: u32) -> Result<()> {
        let mut ordinals = self.chunk_ordinals(collection_id)?;
        ordinals.push(ordinal);
        self.map.insert(
            key(collection_id, CHUNKS_SUFFIX).as_bytes(),
            &encode_ordinals(&ordinals),
        )
    }

    /// Record a saved chunk and its item and byte counts. Either every
    /// update lands or the collection's entries are restored.
    pub(crate) fn record_saved_chunk(
        &mut self,
        collection_id: &str,
        ordinal: u32,
        item_delta: i64,
        byte_delta: i64,
    ) -> Result<()> {
        let keys = [
            key(collection_id, CHUNKS_SUFFIX),
            key(collection_id, SIZE_SUFFIX),
            key(collection_id, SIZE_IN_BYTES_SUFFIX),
        ];
        let snapshot: Vec<Option<Vec<u8>>> =
            keys.iter().map(|key| self.map.get(key.as_bytes())).collect();

        let applied = self
            .record_chunk(collection_id, ordinal)
            .and_then(|()| self.add_to_collection_size(collection_id, item_delta, byte_delta));
        if applied.is_err() {
            for (key, old) in keys.iter().zip(snapshot) {
                let restored = match old {
                    Some(value) => self.map.insert(key.as_bytes(), &value),
                    None => {
                        self.map.remove(key.as_bytes());
                        Ok(())
                    }
                };
                if let Err(err) = restored {
                    warn!("restoring {} failed: {}", key, err);
                }
            }
        }
        applied
    }

    pub(crate) fn add_to_collection_size(
        &mut self,
        collection_id: &str,
        item_delta: i64,
        byte_delta: i64,
    ) -> Result<()> {
        self.add_to_counter(&key(collection_id, SIZE_SUFFIX), item_delta)?;
        self.add_to_counter(&key(collection_id, SIZE_IN_BYTES_SUFFIX), byte_delta)
    }

    /// The total is kept signed so deltas applied out of order cancel out
    pub(crate) fn add_to_total_size(&mut self, byte_delta: i64) -> Result<()> {
        let total = (self.counter(TOTAL_SIZE_KEY)? as i64).wrapping_add(byte_delta);
        self.map.insert(TOTAL_SIZE_KEY.as_bytes(), &total.to_be_bytes())
    }

    /// Item count of the collection
    pub(crate) fn size(&self, collection_id: &str) -> Result<u64> {
        self.counter(&key(collection_id, SIZE_SUFFIX))
    }

    pub(crate) fn size_in_bytes(&self, collection_id: &str) -> Result<u64> {
        self.counter(&key(collection_id, SIZE_IN_BYTES_SUFFIX))
    }

    pub(crate) fn total_size(&self) -> Result<u64> {
        Ok((self.counter(TOTAL_SIZE_KEY)? as i64).max(0) as u64)
    }

    pub(crate) fn contains(&self, collection_id: &str) -> bool {
        self.map
            .contains_key(key(collection_id, SIZE_IN_BYTES_SUFFIX).as_bytes())
    }

    pub(crate) fn is_complete(&self, collection_id: &str) -> bool {
        self.map
            .contains_key(key(collection_id, COMPLETED_SUFFIX).as_bytes())
    }

    /// Flag the collection as complete; only the key's presence matters
    pub(crate) fn mark_complete(&mut self, collection_id: &str) -> Result<()> {
        self.map
            .insert(key(collection_id, COMPLETED_SUFFIX).as_bytes(), &[1])
    }

    /// Collection ids, derived from the `_chunks` keys
    pub(crate) fn collection_ids(&self) -> Vec<String> {
        self.map
            .keys()
            .into_iter()
            .filter_map(|key| String::from_utf8(key).ok())
            .filter_map(|key| key.strip_suffix(CHUNKS_SUFFIX).map(str::to_string))
            .collect()
    }

    /// Drop all entries of the collection
    pub(crate) fn remove_collection(&mut self, collection_id: &str) {
        for suffix in [CHUNKS_SUFFIX, SIZE_SUFFIX, SIZE_IN_BYTES_SUFFIX, COMPLETED_SUFFIX] {
            self.map.remove(key(collection_id, suffix).as_bytes());
        }
    }

    pub(crate) fn collection_count(&self) -> usize {
        self.collection_ids().len()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.map.flush()
    }

    fn counter(&self, key: &str) -> Result<u64> {
        match self.map.get(key.as_bytes()) {
            None => Ok(0),
            Some(value) => {
                let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
                    Error::Corrupted(format!("{} holds {} bytes", key, value.len()))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
        }
    }

    fn add_to_counter(&mut self, key: &str, delta: i64) -> Result<()> {
        let value = self.counter(key)?.saturating_add_signed(delta);
        self.map.insert(key.as_bytes(), &value.to_be_bytes())
    }
}

fn encode_ordinals(ordinals: &[u32]) -> Vec<u8> {
    let mut value = Vec::with_capacity(4 + ordinals.len() * 4);
    value.extend_from_slice(&(ordinals.len() as u32).to_be_bytes());
    for ordinal in ordinals {
        value.extend_from_slice(&ordinal.to_be_bytes());
    }
    value
}

fn decode_ordinals(value: &[u8]) -> Result<Vec<u32>> {
    let corrupted = || Error::Corrupted(format!("ordinal list of {} bytes", value.len()));
    if value.len() < 4 || (value.len() - 4) % 4 != 0 {
        return Err(corrupted());
    }
    let (count, body) = value.split_at(4);
    let count = u32::from_be_bytes([count[0], count[1], count[2], count[3]]) as usize;
    if body.len() != count * 4 {
        return Err(corrupted());
    }
    Ok(body
        .chunks_exact(4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
