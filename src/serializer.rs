use std::io::{Cursor, Read};

use crate::error::Result;

/// Turns items into bytes and back.
///
/// Serializers don't need to delimit their output: the store records how
/// many bytes each item took and hands `deserialize` exactly those bytes.
pub trait ItemSerializer<I>: Send + Sync {
    /// Append the serialized form of `item` to `sink`
    fn serialize(&self, item: &I, sink: &mut Vec<u8>) -> Result<()>;

    /// Read one item from `source`
    fn deserialize(&self, source: &mut Cursor<&[u8]>) -> Result<I>;
}

/// Stores raw byte items as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesSerializer;

impl ItemSerializer<Vec<u8>> for RawBytesSerializer {
    fn serialize(&self, item: &Vec<u8>, sink: &mut Vec<u8>) -> Result<()> {
        sink.extend_from_slice(item);
        Ok(())
    }

    fn deserialize(&self, source: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
        let mut item = Vec::new();
        source.read_to_end(&mut item)?;
        Ok(item)
    }
}
