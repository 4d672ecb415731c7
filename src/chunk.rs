/// An ordered batch of items within a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<I> {
    /// Zero-based position of the chunk in its collection
    pub ordinal: u32,
    /// Items in insertion order
    pub items: Vec<I>,
}

impl<I> Chunk<I> {
    pub fn new(ordinal: u32, items: Vec<I>) -> Self {
        Chunk { ordinal, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
