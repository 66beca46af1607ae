use std::collections::BTreeSet;

/// A reclaimed byte range inside a hash file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FreeBlock {
    // Field order gives the size-first ordering the pool relies on.
    pub size: u64,
    pub offset: u64,
}

const ENTRY_SIZE: usize = 12;

/// Size-ordered registry of free blocks with a fixed capacity.
///
/// When the pool is full the smallest block is dropped to make room for a larger one; the
/// dropped range stays unused until the next rebuild.
#[derive(Debug)]
pub(crate) struct FreeBlockPool {
    capacity: usize,
    blocks: BTreeSet<FreeBlock>,
}

impl FreeBlockPool {
    pub(crate) fn new(capacity: usize) -> FreeBlockPool {
        FreeBlockPool {
            capacity,
            blocks: BTreeSet::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes needed to persist a pool of `capacity` entries.
    pub(crate) fn section_size(capacity: usize) -> u64 {
        (4 + capacity * ENTRY_SIZE) as u64
    }

    pub(crate) fn insert(&mut self, offset: u64, size: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.blocks.len() >= self.capacity {
            match self.blocks.first() {
                Some(smallest) if smallest.size < size => {
                    let smallest = *smallest;
                    self.blocks.remove(&smallest);
                }
                _ => return,
            }
        }
        self.blocks.insert(FreeBlock { size, offset });
    }

    /// Takes the smallest block of at least `min_size` bytes.
    pub(crate) fn fetch(&mut self, min_size: u64) -> Option<FreeBlock> {
        let found = *self.blocks.range(FreeBlock { size: min_size, offset: 0 }..).next()?;
        self.blocks.remove(&found);
        Some(found)
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.blocks.len() * ENTRY_SIZE);
        buf.extend_from_slice(&(self.blocks.len() as u32).to_be_bytes());
        for block in &self.blocks {
            buf.extend_from_slice(&block.offset.to_be_bytes());
            buf.extend_from_slice(&(block.size as u32).to_be_bytes());
        }
        buf
    }

    /// Restores entries written by [`FreeBlockPool::serialize`]; malformed input yields an
    /// empty pool.
    pub(crate) fn deserialize(&mut self, data: &[u8]) {
        self.blocks.clear();
        if data.len() < 4 {
            return;
        }
        let count = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        for entry in data[4..].chunks_exact(ENTRY_SIZE).take(count) {
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&entry[..8]);
            let mut size = [0u8; 4];
            size.copy_from_slice(&entry[8..]);
            self.insert(u64::from_be_bytes(offset), u32::from_be_bytes(size) as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit() {
        let mut pool = FreeBlockPool::new(10);
        pool.insert(100, 64);
        pool.insert(200, 16);
        pool.insert(300, 32);
        assert_eq!(Some(FreeBlock { size: 32, offset: 300 }), pool.fetch(20));
        assert_eq!(None, pool.fetch(65));
        assert_eq!(Some(FreeBlock { size: 64, offset: 100 }), pool.fetch(64));
        assert_eq!(1, pool.len());
    }

    #[test]
    fn full_pool_drops_smallest() {
        let mut pool = FreeBlockPool::new(2);
        pool.insert(0, 8);
        pool.insert(8, 16);
        pool.insert(24, 4);
        assert_eq!(2, pool.len());
        pool.insert(32, 24);
        assert_eq!(None, pool.fetch(1).filter(|block| block.size == 8));
        assert_eq!(Some(FreeBlock { size: 24, offset: 32 }), pool.fetch(17));
    }

    #[test]
    fn persists() {
        let mut pool = FreeBlockPool::new(4);
        pool.insert(1024, 48);
        pool.insert(2048, 16);
        let data = pool.serialize();
        assert!(data.len() as u64 <= FreeBlockPool::section_size(4));
        let mut restored = FreeBlockPool::new(4);
        restored.deserialize(&data);
        assert_eq!(Some(FreeBlock { size: 16, offset: 2048 }), restored.fetch(1));
        assert_eq!(Some(FreeBlock { size: 48, offset: 1024 }), restored.fetch(1));
    }
}
