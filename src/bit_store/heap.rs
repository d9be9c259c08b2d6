use super::{locate, popcount, BitStore, StoreKind, BLOCK_BIT_COUNT};
use crate::error::{Error, Result};

/// A bit array held in process memory, implemented using a `Vec<u8>`.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::bit_store::{BitStore, HeapBitStore};
///
/// let mut store = HeapBitStore::new(16);
///
/// store.set(0, true);
/// store.set(9, true);
/// assert!(store.get(9));
/// assert_eq!(store.as_bytes(), &[0b0000_0001, 0b0000_0010]);
///
/// let mut other = HeapBitStore::new(16);
/// other.set(1, true);
/// store.union_bytes(other.as_bytes());
/// assert_eq!(store.count_ones(), 3);
///
/// store.set_all(false);
/// assert_eq!(store.count_ones(), 0);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct HeapBitStore {
    blocks: Vec<u8>,
    len: usize,
    one_count: usize,
    closed: bool,
}

impl HeapBitStore {
    fn get_block_count(len: usize) -> usize {
        (len + BLOCK_BIT_COUNT - 1) / BLOCK_BIT_COUNT
    }

    /// Constructs a new `HeapBitStore` with `len` bits, all initialized to false.
    pub fn new(len: usize) -> Self {
        HeapBitStore {
            blocks: vec![0; Self::get_block_count(len)],
            len,
            one_count: 0,
            closed: false,
        }
    }

    /// Constructs a `HeapBitStore` that takes ownership of packed `bytes`.
    ///
    /// # Examples
    ///
    /// ```
    /// use fast_bloom_filter::bit_store::{BitStore, HeapBitStore};
    ///
    /// let store = HeapBitStore::from_bytes(vec![0b0000_0101]);
    /// assert!(store.get(0));
    /// assert!(!store.get(1));
    /// assert!(store.get(2));
    /// assert_eq!(store.len(), 8);
    /// ```
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        HeapBitStore {
            len: bytes.len() * BLOCK_BIT_COUNT,
            one_count: popcount(&bytes),
            blocks: bytes,
            closed: false,
        }
    }

    /// Returns the number of unset bits.
    pub fn count_zeros(&self) -> usize {
        self.len - self.one_count
    }
}

impl BitStore for HeapBitStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Heap
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let (block_index, mask) = locate(index);
        self.blocks[block_index] & mask != 0
    }

    fn set(&mut self, index: usize, bit: bool) {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let (block_index, mask) = locate(index);
        let prev = self.blocks[block_index] & mask != 0;
        if bit {
            if !prev {
                self.one_count += 1;
            }
            self.blocks[block_index] |= mask;
        } else {
            if prev {
                self.one_count -= 1;
            }
            self.blocks[block_index] &= !mask;
        }
    }

    fn set_all(&mut self, bit: bool) {
        let mask;
        if bit {
            mask = !0;
            self.one_count = self.len;
        } else {
            mask = 0;
            self.one_count = 0;
        }
        for block in &mut self.blocks {
            *block = mask;
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.blocks
    }

    fn load_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.blocks.clear();
        self.blocks.extend_from_slice(bytes);
        self.len = bytes.len() * BLOCK_BIT_COUNT;
        self.one_count = popcount(bytes);
        Ok(())
    }

    fn union_bytes(&mut self, bytes: &[u8]) {
        assert_eq!(self.blocks.len(), bytes.len());
        for (x, y) in self.blocks.iter_mut().zip(bytes) {
            *x |= *y;
        }
        self.one_count = popcount(&self.blocks);
    }

    fn count_ones(&self) -> usize {
        self.one_count
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.blocks = Vec::new();
            self.len = 0;
            self.one_count = 0;
            self.closed = true;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
