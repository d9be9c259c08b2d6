//! Fixed-length bit arrays backing a filter.
//!
//! Bits are packed least-significant-bit first: bit `i` lives in byte `i / 8` under the mask
//! `1 << (i % 8)`. Both stores share this layout so their raw bytes are interchangeable on disk.

mod heap;
mod mapped;

pub use self::heap::HeapBitStore;
pub use self::mapped::MappedBitStore;

use crate::config::Backing;
use crate::error::Result;
use std::fmt;

const BLOCK_BIT_COUNT: usize = 8;

#[inline]
fn locate(index: usize) -> (usize, u8) {
    (index / BLOCK_BIT_COUNT, 1 << (index % BLOCK_BIT_COUNT))
}

fn popcount(bytes: &[u8]) -> usize {
    bytes.iter().map(|byte| byte.count_ones() as usize).sum()
}

/// Which concrete store sits behind a `dyn BitStore`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    /// [`HeapBitStore`].
    Heap,
    /// [`MappedBitStore`].
    Mapped,
}

/// A mutable, fixed-length bit array.
///
/// Indices at or past [`len`](BitStore::len) are programming errors and panic.
pub trait BitStore: fmt::Debug + Send + Sync {
    /// Returns the concrete kind of the store.
    fn kind(&self) -> StoreKind;

    /// Returns the number of bits in the store.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no bits.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value of bit `index`.
    fn get(&self, index: usize) -> bool;

    /// Sets bit `index` to `bit`.
    fn set(&mut self, index: usize, bit: bool);

    /// Sets every bit to `bit`.
    fn set_all(&mut self, bit: bool);

    /// Returns the packed bytes of the store.
    fn as_bytes(&self) -> &[u8];

    /// Replaces the contents of the store with `bytes`, resizing it to `bytes.len() * 8` bits.
    ///
    /// A closed store stays closed and returns [`Error::Closed`](crate::Error::Closed).
    fn load_from_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// ORs `bytes` into the store.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is not exactly as long as [`as_bytes`](BitStore::as_bytes).
    fn union_bytes(&mut self, bytes: &[u8]);

    /// Returns the number of set bits.
    fn count_ones(&self) -> usize;

    /// Makes pending writes durable.
    fn flush(&mut self) -> Result<()>;

    /// Releases the underlying resource. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Returns `true` once [`close`](BitStore::close) has run.
    fn is_closed(&self) -> bool;
}

/// Creates a zeroed store of `bit_count` bits according to `backing`.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::bit_store::{open_store, StoreKind};
/// use fast_bloom_filter::Backing;
///
/// let store = open_store(64, &Backing::Auto { threshold_bytes: 4 }).unwrap();
/// assert_eq!(store.kind(), StoreKind::Mapped);
///
/// let store = open_store(64, &Backing::Auto { threshold_bytes: 8 }).unwrap();
/// assert_eq!(store.kind(), StoreKind::Heap);
/// assert_eq!(store.len(), 64);
/// ```
pub fn open_store(bit_count: usize, backing: &Backing) -> Result<Box<dyn BitStore>> {
    let store: Box<dyn BitStore> = match backing {
        Backing::Heap => Box::new(HeapBitStore::new(bit_count)),
        Backing::Mapped(Some(path)) => Box::new(MappedBitStore::create(path, bit_count)?),
        Backing::Mapped(None) => Box::new(MappedBitStore::scratch(bit_count)?),
        Backing::Auto { threshold_bytes } => {
            if bit_count / BLOCK_BIT_COUNT > *threshold_bytes {
                Box::new(MappedBitStore::scratch(bit_count)?)
            } else {
                Box::new(HeapBitStore::new(bit_count))
            }
        }
    };
    Ok(store)
}
