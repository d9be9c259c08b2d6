//! A filter that can be shared between threads.

use crate::error::Result;
use crate::filter::{Filter, FilterStats};
use crate::persist::{LoadOptions, LoadReport, SaveOptions, SaveReport};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// A cloneable handle to a [`Filter`] guarded by a read-write lock.
///
/// Queries take the read lock and run in parallel. Inserts, merges and persistence take the
/// write lock, so they are serialized with each other and with queries.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::{Backing, Filter, FilterConfig, SharedFilter};
/// use std::thread;
///
/// let config = FilterConfig::default()
///     .with_bit_count(1 << 16)
///     .with_backing(Backing::Heap);
/// let shared = SharedFilter::new(Filter::new(config).unwrap());
///
/// let handles: Vec<_> = (0..4)
///     .map(|i| {
///         let shared = shared.clone();
///         thread::spawn(move || shared.update(i.to_string()).unwrap())
///     })
///     .collect();
/// for handle in handles {
///     assert!(!handle.join().unwrap());
/// }
/// assert!(shared.query("3").unwrap());
/// ```
#[derive(Clone, Debug)]
pub struct SharedFilter {
    inner: Arc<RwLock<Filter>>,
}

impl SharedFilter {
    /// Wraps `filter` in a shared handle.
    pub fn new(filter: Filter) -> Self {
        SharedFilter {
            inner: Arc::new(RwLock::new(filter)),
        }
    }

    /// Inserts a value into the filter.
    pub fn add<V: AsRef<[u8]>>(&self, value: V) -> Result<()> {
        self.inner.write().add(value)
    }

    /// Checks if a value is possibly in the filter.
    pub fn query<V: AsRef<[u8]>>(&self, value: V) -> Result<bool> {
        self.inner.read().query(value)
    }

    /// Inserts a value and returns whether it was possibly present beforehand.
    pub fn update<V: AsRef<[u8]>>(&self, value: V) -> Result<bool> {
        self.inner.write().update(value)
    }

    /// ORs the bit array of `other` into this filter.
    pub fn merge(&self, other: &Filter) -> Result<()> {
        self.inner.write().merge(other)
    }

    /// Writes the filter to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P, options: &SaveOptions) -> Result<SaveReport> {
        self.inner.write().save(path, options)
    }

    /// Replaces the bit array with the one stored at `path`.
    pub fn reload<P: AsRef<Path>>(&self, path: P, options: &LoadOptions) -> Result<LoadReport> {
        self.inner.write().reload(path, options)
    }

    /// Returns the advisory counters of the filter.
    pub fn stat(&self) -> FilterStats {
        self.inner.read().stat()
    }

    /// Runs `op` with shared access to the filter.
    pub fn with<T, F: FnOnce(&Filter) -> T>(&self, op: F) -> T {
        op(&self.inner.read())
    }

    /// Runs `op` with exclusive access to the filter.
    pub fn with_mut<T, F: FnOnce(&mut Filter) -> T>(&self, op: F) -> T {
        op(&mut self.inner.write())
    }
}
