//! # fast-bloom-filter
//!
//! A bloom filter built for large, long-lived seen-before caches. Values are mapped to bit
//! positions by slicing a single wide digest, the bit array can live on the heap or in a
//! memory-mapped file, and filters persist to a compressed, self-verifying file format.
//!
//! ## Usage
//!
//! ```rust
//! use fast_bloom_filter::persist::SaveOptions;
//! use fast_bloom_filter::{Backing, Filter, FilterConfig};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("seen.blf");
//!
//! let config = FilterConfig::default()
//!     .with_bit_count(1 << 20)
//!     .with_backing(Backing::Heap);
//! let mut filter = Filter::new(config.clone()).unwrap();
//!
//! for line in &["a", "b", "a"] {
//!     if filter.update(line).unwrap() {
//!         println!("{} seen before", line);
//!     }
//! }
//!
//! filter.save(&path, &SaveOptions::default()).unwrap();
//! let (filter, report) = Filter::load(&path, config).unwrap();
//! assert!(report.is_verified());
//! assert!(filter.query("b").unwrap());
//! ```
//!
//! ## Layout
//!
//!  - [`address`]: value to bit position mapping.
//!  - [`bit_store`]: heap and memory-mapped bit arrays.
//!  - [`codec`]: ordered, fault-tolerant compression chain.
//!  - [`persist`]: file framing, backups and chunked IO.
//!  - [`sync`]: a lock-guarded handle for multi-threaded hosts.
//!
//! ## References
//!
//!  - [Bloom filter](http://en.wikipedia.org/wiki/Bloom_filter)
//!  > Bloom, Burton H. 1970. "Space/Time Trade-Offs in Hash Coding with Allowable Errors." *Commun. ACM* 13 (7): 422–26. doi:[10.1145/362686.362692](https://doi.org/10.1145/362686.362692).

#![warn(missing_docs)]

pub mod address;
pub mod bit_store;
pub mod codec;
mod config;
mod error;
mod filter;
pub mod persist;
pub mod sync;

pub use crate::address::AddressGenerator;
pub use crate::config::{
    Backing, FilterConfig, HashingMode, DEFAULT_BIT_COUNT, DEFAULT_MAPPED_THRESHOLD,
    DEFAULT_SLICE_COUNT, DEFAULT_SLICE_WIDTH,
};
pub use crate::error::{Error, Result};
pub use crate::filter::{Filter, FilterState, FilterStats};
pub use crate::sync::SharedFilter;
