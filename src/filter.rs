use crate::address::AddressGenerator;
use crate::bit_store::{open_store, BitStore, StoreKind};
use crate::config::FilterConfig;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// What a filter is doing at the moment.
///
/// Mutating calls made while the filter is not [`Idle`](FilterState::Idle) fail with
/// [`Error::Busy`] and leave the bit array untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    /// No operation in flight.
    Idle,
    /// The bit array is being written to disk.
    Saving,
    /// The bit array is being replaced from disk.
    Loading,
    /// Another filter is being ORed in.
    Merging,
}

/// A space-efficient probabilistic data structure to test for membership in a set.
///
/// Each value is mapped to `slice_count` bits (or a single bit in fast mode) by an
/// [`AddressGenerator`]. A value is definitely absent if any of its bits is unset and possibly
/// present if all of them are set. [`update`](Filter::update) combines a query with an insert,
/// which makes the filter usable as a seen-before cache.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::{Backing, Filter, FilterConfig};
///
/// let config = FilterConfig::default()
///     .with_bit_count(1 << 20)
///     .with_slice_count(17)
///     .with_backing(Backing::Heap);
/// let mut filter = Filter::new(config).unwrap();
///
/// filter.add("30000").unwrap();
/// filter.add("1230213").unwrap();
/// filter.add("1").unwrap();
///
/// assert!(filter.query("1").unwrap());
/// assert!(filter.query("1230213").unwrap());
/// assert!(!filter.query("12").unwrap());
///
/// assert!(!filter.update("2").unwrap());
/// assert!(filter.update("2").unwrap());
/// ```
pub struct Filter {
    config: FilterConfig,
    generator: AddressGenerator,
    store: Box<dyn BitStore>,
    state: FilterState,
    bits_set: u64,
    hit_count: AtomicU64,
    query_count: AtomicU64,
}

impl Filter {
    /// Constructs a new, empty `Filter` from `config`.
    pub fn new(config: FilterConfig) -> Result<Self> {
        let generator = AddressGenerator::new(&config)?;
        let store = open_store(config.bit_count, &config.backing)?;
        Ok(Self::from_parts(config, generator, store))
    }

    pub(crate) fn from_parts(
        config: FilterConfig,
        generator: AddressGenerator,
        store: Box<dyn BitStore>,
    ) -> Self {
        let bits_set = store.count_ones() as u64;
        Filter {
            config,
            generator,
            store,
            state: FilterState::Idle,
            bits_set,
            hit_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.store.is_closed() {
            return Err(Error::Closed);
        }
        if self.state != FilterState::Idle {
            return Err(Error::Busy(self.state));
        }
        Ok(())
    }

    /// Runs `op` with the filter marked as `state`, returning to idle on every exit path.
    pub(crate) fn with_state<T, F>(&mut self, state: FilterState, op: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.ensure_ready()?;
        self.state = state;
        let result = op(self);
        self.state = FilterState::Idle;
        result
    }

    pub(crate) fn store(&self) -> &dyn BitStore {
        self.store.as_ref()
    }

    /// Replaces the bit array with `bytes`, adopting `config` for addressing.
    pub(crate) fn replace_bits(&mut self, config: FilterConfig, bytes: &[u8]) -> Result<()> {
        let generator = AddressGenerator::new(&config)?;
        self.store.load_from_bytes(bytes)?;
        self.config = config;
        self.generator = generator;
        self.reset_counters();
        Ok(())
    }

    fn reset_counters(&mut self) {
        self.bits_set = self.store.count_ones() as u64;
        self.hit_count.store(0, Ordering::Relaxed);
        self.query_count.store(0, Ordering::Relaxed);
    }

    fn insert_addresses(&mut self, addresses: &[usize]) {
        for &address in addresses {
            self.store.set(address, true);
        }
        self.bits_set += addresses.len() as u64;
    }

    fn query_addresses(&self, addresses: &[usize]) -> bool {
        let found = addresses.iter().all(|&address| self.store.get(address));
        if found {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        self.query_count.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Inserts a value into the filter.
    pub fn add<V: AsRef<[u8]>>(&mut self, value: V) -> Result<()> {
        self.ensure_ready()?;
        let addresses = self.generator.addresses(value.as_ref())?;
        self.insert_addresses(&addresses);
        Ok(())
    }

    /// Checks if a value is possibly in the filter. A `false` result is exact.
    pub fn query<V: AsRef<[u8]>>(&self, value: V) -> Result<bool> {
        if self.store.is_closed() {
            return Err(Error::Closed);
        }
        let addresses = self.generator.addresses(value.as_ref())?;
        Ok(self.query_addresses(&addresses))
    }

    /// Inserts a value and returns whether it was possibly present beforehand.
    ///
    /// Addresses are computed once and shared by the query and the insert.
    ///
    /// # Examples
    ///
    /// ```
    /// use fast_bloom_filter::{Backing, Filter, FilterConfig};
    ///
    /// let config = FilterConfig::default()
    ///     .with_bit_count(1 << 16)
    ///     .with_backing(Backing::Heap);
    /// let mut filter = Filter::new(config).unwrap();
    ///
    /// assert!(!filter.update("1").unwrap());
    /// assert!(filter.update("1").unwrap());
    /// ```
    pub fn update<V: AsRef<[u8]>>(&mut self, value: V) -> Result<bool> {
        self.ensure_ready()?;
        let addresses = self.generator.addresses(value.as_ref())?;
        let seen = self.query_addresses(&addresses);
        if !seen {
            self.insert_addresses(&addresses);
        }
        Ok(seen)
    }

    /// ORs the bit array of `other` into this filter.
    ///
    /// Both filters must have bit arrays of the same byte length. A non-conformable merge returns
    /// [`Error::NonConformableMerge`] and changes nothing.
    ///
    /// # Examples
    ///
    /// ```
    /// use fast_bloom_filter::{Backing, Filter, FilterConfig};
    ///
    /// let config = FilterConfig::default()
    ///     .with_bit_count(1 << 16)
    ///     .with_backing(Backing::Heap);
    /// let mut a = Filter::new(config.clone()).unwrap();
    /// let mut b = Filter::new(config.clone()).unwrap();
    /// a.add("foo").unwrap();
    /// b.add("bar").unwrap();
    ///
    /// a.merge(&b).unwrap();
    /// assert!(a.query("foo").unwrap());
    /// assert!(a.query("bar").unwrap());
    ///
    /// let small = Filter::new(config.with_bit_count(1 << 8)).unwrap();
    /// assert!(a.merge(&small).is_err());
    /// ```
    pub fn merge(&mut self, other: &Filter) -> Result<()> {
        if other.store.is_closed() {
            return Err(Error::Closed);
        }
        self.with_state(FilterState::Merging, |filter| {
            let left = filter.store.as_bytes().len();
            let right = other.store.as_bytes().len();
            if left != right {
                warn!(left, right, "filters are not conformable");
                return Err(Error::NonConformableMerge { left, right });
            }
            filter.store.union_bytes(other.store.as_bytes());
            filter.bits_set += other.bits_set;
            debug!(bytes = left, "merged filter");
            Ok(())
        })
    }

    /// Clears the filter, removing all values.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.store.set_all(false);
        self.reset_counters();
        Ok(())
    }

    /// Makes pending writes to a mapped bit array durable. A no-op on the heap.
    pub fn flush(&mut self) -> Result<()> {
        if self.store.is_closed() {
            return Err(Error::Closed);
        }
        self.store.flush()
    }

    /// Flushes and releases the bit array. Further calls fail with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.state != FilterState::Idle {
            return Err(Error::Busy(self.state));
        }
        self.store.close()
    }

    /// Returns the number of bits in the filter.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if the filter has no bits, which only happens once it is closed.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Returns the configuration of the filter.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Returns the operation currently in flight.
    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Returns whether the bits live on the heap or in a mapped file.
    pub fn store_kind(&self) -> StoreKind {
        self.store.kind()
    }

    /// Returns the packed bit array.
    pub fn as_bytes(&self) -> &[u8] {
        self.store.as_bytes()
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.store.count_ones()
    }

    /// Returns the estimated false positive probability of the filter. This value will increase
    /// as more values are added.
    pub fn estimated_fpp(&self) -> f64 {
        if self.store.is_empty() {
            return 1.0;
        }
        let single_fpp = self.store.count_ones() as f64 / self.store.len() as f64;
        single_fpp.powi(self.generator.address_count() as i32)
    }

    /// Returns the advisory counters of the filter.
    pub fn stat(&self) -> FilterStats {
        FilterStats {
            bit_count: self.store.len() as u64,
            bits_set_estimate: self.bits_set,
            hit_count: self.hit_count.load(Ordering::Relaxed),
            query_count: self.query_count.load(Ordering::Relaxed),
        }
    }

    /// Returns the Shannon entropy of the bit array bytes, in bits per byte.
    pub fn entropy(&self) -> f64 {
        shannon_entropy(self.store.as_bytes())
    }

    /// Returns the BLAKE3 digest of the bit array bytes.
    pub fn fingerprint(&self) -> [u8; 32] {
        fingerprint(self.store.as_bytes())
    }

    /// Returns the fingerprint as lowercase hex.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    /// Returns the first four fingerprint bytes as hex, the part stored in file headers.
    pub fn short_id(&self) -> String {
        hex::encode(&self.fingerprint()[..4])
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("store", &self.store.kind())
            .field("stats", &self.stat())
            .finish()
    }
}

impl<'a> AddAssign<&'a Filter> for Filter {
    /// Merges `other` into `self`, ignoring non-conformable or busy filters.
    fn add_assign(&mut self, other: &'a Filter) {
        if let Err(err) = self.merge(other) {
            debug!(error = %err, "merge skipped");
        }
    }
}

pub(crate) fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &byte in bytes {
        counts[byte as usize] += 1;
    }
    let len = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Advisory counters reported by [`Filter::stat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterStats {
    /// Number of bits in the filter.
    pub bit_count: u64,
    /// Bits written by inserts, counting repeats.
    pub bits_set_estimate: u64,
    /// Queries that answered "possibly present".
    pub hit_count: u64,
    /// Total queries, including those made by `update`.
    pub query_count: u64,
}

impl FilterStats {
    /// Fraction of the bit array written so far, according to the estimate.
    pub fn fill_ratio(&self) -> f64 {
        if self.bit_count == 0 {
            0.0
        } else {
            self.bits_set_estimate as f64 / self.bit_count as f64
        }
    }

    /// Fraction of queries that hit.
    pub fn hit_ratio(&self) -> f64 {
        if self.query_count == 0 {
            0.0
        } else {
            self.hit_count as f64 / self.query_count as f64
        }
    }

    /// Megabytes of the bit array not yet written, according to the estimate.
    pub fn free_megabytes(&self) -> f64 {
        let free_bits = self.bit_count.saturating_sub(self.bits_set_estimate);
        free_bits as f64 / 8.0 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for FilterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bits set: {} of {} ({:.8}%), hits {} over queries {} ({:.8}%), free: {:.0} MiB",
            self.bits_set_estimate,
            self.bit_count,
            self.fill_ratio() * 100.0,
            self.hit_count,
            self.query_count,
            self.hit_ratio() * 100.0,
            self.free_megabytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{shannon_entropy, Filter, FilterState};
    use crate::bit_store::StoreKind;
    use crate::config::{Backing, FilterConfig, HashingMode};
    use crate::error::Error;
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;

    fn heap_config(bit_count: usize) -> FilterConfig {
        FilterConfig::default()
            .with_bit_count(bit_count)
            .with_slice_count(17)
            .with_backing(Backing::Heap)
    }

    fn random_values(seed: u64, count: usize) -> Vec<Vec<u8>> {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let len = rng.gen_range(1, 32);
                (0..len).map(|_| rng.gen::<u8>()).collect()
            })
            .collect()
    }

    #[test]
    fn test_basic_insert_query() {
        let mut filter = Filter::new(heap_config(1 << 24)).unwrap();
        filter.add("30000").unwrap();
        filter.add("1230213").unwrap();
        filter.add("1").unwrap();

        assert!(filter.query("1").unwrap());
        assert!(filter.query("1230213").unwrap());
        assert!(!filter.query("12").unwrap());

        let stats = filter.stat();
        assert_eq!(stats.bits_set_estimate, 51);
        assert_eq!(stats.query_count, 3);
        assert_eq!(stats.hit_count, 2);
    }

    #[test]
    fn test_dedup_cache() {
        let mut filter = Filter::new(heap_config(1 << 20)).unwrap();
        assert!(!filter.update("1").unwrap());
        assert!(filter.update("1").unwrap());
        assert!(!filter.update("2").unwrap());
        assert!(filter.update("2").unwrap());
        assert!(filter.query("1").unwrap());
    }

    #[test]
    fn test_no_false_negatives() {
        let values = random_values(7, 2000);
        for &fast_mode in &[false, true] {
            let config = heap_config(1 << 14).with_fast_mode(fast_mode);
            let mut filter = Filter::new(config).unwrap();
            for value in &values {
                filter.add(value).unwrap();
            }
            assert!(values.iter().all(|value| filter.query(value).unwrap()));
        }
    }

    #[test]
    fn test_add_idempotent() {
        let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
        filter.add("foo").unwrap();
        let once = filter.as_bytes().to_vec();
        filter.add("foo").unwrap();
        assert_eq!(filter.as_bytes(), &once[..]);
        assert_eq!(filter.count_ones(), once.iter().map(|b| b.count_ones() as usize).sum::<usize>());
    }

    #[test]
    fn test_update_matches_query() {
        let values = random_values(11, 500);
        let mut filter = Filter::new(heap_config(1 << 22)).unwrap();
        for value in &values {
            let before = filter.query(value).unwrap();
            assert_eq!(filter.update(value).unwrap(), before);
            assert!(filter.query(value).unwrap());
        }
    }

    #[test]
    fn test_fast_mode_sets_one_bit() {
        let config = heap_config(1000).with_fast_mode(true);
        let mut filter = Filter::new(config).unwrap();
        filter.add("foo").unwrap();
        assert_eq!(filter.count_ones(), 1);
        assert_eq!(filter.stat().bits_set_estimate, 1);
        assert!(filter.query("foo").unwrap());
    }

    #[test]
    fn test_merge_laws() {
        let values = random_values(3, 300);
        let build = |range: std::ops::Range<usize>| {
            let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
            for value in &values[range] {
                filter.add(value).unwrap();
            }
            filter
        };

        let mut ab = build(0..100);
        ab.merge(&build(100..200)).unwrap();
        let mut ba = build(100..200);
        ba.merge(&build(0..100)).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());

        let mut ab_c = build(0..100);
        ab_c.merge(&build(100..200)).unwrap();
        ab_c.merge(&build(200..300)).unwrap();
        let mut bc = build(100..200);
        bc.merge(&build(200..300)).unwrap();
        let mut a_bc = build(0..100);
        a_bc.merge(&bc).unwrap();
        assert_eq!(ab_c.as_bytes(), a_bc.as_bytes());
        assert!(values.iter().all(|value| a_bc.query(value).unwrap()));

        let mut aa = build(0..100);
        aa.merge(&build(0..100)).unwrap();
        assert_eq!(aa.as_bytes(), build(0..100).as_bytes());
    }

    #[test]
    fn test_merge_non_conformable() {
        let mut a = Filter::new(heap_config(1 << 12)).unwrap();
        let mut b = Filter::new(heap_config(1 << 13)).unwrap();
        a.add("foo").unwrap();
        b.add("bar").unwrap();
        let a_bytes = a.as_bytes().to_vec();
        let b_bytes = b.as_bytes().to_vec();

        assert!(matches!(
            a.merge(&b),
            Err(Error::NonConformableMerge {
                left: 512,
                right: 1024,
            })
        ));
        assert_eq!(a.as_bytes(), &a_bytes[..]);
        assert_eq!(b.as_bytes(), &b_bytes[..]);
        assert_eq!(a.state(), FilterState::Idle);

        a += &b;
        assert_eq!(a.as_bytes(), &a_bytes[..]);
    }

    #[test]
    fn test_add_assign_merges() {
        let mut a = Filter::new(heap_config(1 << 12)).unwrap();
        let mut b = Filter::new(heap_config(1 << 12)).unwrap();
        b.add("bar").unwrap();
        a += &b;
        assert!(a.query("bar").unwrap());
    }

    #[test]
    fn test_busy() {
        let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
        let other = Filter::new(heap_config(1 << 12)).unwrap();
        for &state in &[FilterState::Saving, FilterState::Loading, FilterState::Merging] {
            filter.state = state;
            assert!(matches!(filter.add("foo"), Err(Error::Busy(s)) if s == state));
            assert!(matches!(filter.update("foo"), Err(Error::Busy(_))));
            assert!(matches!(filter.merge(&other), Err(Error::Busy(_))));
            assert!(matches!(filter.clear(), Err(Error::Busy(_))));
            assert!(!filter.query("foo").unwrap());
        }
        filter.state = FilterState::Idle;
        assert_eq!(filter.count_ones(), 0);
    }

    #[test]
    fn test_with_state_resets_on_error() {
        let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
        let result: crate::Result<()> = filter.with_state(FilterState::Saving, |filter| {
            assert_eq!(filter.state(), FilterState::Saving);
            Err(Error::Closed)
        });
        assert!(result.is_err());
        assert_eq!(filter.state(), FilterState::Idle);
    }

    #[test]
    fn test_raw_modes() {
        let config = heap_config(256)
            .with_slice_count(4)
            .with_slice_width(32)
            .with_hashing_mode(HashingMode::RawIntegerHex);
        let mut filter = Filter::new(config).unwrap();
        filter.add("04030201").unwrap();
        assert_eq!(filter.as_bytes()[0], 0b0001_1110);
        assert!(filter.query("0x04030201").unwrap());
        assert!(matches!(filter.add("xyz"), Err(Error::InvalidHex)));
    }

    #[test]
    fn test_clear_and_close() {
        let config = heap_config(1 << 12).with_backing(Backing::Mapped(None));
        let mut filter = Filter::new(config).unwrap();
        assert_eq!(filter.store_kind(), StoreKind::Mapped);
        filter.add("foo").unwrap();
        filter.clear().unwrap();
        assert!(!filter.query("foo").unwrap());
        assert_eq!(filter.stat().bits_set_estimate, 0);

        filter.close().unwrap();
        filter.close().unwrap();
        assert!(filter.is_empty());
        assert!(matches!(filter.add("foo"), Err(Error::Closed)));
        assert!(matches!(filter.query("foo"), Err(Error::Closed)));
    }

    #[test]
    fn test_estimated_fpp() {
        let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
        assert!(filter.estimated_fpp() < std::f64::EPSILON);
        filter.add("foo").unwrap();
        let expected = (filter.count_ones() as f64 / 4096.0).powi(17);
        assert!((filter.estimated_fpp() - expected).abs() < std::f64::EPSILON);
    }

    #[test]
    fn test_introspection() {
        let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
        assert_eq!(filter.entropy(), 0.0);
        let empty_id = filter.short_id();
        filter.add("foo").unwrap();

        assert!(filter.entropy() > 0.0);
        assert_eq!(filter.fingerprint_hex().len(), 64);
        assert_eq!(filter.short_id().len(), 8);
        assert!(filter.fingerprint_hex().starts_with(&filter.short_id()));
        assert_ne!(filter.short_id(), empty_id);
    }

    #[test]
    fn test_shannon_entropy() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7; 16]), 0.0);
        assert!((shannon_entropy(&[0, 1, 2, 3]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_stats_display() {
        let mut filter = Filter::new(heap_config(1 << 12)).unwrap();
        filter.update("foo").unwrap();
        filter.update("foo").unwrap();
        let stats = filter.stat();
        assert!((stats.hit_ratio() - 0.5).abs() < std::f64::EPSILON);
        assert!(stats.to_string().starts_with("bits set: 17 of 4096"));
    }
}
