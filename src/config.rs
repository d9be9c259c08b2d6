//! Construction parameters for a [`Filter`](crate::Filter).

use crate::address::DIGEST_BITS;
use crate::error::{Error, Result};
#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default size of the bit array: 2^30 bits, or 128 MiB.
pub const DEFAULT_BIT_COUNT: usize = 1 << 30;

/// Default number of addresses touched per value.
pub const DEFAULT_SLICE_COUNT: usize = 10;

/// Default number of digest bits spread across the slices.
pub const DEFAULT_SLICE_WIDTH: usize = 256;

/// Byte size above which [`Backing::Auto`] switches to a memory-mapped store.
pub const DEFAULT_MAPPED_THRESHOLD: usize = 64 * 1024 * 1024;

/// How a value is turned into the wide integer that addresses are carved from.
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashingMode {
    /// Hash the value bytes into a 512-bit digest.
    HashValue,
    /// Interpret the value bytes directly as a big-endian integer.
    RawIntegerBigEndian,
    /// Parse the value as ASCII hexadecimal.
    RawIntegerHex,
}

impl Default for HashingMode {
    fn default() -> Self {
        HashingMode::HashValue
    }
}

/// Where the bit array lives.
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Process memory.
    Heap,
    /// A memory-mapped file. `None` maps a scratch file that is deleted on close.
    Mapped(Option<PathBuf>),
    /// Heap below `threshold_bytes`, a scratch mapping above it.
    Auto {
        /// Largest bit array, in bytes, kept on the heap.
        threshold_bytes: usize,
    },
}

impl Default for Backing {
    fn default() -> Self {
        Backing::Auto {
            threshold_bytes: DEFAULT_MAPPED_THRESHOLD,
        }
    }
}

/// Parameters of a filter, fixed for the lifetime of an instance.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::{Backing, FilterConfig};
///
/// let config = FilterConfig::default()
///     .with_bit_count(1 << 20)
///     .with_slice_count(17)
///     .with_backing(Backing::Heap);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.byte_len(), 1 << 17);
/// ```
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterConfig {
    /// Total number of addressable bits.
    pub bit_count: usize,
    /// Number of addresses touched per value outside of fast mode.
    pub slice_count: usize,
    /// Number of digest bits divided between the slices.
    pub slice_width: usize,
    /// How values are turned into digests.
    pub hashing_mode: HashingMode,
    /// Touch a single address per value.
    pub fast_mode: bool,
    /// Storage used for the bit array.
    pub backing: Backing,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            bit_count: DEFAULT_BIT_COUNT,
            slice_count: DEFAULT_SLICE_COUNT,
            slice_width: DEFAULT_SLICE_WIDTH,
            hashing_mode: HashingMode::default(),
            fast_mode: false,
            backing: Backing::default(),
        }
    }
}

impl FilterConfig {
    /// Returns a configuration sized for `item_count` values at a false positive probability of
    /// `fpp`. The bit count is rounded up to the next power of two and the slice width is widened
    /// to at least one digest bit per slice.
    ///
    /// Fails with [`Error::InvalidConfig`] if `fpp` is not strictly between 0 and 1, if the bit
    /// count does not fit in a `usize`, or if the slices cannot fit in the digest.
    ///
    /// # Examples
    ///
    /// ```
    /// use fast_bloom_filter::FilterConfig;
    ///
    /// let config = FilterConfig::for_capacity(1_000_000, 0.001).unwrap();
    /// assert_eq!(config.slice_count, 10);
    /// assert_eq!(config.bit_count, 1 << 24);
    ///
    /// assert!(FilterConfig::for_capacity(1_000_000, 0.0).is_err());
    /// ```
    pub fn for_capacity(item_count: usize, fpp: f64) -> Result<Self> {
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "false positive probability {} is outside (0, 1)",
                fpp
            )));
        }
        let slice_count = ((1.0 / fpp).log2().ceil() as usize).max(1);
        let bits = (item_count as f64 * fpp.ln().abs() / 2f64.ln().powi(2)).ceil();
        let bit_count = if bits < usize::MAX as f64 {
            (bits as usize).max(8).checked_next_power_of_two()
        } else {
            None
        }
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "{} items at {} need more bits than fit in a usize",
                item_count, fpp
            ))
        })?;
        let config = FilterConfig {
            bit_count,
            slice_count,
            slice_width: DEFAULT_SLICE_WIDTH.max(slice_count).min(DIGEST_BITS),
            ..FilterConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the number of bits.
    pub fn with_bit_count(mut self, bit_count: usize) -> Self {
        self.bit_count = bit_count;
        self
    }

    /// Sets the number of slices.
    pub fn with_slice_count(mut self, slice_count: usize) -> Self {
        self.slice_count = slice_count;
        self
    }

    /// Sets the number of digest bits divided between the slices.
    pub fn with_slice_width(mut self, slice_width: usize) -> Self {
        self.slice_width = slice_width;
        self
    }

    /// Sets the hashing mode.
    pub fn with_hashing_mode(mut self, hashing_mode: HashingMode) -> Self {
        self.hashing_mode = hashing_mode;
        self
    }

    /// Enables or disables fast mode.
    pub fn with_fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    /// Sets the storage backing.
    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    /// Length of the bit array in bytes.
    pub fn byte_len(&self) -> usize {
        self.bit_count / 8
    }

    /// Digest bits skipped between two consecutive slices.
    pub fn slice_shift(&self) -> usize {
        if self.slice_count == 0 {
            0
        } else {
            self.slice_width / self.slice_count
        }
    }

    /// Number of low bits that make up one address.
    pub fn address_bits(&self) -> usize {
        self.bit_count.trailing_zeros() as usize
    }

    /// Number of digest bits the slices read, counted from the least significant bit.
    pub fn digest_span(&self) -> usize {
        if self.fast_mode {
            0
        } else {
            (self.slice_count - 1) * self.slice_shift() + self.address_bits()
        }
    }

    /// Checks every construction precondition.
    ///
    /// The bit count must be a positive multiple of eight. Outside of fast mode it must also be a
    /// power of two, since addresses are extracted with a bit mask. In hashing mode the slices must
    /// fit inside the 512-bit digest.
    pub fn validate(&self) -> Result<()> {
        if self.bit_count == 0 || self.bit_count % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "bit count {} is not a positive multiple of 8",
                self.bit_count
            )));
        }
        if self.fast_mode {
            return Ok(());
        }
        if !self.bit_count.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "bit count {} is not a power of two",
                self.bit_count
            )));
        }
        if self.slice_count == 0 {
            return Err(Error::InvalidConfig("slice count must be positive".into()));
        }
        if self.slice_count > 1 && self.slice_shift() == 0 {
            return Err(Error::InvalidConfig(format!(
                "slice width {} is narrower than slice count {}",
                self.slice_width, self.slice_count
            )));
        }
        if self.hashing_mode == HashingMode::HashValue {
            let consumed = self.slice_count * self.slice_shift();
            if consumed > DIGEST_BITS || self.digest_span() > DIGEST_BITS {
                return Err(Error::InvalidConfig(format!(
                    "{} slices of {} bits overrun the {}-bit digest",
                    self.slice_count,
                    self.slice_shift(),
                    DIGEST_BITS
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Backing, FilterConfig, HashingMode};
    use crate::error::Error;

    #[test]
    fn test_default_is_valid() {
        let config = FilterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slice_shift(), 25);
        assert_eq!(config.address_bits(), 30);
        assert_eq!(config.digest_span(), 9 * 25 + 30);
    }

    #[test]
    fn test_rejects_bad_bit_counts() {
        assert!(FilterConfig::default().with_bit_count(0).validate().is_err());
        assert!(FilterConfig::default().with_bit_count(12).validate().is_err());
        assert!(FilterConfig::default().with_bit_count(24).validate().is_err());
        assert!(FilterConfig::default()
            .with_bit_count(24)
            .with_fast_mode(true)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_rejects_exhausted_digest() {
        let config = FilterConfig::default()
            .with_slice_count(64)
            .with_slice_width(1024);
        assert!(config.validate().is_err());

        let config = FilterConfig::default()
            .with_slice_count(20)
            .with_slice_width(10);
        assert!(config.validate().is_err());

        let config = FilterConfig::default()
            .with_slice_count(64)
            .with_slice_width(1024)
            .with_hashing_mode(HashingMode::RawIntegerBigEndian);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_capacity() {
        let config = FilterConfig::for_capacity(1000, 0.01).unwrap();
        assert_eq!(config.slice_count, 7);
        assert_eq!(config.bit_count, 16384);
        assert_eq!(config.slice_width, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_capacity_rejects_bad_probabilities() {
        for &fpp in &[0.0, -0.5, 1.0, 2.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                FilterConfig::for_capacity(100, fpp),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_for_capacity_rejects_oversized() {
        assert!(matches!(
            FilterConfig::for_capacity(usize::MAX, 0.01),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_for_capacity_tiny_probabilities() {
        let config = FilterConfig::for_capacity(100, 1e-100).unwrap();
        assert_eq!(config.slice_count, 333);
        assert_eq!(config.slice_width, 333);
        assert_eq!(config.slice_shift(), 1);
        assert!(config.validate().is_ok());

        assert!(matches!(
            FilterConfig::for_capacity(100, 1e-200),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_for_capacity_tiny_item_count() {
        let config = FilterConfig::for_capacity(0, 0.5).unwrap();
        assert_eq!(config.bit_count, 8);
        assert_eq!(config.slice_count, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = FilterConfig::default()
            .with_bit_count(1 << 10)
            .with_slice_count(4)
            .with_slice_width(64)
            .with_fast_mode(true)
            .with_hashing_mode(HashingMode::RawIntegerHex)
            .with_backing(Backing::Heap);
        assert_eq!(config.byte_len(), 128);
        assert_eq!(config.slice_shift(), 16);
        assert_eq!(config.digest_span(), 0);
        assert_eq!(config.backing, Backing::Heap);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_ser_de() {
        let config = FilterConfig::default().with_backing(Backing::Mapped(None));
        let serialized = bincode::serialize(&config).unwrap();
        let de_config: FilterConfig = bincode::deserialize(&serialized).unwrap();
        assert_eq!(config, de_config);
    }
}
