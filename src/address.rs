//! Deterministic mapping from a value to the bit positions it occupies.
//!
//! A single wide integer `D` is derived from the value, either by hashing it or by reading it
//! directly. In fast mode the only address is `D mod bit_count`. Otherwise the `i`-th address is
//! `(D >> (i * shift)) & (bit_count - 1)` where `shift = slice_width / slice_count`, so one digest
//! feeds every slice without re-hashing.
//!
//! The slices must not read past the top of the digest, otherwise later slices would see
//! zero-extended bits and collapse onto the same addresses. [`FilterConfig::validate`] enforces
//! this for hashed values and [`AddressGenerator::addresses`] enforces it for raw values.

use crate::config::{FilterConfig, HashingMode};
use crate::error::{Error, Result};

/// Width in bits of the digest computed in [`HashingMode::HashValue`].
pub const DIGEST_BITS: usize = 512;

const DIGEST_BYTES: usize = DIGEST_BITS / 8;

/// A wide unsigned integer stored as big-endian bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digest {
    bytes: Vec<u8>,
    bit_width: usize,
}

impl Digest {
    /// Hashes `value` into a 512-bit digest using BLAKE3 in extendable output mode.
    pub fn hash(value: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(value);
        let mut bytes = vec![0; DIGEST_BYTES];
        hasher.finalize_xof().fill(&mut bytes);
        Digest {
            bytes,
            bit_width: DIGEST_BITS,
        }
    }

    /// Reads `value` as a big-endian integer.
    pub fn from_be_bytes(value: &[u8]) -> Self {
        Digest {
            bytes: value.to_vec(),
            bit_width: value.len() * 8,
        }
    }

    /// Parses `value` as hexadecimal text. Surrounding whitespace and a `0x` prefix are allowed.
    pub fn from_hex(value: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(value).map_err(|_| Error::InvalidHex)?.trim();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if digits.is_empty() {
            return Err(Error::InvalidHex);
        }
        let bytes = if digits.len() % 2 == 1 {
            hex::decode(format!("0{}", digits))
        } else {
            hex::decode(digits)
        }
        .map_err(|_| Error::InvalidHex)?;
        Ok(Digest {
            bytes,
            bit_width: digits.len() * 4,
        })
    }

    /// Number of bits the digest was built from.
    pub fn bit_width(&self) -> usize {
        self.bit_width
    }

    /// Returns `width` bits starting `offset` bits above the least significant bit. Bits above
    /// the top of the digest read as zero.
    fn bits_at(&self, offset: usize, width: usize) -> u64 {
        let mut out = 0u64;
        let mut read = 0;
        while read < width {
            let pos = offset + read;
            let from_end = pos / 8;
            if from_end >= self.bytes.len() {
                break;
            }
            let byte = self.bytes[self.bytes.len() - 1 - from_end];
            let bit = pos % 8;
            let take = (8 - bit).min(width - read);
            let chunk = u64::from(byte >> bit) & ((1u64 << take) - 1);
            out |= chunk << read;
            read += take;
        }
        out
    }

    /// Returns the digest reduced modulo `modulus`.
    fn rem(&self, modulus: usize) -> usize {
        let modulus = modulus as u128;
        let rem = self
            .bytes
            .iter()
            .fold(0u128, |acc, &byte| ((acc << 8) | u128::from(byte)) % modulus);
        rem as usize
    }
}

/// Maps values to bit addresses for one filter configuration.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::{AddressGenerator, FilterConfig, HashingMode};
///
/// let config = FilterConfig::default()
///     .with_bit_count(256)
///     .with_slice_count(4)
///     .with_slice_width(32)
///     .with_hashing_mode(HashingMode::RawIntegerBigEndian);
/// let generator = AddressGenerator::new(&config).unwrap();
///
/// assert_eq!(generator.addresses(&[4, 3, 2, 1]).unwrap(), vec![1, 2, 3, 4]);
/// ```
#[derive(Clone, Debug)]
pub struct AddressGenerator {
    bit_count: usize,
    slice_count: usize,
    shift: usize,
    address_bits: usize,
    span: usize,
    hashing_mode: HashingMode,
    fast_mode: bool,
}

impl AddressGenerator {
    /// Constructs a generator for `config`, validating it first.
    pub fn new(config: &FilterConfig) -> Result<Self> {
        config.validate()?;
        Ok(AddressGenerator {
            bit_count: config.bit_count,
            slice_count: config.slice_count,
            shift: config.slice_shift(),
            address_bits: config.address_bits(),
            span: config.digest_span(),
            hashing_mode: config.hashing_mode,
            fast_mode: config.fast_mode,
        })
    }

    /// Number of addresses produced per value.
    pub fn address_count(&self) -> usize {
        if self.fast_mode {
            1
        } else {
            self.slice_count
        }
    }

    /// Computes the wide integer for `value` according to the hashing mode.
    pub fn digest(&self, value: &[u8]) -> Result<Digest> {
        let digest = match self.hashing_mode {
            HashingMode::HashValue => Digest::hash(value),
            HashingMode::RawIntegerBigEndian => Digest::from_be_bytes(value),
            HashingMode::RawIntegerHex => Digest::from_hex(value)?,
        };
        if digest.bit_width() < self.span {
            return Err(Error::DigestTooNarrow {
                needed: self.span,
                available: digest.bit_width(),
            });
        }
        Ok(digest)
    }

    /// Returns the addresses of `value`, each in `[0, bit_count)`.
    pub fn addresses(&self, value: &[u8]) -> Result<Vec<usize>> {
        let digest = self.digest(value)?;
        if self.fast_mode {
            return Ok(vec![digest.rem(self.bit_count)]);
        }
        Ok((0..self.slice_count)
            .map(|i| digest.bits_at(i * self.shift, self.address_bits) as usize)
            .collect())
    }
}
