//! Ordered compression pipeline applied at the persistence boundary.
//!
//! Stages run fastest first on compression and in reverse on decompression. A stage that fails
//! during compression leaves its input untouched and is skipped. The stages that did apply are
//! recorded in a small envelope in front of the output:
//!
//! ```text
//! offset 0..4    : magic "BFZ1"
//! offset 4..12   : first eight bytes of the BLAKE3 digest of everything from offset 12 on
//! offset 12      : number of applied stages `n`
//! offset 13..13+n: stage ids, in the order they were applied
//! next 8 bytes   : uncompressed length, big-endian
//! rest           : output of the last applied stage
//! ```
//!
//! Decompression checks the digest before touching any stage, then reverses exactly the recorded
//! stages and fails loudly if one of them cannot be undone. Input without the envelope is treated as legacy data: each known stage is tried in
//! reverse order and skipped if it fails.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::borrow::Cow;
use std::io::Cursor;
use tracing::debug;

const ENVELOPE_MAGIC: &[u8; 4] = b"BFZ1";
const CHECKSUM_LEN: usize = 8;

/// Longest chain a [`Codec`] accepts, bounded by the one-byte stage count of the envelope.
pub const MAX_STAGES: usize = u8::MAX as usize;

#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

/// One compression stage of a [`Codec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// LZ4 frame format with a content checksum.
    Lz4,
    /// Zstandard with a content checksum.
    Zstd,
}

impl Stage {
    /// Every stage, fastest first.
    pub const ALL: [Stage; 2] = [Stage::Lz4, Stage::Zstd];

    /// Returns the identifier written to the envelope.
    pub fn id(self) -> u8 {
        match self {
            Stage::Lz4 => 1,
            Stage::Zstd => 2,
        }
    }

    /// Returns the stage with identifier `id`.
    pub fn from_id(id: u8) -> Option<Self> {
        Stage::ALL.iter().copied().find(|stage| stage.id() == id)
    }

    /// Returns the name of the stage.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Lz4 => "lz4",
            Stage::Zstd => "zstd",
        }
    }

    /// Returns `true` if support for the stage was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            Stage::Lz4 => cfg!(feature = "lz4"),
            Stage::Zstd => cfg!(feature = "zstd"),
        }
    }

    fn failure(self, reason: impl ToString) -> Error {
        Error::CodecStage {
            stage: self.name(),
            reason: reason.to_string(),
        }
    }

    /// Compresses `data`. On failure `data` is left as it was.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Stage::Lz4 => lz4_compress(data).map_err(|reason| self.failure(reason)),
            Stage::Zstd => zstd_compress(data).map_err(|reason| self.failure(reason)),
        }
    }

    /// Reverses [`compress`](Stage::compress).
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Stage::Lz4 => lz4_decompress(data).map_err(|reason| self.failure(reason)),
            Stage::Zstd => zstd_decompress(data).map_err(|reason| self.failure(reason)),
        }
    }
}

#[cfg(feature = "lz4")]
fn lz4_compress(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    use lz4_flex::frame::{FrameEncoder, FrameInfo};
    use std::io::Write;

    let mut encoder =
        FrameEncoder::with_frame_info(FrameInfo::new().content_checksum(true), Vec::new());
    encoder.write_all(data).map_err(|err| err.to_string())?;
    encoder.finish().map_err(|err| err.to_string())
}

#[cfg(feature = "lz4")]
fn lz4_decompress(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    use lz4_flex::frame::FrameDecoder;
    use std::io::Read;

    let mut out = Vec::new();
    FrameDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| err.to_string())?;
    Ok(out)
}

#[cfg(not(feature = "lz4"))]
fn lz4_compress(_data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    Err("support not compiled in".into())
}

#[cfg(not(feature = "lz4"))]
fn lz4_decompress(_data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    Err("support not compiled in".into())
}

#[cfg(feature = "zstd")]
fn zstd_compress(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    use std::io::Write;

    let mut encoder =
        zstd::stream::Encoder::new(Vec::new(), ZSTD_LEVEL).map_err(|err| err.to_string())?;
    encoder
        .include_checksum(true)
        .map_err(|err| err.to_string())?;
    encoder.write_all(data).map_err(|err| err.to_string())?;
    encoder.finish().map_err(|err| err.to_string())
}

#[cfg(feature = "zstd")]
fn zstd_decompress(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    zstd::stream::decode_all(data).map_err(|err| err.to_string())
}

#[cfg(not(feature = "zstd"))]
fn zstd_compress(_data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    Err("support not compiled in".into())
}

#[cfg(not(feature = "zstd"))]
fn zstd_decompress(_data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    Err("support not compiled in".into())
}

/// Output of [`Codec::compress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encoded {
    /// Envelope followed by the compressed payload.
    pub bytes: Vec<u8>,
    /// Stages that were applied, in order.
    pub applied: Vec<Stage>,
}

/// Output of [`Codec::decompress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    /// The uncompressed bytes.
    pub bytes: Vec<u8>,
    /// Stages that were reversed, in the order they had been applied.
    pub applied: Vec<Stage>,
    /// `false` if the input had no envelope and was decoded by trial.
    pub enveloped: bool,
}

/// An ordered chain of compression stages.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::codec::Codec;
///
/// let codec = Codec::default();
/// let data = vec![0u8; 4096];
///
/// let encoded = codec.compress(&data);
/// assert!(encoded.bytes.len() < data.len());
///
/// let decoded = codec.decompress(&encoded.bytes).unwrap();
/// assert_eq!(decoded.bytes, data);
/// assert_eq!(decoded.applied, encoded.applied);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Codec {
    stages: Vec<Stage>,
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            stages: Stage::ALL
                .iter()
                .copied()
                .filter(|stage| stage.is_available())
                .collect(),
        }
    }
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut sum = [0; CHECKSUM_LEN];
    sum.copy_from_slice(&blake3::hash(body).as_bytes()[..CHECKSUM_LEN]);
    sum
}

fn seal(ids: &[u8], len: u64, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + ids.len() + 8 + payload.len());
    body.push(ids.len() as u8);
    body.extend_from_slice(ids);
    body.extend_from_slice(&len.to_be_bytes());
    body.extend_from_slice(payload);

    let mut bytes = Vec::with_capacity(ENVELOPE_MAGIC.len() + CHECKSUM_LEN + body.len());
    bytes.extend_from_slice(ENVELOPE_MAGIC);
    bytes.extend_from_slice(&checksum(&body));
    bytes.extend_from_slice(&body);
    bytes
}

impl Codec {
    /// Constructs a codec applying `stages` in order.
    ///
    /// Fails with [`Error::InvalidConfig`] if there are more than [`MAX_STAGES`] stages.
    ///
    /// # Examples
    ///
    /// ```
    /// use fast_bloom_filter::codec::{Codec, Stage, MAX_STAGES};
    ///
    /// assert!(Codec::new(vec![Stage::Zstd]).is_ok());
    /// assert!(Codec::new(vec![Stage::Lz4; MAX_STAGES + 1]).is_err());
    /// ```
    pub fn new<I: IntoIterator<Item = Stage>>(stages: I) -> Result<Self> {
        let stages: Vec<Stage> = stages.into_iter().collect();
        if stages.len() > MAX_STAGES {
            return Err(Error::InvalidConfig(format!(
                "{} codec stages exceed the limit of {}",
                stages.len(),
                MAX_STAGES
            )));
        }
        Ok(Codec { stages })
    }

    /// Returns the configured stages in compression order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs `data` through every stage, skipping the ones that fail, and wraps the result in an
    /// envelope naming the stages that applied.
    pub fn compress(&self, data: &[u8]) -> Encoded {
        self.compress_with(data, Stage::compress)
    }

    fn compress_with<F>(&self, data: &[u8], run: F) -> Encoded
    where
        F: Fn(Stage, &[u8]) -> Result<Vec<u8>>,
    {
        let mut current = Cow::Borrowed(data);
        let mut applied = Vec::with_capacity(self.stages.len());
        for &stage in &self.stages {
            match run(stage, &current) {
                Ok(out) => {
                    debug!(stage = stage.name(), from = current.len(), to = out.len(), "codec stage applied");
                    current = Cow::Owned(out);
                    applied.push(stage);
                }
                Err(err) => debug!(stage = stage.name(), error = %err, "codec stage skipped"),
            }
        }

        let ids: Vec<u8> = applied.iter().map(|stage| stage.id()).collect();
        let bytes = seal(&ids, data.len() as u64, &current);
        Encoded { bytes, applied }
    }

    /// Reverses [`compress`](Codec::compress).
    pub fn decompress(&self, data: &[u8]) -> Result<Decoded> {
        if data.starts_with(ENVELOPE_MAGIC) {
            self.decompress_enveloped(data)
        } else {
            Ok(self.decompress_legacy(data))
        }
    }

    fn decompress_enveloped(&self, data: &[u8]) -> Result<Decoded> {
        let header = ENVELOPE_MAGIC.len() + CHECKSUM_LEN;
        if data.len() < header {
            return Err(Error::CorruptEnvelope("truncated envelope".into()));
        }
        let body = &data[header..];
        if data[ENVELOPE_MAGIC.len()..header] != checksum(body) {
            return Err(Error::CorruptEnvelope("checksum mismatch".into()));
        }

        let truncated = |_| Error::CorruptEnvelope("truncated envelope".into());
        let mut cursor = Cursor::new(body);
        let count = cursor.read_u8().map_err(truncated)?;
        let mut applied = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = cursor.read_u8().map_err(truncated)?;
            let stage = Stage::from_id(id)
                .ok_or_else(|| Error::CorruptEnvelope(format!("unknown stage id {}", id)))?;
            applied.push(stage);
        }
        let len = cursor.read_u64::<BigEndian>().map_err(truncated)?;
        let offset = cursor.position() as usize;

        let mut current = Cow::Borrowed(&body[offset..]);
        for &stage in applied.iter().rev() {
            let out = stage.decompress(&current)?;
            debug!(stage = stage.name(), from = current.len(), to = out.len(), "codec stage reversed");
            current = Cow::Owned(out);
        }
        if current.len() as u64 != len {
            return Err(Error::CorruptEnvelope(format!(
                "decoded {} bytes, envelope records {}",
                current.len(),
                len
            )));
        }
        Ok(Decoded {
            bytes: current.into_owned(),
            applied,
            enveloped: true,
        })
    }

    fn decompress_legacy(&self, data: &[u8]) -> Decoded {
        let mut current = Cow::Borrowed(data);
        let mut applied = Vec::new();
        for &stage in self.stages.iter().rev() {
            match stage.decompress(&current) {
                Ok(out) => {
                    current = Cow::Owned(out);
                    applied.push(stage);
                }
                Err(err) => debug!(stage = stage.name(), error = %err, "legacy codec stage skipped"),
            }
        }
        applied.reverse();
        Decoded {
            bytes: current.into_owned(),
            applied,
            enveloped: false,
        }
    }
}
