//! On-disk representation of a filter.
//!
//! Before compression a saved filter is laid out as:
//!
//! ```text
//! offset 0..6   : magic "BLOOM:"
//! offset 6..10  : first four bytes of the BLAKE3 digest of the bit array
//! offset 10..   : packed bit array, bit_count / 8 bytes
//! ```
//!
//! The whole frame then goes through a [`Codec`]. Files are written to a temporary sibling and
//! renamed into place, after the previous file has optionally been copied to `<path>.bkp`.

use crate::address::AddressGenerator;
use crate::bit_store::open_store;
use crate::codec::{Codec, Stage};
use crate::config::FilterConfig;
use crate::error::{Error, Result};
use crate::filter::{fingerprint, Filter, FilterState};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Magic bytes opening a framed bit array.
pub const MAGIC: &[u8; 6] = b"BLOOM:";

/// Length of the magic plus the fingerprint prefix.
pub const HEADER_LEN: usize = 10;

/// Default size of the chunks used for file reads and writes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Options for [`Filter::save`].
#[derive(Clone, Debug)]
pub struct SaveOptions {
    /// Copy the existing file to `<path>.bkp` before overwriting it.
    pub backup: bool,
    /// Size of each write.
    pub chunk_size: usize,
    /// Compression applied to the framed bit array.
    pub codec: Codec,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            backup: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            codec: Codec::default(),
        }
    }
}

/// Options for [`Filter::load_with`] and [`Filter::reload`].
#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Size of each read.
    pub chunk_size: usize,
    /// Codec used to reverse compression. Enveloped files name their own stages, so this only
    /// matters for legacy files.
    pub codec: Codec,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            codec: Codec::default(),
        }
    }
}

/// Outcome of [`Filter::save`].
#[derive(Clone, Debug)]
pub struct SaveReport {
    /// Size of the written file.
    pub bytes_written: u64,
    /// Wall time spent saving.
    pub elapsed: Duration,
    /// Codec stages applied, in order.
    pub stages: Vec<Stage>,
    /// BLAKE3 digest of the saved bit array.
    pub fingerprint: [u8; 32],
    /// `true` if `<path>.bkp` was refreshed.
    pub backup_refreshed: bool,
}

/// How much of a loaded file could be checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// The header was present and its fingerprint matched the bit array.
    Verified,
    /// The header was present but carried no fingerprint.
    ///
    /// An all-zero prefix is the placeholder older tools write. A genuine BLAKE3 digest starts
    /// with four zero bytes about once in 2^32 saves; such a file also loads as `Unverified`.
    /// The codec envelope checksum still covers it.
    Unverified,
    /// No header was found; the whole decoded file was taken as the bit array.
    Unframed,
}

/// Outcome of a load.
#[derive(Clone, Debug)]
pub struct LoadReport {
    /// Whether the bit array could be verified.
    pub framing: Framing,
    /// BLAKE3 digest of the loaded bit array.
    pub fingerprint: [u8; 32],
    /// Codec stages reversed, in the order they had been applied.
    pub stages: Vec<Stage>,
    /// `false` if the codec stages were recovered by trial.
    pub enveloped: bool,
    /// Size of the file read.
    pub bytes_read: u64,
    /// Wall time spent loading.
    pub elapsed: Duration,
}

impl LoadReport {
    /// Returns `true` if the header fingerprint matched the loaded bit array.
    pub fn is_verified(&self) -> bool {
        self.framing == Framing::Verified
    }
}

/// Returns the backup path for `path`, which is `path` with `.bkp` appended.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::persist::backup_path;
/// use std::path::Path;
///
/// assert_eq!(backup_path(Path::new("/tmp/filter.blf")), Path::new("/tmp/filter.blf.bkp"));
/// ```
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bkp");
    PathBuf::from(name)
}

fn file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Copies `path` over its backup if it is larger than the backup.
fn refresh_backup(path: &Path) -> Result<bool> {
    let live = match file_len(path)? {
        Some(len) => len,
        None => return Ok(false),
    };
    let backup = backup_path(path);
    let existing = file_len(&backup)?.unwrap_or(0);
    if live > existing {
        fs::copy(path, &backup)?;
        debug!(path = %backup.display(), bytes = live, "backup refreshed");
        Ok(true)
    } else {
        if live < existing {
            warn!(live, backup = existing, "live file is smaller than its backup, keeping backup");
        }
        Ok(false)
    }
}

fn frame(raw: &[u8], fingerprint: &[u8; 32]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(HEADER_LEN + raw.len());
    framed.extend_from_slice(MAGIC);
    framed.extend_from_slice(&fingerprint[..4]);
    framed.extend_from_slice(raw);
    framed
}

fn unframe(mut data: Vec<u8>) -> Result<(Vec<u8>, Framing)> {
    if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
        warn!("header missing, loading unframed bit array; reliability cannot be confirmed");
        return Ok((data, Framing::Unframed));
    }
    let payload = data.split_off(HEADER_LEN);
    let stored = &data[MAGIC.len()..HEADER_LEN];
    if stored.iter().all(|&byte| byte == 0) {
        warn!("header carries no fingerprint; reliability cannot be confirmed");
        return Ok((payload, Framing::Unverified));
    }
    let actual = fingerprint(&payload);
    if stored != &actual[..4] {
        return Err(Error::FingerprintMismatch {
            expected: hex::encode(stored),
            actual: hex::encode(&actual[..4]),
        });
    }
    Ok((payload, Framing::Verified))
}

fn write_chunked(path: &Path, payload: &[u8], chunk_size: usize) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new().prefix(".bloom-").tempfile_in(dir)?;
    for chunk in payload.chunks(chunk_size.max(1)) {
        tmp.as_file_mut().write_all(chunk)?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn read_chunked(path: &Path, chunk_size: usize) -> Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::FilterNotFound(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    let mut buf = Vec::with_capacity(file.metadata()?.len() as usize);
    let mut chunk = vec![0; chunk_size.max(1)];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(buf)
}

/// Reads and decodes the bit array stored at `path`.
fn read_bits(path: &Path, options: &LoadOptions) -> Result<(Vec<u8>, LoadReport)> {
    let start = Instant::now();
    let data = read_chunked(path, options.chunk_size)?;
    let bytes_read = data.len() as u64;
    let decoded = options.codec.decompress(&data)?;
    drop(data);
    let (payload, framing) = unframe(decoded.bytes)?;
    let report = LoadReport {
        framing,
        fingerprint: fingerprint(&payload),
        stages: decoded.applied,
        enveloped: decoded.enveloped,
        bytes_read,
        elapsed: start.elapsed(),
    };
    Ok((payload, report))
}

fn log_load(path: &Path, bits: usize, report: &LoadReport) {
    info!(
        path = %path.display(),
        bits,
        bytes = report.bytes_read,
        elapsed_ms = report.elapsed.as_millis() as u64,
        id = %hex::encode(&report.fingerprint[..4]),
        framing = ?report.framing,
        "filter loaded"
    );
}

impl Filter {
    /// Writes the filter to `path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use fast_bloom_filter::persist::SaveOptions;
    /// use fast_bloom_filter::{Backing, Filter, FilterConfig};
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let path = dir.path().join("filter.blf");
    /// let config = FilterConfig::default()
    ///     .with_bit_count(1 << 16)
    ///     .with_backing(Backing::Heap);
    ///
    /// let mut filter = Filter::new(config.clone()).unwrap();
    /// filter.add("foo").unwrap();
    /// let saved = filter.save(&path, &SaveOptions::default()).unwrap();
    ///
    /// let (loaded, report) = Filter::load(&path, config).unwrap();
    /// assert!(report.is_verified());
    /// assert_eq!(report.fingerprint, saved.fingerprint);
    /// assert!(loaded.query("foo").unwrap());
    /// ```
    pub fn save<P: AsRef<Path>>(&mut self, path: P, options: &SaveOptions) -> Result<SaveReport> {
        let path = path.as_ref();
        self.with_state(FilterState::Saving, |filter| {
            let start = Instant::now();
            let backup_refreshed = options.backup && refresh_backup(path)?;
            filter.flush()?;

            let raw = filter.store().as_bytes();
            let fingerprint = fingerprint(raw);
            let encoded = options.codec.compress(&frame(raw, &fingerprint));
            write_chunked(path, &encoded.bytes, options.chunk_size)?;

            let report = SaveReport {
                bytes_written: encoded.bytes.len() as u64,
                elapsed: start.elapsed(),
                stages: encoded.applied,
                fingerprint,
                backup_refreshed,
            };
            info!(
                path = %path.display(),
                bytes = report.bytes_written,
                elapsed_ms = report.elapsed.as_millis() as u64,
                id = %hex::encode(&fingerprint[..4]),
                stages = ?report.stages,
                "filter saved"
            );
            Ok(report)
        })
    }

    /// Reads a filter from `path` with default [`LoadOptions`].
    ///
    /// The bit count is taken from the file; every other parameter comes from `config`.
    pub fn load<P: AsRef<Path>>(path: P, config: FilterConfig) -> Result<(Filter, LoadReport)> {
        Self::load_with(path, config, &LoadOptions::default())
    }

    /// Reads a filter from `path`.
    pub fn load_with<P: AsRef<Path>>(
        path: P,
        config: FilterConfig,
        options: &LoadOptions,
    ) -> Result<(Filter, LoadReport)> {
        let path = path.as_ref();
        let (payload, report) = read_bits(path, options)?;
        let config = config.with_bit_count(payload.len() * 8);
        let generator = AddressGenerator::new(&config)?;
        let mut store = open_store(config.bit_count, &config.backing)?;
        store.load_from_bytes(&payload)?;
        log_load(path, config.bit_count, &report);
        Ok((Filter::from_parts(config, generator, store), report))
    }

    /// Replaces the bit array of this filter with the one stored at `path`. Counters are reset.
    /// On error the filter is left unchanged.
    pub fn reload<P: AsRef<Path>>(&mut self, path: P, options: &LoadOptions) -> Result<LoadReport> {
        let path = path.as_ref();
        self.with_state(FilterState::Loading, |filter| {
            let (payload, report) = read_bits(path, options)?;
            let config = filter.config().clone().with_bit_count(payload.len() * 8);
            filter.replace_bits(config, &payload)?;
            log_load(path, filter.len(), &report);
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{backup_path, frame, unframe, Framing, LoadOptions, SaveOptions, MAGIC};
    use crate::codec::Codec;
    use crate::config::{Backing, FilterConfig};
    use crate::error::Error;
    use crate::filter::{Filter, FilterState};
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use std::fs;

    fn config() -> FilterConfig {
        FilterConfig::default()
            .with_bit_count(1 << 16)
            .with_slice_count(17)
            .with_backing(Backing::Heap)
    }

    fn filled(config: FilterConfig, count: usize) -> (Filter, Vec<String>) {
        let mut rng = XorShiftRng::seed_from_u64(5);
        let values: Vec<String> = (0..count).map(|_| rng.gen::<u64>().to_string()).collect();
        let mut filter = Filter::new(config).unwrap();
        for value in &values {
            filter.add(value).unwrap();
        }
        (filter, values)
    }

    #[test]
    fn test_frame_unframe() {
        let raw = vec![1, 2, 3, 4];
        let framed = frame(&raw, &crate::filter::fingerprint(&raw));
        assert_eq!(&framed[..6], MAGIC);
        assert_eq!(unframe(framed.clone()).unwrap(), (raw, Framing::Verified));

        let mut tampered = framed;
        tampered[12] ^= 1;
        assert!(matches!(
            unframe(tampered),
            Err(Error::FingerprintMismatch { .. })
        ));

        assert_eq!(
            unframe(b"BLOOM:\0\0\0\0\x05".to_vec()).unwrap(),
            (vec![5], Framing::Unverified)
        );
        assert_eq!(
            unframe(vec![9, 9]).unwrap(),
            (vec![9, 9], Framing::Unframed)
        );
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let (mut filter, values) = filled(config(), 1000);

        let saved = filter.save(&path, &SaveOptions::default()).unwrap();
        assert_eq!(saved.fingerprint, filter.fingerprint());
        assert_eq!(saved.bytes_written, fs::metadata(&path).unwrap().len());
        assert_eq!(filter.state(), FilterState::Idle);

        let (loaded, report) = Filter::load(&path, config()).unwrap();
        assert!(report.is_verified());
        assert!(report.enveloped);
        assert_eq!(report.stages, saved.stages);
        assert_eq!(report.fingerprint, saved.fingerprint);
        assert_eq!(loaded.fingerprint(), filter.fingerprint());
        assert_eq!(loaded.as_bytes(), filter.as_bytes());
        assert_eq!(loaded.len(), 1 << 16);
        assert!(values.iter().all(|value| loaded.query(value).unwrap()));
        assert_eq!(loaded.stat().bits_set_estimate, filter.count_ones() as u64);
        assert_eq!(loaded.stat().query_count, values.len() as u64);
    }

    #[test]
    fn test_round_trip_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let mapped = config().with_backing(Backing::Mapped(Some(dir.path().join("bits"))));
        let (mut filter, values) = filled(mapped.clone(), 200);
        filter.save(&path, &SaveOptions::default()).unwrap();
        filter.close().unwrap();

        let (loaded, report) = Filter::load(&path, mapped).unwrap();
        assert!(report.is_verified());
        assert_eq!(loaded.store_kind(), crate::bit_store::StoreKind::Mapped);
        assert!(values.iter().all(|value| loaded.query(value).unwrap()));
    }

    #[test]
    fn test_chunked_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let (mut filter, values) = filled(config(), 100);
        let options = SaveOptions {
            chunk_size: 7,
            codec: Codec::new(vec![]).unwrap(),
            ..SaveOptions::default()
        };
        filter.save(&path, &options).unwrap();

        let load_options = LoadOptions {
            chunk_size: 3,
            ..LoadOptions::default()
        };
        let (loaded, report) = Filter::load_with(&path, config(), &load_options).unwrap();
        assert!(report.stages.is_empty());
        assert_eq!(loaded.as_bytes(), filter.as_bytes());
        assert!(values.iter().all(|value| loaded.query(value).unwrap()));
    }

    #[test]
    fn test_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let (mut small, values) = filled(config().with_bit_count(1 << 12), 50);
        small.save(&path, &SaveOptions::default()).unwrap();

        let mut filter = Filter::new(config()).unwrap();
        filter.add("other").unwrap();
        let report = filter.reload(&path, &LoadOptions::default()).unwrap();

        assert!(report.is_verified());
        assert_eq!(filter.len(), 1 << 12);
        assert_eq!(filter.config().bit_count, 1 << 12);
        assert_eq!(filter.state(), FilterState::Idle);
        assert!(values.iter().all(|value| filter.query(value).unwrap()));
        assert_eq!(filter.fingerprint(), small.fingerprint());
    }

    #[test]
    fn test_reload_failure_keeps_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mut filter = Filter::new(config()).unwrap();
        filter.add("foo").unwrap();
        let before = filter.fingerprint();

        let result = filter.reload(dir.path().join("missing"), &LoadOptions::default());
        assert!(matches!(result, Err(Error::FilterNotFound(_))));
        assert_eq!(filter.fingerprint(), before);
        assert_eq!(filter.state(), FilterState::Idle);
    }

    #[test]
    fn test_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = Filter::load(dir.path().join("missing.blf"), config());
        assert!(matches!(result, Err(Error::FilterNotFound(_))));
    }

    #[test]
    fn test_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let backup = backup_path(&path);
        let mut filter = Filter::new(config()).unwrap();

        let report = filter.save(&path, &SaveOptions::default()).unwrap();
        assert!(!report.backup_refreshed);
        assert!(!backup.exists());
        let first = fs::read(&path).unwrap();

        for i in 0..1000 {
            filter.add(i.to_string()).unwrap();
        }
        let report = filter.save(&path, &SaveOptions::default()).unwrap();
        assert!(report.backup_refreshed);
        assert_eq!(fs::read(&backup).unwrap(), first);

        let large = vec![7u8; 1 << 20];
        fs::write(&backup, &large).unwrap();
        let report = filter.save(&path, &SaveOptions::default()).unwrap();
        assert!(!report.backup_refreshed);
        assert_eq!(fs::read(&backup).unwrap(), large);

        let no_backup = SaveOptions {
            backup: false,
            ..SaveOptions::default()
        };
        fs::remove_file(&backup).unwrap();
        filter.save(&path, &no_backup).unwrap();
        assert!(!backup.exists());
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let small = config().with_bit_count(1 << 12);
        let (mut filter, _) = filled(small.clone(), 20);
        filter.save(&path, &SaveOptions::default()).unwrap();
        let bytes = fs::read(&path).unwrap();

        for offset in 0..bytes.len() {
            for &mask in &[0x01, 0x80, 0xff] {
                let mut tampered = bytes.clone();
                tampered[offset] ^= mask;
                fs::write(&path, &tampered).unwrap();
                if let Ok((_, report)) = Filter::load(&path, small.clone()) {
                    assert!(
                        !report.is_verified(),
                        "flip {:#04x} at byte {} loaded as verified",
                        mask,
                        offset
                    );
                }
            }
        }
    }

    #[test]
    fn test_uncompressed_payload_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.blf");
        let (mut filter, _) = filled(config(), 10);
        let options = SaveOptions {
            codec: Codec::new(vec![]).unwrap(),
            ..SaveOptions::default()
        };
        filter.save(&path, &options).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Filter::load(&path, config()),
            Err(Error::CorruptEnvelope(_))
        ));
    }

    #[test]
    fn test_framed_payload_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.blf");
        let raw = vec![0x5au8; 64];
        let mut framed = frame(&raw, &crate::filter::fingerprint(&raw));
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        fs::write(&path, &framed).unwrap();

        assert!(matches!(
            Filter::load(&path, config()),
            Err(Error::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn test_legacy_unframed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.bits");
        let mut raw = vec![0u8; 512];
        raw[3] = 0b1010;
        fs::write(&path, &raw).unwrap();

        let (filter, report) = Filter::load(&path, config()).unwrap();
        assert_eq!(report.framing, Framing::Unframed);
        assert!(!report.enveloped);
        assert_eq!(filter.len(), 4096);
        assert_eq!(filter.as_bytes(), &raw[..]);
    }

    #[test]
    fn test_legacy_placeholder_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.blf");
        let mut data = b"BLOOM:\0\0\0\0".to_vec();
        data.extend(vec![0xffu8; 64]);
        fs::write(&path, &data).unwrap();

        let (filter, report) = Filter::load(&path, config()).unwrap();
        assert_eq!(report.framing, Framing::Unverified);
        assert_eq!(filter.len(), 512);
        assert_eq!(filter.count_ones(), 512);
    }

    #[test]
    fn test_unframed_requires_power_of_two() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.bits");
        fs::write(&path, vec![0u8; 24]).unwrap();

        assert!(matches!(
            Filter::load(&path, config()),
            Err(Error::InvalidConfig(_))
        ));
        let (filter, report) = Filter::load(&path, config().with_fast_mode(true)).unwrap();
        assert_eq!(report.framing, Framing::Unframed);
        assert_eq!(filter.len(), 192);
    }
}
