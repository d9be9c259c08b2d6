use super::{locate, popcount, BitStore, StoreKind, BLOCK_BIT_COUNT};
use crate::error::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, warn};

/// A bit array living in a memory-mapped file.
///
/// Writes land in the mapping immediately and reach the file on [`flush`](BitStore::flush) or
/// [`close`](BitStore::close). A store created with [`scratch`](MappedBitStore::scratch) deletes
/// its file when closed. Dropping the store closes it.
///
/// # Examples
///
/// ```
/// use fast_bloom_filter::bit_store::{BitStore, MappedBitStore};
///
/// let mut store = MappedBitStore::scratch(1024).unwrap();
/// let path = store.path().to_path_buf();
///
/// store.set(42, true);
/// assert!(store.get(42));
/// assert!(path.exists());
///
/// store.close().unwrap();
/// assert!(!path.exists());
/// ```
#[derive(Debug)]
pub struct MappedBitStore {
    mmap: Option<MmapMut>,
    file: Option<File>,
    scratch: Option<TempPath>,
    path: PathBuf,
    len: usize,
}

impl MappedBitStore {
    fn map(file: &File, byte_len: usize) -> Result<MmapMut> {
        file.set_len(byte_len as u64)?;
        // Safety: the file is owned by this store and only mutated through the mapping.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(mmap)
    }

    /// Creates (or truncates) the file at `path` and maps `len` zeroed bits from it. The file is
    /// kept when the store is closed.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mmap = Self::map(&file, len / BLOCK_BIT_COUNT)?;
        debug!(path = %path.display(), bits = len, "mapped bit store created");
        Ok(MappedBitStore {
            mmap: Some(mmap),
            file: Some(file),
            scratch: None,
            path,
            len,
        })
    }

    /// Maps `len` zeroed bits from a fresh temporary file that is deleted on close.
    pub fn scratch(len: usize) -> Result<Self> {
        let (file, temp_path) = tempfile::Builder::new()
            .prefix("bloom-")
            .suffix(".bits")
            .tempfile()?
            .into_parts();
        let mmap = Self::map(&file, len / BLOCK_BIT_COUNT)?;
        let path = temp_path.to_path_buf();
        debug!(path = %path.display(), bits = len, "mapped scratch bit store created");
        Ok(MappedBitStore {
            mmap: Some(mmap),
            file: Some(file),
            scratch: Some(temp_path),
            path,
            len,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the backing file is deleted on close.
    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }

    fn bytes(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..],
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.mmap {
            Some(mmap) => &mut mmap[..],
            None => &mut [],
        }
    }
}

impl BitStore for MappedBitStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Mapped
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let (block_index, mask) = locate(index);
        self.bytes()[block_index] & mask != 0
    }

    fn set(&mut self, index: usize, bit: bool) {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let (block_index, mask) = locate(index);
        let block = &mut self.bytes_mut()[block_index];
        if bit {
            *block |= mask;
        } else {
            *block &= !mask;
        }
    }

    fn set_all(&mut self, bit: bool) {
        let mask = if bit { !0 } else { 0 };
        for block in self.bytes_mut() {
            *block = mask;
        }
    }

    fn as_bytes(&self) -> &[u8] {
        self.bytes()
    }

    fn load_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        if bytes.len() != self.len / BLOCK_BIT_COUNT {
            if let Some(mmap) = self.mmap.take() {
                mmap.flush()?;
            }
            self.mmap = Some(Self::map(file, bytes.len())?);
            self.len = bytes.len() * BLOCK_BIT_COUNT;
        }
        self.bytes_mut().copy_from_slice(bytes);
        Ok(())
    }

    fn union_bytes(&mut self, bytes: &[u8]) {
        let blocks = self.bytes_mut();
        assert_eq!(blocks.len(), bytes.len());
        for (x, y) in blocks.iter_mut().zip(bytes) {
            *x |= *y;
        }
    }

    fn count_ones(&self) -> usize {
        popcount(self.bytes())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        if let Some(temp_path) = self.scratch.take() {
            temp_path.close()?;
        }
        if self.len > 0 {
            debug!(path = %self.path.display(), "mapped bit store closed");
            self.len = 0;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.mmap.is_none()
    }
}

impl Drop for MappedBitStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), error = %err, "failed to close mapped bit store");
        }
    }
}
