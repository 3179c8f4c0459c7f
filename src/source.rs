//! Backing byte sources
//!
//! Every container is read through a [`ByteSource`]: an immutable,
//! byte-addressable store supporting positioned reads. Positioned reads keep
//! no shared cursor, so one source can serve several threads reading the same
//! image.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;

/// Random-access, read-only view of a container file.
pub trait ByteSource: Send + Sync {
    /// Total length of the container in bytes.
    fn size(&self) -> u64;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] when the range runs past
    /// [`ByteSource::size`], or any error from the underlying storage.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// A [`File`] opened read-only and shared behind a lock.
///
/// The file cursor is only moved while the lock is held, so concurrent
/// [`ByteSource::read_exact_at`] calls never observe each other's seeks.
pub struct FileSource {
    /// The underlying file handle.
    file: Mutex<File>,
    /// File length captured at open time; the file is never written.
    len: u64,
}

impl FileSource {
    /// Opens the file at `file_path`.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] produced by [`File::open`] or while querying
    /// the file metadata.
    pub fn open<P: AsRef<Path>>(file_path: P) -> io::Result<Self> {
        let file = File::open(file_path)?;
        Self::new(file)
    }

    /// Wraps an already opened file.
    pub fn new(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

/// An in-memory container, mostly useful for tests and small images.
#[derive(Clone, Debug, Default)]
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ByteSource for MemSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// Reads `len` bytes at `offset`, returning `None` if the source is too short.
pub(crate) fn read_prefix(
    source: &dyn ByteSource,
    offset: u64,
    len: usize,
) -> io::Result<Option<Vec<u8>>> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= source.size() => {
            let mut buffer = vec![0u8; len];
            source.read_exact_at(offset, &mut buffer)?;
            Ok(Some(buffer))
        }
        _ => Ok(None),
    }
}

#[inline]
pub(crate) fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

#[inline]
pub(crate) fn le_u64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}
