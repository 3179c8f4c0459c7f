//! Error types shared by every container format.
//!
//! Opening and reading fail in different ways, so they get different enums:
//! [`OpenError`] is returned once a format has been committed to and its
//! metadata turns out to be unusable, [`ReadError`] is returned by sector reads
//! on an image that opened successfully.

use std::io;

use thiserror::Error;

/// Failure while opening a container and deriving its layout.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The signature of the requested format is absent.
    #[error("not a {0} image")]
    NotRecognized(&'static str),

    /// The container is too short to hold the fixed-size header.
    #[error("truncated header: {0}")]
    TruncatedHeader(&'static str),

    /// An allocation table extends past the end of the container.
    #[error(
        "truncated allocation table: {expected} bytes expected at offset 0x{offset:x}, container holds {available}"
    )]
    TruncatedTable {
        offset: u64,
        expected: u64,
        available: u64,
    },

    /// The format was recognized but relies on something this crate does not read.
    #[error("format recognized but feature not implemented: {0}")]
    UnsupportedFeature(String),

    /// Header fields contradict each other.
    #[error("inconsistent geometry: {0}")]
    InconsistentGeometry(String),

    /// The caller asked for a format name nobody handles.
    #[error("unsupported format '{0}'. Supported formats are 'qed', 'vdi', 'parallels', 'partclone' and 'auto'")]
    UnknownFormat(String),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failure while reading sectors from an opened image.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("sector {sector} not found (image holds {total_sectors} sectors)")]
    AddressOutOfRange { sector: u64, total_sectors: u64 },

    #[error(
        "more sectors requested than available: {count} sectors at {sector} (image holds {total_sectors})"
    )]
    LengthExceedsImage {
        sector: u64,
        count: u64,
        total_sectors: u64,
    },

    /// A table entry translated to a location the container does not hold.
    ///
    /// Unallocated data is only ever signalled by a format's sentinel values,
    /// an out-of-range pointer is always reported here.
    #[error(
        "corrupt allocation table: {length} bytes at offset 0x{offset:x} fall outside the container ({container_size} bytes)"
    )]
    CorruptAllocationEntry {
        offset: u64,
        length: u64,
        container_size: u64,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<ReadError> for io::Error {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io(e) => e,
            ReadError::AddressOutOfRange { .. } | ReadError::LengthExceedsImage { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            ReadError::CorruptAllocationEntry { .. } => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
        }
    }
}
