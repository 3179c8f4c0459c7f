//! This module contains functionality for reading PartClone images.
//!
//! A PartClone v1 image stores a header, a bytemap with one byte per
//! filesystem block, the `BiTmAgIc` marker and then only the used blocks, each
//! followed by a 4-byte checksum. Unused blocks read as zeros.
//!
//! See also: https://github.com/Thomas-Tsai/partclone

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::OpenError;
use crate::geometry::ImageGeometry;
use crate::image::SparseImage;
use crate::schema::{BytemapSchema, TableSchema};
use crate::source::{le_u32, le_u64, read_prefix, ByteSource, FileSource};

const PARTCLONE_MAGIC: &[u8] = b"partclone-image";
const PARTCLONE_BITMAP_MAGIC: &[u8; 8] = b"BiTmAgIc";
const PARTCLONE_VERSION_1: &[u8; 4] = b"0001";
const PARTCLONE_VERSION_2: &[u8; 4] = b"0002";
const PARTCLONE_HEADER_SIZE: usize = 4160;
const PARTCLONE_CRC_SIZE: u64 = 4;

const FS_FIELD: std::ops::Range<usize> = 15..30;
const VERSION_FIELD: std::ops::Range<usize> = 30..34;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartCloneHeader {
    /// Filesystem the image was taken from, e.g. `EXTFS`.
    pub filesystem: String,
    pub version: String,
    pub block_size: u32,
    pub device_size: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
}

impl PartCloneHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, OpenError> {
        if raw.len() < PARTCLONE_HEADER_SIZE {
            return Err(OpenError::TruncatedHeader(
                "PartClone header shorter than 4160 bytes",
            ));
        }
        if !raw.starts_with(PARTCLONE_MAGIC) {
            return Err(OpenError::NotRecognized("PartClone"));
        }
        match &raw[VERSION_FIELD] {
            v if v == PARTCLONE_VERSION_1 => {}
            v if v == PARTCLONE_VERSION_2 => {
                return Err(OpenError::UnsupportedFeature(
                    "PartClone v2 images".to_string(),
                ))
            }
            v => {
                return Err(OpenError::UnsupportedFeature(format!(
                    "PartClone version {:?}",
                    String::from_utf8_lossy(v)
                )))
            }
        }

        let header = Self {
            filesystem: c_string(&raw[FS_FIELD]),
            version: c_string(&raw[VERSION_FIELD]),
            block_size: le_u32(raw, 36),
            device_size: le_u64(raw, 40),
            total_blocks: le_u64(raw, 48),
            used_blocks: le_u64(raw, 56),
        };
        if header.block_size == 0 {
            return Err(OpenError::InconsistentGeometry(
                "PartClone block size is 0".to_string(),
            ));
        }
        if header.used_blocks > header.total_blocks {
            return Err(OpenError::InconsistentGeometry(format!(
                "PartClone claims {} used blocks out of {}",
                header.used_blocks, header.total_blocks
            )));
        }
        if header.data_offset().is_none() {
            return Err(header.block_count_overflow());
        }
        Ok(header)
    }

    /// Container offset of the bitmap magic that closes the bytemap.
    #[inline]
    pub fn bitmap_magic_offset(&self) -> Option<u64> {
        (PARTCLONE_HEADER_SIZE as u64).checked_add(self.total_blocks)
    }

    /// Container offset of the first stored block.
    #[inline]
    pub fn data_offset(&self) -> Option<u64> {
        self.bitmap_magic_offset()?
            .checked_add(PARTCLONE_BITMAP_MAGIC.len() as u64)
    }

    fn block_count_overflow(&self) -> OpenError {
        OpenError::InconsistentGeometry(format!(
            "PartClone bytemap of {} blocks does not fit in a 64-bit file",
            self.total_blocks
        ))
    }

    /// Every block is one logical sector.
    pub fn layout(&self) -> Result<(ImageGeometry, TableSchema), OpenError> {
        let geometry = ImageGeometry::new(
            self.block_size,
            self.total_blocks,
            u64::from(self.block_size),
            self.data_offset()
                .ok_or_else(|| self.block_count_overflow())?,
        )?;
        let schema = TableSchema::Bytemap(BytemapSchema {
            map_offset: PARTCLONE_HEADER_SIZE as u64,
            block_count: self.total_blocks,
            trailer_size: PARTCLONE_CRC_SIZE,
        });
        Ok((geometry, schema))
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

/// An opened PartClone image.
pub struct PartClone {
    header: PartCloneHeader,
    image: SparseImage,
}

impl PartClone {
    pub const NAME: &'static str = "partclone";
    pub const DESCRIPTION: &'static str = "PartClone filesystem image";

    pub fn identify(source: &dyn ByteSource) -> bool {
        matches!(
            read_prefix(source, 0, PARTCLONE_MAGIC.len()),
            Ok(Some(magic)) if magic == PARTCLONE_MAGIC
        )
    }

    pub fn open<S: ByteSource + 'static>(source: S, config: CacheConfig) -> Result<Self, OpenError> {
        let raw = read_prefix(&source, 0, PARTCLONE_HEADER_SIZE)?
            .ok_or(OpenError::TruncatedHeader("file shorter than the PartClone header"))?;
        let header = PartCloneHeader::parse(&raw)?;
        debug!("Parsed PartClone header: {:?}", header);

        let magic_offset = header
            .bitmap_magic_offset()
            .ok_or_else(|| header.block_count_overflow())?;
        match read_prefix(&source, magic_offset, PARTCLONE_BITMAP_MAGIC.len())? {
            Some(magic) if magic == PARTCLONE_BITMAP_MAGIC => {}
            Some(_) => {
                return Err(OpenError::InconsistentGeometry(
                    "PartClone bitmap magic not found after the bytemap".to_string(),
                ))
            }
            None => {
                return Err(OpenError::TruncatedTable {
                    offset: PARTCLONE_HEADER_SIZE as u64,
                    expected: header
                        .total_blocks
                        .saturating_add(PARTCLONE_BITMAP_MAGIC.len() as u64),
                    available: source.size().saturating_sub(PARTCLONE_HEADER_SIZE as u64),
                })
            }
        }

        let (geometry, schema) = header.layout()?;
        let image = SparseImage::open(geometry, schema, source, config)?;
        if let Some(index) = image.translator().extent_index() {
            if index.used_blocks() != header.used_blocks {
                warn!(
                    "PartClone header claims {} used blocks but the bytemap marks {}",
                    header.used_blocks,
                    index.used_blocks()
                );
            }
        }
        Ok(Self { header, image })
    }

    /// Opens the PartClone image stored at `file_path`.
    pub fn new(file_path: &str) -> Result<Self, OpenError> {
        Self::open(FileSource::open(file_path)?, CacheConfig::default())
    }

    pub fn header(&self) -> &PartCloneHeader {
        &self.header
    }

    pub fn image(&self) -> &SparseImage {
        &self.image
    }

    pub fn into_image(self) -> SparseImage {
        self.image
    }

    pub fn print_info(&self) {
        info!("PartClone Image Information:");
        info!("  Filesystem: {}", self.header.filesystem);
        info!("  Version: {}", self.header.version);
        info!("  Block Size: {} bytes", self.header.block_size);
        info!("  Device Size: {} bytes", self.header.device_size);
        info!(
            "  Blocks: {} used of {}",
            self.header.used_blocks, self.header.total_blocks
        );
        if let Some(index) = self.image.translator().extent_index() {
            info!("  Extents: {}", index.extents().len());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ReadError;
    use crate::source::MemSource;

    const BLOCK: usize = 512;
    const USAGE: [u8; 9] = [1, 1, 0, 0, 1, 1, 1, 0, 1];

    /// Nine 512-byte blocks, used per `USAGE`. Stored block `n` is filled
    /// with `n + 1` and followed by a 4-byte checksum of `0xEE`.
    pub(crate) fn build_partclone(version: &[u8; 4], used_blocks: u64) -> Vec<u8> {
        let mut image = vec![0u8; PARTCLONE_HEADER_SIZE];
        image[..15].copy_from_slice(PARTCLONE_MAGIC);
        image[15..20].copy_from_slice(b"EXTFS");
        image[30..34].copy_from_slice(version);
        image[36..40].copy_from_slice(&(BLOCK as u32).to_le_bytes());
        image[40..48].copy_from_slice(&((USAGE.len() * BLOCK) as u64).to_le_bytes());
        image[48..56].copy_from_slice(&(USAGE.len() as u64).to_le_bytes());
        image[56..64].copy_from_slice(&used_blocks.to_le_bytes());

        image.extend_from_slice(&USAGE);
        image.extend_from_slice(PARTCLONE_BITMAP_MAGIC);
        let stored = USAGE.iter().filter(|&&u| u != 0).count();
        for n in 0..stored {
            image.extend(std::iter::repeat(n as u8 + 1).take(BLOCK));
            image.extend_from_slice(&[0xEE; 4]);
        }
        image
    }

    #[test]
    fn identifies_by_magic() {
        assert!(PartClone::identify(&MemSource::new(build_partclone(PARTCLONE_VERSION_1, 6))));
        assert!(!PartClone::identify(&MemSource::new(b"partclone".to_vec())));
    }

    #[test]
    fn used_blocks_are_read_compacted() {
        let partclone = PartClone::open(
            MemSource::new(build_partclone(PARTCLONE_VERSION_1, 6)),
            CacheConfig::default(),
        )
        .unwrap();
        assert_eq!(partclone.header().filesystem, "EXTFS");
        let image = partclone.image();
        assert_eq!(image.total_sectors(), 9);
        assert_eq!(image.sector_size(), 512);

        let expected: [u8; 9] = [1, 2, 0, 0, 3, 4, 5, 0, 6];
        for (block, fill) in expected.iter().enumerate() {
            assert_eq!(image.read_sector(block as u64).unwrap(), vec![*fill; BLOCK]);
        }
        assert!(matches!(
            image.read_sector(9),
            Err(ReadError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn checksums_never_leak_into_reads() {
        let partclone = PartClone::open(
            MemSource::new(build_partclone(PARTCLONE_VERSION_1, 6)),
            CacheConfig::default(),
        )
        .unwrap();
        let all = partclone.image().read_sectors(0, 9).unwrap();
        assert!(!all.contains(&0xEE));
    }

    #[test]
    fn used_block_mismatch_is_only_a_warning() {
        assert!(PartClone::open(
            MemSource::new(build_partclone(PARTCLONE_VERSION_1, 5)),
            CacheConfig::default()
        )
        .is_ok());
    }

    #[test]
    fn version_two_is_rejected() {
        assert!(matches!(
            PartClone::open(
                MemSource::new(build_partclone(PARTCLONE_VERSION_2, 6)),
                CacheConfig::default()
            ),
            Err(OpenError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn missing_bitmap_magic_is_rejected() {
        let mut raw = build_partclone(PARTCLONE_VERSION_1, 6);
        raw[PARTCLONE_HEADER_SIZE + USAGE.len()] = b'X';
        assert!(matches!(
            PartClone::open(MemSource::new(raw), CacheConfig::default()),
            Err(OpenError::InconsistentGeometry(_))
        ));

        let raw = build_partclone(PARTCLONE_VERSION_1, 6);
        assert!(matches!(
            PartClone::open(
                MemSource::new(raw[..PARTCLONE_HEADER_SIZE + 4].to_vec()),
                CacheConfig::default()
            ),
            Err(OpenError::TruncatedTable { .. })
        ));
    }

    #[test]
    fn oversized_block_counts_are_rejected() {
        let mut raw = build_partclone(PARTCLONE_VERSION_1, 6);
        raw[48..56].copy_from_slice(&(u64::MAX - 10).to_le_bytes());
        assert!(matches!(
            PartCloneHeader::parse(&raw),
            Err(OpenError::InconsistentGeometry(_))
        ));
        assert!(matches!(
            PartClone::open(MemSource::new(raw), CacheConfig::default()),
            Err(OpenError::InconsistentGeometry(_))
        ));

        // Addressable, but far larger than the file.
        let mut raw = build_partclone(PARTCLONE_VERSION_1, 6);
        raw[48..56].copy_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(
            PartClone::open(MemSource::new(raw), CacheConfig::default()),
            Err(OpenError::TruncatedTable { .. })
        ));
    }
}
