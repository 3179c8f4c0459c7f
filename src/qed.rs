//! This module contains functionality for reading QED (QEMU Enhanced Disk) images.
//!
//! QED stores data in clusters reached through a two-level table: the L1 table
//! points to L2 tables, which point to data clusters. Images depending on a
//! backing file are not supported.
//!
//! See also: https://github.com/qemu/qemu/blob/master/docs/interop/qed_spec.txt

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::OpenError;
use crate::geometry::ImageGeometry;
use crate::image::SparseImage;
use crate::schema::{EntryWidth, TableSchema, TwoLevelSchema};
use crate::source::{le_u32, le_u64, read_prefix, ByteSource, FileSource};

const QED_MAGIC: u32 = 0x0044_4551; // "QED\0"
const QED_HEADER_SIZE: usize = 64;
const QED_SECTOR_SIZE: u32 = 512;

// Feature bits of the `features` header field.
const QED_F_BACKING_FILE: u64 = 0x01;
const QED_F_NEED_CHECK: u64 = 0x02;
const QED_F_BACKING_FORMAT_NO_PROBE: u64 = 0x04;
const QED_FEATURE_MASK: u64 = QED_F_BACKING_FILE | QED_F_NEED_CHECK | QED_F_BACKING_FORMAT_NO_PROBE;

const QED_MIN_CLUSTER_SIZE: u32 = 4 * 1024;
const QED_MAX_CLUSTER_SIZE: u32 = 64 * 1024 * 1024;
const QED_MIN_TABLE_SIZE: u32 = 1;
const QED_MAX_TABLE_SIZE: u32 = 16;

/// L2 entry marking a cluster that reads as zeros.
const QED_ZERO_CLUSTER: u64 = 1;

/// The QED file header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QedHeader {
    /// Cluster size in bytes, a power of two.
    pub cluster_size: u32,
    /// Size of every L1 and L2 table, in clusters.
    pub table_size: u32,
    /// Header size in clusters.
    pub header_size: u32,
    /// Features that must be understood to read the image.
    pub features: u64,
    /// Features that may be ignored.
    pub compat_features: u64,
    /// Features cleared by implementations that do not understand them.
    pub autoclear_features: u64,
    /// Offset of the L1 table in bytes.
    pub l1_table_offset: u64,
    /// Logical disk size in bytes.
    pub image_size: u64,
    pub backing_filename_offset: u32,
    pub backing_filename_size: u32,
}

impl QedHeader {
    /// Parses the 64-byte little-endian header at the start of the file.
    ///
    /// # Errors
    ///
    /// Errors if the buffer is too short, the magic is absent, the image needs
    /// a backing file or uses unknown features, or the sizes are out of range.
    pub fn parse(raw: &[u8]) -> Result<Self, OpenError> {
        if raw.len() < QED_HEADER_SIZE {
            return Err(OpenError::TruncatedHeader("QED header shorter than 64 bytes"));
        }
        if le_u32(raw, 0) != QED_MAGIC {
            return Err(OpenError::NotRecognized("QED"));
        }
        let header = Self {
            cluster_size: le_u32(raw, 4),
            table_size: le_u32(raw, 8),
            header_size: le_u32(raw, 12),
            features: le_u64(raw, 16),
            compat_features: le_u64(raw, 24),
            autoclear_features: le_u64(raw, 32),
            l1_table_offset: le_u64(raw, 40),
            image_size: le_u64(raw, 48),
            backing_filename_offset: le_u32(raw, 56),
            backing_filename_size: le_u32(raw, 60),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), OpenError> {
        if self.features & !QED_FEATURE_MASK != 0 {
            return Err(OpenError::UnsupportedFeature(format!(
                "unknown QED feature bits 0x{:x}",
                self.features & !QED_FEATURE_MASK
            )));
        }
        if self.features & QED_F_BACKING_FILE != 0 {
            return Err(OpenError::UnsupportedFeature(
                "QED images with a backing file".to_string(),
            ));
        }
        if self.features & QED_F_NEED_CHECK != 0 {
            warn!("QED image was not cleanly closed, tables may be inconsistent");
        }

        if !self.cluster_size.is_power_of_two()
            || !(QED_MIN_CLUSTER_SIZE..=QED_MAX_CLUSTER_SIZE).contains(&self.cluster_size)
        {
            return Err(OpenError::InconsistentGeometry(format!(
                "invalid QED cluster size {}",
                self.cluster_size
            )));
        }
        if !self.table_size.is_power_of_two()
            || !(QED_MIN_TABLE_SIZE..=QED_MAX_TABLE_SIZE).contains(&self.table_size)
        {
            return Err(OpenError::InconsistentGeometry(format!(
                "invalid QED table size {}",
                self.table_size
            )));
        }
        if self.image_size % u64::from(QED_SECTOR_SIZE) != 0 {
            return Err(OpenError::InconsistentGeometry(format!(
                "QED image size {} is not a multiple of {}",
                self.image_size, QED_SECTOR_SIZE
            )));
        }
        if self.image_size > self.max_image_size() {
            return Err(OpenError::InconsistentGeometry(format!(
                "QED image size {} exceeds the {} bytes its tables can address",
                self.image_size,
                self.max_image_size()
            )));
        }
        if self.l1_table_offset == 0 || self.l1_table_offset % u64::from(self.cluster_size) != 0 {
            return Err(OpenError::InconsistentGeometry(format!(
                "invalid QED L1 table offset 0x{:x}",
                self.l1_table_offset
            )));
        }
        Ok(())
    }

    /// Entries held by one L1 or L2 table.
    #[inline]
    pub fn table_entries(&self) -> u64 {
        u64::from(self.table_size) * u64::from(self.cluster_size) / 8
    }

    /// Largest logical size the two table levels can address.
    pub fn max_image_size(&self) -> u64 {
        let entries = self.table_entries();
        entries
            .saturating_mul(entries)
            .saturating_mul(u64::from(self.cluster_size))
    }

    /// Geometry and table schema of the image described by this header.
    pub fn layout(&self) -> Result<(ImageGeometry, TableSchema), OpenError> {
        let geometry = ImageGeometry::new(
            QED_SECTOR_SIZE,
            self.image_size / u64::from(QED_SECTOR_SIZE),
            u64::from(self.cluster_size),
            0,
        )?;
        let schema = TableSchema::TwoLevel(TwoLevelSchema {
            l1_offset: self.l1_table_offset,
            entries_per_table: self.table_entries(),
            entry_width: EntryWidth::U64,
            unallocated: vec![0, QED_ZERO_CLUSTER],
        });
        Ok((geometry, schema))
    }
}

/// An opened QED image.
pub struct Qed {
    header: QedHeader,
    image: SparseImage,
}

impl Qed {
    pub const NAME: &'static str = "qed";
    pub const DESCRIPTION: &'static str = "QEMU Enhanced Disk";

    /// Returns `true` if `source` starts with the QED magic.
    pub fn identify(source: &dyn ByteSource) -> bool {
        matches!(read_prefix(source, 0, 4), Ok(Some(magic)) if le_u32(&magic, 0) == QED_MAGIC)
    }

    /// Opens a QED image from any byte source.
    pub fn open<S: ByteSource + 'static>(source: S, config: CacheConfig) -> Result<Self, OpenError> {
        let raw = read_prefix(&source, 0, QED_HEADER_SIZE)?
            .ok_or(OpenError::TruncatedHeader("file shorter than the QED header"))?;
        let header = QedHeader::parse(&raw)?;
        debug!("Parsed QED header: {:?}", header);
        let (geometry, schema) = header.layout()?;
        let image = SparseImage::open(geometry, schema, source, config)?;
        Ok(Self { header, image })
    }

    /// Opens the QED image stored at `file_path`.
    pub fn new(file_path: &str) -> Result<Self, OpenError> {
        Self::open(FileSource::open(file_path)?, CacheConfig::default())
    }

    pub fn header(&self) -> &QedHeader {
        &self.header
    }

    pub fn image(&self) -> &SparseImage {
        &self.image
    }

    pub fn into_image(self) -> SparseImage {
        self.image
    }

    /// Outputs a human-readable summary to the current `log` subscriber.
    pub fn print_info(&self) {
        info!("QED Image Information:");
        info!("  Image Size: {} bytes", self.header.image_size);
        info!("  Cluster Size: {} bytes", self.header.cluster_size);
        info!(
            "  Table Size: {} cluster(s) ({} entries)",
            self.header.table_size,
            self.header.table_entries()
        );
        info!("  L1 Table Offset: 0x{:x}", self.header.l1_table_offset);
        info!("  Features: 0x{:x}", self.header.features);
        info!("  Compatible Features: 0x{:x}", self.header.compat_features);
    }
}
