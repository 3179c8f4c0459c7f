//! This module contains functionality for reading VirtualBox VDI images.
//!
//! A VDI image maps fixed-size blocks through a single block map of 32-bit
//! block numbers, relative to the start of the data area.
//!
//! See also: https://forums.virtualbox.org/viewtopic.php?t=8046

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::OpenError;
use crate::geometry::ImageGeometry;
use crate::image::SparseImage;
use crate::schema::{EntryScale, EntryWidth, FlatSchema, TableSchema};
use crate::source::{le_u32, le_u64, read_prefix, ByteSource, FileSource};

const VDI_SIGNATURE: u32 = 0xBEDA_107F;
const VDI_VERSION_1_1: u32 = 0x0001_0001;
const VDI_HEADER_SIZE: usize = 512;
const VDI_SECTOR_SIZE: u32 = 512;
const VDI_TEXT_SIZE: usize = 0x40;

const VDI_TYPE_DYNAMIC: u32 = 1;
const VDI_TYPE_STATIC: u32 = 2;
const VDI_TYPE_UNDO: u32 = 3;
const VDI_TYPE_DIFF: u32 = 4;

const VDI_BLOCK_FREE: u64 = 0xFFFF_FFFF;
const VDI_BLOCK_ZERO: u64 = 0xFFFF_FFFE;

const VDI_MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VdiImageType {
    Dynamic,
    Fixed,
}

/// The fields of a version 1.1 VDI header needed to read the image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VdiHeader {
    /// Free-form text preceding the signature.
    pub text: String,
    pub version: u32,
    pub image_type: VdiImageType,
    pub flags: u32,
    /// Offset of the block map in bytes.
    pub offset_blocks: u32,
    /// Offset of the first data block in bytes.
    pub offset_data: u32,
    /// Legacy geometry sector size, 0 when unset.
    pub legacy_sector_size: u32,
    pub disk_size: u64,
    pub block_size: u32,
    pub block_extra: u32,
    pub blocks_in_image: u32,
    pub blocks_allocated: u32,
}

impl VdiHeader {
    /// Parses the 512-byte header at the start of the file.
    ///
    /// # Errors
    ///
    /// Errors if the signature is missing, the image is a differencing or undo
    /// image, or the block geometry does not add up.
    pub fn parse(raw: &[u8]) -> Result<Self, OpenError> {
        if raw.len() < VDI_HEADER_SIZE {
            return Err(OpenError::TruncatedHeader("VDI header shorter than 512 bytes"));
        }
        if le_u32(raw, 0x40) != VDI_SIGNATURE {
            return Err(OpenError::NotRecognized("VDI"));
        }

        let version = le_u32(raw, 0x44);
        if version != VDI_VERSION_1_1 {
            return Err(OpenError::UnsupportedFeature(format!(
                "VDI version {}.{}",
                version >> 16,
                version & 0xFFFF
            )));
        }
        let image_type = match le_u32(raw, 0x4C) {
            VDI_TYPE_DYNAMIC => VdiImageType::Dynamic,
            VDI_TYPE_STATIC => VdiImageType::Fixed,
            VDI_TYPE_UNDO => {
                return Err(OpenError::UnsupportedFeature("VDI undo images".to_string()))
            }
            VDI_TYPE_DIFF => {
                return Err(OpenError::UnsupportedFeature(
                    "VDI differencing images".to_string(),
                ))
            }
            other => {
                return Err(OpenError::UnsupportedFeature(format!(
                    "VDI image type {}",
                    other
                )))
            }
        };

        let text_end = raw[..VDI_TEXT_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VDI_TEXT_SIZE);
        let header = Self {
            text: String::from_utf8_lossy(&raw[..text_end]).trim_end().to_string(),
            version,
            image_type,
            flags: le_u32(raw, 0x50),
            offset_blocks: le_u32(raw, 0x154),
            offset_data: le_u32(raw, 0x158),
            legacy_sector_size: le_u32(raw, 0x168),
            disk_size: le_u64(raw, 0x170),
            block_size: le_u32(raw, 0x178),
            block_extra: le_u32(raw, 0x17C),
            blocks_in_image: le_u32(raw, 0x180),
            blocks_allocated: le_u32(raw, 0x184),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), OpenError> {
        if self.legacy_sector_size != 0 && self.legacy_sector_size != VDI_SECTOR_SIZE {
            return Err(OpenError::UnsupportedFeature(format!(
                "VDI sector size {}",
                self.legacy_sector_size
            )));
        }
        if self.block_extra != 0 {
            return Err(OpenError::UnsupportedFeature(format!(
                "VDI per-block extra data ({} bytes)",
                self.block_extra
            )));
        }
        if !self.block_size.is_power_of_two()
            || !(VDI_SECTOR_SIZE..=VDI_MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(OpenError::InconsistentGeometry(format!(
                "invalid VDI block size {}",
                self.block_size
            )));
        }
        if self.offset_blocks % VDI_SECTOR_SIZE != 0 || self.offset_data % VDI_SECTOR_SIZE != 0 {
            return Err(OpenError::InconsistentGeometry(format!(
                "VDI block map (0x{:x}) or data (0x{:x}) offset is not sector aligned",
                self.offset_blocks, self.offset_data
            )));
        }
        let capacity = u64::from(self.blocks_in_image) * u64::from(self.block_size);
        if self.disk_size > capacity {
            return Err(OpenError::InconsistentGeometry(format!(
                "VDI disk size {} exceeds the {} bytes its block map covers",
                self.disk_size, capacity
            )));
        }
        if self.blocks_allocated > self.blocks_in_image {
            return Err(OpenError::InconsistentGeometry(format!(
                "VDI claims {} allocated blocks out of {}",
                self.blocks_allocated, self.blocks_in_image
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<(ImageGeometry, TableSchema), OpenError> {
        if self.disk_size % u64::from(VDI_SECTOR_SIZE) != 0 {
            warn!(
                "VDI disk size {} is not sector aligned, the tail is ignored",
                self.disk_size
            );
        }
        let geometry = ImageGeometry::new(
            VDI_SECTOR_SIZE,
            self.disk_size / u64::from(VDI_SECTOR_SIZE),
            u64::from(self.block_size),
            u64::from(self.offset_data),
        )?;
        let schema = TableSchema::Flat(FlatSchema {
            table_offset: u64::from(self.offset_blocks),
            entry_count: u64::from(self.blocks_in_image),
            entry_width: EntryWidth::U32,
            scale: EntryScale::Clusters,
            unallocated: vec![VDI_BLOCK_FREE, VDI_BLOCK_ZERO],
        });
        Ok((geometry, schema))
    }
}

/// An opened VDI image.
pub struct Vdi {
    header: VdiHeader,
    image: SparseImage,
}

impl Vdi {
    pub const NAME: &'static str = "vdi";
    pub const DESCRIPTION: &'static str = "VirtualBox Disk Image";

    /// Returns `true` if the VDI signature sits right after the header text.
    pub fn identify(source: &dyn ByteSource) -> bool {
        matches!(
            read_prefix(source, 0x40, 4),
            Ok(Some(raw)) if le_u32(&raw, 0) == VDI_SIGNATURE
        )
    }

    pub fn open<S: ByteSource + 'static>(source: S, config: CacheConfig) -> Result<Self, OpenError> {
        let raw = read_prefix(&source, 0, VDI_HEADER_SIZE)?
            .ok_or(OpenError::TruncatedHeader("file shorter than the VDI header"))?;
        let header = VdiHeader::parse(&raw)?;
        debug!("Parsed VDI header: {:?}", header);
        let (geometry, schema) = header.layout()?;
        let image = SparseImage::open(geometry, schema, source, config)?;
        Ok(Self { header, image })
    }

    /// Opens the VDI image stored at `file_path`.
    pub fn new(file_path: &str) -> Result<Self, OpenError> {
        Self::open(FileSource::open(file_path)?, CacheConfig::default())
    }

    pub fn header(&self) -> &VdiHeader {
        &self.header
    }

    pub fn image(&self) -> &SparseImage {
        &self.image
    }

    pub fn into_image(self) -> SparseImage {
        self.image
    }

    pub fn print_info(&self) {
        info!("VDI Image Information:");
        info!("  Description: {}", self.header.text);
        info!(
            "  Version: {}.{}",
            self.header.version >> 16,
            self.header.version & 0xFFFF
        );
        info!("  Image Type: {:?}", self.header.image_type);
        info!("  Disk Size: {} bytes", self.header.disk_size);
        info!("  Block Size: {} bytes", self.header.block_size);
        info!(
            "  Blocks: {} allocated of {}",
            self.header.blocks_allocated, self.header.blocks_in_image
        );
        info!("  Block Map Offset: 0x{:x}", self.header.offset_blocks);
        info!("  Data Offset: 0x{:x}", self.header.offset_data);
    }
}
