//! This module contains functionality for reading Parallels disk images (.hdd).
//!
//! The 64-byte header is followed directly by the block allocation table.
//! Legacy images ("WithoutFreeSpace") store BAT entries as sector numbers while
//! extended images ("WithouFreSpacExt") store them as cluster numbers.
//!
//! See also: https://github.com/qemu/qemu/blob/master/docs/interop/parallels.txt

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::OpenError;
use crate::geometry::ImageGeometry;
use crate::image::SparseImage;
use crate::schema::{EntryScale, EntryWidth, FlatSchema, TableSchema};
use crate::source::{le_u32, le_u64, read_prefix, ByteSource, FileSource};

const PARALLELS_MAGIC: &[u8; 16] = b"WithoutFreeSpace";
const PARALLELS_MAGIC_EXT: &[u8; 16] = b"WithouFreSpacExt";
const PARALLELS_VERSION: u32 = 2;
const PARALLELS_INUSE_MAGIC: u32 = 0x746F_6E59;
const PARALLELS_HEADER_SIZE: usize = 64;
const PARALLELS_SECTOR_SIZE: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelsVariant {
    /// BAT entries are sector offsets.
    Legacy,
    /// BAT entries are cluster offsets.
    Extended,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParallelsHeader {
    pub variant: ParallelsVariant,
    pub version: u32,
    pub heads: u32,
    pub cylinders: u32,
    /// Sectors per cluster.
    pub tracks: u32,
    pub bat_entries: u32,
    /// Logical size in sectors, already masked to 32 bits for legacy images.
    pub nb_sectors: u64,
    pub inuse: u32,
    /// First data sector.
    pub data_off: u32,
    pub flags: u32,
    /// Sector offset of the format extension cluster, 0 when absent.
    pub ext_off: u64,
}

impl ParallelsHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, OpenError> {
        if raw.len() < PARALLELS_HEADER_SIZE {
            return Err(OpenError::TruncatedHeader(
                "Parallels header shorter than 64 bytes",
            ));
        }
        let variant = match &raw[..16] {
            m if m == PARALLELS_MAGIC => ParallelsVariant::Legacy,
            m if m == PARALLELS_MAGIC_EXT => ParallelsVariant::Extended,
            _ => return Err(OpenError::NotRecognized("Parallels")),
        };

        let mut nb_sectors = le_u64(raw, 36);
        if variant == ParallelsVariant::Legacy {
            nb_sectors &= 0xFFFF_FFFF;
        }
        let header = Self {
            variant,
            version: le_u32(raw, 16),
            heads: le_u32(raw, 20),
            cylinders: le_u32(raw, 24),
            tracks: le_u32(raw, 28),
            bat_entries: le_u32(raw, 32),
            nb_sectors,
            inuse: le_u32(raw, 44),
            data_off: le_u32(raw, 48),
            flags: le_u32(raw, 52),
            ext_off: le_u64(raw, 56),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), OpenError> {
        if self.version != PARALLELS_VERSION {
            return Err(OpenError::UnsupportedFeature(format!(
                "Parallels version {}",
                self.version
            )));
        }
        if self.tracks == 0 || !self.tracks.is_power_of_two() {
            return Err(OpenError::InconsistentGeometry(format!(
                "invalid Parallels cluster size of {} sectors",
                self.tracks
            )));
        }
        let needed = self.nb_sectors.div_ceil(u64::from(self.tracks));
        if u64::from(self.bat_entries) < needed {
            return Err(OpenError::InconsistentGeometry(format!(
                "Parallels BAT has {} entries but {} sectors need {}",
                self.bat_entries, self.nb_sectors, needed
            )));
        }
        if self.inuse == PARALLELS_INUSE_MAGIC {
            warn!("Parallels image is marked in use, it was not closed cleanly");
        }
        Ok(())
    }

    /// Cluster size in bytes.
    #[inline]
    pub fn cluster_size(&self) -> u64 {
        u64::from(self.tracks) * u64::from(PARALLELS_SECTOR_SIZE)
    }

    pub fn layout(&self) -> Result<(ImageGeometry, TableSchema), OpenError> {
        let geometry =
            ImageGeometry::new(PARALLELS_SECTOR_SIZE, self.nb_sectors, self.cluster_size(), 0)?;
        let scale = match self.variant {
            ParallelsVariant::Legacy => EntryScale::Sectors,
            ParallelsVariant::Extended => EntryScale::Clusters,
        };
        let schema = TableSchema::Flat(FlatSchema {
            table_offset: PARALLELS_HEADER_SIZE as u64,
            entry_count: u64::from(self.bat_entries),
            entry_width: EntryWidth::U32,
            scale,
            unallocated: vec![0],
        });
        Ok((geometry, schema))
    }
}

/// An opened Parallels image.
pub struct Parallels {
    header: ParallelsHeader,
    image: SparseImage,
}

impl Parallels {
    pub const NAME: &'static str = "parallels";
    pub const DESCRIPTION: &'static str = "Parallels Hard Disk";

    /// Returns `true` if `source` starts with either Parallels magic.
    pub fn identify(source: &dyn ByteSource) -> bool {
        match read_prefix(source, 0, 16) {
            Ok(Some(magic)) => magic == PARALLELS_MAGIC || magic == PARALLELS_MAGIC_EXT,
            _ => false,
        }
    }

    pub fn open<S: ByteSource + 'static>(source: S, config: CacheConfig) -> Result<Self, OpenError> {
        let raw = read_prefix(&source, 0, PARALLELS_HEADER_SIZE)?
            .ok_or(OpenError::TruncatedHeader("file shorter than the Parallels header"))?;
        let header = ParallelsHeader::parse(&raw)?;
        debug!("Parsed Parallels header: {:?}", header);
        let (geometry, schema) = header.layout()?;
        let image = SparseImage::open(geometry, schema, source, config)?;
        Ok(Self { header, image })
    }

    /// Opens the Parallels image stored at `file_path`.
    pub fn new(file_path: &str) -> Result<Self, OpenError> {
        Self::open(FileSource::open(file_path)?, CacheConfig::default())
    }

    pub fn header(&self) -> &ParallelsHeader {
        &self.header
    }

    pub fn image(&self) -> &SparseImage {
        &self.image
    }

    pub fn into_image(self) -> SparseImage {
        self.image
    }

    pub fn print_info(&self) {
        info!("Parallels Image Information:");
        info!("  Variant: {:?}", self.header.variant);
        info!(
            "  Geometry (C/H/S): {}/{}/{}",
            self.header.cylinders, self.header.heads, self.header.tracks
        );
        info!("  Sectors: {}", self.header.nb_sectors);
        info!("  Cluster Size: {} bytes", self.header.cluster_size());
        info!("  BAT Entries: {}", self.header.bat_entries);
        info!("  Data Offset: sector {}", self.header.data_off);
        info!(
            "  Clean Shutdown: {}",
            self.header.inuse != PARALLELS_INUSE_MAGIC
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::MemSource;

    const TRACKS: u32 = 8;
    const CLUSTER: usize = 4096;

    /// Four clusters of 4 KiB. Cluster 1 holds `0x5A` and is stored at byte
    /// 8192; every other cluster is unallocated.
    pub(crate) fn build_parallels(magic: &[u8; 16]) -> Vec<u8> {
        let mut image = vec![0u8; 3 * CLUSTER];
        image[..16].copy_from_slice(magic);
        image[16..20].copy_from_slice(&PARALLELS_VERSION.to_le_bytes());
        image[20..24].copy_from_slice(&16u32.to_le_bytes());
        image[24..28].copy_from_slice(&1u32.to_le_bytes());
        image[28..32].copy_from_slice(&TRACKS.to_le_bytes());
        image[32..36].copy_from_slice(&4u32.to_le_bytes());
        image[36..44].copy_from_slice(&(4 * u64::from(TRACKS)).to_le_bytes());
        image[48..52].copy_from_slice(&TRACKS.to_le_bytes());

        let entry: u32 = if magic == PARALLELS_MAGIC {
            (2 * CLUSTER / 512) as u32
        } else {
            2
        };
        image[64 + 4..64 + 8].copy_from_slice(&entry.to_le_bytes());
        image[2 * CLUSTER..].fill(0x5A);
        image
    }

    #[test]
    fn identifies_both_magics() {
        assert!(Parallels::identify(&MemSource::new(build_parallels(PARALLELS_MAGIC))));
        assert!(Parallels::identify(&MemSource::new(build_parallels(PARALLELS_MAGIC_EXT))));
        assert!(!Parallels::identify(&MemSource::new(b"WithFreeSpace...".to_vec())));
    }

    #[test]
    fn legacy_entries_count_sectors_and_extended_entries_count_clusters() {
        for magic in [PARALLELS_MAGIC, PARALLELS_MAGIC_EXT] {
            let parallels =
                Parallels::open(MemSource::new(build_parallels(magic)), CacheConfig::default())
                    .unwrap();
            let image = parallels.image();
            assert_eq!(image.total_sectors(), 32);
            assert_eq!(image.read_sector(0).unwrap(), vec![0; 512]);
            assert_eq!(image.read_sector(8).unwrap(), vec![0x5A; 512]);
            assert_eq!(image.read_sector(15).unwrap(), vec![0x5A; 512]);
            assert_eq!(image.read_sector(16).unwrap(), vec![0; 512]);
        }
    }

    #[test]
    fn legacy_sector_count_uses_the_low_word() {
        let mut raw = build_parallels(PARALLELS_MAGIC);
        raw[36..44].copy_from_slice(&((1u64 << 32) | 32).to_le_bytes());
        let header = ParallelsHeader::parse(&raw).unwrap();
        assert_eq!(header.nb_sectors, 32);

        let mut raw = build_parallels(PARALLELS_MAGIC_EXT);
        raw[36..44].copy_from_slice(&((1u64 << 32) | 32).to_le_bytes());
        assert!(matches!(
            ParallelsHeader::parse(&raw),
            Err(OpenError::InconsistentGeometry(_))
        ));
    }

    #[test]
    fn dirty_images_still_open() {
        let mut raw = build_parallels(PARALLELS_MAGIC_EXT);
        raw[44..48].copy_from_slice(&PARALLELS_INUSE_MAGIC.to_le_bytes());
        assert!(Parallels::open(MemSource::new(raw), CacheConfig::default()).is_ok());
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let mut raw = build_parallels(PARALLELS_MAGIC_EXT);
        raw[28..32].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            ParallelsHeader::parse(&raw),
            Err(OpenError::InconsistentGeometry(_))
        ));

        let mut raw = build_parallels(PARALLELS_MAGIC_EXT);
        raw[16..20].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            ParallelsHeader::parse(&raw),
            Err(OpenError::UnsupportedFeature(_))
        ));
    }
}
