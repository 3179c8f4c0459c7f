//! The sector read path shared by every sparse container.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::{BoundedCache, CacheStats};
use crate::config::CacheConfig;
use crate::error::{OpenError, ReadError};
use crate::geometry::ImageGeometry;
use crate::schema::TableSchema;
use crate::source::ByteSource;
use crate::translate::{SectorTranslator, Translation};

/// Snapshot of every cache tier of an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImageCacheStats {
    pub sectors: CacheStats,
    pub clusters: CacheStats,
    /// Only present for two-level tables.
    pub tables: Option<CacheStats>,
}

/// An opened sparse container exposing fixed-size logical sectors.
///
/// Tables are immutable after [`SparseImage::open`] and every cache tier sits
/// behind its own lock, so an image can be shared between threads.
pub struct SparseImage {
    source: Box<dyn ByteSource>,
    geometry: ImageGeometry,
    schema: TableSchema,
    translator: SectorTranslator,
    sectors: Mutex<BoundedCache<Arc<Vec<u8>>>>,
    clusters: Mutex<BoundedCache<Arc<Vec<u8>>>>,
    zero_sector: Arc<Vec<u8>>,
    config: CacheConfig,
}

impl SparseImage {
    /// Loads the allocation tables described by `schema` from `source`.
    ///
    /// # Errors
    ///
    /// Any [`OpenError`] raised while validating the configuration or loading
    /// the tables.
    pub fn open<S: ByteSource + 'static>(
        geometry: ImageGeometry,
        schema: TableSchema,
        source: S,
        config: CacheConfig,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let translator = SectorTranslator::build(&source, geometry, &schema, &config)?;
        debug!(
            "Opened {} image: {} sectors of {} bytes, {} byte clusters, cache policy {:?}",
            schema.kind(),
            geometry.total_sectors,
            geometry.sector_size,
            geometry.cluster_size,
            config.policy
        );

        let sector_size = geometry.sector_size as usize;
        let cluster_size = usize::try_from(geometry.cluster_size).unwrap_or(usize::MAX);
        Ok(Self {
            source: Box::new(source),
            geometry,
            schema,
            translator,
            sectors: Mutex::new(BoundedCache::new(
                "sector",
                config.policy,
                config.sector_budget,
                sector_size,
            )),
            clusters: Mutex::new(BoundedCache::new(
                "cluster",
                config.policy,
                config.cluster_budget,
                cluster_size,
            )),
            zero_sector: Arc::new(vec![0u8; sector_size]),
            config,
        })
    }

    /// Reads one logical sector.
    ///
    /// # Errors
    ///
    /// [`ReadError::AddressOutOfRange`] for `sector >= total_sectors`,
    /// [`ReadError::CorruptAllocationEntry`] when the tables point outside the
    /// container, or an I/O error from the source.
    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>, ReadError> {
        if sector >= self.geometry.total_sectors {
            return Err(ReadError::AddressOutOfRange {
                sector,
                total_sectors: self.geometry.total_sectors,
            });
        }
        Ok(self.sector_data(sector)?.to_vec())
    }

    /// Reads `count` consecutive sectors starting at `sector`.
    ///
    /// # Errors
    ///
    /// [`ReadError::LengthExceedsImage`] when the range runs past the end of the
    /// image, plus anything [`SparseImage::read_sector`] can return.
    pub fn read_sectors(&self, sector: u64, count: u64) -> Result<Vec<u8>, ReadError> {
        let total_sectors = self.geometry.total_sectors;
        if count == 0 {
            return Ok(Vec::new());
        }
        if sector >= total_sectors {
            return Err(ReadError::AddressOutOfRange {
                sector,
                total_sectors,
            });
        }
        match sector.checked_add(count) {
            Some(end) if end <= total_sectors => {}
            _ => {
                return Err(ReadError::LengthExceedsImage {
                    sector,
                    count,
                    total_sectors,
                })
            }
        }

        let sector_size = self.geometry.sector_size as usize;
        let mut data = Vec::with_capacity(usize::try_from(count).unwrap_or(0) * sector_size);
        for current in sector..sector + count {
            let sector_bytes = self.sector_data(current)?;
            data.extend_from_slice(&sector_bytes);
        }
        Ok(data)
    }

    /// Where `sector` is stored, without reading any data.
    pub fn translate(&self, sector: u64) -> Result<Translation, ReadError> {
        if sector >= self.geometry.total_sectors {
            return Err(ReadError::AddressOutOfRange {
                sector,
                total_sectors: self.geometry.total_sectors,
            });
        }
        self.translator.translate(self.source.as_ref(), sector)
    }

    #[inline]
    pub fn total_sectors(&self) -> u64 {
        self.geometry.total_sectors
    }

    #[inline]
    pub fn sector_size(&self) -> u32 {
        self.geometry.sector_size
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn translator(&self) -> &SectorTranslator {
        &self.translator
    }

    /// Empties every cache tier. Subsequent reads go back to the container.
    pub fn clear_caches(&self) {
        self.sectors.lock().clear();
        self.clusters.lock().clear();
        self.translator.clear_cache();
    }

    pub fn cache_stats(&self) -> ImageCacheStats {
        ImageCacheStats {
            sectors: self.sectors.lock().stats(),
            clusters: self.clusters.lock().stats(),
            tables: self.translator.table_cache_stats(),
        }
    }

    /// Sector bytes through the sector and cluster tiers. `sector` is in range.
    fn sector_data(&self, sector: u64) -> Result<Arc<Vec<u8>>, ReadError> {
        if let Some(data) = self.sectors.lock().get(sector) {
            return Ok(data);
        }

        let data = match self.translator.translate(self.source.as_ref(), sector)? {
            Translation::Unallocated => Arc::clone(&self.zero_sector),
            Translation::Physical(location) => {
                let cluster = self.cluster_data(location.cluster_offset)?;
                // The translator only hands out sector-aligned offsets inside the cluster.
                let start = location.offset_within_cluster as usize;
                let end = start + self.geometry.sector_size as usize;
                Arc::new(cluster[start..end].to_vec())
            }
        };
        self.sectors.lock().put(sector, Arc::clone(&data));
        Ok(data)
    }

    fn cluster_data(&self, cluster_offset: u64) -> Result<Arc<Vec<u8>>, ReadError> {
        if let Some(cluster) = self.clusters.lock().get(cluster_offset) {
            return Ok(cluster);
        }

        trace!("Reading cluster at 0x{:x}", cluster_offset);
        let len = usize::try_from(self.translator.cluster_len()).map_err(|_| {
            ReadError::CorruptAllocationEntry {
                offset: cluster_offset,
                length: self.translator.cluster_len(),
                container_size: self.source.size(),
            }
        })?;
        let mut buffer = vec![0u8; len];
        self.source.read_exact_at(cluster_offset, &mut buffer)?;
        let cluster = Arc::new(buffer);
        self.clusters.lock().put(cluster_offset, Arc::clone(&cluster));
        Ok(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use crate::schema::{BytemapSchema, EntryScale, EntryWidth, FlatSchema, TwoLevelSchema};
    use crate::source::{testing::CountingSource, MemSource};

    /// Every byte of the container encodes its own offset, so any misplaced
    /// read shows up as a content mismatch.
    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn expected_at(offset: u64, len: usize) -> Vec<u8> {
        (offset..offset + len as u64)
            .map(|i| (i % 251) as u8)
            .collect()
    }

    /// 64 KiB clusters, 512-byte sectors, base 1024; table entry 3 holds 2.
    fn flat_image(config: CacheConfig) -> SparseImage {
        let cluster = 65536u64;
        let base = 1024u64;
        let mut data = patterned((base + 3 * cluster) as usize);
        let entries = [u32::MAX, u32::MAX, u32::MAX, 2];
        for (i, entry) in entries.iter().enumerate() {
            data[i * 4..i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }
        let geometry = ImageGeometry::new(512, 4 * cluster / 512, cluster, base).unwrap();
        let schema = TableSchema::Flat(FlatSchema {
            table_offset: 0,
            entry_count: 4,
            entry_width: EntryWidth::U32,
            scale: EntryScale::Clusters,
            unallocated: vec![0xFFFF_FFFF],
        });
        SparseImage::open(geometry, schema, MemSource::new(data), config).unwrap()
    }

    #[test]
    fn flat_cluster_lands_on_scaled_offset() {
        let image = flat_image(CacheConfig::default());
        let sector = 3 * 65536 / 512;
        assert_eq!(
            image.read_sector(sector).unwrap(),
            expected_at(1024 + 2 * 65536, 512)
        );
        assert_eq!(
            image.read_sector(sector + 1).unwrap(),
            expected_at(1024 + 2 * 65536 + 512, 512)
        );
    }

    #[test]
    fn every_in_range_sector_has_sector_size_bytes() {
        let image = flat_image(CacheConfig::default());
        for sector in (0..image.total_sectors()).step_by(37) {
            assert_eq!(image.read_sector(sector).unwrap().len(), 512);
        }
        assert_eq!(image.read_sector(image.total_sectors() - 1).unwrap().len(), 512);
    }

    #[test]
    fn ranges_past_the_end_are_rejected() {
        let image = flat_image(CacheConfig::default());
        let total = image.total_sectors();
        assert!(matches!(
            image.read_sector(total),
            Err(ReadError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            image.read_sectors(total - 1, 2),
            Err(ReadError::LengthExceedsImage { .. })
        ));
        assert!(matches!(
            image.read_sectors(0, u64::MAX),
            Err(ReadError::LengthExceedsImage { .. })
        ));
        assert_eq!(image.read_sectors(total - 1, 1).unwrap().len(), 512);
        assert!(image.read_sectors(total, 0).unwrap().is_empty());
    }

    #[test]
    fn sentinel_clusters_read_as_zeros() {
        let image = flat_image(CacheConfig::default());
        assert_eq!(image.read_sector(0).unwrap(), vec![0u8; 512]);
        assert_eq!(image.read_sector(2 * 128 + 5).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn multi_sector_reads_match_single_reads() {
        let image = flat_image(CacheConfig::default());
        let start = 3 * 128 - 2;
        let joined = image.read_sectors(start, 6).unwrap();
        let mut expected = Vec::new();
        for sector in start..start + 6 {
            expected.extend(image.read_sector(sector).unwrap());
        }
        assert_eq!(joined, expected);
    }

    #[test]
    fn caching_never_changes_results() {
        let cached = flat_image(CacheConfig::default());
        let uncached = flat_image(CacheConfig::disabled());
        let lru = flat_image(CacheConfig {
            policy: CachePolicy::Lru,
            sector_budget: 2048,
            cluster_budget: 65536,
            table_budget: 4096,
        });
        let tiny = flat_image(CacheConfig {
            policy: CachePolicy::ClearOnFull,
            sector_budget: 1024,
            cluster_budget: 1,
            table_budget: 1,
        });

        for sector in (0..cached.total_sectors()).step_by(61) {
            let first = cached.read_sector(sector).unwrap();
            cached.clear_caches();
            assert_eq!(cached.read_sector(sector).unwrap(), first);
            assert_eq!(uncached.read_sector(sector).unwrap(), first);
            assert_eq!(lru.read_sector(sector).unwrap(), first);
            assert_eq!(tiny.read_sector(sector).unwrap(), first);
        }
        assert_eq!(
            cached.read_sectors(380, 10).unwrap(),
            uncached.read_sectors(380, 10).unwrap()
        );
    }

    #[test]
    fn cluster_is_read_once_per_residency() {
        let cluster = 4096u64;
        let mut data = patterned(2 * cluster as usize);
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        let source = Arc::new(CountingSource::new(data));
        let geometry = ImageGeometry::new(512, 8, cluster, 0).unwrap();
        let schema = TableSchema::Flat(FlatSchema {
            table_offset: 0,
            entry_count: 1,
            entry_width: EntryWidth::U32,
            scale: EntryScale::Clusters,
            unallocated: vec![0],
        });
        let image =
            SparseImage::open(geometry, schema, Arc::clone(&source), CacheConfig::default())
                .unwrap();

        for sector in 0..8 {
            assert_eq!(
                image.read_sector(sector).unwrap(),
                expected_at(cluster + sector * 512, 512)
            );
        }
        assert_eq!(source.reads_at(cluster), 1);
        assert_eq!(image.cache_stats().clusters.hits, 7);

        image.clear_caches();
        image.read_sector(0).unwrap();
        assert_eq!(source.reads_at(cluster), 2);
    }

    #[test]
    fn two_level_branches_read_their_table_once() {
        let cluster = 4096u64;
        let entries = 512u64; // one 4 KiB table of u64 entries
        let branch = entries * cluster;
        let l1_offset = cluster;
        let l2_offset = 2 * cluster;
        let data_offset = 3 * cluster;

        let mut data = patterned(4 * cluster as usize);
        data[l1_offset as usize..(l1_offset + cluster) as usize].fill(0);
        data[l2_offset as usize..(l2_offset + cluster) as usize].fill(0);
        // Branch 0 absent, branch 1 -> L2 table whose slot 0 holds the data cluster.
        data[(l1_offset + 8) as usize..(l1_offset + 16) as usize]
            .copy_from_slice(&l2_offset.to_le_bytes());
        data[l2_offset as usize..(l2_offset + 8) as usize]
            .copy_from_slice(&data_offset.to_le_bytes());
        let source = Arc::new(CountingSource::new(data));

        let geometry = ImageGeometry::new(512, 2 * branch / 512, cluster, 0).unwrap();
        let schema = TableSchema::TwoLevel(TwoLevelSchema {
            l1_offset,
            entries_per_table: entries,
            entry_width: EntryWidth::U64,
            unallocated: vec![0, 1],
        });
        let image =
            SparseImage::open(geometry, schema, Arc::clone(&source), CacheConfig::default())
                .unwrap();

        for sector in [0, 1, branch / 512 - 1] {
            assert_eq!(image.read_sector(sector).unwrap(), vec![0u8; 512]);
        }
        assert_eq!(source.reads_touching(l2_offset, cluster), 0);
        assert_eq!(source.reads_touching(data_offset, cluster), 0);

        let first = branch / 512;
        assert_eq!(image.read_sector(first).unwrap(), expected_at(data_offset, 512));
        assert_eq!(
            image.read_sector(first + 3).unwrap(),
            expected_at(data_offset + 3 * 512, 512)
        );
        // Slot 1 of the same table is empty.
        assert_eq!(image.read_sector(first + 8).unwrap(), vec![0u8; 512]);
        assert_eq!(source.reads_at(l2_offset), 1);
        assert_eq!(image.cache_stats().tables.unwrap().hits, 2);
    }

    #[test]
    fn bytemap_blocks_are_compacted() {
        let block = 512u64;
        let bytemap = [1u8, 1, 0, 0, 1, 1, 1, 0, 1];
        let base = 64u64;
        let stride = block + 4;
        let mut data = patterned((base + 6 * stride) as usize);
        data[..bytemap.len()].copy_from_slice(&bytemap);

        let geometry = ImageGeometry::new(512, 9, block, base).unwrap();
        let schema = TableSchema::Bytemap(BytemapSchema {
            map_offset: 0,
            block_count: 9,
            trailer_size: 4,
        });
        let image =
            SparseImage::open(geometry, schema, MemSource::new(data), CacheConfig::disabled())
                .unwrap();

        assert_eq!(image.read_sector(4).unwrap(), expected_at(base + 2 * stride, 512));
        assert_eq!(image.read_sector(8).unwrap(), expected_at(base + 5 * stride, 512));
        assert_eq!(image.read_sector(7).unwrap(), vec![0u8; 512]);
        assert_eq!(image.read_sectors(0, 9).unwrap().len(), 9 * 512);
    }

    #[test]
    fn corrupt_pointer_is_an_error_not_zeros() {
        let mut data = vec![0u8; 8192];
        data[0..4].copy_from_slice(&100u32.to_le_bytes());
        let geometry = ImageGeometry::new(512, 8, 4096, 0).unwrap();
        let schema = TableSchema::Flat(FlatSchema {
            table_offset: 0,
            entry_count: 1,
            entry_width: EntryWidth::U32,
            scale: EntryScale::Clusters,
            unallocated: vec![0],
        });
        let image =
            SparseImage::open(geometry, schema, MemSource::new(data), CacheConfig::default())
                .unwrap();
        assert!(matches!(
            image.read_sector(0),
            Err(ReadError::CorruptAllocationEntry { .. })
        ));
        assert!(matches!(
            image.read_sectors(0, 2),
            Err(ReadError::CorruptAllocationEntry { .. })
        ));
    }

    #[test]
    fn images_can_be_shared_between_threads() {
        let image = Arc::new(flat_image(CacheConfig::default()));
        let expected = image.read_sector(3 * 128 + 9).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let image = Arc::clone(&image);
                std::thread::spawn(move || image.read_sector(3 * 128 + 9).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    #[test]
    fn returned_sectors_are_owned_copies() {
        let image = flat_image(CacheConfig::default());
        let sector = 3 * 128;
        let mut first = image.read_sector(sector).unwrap();
        first.fill(0xFF);
        assert_eq!(image.read_sector(sector).unwrap(), expected_at(1024 + 2 * 65536, 512));

        let mut zeros = image.read_sector(0).unwrap();
        zeros[0] = 1;
        assert_eq!(image.read_sector(0).unwrap(), vec![0u8; 512]);
        assert_eq!(image.read_sector(1).unwrap(), vec![0u8; 512]);
    }
}
