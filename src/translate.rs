//! Logical sector to container offset translation.
//!
//! One translator serves every format: the [`TableSchema`] picks the lookup
//! strategy and supplies the per-format constants.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::cache::{BoundedCache, CacheStats};
use crate::config::CacheConfig;
use crate::error::{OpenError, ReadError};
use crate::extent::ExtentIndex;
use crate::geometry::ImageGeometry;
use crate::schema::{EntryScale, EntryWidth, TableSchema};
use crate::source::ByteSource;
use crate::table::{load_second_level, AllocationTable};

/// Where the data of one logical sector lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Translation {
    /// Never written: reads as zeros without touching the container.
    Unallocated,
    Physical(PhysicalLocation),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalLocation {
    /// Container offset of the first byte of the cluster.
    pub cluster_offset: u64,
    /// Offset of the sector inside that cluster.
    pub offset_within_cluster: u64,
}

enum Mapping {
    Flat {
        table: AllocationTable,
        /// Bytes per entry unit.
        unit: u64,
        unallocated: Vec<u64>,
    },
    TwoLevel {
        l1: AllocationTable,
        entries_per_table: u64,
        width: EntryWidth,
        cluster_bits: u32,
        l1_shift: u32,
        unallocated: Vec<u64>,
        l2_tables: Mutex<BoundedCache<Arc<Vec<u64>>>>,
    },
    Extent {
        index: ExtentIndex,
        /// Bytes between the starts of two consecutive stored blocks.
        stride: u64,
    },
}

/// Translates sector addresses for one opened image.
pub struct SectorTranslator {
    geometry: ImageGeometry,
    mapping: Mapping,
}

impl SectorTranslator {
    /// Loads the tables described by `schema` and prepares lookups.
    ///
    /// # Errors
    ///
    /// [`OpenError::TruncatedTable`] when a table runs past the container, and
    /// [`OpenError::InconsistentGeometry`] when the tables cannot cover the
    /// whole image.
    pub fn build(
        source: &dyn ByteSource,
        geometry: ImageGeometry,
        schema: &TableSchema,
        config: &CacheConfig,
    ) -> Result<Self, OpenError> {
        let clusters = geometry.cluster_count();
        let mapping = match schema {
            TableSchema::Flat(flat) => {
                if flat.entry_count < clusters {
                    return Err(OpenError::InconsistentGeometry(format!(
                        "allocation table holds {} entries but the image needs {}",
                        flat.entry_count, clusters
                    )));
                }
                let table =
                    AllocationTable::load(source, flat.table_offset, flat.entry_count, flat.entry_width)?;
                let unit = match flat.scale {
                    EntryScale::Clusters => geometry.cluster_size,
                    EntryScale::Sectors => u64::from(geometry.sector_size),
                    EntryScale::Bytes => 1,
                };
                Mapping::Flat {
                    table,
                    unit,
                    unallocated: flat.unallocated.clone(),
                }
            }
            TableSchema::TwoLevel(two_level) => {
                let entries = two_level.entries_per_table;
                if !geometry.cluster_size.is_power_of_two() || !entries.is_power_of_two() {
                    return Err(OpenError::InconsistentGeometry(format!(
                        "two-level tables need power of two sizes (cluster {} bytes, {} entries per table)",
                        geometry.cluster_size, entries
                    )));
                }
                let cluster_bits = geometry.cluster_size.trailing_zeros();
                let l2_bits = entries.trailing_zeros();
                let addressable = entries
                    .checked_mul(entries)
                    .and_then(|n| n.checked_mul(geometry.cluster_size));
                if let Some(addressable) = addressable {
                    if addressable < geometry.image_size() {
                        return Err(OpenError::InconsistentGeometry(format!(
                            "tables address {} bytes but the image holds {}",
                            addressable,
                            geometry.image_size()
                        )));
                    }
                }
                let l1 = AllocationTable::load(source, two_level.l1_offset, entries, two_level.entry_width)?;
                let table_bytes = usize::try_from(two_level.table_bytes()).unwrap_or(usize::MAX);
                Mapping::TwoLevel {
                    l1,
                    entries_per_table: entries,
                    width: two_level.entry_width,
                    cluster_bits,
                    l1_shift: cluster_bits + l2_bits,
                    unallocated: two_level.unallocated.clone(),
                    l2_tables: Mutex::new(BoundedCache::new(
                        "L2 table",
                        config.policy,
                        config.table_budget,
                        table_bytes,
                    )),
                }
            }
            TableSchema::Bytemap(bytemap) => {
                if bytemap.block_count < clusters {
                    return Err(OpenError::InconsistentGeometry(format!(
                        "bytemap covers {} blocks but the image needs {}",
                        bytemap.block_count, clusters
                    )));
                }
                let available = source.size().saturating_sub(bytemap.map_offset);
                if bytemap.block_count > available {
                    return Err(OpenError::TruncatedTable {
                        offset: bytemap.map_offset,
                        expected: bytemap.block_count,
                        available,
                    });
                }
                let len = usize::try_from(bytemap.block_count)
                    .map_err(|_| OpenError::UnsupportedFeature("bytemap too large".to_string()))?;
                let mut map = vec![0u8; len];
                source.read_exact_at(bytemap.map_offset, &mut map)?;
                let index = ExtentIndex::from_bytemap(&map);
                debug!(
                    "Bytemap folded into {} extents ({} of {} blocks used)",
                    index.extents().len(),
                    index.used_blocks(),
                    index.total_blocks()
                );
                let stride = geometry
                    .cluster_size
                    .checked_add(bytemap.trailer_size)
                    .ok_or_else(|| {
                        OpenError::InconsistentGeometry("block trailer size overflows".to_string())
                    })?;
                Mapping::Extent { index, stride }
            }
        };
        Ok(Self { geometry, mapping })
    }

    /// Finds the cluster holding `sector`.
    ///
    /// The caller is expected to have range-checked `sector`.
    ///
    /// # Errors
    ///
    /// [`ReadError::CorruptAllocationEntry`] when a table entry points outside
    /// the container.
    pub fn translate(&self, source: &dyn ByteSource, sector: u64) -> Result<Translation, ReadError> {
        let byte = sector * u64::from(self.geometry.sector_size);
        let cluster_size = self.geometry.cluster_size;

        let translation = match &self.mapping {
            Mapping::Flat {
                table,
                unit,
                unallocated,
            } => {
                let entry = table
                    .get(byte / cluster_size)
                    .ok_or_else(|| self.out_of_range(sector))?;
                if unallocated.contains(&entry) {
                    Translation::Unallocated
                } else {
                    let cluster_offset = self
                        .geometry
                        .data_base_offset
                        .saturating_add(entry.saturating_mul(*unit));
                    self.physical(source, cluster_offset, byte % cluster_size)?
                }
            }
            Mapping::TwoLevel {
                l1,
                entries_per_table,
                width,
                cluster_bits,
                l1_shift,
                unallocated,
                l2_tables,
            } => {
                let l1_index = byte >> l1_shift;
                let l2_index = (byte >> cluster_bits) & (entries_per_table - 1);
                let l2_offset = l1.get(l1_index).ok_or_else(|| self.out_of_range(sector))?;
                if l2_offset == 0 {
                    Translation::Unallocated
                } else {
                    let l2 = {
                        let mut cache = l2_tables.lock();
                        match cache.get(l1_index) {
                            Some(table) => table,
                            None => {
                                trace!("Loading L2 table {} at 0x{:x}", l1_index, l2_offset);
                                let table = Arc::new(load_second_level(
                                    source,
                                    l2_offset,
                                    *entries_per_table,
                                    *width,
                                )?);
                                cache.put(l1_index, Arc::clone(&table));
                                table
                            }
                        }
                    };
                    let entry = usize::try_from(l2_index)
                        .ok()
                        .and_then(|i| l2.get(i).copied())
                        .ok_or_else(|| self.out_of_range(sector))?;
                    if unallocated.contains(&entry) {
                        Translation::Unallocated
                    } else {
                        self.physical(source, entry, byte & (cluster_size - 1))?
                    }
                }
            }
            Mapping::Extent { index, stride } => match index.lookup(byte / cluster_size) {
                None => Translation::Unallocated,
                Some(physical_block) => {
                    let cluster_offset = self
                        .geometry
                        .data_base_offset
                        .saturating_add(physical_block.saturating_mul(*stride));
                    self.physical(source, cluster_offset, byte % cluster_size)?
                }
            },
        };
        trace!("Sector {} -> {:?}", sector, translation);
        Ok(translation)
    }

    /// Bytes read from the container for one physical cluster.
    #[inline]
    pub fn cluster_len(&self) -> u64 {
        self.geometry.cluster_size
    }

    pub fn clear_cache(&self) {
        if let Mapping::TwoLevel { l2_tables, .. } = &self.mapping {
            l2_tables.lock().clear();
        }
    }

    /// Statistics of the second-level table tier, for two-level schemas.
    pub fn table_cache_stats(&self) -> Option<CacheStats> {
        match &self.mapping {
            Mapping::TwoLevel { l2_tables, .. } => Some(l2_tables.lock().stats()),
            _ => None,
        }
    }

    /// Extent index of bytemap schemas.
    pub fn extent_index(&self) -> Option<&ExtentIndex> {
        match &self.mapping {
            Mapping::Extent { index, .. } => Some(index),
            _ => None,
        }
    }

    fn physical(
        &self,
        source: &dyn ByteSource,
        cluster_offset: u64,
        offset_within_cluster: u64,
    ) -> Result<Translation, ReadError> {
        let container_size = source.size();
        match cluster_offset.checked_add(self.cluster_len()) {
            Some(end) if end <= container_size => Ok(Translation::Physical(PhysicalLocation {
                cluster_offset,
                offset_within_cluster,
            })),
            _ => Err(ReadError::CorruptAllocationEntry {
                offset: cluster_offset,
                length: self.cluster_len(),
                container_size,
            }),
        }
    }

    fn out_of_range(&self, sector: u64) -> ReadError {
        ReadError::AddressOutOfRange {
            sector,
            total_sectors: self.geometry.total_sectors,
        }
    }
}
