//! Declarative description of how a format maps logical clusters to storage.
//!
//! Format modules never translate addresses themselves: they decode their
//! header into an [`ImageGeometry`](crate::ImageGeometry) plus one of the
//! [`TableSchema`] variants below, and the shared translator does the rest.

use serde::Serialize;

/// Width of one on-disk table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryWidth {
    U32,
    U64,
}

impl EntryWidth {
    #[inline]
    pub fn bytes(self) -> u64 {
        match self {
            EntryWidth::U32 => 4,
            EntryWidth::U64 => 8,
        }
    }
}

/// Unit in which a flat table stores cluster locations.
///
/// Some producers record cluster numbers, others record 512-byte sector
/// numbers. The byte offset of a cluster is
/// `data_base_offset + entry * unit_bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryScale {
    /// Entries count clusters of `cluster_size` bytes.
    Clusters,
    /// Entries count sectors of `sector_size` bytes.
    Sectors,
    /// Entries are already byte offsets.
    Bytes,
}

/// One-level block allocation table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FlatSchema {
    /// Container offset of the first entry.
    pub table_offset: u64,
    /// Number of entries stored on disk.
    pub entry_count: u64,
    pub entry_width: EntryWidth,
    pub scale: EntryScale,
    /// Entry values meaning "never written".
    pub unallocated: Vec<u64>,
}

/// L1/L2 table pair where L1 entries point at L2 tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TwoLevelSchema {
    /// Container offset of the L1 table.
    pub l1_offset: u64,
    /// Entries in the L1 table, and in every L2 table.
    pub entries_per_table: u64,
    pub entry_width: EntryWidth,
    /// L2 entry values meaning "never written". An L1 entry of 0 always
    /// means the whole branch is unallocated.
    pub unallocated: Vec<u64>,
}

impl TwoLevelSchema {
    /// Bytes occupied by one L1 or L2 table.
    #[inline]
    pub fn table_bytes(&self) -> u64 {
        self.entries_per_table * self.entry_width.bytes()
    }
}

/// Per-block used/unused map with used blocks stored back to back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BytemapSchema {
    /// Container offset of the bytemap, one byte per logical block.
    pub map_offset: u64,
    pub block_count: u64,
    /// Bytes stored after every block, such as an inline checksum.
    pub trailer_size: u64,
}

/// How a format finds the cluster holding a logical address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableSchema {
    Flat(FlatSchema),
    TwoLevel(TwoLevelSchema),
    Bytemap(BytemapSchema),
}

impl TableSchema {
    pub fn kind(&self) -> &'static str {
        match self {
            TableSchema::Flat(_) => "flat",
            TableSchema::TwoLevel(_) => "two-level",
            TableSchema::Bytemap(_) => "bytemap",
        }
    }
}
