//! Allocation table loading.

use log::debug;

use crate::error::{OpenError, ReadError};
use crate::schema::EntryWidth;
use crate::source::{le_u32, le_u64, ByteSource};

/// Allocation table entries, widened to `u64` and stored verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationTable {
    entries: Vec<u64>,
}

impl AllocationTable {
    /// Reads `entry_count` entries starting at `offset`.
    ///
    /// Entry values are not checked against the container size here; some
    /// producers pre-allocate tables sparsely, so bad pointers are only
    /// reported when a read actually follows them.
    ///
    /// # Errors
    ///
    /// [`OpenError::TruncatedTable`] when the container ends before the table does.
    pub fn load(
        source: &dyn ByteSource,
        offset: u64,
        entry_count: u64,
        width: EntryWidth,
    ) -> Result<Self, OpenError> {
        let expected = entry_count
            .checked_mul(width.bytes())
            .ok_or_else(|| OpenError::InconsistentGeometry("table size overflows".to_string()))?;
        let available = source.size().saturating_sub(offset);
        if expected > available {
            return Err(OpenError::TruncatedTable {
                offset,
                expected,
                available,
            });
        }
        let len = usize::try_from(expected)
            .map_err(|_| OpenError::UnsupportedFeature("allocation table too large".to_string()))?;

        debug!(
            "Loading {} table entries ({} bytes) at 0x{:x}",
            entry_count, expected, offset
        );
        let mut raw = vec![0u8; len];
        source.read_exact_at(offset, &mut raw)?;
        Ok(Self {
            entries: decode_entries(&raw, width),
        })
    }

    #[inline]
    pub fn get(&self, index: u64) -> Option<u64> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i).copied())
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }
}

/// Reads one second-level table on demand.
///
/// Unlike [`AllocationTable::load`] this runs at read time, so a table that
/// points outside the container is a corrupt entry rather than a truncated file.
pub(crate) fn load_second_level(
    source: &dyn ByteSource,
    offset: u64,
    entry_count: u64,
    width: EntryWidth,
) -> Result<Vec<u64>, ReadError> {
    let length = entry_count * width.bytes();
    let container_size = source.size();
    let corrupt = ReadError::CorruptAllocationEntry {
        offset,
        length,
        container_size,
    };
    match offset.checked_add(length) {
        Some(end) if end <= container_size => {}
        _ => return Err(corrupt),
    }
    let len = usize::try_from(length).map_err(|_| corrupt)?;

    let mut raw = vec![0u8; len];
    source.read_exact_at(offset, &mut raw)?;
    Ok(decode_entries(&raw, width))
}

fn decode_entries(raw: &[u8], width: EntryWidth) -> Vec<u64> {
    match width {
        EntryWidth::U32 => (0..raw.len() / 4)
            .map(|i| u64::from(le_u32(raw, i * 4)))
            .collect(),
        EntryWidth::U64 => (0..raw.len() / 8).map(|i| le_u64(raw, i * 8)).collect(),
    }
}
