//! Extent index for bytemap containers.
//!
//! Bytemap formats omit unused blocks from the file entirely: used blocks are
//! stored back to back in logical order. The index folds the per-block map
//! into sorted runs of used blocks, each remembering how many used blocks
//! precede it, so a logical block translates to its compacted position with a
//! binary search instead of a per-block table.

/// A run of used logical blocks `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// First logical block of the run.
    pub start: u64,
    /// One past the last logical block of the run.
    pub end: u64,
    /// Compacted position of `start` in the stored data stream.
    pub physical_start: u64,
}

impl Extent {
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end
    }
}

/// Sorted, disjoint runs of used blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentIndex {
    extents: Vec<Extent>,
    total_blocks: u64,
    used_blocks: u64,
}

impl ExtentIndex {
    /// Builds the index from a bytemap where any non-zero byte marks a used block.
    pub fn from_bytemap(bytemap: &[u8]) -> Self {
        Self::from_flags(bytemap.iter().map(|b| *b != 0))
    }

    /// Builds the index from one used/unused flag per logical block.
    pub fn from_flags<I: IntoIterator<Item = bool>>(flags: I) -> Self {
        let mut extents = Vec::new();
        let mut used_blocks = 0u64;
        let mut run_start: Option<u64> = None;
        let mut block = 0u64;

        for used in flags {
            match (used, run_start) {
                (true, None) => run_start = Some(block),
                (false, Some(start)) => {
                    extents.push(Extent {
                        start,
                        end: block,
                        physical_start: used_blocks,
                    });
                    used_blocks += block - start;
                    run_start = None;
                }
                _ => {}
            }
            block += 1;
        }
        if let Some(start) = run_start {
            extents.push(Extent {
                start,
                end: block,
                physical_start: used_blocks,
            });
            used_blocks += block - start;
        }

        Self {
            extents,
            total_blocks: block,
            used_blocks,
        }
    }

    /// Compacted position of `block`, or `None` if the block is not stored.
    pub fn lookup(&self, block: u64) -> Option<u64> {
        // First run whose end lies past the block; it holds the block if any run does.
        let idx = self.extents.partition_point(|e| e.end <= block);
        self.extents
            .get(idx)
            .filter(|e| e.contains(block))
            .map(|e| e.physical_start + (block - e.start))
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Number of logical blocks covered by the map.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Number of blocks actually stored in the container.
    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }
}
