use serde::Serialize;

use crate::error::OpenError;

/// Layout constants derived once from a container header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ImageGeometry {
    /// Logical sector size in bytes.
    pub sector_size: u32,
    /// Number of logical sectors exposed by the image.
    pub total_sectors: u64,
    /// Allocation unit in bytes. For bytemap formats this is one block.
    pub cluster_size: u64,
    /// Container offset where cluster storage begins.
    pub data_base_offset: u64,
}

impl ImageGeometry {
    /// Validates and builds a geometry.
    ///
    /// # Errors
    ///
    /// [`OpenError::InconsistentGeometry`] if the sector or cluster size is zero,
    /// if the cluster size is not a whole number of sectors, or if the image
    /// byte size overflows.
    pub fn new(
        sector_size: u32,
        total_sectors: u64,
        cluster_size: u64,
        data_base_offset: u64,
    ) -> Result<Self, OpenError> {
        if sector_size == 0 {
            return Err(OpenError::InconsistentGeometry(
                "sector size is zero".to_string(),
            ));
        }
        if cluster_size == 0 || cluster_size % u64::from(sector_size) != 0 {
            return Err(OpenError::InconsistentGeometry(format!(
                "cluster size {} is not a multiple of the sector size {}",
                cluster_size, sector_size
            )));
        }
        if total_sectors.checked_mul(u64::from(sector_size)).is_none() {
            return Err(OpenError::InconsistentGeometry(format!(
                "{} sectors of {} bytes overflow the addressable range",
                total_sectors, sector_size
            )));
        }
        Ok(Self {
            sector_size,
            total_sectors,
            cluster_size,
            data_base_offset,
        })
    }

    /// Size of the logical image in bytes.
    #[inline]
    pub fn image_size(&self) -> u64 {
        self.total_sectors * u64::from(self.sector_size)
    }

    /// Number of clusters needed to cover the logical image.
    #[inline]
    pub fn cluster_count(&self) -> u64 {
        self.image_size().div_ceil(self.cluster_size)
    }

    #[inline]
    pub fn sectors_per_cluster(&self) -> u64 {
        self.cluster_size / u64::from(self.sector_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_must_hold_whole_sectors() {
        assert!(ImageGeometry::new(512, 8, 4096, 0).is_ok());
        assert!(matches!(
            ImageGeometry::new(512, 8, 1000, 0),
            Err(OpenError::InconsistentGeometry(_))
        ));
        assert!(matches!(
            ImageGeometry::new(0, 8, 4096, 0),
            Err(OpenError::InconsistentGeometry(_))
        ));
    }

    #[test]
    fn cluster_count_rounds_up() {
        let geometry = ImageGeometry::new(512, 9, 4096, 0).unwrap();
        assert_eq!(geometry.image_size(), 4608);
        assert_eq!(geometry.cluster_count(), 2);
        assert_eq!(geometry.sectors_per_cluster(), 8);
    }

    #[test]
    fn block_sized_clusters_are_allowed() {
        let geometry = ImageGeometry::new(4096, 3, 4096, 4172).unwrap();
        assert_eq!(geometry.cluster_count(), 3);
    }
}
