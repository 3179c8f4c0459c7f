pub mod cache;
pub mod config;
pub mod error;
pub mod extent;
pub mod format;
pub mod geometry;
pub mod image;
pub mod parallels;
pub mod partclone;
pub mod qed;
pub mod schema;
pub mod source;
pub mod table;
pub mod translate;
pub mod vdi;

use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, info};
use serde::Serialize;

pub use config::{CacheConfig, CachePolicy};
pub use error::{OpenError, ReadError};
pub use format::ImageFormat;
pub use geometry::ImageGeometry;
pub use image::{ImageCacheStats, SparseImage};
pub use schema::TableSchema;
pub use source::{ByteSource, FileSource, MemSource};
pub use translate::Translation;

use parallels::Parallels;
use partclone::PartClone;
use qed::Qed;
use vdi::Vdi;

pub enum BodyFormat {
    Qed {
        image: Qed,
        description: String,
    },
    Vdi {
        image: Vdi,
        description: String,
    },
    Parallels {
        image: Parallels,
        description: String,
    },
    PartClone {
        image: PartClone,
        description: String,
    },
}

impl BodyFormat {
    fn open<S: ByteSource + 'static>(
        format: ImageFormat,
        source: S,
        config: CacheConfig,
    ) -> Result<Self, OpenError> {
        let description = format.description().to_string();
        Ok(match format {
            ImageFormat::Qed => BodyFormat::Qed {
                image: Qed::open(source, config)?,
                description,
            },
            ImageFormat::Vdi => BodyFormat::Vdi {
                image: Vdi::open(source, config)?,
                description,
            },
            ImageFormat::Parallels => BodyFormat::Parallels {
                image: Parallels::open(source, config)?,
                description,
            },
            ImageFormat::PartClone => BodyFormat::PartClone {
                image: PartClone::open(source, config)?,
                description,
            },
        })
    }

    pub fn kind(&self) -> ImageFormat {
        match self {
            BodyFormat::Qed { .. } => ImageFormat::Qed,
            BodyFormat::Vdi { .. } => ImageFormat::Vdi,
            BodyFormat::Parallels { .. } => ImageFormat::Parallels,
            BodyFormat::PartClone { .. } => ImageFormat::PartClone,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            BodyFormat::Qed { description, .. }
            | BodyFormat::Vdi { description, .. }
            | BodyFormat::Parallels { description, .. }
            | BodyFormat::PartClone { description, .. } => description,
        }
    }

    pub fn image(&self) -> &SparseImage {
        match self {
            BodyFormat::Qed { image, .. } => image.image(),
            BodyFormat::Vdi { image, .. } => image.image(),
            BodyFormat::Parallels { image, .. } => image.image(),
            BodyFormat::PartClone { image, .. } => image.image(),
        }
    }

    fn print_info(&self) {
        match self {
            BodyFormat::Qed { image, .. } => image.print_info(),
            BodyFormat::Vdi { image, .. } => image.print_info(),
            BodyFormat::Parallels { image, .. } => image.print_info(),
            BodyFormat::PartClone { image, .. } => image.print_info(),
        }
    }
}

/// Serializable overview of an opened body.
#[derive(Clone, Debug, Serialize)]
pub struct ImageSummary {
    pub path: String,
    pub format: ImageFormat,
    pub description: String,
    pub geometry: ImageGeometry,
    pub table: TableSchema,
    pub cache: CacheConfig,
    pub cache_stats: ImageCacheStats,
}

/// A sparse disk image exposed as a flat byte stream.
pub struct Body {
    path: String,
    format: BodyFormat,
    position: u64,
}

impl Body {
    /// Opens `file_path` as `format` (or `"auto"`) with the default caches and
    /// positions the cursor at `offset`.
    pub fn new_from(file_path: String, format: &str, offset: Option<u64>) -> Result<Body, OpenError> {
        Self::open_with(file_path, format, offset, CacheConfig::default())
    }

    pub fn open_with(
        file_path: String,
        format: &str,
        offset: Option<u64>,
        config: CacheConfig,
    ) -> Result<Body, OpenError> {
        let source = FileSource::open(&file_path)?;
        let mut body = Self::from_source(file_path, source, format, config)?;
        if let Some(offset) = offset {
            body.seek(SeekFrom::Start(offset))?;
        }
        Ok(body)
    }

    /// Opens an already-open byte source. `name` is only used for display.
    pub fn from_source<S: ByteSource + 'static>(
        name: String,
        source: S,
        format: &str,
        config: CacheConfig,
    ) -> Result<Body, OpenError> {
        let kind = if format.eq_ignore_ascii_case("auto") {
            let detected = ImageFormat::detect(&source)
                .ok_or(OpenError::NotRecognized("qed, vdi, parallels or partclone"))?;
            debug!("Detected '{}' format for {}", detected, name);
            detected
        } else {
            ImageFormat::from_name(format)?
        };
        Ok(Body {
            path: name,
            format: BodyFormat::open(kind, source, config)?,
            position: 0,
        })
    }

    pub fn format(&self) -> &BodyFormat {
        &self.format
    }

    pub fn image(&self) -> &SparseImage {
        self.format.image()
    }

    pub fn get_sector_size(&self) -> u32 {
        self.image().sector_size()
    }

    pub fn total_sectors(&self) -> u64 {
        self.image().total_sectors()
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.image().geometry().image_size()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn print_info(&self) {
        info!("Evidence : {}", self.path);
        info!("Format : {} ({})", self.format.kind(), self.format.description());
        self.format.print_info();
        info!(
            "Sectors per cluster : {}",
            self.image().geometry().sectors_per_cluster()
        );
    }

    pub fn summary(&self) -> ImageSummary {
        let image = self.image();
        ImageSummary {
            path: self.path.clone(),
            format: self.format.kind(),
            description: self.format.description().to_string(),
            geometry: *image.geometry(),
            table: image.schema().clone(),
            cache: image.cache_config().clone(),
            cache_stats: image.cache_stats(),
        }
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.size();
        if buf.is_empty() || self.position >= size {
            return Ok(0);
        }
        let sector_size = u64::from(self.get_sector_size());
        let len = (buf.len() as u64).min(size - self.position);
        let first = self.position / sector_size;
        let last = (self.position + len - 1) / sector_size;
        let data = self.image().read_sectors(first, last - first + 1)?;

        let skip = (self.position % sector_size) as usize;
        let len = len as usize;
        buf[..len].copy_from_slice(&data[skip..skip + len]);
        self.position += len as u64;
        Ok(len)
    }
}

impl Seek for Body {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
        };
        match target {
            Some(target) if target <= size => {
                self.position = target;
                Ok(target)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset is out of bounds",
            )),
        }
    }
}
