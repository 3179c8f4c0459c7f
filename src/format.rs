//! Supported container formats and magic-based detection.

use std::fmt;

use serde::Serialize;

use crate::error::OpenError;
use crate::parallels::Parallels;
use crate::partclone::PartClone;
use crate::qed::Qed;
use crate::source::ByteSource;
use crate::vdi::Vdi;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Qed,
    Vdi,
    Parallels,
    PartClone,
}

impl ImageFormat {
    /// Every format, in detection order.
    pub const ALL: [ImageFormat; 4] = [
        ImageFormat::Qed,
        ImageFormat::Vdi,
        ImageFormat::Parallels,
        ImageFormat::PartClone,
    ];

    /// Resolves a user-supplied format name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self, OpenError> {
        match name.to_ascii_lowercase().as_str() {
            "qed" => Ok(ImageFormat::Qed),
            "vdi" => Ok(ImageFormat::Vdi),
            "parallels" | "hdd" => Ok(ImageFormat::Parallels),
            "partclone" => Ok(ImageFormat::PartClone),
            _ => Err(OpenError::UnknownFormat(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Qed => Qed::NAME,
            ImageFormat::Vdi => Vdi::NAME,
            ImageFormat::Parallels => Parallels::NAME,
            ImageFormat::PartClone => PartClone::NAME,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ImageFormat::Qed => Qed::DESCRIPTION,
            ImageFormat::Vdi => Vdi::DESCRIPTION,
            ImageFormat::Parallels => Parallels::DESCRIPTION,
            ImageFormat::PartClone => PartClone::DESCRIPTION,
        }
    }

    fn identify(self, source: &dyn ByteSource) -> bool {
        match self {
            ImageFormat::Qed => Qed::identify(source),
            ImageFormat::Vdi => Vdi::identify(source),
            ImageFormat::Parallels => Parallels::identify(source),
            ImageFormat::PartClone => PartClone::identify(source),
        }
    }

    /// Returns the first format whose magic matches `source`.
    pub fn detect(source: &dyn ByteSource) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.identify(source))
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
