/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! TOML configuration file and multi-image manifests.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer, de};
use thiserror::Error;

use crate::{
    format::sparse::CrcMode,
    install::{ImageDescriptor, InstallOptions},
    source::ImageLocation,
    util::parse_size,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Accept either an integer number of bytes or a string with a size suffix.
fn deserialize_size<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(d)? {
        Size::Bytes(n) => Ok(Some(n)),
        Size::Text(s) => parse_size(&s).map(Some).map_err(de::Error::custom),
    }
}

fn load_toml<T: de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

    toml_edit::de::from_str(&contents).map_err(|e| Error::Parse(path.to_owned(), e))
}

/// Settings file. Every field is optional and command line arguments take
/// precedence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub slot: Option<String>,
    #[serde(deserialize_with = "deserialize_size")]
    pub userdata_size: Option<u64>,
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_size: Option<u64>,
    pub verify_checksums: Option<bool>,
    pub progress_poll_interval_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    /// Apply the configured values on top of the defaults.
    pub fn install_options(&self) -> Result<InstallOptions> {
        let mut options = InstallOptions::default();

        if let Some(slot) = &self.slot {
            options.slot.clone_from(slot);
        }
        if let Some(size) = self.userdata_size {
            options.userdata_size = size;
        }
        if let Some(size) = self.chunk_size {
            options.chunk_size = chunk_size(size)?;
        }
        if let Some(verify) = self.verify_checksums {
            options.crc_mode = if verify {
                CrcMode::Validate
            } else {
                CrcMode::Ignore
            };
        }
        if let Some(ms) = self.progress_poll_interval_ms {
            options.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.http_timeout_secs {
            if secs == 0 {
                return Err(Error::InvalidValue {
                    field: "http_timeout_secs",
                    reason: "must be non-zero".to_owned(),
                });
            }
            options.http_timeout = Duration::from_secs(secs);
        }

        Ok(options)
    }
}

/// Validate a transport region size.
pub fn chunk_size(size: u64) -> Result<usize> {
    match usize::try_from(size) {
        Ok(0) => Err(Error::InvalidValue {
            field: "chunk_size",
            reason: "must be non-zero".to_owned(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(Error::InvalidValue {
            field: "chunk_size",
            reason: e.to_string(),
        }),
    }
}

fn default_read_only() -> bool {
    true
}

/// An image listed in a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestImage {
    pub name: String,
    /// Local path, relative to the manifest's directory, or an HTTP(S) URL.
    pub path: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

/// List of images for a multi-image installation.
///
/// ```toml
/// [[image]]
/// name = "system"
/// path = "system.img"
///
/// [[image]]
/// name = "product"
/// path = "https://example.com/product.img"
/// size = "1G"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(rename = "image", default)]
    pub images: Vec<ManifestImage>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    /// Convert to installable descriptors. Relative paths are resolved against
    /// `base_dir`.
    pub fn into_descriptors(self, base_dir: &Path) -> Vec<ImageDescriptor> {
        self.images
            .into_iter()
            .map(|image| {
                let location = match ImageLocation::parse(&image.path) {
                    ImageLocation::Path(p) if p.is_relative() => {
                        ImageLocation::Path(base_dir.join(p))
                    }
                    l => l,
                };

                ImageDescriptor {
                    name: image.name,
                    image: location,
                    size: image.size,
                    read_only: image.read_only,
                }
            })
            .collect()
    }
}
