// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Acquisition of the byte streams that partitions are installed from.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

use crate::format::zip::ZipEntry;

/// Extension of package entries that are installed as partitions.
const IMAGE_EXTENSION: &str = "img";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open file: {0:?}")]
    File(PathBuf, #[source] io::Error),
    #[error("Request failed: {0}")]
    Http(String, #[source] attohttpc::Error),
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Where the bytes of an image or package come from.
pub enum ImageLocation {
    /// Local file.
    Path(PathBuf),
    /// `http://` or `https://` URL, fetched with a streaming GET request.
    Url(String),
    /// A stream that was already opened by the caller.
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for ImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Reader(_) => f.debug_tuple("Reader").finish_non_exhaustive(),
        }
    }
}

impl ImageLocation {
    /// Interpret a command line argument as a URL if it has an HTTP scheme and
    /// as a local path otherwise.
    pub fn parse(s: &str) -> Self {
        if is_http_url(s) {
            Self::Url(s.to_owned())
        } else {
            Self::Path(PathBuf::from(s))
        }
    }

    /// Size of a local file. Remote and already opened streams have no known
    /// size.
    pub fn local_size(&self) -> Option<u64> {
        match self {
            Self::Path(path) => fs::metadata(path).ok().map(|m| m.len()),
            Self::Url(_) | Self::Reader(_) => None,
        }
    }

    /// Open the stream. A [`Self::Reader`] is returned as is.
    pub fn open(self, timeout: Duration) -> Result<Box<dyn Read>> {
        match self {
            Self::Path(path) => {
                let file = File::open(&path).map_err(|e| Error::File(path, e))?;
                Ok(Box::new(file))
            }
            Self::Url(url) => open_url(&url, timeout),
            Self::Reader(reader) => Ok(reader),
        }
    }
}

fn is_http_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Start a GET request and return the response body as a stream. `timeout`
/// applies to connecting and to each individual read, not the whole transfer.
pub fn open_url(url: &str, timeout: Duration) -> Result<Box<dyn Read>> {
    if !is_http_url(url) {
        return Err(Error::UnsupportedScheme(url.to_owned()));
    }

    debug!("Opening URL: {url}");

    let response = attohttpc::get(url)
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Http(url.to_owned(), e))?;

    Ok(Box::new(response))
}

/// Partition name for a package entry path, or [`None`] if the entry is not a
/// partition image. `system.img` and `images/system.img` both map to
/// `system`.
pub fn partition_name(entry_path: &str) -> Option<&str> {
    let path = Path::new(entry_path);

    if path.extension()? != IMAGE_EXTENSION {
        return None;
    }

    path.file_stem()?.to_str().filter(|s| !s.is_empty())
}

/// Partition name for a package entry, or [`None`] if the entry is a
/// directory or not a partition image.
pub fn entry_partition_name<'a, R>(entry: &'a ZipEntry<'_, R>) -> Option<&'a str> {
    if entry.is_dir() {
        None
    } else {
        partition_name(entry.name())
    }
}
