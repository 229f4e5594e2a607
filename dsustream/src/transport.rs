// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Single-slot chunk transport between the installer and the service.
//!
//! One fixed-size region is shared with the service. Each chunk is copied to
//! the start of the region and then submitted. The submission blocks until the
//! service has consumed the region, and only then may the next chunk be
//! written. There is never more than one chunk in flight.

use std::{
    fmt,
    io::{self, Read},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tracing::trace;

use crate::{service::DynamicSystemService, stream::ReadFullExt};

/// Default size of the shared region.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport region size must be non-zero")]
    ZeroCapacity,
    #[error("Service rejected transport region of {0} bytes")]
    RegionRejected(usize),
    #[error("Previous chunk of {0} bytes has not been acknowledged")]
    Unacknowledged(usize),
    #[error("No chunk has been written since the last acknowledgment")]
    NothingWritten,
    #[error("Cannot acknowledge {count} bytes when only {written} bytes were written")]
    AcknowledgeTooLarge { count: usize, written: usize },
    #[error("Service failed to consume chunk of {0} bytes")]
    SubmitFailed(usize),
    #[error("Stream produced more than the expected {expected} bytes")]
    TooMuchData { expected: u64 },
    #[error("Stream ended after {actual} bytes, but expected {expected} bytes")]
    TooLittleData { actual: u64, expected: u64 },
    #[error("Failed to read source data")]
    Read(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

type Region = Arc<Mutex<Box<[u8]>>>;

/// The service's view of the shared region. Cloning the handle duplicates the
/// capability, not the memory.
#[derive(Clone)]
pub struct RegionHandle {
    region: Region,
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionHandle")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl RegionHandle {
    /// Capacity of the region in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.region
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run `f` on the first `len` bytes of the region. Returns [`None`] if
    /// `len` exceeds the capacity.
    pub fn with_bytes<T>(&self, len: usize, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
        let guard = self.region.lock().unwrap_or_else(PoisonError::into_inner);

        guard.get(..len).map(f)
    }
}

/// Progress of a single partition's transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub partition: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl Progress {
    /// Completion ratio between 0.0 and 1.0. An empty partition is complete.
    pub fn fraction(&self) -> f32 {
        if self.total_bytes == 0 {
            1.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0) as f32
        }
    }
}

/// How a call to [`TransportChannel::pump`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// The stream was exhausted and every byte was acknowledged.
    Complete(u64),
    /// The cancel signal was observed after this many bytes were acknowledged.
    Cancelled(u64),
}

/// Owner of the shared region and the engine side of the hand-off protocol.
pub struct TransportChannel<'a> {
    service: &'a dyn DynamicSystemService,
    region: Region,
    capacity: usize,
    /// Size of the chunk that was written, but not yet acknowledged.
    pending: Option<usize>,
}

impl<'a> TransportChannel<'a> {
    /// Allocate a region of `capacity` bytes and register a duplicate of its
    /// handle with the service.
    pub fn allocate(service: &'a dyn DynamicSystemService, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }

        let channel = Self {
            service,
            region: Arc::new(Mutex::new(vec![0u8; capacity].into_boxed_slice())),
            capacity,
            pending: None,
        };

        if !service.set_transport_region(channel.handle(), capacity as u64) {
            return Err(Error::RegionRejected(capacity));
        }

        Ok(channel)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a new handle to the shared region.
    pub fn handle(&self) -> RegionHandle {
        RegionHandle {
            region: self.region.clone(),
        }
    }

    /// Copy as much of `bytes` as fits to the start of the region. Returns the
    /// number of bytes copied. The previous chunk must have been acknowledged.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if let Some(n) = self.pending {
            return Err(Error::Unacknowledged(n));
        }

        let n = bytes.len().min(self.capacity);

        let mut region = self.region.lock().unwrap_or_else(PoisonError::into_inner);
        region[..n].copy_from_slice(&bytes[..n]);

        self.pending = Some(n);

        Ok(n)
    }

    /// Hand the first `count` bytes of the region to the service and wait for
    /// it to finish consuming them.
    pub fn acknowledge(&mut self, count: usize) -> Result<()> {
        let written = self.pending.ok_or(Error::NothingWritten)?;
        if count > written {
            return Err(Error::AcknowledgeTooLarge { count, written });
        }

        if !self.service.submit_chunk(count as u64) {
            return Err(Error::SubmitFailed(count));
        }

        self.pending = None;

        Ok(())
    }

    /// Transfer the whole stream in chunks of at most [`Self::capacity`] bytes.
    /// The stream must produce exactly `size` bytes.
    ///
    /// The cancel signal is checked before every chunk. When it is set, the
    /// loop stops without submitting anything else and
    /// [`Transfer::Cancelled`] is returned.
    ///
    /// `on_progress` is invoked with zero progress before the first chunk and
    /// then after every acknowledged chunk.
    pub fn pump(
        &mut self,
        mut reader: impl Read,
        partition: &str,
        size: u64,
        cancel_signal: &AtomicBool,
        mut on_progress: impl FnMut(&Progress),
    ) -> Result<Transfer> {
        let mut progress = Progress {
            partition: partition.to_owned(),
            bytes_transferred: 0,
            total_bytes: size,
        };
        let mut buf = vec![0u8; self.capacity];

        on_progress(&progress);

        loop {
            if cancel_signal.load(Ordering::SeqCst) {
                return Ok(Transfer::Cancelled(progress.bytes_transferred));
            }

            let n = reader.read_full(&mut buf).map_err(Error::Read)?;
            if n == 0 {
                break;
            } else if progress.bytes_transferred + n as u64 > size {
                return Err(Error::TooMuchData { expected: size });
            }

            let written = self.write(&buf[..n])?;
            self.acknowledge(written)?;

            progress.bytes_transferred += written as u64;
            trace!(
                "Submitted {written} bytes of {partition}: {}/{size}",
                progress.bytes_transferred,
            );

            on_progress(&progress);
        }

        if progress.bytes_transferred != size {
            return Err(Error::TooLittleData {
                actual: progress.bytes_transferred,
                expected: size,
            });
        }

        Ok(Transfer::Complete(progress.bytes_transferred))
    }
}
