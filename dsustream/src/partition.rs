// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Lifecycle of a single partition inside an installation session.
//!
//! ```text
//! Uncreated -> Created -> Writing -> Closed
//!                  \          \
//!                   +----------+--> Failed
//! ```
//!
//! Only one partition may be open in the service at a time. The installer
//! drives each partition from creation to closing before the next one is
//! created.

use std::{
    io::Read,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    service::{CREATE_PARTITION_OK, DynamicSystemService, ProgressStatus},
    transport::{self, Progress, Transfer, TransportChannel},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionState {
    Uncreated,
    Created,
    Writing,
    Closed,
    Failed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create partition {name:?}: status {status}")]
    Create { name: String, status: i32 },
    #[error("Failed to close partition {0:?}")]
    Close(String),
    #[error("Cannot {operation} partition {name:?} in state {state:?}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: PartitionState,
    },
    #[error("Failed to transfer data to partition {name:?}")]
    Transfer {
        name: String,
        #[source]
        source: transport::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A partition to be created in the current installation session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePartition {
    pub name: String,
    /// Size in bytes. The data written must match exactly unless the partition
    /// is writable and filled in by the service.
    pub size: u64,
    pub read_only: bool,
}

/// Drives one partition through its lifecycle.
pub struct PartitionWriter<'a> {
    service: &'a dyn DynamicSystemService,
    partition: ImagePartition,
    state: PartitionState,
}

impl<'a> PartitionWriter<'a> {
    pub fn new(service: &'a dyn DynamicSystemService, partition: ImagePartition) -> Self {
        Self {
            service,
            partition,
            state: PartitionState::Uncreated,
        }
    }

    pub fn partition(&self) -> &ImagePartition {
        &self.partition
    }

    pub fn name(&self) -> &str {
        &self.partition.name
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    fn expect_state(&self, operation: &'static str, expected: &[PartitionState]) -> Result<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                name: self.partition.name.clone(),
                operation,
                state: self.state,
            })
        }
    }

    /// Ask the service to create the partition.
    pub fn create(&mut self) -> Result<()> {
        self.expect_state("create", &[PartitionState::Uncreated])?;

        let p = &self.partition;
        debug!(
            "Creating partition {:?}: size={}, read_only={}",
            p.name, p.size, p.read_only,
        );

        let status = self.service.create_partition(&p.name, p.size, p.read_only);
        if status != CREATE_PARTITION_OK {
            self.state = PartitionState::Failed;
            return Err(Error::Create {
                name: p.name.clone(),
                status,
            });
        }

        self.state = PartitionState::Created;

        Ok(())
    }

    /// Stream the partition contents through `channel`. The stream must
    /// produce exactly the partition size. On [`Transfer::Cancelled`], the
    /// partition remains in [`PartitionState::Writing`] and must not be
    /// closed.
    pub fn write_from(
        &mut self,
        channel: &mut TransportChannel,
        reader: impl Read,
        cancel_signal: &AtomicBool,
        on_progress: impl FnMut(&Progress),
    ) -> Result<Transfer> {
        self.expect_state("write", &[PartitionState::Created])?;
        self.state = PartitionState::Writing;

        let p = &self.partition;

        channel
            .pump(reader, &p.name, p.size, cancel_signal, on_progress)
            .map_err(|source| {
                self.state = PartitionState::Failed;
                Error::Transfer {
                    name: p.name.clone(),
                    source,
                }
            })
    }

    /// Wait for the service to finish allocating a writable partition that
    /// has no payload. The service's progress is polled every `poll_interval`
    /// and forwarded to `on_progress` until it is no longer working.
    pub fn wait_allocated(
        &mut self,
        poll_interval: Duration,
        cancel_signal: &AtomicBool,
        mut on_progress: impl FnMut(&Progress),
    ) -> Result<Transfer> {
        self.expect_state("allocate", &[PartitionState::Created])?;
        self.state = PartitionState::Writing;

        let mut progress = Progress {
            partition: self.partition.name.clone(),
            bytes_transferred: 0,
            total_bytes: self.partition.size,
        };

        on_progress(&progress);

        loop {
            if cancel_signal.load(Ordering::SeqCst) {
                return Ok(Transfer::Cancelled(progress.bytes_transferred));
            }

            let status = self.service.installation_progress();
            if status.status != ProgressStatus::Working {
                break;
            }

            let processed = status.bytes_processed.min(progress.total_bytes);
            if processed > progress.bytes_transferred {
                progress.bytes_transferred = processed;
                on_progress(&progress);
            }

            thread::sleep(poll_interval);
        }

        if progress.bytes_transferred != progress.total_bytes {
            progress.bytes_transferred = progress.total_bytes;
            on_progress(&progress);
        }

        Ok(Transfer::Complete(progress.total_bytes))
    }

    /// Seal the partition. Must be called after all data has been written.
    pub fn close(&mut self) -> Result<()> {
        self.expect_state("close", &[PartitionState::Writing])?;

        if !self.service.close_partition() {
            self.state = PartitionState::Failed;
            return Err(Error::Close(self.partition.name.clone()));
        }

        debug!("Closed partition {:?}", self.partition.name);
        self.state = PartitionState::Closed;

        Ok(())
    }
}
