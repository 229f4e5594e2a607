// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The contract of the privileged service that owns the dynamic system
//! partitions. The installer never touches block devices itself. It only asks
//! the service to create, fill, and seal partitions.

pub mod directory;

use std::fmt;

use crate::transport::RegionHandle;

/// Status code returned by [`DynamicSystemService::create_partition`] on
/// success. Any other value is a failure.
pub const CREATE_PARTITION_OK: i32 = 0;

/// Default slot name for dynamic system installations.
pub const DEFAULT_SLOT: &str = "dsu";

/// Coarse state of the service's current operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressStatus {
    #[default]
    NoOperation,
    Working,
    Complete,
}

/// Progress of the operation the service is currently performing, eg.
/// allocating a writable partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceProgress {
    /// Name of the step or partition being processed.
    pub step: String,
    pub status: ProgressStatus,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

impl fmt::Display for ServiceProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?}: {}/{}",
            self.status, self.step, self.bytes_processed, self.total_bytes,
        )
    }
}

/// Operations exposed by the privileged dynamic system service.
///
/// Every call may block. Implementations are shared between the installation
/// worker and the thread that owns the installation, so they must handle
/// concurrent status queries.
pub trait DynamicSystemService: Send + Sync {
    /// Whether the device is currently running a dynamic system.
    fn is_in_use(&self) -> bool;

    /// Whether a dynamic system is installed and has not been removed.
    fn is_installed(&self) -> bool;

    /// Whether the installed dynamic system is enabled for the next boot.
    fn is_enabled(&self) -> bool;

    /// Progress of the service's current operation.
    fn installation_progress(&self) -> ServiceProgress;

    /// Whether another installation session is currently in progress.
    fn is_installation_active(&self) -> bool {
        self.installation_progress().status == ProgressStatus::Working
    }

    /// Begin an installation session for `slot`.
    fn start_installation(&self, slot: &str) -> bool;

    /// Create a partition of exactly `size` bytes in the current session.
    /// Returns [`CREATE_PARTITION_OK`] on success.
    fn create_partition(&self, name: &str, size: u64, read_only: bool) -> i32;

    /// Register the shared region that chunks will be submitted from. The
    /// service keeps its own duplicate of the handle.
    fn set_transport_region(&self, handle: RegionHandle, size: u64) -> bool;

    /// Consume the first `bytes` bytes of the shared region and append them to
    /// the open partition. Does not return until the region may be reused.
    fn submit_chunk(&self, bytes: u64) -> bool;

    /// Seal the open partition.
    fn close_partition(&self) -> bool;

    /// Commit the installation session.
    fn finish_installation(&self) -> bool;

    /// Abandon the installation session and discard everything written by it.
    fn abort_installation(&self) -> bool;

    /// Remove the installed dynamic system.
    fn remove(&self) -> bool;

    /// Enable or disable booting into the installed dynamic system.
    fn set_enabled(&self, enable: bool, one_shot: bool) -> bool;

    /// Suggested size for a scratch partition, or 0 if there is no suggestion.
    fn suggest_scratch_size(&self) -> u64 {
        0
    }

    /// Stop any process that is using the previous dynamic system image.
    fn force_stop_updater(&self) {}
}
