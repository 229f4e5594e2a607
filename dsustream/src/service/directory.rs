// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! A [`DynamicSystemService`] that stores each slot as a directory of raw
//! partition images.
//!
//! ```text
//! <root>/<slot>/<partition>.img
//! <root>/<slot>/installed      (written when the installation is committed)
//! <root>/<slot>/enabled        (present while the slot is enabled)
//! ```

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    service::{CREATE_PARTITION_OK, DynamicSystemService, ProgressStatus, ServiceProgress},
    transport::RegionHandle,
};

const INSTALLED_MARKER: &str = "installed";
const ENABLED_MARKER: &str = "enabled";
const IMAGE_EXTENSION: &str = "img";

const STATUS_NO_SESSION: i32 = 1;
const STATUS_PARTITION_OPEN: i32 = 2;
const STATUS_INVALID_NAME: i32 = 3;
const STATUS_IO_ERROR: i32 = 4;

/// A partition of a committed installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub name: String,
    pub size: u64,
    pub read_only: bool,
}

/// Contents of the `installed` marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledSlot {
    pub slot: String,
    pub partitions: Vec<PartitionRecord>,
}

/// Contents of the `enabled` marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct EnabledMarker {
    one_shot: bool,
}

struct OpenPartition {
    record: PartitionRecord,
    file: File,
    written: u64,
}

struct Session {
    slot: String,
    dir: PathBuf,
    partitions: Vec<PartitionRecord>,
    open: Option<OpenPartition>,
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    region: Option<RegionHandle>,
}

pub struct DirectoryService {
    root: PathBuf,
    state: Mutex<State>,
}

impl DirectoryService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_dir(&self, slot: &str) -> PathBuf {
        self.root.join(slot)
    }

    /// Path of a partition image inside a slot.
    pub fn image_path(&self, slot: &str, partition: &str) -> PathBuf {
        self.slot_dir(slot)
            .join(partition)
            .with_extension(IMAGE_EXTENSION)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the committed installation, if any.
    pub fn installed(&self) -> io::Result<Option<InstalledSlot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let marker = entry?.path().join(INSTALLED_MARKER);
            if !marker.is_file() {
                continue;
            }

            let data = fs::read_to_string(&marker)?;
            let installed = toml_edit::de::from_str(&data)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            return Ok(Some(installed));
        }

        Ok(None)
    }

    fn installed_or_warn(&self) -> Option<InstalledSlot> {
        match self.installed() {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Failed to read installation state: {e}");
                None
            }
        }
    }

    /// Whether the enabled slot should only be booted once.
    pub fn is_one_shot(&self) -> bool {
        let Some(installed) = self.installed_or_warn() else {
            return false;
        };

        fs::read_to_string(self.slot_dir(&installed.slot).join(ENABLED_MARKER))
            .ok()
            .and_then(|data| toml_edit::de::from_str::<EnabledMarker>(&data).ok())
            .is_some_and(|m| m.one_shot)
    }

    fn create_partition_file(path: &Path, size: u64) -> io::Result<File> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.set_len(size)?;

        Ok(file)
    }

    fn write_installed(session: &Session) -> io::Result<()> {
        let installed = InstalledSlot {
            slot: session.slot.clone(),
            partitions: session.partitions.clone(),
        };
        let data = toml_edit::ser::to_string_pretty(&installed)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = File::create(session.dir.join(INSTALLED_MARKER))?;
        file.write_all(data.as_bytes())?;
        file.sync_all()
    }

    fn remove_dir(dir: &Path) -> bool {
        match fs::remove_dir_all(dir) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to remove {dir:?}: {e}");
                false
            }
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != INSTALLED_MARKER
        && name != ENABLED_MARKER
        && !name.contains(['/', '\\', '\0'])
}

impl DynamicSystemService for DirectoryService {
    fn is_in_use(&self) -> bool {
        false
    }

    fn is_installed(&self) -> bool {
        self.installed_or_warn().is_some()
    }

    fn is_enabled(&self) -> bool {
        self.installed_or_warn()
            .is_some_and(|i| self.slot_dir(&i.slot).join(ENABLED_MARKER).is_file())
    }

    fn installation_progress(&self) -> ServiceProgress {
        let state = self.state();
        let Some(open) = state.session.as_ref().and_then(|s| s.open.as_ref()) else {
            return ServiceProgress::default();
        };

        // Writable partitions are fully allocated by create_partition().
        let (status, bytes_processed) = if open.record.read_only {
            (ProgressStatus::Working, open.written)
        } else {
            (ProgressStatus::Complete, open.record.size)
        };

        ServiceProgress {
            step: open.record.name.clone(),
            status,
            bytes_processed,
            total_bytes: open.record.size,
        }
    }

    fn is_installation_active(&self) -> bool {
        self.state().session.is_some()
    }

    fn start_installation(&self, slot: &str) -> bool {
        let mut state = self.state();

        if state.session.is_some() {
            warn!("Installation session already active");
            return false;
        } else if !valid_name(slot) {
            warn!("Invalid slot name: {slot:?}");
            return false;
        } else if self.installed_or_warn().is_some() {
            warn!("A dynamic system is already installed");
            return false;
        }

        let dir = self.slot_dir(slot);
        if !Self::remove_dir(&dir) {
            return false;
        }
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Failed to create {dir:?}: {e}");
            return false;
        }

        debug!("Started session for slot {slot:?} in {dir:?}");

        state.session = Some(Session {
            slot: slot.to_owned(),
            dir,
            partitions: vec![],
            open: None,
        });

        true
    }

    fn create_partition(&self, name: &str, size: u64, read_only: bool) -> i32 {
        let mut state = self.state();
        let Some(session) = state.session.as_mut() else {
            return STATUS_NO_SESSION;
        };

        if session.open.is_some() {
            return STATUS_PARTITION_OPEN;
        } else if !valid_name(name) || session.partitions.iter().any(|p| p.name == name) {
            return STATUS_INVALID_NAME;
        }

        let path = session.dir.join(name).with_extension(IMAGE_EXTENSION);
        let file = match Self::create_partition_file(&path, size) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to create {path:?}: {e}");
                return STATUS_IO_ERROR;
            }
        };

        debug!("Created {path:?} with size {size}");

        session.open = Some(OpenPartition {
            record: PartitionRecord {
                name: name.to_owned(),
                size,
                read_only,
            },
            file,
            written: 0,
        });

        CREATE_PARTITION_OK
    }

    fn set_transport_region(&self, handle: RegionHandle, size: u64) -> bool {
        if handle.len() as u64 != size {
            return false;
        }

        self.state().region = Some(handle);

        true
    }

    fn submit_chunk(&self, bytes: u64) -> bool {
        let mut state = self.state();
        let State { session, region } = &mut *state;

        let (Some(region), Some(open)) = (region, session.as_mut().and_then(|s| s.open.as_mut()))
        else {
            return false;
        };

        if open.written + bytes > open.record.size {
            warn!(
                "Chunk of {bytes} bytes exceeds partition {:?} at offset {}",
                open.record.name, open.written,
            );
            return false;
        }

        let Ok(len) = usize::try_from(bytes) else {
            return false;
        };

        match region.with_bytes(len, |data| open.file.write_all(data)) {
            Some(Ok(())) => {
                open.written += bytes;
                true
            }
            Some(Err(e)) => {
                warn!("Failed to write to {:?}: {e}", open.record.name);
                false
            }
            None => false,
        }
    }

    fn close_partition(&self) -> bool {
        let mut state = self.state();
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        let Some(open) = session.open.take() else {
            return false;
        };

        if open.record.read_only && open.written != open.record.size {
            warn!(
                "Partition {:?} closed after {} of {} bytes",
                open.record.name, open.written, open.record.size,
            );
            return false;
        }

        if let Err(e) = open.file.sync_all() {
            warn!("Failed to sync {:?}: {e}", open.record.name);
            return false;
        }

        session.partitions.push(open.record);

        true
    }

    fn finish_installation(&self) -> bool {
        let mut state = self.state();
        let Some(session) = state.session.as_ref() else {
            return false;
        };

        if session.open.is_some() {
            warn!("Cannot finish installation with an open partition");
            return false;
        }

        if let Err(e) = Self::write_installed(session) {
            warn!("Failed to commit slot {:?}: {e}", session.slot);
            return false;
        }

        debug!("Committed slot {:?}", session.slot);
        state.session = None;
        state.region = None;

        true
    }

    fn abort_installation(&self) -> bool {
        let mut state = self.state();
        let Some(session) = state.session.take() else {
            return false;
        };

        state.region = None;

        Self::remove_dir(&session.dir)
    }

    fn remove(&self) -> bool {
        if self.state().session.is_some() {
            return false;
        }

        match self.installed_or_warn() {
            Some(installed) => Self::remove_dir(&self.slot_dir(&installed.slot)),
            None => false,
        }
    }

    fn set_enabled(&self, enable: bool, one_shot: bool) -> bool {
        let Some(installed) = self.installed_or_warn() else {
            return false;
        };

        let marker = self.slot_dir(&installed.slot).join(ENABLED_MARKER);

        let result = if enable {
            toml_edit::ser::to_string(&EnabledMarker { one_shot })
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
                .and_then(|data| fs::write(&marker, data))
        } else {
            match fs::remove_file(&marker) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                r => r,
            }
        };

        if let Err(e) = result {
            warn!("Failed to update {marker:?}: {e}");
            return false;
        }

        true
    }
}
