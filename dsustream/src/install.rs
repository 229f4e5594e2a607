// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Installation orchestrator.
//!
//! An installation run resolves the source, checks that the service is in a
//! state where a new dynamic system can be installed, opens a session,
//! installs the writable `userdata` partition, and then installs every image
//! partition of the source in order. The session is only committed if every
//! partition was installed and the run was never cancelled.

use std::{
    collections::HashSet,
    error::Error as StdError,
    fmt,
    io::{self, BufReader, Read},
    panic,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    format::{
        sparse::{self, CrcMode, SparseStream},
        zip::{self, ZipStreamReader},
    },
    partition::{self, ImagePartition, PartitionWriter},
    service::{DEFAULT_SLOT, DynamicSystemService},
    source::{self, ImageLocation},
    transport::{self, DEFAULT_CHUNK_SIZE, Transfer, TransportChannel},
    util::NumBytes,
};

pub use crate::transport::Progress;

/// Name of the writable partition that is always installed first.
pub const USERDATA_PARTITION: &str = "userdata";

/// Name of the partition installed from a single image.
pub const SYSTEM_PARTITION: &str = "system";

pub const DEFAULT_USERDATA_SIZE: u64 = 2 << 30;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// User-visible phase of an installation run. The `Error*` variants identify
/// the phase in which a run failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallationStep {
    ResolvingSource,
    Preparing,
    CreatingPartition,
    Installing,
    Finishing,
    ErrorAlreadyRunningDynOs,
    ErrorRequiresDiscardDsu,
    ErrorInstallationActive,
    ErrorStartSession,
    ErrorSource,
    ErrorCreatePartition,
    ErrorDecode,
    ErrorTransfer,
    ErrorClosePartition,
    ErrorFinalize,
}

impl InstallationStep {
    pub fn is_error(self) -> bool {
        self >= Self::ErrorAlreadyRunningDynOs
    }
}

impl fmt::Display for InstallationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResolvingSource => "Resolving installation source",
            Self::Preparing => "Preparing installation",
            Self::CreatingPartition => "Creating partition",
            Self::Installing => "Installing partition",
            Self::Finishing => "Finishing installation",
            Self::ErrorAlreadyRunningDynOs => "A dynamic system is currently running",
            Self::ErrorRequiresDiscardDsu => "The installed dynamic system must be discarded",
            Self::ErrorInstallationActive => "Another installation is in progress",
            Self::ErrorStartSession => "Failed to start installation",
            Self::ErrorSource => "Failed to read installation source",
            Self::ErrorCreatePartition => "Failed to create partition",
            Self::ErrorDecode => "Failed to decode image",
            Self::ErrorTransfer => "Failed to transfer image",
            Self::ErrorClosePartition => "Failed to close partition",
            Self::ErrorFinalize => "Failed to finalize installation",
        };

        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("A dynamic system is currently running")]
    AlreadyRunningDynOs,
    #[error("Another installation is in progress")]
    InstallationActive,
    #[error("A dynamic system is already installed and must be discarded first")]
    RequiresDiscard,
    #[error("Invalid installation source: {0}")]
    InvalidSource(String),
    #[error("Partition {0:?} appears more than once")]
    DuplicatePartition(String),
    #[error("Service refused to start an installation in slot {0:?}")]
    StartSession(String),
    #[error("Failed to set up transport region")]
    SetTransport(#[source] transport::Error),
    #[error("Failed to open source for partition {partition:?}")]
    Source {
        partition: String,
        #[source]
        source: source::Error,
    },
    #[error("Failed to open package")]
    Package(#[source] source::Error),
    #[error("Failed to read package")]
    Archive(#[source] zip::Error),
    #[error("Failed to create partition {name:?}: status {status}")]
    CreatePartition { name: String, status: i32 },
    #[error("Failed to close partition {0:?}")]
    ClosePartition(String),
    #[error("Invalid sparse image for partition {partition:?}")]
    Decode {
        partition: String,
        #[source]
        source: sparse::Error,
    },
    #[error("Failed to read data for partition {partition:?}")]
    Io {
        partition: String,
        #[source]
        source: io::Error,
    },
    #[error("Size mismatch for partition {partition:?}")]
    SizeMismatch {
        partition: String,
        #[source]
        source: transport::Error,
    },
    #[error("Failed to submit data for partition {partition:?}")]
    SubmitChunk {
        partition: String,
        #[source]
        source: transport::Error,
    },
    #[error("Partition lifecycle error")]
    Lifecycle(#[source] partition::Error),
    #[error("Service failed to finalize the installation")]
    Finalize,
}

impl Error {
    /// The error step reported to observers for this error.
    pub fn step(&self) -> InstallationStep {
        match self {
            Self::AlreadyRunningDynOs => InstallationStep::ErrorAlreadyRunningDynOs,
            Self::InstallationActive => InstallationStep::ErrorInstallationActive,
            Self::RequiresDiscard => InstallationStep::ErrorRequiresDiscardDsu,
            Self::InvalidSource(_)
            | Self::DuplicatePartition(_)
            | Self::Source { .. }
            | Self::Package(_)
            | Self::Archive(_) => InstallationStep::ErrorSource,
            Self::StartSession(_) => InstallationStep::ErrorStartSession,
            Self::CreatePartition { .. } => InstallationStep::ErrorCreatePartition,
            Self::ClosePartition(_) => InstallationStep::ErrorClosePartition,
            Self::Decode { .. } => InstallationStep::ErrorDecode,
            Self::SetTransport(_)
            | Self::Io { .. }
            | Self::SizeMismatch { .. }
            | Self::SubmitChunk { .. }
            | Self::Lifecycle(_) => InstallationStep::ErrorTransfer,
            Self::Finalize => InstallationStep::ErrorFinalize,
        }
    }

    /// The error message followed by the messages of all of its sources.
    pub fn detail(&self) -> String {
        let mut detail = self.to_string();
        let mut source = self.source();

        while let Some(e) = source {
            detail.push_str(": ");
            detail.push_str(&e.to_string());
            source = e.source();
        }

        detail
    }

    /// Classify a read error as either a decode error or an I/O error of the
    /// underlying stream.
    fn from_read(partition: &str, e: io::Error) -> Self {
        let partition = partition.to_owned();

        if sparse::decode_error(&e).is_none() {
            return Self::Io {
                partition,
                source: e,
            };
        }

        let kind = e.kind();

        match e.into_inner().map(|inner| inner.downcast::<sparse::Error>()) {
            Some(Ok(source)) => Self::Decode {
                partition,
                source: *source,
            },
            Some(Err(inner)) => Self::Io {
                partition,
                source: io::Error::new(kind, inner),
            },
            None => Self::Io {
                partition,
                source: kind.into(),
            },
        }
    }
}

impl From<partition::Error> for Error {
    fn from(e: partition::Error) -> Self {
        match e {
            partition::Error::Create { name, status } => Self::CreatePartition { name, status },
            partition::Error::Close(name) => Self::ClosePartition(name),
            partition::Error::Transfer { name, source } => match source {
                transport::Error::Read(e) => Self::from_read(&name, e),
                e @ (transport::Error::TooMuchData { .. }
                | transport::Error::TooLittleData { .. }) => Self::SizeMismatch {
                    partition: name,
                    source: e,
                },
                e => Self::SubmitChunk {
                    partition: name,
                    source: e,
                },
            },
            e @ partition::Error::InvalidState { .. } => Self::Lifecycle(e),
        }
    }
}

/// How an installation run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Every partition was installed and the session was committed.
    Success,
    Failed(Error),
    /// The run stopped after observing the cancel signal. Nothing was
    /// committed.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// An image to install as its own partition.
#[derive(Debug)]
pub struct ImageDescriptor {
    pub name: String,
    pub image: ImageLocation,
    /// Size of the image data. If the image is sparse, the size from its
    /// header is used instead. May be omitted for local files.
    pub size: Option<u64>,
    pub read_only: bool,
}

/// What to install.
#[derive(Debug)]
pub enum InstallationSource {
    /// A single image installed as the `system` partition.
    SingleImage {
        image: ImageLocation,
        size: Option<u64>,
    },
    /// Several images installed in order.
    MultipleImages(Vec<ImageDescriptor>),
    /// A zip archive where every `*.img` entry is a partition image.
    Package(ImageLocation),
    /// A zip archive fetched from an `http://` or `https://` URL.
    RemoteUrl(String),
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidSource(format!("Invalid partition name: {name:?}")));
    }

    Ok(())
}

impl InstallationSource {
    /// Check the parts of the source that are known before any data is read.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::SingleImage { .. } | Self::Package(_) => Ok(()),
            Self::MultipleImages(images) => {
                if images.is_empty() {
                    return Err(Error::InvalidSource("No images specified".to_owned()));
                }

                let mut names = HashSet::new();
                names.insert(USERDATA_PARTITION);

                for image in images {
                    validate_name(&image.name)?;

                    if !names.insert(image.name.as_str()) {
                        return Err(Error::DuplicatePartition(image.name.clone()));
                    }
                }

                Ok(())
            }
            Self::RemoteUrl(url) => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(())
                } else {
                    Err(Error::InvalidSource(format!("Not an HTTP(S) URL: {url}")))
                }
            }
        }
    }
}

/// Receives notifications about an installation run. Every method defaults to
/// doing nothing. Exactly one of [`Self::on_success`], [`Self::on_error`], and
/// [`Self::on_cancelled`] is called at the end of a run and nothing is called
/// after it.
pub trait InstallObserver {
    fn on_step(&mut self, _step: InstallationStep) {}

    fn on_progress(&mut self, _progress: &Progress) {}

    fn on_partition_created(&mut self, _name: &str) {}

    fn on_error(&mut self, _step: InstallationStep, _detail: &str) {}

    fn on_success(&mut self) {}

    fn on_cancelled(&mut self) {}
}

/// Notification forwarded by [`ChannelObserver`].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Step(InstallationStep),
    Progress(Progress),
    PartitionCreated(String),
    Error {
        step: InstallationStep,
        detail: String,
    },
    Success,
    Cancelled,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Success | Self::Cancelled)
    }
}

/// Observer that forwards every notification over an unbounded channel. A
/// dropped receiver is ignored.
#[derive(Clone, Debug)]
pub struct ChannelObserver {
    sender: mpsc::Sender<Event>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl InstallObserver for ChannelObserver {
    fn on_step(&mut self, step: InstallationStep) {
        self.send(Event::Step(step));
    }

    fn on_progress(&mut self, progress: &Progress) {
        self.send(Event::Progress(progress.clone()));
    }

    fn on_partition_created(&mut self, name: &str) {
        self.send(Event::PartitionCreated(name.to_owned()));
    }

    fn on_error(&mut self, step: InstallationStep, detail: &str) {
        self.send(Event::Error {
            step,
            detail: detail.to_owned(),
        });
    }

    fn on_success(&mut self) {
        self.send(Event::Success);
    }

    fn on_cancelled(&mut self) {
        self.send(Event::Cancelled);
    }
}

/// One-way cancellation flag shared between the caller and the worker.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing signal, eg. one set by a Ctrl-C handler.
    pub fn from_signal(signal: Arc<AtomicBool>) -> Self {
        Self(signal)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> &AtomicBool {
        &self.0
    }
}

/// Tunables for an installation run.
#[derive(Clone, Debug)]
pub struct InstallOptions {
    /// Slot to install into.
    pub slot: String,
    pub userdata_size: u64,
    /// Size of the shared transport region.
    pub chunk_size: usize,
    pub crc_mode: CrcMode,
    /// How often to poll the service while it allocates `userdata`.
    pub poll_interval: Duration,
    /// Connect and read timeout for remote sources.
    pub http_timeout: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            slot: DEFAULT_SLOT.to_owned(),
            userdata_size: DEFAULT_USERDATA_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            crc_mode: CrcMode::Validate,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

/// Why a run stopped early.
enum Stop {
    Cancelled,
    Failed(Error),
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

impl From<partition::Error> for Stop {
    fn from(e: partition::Error) -> Self {
        Self::Failed(e.into())
    }
}

/// A configured installation run.
pub struct Installer {
    service: Arc<dyn DynamicSystemService>,
    source: InstallationSource,
    options: InstallOptions,
    cancel: CancelToken,
}

impl Installer {
    pub fn new(service: Arc<dyn DynamicSystemService>, source: InstallationSource) -> Self {
        Self {
            service,
            source,
            options: InstallOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the installation on the current thread.
    pub fn run(self, observer: &mut dyn InstallObserver) -> Outcome {
        let outcome = match self.execute(observer) {
            Ok(()) => Outcome::Success,
            Err(Stop::Cancelled) => Outcome::Cancelled,
            Err(Stop::Failed(e)) => Outcome::Failed(e),
        };

        match &outcome {
            Outcome::Success => {
                info!("Installation completed successfully");
                observer.on_success();
            }
            Outcome::Failed(e) => {
                let detail = e.detail();
                warn!("Installation failed: {detail}");
                observer.on_error(e.step(), &detail);
            }
            Outcome::Cancelled => {
                warn!("Installation cancelled");
                observer.on_cancelled();
            }
        }

        outcome
    }

    /// Run the installation on a dedicated worker thread.
    pub fn spawn(
        self,
        mut observer: impl InstallObserver + Send + 'static,
    ) -> io::Result<InstallHandle> {
        let cancel = self.cancel_token();
        let thread = thread::Builder::new()
            .name("dsu-install".to_owned())
            .spawn(move || self.run(&mut observer))?;

        Ok(InstallHandle { cancel, thread })
    }

    fn execute(self, observer: &mut dyn InstallObserver) -> Result<(), Stop> {
        let Self {
            service,
            source: install_source,
            options,
            cancel,
        } = self;
        let cancel_signal = cancel.signal();

        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        observer.on_step(InstallationStep::ResolvingSource);
        install_source.validate()?;

        observer.on_step(InstallationStep::Preparing);

        if service.is_in_use() {
            return Err(Error::AlreadyRunningDynOs.into());
        } else if service.is_installation_active() {
            return Err(Error::InstallationActive.into());
        } else if service.is_installed() {
            return Err(Error::RequiresDiscard.into());
        }

        service.force_stop_updater();

        info!("Starting installation in slot {:?}", options.slot);
        if !service.start_installation(&options.slot) {
            return Err(Error::StartSession(options.slot.clone()).into());
        }

        let channel = TransportChannel::allocate(&*service, options.chunk_size)
            .map_err(Error::SetTransport)?;

        let mut session = Session {
            service: &*service,
            channel,
            options: &options,
            cancel_signal,
            observer,
            names: HashSet::new(),
        };

        session.install_userdata()?;

        match install_source {
            InstallationSource::SingleImage { image, size } => {
                session.install_image(SYSTEM_PARTITION, image, size, true)?;
            }
            InstallationSource::MultipleImages(images) => {
                for image in images {
                    session.install_image(&image.name, image.image, image.size, image.read_only)?;
                }
            }
            InstallationSource::Package(image) => {
                let reader = image.open(options.http_timeout).map_err(Error::Package)?;
                session.install_package(reader)?;
            }
            InstallationSource::RemoteUrl(url) => {
                let reader =
                    source::open_url(&url, options.http_timeout).map_err(Error::Package)?;
                session.install_package(reader)?;
            }
        }

        session.check_cancel()?;

        session.observer.on_step(InstallationStep::Finishing);
        if !service.finish_installation() {
            return Err(Error::Finalize.into());
        }

        Ok(())
    }
}

/// Handle to an installation running on a worker thread.
pub struct InstallHandle {
    cancel: CancelToken,
    thread: JoinHandle<Outcome>,
}

impl InstallHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run to end. A panic on the worker thread is propagated.
    pub fn join(self) -> Outcome {
        self.thread
            .join()
            .unwrap_or_else(|e| panic::resume_unwind(e))
    }
}

/// State of an installation session after it was started.
struct Session<'a, O: InstallObserver + ?Sized> {
    service: &'a dyn DynamicSystemService,
    channel: TransportChannel<'a>,
    options: &'a InstallOptions,
    cancel_signal: &'a AtomicBool,
    observer: &'a mut O,
    /// Partitions created so far.
    names: HashSet<String>,
}

impl<O: InstallObserver + ?Sized> Session<'_, O> {
    fn check_cancel(&self) -> Result<(), Stop> {
        if self.cancel_signal.load(Ordering::SeqCst) {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    fn claim_name(&mut self, name: &str) -> Result<(), Error> {
        validate_name(name)?;

        if !self.names.insert(name.to_owned()) {
            return Err(Error::DuplicatePartition(name.to_owned()));
        }

        Ok(())
    }

    /// Create the writable `userdata` partition and wait for the service to
    /// allocate it.
    fn install_userdata(&mut self) -> Result<(), Stop> {
        self.check_cancel()?;
        self.claim_name(USERDATA_PARTITION)?;

        let mut partition = PartitionWriter::new(
            self.service,
            ImagePartition {
                name: USERDATA_PARTITION.to_owned(),
                size: self.options.userdata_size,
                read_only: false,
            },
        );

        self.observer.on_step(InstallationStep::CreatingPartition);
        partition.create()?;
        self.observer.on_partition_created(USERDATA_PARTITION);

        info!(
            "Allocating {USERDATA_PARTITION}: {:?}",
            NumBytes(self.options.userdata_size),
        );

        self.observer.on_step(InstallationStep::Installing);
        let observer = &mut *self.observer;
        let transfer =
            partition.wait_allocated(self.options.poll_interval, self.cancel_signal, |p| {
                observer.on_progress(p)
            })?;

        if let Transfer::Cancelled(_) = transfer {
            return Err(Stop::Cancelled);
        }

        partition.close()?;

        Ok(())
    }

    /// Open an image and install it as a partition.
    fn install_image(
        &mut self,
        name: &str,
        image: ImageLocation,
        size: Option<u64>,
        read_only: bool,
    ) -> Result<(), Stop> {
        self.check_cancel()?;

        let size = size.or_else(|| image.local_size());
        let reader = image
            .open(self.options.http_timeout)
            .map_err(|source| Error::Source {
                partition: name.to_owned(),
                source,
            })?;

        self.install_stream(name, reader, size, read_only)
    }

    /// Install a package by streaming through its entries. Every partition
    /// image inside is installed as a read-only partition.
    fn install_package(&mut self, reader: impl Read) -> Result<(), Stop> {
        let mut package = ZipStreamReader::new(reader);
        let mut installed = 0;

        loop {
            self.check_cancel()?;

            let Some(entry) = package.next_entry().map_err(Error::Archive)? else {
                break;
            };

            let Some(name) = source::entry_partition_name(&entry).map(str::to_owned) else {
                debug!("Skipping package entry: {:?}", entry.name());
                continue;
            };

            // Entries written in streaming mode have no size in the local
            // header. Sparse images still carry their size in their own
            // header.
            let size = entry.size();

            self.install_stream(&name, entry, size, true)?;
            installed += 1;
        }

        if installed == 0 {
            return Err(
                Error::InvalidSource("Package contains no partition images".to_owned()).into(),
            );
        }

        Ok(())
    }

    /// Decode and install a single partition from `reader`.
    fn install_stream(
        &mut self,
        name: &str,
        reader: impl Read,
        declared_size: Option<u64>,
        read_only: bool,
    ) -> Result<(), Stop> {
        self.claim_name(name)?;

        let stream = SparseStream::new(BufReader::new(reader), self.options.crc_mode)
            .map_err(|source| Error::Decode {
                partition: name.to_owned(),
                source,
            })?;

        let size = match (stream.unsparsed_size(), declared_size) {
            (Some(unsparsed), declared) => {
                if let Some(declared) = declared {
                    debug!("Sparse image {name}: declared={declared}, unsparsed={unsparsed}");
                }
                unsparsed
            }
            (None, Some(declared)) => declared,
            (None, None) => {
                return Err(Error::InvalidSource(format!(
                    "Size of raw image for {name:?} is unknown"
                ))
                .into());
            }
        };

        let mut partition = PartitionWriter::new(
            self.service,
            ImagePartition {
                name: name.to_owned(),
                size,
                read_only,
            },
        );

        self.observer.on_step(InstallationStep::CreatingPartition);
        partition.create()?;
        self.observer.on_partition_created(name);

        info!("Installing {name}: {:?}", NumBytes(size));

        self.observer.on_step(InstallationStep::Installing);
        let observer = &mut *self.observer;
        let transfer =
            partition.write_from(&mut self.channel, stream, self.cancel_signal, |p| {
                observer.on_progress(p)
            })?;

        if let Transfer::Cancelled(n) = transfer {
            debug!("Cancelled {name} after {n} bytes");
            return Err(Stop::Cancelled);
        }

        partition.close()?;

        Ok(())
    }
}
