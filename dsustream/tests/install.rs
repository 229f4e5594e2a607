// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::{
    fs,
    io::{Cursor, Write},
    sync::Arc,
    time::Duration,
};

use assert_matches::assert_matches;
use dsustream::{
    format::sparse::{self, Chunk, ChunkBounds, ChunkData, Header, SparseWriter},
    install::{
        CancelToken, ChannelObserver, Event, ImageDescriptor, InstallObserver, InstallOptions,
        InstallationSource, InstallationStep, Installer, Outcome, Progress,
    },
    service::{DynamicSystemService, directory::DirectoryService},
    source::ImageLocation,
};
use zip::{ZipWriter, write::SimpleFileOptions};

use common::{Call, FakeService, error_step, serve_once, streaming_package, terminal};

const CHUNK_SIZE: usize = 300;
const USERDATA_SIZE: u64 = 4096;

fn options() -> InstallOptions {
    InstallOptions {
        chunk_size: CHUNK_SIZE,
        userdata_size: USERDATA_SIZE,
        poll_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn raw_image(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Sparse image with a fill chunk followed by a data chunk.
fn sparse_image(block_size: u32, fill_blocks: u32, data: &[u8]) -> Vec<u8> {
    let data_blocks = data.len() as u32 / block_size;
    let header = Header {
        major_version: sparse::MAJOR_VERSION,
        minor_version: sparse::MINOR_VERSION,
        block_size,
        num_blocks: fill_blocks + data_blocks,
        num_chunks: 2,
        crc32: 0,
    };

    let mut writer = SparseWriter::new(Cursor::new(Vec::new()), header).unwrap();
    writer
        .start_chunk(Chunk {
            bounds: ChunkBounds {
                start: 0,
                end: fill_blocks,
            },
            data: ChunkData::Fill(0x01010101),
        })
        .unwrap();
    writer
        .start_chunk(Chunk {
            bounds: ChunkBounds {
                start: fill_blocks,
                end: fill_blocks + data_blocks,
            },
            data: ChunkData::Data,
        })
        .unwrap();
    writer.write_all(data).unwrap();

    writer.finish().unwrap().into_inner()
}

fn reader(data: Vec<u8>) -> ImageLocation {
    ImageLocation::Reader(Box::new(Cursor::new(data)))
}

fn descriptor(name: &str, data: Vec<u8>) -> ImageDescriptor {
    let size = data.len() as u64;

    ImageDescriptor {
        name: name.to_owned(),
        image: reader(data),
        size: Some(size),
        read_only: true,
    }
}

fn run_with(
    service: &Arc<FakeService>,
    source: InstallationSource,
    cancel: CancelToken,
) -> (Outcome, Vec<Event>) {
    let (mut observer, receiver) = ChannelObserver::new();
    let outcome = Installer::new(service.clone(), source)
        .with_options(options())
        .with_cancel_token(cancel)
        .run(&mut observer);

    (outcome, receiver.try_iter().collect())
}

fn run(service: &Arc<FakeService>, source: InstallationSource) -> (Outcome, Vec<Event>) {
    run_with(service, source, CancelToken::new())
}

fn progress_of(events: &[Event], partition: &str) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(p) if p.partition == partition => Some(p.bytes_transferred),
            _ => None,
        })
        .collect()
}

#[test]
fn single_raw_image() {
    let service = Arc::new(FakeService::default());
    let image = raw_image(1000);

    let (outcome, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(image.clone()),
            size: Some(1000),
        },
    );

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(terminal(&events), &Event::Success);

    assert_eq!(
        service.calls(),
        [
            Call::ForceStop,
            Call::Start("dsu".to_owned()),
            Call::SetRegion(CHUNK_SIZE as u64),
            Call::Create {
                name: "userdata".to_owned(),
                size: USERDATA_SIZE,
                read_only: false,
            },
            Call::Close,
            Call::Create {
                name: "system".to_owned(),
                size: 1000,
                read_only: true,
            },
            Call::Submit(300),
            Call::Submit(300),
            Call::Submit(300),
            Call::Submit(100),
            Call::Close,
            Call::Finish,
        ]
    );

    assert_eq!(service.data("system"), Some(image));
    assert_eq!(progress_of(&events, "system"), [0, 300, 600, 900, 1000]);
    assert!(events.contains(&Event::PartitionCreated("system".to_owned())));
}

#[test]
fn userdata_allocation_is_polled() {
    let service = Arc::new(FakeService::with(|s| s.allocation_polls = 2.into()));

    let (outcome, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(10)),
            size: Some(10),
        },
    );

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(progress_of(&events, "userdata"), [0, 1, USERDATA_SIZE]);
    assert_eq!(service.created(), ["userdata", "system"]);
}

#[test]
fn sparse_image_uses_unsparsed_size() {
    let service = Arc::new(FakeService::default());
    let data = raw_image(8);
    let image = sparse_image(4, 1024, &data);

    let (outcome, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(image.clone()),
            // Size of the sparse file itself, which must be ignored.
            size: Some(image.len() as u64),
        },
    );

    assert_matches!(outcome, Outcome::Success);
    assert_matches!(
        &service.calls()[5],
        Call::Create { name, size: 4104, read_only: true } if name == "system"
    );

    let written = service.data("system").unwrap();
    assert_eq!(written.len(), 4104);
    assert!(written[..4096].iter().all(|b| *b == 1));
    assert_eq!(&written[4096..], &data);

    let progress = progress_of(&events, "system");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&4104));
}

#[test]
fn multiple_images_in_order() {
    let service = Arc::new(FakeService::default());

    let (outcome, events) = run(
        &service,
        InstallationSource::MultipleImages(vec![
            descriptor("system", raw_image(700)),
            ImageDescriptor {
                read_only: false,
                ..descriptor("product", raw_image(20))
            },
        ]),
    );

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(service.created(), ["userdata", "system", "product"]);
    assert_eq!(service.submits(), [300, 300, 100, 20]);
    assert!(service.calls().contains(&Call::Create {
        name: "product".to_owned(),
        size: 20,
        read_only: false,
    }));

    // Progress restarts at 0 for every partition.
    assert_eq!(progress_of(&events, "system"), [0, 300, 600, 700]);
    assert_eq!(progress_of(&events, "product"), [0, 20]);
}

#[test]
fn create_failure_stops_run() {
    let service = Arc::new(FakeService::with(|s| {
        s.fail_create = Some("vendor".to_owned());
    }));

    let (outcome, events) = run(
        &service,
        InstallationSource::MultipleImages(vec![
            descriptor("system", raw_image(10)),
            descriptor("vendor", raw_image(10)),
            descriptor("product", raw_image(10)),
        ]),
    );

    assert_matches!(
        outcome,
        Outcome::Failed(dsustream::install::Error::CreatePartition { ref name, status: 7 })
            if name == "vendor"
    );
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorCreatePartition));
    assert_eq!(service.created(), ["userdata", "system", "vendor"]);
    assert!(!service.calls().contains(&Call::Finish));
    assert!(!service.calls().contains(&Call::Abort));
}

#[test]
fn decode_error_stops_run() {
    let service = Arc::new(FakeService::default());

    let mut corrupt = sparse_image(4, 4, &raw_image(8));
    // Invalid chunk type for the first chunk.
    corrupt[28..30].copy_from_slice(&0xcaffu16.to_le_bytes());

    let (outcome, events) = run(
        &service,
        InstallationSource::MultipleImages(vec![
            descriptor("system", raw_image(10)),
            descriptor("vendor", corrupt),
            descriptor("product", raw_image(10)),
        ]),
    );

    assert_matches!(
        outcome,
        Outcome::Failed(dsustream::install::Error::Decode { ref partition, .. })
            if partition == "vendor"
    );
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorDecode));
    assert_eq!(service.created(), ["userdata", "system", "vendor"]);

    // The failed partition is never closed.
    let calls = service.calls();
    let vendor = calls
        .iter()
        .position(|c| matches!(c, Call::Create { name, .. } if name == "vendor"))
        .unwrap();
    assert!(!calls[vendor..].contains(&Call::Close));
    assert!(!calls.contains(&Call::Finish));
}

#[test]
fn size_mismatch_is_an_error() {
    let service = Arc::new(FakeService::default());

    let (outcome, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(900)),
            size: Some(1000),
        },
    );

    assert_matches!(
        outcome,
        Outcome::Failed(dsustream::install::Error::SizeMismatch { .. })
    );
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorTransfer));
    assert!(!service.calls().contains(&Call::Finish));
}

#[test]
fn submit_failure_is_an_error() {
    let service = Arc::new(FakeService::with(|s| s.fail_submit = Some(1)));

    let (outcome, _) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(1000)),
            size: Some(1000),
        },
    );

    assert_matches!(
        outcome,
        Outcome::Failed(dsustream::install::Error::SubmitChunk { .. })
    );
    assert_eq!(service.submits(), [300, 300]);
}

#[test]
fn cancel_before_start() {
    let service = Arc::new(FakeService::default());
    let cancel = CancelToken::new();
    cancel.cancel();

    let (outcome, events) = run_with(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(10)),
            size: Some(10),
        },
        cancel,
    );

    assert_matches!(outcome, Outcome::Cancelled);
    assert_eq!(events, [Event::Cancelled]);
    assert!(service.calls().is_empty());
}

/// Cancels the run once the first chunk of a partition was acknowledged.
struct CancelOnProgress {
    partition: &'static str,
    token: CancelToken,
    inner: ChannelObserver,
}

impl InstallObserver for CancelOnProgress {
    fn on_step(&mut self, step: InstallationStep) {
        self.inner.on_step(step);
    }

    fn on_progress(&mut self, progress: &Progress) {
        self.inner.on_progress(progress);

        if progress.partition == self.partition && progress.bytes_transferred > 0 {
            self.token.cancel();
        }
    }

    fn on_partition_created(&mut self, name: &str) {
        self.inner.on_partition_created(name);
    }

    fn on_error(&mut self, step: InstallationStep, detail: &str) {
        self.inner.on_error(step, detail);
    }

    fn on_success(&mut self) {
        self.inner.on_success();
    }

    fn on_cancelled(&mut self) {
        self.inner.on_cancelled();
    }
}

#[test]
fn cancel_mid_transfer() {
    let service = Arc::new(FakeService::default());
    let token = CancelToken::new();
    let (inner, receiver) = ChannelObserver::new();
    let mut observer = CancelOnProgress {
        partition: "system",
        token: token.clone(),
        inner,
    };

    let outcome = Installer::new(
        service.clone(),
        InstallationSource::MultipleImages(vec![
            descriptor("system", raw_image(1000)),
            descriptor("vendor", raw_image(10)),
        ]),
    )
    .with_options(options())
    .with_cancel_token(token)
    .run(&mut observer);

    let events: Vec<_> = receiver.try_iter().collect();

    assert_matches!(outcome, Outcome::Cancelled);
    assert_eq!(terminal(&events), &Event::Cancelled);

    // Only the chunk in flight when the signal was raised was submitted.
    assert_eq!(service.submits(), [300]);
    assert_eq!(service.created(), ["userdata", "system"]);
    assert_eq!(service.calls().last(), Some(&Call::Submit(300)));
}

#[test]
fn preflight_failures() {
    let cases = [
        (
            FakeService::with(|s| s.in_use = true),
            InstallationStep::ErrorAlreadyRunningDynOs,
        ),
        (
            FakeService::with(|s| s.installation_active = true),
            InstallationStep::ErrorInstallationActive,
        ),
        (
            FakeService::with(|s| s.installed = true),
            InstallationStep::ErrorRequiresDiscardDsu,
        ),
    ];

    for (service, step) in cases {
        let service = Arc::new(service);

        let (outcome, events) = run(
            &service,
            InstallationSource::SingleImage {
                image: reader(raw_image(10)),
                size: Some(10),
            },
        );

        assert_matches!(outcome, Outcome::Failed(_));
        assert_eq!(error_step(&events), Some(step));
        assert!(service.calls().is_empty(), "{step:?}: {:?}", service.calls());
    }
}

#[test]
fn session_failures() {
    let service = Arc::new(FakeService::with(|s| s.fail_start = true));
    let (_, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(10)),
            size: Some(10),
        },
    );
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorStartSession));
    assert!(service.created().is_empty());

    let service = Arc::new(FakeService::with(|s| s.fail_finish = true));
    let (outcome, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(10)),
            size: Some(10),
        },
    );
    assert_matches!(outcome, Outcome::Failed(dsustream::install::Error::Finalize));
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorFinalize));
}

#[test]
fn invalid_sources() {
    let service = Arc::new(FakeService::default());

    let (_, events) = run(
        &service,
        InstallationSource::MultipleImages(vec![
            descriptor("system", raw_image(10)),
            descriptor("system", raw_image(10)),
        ]),
    );
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorSource));
    assert!(service.calls().is_empty());

    let (_, events) = run(
        &service,
        InstallationSource::SingleImage {
            image: reader(raw_image(10)),
            size: None,
        },
    );
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorSource));
    assert_eq!(service.created(), ["userdata"]);
}

fn build_package(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

#[test]
fn package_entries() {
    let service = Arc::new(FakeService::default());
    let system = raw_image(1000);
    let vendor = sparse_image(4, 2, &raw_image(4));

    let package = build_package(&[
        ("META-INF/info.txt", b"ignored"),
        ("system.img", &system),
        ("images/vendor.img", &vendor),
    ]);

    let (outcome, events) = run(&service, InstallationSource::Package(reader(package)));

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(terminal(&events), &Event::Success);
    assert_eq!(service.created(), ["userdata", "system", "vendor"]);
    assert_eq!(service.data("system"), Some(system));
    assert_eq!(service.data("vendor").map(|d| d.len()), Some(12));
    assert!(service.calls().iter().any(|c| matches!(
        c,
        Call::Create { name, read_only: true, .. } if name == "vendor"
    )));
}

#[test]
fn package_without_images() {
    let service = Arc::new(FakeService::default());
    let package = build_package(&[("README", b"nothing to see")]);

    let (_, events) = run(&service, InstallationSource::Package(reader(package)));

    assert_eq!(error_step(&events), Some(InstallationStep::ErrorSource));
    assert!(!service.calls().contains(&Call::Finish));
}

#[test]
fn streaming_package_entries() {
    let service = Arc::new(FakeService::default());
    let system_data = raw_image(12);
    let vendor_data = raw_image(8);
    let system = sparse_image(4, 1, &system_data);
    let vendor = sparse_image(4, 2, &vendor_data);

    let package = streaming_package(&[
        ("system.img", &system, false),
        ("README", b"ignored", true),
        ("images/vendor.img", &vendor, true),
    ]);

    let (outcome, events) = run(&service, InstallationSource::Package(reader(package)));

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(terminal(&events), &Event::Success);
    assert_eq!(service.created(), ["userdata", "system", "vendor"]);

    let mut expected = vec![1u8; 4];
    expected.extend_from_slice(&system_data);
    assert_eq!(service.data("system"), Some(expected));

    let mut expected = vec![1u8; 8];
    expected.extend_from_slice(&vendor_data);
    assert_eq!(service.data("vendor"), Some(expected));
}

#[test]
fn streaming_raw_entry_has_unknown_size() {
    let service = Arc::new(FakeService::default());
    let package = streaming_package(&[("system.img", &raw_image(100), true)]);

    let (outcome, events) = run(&service, InstallationSource::Package(reader(package)));

    assert_matches!(outcome, Outcome::Failed(_));
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorSource));
    assert_eq!(service.created(), ["userdata"]);
}

#[test]
fn empty_package_entry() {
    let service = Arc::new(FakeService::default());
    let package = build_package(&[("misc.img", b""), ("system.img", &raw_image(10))]);

    let (outcome, _) = run(&service, InstallationSource::Package(reader(package)));

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(service.created(), ["userdata", "misc", "system"]);
    assert!(service.calls().contains(&Call::Create {
        name: "misc".to_owned(),
        size: 0,
        read_only: true,
    }));
    assert_eq!(service.data("system"), Some(raw_image(10)));
}

#[test]
fn remote_package() {
    let service = Arc::new(FakeService::default());
    let system = raw_image(1000);
    let package = build_package(&[("system.img", &system)]);
    let url = serve_once("200 OK", package);

    let (outcome, events) = run(&service, InstallationSource::RemoteUrl(url));

    assert_matches!(outcome, Outcome::Success);
    assert_eq!(terminal(&events), &Event::Success);
    assert_eq!(service.created(), ["userdata", "system"]);
    assert_eq!(service.data("system"), Some(system));
}

#[test]
fn remote_package_not_found() {
    let service = Arc::new(FakeService::default());
    let url = serve_once("404 Not Found", b"missing".to_vec());

    let (outcome, events) = run(&service, InstallationSource::RemoteUrl(url));

    assert_matches!(outcome, Outcome::Failed(_));
    assert_eq!(error_step(&events), Some(InstallationStep::ErrorSource));
    assert!(!service.calls().contains(&Call::Finish));
}

#[test]
fn spawned_run() {
    let service = Arc::new(FakeService::default());
    let (observer, receiver) = ChannelObserver::new();

    let handle = Installer::new(
        service.clone(),
        InstallationSource::SingleImage {
            image: reader(raw_image(1000)),
            size: Some(1000),
        },
    )
    .with_options(options())
    .spawn(observer)
    .unwrap();

    assert_matches!(handle.join(), Outcome::Success);

    let events: Vec<_> = receiver.iter().collect();
    assert_eq!(events.first(), Some(&Event::Step(InstallationStep::ResolvingSource)));
    assert_eq!(terminal(&events), &Event::Success);
    assert_eq!(service.submits().len(), 4);
}

#[test]
fn install_into_directory() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(DirectoryService::new(dir.path()));
    let data = raw_image(8);
    let image_path = dir.path().join("system.img");
    fs::write(&image_path, sparse_image(4, 256, &data)).unwrap();

    let (mut observer, receiver) = ChannelObserver::new();
    let outcome = Installer::new(
        service.clone(),
        InstallationSource::SingleImage {
            image: ImageLocation::Path(image_path),
            size: None,
        },
    )
    .with_options(options())
    .run(&mut observer);

    assert_matches!(outcome, Outcome::Success, "{:?}", receiver.try_iter().collect::<Vec<_>>());
    assert!(service.is_installed());

    let installed = service.installed().unwrap().unwrap();
    assert_eq!(
        installed
            .partitions
            .iter()
            .map(|p| (p.name.as_str(), p.size, p.read_only))
            .collect::<Vec<_>>(),
        [("userdata", USERDATA_SIZE, false), ("system", 1032, true)]
    );

    let system = fs::read(service.image_path("dsu", "system")).unwrap();
    assert_eq!(system.len(), 1032);
    assert_eq!(&system[1024..], &data);

    // A second installation requires discarding the first one.
    let (mut observer, receiver) = ChannelObserver::new();
    let outcome = Installer::new(
        service.clone(),
        InstallationSource::SingleImage {
            image: reader(raw_image(4)),
            size: Some(4),
        },
    )
    .with_options(options())
    .run(&mut observer);

    assert_matches!(
        outcome,
        Outcome::Failed(dsustream::install::Error::RequiresDiscard)
    );
    assert_eq!(
        error_step(&receiver.try_iter().collect::<Vec<_>>()),
        Some(InstallationStep::ErrorRequiresDiscardDsu)
    );
}
