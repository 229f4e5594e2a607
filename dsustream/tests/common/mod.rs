// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    sync::{Mutex, PoisonError},
    thread,
};

use dsustream::{
    format::zip::{
        DATA_DESCRIPTOR_MAGIC, FLAG_DATA_DESCRIPTOR, LOCAL_HEADER_MAGIC, METHOD_DEFLATED,
        METHOD_STORED, RawLocalHeader,
    },
    install::{Event, InstallationStep},
    service::{CREATE_PARTITION_OK, DynamicSystemService, ProgressStatus, ServiceProgress},
    transport::RegionHandle,
};

/// A service call as observed by [`FakeService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    ForceStop,
    Start(String),
    SetRegion(u64),
    Create {
        name: String,
        size: u64,
        read_only: bool,
    },
    Submit(u64),
    Close,
    Finish,
    Abort,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    region: Option<RegionHandle>,
    /// Data received for each partition.
    data: HashMap<String, Vec<u8>>,
    open: Option<String>,
}

/// Service that records every call and keeps the submitted data in memory.
#[derive(Default)]
pub struct FakeService {
    pub in_use: bool,
    pub installed: bool,
    pub installation_active: bool,
    pub fail_start: bool,
    pub fail_finish: bool,
    /// Fail to create partitions with this name.
    pub fail_create: Option<String>,
    /// Fail the nth (0-based) chunk submission.
    pub fail_submit: Option<usize>,
    /// Number of status queries reporting work while allocating a writable
    /// partition.
    pub allocation_polls: Mutex<u32>,
    state: Mutex<FakeState>,
}

impl FakeService {
    /// Create a service with the defaults adjusted by `configure`.
    pub fn with(configure: impl FnOnce(&mut Self)) -> Self {
        let mut service = Self::default();
        configure(&mut service);
        service
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, call: Call) {
        self.state().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Names of the created partitions in order.
    pub fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn submits(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn data(&self, partition: &str) -> Option<Vec<u8>> {
        self.state().data.get(partition).cloned()
    }
}

impl DynamicSystemService for FakeService {
    fn is_in_use(&self) -> bool {
        self.in_use
    }

    fn is_installed(&self) -> bool {
        self.installed
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn is_installation_active(&self) -> bool {
        self.installation_active
    }

    fn installation_progress(&self) -> ServiceProgress {
        let mut polls = self.allocation_polls.lock().unwrap();

        if self.installation_active {
            ServiceProgress {
                status: ProgressStatus::Working,
                ..Default::default()
            }
        } else if *polls > 0 {
            *polls -= 1;
            ServiceProgress {
                step: "userdata".to_owned(),
                status: ProgressStatus::Working,
                bytes_processed: 1,
                total_bytes: 2,
            }
        } else {
            ServiceProgress::default()
        }
    }

    fn start_installation(&self, slot: &str) -> bool {
        self.log(Call::Start(slot.to_owned()));
        !self.fail_start
    }

    fn create_partition(&self, name: &str, size: u64, read_only: bool) -> i32 {
        self.log(Call::Create {
            name: name.to_owned(),
            size,
            read_only,
        });

        if self.fail_create.as_deref() == Some(name) {
            return 7;
        }

        let mut state = self.state();
        state.data.insert(name.to_owned(), vec![]);
        state.open = Some(name.to_owned());

        CREATE_PARTITION_OK
    }

    fn set_transport_region(&self, handle: RegionHandle, size: u64) -> bool {
        self.log(Call::SetRegion(size));
        self.state().region = Some(handle);
        true
    }

    fn submit_chunk(&self, bytes: u64) -> bool {
        let index = self.submits().len();
        self.log(Call::Submit(bytes));

        if self.fail_submit == Some(index) {
            return false;
        }

        let mut state = self.state();
        let FakeState {
            region, data, open, ..
        } = &mut *state;

        let (Some(region), Some(open)) = (region, open) else {
            return false;
        };
        let Some(chunk) = region.with_bytes(bytes as usize, |b| b.to_vec()) else {
            return false;
        };

        data.entry(open.clone()).or_default().extend(chunk);

        true
    }

    fn close_partition(&self) -> bool {
        self.log(Call::Close);
        self.state().open = None;
        true
    }

    fn finish_installation(&self) -> bool {
        self.log(Call::Finish);
        !self.fail_finish
    }

    fn abort_installation(&self) -> bool {
        self.log(Call::Abort);
        true
    }

    fn remove(&self) -> bool {
        true
    }

    fn set_enabled(&self, _enable: bool, _one_shot: bool) -> bool {
        true
    }

    fn force_stop_updater(&self) {
        self.log(Call::ForceStop);
    }
}

/// Return the terminal event and check that it is the last one.
pub fn terminal(events: &[Event]) -> &Event {
    let index = events
        .iter()
        .position(Event::is_terminal)
        .expect("No terminal event");
    assert_eq!(index, events.len() - 1, "Events after terminal: {events:?}");

    &events[index]
}

pub fn error_step(events: &[Event]) -> Option<InstallationStep> {
    match terminal(events) {
        Event::Error { step, .. } => Some(*step),
        _ => None,
    }
}

/// Build a zip archive the way streaming writers do: every entry has zero
/// sizes in its local header and is followed by a data descriptor.
pub fn streaming_package(entries: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut out = vec![];

    for (name, data, deflate) in entries {
        let payload = if *deflate {
            let mut encoder =
                flate2::write::DeflateEncoder::new(vec![], flate2::Compression::default());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        } else {
            data.to_vec()
        };

        let header = RawLocalHeader {
            version_needed: 20.into(),
            flags: FLAG_DATA_DESCRIPTOR.into(),
            method: (if *deflate { METHOD_DEFLATED } else { METHOD_STORED }).into(),
            mtime: 0.into(),
            mdate: 0.into(),
            crc32: 0.into(),
            compressed_size: 0.into(),
            uncompressed_size: 0.into(),
            name_len: (name.len() as u16).into(),
            extra_len: 0.into(),
        };

        out.extend_from_slice(&LOCAL_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&payload);

        out.extend_from_slice(&DATA_DESCRIPTOR_MAGIC.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }

    out
}

/// Answer a single HTTP request on a loopback port with `status` and `body`.
/// Returns the URL to request.
pub fn serve_once(status: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/package.zip", listener.local_addr().unwrap());

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let Ok(reader) = stream.try_clone() else {
            return;
        };

        // Skip the request line and headers.
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) if !line.is_empty() => {}
                _ => break,
            }
        }

        let _ = write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len(),
        );
        let _ = stream.write_all(&body);
    });

    url
}
