// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming reader for zip archives that cannot be seeked, such as packages
//! downloaded over HTTP. Only the local file headers are parsed and the
//! central directory is never consulted, so entries are visited in the order
//! they were written.
//!
//! Entries written in streaming mode (general purpose flag bit 3) have no
//! sizes in their local headers. Their data is followed by a data descriptor
//! instead. Deflated entries end on their own. Stored entries are scanned for
//! a descriptor whose sizes and CRC32 match the data preceding it.

use std::{
    fmt,
    io::{self, Read},
};

use crc32fast::Hasher;
use flate2::{Decompress, FlushDecompress, Status};
use thiserror::Error;
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::ReadFullExt;

/// Magic value preceding a [`RawLocalHeader`].
pub const LOCAL_HEADER_MAGIC: u32 = 0x04034b50;
/// Optional magic value at the start of a data descriptor.
pub const DATA_DESCRIPTOR_MAGIC: u32 = 0x08074b50;
const CENTRAL_HEADER_MAGIC: u32 = 0x02014b50;
const ZIP64_END_OF_CENTRAL_DIRECTORY_MAGIC: u32 = 0x06064b50;
const END_OF_CENTRAL_DIRECTORY_MAGIC: u32 = 0x06054b50;

const FLAG_ENCRYPTED: u16 = 1 << 0;
/// Sizes and CRC32 are stored in a data descriptor after the entry's data.
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

const ZIP64_EXTRA_ID: u16 = 0x0001;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown record magic: {0:#010x}")]
    UnknownRecord(u32),
    #[error("Entry {0:?}: Encrypted entries are not supported")]
    Encrypted(String),
    #[error("Entry {name:?}: Unsupported compression method: {method}")]
    UnsupportedMethod { name: String, method: u16 },
    #[error("Entry {0:?}: Stored data is not followed by a data descriptor")]
    MissingDataDescriptor(String),
    #[error("Entry {name:?}: Expected size {expected}, but have {actual}")]
    MismatchedSize {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("Entry {name:?}: Expected CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32 {
        name: String,
        expected: u32,
        actual: u32,
    },
    #[error("Entry {0:?}: Invalid deflate stream")]
    Inflate(String, #[source] flate2::DecompressError),
    #[error("Entry {0:?}: Deflate stream ended early")]
    TruncatedDeflate(String),
    #[error("Failed to read zip data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn into_io_error(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Raw on-disk layout of a local file header, following its magic.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct RawLocalHeader {
    pub version_needed: little_endian::U16,
    pub flags: little_endian::U16,
    pub method: little_endian::U16,
    pub mtime: little_endian::U16,
    pub mdate: little_endian::U16,
    pub crc32: little_endian::U32,
    pub compressed_size: little_endian::U32,
    pub uncompressed_size: little_endian::U32,
    pub name_len: little_endian::U16,
    pub extra_len: little_endian::U16,
}

impl fmt::Debug for RawLocalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawLocalHeader")
            .field("version_needed", &self.version_needed.get())
            .field("flags", &format_args!("{:#06x}", self.flags.get()))
            .field("method", &self.method.get())
            .field("mtime", &self.mtime.get())
            .field("mdate", &self.mdate.get())
            .field("crc32", &format_args!("{:#010x}", self.crc32.get()))
            .field("compressed_size", &self.compressed_size.get())
            .field("uncompressed_size", &self.uncompressed_size.get())
            .field("name_len", &self.name_len.get())
            .field("extra_len", &self.extra_len.get())
            .finish()
    }
}

/// Raw on-disk layout of a 32-bit data descriptor with its magic.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawDataDescriptor {
    magic: little_endian::U32,
    crc32: little_endian::U32,
    compressed_size: little_endian::U32,
    uncompressed_size: little_endian::U32,
}

const DESCRIPTOR_LEN: usize = size_of::<RawDataDescriptor>();

/// Replace sizes saturated at [`u32::MAX`] with the values from the zip64
/// extra field. Returns whether the field is present.
fn apply_zip64_extra(mut extra: &[u8], uncompressed: &mut u64, compressed: &mut u64) -> bool {
    while extra.len() >= 4 {
        let id = u16::from_le_bytes([extra[0], extra[1]]);
        let len = usize::from(u16::from_le_bytes([extra[2], extra[3]]));
        let Some(data) = extra.get(4..4 + len) else {
            break;
        };

        if id == ZIP64_EXTRA_ID {
            let mut fields = data
                .chunks_exact(8)
                .filter_map(|c| c.try_into().ok())
                .map(u64::from_le_bytes);

            for size in [&mut *uncompressed, &mut *compressed] {
                if *size == u64::from(u32::MAX) {
                    if let Some(value) = fields.next() {
                        *size = value;
                    }
                }
            }

            return true;
        }

        extra = &extra[4 + len..];
    }

    false
}

/// Buffered reader that can guarantee a minimum amount of lookahead.
struct Lookahead<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl<R: Read> Lookahead<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; BUFFER_SIZE],
            start: 0,
            end: 0,
        }
    }

    /// Buffer at least `min` bytes unless EOF is reached first and return
    /// everything that is buffered.
    fn fill(&mut self, min: usize) -> io::Result<&[u8]> {
        if self.end - self.start < min {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;

            while self.end < min {
                match self.inner.read(&mut self.buf[self.end..]) {
                    Ok(0) => break,
                    Ok(n) => self.end += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(&self.buf[self.start..self.end])
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
    }
}

impl<R: Read> Read for Lookahead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.fill(1)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.consume(n);

        Ok(n)
    }
}

enum Body {
    /// Stored data of known length.
    Stored { remaining: u64 },
    /// Stored data that ends at the data descriptor.
    StoredUntilDescriptor,
    Deflated(Box<Decompress>),
}

struct EntryState {
    name: String,
    body: Body,
    has_descriptor: bool,
    zip64: bool,
    /// CRC32 and size from the local header.
    header_crc32: u32,
    header_size: u64,
    hasher: Hasher,
    /// Uncompressed bytes produced so far.
    size: u64,
    /// The data and the trailing descriptor were fully read and verified.
    done: bool,
}

impl EntryState {
    /// Whether a data descriptor starts at `rest`, given that `prefix` is the
    /// remainder of the entry's data.
    fn is_descriptor(&self, prefix: &[u8], rest: &[u8]) -> bool {
        let Ok((descriptor, _)) = RawDataDescriptor::ref_from_prefix(rest) else {
            return false;
        };

        let size = self.size + prefix.len() as u64;

        if descriptor.magic.get() != DATA_DESCRIPTOR_MAGIC
            || u64::from(descriptor.compressed_size.get()) != size
            || u64::from(descriptor.uncompressed_size.get()) != size
        {
            return false;
        }

        let mut hasher = self.hasher.clone();
        hasher.update(prefix);

        hasher.finalize() == descriptor.crc32.get()
    }
}

/// Reader for the entries of a zip archive in stream order.
pub struct ZipStreamReader<R> {
    inner: Lookahead<R>,
    entry: Option<EntryState>,
    finished: bool,
}

impl<R: Read> ZipStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Lookahead::new(inner),
            entry: None,
            finished: false,
        }
    }

    /// Advance to the next entry. Unread data of the previous entry is
    /// skipped and verified. Returns [`None`] at the central directory or at
    /// the end of the stream.
    pub fn next_entry(&mut self) -> Result<Option<ZipEntry<'_, R>>> {
        self.skip_entry()?;
        self.entry = None;

        if self.finished {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        let n = self
            .inner
            .read_full(&mut magic)
            .map_err(|e| Error::DataRead("magic", e))?;
        if n == 0 {
            self.finished = true;
            return Ok(None);
        } else if n != magic.len() {
            return Err(Error::DataRead("magic", io::ErrorKind::UnexpectedEof.into()));
        }

        match u32::from_le_bytes(magic) {
            LOCAL_HEADER_MAGIC => {}
            CENTRAL_HEADER_MAGIC
            | ZIP64_END_OF_CENTRAL_DIRECTORY_MAGIC
            | END_OF_CENTRAL_DIRECTORY_MAGIC => {
                self.finished = true;
                return Ok(None);
            }
            m => return Err(Error::UnknownRecord(m)),
        }

        let header = RawLocalHeader::read_from_io(&mut self.inner)
            .map_err(|e| Error::DataRead("local header", e))?;

        let mut name = vec![0u8; header.name_len.get().into()];
        self.inner
            .read_exact(&mut name)
            .map_err(|e| Error::DataRead("name", e))?;
        let name = String::from_utf8_lossy(&name).into_owned();

        let mut extra = vec![0u8; header.extra_len.get().into()];
        self.inner
            .read_exact(&mut extra)
            .map_err(|e| Error::DataRead("extra field", e))?;

        let flags = header.flags.get();
        if flags & FLAG_ENCRYPTED != 0 {
            return Err(Error::Encrypted(name));
        }

        let mut compressed_size = u64::from(header.compressed_size.get());
        let mut uncompressed_size = u64::from(header.uncompressed_size.get());
        let zip64 = apply_zip64_extra(&extra, &mut uncompressed_size, &mut compressed_size);

        let has_descriptor = flags & FLAG_DATA_DESCRIPTOR != 0;
        // Streaming writers leave the sizes in the local header as zero.
        let sizes_known = !has_descriptor || compressed_size != 0;

        let body = match header.method.get() {
            METHOD_STORED if sizes_known => Body::Stored {
                remaining: compressed_size,
            },
            METHOD_STORED => Body::StoredUntilDescriptor,
            METHOD_DEFLATED => Body::Deflated(Box::new(Decompress::new(false))),
            method => return Err(Error::UnsupportedMethod { name, method }),
        };

        let size = sizes_known.then_some(uncompressed_size);

        self.entry = Some(EntryState {
            name: name.clone(),
            body,
            has_descriptor,
            zip64,
            header_crc32: header.crc32.get(),
            header_size: uncompressed_size,
            hasher: Hasher::new(),
            size: 0,
            done: false,
        });

        Ok(Some(ZipEntry {
            name,
            size,
            reader: self,
        }))
    }

    fn skip_entry(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 16384];

        while self.entry.as_ref().is_some_and(|e| !e.done) {
            self.read_entry(&mut buf)
                .map_err(|e| Error::DataRead("entry", e))?;
        }

        Ok(())
    }

    fn read_entry(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(entry) = &mut self.entry else {
            return Ok(0);
        };
        if entry.done || buf.is_empty() {
            return Ok(0);
        }

        let (n, ended) = match entry.body {
            Body::Stored { ref mut remaining } => {
                read_stored(&mut self.inner, remaining, buf, &entry.name)?
            }
            Body::StoredUntilDescriptor => scan_stored(&mut self.inner, entry, buf)?,
            Body::Deflated(ref mut decompress) => {
                inflate(&mut self.inner, decompress, buf, &entry.name)?
            }
        };

        entry.hasher.update(&buf[..n]);
        entry.size += n as u64;

        if ended {
            finish_entry(&mut self.inner, entry).map_err(into_io_error)?;
            entry.done = true;
        }

        Ok(n)
    }
}

fn read_stored<R: Read>(
    inner: &mut Lookahead<R>,
    remaining: &mut u64,
    buf: &mut [u8],
    name: &str,
) -> io::Result<(usize, bool)> {
    if *remaining == 0 {
        return Ok((0, true));
    }

    let to_read = usize::try_from(*remaining).unwrap_or(usize::MAX).min(buf.len());
    let n = inner.read(&mut buf[..to_read])?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Entry {name:?}: {remaining} bytes missing"),
        ));
    }

    *remaining -= n as u64;

    Ok((n, *remaining == 0))
}

fn scan_stored<R: Read>(
    inner: &mut Lookahead<R>,
    entry: &EntryState,
    buf: &mut [u8],
) -> io::Result<(usize, bool)> {
    let data = inner.fill(DESCRIPTOR_LEN)?;
    if data.len() < DESCRIPTOR_LEN {
        return Err(into_io_error(Error::MissingDataDescriptor(
            entry.name.clone(),
        )));
    }

    // A descriptor can't start in the last 15 bytes until more is buffered.
    let limit = data.len() - DESCRIPTOR_LEN + 1;
    let descriptor = (0..limit).find(|&p| entry.is_descriptor(&data[..p], &data[p..]));

    let n = descriptor.unwrap_or(limit).min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    inner.consume(n);

    Ok((n, descriptor == Some(n)))
}

fn inflate<R: Read>(
    inner: &mut Lookahead<R>,
    decompress: &mut Decompress,
    buf: &mut [u8],
    name: &str,
) -> io::Result<(usize, bool)> {
    loop {
        let input = inner.fill(1)?;
        let eof = input.is_empty();
        let flush = if eof {
            FlushDecompress::Finish
        } else {
            FlushDecompress::None
        };

        let in_before = decompress.total_in();
        let out_before = decompress.total_out();
        let status = decompress
            .decompress(input, buf, flush)
            .map_err(|e| into_io_error(Error::Inflate(name.to_owned(), e)))?;
        let consumed = (decompress.total_in() - in_before) as usize;
        let produced = (decompress.total_out() - out_before) as usize;

        inner.consume(consumed);

        match status {
            Status::StreamEnd => return Ok((produced, true)),
            Status::Ok | Status::BufError if produced > 0 => return Ok((produced, false)),
            Status::Ok | Status::BufError if eof => {
                return Err(into_io_error(Error::TruncatedDeflate(name.to_owned())));
            }
            Status::Ok | Status::BufError => {}
        }
    }
}

/// Read the data descriptor, if there is one, and verify the entry's size and
/// CRC32.
fn finish_entry<R: Read>(inner: &mut Lookahead<R>, entry: &EntryState) -> Result<()> {
    let (expected_crc32, expected_size) = if entry.has_descriptor {
        read_descriptor(inner, entry.zip64)?
    } else {
        (entry.header_crc32, entry.header_size)
    };

    if entry.size != expected_size {
        return Err(Error::MismatchedSize {
            name: entry.name.clone(),
            expected: expected_size,
            actual: entry.size,
        });
    }

    let actual = entry.hasher.clone().finalize();
    if actual != expected_crc32 {
        return Err(Error::MismatchedCrc32 {
            name: entry.name.clone(),
            expected: expected_crc32,
            actual,
        });
    }

    Ok(())
}

/// Returns the CRC32 and uncompressed size from a data descriptor. The magic
/// is optional.
fn read_descriptor<R: Read>(inner: &mut Lookahead<R>, zip64: bool) -> Result<(u32, u64)> {
    let data = inner
        .fill(4)
        .map_err(|e| Error::DataRead("data descriptor", e))?;
    if data.starts_with(&DATA_DESCRIPTOR_MAGIC.to_le_bytes()) {
        inner.consume(4);
    }

    let crc32 = little_endian::U32::read_from_io(&mut *inner)
        .map_err(|e| Error::DataRead("data descriptor", e))?
        .get();

    let size = if zip64 {
        let sizes = <[little_endian::U64; 2]>::read_from_io(&mut *inner)
            .map_err(|e| Error::DataRead("data descriptor", e))?;
        sizes[1].get()
    } else {
        let sizes = <[little_endian::U32; 2]>::read_from_io(&mut *inner)
            .map_err(|e| Error::DataRead("data descriptor", e))?;
        sizes[1].get().into()
    };

    Ok((crc32, size))
}

/// An entry of a [`ZipStreamReader`]. Reading yields the uncompressed data.
/// The size and CRC32 are verified when the end of the data is reached.
pub struct ZipEntry<'a, R> {
    name: String,
    size: Option<u64>,
    reader: &'a mut ZipStreamReader<R>,
}

impl<R> fmt::Debug for ZipEntry<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipEntry")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl<R> ZipEntry<'_, R> {
    /// Path of the entry inside the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uncompressed size, if the local header records it.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

impl<R: Read> Read for ZipEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read_entry(buf)
    }
}
