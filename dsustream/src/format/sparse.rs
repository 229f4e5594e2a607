// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Android sparse image support. [`SparseStream`] is the entry point used by
//! the installer: it sniffs the container magic and either passes the stream
//! through untouched or expands every chunk into the logical byte sequence.

use std::{
    fmt,
    io::{self, Chain, Cursor, Read, Seek, SeekFrom, Write},
    mem,
    sync::atomic::AtomicBool,
};

use crc32fast::Hasher;
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::{self, ReadDiscardExt, ReadFullExt};

/// Magic value for [`RawHeader::magic`].
pub const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// Supported minor version.
pub const MINOR_VERSION: u16 = 0;

/// Largest data chunk emitted by [`pack`]. Matches AOSP's libsparse.
const MAX_DATA_CHUNK_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid file header size: {0} < {size}", size = mem::size_of::<RawHeader>())]
    InvalidFileHeaderSize(u16),
    #[error("Invalid chunk header size: {0} < {size}", size = mem::size_of::<RawChunk>())]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Size overflow: {chunk_size} * {block_size}")]
    ChunkSizeOverflow {
        index: u32,
        chunk_size: u32,
        block_size: u32,
    },
    #[error("Chunk #{index}: Invalid type: {chunk_type:#06x}")]
    InvalidChunkType { index: u32, chunk_type: u16 },
    #[error("Chunk #{index}: Data size too large: {data_size}")]
    DataSizeTooLarge { index: u32, data_size: u32 },
    #[error("Chunk #{index}: Block count overflow: {start_block} + {chunk_size}")]
    BlockCountOverflow {
        index: u32,
        start_block: u32,
        chunk_size: u32,
    },
    #[error("Chunk #{index}: End block {end_block} exceeds total blocks {total_blocks}")]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u32,
        total_blocks: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk is not empty")]
    Crc32ChunkNotEmpty { index: u32, chunk_size: u32 },
    #[error("Chunk #{index}: Expected total size {expected_size}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected_size: u32,
        total_size: u32,
    },
    // Reader errors.
    #[error("Previous chunk still has {0} unread bytes")]
    UnreadChunkData(u32),
    #[error("Chunks end at block {end_block}, but image has {total_blocks} blocks")]
    IncompleteImage { end_block: u32, total_blocks: u32 },
    #[error("Data chunk ended {0} bytes early")]
    TruncatedChunkData(u64),
    #[error("Expected checkpoint CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Checkpoint { expected: u32, actual: u32 },
    #[error("Expected final CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Final { expected: u32, actual: u32 },
    // Writer errors.
    #[error("Minor version not supported for writing: {0}")]
    UnsupportedMinorVersion(u16),
    #[error("Previous chunk still has {0} unwritten bytes")]
    UnwrittenChunkData(u32),
    #[error("Already wrote all chunk headers")]
    TooManyChunks,
    #[error("Gap between end of last chunk {prev_end} and start of new chunk {cur_start}")]
    GapBetweenChunks { prev_end: u32, cur_start: u32 },
    #[error("Input size {size} is not a multiple of block size {block_size}")]
    UnalignedInput { size: u64, block_size: u32 },
    #[error("Input has too many blocks for block size {0}")]
    TooManyBlocks(u32),
    // Wrapped errors.
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write sparse data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Extract the decoder error carried by an [`io::Error`] returned from
/// [`SparseStream`]'s [`Read`] implementation, if there is one.
pub fn decode_error(e: &io::Error) -> Option<&Error> {
    e.get_ref().and_then(|e| e.downcast_ref::<Error>())
}

fn into_io_error(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. Only [`MAJOR_VERSION`] can be parsed.
    major_version: little_endian::U16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`].
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        if self.file_hdr_sz.get() < mem::size_of::<Self>() as u16 {
            return Err(Error::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if self.chunk_hdr_sz.get() < mem::size_of::<RawChunk>() as u16 {
            return Err(Error::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }

    fn excess_raw_header_bytes(&self) -> u16 {
        self.file_hdr_sz.get() - mem::size_of::<Self>() as u16
    }

    fn excess_raw_chunk_bytes(&self) -> u16 {
        self.chunk_hdr_sz.get() - mem::size_of::<RawChunk>() as u16
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Must be [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`],
    /// [`CHUNK_TYPE_DONT_CARE`], or [`CHUNK_TYPE_CRC32`].
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &format_args!("{:#06x}", self.chunk_type.get()))
            .field("reserved1", &self.reserved1.get())
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

impl RawChunk {
    fn expected_size(&self, index: u32, header: &RawHeader) -> Result<u32> {
        let data_size = match self.chunk_type.get() {
            CHUNK_TYPE_RAW => self
                .chunk_sz
                .get()
                .checked_mul(header.blk_sz.get())
                .ok_or_else(|| Error::ChunkSizeOverflow {
                    index,
                    chunk_size: self.chunk_sz.get(),
                    block_size: header.blk_sz.get(),
                })?,
            CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => 4,
            CHUNK_TYPE_DONT_CARE => 0,
            t => {
                return Err(Error::InvalidChunkType {
                    index,
                    chunk_type: t,
                });
            }
        };

        data_size
            .checked_add(header.chunk_hdr_sz.into())
            .ok_or(Error::DataSizeTooLarge { index, data_size })
    }

    fn validate(&self, index: u32, header: &RawHeader, start_block: u32) -> Result<()> {
        let end_block = start_block
            .checked_add(self.chunk_sz.get())
            .ok_or_else(|| Error::BlockCountOverflow {
                index,
                start_block,
                chunk_size: self.chunk_sz.get(),
            })?;

        if end_block > header.total_blks.get() {
            return Err(Error::EndBlockExceedsTotal {
                index,
                end_block,
                total_blocks: header.total_blks.get(),
            });
        }

        if self.chunk_type.get() == CHUNK_TYPE_CRC32 && self.chunk_sz.get() != 0 {
            return Err(Error::Crc32ChunkNotEmpty {
                index,
                chunk_size: self.chunk_sz.get(),
            });
        }

        let expected_size = self.expected_size(index, header)?;

        if expected_size != self.total_sz.get() {
            return Err(Error::InvalidChunkSize {
                index,
                expected_size,
                total_size: self.total_sz.get(),
            });
        }

        Ok(())
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    /// Block size in bytes. Must be a multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    pub num_chunks: u32,
    /// CRC32 checksum of the original data. Zero if unknown.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

impl Header {
    /// Size of the image in bytes once every chunk has been expanded.
    pub fn unsparsed_size(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.num_blocks)
    }
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl ChunkBounds {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// The type of data contained in a chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// The chunk is filled with raw data.
    Data,
    /// The chunk is filled with repeating patterns of the specified integer
    /// encoded in little-endian.
    Fill(u32),
    /// The chunk is a hole. It is unsparsed as zeros.
    Hole,
    /// CRC32 checkpoint of all data preceding this chunk. Covers no blocks.
    Crc32(u32),
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::Hole => write!(f, "Hole"),
            Self::Crc32(checksum) => f
                .debug_tuple("Crc32")
                .field(&format_args!("{checksum:#010x}"))
                .finish(),
        }
    }
}

/// A contiguous list of blocks and the type of data they contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("bounds", &self.bounds)
            .field("data", &format_args!("{:?}", self.data))
            .finish()
    }
}

/// Whether to validate CRC32 checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMode {
    Validate,
    Ignore,
}

/// Hash what a fill chunk's contents would be if it were unsparsed.
fn hash_fill_chunk(num_blocks: u32, block_size: u32, fill_value: u32, hasher: &mut Hasher) {
    let buf = [little_endian::U32::new(fill_value); 1024];
    let mut remain = u64::from(num_blocks) * u64::from(block_size);

    while remain > 0 {
        let n = remain.min(buf.as_bytes().len() as u64) as usize;
        hasher.update(&buf.as_bytes()[..n]);
        remain -= n as u64;
    }
}

/// A type for reading the chunk structure of sparse files. The data of a
/// [`ChunkData::Data`] chunk is read through the [`Read`] implementation.
pub struct SparseReader<R> {
    inner: R,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to read.
    chunk: u32,
    /// Number of bytes left to read for the current data chunk.
    data_remain: u32,
    hasher: Option<Hasher>,
}

impl<R: Read> SparseReader<R> {
    pub fn new(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let header =
            RawHeader::read_from_io(&mut inner).map_err(|e| Error::DataRead("header", e))?;

        header.validate()?;

        inner
            .read_discard_exact(header.excess_raw_header_bytes().into())
            .map_err(|e| Error::DataRead("header_excess", e))?;

        Ok(Self {
            inner,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            hasher: match crc_mode {
                CrcMode::Validate => Some(Hasher::new()),
                CrcMode::Ignore => None,
            },
        })
    }

    pub fn header(&self) -> Header {
        Header {
            major_version: self.header.major_version.get(),
            minor_version: self.header.minor_version.get(),
            block_size: self.header.blk_sz.get(),
            num_blocks: self.header.total_blks.get(),
            num_chunks: self.header.total_chunks.get(),
            crc32: self.header.image_checksum.get(),
        }
    }

    /// Read the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully read first. Returns [`None`]
    /// once every chunk declared in the header has been read.
    ///
    /// CRC32 checkpoints are verified here when validation is enabled.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.data_remain != 0 {
            return Err(Error::UnreadChunkData(self.data_remain));
        }

        if self.chunk == self.header.total_chunks.get() {
            return Ok(None);
        }

        let raw_chunk =
            RawChunk::read_from_io(&mut self.inner).map_err(|e| Error::DataRead("chunk", e))?;

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        self.inner
            .read_discard_exact(self.header.excess_raw_chunk_bytes().into())
            .map_err(|e| Error::DataRead("chunk_excess", e))?;

        let block_size = self.header.blk_sz.get();
        let data = match raw_chunk.chunk_type.get() {
            CHUNK_TYPE_RAW => {
                self.data_remain =
                    raw_chunk.total_sz.get() - u32::from(self.header.chunk_hdr_sz.get());

                ChunkData::Data
            }
            CHUNK_TYPE_FILL => {
                let fill_value = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_fill_value", e))?;

                if let Some(hasher) = &mut self.hasher {
                    hash_fill_chunk(raw_chunk.chunk_sz.get(), block_size, fill_value.get(), hasher);
                }

                ChunkData::Fill(fill_value.get())
            }
            CHUNK_TYPE_DONT_CARE => {
                if let Some(hasher) = &mut self.hasher {
                    hash_fill_chunk(raw_chunk.chunk_sz.get(), block_size, 0, hasher);
                }

                ChunkData::Hole
            }
            CHUNK_TYPE_CRC32 => {
                let expected = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_crc32", e))?;

                if let Some(hasher) = &self.hasher {
                    let actual = hasher.clone().finalize();

                    if actual != expected.get() {
                        return Err(Error::MismatchedCrc32Checkpoint {
                            expected: expected.get(),
                            actual,
                        });
                    }
                }

                ChunkData::Crc32(expected.get())
            }
            // Rejected by RawChunk::validate().
            _ => unreachable!(),
        };

        let chunk = Chunk {
            bounds: ChunkBounds {
                start: self.block,
                end: self.block + raw_chunk.chunk_sz.get(),
            },
            data,
        };

        self.chunk += 1;
        self.block = chunk.bounds.end;

        Ok(Some(chunk))
    }

    /// Check that the chunks covered every block declared in the header and
    /// that the final checksum matches. Must only be called after
    /// [`Self::next_chunk`] returned [`None`].
    pub fn verify(&mut self) -> Result<()> {
        let total_blocks = self.header.total_blks.get();
        if self.block != total_blocks {
            return Err(Error::IncompleteImage {
                end_block: self.block,
                total_blocks,
            });
        }

        if let Some(hasher) = self.hasher.take() {
            let expected = self.header.image_checksum.get();
            if expected != 0 {
                let actual = hasher.finalize();

                if actual != expected {
                    return Err(Error::MismatchedCrc32Final { expected, actual });
                }
            }
        }

        Ok(())
    }

    /// Verify the image and return the underlying reader.
    pub fn finish(mut self) -> Result<R> {
        self.verify()?;
        Ok(self.inner)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = buf.len().min(self.data_remain as usize);

        let n = self.inner.read(&mut buf[..to_read])?;

        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }

        self.data_remain -= n as u32;

        Ok(n)
    }
}

/// The part of the current chunk that has not been emitted yet.
#[derive(Clone, Copy, Debug)]
enum Segment {
    /// Need to read the next chunk header.
    Pending,
    /// Copy this many bytes from the underlying data chunk.
    Data(u64),
    /// Repeat the little-endian fill pattern. `offset` is the number of bytes
    /// of this chunk that were already emitted.
    Fill {
        pattern: [u8; 4],
        offset: u64,
        remain: u64,
    },
    /// All chunks were consumed and verified.
    Done,
}

/// Expands the chunks of a [`SparseReader`] into the logical byte stream.
struct Unsparser<R> {
    reader: SparseReader<R>,
    segment: Segment,
}

impl<R: Read> Unsparser<R> {
    fn advance(&mut self) -> Result<()> {
        let Some(chunk) = self.reader.next_chunk()? else {
            self.reader.verify()?;
            self.segment = Segment::Done;
            return Ok(());
        };

        let size = u64::from(chunk.bounds.len()) * u64::from(self.reader.header.blk_sz.get());

        self.segment = match chunk.data {
            ChunkData::Data => Segment::Data(size),
            ChunkData::Fill(value) => Segment::Fill {
                pattern: value.to_le_bytes(),
                offset: 0,
                remain: size,
            },
            ChunkData::Hole => Segment::Fill {
                pattern: [0; 4],
                offset: 0,
                remain: size,
            },
            ChunkData::Crc32(_) => Segment::Pending,
        };

        Ok(())
    }
}

impl<R: Read> Read for Unsparser<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match &mut self.segment {
                Segment::Data(remain) if *remain > 0 => {
                    let to_read = (*remain).min(buf.len() as u64) as usize;
                    let n = self.reader.read(&mut buf[..to_read])?;
                    if n == 0 {
                        return Err(into_io_error(Error::TruncatedChunkData(*remain)));
                    }

                    *remain -= n as u64;
                    return Ok(n);
                }
                Segment::Fill {
                    pattern,
                    offset,
                    remain,
                } if *remain > 0 => {
                    let n = (*remain).min(buf.len() as u64) as usize;

                    for (i, b) in buf[..n].iter_mut().enumerate() {
                        *b = pattern[((*offset + i as u64) % 4) as usize];
                    }

                    *offset += n as u64;
                    *remain -= n as u64;
                    return Ok(n);
                }
                Segment::Done => return Ok(0),
                _ => self.advance().map_err(into_io_error)?,
            }
        }
    }
}

type Prefixed<R> = Chain<Cursor<Vec<u8>>, R>;

enum StreamKind<R> {
    Raw(Prefixed<R>),
    Sparse(Box<Unsparser<Prefixed<R>>>),
}

/// A reader that transparently unsparses its input if it is a sparse image and
/// passes it through unchanged otherwise. The stream is consumed strictly
/// sequentially and cannot be restarted.
///
/// Errors encountered while decoding are reported as [`io::Error`]s of kind
/// [`io::ErrorKind::InvalidData`] wrapping an [`Error`]. Use [`decode_error`]
/// to tell them apart from errors of the underlying reader.
pub struct SparseStream<R> {
    kind: StreamKind<R>,
}

impl<R: Read> SparseStream<R> {
    pub fn new(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let mut prefix = vec![0u8; mem::size_of::<RawHeader>()];
        let n = inner
            .read_full(&mut prefix)
            .map_err(|e| Error::DataRead("magic", e))?;
        prefix.truncate(n);

        let is_sparse = prefix.len() >= 4
            && u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) == HEADER_MAGIC;
        let reader = Cursor::new(prefix).chain(inner);

        let kind = if is_sparse {
            StreamKind::Sparse(Box::new(Unsparser {
                reader: SparseReader::new(reader, crc_mode)?,
                segment: Segment::Pending,
            }))
        } else {
            StreamKind::Raw(reader)
        };

        Ok(Self { kind })
    }

    /// The sparse header if the input is a sparse image.
    pub fn header(&self) -> Option<Header> {
        match &self.kind {
            StreamKind::Raw(_) => None,
            StreamKind::Sparse(u) => Some(u.reader.header()),
        }
    }

    /// The unsparsed size from the sparse header. This is [`None`] if the input
    /// is not a sparse image, in which case the size is not known up front.
    pub fn unsparsed_size(&self) -> Option<u64> {
        self.header().map(|h| h.unsparsed_size())
    }

    /// The number of bytes this stream will produce, falling back to the
    /// caller's `declared_size` when the input is not sparse.
    pub fn logical_size(&self, declared_size: u64) -> u64 {
        self.unsparsed_size().unwrap_or(declared_size)
    }
}

impl<R: Read> Read for SparseStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            StreamKind::Raw(r) => r.read(buf),
            StreamKind::Sparse(u) => u.read(buf),
        }
    }
}

/// A type for writing sparse files.
pub struct SparseWriter<W> {
    inner: W,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to write.
    chunk: u32,
    /// Number of bytes left to write for the current data chunk.
    data_remain: u32,
    hasher: Hasher,
}

impl<W: Write> SparseWriter<W> {
    /// Create a new writer. The stream does not need to be seekable, so the
    /// [`Header`] must be fully known up front.
    pub fn new(mut inner: W, header: Header) -> Result<Self> {
        if header.minor_version != MINOR_VERSION {
            return Err(Error::UnsupportedMinorVersion(header.minor_version));
        }

        let header = RawHeader {
            magic: HEADER_MAGIC.into(),
            major_version: header.major_version.into(),
            minor_version: header.minor_version.into(),
            file_hdr_sz: (mem::size_of::<RawHeader>() as u16).into(),
            chunk_hdr_sz: (mem::size_of::<RawChunk>() as u16).into(),
            blk_sz: header.block_size.into(),
            total_blks: header.num_blocks.into(),
            total_chunks: header.num_chunks.into(),
            image_checksum: header.crc32.into(),
        };

        header.validate()?;

        header
            .write_to_io(&mut inner)
            .map_err(|e| Error::DataWrite("header", e))?;

        Ok(Self {
            inner,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            hasher: Hasher::new(),
        })
    }

    /// Write the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully written first.
    pub fn start_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if self.data_remain != 0 {
            return Err(Error::UnwrittenChunkData(self.data_remain));
        }

        if self.chunk == self.header.total_chunks.get() {
            return Err(Error::TooManyChunks);
        }

        if chunk.bounds.start != self.block {
            return Err(Error::GapBetweenChunks {
                prev_end: self.block,
                cur_start: chunk.bounds.start,
            });
        }

        let mut raw_chunk = RawChunk {
            chunk_type: match chunk.data {
                ChunkData::Data => CHUNK_TYPE_RAW.into(),
                ChunkData::Fill(_) => CHUNK_TYPE_FILL.into(),
                ChunkData::Hole => CHUNK_TYPE_DONT_CARE.into(),
                ChunkData::Crc32(_) => CHUNK_TYPE_CRC32.into(),
            },
            reserved1: 0.into(),
            chunk_sz: chunk.bounds.len().into(),
            total_sz: 0.into(),
        };

        raw_chunk.total_sz = raw_chunk.expected_size(self.chunk, &self.header)?.into();

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        self.chunk += 1;
        self.block = chunk.bounds.end;

        raw_chunk
            .write_to_io(&mut self.inner)
            .map_err(|e| Error::DataWrite("chunk", e))?;

        let block_size = self.header.blk_sz.get();

        match chunk.data {
            ChunkData::Data => {
                self.data_remain =
                    raw_chunk.total_sz.get() - u32::from(self.header.chunk_hdr_sz.get());
            }
            ChunkData::Fill(fill_value) => {
                self.inner
                    .write_all(&fill_value.to_le_bytes())
                    .map_err(|e| Error::DataWrite("chunk_fill_value", e))?;

                hash_fill_chunk(chunk.bounds.len(), block_size, fill_value, &mut self.hasher);
            }
            ChunkData::Hole => {
                hash_fill_chunk(chunk.bounds.len(), block_size, 0, &mut self.hasher);
            }
            ChunkData::Crc32(expected) => {
                self.inner
                    .write_all(&expected.to_le_bytes())
                    .map_err(|e| Error::DataWrite("chunk_crc32", e))?;

                let actual = self.hasher.clone().finalize();
                if actual != expected {
                    return Err(Error::MismatchedCrc32Checkpoint { expected, actual });
                }
            }
        }

        Ok(())
    }

    /// Verify the final checksum and return the underlying writer.
    pub fn finish(self) -> Result<W> {
        let expected = self.header.image_checksum.get();
        if expected != 0 {
            let actual = self.hasher.finalize();

            if actual != expected {
                return Err(Error::MismatchedCrc32Final { expected, actual });
            }
        }

        Ok(self.inner)
    }
}

impl<W: Write> Write for SparseWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let to_write = buf.len().min(self.data_remain as usize);

        let n = self.inner.write(&buf[..to_write])?;

        self.hasher.update(&buf[..n]);

        self.data_remain -= n as u32;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Classify a single block. All-zero blocks become holes.
fn classify_block(block: &[u8]) -> ChunkData {
    let first = &block[..4];

    if block.chunks_exact(4).all(|c| c == first) {
        let value = u32::from_le_bytes([first[0], first[1], first[2], first[3]]);
        if value == 0 {
            ChunkData::Hole
        } else {
            ChunkData::Fill(value)
        }
    } else {
        ChunkData::Data
    }
}

/// Compute the minimal list of chunks for a raw image by scanning it block by
/// block. Data chunks are split so that none exceed 64 MiB. Returns the chunks
/// and the CRC32 of the whole image.
pub fn compute_chunks(
    mut reader: impl Read,
    block_size: u32,
    cancel_signal: &AtomicBool,
) -> Result<(Vec<Chunk>, u32)> {
    if block_size == 0 || block_size % 4 != 0 {
        return Err(Error::InvalidBlockSize(block_size));
    }

    let max_data_blocks = (MAX_DATA_CHUNK_BYTES / block_size).max(1);
    let mut chunks: Vec<Chunk> = vec![];
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut block = 0u32;

    loop {
        stream::check_cancel(cancel_signal).map_err(|e| Error::DataRead("block", e))?;

        let n = reader
            .read_full(&mut buf)
            .map_err(|e| Error::DataRead("block", e))?;
        if n == 0 {
            break;
        } else if n != buf.len() {
            return Err(Error::UnalignedInput {
                size: u64::from(block) * u64::from(block_size) + n as u64,
                block_size,
            });
        }

        hasher.update(&buf);

        let data = classify_block(&buf);
        let end = block.checked_add(1).ok_or(Error::TooManyBlocks(block_size))?;

        match chunks.last_mut() {
            Some(last)
                if last.data == data
                    && (data != ChunkData::Data || last.bounds.len() < max_data_blocks) =>
            {
                last.bounds.end = end;
            }
            _ => chunks.push(Chunk {
                bounds: ChunkBounds { start: block, end },
                data,
            }),
        }

        block = end;
    }

    Ok((chunks, hasher.finalize()))
}

/// Pack a raw image into a sparse image. The input is read twice: once to
/// compute the chunk list and once to copy the data chunks.
pub fn pack(
    mut reader: impl Read + Seek,
    writer: impl Write,
    block_size: u32,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    let (chunks, crc32) = compute_chunks(&mut reader, block_size, cancel_signal)?;

    let header = Header {
        major_version: MAJOR_VERSION,
        minor_version: MINOR_VERSION,
        block_size,
        num_blocks: chunks.last().map(|c| c.bounds.end).unwrap_or(0),
        // This can't overflow because there is never more than one chunk per
        // block.
        num_chunks: chunks.len() as u32,
        crc32,
    };

    let mut sparse_writer = SparseWriter::new(writer, header)?;

    for chunk in chunks {
        sparse_writer.start_chunk(chunk)?;

        if chunk.data == ChunkData::Data {
            let offset = u64::from(chunk.bounds.start) * u64::from(block_size);
            let size = u64::from(chunk.bounds.len()) * u64::from(block_size);

            reader
                .seek(SeekFrom::Start(offset))
                .map_err(|e| Error::DataRead("seek", e))?;

            stream::copy_n(&mut reader, &mut sparse_writer, size, cancel_signal)
                .map_err(|e| Error::DataWrite("data", e))?;
        }
    }

    sparse_writer
        .finish()?
        .flush()
        .map_err(|e| Error::DataWrite("flush", e))?;

    Ok(header)
}
