/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io::{self, Cursor, Read, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use dsustream::format::sparse::{
    self, Chunk, ChunkBounds, ChunkData, CrcMode, Header, SparseReader, SparseStream,
    SparseWriter,
};
use proptest::prelude::*;

#[derive(Clone, Copy)]
struct TestChunk {
    chunk: Chunk,
    data: &'static [u8],
}

fn build(block_size: u32, crc32: u32, test_chunks: &[TestChunk]) -> (Header, Vec<u8>) {
    let num_blocks = test_chunks.iter().map(|d| d.chunk.bounds.len()).sum();
    let header = Header {
        major_version: sparse::MAJOR_VERSION,
        minor_version: sparse::MINOR_VERSION,
        block_size,
        num_blocks,
        num_chunks: test_chunks.len() as u32,
        crc32,
    };

    let writer = Cursor::new(Vec::new());
    let mut sparse_writer = SparseWriter::new(writer, header).unwrap();

    for test_chunk in test_chunks {
        sparse_writer.start_chunk(test_chunk.chunk).unwrap();

        if !test_chunk.data.is_empty() {
            sparse_writer.write_all(test_chunk.data).unwrap();
        }
    }

    let writer = sparse_writer.finish().unwrap();

    (header, writer.into_inner())
}

fn decode(data: &[u8]) -> Result<(Option<u64>, Vec<u8>), io::Error> {
    let mut stream = SparseStream::new(Cursor::new(data), CrcMode::Validate)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let size = stream.unsparsed_size();

    let mut buf = vec![];
    stream.read_to_end(&mut buf)?;

    Ok((size, buf))
}

const FULL_IMAGE: [TestChunk; 4] = [
    TestChunk {
        chunk: Chunk {
            bounds: ChunkBounds { start: 0, end: 1 },
            data: ChunkData::Data,
        },
        data: b"\x01\x02\x03\x04\x05\x06\x07\x08",
    },
    TestChunk {
        chunk: Chunk {
            bounds: ChunkBounds { start: 1, end: 3 },
            data: ChunkData::Fill(0x04030201),
        },
        data: b"",
    },
    TestChunk {
        chunk: Chunk {
            bounds: ChunkBounds { start: 3, end: 4 },
            data: ChunkData::Hole,
        },
        data: b"",
    },
    TestChunk {
        chunk: Chunk {
            bounds: ChunkBounds { start: 4, end: 5 },
            data: ChunkData::Data,
        },
        data: b"abcdefgh",
    },
];

fn full_image_data() -> Vec<u8> {
    let mut expected = b"\x01\x02\x03\x04\x05\x06\x07\x08".to_vec();
    expected.extend_from_slice(&[1, 2, 3, 4].repeat(4));
    expected.extend_from_slice(&[0u8; 8]);
    expected.extend_from_slice(b"abcdefgh");
    expected
}

#[test]
fn chunk_structure_round_trip() {
    let crc32 = crc32fast::hash(&full_image_data());
    let (header, data) = build(8, crc32, &FULL_IMAGE);

    let mut sparse_reader = SparseReader::new(Cursor::new(&data), CrcMode::Validate).unwrap();
    assert_eq!(sparse_reader.header(), header);

    let mut test_chunks_iter = FULL_IMAGE.iter();

    while let Some(chunk) = sparse_reader.next_chunk().unwrap() {
        let test_chunk = test_chunks_iter.next().unwrap();

        assert_eq!(chunk, test_chunk.chunk);

        if !test_chunk.data.is_empty() {
            let mut buf = vec![];
            sparse_reader.read_to_end(&mut buf).unwrap();

            assert_eq!(buf, test_chunk.data);
        }
    }

    assert!(test_chunks_iter.next().is_none());
    sparse_reader.finish().unwrap();
}

#[test]
fn stream_linearizes_chunks() {
    let expected = full_image_data();
    let (_, data) = build(8, crc32fast::hash(&expected), &FULL_IMAGE);

    let (size, decoded) = decode(&data).unwrap();
    assert_eq!(size, Some(expected.len() as u64));
    assert_eq!(decoded, expected);
}

#[test]
fn bad_final_checksum() {
    // The writer verifies the checksum too, so corrupt it afterwards.
    let (_, mut data) = build(8, 0, &FULL_IMAGE);
    data[24..28].copy_from_slice(&0x12345678u32.to_le_bytes());

    let err = decode(&data).unwrap_err();
    assert_matches!(
        sparse::decode_error(&err),
        Some(sparse::Error::MismatchedCrc32Final { .. })
    );
}

#[test]
fn fill_then_raw() {
    // One 4096-byte fill block followed by a raw block.
    let (_, data) = build(
        4096,
        0,
        &[
            TestChunk {
                chunk: Chunk {
                    bounds: ChunkBounds { start: 0, end: 1 },
                    data: ChunkData::Fill(0),
                },
                data: b"",
            },
            TestChunk {
                chunk: Chunk {
                    bounds: ChunkBounds { start: 1, end: 2 },
                    data: ChunkData::Data,
                },
                data: &[0xaa; 4096],
            },
        ],
    );

    let (size, decoded) = decode(&data).unwrap();
    assert_eq!(size, Some(8192));
    assert!(decoded[..4096].iter().all(|b| *b == 0));
    assert!(decoded[4096..].iter().all(|b| *b == 0xaa));

    // Same with a small block size so the raw payload is only 12 bytes.
    let (_, data) = build(
        4,
        0,
        &[
            TestChunk {
                chunk: Chunk {
                    bounds: ChunkBounds { start: 0, end: 1024 },
                    data: ChunkData::Fill(0xdeadbeef),
                },
                data: b"",
            },
            TestChunk {
                chunk: Chunk {
                    bounds: ChunkBounds {
                        start: 1024,
                        end: 1027,
                    },
                    data: ChunkData::Data,
                },
                data: b"0123456789ab",
            },
        ],
    );

    let (size, decoded) = decode(&data).unwrap();
    assert_eq!(size, Some(4108));
    assert_eq!(decoded.len(), 4108);
    assert_eq!(&decoded[..4], &0xdeadbeefu32.to_le_bytes());
    assert_eq!(&decoded[4096..], b"0123456789ab");
}

#[test]
fn raw_chunk_must_be_block_aligned() {
    let (_, mut data) = build(
        4,
        0,
        &[TestChunk {
            chunk: Chunk {
                bounds: ChunkBounds { start: 0, end: 3 },
                data: ChunkData::Data,
            },
            data: b"0123456789ab",
        }],
    );

    // Claim a 10-byte payload in the chunk header's total size.
    data[28 + 8..28 + 12].copy_from_slice(&(12u32 + 10).to_le_bytes());

    let err = decode(&data).unwrap_err();
    assert_matches!(
        sparse::decode_error(&err),
        Some(sparse::Error::InvalidChunkSize { .. })
    );
}

#[test]
fn raw_input_passes_through() {
    let input = b"not a sparse image, just some bytes".to_vec();

    let (size, decoded) = decode(&input).unwrap();
    assert_eq!(size, None);
    assert_eq!(decoded, input);

    let (size, decoded) = decode(b"").unwrap();
    assert_eq!(size, None);
    assert!(decoded.is_empty());
}

#[test]
fn declared_size_is_ignored_for_sparse() {
    let expected = full_image_data();
    let (_, data) = build(8, 0, &FULL_IMAGE);

    let stream = SparseStream::new(Cursor::new(&data), CrcMode::Validate).unwrap();
    assert_eq!(stream.logical_size(data.len() as u64), expected.len() as u64);

    let stream = SparseStream::new(Cursor::new(b"raw"), CrcMode::Validate).unwrap();
    assert_eq!(stream.logical_size(3), 3);
}

#[test]
fn pack_produces_expected_chunks() {
    let mut raw = vec![0u8; 4 * 16];
    raw[16..32].copy_from_slice(&[7, 7, 7, 7].repeat(4));
    raw[32..48].copy_from_slice(b"0123456789abcdef");

    let mut packed = Cursor::new(Vec::new());
    let header = sparse::pack(
        Cursor::new(&raw),
        &mut packed,
        16,
        &AtomicBool::new(false),
    )
    .unwrap();

    assert_eq!(header.num_blocks, 4);
    assert_eq!(header.crc32, crc32fast::hash(&raw));

    let mut sparse_reader =
        SparseReader::new(Cursor::new(packed.get_ref()), CrcMode::Validate).unwrap();
    let mut chunks = vec![];

    while let Some(chunk) = sparse_reader.next_chunk().unwrap() {
        if chunk.data == ChunkData::Data {
            io::copy(&mut sparse_reader, &mut io::sink()).unwrap();
        }
        chunks.push(chunk.data);
    }

    assert_eq!(
        chunks,
        [
            ChunkData::Hole,
            ChunkData::Fill(0x07070707),
            ChunkData::Data,
            ChunkData::Hole,
        ]
    );
}

proptest! {
    #[test]
    fn pack_then_decode_is_identity(
        blocks in prop::collection::vec(
            prop_oneof![
                Just(vec![0u8; 16]),
                any::<u8>().prop_map(|b| vec![b; 16]),
                prop::collection::vec(any::<u8>(), 16),
            ],
            0..32,
        ),
    ) {
        let raw = blocks.concat();

        let mut packed = Cursor::new(Vec::new());
        sparse::pack(Cursor::new(&raw), &mut packed, 16, &AtomicBool::new(false)).unwrap();

        let (size, decoded) = decode(packed.get_ref()).unwrap();
        prop_assert_eq!(size, Some(raw.len() as u64));
        prop_assert_eq!(decoded, raw);
    }
}
