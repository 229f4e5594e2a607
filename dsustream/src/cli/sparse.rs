// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::{
    cli::status,
    format::sparse::{self, Chunk, ChunkData, CrcMode, Header, SparseReader, SparseStream},
    stream::{self, ReadDiscardExt},
    util::NumBytes,
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

#[derive(Clone)]
struct Metadata {
    header: Header,
    chunks: Vec<Chunk>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("header", &self.header)
            .field("chunks", &CompactView(&self.chunks))
            .finish()
    }
}

fn open_reader(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))
}

fn open_writer(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to open for writing: {path:?}"))
}

fn crc_mode(no_verify: bool) -> CrcMode {
    if no_verify {
        CrcMode::Ignore
    } else {
        CrcMode::Validate
    }
}

fn unpack_subcommand(cli: &UnpackCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = BufReader::new(open_reader(&cli.input)?);
    let mut stream = SparseStream::new(reader, crc_mode(cli.no_verify))
        .with_context(|| format!("Failed to read sparse header: {:?}", cli.input))?;

    let Some(expected) = stream.unsparsed_size() else {
        bail!("Not a sparse image: {:?}", cli.input);
    };

    let mut writer = BufWriter::new(open_writer(&cli.output)?);

    let n = stream::copy(&mut stream, &mut writer, cancel_signal)
        .with_context(|| format!("Failed to unsparse: {:?} -> {:?}", cli.input, cli.output))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush: {:?}", cli.output))?;

    if n != expected {
        bail!("Unsparsed {n} bytes, but header declares {expected} bytes");
    }

    status!("Unpacked {:?}", NumBytes(n));

    Ok(())
}

fn pack_subcommand(cli: &PackCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = BufReader::new(open_reader(&cli.input)?);
    let writer = BufWriter::new(open_writer(&cli.output)?);

    let header = sparse::pack(reader, writer, cli.block_size, cancel_signal)
        .with_context(|| format!("Failed to pack: {:?} -> {:?}", cli.input, cli.output))?;

    status!(
        "Packed {:?} into {} chunks",
        NumBytes(header.unsparsed_size()),
        header.num_chunks,
    );

    Ok(())
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let reader = BufReader::new(open_reader(&cli.input)?);
    let mut sparse_reader = SparseReader::new(reader, crc_mode(cli.no_verify))
        .with_context(|| format!("Failed to read sparse file: {:?}", cli.input))?;

    let mut metadata = Metadata {
        header: sparse_reader.header(),
        chunks: vec![],
    };

    while let Some(chunk) = sparse_reader
        .next_chunk()
        .with_context(|| format!("Failed to read chunk: {:?}", cli.input))?
    {
        if chunk.data == ChunkData::Data {
            // This cannot overflow.
            let to_skip = chunk.bounds.len() * metadata.header.block_size;

            sparse_reader
                .read_discard_exact(to_skip.into())
                .with_context(|| format!("Failed to skip chunk data: {:?}", cli.input))?;
        }

        metadata.chunks.push(chunk);
    }

    sparse_reader
        .verify()
        .with_context(|| format!("Failed to verify sparse file: {:?}", cli.input))?;

    println!("{metadata:#?}");

    Ok(())
}

pub fn sparse_main(cli: &SparseCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        SparseCommand::Unpack(c) => unpack_subcommand(c, cancel_signal),
        SparseCommand::Pack(c) => pack_subcommand(c, cancel_signal),
        SparseCommand::Info(c) => info_subcommand(c),
    }
}

/// Unpack a sparse image.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Skip CRC32 checks.
    #[arg(long)]
    no_verify: bool,
}

/// Pack a sparse image.
///
/// Blocks of zeros are stored as hole chunks and blocks consisting of a
/// repeated 4-byte pattern are stored as fill chunks.
#[derive(Debug, Parser)]
struct PackCli {
    /// Path to input raw image.
    ///
    /// The size must be a multiple of the block size.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Block size.
    #[arg(short, long, value_name = "BYTES", default_value_t = 4096)]
    block_size: u32,
}

/// Display sparse image metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Skip CRC32 checks.
    #[arg(long)]
    no_verify: bool,
}

#[derive(Debug, Subcommand)]
enum SparseCommand {
    Unpack(UnpackCli),
    Pack(PackCli),
    Info(InfoCli),
}

/// Pack, unpack, and inspect sparse images.
#[derive(Debug, Parser)]
pub struct SparseCli {
    #[command(subcommand)]
    command: SparseCommand,
}
