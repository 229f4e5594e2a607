// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    cli::status,
    service::{DynamicSystemService, directory::DirectoryService},
    util::NumBytes,
};

pub fn status_main(cli: &StatusCli) -> Result<()> {
    let service = DirectoryService::new(&cli.output_dir);

    let installed = service
        .installed()
        .with_context(|| format!("Failed to read installation state: {:?}", cli.output_dir))?;
    let Some(installed) = installed else {
        println!("No dynamic system installed");
        return Ok(());
    };

    println!("Slot: {}", installed.slot);
    println!("Enabled: {}", service.is_enabled());
    if service.is_enabled() {
        println!("One-shot: {}", service.is_one_shot());
    }
    println!("Partitions:");

    for p in &installed.partitions {
        let mode = if p.read_only { "ro" } else { "rw" };
        println!("- {} ({mode}): {:?}", p.name, NumBytes(p.size));
    }

    Ok(())
}

pub fn discard_main(cli: &DiscardCli) -> Result<()> {
    let service = DirectoryService::new(&cli.output_dir);

    if !service.is_installed() {
        bail!("No dynamic system installed in: {:?}", cli.output_dir);
    } else if !service.remove() {
        bail!("Failed to remove dynamic system from: {:?}", cli.output_dir);
    }

    status!("Removed dynamic system");

    Ok(())
}

fn set_enabled(output_dir: &Path, enable: bool, one_shot: bool) -> Result<()> {
    let service = DirectoryService::new(output_dir);

    if !service.is_installed() {
        bail!("No dynamic system installed in: {output_dir:?}");
    } else if !service.set_enabled(enable, one_shot) {
        bail!("Failed to update dynamic system state in: {output_dir:?}");
    }

    Ok(())
}

pub fn enable_main(cli: &EnableCli) -> Result<()> {
    set_enabled(&cli.output_dir, true, cli.one_shot)?;

    if cli.one_shot {
        status!("Enabled dynamic system for the next boot only");
    } else {
        status!("Enabled dynamic system");
    }

    Ok(())
}

pub fn disable_main(cli: &DisableCli) -> Result<()> {
    set_enabled(&cli.output_dir, false, false)?;

    status!("Disabled dynamic system");

    Ok(())
}

/// Show the installed dynamic system.
#[derive(Debug, Parser)]
pub struct StatusCli {
    /// Installation directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,
}

/// Remove the installed dynamic system.
#[derive(Debug, Parser)]
pub struct DiscardCli {
    /// Installation directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,
}

/// Enable booting into the installed dynamic system.
#[derive(Debug, Parser)]
pub struct EnableCli {
    /// Installation directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,

    /// Only boot into the dynamic system once.
    #[arg(long)]
    one_shot: bool,
}

/// Disable booting into the installed dynamic system.
#[derive(Debug, Parser)]
pub struct DisableCli {
    /// Installation directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,
}
