// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};

use crate::{
    cli::{status, warning},
    config::{self, Config, Manifest},
    format::sparse::CrcMode,
    install::{
        CancelToken, InstallObserver, InstallOptions, InstallationSource, InstallationStep,
        Installer, Outcome, Progress,
    },
    service::directory::DirectoryService,
    source::ImageLocation,
    util::{NumBytes, parse_size},
};

/// Observer that prints the progress to stdout.
#[derive(Default)]
struct StatusObserver {
    /// Last printed progress as a percentage, rounded down to a multiple of 10.
    last_percent: Option<u32>,
}

impl InstallObserver for StatusObserver {
    fn on_step(&mut self, step: InstallationStep) {
        if matches!(
            step,
            InstallationStep::ResolvingSource
                | InstallationStep::Preparing
                | InstallationStep::Finishing
        ) {
            status!("{step}");
        }
    }

    fn on_partition_created(&mut self, name: &str) {
        status!("Created partition: {name}");
        self.last_percent = None;
    }

    fn on_progress(&mut self, progress: &Progress) {
        let percent = (progress.fraction() * 100.0) as u32 / 10 * 10;

        if self.last_percent != Some(percent) {
            status!(
                "{}: {percent}% of {:?}",
                progress.partition,
                NumBytes(progress.total_bytes),
            );
            self.last_percent = Some(percent);
        }
    }

    fn on_cancelled(&mut self) {
        warning!("Installation cancelled");
    }
}

fn build_options(cli: &InstallCli, config: &Config) -> Result<InstallOptions> {
    let mut options = config.install_options().context("Invalid config")?;

    if let Some(slot) = &cli.slot {
        options.slot.clone_from(slot);
    }
    if let Some(size) = cli.userdata_size {
        options.userdata_size = size;
    }
    if let Some(size) = cli.chunk_size {
        options.chunk_size = config::chunk_size(size)?;
    }
    if cli.no_verify {
        options.crc_mode = CrcMode::Ignore;
    }

    Ok(options)
}

fn build_source(cli: &InstallCli) -> Result<InstallationSource> {
    let source = if let Some(image) = &cli.system_image {
        InstallationSource::SingleImage {
            image: ImageLocation::parse(image),
            size: cli.size,
        }
    } else if let Some(path) = &cli.manifest {
        let manifest =
            Manifest::load(path).with_context(|| format!("Failed to load manifest: {path:?}"))?;
        let base_dir = path.parent().unwrap_or(Path::new("."));

        InstallationSource::MultipleImages(manifest.into_descriptors(base_dir))
    } else if let Some(path) = &cli.package {
        InstallationSource::Package(ImageLocation::Path(path.clone()))
    } else if let Some(url) = &cli.url {
        InstallationSource::RemoteUrl(url.clone())
    } else {
        bail!("No installation source specified");
    };

    Ok(source)
}

pub fn install_main(
    cli: &InstallCli,
    config: &Config,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let options = build_options(cli, config)?;
    let source = build_source(cli)?;

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_dir))?;

    let service = Arc::new(DirectoryService::new(&cli.output_dir));
    let slot_dir = service.slot_dir(&options.slot);

    let installer = Installer::new(service, source)
        .with_options(options)
        .with_cancel_token(CancelToken::from_signal(cancel_signal.clone()));

    match installer.run(&mut StatusObserver::default()) {
        Outcome::Success => {
            status!("Installed to: {slot_dir:?}");
            Ok(())
        }
        Outcome::Cancelled => bail!("Installation was cancelled"),
        Outcome::Failed(e) => {
            let step = e.step();
            Err(e).with_context(|| format!("Installation failed: {step}"))
        }
    }
}

/// Install a dynamic system into a directory.
///
/// Every partition is written to `<output dir>/<slot>/<partition>.img`. Sparse
/// images are unsparsed while they are streamed. The installation is only
/// committed if every partition was written successfully.
#[derive(Debug, Parser)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["system_image", "manifest", "package", "url"]),
))]
pub struct InstallCli {
    /// Path or URL to a system image (raw or sparse).
    #[arg(long, value_name = "PATH_OR_URL")]
    system_image: Option<String>,

    /// Size of the system image.
    ///
    /// Only needed for raw images whose size cannot be determined, such as
    /// those downloaded from a URL. Accepts K, M, G, and T suffixes.
    #[arg(long, value_name = "BYTES", value_parser = parse_size, requires = "system_image")]
    size: Option<u64>,

    /// Path to a TOML manifest listing multiple images.
    #[arg(long, value_name = "FILE", value_parser)]
    manifest: Option<PathBuf>,

    /// Path to a zip package containing `*.img` partition images.
    #[arg(long, value_name = "FILE", value_parser)]
    package: Option<PathBuf>,

    /// URL of a zip package containing `*.img` partition images.
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Directory to install into.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,

    /// Size of the writable userdata partition.
    #[arg(long, value_name = "BYTES", value_parser = parse_size)]
    userdata_size: Option<u64>,

    /// Name of the slot to install into.
    #[arg(long, value_name = "NAME")]
    slot: Option<String>,

    /// Size of each chunk transferred to the service.
    #[arg(long, value_name = "BYTES", value_parser = parse_size)]
    chunk_size: Option<u64>,

    /// Skip CRC32 checks of sparse images.
    #[arg(long)]
    no_verify: bool,
}
