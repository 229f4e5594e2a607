/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, debug};

use crate::{
    cli::{dsu, install, sparse},
    config::Config,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

/// Log to stderr so that stdout stays usable for command output.
pub fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(level))
        .init();
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    Install(install::InstallCli),
    Status(dsu::StatusCli),
    Discard(dsu::DiscardCli),
    Enable(dsu::EnableCli),
    Disable(dsu::DisableCli),
    Sparse(sparse::SparseCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Path to TOML config file.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let Some(path) = &cli.config else {
        return Ok(Config::default());
    };

    let config = Config::load(path).with_context(|| format!("Failed to load config: {path:?}"))?;
    debug!("Loaded config: {config:?}");

    Ok(config)
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    let config = load_config(&cli)?;

    match &cli.command {
        Command::Install(c) => install::install_main(c, &config, cancel_signal),
        Command::Status(c) => dsu::status_main(c),
        Command::Discard(c) => dsu::discard_main(c),
        Command::Enable(c) => dsu::enable_main(c),
        Command::Disable(c) => dsu::disable_main(c),
        Command::Sparse(c) => sparse::sparse_main(c, cancel_signal),
    }
}
