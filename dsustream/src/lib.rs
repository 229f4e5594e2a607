/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Streaming installer for dynamic system images.
//!
//! Partition images are streamed (optionally unsparsed on the fly) into a
//! privileged service through a single shared buffer. See [`install`] for the
//! entry point.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod config;
pub mod format;
pub mod install;
pub mod partition;
pub mod service;
pub mod source;
pub mod stream;
pub mod transport;
pub mod util;
