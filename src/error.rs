// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Error kinds shared across the accelerator control plane.

use std::io;

use thiserror::Error;

/// Errors returned by the public surface of this crate.
///
/// These map directly onto the error kinds named in the design: a missing
/// platform capability, a failed ioctl against the accelerator, a short or
/// failed guest-memory mapping, a virtqueue ring relocated out from under a
/// running device, and a violated table invariant.
#[derive(Debug, Error)]
pub enum Error {
    /// The accelerator binding lacks a capability the caller asked for.
    #[error("accelerator does not support: {0}")]
    NotSupported(&'static str),

    /// An ioctl against the accelerator control channel failed.
    #[error("accelerator ioctl {0} failed")]
    Io(&'static str, #[source] io::Error),

    /// A guest-memory mapping request returned null or a short length.
    #[error("guest memory mapping failed or was truncated")]
    NoMemory,

    /// A virtqueue ring moved host-virtual address while the device was running.
    #[error("virtqueue {0} ring relocated under a live device")]
    Relocated(u16),

    /// A memory-region-table invariant was violated; this is a programmer error.
    #[error("memory-region table invariant violated: {0}")]
    Inconsistent(&'static str),
}

/// Convenience result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for [`Error::Relocated`] and [`Error::Inconsistent`], the two
    /// kinds the design calls fatal: the caller should tear the device down
    /// or abort rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Relocated(_) | Error::Inconsistent(_))
    }
}
