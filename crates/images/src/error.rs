// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf};

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised by image stores and open images
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred
    #[error("io: {0}")]
    IO(#[from] io::Error),

    /// Image metadata could not be encoded or decoded
    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("image already exists: {0}")]
    AlreadyExists(String),

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("invalid pool: {0}")]
    InvalidPool(PathBuf),

    #[error("invalid image name: {0:?}")]
    InvalidName(String),

    /// The option set was rejected
    #[error("invalid image options: {0}")]
    InvalidOptions(&'static str),

    #[error("write of {length} bytes at {offset} exceeds image size {capacity}")]
    OutOfBounds { offset: u64, length: u64, capacity: u64 },

    #[error("write length {length} is not a multiple of the {pattern} byte pattern")]
    InvalidPattern { length: u64, pattern: usize },

    /// The image size could not be determined
    #[error("cannot query image size")]
    SizeQuery,

    /// A write could not be queued
    #[error("cannot submit write: {0}")]
    Submit(Errno),
}

impl Error {
    /// The error code equivalent of this error
    pub fn errno(&self) -> Errno {
        match self {
            Error::IO(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            Error::Metadata(_) => Errno::EIO,
            Error::AlreadyExists(_) => Errno::EEXIST,
            Error::NotFound(_) => Errno::ENOENT,
            Error::InvalidPool(_) => Errno::ENOENT,
            Error::InvalidName(_)
            | Error::InvalidOptions(_)
            | Error::OutOfBounds { .. }
            | Error::InvalidPattern { .. }
            | Error::SizeQuery => Errno::EINVAL,
            Error::Submit(errno) => *errno,
        }
    }
}
