// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Block-storage images and the asynchronous write primitive used to allocate them.
//!
//! A storage pool is represented by an [`ImageStore`]. Stores create images from a
//! size and an [`ImageOptions`] set, and hand out open [`Image`] handles. An open
//! image accepts same-pattern writes which execute in the background and are observed
//! through a [`Completion`] handle.
//!
//! Two stores are provided:
//!
//! - [`file::FileStore`]: a directory of sparse image files with JSON metadata
//! - [`mock::MockStore`]: a scripted in-memory store for exercising callers in tests

use nix::errno::Errno;

mod error;
pub mod file;
pub mod mock;
mod options;

pub use error::Error;
pub use options::{Feature, Features, ImageOptions, DEFAULT_ORDER, MAX_ORDER, MIN_ORDER};

/// Access pattern hint attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessHint {
    /// No particular pattern
    #[default]
    Normal,
    /// Writes will sweep the image in increasing offset order
    Sequential,
}

/// Handle to one in-flight asynchronous operation.
///
/// The handle may be queried any number of times until it is released. Releasing
/// consumes the handle; dropping it without a release abandons it to the backend.
pub trait Completion {
    /// Returns true once the operation has finished, successfully or not.
    fn is_complete(&self) -> bool;

    /// Returns the outcome of a completed operation.
    ///
    /// Querying an operation that has not completed yet yields `Err(Errno::EINPROGRESS)`.
    fn result(&self) -> Result<(), Errno>;

    /// Releases the handle once the caller is done with it.
    fn release(self)
    where
        Self: Sized,
    {
    }
}

/// An open, writable image.
pub trait Image {
    /// The completion handle produced by this image's writes
    type Completion: Completion;

    /// Returns the size of the image in bytes.
    fn size(&self) -> Result<u64, Error>;

    /// Submits a write filling `length` bytes at `offset` with repeats of `pattern`.
    ///
    /// `length` must be a multiple of the pattern length. The call returns as soon as
    /// the write is queued; its outcome is observed through the returned handle.
    fn write_same(
        &self,
        offset: u64,
        length: u64,
        pattern: &[u8],
        hint: AccessHint,
    ) -> Result<Self::Completion, Error>;
}

/// A storage pool which can create and open images.
pub trait ImageStore {
    /// The open image type handed out by this store
    type Image: Image;

    /// Creates a new image of `size` bytes. Only metadata is allocated.
    fn create(&self, name: &str, size: u64, options: &ImageOptions) -> Result<(), Error>;

    /// Opens an existing image for writing.
    fn open(&self, name: &str) -> Result<Self::Image, Error>;

    /// Closes an image previously returned from [`ImageStore::open`].
    fn close(&self, image: Self::Image) -> Result<(), Error>;
}

/// Checks that an image name is usable within a pool.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '@']) {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Checks the arguments of a same-pattern write against the image size.
pub(crate) fn validate_write(offset: u64, length: u64, pattern: &[u8], capacity: u64) -> Result<(), Error> {
    if pattern.is_empty() || length % pattern.len() as u64 != 0 {
        return Err(Error::InvalidPattern {
            length,
            pattern: pattern.len(),
        });
    }
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfBounds {
            offset,
            length,
            capacity,
        }),
    }
}
