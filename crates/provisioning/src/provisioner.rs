// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use images::{ImageOptions, ImageStore};
use log::{debug, info};

use crate::{
    progress::{LogProgress, NoProgress, ProgressSink},
    thick::{ThickWriter, PROGRESS_MESSAGE},
    Config, Error,
};

/// A request to create an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Name of the new image
    pub name: String,

    /// Size of the new image in bytes
    pub size: u64,

    /// Options for the new image, or the configured defaults if unset
    pub options: Option<ImageOptions>,

    /// Allocate all backing storage after creation
    pub thick: bool,

    /// Suppress progress output while thick provisioning
    pub no_progress: bool,
}

impl CreateRequest {
    /// A thin image with default options
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            options: None,
            thick: false,
            no_progress: false,
        }
    }

    pub fn with_options(self, options: ImageOptions) -> Self {
        Self {
            options: Some(options),
            ..self
        }
    }

    pub fn thick(self, thick: bool) -> Self {
        Self { thick, ..self }
    }

    pub fn no_progress(self, no_progress: bool) -> Self {
        Self { no_progress, ..self }
    }
}

/// Provisioner
pub struct Provisioner<S> {
    /// The pool images are created in
    store: S,

    /// Provisioning configuration
    config: Config,
}

impl<S> Provisioner<S>
where
    S: ImageStore,
{
    /// Create a new provisioner for a pool, using the default configuration
    pub fn new(store: S) -> Self {
        debug!("Creating new provisioner");
        Self {
            store,
            config: Config::default(),
        }
    }

    /// Replace the configuration
    pub fn with_config(self, config: Config) -> Self {
        Self { config, ..self }
    }

    /// The pool images are created in
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create an image. Only metadata is allocated, and a failure is not retried.
    pub fn create(&self, name: &str, size: u64, options: &ImageOptions) -> Result<(), Error> {
        info!("Creating image {name} of {size} bytes");
        self.store.create(name, size, options).map_err(|source| Error::Create {
            name: name.to_owned(),
            source,
        })
    }

    /// Thick provision an existing image, closing it again whatever the outcome
    pub fn thick_provision(&self, name: &str, show_progress: bool) -> Result<(), Error> {
        let writer = ThickWriter::new(&self.config.thick).map_err(Error::Settings)?;
        self.write_image(&writer, name, show_progress)
    }

    fn write_image(&self, writer: &ThickWriter, name: &str, show_progress: bool) -> Result<(), Error> {
        let image = self.store.open(name).map_err(|source| Error::Open {
            name: name.to_owned(),
            source,
        })?;

        let mut progress: Box<dyn ProgressSink> = if show_progress {
            Box::new(LogProgress::new(PROGRESS_MESSAGE))
        } else {
            Box::new(NoProgress)
        };
        let written = writer.write(&image, progress.as_mut());
        let closed = self.store.close(image);

        written.map_err(|source| Error::ThickWrite {
            name: name.to_owned(),
            source,
        })?;
        closed.map_err(|source| Error::Close {
            name: name.to_owned(),
            source,
        })
    }

    /// Create an image and, if requested, thick provision it
    ///
    /// Thick provisioning settings are validated before the image is created. If the
    /// write fails the image is left in place and [`Error::ThickWrite`] is returned.
    pub fn provision(&self, request: &CreateRequest) -> Result<(), Error> {
        let writer = if request.thick {
            Some(ThickWriter::new(&self.config.thick).map_err(Error::Settings)?)
        } else {
            None
        };

        let options = request.options.as_ref().unwrap_or(&self.config.image_defaults);
        self.create(&request.name, request.size, options)?;

        if let Some(writer) = writer {
            self.write_image(&writer, &request.name, !request.no_progress)?;
        }

        info!("Provisioned image {}", request.name);
        Ok(())
    }
}
