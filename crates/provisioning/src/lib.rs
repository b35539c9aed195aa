// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Image creation and thick provisioning
//!
//! The [`Provisioner`] creates images in an [`images::ImageStore`] and, when asked,
//! eagerly allocates their backing storage with the [`thick::ThickWriter`].

mod errors;
pub use errors::*;

mod helpers;
use helpers::*;

mod types;
pub use types::*;

pub mod config;
pub use config::Config;

pub mod progress;
pub mod thick;

mod provisioner;
pub use provisioner::{CreateRequest, Provisioner};
