// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::Error;

mod units;
pub use units::*;

/// The type of a KDL value
#[derive(Debug)]
pub enum KdlType {
    /// A string value
    String,
    /// An integer value
    Integer,
}

impl fmt::Display for KdlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KdlType::String => f.write_str("string"),
            KdlType::Integer => f.write_str("int"),
        }
    }
}

/// Conversion from the type annotation of a KDL entry
pub trait FromKdlType<'a>: Sized {
    fn from_kdl_type(entry: &'a kdl::KdlEntry) -> Result<Self, Error>;
}
