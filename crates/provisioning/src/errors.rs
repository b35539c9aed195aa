// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, sync::Arc};

use miette::{Diagnostic, NamedSource, SourceSpan};
use nix::errno::Errno;
use thiserror::Error;

use crate::{thick::WriteError, KdlType};

/// Error type for the provisioning crate
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] io::Error),

    #[diagnostic(transparent)]
    #[error(transparent)]
    Kdl(#[from] kdl::KdlError),

    #[error("unknown variant")]
    UnknownVariant,

    #[diagnostic(transparent)]
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[diagnostic(transparent)]
    #[error(transparent)]
    InvalidArguments(#[from] InvalidArguments),

    #[diagnostic(transparent)]
    #[error(transparent)]
    InvalidType(#[from] InvalidType),

    #[diagnostic(transparent)]
    #[error(transparent)]
    UnsupportedNode(#[from] UnsupportedNode),

    #[diagnostic(transparent)]
    #[error(transparent)]
    MissingEntry(#[from] MissingEntry),

    #[diagnostic(transparent)]
    #[error(transparent)]
    UnsupportedValue(#[from] UnsupportedValue),

    #[error("invalid thick provisioning settings")]
    Settings(#[source] WriteError),

    #[error("create error for image {name}")]
    Create {
        name: String,
        #[source]
        source: images::Error,
    },

    #[error("cannot open image {name} for thick provisioning")]
    Open {
        name: String,
        #[source]
        source: images::Error,
    },

    #[error("cannot close image {name}")]
    Close {
        name: String,
        #[source]
        source: images::Error,
    },

    #[error("image {name} was created, but write error occurred for thick provisioning")]
    ThickWrite {
        name: String,
        #[source]
        source: WriteError,
    },
}

impl Error {
    /// The error code equivalent of this error
    pub fn errno(&self) -> Errno {
        match self {
            Error::IO(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            Error::Create { source, .. } | Error::Open { source, .. } | Error::Close { source, .. } => source.errno(),
            Error::Settings(source) | Error::ThickWrite { source, .. } => source.errno(),
            _ => Errno::EINVAL,
        }
    }
}

/// Merged error for parsing failures
/// Returns a list of diagnostics for the user
#[derive(Debug, Diagnostic, Error)]
#[error("failed to parse KDL")]
#[diagnostic(severity(error))]
pub struct ParseError {
    #[source_code]
    pub src: NamedSource<Arc<String>>,
    #[related]
    pub diagnostics: Vec<Error>,
}

/// Error for invalid types
#[derive(Debug, Diagnostic, Error)]
#[error("invalid type, expected {expected_type}")]
#[diagnostic(severity(error))]
pub struct InvalidType {
    #[label]
    pub at: SourceSpan,

    /// The expected type
    pub expected_type: KdlType,
}

/// Error for missing mandatory entries
#[derive(Debug, Diagnostic, Error)]
#[error("missing entry: {id}")]
#[diagnostic(severity(error))]
pub struct MissingEntry {
    #[label]
    pub at: SourceSpan,

    pub id: String,

    #[help]
    pub advice: Option<String>,
}

/// Error for unsupported node types
#[derive(Debug, Diagnostic, Error)]
#[error("unsupported node: {name}")]
#[diagnostic(severity(error))]
pub struct UnsupportedNode {
    #[label]
    pub at: SourceSpan,

    pub name: String,
}

/// Error for unsupported values
#[derive(Debug, Diagnostic, Error)]
#[error("unsupported value")]
#[diagnostic(severity(error))]
pub struct UnsupportedValue {
    #[label]
    pub at: SourceSpan,

    #[help]
    pub advice: Option<String>,
}

/// Error for invalid arguments
#[derive(Debug, Diagnostic, Error)]
#[error("invalid arguments")]
#[diagnostic(severity(error))]
pub struct InvalidArguments {
    #[label]
    pub at: SourceSpan,

    #[help]
    pub advice: Option<String>,
}
