// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Provisioning configuration
//!
//! Configuration is a KDL document with two optional sections:
//!
//! ```kdl
//! thick-provisioning {
//!     concurrency 10
//!     chunk-size (mib)1
//!     block-size (b)512
//!     poll-interval-us 10
//!     drain-timeout-ms 1000
//! }
//! image-defaults {
//!     format 2
//!     order 22
//!     features "layering" "exclusive-lock"
//!     stripe-unit (kib)64
//!     stripe-count 16
//!     data-pool "fast"
//! }
//! ```
//!
//! Anything left out keeps its default.

use std::{fs, path::Path, sync::Arc, time::Duration};

use images::{Feature, Features, ImageOptions};
use itertools::{Either, Itertools};
use kdl::{KdlDocument, KdlNode};
use log::debug;
use miette::NamedSource;

use crate::{
    get_argument, get_arguments, get_bounded, get_storage_size, get_str, thick::ThickSettings, Error, ParseError,
    UnsupportedNode, UnsupportedValue,
};

/// Parsed provisioning configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Thick provisioning tunables
    pub thick: ThickSettings,

    /// Options applied to images created without explicit options
    pub image_defaults: ImageOptions,
}

/// Parses one top-level section into the configuration, returning any errors
type SectionParser = fn(&mut Config, &KdlNode) -> Vec<Error>;

/// Map of section names to parsers
static SECTIONS: phf::Map<&'static str, SectionParser> = phf::phf_map! {
    "thick-provisioning" => parse_thick_section,
    "image-defaults" => parse_image_section,
};

impl Config {
    /// Load configuration from a file path
    pub fn new_for_path<P>(file: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file = file.as_ref();
        let name = file.to_string_lossy();
        let txt = fs::read_to_string(file)?;
        Self::new(name.to_string(), txt)
    }

    /// Load configuration from a string
    pub fn new(name: String, contents: String) -> Result<Self, Error> {
        let source = Arc::new(contents);
        let ns = NamedSource::new(name, source.clone()).with_language("KDL");
        let d = KdlDocument::parse_v2(&source)?;

        let mut config = Self::default();
        let mut diagnostics = vec![];

        for node in d.nodes() {
            let name = node.name().value();
            match SECTIONS.get(name) {
                Some(parse) => diagnostics.extend(parse(&mut config, node)),
                None => diagnostics.push(
                    UnsupportedNode {
                        at: node.span(),
                        name: name.to_owned(),
                    }
                    .into(),
                ),
            }
        }

        if !diagnostics.is_empty() {
            return Err(ParseError { src: ns, diagnostics })?;
        }

        debug!("Loaded configuration from {}: {config:?}", ns.name());
        Ok(config)
    }
}

/// A single thick provisioning setting
enum ThickSetting {
    Concurrency(i64),
    ChunkSize(u64),
    BlockSize(u64),
    PollInterval(Duration),
    DrainTimeout(Duration),
}

fn parse_thick_setting(node: &KdlNode) -> Result<ThickSetting, Error> {
    let name = node.name().value();
    let entry = match name {
        "concurrency" | "chunk-size" | "block-size" | "poll-interval-us" | "drain-timeout-ms" => get_argument(node)?,
        _ => {
            return Err(UnsupportedNode {
                at: node.span(),
                name: name.to_owned(),
            }
            .into())
        }
    };

    let setting = match name {
        "concurrency" => ThickSetting::Concurrency(get_bounded(entry, "concurrency must fit in 64 bits")?),
        "chunk-size" => ThickSetting::ChunkSize(get_storage_size(entry)?),
        "block-size" => ThickSetting::BlockSize(get_storage_size(entry)?),
        "poll-interval-us" => ThickSetting::PollInterval(Duration::from_micros(get_bounded(
            entry,
            "the poll interval must be a non-negative number of microseconds",
        )?)),
        _ => ThickSetting::DrainTimeout(Duration::from_millis(get_bounded(
            entry,
            "the drain timeout must be a non-negative number of milliseconds",
        )?)),
    };
    Ok(setting)
}

fn parse_thick_section(config: &mut Config, node: &KdlNode) -> Vec<Error> {
    let (settings, errors): (Vec<_>, Vec<_>) = node.iter_children().partition_map(|child| {
        match parse_thick_setting(child) {
            Ok(setting) => Either::Left(setting),
            Err(e) => Either::Right(e),
        }
    });

    let thick = &mut config.thick;
    for setting in settings {
        match setting {
            ThickSetting::Concurrency(n) => thick.concurrency = n,
            ThickSetting::ChunkSize(n) => thick.chunk_size = n,
            ThickSetting::BlockSize(n) => thick.block_size = n,
            ThickSetting::PollInterval(d) => thick.poll_interval = d,
            ThickSetting::DrainTimeout(d) => thick.drain_timeout = d,
        }
    }

    errors
}

/// A single image option
enum ImageSetting {
    Format(u8),
    Order(u8),
    Features(Features),
    StripeUnit(u64),
    StripeCount(u64),
    DataPool(String),
}

fn parse_features(node: &KdlNode) -> Result<Features, Error> {
    get_arguments(node)
        .into_iter()
        .map(|entry| -> Result<Feature, Error> {
            get_str(entry)?.parse::<Feature>().map_err(|_| {
                UnsupportedValue {
                    at: entry.span(),
                    advice: Some(format!(
                        "supported features: {}",
                        Feature::all().map(|f| f.name()).join(", ")
                    )),
                }
                .into()
            })
        })
        .collect()
}

fn parse_image_setting(node: &KdlNode) -> Result<ImageSetting, Error> {
    let setting = match node.name().value() {
        "format" => ImageSetting::Format(get_bounded(get_argument(node)?, "format must be 1 or 2")?),
        "order" => ImageSetting::Order(get_bounded(get_argument(node)?, "order must be between 12 and 25")?),
        "features" => ImageSetting::Features(parse_features(node)?),
        "stripe-unit" => ImageSetting::StripeUnit(get_storage_size(get_argument(node)?)?),
        "stripe-count" => ImageSetting::StripeCount(get_bounded(
            get_argument(node)?,
            "stripe count must be a positive integer",
        )?),
        "data-pool" => ImageSetting::DataPool(get_str(get_argument(node)?)?.to_owned()),
        name => {
            return Err(UnsupportedNode {
                at: node.span(),
                name: name.to_owned(),
            }
            .into())
        }
    };
    Ok(setting)
}

fn parse_image_section(config: &mut Config, node: &KdlNode) -> Vec<Error> {
    let (settings, errors): (Vec<_>, Vec<_>) = node.iter_children().partition_map(|child| {
        match parse_image_setting(child) {
            Ok(setting) => Either::Left(setting),
            Err(e) => Either::Right(e),
        }
    });

    let options = &mut config.image_defaults;
    for setting in settings {
        match setting {
            ImageSetting::Format(n) => options.format = n,
            ImageSetting::Order(n) => options.order = n,
            ImageSetting::Features(features) => options.features = features,
            ImageSetting::StripeUnit(n) => options.stripe_unit = Some(n),
            ImageSetting::StripeCount(n) => options.stripe_count = Some(n),
            ImageSetting::DataPool(pool) => options.data_pool = Some(pool),
        }
    }

    errors
}
