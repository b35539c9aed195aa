// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Image creation options
//!
//! Options are carried opaquely by callers and validated by the store at creation
//! time via [`ImageOptions::validate`].

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Smallest supported object order (4KiB objects)
pub const MIN_ORDER: u8 = 12;
/// Largest supported object order (32MiB objects)
pub const MAX_ORDER: u8 = 25;
/// Default object order (4MiB objects)
pub const DEFAULT_ORDER: u8 = 22;

/// An image feature which may be enabled at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Feature {
    Layering = 1 << 0,
    Striping = 1 << 1,
    ExclusiveLock = 1 << 2,
    ObjectMap = 1 << 3,
    FastDiff = 1 << 4,
    DeepFlatten = 1 << 5,
    Journaling = 1 << 6,
    DataPool = 1 << 7,
}

/// Map of feature names to features
static FEATURES: phf::Map<&'static str, Feature> = phf::phf_map! {
    "layering" => Feature::Layering,
    "striping" => Feature::Striping,
    "exclusive-lock" => Feature::ExclusiveLock,
    "object-map" => Feature::ObjectMap,
    "fast-diff" => Feature::FastDiff,
    "deep-flatten" => Feature::DeepFlatten,
    "journaling" => Feature::Journaling,
    "data-pool" => Feature::DataPool,
};

impl Feature {
    /// Canonical name of the feature
    pub fn name(&self) -> &'static str {
        match self {
            Feature::Layering => "layering",
            Feature::Striping => "striping",
            Feature::ExclusiveLock => "exclusive-lock",
            Feature::ObjectMap => "object-map",
            Feature::FastDiff => "fast-diff",
            Feature::DeepFlatten => "deep-flatten",
            Feature::Journaling => "journaling",
            Feature::DataPool => "data-pool",
        }
    }

    /// All known features, in bit order
    pub fn all() -> impl Iterator<Item = Feature> {
        [
            Feature::Layering,
            Feature::Striping,
            Feature::ExclusiveLock,
            Feature::ObjectMap,
            Feature::FastDiff,
            Feature::DeepFlatten,
            Feature::Journaling,
            Feature::DataPool,
        ]
        .into_iter()
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FEATURES
            .get(value)
            .copied()
            .ok_or(Error::InvalidOptions("unknown feature"))
    }
}

/// A set of image features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(u64);

impl Features {
    /// No features at all
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw feature bits
    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature as u64 != 0
    }

    pub fn insert(&mut self, feature: Feature) {
        self.0 |= feature as u64;
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.insert(feature);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Feature> for Features {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        iter.into_iter().fold(Self::empty(), Features::with)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = Feature::all()
            .filter(|feature| self.contains(*feature))
            .map(|feature| feature.name())
            .collect::<Vec<_>>();
        f.write_str(&names.join(", "))
    }
}

/// Options applied to a newly created image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOptions {
    /// On-disk format version, 1 or 2
    pub format: u8,
    /// Object size as a power of two
    pub order: u8,
    /// Enabled features
    pub features: Features,
    /// Stripe unit in bytes
    pub stripe_unit: Option<u64>,
    /// Number of objects a stripe spans
    pub stripe_count: Option<u64>,
    /// Separate pool for data objects
    pub data_pool: Option<String>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            format: 2,
            order: DEFAULT_ORDER,
            features: [
                Feature::Layering,
                Feature::ExclusiveLock,
                Feature::ObjectMap,
                Feature::FastDiff,
                Feature::DeepFlatten,
            ]
            .into_iter()
            .collect(),
            stripe_unit: None,
            stripe_count: None,
            data_pool: None,
        }
    }
}

impl ImageOptions {
    /// Size of a backing object in bytes, or `None` if the order is too large to represent
    pub fn object_size(&self) -> Option<u64> {
        1u64.checked_shl(self.order.into())
    }

    /// Whether non-default striping has been requested
    fn has_custom_striping(&self) -> bool {
        match (self.stripe_unit, self.stripe_count) {
            (Some(unit), Some(count)) => Some(unit) != self.object_size() || count != 1,
            _ => false,
        }
    }

    /// Checks the option set for consistency, returning the effective options.
    ///
    /// Striping and data pool settings switch on their implied features.
    pub fn validate(&self) -> Result<ImageOptions, Error> {
        let mut options = self.clone();

        if !(MIN_ORDER..=MAX_ORDER).contains(&options.order) {
            return Err(Error::InvalidOptions("order must be between 12 and 25"));
        }

        match (options.stripe_unit, options.stripe_count) {
            (None, None) => {}
            (Some(unit), Some(count)) => {
                if unit == 0 || count == 0 {
                    return Err(Error::InvalidOptions("stripe unit and count must be non-zero"));
                }
                if options.object_size().map_or(true, |size| size % unit != 0) {
                    return Err(Error::InvalidOptions("stripe unit must divide the object size"));
                }
            }
            _ => return Err(Error::InvalidOptions("stripe unit and stripe count must be set together")),
        }

        if options.has_custom_striping() {
            options.features.insert(Feature::Striping);
        }
        if matches!(options.data_pool.as_deref(), Some("")) {
            return Err(Error::InvalidOptions("data pool name is empty"));
        }
        if options.data_pool.is_some() {
            options.features.insert(Feature::DataPool);
        }

        match options.format {
            1 => {
                if !options.features.is_empty() {
                    return Err(Error::InvalidOptions("format 1 images do not support features"));
                }
            }
            2 => {}
            _ => return Err(Error::InvalidOptions("format must be 1 or 2")),
        }

        let features = options.features;
        if features.contains(Feature::ObjectMap) && !features.contains(Feature::ExclusiveLock) {
            return Err(Error::InvalidOptions("object-map requires exclusive-lock"));
        }
        if features.contains(Feature::FastDiff) && !features.contains(Feature::ObjectMap) {
            return Err(Error::InvalidOptions("fast-diff requires object-map"));
        }
        if features.contains(Feature::Journaling) && !features.contains(Feature::ExclusiveLock) {
            return Err(Error::InvalidOptions("journaling requires exclusive-lock"));
        }

        Ok(options)
    }
}
