// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use itertools::Itertools;
use kdl::{KdlEntry, KdlNode};

use crate::{Error, FromKdlType, InvalidArguments, InvalidType, KdlType, MissingEntry, StorageUnit, UnsupportedValue};

// Positional (unnamed) entries of a node
pub(crate) fn get_arguments(node: &KdlNode) -> Vec<&KdlEntry> {
    node.entries().iter().filter(|e| e.name().is_none()).collect_vec()
}

// The single positional entry of a setting node
pub(crate) fn get_argument(node: &KdlNode) -> Result<&KdlEntry, Error> {
    let name = node.name().value();
    match get_arguments(node).as_slice() {
        [] => Err(MissingEntry {
            at: node.span(),
            id: name.to_owned(),
            advice: Some(format!("{name} <value> - provide a value")),
        }
        .into()),
        [entry] => Ok(*entry),
        _ => Err(InvalidArguments {
            at: node.span(),
            advice: Some(format!("{name} <value> - only one value is supported")),
        }
        .into()),
    }
}

// Get an integer from an entry
pub(crate) fn get_integer(entry: &KdlEntry) -> Result<i128, Error> {
    entry.value().as_integer().ok_or_else(|| {
        InvalidType {
            at: entry.span(),
            expected_type: KdlType::Integer,
        }
        .into()
    })
}

// Get an integer that must fit in `T`
pub(crate) fn get_bounded<T>(entry: &KdlEntry, advice: &str) -> Result<T, Error>
where
    T: TryFrom<i128>,
{
    T::try_from(get_integer(entry)?).map_err(|_| {
        UnsupportedValue {
            at: entry.span(),
            advice: Some(advice.to_owned()),
        }
        .into()
    })
}

// Get a string from an entry
pub(crate) fn get_str(entry: &KdlEntry) -> Result<&str, Error> {
    entry.value().as_string().ok_or_else(|| {
        InvalidType {
            at: entry.span(),
            expected_type: KdlType::String,
        }
        .into()
    })
}

// Get a byte size from an entry, scaled by its unit annotation
pub(crate) fn get_storage_size(entry: &KdlEntry) -> Result<u64, Error> {
    let unit = StorageUnit::from_kdl_type(entry)?;
    let value = get_bounded::<u64>(entry, "sizes must be non-negative")?;
    value.checked_mul(unit.bytes()).ok_or_else(|| {
        UnsupportedValue {
            at: entry.span(),
            advice: Some(format!("{value} x {} bytes does not fit in 64 bits", unit.bytes())),
        }
        .into()
    })
}
