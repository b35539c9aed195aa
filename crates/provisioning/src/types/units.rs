// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::str::FromStr;

use crate::UnsupportedValue;

use super::FromKdlType;

/// Storage unit
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum StorageUnit {
    /// Bytes
    #[default]
    Bytes = 1,

    // as 1000s,
    /// Kilobytes
    Kilobytes = 1000,
    /// Megabytes
    Megabytes = 1_000_000,
    /// Gigabytes
    Gigabytes = 1_000_000_000,
    /// Terabytes
    Terabytes = 1_000_000_000_000,

    // as 1024s,
    /// Kibibytes
    Kibibytes = 1024,
    /// Mebibytes
    Mebibytes = 1024 * 1024,
    /// Gibibytes
    Gibibytes = 1024 * 1024 * 1024,
    /// Tebibytes
    Tebibytes = 1024 * 1024 * 1024 * 1024,
}

impl StorageUnit {
    /// Number of bytes in one unit
    pub fn bytes(&self) -> u64 {
        *self as u64
    }
}

impl FromStr for StorageUnit {
    type Err = crate::Error;

    /// Attempt to convert a string to a storage unit
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "b" => Ok(Self::Bytes),
            "kb" => Ok(Self::Kilobytes),
            "mb" => Ok(Self::Megabytes),
            "gb" => Ok(Self::Gigabytes),
            "tb" => Ok(Self::Terabytes),
            "kib" => Ok(Self::Kibibytes),
            "mib" => Ok(Self::Mebibytes),
            "gib" => Ok(Self::Gibibytes),
            "tib" => Ok(Self::Tebibytes),
            _ => Err(crate::Error::UnknownVariant),
        }
    }
}

impl FromKdlType<'_> for StorageUnit {
    fn from_kdl_type(id: &kdl::KdlEntry) -> Result<Self, crate::Error> {
        let ty_id = if let Some(ty) = id.ty() {
            ty.value().to_lowercase()
        } else {
            "b".into()
        };

        let v = ty_id.parse().map_err(|_| UnsupportedValue {
            at: id.span(),
            advice: Some("'b', 'kb', 'mb', 'gb', 'tb', 'kib', 'mib', 'gib', 'tib' are supported".into()),
        })?;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_units() {
        assert_eq!("mib".parse::<StorageUnit>().unwrap().bytes(), 1024 * 1024);
        assert_eq!("kb".parse::<StorageUnit>().unwrap().bytes(), 1000);
        assert_eq!(StorageUnit::default(), StorageUnit::Bytes);
        assert!("parsec".parse::<StorageUnit>().is_err());
    }
}
