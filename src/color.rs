//! Color lookup for RAPT Pill beacons.
//!
//! A beacon does not carry its color in the measurement payload. The color is
//! derived from a 128-bit service UUID broadcast in the same advertisement,
//! looked up in a table that is built once at startup and shared read-only.

use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use uuid::{Uuid, uuid};

/// Built-in sub-identifier to color mapping.
pub const BUILTIN_COLORS: [(Uuid, &str); 9] = [
    (uuid!("a495bb10-c5b1-4b44-b512-1370f02d74de"), "Red"),
    (uuid!("a495bb20-c5b1-4b44-b512-1370f02d74de"), "Green"),
    (uuid!("a495bb30-c5b1-4b44-b512-1370f02d74de"), "Black"),
    (uuid!("a495bb40-c5b1-4b44-b512-1370f02d74de"), "Purple"),
    (uuid!("a495bb50-c5b1-4b44-b512-1370f02d74de"), "Orange"),
    (uuid!("a495bb60-c5b1-4b44-b512-1370f02d74de"), "Blue"),
    (uuid!("a495bb70-c5b1-4b44-b512-1370f02d74de"), "Yellow"),
    (uuid!("a495bb80-c5b1-4b44-b512-1370f02d74de"), "Pink"),
    (uuid!("020001c0-1cf3-4090-d644-781eff3a2cfe"), "RAPT Yellow"),
];

/// A user-supplied color entry, `UUID=Name` on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorEntry {
    pub uuid: Uuid,
    pub name: String,
}

/// Errors returned when parsing a `UUID=Name` color entry.
#[derive(Error, Debug, PartialEq)]
pub enum ParseColorError {
    #[error("invalid color entry: expected format UUID=NAME")]
    MissingSeparator,
    #[error("invalid color entry: '{0}' is not a UUID")]
    InvalidUuid(String),
    #[error("invalid color entry: empty name")]
    EmptyName,
}

impl FromStr for ColorEntry {
    type Err = ParseColorError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let (uuid, name) = src
            .split_once('=')
            .ok_or(ParseColorError::MissingSeparator)?;
        let uuid = uuid.trim();
        let uuid =
            Uuid::parse_str(uuid).map_err(|_| ParseColorError::InvalidUuid(uuid.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseColorError::EmptyName);
        }
        Ok(ColorEntry {
            uuid,
            name: name.to_string(),
        })
    }
}

/// Value parser for clap.
pub fn parse_color_entry(src: &str) -> Result<ColorEntry, String> {
    src.parse().map_err(|e: ParseColorError| e.to_string())
}

/// Immutable sub-identifier to color name table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorTable {
    colors: BTreeMap<Uuid, String>,
}

impl ColorTable {
    /// Table holding only the built-in colors.
    pub fn builtin() -> Self {
        Self::with_entries(&[])
    }

    /// Built-in colors, with `entries` added on top. Later entries win.
    pub fn with_entries(entries: &[ColorEntry]) -> Self {
        let mut colors: BTreeMap<Uuid, String> = BUILTIN_COLORS
            .iter()
            .map(|(uuid, name)| (*uuid, (*name).to_string()))
            .collect();
        for entry in entries {
            colors.insert(entry.uuid, entry.name.clone());
        }
        ColorTable { colors }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&str> {
        self.colors.get(uuid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}
