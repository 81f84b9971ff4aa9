//! Versioned locations of the runtime library's VM singleton.
//!
//! Where the runtime keeps its VM pointer is a private implementation detail that
//! changes between platform releases. The table maps a platform version to the data
//! symbol to start from, whether that symbol holds a pointer to follow first, the
//! field offset from there, and the byte patterns the field may legitimately hold
//! before it is patched.
//!
//! A built-in table ships with the crate (`data/offsets.json`); a replacement can be
//! loaded from a file for platforms the built-in table does not cover.
//!
//! ```json
//! {
//!   "entries": [
//!     {
//!       "platform": { "min_api": 29, "max_api": 33 },
//!       "symbol": "gCurRuntime",
//!       "deref": true,
//!       "offset": 16,
//!       "width": 8,
//!       "expect_before": ["null", { "bytes": "0000000000000000" }]
//!     }
//!   ]
//! }
//! ```

use std::{fs, mem, path::Path};

use serde::{Deserialize, Serialize};

use crate::{platform::PlatformVersion, Error, Result};

/// Environment variable naming an offset table file that replaces the built-in one.
pub const OFFSETS_ENV: &str = "DROIDSTRAP_OFFSETS";

const BUILTIN: &str = include_str!("../../data/offsets.json");

/// Which platforms a row applies to.
///
/// A `release` constraint matches that exact release string. Otherwise the API level
/// must lie within the optional inclusive bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMatch {
    /// Lowest matching API level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_api: Option<u32>,
    /// Highest matching API level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_api: Option<u32>,
    /// Exact release string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

impl PlatformMatch {
    /// Returns true if `version` falls under this constraint.
    pub fn matches(&self, version: &PlatformVersion) -> bool {
        if let Some(release) = &self.release {
            return *release == version.release;
        }

        self.min_api.map_or(true, |min| version.api_level >= min)
            && self.max_api.map_or(true, |max| version.api_level <= max)
    }

    fn is_unconstrained(&self) -> bool {
        self.min_api.is_none() && self.max_api.is_none() && self.release.is_none()
    }
}

/// A permitted pre-write value of the patched field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    /// Every byte is zero.
    Null,
    /// Exactly these bytes, written as a hex string.
    Bytes(HexBytes),
}

impl Pattern {
    /// Returns true if `bytes` matches this pattern.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            Pattern::Null => bytes.iter().all(|byte| *byte == 0),
            Pattern::Bytes(expected) => expected.0 == bytes,
        }
    }
}

/// Bytes serialised as a lowercase hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexBytes(pub Vec<u8>);

impl TryFrom<String> for HexBytes {
    type Error = String;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        let text = text.trim();
        if !text.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(format!("invalid hex digits in '{text}'"));
        }
        if text.len() % 2 != 0 {
            return Err(format!("odd number of hex digits in '{text}'"));
        }

        text.as_bytes()
            .chunks_exact(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                    .ok_or_else(|| format!("invalid hex digits in '{text}'"))
            })
            .collect::<std::result::Result<Vec<u8>, String>>()
            .map(HexBytes)
    }
}

impl From<HexBytes> for String {
    fn from(bytes: HexBytes) -> Self {
        bytes.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// One row of the offset table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEntry {
    /// Platforms this row applies to
    pub platform: PlatformMatch,
    /// Data symbol in the runtime library to start from
    pub symbol: String,
    /// Whether the symbol holds a pointer to the singleton rather than the singleton itself
    #[serde(default)]
    pub deref: bool,
    /// Byte offset of the VM field from the (dereferenced) symbol
    #[serde(default)]
    pub offset: usize,
    /// Field width in bytes; defaults to the pointer width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    /// Values the field may hold before the write; at least one must match
    pub expect_before: Vec<Pattern>,
    /// Free-form provenance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl OffsetEntry {
    /// Width of the patched field in bytes.
    pub fn field_width(&self) -> usize {
        self.width.unwrap_or(mem::size_of::<usize>())
    }

    fn validate(&self, index: usize) -> Result<()> {
        let width = self.field_width();
        if width != 4 && width != 8 {
            return Err(Error::OffsetTable(format!(
                "entry {index}: width must be 4 or 8, got {width}"
            )));
        }

        if self.symbol.is_empty() {
            return Err(Error::OffsetTable(format!("entry {index}: empty symbol")));
        }

        if self.platform.is_unconstrained() {
            return Err(Error::OffsetTable(format!(
                "entry {index}: platform constraint is empty"
            )));
        }

        if self.expect_before.is_empty() {
            return Err(Error::OffsetTable(format!(
                "entry {index}: no expected pre-write pattern"
            )));
        }

        for pattern in &self.expect_before {
            if let Pattern::Bytes(bytes) = pattern {
                if bytes.0.len() != width {
                    return Err(Error::OffsetTable(format!(
                        "entry {index}: pattern has {} bytes, field has {width}",
                        bytes.0.len()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Platform-versioned patch targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetTable {
    /// Rows in priority order
    #[serde(default)]
    pub entries: Vec<OffsetEntry>,
}

impl OffsetTable {
    /// The table shipped with the crate.
    ///
    /// # Errors
    /// Returns [`Error::OffsetTable`] if the bundled data is invalid.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN)
    }

    /// Loads a table from a JSON file.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file cannot be read, or [`Error::OffsetTable`] if it
    /// is not a valid table.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Parses and validates a table.
    ///
    /// # Errors
    /// Returns [`Error::OffsetTable`] if the text is not a valid table.
    pub fn from_json(text: &str) -> Result<Self> {
        let table: OffsetTable =
            serde_json::from_str(text).map_err(|error| Error::OffsetTable(error.to_string()))?;

        for (index, entry) in table.entries.iter().enumerate() {
            entry.validate(index)?;
        }

        Ok(table)
    }

    /// Serialises the table as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns [`Error::OffsetTable`] if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|error| Error::OffsetTable(error.to_string()))
    }

    /// The row for `version`.
    ///
    /// A row keyed by the exact release string wins over API level ranges; otherwise the
    /// first matching row in table order is used.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedPlatformVersion`] if no row matches.
    pub fn lookup(&self, version: &PlatformVersion) -> Result<&OffsetEntry> {
        self.entries
            .iter()
            .find(|entry| {
                entry.platform.release.is_some() && entry.platform.matches(version)
            })
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| entry.platform.matches(version))
            })
            .ok_or_else(|| Error::UnsupportedPlatformVersion(version.to_string()))
    }
}
