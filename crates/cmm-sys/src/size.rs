// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Human-readable byte sizes for configuration files.
//!
//! A [`ByteSize`] is what `HostConfig` stores for partition sizes and the
//! per-call ceiling, so a TOML file can say `size = "64M"` instead of a raw
//! byte count.

use crate::SysError;
use std::fmt;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// A byte count with binary-suffix parsing.
///
/// # Parsing
/// - `"512K"` / `"512KB"` → 512 × 1024 bytes
/// - `"64M"` / `"64MB"` → 64 × 1024² bytes
/// - `"4G"` / `"4GB"` → 4 × 1024³ bytes
/// - `"4096"` / `"4096B"` → raw byte count
///
/// # Examples
/// ```
/// use cmm_sys::ByteSize;
///
/// assert_eq!(ByteSize::parse("64M").unwrap().as_bytes(), 64 * 1024 * 1024);
/// assert_eq!(ByteSize::from_kb(4).to_string(), "4 KB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize {
    bytes: u64,
}

impl ByteSize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn from_kb(kb: u64) -> Self {
        Self { bytes: kb * KIB }
    }

    pub fn from_mb(mb: u64) -> Self {
        Self { bytes: mb * MIB }
    }

    pub fn from_gb(gb: u64) -> Self {
        Self { bytes: gb * GIB }
    }

    pub fn as_bytes(&self) -> u64 {
        self.bytes
    }

    /// Size in kilobytes, truncated.
    pub fn as_kb(&self) -> u64 {
        self.bytes / KIB
    }

    /// Parses a size string. Case-insensitive; surrounding whitespace is
    /// ignored. Zero is rejected.
    pub fn parse(s: &str) -> Result<Self, SysError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SysError::Config("empty size string".into()));
        }

        let upper = s.to_uppercase();
        let (num_str, multiplier) = if upper.ends_with("GB") {
            (&s[..s.len() - 2], GIB)
        } else if upper.ends_with('G') {
            (&s[..s.len() - 1], GIB)
        } else if upper.ends_with("MB") {
            (&s[..s.len() - 2], MIB)
        } else if upper.ends_with('M') {
            (&s[..s.len() - 1], MIB)
        } else if upper.ends_with("KB") {
            (&s[..s.len() - 2], KIB)
        } else if upper.ends_with('K') {
            (&s[..s.len() - 1], KIB)
        } else if upper.ends_with('B') {
            (&s[..s.len() - 1], 1)
        } else {
            (s, 1)
        };

        let value: u64 = num_str.trim().parse().map_err(|_| {
            SysError::Config(format!(
                "invalid size '{s}': expected a number with an optional K, M or G suffix"
            ))
        })?;

        let bytes = value
            .checked_mul(multiplier)
            .ok_or_else(|| SysError::Config(format!("size overflow: '{s}'")))?;

        if bytes == 0 {
            return Err(SysError::Config(format!("size must be non-zero: '{s}'")));
        }

        Ok(Self { bytes })
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes >= GIB && self.bytes % GIB == 0 {
            write!(f, "{} GB", self.bytes / GIB)
        } else if self.bytes >= MIB && self.bytes % MIB == 0 {
            write!(f, "{} MB", self.bytes / MIB)
        } else if self.bytes >= KIB && self.bytes % KIB == 0 {
            write!(f, "{} KB", self.bytes / KIB)
        } else {
            write!(f, "{} B", self.bytes)
        }
    }
}
