// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Host backend configuration loaded from TOML files or built in code.
//!
//! # TOML Format
//! ```toml
//! alignment = 4096
//! max_op_size = "4G"
//! default_partition = "anonymous"
//!
//! [[partitions]]
//! name = "anonymous"
//! phys = 0x4000_0000
//! size = "64M"
//! ```

use crate::{ByteSize, PartitionInfo, SysError, SysResult, MAX_OP_SIZE};
use std::path::Path;

/// Granularity partitions must be aligned to.
const PAGE_GRANULE: u64 = 4096;

/// Configuration for [`HostBackend`](crate::HostBackend).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HostConfig {
    /// Alignment of allocated blocks in bytes (power of two).
    #[serde(default = "default_alignment")]
    pub alignment: u64,
    /// Per-call size ceiling (human-readable, e.g. `"4G"`). Defaults to
    /// [`MAX_OP_SIZE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_op_size: Option<String>,
    /// Partition that `allocate` carves blocks from.
    #[serde(default = "default_partition")]
    pub default_partition: String,
    /// Physical memory layout.
    pub partitions: Vec<PartitionConfig>,
}

/// One emulated partition.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Base physical address.
    pub phys: u64,
    /// Size (human-readable, e.g. `"64M"`).
    pub size: String,
}

fn default_alignment() -> u64 {
    0x1000
}

fn default_partition() -> String {
    "anonymous".to_string()
}

impl HostConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> SysResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SysError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> SysResult<Self> {
        toml::from_str(toml_str).map_err(|e| SysError::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> SysResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SysError::Config(format!("TOML serialise error: {e}")))
    }

    /// A single `anonymous` partition of `size` bytes at `phys`.
    pub fn single(phys: u64, size: ByteSize) -> Self {
        Self {
            alignment: default_alignment(),
            max_op_size: None,
            default_partition: default_partition(),
            partitions: vec![PartitionConfig {
                name: default_partition(),
                phys,
                size: size.to_string().replace(' ', ""),
            }],
        }
    }

    /// Resolves the per-call ceiling in bytes.
    pub fn parse_max_op_size(&self) -> SysResult<u64> {
        match &self.max_op_size {
            Some(s) => Ok(ByteSize::parse(s)?.as_bytes().min(MAX_OP_SIZE)),
            None => Ok(MAX_OP_SIZE),
        }
    }

    /// Checks the layout and returns the resolved partitions.
    pub fn validate(&self) -> SysResult<Vec<PartitionInfo>> {
        if !self.alignment.is_power_of_two() {
            return Err(SysError::Config(format!(
                "alignment {:#x} is not a power of two",
                self.alignment
            )));
        }
        if self.partitions.is_empty() {
            return Err(SysError::Config("no partitions configured".into()));
        }
        self.parse_max_op_size()?;

        let mut resolved: Vec<PartitionInfo> = Vec::with_capacity(self.partitions.len());
        for p in &self.partitions {
            let size = ByteSize::parse(&p.size)?.as_bytes();
            if p.phys == 0 || p.phys % PAGE_GRANULE != 0 || size % PAGE_GRANULE != 0 {
                return Err(SysError::Config(format!(
                    "partition '{}' must be non-zero and {PAGE_GRANULE:#x}-aligned",
                    p.name
                )));
            }
            let size_kb = u32::try_from(size / 1024).map_err(|_| {
                SysError::Config(format!("partition '{}' is too large", p.name))
            })?;
            let info = PartitionInfo {
                name: p.name.clone(),
                phys: p.phys,
                size_kb,
            };
            if let Some(other) = resolved
                .iter()
                .find(|o| o.name == info.name || (info.phys < o.end() && o.phys < info.end()))
            {
                return Err(SysError::Config(format!(
                    "partition '{}' clashes with '{}'",
                    info.name, other.name
                )));
            }
            resolved.push(info);
        }

        if !resolved.iter().any(|p| p.name == self.default_partition) {
            return Err(SysError::Config(format!(
                "default partition '{}' is not configured",
                self.default_partition
            )));
        }
        Ok(resolved)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::single(0x4000_0000, ByteSize::from_mb(64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = HostConfig::default();
        let parts = c.validate().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "anonymous");
        assert_eq!(parts[0].size_bytes(), 64 * 1024 * 1024);
        assert_eq!(c.parse_max_op_size().unwrap(), MAX_OP_SIZE);
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
alignment = 4096
max_op_size = "8K"
default_partition = "anonymous"

[[partitions]]
name = "anonymous"
phys = 0x40000000
size = "16M"

[[partitions]]
name = "isp"
phys = 0x50000000
size = "4M"
"#;
        let c = HostConfig::from_toml(toml).unwrap();
        assert_eq!(c.parse_max_op_size().unwrap(), 8192);
        let parts = c.validate().unwrap();
        assert_eq!(parts[1].name, "isp");
        assert_eq!(parts[1].size_kb, 4096);
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let c = HostConfig::default();
        let toml = c.to_toml().unwrap();
        let back = HostConfig::from_toml(&toml).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_defaults_applied() {
        let toml = r#"
[[partitions]]
name = "anonymous"
phys = 1073741824
size = "1M"
"#;
        let c = HostConfig::from_toml(toml).unwrap();
        assert_eq!(c.alignment, 0x1000);
        assert_eq!(c.default_partition, "anonymous");
        assert!(c.max_op_size.is_none());
    }

    #[test]
    fn test_rejects_overlap() {
        let mut c = HostConfig::default();
        c.partitions.push(PartitionConfig {
            name: "other".into(),
            phys: 0x4000_1000,
            size: "4K".into(),
        });
        assert!(matches!(c.validate(), Err(SysError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_alignment_and_missing_default() {
        let mut c = HostConfig::default();
        c.alignment = 3000;
        assert!(c.validate().is_err());

        let mut c = HostConfig::default();
        c.default_partition = "nope".into();
        assert!(c.validate().is_err());

        let mut c = HostConfig::default();
        c.partitions[0].phys = 0x4000_0100;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = HostConfig::from_file(Path::new("/nonexistent/cmm.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read config"));
    }
}
