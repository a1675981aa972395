// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Plain data exchanged across the backend boundary.

use std::fmt;

/// A physical (bus) address.
pub type PhysAddr = u64;

/// Cache policy of a virtual mapping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Accesses go straight to memory.
    #[default]
    NonCached,
    /// Accesses go through the CPU cache; needs explicit flush/invalidate.
    Cached,
}

impl CacheMode {
    /// Short label used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::NonCached => "nonc",
            CacheMode::Cached => "cached",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token the backend hands out with an allocation and expects back
/// on free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(u64);

impl BlockHandle {
    /// Wraps a raw backend token.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw backend token.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// A freshly allocated physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub phys: PhysAddr,
    pub handle: BlockHandle,
}

/// Backend bookkeeping for an allocated block, looked up by physical address.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BlockInfo {
    /// Base physical address of the block.
    pub phys: PhysAddr,
    /// Size of the block in bytes.
    pub size: u64,
    /// Cache mode the block was allocated with.
    pub mode: CacheMode,
    /// Tag passed at allocation time.
    pub tag: String,
}

/// Result of a virtual → physical lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct VirtInfo {
    pub phys: PhysAddr,
    pub mode: CacheMode,
}

/// One CMM partition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub phys: PhysAddr,
    pub size_kb: u32,
}

impl PartitionInfo {
    /// Partition size in bytes.
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.size_kb) * 1024
    }

    /// One past the last physical address of the partition.
    pub fn end(&self) -> PhysAddr {
        self.phys + self.size_bytes()
    }

    /// Whether `[phys, phys + size)` lies entirely inside this partition.
    pub fn contains(&self, phys: PhysAddr, size: u64) -> bool {
        match phys.checked_add(size) {
            Some(end) => phys >= self.phys && end <= self.end(),
            None => false,
        }
    }
}

/// Usage summary across all partitions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MemStatus {
    pub total_size: u64,
    pub remain_size: u64,
    pub block_count: u32,
    pub partitions: Vec<PartitionInfo>,
}

impl MemStatus {
    /// Bytes currently handed out.
    pub fn used_size(&self) -> u64 {
        self.total_size.saturating_sub(self.remain_size)
    }
}
