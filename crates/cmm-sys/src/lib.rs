// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # cmm-sys
//!
//! The low-level driver boundary for contiguous memory management (CMM) on
//! AX-family SoCs, plus a host emulation of that driver.
//!
//! # Key Components
//!
//! - [`Backend`]: the raw driver surface: physical allocation, virtual
//!   mapping (normal and "fast"), cache flush/invalidate and queries. Each
//!   sized call is capped at [`Backend::max_op_size`].
//! - [`HostBackend`]: a `memfd`-backed emulation used on development hosts
//!   and in tests. Cached mappings really go stale until flushed, so cache
//!   maintenance bugs show up off-target.
//! - [`HostConfig`]: TOML-loadable partition layout for the emulation,
//!   with sizes written as `"64M"`, `"512K"` etc. (see [`ByteSize`]).
//! - [`HostStats`]: per-call counters for tests and benchmarks.
//!
//! # Example
//! ```
//! use cmm_sys::{Backend, CacheMode, HostBackend};
//!
//! let host = HostBackend::with_defaults().unwrap();
//! let block = host.allocate(4096, CacheMode::NonCached, "doc").unwrap();
//! let virt = host.map(block.phys, 4096, CacheMode::NonCached).unwrap();
//!
//! host.unmap(virt, 4096).unwrap();
//! host.free(block.phys, block.handle).unwrap();
//! assert_eq!(host.stats().live_blocks(), 0);
//! ```

mod backend;
mod config;
mod error;
mod host;
mod size;
mod stats;
mod types;

pub use backend::{Backend, MAX_OP_SIZE};
pub use config::{HostConfig, PartitionConfig};
pub use error::{SysError, SysResult};
pub use host::{HostBackend, HostOp};
pub use size::ByteSize;
pub use stats::HostStats;
pub use types::{
    Block, BlockHandle, BlockInfo, CacheMode, MemStatus, PartitionInfo, PhysAddr, VirtInfo,
};
