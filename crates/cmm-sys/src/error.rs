// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types reported by CMM backends.

use crate::PhysAddr;

/// Result alias for backend calls.
pub type SysResult<T> = Result<T, SysError>;

/// Errors a [`Backend`](crate::Backend) call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum SysError {
    /// An underlying system call failed.
    #[error("system call failed: {0}")]
    Io(#[from] rustix::io::Errno),

    /// The physical range is not covered by any partition.
    #[error("physical range {phys:#x}+{size:#x} is outside every partition")]
    InvalidAddress { phys: PhysAddr, size: u64 },

    /// The virtual address does not belong to a live mapping.
    #[error("address {addr:#x} is not mapped")]
    NotMapped { addr: usize },

    /// A single call exceeded the backend's per-call size ceiling.
    #[error("request of {requested:#x} bytes exceeds the per-call limit of {limit:#x}")]
    TooLarge { requested: u64, limit: u64 },

    /// No free range large enough in the partition.
    #[error("out of memory in partition '{partition}': requested {requested:#x} bytes")]
    OutOfMemory { partition: String, requested: u64 },

    /// No block with the given physical address / handle exists.
    #[error("unknown block at {phys:#x}")]
    UnknownBlock { phys: PhysAddr },

    /// The arguments are inconsistent (e.g. zero length, size mismatch).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A failure injected by a test harness.
    #[error("injected failure in {0}")]
    Injected(&'static str),

    /// Backend configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}
