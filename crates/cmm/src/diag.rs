// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Read-only partition and usage queries.

use crate::error::{CmmError, ErrorKind, Result};
use cmm_sys::{Backend, MemStatus, PartitionInfo, SysError};

/// Name of the partition used for unnamed allocations.
pub const ANONYMOUS_PARTITION: &str = "anonymous";

fn call_failed(what: &'static str, e: SysError) -> CmmError {
    tracing::warn!("{what} failed: {e}");
    CmmError::lazy(ErrorKind::BackendCallFailed, move || format!("{what} failed")).with_source(e)
}

/// Lists every memory partition.
pub fn query_partitions(backend: &dyn Backend) -> Result<Vec<PartitionInfo>> {
    backend
        .partitions()
        .map_err(|e| call_failed("partition query", e))
}

/// Looks up a partition by name.
pub fn find_partition(backend: &dyn Backend, name: &str) -> Result<Option<PartitionInfo>> {
    Ok(query_partitions(backend)?
        .into_iter()
        .find(|p| p.name == name))
}

/// The partition backing unnamed allocations, if there is one.
pub fn find_anonymous(backend: &dyn Backend) -> Result<Option<PartitionInfo>> {
    find_partition(backend, ANONYMOUS_PARTITION)
}

/// Overall usage across partitions.
pub fn query_status(backend: &dyn Backend) -> Result<MemStatus> {
    backend
        .query_status()
        .map_err(|e| call_failed("status query", e))
}
