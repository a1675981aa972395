// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Call counters for the host backend.
//!
//! [`HostStats`] records how often each driver entry point was hit. Tests use
//! it to check exactly-once unmap/free and the number of chunks a cache
//! operation was split into.

/// Cumulative counters of backend calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HostStats {
    /// Successful block allocations.
    pub allocations: u64,
    /// Successful block frees.
    pub frees: u64,
    /// Mappings created (a fast-map reuse is not a new mapping).
    pub maps: u64,
    /// Fast-map requests served by an existing mapping.
    pub fast_map_reuses: u64,
    /// Successful unmap calls.
    pub unmaps: u64,
    /// Successful flush calls.
    pub flush_calls: u64,
    /// Successful invalidate calls.
    pub invalidate_calls: u64,
    /// Calls that returned an error.
    pub failed_calls: u64,
    /// Bytes currently allocated.
    pub bytes_in_use: u64,
    /// High-water mark of `bytes_in_use`.
    pub peak_bytes_in_use: u64,
}

impl HostStats {
    pub(crate) fn record_allocation(&mut self, size: u64) {
        self.allocations += 1;
        self.bytes_in_use += size;
        if self.bytes_in_use > self.peak_bytes_in_use {
            self.peak_bytes_in_use = self.bytes_in_use;
        }
    }

    pub(crate) fn record_free(&mut self, size: u64) {
        self.frees += 1;
        self.bytes_in_use = self.bytes_in_use.saturating_sub(size);
    }

    /// Blocks allocated and not yet freed.
    pub fn live_blocks(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} allocs / {} frees ({} live, peak {:.2} MB), {} maps ({} fast reuses), \
             {} unmaps, {} flushes, {} invalidates, {} failures",
            self.allocations,
            self.frees,
            self.live_blocks(),
            self.peak_bytes_in_use as f64 / (1024.0 * 1024.0),
            self.maps,
            self.fast_map_reuses,
            self.unmaps,
            self.flush_calls,
            self.invalidate_calls,
            self.failed_calls,
        )
    }
}
