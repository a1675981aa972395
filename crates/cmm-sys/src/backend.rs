// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The [`Backend`] trait: the raw driver surface the buffer/view layer is
//! built on.
//!
//! A backend performs physical allocation, virtual mapping and cache
//! maintenance for a physical address and byte length. It knows nothing
//! about views, reference counts or registries; that bookkeeping lives in
//! the `cmm` crate.
//!
//! Every sized call is limited to [`Backend::max_op_size`] bytes. Callers
//! that need to cover larger ranges must split the work themselves.

use crate::{
    Block, BlockHandle, BlockInfo, CacheMode, MemStatus, PartitionInfo, PhysAddr, SysResult,
    VirtInfo,
};
use std::fmt::Debug;
use std::ptr::NonNull;

/// Per-call byte ceiling of the AX_SYS driver family (32-bit length field).
pub const MAX_OP_SIZE: u64 = u32::MAX as u64;

/// Raw driver operations for contiguous memory.
///
/// Implementations must be thread-safe: the same backend is shared by every
/// buffer and view through an `Arc<dyn Backend>`.
pub trait Backend: Send + Sync + Debug {
    /// Human-readable backend name, used in diagnostics.
    fn name(&self) -> &str;

    /// Largest byte length accepted by a single map / flush / invalidate
    /// call and by allocation.
    fn max_op_size(&self) -> u64 {
        MAX_OP_SIZE
    }

    /// Process-wide driver initialisation.
    fn init(&self) -> SysResult<()> {
        Ok(())
    }

    /// Process-wide driver teardown. Balanced with a successful [`init`](Backend::init).
    fn deinit(&self) {}

    /// Allocates a physically contiguous block.
    fn allocate(&self, size: u64, mode: CacheMode, tag: &str) -> SysResult<Block>;

    /// Frees a block returned by [`allocate`](Backend::allocate).
    fn free(&self, phys: PhysAddr, handle: BlockHandle) -> SysResult<()>;

    /// Maps `[phys, phys + size)` into the process.
    fn map(&self, phys: PhysAddr, size: u64, mode: CacheMode) -> SysResult<NonNull<u8>>;

    /// Like [`map`](Backend::map), but repeated requests with identical
    /// arguments yield the same virtual address while a previous fast
    /// mapping is still live.
    fn map_fast(&self, phys: PhysAddr, size: u64, mode: CacheMode) -> SysResult<NonNull<u8>>;

    /// Removes a mapping created by `map` or `map_fast`.
    fn unmap(&self, virt: NonNull<u8>, size: u64) -> SysResult<()>;

    /// Writes cached lines of `[virt, virt + size)` back to `phys`.
    fn flush(&self, phys: PhysAddr, virt: NonNull<u8>, size: u64) -> SysResult<()>;

    /// Discards cached lines of `[virt, virt + size)` so the next read
    /// fetches from `phys`.
    fn invalidate(&self, phys: PhysAddr, virt: NonNull<u8>, size: u64) -> SysResult<()>;

    /// Looks up the allocated block containing `phys`.
    fn block_info_by_phys(&self, phys: PhysAddr) -> SysResult<BlockInfo>;

    /// Resolves a mapped virtual address to its physical address.
    fn block_info_by_virt(&self, virt: *const u8) -> SysResult<VirtInfo>;

    /// Lists the memory partitions.
    fn partitions(&self) -> SysResult<Vec<PartitionInfo>>;

    /// Reports overall usage.
    fn query_status(&self) -> SysResult<MemStatus>;
}
