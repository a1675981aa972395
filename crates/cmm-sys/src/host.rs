// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Host emulation of a CMM driver.
//!
//! [`HostBackend`] lets the buffer/view layer run on any Linux machine. It
//! models the parts of the hardware contract that the upper layer depends
//! on:
//!
//! - **Physical memory**: every partition is a sparse `memfd`. A shared
//!   mapping of the whole file (the "window") stands in for the bus.
//! - **Non-cached mappings** are `MAP_SHARED` mappings of the memfd, so every
//!   non-cached view of the same physical range really aliases it.
//! - **Cached mappings** are private anonymous "shadow" pages, filled from
//!   physical memory when mapped. Writes stay in the shadow until
//!   [`flush`](Backend::flush) copies them out; [`invalidate`](Backend::invalidate)
//!   refreshes the shadow from physical memory. This makes a missing flush
//!   observable in tests.
//! - **Fast mappings** are reference counted per `(phys, size, mode)`, so
//!   identical requests get the same address back.
//!
//! ```text
//!   view (nonc) ─┐ MAP_SHARED
//!   view (nonc) ─┼──────────────► memfd  ◄── window (phys access)
//!                │                   ▲
//!   view (cached) ──► shadow ──flush─┘ / ◄─invalidate
//! ```

use crate::{
    Backend, Block, BlockHandle, BlockInfo, CacheMode, HostConfig, HostStats, MemStatus,
    PartitionInfo, PhysAddr, SysError, SysResult, VirtInfo,
};
use rustix::fd::OwnedFd;
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Backend entry points that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    Init,
    Allocate,
    Free,
    Map,
    Unmap,
    Flush,
    Invalidate,
    Query,
}

impl HostOp {
    fn as_str(&self) -> &'static str {
        match self {
            HostOp::Init => "init",
            HostOp::Allocate => "allocate",
            HostOp::Free => "free",
            HostOp::Map => "map",
            HostOp::Unmap => "unmap",
            HostOp::Flush => "flush",
            HostOp::Invalidate => "invalidate",
            HostOp::Query => "query",
        }
    }
}

/// An emulated partition: a memfd and a shared mapping of all of it.
struct Partition {
    info: PartitionInfo,
    fd: OwnedFd,
    window: NonNull<u8>,
    len: usize,
}

impl Partition {
    fn create(info: PartitionInfo) -> SysResult<Self> {
        let len = usize::try_from(info.size_bytes())
            .map_err(|_| SysError::Config(format!("partition '{}' too large", info.name)))?;
        let fd = rustix::fs::memfd_create(
            format!("cmm-{}", info.name).as_str(),
            MemfdFlags::CLOEXEC,
        )?;
        rustix::fs::ftruncate(&fd, info.size_bytes())?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let window = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| SysError::Invalid("mmap returned null".into()))?;

        Ok(Self {
            info,
            fd,
            window,
            len,
        })
    }

    /// Pointer to physical address `phys` inside the window.
    ///
    /// Caller guarantees `phys` lies inside the partition.
    fn phys_ptr(&self, phys: PhysAddr) -> *mut u8 {
        debug_assert!(self.info.contains(phys, 0));
        unsafe { self.window.as_ptr().add((phys - self.info.phys) as usize) }
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.window.as_ptr().cast(), self.len);
        }
    }
}

#[derive(Debug)]
struct HostBlock {
    size: u64,
    mode: CacheMode,
    tag: String,
    handle: BlockHandle,
}

#[derive(Debug)]
struct Mapping {
    /// Start of the underlying `mmap` region (may precede the user address).
    base: usize,
    map_len: usize,
    phys: PhysAddr,
    size: u64,
    mode: CacheMode,
    fast: bool,
    refs: u32,
}

#[derive(Default)]
struct HostState {
    blocks: BTreeMap<PhysAddr, HostBlock>,
    /// User-visible address → mapping.
    mappings: BTreeMap<usize, Mapping>,
    fast: HashMap<(PhysAddr, u64, CacheMode), usize>,
    faults: HashMap<HostOp, u32>,
    next_handle: u64,
}

impl HostState {
    /// Consumes an injected fault for `op`, if one is due.
    fn take_fault(&mut self, op: HostOp) -> SysResult<()> {
        if let Some(skip) = self.faults.get_mut(&op) {
            if *skip == 0 {
                self.faults.remove(&op);
                return Err(SysError::Injected(op.as_str()));
            }
            *skip -= 1;
        }
        Ok(())
    }

    /// Finds the mapping that fully contains `[addr, addr + size)`.
    fn mapping_containing(&self, addr: usize, size: u64) -> Option<(usize, &Mapping)> {
        let (&start, m) = self.mappings.range(..=addr).next_back()?;
        let end = start as u64 + m.size;
        (addr as u64 + size <= end && (addr as u64) < end).then_some((start, m))
    }
}

/// A CMM driver emulated on host memory. See the [module docs](self).
pub struct HostBackend {
    partitions: Vec<Partition>,
    default_partition: usize,
    alignment: u64,
    max_op: u64,
    page_size: usize,
    state: Mutex<HostState>,
    stats: Mutex<HostStats>,
    init_count: AtomicUsize,
}

impl HostBackend {
    /// Creates a backend with the given layout.
    pub fn new(config: HostConfig) -> SysResult<Self> {
        let infos = config.validate()?;
        let max_op = config.parse_max_op_size()?;
        let default_partition = infos
            .iter()
            .position(|p| p.name == config.default_partition)
            .unwrap_or(0);

        let partitions = infos
            .into_iter()
            .map(Partition::create)
            .collect::<SysResult<Vec<_>>>()?;

        tracing::debug!(
            "host backend ready: {} partition(s), per-call limit {:#x}",
            partitions.len(),
            max_op
        );

        Ok(Self {
            partitions,
            default_partition,
            alignment: config.alignment,
            max_op,
            page_size: rustix::param::page_size(),
            state: Mutex::new(HostState::default()),
            stats: Mutex::new(HostStats::default()),
            init_count: AtomicUsize::new(0),
        })
    }

    /// Creates a backend with [`HostConfig::default`].
    pub fn with_defaults() -> SysResult<Self> {
        Self::new(HostConfig::default())
    }

    /// Returns a snapshot of the call counters.
    pub fn stats(&self) -> HostStats {
        lock(&self.stats).clone()
    }

    /// Lists live blocks in ascending physical order.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        lock(&self.state)
            .blocks
            .iter()
            .map(|(&phys, b)| BlockInfo {
                phys,
                size: b.size,
                mode: b.mode,
                tag: b.tag.clone(),
            })
            .collect()
    }

    /// Whether `addr` lies inside a live mapping.
    pub fn is_mapped(&self, addr: *const u8) -> bool {
        lock(&self.state)
            .mapping_containing(addr as usize, 0)
            .is_some()
    }

    /// Number of distinct live mappings.
    pub fn mapping_count(&self) -> usize {
        lock(&self.state).mappings.len()
    }

    /// Makes the `skip + 1`-th next call of `op` fail with
    /// [`SysError::Injected`].
    pub fn inject_failure(&self, op: HostOp, skip: u32) {
        lock(&self.state).faults.insert(op, skip);
    }

    /// Removes all pending injected failures.
    pub fn clear_failures(&self) {
        lock(&self.state).faults.clear();
    }

    /// Outstanding `init` calls not yet balanced by `deinit`.
    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::Acquire)
    }

    fn partition_for(&self, phys: PhysAddr, size: u64) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.info.contains(phys, size))
    }

    fn check_len(&self, size: u64) -> SysResult<usize> {
        if size == 0 {
            return Err(SysError::Invalid("zero length".into()));
        }
        if size > self.max_op {
            return Err(SysError::TooLarge {
                requested: size,
                limit: self.max_op,
            });
        }
        usize::try_from(size).map_err(|_| SysError::Invalid(format!("length {size:#x}")))
    }

    fn round_up_page(&self, len: usize) -> usize {
        len.div_ceil(self.page_size) * self.page_size
    }

    /// Counts a failed call before handing the result back.
    fn tally<T>(&self, result: SysResult<T>) -> SysResult<T> {
        if result.is_err() {
            lock(&self.stats).failed_calls += 1;
        }
        result
    }

    fn allocate_inner(&self, size: u64, mode: CacheMode, tag: &str) -> SysResult<Block> {
        let mut state = lock(&self.state);
        state.take_fault(HostOp::Allocate)?;
        self.check_len(size)?;

        let part = &self.partitions[self.default_partition];
        let align = |v: u64| v.div_ceil(self.alignment) * self.alignment;
        let mut cursor = align(part.info.phys);
        for (&phys, block) in state.blocks.range(part.info.phys..part.info.end()) {
            if cursor + size <= phys {
                break;
            }
            cursor = align(phys + block.size);
        }
        if cursor + size > part.info.end() {
            return Err(SysError::OutOfMemory {
                partition: part.info.name.clone(),
                requested: size,
            });
        }

        state.next_handle += 1;
        let handle = BlockHandle::from_raw(state.next_handle);
        state.blocks.insert(
            cursor,
            HostBlock {
                size,
                mode,
                tag: tag.to_string(),
                handle,
            },
        );
        lock(&self.stats).record_allocation(size);
        tracing::trace!("host: allocated {size:#x} bytes at {cursor:#x} ('{tag}')");

        Ok(Block {
            phys: cursor,
            handle,
        })
    }

    fn free_inner(&self, phys: PhysAddr, handle: BlockHandle) -> SysResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(HostOp::Free)?;
        match state.blocks.get(&phys) {
            Some(block) if block.handle == handle => {}
            _ => return Err(SysError::UnknownBlock { phys }),
        }
        if let Some(block) = state.blocks.remove(&phys) {
            lock(&self.stats).record_free(block.size);
            tracing::trace!("host: freed {:#x} bytes at {phys:#x}", block.size);
        }
        Ok(())
    }

    fn map_inner(
        &self,
        phys: PhysAddr,
        size: u64,
        mode: CacheMode,
        fast: bool,
    ) -> SysResult<NonNull<u8>> {
        let mut state = lock(&self.state);
        state.take_fault(HostOp::Map)?;
        let len = self.check_len(size)?;
        let part = self
            .partition_for(phys, size)
            .ok_or(SysError::InvalidAddress { phys, size })?;

        if fast {
            if let Some(&addr) = state.fast.get(&(phys, size, mode)) {
                if let Some(m) = state.mappings.get_mut(&addr) {
                    m.refs += 1;
                    lock(&self.stats).fast_map_reuses += 1;
                    return NonNull::new(addr as *mut u8)
                        .ok_or_else(|| SysError::Invalid("null fast mapping".into()));
                }
            }
        }

        let (base, map_len, addr) = match mode {
            CacheMode::NonCached => {
                let file_off = (phys - part.info.phys) as usize;
                let delta = file_off % self.page_size;
                let map_len = self.round_up_page(delta + len);
                let ptr = unsafe {
                    rustix::mm::mmap(
                        std::ptr::null_mut(),
                        map_len,
                        ProtFlags::READ | ProtFlags::WRITE,
                        MapFlags::SHARED,
                        &part.fd,
                        (file_off - delta) as u64,
                    )?
                };
                (ptr as usize, map_len, ptr as usize + delta)
            }
            CacheMode::Cached => {
                let map_len = self.round_up_page(len);
                let ptr = unsafe {
                    rustix::mm::mmap_anonymous(
                        std::ptr::null_mut(),
                        map_len,
                        ProtFlags::READ | ProtFlags::WRITE,
                        MapFlags::PRIVATE,
                    )?
                };
                // A fresh cached mapping starts coherent with memory.
                unsafe {
                    std::ptr::copy_nonoverlapping(part.phys_ptr(phys), ptr.cast::<u8>(), len);
                }
                (ptr as usize, map_len, ptr as usize)
            }
        };

        state.mappings.insert(
            addr,
            Mapping {
                base,
                map_len,
                phys,
                size,
                mode,
                fast,
                refs: 1,
            },
        );
        if fast {
            state.fast.insert((phys, size, mode), addr);
        }
        lock(&self.stats).maps += 1;
        tracing::trace!("host: mapped {phys:#x}+{size:#x} ({mode}) at {addr:#x}");

        NonNull::new(addr as *mut u8).ok_or_else(|| SysError::Invalid("mmap returned null".into()))
    }

    fn unmap_inner(&self, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(HostOp::Unmap)?;
        let addr = virt.as_ptr() as usize;
        let mapping = state
            .mappings
            .get_mut(&addr)
            .ok_or(SysError::NotMapped { addr })?;
        if mapping.size != size {
            return Err(SysError::Invalid(format!(
                "unmap size {size:#x} does not match mapping size {:#x}",
                mapping.size
            )));
        }

        mapping.refs -= 1;
        if mapping.refs == 0 {
            if let Some(m) = state.mappings.remove(&addr) {
                if m.fast && state.fast.get(&(m.phys, m.size, m.mode)) == Some(&addr) {
                    state.fast.remove(&(m.phys, m.size, m.mode));
                }
                unsafe {
                    rustix::mm::munmap(m.base as *mut _, m.map_len)?;
                }
            }
        }
        lock(&self.stats).unmaps += 1;
        tracing::trace!("host: unmapped {addr:#x}");
        Ok(())
    }

    fn cache_op(
        &self,
        op: HostOp,
        phys: PhysAddr,
        virt: NonNull<u8>,
        size: u64,
    ) -> SysResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(op)?;
        let len = self.check_len(size)?;
        let addr = virt.as_ptr() as usize;
        let (start, mapping) = state
            .mapping_containing(addr, size)
            .ok_or(SysError::NotMapped { addr })?;

        let expected = mapping.phys + (addr - start) as u64;
        if expected != phys {
            return Err(SysError::Invalid(format!(
                "address {addr:#x} maps {expected:#x}, not {phys:#x}"
            )));
        }

        if mapping.mode == CacheMode::Cached {
            let part = self
                .partition_for(phys, size)
                .ok_or(SysError::InvalidAddress { phys, size })?;
            unsafe {
                match op {
                    HostOp::Flush => {
                        std::ptr::copy_nonoverlapping(virt.as_ptr(), part.phys_ptr(phys), len)
                    }
                    _ => std::ptr::copy_nonoverlapping(part.phys_ptr(phys), virt.as_ptr(), len),
                }
            }
        }

        let mut stats = lock(&self.stats);
        match op {
            HostOp::Flush => stats.flush_calls += 1,
            _ => stats.invalidate_calls += 1,
        }
        Ok(())
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn max_op_size(&self) -> u64 {
        self.max_op
    }

    fn init(&self) -> SysResult<()> {
        let res = lock(&self.state).take_fault(HostOp::Init);
        self.tally(res)?;
        self.init_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn deinit(&self) {
        let _ = self
            .init_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn allocate(&self, size: u64, mode: CacheMode, tag: &str) -> SysResult<Block> {
        self.tally(self.allocate_inner(size, mode, tag))
    }

    fn free(&self, phys: PhysAddr, handle: BlockHandle) -> SysResult<()> {
        self.tally(self.free_inner(phys, handle))
    }

    fn map(&self, phys: PhysAddr, size: u64, mode: CacheMode) -> SysResult<NonNull<u8>> {
        self.tally(self.map_inner(phys, size, mode, false))
    }

    fn map_fast(&self, phys: PhysAddr, size: u64, mode: CacheMode) -> SysResult<NonNull<u8>> {
        self.tally(self.map_inner(phys, size, mode, true))
    }

    fn unmap(&self, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        self.tally(self.unmap_inner(virt, size))
    }

    fn flush(&self, phys: PhysAddr, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        self.tally(self.cache_op(HostOp::Flush, phys, virt, size))
    }

    fn invalidate(&self, phys: PhysAddr, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        self.tally(self.cache_op(HostOp::Invalidate, phys, virt, size))
    }

    fn block_info_by_phys(&self, phys: PhysAddr) -> SysResult<BlockInfo> {
        let mut state = lock(&self.state);
        let res = state.take_fault(HostOp::Query).and_then(|_| {
            state
                .blocks
                .range(..=phys)
                .next_back()
                .filter(|(base, b)| phys < **base + b.size)
                .map(|(&base, b)| BlockInfo {
                    phys: base,
                    size: b.size,
                    mode: b.mode,
                    tag: b.tag.clone(),
                })
                .ok_or(SysError::UnknownBlock { phys })
        });
        drop(state);
        self.tally(res)
    }

    fn block_info_by_virt(&self, virt: *const u8) -> SysResult<VirtInfo> {
        let mut state = lock(&self.state);
        let addr = virt as usize;
        let res = state.take_fault(HostOp::Query).and_then(|_| {
            state
                .mapping_containing(addr, 0)
                .map(|(start, m)| VirtInfo {
                    phys: m.phys + (addr - start) as u64,
                    mode: m.mode,
                })
                .ok_or(SysError::NotMapped { addr })
        });
        drop(state);
        self.tally(res)
    }

    fn partitions(&self) -> SysResult<Vec<PartitionInfo>> {
        let res = lock(&self.state).take_fault(HostOp::Query);
        self.tally(res)?;
        Ok(self.partitions.iter().map(|p| p.info.clone()).collect())
    }

    fn query_status(&self) -> SysResult<MemStatus> {
        let mut state = lock(&self.state);
        let res = state.take_fault(HostOp::Query);
        let used: u64 = state.blocks.values().map(|b| b.size).sum();
        let block_count = state.blocks.len() as u32;
        drop(state);
        self.tally(res)?;

        let partitions: Vec<PartitionInfo> =
            self.partitions.iter().map(|p| p.info.clone()).collect();
        let total_size = partitions.iter().map(|p| p.size_bytes()).sum::<u64>();
        Ok(MemStatus {
            total_size,
            remain_size: total_size.saturating_sub(used),
            block_count,
            partitions,
        })
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (addr, m) in std::mem::take(&mut state.mappings) {
            tracing::warn!("host: mapping at {addr:#x} still live at shutdown");
            unsafe {
                let _ = rustix::mm::munmap(m.base as *mut _, m.map_len);
            }
        }
    }
}

// The window pointers are only dereferenced while `state` is locked, and
// every other field is plain data or already synchronised.
unsafe impl Send for HostBackend {}
unsafe impl Sync for HostBackend {}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field(
                "partitions",
                &self.partitions.iter().map(|p| &p.info).collect::<Vec<_>>(),
            )
            .field("alignment", &format_args!("{:#x}", self.alignment))
            .field("max_op", &format_args!("{:#x}", self.max_op))
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ByteSize;

    const BASE: PhysAddr = 0x4000_0000;

    fn host() -> HostBackend {
        HostBackend::new(HostConfig::single(BASE, ByteSize::from_mb(8))).unwrap()
    }

    fn bytes<'a>(p: NonNull<u8>, len: usize) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), len) }
    }

    #[test]
    fn test_allocate_first_fit_and_free() {
        let h = host();
        let a = h.allocate(0x1800, CacheMode::NonCached, "a").unwrap();
        let b = h.allocate(0x1000, CacheMode::Cached, "b").unwrap();
        assert_eq!(a.phys, BASE);
        assert_eq!(b.phys, BASE + 0x2000); // aligned past `a`

        h.free(a.phys, a.handle).unwrap();
        let c = h.allocate(0x1000, CacheMode::NonCached, "c").unwrap();
        assert_eq!(c.phys, BASE); // reuses the hole

        assert_eq!(h.blocks().len(), 2);
        assert_eq!(h.stats().live_blocks(), 2);
    }

    #[test]
    fn test_free_rejects_wrong_handle() {
        let h = host();
        let a = h.allocate(0x1000, CacheMode::NonCached, "a").unwrap();
        let err = h.free(a.phys, BlockHandle::from_raw(999)).unwrap_err();
        assert!(matches!(err, SysError::UnknownBlock { .. }));
        assert_eq!(h.stats().failed_calls, 1);
        h.free(a.phys, a.handle).unwrap();
    }

    #[test]
    fn test_out_of_memory() {
        let h = host();
        let _a = h.allocate(6 * 1024 * 1024, CacheMode::NonCached, "big").unwrap();
        let err = h
            .allocate(4 * 1024 * 1024, CacheMode::NonCached, "too-big")
            .unwrap_err();
        assert!(matches!(err, SysError::OutOfMemory { .. }));
    }

    #[test]
    fn test_noncached_mappings_alias() {
        let h = host();
        let blk = h.allocate(0x4000, CacheMode::NonCached, "alias").unwrap();
        let v1 = h.map(blk.phys, 0x4000, CacheMode::NonCached).unwrap();
        let v2 = h.map(blk.phys + 0x1000, 0x1000, CacheMode::NonCached).unwrap();
        assert_ne!(v1, v2);

        bytes(v1, 0x4000).fill(0x5A);
        assert!(bytes(v2, 0x1000).iter().all(|&b| b == 0x5A));

        h.unmap(v2, 0x1000).unwrap();
        h.unmap(v1, 0x4000).unwrap();
        assert_eq!(h.mapping_count(), 0);
    }

    #[test]
    fn test_unaligned_noncached_map() {
        let h = host();
        let v = h.map(BASE + 0x10, 0x20, CacheMode::NonCached).unwrap();
        let info = h.block_info_by_virt(v.as_ptr()).unwrap();
        assert_eq!(info.phys, BASE + 0x10);
        h.unmap(v, 0x20).unwrap();
    }

    #[test]
    fn test_cached_needs_flush() {
        let h = host();
        let nc = h.map(BASE, 0x1000, CacheMode::NonCached).unwrap();
        let c = h.map(BASE, 0x1000, CacheMode::Cached).unwrap();
        bytes(nc, 0x1000).fill(0x11);
        bytes(c, 0x1000).fill(0x22);
        assert!(bytes(nc, 0x1000).iter().all(|&b| b == 0x11));

        h.flush(BASE, c, 0x1000).unwrap();
        assert!(bytes(nc, 0x1000).iter().all(|&b| b == 0x22));

        bytes(nc, 0x1000).fill(0x33);
        h.invalidate(BASE, c, 0x1000).unwrap();
        assert!(bytes(c, 0x1000).iter().all(|&b| b == 0x33));

        let st = h.stats();
        assert_eq!(st.flush_calls, 1);
        assert_eq!(st.invalidate_calls, 1);
        h.unmap(c, 0x1000).unwrap();
        h.unmap(nc, 0x1000).unwrap();
    }

    #[test]
    fn test_fast_map_reuses_address() {
        let h = host();
        let a = h.map_fast(BASE, 0x2000, CacheMode::Cached).unwrap();
        let b = h.map_fast(BASE, 0x2000, CacheMode::Cached).unwrap();
        assert_eq!(a, b);
        assert_eq!(h.mapping_count(), 1);
        assert_eq!(h.stats().fast_map_reuses, 1);

        h.unmap(a, 0x2000).unwrap();
        assert!(h.is_mapped(b.as_ptr()));
        h.unmap(b, 0x2000).unwrap();
        assert!(!h.is_mapped(b.as_ptr()));
    }

    #[test]
    fn test_map_outside_partition() {
        let h = host();
        let err = h.map(BASE - 0x1000, 0x2000, CacheMode::NonCached).unwrap_err();
        assert!(matches!(err, SysError::InvalidAddress { .. }));
    }

    #[test]
    fn test_per_call_limit() {
        let mut cfg = HostConfig::single(BASE, ByteSize::from_mb(1));
        cfg.max_op_size = Some("4K".into());
        let h = HostBackend::new(cfg).unwrap();
        assert_eq!(h.max_op_size(), 4096);
        let v = h.map(BASE, 0x1000, CacheMode::Cached).unwrap();
        let err = h.flush(BASE, v, 0x1001).unwrap_err();
        assert!(matches!(err, SysError::TooLarge { .. }));
        h.unmap(v, 0x1000).unwrap();
    }

    #[test]
    fn test_cache_op_checks_phys() {
        let h = host();
        let v = h.map(BASE, 0x2000, CacheMode::Cached).unwrap();
        assert!(h.flush(BASE + 0x1000, v, 0x1000).is_err());
        assert!(h.flush(BASE, v, 0x3000).is_err());
        h.unmap(v, 0x2000).unwrap();
    }

    #[test]
    fn test_injected_failure_skips() {
        let h = host();
        h.inject_failure(HostOp::Map, 1);
        let v = h.map(BASE, 0x1000, CacheMode::NonCached).unwrap();
        assert!(matches!(
            h.map(BASE, 0x1000, CacheMode::NonCached),
            Err(SysError::Injected("map"))
        ));
        let w = h.map(BASE, 0x1000, CacheMode::NonCached).unwrap();
        h.unmap(v, 0x1000).unwrap();
        h.unmap(w, 0x1000).unwrap();
    }

    #[test]
    fn test_status_and_block_lookup() {
        let h = host();
        let a = h.allocate(0x3000, CacheMode::Cached, "status").unwrap();
        let st = h.query_status().unwrap();
        assert_eq!(st.total_size, 8 * 1024 * 1024);
        assert_eq!(st.used_size(), 0x3000);
        assert_eq!(st.block_count, 1);

        let info = h.block_info_by_phys(a.phys + 0x1234).unwrap();
        assert_eq!(info.phys, a.phys);
        assert_eq!(info.size, 0x3000);
        assert_eq!(info.tag, "status");
        assert!(h.block_info_by_phys(a.phys + 0x3000).is_err());
    }

    #[test]
    fn test_init_count() {
        let h = host();
        h.init().unwrap();
        h.init().unwrap();
        h.deinit();
        assert_eq!(h.init_count(), 1);
        h.deinit();
        h.deinit();
        assert_eq!(h.init_count(), 0);
    }
}
