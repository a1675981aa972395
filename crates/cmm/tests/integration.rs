// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: buffers and views end to end on the host backend.
//!
//! These tests drive the public API only, and use the emulated driver's
//! counters to prove that physical blocks and mappings are released exactly
//! once no matter which handle goes last.

use cmm::{CacheMode, CmmBuffer, CmmError, CmmView, ErrorKind, System, TO_END};
use cmm_sys::{
    Backend, Block, BlockHandle, BlockInfo, ByteSize, HostBackend, HostConfig, HostOp, MemStatus,
    PartitionInfo, PhysAddr, SysResult, VirtInfo,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

// ── Helpers ────────────────────────────────────────────────────

const BASE: PhysAddr = 0x4000_0000;
const MIB: u64 = 1024 * 1024;

fn host() -> Arc<HostBackend> {
    Arc::new(HostBackend::new(HostConfig::single(BASE, ByteSize::from_mb(16))).unwrap())
}

fn setup() -> (Arc<HostBackend>, CmmBuffer) {
    let host = host();
    let buffer = CmmBuffer::new(host.clone());
    (host, buffer)
}

/// Delegates to a host backend but reports a small per-call ceiling, so
/// cache maintenance on ordinary views has to be split into chunks.
#[derive(Debug)]
struct SmallOps {
    inner: Arc<HostBackend>,
    limit: u64,
}

impl Backend for SmallOps {
    fn name(&self) -> &str {
        "small-ops"
    }
    fn max_op_size(&self) -> u64 {
        self.limit
    }
    fn allocate(&self, size: u64, mode: CacheMode, tag: &str) -> SysResult<Block> {
        self.inner.allocate(size, mode, tag)
    }
    fn free(&self, phys: PhysAddr, handle: BlockHandle) -> SysResult<()> {
        self.inner.free(phys, handle)
    }
    fn map(&self, phys: PhysAddr, size: u64, mode: CacheMode) -> SysResult<NonNull<u8>> {
        self.inner.map(phys, size, mode)
    }
    fn map_fast(&self, phys: PhysAddr, size: u64, mode: CacheMode) -> SysResult<NonNull<u8>> {
        self.inner.map_fast(phys, size, mode)
    }
    fn unmap(&self, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        self.inner.unmap(virt, size)
    }
    fn flush(&self, phys: PhysAddr, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        assert!(size <= self.limit);
        self.inner.flush(phys, virt, size)
    }
    fn invalidate(&self, phys: PhysAddr, virt: NonNull<u8>, size: u64) -> SysResult<()> {
        assert!(size <= self.limit);
        self.inner.invalidate(phys, virt, size)
    }
    fn block_info_by_phys(&self, phys: PhysAddr) -> SysResult<BlockInfo> {
        self.inner.block_info_by_phys(phys)
    }
    fn block_info_by_virt(&self, virt: *const u8) -> SysResult<VirtInfo> {
        self.inner.block_info_by_virt(virt)
    }
    fn partitions(&self) -> SysResult<Vec<PartitionInfo>> {
        self.inner.partitions()
    }
    fn query_status(&self) -> SysResult<MemStatus> {
        self.inner.query_status()
    }
}

/// A buffer on `SmallOps` attached to a block owned by the host directly.
fn chunked(limit: u64, size: u64) -> (Arc<HostBackend>, CmmBuffer, Block) {
    let host = host();
    let block = host.allocate(size, CacheMode::Cached, "chunked").unwrap();
    let small = Arc::new(SmallOps {
        inner: host.clone(),
        limit,
    });
    let buffer = CmmBuffer::new(small);
    buffer.attach_external(block.phys, size).unwrap();
    (host, buffer, block)
}

// ── Scenarios ──────────────────────────────────────────────────

#[test]
fn test_scenario_a_basic_allocation() {
    let (_host, buffer) = setup();
    let view = buffer.allocate(2 * MIB, CacheMode::NonCached, "t1").unwrap();
    assert_ne!(view.phys(), 0);
    assert!(!view.data().is_null());
    assert_eq!(view.size(), 2 * MIB);
    assert_eq!(buffer.size(), 2 * MIB);
    assert!(buffer.is_owned());
}

#[test]
fn test_scenario_b_sub_view() {
    let (_host, buffer) = setup();
    let _base = buffer.allocate(MIB, CacheMode::NonCached, "t2").unwrap();
    let sub = buffer.map_view(0x1000, 0x2000, CacheMode::NonCached).unwrap();
    assert_eq!(sub.offset(), 0x1000);
    assert_eq!(sub.size(), 0x2000);
    assert_eq!(sub.phys(), buffer.phys() + 0x1000);
    assert!(buffer.verify());
}

#[test]
fn test_scenario_c_out_of_range() {
    let (_host, buffer) = setup();
    let _base = buffer.allocate(0x4000, CacheMode::NonCached, "t3").unwrap();
    let err = buffer
        .map_view(0x3000, 0x2000, CacheMode::NonCached)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert!(err.message().contains("0x3000"));
    assert_eq!(buffer.view_count(), 1);
}

#[test]
fn test_scenario_d_free_waits_for_views() {
    let (host, buffer) = setup();
    let mut view = buffer.allocate(0x8000, CacheMode::Cached, "t4").unwrap();

    let err = buffer.free().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferencesRemain);
    assert!(view.is_mapped());
    assert_eq!(host.blocks().len(), 1);

    view.reset();
    buffer.free().unwrap();
    assert!(host.blocks().is_empty());
    assert_eq!(host.stats().frees, 1);
}

#[test]
fn test_scenario_e_view_outlives_buffer() {
    let host = host();
    let mut view: CmmView = {
        let buffer = CmmBuffer::new(host.clone());
        buffer.allocate(0x4000, CacheMode::NonCached, "t5").unwrap()
    };

    let addr = view.data();
    let info = host.block_info_by_virt(addr).unwrap();
    assert_eq!(info.phys, view.phys());
    assert_eq!(host.blocks().len(), 1);

    view.fill(0x7E);
    assert!(view.to_vec().iter().all(|&b| b == 0x7E));

    view.reset();
    assert!(host.blocks().is_empty());
    assert!(!host.is_mapped(addr));
}

// ── Cache Coherency ────────────────────────────────────────────

#[test]
fn test_cached_write_visible_after_flush() {
    let (_host, buffer) = setup();
    let mut cached = buffer.allocate(0x10000, CacheMode::Cached, "coherent").unwrap();
    let plain = buffer.map_view(0, 0x10000, CacheMode::NonCached).unwrap();

    cached.fill(0x3C);
    assert!(plain.to_vec().iter().all(|&b| b == 0));

    cached.flush().unwrap();
    assert_eq!(cached.to_vec(), plain.to_vec());
}

#[test]
fn test_partial_flush_leaves_rest_stale() {
    let (_host, buffer) = setup();
    let mut cached = buffer.allocate(0x4000, CacheMode::Cached, "partial").unwrap();
    let plain = buffer.map_view(0, 0x4000, CacheMode::NonCached).unwrap();

    cached.fill(0xC5);
    cached.flush_range(0, 0x1000).unwrap();

    assert_eq!(&cached.to_vec()[..0x1000], &plain.to_vec()[..0x1000]);
    assert_ne!(&cached.to_vec()[..0x2000], &plain.to_vec()[..0x2000]);

    cached.flush_range(0x1000, TO_END).unwrap();
    assert_eq!(cached.to_vec(), plain.to_vec());
}

#[test]
fn test_invalidate_picks_up_device_writes() {
    let (_host, buffer) = setup();
    let cached = buffer.allocate(0x2000, CacheMode::Cached, "inval").unwrap();
    let mut plain = buffer.map_view(0x1000, 0x1000, CacheMode::NonCached).unwrap();

    plain.write_at(0, b"dma").unwrap();
    let mut head = [0u8; 3];
    cached.read_at(0x1000, &mut head).unwrap();
    assert_eq!(&head, &[0, 0, 0]);

    cached.invalidate_range(0x1000, 0x1000).unwrap();
    cached.read_at(0x1000, &mut head).unwrap();
    assert_eq!(&head, b"dma");
}

#[test]
fn test_sub_view_flush_hits_right_offset() {
    let (_host, buffer) = setup();
    let base = buffer.allocate(0x4000, CacheMode::NonCached, "subflush").unwrap();
    let mut tail = base.map_view(0x3000, 0x1000, CacheMode::Cached).unwrap();
    tail.fill(0x99);
    tail.flush().unwrap();

    assert!(base.to_vec()[0x3000..].iter().all(|&b| b == 0x99));
    assert!(base.to_vec()[..0x3000].iter().all(|&b| b == 0));
}

// ── Chunked Cache Maintenance ──────────────────────────────────

#[test]
fn test_flush_is_split_into_chunks() {
    let (host, buffer, block) = chunked(0x1000, 0x4800);
    let mut cached = buffer.map_view(0, 0x4800, CacheMode::Cached).unwrap();
    let plain = buffer.map_view(0, 0x4800, CacheMode::NonCached).unwrap();

    cached.fill(0xA1);
    cached.flush().unwrap();
    assert_eq!(host.stats().flush_calls, 5);
    assert_eq!(cached.to_vec(), plain.to_vec());

    cached.invalidate_range(0x800, 0x2000).unwrap();
    assert_eq!(host.stats().invalidate_calls, 2);

    drop((cached, plain));
    buffer.detach_external().unwrap();
    host.free(block.phys, block.handle).unwrap();
}

#[test]
fn test_failed_chunk_stops_flush() {
    let (host, buffer, _block) = chunked(0x1000, 0x4000);
    let cached = buffer.map_view(0, 0x4000, CacheMode::Cached).unwrap();

    host.inject_failure(HostOp::Flush, 2);
    let err = cached.flush().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FlushFailed);
    assert!(err.sys_error().is_some());
    assert_eq!(host.stats().flush_calls, 2);
}

// ── Fast Mappings ──────────────────────────────────────────────

#[test]
fn test_fast_map_address_is_stable() {
    let (host, buffer) = setup();
    let _base = buffer.allocate(0x4000, CacheMode::NonCached, "fast").unwrap();
    let first = buffer.map_view_fast(0x1000, 0x1000, CacheMode::Cached).unwrap();
    let second = buffer.map_view_fast(0x1000, 0x1000, CacheMode::Cached).unwrap();
    let normal = buffer.map_view(0x1000, 0x1000, CacheMode::Cached).unwrap();

    assert!(first.is_fast());
    assert_eq!(first.data(), second.data());
    assert_ne!(first.data(), normal.data());
    assert_eq!(buffer.view_count(), 4);

    let addr = first.data();
    drop(first);
    assert!(host.is_mapped(addr));
    assert!(buffer.verify());
    drop(second);
    assert!(!host.is_mapped(addr));
}

// ── Lifecycle ──────────────────────────────────────────────────

#[test]
fn test_views_dropped_in_any_order() {
    let (host, buffer) = setup();
    let base = buffer.allocate(0x8000, CacheMode::NonCached, "order").unwrap();
    let a = base.map_view(0, 0x1000, CacheMode::Cached).unwrap();
    let b = a.map_view(0x800, 0x800, CacheMode::NonCached).unwrap();

    drop(buffer);
    drop(a);
    drop(base);
    assert_eq!(host.blocks().len(), 1);
    drop(b);
    assert!(host.blocks().is_empty());
    assert_eq!(host.mapping_count(), 0);
    assert_eq!(host.stats().frees, 1);
}

#[test]
fn test_buffer_reusable_after_free() {
    let (host, buffer) = setup();
    buffer.allocate(0x1000, CacheMode::NonCached, "one").unwrap().reset();
    buffer.free().unwrap();
    let view = buffer.allocate(0x2000, CacheMode::Cached, "two").unwrap();
    assert_eq!(view.size(), 0x2000);
    assert_eq!(host.stats().allocations, 2);
}

#[test]
fn test_lazy_message_only_on_demand() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let err = CmmError::lazy(ErrorKind::MapFailed, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        "expensive".to_string()
    });
    assert!(err.is(ErrorKind::MapFailed));
    assert_eq!(built.load(Ordering::SeqCst), 0);
    assert_eq!(err.to_string(), "Map failed: expensive");
    assert_eq!(err.to_string(), "Map failed: expensive");
    assert_eq!(built.load(Ordering::SeqCst), 1);
}

#[test]
fn test_system_guard_and_diagnostics() {
    let host = host();
    let system = System::init(host.clone()).unwrap();
    let buffer = system.buffer();
    let _view = buffer.allocate(MIB, CacheMode::NonCached, "diag").unwrap();

    let status = cmm::query_status(system.backend().as_ref()).unwrap();
    assert_eq!(status.used_size(), MIB);
    assert_eq!(status.block_count, 1);
    let anon = cmm::find_anonymous(system.backend().as_ref()).unwrap().unwrap();
    assert!(anon.contains(buffer.phys(), buffer.size()));
}

// ── Concurrency ────────────────────────────────────────────────

#[test]
fn test_concurrent_views() {
    let (host, buffer) = setup();
    let buffer = Arc::new(buffer);
    let base = buffer.allocate(0x8000, CacheMode::NonCached, "threads").unwrap();

    let workers: Vec<_> = (0..8u8)
        .map(|i| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for _ in 0..32 {
                    let mut v = buffer
                        .map_view(u64::from(i) * 0x1000, 0x1000, CacheMode::Cached)
                        .unwrap();
                    v.fill(i);
                    v.flush().unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    for i in 0..8u8 {
        assert_eq!(base.to_vec()[usize::from(i) * 0x1000], i);
    }
    drop(base);
    assert_eq!(buffer.view_count(), 0);
    buffer.free().unwrap();
    assert!(host.blocks().is_empty());
    assert_eq!(host.mapping_count(), 0);
}

#[test]
fn test_free_races_with_map() {
    let (host, buffer) = setup();
    let buffer = Arc::new(buffer);
    buffer.allocate(0x1000, CacheMode::NonCached, "race").unwrap().reset();

    let mappers: Vec<_> = (0..4)
        .map(|_| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || loop {
                match buffer.map_view(0, 0x1000, CacheMode::NonCached) {
                    Ok(view) => drop(view),
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::NoAllocation);
                        break;
                    }
                }
            })
        })
        .collect();

    loop {
        match buffer.free() {
            Ok(()) => break,
            Err(e) => assert_eq!(e.kind(), ErrorKind::ReferencesRemain),
        }
        thread::yield_now();
    }
    for m in mappers {
        m.join().unwrap();
    }

    assert!(!buffer.has_allocation());
    assert!(host.blocks().is_empty());
    assert_eq!(host.mapping_count(), 0);
    assert_eq!(host.stats().frees, 1);
}

// ── Config ─────────────────────────────────────────────────────

#[test]
fn test_backend_from_toml() {
    let cfg = HostConfig::from_toml(
        r#"
        alignment = 4096
        max_op_size = "1M"
        default_partition = "anonymous"

        [[partitions]]
        name = "anonymous"
        phys = 0x6000_0000
        size = "8M"
        "#,
    )
    .unwrap();
    let host = Arc::new(HostBackend::new(cfg).unwrap());
    assert_eq!(host.max_op_size(), MIB);

    let buffer = CmmBuffer::new(host.clone());
    let err = buffer
        .allocate(2 * MIB, CacheMode::NonCached, "limit")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MemoryTooLarge);

    let view = buffer.allocate(MIB, CacheMode::NonCached, "ok").unwrap();
    assert_eq!(view.phys(), 0x6000_0000);
}
