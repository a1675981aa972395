// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Virtual windows onto an allocation.
//!
//! A [`CmmView`] is one live mapping of a sub-range of an allocation. It
//! holds a shared reference to the allocation, so it stays valid after the
//! [`CmmBuffer`] that created it is gone. Dropping or [`reset`](CmmView::reset)ting
//! the view unmaps it exactly once.

use crate::allocation::{check_range, Allocation};
use crate::buffer::CmmBuffer;
use crate::error::{CmmError, ErrorKind, Result};
use cmm_sys::{CacheMode, PhysAddr};
use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::Arc;

/// Length sentinel for [`CmmView::flush_range`] and
/// [`CmmView::invalidate_range`]: everything from the offset to the end of
/// the view.
pub const TO_END: u64 = u64::MAX;

struct ViewInner {
    alloc: Arc<Allocation>,
    /// Offset from the start of the allocation.
    offset: u64,
    data: NonNull<u8>,
    size: u64,
    mode: CacheMode,
    fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOp {
    Flush,
    Invalidate,
}

/// A mapped window onto a contiguous allocation.
///
/// A default-constructed view is empty: it maps nothing and most operations
/// on it fail with [`ErrorKind::NotInitialized`] or
/// [`ErrorKind::NoAllocation`].
///
/// Views of the same allocation may overlap and may differ in cache mode.
/// Keeping them coherent (flushing a cached view before reading through a
/// non-cached one, and so on) is up to the caller.
#[derive(Default)]
pub struct CmmView {
    inner: Option<ViewInner>,
}

impl CmmView {
    /// Creates an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        alloc: Arc<Allocation>,
        offset: u64,
        data: NonNull<u8>,
        size: u64,
        mode: CacheMode,
        fast: bool,
    ) -> Self {
        Self {
            inner: Some(ViewInner {
                alloc,
                offset,
                data,
                size,
                mode,
                fast,
            }),
        }
    }

    /// Start of the mapping, or null for an empty view.
    pub fn data(&self) -> *mut u8 {
        self.inner
            .as_ref()
            .map_or(std::ptr::null_mut(), |i| i.data.as_ptr())
    }

    /// Mapped length in bytes (0 when empty).
    pub fn size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.size)
    }

    /// Offset of this view inside its allocation.
    pub fn offset(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.offset)
    }

    pub fn mode(&self) -> CacheMode {
        self.inner.as_ref().map_or(CacheMode::NonCached, |i| i.mode)
    }

    /// Physical address of the first mapped byte (0 when empty).
    pub fn phys(&self) -> PhysAddr {
        self.inner
            .as_ref()
            .map_or(0, |i| i.alloc.phys() + i.offset)
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether this view came from a fast (address-stable) mapping.
    pub fn is_fast(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| i.fast)
    }

    /// The mapped bytes. Empty for an empty view.
    ///
    /// # Safety
    /// Other views may map the same memory (fast mappings share one address,
    /// overlapping non-cached views alias the same pages). No other view may
    /// write this range while the returned slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        match &self.inner {
            Some(i) => std::slice::from_raw_parts(i.data.as_ptr(), i.size as usize),
            None => &[],
        }
    }

    /// The mapped bytes, mutably. Empty for an empty view.
    ///
    /// # Safety
    /// No other view may read or write this range while the returned slice
    /// is alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.inner {
            Some(i) => std::slice::from_raw_parts_mut(i.data.as_ptr(), i.size as usize),
            None => &mut [],
        }
    }

    /// Sets every mapped byte to `byte`.
    pub fn fill(&mut self, byte: u8) {
        if let Some(i) = &self.inner {
            // SAFETY: `data` maps `size` bytes for as long as the view lives.
            unsafe { std::ptr::write_bytes(i.data.as_ptr(), byte, i.size as usize) };
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let src = self.byte_range(offset, buf.len())?;
        // SAFETY: `byte_range` checked `src` against the mapping; `buf` is a
        // caller-owned slice, so it does not overlap the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data().add(src.start),
                buf.as_mut_ptr(),
                src.len(),
            );
        }
        Ok(())
    }

    /// Copies `buf` into the view starting at `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let dst = self.byte_range(offset, buf.len())?;
        // SAFETY: as in `read_at`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.data().add(dst.start),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copies the whole mapping out. Empty for an empty view.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size() as usize];
        if !out.is_empty() {
            // Full range of a live view, cannot fail.
            let _ = self.read_at(0, &mut out);
        }
        out
    }

    fn byte_range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let size = self.live()?.size;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(CmmError::lazy(ErrorKind::OutOfRange, move || {
                format!("access {offset:#x}+{len:#x} exceeds view of {size:#x} bytes")
            })),
        }
    }

    fn live(&self) -> Result<&ViewInner> {
        self.inner
            .as_ref()
            .ok_or_else(|| CmmError::with_message(ErrorKind::NotInitialized, "view is empty"))
    }

    /// Unmaps the view and drops its reference to the allocation.
    ///
    /// Calling it again, or on an empty view, does nothing. An unmap
    /// failure is logged; the view is emptied regardless.
    pub fn reset(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let backend = inner.alloc.backend();
        if let Err(e) = backend.unmap(inner.data, inner.size) {
            tracing::warn!("unmap of {:p} (+{:#x}) failed: {e}", inner.data, inner.size);
        }
        if !inner.alloc.deregister_view(inner.data.as_ptr() as usize) {
            tracing::warn!(
                "view {:p} of {:#x} was missing from the registry",
                inner.data,
                inner.alloc.phys()
            );
        }
        tracing::debug!(
            "view {:p} of {:#x} released, {} reference(s) left",
            inner.data,
            inner.alloc.phys(),
            Arc::strong_count(&inner.alloc) - 1
        );
    }

    /// Writes the whole view back to memory.
    pub fn flush(&self) -> Result<()> {
        self.sync(CacheOp::Flush, 0, TO_END)
    }

    /// Discards cached lines for the whole view.
    pub fn invalidate(&self) -> Result<()> {
        self.sync(CacheOp::Invalidate, 0, TO_END)
    }

    /// Writes back `[offset, offset + len)` of the view.
    ///
    /// A `len` of [`TO_END`], or one reaching past the end, is clamped to
    /// the end of the view.
    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.sync(CacheOp::Flush, offset, len)
    }

    /// Discards cached lines for `[offset, offset + len)` of the view.
    ///
    /// Clamping works as in [`flush_range`](Self::flush_range).
    pub fn invalidate_range(&self, offset: u64, len: u64) -> Result<()> {
        self.sync(CacheOp::Invalidate, offset, len)
    }

    fn sync(&self, op: CacheOp, offset: u64, len: u64) -> Result<()> {
        let inner = self.live()?;
        if offset >= inner.size {
            let size = inner.size;
            return Err(CmmError::lazy(ErrorKind::OutOfRange, move || {
                format!("offset {offset:#x} is past the end of a {size:#x}-byte view")
            }));
        }
        let len = len.min(inner.size - offset);
        if len == 0 {
            return Err(CmmError::with_message(
                ErrorKind::InvalidArgument,
                "cache operation length must be non-zero",
            ));
        }

        let backend = inner.alloc.backend();
        let chunk = backend.max_op_size().max(1);
        let start_phys = inner.alloc.phys() + inner.offset + offset;
        let mut done = 0u64;
        while done < len {
            let step = chunk.min(len - done);
            let phys = start_phys + done;
            // SAFETY: `offset + done < size`, so the pointer stays inside the
            // mapping and is non-null.
            let virt = unsafe {
                NonNull::new_unchecked(inner.data.as_ptr().add((offset + done) as usize))
            };
            let res = match op {
                CacheOp::Flush => backend.flush(phys, virt, step),
                CacheOp::Invalidate => backend.invalidate(phys, virt, step),
            };
            if let Err(e) = res {
                tracing::warn!("{op:?} of {phys:#x}+{step:#x} failed: {e}");
                let kind = match op {
                    CacheOp::Flush => ErrorKind::FlushFailed,
                    CacheOp::Invalidate => ErrorKind::InvalidateFailed,
                };
                let addr = virt.as_ptr() as usize;
                return Err(CmmError::lazy(kind, move || {
                    format!("chunk {phys:#x}+{step:#x} at {addr:#x} rejected")
                })
                .with_source(e));
            }
            done += step;
        }

        tracing::debug!(
            "{op:?} {start_phys:#x}+{len:#x} in {} call(s)",
            len.div_ceil(chunk)
        );
        Ok(())
    }

    /// Maps `[offset, offset + size)` of this view as a new view.
    pub fn map_view(&self, offset: u64, size: u64, mode: CacheMode) -> Result<CmmView> {
        self.map_sub(offset, size, mode, false)
    }

    /// Like [`map_view`](Self::map_view), through an address-stable fast
    /// mapping.
    pub fn map_view_fast(&self, offset: u64, size: u64, mode: CacheMode) -> Result<CmmView> {
        self.map_sub(offset, size, mode, true)
    }

    fn map_sub(&self, offset: u64, size: u64, mode: CacheMode, fast: bool) -> Result<CmmView> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| CmmError::with_message(ErrorKind::NoAllocation, "view is empty"))?;
        check_range(offset, size, inner.size)?;
        Allocation::map(&inner.alloc, inner.offset + offset, size, mode, fast)
    }

    /// Creates a buffer that shares this view's allocation.
    ///
    /// The new buffer counts as one more reference: the allocation cannot be
    /// freed while it exists.
    pub fn make_buffer(&self) -> Result<CmmBuffer> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| CmmError::with_message(ErrorKind::NoAllocation, "view is empty"))?;
        Ok(CmmBuffer::from_allocation(Arc::clone(&inner.alloc)))
    }

    /// Describes the mapping and where `offset` inside it resolves to.
    pub fn dump(&self, offset: u64) -> String {
        let Some(inner) = &self.inner else {
            return "view: <empty>\n".to_string();
        };
        let mut out = String::new();
        let _ = writeln!(
            out,
            "view: virt {:p} phys {:#x} offset {:#x} size {:#x} mode {}{}",
            inner.data,
            self.phys(),
            inner.offset,
            inner.size,
            inner.mode,
            if inner.fast { " fast" } else { "" }
        );
        if offset >= inner.size {
            let _ = writeln!(out, "  offset {offset:#x}: out of range");
            return out;
        }
        let virt = inner.data.as_ptr().wrapping_add(offset as usize);
        match inner.alloc.backend().block_info_by_virt(virt) {
            Ok(info) => {
                let _ = writeln!(out, "  {virt:p} -> phys {:#x} ({})", info.phys, info.mode);
            }
            Err(e) => {
                let _ = writeln!(out, "  {virt:p} -> lookup failed: {e}");
            }
        }
        out
    }
}

impl Drop for CmmView {
    fn drop(&mut self) {
        self.reset();
    }
}

// The mapping is owned by this view and may be used from any thread; the
// allocation behind it is already `Send + Sync`. Shared references are not
// synchronised, so the view is deliberately not `Sync`.
unsafe impl Send for CmmView {}

impl std::fmt::Debug for CmmView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(i) => f
                .debug_struct("CmmView")
                .field("data", &i.data)
                .field("phys", &format_args!("{:#x}", i.alloc.phys() + i.offset))
                .field("offset", &format_args!("{:#x}", i.offset))
                .field("size", &format_args!("{:#x}", i.size))
                .field("mode", &i.mode)
                .field("fast", &i.fast)
                .finish(),
            None => f.write_str("CmmView(<empty>)"),
        }
    }
}
