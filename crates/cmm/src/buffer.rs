// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! [`CmmBuffer`]: the handle that allocates, attaches and releases memory.

use crate::allocation::{check_range, Allocation};
use crate::error::{CmmError, ErrorKind, Result};
use crate::view::CmmView;
use cmm_sys::{Backend, CacheMode, PhysAddr};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Owner of at most one contiguous allocation.
///
/// A buffer either allocates memory itself ([`allocate`](Self::allocate)) or
/// describes memory owned elsewhere ([`attach_external`](Self::attach_external)).
/// Views created from it keep the allocation alive on their own, so the
/// buffer may be dropped first.
///
/// [`free`](Self::free) and [`detach_external`](Self::detach_external)
/// succeed only while the buffer holds the sole reference; with live views
/// they fail with [`ErrorKind::ReferencesRemain`] and change nothing.
///
/// # Example
/// ```
/// use cmm::{CacheMode, CmmBuffer, ErrorKind};
/// use cmm_sys::HostBackend;
/// use std::sync::Arc;
///
/// let buffer = CmmBuffer::new(Arc::new(HostBackend::with_defaults().unwrap()));
/// let mut view = buffer.allocate(0x4000, CacheMode::NonCached, "doc").unwrap();
///
/// assert!(buffer.free().unwrap_err().is(ErrorKind::ReferencesRemain));
/// view.reset();
/// buffer.free().unwrap();
/// ```
pub struct CmmBuffer {
    backend: Arc<dyn Backend>,
    alloc: Mutex<Option<Arc<Allocation>>>,
}

impl CmmBuffer {
    /// Creates an empty buffer on `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            alloc: Mutex::new(None),
        }
    }

    /// A buffer holding an extra reference to an existing allocation.
    pub(crate) fn from_allocation(alloc: Arc<Allocation>) -> Self {
        Self {
            backend: Arc::clone(alloc.backend()),
            alloc: Mutex::new(Some(alloc)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Allocation>>> {
        self.alloc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<Allocation>> {
        self.slot().clone()
    }

    /// Allocates `size` bytes and maps all of them as the returned view.
    ///
    /// The `tag` is passed to the backend for its own bookkeeping.
    pub fn allocate(&self, size: u64, mode: CacheMode, tag: &str) -> Result<CmmView> {
        let alloc = {
            let mut slot = self.slot();
            if let Some(held) = slot.as_ref() {
                let phys = held.phys();
                return Err(CmmError::lazy(ErrorKind::AlreadyInitialized, move || {
                    format!("buffer already holds {phys:#x}")
                }));
            }
            if size == 0 {
                return Err(CmmError::with_message(
                    ErrorKind::InvalidArgument,
                    "allocation size must be non-zero",
                ));
            }
            let limit = self.backend.max_op_size();
            if size > limit {
                return Err(CmmError::lazy(ErrorKind::MemoryTooLarge, move || {
                    format!("{size:#x} bytes exceeds the per-call limit of {limit:#x}")
                }));
            }

            let block = self.backend.allocate(size, mode, tag).map_err(|e| {
                tracing::warn!("allocation of {size:#x} bytes ({mode}) failed: {e}");
                let tag = tag.to_string();
                CmmError::lazy(ErrorKind::AllocationFailed, move || {
                    format!("cannot allocate {size:#x} bytes ({mode}) for '{tag}'")
                })
                .with_source(e)
            })?;
            let alloc = Arc::new(Allocation::owned(
                Arc::clone(&self.backend),
                block,
                size,
                mode,
            ));
            *slot = Some(Arc::clone(&alloc));
            alloc
        };

        match Allocation::map(&alloc, 0, size, mode, false) {
            Ok(view) => {
                tracing::info!(
                    "allocated {:#x} ({size:#x} bytes, {mode}) for '{tag}'",
                    alloc.phys()
                );
                Ok(view)
            }
            Err(e) => {
                // An allocation never outlives a failed base mapping.
                {
                    let mut slot = self.slot();
                    if slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, &alloc)) {
                        *slot = None;
                    }
                }
                if let Ok(owned) = Arc::try_unwrap(alloc) {
                    if let Err(free_err) = owned.release() {
                        tracing::error!("free after failed base mapping: {free_err}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Describes `size` bytes at `phys` owned by someone else.
    ///
    /// No view is created and the memory is never freed by this crate.
    pub fn attach_external(&self, phys: PhysAddr, size: u64) -> Result<()> {
        let mut slot = self.slot();
        if let Some(held) = slot.as_ref() {
            let held = held.phys();
            return Err(CmmError::lazy(ErrorKind::AlreadyInitialized, move || {
                format!("buffer already holds {held:#x}")
            }));
        }
        if size == 0 {
            return Err(CmmError::with_message(
                ErrorKind::InvalidArgument,
                "attached size must be non-zero",
            ));
        }
        if phys.checked_add(size).is_none() {
            return Err(CmmError::lazy(ErrorKind::OutOfRange, move || {
                format!("range {phys:#x}+{size:#x} wraps the address space")
            }));
        }
        *slot = Some(Arc::new(Allocation::external(
            Arc::clone(&self.backend),
            phys,
            size,
        )));
        tracing::info!("attached external {phys:#x} ({size:#x} bytes)");
        Ok(())
    }

    /// Takes the allocation out if this buffer holds the only reference.
    fn take_sole(&self, owned: bool) -> Result<Allocation> {
        let mut slot = self.slot();
        let Some(held) = slot.as_ref() else {
            return Err(CmmError::with_message(
                ErrorKind::NoAllocation,
                "buffer holds no allocation",
            ));
        };
        if held.is_owned() != owned {
            let phys = held.phys();
            return Err(if owned {
                CmmError::lazy(ErrorKind::NotOwned, move || {
                    format!("{phys:#x} is attached, use detach_external")
                })
            } else {
                CmmError::lazy(ErrorKind::NoAllocation, move || {
                    format!("{phys:#x} is owned, use free")
                })
            });
        }

        let refs = Arc::strong_count(held);
        if refs > 1 {
            let views = held.view_count();
            tracing::warn!("release refused: {refs} references, {views} view(s)");
            return Err(CmmError::lazy(ErrorKind::ReferencesRemain, move || {
                format!("{} other reference(s) remain, {views} mapped view(s)", refs - 1)
            }));
        }

        match slot.take().map(Arc::try_unwrap) {
            Some(Ok(alloc)) => Ok(alloc),
            Some(Err(shared)) => {
                *slot = Some(shared);
                Err(CmmError::new(ErrorKind::ReferencesRemain))
            }
            None => Err(CmmError::new(ErrorKind::NoAllocation)),
        }
    }

    /// Frees the owned allocation.
    ///
    /// The buffer is empty afterwards even if the backend reports a failure.
    pub fn free(&self) -> Result<()> {
        let alloc = self.take_sole(true)?;
        let phys = alloc.phys();
        alloc.release().map_err(|e| {
            tracing::error!("free of {phys:#x} failed: {e}");
            CmmError::lazy(ErrorKind::FreeFailed, move || {
                format!("backend refused to free {phys:#x}")
            })
            .with_source(e)
        })
    }

    /// Forgets an externally attached allocation without freeing it.
    pub fn detach_external(&self) -> Result<()> {
        let alloc = self.take_sole(false)?;
        tracing::info!("detached external {:#x}", alloc.phys());
        Ok(())
    }

    /// Maps `[offset, offset + size)` of the allocation as a new view.
    pub fn map_view(&self, offset: u64, size: u64, mode: CacheMode) -> Result<CmmView> {
        self.map_with(offset, size, mode, false)
    }

    /// Like [`map_view`](Self::map_view), but identical requests share one
    /// virtual address while an earlier fast view is still mapped.
    pub fn map_view_fast(&self, offset: u64, size: u64, mode: CacheMode) -> Result<CmmView> {
        self.map_with(offset, size, mode, true)
    }

    fn map_with(&self, offset: u64, size: u64, mode: CacheMode, fast: bool) -> Result<CmmView> {
        let alloc = self.current().ok_or_else(|| {
            CmmError::with_message(ErrorKind::NoAllocation, "buffer holds no allocation")
        })?;
        check_range(offset, size, alloc.size())?;
        Allocation::map(&alloc, offset, size, mode, fast)
    }

    /// Physical base address (0 when empty).
    pub fn phys(&self) -> PhysAddr {
        self.slot().as_ref().map_or(0, |a| a.phys())
    }

    /// Allocation size in bytes (0 when empty).
    pub fn size(&self) -> u64 {
        self.slot().as_ref().map_or(0, |a| a.size())
    }

    /// Cache mode the allocation was requested with.
    pub fn mode(&self) -> CacheMode {
        self.slot()
            .as_ref()
            .map_or(CacheMode::NonCached, |a| a.mode())
    }

    pub fn is_owned(&self) -> bool {
        self.slot().as_ref().is_some_and(|a| a.is_owned())
    }

    pub fn has_allocation(&self) -> bool {
        self.slot().is_some()
    }

    /// Holders of the allocation: this buffer, its views and any buffers
    /// made from them. 0 when empty.
    pub fn reference_count(&self) -> usize {
        self.slot().as_ref().map_or(0, Arc::strong_count)
    }

    pub fn view_count(&self) -> usize {
        self.slot().as_ref().map_or(0, |a| a.view_count())
    }

    /// Cross-checks the allocation against the backend.
    ///
    /// Owned blocks must be known to the backend with the same size, the
    /// range must lie inside a partition, and every registered view must
    /// resolve to `phys + offset`. Returns `false` for an empty buffer.
    pub fn verify(&self) -> bool {
        let Some(alloc) = self.current() else {
            return false;
        };
        let (phys, size) = (alloc.phys(), alloc.size());

        if alloc.is_owned() {
            match self.backend.block_info_by_phys(phys) {
                Ok(info) if info.phys == phys && info.size == size => {}
                Ok(info) => {
                    tracing::warn!(
                        "verify: backend block {:#x}+{:#x} differs from {phys:#x}+{size:#x}",
                        info.phys,
                        info.size
                    );
                    return false;
                }
                Err(e) => {
                    tracing::warn!("verify: block lookup for {phys:#x} failed: {e}");
                    return false;
                }
            }
        }

        // Skipped when the backend cannot list partitions.
        if let Ok(parts) = self.backend.partitions() {
            if !parts.iter().any(|p| p.contains(phys, size)) {
                tracing::warn!("verify: {phys:#x}+{size:#x} is outside every partition");
                return false;
            }
        }

        for entry in alloc.snapshot() {
            let fits = entry.offset.checked_add(entry.size).is_some_and(|e| e <= size);
            let resolved = self
                .backend
                .block_info_by_virt(entry.addr as *const u8)
                .map(|info| info.phys.wrapping_sub(phys));
            match resolved {
                Ok(off) if fits && off == entry.offset => {}
                other => {
                    tracing::warn!(
                        "verify: view at {:#x} (offset {:#x}) resolves to {other:?}",
                        entry.addr,
                        entry.offset
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Human-readable summary of the allocation and its views.
    ///
    /// `offset` selects a byte whose physical address is printed as well.
    pub fn dump(&self, offset: u64) -> String {
        let Some(alloc) = self.current() else {
            return "buffer: <empty>\n".to_string();
        };
        let mut out = String::new();
        let _ = writeln!(
            out,
            "buffer: phys {:#x} size {:#x} mode {} {} refs {}",
            alloc.phys(),
            alloc.size(),
            alloc.mode(),
            if alloc.is_owned() { "owned" } else { "external" },
            // Exclude the clone held by this call.
            Arc::strong_count(&alloc) - 1
        );
        if offset < alloc.size() {
            let _ = writeln!(out, "  offset {offset:#x} -> phys {:#x}", alloc.phys() + offset);
        } else {
            let _ = writeln!(out, "  offset {offset:#x}: out of range");
        }
        let views = alloc.snapshot();
        let _ = writeln!(out, "  views: {}", views.len());
        for (i, v) in views.iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{i}] virt {:#x} offset {:#x} size {:#x} mode {}{}",
                v.addr,
                v.offset,
                v.size,
                v.mode,
                if v.fast { " fast" } else { "" }
            );
        }
        out
    }
}

impl std::fmt::Debug for CmmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmmBuffer")
            .field("backend", &self.backend.name())
            .field("alloc", &self.current())
            .finish()
    }
}
