// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The shared physical region behind buffers and views.
//!
//! An [`Allocation`] is always held through an `Arc`. The owning
//! [`CmmBuffer`](crate::CmmBuffer) and every live [`CmmView`] hold one
//! reference each, so whichever of them drops last triggers the release.
//! There is no back-pointer from the allocation to its buffer.
//!
//! ```text
//!   CmmBuffer ──┐
//!   CmmView  ───┼──► Arc<Allocation> ──drop──► Backend::free (owned only)
//!   CmmView  ───┘         │
//!                         └── views: Mutex<Vec<ViewEntry>>
//! ```

use crate::error::{CmmError, ErrorKind, Result};
use crate::view::CmmView;
use cmm_sys::{Backend, Block, CacheMode, PhysAddr, SysResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One live mapping registered against an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ViewEntry {
    pub addr: usize,
    pub offset: u64,
    pub size: u64,
    pub mode: CacheMode,
    pub fast: bool,
}

pub(crate) struct Allocation {
    backend: Arc<dyn Backend>,
    phys: PhysAddr,
    size: u64,
    mode: CacheMode,
    /// `Some` for owned allocations until the block is freed.
    block: Option<Block>,
    views: Mutex<Vec<ViewEntry>>,
}

impl Allocation {
    /// Wraps a block obtained from `backend.allocate`.
    pub(crate) fn owned(backend: Arc<dyn Backend>, block: Block, size: u64, mode: CacheMode) -> Self {
        Self {
            backend,
            phys: block.phys,
            size,
            mode,
            block: Some(block),
            views: Mutex::new(Vec::new()),
        }
    }

    /// Describes memory owned by someone else. Never freed here.
    pub(crate) fn external(backend: Arc<dyn Backend>, phys: PhysAddr, size: u64) -> Self {
        Self {
            backend,
            phys,
            size,
            mode: CacheMode::NonCached,
            block: None,
            views: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn mode(&self) -> CacheMode {
        self.mode
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.block.is_some()
    }

    fn registry(&self) -> MutexGuard<'_, Vec<ViewEntry>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a live mapping. Rejects entries that do not fit.
    pub(crate) fn register_view(&self, entry: ViewEntry) -> Result<()> {
        let fits = entry
            .offset
            .checked_add(entry.size)
            .is_some_and(|end| end <= self.size);
        if !fits {
            let size = self.size;
            return Err(CmmError::lazy(ErrorKind::ViewRegistrationFailed, move || {
                format!(
                    "view {:#x}+{:#x} does not fit allocation of {size:#x} bytes",
                    entry.offset, entry.size
                )
            }));
        }
        self.registry().push(entry);
        Ok(())
    }

    /// Removes the first entry mapped at `addr`.
    pub(crate) fn deregister_view(&self, addr: usize) -> bool {
        let mut views = self.registry();
        match views.iter().position(|e| e.addr == addr) {
            Some(idx) => {
                views.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn view_count(&self) -> usize {
        self.registry().len()
    }

    /// Copy of the registry for diagnostics.
    pub(crate) fn snapshot(&self) -> Vec<ViewEntry> {
        self.registry().clone()
    }

    /// Maps `[offset, offset + size)` of this allocation and registers the
    /// resulting view. Backend calls run without holding any lock.
    pub(crate) fn map(
        this: &Arc<Self>,
        offset: u64,
        size: u64,
        mode: CacheMode,
        fast: bool,
    ) -> Result<CmmView> {
        check_range(offset, size, this.size)?;

        let phys = this.phys + offset;
        let mapped = if fast {
            this.backend.map_fast(phys, size, mode)
        } else {
            this.backend.map(phys, size, mode)
        };
        let data = mapped.map_err(|e| {
            tracing::warn!("map of {phys:#x}+{size:#x} ({mode}) failed: {e}");
            CmmError::lazy(ErrorKind::MapFailed, move || {
                format!("cannot map {phys:#x}+{size:#x} ({mode})")
            })
            .with_source(e)
        })?;

        let entry = ViewEntry {
            addr: data.as_ptr() as usize,
            offset,
            size,
            mode,
            fast,
        };
        if let Err(e) = this.register_view(entry) {
            if let Err(unmap_err) = this.backend.unmap(data, size) {
                tracing::warn!("unmap after failed registration: {unmap_err}");
            }
            return Err(e);
        }

        tracing::debug!(
            "mapped {phys:#x}+{size:#x} ({mode}{}) at {:p}",
            if fast { ", fast" } else { "" },
            data
        );
        Ok(CmmView::from_parts(
            Arc::clone(this),
            offset,
            data,
            size,
            mode,
            fast,
        ))
    }

    /// Frees the block now and reports the backend's answer.
    ///
    /// Consumes the allocation, so the free cannot happen twice.
    pub(crate) fn release(mut self) -> SysResult<()> {
        match self.block.take() {
            Some(block) => {
                tracing::info!("freeing {:#x} ({:#x} bytes)", block.phys, self.size);
                self.backend.free(block.phys, block.handle)
            }
            None => Ok(()),
        }
    }
}

/// Validates a sub-range request against a region of `limit` bytes.
pub(crate) fn check_range(offset: u64, size: u64, limit: u64) -> Result<()> {
    if size == 0 {
        return Err(CmmError::with_message(
            ErrorKind::InvalidArgument,
            "view size must be non-zero",
        ));
    }
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(CmmError::lazy(ErrorKind::OutOfRange, move || {
            format!("range {offset:#x}+{size:#x} exceeds {limit:#x} bytes")
        })),
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            match self.backend.free(block.phys, block.handle) {
                Ok(()) => tracing::info!(
                    "last reference gone, freed {:#x} ({:#x} bytes)",
                    block.phys,
                    self.size
                ),
                Err(e) => tracing::error!("failed to free {:#x}: {e}", block.phys),
            }
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &format_args!("{:#x}", self.size))
            .field("mode", &self.mode)
            .field("owned", &self.is_owned())
            .field("views", &self.view_count())
            .finish()
    }
}
