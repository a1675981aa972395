// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # cmm
//!
//! Shared-ownership buffers over physically contiguous memory, mapped into
//! the process through any number of independently cached views.
//!
//! # Key Components
//!
//! - [`CmmBuffer`]: allocates (or attaches to) one contiguous region and
//!   hands out views of it. Freeing is refused while any view is alive.
//! - [`CmmView`]: one virtual mapping of a sub-range, cached or not. Owns
//!   its mapping and unmaps it exactly once, on [`reset`](CmmView::reset)
//!   or drop. Provides chunked [`flush`](CmmView::flush) /
//!   [`invalidate`](CmmView::invalidate) for cached mappings.
//! - [`CmmError`] / [`ErrorKind`]: the result channel. Messages are built
//!   lazily, so the success path never formats strings.
//! - [`System`]: scoped backend initialisation.
//!
//! The driver itself sits behind [`cmm_sys::Backend`];
//! [`cmm_sys::HostBackend`] emulates it on an ordinary Linux host.
//!
//! # Ownership Model
//!
//! ```text
//! CmmBuffer::allocate(size)
//!       │
//!       ▼
//!   Arc<Allocation> ◄──── CmmBuffer
//!       ▲    ▲
//!       │    └────────── CmmView (base)
//!       └─────────────── CmmView (sub-range, other cache mode)
//!
//!   last Arc dropped ──► Backend::free   (owned allocations only)
//! ```
//!
//! Buffer and views can be dropped in any order; the physical block is
//! released once, by whichever reference goes last.
//!
//! # Example
//! ```
//! use cmm::{CacheMode, CmmBuffer};
//! use cmm_sys::HostBackend;
//! use std::sync::Arc;
//!
//! let buffer = CmmBuffer::new(Arc::new(HostBackend::with_defaults().unwrap()));
//! let mut cached = buffer.allocate(0x10000, CacheMode::Cached, "frame").unwrap();
//! cached.fill(0xAB);
//! cached.flush().unwrap();
//!
//! let plain = buffer.map_view(0, 0x10000, CacheMode::NonCached).unwrap();
//! assert!(plain.to_vec().iter().all(|&b| b == 0xAB));
//! ```

mod allocation;
mod buffer;
pub mod diag;
mod error;
mod system;
mod view;

pub use buffer::CmmBuffer;
pub use diag::{find_anonymous, find_partition, query_partitions, query_status};
pub use error::{CmmError, ErrorKind, Result};
pub use system::System;
pub use view::{CmmView, TO_END};

pub use cmm_sys::{CacheMode, PhysAddr};
