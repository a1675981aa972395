// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Process-wide backend initialisation guard.

use crate::buffer::CmmBuffer;
use crate::error::{CmmError, ErrorKind, Result};
use cmm_sys::Backend;
use std::sync::Arc;

/// Keeps the backend initialised for as long as it lives.
///
/// Buffers and views do not check for it: creating one `System` at startup
/// and keeping it until shutdown is the caller's job.
pub struct System {
    backend: Arc<dyn Backend>,
}

impl System {
    /// Initialises `backend`. Dropping the guard deinitialises it.
    pub fn init(backend: Arc<dyn Backend>) -> Result<Self> {
        backend.init().map_err(|e| {
            let name = backend.name().to_string();
            CmmError::lazy(ErrorKind::BackendInitFailed, move || {
                format!("backend '{name}' failed to initialise")
            })
            .with_source(e)
        })?;
        tracing::info!("backend '{}' initialised", backend.name());
        Ok(Self { backend })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// An empty buffer on this backend.
    pub fn buffer(&self) -> CmmBuffer {
        CmmBuffer::new(Arc::clone(&self.backend))
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.backend.deinit();
        tracing::info!("backend '{}' shut down", self.backend.name());
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("backend", &self.backend.name())
            .finish()
    }
}
