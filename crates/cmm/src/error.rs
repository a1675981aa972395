// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for buffer and view operations.
//!
//! Every fallible operation returns [`Result<T>`]. The error carries an
//! [`ErrorKind`] for programmatic branching and a human-readable message.
//! Messages on failure paths are often assembled from addresses and sizes,
//! so [`CmmError::lazy`] defers building the string until someone actually
//! asks for it with [`CmmError::message`].

use cmm_sys::SysError;
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CmmError>;

/// Category of a [`CmmError`].
///
/// The numeric [`code`](ErrorKind::code) is stable and grouped by area:
/// 1–4 generic, 100–105 allocation, 200–204 mapping and cache, 300–301
/// backend, 999 unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Out of range")]
    OutOfRange,
    #[error("Not initialized")]
    NotInitialized,
    #[error("Already initialized")]
    AlreadyInitialized,

    #[error("Memory allocation failed")]
    AllocationFailed,
    #[error("Memory size too large")]
    MemoryTooLarge,
    #[error("No allocation")]
    NoAllocation,
    #[error("Not owned")]
    NotOwned,
    #[error("References remain")]
    ReferencesRemain,
    #[error("Memory free failed")]
    FreeFailed,

    #[error("Map failed")]
    MapFailed,
    #[error("Unmap failed")]
    UnmapFailed,
    #[error("Flush failed")]
    FlushFailed,
    #[error("Invalidate failed")]
    InvalidateFailed,
    #[error("View registration failed")]
    ViewRegistrationFailed,

    #[error("Backend init failed")]
    BackendInitFailed,
    #[error("Backend call failed")]
    BackendCallFailed,

    #[error("Unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Stable numeric code.
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::InvalidArgument => 1,
            ErrorKind::OutOfRange => 2,
            ErrorKind::NotInitialized => 3,
            ErrorKind::AlreadyInitialized => 4,
            ErrorKind::AllocationFailed => 100,
            ErrorKind::MemoryTooLarge => 101,
            ErrorKind::NoAllocation => 102,
            ErrorKind::NotOwned => 103,
            ErrorKind::ReferencesRemain => 104,
            ErrorKind::FreeFailed => 105,
            ErrorKind::MapFailed => 200,
            ErrorKind::UnmapFailed => 201,
            ErrorKind::FlushFailed => 202,
            ErrorKind::InvalidateFailed => 203,
            ErrorKind::ViewRegistrationFailed => 204,
            ErrorKind::BackendInitFailed => 300,
            ErrorKind::BackendCallFailed => 301,
            ErrorKind::Unknown => 999,
        }
    }
}

type MessageFactory = Box<dyn FnOnce() -> String + Send>;

/// Error returned by buffer and view operations.
pub struct CmmError {
    kind: ErrorKind,
    message: OnceLock<String>,
    /// Consumed on the first call to `message()`.
    factory: Mutex<Option<MessageFactory>>,
    source: Option<SysError>,
}

impl CmmError {
    /// An error whose message is the kind's own text.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: OnceLock::new(),
            factory: Mutex::new(None),
            source: None,
        }
    }

    /// An error with a fixed message.
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        let err = Self::new(kind);
        let _ = err.message.set(message.into());
        err
    }

    /// An error whose message is built by `factory` on first request.
    ///
    /// The factory runs at most once and never runs if the message is not
    /// read.
    pub fn lazy<F>(kind: ErrorKind, factory: F) -> Self
    where
        F: FnOnce() -> String + Send + 'static,
    {
        Self {
            kind,
            message: OnceLock::new(),
            factory: Mutex::new(Some(Box::new(factory))),
            source: None,
        }
    }

    /// Attaches the backend error that caused this one.
    pub fn with_source(mut self, source: SysError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// The backend error, if any.
    pub fn sys_error(&self) -> Option<&SysError> {
        self.source.as_ref()
    }

    /// Human-readable detail. Built and cached on first call.
    pub fn message(&self) -> &str {
        self.message.get_or_init(|| {
            let factory = self
                .factory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match factory {
                Some(f) => f(),
                None => self.kind.to_string(),
            }
        })
    }
}

impl From<ErrorKind> for CmmError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for CmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message())
    }
}

impl fmt::Debug for CmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmmError")
            .field("kind", &self.kind)
            .field("message", &self.message())
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for CmmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
