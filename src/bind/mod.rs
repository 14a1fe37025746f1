//! Dynamic Binder and Library Lifecycle
//!
//! Opens a resolved vendor library image and resolves a declared set of
//! required entry points into an immutable symbol table. Binding is atomic:
//! either every required symbol resolves, or no table is constructed and the
//! just-opened image is released.
//!
//! # Architecture
//!
//! ```text
//! LibrarySpec::resolve()
//!       │
//!       ▼
//! bind(path, REQUIRED_SYMBOLS)
//!       │
//!       ├── acquire(path)      ref-counted, one open handle per path
//!       │
//!       ├── resolve each name  any miss drops the handle again
//!       │
//!       ▼
//! SymbolTable ──► typed vendor API struct (fn pointers)
//! ```
//!
//! Open images are reference-counted per absolute path: vendor libraries are
//! not generally safe to dlopen twice in one process, so re-binding the same
//! path reuses the already-open handle. The OS-level close happens exactly
//! once, when the last owner drops its reference. On abnormal process
//! termination the OS reclaims the handle; no close is attempted.

mod library;
mod table;

pub use library::{acquire, open_count, SharedLibrary};
pub use table::{bind, SymbolTable};

use std::path::PathBuf;

use thiserror::Error;

/// A failure while opening a library image or resolving its symbols.
#[derive(Debug, Clone, Error)]
pub enum BindError {
    /// The OS-level open failed (missing dependencies, architecture
    /// mismatch, permissions, not a shared library at all).
    #[error("failed to open vendor library '{path}': {reason}")]
    Open {
        /// Path of the image that failed to open.
        path: PathBuf,
        /// The loader's own description of the failure.
        reason: String,
    },

    /// A required symbol is absent from the image.
    #[error("symbol '{symbol}' not found in '{path}': {reason}")]
    MissingSymbol {
        /// Path of the opened image.
        path: PathBuf,
        /// The missing entry point.
        symbol: String,
        /// The loader's own description of the failure.
        reason: String,
    },

    /// A symbol name contained an interior NUL byte.
    #[error("invalid symbol name: {0}")]
    InvalidName(String),

    /// The library declares a version this plugin does not support.
    #[error("vendor library '{path}' declares version {found}, supported: {supported}")]
    VersionMismatch {
        /// Path of the opened image.
        path: PathBuf,
        /// Version string reported by the library.
        found: String,
        /// Version string this plugin was built against.
        supported: String,
    },
}

#[cfg(test)]
mod tests;
