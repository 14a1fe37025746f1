//! Reference-counted open library handles.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::BindError;

/// Open images per canonical path. Holding `Weak` here keeps the registry
/// from pinning a library open: the last `Arc` owner closes it.
static LOADED: Lazy<Mutex<HashMap<PathBuf, Weak<SharedLibrary>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// One open vendor library image.
///
/// At most one `SharedLibrary` exists per canonical path per process;
/// additional acquisitions share it by reference. The OS handle is closed
/// when the last `Arc<SharedLibrary>` is dropped.
pub struct SharedLibrary {
    path: PathBuf,
    library: Library,
}

impl SharedLibrary {
    /// Path of the open image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a symbol to its raw address.
    ///
    /// The address is only meaningful while this library stays open; callers
    /// keep the owning `Arc` alive for as long as they hold the address.
    pub(crate) fn symbol_addr(&self, name: &str) -> Result<usize, BindError> {
        let c_name =
            CString::new(name).map_err(|_| BindError::InvalidName(name.to_string()))?;

        // Safety: the symbol is looked up by name only; type safety is the
        // responsibility of the typed API structs built on top of the table.
        let symbol: Symbol<*const ()> = unsafe {
            self.library
                .get(c_name.as_bytes_with_nul())
                .map_err(|e| BindError::MissingSymbol {
                    path: self.path.clone(),
                    symbol: name.to_string(),
                    reason: e.to_string(),
                })?
        };

        Ok(*symbol as usize)
    }
}

impl Drop for SharedLibrary {
    fn drop(&mut self) {
        let mut loaded = LOADED.lock();
        // Only purge the entry if it is actually dead: a concurrent acquire
        // may already have replaced it with a freshly opened image.
        if let Some(weak) = loaded.get(&self.path) {
            if weak.strong_count() == 0 {
                loaded.remove(&self.path);
            }
        }
    }
}

impl std::fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLibrary")
            .field("path", &self.path)
            .finish()
    }
}

/// Acquire a reference to the open image at `path`, opening it if needed.
///
/// Safe to call concurrently from independent adapters on the same path:
/// the registry lock serialises open/close so two threads never race a
/// duplicate dlopen of the same file.
pub fn acquire(path: &Path) -> Result<Arc<SharedLibrary>, BindError> {
    let mut loaded = LOADED.lock();

    if let Some(existing) = loaded.get(path).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    // Safety: loading a shared library runs its initialisers; the caller
    // vouches for the file by naming it as the vendor library.
    let library = unsafe {
        Library::new(path).map_err(|e| BindError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    let shared = Arc::new(SharedLibrary {
        path: path.to_path_buf(),
        library,
    });
    loaded.insert(path.to_path_buf(), Arc::downgrade(&shared));

    Ok(shared)
}

/// Number of live references to the open image at `path` (0 if not open).
///
/// Diagnostic only; the value may be stale by the time it is observed.
pub fn open_count(path: &Path) -> usize {
    LOADED
        .lock()
        .get(path)
        .map(Weak::strong_count)
        .unwrap_or(0)
}
