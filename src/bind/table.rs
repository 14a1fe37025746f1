//! Atomic symbol resolution into an immutable table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::library::{acquire, SharedLibrary};
use super::BindError;

/// The resolved entry points of one vendor library.
///
/// Constructed atomically by [`bind`]: every required symbol resolved, or no
/// table at all. The table keeps the underlying image open for its whole
/// lifetime, so the addresses it hands out stay valid while it (or a typed
/// API struct built from it) is alive.
pub struct SymbolTable {
    library: Arc<SharedLibrary>,
    symbols: HashMap<String, usize>,
}

impl SymbolTable {
    /// Raw address of a resolved symbol, if it was in the required set.
    pub fn addr(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    /// Raw address of a resolved symbol, failing with the binder's own
    /// missing-symbol error. Used by the typed API constructors.
    pub(crate) fn require(&self, name: &str) -> Result<usize, BindError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| BindError::MissingSymbol {
                path: self.library.path().to_path_buf(),
                symbol: name.to_string(),
                reason: "symbol was not in the bound set".to_string(),
            })
    }

    /// Path of the underlying image.
    pub fn path(&self) -> &Path {
        self.library.path()
    }

    /// Number of resolved symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The shared handle keeping the image open.
    pub fn library(&self) -> &Arc<SharedLibrary> {
        &self.library
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("path", &self.library.path())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

/// Open `path` and resolve every name in `required`.
///
/// Any single failure aborts the whole bind; the freshly acquired handle is
/// dropped again, so a failed bind leaves the lifecycle reference count
/// exactly where it was.
pub fn bind(path: &Path, required: &[&str]) -> Result<SymbolTable, BindError> {
    let library = acquire(path)?;

    let mut symbols = HashMap::with_capacity(required.len());
    for name in required {
        // The `?` here drops `library` on a miss, releasing the image
        // unless another owner still holds it.
        let addr = library.symbol_addr(name)?;
        symbols.insert((*name).to_string(), addr);
    }

    Ok(SymbolTable { library, symbols })
}
