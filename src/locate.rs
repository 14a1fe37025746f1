//! Vendor Library Locator
//!
//! Resolves a vendor library specification (an explicit file path, or a bare
//! name plus a list of search directories) into an absolute path that can be
//! handed to the dynamic binder. Resolution is deterministic: directories are
//! probed in order and the first match wins. A failed resolution reports
//! every candidate path that was probed.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// The library could not be found at any of the probed locations.
#[derive(Debug, Clone, Error)]
#[error("vendor library '{name}' not found; probed: {}", format_probed(.probed))]
pub struct NotFoundError {
    /// The name or path as given by the caller.
    pub name: String,
    /// Every candidate path that was checked, in probe order.
    pub probed: Vec<PathBuf>,
}

fn format_probed(probed: &[PathBuf]) -> String {
    let paths: Vec<String> = probed.iter().map(|p| p.display().to_string()).collect();
    paths.join(", ")
}

/// How to find a vendor library on disk.
///
/// Deployments vary between "the library is at this exact file" and "the
/// library is somewhere on a known path"; both forms are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibrarySpec {
    /// An explicit path to the library file.
    Path(PathBuf),
    /// A bare library name, probed against a list of directories using the
    /// platform's filename conventions.
    Named {
        /// Library name, without platform prefix/suffix (e.g. `snopt7_c`).
        name: String,
        /// Directories to probe, in order.
        search_dirs: Vec<PathBuf>,
    },
}

impl LibrarySpec {
    /// Specify the library by its exact file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        LibrarySpec::Path(path.into())
    }

    /// Specify the library by name, searched in the given directories.
    pub fn named(name: impl Into<String>, search_dirs: Vec<PathBuf>) -> Self {
        LibrarySpec::Named {
            name: name.into(),
            search_dirs,
        }
    }

    /// Specify the library by name, searched in the platform default
    /// directories (see [`default_search_dirs`]).
    pub fn named_on_default_path(name: impl Into<String>) -> Self {
        LibrarySpec::Named {
            name: name.into(),
            search_dirs: default_search_dirs(),
        }
    }

    /// The name or path as given by the caller, for diagnostics.
    pub fn display_name(&self) -> String {
        match self {
            LibrarySpec::Path(p) => p.display().to_string(),
            LibrarySpec::Named { name, .. } => name.clone(),
        }
    }

    /// Resolve the specification to an absolute, existing file path.
    ///
    /// An explicit path is verified directly. A bare name is probed against
    /// each search directory in order for a platform-appropriate filename;
    /// the first existing file wins. The returned path is canonicalized so
    /// that the lifecycle registry keys on a unique per-file identity.
    pub fn resolve(&self) -> Result<PathBuf, NotFoundError> {
        let mut probed = Vec::new();
        match self {
            LibrarySpec::Path(path) => {
                probed.push(path.clone());
                if path.is_file() {
                    if let Ok(canonical) = path.canonicalize() {
                        return Ok(canonical);
                    }
                }
            }
            LibrarySpec::Named { name, search_dirs } => {
                let filename = library_filename(name);
                for dir in search_dirs {
                    let candidate = dir.join(&filename);
                    if candidate.is_file() {
                        if let Ok(canonical) = candidate.canonicalize() {
                            return Ok(canonical);
                        }
                    }
                    probed.push(candidate);
                }
            }
        }
        Err(NotFoundError {
            name: self.display_name(),
            probed,
        })
    }
}

impl From<PathBuf> for LibrarySpec {
    fn from(path: PathBuf) -> Self {
        LibrarySpec::Path(path)
    }
}

impl From<&Path> for LibrarySpec {
    fn from(path: &Path) -> Self {
        LibrarySpec::Path(path.to_path_buf())
    }
}

impl From<&str> for LibrarySpec {
    fn from(path: &str) -> Self {
        LibrarySpec::Path(PathBuf::from(path))
    }
}

/// Construct the platform-specific library filename for a bare name.
///
/// A name that already carries the platform prefix/suffix is used as-is.
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if name.starts_with("lib") && name.contains(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        name.to_string()
    }
}

/// The default library search directories for this platform.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }

    // Standard system paths
    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/lib"));
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/lib"));
        dirs.push(PathBuf::from("/lib64"));
        dirs.push(PathBuf::from("/usr/lib64"));

        // LD_LIBRARY_PATH
        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            for p in ld_path.split(':') {
                dirs.push(PathBuf::from(p));
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/usr/lib"));
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/opt/homebrew/lib"));

        // DYLD_LIBRARY_PATH
        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            for p in dyld_path.split(':') {
                dirs.push(PathBuf::from(p));
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from("C:\\Windows\\System32"));

        // PATH
        if let Ok(path) = std::env::var("PATH") {
            for p in path.split(';') {
                dirs.push(PathBuf::from(p));
            }
        }
    }

    dirs
}
