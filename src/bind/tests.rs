//! Binder and lifecycle tests.
//!
//! Dlopen-dependent cases run against libc, which is always present on
//! Linux; they are skipped elsewhere.

use super::*;
use std::path::Path;

#[test]
fn open_count_is_zero_for_unknown_paths() {
    assert_eq!(open_count(Path::new("/no/such/library.so")), 0);
}

#[test]
fn open_failure_reports_the_path() {
    let path = Path::new("/no/such/library.so");
    let err = acquire(path).unwrap_err();
    match err {
        BindError::Open { path: p, .. } => assert_eq!(p, path),
        other => panic!("expected Open error, got {other:?}"),
    }
    assert_eq!(open_count(path), 0);
}

#[cfg(target_os = "linux")]
mod with_libc {
    use super::super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    // The tests below observe libc's reference count; serialise them so one
    // test's handles do not show up in another's counts.
    static COUNTING: Mutex<()> = Mutex::new(());

    fn libc_path() -> Option<PathBuf> {
        ["/lib/x86_64-linux-gnu/libc.so.6", "/usr/lib64/libc.so.6", "/lib64/libc.so.6"]
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .and_then(|p| p.canonicalize().ok())
    }

    #[test]
    fn bind_resolves_all_required_symbols() {
        let _guard = COUNTING.lock().unwrap();
        let Some(path) = libc_path() else { return };

        let table = bind(&path, &["malloc", "free", "getpid"]).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.addr("malloc").is_some());
        assert!(table.addr("getpid").is_some());
        assert!(table.addr("not_bound").is_none());
        assert_eq!(table.path(), path);
    }

    #[test]
    fn missing_symbol_aborts_bind_and_releases_the_image() {
        let _guard = COUNTING.lock().unwrap();
        let Some(path) = libc_path() else { return };

        let before = open_count(&path);
        let err = bind(&path, &["malloc", "definitely_not_a_libc_symbol"]).unwrap_err();
        match err {
            BindError::MissingSymbol { symbol, .. } => {
                assert_eq!(symbol, "definitely_not_a_libc_symbol")
            }
            other => panic!("expected MissingSymbol, got {other:?}"),
        }
        assert_eq!(open_count(&path), before);
    }

    #[test]
    fn reacquiring_the_same_path_shares_one_handle() {
        let _guard = COUNTING.lock().unwrap();
        let Some(path) = libc_path() else { return };

        let before = open_count(&path);
        let a = acquire(&path).unwrap();
        let b = acquire(&path).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(open_count(&path), before + 2);

        drop(a);
        assert_eq!(open_count(&path), before + 1);
        drop(b);
        assert_eq!(open_count(&path), before);
    }

    #[test]
    fn concurrent_acquisition_never_duplicates_the_image() {
        let _guard = COUNTING.lock().unwrap();
        let Some(path) = libc_path() else { return };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || acquire(&path).unwrap())
            })
            .collect();

        let libs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for lib in &libs[1..] {
            assert!(std::sync::Arc::ptr_eq(&libs[0], lib));
        }
    }

    #[test]
    fn invalid_symbol_name_is_rejected() {
        let _guard = COUNTING.lock().unwrap();
        let Some(path) = libc_path() else { return };

        let err = bind(&path, &["bad\0name"]).unwrap_err();
        assert!(matches!(err, BindError::InvalidName(_)));
    }
}
