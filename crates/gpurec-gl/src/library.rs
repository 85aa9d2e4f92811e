//! Helpers for loading vendor libraries at runtime.
//!
//! The whole GPU stack is opened with `dlopen` semantics: the recorder must
//! run on systems with any of Mesa, the NVIDIA proprietary driver or both
//! installed, and must not fail to start just because one vendor's stack is
//! absent. Each loader tries a list of sonames in order.

use libloading::Library;
use tracing::debug;

use crate::error::{GlError, Result};

/// Open the first library in `candidates` that loads.
///
/// `name` is used for error reporting only.
pub fn open_first(name: &'static str, candidates: &[&str]) -> Result<Library> {
    let mut last_err = None;
    for candidate in candidates {
        // SAFETY: loading a vendor graphics library executes its constructors,
        // which is the documented way to use these stacks.
        match unsafe { Library::new(candidate) } {
            Ok(lib) => {
                debug!("Loaded {} from {}", name, candidate);
                return Ok(lib);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(GlError::LibraryLoad {
        library: name,
        source: last_err.unwrap_or_else(|| libloading::Error::DlOpenUnknown),
    })
}

/// Resolve a required symbol, mapping failure to [`GlError::MissingSymbol`].
///
/// The returned raw function pointer is only valid while `lib` is alive;
/// the runtime keeps every `Library` it loaded for its whole lifetime.
pub fn required<T: Copy>(
    lib: &Library,
    library_name: &'static str,
    symbol: &'static str,
) -> Result<T> {
    // SAFETY: the caller provides the matching function pointer type for the
    // named symbol; signatures are fixed by the EGL/GL specifications.
    unsafe {
        lib.get::<T>(symbol.as_bytes())
            .map(|s| *s)
            .map_err(|_| GlError::MissingSymbol {
                library: library_name,
                symbol,
            })
    }
}

/// Resolve an optional symbol; `None` when absent.
pub fn optional<T: Copy>(lib: &Library, symbol: &str) -> Option<T> {
    // SAFETY: as in `required`; absence is handled by the caller.
    unsafe { lib.get::<T>(symbol.as_bytes()).map(|s| *s).ok() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_first_reports_last_error() {
        let err = open_first("nonexistent", &["libdoes-not-exist-gpurec.so.0"]);
        assert!(matches!(err, Err(GlError::LibraryLoad { library, .. }) if library == "nonexistent"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_open_libc() {
        // libc is always present; proves the candidate walk works.
        let lib = open_first("libc", &["libc.so.6", "libc.so"]);
        assert!(lib.is_ok());
    }
}
