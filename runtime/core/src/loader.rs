// SPDX-License-Identifier: GPL-3.0-or-later
//! Binds a fixed set of symbols from a vendor TEE client library into a dispatch table.
//! Any missing symbol drops the library and fails; the returned handle owns the library and
//! unloads it on drop.

use crate::error::{ExecutorError, Result};
use libloading::Library;

/// A vendor library together with the dispatch table bound from it. `T` is a struct of raw
/// `extern "C"` function pointers copied out of the library at bind time, so callers never
/// hold a `libloading::Symbol` borrow past the bind call.
pub struct VendorLibrary<T> {
    // Order matters: `ops` must drop before `library` is allowed to unload, which is
    // guaranteed by declaration order since `T` holds plain function pointers with no
    // borrow of `library` itself.
    pub ops: T,
    _library: Library,
}

impl<T> VendorLibrary<T> {
    /// Load `path` and run `bind` against it to build the dispatch table. If `bind` fails
    /// (a symbol is missing), the library is dropped and unloaded.
    pub fn load(path: &str, bind: impl FnOnce(&Library) -> Result<T>) -> Result<Self> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| ExecutorError::VendorLibrary(format!("failed to load {path}: {e}")))?;
        let ops = bind(&library)?;
        Ok(Self { ops, _library: library })
    }
}

/// Look up a single symbol by name, mapping a miss to the vendor-library error kind.
///
/// # Safety
/// The caller must ensure `F` matches the actual signature of the symbol named `name` in
/// `library`; a mismatch is undefined behavior, exactly as with any other FFI binding.
pub unsafe fn bind_symbol<F: Copy>(library: &Library, name: &str) -> Result<F> {
    let symbol_name = format!("{name}\0");
    let symbol = library
        .get::<F>(symbol_name.as_bytes())
        .map_err(|e| ExecutorError::VendorLibrary(format!("symbol '{name}' not found: {e}")))?;
    Ok(*symbol)
}
