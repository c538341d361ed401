//! Best-effort mapping of captured addresses to symbols.
//!
//! Resolution asks the dynamic linker for the nearest preceding symbol of
//! each address. It is read-only with respect to process state, and a miss on
//! one frame never aborts the rest of the batch.

/// One captured address with whatever the dynamic linker knew about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub address: usize,
    /// Readable name when one was found, demangled when possible.
    pub symbol: Option<String>,
    /// Byte offset of `address` from the start of `symbol`.
    pub offset: isize,
    /// Load address of the containing module, when known.
    pub module_base: Option<usize>,
    /// Path of the containing module, when known.
    pub module_path: Option<String>,
}

impl ResolvedFrame {
    fn unresolved(address: usize) -> ResolvedFrame {
        ResolvedFrame {
            address,
            symbol: None,
            offset: 0,
            module_base: None,
            module_path: None,
        }
    }
}

/// Decodes a compiler-mangled name. `None` keeps the raw name in place, so a
/// resolver is correct even with no decoder at all.
pub type Demangler = fn(&str) -> Option<String>;

/// Default decoder for Rust symbol names. The alternate form drops the
/// trailing disambiguator hash.
pub fn demangle_name(raw: &str) -> Option<String> {
    rustc_demangle::try_demangle(raw)
        .ok()
        .map(|name| format!("{:#}", name))
}

pub struct SymbolResolver {
    demangler: Demangler,
}

impl SymbolResolver {
    pub fn new() -> SymbolResolver {
        SymbolResolver {
            demangler: demangle_name,
        }
    }

    /// Uses `demangler` instead of the default Rust decoder.
    pub fn with_demangler(demangler: Demangler) -> SymbolResolver {
        SymbolResolver { demangler }
    }

    pub fn resolve_all(&self, addresses: &[usize]) -> Vec<ResolvedFrame> {
        addresses
            .iter()
            .map(|&address| self.resolve(address))
            .collect()
    }

    /// Finds the nearest symbol whose start address precedes `address` within
    /// its loaded module.
    #[cfg(unix)]
    pub fn resolve(&self, address: usize) -> ResolvedFrame {
        use std::ffi::CStr;
        use std::mem::MaybeUninit;

        let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
        let rc = unsafe { libc::dladdr(address as *const libc::c_void, info.as_mut_ptr()) };
        if rc == 0 {
            // No loaded module covers this address.
            return ResolvedFrame::unresolved(address);
        }
        let info = unsafe { info.assume_init() };

        let module_base = if info.dli_fbase.is_null() {
            None
        } else {
            Some(info.dli_fbase as usize)
        };
        let module_path = if info.dli_fname.is_null() {
            None
        } else {
            Some(
                unsafe { CStr::from_ptr(info.dli_fname) }
                    .to_string_lossy()
                    .into_owned(),
            )
        };

        if info.dli_sname.is_null() {
            // The module is known but has no symbol covering the address.
            return ResolvedFrame {
                address,
                symbol: None,
                offset: 0,
                module_base,
                module_path,
            };
        }

        let raw = unsafe { CStr::from_ptr(info.dli_sname) }
            .to_string_lossy()
            .into_owned();
        let symbol = (self.demangler)(&raw).unwrap_or(raw);
        let offset = (address as isize).wrapping_sub(info.dli_saddr as isize);

        ResolvedFrame {
            address,
            symbol: Some(symbol),
            offset,
            module_base,
            module_path,
        }
    }

    #[cfg(not(unix))]
    pub fn resolve(&self, address: usize) -> ResolvedFrame {
        ResolvedFrame::unresolved(address)
    }
}

impl Default for SymbolResolver {
    fn default() -> SymbolResolver {
        SymbolResolver::new()
    }
}
