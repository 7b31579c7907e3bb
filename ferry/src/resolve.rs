use std::collections::HashMap;
use std::ffi::{OsString, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::RwLock;

use crate::CodeAddress;

pub trait SymbolResolver: Send + Sync {
    fn lookup(&self, library: &str, symbol: &str) -> Option<CodeAddress>;
}

/// Resolver over explicitly registered entry points.
///
/// Symbols registered without a library answer lookups for every library.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: RwLock<HashMap<(String, String), CodeAddress>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, symbol: &str, code: CodeAddress) {
        self.register_in("", symbol, code);
    }

    pub fn register_in(&self, library: &str, symbol: &str, code: CodeAddress) {
        self.symbols
            .write()
            .insert((library.to_string(), symbol.to_string()), code);
    }
}

impl SymbolResolver for SymbolTable {
    fn lookup(&self, library: &str, symbol: &str) -> Option<CodeAddress> {
        let symbols = self.symbols.read();
        symbols
            .get(&(library.to_string(), symbol.to_string()))
            .or_else(|| symbols.get(&(String::new(), symbol.to_string())))
            .copied()
    }
}

/// Resolver over shared libraries loaded on first use.
///
/// Loaded libraries stay open for the lifetime of the resolver.
#[derive(Debug, Default)]
pub struct DynamicLibraries {
    search_paths: Vec<PathBuf>,
    loaded: RwLock<HashMap<String, Arc<Library>>>,
}

impl DynamicLibraries {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// File names tried for `name`, most specific first.
    pub fn candidates(&self, name: &str) -> Vec<OsString> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.extension().is_some() {
            return vec![OsString::from(name)];
        }
        let platform_name = libloading::library_filename(name);
        let mut names = Vec::new();
        for dir in &self.search_paths {
            names.push(dir.join(&platform_name).into_os_string());
            names.push(dir.join(name).into_os_string());
        }
        names.push(platform_name);
        names.push(OsString::from(name));
        names
    }

    fn load(&self, name: &str) -> Option<Arc<Library>> {
        if let Some(library) = self.loaded.read().get(name) {
            return Some(Arc::clone(library));
        }

        let mut last_error = None;
        for candidate in self.candidates(name) {
            // SAFETY: running library initializers is inherent to binding
            match unsafe { Library::new(&candidate) } {
                Ok(library) => {
                    log::debug!("loaded library `{name}` from {candidate:?}");
                    let library = Arc::new(library);
                    let mut loaded = self.loaded.write();
                    let entry = loaded
                        .entry(name.to_string())
                        .or_insert_with(|| Arc::clone(&library));
                    return Some(Arc::clone(entry));
                }
                Err(err) => last_error = Some(err),
            }
        }
        log::warn!(
            "failed to load library `{name}`: {}",
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no candidates".to_string())
        );
        None
    }
}

impl SymbolResolver for DynamicLibraries {
    fn lookup(&self, library: &str, symbol: &str) -> Option<CodeAddress> {
        let loaded = self.load(library)?;
        // SAFETY: the symbol is only used as an address
        let address = unsafe {
            loaded
                .get::<*const c_void>(symbol.as_bytes())
                .map(|sym| *sym as usize)
        };
        match address {
            Ok(0) => None,
            Ok(address) => {
                log::debug!(
                    "resolved `{symbol}` in `{library}` at {address:#x}"
                );
                Some(CodeAddress::new(address))
            }
            Err(err) => {
                log::debug!("`{symbol}` not found in `{library}`: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_falls_back_to_unscoped_symbols() {
        let table = SymbolTable::new();
        table.register("simple", CodeAddress::new(0x1000));
        table.register_in("jfa", "simple", CodeAddress::new(0x2000));

        assert_eq!(
            table.lookup("jfa", "simple"),
            Some(CodeAddress::new(0x2000))
        );
        assert_eq!(
            table.lookup("other", "simple"),
            Some(CodeAddress::new(0x1000))
        );
        assert_eq!(table.lookup("jfa", "missing"), None);
    }

    #[test]
    fn candidates_use_search_paths_and_platform_names() {
        let libraries = DynamicLibraries::new(vec![PathBuf::from("/opt/lib")]);
        let names = libraries.candidates("validity");
        let platform_name = libloading::library_filename("validity");
        assert_eq!(
            names.first(),
            Some(
                &PathBuf::from("/opt/lib")
                    .join(&platform_name)
                    .into_os_string()
            )
        );
        assert!(names.contains(&platform_name));
        assert_eq!(names.last(), Some(&OsString::from("validity")));

        assert_eq!(
            libraries.candidates("/usr/lib/libm.so.6"),
            vec![OsString::from("/usr/lib/libm.so.6")]
        );
    }

    #[test]
    fn missing_library_resolves_nothing() {
        let libraries = DynamicLibraries::default();
        assert_eq!(
            libraries.lookup("ferry_definitely_missing_library", "main"),
            None
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolves_libc_symbols() {
        let libraries = DynamicLibraries::default();
        assert!(libraries.lookup("libc.so.6", "strlen").is_some());
        assert!(
            libraries
                .lookup("libc.so.6", "ferry_no_such_symbol")
                .is_none()
        );
    }
}
