//! Compiled modules
//!
//! An import compiles the target file inline (into the importing
//! bytecode stream) and records which module-global symbols it
//! defined. Re-importing anywhere later reuses the record, so a
//! module's globals keep the same indices for the whole context.

use crate::symbol_table::Symbol;

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub symbols: Vec<Symbol>,
}

/// Resolve an import path relative to the importing file's directory
/// and pin the source extension.
pub fn canonicalize_import(dir_path: &str, import_path: &str) -> String {
    let mut full = if import_path.starts_with('/') {
        import_path.to_string()
    } else {
        format!("{}{}", dir_path, import_path)
    };
    if !full.ends_with(".brio") {
        full.push_str(".brio");
    }
    full
}

/// The alias prefix for a module's symbols: the last path component.
pub fn module_name(import_path: &str) -> String {
    let base = match import_path.rfind('/') {
        Some(ix) => &import_path[ix + 1..],
        None => import_path,
    };
    match base.strip_suffix(".brio") {
        Some(stem) => stem.to_string(),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_relative() {
        assert_eq!(canonicalize_import("lib/", "util"), "lib/util.brio");
        assert_eq!(canonicalize_import("", "util.brio"), "util.brio");
        assert_eq!(canonicalize_import("lib/", "/abs/util"), "/abs/util.brio");
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("util"), "util");
        assert_eq!(module_name("deep/nested/util"), "util");
        assert_eq!(module_name("util.brio"), "util");
    }
}
