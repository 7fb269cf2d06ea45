//! Symbol tables
//!
//! One table per function literal, chained to the enclosing
//! function's table; each table stacks block scopes for `{}` nesting.
//! Resolution walks host globals first, then the local block scopes,
//! then the outer chain, capturing anything non-global found in an
//! outer table as a free variable of the current function.

use rustc_hash::FxHashMap;

use brio_core::GlobalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Top-level definition of a module, stored in the VM globals
    /// array at a module-wide index.
    ModuleGlobal,
    /// Stack slot relative to the frame's base pointer.
    Local,
    /// Host-provided global (builtin or constant).
    HostGlobal,
    /// Captured from an enclosing function; index into the closure's
    /// free-value buffer.
    Free,
    /// The enclosing function literal's own name; reads compile to
    /// `CurrentFunction` so recursion needs no capture.
    FunctionName,
    /// The map literal currently under construction.
    This,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub index: usize,
    pub assignable: bool,
}

#[derive(Debug, Default)]
struct BlockScope {
    store: FxHashMap<String, Symbol>,
    /// Cumulative local index base: the sum of definitions in the
    /// scopes below this one.
    offset: usize,
    num_definitions: usize,
}

#[derive(Debug)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    block_scopes: Vec<BlockScope>,
    free_symbols: Vec<Symbol>,
    /// High-water mark of local slots; becomes the function's
    /// `num_locals`.
    max_num_definitions: usize,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            outer: None,
            block_scopes: vec![BlockScope::default()],
            free_symbols: Vec::new(),
            max_num_definitions: 0,
        }
    }

    /// Chain a fresh table for a nested function literal onto `outer`.
    pub fn enclosed(outer: SymbolTable) -> SymbolTable {
        let mut table = SymbolTable::new();
        table.outer = Some(Box::new(outer));
        table
    }

    /// Unchain, returning the enclosing table.
    pub fn into_outer(self) -> Option<SymbolTable> {
        self.outer.map(|b| *b)
    }

    pub fn push_block_scope(&mut self) {
        let offset = match self.block_scopes.last() {
            Some(top) => top.offset + top.num_definitions,
            None => 0,
        };
        self.block_scopes.push(BlockScope {
            store: FxHashMap::default(),
            offset,
            num_definitions: 0,
        });
    }

    pub fn pop_block_scope(&mut self) {
        self.block_scopes.pop();
    }

    /// True for the outermost block of the outermost table, where
    /// definitions become module globals.
    pub fn is_module_global_scope(&self) -> bool {
        self.outer.is_none() && self.block_scopes.len() == 1
    }

    pub fn max_num_definitions(&self) -> usize {
        self.max_num_definitions
    }

    /// Number of block scopes currently open in this table.
    pub fn block_depth(&self) -> usize {
        self.block_scopes.len()
    }

    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free_symbols
    }

    /// Define a name in the current block scope. Module-global
    /// indices come from the caller's allocator so imports landing in
    /// the same globals array never collide.
    pub fn define(
        &mut self,
        store: &GlobalStore,
        name: &str,
        assignable: bool,
        next_module_global: &mut usize,
    ) -> Result<Symbol, String> {
        if name.contains("::") {
            return Err(format!("'{}' is an invalid name", name));
        }
        if name == "this" {
            return Err("'this' is a reserved name".to_string());
        }
        if store.index_of(name).is_some() {
            return Err(format!("'{}' shadows a host global", name));
        }
        let symbol = if self.is_module_global_scope() {
            let ix = *next_module_global;
            *next_module_global += 1;
            Symbol {
                kind: SymbolKind::ModuleGlobal,
                name: name.to_string(),
                index: ix,
                assignable,
            }
        } else {
            let top = self
                .block_scopes
                .last_mut()
                .expect("symbol table has no block scope");
            let ix = top.offset + top.num_definitions;
            top.num_definitions += 1;
            let definitions = top.offset + top.num_definitions;
            if definitions > self.max_num_definitions {
                self.max_num_definitions = definitions;
            }
            Symbol {
                kind: SymbolKind::Local,
                name: name.to_string(),
                index: ix,
                assignable,
            }
        };
        self.set(symbol.clone());
        Ok(symbol)
    }

    /// Self-reference symbol for a named function literal. Carries no
    /// slot; reads compile to `CurrentFunction`.
    pub fn define_function_name(&mut self, name: &str) {
        self.set(Symbol {
            kind: SymbolKind::FunctionName,
            name: name.to_string(),
            index: 0,
            assignable: false,
        });
    }

    /// The implicit `this` binding every function scope carries.
    pub fn define_this(&mut self) {
        self.set(Symbol {
            kind: SymbolKind::This,
            name: "this".to_string(),
            index: 0,
            assignable: false,
        });
    }

    /// Expose an imported module's symbol under its qualified alias.
    pub fn add_module_symbol(&mut self, alias: &str, original: &Symbol) {
        let mut symbol = original.clone();
        symbol.name = alias.to_string();
        self.set(symbol);
    }

    fn set(&mut self, symbol: Symbol) {
        self.block_scopes
            .last_mut()
            .expect("symbol table has no block scope")
            .store
            .insert(symbol.name.clone(), symbol);
    }

    pub fn resolve(&mut self, store: &GlobalStore, name: &str) -> Option<Symbol> {
        if let Some(ix) = store.index_of(name) {
            return Some(Symbol {
                kind: SymbolKind::HostGlobal,
                name: name.to_string(),
                index: ix,
                assignable: false,
            });
        }
        if let Some(symbol) = self.resolve_in_blocks(name) {
            return Some(symbol);
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(store, name)?;
        match symbol.kind {
            SymbolKind::ModuleGlobal | SymbolKind::HostGlobal => Some(symbol),
            // Anything frame-relative in an enclosing function (a
            // local, its `this`, its own free variables, or its name)
            // must be captured at closure construction time.
            _ => Some(self.define_free(&symbol)),
        }
    }

    /// Non-capturing lookup in this table's own block scopes.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.block_scopes
            .iter()
            .rev()
            .find_map(|scope| scope.store.get(name))
    }

    fn resolve_in_blocks(&self, name: &str) -> Option<Symbol> {
        for scope in self.block_scopes.iter().rev() {
            if let Some(symbol) = scope.store.get(name) {
                return Some(symbol.clone());
            }
        }
        None
    }

    fn define_free(&mut self, original: &Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol {
            kind: SymbolKind::Free,
            name: original.name.clone(),
            index: self.free_symbols.len() - 1,
            assignable: original.assignable,
        };
        self.set(symbol.clone());
        symbol
    }

    /// The module-global symbols of this table, sorted by index; used
    /// to build the module record after compiling an import.
    pub fn module_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .block_scopes
            .first()
            .map(|scope| {
                scope
                    .store
                    .values()
                    .filter(|s| s.kind == SymbolKind::ModuleGlobal)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        symbols.sort_by_key(|s| s.index);
        symbols
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}
