//! Bytecode compiler
//!
//! Walks the AST and emits into a stack of compilation scopes, one
//! per function literal plus one for the file's top level. Loops keep
//! stacks of break/continue jump targets; `break` jumps *to* the
//! loop's exit jump, so the target is known before the loop body ends.
//!
//! Compilation state that must outlive a single `compile` call (the
//! constant pool, the module cache, the module-global index allocator,
//! and the REPL's symbol table) lives in [`CompilerState`], owned by
//! the context.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use brio_core::opcode::write_operand;
use brio_core::{
    BrioError, CompiledBlock, Config, ErrorList, GlobalStore, Heap, ObjData, Opcode, Pos,
    ScriptFunction, Value,
};

use crate::ast::{Expr, ExprKind, FnLit, Ident, IfCase, Operator, Stmt, StmtKind};
use crate::lexer::Lexer;
use crate::module::{canonicalize_import, module_name, Module};
use crate::optimizer::optimize;
use crate::parser::Parser;
use crate::symbol_table::{Symbol, SymbolKind, SymbolTable};

/// Placeholder operand for jumps patched after their target is known.
const PLACEHOLDER: u64 = 0xffff;

type CResult = Result<(), ()>;

/// Compiler state persisted across `compile` calls on one context.
#[derive(Default)]
pub struct CompilerState {
    pub constants: Vec<Value>,
    string_constants: FxHashMap<String, usize>,
    modules: FxHashMap<String, Module>,
    next_module_global: usize,
    global_table: Option<SymbolTable>,
}

impl CompilerState {
    pub fn new() -> CompilerState {
        CompilerState::default()
    }

    pub fn module_global_count(&self) -> usize {
        self.next_module_global
    }

    /// Top-level symbol lookup for the host's `get_object`.
    pub fn global_symbol(&self, name: &str) -> Option<&Symbol> {
        self.global_table.as_ref()?.lookup(name)
    }
}

#[derive(Default)]
struct CompilationScope {
    bytecode: Vec<u8>,
    src_positions: Vec<Pos>,
    break_stack: Vec<usize>,
    continue_stack: Vec<usize>,
    last_opcode: Option<Opcode>,
}

struct FileScope {
    file: Rc<brio_core::CompiledFile>,
    symbol_table: Option<SymbolTable>,
    loaded_modules: Vec<String>,
}

pub struct Compiler<'a> {
    config: &'a Config,
    heap: &'a mut Heap,
    global_store: &'a GlobalStore,
    errors: &'a mut ErrorList,
    state: &'a mut CompilerState,
    scopes: Vec<CompilationScope>,
    file_scopes: Vec<FileScope>,
    src_pos_stack: Vec<Pos>,
    /// Largest local count needed by inlined module top levels.
    extra_locals: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(
        config: &'a Config,
        heap: &'a mut Heap,
        global_store: &'a GlobalStore,
        errors: &'a mut ErrorList,
        state: &'a mut CompilerState,
    ) -> Compiler<'a> {
        Compiler {
            config,
            heap,
            global_store,
            errors,
            state,
            scopes: Vec::new(),
            file_scopes: Vec::new(),
            src_pos_stack: Vec::new(),
            extra_locals: 0,
        }
    }

    /// Compile one file (or REPL line) into the function the VM runs.
    /// Parse or compile errors land in the shared list and yield
    /// `None`.
    pub fn compile(
        &mut self,
        file: Rc<brio_core::CompiledFile>,
        source: &str,
    ) -> Option<ScriptFunction> {
        let table = self.state.global_table.take().unwrap_or_default();
        self.file_scopes.push(FileScope {
            file: Rc::clone(&file),
            symbol_table: Some(table),
            loaded_modules: Vec::new(),
        });
        self.scopes.push(CompilationScope::default());
        self.extra_locals = 0;

        let lexer = Lexer::new(source, Some(file));
        let program = {
            let mut parser = Parser::new(lexer, self.config.repl_mode, &mut *self.errors);
            parser.parse_program()
        };

        let mut ok = !self.errors.has_errors();
        if ok {
            for stmt in &program {
                if self.compile_statement(stmt).is_err() {
                    ok = false;
                    break;
                }
            }
        }

        let scope = self.scopes.pop().expect("compilation scope");
        let file_scope = self.file_scopes.pop().expect("file scope");
        let table = file_scope.symbol_table.expect("symbol table");
        let num_locals = table.max_num_definitions().max(self.extra_locals);
        self.state.global_table = Some(table);

        if !ok || self.errors.has_errors() {
            return None;
        }
        Some(ScriptFunction {
            block: CompiledBlock::new(scope.bytecode, scope.src_positions),
            name: None,
            num_locals,
            num_args: 0,
            free_vals: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn ip(&self) -> usize {
        self.scopes.last().map(|s| s.bytecode.len()).unwrap_or(0)
    }

    fn emit(&mut self, op: Opcode, operands: &[u64]) -> usize {
        let pos = self
            .src_pos_stack
            .last()
            .cloned()
            .unwrap_or_else(Pos::invalid);
        let scope = self.scopes.last_mut().expect("compilation scope");
        let ip = scope.bytecode.len();
        scope.bytecode.push(op as u8);
        scope.src_positions.push(pos.clone());
        let widths = op.def().operand_widths;
        debug_assert_eq!(widths.len(), operands.len());
        for (width, operand) in widths.iter().zip(operands.iter()) {
            let before = scope.bytecode.len();
            write_operand(&mut scope.bytecode, *width, *operand);
            for _ in before..scope.bytecode.len() {
                scope.src_positions.push(pos.clone());
            }
        }
        scope.last_opcode = Some(op);
        ip
    }

    /// Overwrite the first (u16) operand of the instruction at `ip`.
    fn patch_u16_operand(&mut self, instr_ip: usize, value: usize) {
        let scope = self.scopes.last_mut().expect("compilation scope");
        let bytes = (value as u16).to_be_bytes();
        scope.bytecode[instr_ip + 1] = bytes[0];
        scope.bytecode[instr_ip + 2] = bytes[1];
    }

    /// Point the jump at `instr_ip` to the current end of bytecode.
    fn patch_jump_here(&mut self, instr_ip: usize) {
        let target = self.ip();
        self.patch_u16_operand(instr_ip, target);
    }

    fn error(&mut self, message: impl Into<String>, pos: &Pos) {
        self.errors
            .push(BrioError::compilation(message, pos.clone()));
    }

    fn current_pos(&self) -> Pos {
        self.src_pos_stack
            .last()
            .cloned()
            .unwrap_or_else(Pos::invalid)
    }

    // ------------------------------------------------------------------
    // Symbol table plumbing
    // ------------------------------------------------------------------

    fn table(&mut self) -> &mut SymbolTable {
        self.file_scopes
            .last_mut()
            .expect("file scope")
            .symbol_table
            .as_mut()
            .expect("symbol table")
    }

    fn push_fn_table(&mut self) {
        let file_scope = self.file_scopes.last_mut().expect("file scope");
        let table = file_scope.symbol_table.take().expect("symbol table");
        file_scope.symbol_table = Some(SymbolTable::enclosed(table));
    }

    fn pop_fn_table(&mut self) {
        let file_scope = self.file_scopes.last_mut().expect("file scope");
        let table = file_scope.symbol_table.take().expect("symbol table");
        file_scope.symbol_table = Some(table.into_outer().expect("enclosed symbol table"));
    }

    fn define_symbol(&mut self, name: &str, assignable: bool, pos: &Pos) -> Result<Symbol, ()> {
        let store = self.global_store;
        let table = self
            .file_scopes
            .last_mut()
            .expect("file scope")
            .symbol_table
            .as_mut()
            .expect("symbol table");
        match table.define(store, name, assignable, &mut self.state.next_module_global) {
            Ok(symbol) => Ok(symbol),
            Err(message) => {
                self.errors
                    .push(BrioError::compilation(message, pos.clone()));
                Err(())
            }
        }
    }

    fn resolve_symbol(&mut self, name: &str) -> Option<Symbol> {
        let store = self.global_store;
        self.file_scopes
            .last_mut()?
            .symbol_table
            .as_mut()?
            .resolve(store, name)
    }

    fn read_symbol(&mut self, symbol: &Symbol) {
        match symbol.kind {
            SymbolKind::ModuleGlobal => self.emit(Opcode::GetModuleGlobal, &[symbol.index as u64]),
            SymbolKind::HostGlobal => self.emit(Opcode::GetHostGlobal, &[symbol.index as u64]),
            SymbolKind::Local => self.emit(Opcode::GetLocal, &[symbol.index as u64]),
            SymbolKind::Free => self.emit(Opcode::GetFree, &[symbol.index as u64]),
            SymbolKind::FunctionName => self.emit(Opcode::CurrentFunction, &[]),
            SymbolKind::This => self.emit(Opcode::GetThis, &[]),
        };
    }

    fn write_symbol(&mut self, symbol: &Symbol, pos: &Pos) -> CResult {
        match symbol.kind {
            SymbolKind::ModuleGlobal => {
                self.emit(Opcode::SetModuleGlobal, &[symbol.index as u64]);
            }
            SymbolKind::Local => {
                self.emit(Opcode::SetLocal, &[symbol.index as u64]);
            }
            SymbolKind::Free => {
                self.emit(Opcode::SetFree, &[symbol.index as u64]);
            }
            _ => {
                self.error(
                    format!("symbol '{}' is not assignable", symbol.name),
                    pos,
                );
                return Err(());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn compile_statement(&mut self, stmt: &Stmt) -> CResult {
        self.src_pos_stack.push(stmt.pos.clone());
        let result = self.compile_statement_inner(stmt);
        self.src_pos_stack.pop();
        result
    }

    fn compile_statement_inner(&mut self, stmt: &Stmt) -> CResult {
        match &stmt.kind {
            StmtKind::Define {
                name,
                value,
                assignable,
            } => self.compile_define(name, value, *assignable),
            StmtKind::If { cases, alternative } => self.compile_if(cases, alternative.as_deref()),
            StmtKind::Return(value) => self.compile_return(value.as_ref(), &stmt.pos),
            StmtKind::Expression(expr) => {
                self.compile_expression(expr)?;
                self.emit(Opcode::Pop, &[]);
                Ok(())
            }
            StmtKind::While { test, body } => self.compile_while(test, body),
            StmtKind::Break => {
                let target = self
                    .scopes
                    .last()
                    .and_then(|s| s.break_stack.last().copied());
                match target {
                    Some(ip) => {
                        self.emit(Opcode::Jump, &[ip as u64]);
                        Ok(())
                    }
                    None => {
                        self.error("nothing to break from", &stmt.pos);
                        Err(())
                    }
                }
            }
            StmtKind::Continue => {
                let target = self
                    .scopes
                    .last()
                    .and_then(|s| s.continue_stack.last().copied());
                match target {
                    Some(ip) => {
                        self.emit(Opcode::Jump, &[ip as u64]);
                        Ok(())
                    }
                    None => {
                        self.error("nothing to continue", &stmt.pos);
                        Err(())
                    }
                }
            }
            StmtKind::Foreach {
                iterator,
                source,
                body,
            } => self.compile_foreach(iterator, source, body),
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => self.compile_for(init.as_deref(), test.as_ref(), update.as_ref(), body),
            StmtKind::Block(body) => self.compile_block(body),
            StmtKind::Import { path } => self.compile_import(path, &stmt.pos),
            StmtKind::Recover { error_ident, body } => {
                self.compile_recover(error_ident, body, &stmt.pos)
            }
        }
    }

    fn compile_define(&mut self, name: &Ident, value: &Expr, assignable: bool) -> CResult {
        self.compile_expression(value)?;
        let symbol = self.define_symbol(&name.name, assignable, &name.pos)?;
        match symbol.kind {
            SymbolKind::ModuleGlobal => {
                self.emit(Opcode::DefineModuleGlobal, &[symbol.index as u64]);
            }
            SymbolKind::Local => {
                self.check_local_index(symbol.index, &name.pos)?;
                self.emit(Opcode::DefineLocal, &[symbol.index as u64]);
            }
            _ => unreachable!("define yields module-global or local symbols"),
        }
        Ok(())
    }

    fn compile_block(&mut self, body: &[Stmt]) -> CResult {
        self.table().push_block_scope();
        let result = self.compile_statements(body);
        self.table().pop_block_scope();
        result
    }

    fn compile_statements(&mut self, body: &[Stmt]) -> CResult {
        for stmt in body {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    fn compile_if(&mut self, cases: &[IfCase], alternative: Option<&[Stmt]>) -> CResult {
        let mut end_jumps = Vec::new();
        for case in cases {
            self.compile_expression(&case.test)?;
            let skip_case = self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER]);
            self.compile_block(&case.consequence)?;
            end_jumps.push(self.emit(Opcode::Jump, &[PLACEHOLDER]));
            self.patch_jump_here(skip_case);
        }
        if let Some(alt) = alternative {
            self.compile_block(alt)?;
        }
        for jump in end_jumps {
            self.patch_jump_here(jump);
        }
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>, pos: &Pos) -> CResult {
        if self.scopes.len() == 1 {
            self.error("return outside a function", pos);
            return Err(());
        }
        match value {
            Some(expr) => {
                self.compile_expression(expr)?;
                self.emit(Opcode::ReturnValue, &[]);
            }
            None => {
                self.emit(Opcode::Return, &[]);
            }
        }
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt]) -> CResult {
        let start = self.ip();
        self.compile_expression(test)?;
        let to_body = self.emit(Opcode::JumpIfTrue, &[PLACEHOLDER]);
        // `break` jumps to this jump, which jumps past the body.
        let exit_jump = self.emit(Opcode::Jump, &[PLACEHOLDER]);
        self.patch_jump_here(to_body);

        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.break_stack.push(exit_jump);
        scope.continue_stack.push(start);

        let result = self.compile_block(body);

        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.break_stack.pop();
        scope.continue_stack.pop();
        result?;

        self.emit(Opcode::Jump, &[start as u64]);
        self.patch_jump_here(exit_jump);
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &[Stmt],
    ) -> CResult {
        self.table().push_block_scope();
        let result = self.compile_for_inner(init, test, update, body);
        self.table().pop_block_scope();
        result
    }

    fn compile_for_inner(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &[Stmt],
    ) -> CResult {
        if let Some(init) = init {
            self.compile_statement(init)?;
        }
        let to_test = self.emit(Opcode::Jump, &[PLACEHOLDER]);
        let update_ip = self.ip();
        if let Some(update) = update {
            self.compile_expression(update)?;
            self.emit(Opcode::Pop, &[]);
        }
        self.patch_jump_here(to_test);

        match test {
            Some(test) => self.compile_expression(test)?,
            None => {
                self.emit(Opcode::True, &[]);
            }
        }
        let to_body = self.emit(Opcode::JumpIfTrue, &[PLACEHOLDER]);
        let exit_jump = self.emit(Opcode::Jump, &[PLACEHOLDER]);
        self.patch_jump_here(to_body);

        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.break_stack.push(exit_jump);
        scope.continue_stack.push(update_ip);

        let result = self.compile_block(body);

        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.break_stack.pop();
        scope.continue_stack.pop();
        result?;

        self.emit(Opcode::Jump, &[update_ip as u64]);
        self.patch_jump_here(exit_jump);
        Ok(())
    }

    fn compile_foreach(&mut self, iterator: &Ident, source: &Expr, body: &[Stmt]) -> CResult {
        self.table().push_block_scope();
        let result = self.compile_foreach_inner(iterator, source, body);
        self.table().pop_block_scope();
        result
    }

    fn compile_foreach_inner(&mut self, iterator: &Ident, source: &Expr, body: &[Stmt]) -> CResult {
        // The source is evaluated once. A plain identifier is read in
        // place; anything else is stashed in a hidden local.
        let source_symbol = match &source.kind {
            ExprKind::Ident(ident) => match self.resolve_symbol(&ident.name) {
                Some(symbol) => symbol,
                None => {
                    self.error(format!("symbol '{}' not found", ident.name), &ident.pos);
                    return Err(());
                }
            },
            _ => {
                self.compile_expression(source)?;
                let symbol = self.define_symbol("@source", true, &source.pos)?;
                self.check_local_index(symbol.index, &source.pos)?;
                self.emit(Opcode::DefineLocal, &[symbol.index as u64]);
                symbol
            }
        };

        self.emit(Opcode::Number, &[0f64.to_bits()]);
        let i_symbol = self.define_symbol("@i", true, &iterator.pos)?;
        self.check_local_index(i_symbol.index, &iterator.pos)?;
        self.emit(Opcode::DefineLocal, &[i_symbol.index as u64]);

        let to_test = self.emit(Opcode::Jump, &[PLACEHOLDER]);

        // Update: @i = @i + 1
        let update_ip = self.ip();
        self.read_symbol(&i_symbol);
        self.emit(Opcode::Number, &[1f64.to_bits()]);
        self.emit(Opcode::Add, &[]);
        self.write_symbol(&i_symbol, &iterator.pos)?;

        // Test: len(source) == @i leaves the loop.
        self.patch_jump_here(to_test);
        self.read_symbol(&source_symbol);
        self.emit(Opcode::Len, &[]);
        self.read_symbol(&i_symbol);
        self.emit(Opcode::CompareEq, &[]);
        self.emit(Opcode::Equal, &[]);
        let to_body = self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER]);
        // `break` jumps to this jump, which jumps past the body.
        let exit_jump = self.emit(Opcode::Jump, &[PLACEHOLDER]);
        self.patch_jump_here(to_body);

        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.break_stack.push(exit_jump);
        scope.continue_stack.push(update_ip);

        // Bind the user iterator from the source at @i.
        self.read_symbol(&source_symbol);
        self.read_symbol(&i_symbol);
        self.emit(Opcode::GetValueAt, &[]);
        let iter_symbol = self.define_symbol(&iterator.name, true, &iterator.pos)?;
        self.check_local_index(iter_symbol.index, &iterator.pos)?;
        self.emit(Opcode::DefineLocal, &[iter_symbol.index as u64]);

        let result = self.compile_statements(body);

        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.break_stack.pop();
        scope.continue_stack.pop();
        result?;

        self.emit(Opcode::Jump, &[update_ip as u64]);
        self.patch_jump_here(exit_jump);
        Ok(())
    }

    fn compile_recover(&mut self, error_ident: &Ident, body: &[Stmt], pos: &Pos) -> CResult {
        if self.scopes.len() == 1 {
            self.error("recover is only valid inside a function", pos);
            return Err(());
        }
        if !self.table_in_function_top_block() {
            self.error(
                "recover must be at the top level of a function body",
                pos,
            );
            return Err(());
        }
        match body.last() {
            Some(stmt) if matches!(stmt.kind, StmtKind::Return(_)) => {}
            _ => {
                self.error("recover body must end with a return statement", pos);
                return Err(());
            }
        }

        let set_recover = self.emit(Opcode::SetRecover, &[PLACEHOLDER]);
        let over_handler = self.emit(Opcode::Jump, &[PLACEHOLDER]);
        self.patch_jump_here(set_recover);

        // Handler: the VM pushes the error value before jumping here.
        self.table().push_block_scope();
        let result = (|| -> CResult {
            let symbol = self.define_symbol(&error_ident.name, false, &error_ident.pos)?;
            self.check_local_index(symbol.index, &error_ident.pos)?;
            self.emit(Opcode::DefineLocal, &[symbol.index as u64]);
            self.compile_statements(body)
        })();
        self.table().pop_block_scope();
        result?;

        self.patch_jump_here(over_handler);
        Ok(())
    }

    fn table_in_function_top_block(&self) -> bool {
        self.file_scopes
            .last()
            .and_then(|fs| fs.symbol_table.as_ref())
            .map(|t| t.block_depth() == 1)
            .unwrap_or(false)
    }

    fn compile_import(&mut self, path: &str, pos: &Pos) -> CResult {
        let (dir_path, importing_path) = {
            let fs = self.file_scopes.last().expect("file scope");
            (fs.file.dir_path.clone(), fs.file.path.clone())
        };
        let canonical = canonicalize_import(&dir_path, path);
        let name = module_name(path);

        let fs = self.file_scopes.last().expect("file scope");
        if fs.loaded_modules.iter().any(|m| *m == canonical) {
            self.error(format!("module '{}' is already imported", path), pos);
            return Err(());
        }
        if canonical == importing_path
            || self.file_scopes.iter().any(|fs| fs.file.path == canonical)
        {
            self.error(
                format!("cyclic reference to module '{}'", path),
                pos,
            );
            return Err(());
        }

        if !self.state.modules.contains_key(&canonical) {
            let source = match self.config.read_file(&canonical) {
                Ok(src) => src,
                Err(message) => {
                    self.error(
                        format!("cannot import module '{}': {}", path, message),
                        pos,
                    );
                    return Err(());
                }
            };
            debug!(module = %canonical, "compiling imported module");

            let file = brio_core::CompiledFile::new(&canonical);
            self.file_scopes.push(FileScope {
                file: Rc::clone(&file),
                symbol_table: Some(SymbolTable::new()),
                loaded_modules: Vec::new(),
            });

            let lexer = Lexer::new(&source, Some(file));
            let program = {
                let mut parser = Parser::new(lexer, false, &mut *self.errors);
                parser.parse_program()
            };
            let result = if self.errors.has_errors() {
                Err(())
            } else {
                self.compile_statements(&program)
            };

            let module_scope = self.file_scopes.pop().expect("module file scope");
            let table = module_scope.symbol_table.expect("module symbol table");
            self.extra_locals = self.extra_locals.max(table.max_num_definitions());
            result?;

            self.state.modules.insert(
                canonical.clone(),
                Module {
                    name: name.clone(),
                    symbols: table.module_symbols(),
                },
            );
        }

        let module = self.state.modules.get(&canonical).cloned().expect("module");
        for symbol in &module.symbols {
            let alias = format!("{}::{}", module.name, symbol.name);
            self.table().add_module_symbol(&alias, symbol);
        }
        self.file_scopes
            .last_mut()
            .expect("file scope")
            .loaded_modules
            .push(canonical);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn compile_expression(&mut self, expr: &Expr) -> CResult {
        self.src_pos_stack.push(expr.pos.clone());
        let folded = optimize(expr);
        let expr = folded.as_ref().unwrap_or(expr);
        let result = self.compile_expression_inner(expr);
        self.src_pos_stack.pop();
        result
    }

    fn compile_expression_inner(&mut self, expr: &Expr) -> CResult {
        match &expr.kind {
            ExprKind::Ident(ident) => match self.resolve_symbol(&ident.name) {
                Some(symbol) => {
                    self.read_symbol(&symbol);
                    Ok(())
                }
                None => {
                    self.error(format!("symbol '{}' not found", ident.name), &ident.pos);
                    Err(())
                }
            },
            ExprKind::NumberLit(n) => {
                self.emit(Opcode::Number, &[n.to_bits()]);
                Ok(())
            }
            ExprKind::BoolLit(b) => {
                self.emit(if *b { Opcode::True } else { Opcode::False }, &[]);
                Ok(())
            }
            ExprKind::NullLit => {
                self.emit(Opcode::Null, &[]);
                Ok(())
            }
            ExprKind::StringLit(s) => {
                let ix = self.add_string_constant(s, &expr.pos)?;
                self.emit(Opcode::Constant, &[ix as u64]);
                Ok(())
            }
            ExprKind::ArrayLit(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::Array, &[elements.len() as u64]);
                Ok(())
            }
            ExprKind::MapLit { keys, values } => {
                self.emit(Opcode::MapStart, &[keys.len() as u64]);
                for (key, value) in keys.iter().zip(values.iter()) {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::MapEnd, &[keys.len() as u64]);
                Ok(())
            }
            ExprKind::Prefix { op, right } => {
                self.compile_expression(right)?;
                match op {
                    Operator::Minus => self.emit(Opcode::Minus, &[]),
                    Operator::Bang => self.emit(Opcode::Bang, &[]),
                    _ => {
                        self.error(format!("invalid prefix operator '{}'", op), &expr.pos);
                        return Err(());
                    }
                };
                Ok(())
            }
            ExprKind::Infix { op, left, right } => self.compile_infix(*op, left, right, &expr.pos),
            ExprKind::FnLit(fnlit) => self.compile_function_literal(fnlit, &expr.pos),
            ExprKind::Call { function, args } => {
                self.compile_expression(function)?;
                for arg in args {
                    self.compile_expression(arg)?;
                }
                if args.len() > u8::MAX as usize {
                    self.error("too many call arguments", &expr.pos);
                    return Err(());
                }
                self.emit(Opcode::Call, &[args.len() as u64]);
                Ok(())
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::GetIndex, &[]);
                Ok(())
            }
            ExprKind::Assign {
                dest,
                source,
                is_postfix,
            } => self.compile_assign(dest, source, *is_postfix),
            ExprKind::Logical { op, left, right } => {
                self.compile_expression(left)?;
                self.emit(Opcode::Dup, &[]);
                let short_circuit = if *op == Operator::LogicalAnd {
                    self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER])
                } else {
                    self.emit(Opcode::JumpIfTrue, &[PLACEHOLDER])
                };
                self.emit(Opcode::Pop, &[]);
                self.compile_expression(right)?;
                self.patch_jump_here(short_circuit);
                Ok(())
            }
            ExprKind::Ternary {
                test,
                if_true,
                if_false,
            } => {
                self.compile_expression(test)?;
                let to_false = self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER]);
                self.compile_expression(if_true)?;
                let to_end = self.emit(Opcode::Jump, &[PLACEHOLDER]);
                self.patch_jump_here(to_false);
                self.compile_expression(if_false)?;
                self.patch_jump_here(to_end);
                Ok(())
            }
        }
    }

    fn compile_infix(&mut self, op: Operator, left: &Expr, right: &Expr, pos: &Pos) -> CResult {
        // `<` and `<=` do not exist as opcodes: swap the operands and
        // compare the other way around.
        let (opcode, swap) = match op {
            Operator::Plus => (Opcode::Add, false),
            Operator::Minus => (Opcode::Sub, false),
            Operator::Asterisk => (Opcode::Mul, false),
            Operator::Slash => (Opcode::Div, false),
            Operator::Modulus => (Opcode::Mod, false),
            Operator::BitAnd => (Opcode::And, false),
            Operator::BitOr => (Opcode::Or, false),
            Operator::BitXor => (Opcode::Xor, false),
            Operator::Lshift => (Opcode::Lshift, false),
            Operator::Rshift => (Opcode::Rshift, false),
            Operator::Eq => (Opcode::Equal, false),
            Operator::NotEq => (Opcode::NotEqual, false),
            Operator::Gt => (Opcode::GreaterThan, false),
            Operator::Gte => (Opcode::GreaterThanEqual, false),
            Operator::Lt => (Opcode::GreaterThan, true),
            Operator::Lte => (Opcode::GreaterThanEqual, true),
            _ => {
                self.error(format!("invalid infix operator '{}'", op), pos);
                return Err(());
            }
        };
        if swap {
            self.compile_expression(right)?;
            self.compile_expression(left)?;
        } else {
            self.compile_expression(left)?;
            self.compile_expression(right)?;
        }
        match opcode {
            Opcode::Equal | Opcode::NotEqual => {
                self.emit(Opcode::CompareEq, &[]);
            }
            Opcode::GreaterThan | Opcode::GreaterThanEqual => {
                self.emit(Opcode::Compare, &[]);
            }
            _ => {}
        }
        self.emit(opcode, &[]);
        Ok(())
    }

    fn compile_assign(&mut self, dest: &Expr, source: &Expr, is_postfix: bool) -> CResult {
        match &dest.kind {
            ExprKind::Ident(ident) => {
                // Implicit declaration: assigning to an unknown name
                // defines it on the spot.
                let symbol = match self.resolve_symbol(&ident.name) {
                    Some(symbol) => symbol,
                    None => self.define_symbol(&ident.name, true, &ident.pos)?,
                };
                if !symbol.assignable {
                    self.error(
                        format!("symbol '{}' is not assignable", ident.name),
                        &ident.pos,
                    );
                    return Err(());
                }
                if is_postfix {
                    self.read_symbol(&symbol);
                }
                self.compile_expression(source)?;
                if !is_postfix {
                    self.emit(Opcode::Dup, &[]);
                }
                self.write_symbol(&symbol, &ident.pos)
            }
            ExprKind::Index { left, index } => {
                if is_postfix {
                    self.compile_expression(left)?;
                    self.compile_expression(index)?;
                    self.emit(Opcode::GetIndex, &[]);
                }
                self.compile_expression(source)?;
                if !is_postfix {
                    self.emit(Opcode::Dup, &[]);
                }
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::SetIndex, &[]);
                Ok(())
            }
            _ => {
                self.error("invalid assignment target", &dest.pos);
                Err(())
            }
        }
    }

    fn compile_function_literal(&mut self, fnlit: &FnLit, pos: &Pos) -> CResult {
        self.push_fn_table();
        self.scopes.push(CompilationScope::default());

        let result = (|| -> CResult {
            if let Some(name) = &fnlit.name {
                self.table().define_function_name(name);
            }
            self.table().define_this();
            for param in &fnlit.params {
                let symbol = self.define_symbol(&param.name, true, &param.pos)?;
                self.check_local_index(symbol.index, &param.pos)?;
            }
            self.compile_statements(&fnlit.body)?;
            let last = self.scopes.last().and_then(|s| s.last_opcode);
            if !matches!(last, Some(Opcode::Return) | Some(Opcode::ReturnValue)) {
                self.emit(Opcode::Return, &[]);
            }
            Ok(())
        })();

        let num_locals = self.table().max_num_definitions();
        let free_symbols = self.table().free_symbols().to_vec();
        let scope = self.scopes.pop().expect("function compilation scope");
        self.pop_fn_table();
        result?;

        let prototype = ScriptFunction {
            block: CompiledBlock::new(scope.bytecode, scope.src_positions),
            name: fnlit.name.clone(),
            num_locals,
            num_args: fnlit.params.len(),
            free_vals: Vec::new(),
        };
        let value = self.heap.alloc(ObjData::Function(prototype));
        self.state.constants.push(value);
        let fn_ix = self.state.constants.len() - 1;
        if fn_ix > u16::MAX as usize {
            self.error("constant pool overflow", pos);
            return Err(());
        }

        // Load each captured value in the enclosing scope, then build
        // the closure from them.
        for free in &free_symbols {
            self.read_symbol(free);
        }
        if free_symbols.len() > u8::MAX as usize {
            self.error("too many captured variables", pos);
            return Err(());
        }
        self.emit(Opcode::Function, &[fn_ix as u64, free_symbols.len() as u64]);
        Ok(())
    }

    fn add_string_constant(&mut self, s: &str, pos: &Pos) -> Result<usize, ()> {
        if let Some(&ix) = self.state.string_constants.get(s) {
            return Ok(ix);
        }
        let value = self.heap.alloc_string(s);
        self.state.constants.push(value);
        let ix = self.state.constants.len() - 1;
        if ix > u16::MAX as usize {
            self.error("constant pool overflow", pos);
            return Err(());
        }
        self.state.string_constants.insert(s.to_string(), ix);
        Ok(ix)
    }

    fn check_local_index(&mut self, index: usize, pos: &Pos) -> CResult {
        if index > u8::MAX as usize {
            self.error("too many local variables", pos);
            return Err(());
        }
        Ok(())
    }
}
