//! AST-to-bytecode compiler: a single-pass tree walker that emits into a
//! stack of [`CompilationScope`]s, one per function currently being
//! compiled, each with its own loop-context stack for `break`/`continue`.
//!
//! One constant pool is shared by the whole compilation (see
//! [`CompiledProgram`]): string literals and function templates are interned
//! into it in order of appearance and referenced from bytecode by index.
//!
//! Stack-effect convention every emission below assumes: every expression
//! leaves exactly one value on the operand stack; `ExpressionStmt` compiles
//! its expression and then pops it. `SET_*`/`SET_INDEX` store and leave the
//! assigned value in place (so assignment composes as an expression);
//! `DEFINE_*` consumes the initializer with no value left behind, since
//! `var`/`const` are statements, not expressions.

use crate::ast::{Expression, InfixOp, LogicalOp, PrefixOp, Program, SourceLocation, Statement};
use crate::parser::Parser;
use crate::symbol_table::{GlobalStore, Symbol, SymbolScope, SymbolTable};
use loom_core::{Bytecode, Chunk, ErrorKind, ErrorList, FunctionObject, Heap, LangError, Opcode, SourcePosition, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A fully compiled program: the top-level chunk (conceptually a function
/// named `"main"` taking no arguments) plus the constant pool every chunk
/// reachable from it indexes into.
#[derive(Debug)]
pub struct CompiledProgram {
    pub chunk: Rc<Chunk>,
    pub constants: Vec<Value>,
    /// Every `var`/`const` defined at module top level, so an embedder can
    /// look a name up by index after running the program (e.g. to call a
    /// top-level function) without re-parsing source.
    pub module_globals: Vec<Symbol>,
}

struct LoopContext {
    break_ips: Vec<usize>,
    /// Known immediately for `while`/classic `for` (the test/update IP).
    /// Left `None` for `foreach`, whose continue target (the index
    /// increment) isn't known until after the body has been compiled; in
    /// that case `continue` emits a placeholder recorded in `continue_ips`
    /// and patched once the target is known.
    continue_target: Option<usize>,
    continue_ips: Vec<usize>,
}

struct CompilationScope {
    bytecode: Bytecode,
    loops: Vec<LoopContext>,
    name: Option<String>,
    num_params: u8,
}

impl CompilationScope {
    fn new(name: Option<String>, num_params: u8) -> Self {
        Self {
            bytecode: Bytecode::default(),
            loops: Vec::new(),
            name,
            num_params,
        }
    }
}

/// Snapshot of everything a failed `compile` call needs to roll back, so a
/// REPL session (or any caller compiling one fragment after another) can
/// recover cleanly rather than continuing from half-mutated state.
struct Snapshot {
    constants_len: usize,
    loaded_modules: Vec<PathBuf>,
}

pub type ReadFileFn = dyn Fn(&Path) -> std::io::Result<String>;

pub struct Compiler<'h> {
    heap: &'h mut Heap,
    globals: Rc<RefCell<GlobalStore>>,
    module_global_counter: Rc<RefCell<u16>>,
    constants: Vec<Value>,
    symbol_table: Rc<RefCell<SymbolTable>>,
    scopes: Vec<CompilationScope>,
    errors: ErrorList,
    loaded_modules: HashMap<PathBuf, Vec<Symbol>>,
    file_stack: Vec<PathBuf>,
    current_file: Option<PathBuf>,
    read_file: Option<Box<ReadFileFn>>,
}

impl<'h> Compiler<'h> {
    pub fn new(heap: &'h mut Heap, globals: Rc<RefCell<GlobalStore>>) -> Self {
        let module_global_counter = Rc::new(RefCell::new(0u16));
        let symbol_table = Rc::new(RefCell::new(SymbolTable::new_module_table(
            globals.clone(),
            module_global_counter.clone(),
        )));
        Self {
            heap,
            globals,
            module_global_counter,
            constants: Vec::new(),
            symbol_table,
            scopes: vec![CompilationScope::new(Some("main".to_string()), 0)],
            errors: ErrorList::default(),
            loaded_modules: HashMap::new(),
            file_stack: Vec::new(),
            current_file: None,
            read_file: None,
        }
    }

    /// Installs the embedder's file reader, enabling `import "path"` to
    /// actually resolve sources rather than failing closed.
    pub fn with_file_reader(mut self, read_file: Box<ReadFileFn>) -> Self {
        self.read_file = Some(read_file);
        self
    }

    pub fn compile(&mut self, program: &Program, file: Option<PathBuf>) -> Result<CompiledProgram, ErrorList> {
        let snapshot = self.snapshot();
        self.current_file = file;
        for stmt in &program.statements {
            self.compile_statement(stmt);
        }
        if !self.errors.is_empty() {
            self.restore(snapshot);
            return Err(std::mem::take(&mut self.errors));
        }
        let scope = &mut self.scopes[0];
        if !ends_in_return(&scope.bytecode) {
            scope.bytecode.emit(Opcode::Return, &[], SourcePosition::unknown());
        }
        let scope = self.scopes.pop().expect("module scope must exist");
        let chunk = Chunk {
            name: scope.name,
            bytecode: scope.bytecode,
            num_locals: self.symbol_table.borrow().num_locals(),
            num_params: scope.num_params,
        };
        Ok(CompiledProgram {
            chunk: Rc::new(chunk),
            constants: std::mem::take(&mut self.constants),
            module_globals: self.symbol_table.borrow().module_global_symbols().to_vec(),
        })
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            constants_len: self.constants.len(),
            loaded_modules: self.loaded_modules.keys().cloned().collect(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.constants.truncate(snapshot.constants_len);
        self.loaded_modules
            .retain(|path, _| snapshot.loaded_modules.contains(path));
    }

    // ---- scope/emission helpers ----

    fn scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("compiler always has an active scope")
    }

    fn emit(&mut self, op: Opcode, operands: &[u64], pos: SourcePosition) -> usize {
        self.scope_mut().bytecode.emit(op, operands, pos)
    }

    fn patch_jump(&mut self, ip: usize) {
        let target = self.scope_mut().bytecode.len() as u64;
        self.scope_mut().bytecode.patch_operand(ip, 0, target);
    }

    fn patch_to(&mut self, ip: usize, target: usize) {
        self.scope_mut().bytecode.patch_operand(ip, 0, target as u64);
    }

    fn here(&mut self) -> usize {
        self.scope_mut().bytecode.len()
    }

    fn error(&mut self, message: impl Into<String>, loc: &SourceLocation) {
        self.errors.push(LangError::new(
            ErrorKind::Compilation,
            message,
            loc.to_position(),
        ));
    }

    fn intern(&mut self, value: Value) -> u16 {
        let ix = self.constants.len();
        self.constants.push(value);
        ix as u16
    }

    fn intern_string(&mut self, s: &str) -> u16 {
        let r = self.heap.alloc_string(s);
        self.intern(Value::Heap(r))
    }

    // ---- symbol access ----

    fn resolve_or_error(&mut self, name: &str, loc: &SourceLocation) -> Option<Symbol> {
        let resolved = self.symbol_table.borrow_mut().resolve(name);
        if resolved.is_none() {
            self.error(format!("undefined identifier \"{name}\""), loc);
        }
        resolved
    }

    fn emit_get_symbol(&mut self, symbol: &Symbol, pos: SourcePosition) {
        match symbol.scope {
            SymbolScope::ModuleGlobal => {
                self.emit(Opcode::GetModuleGlobal, &[symbol.index as u64], pos);
            }
            SymbolScope::Local => {
                self.emit(Opcode::GetLocal, &[symbol.index as u64], pos);
            }
            SymbolScope::HostGlobal => {
                self.emit(Opcode::GetHostGlobal, &[symbol.index as u64], pos);
            }
            SymbolScope::Free => {
                self.emit(Opcode::GetFree, &[symbol.index as u64], pos);
            }
            SymbolScope::Function => {
                self.emit(Opcode::CurrentFunction, &[], pos);
            }
            SymbolScope::This => {
                self.emit(Opcode::GetThis, &[], pos);
            }
        }
    }

    fn emit_set_symbol(&mut self, symbol: &Symbol, pos: SourcePosition, loc: &SourceLocation) -> bool {
        if !symbol.assignable {
            self.error(format!("\"{}\" is not assignable", symbol.name), loc);
            return false;
        }
        match symbol.scope {
            SymbolScope::ModuleGlobal => {
                self.emit(Opcode::SetModuleGlobal, &[symbol.index as u64], pos);
            }
            SymbolScope::Local => {
                self.emit(Opcode::SetLocal, &[symbol.index as u64], pos);
            }
            SymbolScope::Free => {
                self.emit(Opcode::SetFree, &[symbol.index as u64], pos);
            }
            SymbolScope::HostGlobal | SymbolScope::Function | SymbolScope::This => {
                self.error(format!("\"{}\" is not assignable", symbol.name), loc);
                return false;
            }
        }
        true
    }

    fn emit_define_symbol(&mut self, symbol: &Symbol, pos: SourcePosition) {
        match symbol.scope {
            SymbolScope::ModuleGlobal => {
                self.emit(Opcode::DefineModuleGlobal, &[symbol.index as u64], pos);
            }
            SymbolScope::Local => {
                self.emit(Opcode::DefineLocal, &[symbol.index as u64], pos);
            }
            _ => unreachable!("var/const definitions only ever produce ModuleGlobal or Local symbols"),
        }
    }

    // ---- statements ----

    fn compile_statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::VarDef { name, value, loc } | Statement::ConstDef { name, value, loc } => {
                self.compile_expression(value);
                let symbol = self.symbol_table.borrow_mut().define(name);
                self.emit_define_symbol(&symbol, loc.to_position());
            }
            Statement::ExpressionStmt(expr, loc) => {
                self.compile_expression(expr);
                self.emit(Opcode::Pop, &[], loc.to_position());
            }
            Statement::Return(value, loc) => {
                if self.scopes.len() == 1 {
                    self.error("Nothing to return from", loc);
                }
                match value {
                    Some(expr) => {
                        self.compile_expression(expr);
                        self.emit(Opcode::ReturnValue, &[], loc.to_position());
                    }
                    None => {
                        self.emit(Opcode::Return, &[], loc.to_position());
                    }
                }
            }
            Statement::If { cases, alternative, loc } => self.compile_if(cases, alternative, loc),
            Statement::While { condition, body, loc } => self.compile_while(condition, body, loc),
            Statement::ClassicFor { init, condition, update, body, loc } => {
                self.compile_classic_for(init, condition, update, body, loc)
            }
            Statement::ForEach { ident, source, body, loc } => self.compile_foreach(ident, source, body, loc),
            Statement::Break(loc) => self.compile_break(loc),
            Statement::Continue(loc) => self.compile_continue(loc),
            Statement::Block(statements, _) => {
                self.symbol_table.borrow_mut().push_block();
                for s in statements {
                    self.compile_statement(s);
                }
                self.symbol_table.borrow_mut().pop_block();
            }
            Statement::Import { path, loc } => self.compile_import(path, loc),
            Statement::Recover { err_name, body, loc } => self.compile_recover(err_name, body, loc),
        }
    }

    fn compile_if(
        &mut self,
        cases: &[(Expression, Statement)],
        alternative: &Option<Box<Statement>>,
        _loc: &SourceLocation,
    ) {
        let mut end_jumps = Vec::new();
        for (condition, body) in cases {
            self.compile_expression(condition);
            let else_jump = self.emit(Opcode::JumpIfFalse, &[0], condition.loc().to_position());
            self.compile_statement(body);
            end_jumps.push(self.emit(Opcode::Jump, &[0], body.loc().to_position()));
            self.patch_jump(else_jump);
        }
        if let Some(alt) = alternative {
            self.compile_statement(alt);
        }
        for ip in end_jumps {
            self.patch_jump(ip);
        }
    }

    fn compile_while(&mut self, condition: &Expression, body: &Statement, _loc: &SourceLocation) {
        let before_test_ip = self.here();
        self.compile_expression(condition);
        let enter_body = self.emit(Opcode::JumpIfTrue, &[0], condition.loc().to_position());
        let exit_jump = self.emit(Opcode::Jump, &[0], condition.loc().to_position());
        self.patch_jump(enter_body);

        self.scope_mut().loops.push(LoopContext {
            break_ips: Vec::new(),
            continue_target: Some(before_test_ip),
            continue_ips: Vec::new(),
        });
        self.compile_statement(body);
        self.emit(Opcode::Jump, &[before_test_ip as u64], body.loc().to_position());
        self.patch_jump(exit_jump);
        let ctx = self.scope_mut().loops.pop().expect("loop context pushed above");
        for ip in ctx.break_ips {
            self.patch_jump(ip);
        }
    }

    fn compile_classic_for(
        &mut self,
        init: &Option<Box<Statement>>,
        condition: &Option<Expression>,
        update: &Option<Box<Statement>>,
        body: &Statement,
        loc: &SourceLocation,
    ) {
        self.symbol_table.borrow_mut().push_block();
        if let Some(init) = init {
            self.compile_statement(init);
        }
        let skip_first_update = self.emit(Opcode::Jump, &[0], loc.to_position());
        let update_ip = self.here();
        if let Some(update) = update {
            self.compile_statement(update);
        }
        self.patch_jump(skip_first_update);

        match condition {
            Some(cond) => self.compile_expression(cond),
            None => {
                self.emit(Opcode::True, &[], loc.to_position());
            }
        }
        let enter_body = self.emit(Opcode::JumpIfTrue, &[0], loc.to_position());
        let exit_jump = self.emit(Opcode::Jump, &[0], loc.to_position());
        self.patch_jump(enter_body);

        self.scope_mut().loops.push(LoopContext {
            break_ips: Vec::new(),
            continue_target: Some(update_ip),
            continue_ips: Vec::new(),
        });
        self.compile_statement(body);
        self.emit(Opcode::Jump, &[update_ip as u64], body.loc().to_position());
        self.patch_jump(exit_jump);
        let ctx = self.scope_mut().loops.pop().expect("loop context pushed above");
        for ip in ctx.break_ips {
            self.patch_jump(ip);
        }
        self.symbol_table.borrow_mut().pop_block();
    }

    /// Desugars `for (x in source) { body }` into index-based iteration over
    /// two hidden locals: `@i` (current index) and `@source` (the iterable,
    /// evaluated once). Names starting with `@` can't be written by user
    /// source, so they never collide with real identifiers.
    fn compile_foreach(&mut self, ident: &str, source: &Expression, body: &Statement, loc: &SourceLocation) {
        self.symbol_table.borrow_mut().push_block();
        let pos = loc.to_position();

        self.emit(Opcode::Number, &[0f64.to_bits()], pos.clone());
        let i_symbol = self.symbol_table.borrow_mut().define("@i");
        self.emit_define_symbol(&i_symbol, pos.clone());

        self.compile_expression(source);
        let source_symbol = self.symbol_table.borrow_mut().define("@source");
        self.emit_define_symbol(&source_symbol, pos.clone());

        let test_ip = self.here();
        self.emit_get_symbol(&source_symbol, pos.clone());
        self.emit(Opcode::Len, &[], pos.clone());
        self.emit_get_symbol(&i_symbol, pos.clone());
        self.emit(Opcode::Equal, &[], pos.clone());
        let exit_jump = self.emit(Opcode::JumpIfTrue, &[0], pos.clone());

        self.symbol_table.borrow_mut().push_block();
        self.emit_get_symbol(&source_symbol, pos.clone());
        self.emit_get_symbol(&i_symbol, pos.clone());
        self.emit(Opcode::GetValueAt, &[], pos.clone());
        let item_symbol = self.symbol_table.borrow_mut().define(ident);
        self.emit_define_symbol(&item_symbol, pos.clone());

        self.scope_mut().loops.push(LoopContext {
            break_ips: Vec::new(),
            // The increment IP isn't known until the body (of unknown
            // length) has been compiled, so `continue` inside it records a
            // placeholder jump here rather than emitting a direct one.
            continue_target: None,
            continue_ips: Vec::new(),
        });
        self.compile_statement(body);
        self.symbol_table.borrow_mut().pop_block();

        let increment_ip = self.here();
        self.emit_get_symbol(&i_symbol, pos.clone());
        self.emit(Opcode::Number, &[1f64.to_bits()], pos.clone());
        self.emit(Opcode::Add, &[], pos.clone());
        self.emit_set_symbol(&i_symbol, pos.clone(), loc);
        self.emit(Opcode::Pop, &[], pos.clone());
        self.emit(Opcode::Jump, &[test_ip as u64], pos.clone());
        self.patch_jump(exit_jump);

        let ctx = self.scope_mut().loops.pop().expect("loop context pushed above");
        for ip in ctx.break_ips {
            self.patch_jump(ip);
        }
        for ip in ctx.continue_ips {
            self.patch_to(ip, increment_ip);
        }

        self.symbol_table.borrow_mut().pop_block();
    }

    fn compile_break(&mut self, loc: &SourceLocation) {
        let ip = self.emit(Opcode::Jump, &[0], loc.to_position());
        match self.scope_mut().loops.last_mut() {
            Some(ctx) => ctx.break_ips.push(ip),
            None => self.error("\"break\" outside of a loop", loc),
        }
    }

    fn compile_continue(&mut self, loc: &SourceLocation) {
        if self.scope_mut().loops.is_empty() {
            self.error("\"continue\" outside of a loop", loc);
            return;
        }
        let target = self.scope_mut().loops.last().unwrap().continue_target;
        match target {
            Some(target) => {
                self.emit(Opcode::Jump, &[target as u64], loc.to_position());
            }
            None => {
                let ip = self.emit(Opcode::Jump, &[0], loc.to_position());
                self.scope_mut().loops.last_mut().unwrap().continue_ips.push(ip);
            }
        }
    }

    fn compile_recover(&mut self, err_name: &str, body: &Statement, loc: &SourceLocation) {
        let pos = loc.to_position();
        if self.scopes.len() == 1 {
            self.error("\"recover\" is not legal at module top level", loc);
            return;
        }
        if !self.symbol_table.borrow().is_top_block() {
            self.error("\"recover\" must be at the top of its function's block", loc);
            return;
        }

        let set_recover_ip = self.emit(Opcode::SetRecover, &[0], pos.clone());
        let skip_jump = self.emit(Opcode::Jump, &[0], pos.clone());
        let recover_target = self.here();
        self.patch_to(set_recover_ip, recover_target);

        self.symbol_table.borrow_mut().push_block();
        let err_symbol = self.symbol_table.borrow_mut().define(err_name);
        self.emit_define_symbol(&err_symbol, pos.clone());
        let body_ends_in_return = statement_ends_in_return(body);
        self.compile_statement(body);
        if !body_ends_in_return {
            self.error("a \"recover\" block must end in \"return\"", loc);
        }
        self.symbol_table.borrow_mut().pop_block();

        self.patch_jump(skip_jump);
    }

    fn compile_import(&mut self, path: &str, loc: &SourceLocation) {
        if self.scopes.len() != 1 || !self.symbol_table.borrow().is_top_block() {
            self.error("\"import\" is only legal at module top level", loc);
            return;
        }
        let Some(resolved) = self.resolve_import_path(path) else {
            self.error(format!("cannot resolve import path \"{path}\""), loc);
            return;
        };
        if self.file_stack.contains(&resolved) {
            self.error(format!("cyclic import of \"{}\"", resolved.display()), loc);
            return;
        }
        let module_name = module_alias(&resolved);

        if let Some(symbols) = self.loaded_modules.get(&resolved).cloned() {
            self.bind_module_symbols(&module_name, &symbols);
            return;
        }

        let Some(reader) = self.read_file.as_ref() else {
            self.error("no file reader configured for \"import\"", loc);
            return;
        };
        let source = match reader(&resolved) {
            Ok(s) => s,
            Err(e) => {
                self.error(format!("failed to read \"{}\": {e}", resolved.display()), loc);
                return;
            }
        };

        let mut parser = Parser::new(&source, Some(resolved.clone()));
        let program = parser.parse_program();
        if !parser.errors.is_empty() {
            for err in parser.errors.iter() {
                self.errors.push(err.clone());
            }
            return;
        }

        // The imported file's own top-level statements (and their side
        // effects, e.g. initializing its module globals) are spliced
        // directly into the importing scope's bytecode at this point, so
        // they actually execute; only the symbol table is swapped, so the
        // imported names get freshly-scoped (but shared-counter) indices.
        self.file_stack.push(resolved.clone());
        let outer_table = std::mem::replace(
            &mut self.symbol_table,
            Rc::new(RefCell::new(SymbolTable::new_module_table(
                self.globals.clone(),
                self.module_global_counter.clone(),
            ))),
        );
        for stmt in &program.statements {
            self.compile_statement(stmt);
        }
        let module_table = std::mem::replace(&mut self.symbol_table, outer_table);
        self.file_stack.pop();

        let symbols: Vec<Symbol> = module_table.borrow().module_global_symbols().to_vec();
        self.loaded_modules.insert(resolved, symbols.clone());
        self.bind_module_symbols(&module_name, &symbols);
    }

    fn bind_module_symbols(&mut self, module_name: &str, symbols: &[Symbol]) {
        let mut table = self.symbol_table.borrow_mut();
        for symbol in symbols {
            table.define_alias(&format!("{module_name}::{}", symbol.name), symbol.clone());
        }
    }

    fn resolve_import_path(&self, path: &str) -> Option<PathBuf> {
        let raw = PathBuf::from(path);
        let raw = if raw.extension().is_none() {
            raw.with_extension("lang")
        } else {
            raw
        };
        let joined = if raw.is_absolute() {
            raw
        } else {
            let base = self
                .current_file
                .as_ref()
                .and_then(|f| f.parent())
                .map(Path::to_path_buf)
                .unwrap_or_default();
            base.join(raw)
        };
        Some(normalize_path(&joined))
    }

    // ---- expressions ----

    fn compile_expression(&mut self, expr: &Expression) {
        match expr {
            Expression::Number(n, loc) => {
                self.emit(Opcode::Number, &[n.to_bits()], loc.to_position());
            }
            Expression::Boolean(b, loc) => {
                let op = if *b { Opcode::True } else { Opcode::False };
                self.emit(op, &[], loc.to_position());
            }
            Expression::Null(loc) => {
                self.emit(Opcode::Null, &[], loc.to_position());
            }
            Expression::StringLiteral(s, loc) => {
                let ix = self.intern_string(s);
                self.emit(Opcode::Constant, &[ix as u64], loc.to_position());
            }
            Expression::Identifier(name, loc) => {
                if let Some(symbol) = self.resolve_or_error(name, loc) {
                    self.emit_get_symbol(&symbol, loc.to_position());
                } else {
                    self.emit(Opcode::Null, &[], loc.to_position());
                }
            }
            Expression::ArrayLiteral(items, loc) => {
                for item in items {
                    self.compile_expression(item);
                }
                self.emit(Opcode::Array, &[items.len() as u64], loc.to_position());
            }
            Expression::MapLiteral(pairs, loc) => {
                self.emit(Opcode::MapStart, &[pairs.len() as u64], loc.to_position());
                for (key, value) in pairs {
                    self.compile_expression(key);
                    self.compile_expression(value);
                }
                self.emit(Opcode::MapEnd, &[pairs.len() as u64], loc.to_position());
            }
            Expression::Prefix { operator, right, loc } => {
                if let Some(folded) = fold(expr) {
                    self.emit_const(folded, loc.to_position());
                    return;
                }
                self.compile_expression(right);
                let op = match operator {
                    PrefixOp::Negate => Opcode::Minus,
                    PrefixOp::Not => Opcode::Bang,
                };
                self.emit(op, &[], loc.to_position());
            }
            Expression::Infix { left, operator, right, loc } => {
                if let Some(folded) = fold(expr) {
                    self.emit_const(folded, loc.to_position());
                    return;
                }
                self.compile_infix(*operator, left, right, loc);
            }
            Expression::Logical { left, operator, right, loc } => self.compile_logical(*operator, left, right, loc),
            Expression::Assign { target, value, loc } => self.compile_assign(target, value, loc),
            Expression::FunctionLiteral { name, params, body, loc } => self.compile_function_literal(name, params, body, loc),
            Expression::Call { function, args, loc } => {
                self.compile_expression(function);
                for arg in args {
                    self.compile_expression(arg);
                }
                self.emit(Opcode::Call, &[args.len() as u64], loc.to_position());
            }
            Expression::Index { left, index, loc } => {
                self.compile_expression(left);
                self.compile_expression(index);
                self.emit(Opcode::GetIndex, &[], loc.to_position());
            }
            Expression::TemplateString(inner, _) => self.compile_expression(inner),
        }
    }

    fn emit_const(&mut self, c: Const, pos: SourcePosition) {
        match c {
            Const::Number(n) => {
                self.emit(Opcode::Number, &[n.to_bits()], pos);
            }
            Const::Bool(true) => {
                self.emit(Opcode::True, &[], pos);
            }
            Const::Bool(false) => {
                self.emit(Opcode::False, &[], pos);
            }
            Const::Null => {
                self.emit(Opcode::Null, &[], pos);
            }
            Const::Str(s) => {
                let ix = self.intern_string(&s);
                self.emit(Opcode::Constant, &[ix as u64], pos);
            }
        }
    }

    /// Comparison operators only exist at the opcode level as `>` and `>=`;
    /// `<`/`<=` compile by swapping operand order rather than needing their
    /// own opcodes.
    fn compile_infix(&mut self, operator: InfixOp, left: &Expression, right: &Expression, loc: &SourceLocation) {
        let pos = loc.to_position();
        match operator {
            InfixOp::Lt => {
                self.compile_expression(right);
                self.compile_expression(left);
                self.emit(Opcode::GreaterThan, &[], pos);
            }
            InfixOp::LtEq => {
                self.compile_expression(right);
                self.compile_expression(left);
                self.emit(Opcode::GreaterThanEqual, &[], pos);
            }
            InfixOp::Gt => {
                self.compile_expression(left);
                self.compile_expression(right);
                self.emit(Opcode::GreaterThan, &[], pos);
            }
            InfixOp::GtEq => {
                self.compile_expression(left);
                self.compile_expression(right);
                self.emit(Opcode::GreaterThanEqual, &[], pos);
            }
            _ => {
                self.compile_expression(left);
                self.compile_expression(right);
                let op = match operator {
                    InfixOp::Add => Opcode::Add,
                    InfixOp::Sub => Opcode::Sub,
                    InfixOp::Mul => Opcode::Mul,
                    InfixOp::Div => Opcode::Div,
                    InfixOp::Mod => Opcode::Mod,
                    InfixOp::BitOr => Opcode::BitOr,
                    InfixOp::BitXor => Opcode::BitXor,
                    InfixOp::BitAnd => Opcode::BitAnd,
                    InfixOp::LShift => Opcode::LShift,
                    InfixOp::RShift => Opcode::RShift,
                    InfixOp::Eq => Opcode::Equal,
                    InfixOp::NotEq => Opcode::NotEqual,
                    InfixOp::Lt | InfixOp::LtEq | InfixOp::Gt | InfixOp::GtEq => unreachable!("handled above"),
                };
                self.emit(op, &[], pos);
            }
        }
    }

    /// Short-circuiting `&&`/`||`: evaluate `left`, `DUP` it so the test
    /// doesn't consume the value we might return, branch past `right` if the
    /// result is already decided, otherwise `POP` the duplicate and fall
    /// through to `right`.
    fn compile_logical(&mut self, operator: LogicalOp, left: &Expression, right: &Expression, loc: &SourceLocation) {
        let pos = loc.to_position();
        self.compile_expression(left);
        self.emit(Opcode::Dup, &[], pos.clone());
        let op = match operator {
            LogicalOp::And => Opcode::JumpIfFalse,
            LogicalOp::Or => Opcode::JumpIfTrue,
        };
        let short_circuit = self.emit(op, &[0], pos.clone());
        self.emit(Opcode::Pop, &[], pos.clone());
        self.compile_expression(right);
        self.patch_jump(short_circuit);
    }

    fn compile_assign(&mut self, target: &Expression, value: &Expression, loc: &SourceLocation) {
        let pos = loc.to_position();
        match target {
            Expression::Identifier(name, ident_loc) => {
                self.compile_expression(value);
                if let Some(symbol) = self.resolve_or_error(name, ident_loc) {
                    self.emit_set_symbol(&symbol, pos, loc);
                }
            }
            Expression::Index { left, index, .. } => {
                self.compile_expression(left);
                self.compile_expression(index);
                self.compile_expression(value);
                self.emit(Opcode::SetIndex, &[], pos);
            }
            _ => self.error("invalid assignment target", loc),
        }
    }

    /// Compiles a function literal into its own scope/symbol table, then
    /// interns the resulting template in the constant pool and emits the
    /// `GET_*` sequence (in the *enclosing* scope) that captures its free
    /// variables by value, followed by `FUNCTION const_ix, num_free`.
    fn compile_function_literal(
        &mut self,
        name: &Option<String>,
        params: &[String],
        body: &Statement,
        loc: &SourceLocation,
    ) {
        let pos = loc.to_position();
        let outer_table = self.symbol_table.clone();
        self.symbol_table = Rc::new(RefCell::new(SymbolTable::new_enclosed(outer_table.clone())));
        if let Some(name) = name {
            self.symbol_table.borrow_mut().define_function_name(name);
        }
        self.symbol_table.borrow_mut().define_this();
        for param in params {
            self.symbol_table.borrow_mut().define(param);
        }
        self.scopes
            .push(CompilationScope::new(name.clone(), params.len() as u8));

        // Compile the body's statements directly in the function's base
        // block (shared with its params/`this`) rather than through the
        // generic `Block` arm, which would push a nested block scope and
        // put a `recover` at the head of the body one level too deep for
        // `is_top_block` to accept it.
        match body {
            Statement::Block(statements, _) => {
                for s in statements {
                    self.compile_statement(s);
                }
            }
            other => self.compile_statement(other),
        }
        if !ends_in_return(&self.scope_mut().bytecode) {
            self.emit(Opcode::Return, &[], pos.clone());
        }

        let scope = self.scopes.pop().expect("function scope just pushed");
        let num_locals = self.symbol_table.borrow().num_locals();
        let free_symbols = self.symbol_table.borrow().free_symbols.clone();
        self.symbol_table = outer_table;

        let chunk = Chunk {
            name: scope.name,
            bytecode: scope.bytecode,
            num_locals,
            num_params: scope.num_params,
        };
        let template = FunctionObject {
            chunk: Rc::new(chunk),
            free_values: Vec::new(),
        };
        let r = self.heap.alloc_function(template);
        let const_ix = self.intern(Value::Heap(r));

        for free in &free_symbols {
            if let Some(symbol) = self.symbol_table.borrow_mut().resolve(&free.name) {
                self.emit_get_symbol(&symbol, pos.clone());
            }
        }
        self.emit(
            Opcode::Function,
            &[const_ix as u64, free_symbols.len() as u64],
            pos,
        );
    }
}

fn statement_ends_in_return(stmt: &Statement) -> bool {
    match stmt {
        Statement::Return(..) => true,
        Statement::Block(stmts, _) => stmts.last().is_some_and(statement_ends_in_return),
        _ => false,
    }
}

fn ends_in_return(bytecode: &Bytecode) -> bool {
    if bytecode.is_empty() {
        return false;
    }
    let last = bytecode.len() - 1;
    // Scan backward for the opcode byte that the last emitted instruction
    // started at; `Return`/`ReturnValue` both have zero operands so the
    // opcode byte and the last byte coincide when they were the final
    // instruction emitted.
    matches!(
        Opcode::from_byte(bytecode.code[last]),
        Some(Opcode::Return) | Some(Opcode::ReturnValue)
    )
}

fn module_alias(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string())
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---- compile-time constant folding ----

#[derive(Debug, Clone)]
enum Const {
    Number(f64),
    Bool(bool),
    Null,
    Str(String),
}

fn fold(expr: &Expression) -> Option<Const> {
    match expr {
        Expression::Number(n, _) => Some(Const::Number(*n)),
        Expression::Boolean(b, _) => Some(Const::Bool(*b)),
        Expression::Null(_) => Some(Const::Null),
        Expression::StringLiteral(s, _) => Some(Const::Str(s.clone())),
        Expression::Prefix { operator, right, .. } => {
            let r = fold(right)?;
            match (operator, r) {
                (PrefixOp::Negate, Const::Number(n)) => Some(Const::Number(-n)),
                (PrefixOp::Not, Const::Bool(b)) => Some(Const::Bool(!b)),
                (PrefixOp::Not, Const::Null) => Some(Const::Bool(true)),
                (PrefixOp::Not, Const::Number(n)) => Some(Const::Bool(n == 0.0)),
                _ => None,
            }
        }
        Expression::Infix { left, operator, right, .. } => {
            let l = fold(left)?;
            let r = fold(right)?;
            fold_infix(*operator, l, r)
        }
        _ => None,
    }
}

fn fold_infix(operator: InfixOp, l: Const, r: Const) -> Option<Const> {
    use InfixOp::*;
    match (operator, l, r) {
        (Add, Const::Str(a), Const::Str(b)) => Some(Const::Str(a + &b)),
        (Add, Const::Number(a), Const::Number(b)) => Some(Const::Number(a + b)),
        (Sub, Const::Number(a), Const::Number(b)) => Some(Const::Number(a - b)),
        (Mul, Const::Number(a), Const::Number(b)) => Some(Const::Number(a * b)),
        (Div, Const::Number(a), Const::Number(b)) => Some(Const::Number(a / b)),
        (Mod, Const::Number(a), Const::Number(b)) => Some(Const::Number(a % b)),
        (BitOr, Const::Number(a), Const::Number(b)) => Some(Const::Number(((a as i64) | (b as i64)) as f64)),
        (BitXor, Const::Number(a), Const::Number(b)) => Some(Const::Number(((a as i64) ^ (b as i64)) as f64)),
        (BitAnd, Const::Number(a), Const::Number(b)) => Some(Const::Number(((a as i64) & (b as i64)) as f64)),
        (LShift, Const::Number(a), Const::Number(b)) => Some(Const::Number(((a as i64) << (b as i64)) as f64)),
        (RShift, Const::Number(a), Const::Number(b)) => Some(Const::Number(((a as i64) >> (b as i64)) as f64)),
        (Lt, Const::Number(a), Const::Number(b)) => Some(Const::Bool(a < b)),
        (LtEq, Const::Number(a), Const::Number(b)) => Some(Const::Bool(a <= b)),
        (Gt, Const::Number(a), Const::Number(b)) => Some(Const::Bool(a > b)),
        (GtEq, Const::Number(a), Const::Number(b)) => Some(Const::Bool(a >= b)),
        (Eq, Const::Number(a), Const::Number(b)) => Some(Const::Bool(a == b)),
        (Eq, Const::Str(a), Const::Str(b)) => Some(Const::Bool(a == b)),
        (Eq, Const::Bool(a), Const::Bool(b)) => Some(Const::Bool(a == b)),
        (NotEq, Const::Number(a), Const::Number(b)) => Some(Const::Bool(a != b)),
        (NotEq, Const::Str(a), Const::Str(b)) => Some(Const::Bool(a != b)),
        (NotEq, Const::Bool(a), Const::Bool(b)) => Some(Const::Bool(a != b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(src: &str) -> Result<(CompiledProgram, Heap), ErrorList> {
        let mut heap = Heap::new();
        let globals = Rc::new(RefCell::new(GlobalStore::default()));
        let program = Parser::new(src, None).parse_program();
        let result = {
            let mut compiler = Compiler::new(&mut heap, globals);
            compiler.compile(&program, None)
        };
        result.map(|p| (p, heap))
    }

    #[test]
    fn compiles_arithmetic_to_number_and_add() {
        let (program, _heap) = compile_source("1 + 2;").unwrap();
        let code = &program.chunk.bytecode.code;
        // constant folding collapses `1 + 2` into a single NUMBER push.
        assert_eq!(Opcode::from_byte(code[0]), Some(Opcode::Number));
    }

    #[test]
    fn var_definition_emits_define_module_global() {
        let (program, _heap) = compile_source("var x = 5;").unwrap();
        let code = &program.chunk.bytecode.code;
        assert!(code
            .iter()
            .any(|&b| Opcode::from_byte(b) == Some(Opcode::DefineModuleGlobal)));
    }

    #[test]
    fn undefined_identifier_is_a_compile_error() {
        let err = compile_source("x + 1;").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let err = compile_source("break;").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn recover_outside_function_is_an_error() {
        let err = compile_source("recover(e) { return e; }").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn recover_at_head_of_function_body_compiles() {
        compile_source(r#"fn f(){ recover(e){ return e; }; return 1; };"#).unwrap();
    }

    #[test]
    fn function_literal_emits_function_opcode() {
        let (program, _heap) = compile_source("const f = fn(a,b) { return a + b; };").unwrap();
        let code = &program.chunk.bytecode.code;
        assert!(code.iter().any(|&b| Opcode::from_byte(b) == Some(Opcode::Function)));
    }

    #[test]
    fn string_literal_interns_into_constant_pool() {
        let (program, _heap) = compile_source("\"hi\";").unwrap();
        assert_eq!(program.constants.len(), 1);
    }
}
