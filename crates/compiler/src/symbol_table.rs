//! Lexical scoping. One [`SymbolTable`] per compiled function (plus one for
//! module top level), with a stack of [`BlockScope`]s inside it for each
//! `{ … }`. Resolution walks block scopes innermost-first, then the
//! enclosing function's table, reclassifying any symbol found in an
//! enclosing function's *local* scope as `Free` on the way back down.

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    ModuleGlobal,
    Local,
    HostGlobal,
    Free,
    Function,
    This,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: u16,
    pub assignable: bool,
}

#[derive(Debug, Default)]
struct BlockScope {
    symbols: HashMap<String, Symbol>,
    offset: u16,
    num_definitions: u16,
}

/// Global store shared by every file/module: embedder-injected globals and
/// native functions, visible from any nested scope without going through the
/// free-variable capture machinery.
#[derive(Debug, Default)]
pub struct GlobalStore {
    names: HashMap<String, u16>,
    next_index: u16,
}

impl GlobalStore {
    pub fn define(&mut self, name: &str) -> Symbol {
        if let Some(&index) = self.names.get(name) {
            return Symbol {
                name: name.to_string(),
                scope: SymbolScope::HostGlobal,
                index,
                assignable: false,
            };
        }
        let index = self.next_index;
        self.next_index += 1;
        self.names.insert(name.to_string(), index);
        Symbol {
            name: name.to_string(),
            scope: SymbolScope::HostGlobal,
            index,
            assignable: false,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Symbol> {
        self.names.get(name).map(|&index| Symbol {
            name: name.to_string(),
            scope: SymbolScope::HostGlobal,
            index,
            assignable: false,
        })
    }
}

pub struct SymbolTable {
    pub outer: Option<Rc<RefCell<SymbolTable>>>,
    globals: Rc<RefCell<GlobalStore>>,
    /// Module-global indices are assigned from one counter shared by every
    /// file compiled in the same program, so that an imported file's
    /// `module::name` bindings land at distinct indices from the importer's
    /// own globals rather than colliding at index 0.
    module_global_counter: Rc<RefCell<u16>>,
    blocks: Vec<BlockScope>,
    pub free_symbols: Vec<Symbol>,
    module_global_symbols: Vec<Symbol>,
    is_module_top_level: bool,
    /// Highest local slot index assigned, plus one. Tracked independently of
    /// `blocks` because nested block scopes are popped (and their slot range
    /// forgotten) long before the enclosing function finishes compiling, but
    /// the VM still needs to reserve the peak slot count up front.
    high_water_locals: u16,
}

impl SymbolTable {
    pub fn new_module_table(globals: Rc<RefCell<GlobalStore>>, module_global_counter: Rc<RefCell<u16>>) -> Self {
        Self {
            outer: None,
            globals,
            module_global_counter,
            blocks: vec![BlockScope::default()],
            free_symbols: Vec::new(),
            module_global_symbols: Vec::new(),
            is_module_top_level: true,
            high_water_locals: 0,
        }
    }

    pub fn new_enclosed(outer: Rc<RefCell<SymbolTable>>) -> Self {
        let globals = outer.borrow().globals.clone();
        let module_global_counter = outer.borrow().module_global_counter.clone();
        Self {
            outer: Some(outer),
            globals,
            module_global_counter,
            blocks: vec![BlockScope::default()],
            free_symbols: Vec::new(),
            module_global_symbols: Vec::new(),
            is_module_top_level: false,
            high_water_locals: 0,
        }
    }

    pub fn push_block(&mut self) {
        let offset = self.current_total_definitions();
        self.blocks.push(BlockScope {
            offset,
            ..Default::default()
        });
    }

    pub fn pop_block(&mut self) {
        assert!(self.blocks.len() > 1, "cannot pop the outermost block scope");
        self.blocks.pop();
    }

    fn current_total_definitions(&self) -> u16 {
        self.blocks.last().map(|b| b.offset + b.num_definitions).unwrap_or(0)
    }

    /// Defines `name` in the current block. At module top level this creates
    /// a `ModuleGlobal`; otherwise a `Local` indexed at `offset +
    /// num_definitions` within the current block.
    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.is_module_top_level && self.blocks.len() == 1 {
            SymbolScope::ModuleGlobal
        } else {
            SymbolScope::Local
        };
        let index = if scope == SymbolScope::ModuleGlobal {
            let mut counter = self.module_global_counter.borrow_mut();
            let index = *counter;
            *counter += 1;
            index
        } else {
            self.current_total_definitions()
        };
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index,
            assignable: true,
        };
        let block = self.blocks.last_mut().unwrap();
        block.symbols.insert(name.to_string(), symbol.clone());
        block.num_definitions += 1;
        if scope == SymbolScope::ModuleGlobal {
            self.module_global_symbols.push(symbol.clone());
        } else {
            self.high_water_locals = self.high_water_locals.max(index + 1);
        }
        symbol
    }

    pub fn is_top_block(&self) -> bool {
        self.blocks.len() == 1
    }

    /// Peak number of local slots ever assigned in this function's table,
    /// across all block scopes that have come and gone.
    pub fn num_locals(&self) -> u16 {
        self.high_water_locals
    }

    /// Injects the function's own name at index 0, typed `Function`, enabling
    /// unqualified recursive calls. A later `define` of the same name
    /// shadows it with a regular `Local`/`ModuleGlobal` symbol.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
            assignable: false,
        };
        self.blocks[0].symbols.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_this(&mut self) -> Symbol {
        let symbol = Symbol {
            name: "this".to_string(),
            scope: SymbolScope::This,
            index: 0,
            assignable: false,
        };
        self.blocks[0].symbols.insert("this".to_string(), symbol.clone());
        symbol
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        if let Some(existing) = self.free_symbols.iter().find(|s| s.name == original.name) {
            return Symbol {
                name: existing.name.clone(),
                scope: SymbolScope::Free,
                index: self
                    .free_symbols
                    .iter()
                    .position(|s| s.name == original.name)
                    .unwrap() as u16,
                assignable: existing.assignable,
            };
        }
        let index = self.free_symbols.len() as u16;
        self.free_symbols.push(original.clone());
        Symbol {
            name: original.name,
            scope: SymbolScope::Free,
            index,
            assignable: original.assignable,
        }
    }

    fn resolve_in_blocks(&self, name: &str) -> Option<Symbol> {
        for block in self.blocks.iter().rev() {
            if let Some(symbol) = block.symbols.get(name) {
                return Some(symbol.clone());
            }
        }
        None
    }

    /// Resolves `name`, walking the global store, then this table's own
    /// block scopes, then outward through enclosing function tables,
    /// reclassifying as `Free` whenever a symbol is found in an enclosing
    /// function's local scope rather than the immediate one.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.globals.borrow().resolve(name) {
            // Local/function-level definitions still shadow host globals.
            if self.resolve_in_blocks(name).is_none() {
                return Some(symbol);
            }
        }
        if let Some(symbol) = self.resolve_in_blocks(name) {
            return Some(symbol);
        }
        let outer = self.outer.clone()?;
        let resolved = outer.borrow_mut().resolve(name)?;
        match resolved.scope {
            SymbolScope::ModuleGlobal | SymbolScope::HostGlobal => Some(resolved),
            _ => Some(self.define_free(resolved)),
        }
    }

    /// Binds `name` directly to an already-assigned symbol (an imported
    /// module's `module::name` re-export), without consuming a new index.
    pub fn define_alias(&mut self, name: &str, symbol: Symbol) {
        self.blocks[0].symbols.insert(name.to_string(), symbol);
    }

    pub fn module_global_symbols(&self) -> &[Symbol] {
        &self.module_global_symbols
    }

    pub fn num_definitions(&self) -> u16 {
        self.blocks.iter().map(|b| b.num_definitions).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_globals() -> Rc<RefCell<GlobalStore>> {
        Rc::new(RefCell::new(GlobalStore::default()))
    }

    fn new_counter() -> Rc<RefCell<u16>> {
        Rc::new(RefCell::new(0))
    }

    #[test]
    fn define_assigns_sequential_indices() {
        let mut table = SymbolTable::new_module_table(new_globals(), new_counter());
        let a = table.define("a");
        let b = table.define("b");
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(a.scope, SymbolScope::ModuleGlobal);
    }

    #[test]
    fn nested_block_offsets_continue_from_outer() {
        let mut table = SymbolTable::new_module_table(new_globals(), new_counter());
        table.define("a");
        table.push_block();
        let b = table.define("b");
        assert_eq!(b.index, 1);
        table.pop_block();
    }

    #[test]
    fn shadowing_in_inner_block_then_restored() {
        let mut table = SymbolTable::new_module_table(new_globals(), new_counter());
        table.define("x");
        table.push_block();
        let inner = table.define("x");
        assert_eq!(table.resolve("x").unwrap().index, inner.index);
        table.pop_block();
        assert_eq!(table.resolve("x").unwrap().index, 0);
    }

    #[test]
    fn free_variable_capture_from_enclosing_function() {
        let globals = new_globals();
        let outer = Rc::new(RefCell::new(SymbolTable::new_module_table(globals, new_counter())));
        outer.borrow_mut().define("counter");
        let mut inner = SymbolTable::new_enclosed(outer);
        let resolved = inner.resolve("counter").unwrap();
        assert_eq!(resolved.scope, SymbolScope::Free);
        assert_eq!(inner.free_symbols.len(), 1);
        assert_eq!(inner.free_symbols[0].name, "counter");
    }

    #[test]
    fn repeated_free_capture_is_deduplicated() {
        let globals = new_globals();
        let outer = Rc::new(RefCell::new(SymbolTable::new_module_table(globals, new_counter())));
        outer.borrow_mut().define("x");
        let mut inner = SymbolTable::new_enclosed(outer);
        let first = inner.resolve("x").unwrap();
        let second = inner.resolve("x").unwrap();
        assert_eq!(first.index, second.index);
        assert_eq!(inner.free_symbols.len(), 1);
    }

    #[test]
    fn unresolvable_name_returns_none() {
        let mut table = SymbolTable::new_module_table(new_globals(), new_counter());
        assert!(table.resolve("missing").is_none());
    }

    #[test]
    fn function_name_binding_then_shadowed_by_definition() {
        let mut table = SymbolTable::new_module_table(new_globals(), new_counter());
        let fname = table.define_function_name("fact");
        assert_eq!(fname.scope, SymbolScope::Function);
        let shadowed = table.define("fact");
        assert_eq!(shadowed.scope, SymbolScope::ModuleGlobal);
        assert_eq!(table.resolve("fact").unwrap().scope, SymbolScope::ModuleGlobal);
    }

    #[test]
    fn host_globals_visible_from_nested_scope() {
        let globals = new_globals();
        globals.borrow_mut().define("print");
        let outer = Rc::new(RefCell::new(SymbolTable::new_module_table(globals, new_counter())));
        let mut inner = SymbolTable::new_enclosed(outer);
        let resolved = inner.resolve("print").unwrap();
        assert_eq!(resolved.scope, SymbolScope::HostGlobal);
        assert!(inner.free_symbols.is_empty());
    }
}
