//! The embedder-facing API: compile source into a [`Program`], run it, call
//! named functions inside it, and register host values/natives as globals
//! visible to every script the engine compiles.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::program::Program;
use crate::stdlib;
use crate::vm::Vm;
use loom_compiler::{Compiler, GlobalStore, Parser, SymbolScope};
use loom_core::{Heap, HeapString, NativeFn, NativeFunctionObject, Value};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub struct Engine {
    vm: Vm,
    globals: Rc<RefCell<GlobalStore>>,
    repl_mode: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let vm = Vm::new(Heap::new(), config.max_execution_time());
        let globals = Rc::new(RefCell::new(GlobalStore::default()));
        let mut engine = Self {
            vm,
            globals,
            repl_mode: config.repl_mode,
        };
        engine.install_builtins();
        engine
    }

    fn install_builtins(&mut self) {
        for (name, native) in stdlib::builtins() {
            self.register_native_function(name, native);
        }
    }

    fn register_native_function(&mut self, name: &str, native: NativeFunctionObject) {
        let symbol = self.globals.borrow_mut().define(name);
        let r = self.vm.heap_mut().alloc_native_function(native);
        self.vm.set_host_global(symbol.index, Value::Heap(r));
    }

    /// Registers a Rust function under `name`, callable from any script this
    /// engine compiles from now on.
    pub fn register_function(&mut self, name: &str, func: NativeFn) {
        self.register_native_function(
            name,
            NativeFunctionObject {
                name: HeapString::new(name),
                func,
            },
        );
    }

    /// Registers a plain value (a config constant, a handle built from
    /// `register_external`, etc.) visible under `name` to scripts.
    pub fn register_global(&mut self, name: &str, value: Value) {
        let symbol = self.globals.borrow_mut().define(name);
        self.vm.set_host_global(symbol.index, value);
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        self.vm.heap_mut()
    }

    pub fn heap(&self) -> &Heap {
        self.vm.heap()
    }

    pub fn compile(&mut self, source: &str, file: Option<PathBuf>) -> Result<Program, EngineError> {
        let mut parser = Parser::new(source, file.clone());
        parser.set_repl_mode(self.repl_mode);
        let ast = parser.parse_program();
        if !parser.errors.is_empty() {
            return Err(EngineError::Compile(parser.errors));
        }
        let mut compiler = Compiler::new(self.vm.heap_mut(), self.globals.clone());
        let compiled = compiler.compile(&ast, file)?;
        Ok(Program::new(compiled))
    }

    pub fn compile_file(&mut self, path: &Path) -> Result<Program, EngineError> {
        let source = std::fs::read_to_string(path)?;
        self.compile(&source, Some(path.to_path_buf()))
    }

    pub fn execute(&mut self, program: &Program) -> Result<Value, EngineError> {
        self.vm.run(&program.compiled).map_err(EngineError::from)
    }

    /// Compiles and immediately runs `source`, returning its result value.
    pub fn eval(&mut self, source: &str) -> Result<Value, EngineError> {
        let program = self.compile(source, None)?;
        self.execute(&program)
    }

    pub fn eval_file(&mut self, path: &Path) -> Result<Value, EngineError> {
        let program = self.compile_file(path)?;
        self.execute(&program)
    }

    /// Looks up a name this program defined at module top level and calls it
    /// as a function with `args`. Requires `execute` to have already run
    /// (functions are only assigned their value once `DEFINE_MODULE_GLOBAL`
    /// executes).
    pub fn call_function(&mut self, program: &Program, name: &str, args: &[Value]) -> Result<Value, EngineError> {
        let symbol = program
            .compiled
            .module_globals
            .iter()
            .find(|s| s.name == name && s.scope == SymbolScope::ModuleGlobal)
            .ok_or_else(|| EngineError::NoSuchFunction(name.to_string()))?;
        let callee = self.vm.get_module_global(symbol.index);
        self.vm
            .call(&program.compiled.constants, callee, args)
            .map_err(EngineError::from)
    }

    /// Looks up a host global (registered via [`Self::register_global`] or
    /// [`Self::register_function`]) by the name it was registered under.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let symbol = self.globals.borrow().resolve(name)?;
        Some(self.vm.get_host_global(symbol.index))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_returns_last_expression_value() {
        let mut engine = Engine::default();
        let result = engine.eval("1 + 2;").unwrap();
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn registered_global_is_visible_to_scripts() {
        let mut engine = Engine::default();
        engine.register_global("answer", Value::Number(42.0));
        let result = engine.eval("answer;").unwrap();
        assert_eq!(result, Value::Number(42.0));
    }

    #[test]
    fn call_function_invokes_module_level_function() {
        let mut engine = Engine::default();
        let program = engine.compile("fn add(a, b) { return a + b; }", None).unwrap();
        engine.execute(&program).unwrap();
        let result = engine
            .call_function(&program, "add", &[Value::Number(2.0), Value::Number(3.0)])
            .unwrap();
        assert_eq!(result, Value::Number(5.0));
    }

    #[test]
    fn compile_error_surfaces_as_engine_error() {
        let mut engine = Engine::default();
        let err = engine.compile("fn (", None).unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
    }
}
