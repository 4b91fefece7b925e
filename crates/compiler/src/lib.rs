//! Front end for the embeddable scripting language: lexer, parser, symbol
//! table, and the compiler that turns a parsed [`ast::Program`] into a
//! [`compiler::CompiledProgram`] the runtime's VM can execute.
//!
//! # Modules
//!
//! - `token`/`lexer`: source text to token stream.
//! - `ast`: the parser's output.
//! - `parser`: Pratt expression parser plus recursive-descent statements.
//! - `symbol_table`: lexical scoping, free-variable capture, globals.
//! - `compiler`: AST to bytecode, one shared constant pool per program.

pub mod ast;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod symbol_table;
pub mod token;

pub use ast::Program;
pub use compiler::{CompiledProgram, Compiler};
pub use parser::Parser;
pub use symbol_table::{GlobalStore, Symbol, SymbolScope, SymbolTable};
