//! Bytecode compiler for the Vesper scripting language.

mod compiler;
mod symbol_table;

pub use compiler::{compile, CompileError, CompileOptions, Compiler, MAX_CALL_ARGS};
pub use symbol_table::{Resolution, Scope, ScopeStack, Symbol, SymbolTable};
