//! Skarn - a statically-typed systems language with a Lua-flavored surface,
//! compiled ahead of time to portable C

pub mod analyzer;
pub mod ast;
pub mod codegen;
pub mod config;
pub mod errors;
pub mod lexer;
pub mod operators;
pub mod parser;
pub mod pragma;
pub mod preprocess;
pub mod scope;
pub mod test_support;
pub mod types;

pub use analyzer::{Analyzer, Context};
pub use ast::AstBuilder;
pub use lexer::Lexer;
pub use parser::Parser;
pub use types::{Type, TypeContext};
