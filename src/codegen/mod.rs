//! Code generation backends
//!
//! The C backend is the primary target; the Lua backend is a thin secondary
//! generator useful for inspecting what the typed AST means operationally.

pub mod c_builtins;
pub mod c_emit;
pub mod lua_emit;

use thiserror::Error;

use crate::analyzer::Context;
use crate::ast::NodeRef;

pub use c_emit::CEmitter;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("unknown generator '{0}'")]
    UnknownGenerator(String),
    #[error("code generation failed: {0}")]
    Internal(String),
}

/// Generate the output translation unit for an analyzed root block
pub fn generate(
    ctx: &Context,
    root: &NodeRef,
    generator: &str,
    is_lib: bool,
) -> Result<String, GenerateError> {
    match generator {
        "c" => c_emit::emit_unit(ctx, root, is_lib),
        "lua" => lua_emit::emit_unit(ctx, root),
        other => Err(GenerateError::UnknownGenerator(other.to_string())),
    }
}
