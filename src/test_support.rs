//! Test support infrastructure for exercising the compiler pipeline
//!
//! Tests should be able to stop at any stage: parsed AST, analyzed AST,
//! or generated code. These helpers run the pipeline up to a stage and
//! surface failures as plain strings, with diagnostics folded in.

use crate::analyzer::{Analyzer, Context};
use crate::ast::NodeRef;
use crate::codegen;
use crate::parser;
use crate::types::Value;

/// Parse a program, returning the analysis context and root block
pub fn parse_program(source: &str) -> Result<(Context, NodeRef), String> {
    let ctx = Context::new("test.skn", source);
    let root = parser::parse_source(source, &ctx.builder)
        .map_err(|e| format!("parse error: {}", e))?;
    Ok((ctx, root))
}

/// Parse and analyze, failing on any diagnostic
pub fn analyze_program(source: &str) -> Result<(Analyzer, NodeRef), String> {
    analyze_program_with(source, |_| {})
}

/// Parse and analyze with a configured context (defines, pragmas, paths)
pub fn analyze_program_with(
    source: &str,
    configure: impl FnOnce(&mut Context),
) -> Result<(Analyzer, NodeRef), String> {
    let (mut ctx, root) = parse_program(source)?;
    configure(&mut ctx);
    let mut analyzer = Analyzer::new(ctx);
    analyzer
        .analyze(&root)
        .map_err(|e| format!("analyze error: {}", e))?;
    if !analyzer.ctx.diagnostics.is_empty() {
        let messages: Vec<String> = analyzer
            .ctx
            .diagnostics
            .iter()
            .map(|d| d.message.clone())
            .collect();
        return Err(format!("diagnostics: {}", messages.join("; ")));
    }
    Ok((analyzer, root))
}

/// The error string a failing program produces. Panics on success.
pub fn analyze_error(source: &str) -> String {
    analyze_error_with(source, |_| {})
}

/// Like [`analyze_error`], with a configured context
pub fn analyze_error_with(source: &str, configure: impl FnOnce(&mut Context)) -> String {
    match analyze_program_with(source, configure) {
        Ok(_) => panic!("expected analysis of {:?} to fail", source),
        Err(e) => e,
    }
}

/// The messages of all diagnostics a program produces (empty when clean)
pub fn diagnostics_of(source: &str) -> Vec<String> {
    let (ctx, root) = match parse_program(source) {
        Ok(v) => v,
        Err(e) => return vec![e],
    };
    let mut analyzer = Analyzer::new(ctx);
    if let Err(e) = analyzer.analyze(&root) {
        return vec![e.to_string()];
    }
    analyzer
        .ctx
        .diagnostics
        .iter()
        .map(|d| d.message.clone())
        .collect()
}

/// Compile a program all the way to C text
pub fn generate_c(source: &str) -> Result<String, String> {
    generate_c_with(source, |_| {})
}

/// Compile to C with a configured context
pub fn generate_c_with(
    source: &str,
    configure: impl FnOnce(&mut Context),
) -> Result<String, String> {
    let (analyzer, root) = analyze_program_with(source, configure)?;
    codegen::generate(&analyzer.ctx, &root, "c", false).map_err(|e| format!("emit error: {}", e))
}

/// Compile a program to Lua text
pub fn generate_lua(source: &str) -> Result<String, String> {
    let (analyzer, root) = analyze_program(source)?;
    codegen::generate(&analyzer.ctx, &root, "lua", false)
        .map_err(|e| format!("emit error: {}", e))
}

/// Shorthand for define maps handed to `analyze_program_with`
pub fn define(ctx: &mut Context, name: &str, value: Value) {
    ctx.defines.insert(name.to_string(), value);
}
