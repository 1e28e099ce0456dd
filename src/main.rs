//! Skarn CLI - compile Skarn sources to C (or Lua) and native binaries

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::time::Instant;

use skarn::analyzer::{AnalyzeError, Analyzer, Context};
use skarn::ast;
use skarn::codegen;
use skarn::config::{self, Config, Stage};
use skarn::errors::Colors;
use skarn::parser;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = match config::parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    if let Err(message) = run(&config) {
        eprintln!("{}", message);
        process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), String> {
    let started = Instant::now();

    let (filename, source) = match (&config.eval, &config.input) {
        (Some(code), _) => ("eval".to_string(), code.clone()),
        (None, Some(path)) => {
            let source = fs::read_to_string(path)
                .map_err(|_| format!("{}: No such file or directory", path))?;
            (path.clone(), source)
        }
        (None, None) => return Err("no input file given".to_string()),
    };

    let mut ctx = Context::new(&filename, &source);
    ctx.generator = config.generator.clone();
    ctx.debug_resolve = config.debug_resolve;
    ctx.debug_scope_resolve = config.debug_scope_resolve;
    ctx.search_paths = config.path.clone();
    for (name, value) in &config.defines {
        ctx.defines.insert(name.clone(), value.clone());
    }
    for (name, value) in &config.pragmas {
        ctx.pragmas
            .set_field(name, value.clone())
            .map_err(|e| e.to_string())?;
    }

    // Parse
    let root = match parser::parse_source(&source, &ctx.builder) {
        Ok(root) => root,
        Err(e) => {
            let (line, column) = ctx.source_map.position(e.span().start);
            return Err(format!("{}:{}:{}: {}", filename, line, column, e));
        }
    };
    if config.print_ast {
        print!("{}", ast::dump(&root));
        return Ok(());
    }

    // Analyze
    let mut analyzer = Analyzer::new(ctx);
    if let Err(e) = analyzer.analyze(&root) {
        return Err(render_analyze_error(&analyzer.ctx, &filename, &e));
    }
    if !analyzer.ctx.diagnostics.is_empty() {
        let colors = Colors::new(std::io::stderr().is_terminal());
        for diag in &analyzer.ctx.diagnostics {
            eprintln!("{}", diag.render(&analyzer.ctx.source_map, &filename, &colors));
        }
        return Err(format!(
            "compilation failed with {} error(s)",
            analyzer.ctx.diagnostics.len()
        ));
    }
    if config.print_analyzed_ast {
        print!("{}", ast::dump_analyzed(&root));
        return Ok(());
    }
    if config.verbose {
        eprintln!("analyzed {} ok", filename);
    }
    if matches!(config.stage, Stage::Lint | Stage::Analyze) {
        if config.timing {
            eprintln!("elapsed: {:.3}s", started.elapsed().as_secs_f64());
        }
        return Ok(());
    }

    // Generate
    let is_lib = config.shared || config.static_lib;
    let code = codegen::generate(&analyzer.ctx, &root, &config.generator, is_lib)
        .map_err(|e| e.to_string())?;
    if config.print_code {
        print!("{}", code);
        return Ok(());
    }

    let code_path = write_code(config, &filename, &code)?;
    if config.verbose {
        eprintln!("generated {}", code_path.display());
    }
    if config.stage == Stage::CompileCode || config.generator == "lua" {
        if config.timing {
            eprintln!("elapsed: {:.3}s", started.elapsed().as_secs_f64());
        }
        return Ok(());
    }

    compile_binary(config, &analyzer.ctx, &filename, &code_path)?;
    if config.timing {
        eprintln!("elapsed: {:.3}s", started.elapsed().as_secs_f64());
    }
    Ok(())
}

fn render_analyze_error(ctx: &Context, filename: &str, error: &AnalyzeError) -> String {
    let span = match error {
        AnalyzeError::Preprocess(e) => Some(e.span.clone()),
        AnalyzeError::Fatal { span, .. } => Some(span.clone()),
        AnalyzeError::PolyInstantiation { .. } => None,
    };
    match span {
        Some(span) => {
            let (line, column) = ctx.source_map.position(span.start);
            format!("{}:{}:{}: {}", filename, line, column, error)
        }
        None => format!("{}: {}", filename, error),
    }
}

/// Content-addressed cache key for a compilation
fn cache_key(config: &Config, source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    config.cc.hash(&mut hasher);
    config.generator.hash(&mut hasher);
    config.cflags.hash(&mut hasher);
    config.ldflags.hash(&mut hasher);
    config.shared.hash(&mut hasher);
    config.static_lib.hash(&mut hasher);
    hasher.finish()
}

fn write_code(config: &Config, _filename: &str, code: &str) -> Result<PathBuf, String> {
    let extension = if config.generator == "lua" { "lua" } else { "c" };
    let dir = if config.no_cache {
        env::temp_dir()
    } else {
        let dir = PathBuf::from(&config.cache_dir);
        fs::create_dir_all(&dir)
            .map_err(|e| format!("failed creating cache directory: {}", e))?;
        dir
    };
    let key = cache_key(config, code);
    let path = dir.join(format!("skarn_{:016x}.{}", key, extension));
    // Determinism makes the cached unit content-equal; skip the write then
    let unchanged = fs::read_to_string(&path)
        .map(|existing| existing == code)
        .unwrap_or(false);
    if !unchanged {
        fs::write(&path, code).map_err(|e| format!("failed writing output: {}", e))?;
    }
    Ok(path)
}

fn compile_binary(
    config: &Config,
    ctx: &Context,
    filename: &str,
    code_path: &Path,
) -> Result<(), String> {
    // Probe the external compiler before driving it
    let probe = Command::new(&config.cc).arg("--version").output();
    if probe.map(|o| !o.status.success()).unwrap_or(true) {
        return Err("failed to retrieve compiler information".to_string());
    }

    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out")
        .to_string();
    let output = config.output.clone().unwrap_or_else(|| {
        if config.shared {
            format!("lib{}.so", stem)
        } else if config.static_lib {
            format!("lib{}.a", stem)
        } else {
            stem.clone()
        }
    });

    let mut cmd = Command::new(&config.cc);
    cmd.arg(code_path);
    if config.shared {
        cmd.arg("-shared").arg("-fPIC");
    } else if config.static_lib {
        cmd.arg("-c");
    }
    for flag in config.cflags.iter().chain(ctx.pragmas.cflags()) {
        cmd.arg(flag);
    }
    let object_output = if config.static_lib {
        format!("{}.o", output)
    } else {
        output.clone()
    };
    cmd.arg("-o").arg(&object_output);
    if !config.static_lib {
        for flag in config.ldflags.iter().chain(ctx.pragmas.ldflags()) {
            cmd.arg(flag);
        }
        for lib in ctx.pragmas.linklibs() {
            cmd.arg(format!("-l{}", lib));
        }
        cmd.arg("-lm");
    }
    if config.verbose {
        eprintln!("cc: {:?}", cmd);
    }
    let status = cmd
        .status()
        .map_err(|e| format!("failed running C compiler: {}", e))?;
    if !status.success() {
        return Err("C compilation failed".to_string());
    }

    // Static libraries archive the object file
    if config.static_lib {
        let status = Command::new("ar")
            .arg("rcs")
            .arg(&output)
            .arg(&object_output)
            .status()
            .map_err(|e| format!("failed running ar: {}", e))?;
        if !status.success() {
            return Err("archiving failed".to_string());
        }
        let _ = fs::remove_file(&object_output);
    }
    if config.verbose {
        eprintln!("compiled {}", output);
    }
    Ok(())
}
