//! Driver configuration parsed from command line arguments

use std::path::Path;

use thiserror::Error;

use crate::types::Value;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("missing value for option '{0}'")]
    MissingValue(String),
    #[error("failed parsing parameter '{0}'")]
    BadParameter(String),
    #[error("{0} is not a valid directory")]
    InvalidDirectory(String),
    #[error("no input file given")]
    NoInput,
}

/// Where the pipeline stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lint,
    Analyze,
    CompileCode,
    CompileBinary,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub input: Option<String>,
    pub eval: Option<String>,
    pub generator: String,
    pub stage: Stage,
    pub defines: Vec<(String, Value)>,
    pub pragmas: Vec<(String, Value)>,
    /// Module search path entries (directories or `?` patterns)
    pub path: Vec<String>,
    pub cc: String,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    pub shared: bool,
    pub static_lib: bool,
    pub output: Option<String>,
    pub no_cache: bool,
    pub cache_dir: String,
    pub print_ast: bool,
    pub print_analyzed_ast: bool,
    pub print_code: bool,
    pub debug_resolve: bool,
    pub debug_scope_resolve: bool,
    pub verbose: bool,
    pub timing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: None,
            eval: None,
            generator: "c".to_string(),
            stage: Stage::CompileBinary,
            defines: Vec::new(),
            pragmas: Vec::new(),
            path: vec!["./?.skn".to_string()],
            cc: "cc".to_string(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            shared: false,
            static_lib: false,
            output: None,
            no_cache: false,
            cache_dir: "skarn_cache".to_string(),
            print_ast: false,
            print_analyzed_ast: false,
            print_code: false,
            debug_resolve: false,
            debug_scope_resolve: false,
            verbose: false,
            timing: false,
        }
    }
}

/// Parse command line arguments (program name excluded)
pub fn parse_args(args: &[String]) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let mut value_of = |name: &str| -> Result<String, ConfigError> {
            iter.next()
                .cloned()
                .ok_or_else(|| ConfigError::MissingValue(name.to_string()))
        };
        match arg.as_str() {
            "--generator" => {
                let v = value_of("--generator")?;
                if v != "c" && v != "lua" {
                    return Err(ConfigError::BadParameter(v));
                }
                config.generator = v;
            }
            "--compile-code" => config.stage = Stage::CompileCode,
            "--compile-binary" => config.stage = Stage::CompileBinary,
            "--analyze" => config.stage = Stage::Analyze,
            "--lint" => config.stage = Stage::Lint,
            "--eval" => config.eval = Some(value_of("--eval")?),
            "--no-cache" => config.no_cache = true,
            "--cache-dir" => config.cache_dir = value_of("--cache-dir")?,
            "--define" | "-D" => {
                let v = value_of("-D")?;
                config.defines.push(parse_assignment(&v)?);
            }
            "--pragma" | "-P" => {
                let v = value_of("-P")?;
                config.pragmas.push(parse_assignment(&v)?);
            }
            "--path" | "-L" => {
                let v = value_of("--path")?;
                config.path.push(validate_path_entry(v)?);
            }
            "--cc" => config.cc = value_of("--cc")?,
            "--cflags" => config
                .cflags
                .extend(value_of("--cflags")?.split_whitespace().map(String::from)),
            "--ldflags" => config
                .ldflags
                .extend(value_of("--ldflags")?.split_whitespace().map(String::from)),
            "--shared" => config.shared = true,
            "--static" => config.static_lib = true,
            "-o" => config.output = Some(value_of("-o")?),
            "--print-ast" => config.print_ast = true,
            "--print-analyzed-ast" => config.print_analyzed_ast = true,
            "--print-code" => config.print_code = true,
            "--debug-resolve" => config.debug_resolve = true,
            "--debug-scope-resolve" => config.debug_scope_resolve = true,
            "--verbose" => config.verbose = true,
            "--timing" => config.timing = true,
            arg if arg.starts_with("-D") && arg.len() > 2 => {
                config.defines.push(parse_assignment(&arg[2..])?);
            }
            arg if arg.starts_with("-P") && arg.len() > 2 => {
                config.pragmas.push(parse_assignment(&arg[2..])?);
            }
            arg if arg.starts_with("-L") && arg.len() > 2 => {
                config.path.push(validate_path_entry(arg[2..].to_string())?);
            }
            arg if arg.starts_with('-') => {
                return Err(ConfigError::UnknownOption(arg.to_string()));
            }
            _ => {
                if config.input.is_none() {
                    config.input = Some(arg.clone());
                } else {
                    return Err(ConfigError::BadParameter(arg.clone()));
                }
            }
        }
    }

    if config.input.is_none() && config.eval.is_none() {
        return Err(ConfigError::NoInput);
    }
    Ok(config)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Parse `NAME` or `NAME=value` for `-D` and `-P`
fn parse_assignment(text: &str) -> Result<(String, Value), ConfigError> {
    let (name, value) = match text.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (text, None),
    };
    if !is_identifier(name) {
        return Err(ConfigError::BadParameter(name.to_string()));
    }
    let value = match value {
        None => Value::Bool(true),
        Some("true") => Value::Bool(true),
        Some("false") => Value::Bool(false),
        Some(v) => {
            let stripped = v
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| v.strip_prefix('"').and_then(|v| v.strip_suffix('"')));
            match stripped {
                Some(s) => Value::Str(s.to_string()),
                None => {
                    if let Ok(i) = v.parse::<i128>() {
                        Value::Int(i)
                    } else if let Ok(f) = v.parse::<f64>() {
                        Value::Float(f)
                    } else {
                        Value::Str(v.to_string())
                    }
                }
            }
        }
    };
    Ok((name.to_string(), value))
}

/// A path entry is either a bare directory (validated) or a `?` pattern
fn validate_path_entry(entry: String) -> Result<String, ConfigError> {
    if entry.contains('?') {
        return Ok(entry);
    }
    if !Path::new(&entry).is_dir() {
        return Err(ConfigError::InvalidDirectory(entry));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_args(&args)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--eval", "local a = 1"]).unwrap();
        assert_eq!(config.generator, "c");
        assert_eq!(config.stage, Stage::CompileBinary);
        assert!(!config.no_cache);
    }

    #[test]
    fn test_unknown_option() {
        let err = parse(&["--frobnicate", "x"]).unwrap_err();
        assert_eq!(err.to_string(), "unknown option '--frobnicate'");
    }

    #[test]
    fn test_define_forms() {
        let config = parse(&[
            "-D", "DEF1", "-DDEF2", "-D", "DEF3=1", "-DDEF4='asd'", "--eval", "",
        ])
        .unwrap();
        assert_eq!(config.defines.len(), 4);
        assert_eq!(config.defines[0], ("DEF1".into(), Value::Bool(true)));
        assert_eq!(config.defines[1], ("DEF2".into(), Value::Bool(true)));
        assert_eq!(config.defines[2], ("DEF3".into(), Value::Int(1)));
        assert_eq!(config.defines[3], ("DEF4".into(), Value::Str("asd".into())));
    }

    #[test]
    fn test_bad_define_name() {
        let err = parse(&["-D1", "--eval", ""]).unwrap_err();
        assert_eq!(err.to_string(), "failed parsing parameter '1'");
    }

    #[test]
    fn test_invalid_path_directory() {
        let err = parse(&["--path", "/no/such/dir/here", "--eval", ""]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "/no/such/dir/here is not a valid directory"
        );
    }

    #[test]
    fn test_question_pattern_path_is_accepted() {
        let config = parse(&["--path", "/no/such/dir/?.skn", "--eval", ""]).unwrap();
        assert!(config.path.contains(&"/no/such/dir/?.skn".to_string()));
    }

    #[test]
    fn test_generator_selection() {
        let config = parse(&["--generator", "lua", "--eval", ""]).unwrap();
        assert_eq!(config.generator, "lua");
        let err = parse(&["--generator", "js", "--eval", ""]).unwrap_err();
        assert!(err.to_string().contains("failed parsing parameter"));
    }

    #[test]
    fn test_stage_flags() {
        assert_eq!(parse(&["--lint", "--eval", ""]).unwrap().stage, Stage::Lint);
        assert_eq!(
            parse(&["--analyze", "--eval", ""]).unwrap().stage,
            Stage::Analyze
        );
        assert_eq!(
            parse(&["--compile-code", "--eval", ""]).unwrap().stage,
            Stage::CompileCode
        );
    }
}
