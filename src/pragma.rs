//! Pragma map: configuration tokens mutated during analysis
//!
//! Field pragmas are plain keyed values validated on assignment; call
//! pragmas validate their argument tuple and accumulate (toolchain flags,
//! link libraries, C includes). A stack supports `require`, which analyzes
//! the loaded module with the requester's pragmas pushed.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::Value;

#[derive(Error, Debug)]
pub enum PragmaError {
    #[error("unknown pragma '{0}'")]
    Unknown(String),
    #[error("invalid value for pragma '{name}': expected {expected}")]
    InvalidValue { name: String, expected: &'static str },
    #[error("invalid arguments for pragma '{name}': expected {expected}")]
    InvalidArguments { name: String, expected: &'static str },
}

/// Recognized field pragmas and the value shape each accepts
const FIELD_PRAGMAS: &[(&str, &str)] = &[
    ("nochecks", "boolean"),
    ("noabort", "boolean"),
    ("nogc", "boolean"),
    ("unitname", "string"),
    ("cflags", "string"),
    ("ldflags", "string"),
    ("linklib", "string"),
];

#[derive(Debug, Default, Clone)]
pub struct Pragmas {
    fields: HashMap<String, Value>,
    stack: Vec<HashMap<String, Value>>,
    cflags: Vec<String>,
    ldflags: Vec<String>,
    linklibs: Vec<String>,
    cincludes: Vec<String>,
}

impl Pragmas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_field_pragma(name: &str) -> bool {
        FIELD_PRAGMAS.iter().any(|(n, _)| *n == name)
    }

    fn expected_shape(name: &str) -> Option<&'static str> {
        FIELD_PRAGMAS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, shape)| *shape)
    }

    /// Assign a field pragma, validating the value shape
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), PragmaError> {
        let expected = Self::expected_shape(name).ok_or_else(|| PragmaError::Unknown(name.into()))?;
        let ok = match expected {
            "boolean" => matches!(value, Value::Bool(_)),
            "string" => matches!(value, Value::Str(_)),
            _ => false,
        };
        if !ok {
            return Err(PragmaError::InvalidValue {
                name: name.into(),
                expected,
            });
        }
        // Toolchain flag pragmas accumulate rather than overwrite
        if let Value::Str(s) = &value {
            match name {
                "cflags" => self.cflags.push(s.clone()),
                "ldflags" => self.ldflags.push(s.clone()),
                "linklib" => self.linklibs.push(s.clone()),
                _ => {}
            }
        }
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn nochecks(&self) -> bool {
        matches!(self.fields.get("nochecks"), Some(Value::Bool(true)))
    }

    pub fn noabort(&self) -> bool {
        matches!(self.fields.get("noabort"), Some(Value::Bool(true)))
    }

    /// Invoke a call-form pragma, validating the argument tuple
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<(), PragmaError> {
        match name {
            "cinclude" | "cflags" | "ldflags" | "linklib" => {
                let arg = match args {
                    [Value::Str(s)] => s.clone(),
                    _ => {
                        return Err(PragmaError::InvalidArguments {
                            name: name.into(),
                            expected: "(string)",
                        })
                    }
                };
                match name {
                    "cinclude" => self.cincludes.push(arg),
                    "cflags" => self.cflags.push(arg),
                    "ldflags" => self.ldflags.push(arg),
                    _ => self.linklibs.push(arg),
                }
                Ok(())
            }
            _ => Err(PragmaError::Unknown(name.into())),
        }
    }

    /// Push the current pragma state (entering a required module)
    pub fn push(&mut self) {
        self.stack.push(self.fields.clone());
    }

    /// Pop back to the state before the matching push
    pub fn pop(&mut self) {
        if let Some(fields) = self.stack.pop() {
            self.fields = fields;
        }
    }

    pub fn cflags(&self) -> &[String] {
        &self.cflags
    }

    pub fn ldflags(&self) -> &[String] {
        &self.ldflags
    }

    pub fn linklibs(&self) -> &[String] {
        &self.linklibs
    }

    pub fn cincludes(&self) -> &[String] {
        &self.cincludes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_pragma_validation() {
        let mut pragmas = Pragmas::new();
        pragmas.set_field("nochecks", Value::Bool(true)).unwrap();
        assert!(pragmas.nochecks());
        let err = pragmas.set_field("nochecks", Value::Int(1));
        assert!(matches!(err, Err(PragmaError::InvalidValue { .. })));
        let err = pragmas.set_field("nosuchpragma", Value::Bool(true));
        assert!(matches!(err, Err(PragmaError::Unknown(_))));
    }

    #[test]
    fn test_call_pragma_tuple_validation() {
        let mut pragmas = Pragmas::new();
        pragmas.call("cinclude", &[Value::Str("<math.h>".into())]).unwrap();
        assert_eq!(pragmas.cincludes(), ["<math.h>"]);
        let err = pragmas.call("cinclude", &[Value::Int(1)]);
        assert!(matches!(err, Err(PragmaError::InvalidArguments { .. })));
        let err = pragmas.call("cinclude", &[]);
        assert!(matches!(err, Err(PragmaError::InvalidArguments { .. })));
    }

    #[test]
    fn test_flag_pragmas_accumulate() {
        let mut pragmas = Pragmas::new();
        pragmas.set_field("cflags", Value::Str("-O2".into())).unwrap();
        pragmas.call("cflags", &[Value::Str("-g".into())]).unwrap();
        assert_eq!(pragmas.cflags(), ["-O2", "-g"]);
    }

    #[test]
    fn test_push_pop_restores_fields() {
        let mut pragmas = Pragmas::new();
        pragmas.set_field("nochecks", Value::Bool(true)).unwrap();
        pragmas.push();
        pragmas.set_field("nochecks", Value::Bool(false)).unwrap();
        assert!(!pragmas.nochecks());
        pragmas.pop();
        assert!(pragmas.nochecks());
    }
}
