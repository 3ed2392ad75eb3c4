//! Parameter validation against a code version's declared schema.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::model::ParamSpec;

/// Declared parameter types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    Array,
    Dictionary,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Array => "array",
            ParamType::Dictionary => "dictionary",
        }
    }

    fn accepts(self, kind: JsonKind) -> bool {
        matches!(
            (self, kind),
            (ParamType::String, JsonKind::String)
                | (ParamType::Int, JsonKind::Number)
                | (ParamType::Float, JsonKind::Number)
                | (ParamType::Bool, JsonKind::Bool)
                | (ParamType::Array, JsonKind::Array)
                | (ParamType::Dictionary, JsonKind::Object)
        )
    }
}

impl FromStr for ParamType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ParamType::String),
            "int" => Ok(ParamType::Int),
            "float" => Ok(ParamType::Float),
            "bool" => Ok(ParamType::Bool),
            "array" => Ok(ParamType::Array),
            "dictionary" => Ok(ParamType::Dictionary),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime type of a decoded JSON value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Bool,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonKind::Null => "null",
            JsonKind::Bool => "bool",
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("missing key '{name}' in parameters")]
    Missing { name: String },
    #[error("mismatched type '{actual}' for parameter '{name}': expected '{expected}'")]
    Mismatch {
        name: String,
        actual: JsonKind,
        expected: ParamType,
    },
    /// The schema itself is bad; callers treat this as an internal error.
    #[error("unexpected type '{declared}' for param '{name}'")]
    UnknownType { name: String, declared: String },
}

impl ParamError {
    pub fn is_schema_error(&self) -> bool {
        matches!(self, ParamError::UnknownType { .. })
    }
}

/// Check caller parameters against `schema`.
///
/// The result holds exactly the declared names; undeclared caller keys are
/// dropped. `int` parameters are truncated to integers.
pub fn validate(
    schema: &[ParamSpec],
    params: &Map<String, Value>,
) -> Result<Map<String, Value>, ParamError> {
    let mut out = Map::new();

    for spec in schema {
        let declared: ParamType = spec.kind.parse().map_err(|_| ParamError::UnknownType {
            name: spec.name.clone(),
            declared: spec.kind.clone(),
        })?;

        let value = params.get(&spec.name).ok_or_else(|| ParamError::Missing {
            name: spec.name.clone(),
        })?;

        let actual = JsonKind::of(value);
        if !declared.accepts(actual) {
            return Err(ParamError::Mismatch {
                name: spec.name.clone(),
                actual,
                expected: declared,
            });
        }

        let converted = match (declared, value) {
            (ParamType::Int, Value::Number(n)) => Value::from(truncate(n)),
            _ => value.clone(),
        };
        out.insert(spec.name.clone(), converted);
    }

    Ok(out)
}

fn truncate(n: &serde_json::Number) -> i64 {
    match n.as_i64() {
        Some(i) => i,
        // `as` saturates at the i64 bounds
        None => n.as_f64().map(|f| f.trunc() as i64).unwrap_or(i64::MAX),
    }
}
