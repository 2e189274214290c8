//! Typed process variables
//!
//! Executions carry a map of named, typed values. Values are validated
//! against the definition's variable declarations when written, so type
//! mismatches surface at the step that produced them rather than at read
//! time in a later Switch or query binding.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared data type of a process variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    String,
    Int,
    Decimal,
    Bool,
    DateTime,
    Text,
    Json,
}

/// A typed process-variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VarValue {
    String(String),
    Int(i64),
    Decimal(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Text(String),
    Json(serde_json::Value),
}

impl VarValue {
    pub fn kind(&self) -> VarType {
        match self {
            Self::String(_) => VarType::String,
            Self::Int(_) => VarType::Int,
            Self::Decimal(_) => VarType::Decimal,
            Self::Bool(_) => VarType::Bool,
            Self::DateTime(_) => VarType::DateTime,
            Self::Text(_) => VarType::Text,
            Self::Json(_) => VarType::Json,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view used by ordered comparisons; Int widens to f64
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Whether the value counts as empty for `IsEmpty` conditions
    pub fn is_empty(&self) -> bool {
        match self {
            Self::String(s) | Self::Text(s) => s.trim().is_empty(),
            Self::Json(v) => match v {
                serde_json::Value::Null => true,
                serde_json::Value::String(s) => s.is_empty(),
                serde_json::Value::Array(a) => a.is_empty(),
                serde_json::Value::Object(o) => o.is_empty(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Render for message template substitution
    pub fn render(&self) -> String {
        match self {
            Self::String(s) | Self::Text(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::DateTime(dt) => dt.to_rfc3339(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Best-effort conversion from a raw JSON value (query results,
    /// callback payloads). Scalars map to their natural kinds; everything
    /// else is carried as `Json`.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Decimal(n.as_f64().unwrap_or(0.0))
                }
            }
            other => Self::Json(other),
        }
    }
}

/// Variable declaration carried on the workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub data_type: VarType,
}

/// Error raised when a write does not match the declared type
#[derive(Debug, thiserror::Error)]
#[error("variable '{name}' declared as {declared:?}, got {actual:?}")]
pub struct VariableTypeError {
    pub name: String,
    pub declared: VarType,
    pub actual: VarType,
}

/// The process-variable map of one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, VarValue>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.0.get(name)
    }

    /// Set without a declaration check (engine-internal writes)
    pub fn set(&mut self, name: impl Into<String>, value: VarValue) {
        self.0.insert(name.into(), value);
    }

    /// Set a declared variable, rejecting type mismatches.
    /// `Text` declarations accept plain `String` values.
    pub fn set_checked(
        &mut self,
        decl: &VariableDecl,
        value: VarValue,
    ) -> Result<(), VariableTypeError> {
        let actual = value.kind();
        let compatible = actual == decl.data_type
            || (decl.data_type == VarType::Text && actual == VarType::String);
        if !compatible {
            return Err(VariableTypeError {
                name: decl.name.clone(),
                declared: decl.data_type,
                actual,
            });
        }
        self.0.insert(decl.name.clone(), value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<VarValue> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarValue)> {
        self.0.iter()
    }

    pub fn merge(&mut self, other: Variables) {
        self.0.extend(other.0);
    }
}

impl FromIterator<(String, VarValue)> for Variables {
    fn from_iter<T: IntoIterator<Item = (String, VarValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_checked_accepts_matching_type() {
        let decl = VariableDecl {
            name: "age".to_string(),
            data_type: VarType::Int,
        };
        let mut vars = Variables::new();
        vars.set_checked(&decl, VarValue::Int(30)).unwrap();
        assert_eq!(vars.get("age"), Some(&VarValue::Int(30)));
    }

    #[test]
    fn set_checked_rejects_mismatch() {
        let decl = VariableDecl {
            name: "age".to_string(),
            data_type: VarType::Int,
        };
        let mut vars = Variables::new();
        let err = vars
            .set_checked(&decl, VarValue::String("thirty".to_string()))
            .unwrap_err();
        assert_eq!(err.declared, VarType::Int);
        assert_eq!(err.actual, VarType::String);
        assert!(vars.get("age").is_none());
    }

    #[test]
    fn text_declaration_accepts_string_value() {
        let decl = VariableDecl {
            name: "notes".to_string(),
            data_type: VarType::Text,
        };
        let mut vars = Variables::new();
        vars.set_checked(&decl, VarValue::String("ok".to_string()))
            .unwrap();
    }

    #[test]
    fn from_json_maps_scalars() {
        assert_eq!(
            VarValue::from_json(serde_json::json!("x")),
            VarValue::String("x".to_string())
        );
        assert_eq!(VarValue::from_json(serde_json::json!(3)), VarValue::Int(3));
        assert_eq!(
            VarValue::from_json(serde_json::json!(1.5)),
            VarValue::Decimal(1.5)
        );
        assert!(matches!(
            VarValue::from_json(serde_json::json!({"a": 1})),
            VarValue::Json(_)
        ));
    }

    #[test]
    fn empty_checks() {
        assert!(VarValue::String("  ".to_string()).is_empty());
        assert!(VarValue::Json(serde_json::Value::Null).is_empty());
        assert!(!VarValue::Int(0).is_empty());
    }
}
