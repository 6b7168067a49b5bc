//! Variables de proceso.
//!
//! El engine manda y recibe variables "tipadas": `{"type": "String", "value": ..., "valueInfo": {}}`.
//! Los handlers trabajan con valores JSON planos; la conversión se hace en el borde.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Variables planas, tal como las consume y produce un handler.
pub type ProcessVariables = Map<String, Value>;

/// Variables en el formato de cable del engine, ordenadas por nombre.
pub type EngineVariables = BTreeMap<String, TypedValue>;

/// Un valor serializado del engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    #[serde(default)]
    pub value: Value,

    #[serde(
        rename = "valueInfo",
        default,
        skip_serializing_if = "Map::is_empty"
    )]
    pub value_info: Map<String, Value>,
}

impl TypedValue {
    pub fn new(value_type: &str, value: Value) -> Self {
        Self {
            value_type: Some(value_type.to_string()),
            value,
            value_info: Map::new(),
        }
    }

    fn is_json(&self) -> bool {
        self.value_type
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

/// Convierte un valor plano al formato tipado del engine.
pub fn serialize_variable(value: &Value) -> TypedValue {
    match value {
        Value::Null => TypedValue::new("Null", Value::Null),
        Value::Bool(_) => TypedValue::new("Boolean", value.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    TypedValue::new("Integer", value.clone())
                } else {
                    TypedValue::new("Long", value.clone())
                }
            } else if n.is_u64() {
                TypedValue::new("Long", value.clone())
            } else {
                TypedValue::new("Double", value.clone())
            }
        }
        Value::String(_) => TypedValue::new("String", value.clone()),
        // arrays y objetos viajan como string JSON
        Value::Array(_) | Value::Object(_) => {
            TypedValue::new("Json", Value::String(value.to_string()))
        }
    }
}

pub fn serialize_variables(variables: &ProcessVariables) -> EngineVariables {
    variables
        .iter()
        .map(|(name, value)| (name.clone(), serialize_variable(value)))
        .collect()
}

/// Convierte un valor tipado a valor plano; las variables `Json` se parsean.
pub fn deserialize_variable(typed: &TypedValue) -> Result<Value, serde_json::Error> {
    match (&typed.value, typed.is_json()) {
        (Value::String(raw), true) => serde_json::from_str(raw),
        (value, _) => Ok(value.clone()),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("The variable {0} is missing or empty.")]
pub struct MissingVariable(pub String);

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

/// Devuelve la variable `name` o `MissingVariable` si no está (o está vacía y no se permite).
pub fn check_variable<'a>(
    variables: &'a ProcessVariables,
    name: &str,
    empty_allowed: bool,
) -> Result<&'a Value, MissingVariable> {
    match variables.get(name) {
        None => Err(MissingVariable(name.to_string())),
        Some(value) if !empty_allowed && is_empty(value) => Err(MissingVariable(name.to_string())),
        Some(value) => Ok(value),
    }
}
