//! Declarative argument schemas for flow types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    String,
    Integer,
    Float,
    Bool,
    StringList,
    Object,
    Any,
}

impl ArgKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::Float => value.is_number(),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            ArgKind::Object => value.is_object(),
            ArgKind::Any => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl ArgSpec {
    pub fn required(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Ordered set of argument specs. An empty schema accepts only empty
/// argument objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgSchema {
    specs: Vec<ArgSpec>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn specs(&self) -> &[ArgSpec] {
        &self.specs
    }

    /// Returns the normalized argument object: unknown keys rejected, types
    /// checked, defaults filled in.
    pub fn validate(&self, args: &Value) -> Result<Value, String> {
        let provided = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(format!(
                    "arguments must be an object, got {}",
                    kind_name(other)
                ));
            }
        };

        if let Some(unknown) = provided
            .keys()
            .find(|key| !self.specs.iter().any(|spec| &spec.name == *key))
        {
            return Err(format!("unknown argument {unknown:?}"));
        }

        let mut normalized = Map::new();
        for spec in &self.specs {
            match provided.get(&spec.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &spec.default {
                        normalized.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(format!(
                            "missing required argument {:?}",
                            spec.name
                        ));
                    }
                }
                Some(value) if spec.kind.accepts(value) => {
                    normalized.insert(spec.name.clone(), value.clone());
                }
                Some(value) => {
                    return Err(format!(
                        "argument {:?} expects {:?}, got {}",
                        spec.name,
                        spec.kind,
                        kind_name(value)
                    ));
                }
            }
        }
        Ok(Value::Object(normalized))
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
