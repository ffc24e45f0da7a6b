//! Declarative value shapes with parsing and normalization.
//!
//! A [`Shape`] describes the expected structure of a JSON value. Parsing
//! validates the value, applies declared defaults, and strips undeclared
//! object keys (unless the shape opts into passthrough), so the normalized
//! result is suitable for content hashing: only declared fields influence a
//! cache key.
//!
//! Shapes also support the algebra needed when composing pipelines:
//! merging two object shapes, picking a subset of fields, and augmenting a
//! shape with an extra optional field.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Error raised when a value does not fit a shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at {path}: {message}")]
pub struct SchemaError {
    /// Path to the offending value, e.g. `$.files[0].name`.
    pub path: String,
    /// What was expected.
    pub message: String,
}

impl SchemaError {
    /// Creates a new schema error.
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The expected structure of a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Any value is accepted and passed through untouched.
    Any,
    /// A boolean.
    Bool,
    /// An integer (no fractional part).
    Integer,
    /// Any JSON number.
    Number,
    /// A string.
    String,
    /// An array with homogeneous element shape.
    Array(Box<Shape>),
    /// An object with declared fields.
    Object(ObjectShape),
}

impl Shape {
    /// Starts building an object shape.
    #[must_use]
    pub fn object() -> ObjectShape {
        ObjectShape::default()
    }

    /// An array of the given element shape.
    #[must_use]
    pub fn array(element: Self) -> Self {
        Self::Array(Box::new(element))
    }

    /// Validates and normalizes a value against this shape.
    ///
    /// Declared defaults are applied for absent optional fields; undeclared
    /// object keys are stripped unless the object shape is passthrough.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] locating the first mismatch.
    pub fn parse(&self, value: &Value) -> Result<Value, SchemaError> {
        parse_at(self, value, "$")
    }

    /// Checks a value against this shape without keeping the normalized
    /// form.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] locating the first mismatch.
    pub fn check(&self, value: &Value) -> Result<(), SchemaError> {
        parse_at(self, value, "$").map(|_| ())
    }

    /// Adds an optional field to an object shape; other shapes are
    /// returned unchanged.
    ///
    /// Used when a wrapper needs to widen a pipeline's input, such as the
    /// retry layer's `attempt` counter.
    #[must_use]
    pub fn with_optional_field(self, name: impl Into<String>, shape: Self) -> Self {
        match self {
            Self::Object(object) => Self::Object(object.optional_field(name, shape)),
            other => other,
        }
    }

    /// Merges two shapes the way a shallow value merge combines results:
    /// two object shapes take the union of their fields (later fields
    /// win); any other pairing resolves to the later shape.
    #[must_use]
    pub fn merge(&self, later: &Self) -> Self {
        match (self, later) {
            (Self::Object(a), Self::Object(b)) => Self::Object(a.clone().merge(b.clone())),
            (_, other) => other.clone(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Any => "any value",
            Self::Bool => "a boolean",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::String => "a string",
            Self::Array(_) => "an array",
            Self::Object(_) => "an object",
        }
    }
}

impl From<ObjectShape> for Shape {
    fn from(object: ObjectShape) -> Self {
        Self::Object(object)
    }
}

/// A declared object field.
#[derive(Debug, Clone, PartialEq)]
struct Field {
    shape: Shape,
    required: bool,
    default: Option<Value>,
}

/// An object shape: declared fields plus a passthrough flag for
/// undeclared keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectShape {
    fields: BTreeMap<String, Field>,
    passthrough: bool,
}

impl ObjectShape {
    /// Declares a required field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.fields.insert(
            name.into(),
            Field {
                shape,
                required: true,
                default: None,
            },
        );
        self
    }

    /// Declares an optional field.
    #[must_use]
    pub fn optional_field(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.fields.insert(
            name.into(),
            Field {
                shape,
                required: false,
                default: None,
            },
        );
        self
    }

    /// Declares an optional field with a default applied when absent.
    #[must_use]
    pub fn default_field(mut self, name: impl Into<String>, shape: Shape, default: Value) -> Self {
        self.fields.insert(
            name.into(),
            Field {
                shape,
                required: false,
                default: Some(default),
            },
        );
        self
    }

    /// Keeps undeclared keys instead of stripping them.
    #[must_use]
    pub fn passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    /// Finishes building, yielding a [`Shape`].
    #[must_use]
    pub fn build(self) -> Shape {
        Shape::Object(self)
    }

    /// Union of two object shapes; fields of `later` win on conflict.
    #[must_use]
    pub fn merge(mut self, later: Self) -> Self {
        for (name, field) in later.fields {
            self.fields.insert(name, field);
        }
        self.passthrough = self.passthrough || later.passthrough;
        self
    }

    /// Keeps only the named fields.
    #[must_use]
    pub fn pick(mut self, names: &[&str]) -> Self {
        self.fields.retain(|name, _| names.contains(&name.as_str()));
        self
    }

    /// Returns true if a field with this name is declared.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

fn parse_at(shape: &Shape, value: &Value, path: &str) -> Result<Value, SchemaError> {
    match shape {
        Shape::Any => Ok(value.clone()),
        Shape::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(mismatch(path, shape, other)),
        },
        Shape::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            other => Err(mismatch(path, shape, other)),
        },
        Shape::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            other => Err(mismatch(path, shape, other)),
        },
        Shape::String => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(mismatch(path, shape, other)),
        },
        Shape::Array(element) => match value {
            Value::Array(items) => {
                let mut parsed = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    parsed.push(parse_at(element, item, &format!("{path}[{index}]"))?);
                }
                Ok(Value::Array(parsed))
            }
            other => Err(mismatch(path, shape, other)),
        },
        Shape::Object(object) => match value {
            Value::Object(map) => parse_object(object, map, path),
            other => Err(mismatch(path, shape, other)),
        },
    }
}

fn parse_object(
    object: &ObjectShape,
    map: &Map<String, Value>,
    path: &str,
) -> Result<Value, SchemaError> {
    let mut parsed = Map::new();

    for (name, field) in &object.fields {
        let field_path = format!("{path}.{name}");
        match map.get(name) {
            Some(present) => {
                parsed.insert(name.clone(), parse_at(&field.shape, present, &field_path)?);
            }
            None => {
                if let Some(default) = &field.default {
                    parsed.insert(name.clone(), default.clone());
                } else if field.required {
                    return Err(SchemaError::new(field_path, "missing required field"));
                }
            }
        }
    }

    if object.passthrough {
        for (name, val) in map {
            if !object.fields.contains_key(name) {
                parsed.insert(name.clone(), val.clone());
            }
        }
    }

    Ok(Value::Object(parsed))
}

fn mismatch(path: &str, shape: &Shape, found: &Value) -> SchemaError {
    SchemaError::new(
        path,
        format!("expected {}, found {}", shape.describe(), describe_value(found)),
    )
}

fn describe_value(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
