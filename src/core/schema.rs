// Table schemas and the pure record validator.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::error::{Error, ErrorKind, Violation};
use crate::core::value::{Record, Value};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TypeTag {
    Integer,
    Float,
    String,
    Boolean,
}

impl TypeTag {
    /// Canonical short name, also used in the durable file.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Integer => "int",
            TypeTag::Float => "float",
            TypeTag::String => "str",
            TypeTag::Boolean => "bool",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (TypeTag::Integer, Value::Integer(_))
                | (TypeTag::Float, Value::Float(_))
                | (TypeTag::String, Value::String(_))
                | (TypeTag::Boolean, Value::Boolean(_))
        )
    }

    /// The tag a legacy file's first row implies for a value, if any.
    pub(crate) fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(_) => Some(TypeTag::Integer),
            Value::Float(_) => Some(TypeTag::Float),
            Value::String(_) => Some(TypeTag::String),
            Value::Boolean(_) => Some(TypeTag::Boolean),
            Value::Null => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TypeTag {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "int" | "integer" => Ok(TypeTag::Integer),
            "float" => Ok(TypeTag::Float),
            "str" | "string" => Ok(TypeTag::String),
            "bool" | "boolean" => Ok(TypeTag::Boolean),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown type tag '{other}'"))
                .with_hint("Use one of: int, float, str, bool.")),
        }
    }
}

impl Serialize for TypeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Field-name to type-tag mapping used for validation only.
///
/// Permissive by default: fields the schema does not declare are accepted.
/// A strict schema rejects undeclared fields.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Schema {
    fields: BTreeMap<String, TypeTag>,
    strict: bool,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, tag: TypeTag) -> Self {
        self.fields.insert(field.into(), tag);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn field(&self, name: &str) -> Option<TypeTag> {
        self.fields.get(name).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, TypeTag)> {
        self.fields.iter().map(|(name, tag)| (name.as_str(), *tag))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses `{"field": "int", ...}` as sent by adapters.
    pub fn from_json(value: &serde_json::Value, strict: bool) -> Result<Self, Error> {
        let object = value.as_object().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("schema must be a JSON object")
        })?;
        let mut schema = Schema::new();
        for (name, tag) in object {
            let tag = tag.as_str().ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("schema type for '{name}' must be a string"))
            })?;
            schema = schema.with(name.clone(), tag.parse()?);
        }
        schema.strict = strict;
        Ok(schema)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields()
            .map(|(name, tag)| (name.to_string(), serde_json::Value::from(tag.name())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// Schema implied by the first row of a legacy file.
    pub(crate) fn infer(row: &Record) -> Self {
        let fields = row
            .fields()
            .filter_map(|(name, value)| TypeTag::infer(value).map(|tag| (name.to_string(), tag)))
            .collect();
        Self {
            fields,
            strict: false,
        }
    }

    pub(crate) fn from_parts(fields: BTreeMap<String, TypeTag>, strict: bool) -> Self {
        Self { fields, strict }
    }
}

/// Checks type correctness of the fields `record` carries.
///
/// Declared fields missing from the record are fine, `Null` is accepted for
/// every tag, and integers never satisfy `float` (or the reverse).
pub fn validate(schema: &Schema, record: &Record) -> Result<(), Violation> {
    for (name, value) in record.fields() {
        match schema.field(name) {
            Some(tag) if !tag.accepts(value) => {
                return Err(Violation {
                    field: name.to_string(),
                    expected: Some(tag),
                    actual: value.type_name(),
                });
            }
            Some(_) => {}
            None if schema.strict => {
                return Err(Violation {
                    field: name.to_string(),
                    expected: None,
                    actual: value.type_name(),
                });
            }
            None => {}
        }
    }
    Ok(())
}
