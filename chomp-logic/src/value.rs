use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransformError;

/// Declared column type of a resource field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Ufloat32,
    #[default]
    Float64,
    Ufloat64,
    Bool,
    Timestamp,
    String,
    Binary,
    Varbinary,
}

impl FieldType {
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            FieldType::Uint8
                | FieldType::Uint16
                | FieldType::Uint32
                | FieldType::Uint64
                | FieldType::Ufloat32
                | FieldType::Ufloat64
        )
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            FieldType::Int8 => "int8",
            FieldType::Uint8 => "uint8",
            FieldType::Int16 => "int16",
            FieldType::Uint16 => "uint16",
            FieldType::Int32 => "int32",
            FieldType::Uint32 => "uint32",
            FieldType::Int64 => "int64",
            FieldType::Uint64 => "uint64",
            FieldType::Float32 => "float32",
            FieldType::Ufloat32 => "ufloat32",
            FieldType::Float64 => "float64",
            FieldType::Ufloat64 => "ufloat64",
            FieldType::Bool => "bool",
            FieldType::Timestamp => "timestamp",
            FieldType::String => "string",
            FieldType::Binary => "binary",
            FieldType::Varbinary => "varbinary",
        }
    }
}

/// Runtime scalar flowing through selection, transformation and storage.
/// `List` only appears between phases (tuples, epoch aggregates); coercion
/// to a declared scalar type is the last step before a row is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Str(String),
    List(Vec<Value>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" | "" => Some(false),
                _ => None,
            },
            Value::Null => Some(false),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Flatten a decoded JSON payload fragment into a runtime scalar.
    /// Objects keep their JSON text form; nothing in the pipeline selects
    /// through a Value once extracted.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Str(json.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::UInt(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(format!("0x{}", hex::encode(b))),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Cast into the declared field type. Failure is a tick-level error.
    pub fn coerce(&self, ty: FieldType, field: &str) -> Result<Value, TransformError> {
        let fail = || TransformError::Coercion {
            field: field.to_string(),
            ty: ty.sql_name().to_string(),
            value: format!("{self}"),
        };

        if self.is_null() {
            return Err(fail());
        }

        let coerced = match ty {
            FieldType::Int8 => self.to_int_ranged(i8::MIN as i64, i8::MAX as i64),
            FieldType::Int16 => self.to_int_ranged(i16::MIN as i64, i16::MAX as i64),
            FieldType::Int32 => self.to_int_ranged(i32::MIN as i64, i32::MAX as i64),
            FieldType::Int64 => self.to_int_ranged(i64::MIN, i64::MAX),
            FieldType::Uint8 => self.to_uint_ranged(u8::MAX as u64),
            FieldType::Uint16 => self.to_uint_ranged(u16::MAX as u64),
            FieldType::Uint32 => self.to_uint_ranged(u32::MAX as u64),
            FieldType::Uint64 => self.to_uint_ranged(u64::MAX),
            FieldType::Float32 | FieldType::Float64 => self.as_f64().map(Value::Float),
            FieldType::Ufloat32 | FieldType::Ufloat64 => self
                .as_f64()
                .filter(|v| *v >= 0.0)
                .map(Value::Float),
            FieldType::Bool => self.as_bool().map(Value::Bool),
            FieldType::Timestamp => self.to_timestamp(),
            FieldType::String => Some(Value::Str(self.to_string())),
            FieldType::Binary | FieldType::Varbinary => self.to_bytes(),
        };

        coerced.ok_or_else(fail)
    }

    fn to_int_ranged(&self, min: i64, max: i64) -> Option<Value> {
        let v = match self {
            Value::Int(v) => *v,
            Value::UInt(v) => i64::try_from(*v).ok()?,
            Value::Float(v) if v.fract() == 0.0 => *v as i64,
            Value::Float(v) => v.round() as i64,
            Value::Bool(v) => *v as i64,
            Value::Str(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        (min..=max).contains(&v).then_some(Value::Int(v))
    }

    fn to_uint_ranged(&self, max: u64) -> Option<Value> {
        let v = match self {
            Value::Int(v) => u64::try_from(*v).ok()?,
            Value::UInt(v) => *v,
            Value::Float(v) if *v >= 0.0 => v.round() as u64,
            Value::Bool(v) => *v as u64,
            Value::Str(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        (v <= max).then_some(Value::UInt(v))
    }

    fn to_timestamp(&self) -> Option<Value> {
        match self {
            Value::Timestamp(ts) => Some(Value::Timestamp(*ts)),
            Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single().map(Value::Timestamp),
            Value::UInt(secs) => Utc
                .timestamp_opt(*secs as i64, 0)
                .single()
                .map(Value::Timestamp),
            Value::Float(secs) => Utc
                .timestamp_opt(*secs as i64, 0)
                .single()
                .map(Value::Timestamp),
            Value::Str(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc))),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Option<Value> {
        match self {
            Value::Bytes(b) => Some(Value::Bytes(b.clone())),
            Value::Str(s) => {
                let s = s.strip_prefix("0x").unwrap_or(s);
                hex::decode(s).ok().map(Value::Bytes)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}
