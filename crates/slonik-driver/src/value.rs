//! Primitive values exchanged with the driver.

use bytes::Bytes;

use crate::error::TypeError;

/// A primitive value bound to a statement or read from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer (covers smallint/integer/bigint).
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Arbitrary precision numeric, kept in its textual form.
    Numeric(String),
    /// Text.
    Text(String),
    /// Binary payload (bytea).
    Bytes(Bytes),
    /// JSON document.
    Json(serde_json::Value),
    /// One-dimensional array.
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in type mismatch errors.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Numeric(_) => "numeric",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Bytes => Bytes,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Conversion from a [`Value`] into a Rust type.
pub trait FromValue: Sized {
    /// Convert a non-null value.
    fn from_value(value: &Value) -> Result<Self, TypeError>;

    /// Convert a possibly-null value.
    fn from_value_nullable(value: &Value) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_value(value).map(Some)
        }
    }
}

fn mismatch(expected: &'static str, value: &Value) -> TypeError {
    if value.is_null() {
        TypeError::UnexpectedNull
    } else {
        TypeError::TypeMismatch {
            expected,
            actual: value.type_name().to_string(),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Int(v) => Ok(*v),
            // Drivers commonly return bigint/numeric as text to avoid precision loss.
            Value::Numeric(s) | Value::Text(s) => s.parse().map_err(|_| TypeError::TypeMismatch {
                expected: "int",
                actual: format!("unparsable integer '{s}'"),
            }),
            other => Err(mismatch("int", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| TypeError::TypeMismatch {
            expected: "i32",
            actual: format!("out of range integer {wide}"),
        })
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(mismatch("float", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Text(s) | Value::Numeric(s) => Ok(s.clone()),
            other => Err(mismatch("text", other)),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(mismatch("bytes", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        Bytes::from_value(value).map(|b| b.to_vec())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| TypeError::TypeMismatch {
                expected: "json",
                actual: e.to_string(),
            }),
            other => Err(mismatch("json", other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, TypeError> {
        T::from_value_nullable(value)
    }

    fn from_value_nullable(value: &Value) -> Result<Option<Self>, TypeError> {
        T::from_value_nullable(value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(7_i32)), Value::Int(7));
    }

    #[test]
    fn test_bigint_from_text() {
        let value = Value::Numeric("9007199254740993".into());
        assert_eq!(i64::from_value(&value).unwrap(), 9_007_199_254_740_993);
    }

    #[test]
    fn test_null_mismatch() {
        assert!(matches!(
            String::from_value(&Value::Null),
            Err(TypeError::UnexpectedNull)
        ));
        assert_eq!(Option::<String>::from_value(&Value::Null).unwrap(), None);
    }

    #[test]
    fn test_i32_out_of_range() {
        assert!(i32::from_value(&Value::Int(i64::MAX)).is_err());
    }
}
