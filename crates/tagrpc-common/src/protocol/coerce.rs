//! Conversion of received values to the types a method or caller expects.

use super::error::{Result, RpcError};
use super::value::{PojoValue, Value};

/// Declared type of a parameter, return value or record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Any,
    Bool,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    List,
    Set,
    Map,
    Pojo,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Any => "any",
            ValueType::Bool => "boolean",
            ValueType::Byte => "byte",
            ValueType::Short => "short",
            ValueType::Char => "char",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::String => "String",
            ValueType::Bytes => "byte[]",
            ValueType::List => "List",
            ValueType::Set => "Set",
            ValueType::Map => "Map",
            ValueType::Pojo => "pojo",
        }
    }

    /// Whether `value` already has this type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ValueType::Any, _)
                | (_, Value::Null)
                | (ValueType::Bool, Value::Bool(_))
                | (ValueType::Byte, Value::Byte(_))
                | (ValueType::Short, Value::Short(_))
                | (ValueType::Char, Value::Char(_))
                | (ValueType::Int, Value::Int(_))
                | (ValueType::Long, Value::Long(_))
                | (ValueType::Float, Value::Float(_))
                | (ValueType::Double, Value::Double(_))
                | (ValueType::String, Value::String(_))
                | (ValueType::Bytes, Value::Bytes(_))
                | (ValueType::List, Value::List(_))
                | (ValueType::Set, Value::Set(_))
                | (ValueType::Map, Value::Map(_))
                | (ValueType::Pojo, Value::Pojo(_))
        )
    }
}

fn mismatch(value: &Value, target: ValueType) -> RpcError {
    RpcError::Coercion {
        from: value.type_label().to_string(),
        to: target.name().to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(value: &Value, target: ValueType) -> Result<T> {
    match value {
        Value::String(s) => s.trim().parse().map_err(|_| mismatch(value, target)),
        _ => Err(mismatch(value, target)),
    }
}

/// Converts `value` to `target`.
///
/// Numbers widen or narrow freely (narrowing wraps like a primitive cast),
/// strings parse into numbers and booleans, and anything converts to a
/// string through its display form. Null passes through unchanged.
///
/// # Errors
///
/// Returns [`RpcError::Coercion`] when no conversion exists.
pub fn coerce(value: Value, target: ValueType) -> Result<Value> {
    if target.accepts(&value) {
        return Ok(value);
    }
    let converted = match target {
        ValueType::Byte | ValueType::Short | ValueType::Int | ValueType::Long => {
            let n = match value.as_i64() {
                Some(n) => n,
                None => parse_number::<i64>(&value, target)?,
            };
            match target {
                ValueType::Byte => Value::Byte(n as i8),
                ValueType::Short => Value::Short(n as i16),
                ValueType::Int => Value::Int(n as i32),
                _ => Value::Long(n),
            }
        }
        ValueType::Float | ValueType::Double => {
            let n = match value.as_f64() {
                Some(n) => n,
                None => parse_number::<f64>(&value, target)?,
            };
            if target == ValueType::Float {
                Value::Float(n as f32)
            } else {
                Value::Double(n)
            }
        }
        ValueType::Char => {
            let c = match &value {
                Value::String(s) if s.chars().count() == 1 => s.chars().next(),
                other => other
                    .as_i64()
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(char::from_u32),
            };
            Value::Char(c.ok_or_else(|| mismatch(&value, target))?)
        }
        ValueType::Bool => match &value {
            Value::String(s) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
            other => return Err(mismatch(other, target)),
        },
        ValueType::String => Value::String(value.to_string()),
        ValueType::List => match value {
            Value::Array { items, .. } | Value::Set(items) => Value::List(items),
            other => return Err(mismatch(&other, target)),
        },
        ValueType::Set => match value {
            Value::Array { items, .. } | Value::List(items) => Value::Set(items),
            other => return Err(mismatch(&other, target)),
        },
        ValueType::Bytes | ValueType::Map | ValueType::Pojo | ValueType::Any => {
            return Err(mismatch(&value, target))
        }
    };
    Ok(converted)
}

/// Typed extraction from a [`Value`], used for return values and by
/// generated interface stubs.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $target:ident),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match coerce(value, ValueType::$target)? {
                        Value::$target(v) => Ok(v),
                        other => Err(mismatch(&other, ValueType::$target)),
                    }
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Bool,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    char => Char,
    String => String,
    Vec<u8> => Bytes,
    PojoValue => Pojo,
}

impl FromValue for Vec<Value> {
    fn from_value(value: Value) -> Result<Self> {
        match coerce(value, ValueType::List)? {
            Value::List(items) => Ok(items),
            other => Err(mismatch(&other, ValueType::List)),
        }
    }
}
