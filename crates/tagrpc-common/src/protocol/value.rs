//! Dynamically typed values carried by the wire codec.
//!
//! Every argument, return value and header entry exchanged between peers is a
//! [`Value`]. The variants mirror the tags of the binary wire format, so a
//! value read off the wire keeps the exact width it was written with.

use std::fmt;

use super::error::{Result, RpcError};

/// Component name written for arrays with no more specific element type.
pub const ANY_COMPONENT: &str = "any";

/// A value that can be written to, or read from, a tagged binary stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// A single UTF-16 code unit. Characters outside the basic plane cannot
    /// be written.
    Char(char),
    String(String),
    /// Fixed-length sequence with a named component type.
    Array { component: String, items: Vec<Value> },
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Entry(Box<Value>, Box<Value>),
    Enum(EnumValue),
    Pojo(PojoValue),
    Bytes(Vec<u8>),
    /// A type referenced by name.
    Class(String),
    /// A type referenced by its field signature.
    TypeRef(String),
    /// Opaque payload produced by a foreign serializer.
    Serialized(Vec<u8>),
}

impl Value {
    /// Builds an array of generic values.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array {
            component: ANY_COMPONENT.to_string(),
            items,
        }
    }

    /// Builds a map from anything yielding key/value pairs.
    pub fn map_of<K, V, I>(entries: I) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Structural equality with floats compared by bit pattern, so `NaN`
    /// matches itself and `0.0` differs from `-0.0`.
    pub fn identical(&self, other: &Value) -> bool {
        fn all(a: &[Value], b: &[Value]) -> bool {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.identical(y))
        }
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (
                Value::Array { component: ca, items: a },
                Value::Array { component: cb, items: b },
            ) => ca == cb && all(a, b),
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => all(a, b),
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka.identical(kb) && va.identical(vb))
            }
            (Value::Entry(ka, va), Value::Entry(kb, vb)) => ka.identical(kb) && va.identical(vb),
            (Value::Pojo(a), Value::Pojo(b)) => {
                a.type_name() == b.type_name()
                    && a.fields().len() == b.fields().len()
                    && a.fields()
                        .iter()
                        .zip(b.fields())
                        .all(|((na, va), (nb, vb))| na == nb && va.identical(vb))
            }
            _ => self == other,
        }
    }

    /// Name of the variant, used in error messages.
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::String(_) => "String",
            Value::Array { .. } => "array",
            Value::List(_) => "List",
            Value::Set(_) => "Set",
            Value::Map(_) => "Map",
            Value::Entry(..) => "Map.Entry",
            Value::Enum(_) => "enum",
            Value::Pojo(_) => "pojo",
            Value::Bytes(_) => "byte[]",
            Value::Class(_) => "Class",
            Value::TypeRef(_) => "type",
            Value::Serialized(_) => "serialized",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integral view of any numeric variant. Floating point values are
    /// truncated toward zero.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(n) => Some(*n as i64),
            Value::Short(n) => Some(*n as i64),
            Value::Int(n) => Some(*n as i64),
            Value::Long(n) => Some(*n),
            Value::Float(n) => Some(*n as i64),
            Value::Double(n) => Some(*n as i64),
            Value::Char(c) => Some(*c as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            other => other.as_i64().map(|n| n as f64),
        }
    }

    pub fn as_pojo(&self) -> Option<&PojoValue> {
        match self {
            Value::Pojo(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Byte(_)
                | Value::Short(_)
                | Value::Int(_)
                | Value::Long(_)
                | Value::Float(_)
                | Value::Double(_)
        )
    }
}

fn write_joined<'a, I>(f: &mut fmt::Formatter<'_>, items: I) -> fmt::Result
where
    I: IntoIterator<Item = &'a Value>,
{
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Byte(n) => write!(f, "{n}"),
            Value::Short(n) => write!(f, "{n}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Double(n) => write!(f, "{n}"),
            Value::Char(c) => write!(f, "{c}"),
            Value::String(s) => f.write_str(s),
            Value::Array { items, .. } | Value::List(items) | Value::Set(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
            Value::Entry(k, v) => write!(f, "{k}={v}"),
            Value::Enum(e) => f.write_str(&e.variant),
            Value::Pojo(p) => write!(f, "{p}"),
            Value::Bytes(b) => write!(f, "byte[{}]", b.len()),
            Value::Class(name) | Value::TypeRef(name) => f.write_str(name),
            Value::Serialized(b) => write!(f, "serialized[{}]", b.len()),
        }
    }
}

/// An enum constant identified by its type and variant names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    pub type_name: String,
    pub variant: String,
}

impl EnumValue {
    pub fn new(type_name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            variant: variant.into(),
        }
    }

    /// The `"type variant"` form interned on the wire.
    pub fn wire_name(&self) -> String {
        format!("{} {}", self.type_name, self.variant)
    }

    /// Splits a wire name at its first space.
    pub fn parse(wire_name: &str) -> Result<Self> {
        match wire_name.split_once(' ') {
            Some((type_name, variant)) => Ok(Self::new(type_name, variant)),
            None => Err(RpcError::StreamCorrupted(format!(
                "enum name '{wire_name}' has no variant"
            ))),
        }
    }
}

/// A plain record: a type name plus ordered named fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PojoValue {
    type_name: String,
    fields: Vec<(String, Value)>,
}

impl PojoValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder form of [`PojoValue::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Removes a field, returning its value.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(pos).1)
    }

    /// Replaces the value of an existing field, or appends a new one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// The fields as a map keyed by field name, handy for comparisons that
    /// ignore the record type.
    pub fn as_map(&self) -> Value {
        Value::Map(
            self.fields
                .iter()
                .map(|(n, v)| (Value::String(n.clone()), v.clone()))
                .collect(),
        )
    }

    /// Field slot at a known position, falling back to a lookup by name when
    /// the record was assembled in a different order.
    pub(crate) fn slot(&self, index: usize, name: &str) -> Option<&Value> {
        match self.fields.get(index) {
            Some((n, v)) if n == name => Some(v),
            _ => self.get(name),
        }
    }

    pub(crate) fn set_slot(&mut self, index: usize, name: &str, value: Value) {
        match self.fields.get_mut(index) {
            Some((n, slot)) if n == name => *slot = value,
            _ => self.set(name, value),
        }
    }

    pub(crate) fn push(&mut self, name: String, value: Value) {
        self.fields.push((name, value));
    }
}

impl fmt::Display for PojoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.type_name)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
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
    EnumValue => Enum,
    PojoValue => Pojo,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
