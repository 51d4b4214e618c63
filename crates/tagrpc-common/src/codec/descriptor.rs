//! Record type descriptors.
//!
//! A [`TypeDescriptor`] lists the fields of a record type in wire order. The
//! process-wide registry maps type names to descriptors so the POJO
//! serializer can write primitive fields compactly and match incoming
//! signatures against the local shape of a type.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::protocol::coerce::ValueType;
use crate::protocol::error::{Result, RpcError};
use crate::protocol::remote::RemoteError;
use crate::protocol::value::{PojoValue, Value};

/// Storage kind of a record field.
///
/// Primitive kinds always hold a value and are written without a type tag
/// where the format allows it. `Object` fields hold any [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Bool,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    Object,
}

impl FieldKind {
    pub fn is_primitive(self) -> bool {
        self != FieldKind::Object
    }

    /// Value of a field that was never assigned.
    pub fn zero(self) -> Value {
        match self {
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Byte => Value::Byte(0),
            FieldKind::Short => Value::Short(0),
            FieldKind::Char => Value::Char('\0'),
            FieldKind::Int => Value::Int(0),
            FieldKind::Long => Value::Long(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Double => Value::Double(0.0),
            FieldKind::Object => Value::Null,
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            FieldKind::Bool => ValueType::Bool,
            FieldKind::Byte => ValueType::Byte,
            FieldKind::Short => ValueType::Short,
            FieldKind::Char => ValueType::Char,
            FieldKind::Int => ValueType::Int,
            FieldKind::Long => ValueType::Long,
            FieldKind::Float => ValueType::Float,
            FieldKind::Double => ValueType::Double,
            FieldKind::Object => ValueType::Any,
        }
    }

    fn is_integral(self) -> bool {
        matches!(
            self,
            FieldKind::Byte | FieldKind::Short | FieldKind::Char | FieldKind::Int | FieldKind::Long
        )
    }
}

/// One field of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    name: String,
    kind: FieldKind,
    index: usize,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_primitive(&self) -> bool {
        self.kind.is_primitive()
    }

    /// Position of the field within its type.
    pub fn index(&self) -> usize {
        self.index
    }

    fn wrong_kind(&self, pojo: &PojoValue, value: &Value) -> RpcError {
        RpcError::NotSerializable(format!(
            "{}.{} is {:?} but holds {}",
            pojo.type_name(),
            self.name,
            self.kind,
            value.type_label()
        ))
    }

    /// Current value of the field, null when the record lacks it.
    pub fn get<'a>(&self, pojo: &'a PojoValue) -> &'a Value {
        static NULL: Value = Value::Null;
        pojo.slot(self.index, &self.name).unwrap_or(&NULL)
    }

    pub fn get_bool(&self, pojo: &PojoValue) -> Result<bool> {
        match self.get(pojo) {
            Value::Bool(b) => Ok(*b),
            other => Err(self.wrong_kind(pojo, other)),
        }
    }

    /// Integral fields widened to 64 bits. A char travels as one UTF-16
    /// unit, so chars outside the basic plane are rejected.
    pub fn get_num(&self, pojo: &PojoValue) -> Result<i64> {
        match self.get(pojo) {
            Value::Char(c) if u32::from(*c) > u32::from(u16::MAX) => Err(RpcError::NotSerializable(
                format!("{}.{}: char U+{:X} does not fit 16 bits", pojo.type_name(), self.name, u32::from(*c)),
            )),
            v @ (Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) | Value::Char(_)) => {
                v.as_i64().ok_or_else(|| self.wrong_kind(pojo, v))
            }
            other => Err(self.wrong_kind(pojo, other)),
        }
    }

    /// Numeric fields widened to a double.
    pub fn get_float(&self, pojo: &PojoValue) -> Result<f64> {
        let value = self.get(pojo);
        if value.is_number() {
            if let Some(n) = value.as_f64() {
                return Ok(n);
            }
        }
        Err(self.wrong_kind(pojo, value))
    }

    pub fn set(&self, pojo: &mut PojoValue, value: Value) {
        pojo.set_slot(self.index, &self.name, value);
    }

    pub fn set_bool(&self, pojo: &mut PojoValue, value: bool) {
        self.set(pojo, Value::Bool(value));
    }

    /// Stores an integer, narrowed to the field's kind.
    ///
    /// # Errors
    ///
    /// `NotSerializable` when a char field gets a value outside `0..=0xFFFF`.
    pub fn set_num(&self, pojo: &mut PojoValue, value: i64) -> Result<()> {
        let value = match self.kind {
            FieldKind::Byte => Value::Byte(value as i8),
            FieldKind::Short => Value::Short(value as i16),
            FieldKind::Char => Value::Char(self.char_unit(pojo, value)?),
            FieldKind::Int => Value::Int(value as i32),
            FieldKind::Float => Value::Float(value as f32),
            FieldKind::Double => Value::Double(value as f64),
            FieldKind::Bool => Value::Bool(value != 0),
            FieldKind::Long | FieldKind::Object => Value::Long(value),
        };
        self.set(pojo, value);
        Ok(())
    }

    /// Unpaired surrogates have no `char`; they become U+FFFD.
    fn char_unit(&self, pojo: &PojoValue, value: i64) -> Result<char> {
        let unit = u16::try_from(value).map_err(|_| {
            RpcError::NotSerializable(format!(
                "{}.{}: {value} is not a 16-bit char",
                pojo.type_name(),
                self.name
            ))
        })?;
        Ok(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    /// Stores a float, narrowed to the field's kind.
    pub fn set_float(&self, pojo: &mut PojoValue, value: f64) -> Result<()> {
        match self.kind {
            FieldKind::Float => self.set(pojo, Value::Float(value as f32)),
            kind if kind.is_integral() => return self.set_num(pojo, value as i64),
            _ => self.set(pojo, Value::Double(value)),
        }
        Ok(())
    }
}

/// Ordered field list of a record type.
///
/// # Example
///
/// ```
/// use tagrpc_common::codec::{FieldKind, TypeDescriptor};
///
/// let point = TypeDescriptor::new("geo.Point")
///     .with_field("x", FieldKind::Int)
///     .with_field("y", FieldKind::Int);
/// assert_eq!(point.signature(), "geo.Point,x,y");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    type_name: String,
    fields: Vec<FieldDescriptor>,
    signature: String,
}

impl TypeDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            signature: type_name.clone(),
            type_name,
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        self.signature.push(',');
        self.signature.push_str(&name);
        self.fields.push(FieldDescriptor {
            name,
            kind,
            index: self.fields.len(),
        });
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `"type,field1,field2,..."`, the form interned on the wire.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// A record with every field at its zero value.
    pub fn new_blank(&self) -> PojoValue {
        let mut pojo = PojoValue::new(self.type_name.clone());
        for field in &self.fields {
            pojo.push(field.name.clone(), field.kind.zero());
        }
        pojo
    }
}

static TYPES: LazyLock<DashMap<String, Arc<TypeDescriptor>>> = LazyLock::new(|| {
    let types = DashMap::new();
    let remote = RemoteError::descriptor();
    types.insert(remote.type_name().to_string(), Arc::new(remote));
    types
});

/// Registers a record type for the whole process, replacing any previous
/// descriptor of the same name.
pub fn register_type(descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
    let descriptor = Arc::new(descriptor);
    TYPES.insert(descriptor.type_name().to_string(), Arc::clone(&descriptor));
    descriptor
}

pub fn lookup_type(type_name: &str) -> Option<Arc<TypeDescriptor>> {
    TYPES.get(type_name).map(|entry| Arc::clone(entry.value()))
}

/// Conversion between a Rust type and its record form.
pub trait Pojo: Sized {
    fn descriptor() -> TypeDescriptor;

    fn to_pojo(&self) -> PojoValue;

    fn from_pojo(pojo: PojoValue) -> Result<Self>;

    /// Makes the type's field layout known to the serializer.
    fn register() -> Arc<TypeDescriptor> {
        register_type(Self::descriptor())
    }
}
