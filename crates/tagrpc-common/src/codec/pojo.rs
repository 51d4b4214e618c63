//! Record serialization.
//!
//! A record is written as its interned signature (`"type,f1,f2,..."`)
//! followed by each field in signature order. The reader resolves the
//! signature against the local registry:
//!
//! - an identical local layout is used directly;
//! - a different local layout gets a shadow descriptor that maps wire fields
//!   by name, discarding fields unknown locally and leaving missing ones at
//!   their zero value;
//! - an unknown type is read as a dynamic record of generic values.
//!
//! Resolved signatures of known types are cached for the life of the process.

use std::sync::{Arc, LazyLock};

use bytes::BytesMut;
use dashmap::DashMap;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::value::{PojoValue, Value};

use super::descriptor::{lookup_type, FieldDescriptor, FieldKind, TypeDescriptor};
use super::wire::{Decoder, Encoder};

/// How a signature read off the wire maps onto a local type.
#[derive(Debug)]
pub struct WireDescriptor {
    type_name: String,
    local: Option<Arc<TypeDescriptor>>,
    slots: Vec<WireSlot>,
    shadow: bool,
}

#[derive(Debug)]
struct WireSlot {
    name: String,
    local: Option<FieldDescriptor>,
}

impl WireDescriptor {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// True when the wire layout differs from the registered local one.
    pub fn is_shadow(&self) -> bool {
        self.shadow
    }

    /// True when the type is not registered locally.
    pub fn is_dynamic(&self) -> bool {
        self.local.is_none()
    }

    /// Field names in wire order.
    pub fn wire_fields(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.name.as_str())
    }

    fn new_blank(&self) -> PojoValue {
        match &self.local {
            Some(desc) => desc.new_blank(),
            None => PojoValue::new(self.type_name.clone()),
        }
    }
}

static SIGNATURES: LazyLock<DashMap<String, Arc<WireDescriptor>>> = LazyLock::new(DashMap::new);

/// Whether `value` is written through the record path.
pub fn can_serialize(value: &Value) -> bool {
    matches!(value, Value::Pojo(_))
}

/// Maps a wire signature to the descriptor used to read it.
///
/// # Errors
///
/// Returns `StreamCorrupted` when the signature has no type name.
pub fn resolve_signature(signature: &str) -> Result<Arc<WireDescriptor>> {
    if let Some(cached) = SIGNATURES.get(signature) {
        return Ok(Arc::clone(cached.value()));
    }

    let mut parts = signature.split(',');
    let type_name = parts.next().unwrap_or_default();
    if type_name.is_empty() {
        return Err(RpcError::StreamCorrupted(format!(
            "record signature '{signature}' has no type"
        )));
    }
    let names: Vec<&str> = parts.collect();

    let Some(local) = lookup_type(type_name) else {
        // not cached, so a later registration takes effect
        return Ok(Arc::new(WireDescriptor {
            type_name: type_name.to_string(),
            local: None,
            slots: names
                .iter()
                .map(|name| WireSlot {
                    name: name.to_string(),
                    local: None,
                })
                .collect(),
            shadow: false,
        }));
    };

    let shadow = local.signature() != signature;
    if shadow {
        tracing::debug!(
            signature,
            local = local.signature(),
            "reading record through a shadow descriptor"
        );
    }
    let slots = names
        .iter()
        .map(|name| WireSlot {
            name: name.to_string(),
            local: local.field(name).cloned(),
        })
        .collect();
    let resolved = Arc::new(WireDescriptor {
        type_name: type_name.to_string(),
        local: Some(local),
        slots,
        shadow,
    });
    SIGNATURES.insert(signature.to_string(), Arc::clone(&resolved));
    Ok(resolved)
}

fn write_field(
    enc: &mut Encoder,
    buf: &mut BytesMut,
    field: &FieldDescriptor,
    pojo: &PojoValue,
) -> Result<()> {
    match field.kind() {
        FieldKind::Bool => enc.write_bool(buf, field.get_bool(pojo)?),
        FieldKind::Float | FieldKind::Double => enc.write_float(buf, field.get_float(pojo)?),
        FieldKind::Object => enc.write_value(buf, field.get(pojo))?,
        _ => enc.write_number(buf, field.get_num(pojo)?),
    }
    Ok(())
}

fn read_field(
    dec: &mut Decoder,
    buf: &mut &[u8],
    field: &FieldDescriptor,
    pojo: &mut PojoValue,
) -> Result<()> {
    match field.kind() {
        FieldKind::Bool => field.set_bool(pojo, dec.read_bool(buf)?),
        FieldKind::Float | FieldKind::Double => field.set_float(pojo, dec.read_float(buf)?)?,
        FieldKind::Object => field.set(pojo, dec.read_value(buf)?),
        _ => field.set_num(pojo, dec.read_number(buf)?)?,
    }
    Ok(())
}

/// Writes a record body (signature and fields). The record tag itself is
/// written by the caller.
///
/// Registered types are written in their registered field order. Records of
/// unknown types are written with their own fields as generic values.
///
/// # Errors
///
/// Returns `NotSerializable` when a primitive field holds a value of another
/// kind.
pub fn serialize(enc: &mut Encoder, buf: &mut BytesMut, pojo: &PojoValue) -> Result<()> {
    match lookup_type(pojo.type_name()) {
        Some(desc) => {
            enc.write_tag(buf, desc.signature());
            for field in desc.fields() {
                write_field(enc, buf, field, pojo)?;
            }
        }
        None => {
            let mut signature = pojo.type_name().to_string();
            for (name, _) in pojo.fields() {
                signature.push(',');
                signature.push_str(name);
            }
            enc.write_tag(buf, &signature);
            for (_, value) in pojo.fields() {
                enc.write_value(buf, value)?;
            }
        }
    }
    Ok(())
}

/// Reads a record body written by [`serialize`].
pub fn deserialize(dec: &mut Decoder, buf: &mut &[u8]) -> Result<PojoValue> {
    let signature = dec.read_string(buf)?;
    let wire = resolve_signature(&signature)?;
    let mut pojo = wire.new_blank();
    for slot in &wire.slots {
        match (&slot.local, wire.is_dynamic()) {
            (Some(field), _) => read_field(dec, buf, field, &mut pojo)?,
            (None, true) => {
                let value = dec.read_value(buf)?;
                pojo.push(slot.name.clone(), value);
            }
            (None, false) => {
                dec.read_value(buf)?;
            }
        }
    }
    Ok(pojo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::descriptor::register_type;
    use crate::codec::tag::Tag;

    fn write(pojo: &PojoValue) -> Vec<u8> {
        let mut enc = Encoder::new();
        let mut buf = BytesMut::new();
        serialize(&mut enc, &mut buf, pojo).unwrap();
        buf.to_vec()
    }

    fn read(bytes: &[u8]) -> PojoValue {
        let mut slice = bytes;
        deserialize(&mut Decoder::new(), &mut slice).unwrap()
    }

    #[test]
    fn test_primitive_fields_written_compactly() {
        register_type(
            TypeDescriptor::new("pojo.test.Compact")
                .with_field("flag", FieldKind::Bool)
                .with_field("n", FieldKind::Long)
                .with_field("d", FieldKind::Double),
        );
        let pojo = PojoValue::new("pojo.test.Compact")
            .with("flag", true)
            .with("n", 5i64)
            .with("d", 2.0f64);
        let bytes = write(&pojo);
        let sig_len = "pojo.test.Compact,flag,n,d".len();
        // tag, index, length, text, then one byte per field
        assert_eq!(bytes.len(), 3 + sig_len + 3);
        assert_eq!(bytes[bytes.len() - 3], Tag::True.byte());
        assert_eq!(&bytes[bytes.len() - 2..], &[5, 2]);
        assert_eq!(read(&bytes), pojo);
    }

    #[test]
    fn test_shadow_descriptor_discards_and_zeroes() {
        register_type(
            TypeDescriptor::new("pojo.test.Shape")
                .with_field("a", FieldKind::Int)
                .with_field("c", FieldKind::Object),
        );
        // a peer with fields a, b
        let mut enc = Encoder::new();
        let mut buf = BytesMut::new();
        enc.write_tag(&mut buf, "pojo.test.Shape,a,b");
        enc.write_number(&mut buf, 7);
        enc.write_value(&mut buf, &Value::from("dropped")).unwrap();

        let wire = resolve_signature("pojo.test.Shape,a,b").unwrap();
        assert!(wire.is_shadow());
        let pojo = read(&buf);
        assert_eq!(pojo.get("a"), Some(&Value::Int(7)));
        assert_eq!(pojo.get("c"), Some(&Value::Null));
        assert_eq!(pojo.get("b"), None);
    }

    #[test]
    fn test_unknown_type_reads_as_dynamic_record() {
        let pojo = PojoValue::new("pojo.test.Unknown")
            .with("name", "x")
            .with("size", 3i64);
        let back = read(&write(&pojo));
        assert_eq!(back, pojo);
        assert!(resolve_signature("pojo.test.Unknown,name,size")
            .unwrap()
            .is_dynamic());
    }

    #[test]
    fn test_resolved_signature_is_cached() {
        register_type(TypeDescriptor::new("pojo.test.Cached").with_field("x", FieldKind::Int));
        let first = resolve_signature("pojo.test.Cached,x").unwrap();
        let second = resolve_signature("pojo.test.Cached,x").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_shadow());
    }

    #[test]
    fn test_bad_primitive_field_is_not_serializable() {
        register_type(TypeDescriptor::new("pojo.test.Strict").with_field("n", FieldKind::Int));
        let pojo = PojoValue::new("pojo.test.Strict").with("n", "seven");
        let mut buf = BytesMut::new();
        let err = serialize(&mut Encoder::new(), &mut buf, &pojo).unwrap_err();
        assert!(matches!(err, RpcError::NotSerializable(_)));
    }

    #[test]
    fn test_char_field_limited_to_basic_plane() {
        register_type(TypeDescriptor::new("pojo.test.Glyph").with_field("c", FieldKind::Char));
        let edge = PojoValue::new("pojo.test.Glyph").with("c", '\u{FFFF}');
        assert_eq!(read(&write(&edge)), edge);

        let astral = PojoValue::new("pojo.test.Glyph").with("c", '\u{1F600}');
        let mut buf = BytesMut::new();
        let err = serialize(&mut Encoder::new(), &mut buf, &astral).unwrap_err();
        assert!(matches!(err, RpcError::NotSerializable(_)));
    }

    #[test]
    fn test_char_field_rejects_wide_number_on_read() {
        register_type(TypeDescriptor::new("pojo.test.Letter").with_field("c", FieldKind::Char));
        let mut enc = Encoder::new();
        let mut buf = BytesMut::new();
        enc.write_tag(&mut buf, "pojo.test.Letter,c");
        enc.write_number(&mut buf, 0x1F600);

        let mut slice = &buf[..];
        let err = deserialize(&mut Decoder::new(), &mut slice).unwrap_err();
        assert!(matches!(err, RpcError::NotSerializable(_)));
    }

    #[test]
    fn test_empty_signature_is_corrupt() {
        assert!(resolve_signature(",a").is_err());
        assert!(can_serialize(&Value::Pojo(PojoValue::new("x"))));
        assert!(!can_serialize(&Value::Null));
    }
}
