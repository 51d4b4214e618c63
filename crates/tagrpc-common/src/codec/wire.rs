//! Tagged binary encoding of [`Value`]s.
//!
//! Every value starts with a lead byte. Bytes `0..=127` are literal small
//! integers. Anything else is a [`Tag`] followed by its payload. Multi-byte
//! numbers are big-endian.
//!
//! Names that repeat across frames (method names, record signatures, enum
//! constants, map keys) are interned: the first occurrence on a connection
//! carries the text, later ones only an index. The [`Encoder`] and
//! [`Decoder`] each own one direction's table, so both sides of a
//! connection must process frames in the same order they were written.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::value::{EnumValue, Value};

use super::pojo;
use super::tag::{Tag, MAX_LITERAL};

/// Deepest nesting of containers a decoder accepts.
pub const MAX_NESTING: usize = 256;

/// Code units at or above this value are written after the string's byte
/// block, with this value left as a placeholder.
const WIDE_CHAR: u16 = 0xFF;

fn corrupted(msg: impl Into<String>) -> RpcError {
    RpcError::StreamCorrupted(msg.into())
}

/// Writing half of the codec.
#[derive(Debug, Default)]
pub struct Encoder {
    tags: HashMap<String, u32>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names interned so far.
    pub fn interned(&self) -> usize {
        self.tags.len()
    }

    /// Marks the current interning state so a failed frame can be undone.
    pub fn checkpoint(&self) -> usize {
        self.tags.len()
    }

    /// Forgets names interned after `checkpoint`. Used when a frame is
    /// abandoned before reaching the peer, whose table never saw them.
    pub fn rollback(&mut self, checkpoint: usize) {
        if self.tags.len() > checkpoint {
            self.tags.retain(|_, index| (*index as usize) < checkpoint);
        }
    }

    pub fn write_bool(&self, buf: &mut BytesMut, value: bool) {
        buf.put_u8(if value { Tag::True } else { Tag::False }.byte());
    }

    /// Writes an integer in the shortest form that holds it.
    pub fn write_number(&self, buf: &mut BytesMut, value: i64) {
        if (0..=MAX_LITERAL as i64).contains(&value) {
            buf.put_u8(value as u8);
        } else if let Ok(n) = i8::try_from(value) {
            buf.put_u8(Tag::Signed1.byte());
            buf.put_i8(n);
        } else if let Ok(n) = i16::try_from(value) {
            buf.put_u8(Tag::Signed2.byte());
            buf.put_i16(n);
        } else if let Ok(n) = i32::try_from(value) {
            buf.put_u8(Tag::Signed4.byte());
            buf.put_i32(n);
        } else {
            buf.put_u8(Tag::Signed8.byte());
            buf.put_i64(value);
        }
    }

    /// Writes a floating point number. Integral values up to 32 bits use the
    /// integer encodings. Otherwise the value is written as 4 bytes when that
    /// is lossless, and as 8 bytes when it is not.
    pub fn write_float(&self, buf: &mut BytesMut, value: f64) {
        if value == (value as i8) as f64 {
            self.write_number(buf, value as i8 as i64);
        } else if value == (value as i16) as f64 {
            buf.put_u8(Tag::Signed2.byte());
            buf.put_i16(value as i16);
        } else if value == (value as i32) as f64 {
            buf.put_u8(Tag::Signed4.byte());
            buf.put_i32(value as i32);
        } else if value == (value as f32) as f64 {
            buf.put_u8(Tag::Float4.byte());
            buf.put_f32(value as f32);
        } else {
            buf.put_u8(Tag::Float8.byte());
            buf.put_f64(value);
        }
    }

    /// Writes an interned name. The text follows the index only the first
    /// time the name is seen on this encoder.
    pub fn write_tag(&mut self, buf: &mut BytesMut, name: &str) {
        buf.put_u8(Tag::Tag.byte());
        if let Some(&index) = self.tags.get(name) {
            self.write_number(buf, index as i64);
            return;
        }
        let index = self.tags.len() as u32;
        self.tags.insert(name.to_string(), index);
        self.write_number(buf, index as i64);
        self.write_string_body(buf, name);
    }

    fn write_string_body(&self, buf: &mut BytesMut, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_number(buf, units.len() as i64);
        for &unit in &units {
            buf.put_u8(if unit < WIDE_CHAR { unit as u8 } else { WIDE_CHAR as u8 });
        }
        for &unit in units.iter().filter(|&&u| u >= WIDE_CHAR) {
            buf.put_u16(unit);
        }
    }

    /// Writes an array with a named component type.
    pub fn write_array(
        &mut self,
        buf: &mut BytesMut,
        component: &str,
        items: &[Value],
    ) -> Result<()> {
        buf.put_u8(Tag::Array.byte());
        self.write_number(buf, items.len() as i64);
        self.write_tag(buf, component);
        for item in items {
            self.write_value(buf, item)?;
        }
        Ok(())
    }

    fn write_collection(&mut self, buf: &mut BytesMut, tag: Tag, items: &[Value]) -> Result<()> {
        buf.put_u8(tag.byte());
        self.write_number(buf, items.len() as i64);
        for item in items {
            self.write_key(buf, item)?;
        }
        Ok(())
    }

    /// Strings inside collections and map keys are interned.
    fn write_key(&mut self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match value {
            Value::String(s) => {
                self.write_tag(buf, s);
                Ok(())
            }
            other => self.write_value(buf, other),
        }
    }

    /// Writes any value.
    ///
    /// # Errors
    ///
    /// Returns `NotSerializable` for characters outside the basic plane and
    /// for records whose primitive fields hold values of the wrong kind.
    /// Bytes may already have been appended to `buf` when this happens.
    pub fn write_value(&mut self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match value {
            Value::Null => buf.put_u8(Tag::Null.byte()),
            Value::Bool(b) => self.write_bool(buf, *b),
            Value::Byte(n) => {
                buf.put_u8(Tag::Signed1.byte());
                buf.put_i8(*n);
            }
            Value::Short(n) => {
                buf.put_u8(Tag::Signed2.byte());
                buf.put_i16(*n);
            }
            Value::Int(n) => {
                if (0..=MAX_LITERAL as i32).contains(n) {
                    buf.put_u8(*n as u8);
                } else {
                    buf.put_u8(Tag::Signed4.byte());
                    buf.put_i32(*n);
                }
            }
            Value::Long(n) => {
                buf.put_u8(Tag::Signed8.byte());
                buf.put_i64(*n);
            }
            Value::Float(n) => {
                buf.put_u8(Tag::Float4.byte());
                buf.put_f32(*n);
            }
            Value::Double(n) => {
                buf.put_u8(Tag::Float8.byte());
                buf.put_f64(*n);
            }
            Value::Char(c) => {
                let unit = u16::try_from(*c as u32).map_err(|_| {
                    RpcError::NotSerializable(format!(
                        "char U+{:04X} does not fit in one UTF-16 unit",
                        *c as u32
                    ))
                })?;
                buf.put_u8(Tag::Char.byte());
                buf.put_u16(unit);
            }
            Value::String(s) => {
                buf.put_u8(Tag::String.byte());
                self.write_string_body(buf, s);
            }
            Value::Array { component, items } => self.write_array(buf, component, items)?,
            Value::List(items) => self.write_collection(buf, Tag::List, items)?,
            Value::Set(items) => self.write_collection(buf, Tag::Set, items)?,
            Value::Map(entries) => {
                buf.put_u8(Tag::Map.byte());
                self.write_number(buf, entries.len() as i64);
                for (k, v) in entries {
                    self.write_key(buf, k)?;
                    self.write_value(buf, v)?;
                }
            }
            Value::Entry(k, v) => {
                buf.put_u8(Tag::Entry.byte());
                self.write_key(buf, k)?;
                self.write_value(buf, v)?;
            }
            Value::Enum(e) => {
                buf.put_u8(Tag::Enum.byte());
                self.write_tag(buf, &e.wire_name());
            }
            Value::Pojo(p) => {
                buf.put_u8(Tag::Pojo.byte());
                pojo::serialize(self, buf, p)?;
            }
            Value::Bytes(bytes) => {
                buf.put_u8(Tag::Bytes.byte());
                self.write_number(buf, bytes.len() as i64);
                buf.put_slice(bytes);
            }
            Value::Class(name) => {
                buf.put_u8(Tag::Class.byte());
                self.write_tag(buf, name);
            }
            Value::TypeRef(signature) => {
                buf.put_u8(Tag::MetaClass.byte());
                self.write_tag(buf, signature);
            }
            Value::Serialized(bytes) => {
                buf.put_u8(Tag::Serializable.byte());
                self.write_number(buf, bytes.len() as i64);
                buf.put_slice(bytes);
            }
        }
        Ok(())
    }
}

/// Reading half of the codec.
#[derive(Debug, Default)]
pub struct Decoder {
    tags: Vec<String>,
    depth: usize,
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(corrupted(format!(
            "truncated {what}: need {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn lead(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1, "value")?;
    Ok(buf.get_u8())
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names interned so far.
    pub fn interned(&self) -> usize {
        self.tags.len()
    }

    pub fn read_bool(&mut self, buf: &mut &[u8]) -> Result<bool> {
        let byte = lead(buf)?;
        match Tag::from_byte(byte)? {
            Tag::True => Ok(true),
            Tag::False => Ok(false),
            other => Err(corrupted(format!("expected a boolean, got {other:?}"))),
        }
    }

    /// Reads any integer encoding. Floats are truncated and chars widened.
    pub fn read_number(&mut self, buf: &mut &[u8]) -> Result<i64> {
        let byte = lead(buf)?;
        if byte <= MAX_LITERAL {
            return Ok(byte as i64);
        }
        self.read_number_payload(Tag::from_byte(byte)?, buf)
    }

    fn read_number_payload(&mut self, tag: Tag, buf: &mut &[u8]) -> Result<i64> {
        match tag {
            Tag::Signed1 => {
                need(buf, 1, "byte")?;
                Ok(buf.get_i8() as i64)
            }
            Tag::Signed2 => {
                need(buf, 2, "short")?;
                Ok(buf.get_i16() as i64)
            }
            Tag::Signed4 => {
                need(buf, 4, "int")?;
                Ok(buf.get_i32() as i64)
            }
            Tag::Signed8 => {
                need(buf, 8, "long")?;
                Ok(buf.get_i64())
            }
            Tag::Float4 => {
                need(buf, 4, "float")?;
                Ok(buf.get_f32() as i64)
            }
            Tag::Float8 => {
                need(buf, 8, "double")?;
                Ok(buf.get_f64() as i64)
            }
            Tag::Char => {
                need(buf, 2, "char")?;
                Ok(buf.get_u16() as i64)
            }
            other => Err(corrupted(format!("expected a number, got {other:?}"))),
        }
    }

    /// Reads any numeric encoding as a double.
    pub fn read_float(&mut self, buf: &mut &[u8]) -> Result<f64> {
        let byte = lead(buf)?;
        if byte <= MAX_LITERAL {
            return Ok(byte as f64);
        }
        match Tag::from_byte(byte)? {
            Tag::Float4 => {
                need(buf, 4, "float")?;
                Ok(buf.get_f32() as f64)
            }
            Tag::Float8 => {
                need(buf, 8, "double")?;
                Ok(buf.get_f64())
            }
            other => Ok(self.read_number_payload(other, buf)? as f64),
        }
    }

    /// Reads a length or count, which must be non-negative.
    fn read_len(&mut self, buf: &mut &[u8]) -> Result<usize> {
        let n = self.read_number(buf)?;
        usize::try_from(n)
            .ok()
            .filter(|&n| n <= i32::MAX as usize)
            .ok_or_else(|| corrupted(format!("invalid length {n}")))
    }

    fn read_string_body(&mut self, buf: &mut &[u8]) -> Result<String> {
        let len = self.read_len(buf)?;
        need(buf, len, "string")?;
        let mut units: Vec<u16> = Vec::with_capacity(len);
        let mut wide = 0usize;
        for _ in 0..len {
            let b = buf.get_u8();
            if b == WIDE_CHAR as u8 {
                wide += 1;
            }
            units.push(b as u16);
        }
        if wide > 0 {
            need(buf, wide * 2, "string")?;
            for unit in units.iter_mut().filter(|u| **u == WIDE_CHAR) {
                *unit = buf.get_u16();
            }
        }
        String::from_utf16(&units).map_err(|e| corrupted(format!("bad string: {e}")))
    }

    /// Reads the body of an interned name, the lead tag already consumed.
    fn read_tag_body(&mut self, buf: &mut &[u8]) -> Result<String> {
        let index = self.read_number(buf)?;
        let known = self.tags.len();
        match usize::try_from(index) {
            Ok(i) if i < known => Ok(self.tags[i].clone()),
            Ok(i) if i == known => {
                let name = self.read_string_body(buf)?;
                self.tags.push(name.clone());
                Ok(name)
            }
            _ => Err(corrupted(format!(
                "tag index {index} out of range, {known} known"
            ))),
        }
    }

    /// Reads an interned name.
    pub fn read_tag(&mut self, buf: &mut &[u8]) -> Result<String> {
        match Tag::from_byte(lead(buf)?)? {
            Tag::Tag => self.read_tag_body(buf),
            other => Err(corrupted(format!("expected a tag, got {other:?}"))),
        }
    }

    /// Reads a value that must be a string, interned or not.
    pub fn read_string(&mut self, buf: &mut &[u8]) -> Result<String> {
        match self.read_value(buf)? {
            Value::String(s) => Ok(s),
            other => Err(corrupted(format!(
                "expected a String, got {}",
                other.type_label()
            ))),
        }
    }

    /// Reads a value that must be an array.
    pub fn read_array(&mut self, buf: &mut &[u8]) -> Result<(String, Vec<Value>)> {
        match self.read_value(buf)? {
            Value::Array { component, items } => Ok((component, items)),
            other => Err(corrupted(format!(
                "expected an array, got {}",
                other.type_label()
            ))),
        }
    }

    fn read_bytes(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = self.read_len(buf)?;
        need(buf, len, "bytes")?;
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    fn read_items(&mut self, buf: &mut &[u8], len: usize) -> Result<Vec<Value>> {
        let mut items = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            items.push(self.read_value(buf)?);
        }
        Ok(items)
    }

    /// Reads any value.
    pub fn read_value(&mut self, buf: &mut &[u8]) -> Result<Value> {
        if self.depth >= MAX_NESTING {
            return Err(corrupted("values nested too deeply"));
        }
        self.depth += 1;
        let result = self.read_value_inner(buf);
        self.depth -= 1;
        result
    }

    fn read_value_inner(&mut self, buf: &mut &[u8]) -> Result<Value> {
        let byte = lead(buf)?;
        if byte <= MAX_LITERAL {
            return Ok(Value::Int(byte as i32));
        }
        let value = match Tag::from_byte(byte)? {
            Tag::Null => Value::Null,
            Tag::True => Value::Bool(true),
            Tag::False => Value::Bool(false),
            Tag::Signed1 => {
                need(buf, 1, "byte")?;
                Value::Byte(buf.get_i8())
            }
            Tag::Signed2 => {
                need(buf, 2, "short")?;
                Value::Short(buf.get_i16())
            }
            Tag::Signed4 => {
                need(buf, 4, "int")?;
                Value::Int(buf.get_i32())
            }
            Tag::Signed8 => {
                need(buf, 8, "long")?;
                Value::Long(buf.get_i64())
            }
            Tag::Float4 => {
                need(buf, 4, "float")?;
                Value::Float(buf.get_f32())
            }
            Tag::Float8 => {
                need(buf, 8, "double")?;
                Value::Double(buf.get_f64())
            }
            Tag::Char => {
                need(buf, 2, "char")?;
                let unit = buf.get_u16();
                Value::Char(
                    char::from_u32(unit as u32)
                        .ok_or_else(|| corrupted(format!("lone surrogate 0x{unit:04x}")))?,
                )
            }
            Tag::Array => {
                let len = self.read_len(buf)?;
                let component = self.read_string(buf)?;
                let items = self.read_items(buf, len)?;
                Value::Array { component, items }
            }
            Tag::String => Value::String(self.read_string_body(buf)?),
            Tag::Tag => Value::String(self.read_tag_body(buf)?),
            Tag::List => {
                let len = self.read_len(buf)?;
                Value::List(self.read_items(buf, len)?)
            }
            Tag::Set => {
                let len = self.read_len(buf)?;
                Value::Set(self.read_items(buf, len)?)
            }
            Tag::Map => {
                let len = self.read_len(buf)?;
                let mut entries = Vec::with_capacity(len.min(buf.remaining()));
                for _ in 0..len {
                    let k = self.read_value(buf)?;
                    let v = self.read_value(buf)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            Tag::Entry => {
                let k = self.read_value(buf)?;
                let v = self.read_value(buf)?;
                Value::Entry(Box::new(k), Box::new(v))
            }
            Tag::Enum => Value::Enum(EnumValue::parse(&self.read_string(buf)?)?),
            Tag::Pojo => Value::Pojo(pojo::deserialize(self, buf)?),
            Tag::Bytes => Value::Bytes(self.read_bytes(buf)?),
            Tag::Class => Value::Class(self.read_string(buf)?),
            Tag::MetaClass => Value::TypeRef(self.read_string(buf)?),
            Tag::Serializable => Value::Serialized(self.read_bytes(buf)?),
        };
        Ok(value)
    }
}

/// Both halves of a codec, for encoding and decoding outside a connection.
///
/// # Example
///
/// ```
/// use tagrpc_common::codec::WireCodec;
/// use tagrpc_common::Value;
///
/// let mut codec = WireCodec::new();
/// let bytes = codec.encode(&Value::from("hello")).unwrap();
/// assert_eq!(codec.decode(&bytes).unwrap(), Value::from("hello"));
/// ```
#[derive(Debug, Default)]
pub struct WireCodec {
    pub encoder: Encoder,
    pub decoder: Decoder,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, value: &Value) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encoder.write_value(&mut buf, value)?;
        Ok(buf.to_vec())
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<Value> {
        let mut buf = bytes;
        self.decoder.read_value(&mut buf)
    }
}
