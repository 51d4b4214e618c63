//! Call and reply frame bodies.
//!
//! A call is `sequence, method (interned), argument array`. A reply is
//! `sequence, success flag, value`. Sequence `0` marks a synchronous call
//! whose reply is read straight back on the same connection.

use bytes::BytesMut;

use crate::codec::wire::{Decoder, Encoder};

use super::error::{Result, RpcError};
use super::value::{Value, ANY_COMPONENT};

/// Sequence number of synchronous calls.
pub const SYNC_SEQUENCE: u64 = 0;

/// A method invocation sent to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub sequence: u64,
    pub method: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(sequence: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sequence,
            method: method.into(),
            args,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.sequence == SYNC_SEQUENCE
    }

    pub fn write(&self, enc: &mut Encoder, buf: &mut BytesMut) -> Result<()> {
        enc.write_number(buf, self.sequence as i64);
        enc.write_tag(buf, &self.method);
        enc.write_array(buf, ANY_COMPONENT, &self.args)
    }

    pub fn read(dec: &mut Decoder, buf: &mut &[u8]) -> Result<Self> {
        let sequence = dec.read_number(buf)? as u64;
        let method = dec.read_string(buf)?;
        let (_, args) = dec.read_array(buf)?;
        Ok(Self {
            sequence,
            method,
            args,
        })
    }
}

/// The outcome of a call. On failure `value` holds the relayed error.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub sequence: u64,
    pub success: bool,
    pub value: Value,
}

impl Reply {
    pub fn success(sequence: u64, value: Value) -> Self {
        Self {
            sequence,
            success: true,
            value,
        }
    }

    pub fn failure(sequence: u64, error: Value) -> Self {
        Self {
            sequence,
            success: false,
            value: error,
        }
    }

    pub fn write(&self, enc: &mut Encoder, buf: &mut BytesMut) -> Result<()> {
        enc.write_number(buf, self.sequence as i64);
        enc.write_bool(buf, self.success);
        enc.write_value(buf, &self.value)
    }

    pub fn read(dec: &mut Decoder, buf: &mut &[u8]) -> Result<Self> {
        let sequence = dec.read_number(buf)? as u64;
        let success = dec.read_bool(buf)?;
        let value = dec.read_value(buf)?;
        Ok(Self {
            sequence,
            success,
            value,
        })
    }

    /// Reads a reply that must answer a synchronous call.
    pub fn read_sync(dec: &mut Decoder, buf: &mut &[u8]) -> Result<Self> {
        let reply = Self::read(dec, buf)?;
        if reply.sequence != SYNC_SEQUENCE {
            return Err(RpcError::StreamCorrupted(format!(
                "expected a synchronous reply, got sequence {}",
                reply.sequence
            )));
        }
        Ok(reply)
    }
}
