//! Binary wire codec.
//!
//! - [`tag`] - one's-complement type tags
//! - [`wire`] - value encoder and decoder with name interning
//! - [`descriptor`] - record type descriptors and their registry
//! - [`pojo`] - record serialization and signature resolution

pub mod descriptor;
pub mod pojo;
pub mod tag;
pub mod wire;

pub use descriptor::{lookup_type, register_type, FieldDescriptor, FieldKind, Pojo, TypeDescriptor};
pub use pojo::{can_serialize, resolve_signature, WireDescriptor};
pub use tag::Tag;
pub use wire::{Decoder, Encoder, WireCodec};
