//! Marshalling types: castable types that know how to convert host values
//! to their ABI representation and back.
//!
//! A [`MarshalType`] is a capability descriptor, not a value. Resolution
//! attaches one to a parameter, result or structure field when the plain
//! ABI mapping is not enough (strings need encoding, handles need
//! null-checking, structure pointers need their owner's layout).
//!
//! Temporaries created while encoding arguments live in a [`Bump`] arena the
//! caller drops after the call. Structure fields that must outlive a single
//! call keep their storage in a [`Keepalive`] instead.

use std::ffi::{CStr, c_char};
use std::fmt;
use std::sync::Arc;

use bumpalo::Bump;

use crate::abi::{AbiType, AbiValue};
use crate::error::ConversionError;
use crate::reference::Reference;
use crate::scope::{IntWidth, StringKind};
use crate::structure::{StructLayout, Structure};
use crate::value::Value;

/// Platform `wchar_t`.
#[cfg(windows)]
pub type WChar = u16;
/// Platform `wchar_t`.
#[cfg(not(windows))]
pub type WChar = u32;

/// Castable type with host→ABI and ABI→host conversions.
#[derive(Clone, PartialEq)]
pub enum MarshalType {
    /// NUL-terminated UTF-8 `char*`.
    ByteString,
    /// NUL-terminated `wchar_t*`.
    WideString,
    /// Fixed-width integer.
    Int { width: IntWidth, signed: bool },
    /// C `_Bool`.
    Bool,
    /// C `float`.
    Float,
    /// C `double`.
    Double,
    /// Opaque pointer, never dereferenced.
    Handle,
    /// Structure passed by value.
    Struct(Arc<StructLayout>),
    /// Pointer to a structure of the named type.
    StructPointer { name: String },
    /// Pointer to a boxed [`Reference`].
    Reference,
    /// Function pointer produced by a callback adapter.
    Callback,
}

impl MarshalType {
    /// Integer type for a width and signedness.
    pub fn int(width: IntWidth, signed: bool) -> Self {
        MarshalType::Int { width, signed }
    }

    /// String type for a string kind.
    pub fn string(kind: StringKind) -> Self {
        match kind {
            StringKind::Bytes => MarshalType::ByteString,
            StringKind::Wide => MarshalType::WideString,
        }
    }

    /// The ABI type values of this type travel as.
    pub fn abi_type(&self) -> AbiType {
        match self {
            MarshalType::Int { width, signed } => AbiType::int(*width, *signed),
            MarshalType::Bool => AbiType::Bool,
            MarshalType::Float => AbiType::F32,
            MarshalType::Double => AbiType::F64,
            MarshalType::Struct(layout) => AbiType::Struct(Arc::clone(layout)),
            MarshalType::ByteString
            | MarshalType::WideString
            | MarshalType::Handle
            | MarshalType::StructPointer { .. }
            | MarshalType::Reference
            | MarshalType::Callback => AbiType::Pointer,
        }
    }

    /// Check if this type travels as a pointer.
    pub fn is_pointer(&self) -> bool {
        matches!(self.abi_type(), AbiType::Pointer)
    }

    /// Convert a host value for passing to foreign code.
    pub fn to_abi(&self, value: &Value, arena: &Bump) -> Result<AbiValue, ConversionError> {
        let address = match (self, value) {
            (MarshalType::Int { .. }, _)
            | (MarshalType::Bool, _)
            | (MarshalType::Float, _)
            | (MarshalType::Double, _)
            | (MarshalType::Struct(_), _) => return self.abi_type().encode(value, arena),

            (_, Value::Null) => 0,
            (MarshalType::ByteString, Value::Str(s)) => encode_byte_string(s, arena)?,
            (MarshalType::WideString, Value::Str(s)) => encode_wide_string(s, arena)?,
            (MarshalType::StructPointer { name }, Value::Struct(s)) if s.layout().name() == name => {
                s.as_mut_ptr() as usize
            }
            (MarshalType::Reference, Value::Ref(r)) => r.as_mut_ptr() as usize,
            (MarshalType::Handle, Value::Struct(s)) => s.as_mut_ptr() as usize,
            (MarshalType::Handle, Value::Ref(r)) => r.as_mut_ptr() as usize,
            (MarshalType::Handle, Value::Int(_) | Value::UInt(_)) => {
                return AbiType::Pointer.encode(value, arena);
            }
            (_, Value::Pointer(p)) => *p,
            (_, other) => {
                return Err(ConversionError::TypeMismatch {
                    expected: self.to_string(),
                    actual: other.type_name(),
                });
            }
        };
        Ok(AbiValue::Pointer(address))
    }

    /// Convert a raw foreign value back into a host value.
    pub fn from_abi(&self, raw: AbiValue) -> Result<Value, ConversionError> {
        match (self, raw) {
            (MarshalType::ByteString, AbiValue::Pointer(p)) => decode_byte_string(p),
            (MarshalType::WideString, AbiValue::Pointer(p)) => decode_wide_string(p),
            (MarshalType::Bool, AbiValue::Bool(v)) => Ok(Value::Bool(v != 0)),
            (MarshalType::Struct(layout), raw) => Ok(AbiType::Struct(Arc::clone(layout)).decode(raw)),
            (MarshalType::ByteString | MarshalType::WideString, other) => {
                Err(ConversionError::TypeMismatch {
                    expected: "pointer".to_string(),
                    actual: other.into_value().type_name(),
                })
            }
            (_, raw) => Ok(raw.into_value()),
        }
    }

    /// Encode a value for storage that outlives a call, such as a
    /// structure field.
    ///
    /// Returns the raw value and, for pointer types, the storage the pointer
    /// refers to. The caller keeps the [`Keepalive`] as long as the raw
    /// value is reachable from foreign memory.
    pub fn to_abi_owned(&self, value: &Value) -> Result<(AbiValue, Option<Keepalive>), ConversionError> {
        let keep = match (self, value) {
            (MarshalType::ByteString, Value::Str(s)) => Keepalive::Bytes(owned_byte_string(s)?),
            (MarshalType::WideString, Value::Str(s)) => Keepalive::Wide(owned_wide_string(s)?),
            (_, Value::Struct(s)) if self.is_pointer() => Keepalive::Struct(s.clone()),
            (_, Value::Ref(r)) if self.is_pointer() => Keepalive::Ref(r.clone()),
            _ => {
                // Scalars and raw addresses never touch the arena.
                let raw = self.to_abi(value, &Bump::new())?;
                return Ok((raw, None));
            }
        };
        // Type checks for structure and reference pointers still apply.
        let raw = match &keep {
            Keepalive::Bytes(_) | Keepalive::Wide(_) => AbiValue::Pointer(keep.address()),
            _ => self.to_abi(value, &Bump::new())?,
        };
        Ok((raw, Some(keep)))
    }
}

impl fmt::Display for MarshalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalType::ByteString => f.write_str("char*"),
            MarshalType::WideString => f.write_str("wchar_t*"),
            MarshalType::Int { width, signed: true } => write!(f, "int{width}"),
            MarshalType::Int { width, signed: false } => write!(f, "uint{width}"),
            MarshalType::Bool => f.write_str("bool"),
            MarshalType::Float => f.write_str("float"),
            MarshalType::Double => f.write_str("double"),
            MarshalType::Handle => f.write_str("handle"),
            MarshalType::Struct(layout) => write!(f, "struct {}", layout.name()),
            MarshalType::StructPointer { name } => write!(f, "struct {name}*"),
            MarshalType::Reference => f.write_str("reference"),
            MarshalType::Callback => f.write_str("callback"),
        }
    }
}

impl fmt::Debug for MarshalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

// ============================================================================
// Owned storage
// ============================================================================

/// Storage a stored pointer refers to.
#[derive(Clone)]
pub enum Keepalive {
    Bytes(Box<[u8]>),
    Wide(Box<[WChar]>),
    Struct(Structure),
    Ref(Reference),
}

impl Keepalive {
    /// Address of the kept storage.
    pub fn address(&self) -> usize {
        match self {
            Keepalive::Bytes(b) => b.as_ptr() as usize,
            Keepalive::Wide(w) => w.as_ptr() as usize,
            Keepalive::Struct(s) => s.as_mut_ptr() as usize,
            Keepalive::Ref(r) => r.as_mut_ptr() as usize,
        }
    }
}

// ============================================================================
// Strings
// ============================================================================

fn check_nul(s: &str) -> Result<(), ConversionError> {
    match s.find('\0') {
        Some(position) => Err(ConversionError::InteriorNul { position }),
        None => Ok(()),
    }
}

/// Copy `s` into `arena` as a NUL-terminated byte string, returning its address.
pub fn encode_byte_string(s: &str, arena: &Bump) -> Result<usize, ConversionError> {
    check_nul(s)?;
    let buf = arena.alloc_slice_fill_copy(s.len() + 1, 0u8);
    buf[..s.len()].copy_from_slice(s.as_bytes());
    Ok(buf.as_ptr() as usize)
}

/// Copy `s` into `arena` as a NUL-terminated wide string, returning its address.
pub fn encode_wide_string(s: &str, arena: &Bump) -> Result<usize, ConversionError> {
    check_nul(s)?;
    let units = wide_units(s);
    let buf = arena.alloc_slice_fill_copy(units.len() + 1, 0 as WChar);
    buf[..units.len()].copy_from_slice(&units);
    Ok(buf.as_ptr() as usize)
}

/// Heap-allocated NUL-terminated byte string.
pub fn owned_byte_string(s: &str) -> Result<Box<[u8]>, ConversionError> {
    check_nul(s)?;
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    Ok(bytes.into_boxed_slice())
}

/// Heap-allocated NUL-terminated wide string.
pub fn owned_wide_string(s: &str) -> Result<Box<[WChar]>, ConversionError> {
    check_nul(s)?;
    let mut units = wide_units(s);
    units.push(0);
    Ok(units.into_boxed_slice())
}

#[cfg(windows)]
fn wide_units(s: &str) -> Vec<WChar> {
    s.encode_utf16().collect()
}

#[cfg(not(windows))]
fn wide_units(s: &str) -> Vec<WChar> {
    s.chars().map(u32::from).collect()
}

/// Read a NUL-terminated byte string at `address`; null decodes to [`Value::Null`].
pub fn decode_byte_string(address: usize) -> Result<Value, ConversionError> {
    if address == 0 {
        return Ok(Value::Null);
    }
    // SAFETY: foreign code hands us a NUL-terminated string or null.
    let cstr = unsafe { CStr::from_ptr(address as *const c_char) };
    cstr.to_str()
        .map(|s| Value::Str(s.to_string()))
        .map_err(|e| ConversionError::InvalidString(e.to_string()))
}

/// Read a NUL-terminated wide string at `address`; null decodes to [`Value::Null`].
pub fn decode_wide_string(address: usize) -> Result<Value, ConversionError> {
    if address == 0 {
        return Ok(Value::Null);
    }
    let ptr = address as *const WChar;
    let mut len = 0;
    // SAFETY: foreign code hands us a NUL-terminated wide string.
    let units = unsafe {
        while ptr.add(len).read_unaligned() != 0 {
            len += 1;
        }
        std::slice::from_raw_parts(ptr, len)
    };
    wide_to_string(units).map(Value::Str)
}

#[cfg(windows)]
fn wide_to_string(units: &[WChar]) -> Result<String, ConversionError> {
    String::from_utf16(units).map_err(|e| ConversionError::InvalidString(e.to_string()))
}

#[cfg(not(windows))]
fn wide_to_string(units: &[WChar]) -> Result<String, ConversionError> {
    units
        .iter()
        .map(|&u| {
            char::from_u32(u)
                .ok_or_else(|| ConversionError::InvalidString(format!("invalid code point {u:#x}")))
        })
        .collect()
}
