//! ABI-level types and raw values.
//!
//! [`AbiType`] is the calling-convention view of a value: its size, alignment
//! and the libffi descriptor used to build call interfaces. [`AbiValue`] is the
//! storage for one encoded argument, one decoded result, or one field read out
//! of foreign memory.
//!
//! Integral results narrower than a machine word are widened by the callee
//! side of libffi, so results are always read back through [`AbiType::read_return`]
//! rather than reinterpreting the return buffer directly.

use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use bumpalo::Bump;
use libffi::middle::Type;

use crate::error::ConversionError;
use crate::marshal;
use crate::scope::IntWidth;
use crate::structure::{StructLayout, Structure};
use crate::value::Value;

/// Calling-convention type of an argument, result or field.
#[derive(Clone)]
pub enum AbiType {
    Void,
    /// C `_Bool`, one byte.
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// Single-precision float.
    F32,
    /// Double-precision float.
    F64,
    /// Any data or code pointer.
    Pointer,
    /// Structure passed or returned by value.
    Struct(Arc<StructLayout>),
}

impl AbiType {
    /// Fixed-width integer type for the given width and signedness.
    pub const fn int(width: IntWidth, signed: bool) -> Self {
        match (width, signed) {
            (IntWidth::W8, true) => AbiType::I8,
            (IntWidth::W8, false) => AbiType::U8,
            (IntWidth::W16, true) => AbiType::I16,
            (IntWidth::W16, false) => AbiType::U16,
            (IntWidth::W32, true) => AbiType::I32,
            (IntWidth::W32, false) => AbiType::U32,
            (IntWidth::W64, true) => AbiType::I64,
            (IntWidth::W64, false) => AbiType::U64,
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        match self {
            AbiType::Void => 0,
            AbiType::Bool | AbiType::I8 | AbiType::U8 => 1,
            AbiType::I16 | AbiType::U16 => 2,
            AbiType::I32 | AbiType::U32 | AbiType::F32 => 4,
            AbiType::I64 | AbiType::U64 | AbiType::F64 => 8,
            AbiType::Pointer => size_of::<usize>(),
            AbiType::Struct(layout) => layout.size(),
        }
    }

    /// Natural alignment in bytes.
    pub fn align(&self) -> usize {
        match self {
            AbiType::Void => 1,
            AbiType::Bool | AbiType::I8 | AbiType::U8 => 1,
            AbiType::I16 | AbiType::U16 => 2,
            AbiType::I32 | AbiType::U32 | AbiType::F32 => 4,
            AbiType::I64 => std::mem::align_of::<i64>(),
            AbiType::U64 => std::mem::align_of::<u64>(),
            AbiType::F64 => std::mem::align_of::<f64>(),
            AbiType::Pointer => std::mem::align_of::<usize>(),
            AbiType::Struct(layout) => layout.align(),
        }
    }

    /// Check if this is an integer type (bool excluded).
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            AbiType::I8
                | AbiType::U8
                | AbiType::I16
                | AbiType::U16
                | AbiType::I32
                | AbiType::U32
                | AbiType::I64
                | AbiType::U64
        )
    }

    /// Check if this is a signed integer type.
    pub fn is_signed(&self) -> bool {
        matches!(self, AbiType::I8 | AbiType::I16 | AbiType::I32 | AbiType::I64)
    }

    /// Check if this is the void type.
    pub fn is_void(&self) -> bool {
        matches!(self, AbiType::Void)
    }

    /// Build the libffi descriptor for this type.
    pub fn ffi_type(&self) -> Type {
        match self {
            AbiType::Void => Type::void(),
            AbiType::Bool | AbiType::U8 => Type::u8(),
            AbiType::I8 => Type::i8(),
            AbiType::I16 => Type::i16(),
            AbiType::U16 => Type::u16(),
            AbiType::I32 => Type::i32(),
            AbiType::U32 => Type::u32(),
            AbiType::I64 => Type::i64(),
            AbiType::U64 => Type::u64(),
            AbiType::F32 => Type::f32(),
            AbiType::F64 => Type::f64(),
            AbiType::Pointer => Type::pointer(),
            AbiType::Struct(layout) => layout.ffi_type(),
        }
    }

    /// Convert a host value into this ABI type without any marshalling cast.
    ///
    /// Temporaries that must outlive the encoding (C strings) are placed in
    /// `arena`, which the caller keeps alive for the duration of the call.
    pub fn encode(&self, value: &Value, arena: &Bump) -> Result<AbiValue, ConversionError> {
        let encoded = match self {
            AbiType::Void => {
                return Err(ConversionError::TypeMismatch {
                    expected: "a non-void type".to_string(),
                    actual: value.type_name(),
                });
            }
            AbiType::Bool => AbiValue::Bool(u8::from(truthy(value, self)?)),
            AbiType::I8 => AbiValue::I8(narrow(integer(value, self)?, self)?),
            AbiType::U8 => AbiValue::U8(narrow(integer(value, self)?, self)?),
            AbiType::I16 => AbiValue::I16(narrow(integer(value, self)?, self)?),
            AbiType::U16 => AbiValue::U16(narrow(integer(value, self)?, self)?),
            AbiType::I32 => AbiValue::I32(narrow(integer(value, self)?, self)?),
            AbiType::U32 => AbiValue::U32(narrow(integer(value, self)?, self)?),
            AbiType::I64 => AbiValue::I64(narrow(integer(value, self)?, self)?),
            AbiType::U64 => AbiValue::U64(narrow(integer(value, self)?, self)?),
            AbiType::F32 => AbiValue::F32(float(value, self)? as f32),
            AbiType::F64 => AbiValue::F64(float(value, self)?),
            AbiType::Pointer => AbiValue::Pointer(pointer(value, arena)?),
            AbiType::Struct(layout) => match value {
                Value::Struct(s) if s.layout().same_as(layout) => AbiValue::Struct(s.to_buf()),
                other => {
                    return Err(ConversionError::TypeMismatch {
                        expected: self.to_string(),
                        actual: other.type_name(),
                    });
                }
            },
        };
        Ok(encoded)
    }

    /// Convert a raw value of this type back into a host value.
    pub fn decode(&self, raw: AbiValue) -> Value {
        match (self, raw) {
            (AbiType::Struct(layout), AbiValue::Struct(buf)) => {
                Value::Struct(Structure::from_buf(Arc::clone(layout), buf))
            }
            (_, raw) => raw.into_value(),
        }
    }

    /// Read a value of this type from foreign memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `self.size()` bytes.
    pub unsafe fn read_at(&self, ptr: *const u8) -> AbiValue {
        // SAFETY: the caller guarantees `ptr` covers `self.size()` bytes.
        unsafe {
            match self {
                AbiType::Void => AbiValue::Void,
                AbiType::Bool => AbiValue::Bool(ptr.read()),
                AbiType::I8 => AbiValue::I8(ptr.cast::<i8>().read()),
                AbiType::U8 => AbiValue::U8(ptr.read()),
                AbiType::I16 => AbiValue::I16(ptr.cast::<i16>().read_unaligned()),
                AbiType::U16 => AbiValue::U16(ptr.cast::<u16>().read_unaligned()),
                AbiType::I32 => AbiValue::I32(ptr.cast::<i32>().read_unaligned()),
                AbiType::U32 => AbiValue::U32(ptr.cast::<u32>().read_unaligned()),
                AbiType::I64 => AbiValue::I64(ptr.cast::<i64>().read_unaligned()),
                AbiType::U64 => AbiValue::U64(ptr.cast::<u64>().read_unaligned()),
                AbiType::F32 => AbiValue::F32(ptr.cast::<f32>().read_unaligned()),
                AbiType::F64 => AbiValue::F64(ptr.cast::<f64>().read_unaligned()),
                AbiType::Pointer => AbiValue::Pointer(ptr.cast::<usize>().read_unaligned()),
                AbiType::Struct(layout) => {
                    let bytes = std::slice::from_raw_parts(ptr, layout.size());
                    AbiValue::Struct(AlignedBuf::from_bytes(bytes))
                }
            }
        }
    }

    /// Read a call result of this type out of a return buffer.
    pub fn read_return(&self, buf: &ReturnBuffer) -> AbiValue {
        if (self.is_integer() || matches!(self, AbiType::Bool)) && self.size() < size_of::<usize>() {
            return self.from_word(buf.word());
        }
        // SAFETY: the buffer is at least as large as the result type.
        unsafe { self.read_at(buf.as_ptr()) }
    }

    /// Truncate a widened return word to this type.
    fn from_word(&self, word: usize) -> AbiValue {
        match self {
            AbiType::Bool => AbiValue::Bool(word as u8),
            AbiType::I8 => AbiValue::I8(word as u8 as i8),
            AbiType::U8 => AbiValue::U8(word as u8),
            AbiType::I16 => AbiValue::I16(word as u16 as i16),
            AbiType::U16 => AbiValue::U16(word as u16),
            AbiType::I32 => AbiValue::I32(word as u32 as i32),
            AbiType::U32 => AbiValue::U32(word as u32),
            AbiType::I64 => AbiValue::I64(word as u64 as i64),
            AbiType::U64 => AbiValue::U64(word as u64),
            _ => AbiValue::Pointer(word),
        }
    }
}

impl fmt::Debug for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbiType::Void => "void",
            AbiType::Bool => "bool",
            AbiType::I8 => "int8",
            AbiType::U8 => "uint8",
            AbiType::I16 => "int16",
            AbiType::U16 => "uint16",
            AbiType::I32 => "int32",
            AbiType::U32 => "uint32",
            AbiType::I64 => "int64",
            AbiType::U64 => "uint64",
            AbiType::F32 => "float",
            AbiType::F64 => "double",
            AbiType::Pointer => "pointer",
            AbiType::Struct(layout) => return write!(f, "struct {}", layout.name()),
        };
        f.write_str(name)
    }
}

impl PartialEq for AbiType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AbiType::Struct(a), AbiType::Struct(b)) => a.same_as(b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// ============================================================================
// Raw values
// ============================================================================

/// One encoded argument, decoded result, or raw field value.
#[derive(Debug, Clone, PartialEq)]
pub enum AbiValue {
    Void,
    Bool(u8),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(usize),
    Struct(AlignedBuf),
}

impl AbiValue {
    /// Address of the stored payload, as libffi expects for an argument slot.
    pub fn as_arg_ptr(&self) -> *mut c_void {
        match self {
            AbiValue::Void => std::ptr::null_mut(),
            AbiValue::Bool(v) | AbiValue::U8(v) => v as *const u8 as *mut c_void,
            AbiValue::I8(v) => v as *const i8 as *mut c_void,
            AbiValue::I16(v) => v as *const i16 as *mut c_void,
            AbiValue::U16(v) => v as *const u16 as *mut c_void,
            AbiValue::I32(v) => v as *const i32 as *mut c_void,
            AbiValue::U32(v) => v as *const u32 as *mut c_void,
            AbiValue::I64(v) => v as *const i64 as *mut c_void,
            AbiValue::U64(v) => v as *const u64 as *mut c_void,
            AbiValue::F32(v) => v as *const f32 as *mut c_void,
            AbiValue::F64(v) => v as *const f64 as *mut c_void,
            AbiValue::Pointer(v) => v as *const usize as *mut c_void,
            AbiValue::Struct(buf) => buf.as_ptr() as *mut c_void,
        }
    }

    /// Write this value to foreign memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of the payload's size.
    pub unsafe fn write_at(&self, ptr: *mut u8) {
        // SAFETY: the caller guarantees `ptr` covers the payload.
        unsafe {
            match self {
                AbiValue::Void => {}
                AbiValue::Bool(v) | AbiValue::U8(v) => ptr.write(*v),
                AbiValue::I8(v) => ptr.cast::<i8>().write(*v),
                AbiValue::I16(v) => ptr.cast::<i16>().write_unaligned(*v),
                AbiValue::U16(v) => ptr.cast::<u16>().write_unaligned(*v),
                AbiValue::I32(v) => ptr.cast::<i32>().write_unaligned(*v),
                AbiValue::U32(v) => ptr.cast::<u32>().write_unaligned(*v),
                AbiValue::I64(v) => ptr.cast::<i64>().write_unaligned(*v),
                AbiValue::U64(v) => ptr.cast::<u64>().write_unaligned(*v),
                AbiValue::F32(v) => ptr.cast::<f32>().write_unaligned(*v),
                AbiValue::F64(v) => ptr.cast::<f64>().write_unaligned(*v),
                AbiValue::Pointer(v) => ptr.cast::<usize>().write_unaligned(*v),
                AbiValue::Struct(buf) => {
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len());
                }
            }
        }
    }

    /// Write this value as a callback result, widening integers to a full word.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a libffi return slot of at least one machine word.
    pub unsafe fn write_return(&self, ptr: *mut u8) {
        let word = match *self {
            AbiValue::Bool(v) | AbiValue::U8(v) => Some(v as usize),
            AbiValue::I8(v) => Some(v as isize as usize),
            AbiValue::I16(v) => Some(v as isize as usize),
            AbiValue::U16(v) => Some(v as usize),
            AbiValue::I32(v) => Some(v as isize as usize),
            AbiValue::U32(v) => Some(v as usize),
            _ => None,
        };
        // SAFETY: the caller guarantees a word-sized return slot.
        unsafe {
            match word {
                Some(word) => ptr.cast::<usize>().write_unaligned(word),
                None => self.write_at(ptr),
            }
        }
    }

    /// Convert into a host value using the natural mapping of each raw kind.
    pub fn into_value(self) -> Value {
        match self {
            AbiValue::Void => Value::Void,
            AbiValue::Bool(v) => Value::Bool(v != 0),
            AbiValue::I8(v) => Value::Int(v.into()),
            AbiValue::I16(v) => Value::Int(v.into()),
            AbiValue::I32(v) => Value::Int(v.into()),
            AbiValue::I64(v) => Value::Int(v),
            AbiValue::U8(v) => Value::UInt(v.into()),
            AbiValue::U16(v) => Value::UInt(v.into()),
            AbiValue::U32(v) => Value::UInt(v.into()),
            AbiValue::U64(v) => Value::UInt(v),
            AbiValue::F32(v) => Value::Float(v.into()),
            AbiValue::F64(v) => Value::Float(v),
            AbiValue::Pointer(0) => Value::Null,
            AbiValue::Pointer(p) => Value::Pointer(p),
            // Structures decode through their layout, see `AbiType::decode`.
            AbiValue::Struct(_) => Value::Void,
        }
    }

    /// Read the value as a pointer-sized address, if it is one.
    pub fn as_address(&self) -> Option<usize> {
        match *self {
            AbiValue::Pointer(p) => Some(p),
            _ => None,
        }
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// Byte buffer with 8-byte alignment, used for structure and reference storage.
#[derive(Clone, Default, PartialEq)]
pub struct AlignedBuf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    /// Create a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8).max(1)],
            len,
        }
    }

    /// Copy `bytes` into a new aligned buffer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_bytes_mut().copy_from_slice(bytes);
        buf
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr().cast()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: `words` owns at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

/// Storage libffi writes a call result into.
///
/// Always at least one machine word, since integral results are widened.
pub struct ReturnBuffer {
    buf: AlignedBuf,
}

impl ReturnBuffer {
    /// Allocate a return buffer for a result of type `ty`.
    pub fn for_type(ty: &AbiType) -> Self {
        Self {
            buf: AlignedBuf::zeroed(ty.size().max(size_of::<u64>())),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.buf.as_mut_ptr().cast()
    }

    fn word(&self) -> usize {
        // SAFETY: the buffer is at least one word long and word aligned.
        unsafe { self.buf.as_ptr().cast::<usize>().read() }
    }
}

// ============================================================================
// Default host -> ABI conversions
// ============================================================================

fn integer(value: &Value, target: &AbiType) -> Result<i128, ConversionError> {
    match *value {
        Value::Int(v) => Ok(v.into()),
        Value::UInt(v) => Ok(v.into()),
        Value::Bool(v) => Ok(i128::from(v)),
        ref other => Err(ConversionError::TypeMismatch {
            expected: target.to_string(),
            actual: other.type_name(),
        }),
    }
}

fn narrow<T: TryFrom<i128>>(value: i128, target: &AbiType) -> Result<T, ConversionError> {
    T::try_from(value).map_err(|_| ConversionError::IntegerOverflow {
        value,
        target_type: target.to_string(),
    })
}

fn float(value: &Value, target: &AbiType) -> Result<f64, ConversionError> {
    match *value {
        Value::Float(v) => Ok(v),
        Value::Int(v) => Ok(v as f64),
        Value::UInt(v) => Ok(v as f64),
        ref other => Err(ConversionError::TypeMismatch {
            expected: target.to_string(),
            actual: other.type_name(),
        }),
    }
}

fn truthy(value: &Value, target: &AbiType) -> Result<bool, ConversionError> {
    match *value {
        Value::Bool(v) => Ok(v),
        Value::Int(v) => Ok(v != 0),
        Value::UInt(v) => Ok(v != 0),
        ref other => Err(ConversionError::TypeMismatch {
            expected: target.to_string(),
            actual: other.type_name(),
        }),
    }
}

fn pointer(value: &Value, arena: &Bump) -> Result<usize, ConversionError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(*p),
        Value::UInt(v) => usize::try_from(*v).map_err(|_| ConversionError::IntegerOverflow {
            value: (*v).into(),
            target_type: "pointer".to_string(),
        }),
        Value::Int(v) => usize::try_from(*v).map_err(|_| ConversionError::IntegerOverflow {
            value: (*v).into(),
            target_type: "pointer".to_string(),
        }),
        Value::Str(s) => marshal::encode_byte_string(s, arena),
        Value::Ref(r) => Ok(r.as_mut_ptr() as usize),
        Value::Struct(s) => Ok(s.as_mut_ptr() as usize),
        other => Err(ConversionError::TypeMismatch {
            expected: "pointer".to_string(),
            actual: other.type_name(),
        }),
    }
}
