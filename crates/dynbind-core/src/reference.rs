//! Boxed output and in-out references.
//!
//! A [`Reference`] owns storage for one primitive or a fixed-size array of
//! primitives. Passing it to a call passes its address; foreign code writes
//! through that address and the host reads the result back afterwards:
//!
//! ```
//! use dynbind_core::Reference;
//!
//! let exponent = Reference::integer(0);
//! // ... pass `exponent` to frexp(), which stores 33 ...
//! # unsafe { exponent.as_mut_ptr().cast::<i32>().write(33) };
//! assert_eq!(exponent, 33);
//! assert!(exponent > 32);
//! assert_eq!(exponent.to_string(), "33");
//! ```

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use bumpalo::Bump;

use crate::abi::{AbiType, AbiValue, AlignedBuf};
use crate::error::ConversionError;
use crate::value::Value;

struct RefInner {
    element: AbiType,
    len: usize,
    buf: RefCell<AlignedBuf>,
    base: usize,
}

/// Boxed primitive or array whose address is passed to foreign code.
///
/// Clones share the same storage.
#[derive(Clone)]
pub struct Reference {
    inner: Rc<RefInner>,
}

impl Reference {
    /// Box a value of the given ABI type.
    ///
    /// Pointer references accept null, raw addresses and integers; strings,
    /// structures and other references cannot be boxed since the box would
    /// not keep them alive.
    pub fn new(element: AbiType, value: &Value) -> Result<Self, ConversionError> {
        let r = Self::array(element, 1)?;
        r.set(value)?;
        Ok(r)
    }

    /// Box a C `_Bool`.
    pub fn boolean(value: bool) -> Self {
        Self::scalar(AbiType::Bool, AbiValue::Bool(u8::from(value)))
    }

    /// Box a C `int`.
    pub fn integer(value: i32) -> Self {
        Self::scalar(AbiType::I32, AbiValue::I32(value))
    }

    /// Box a C `float`.
    pub fn float(value: f32) -> Self {
        Self::scalar(AbiType::F32, AbiValue::F32(value))
    }

    /// Zero-filled array of `len` elements.
    pub fn array(element: AbiType, len: usize) -> Result<Self, ConversionError> {
        if element.is_void() || matches!(element, AbiType::Struct(_)) {
            return Err(ConversionError::TypeMismatch {
                expected: "a primitive element type".to_string(),
                actual: if element.is_void() { "void" } else { "struct" },
            });
        }
        let size = element
            .size()
            .checked_mul(len)
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| ConversionError::ArrayTooLarge {
                len,
                element: element.to_string(),
            })?;
        let mut buf = AlignedBuf::zeroed(size);
        let base = buf.as_mut_ptr() as usize;
        Ok(Self {
            inner: Rc::new(RefInner {
                element,
                len,
                buf: RefCell::new(buf),
                base,
            }),
        })
    }

    /// Array initialised from host values.
    pub fn array_from(element: AbiType, values: &[Value]) -> Result<Self, ConversionError> {
        let r = Self::array(element, values.len())?;
        for (i, value) in values.iter().enumerate() {
            r.set_index(i, value)?;
        }
        Ok(r)
    }

    fn scalar(element: AbiType, value: AbiValue) -> Self {
        let mut buf = AlignedBuf::zeroed(element.size());
        // SAFETY: the buffer holds exactly one element of this type.
        unsafe { value.write_at(buf.as_mut_ptr()) };
        let base = buf.as_mut_ptr() as usize;
        Self {
            inner: Rc::new(RefInner {
                element,
                len: 1,
                buf: RefCell::new(buf),
                base,
            }),
        }
    }

    pub fn element_type(&self) -> &AbiType {
        &self.inner.element
    }

    /// Number of elements; 1 for scalars.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Address passed to foreign code.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.base as *mut u8
    }

    /// Check if both handles share the same storage.
    pub fn ptr_eq(&self, other: &Reference) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read the first element.
    pub fn get(&self) -> Value {
        self.get_index(0).unwrap_or_default()
    }

    /// Read the element at `index`.
    pub fn get_index(&self, index: usize) -> Result<Value, ConversionError> {
        let offset = self.offset(index)?;
        let buf = self.inner.buf.borrow();
        // SAFETY: `offset` addresses one whole element within the buffer.
        let raw = unsafe { self.inner.element.read_at(buf.as_ptr().add(offset)) };
        Ok(self.inner.element.decode(raw))
    }

    /// Overwrite the first element.
    pub fn set(&self, value: &Value) -> Result<(), ConversionError> {
        self.set_index(0, value)
    }

    /// Overwrite the element at `index`.
    pub fn set_index(&self, index: usize, value: &Value) -> Result<(), ConversionError> {
        let offset = self.offset(index)?;
        if matches!(self.inner.element, AbiType::Pointer)
            && matches!(value, Value::Str(_) | Value::Struct(_) | Value::Ref(_))
        {
            return Err(ConversionError::TypeMismatch {
                expected: "pointer".to_string(),
                actual: value.type_name(),
            });
        }
        let raw = self.inner.element.encode(value, &Bump::new())?;
        let mut buf = self.inner.buf.borrow_mut();
        // SAFETY: `offset` addresses one whole element within the buffer.
        unsafe { raw.write_at(buf.as_mut_ptr().add(offset)) };
        Ok(())
    }

    /// All elements.
    pub fn to_vec(&self) -> Vec<Value> {
        (0..self.len()).filter_map(|i| self.get_index(i).ok()).collect()
    }

    /// Integer view of the first element.
    pub fn as_int(&self) -> Result<i64, ConversionError> {
        let value = self.get();
        match value {
            Value::Float(f) => Ok(f as i64),
            ref other => other.as_int().ok_or_else(|| ConversionError::TypeMismatch {
                expected: "int".to_string(),
                actual: other.type_name(),
            }),
        }
    }

    /// Float view of the first element.
    pub fn as_float(&self) -> Result<f64, ConversionError> {
        let value = self.get();
        match value {
            Value::Bool(b) => Ok(f64::from(u8::from(b))),
            ref other => other.as_float().ok_or_else(|| ConversionError::TypeMismatch {
                expected: "float".to_string(),
                actual: other.type_name(),
            }),
        }
    }

    /// Truthiness of the first element: non-zero numbers and non-null pointers.
    pub fn is_truthy(&self) -> bool {
        match self.get() {
            Value::Bool(b) => b,
            Value::Int(v) => v != 0,
            Value::UInt(v) => v != 0,
            Value::Float(v) => v != 0.0,
            Value::Pointer(p) => p != 0,
            _ => false,
        }
    }

    fn offset(&self, index: usize) -> Result<usize, ConversionError> {
        if index >= self.inner.len {
            return Err(ConversionError::IndexOutOfBounds {
                index,
                len: self.inner.len,
            });
        }
        Ok(index * self.inner.element.size())
    }

    fn compare_int(&self, other: i64) -> Option<Ordering> {
        match self.get() {
            Value::Int(v) => Some(v.cmp(&other)),
            Value::UInt(v) => Some(i128::from(v).cmp(&i128::from(other))),
            Value::Bool(v) => Some(i64::from(v).cmp(&other)),
            Value::Float(v) => v.partial_cmp(&(other as f64)),
            _ => None,
        }
    }

    fn compare_float(&self, other: f64) -> Option<Ordering> {
        self.as_float().ok()?.partial_cmp(&other)
    }
}

impl TryFrom<&Reference> for i64 {
    type Error = ConversionError;

    fn try_from(r: &Reference) -> Result<Self, Self::Error> {
        r.as_int()
    }
}

impl TryFrom<&Reference> for f64 {
    type Error = ConversionError;

    fn try_from(r: &Reference) -> Result<Self, Self::Error> {
        r.as_float()
    }
}

impl From<&Reference> for bool {
    fn from(r: &Reference) -> Self {
        r.is_truthy()
    }
}

impl PartialEq<i64> for Reference {
    fn eq(&self, other: &i64) -> bool {
        self.compare_int(*other) == Some(Ordering::Equal)
    }
}

impl PartialOrd<i64> for Reference {
    fn partial_cmp(&self, other: &i64) -> Option<Ordering> {
        self.compare_int(*other)
    }
}

impl PartialEq<i32> for Reference {
    fn eq(&self, other: &i32) -> bool {
        *self == i64::from(*other)
    }
}

impl PartialOrd<i32> for Reference {
    fn partial_cmp(&self, other: &i32) -> Option<Ordering> {
        self.compare_int(i64::from(*other))
    }
}

impl PartialEq<f64> for Reference {
    fn eq(&self, other: &f64) -> bool {
        self.compare_float(*other) == Some(Ordering::Equal)
    }
}

impl PartialOrd<f64> for Reference {
    fn partial_cmp(&self, other: &f64) -> Option<Ordering> {
        self.compare_float(*other)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn scalar(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
            match value {
                Value::Bool(v) => write!(f, "{v}"),
                Value::Int(v) => write!(f, "{v}"),
                Value::UInt(v) => write!(f, "{v}"),
                Value::Float(v) => write!(f, "{v}"),
                Value::Pointer(p) => write!(f, "{p:#x}"),
                Value::Null => f.write_str("null"),
                other => write!(f, "{other:?}"),
            }
        }

        if self.len() == 1 {
            return scalar(f, &self.get());
        }
        f.write_str("[")?;
        for (i, value) in self.to_vec().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            scalar(f, value)?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference<{}>({self})", self.inner.element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_33(r: &Reference) {
        unsafe { r.as_mut_ptr().cast::<i32>().write(33) };
    }

    #[test]
    fn integer_box_conversions() {
        let r = Reference::integer(0);
        store_33(&r);

        assert_eq!(r.as_int().unwrap(), 33);
        assert_eq!(i64::try_from(&r).unwrap(), 33);
        assert_eq!(f64::try_from(&r).unwrap(), 33.0);
        assert_eq!(r.to_string(), "33");
        assert!(r.is_truthy());
        assert!(bool::from(&r));
    }

    #[test]
    fn integer_box_comparisons() {
        let r = Reference::integer(33);
        assert!(r < 34);
        assert!(r <= 33);
        assert!(r == 33);
        assert!(r != 32);
        assert!(r >= 33);
        assert!(r > 32);
        assert!(r == 33.0);
        assert!(r < 33.5);
    }

    #[test]
    fn zero_is_falsy() {
        assert!(!Reference::integer(0).is_truthy());
        assert!(!Reference::boolean(false).is_truthy());
        assert!(Reference::float(0.5).is_truthy());
    }

    #[test]
    fn float_box() {
        let r = Reference::float(1.5);
        assert_eq!(r.get(), Value::Float(1.5));
        assert_eq!(r.as_int().unwrap(), 1);
        assert!(r > 1.0);
    }

    #[test]
    fn arrays() {
        let r = Reference::array_from(
            AbiType::U16,
            &[Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r.get_index(2).unwrap(), Value::UInt(3));
        assert_eq!(r.to_string(), "[1, 2, 3]");
        assert!(matches!(
            r.get_index(3),
            Err(ConversionError::IndexOutOfBounds { index: 3, len: 3 })
        ));
    }

    #[test]
    fn oversized_array_is_rejected() {
        assert!(matches!(
            Reference::array(AbiType::I64, usize::MAX),
            Err(ConversionError::ArrayTooLarge { len: usize::MAX, .. })
        ));
        assert!(matches!(
            Reference::array(AbiType::U8, usize::MAX),
            Err(ConversionError::ArrayTooLarge { .. })
        ));
    }

    #[test]
    fn general_constructor() {
        let r = Reference::new(AbiType::I64, &Value::Int(-9)).unwrap();
        assert_eq!(r, -9);
        assert!(Reference::new(AbiType::U8, &Value::Int(300)).is_err());
        assert!(Reference::new(AbiType::Pointer, &Value::from("s")).is_err());
        assert!(Reference::new(AbiType::Void, &Value::Int(1)).is_err());
    }
}
