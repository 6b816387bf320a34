//! Structure layouts and instances.
//!
//! A [`StructLayout`] is computed once, when a structure is declared: field
//! offsets follow the C layout rules (optionally capped by a packing value)
//! and every field gets a getter/setter pair generated up front. Fields with
//! a marshalling type cast on access; the rest use the plain ABI mapping.
//!
//! A [`Structure`] is one instance: an aligned byte buffer foreign code can
//! read and write through its address, plus the storage its pointer fields
//! refer to.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bumpalo::Bump;
use libffi::middle::Type;
use rustc_hash::FxHashMap;

use crate::abi::{AbiType, AbiValue, AlignedBuf};
use crate::error::{BindError, ConversionError};
use crate::marker::ResolvedType;
use crate::marshal::{Keepalive, MarshalType};
use crate::value::Value;

type Getter = Box<dyn Fn(&AlignedBuf) -> Result<Value, ConversionError> + Send + Sync>;
type Setter =
    Box<dyn Fn(&Value) -> Result<(AbiValue, Option<Keepalive>), ConversionError> + Send + Sync>;

/// One field of a structure layout.
pub struct FieldLayout {
    name: String,
    ty: ResolvedType,
    abi: AbiType,
    offset: usize,
    get: Getter,
    set: Setter,
}

impl FieldLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved field type.
    pub fn ty(&self) -> &ResolvedType {
        &self.ty
    }

    pub fn abi_type(&self) -> &AbiType {
        &self.abi
    }

    /// Byte offset from the start of the structure.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Check if reads and writes go through a marshalling type.
    pub fn is_cast(&self) -> bool {
        self.ty.cast().is_some()
    }
}

impl fmt::Debug for FieldLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldLayout")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Computed layout of a declared structure.
pub struct StructLayout {
    name: String,
    fields: Vec<FieldLayout>,
    index: FxHashMap<String, usize>,
    size: usize,
    align: usize,
    pack: Option<usize>,
    natural: bool,
}

impl StructLayout {
    /// Start building a layout.
    pub fn builder(name: impl Into<String>) -> StructLayoutBuilder {
        StructLayoutBuilder {
            name: name.into(),
            pack: None,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes, including trailing padding.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn pack(&self) -> Option<usize> {
        self.pack
    }

    /// Check if the layout matches the unpacked C layout.
    ///
    /// Only natural layouts can be passed or returned by value.
    pub fn is_natural(&self) -> bool {
        self.natural
    }

    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    /// Check if both refer to the same declared layout.
    pub fn same_as(&self, other: &StructLayout) -> bool {
        std::ptr::eq(self, other)
    }

    /// Build the libffi descriptor for passing this structure by value.
    pub fn ffi_type(&self) -> Type {
        Type::structure(
            self.fields
                .iter()
                .map(|f| f.abi.ffi_type())
                .collect::<Vec<_>>(),
        )
    }

    fn lookup(&self, field: &str) -> Result<&FieldLayout, ConversionError> {
        self.field(field).ok_or_else(|| ConversionError::UnknownField {
            structure: self.name.clone(),
            field: field.to_string(),
        })
    }
}

impl PartialEq for StructLayout {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Debug for StructLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructLayout")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Builder for [`StructLayout`].
#[derive(Debug)]
pub struct StructLayoutBuilder {
    name: String,
    pack: Option<usize>,
    fields: Vec<(String, ResolvedType)>,
}

impl StructLayoutBuilder {
    /// Cap field alignment at `pack` bytes (a power of two).
    pub fn pack(mut self, pack: usize) -> Self {
        self.pack = Some(pack);
        self
    }

    /// Append a field.
    pub fn field(mut self, name: impl Into<String>, ty: ResolvedType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    /// Compute offsets and generate accessors.
    pub fn build(self) -> Result<Arc<StructLayout>, BindError> {
        let StructLayoutBuilder { name, pack, fields } = self;

        if let Some(pack) = pack
            && !pack.is_power_of_two()
        {
            return Err(BindError::InvalidDeclaration(format!(
                "packing of structure '{name}' must be a power of two (got {pack})"
            )));
        }
        if fields.is_empty() {
            return Err(BindError::InvalidDeclaration(format!(
                "structure '{name}' has no fields"
            )));
        }

        let mut layouts = Vec::with_capacity(fields.len());
        let mut index = FxHashMap::default();
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut natural_align = 1usize;
        let mut natural = true;

        for (field_name, ty) in fields {
            let Some(abi) = ty.abi_type().filter(|a| !a.is_void()) else {
                return Err(BindError::InvalidDeclaration(format!(
                    "field '{field_name}' of structure '{name}' has no ABI type ({ty})"
                )));
            };
            if index.insert(field_name.clone(), layouts.len()).is_some() {
                return Err(BindError::InvalidDeclaration(format!(
                    "duplicate field '{field_name}' in structure '{name}'"
                )));
            }

            let field_align = pack.map_or(abi.align(), |p| abi.align().min(p));
            natural &= field_align == abi.align();
            // libffi lays nested structures out naturally.
            if let AbiType::Struct(inner) = &abi {
                natural &= inner.is_natural();
            }
            natural_align = natural_align.max(abi.align());
            align = align.max(field_align);
            offset = offset.next_multiple_of(field_align);

            let (get, set) = accessors(&ty, &abi, offset);
            layouts.push(FieldLayout {
                name: field_name,
                ty,
                abi: abi.clone(),
                offset,
                get,
                set,
            });
            offset += abi.size();
        }

        Ok(Arc::new(StructLayout {
            name,
            fields: layouts,
            index,
            size: offset.next_multiple_of(align),
            align,
            pack,
            natural: natural && align == natural_align,
        }))
    }
}

fn accessors(ty: &ResolvedType, abi: &AbiType, offset: usize) -> (Getter, Setter) {
    let read_abi = abi.clone();
    let read = move |buf: &AlignedBuf| {
        // SAFETY: the buffer is `layout.size()` bytes and the field lies within it.
        unsafe { read_abi.read_at(buf.as_ptr().add(offset)) }
    };

    match ty.cast() {
        Some(cast) => {
            let get_cast = cast.clone();
            let set_cast = cast.clone();
            (
                Box::new(move |buf: &AlignedBuf| get_cast.from_abi(read(buf))),
                Box::new(move |value: &Value| set_cast.to_abi_owned(value)),
            )
        }
        None => {
            let get_abi = abi.clone();
            let set_abi = abi.clone();
            (
                Box::new(move |buf: &AlignedBuf| Ok(get_abi.decode(read(buf)))),
                Box::new(move |value: &Value| match (&set_abi, value) {
                    (AbiType::Pointer, Value::Str(_)) => {
                        MarshalType::ByteString.to_abi_owned(value)
                    }
                    (AbiType::Pointer, Value::Struct(_) | Value::Ref(_)) => {
                        MarshalType::Handle.to_abi_owned(value)
                    }
                    _ => Ok((set_abi.encode(value, &Bump::new())?, None)),
                }),
            )
        }
    }
}

// ============================================================================
// Instances
// ============================================================================

struct StructData {
    buf: AlignedBuf,
    keep: FxHashMap<usize, Keepalive>,
}

struct StructInner {
    layout: Arc<StructLayout>,
    data: RefCell<StructData>,
    // Heap address of `data.buf`; the buffer is never reallocated.
    base: usize,
}

/// A structure instance. Clones share the same storage.
#[derive(Clone)]
pub struct Structure {
    inner: Rc<StructInner>,
}

impl Structure {
    /// Create a zero-filled instance.
    pub fn new(layout: Arc<StructLayout>) -> Self {
        let buf = AlignedBuf::zeroed(layout.size());
        Self::from_buf(layout, buf)
    }

    /// Create an instance and set the given fields.
    pub fn with<'a>(
        layout: Arc<StructLayout>,
        fields: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Self, ConversionError> {
        let s = Self::new(layout);
        for (name, value) in fields {
            s.set(name, value)?;
        }
        Ok(s)
    }

    /// Wrap an existing buffer of `layout.size()` bytes.
    pub fn from_buf(layout: Arc<StructLayout>, mut buf: AlignedBuf) -> Self {
        let base = buf.as_mut_ptr() as usize;
        Self {
            inner: Rc::new(StructInner {
                layout,
                data: RefCell::new(StructData {
                    buf,
                    keep: FxHashMap::default(),
                }),
                base,
            }),
        }
    }

    /// Copy a structure out of foreign memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `layout.size()` bytes.
    pub unsafe fn read_from(layout: Arc<StructLayout>, ptr: *const u8) -> Self {
        // SAFETY: guaranteed by the caller.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, layout.size()) };
        Self::from_buf(layout, AlignedBuf::from_bytes(bytes))
    }

    pub fn layout(&self) -> &Arc<StructLayout> {
        &self.inner.layout
    }

    /// Read a field, casting it if the field has a marshalling type.
    pub fn get(&self, field: &str) -> Result<Value, ConversionError> {
        let field = self.inner.layout.lookup(field)?;
        (field.get)(&self.inner.data.borrow().buf)
    }

    /// Write a field, casting it if the field has a marshalling type.
    ///
    /// Strings, structures and references stored in pointer fields are kept
    /// alive by this instance until the field is overwritten. A pointer to
    /// the instance itself is not kept, since the storage lives as long as
    /// the instance does. Longer cycles between instances are kept alive
    /// until one of their pointer fields is overwritten.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<(), ConversionError> {
        let value = value.into();
        let layout = &self.inner.layout;
        let index = layout.index.get(field).copied().ok_or_else(|| {
            ConversionError::UnknownField {
                structure: layout.name.clone(),
                field: field.to_string(),
            }
        })?;
        let field = &layout.fields[index];

        // Encode before borrowing: the value may be this very structure.
        let (raw, keep) = (field.set)(&value)?;
        let keep = keep.filter(|k| !matches!(k, Keepalive::Struct(s) if s.ptr_eq(self)));

        let mut data = self.inner.data.borrow_mut();
        // SAFETY: the field lies within the buffer.
        unsafe { raw.write_at(data.buf.as_mut_ptr().add(field.offset)) };
        match keep {
            Some(keep) => data.keep.insert(index, keep),
            None => data.keep.remove(&index),
        };
        Ok(())
    }

    /// Copy of the raw bytes, for passing by value.
    ///
    /// Pointer fields in the copy still refer to storage kept by `self`.
    pub fn to_buf(&self) -> AlignedBuf {
        self.inner.data.borrow().buf.clone()
    }

    /// Address foreign code reads and writes.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.base as *mut u8
    }

    /// Check if both handles share the same storage.
    pub fn ptr_eq(&self, other: &Structure) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.layout().name());
        for field in self.layout().fields() {
            match self.get(field.name()) {
                Ok(value) => s.field(field.name(), &value),
                Err(_) => s.field(field.name(), &"<invalid>"),
            };
        }
        s.finish()
    }
}
