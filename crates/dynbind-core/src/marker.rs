//! Type markers: what a declaration states about a parameter, result or field.
//!
//! Markers are resolved in two steps. Host primitives resolve against the
//! declaration's option snapshot here, in [`TypeMarker::resolve_primitive`].
//! Forward references ([`TypeMarker::Named`]) need a type environment and
//! are resolved by the registry during bind.

use std::fmt;

use crate::abi::AbiType;
use crate::marshal::MarshalType;
use crate::scope::ResolvedOptions;

/// A declared type constraint.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TypeMarker {
    /// No constraint; the ABI type is inferred from the value at call time.
    #[default]
    Infer,
    /// Forward reference to a type registered by name.
    Named(String),
    /// Host boolean.
    Bool,
    /// Host float.
    Float,
    /// Host string.
    Str,
    /// Host integer.
    Int,
    /// No value.
    Void,
    /// Explicit marshalling type.
    Marshal(MarshalType),
    /// Explicit raw ABI type.
    Abi(AbiType),
    /// Host-only type with no ABI representation.
    Host(String),
}

impl TypeMarker {
    /// Shorthand for a forward reference.
    pub fn named(name: impl Into<String>) -> Self {
        TypeMarker::Named(name.into())
    }

    /// Shorthand for a host-only type.
    pub fn host(name: impl Into<String>) -> Self {
        TypeMarker::Host(name.into())
    }

    /// Check if the marker places no constraint.
    pub fn is_infer(&self) -> bool {
        matches!(self, TypeMarker::Infer)
    }

    /// The forward-referenced name, if this is one.
    pub fn as_named(&self) -> Option<&str> {
        match self {
            TypeMarker::Named(name) => Some(name),
            _ => None,
        }
    }

    /// Resolve every marker except forward references.
    ///
    /// Returns `None` for [`TypeMarker::Named`].
    pub fn resolve_primitive(&self, options: &ResolvedOptions) -> Option<ResolvedType> {
        let resolved = match self {
            TypeMarker::Named(_) => return None,
            TypeMarker::Infer => ResolvedType::Infer,
            TypeMarker::Bool => ResolvedType::Raw(AbiType::Bool),
            TypeMarker::Float => ResolvedType::Raw(AbiType::F32),
            TypeMarker::Str => ResolvedType::Cast(MarshalType::string(options.string_kind())),
            TypeMarker::Int => {
                ResolvedType::Raw(AbiType::int(options.int_width(), options.is_signed()))
            }
            TypeMarker::Void => ResolvedType::Raw(AbiType::Void),
            TypeMarker::Marshal(m) => ResolvedType::Cast(m.clone()),
            TypeMarker::Abi(a) => ResolvedType::Raw(a.clone()),
            TypeMarker::Host(name) => ResolvedType::Host(name.clone()),
        };
        Some(resolved)
    }
}

impl fmt::Display for TypeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeMarker::Infer => f.write_str("_"),
            TypeMarker::Named(name) | TypeMarker::Host(name) => f.write_str(name),
            TypeMarker::Bool => f.write_str("bool"),
            TypeMarker::Float => f.write_str("float"),
            TypeMarker::Str => f.write_str("str"),
            TypeMarker::Int => f.write_str("int"),
            TypeMarker::Void => f.write_str("void"),
            TypeMarker::Marshal(m) => write!(f, "{m}"),
            TypeMarker::Abi(a) => write!(f, "{a}"),
        }
    }
}

impl From<AbiType> for TypeMarker {
    fn from(ty: AbiType) -> Self {
        TypeMarker::Abi(ty)
    }
}

impl From<MarshalType> for TypeMarker {
    fn from(ty: MarshalType) -> Self {
        TypeMarker::Marshal(ty)
    }
}

/// A fully resolved marker.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedType {
    /// Inferred from the host value at call time.
    Infer,
    /// Plain ABI mapping.
    Raw(AbiType),
    /// ABI mapping through a marshalling type.
    Cast(MarshalType),
    /// Host-only type; rejected when the call interface is built.
    Host(String),
}

impl ResolvedType {
    /// The ABI type, if the resolved type has one.
    pub fn abi_type(&self) -> Option<AbiType> {
        match self {
            ResolvedType::Raw(a) => Some(a.clone()),
            ResolvedType::Cast(m) => Some(m.abi_type()),
            ResolvedType::Infer | ResolvedType::Host(_) => None,
        }
    }

    /// The marshalling type, if one applies.
    pub fn cast(&self) -> Option<&MarshalType> {
        match self {
            ResolvedType::Cast(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_infer(&self) -> bool {
        matches!(self, ResolvedType::Infer)
    }
}

impl fmt::Display for ResolvedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedType::Infer => f.write_str("_"),
            ResolvedType::Raw(a) => write!(f, "{a}"),
            ResolvedType::Cast(m) => write!(f, "{m}"),
            ResolvedType::Host(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{IntWidth, ScopeOptions, ScopeStack};

    fn options(frame: ScopeOptions) -> ResolvedOptions {
        ScopeStack::new(frame).flatten()
    }

    #[test]
    fn int_width_8_explicit_unsigned() {
        let opts = options(
            ScopeOptions::new()
                .with_int_width(IntWidth::W8)
                .with_int_sign(false),
        );
        assert_eq!(
            TypeMarker::Int.resolve_primitive(&opts),
            Some(ResolvedType::Raw(AbiType::U8))
        );
    }

    #[test]
    fn int_width_8_unset_sign_is_signed() {
        let opts = options(ScopeOptions::new().with_int_width(IntWidth::W8));
        assert_eq!(
            TypeMarker::Int.resolve_primitive(&opts),
            Some(ResolvedType::Raw(AbiType::I8))
        );
    }

    #[test]
    fn default_int_is_signed_64() {
        assert_eq!(
            TypeMarker::Int.resolve_primitive(&ResolvedOptions::default()),
            Some(ResolvedType::Raw(AbiType::I64))
        );
    }

    #[test]
    fn str_follows_string_kind() {
        let wide = options(ScopeOptions::new().with_wide_strings());
        assert_eq!(
            TypeMarker::Str.resolve_primitive(&wide),
            Some(ResolvedType::Cast(MarshalType::WideString))
        );
        assert_eq!(
            TypeMarker::Str.resolve_primitive(&ResolvedOptions::default()),
            Some(ResolvedType::Cast(MarshalType::ByteString))
        );
    }

    #[test]
    fn float_is_single_precision() {
        assert_eq!(
            TypeMarker::Float
                .resolve_primitive(&ResolvedOptions::default())
                .and_then(|r| r.abi_type()),
            Some(AbiType::F32)
        );
    }

    #[test]
    fn named_is_left_for_the_resolver() {
        assert_eq!(
            TypeMarker::named("Foo").resolve_primitive(&ResolvedOptions::default()),
            None
        );
    }

    #[test]
    fn host_types_have_no_abi() {
        let resolved = TypeMarker::host("Widget")
            .resolve_primitive(&ResolvedOptions::default())
            .unwrap();
        assert_eq!(resolved.abi_type(), None);
        assert_eq!(resolved.to_string(), "Widget");
    }
}
