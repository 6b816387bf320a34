//! Declared functions and foreign call dispatch.
//!
//! A [`DeclaredFunction`] holds pending type markers until a bind pass turns
//! them into a [`Signature`]. Typed signatures whose parameters are all known
//! build their call interface once, at bind time; untyped ones build it per
//! call from the argument values.
//!
//! Per-call temporaries (C strings, by-value structure copies) live in a bump
//! arena dropped when the call returns.

use std::ffi::c_void;
use std::fmt;

use bumpalo::Bump;
use libffi::middle::{Cif, CodePtr};
use libffi::raw;
use tracing::trace;

use dynbind_core::{
    AbiType, AbiValue, BindError, CallError, ConversionError, MarshalType, ResolvedOptions,
    ResolvedType, ReturnBuffer, TypeMarker, Value,
};

use crate::declaration::{CallMode, DeclFlags};
use crate::errno::SavedErrno;
use crate::resolver::Resolver;

/// Identifies a declared function within its library.
///
/// Ids carry the tag of the registry that issued them, so an id is never
/// valid in another library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId {
    pub(crate) registry: u32,
    pub(crate) index: u32,
}

impl FunctionId {
    /// Position in declaration order.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

// ============================================================================
// Signature
// ============================================================================

/// Resolved argument and result types of a bound function.
pub struct Signature {
    params: Vec<ResolvedType>,
    untyped: bool,
    result: ResolvedType,
    result_abi: AbiType,
    cif: Option<Cif>,
}

impl Signature {
    /// Validate resolved types and build the call interface if possible.
    ///
    /// On rejection returns the reason.
    pub(crate) fn new(params: Vec<ResolvedType>, result: ResolvedType) -> Result<Self, String> {
        let result_abi = match &result {
            ResolvedType::Infer => AbiType::I32,
            ResolvedType::Host(name) => {
                return Err(format!("host type '{name}' has no ABI representation"));
            }
            other => other.abi_type().unwrap_or(AbiType::Void),
        };
        check_by_value(&result_abi)?;

        let mut abi = Vec::with_capacity(params.len());
        for param in &params {
            match param {
                ResolvedType::Infer => {}
                ResolvedType::Host(name) => {
                    return Err(format!("host type '{name}' has no ABI representation"));
                }
                other => {
                    let ty = other.abi_type().unwrap_or(AbiType::Void);
                    if ty.is_void() {
                        return Err("void is not a parameter type".to_string());
                    }
                    check_by_value(&ty)?;
                    abi.push(ty);
                }
            }
        }

        let untyped = params.is_empty();
        let cif = (!untyped && abi.len() == params.len())
            .then(|| Cif::new(abi.iter().map(AbiType::ffi_type), result_abi.ffi_type()));

        Ok(Self {
            params,
            untyped,
            result,
            result_abi,
            cif,
        })
    }

    /// Resolved parameter types; empty for untyped signatures.
    pub fn params(&self) -> &[ResolvedType] {
        &self.params
    }

    /// Check if any argument list is accepted.
    pub fn is_untyped(&self) -> bool {
        self.untyped
    }

    pub fn result(&self) -> &ResolvedType {
        &self.result
    }

    /// ABI type of the result (C `int` when unconstrained).
    pub fn result_abi(&self) -> &AbiType {
        &self.result_abi
    }

    /// Check if the call interface was built at bind time.
    pub fn is_prepared(&self) -> bool {
        self.cif.is_some()
    }

    fn decode_result(&self, raw: AbiValue) -> Result<Value, ConversionError> {
        match &self.result {
            ResolvedType::Cast(cast) => cast.from_abi(raw),
            _ => Ok(self.result_abi.decode(raw)),
        }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("params", &self.params)
            .field("untyped", &self.untyped)
            .field("result", &self.result)
            .field("prepared", &self.cif.is_some())
            .finish()
    }
}

/// Reject structures whose packed layout differs from the C layout libffi assumes.
pub(crate) fn check_by_value(ty: &AbiType) -> Result<(), String> {
    match ty {
        AbiType::Struct(layout) if !layout.is_natural() => Err(format!(
            "packed structure '{}' cannot be passed by value",
            layout.name()
        )),
        _ => Ok(()),
    }
}

/// ABI type for an unconstrained argument, inferred from its value.
fn infer(value: &Value, options: &ResolvedOptions) -> Result<ResolvedType, ConversionError> {
    let resolved = match value {
        Value::Int(_) | Value::Bool(_) => ResolvedType::Raw(AbiType::I32),
        Value::UInt(_) => ResolvedType::Raw(AbiType::U32),
        Value::Float(_) => ResolvedType::Raw(AbiType::F64),
        Value::Str(_) => ResolvedType::Cast(MarshalType::string(options.string_kind())),
        Value::Null | Value::Pointer(_) | Value::Struct(_) | Value::Ref(_) => {
            ResolvedType::Raw(AbiType::Pointer)
        }
        Value::Void => {
            return Err(ConversionError::TypeMismatch {
                expected: "an argument value".to_string(),
                actual: "void",
            });
        }
    };
    Ok(resolved)
}

fn encode(
    ty: &ResolvedType,
    value: &Value,
    options: &ResolvedOptions,
    arena: &Bump,
) -> Result<(AbiType, AbiValue), ConversionError> {
    match ty {
        ResolvedType::Raw(abi) => Ok((abi.clone(), abi.encode(value, arena)?)),
        ResolvedType::Cast(cast) => Ok((cast.abi_type(), cast.to_abi(value, arena)?)),
        ResolvedType::Infer => encode(&infer(value, options)?, value, options, arena),
        // Rejected when the signature is built.
        ResolvedType::Host(name) => Err(ConversionError::TypeMismatch {
            expected: name.clone(),
            actual: value.type_name(),
        }),
    }
}

// ============================================================================
// Declared functions
// ============================================================================

/// A declared foreign function.
pub struct DeclaredFunction {
    id: FunctionId,
    host_name: String,
    foreign_name: String,
    params: Vec<(String, TypeMarker)>,
    returns: TypeMarker,
    options: ResolvedOptions,
    flags: DeclFlags,
    mode: CallMode,
    code: CodePtr,
    signature: Option<Signature>,
}

impl DeclaredFunction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: FunctionId,
        host_name: String,
        foreign_name: String,
        params: Vec<(String, TypeMarker)>,
        returns: TypeMarker,
        options: ResolvedOptions,
        flags: DeclFlags,
        mode: CallMode,
        code: CodePtr,
    ) -> Self {
        Self {
            id,
            host_name,
            foreign_name,
            params,
            returns,
            options,
            flags,
            mode,
            code,
            signature: None,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Fully-qualified foreign name, prefix included.
    pub fn foreign_name(&self) -> &str {
        &self.foreign_name
    }

    /// Pending parameter markers in declaration order.
    pub fn params(&self) -> &[(String, TypeMarker)] {
        &self.params
    }

    pub fn returns(&self) -> &TypeMarker {
        &self.returns
    }

    /// Option snapshot captured at declaration.
    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    pub fn flags(&self) -> DeclFlags {
        self.flags
    }

    pub fn mode(&self) -> &CallMode {
        &self.mode
    }

    pub fn is_bound(&self) -> bool {
        self.signature.is_some()
    }

    /// The bound signature, after a successful bind pass.
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Resolve markers and build the signature.
    pub(crate) fn bind(&mut self, resolver: &Resolver<'_>) -> Result<(), BindError> {
        let result = resolver
            .resolve(&self.returns, &self.options)
            .map_err(|unresolved| self.unresolved("return", unresolved))?;

        let params = self
            .params
            .iter()
            .map(|(name, marker)| {
                resolver
                    .resolve(marker, &self.options)
                    .map_err(|unresolved| self.unresolved(name, unresolved))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let signature = Signature::new(params.clone(), result.clone()).map_err(|reason| {
            BindError::UnsupportedType {
                function: self.host_name.clone(),
                foreign_name: self.foreign_name.clone(),
                arguments: params.iter().map(ToString::to_string).collect(),
                result: result.to_string(),
                reason,
            }
        })?;

        self.signature = Some(signature);
        Ok(())
    }

    /// Clear markers so the next bind pass binds untyped.
    pub(crate) fn degrade(&mut self) {
        self.params.clear();
        self.returns = TypeMarker::Infer;
        self.flags |= DeclFlags::DEGRADED;
    }

    fn unresolved(&self, parameter: &str, unresolved: String) -> BindError {
        BindError::TypehintUnresolved {
            function: self.host_name.clone(),
            parameter: parameter.to_string(),
            unresolved,
        }
    }

    /// Call through the declared mode.
    pub fn call(&self, args: &[Value]) -> Result<Value, CallError> {
        match &self.mode {
            CallMode::Direct | CallMode::Auto => self.call_foreign(args),
            CallMode::Manual(host) => host(&RawCall { function: self, args }, args),
        }
    }

    /// Call the foreign symbol, bypassing any host adapter.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_foreign(&self, args: &[Value]) -> Result<Value, CallError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| CallError::NotBound(self.host_name.clone()))?;

        if !signature.untyped && args.len() != signature.params.len() {
            return Err(CallError::ArgumentCount {
                function: self.host_name.clone(),
                expected: signature.params.len(),
                actual: args.len(),
            });
        }

        let arena = Bump::new();
        let mut types = Vec::with_capacity(args.len());
        let mut values = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let ty = signature.params.get(index).unwrap_or(&ResolvedType::Infer);
            let (abi, raw) = encode(ty, arg, &self.options, &arena)
                .map_err(|e| CallError::argument(&self.host_name, index, e))?;
            types.push(abi);
            values.push(raw);
        }

        let per_call;
        let cif = match &signature.cif {
            Some(cif) => cif,
            None => {
                per_call = Cif::new(
                    types.iter().map(AbiType::ffi_type),
                    signature.result_abi.ffi_type(),
                );
                &per_call
            }
        };

        let mut arg_ptrs: Vec<*mut c_void> = values.iter().map(AbiValue::as_arg_ptr).collect();
        let mut ret = ReturnBuffer::for_type(&signature.result_abi);

        trace!(
            function = %self.foreign_name,
            args = args.len(),
            "calling foreign function"
        );

        // SAFETY: the call interface matches the encoded argument types, each
        // argument pointer refers into `values` or `arena`, both alive for the
        // call, and the return buffer is sized for the result type.
        unsafe {
            raw::ffi_call(
                cif.as_raw_ptr(),
                Some(*self.code.as_fun()),
                ret.as_mut_ptr(),
                arg_ptrs.as_mut_ptr(),
            );
        }
        let errno = SavedErrno::capture();

        let result = signature
            .decode_result(signature.result_abi.read_return(&ret))
            .map_err(CallError::from);

        drop(arg_ptrs);
        drop(values);
        drop(arena);
        errno.restore();
        result
    }
}

impl fmt::Debug for DeclaredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclaredFunction")
            .field("id", &self.id)
            .field("host_name", &self.host_name)
            .field("foreign_name", &self.foreign_name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("flags", &self.flags)
            .field("mode", &self.mode)
            .field("signature", &self.signature)
            .finish()
    }
}

// ============================================================================
// Raw call invoker
// ============================================================================

/// Invoker handed to manually wrapped host callables.
pub struct RawCall<'a> {
    function: &'a DeclaredFunction,
    args: &'a [Value],
}

impl RawCall<'_> {
    /// Call the foreign symbol with the adapter's own arguments.
    pub fn invoke(&self) -> Result<Value, CallError> {
        self.function.call_foreign(self.args)
    }

    /// Call the foreign symbol with replaced arguments.
    pub fn call(&self, args: &[Value]) -> Result<Value, CallError> {
        self.function.call_foreign(args)
    }

    /// Arguments the adapter was called with.
    pub fn args(&self) -> &[Value] {
        self.args
    }

    pub fn foreign_name(&self) -> &str {
        &self.function.foreign_name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dynbind_core::{StructLayout, StringKind};

    use super::*;

    #[test]
    fn unconstrained_result_is_c_int() {
        let sig = Signature::new(vec![], ResolvedType::Infer).unwrap();
        assert_eq!(sig.result_abi(), &AbiType::I32);
        assert!(sig.is_untyped());
        assert!(!sig.is_prepared());
    }

    #[test]
    fn typed_signature_is_prepared_at_bind() {
        let sig = Signature::new(
            vec![ResolvedType::Raw(AbiType::F64)],
            ResolvedType::Raw(AbiType::F64),
        )
        .unwrap();
        assert!(sig.is_prepared());

        let partly = Signature::new(
            vec![ResolvedType::Raw(AbiType::I32), ResolvedType::Infer],
            ResolvedType::Raw(AbiType::Void),
        )
        .unwrap();
        assert!(!partly.is_prepared());
        assert!(!partly.is_untyped());
    }

    #[test]
    fn host_and_void_params_are_rejected() {
        let err = Signature::new(
            vec![ResolvedType::Host("Widget".into())],
            ResolvedType::Infer,
        )
        .unwrap_err();
        assert!(err.contains("Widget"));

        assert!(
            Signature::new(vec![ResolvedType::Raw(AbiType::Void)], ResolvedType::Infer).is_err()
        );
    }

    #[test]
    fn packed_structures_are_not_passed_by_value() {
        let layout: Arc<StructLayout> = StructLayout::builder("P")
            .pack(1)
            .field("a", ResolvedType::Raw(AbiType::U8))
            .field("b", ResolvedType::Raw(AbiType::U32))
            .build()
            .unwrap();
        let err = Signature::new(
            vec![ResolvedType::Raw(AbiType::Struct(layout))],
            ResolvedType::Infer,
        )
        .unwrap_err();
        assert!(err.contains("packed structure 'P'"));
    }

    #[test]
    fn structures_holding_packed_structures_are_not_passed_by_value() {
        let inner = StructLayout::builder("Inner")
            .pack(1)
            .field("x", ResolvedType::Raw(AbiType::U8))
            .field("y", ResolvedType::Raw(AbiType::U32))
            .build()
            .unwrap();
        let outer = StructLayout::builder("Outer")
            .field("inner", ResolvedType::Raw(AbiType::Struct(Arc::clone(&inner))))
            .field("z", ResolvedType::Raw(AbiType::U8))
            .build()
            .unwrap();

        let err = Signature::new(
            vec![ResolvedType::Raw(AbiType::Struct(Arc::clone(&outer)))],
            ResolvedType::Raw(AbiType::Void),
        )
        .unwrap_err();
        assert!(err.contains("packed structure 'Outer'"));
        assert!(Signature::new(vec![], ResolvedType::Raw(AbiType::Struct(outer))).is_err());

        // Behind a pointer the layout is fine.
        assert!(
            Signature::new(
                vec![ResolvedType::Cast(MarshalType::StructPointer {
                    name: "Outer".into()
                })],
                ResolvedType::Raw(AbiType::Void),
            )
            .is_ok()
        );
    }

    #[test]
    fn inference_from_values() {
        let opts = ResolvedOptions::default();
        assert_eq!(
            infer(&Value::Int(1), &opts).unwrap(),
            ResolvedType::Raw(AbiType::I32)
        );
        assert_eq!(
            infer(&Value::Float(1.0), &opts).unwrap(),
            ResolvedType::Raw(AbiType::F64)
        );
        assert_eq!(
            infer(&Value::Null, &opts).unwrap(),
            ResolvedType::Raw(AbiType::Pointer)
        );
        let wide = ResolvedOptions {
            string_kind: Some(StringKind::Wide),
            ..ResolvedOptions::default()
        };
        assert_eq!(
            infer(&Value::from("x"), &wide).unwrap(),
            ResolvedType::Cast(MarshalType::WideString)
        );
        assert!(infer(&Value::Void, &opts).is_err());
    }
}
