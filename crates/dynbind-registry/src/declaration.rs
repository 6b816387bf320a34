//! Declaration builders.
//!
//! Declarations describe what the host expects a foreign symbol to look like.
//! They capture type markers only; markers are resolved when the library is
//! bound (functions) or when the declaration is made (structures, callbacks).
//!
//! # Example
//!
//! ```ignore
//! let strlen = lib.declare_function(
//!     FunctionDecl::new("length")
//!         .foreign_name("strlen")
//!         .param("s", TypeMarker::Str)
//!         .returns(AbiType::U64),
//! )?;
//! ```

use std::fmt;

use bitflags::bitflags;
use dynbind_core::{CallError, ScopeOptions, TypeMarker, Value};

use crate::function::RawCall;

bitflags! {
    /// Properties of a declared function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeclFlags: u8 {
        /// The host callable is kept behind an adapter.
        const WRAPPED = 1 << 0;
        /// The first parameter is the receiver of a method.
        const METHOD = 1 << 1;
        /// The host callable receives a [`RawCall`] invoker.
        const RAW_CALL = 1 << 2;
        /// Markers were cleared after an unresolved typehint.
        const DEGRADED = 1 << 3;
    }
}

/// Host callable of a manually wrapped declaration.
pub type HostFn = Box<dyn Fn(&RawCall<'_>, &[Value]) -> Result<Value, CallError>>;

/// Host callable of a callback.
pub type CallbackFn = Box<dyn Fn(&[Value]) -> Result<Value, CallError>>;

/// How calls reach the foreign symbol.
#[derive(Default)]
pub enum CallMode {
    /// The host calls the foreign symbol directly.
    #[default]
    Direct,
    /// The adapter forwards the host's arguments to the foreign symbol.
    Auto,
    /// The host callable runs and decides when to invoke the foreign symbol.
    Manual(HostFn),
}

impl CallMode {
    pub fn name(&self) -> &'static str {
        match self {
            CallMode::Direct => "direct",
            CallMode::Auto => "wrapped auto",
            CallMode::Manual(_) => "wrapped manual",
        }
    }
}

impl fmt::Debug for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Declaration of a foreign function.
#[derive(Debug)]
pub struct FunctionDecl {
    pub(crate) host_name: String,
    pub(crate) foreign_name: Option<String>,
    pub(crate) params: Vec<(String, TypeMarker)>,
    pub(crate) returns: TypeMarker,
    pub(crate) options: ScopeOptions,
    pub(crate) mode: CallMode,
    pub(crate) owner: Option<String>,
    pub(crate) receiver: Option<TypeMarker>,
}

impl FunctionDecl {
    /// Declare a function; the foreign name defaults to `host_name`.
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            foreign_name: None,
            params: Vec::new(),
            returns: TypeMarker::Infer,
            options: ScopeOptions::default(),
            mode: CallMode::Direct,
            owner: None,
            receiver: None,
        }
    }

    /// Declare a method of `owner`.
    ///
    /// The receiver is passed as the first argument. Unless marked with
    /// [`FunctionDecl::receiver`], its type is a forward reference to `owner`.
    pub fn method(host_name: impl Into<String>, owner: impl Into<String>) -> Self {
        let mut decl = Self::new(host_name);
        decl.owner = Some(owner.into());
        decl.mode = CallMode::Auto;
        decl
    }

    /// Foreign name without the scope prefix.
    pub fn foreign_name(mut self, name: impl Into<String>) -> Self {
        self.foreign_name = Some(name.into());
        self
    }

    /// Append a parameter.
    pub fn param(mut self, name: impl Into<String>, marker: impl Into<TypeMarker>) -> Self {
        self.params.push((name.into(), marker.into()));
        self
    }

    /// Set the result marker. Unset results are C `int`.
    pub fn returns(mut self, marker: impl Into<TypeMarker>) -> Self {
        self.returns = marker.into();
        self
    }

    /// Mark the receiver of a method explicitly.
    pub fn receiver(mut self, marker: impl Into<TypeMarker>) -> Self {
        self.receiver = Some(marker.into());
        self
    }

    /// Call-level option overrides.
    pub fn options(mut self, options: ScopeOptions) -> Self {
        self.options = options;
        self
    }

    /// Keep an adapter that forwards arguments to the foreign symbol.
    pub fn wrapped(mut self) -> Self {
        if matches!(self.mode, CallMode::Direct) {
            self.mode = CallMode::Auto;
        }
        self
    }

    /// Run `f` on every call, with an invoker for the foreign symbol.
    pub fn wrap_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&RawCall<'_>, &[Value]) -> Result<Value, CallError> + 'static,
    {
        self.mode = CallMode::Manual(Box::new(f));
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Flags this declaration will be registered with.
    pub fn flags(&self) -> DeclFlags {
        let mut flags = DeclFlags::empty();
        match self.mode {
            CallMode::Direct => {}
            CallMode::Auto => flags |= DeclFlags::WRAPPED,
            CallMode::Manual(_) => flags |= DeclFlags::WRAPPED | DeclFlags::RAW_CALL,
        }
        if self.owner.is_some() {
            flags |= DeclFlags::METHOD;
        }
        flags
    }

    /// Parameters in call order, receiver first for methods.
    pub(crate) fn take_params(&mut self) -> Vec<(String, TypeMarker)> {
        let mut params = std::mem::take(&mut self.params);
        if let Some(owner) = &self.owner {
            let receiver = self
                .receiver
                .take()
                .unwrap_or_else(|| TypeMarker::Named(owner.clone()));
            params.insert(0, ("self".to_string(), receiver));
        }
        params
    }
}

// ============================================================================
// Structures
// ============================================================================

/// Declaration of a structure.
#[derive(Debug, Clone)]
pub struct StructDecl {
    pub(crate) name: String,
    pub(crate) fields: Vec<(String, TypeMarker)>,
    pub(crate) pack: Option<usize>,
    pub(crate) options: ScopeOptions,
}

impl StructDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            pack: None,
            options: ScopeOptions::default(),
        }
    }

    /// Append a field. Names starting with `_` are host-internal and skipped.
    pub fn field(mut self, name: impl Into<String>, marker: impl Into<TypeMarker>) -> Self {
        self.fields.push((name.into(), marker.into()));
        self
    }

    /// Cap field alignment (a power of two).
    pub fn pack(mut self, pack: usize) -> Self {
        self.pack = Some(pack);
        self
    }

    /// Structure-level option overrides.
    pub fn options(mut self, options: ScopeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// Declaration of a host callable exposed to foreign code as a function pointer.
pub struct CallbackDecl {
    pub(crate) name: String,
    pub(crate) params: Vec<(String, TypeMarker)>,
    pub(crate) returns: TypeMarker,
    pub(crate) options: ScopeOptions,
    pub(crate) use_errno: bool,
    pub(crate) handler: CallbackFn,
}

impl CallbackDecl {
    /// Declare a callback running `handler`. Unset results are `void`.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: TypeMarker::Void,
            options: ScopeOptions::default(),
            use_errno: false,
            handler: Box::new(handler),
        }
    }

    /// Append a parameter; callback parameters need a concrete type.
    pub fn param(mut self, name: impl Into<String>, marker: impl Into<TypeMarker>) -> Self {
        self.params.push((name.into(), marker.into()));
        self
    }

    pub fn returns(mut self, marker: impl Into<TypeMarker>) -> Self {
        self.returns = marker.into();
        self
    }

    pub fn options(mut self, options: ScopeOptions) -> Self {
        self.options = options;
        self
    }

    /// Capture the foreign `errno` on entry and restore it on return.
    pub fn use_errno(mut self) -> Self {
        self.use_errno = true;
        self
    }
}

impl fmt::Debug for CallbackDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDecl")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("use_errno", &self.use_errno)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_receiver_defaults_to_owner() {
        let mut decl = FunctionDecl::method("get", "Thing").param("n", TypeMarker::Int);
        let params = decl.take_params();
        assert_eq!(params[0], ("self".to_string(), TypeMarker::named("Thing")));
        assert_eq!(params[1].0, "n");
        assert!(decl.flags().contains(DeclFlags::METHOD | DeclFlags::WRAPPED));
    }

    #[test]
    fn explicit_receiver_wins() {
        let mut decl = FunctionDecl::method("get", "Thing").receiver(TypeMarker::Int);
        assert_eq!(decl.take_params()[0].1, TypeMarker::Int);
    }

    #[test]
    fn manual_wrap_flags() {
        let decl = FunctionDecl::new("labs").wrap_with(|raw, _| raw.invoke());
        assert_eq!(decl.flags(), DeclFlags::WRAPPED | DeclFlags::RAW_CALL);
        assert_eq!(FunctionDecl::new("abs").flags(), DeclFlags::empty());
        assert_eq!(FunctionDecl::new("abs").wrapped().flags(), DeclFlags::WRAPPED);
    }

    #[test]
    fn callback_defaults_to_void() {
        let decl = CallbackDecl::new("hook", |_| Ok(Value::Void));
        assert_eq!(decl.returns, TypeMarker::Void);
        assert!(!decl.use_errno);
    }
}
