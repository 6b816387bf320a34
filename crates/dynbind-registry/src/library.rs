//! Library - a loaded foreign module and everything declared against it.
//!
//! A [`Library`] owns the foreign handle, the scope stack and the declaration
//! registry. Declarations flow through the current scope:
//!
//! ```no_run
//! use dynbind_core::{IntWidth, ScopeOptions, TypeMarker, Value};
//! use dynbind_registry::{FunctionDecl, Library};
//!
//! # fn main() -> Result<(), dynbind_core::DynbindError> {
//! let mut lib = Library::new("libc.so.6", ScopeOptions::new())?;
//!
//! let abs = lib.declare_function(
//!     FunctionDecl::new("abs")
//!         .param("n", TypeMarker::Int)
//!         .returns(TypeMarker::Int)
//!         .options(ScopeOptions::new().with_int_width(IntWidth::W32)),
//! )?;
//! lib.bind()?;
//!
//! assert_eq!(lib.call(abs, &[Value::Int(-3)])?, Value::Int(3));
//! # Ok(())
//! # }
//! ```

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use libffi::middle::CodePtr;
use tracing::debug;

use dynbind_core::{
    BindError, CallError, MarshalType, ResolvedOptions, ResolvedType, ScopeOptions, ScopeStack,
    StructLayout, TypeMarker, Value,
};

use crate::callback::Callback;
use crate::declaration::{CallbackDecl, FunctionDecl, StructDecl};
use crate::function::{DeclaredFunction, FunctionId};
use crate::registry::DeclarationRegistry;
use crate::resolver::{Resolver, TypeEnv};

/// A foreign module with its declarations.
pub struct Library {
    name: String,
    handle: Option<libloading::Library>,
    path: Option<String>,
    scopes: ScopeStack,
    registry: DeclarationRegistry,
}

impl Library {
    /// Create a library and load it immediately.
    pub fn new(name: impl Into<String>, defaults: ScopeOptions) -> Result<Self, BindError> {
        let mut library = Self::unloaded(name, defaults);
        library.load()?;
        Ok(library)
    }

    /// Create a library without loading it; call [`Library::load`] before
    /// declaring functions.
    pub fn unloaded(name: impl Into<String>, defaults: ScopeOptions) -> Self {
        Self {
            name: name.into(),
            handle: None,
            path: None,
            scopes: ScopeStack::new(defaults),
            registry: DeclarationRegistry::new(),
        }
    }

    // ==========================================================================
    // Loading
    // ==========================================================================

    /// Resolve and open the library. Loading twice is a no-op.
    ///
    /// An existing filesystem path is opened as is; otherwise the bare name
    /// and then the platform file name go through the loader search.
    pub fn load(&mut self) -> Result<(), BindError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let mut reasons = Vec::new();
        for candidate in self.candidates() {
            // SAFETY: running the library's initializers is inherent to
            // loading it.
            match unsafe { libloading::Library::new(&candidate) } {
                Ok(handle) => {
                    debug!(library = %self.name, path = %candidate, "loaded library");
                    self.handle = Some(handle);
                    self.path = Some(candidate);
                    return Ok(());
                }
                Err(err) => reasons.push(format!("{candidate}: {err}")),
            }
        }

        Err(BindError::LibraryNotFound {
            name: self.name.clone(),
            reason: reasons.join("; "),
        })
    }

    fn candidates(&self) -> Vec<String> {
        let path = Path::new(&self.name);
        if path.exists() {
            // The loader only searches the working directory for names
            // containing a separator.
            let literal = path
                .canonicalize()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| self.name.clone());
            return vec![literal];
        }

        let platform = platform_file_name(&self.name);
        if platform == self.name {
            vec![self.name.clone()]
        } else {
            vec![self.name.clone(), platform]
        }
    }

    fn symbol(&self, foreign_name: &str) -> Result<CodePtr, BindError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| BindError::NotLoaded(self.name.clone()))?;

        // SAFETY: the symbol is only called through a call interface built
        // from its declared signature.
        let symbol = unsafe { handle.get::<unsafe extern "C" fn()>(foreign_name.as_bytes()) }
            .map_err(|_| BindError::SymbolNotFound {
                symbol: foreign_name.to_string(),
                library: self.name.clone(),
            })?;

        Ok(CodePtr::from_fun(*symbol))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the library was opened from.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    // ==========================================================================
    // Scopes
    // ==========================================================================

    /// Enter a scope; declarations made through the guard see its options.
    pub fn scope(&mut self, options: ScopeOptions) -> ScopeGuard<'_> {
        self.scopes.push(options);
        ScopeGuard { library: self }
    }

    /// Run `f` inside a scope.
    pub fn with_scope<R>(&mut self, options: ScopeOptions, f: impl FnOnce(&mut Library) -> R) -> R {
        let mut guard = self.scope(options);
        f(&mut guard)
    }

    /// Current flattened options.
    pub fn options(&self) -> ResolvedOptions {
        self.scopes.flatten()
    }

    /// Number of scope frames, library defaults included.
    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    // ==========================================================================
    // Declarations
    // ==========================================================================

    /// Register a named type for forward references.
    pub fn register_type(
        &mut self,
        name: impl Into<String>,
        marker: impl Into<TypeMarker>,
    ) -> Result<(), BindError> {
        self.registry.register_type(name, marker)
    }

    /// Declare a foreign function under the current scope.
    pub fn declare_function(&mut self, mut decl: FunctionDecl) -> Result<FunctionId, BindError> {
        let options = self.scopes.flatten_with(&decl.options);
        let base = decl.foreign_name.as_deref().unwrap_or(&decl.host_name);
        let foreign_name = format!("{}{}", options.prefix, base);

        if self.registry.contains(&foreign_name) {
            return Err(BindError::FunctionRedeclared(foreign_name));
        }
        let code = self.symbol(&foreign_name)?;

        let flags = decl.flags();
        let params = decl.take_params();
        let FunctionDecl {
            host_name,
            returns,
            mode,
            ..
        } = decl;

        debug!(
            foreign = %foreign_name,
            host = %host_name,
            mode = mode.name(),
            params = params.len(),
            "declared function"
        );

        let function = DeclaredFunction::new(
            self.registry.next_id(),
            host_name,
            foreign_name,
            params,
            returns,
            options,
            flags,
            mode,
            code,
        );
        self.registry.register_function(function)
    }

    /// Declare a structure and register it as a named type.
    pub fn declare_structure(&mut self, decl: StructDecl) -> Result<Arc<StructLayout>, BindError> {
        if self.registry.lookup_type(&decl.name).is_some() {
            return Err(BindError::InvalidDeclaration(format!(
                "type '{}' is already registered",
                decl.name
            )));
        }

        let options = self.scopes.flatten_with(&decl.options);
        let env = TypeEnv::new();
        let resolver = Resolver::new(&env, self.registry.types());

        let mut builder = StructLayout::builder(decl.name.as_str());
        if let Some(pack) = decl.pack {
            builder = builder.pack(pack);
        }

        for (field, marker) in decl.fields.iter().filter(|(f, _)| !f.starts_with('_')) {
            let ty = if marker.as_named() == Some(decl.name.as_str()) {
                ResolvedType::Cast(MarshalType::StructPointer {
                    name: decl.name.clone(),
                })
            } else {
                resolver.resolve(marker, &options).map_err(|unresolved| {
                    BindError::TypehintUnresolved {
                        function: decl.name.clone(),
                        parameter: field.clone(),
                        unresolved,
                    }
                })?
            };
            builder = builder.field(field.as_str(), ty);
        }

        let layout = builder.build()?;
        debug!(
            structure = %decl.name,
            size = layout.size(),
            align = layout.align(),
            fields = layout.fields().len(),
            "declared structure"
        );

        self.registry
            .register_type(decl.name, MarshalType::Struct(Arc::clone(&layout)))?;
        Ok(layout)
    }

    /// Build a callback under the current scope.
    pub fn callback(&self, decl: CallbackDecl) -> Result<Callback, BindError> {
        let options = self.scopes.flatten_with(&decl.options);
        let env = TypeEnv::new();
        let resolver = Resolver::new(&env, self.registry.types());
        Callback::new(decl, &resolver, &options)
    }

    /// Layout of a declared structure.
    pub fn structure(&self, name: &str) -> Option<Arc<StructLayout>> {
        match self.registry.lookup_type(name) {
            Some(TypeMarker::Marshal(MarshalType::Struct(layout))) => Some(Arc::clone(layout)),
            _ => None,
        }
    }

    // ==========================================================================
    // Binding
    // ==========================================================================

    /// Bind pending declarations against the library's named types.
    pub fn bind(&mut self) -> Result<(), BindError> {
        self.bind_with(&TypeEnv::new())
    }

    /// Bind pending declarations, searching `env` before the library's types.
    pub fn bind_with(&mut self, env: &TypeEnv) -> Result<(), BindError> {
        debug!(
            library = %self.name,
            pending = self.registry.pending(),
            "bind pass started"
        );
        let bound = self.registry.bind(env)?;
        debug!(library = %self.name, bound, "bind pass finished");
        Ok(())
    }

    // ==========================================================================
    // Calls
    // ==========================================================================

    pub fn call(&self, id: FunctionId, args: &[Value]) -> Result<Value, CallError> {
        self.function(id)
            .ok_or_else(|| CallError::UnknownFunction(id.to_string()))?
            .call(args)
    }

    /// Call a method declaration with `receiver` as the first argument.
    pub fn call_method(
        &self,
        id: FunctionId,
        receiver: impl Into<Value>,
        args: &[Value],
    ) -> Result<Value, CallError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver.into());
        full.extend_from_slice(args);
        self.call(id, &full)
    }

    /// Call a function by fully-qualified foreign name.
    pub fn invoke(&self, foreign_name: &str, args: &[Value]) -> Result<Value, CallError> {
        self.registry
            .by_foreign(foreign_name)
            .ok_or_else(|| CallError::UnknownFunction(foreign_name.to_string()))?
            .call(args)
    }

    /// Id of a function by fully-qualified foreign name.
    pub fn lookup(&self, foreign_name: &str) -> Option<FunctionId> {
        self.registry.by_foreign(foreign_name).map(DeclaredFunction::id)
    }

    pub fn function(&self, id: FunctionId) -> Option<&DeclaredFunction> {
        self.registry.get(id)
    }

    pub fn functions(&self) -> impl Iterator<Item = &DeclaredFunction> {
        self.registry.functions()
    }

    pub fn registry(&self) -> &DeclarationRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("scopes", &self.scopes)
            .field("functions", &self.registry.len())
            .finish()
    }
}

/// Platform file name of a library.
pub fn platform_file_name(name: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        format!("{name}.dll")
    }
    #[cfg(target_os = "macos")]
    {
        format!("lib{name}.dylib")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        format!("lib{name}.so")
    }
}

/// Scope on a [`Library`]; pops its frame when dropped.
pub struct ScopeGuard<'a> {
    library: &'a mut Library,
}

impl Deref for ScopeGuard<'_> {
    type Target = Library;

    fn deref(&self) -> &Library {
        self.library
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Library {
        self.library
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.library.scopes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_names() {
        let name = platform_file_name("test");
        #[cfg(target_os = "windows")]
        assert_eq!(name, "test.dll");
        #[cfg(target_os = "macos")]
        assert_eq!(name, "libtest.dylib");
        #[cfg(target_os = "linux")]
        assert_eq!(name, "libtest.so");
    }

    #[test]
    fn missing_library_lists_attempts() {
        let err = Library::new("dynbind-no-such-library", ScopeOptions::new()).unwrap_err();
        match err {
            BindError::LibraryNotFound { name, reason } => {
                assert_eq!(name, "dynbind-no-such-library");
                assert!(reason.contains(&platform_file_name("dynbind-no-such-library")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn declaring_before_load_fails() {
        let mut lib = Library::unloaded("m", ScopeOptions::new());
        assert!(matches!(
            lib.declare_function(FunctionDecl::new("cos")),
            Err(BindError::NotLoaded(_))
        ));
    }

    #[test]
    fn scopes_nest_and_release() {
        let mut lib = Library::unloaded("m", ScopeOptions::new().with_prefix("lib_"));
        {
            let mut outer = lib.scope(ScopeOptions::new().with_prefix("b_"));
            let inner = outer.scope(ScopeOptions::new().with_prefix("a_"));
            assert_eq!(inner.options().prefix, "lib_b_a_");
            assert_eq!(inner.scope_depth(), 3);
        }
        assert_eq!(lib.scope_depth(), 1);

        let depth = lib.with_scope(ScopeOptions::new(), |lib| lib.scope_depth());
        assert_eq!(depth, 2);
        assert_eq!(lib.scope_depth(), 1);
    }

    #[test]
    fn structures_register_as_types() {
        use dynbind_core::AbiType;

        let mut lib = Library::unloaded("m", ScopeOptions::new());
        let layout = lib
            .declare_structure(
                StructDecl::new("Node")
                    .field("value", AbiType::I32)
                    .field("_cache", TypeMarker::host("Cache"))
                    .field("next", TypeMarker::named("Node")),
            )
            .unwrap();

        assert_eq!(layout.fields().len(), 2);
        assert!(matches!(
            layout.field("next").unwrap().ty(),
            ResolvedType::Cast(MarshalType::StructPointer { name }) if name == "Node"
        ));
        assert!(lib.structure("Node").unwrap().same_as(&layout));

        assert!(matches!(
            lib.declare_structure(StructDecl::new("Node").field("x", AbiType::I32)),
            Err(BindError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn structure_field_unresolved() {
        let mut lib = Library::unloaded("m", ScopeOptions::new());
        let err = lib
            .declare_structure(StructDecl::new("S").field("x", TypeMarker::named("Missing")))
            .unwrap_err();
        assert!(matches!(
            err,
            BindError::TypehintUnresolved { ref parameter, ref unresolved, .. }
                if parameter == "x" && unresolved == "Missing"
        ));
    }
}
