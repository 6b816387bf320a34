//! DeclarationRegistry - declared functions and named types of one library.
//!
//! Functions are stored in declaration order and addressed by [`FunctionId`];
//! a secondary index maps fully-qualified foreign names to ids and enforces
//! their uniqueness. Named types (registered aliases and declared structures)
//! form the outermost frame of forward-reference search.
//!
//! # Thread Safety
//!
//! `DeclarationRegistry` is **not thread-safe**. Declaration and binding run
//! to completion on one thread during initialization; afterwards the registry
//! is only read. Bound call interfaces hold raw pointers, so the registry is
//! neither `Send` nor `Sync`.

use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use tracing::warn;

use dynbind_core::{BindError, TypeMarker};

use crate::function::{DeclaredFunction, FunctionId};
use crate::resolver::{Resolver, TypeEnv};

static NEXT_TAG: AtomicU32 = AtomicU32::new(0);

/// Declared functions and named types of one library.
#[derive(Debug)]
pub struct DeclarationRegistry {
    /// Stamped into every issued [`FunctionId`].
    tag: u32,

    /// Functions in declaration order, indexed by [`FunctionId`].
    functions: Vec<DeclaredFunction>,

    /// Fully-qualified foreign name -> id.
    by_foreign: FxHashMap<String, FunctionId>,

    /// Library-level named types.
    types: FxHashMap<String, TypeMarker>,
}

impl Default for DeclarationRegistry {
    fn default() -> Self {
        Self {
            tag: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            functions: Vec::new(),
            by_foreign: FxHashMap::default(),
            types: FxHashMap::default(),
        }
    }
}

impl DeclarationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next registered function will receive.
    pub(crate) fn next_id(&self) -> FunctionId {
        FunctionId {
            registry: self.tag,
            index: self.functions.len() as u32,
        }
    }

    /// Register a declared function under its foreign name.
    pub(crate) fn register_function(
        &mut self,
        function: DeclaredFunction,
    ) -> Result<FunctionId, BindError> {
        if self.by_foreign.contains_key(function.foreign_name()) {
            return Err(BindError::FunctionRedeclared(
                function.foreign_name().to_string(),
            ));
        }
        let id = function.id();
        debug_assert_eq!(id, self.next_id());
        self.by_foreign.insert(function.foreign_name().to_string(), id);
        self.functions.push(function);
        Ok(id)
    }

    /// Look up a function; ids issued by another registry find nothing.
    pub fn get(&self, id: FunctionId) -> Option<&DeclaredFunction> {
        if id.registry != self.tag {
            return None;
        }
        self.functions.get(id.index())
    }

    /// Find a function by fully-qualified foreign name.
    pub fn by_foreign(&self, foreign_name: &str) -> Option<&DeclaredFunction> {
        self.by_foreign
            .get(foreign_name)
            .and_then(|id| self.get(*id))
    }

    /// Check if a foreign name is taken.
    pub fn contains(&self, foreign_name: &str) -> bool {
        self.by_foreign.contains_key(foreign_name)
    }

    /// All functions in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = &DeclaredFunction> {
        self.functions.iter()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Register a named type.
    pub fn register_type(
        &mut self,
        name: impl Into<String>,
        marker: impl Into<TypeMarker>,
    ) -> Result<(), BindError> {
        let name = name.into();
        if self.types.contains_key(&name) {
            return Err(BindError::InvalidDeclaration(format!(
                "type '{name}' is already registered"
            )));
        }
        self.types.insert(name, marker.into());
        Ok(())
    }

    pub fn lookup_type(&self, name: &str) -> Option<&TypeMarker> {
        self.types.get(name)
    }

    pub fn types(&self) -> &FxHashMap<String, TypeMarker> {
        &self.types
    }

    /// Number of functions not yet bound.
    pub fn pending(&self) -> usize {
        self.functions.iter().filter(|f| !f.is_bound()).count()
    }

    /// Bind every unbound function, in declaration order.
    ///
    /// Stops at the first failure. A function failing with an unresolved
    /// typehint has its markers cleared first, so the next pass binds it
    /// untyped.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn bind(&mut self, env: &TypeEnv) -> Result<usize, BindError> {
        let resolver = Resolver::new(env, &self.types);
        let mut bound = 0;

        for function in self.functions.iter_mut().filter(|f| !f.is_bound()) {
            if let Err(err) = function.bind(&resolver) {
                if err.is_degradable() {
                    warn!(
                        function = function.host_name(),
                        foreign = function.foreign_name(),
                        error = %err,
                        "clearing typehints; declaration will bind untyped"
                    );
                    function.degrade();
                }
                return Err(err);
            }
            bound += 1;
        }

        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use dynbind_core::{AbiType, ResolvedOptions, ResolvedType};
    use libffi::middle::CodePtr;

    use super::*;
    use crate::declaration::{CallMode, DeclFlags};

    unsafe extern "C" fn noop() {}

    fn function(
        registry: &DeclarationRegistry,
        name: &str,
        params: Vec<(String, TypeMarker)>,
    ) -> DeclaredFunction {
        DeclaredFunction::new(
            registry.next_id(),
            name.to_string(),
            name.to_string(),
            params,
            TypeMarker::Void,
            ResolvedOptions::default(),
            DeclFlags::empty(),
            CallMode::Direct,
            CodePtr::from_fun(noop),
        )
    }

    #[test]
    fn redeclaration_fails_on_second() {
        let mut registry = DeclarationRegistry::new();
        let first = function(&registry, "abs", vec![]);
        assert!(registry.register_function(first).is_ok());

        let second = function(&registry, "abs", vec![]);
        let err = registry.register_function(second).unwrap_err();
        assert!(matches!(err, BindError::FunctionRedeclared(ref n) if n == "abs"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ids_are_scoped_to_their_registry() {
        let mut first = DeclarationRegistry::new();
        let mut second = DeclarationRegistry::new();
        let abs = function(&first, "abs", vec![]);
        let abs = first.register_function(abs).unwrap();
        let labs = function(&second, "labs", vec![]);
        let labs = second.register_function(labs).unwrap();

        assert_eq!(abs.index(), labs.index());
        assert_eq!(first.get(abs).map(|f| f.foreign_name()), Some("abs"));
        assert!(first.get(labs).is_none());
        assert!(second.get(abs).is_none());
    }

    #[test]
    fn duplicate_type_is_invalid() {
        let mut registry = DeclarationRegistry::new();
        registry.register_type("Handle", AbiType::Pointer).unwrap();
        assert!(matches!(
            registry.register_type("Handle", AbiType::U64),
            Err(BindError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn bind_resolves_registered_types() {
        let mut registry = DeclarationRegistry::new();
        registry.register_type("Size", AbiType::U64).unwrap();
        let f = function(
            &registry,
            "takes_size",
            vec![("n".to_string(), TypeMarker::named("Size"))],
        );
        let id = registry.register_function(f).unwrap();

        assert_eq!(registry.bind(&TypeEnv::new()).unwrap(), 1);
        let sig = registry.get(id).unwrap().signature().unwrap();
        assert_eq!(sig.params(), &[ResolvedType::Raw(AbiType::U64)]);
        assert!(sig.is_prepared());

        // Already-bound functions are left alone.
        assert_eq!(registry.bind(&TypeEnv::new()).unwrap(), 0);
    }

    #[test]
    fn unresolved_typehint_degrades_then_binds() {
        let mut registry = DeclarationRegistry::new();
        let f = function(
            &registry,
            "buggy",
            vec![("x".to_string(), TypeMarker::named("SomeDummyType"))],
        );
        let id = registry.register_function(f).unwrap();

        let err = registry.bind(&TypeEnv::new()).unwrap_err();
        assert!(err.to_string().contains("SomeDummyType"));
        assert!(registry.get(id).unwrap().flags().contains(DeclFlags::DEGRADED));

        registry.bind(&TypeEnv::new()).unwrap();
        assert!(registry.get(id).unwrap().signature().unwrap().is_untyped());
    }

    #[test]
    fn unsupported_type_stays_unbound() {
        let mut registry = DeclarationRegistry::new();
        let f = function(
            &registry,
            "buggy",
            vec![("w".to_string(), TypeMarker::host("Widget"))],
        );
        registry.register_function(f).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                registry.bind(&TypeEnv::new()),
                Err(BindError::UnsupportedType { .. })
            ));
        }
        assert_eq!(registry.pending(), 1);
    }
}
