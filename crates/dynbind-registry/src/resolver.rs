//! Deferred type resolution.
//!
//! Forward references ([`TypeMarker::Named`]) are looked up in an explicit
//! [`TypeEnv`] first, innermost frame outward, and then in the types the
//! library registered. A found target is resolved again, so alias chains are
//! followed; a chain that loops is reported as unresolved.

use rustc_hash::{FxHashMap, FxHashSet};

use dynbind_core::{ResolvedOptions, ResolvedType, TypeMarker};

/// Name → type environment handed to [`crate::Library::bind_with`].
///
/// # Example
///
/// ```
/// use dynbind_core::{AbiType, TypeMarker};
/// use dynbind_registry::TypeEnv;
///
/// let env = TypeEnv::new()
///     .with("Handle", TypeMarker::Abi(AbiType::Pointer))
///     .frame()
///     .with("Handle", TypeMarker::Int);
///
/// // Inner frames shadow outer ones.
/// assert_eq!(env.lookup("Handle"), Some(&TypeMarker::Int));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    frames: Vec<FxHashMap<String, TypeMarker>>,
}

impl TypeEnv {
    /// Create an environment with one empty frame.
    pub fn new() -> Self {
        Self {
            frames: vec![FxHashMap::default()],
        }
    }

    /// Open a new innermost frame.
    pub fn frame(mut self) -> Self {
        self.push_frame();
        self
    }

    /// Define a name in the innermost frame.
    pub fn with(mut self, name: impl Into<String>, marker: impl Into<TypeMarker>) -> Self {
        self.define(name, marker);
        self
    }

    pub fn push_frame(&mut self) {
        self.frames.push(FxHashMap::default());
    }

    /// Drop the innermost frame.
    pub fn pop_frame(&mut self) -> Option<FxHashMap<String, TypeMarker>> {
        self.frames.pop()
    }

    /// Define a name in the innermost frame, opening one if needed.
    pub fn define(&mut self, name: impl Into<String>, marker: impl Into<TypeMarker>) {
        if self.frames.is_empty() {
            self.push_frame();
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), marker.into());
        }
    }

    /// Find a name, innermost frame first.
    pub fn lookup(&self, name: &str) -> Option<&TypeMarker> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Resolves markers against an environment and the library's named types.
pub(crate) struct Resolver<'a> {
    env: &'a TypeEnv,
    types: &'a FxHashMap<String, TypeMarker>,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(env: &'a TypeEnv, types: &'a FxHashMap<String, TypeMarker>) -> Self {
        Self { env, types }
    }

    fn lookup(&self, name: &str) -> Option<&'a TypeMarker> {
        self.env.lookup(name).or_else(|| self.types.get(name))
    }

    /// Resolve one marker under `options`.
    ///
    /// On failure returns the name that could not be resolved.
    pub(crate) fn resolve(
        &self,
        marker: &TypeMarker,
        options: &ResolvedOptions,
    ) -> Result<ResolvedType, String> {
        let mut current = marker;
        let mut seen = FxHashSet::default();

        loop {
            match current {
                TypeMarker::Named(name) => {
                    if !seen.insert(name.as_str()) {
                        return Err(name.clone());
                    }
                    current = self.lookup(name).ok_or_else(|| name.clone())?;
                }
                other => {
                    // Only `Named` yields `None`.
                    return other
                        .resolve_primitive(options)
                        .ok_or_else(|| other.to_string());
                }
            }
        }
    }
}
