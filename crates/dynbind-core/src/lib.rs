//! Core types for the dynbind binding engine.
//!
//! This crate holds everything that does not need a loaded library:
//!
//! - [`Value`]: host values exchanged with foreign calls
//! - [`AbiType`] / [`AbiValue`]: the calling-convention view of values
//! - [`MarshalType`]: castable types with host↔ABI conversions
//! - [`TypeMarker`] / [`ResolvedType`]: declared and resolved type constraints
//! - [`ScopeStack`] / [`ScopeOptions`]: layered declaration options
//! - [`StructLayout`] / [`Structure`]: aggregate layouts and instances
//! - [`Reference`]: boxed output/in-out values
//! - error types for every phase

pub mod abi;
pub mod error;
pub mod marker;
pub mod marshal;
pub mod reference;
pub mod scope;
pub mod structure;
pub mod value;

pub use abi::{AbiType, AbiValue, AlignedBuf, ReturnBuffer};
pub use error::{BindError, CallError, ConversionError, DynbindError};
pub use marker::{ResolvedType, TypeMarker};
pub use marshal::{Keepalive, MarshalType, WChar};
pub use reference::Reference;
pub use scope::{IntWidth, ResolvedOptions, ScopeOptions, ScopeStack, StackGuard, StringKind};
pub use structure::{FieldLayout, StructLayout, StructLayoutBuilder, Structure};
pub use value::Value;
