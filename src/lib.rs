//! dynbind - declare the exported surface of a shared library and call it.
//!
//! Declarations state what each foreign symbol looks like through type
//! markers; an explicit bind pass resolves them under the scope they were
//! declared in and builds the call interfaces.
//!
//! ```no_run
//! use dynbind::prelude::*;
//!
//! # fn main() -> Result<(), DynbindError> {
//! let mut libc = Library::new("libc.so.6", ScopeOptions::new())?;
//!
//! let frexp = {
//!     let mut math = libc.scope(ScopeOptions::new().with_int_width(IntWidth::W32));
//!     math.declare_function(
//!         FunctionDecl::new("frexp")
//!             .param("x", AbiType::F64)
//!             .param("exp", MarshalType::Reference)
//!             .returns(AbiType::F64),
//!     )?
//! };
//! libc.bind()?;
//!
//! let exp = Reference::integer(0);
//! let mantissa = libc.call(frexp, &[Value::Float(8.0), exp.clone().into()])?;
//! assert_eq!(mantissa, Value::Float(0.5));
//! assert_eq!(exp, 4);
//! # Ok(())
//! # }
//! ```
//!
//! # Crates
//!
//! - [`dynbind_core`]: values, ABI and marshalling types, scopes, structures
//! - [`dynbind_registry`]: libraries, declarations, binding and calls
//! - `dynbind_sniffer` (feature `sniffer`): symbol discovery and boilerplate

pub use dynbind_core::*;
pub use dynbind_registry::*;

#[cfg(feature = "sniffer")]
pub use dynbind_sniffer as sniffer;

pub mod prelude {
    pub use dynbind_core::{
        AbiType, BindError, CallError, ConversionError, DynbindError, IntWidth, MarshalType,
        Reference, ScopeOptions, StringKind, Structure, TypeMarker, Value,
    };
    pub use dynbind_registry::{
        Callback, CallbackDecl, FunctionDecl, FunctionId, Library, RawCall, StructDecl, TypeEnv,
        last_error,
    };
}
