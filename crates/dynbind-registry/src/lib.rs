//! Declaration registry and call dispatch for dynbind.
//!
//! This crate loads foreign libraries, records declarations against them,
//! resolves their deferred types in an explicit bind pass and performs the
//! calls:
//!
//! - [`Library`]: foreign handle, scope stack and registry of one module
//! - [`FunctionDecl`] / [`StructDecl`] / [`CallbackDecl`]: declaration builders
//! - [`TypeEnv`]: explicit environment for forward references
//! - [`DeclaredFunction`] / [`RawCall`]: bound functions and manual invokers
//! - [`Callback`]: host callables as foreign function pointers
//! - [`last_error`]: platform error introspection

pub mod callback;
pub mod declaration;
pub mod errno;
pub mod function;
pub mod library;
pub mod registry;
pub mod resolver;

pub use callback::Callback;
pub use declaration::{CallMode, CallbackDecl, CallbackFn, DeclFlags, FunctionDecl, HostFn, StructDecl};
pub use errno::{ErrorInfo, captured_errno, describe, last_error, set_captured_errno, set_last_error};
pub use function::{DeclaredFunction, FunctionId, RawCall, Signature};
pub use library::{Library, ScopeGuard, platform_file_name};
pub use registry::DeclarationRegistry;
pub use resolver::TypeEnv;
