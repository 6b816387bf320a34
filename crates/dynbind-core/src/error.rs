//! Error types for every phase of a binding's life.
//!
//! ## Error Hierarchy
//!
//! ```text
//! DynbindError (top-level wrapper)
//! ├── BindError       - load, declaration and bind-time errors
//! └── CallError       - call-time errors
//!     └── ConversionError - host <-> ABI value conversion errors
//! ```
//!
//! Each phase-specific type can be handled directly, or converted into
//! [`DynbindError`] with `?`:
//!
//! ```ignore
//! fn setup(lib: &mut Library) -> Result<Value, DynbindError> {
//!     let abs = lib.declare_function(FunctionDecl::new("abs"))?; // BindError
//!     lib.bind()?;                                               // BindError
//!     Ok(lib.call(abs, &[Value::Int(-3)])?)                      // CallError
//! }
//! ```

use thiserror::Error;

// ============================================================================
// Conversion Errors
// ============================================================================

/// Errors converting a host value to or from its ABI representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// The host value has the wrong kind for the target type.
    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        expected: String,
        actual: &'static str,
    },

    /// An integer does not fit the target width.
    #[error("integer {value} out of range for {target_type}")]
    IntegerOverflow { value: i128, target_type: String },

    /// A string destined for a C string contains a NUL character.
    #[error("string contains an interior NUL at byte {position}")]
    InteriorNul { position: usize },

    /// Foreign string data is not valid in the host encoding.
    #[error("invalid string data: {0}")]
    InvalidString(String),

    /// A structure has no field with this name.
    #[error("structure '{structure}' has no field '{field}'")]
    UnknownField { structure: String, field: String },

    /// An array reference was indexed past its end.
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// An array reference would exceed the address space.
    #[error("array of {len} {element} elements is too large")]
    ArrayTooLarge { len: usize, element: String },
}

// ============================================================================
// Bind Errors
// ============================================================================

/// Errors raised while loading a library, declaring into it or binding it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// The library could not be located or opened.
    #[error("library not found: {name}: {reason}")]
    LibraryNotFound { name: String, reason: String },

    /// A symbol lookup was attempted before the library was loaded.
    #[error("library '{0}' is not loaded")]
    NotLoaded(String),

    /// The fully-qualified foreign name is not exported by the library.
    #[error("symbol '{symbol}' not found in {library}")]
    SymbolNotFound { symbol: String, library: String },

    /// A function with this foreign name was already declared.
    #[error("function '{0}' already declared")]
    FunctionRedeclared(String),

    /// A forward-referenced type name was not found in any enclosing scope.
    #[error("unresolved typehint '{unresolved}' for '{parameter}' of {function}")]
    TypehintUnresolved {
        function: String,
        parameter: String,
        unresolved: String,
    },

    /// The resolved signature was rejected by the ABI layer.
    #[error(
        "unsupported type in {function} ({foreign_name}): ({}) -> {result}: {reason}",
        arguments.join(", ")
    )]
    UnsupportedType {
        function: String,
        foreign_name: String,
        arguments: Vec<String>,
        result: String,
        reason: String,
    },

    /// The declaration itself is malformed.
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),
}

impl BindError {
    /// Check if a later bind pass would succeed for the same declaration.
    ///
    /// Unresolved typehints degrade the declaration to untyped, everything
    /// else re-raises.
    pub fn is_degradable(&self) -> bool {
        matches!(self, BindError::TypehintUnresolved { .. })
    }
}

// ============================================================================
// Call Errors
// ============================================================================

/// Errors raised while calling a bound foreign function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No function is registered under this name or id.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The function was declared but no successful bind pass covered it.
    #[error("function '{0}' is not bound; call bind() first")]
    NotBound(String),

    /// Wrong number of arguments for a typed declaration.
    #[error("{function} expects {expected} argument(s), got {actual}")]
    ArgumentCount {
        function: String,
        expected: usize,
        actual: usize,
    },

    /// An argument could not be converted.
    #[error("argument {index} of {function}: {source}")]
    Argument {
        function: String,
        index: usize,
        #[source]
        source: ConversionError,
    },

    /// A value conversion failed outside argument encoding.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The host side of a wrapped declaration or callback failed.
    #[error("host function failed: {0}")]
    Host(String),
}

impl CallError {
    /// Wrap an argument conversion error with its position.
    pub fn argument(function: impl Into<String>, index: usize, source: ConversionError) -> Self {
        CallError::Argument {
            function: function.into(),
            index,
            source,
        }
    }
}

// ============================================================================
// Unified Error
// ============================================================================

/// Top-level error wrapping every phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DynbindError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Call(#[from] CallError),
}

impl DynbindError {
    pub fn is_bind(&self) -> bool {
        matches!(self, DynbindError::Bind(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self, DynbindError::Call(_))
    }
}

impl From<ConversionError> for DynbindError {
    fn from(err: ConversionError) -> Self {
        DynbindError::Call(CallError::Conversion(err))
    }
}
