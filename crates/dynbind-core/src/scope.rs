//! Scoped declaration options.
//!
//! Options flow from library defaults through type-level and call-level
//! overrides as a stack of frames. [`ScopeStack::flatten`] folds the frames
//! into the snapshot a declaration captures:
//!
//! - `prefix` concatenates outer → inner,
//! - `string_kind` and `int_width` take the innermost set value,
//! - `int_sign` takes the innermost *explicitly set* value, so an inner
//!   frame that leaves it unset never turns an outer `false` into signed.
//!
//! # Example
//!
//! ```
//! use dynbind_core::{IntWidth, ScopeOptions, ScopeStack};
//!
//! let mut stack = ScopeStack::new(ScopeOptions::new().with_int_width(IntWidth::W32));
//! {
//!     let mut outer = stack.enter(ScopeOptions::new().with_prefix("b_"));
//!     let inner = outer.enter(ScopeOptions::new().with_prefix("a_"));
//!     assert_eq!(inner.flatten().prefix, "b_a_");
//! }
//! assert_eq!(stack.depth(), 1);
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::BindError;

/// Width of integers a host `int` resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IntWidth {
    W8 = 8,
    W16 = 16,
    W32 = 32,
    W64 = 64,
}

impl IntWidth {
    /// Width used when no frame sets one.
    pub const DEFAULT: IntWidth = IntWidth::W64;

    /// Parse a bit count, rejecting anything but 8, 16, 32 and 64.
    pub fn from_bits(bits: u8) -> Result<Self, BindError> {
        Self::try_from(bits).map_err(|_| {
            BindError::InvalidDeclaration(format!(
                "integer width must be one of 8, 16, 32, 64 (got {bits})"
            ))
        })
    }

    /// Number of bits.
    pub fn bits(self) -> u8 {
        self.into()
    }
}

impl fmt::Display for IntWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// How host strings cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StringKind {
    /// NUL-terminated `char*`, UTF-8 encoded.
    #[default]
    Bytes,
    /// NUL-terminated `wchar_t*`.
    Wide,
}

/// One frame of declaration options. Unset fields defer to outer frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Foreign name prefix, concatenated outer → inner.
    pub prefix: Option<String>,
    /// String representation.
    pub string_kind: Option<StringKind>,
    /// Integer width for host `int`.
    pub int_width: Option<IntWidth>,
    /// Integer signedness for host `int`; `Some(false)` means unsigned.
    pub int_sign: Option<bool>,
}

impl ScopeOptions {
    /// Create an empty frame that inherits everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the foreign name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the string representation.
    pub fn with_string_kind(mut self, kind: StringKind) -> Self {
        self.string_kind = Some(kind);
        self
    }

    /// Shortcut for wide strings.
    pub fn with_wide_strings(self) -> Self {
        self.with_string_kind(StringKind::Wide)
    }

    /// Set the integer width.
    pub fn with_int_width(mut self, width: IntWidth) -> Self {
        self.int_width = Some(width);
        self
    }

    /// Set the integer signedness explicitly.
    pub fn with_int_sign(mut self, signed: bool) -> Self {
        self.int_sign = Some(signed);
        self
    }

    /// Check if this frame sets nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Flattened option snapshot captured by a declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
    /// Concatenated prefix (empty if no frame sets one).
    pub prefix: String,
    pub string_kind: Option<StringKind>,
    pub int_width: Option<IntWidth>,
    pub int_sign: Option<bool>,
}

impl ResolvedOptions {
    /// Effective string kind, byte strings unless configured otherwise.
    pub fn string_kind(&self) -> StringKind {
        self.string_kind.unwrap_or_default()
    }

    /// Effective integer width.
    pub fn int_width(&self) -> IntWidth {
        self.int_width.unwrap_or(IntWidth::DEFAULT)
    }

    /// Effective signedness: only an explicit `false` yields unsigned.
    pub fn is_signed(&self) -> bool {
        self.int_sign != Some(false)
    }
}

// ============================================================================
// Stack
// ============================================================================

/// Stack of option frames. The bottom frame holds the library defaults.
#[derive(Debug, Clone)]
pub struct ScopeStack {
    frames: Vec<ScopeOptions>,
}

impl ScopeStack {
    /// Create a stack whose bottom frame is `defaults`.
    pub fn new(defaults: ScopeOptions) -> Self {
        Self {
            frames: vec![defaults],
        }
    }

    /// Push a frame.
    pub fn push(&mut self, options: ScopeOptions) {
        self.frames.push(options);
    }

    /// Pop the latest frame.
    ///
    /// # Panics
    ///
    /// Panics if only the defaults frame remains; an unmatched pop is a
    /// programming error.
    pub fn pop(&mut self) -> ScopeOptions {
        assert!(
            self.frames.len() > 1,
            "scope stack underflow: pop without a matching push"
        );
        self.frames.pop().unwrap_or_default()
    }

    /// Number of frames, defaults included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Fold all frames into one snapshot.
    pub fn flatten(&self) -> ResolvedOptions {
        Self::fold(self.frames.iter())
    }

    /// Fold all frames plus a transient innermost frame, without pushing it.
    pub fn flatten_with(&self, overrides: &ScopeOptions) -> ResolvedOptions {
        Self::fold(self.frames.iter().chain(std::iter::once(overrides)))
    }

    fn fold<'a>(frames: impl Iterator<Item = &'a ScopeOptions>) -> ResolvedOptions {
        let mut resolved = ResolvedOptions::default();
        // Outer to inner: later frames overwrite, prefixes append.
        for frame in frames {
            if let Some(prefix) = &frame.prefix {
                resolved.prefix.push_str(prefix);
            }
            if frame.string_kind.is_some() {
                resolved.string_kind = frame.string_kind;
            }
            if frame.int_width.is_some() {
                resolved.int_width = frame.int_width;
            }
            if frame.int_sign.is_some() {
                resolved.int_sign = frame.int_sign;
            }
        }
        resolved
    }

    /// Push a frame and return a guard that pops it when dropped.
    pub fn enter(&mut self, options: ScopeOptions) -> StackGuard<'_> {
        self.push(options);
        StackGuard { stack: self }
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new(ScopeOptions::default())
    }
}

/// Pops its frame on drop. Dereferences to the stack so nested frames can
/// be entered through it.
pub struct StackGuard<'a> {
    stack: &'a mut ScopeStack,
}

impl Deref for StackGuard<'_> {
    type Target = ScopeStack;

    fn deref(&self) -> &ScopeStack {
        self.stack
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScopeStack {
        self.stack
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_prefixes_concatenate_outer_to_inner() {
        let mut stack = ScopeStack::default();
        let mut b = stack.enter(ScopeOptions::new().with_prefix("b_"));
        let a = b.enter(ScopeOptions::new().with_prefix("a_"));
        assert_eq!(a.flatten().prefix, "b_a_");
    }

    #[test]
    fn innermost_set_value_wins() {
        let mut stack = ScopeStack::new(
            ScopeOptions::new()
                .with_int_width(IntWidth::W32)
                .with_wide_strings(),
        );
        stack.push(ScopeOptions::new().with_int_width(IntWidth::W8));
        stack.push(ScopeOptions::new());

        let flat = stack.flatten();
        assert_eq!(flat.int_width, Some(IntWidth::W8));
        assert_eq!(flat.string_kind(), StringKind::Wide);
    }

    #[test]
    fn explicit_false_sign_survives_unset_inner_frames() {
        let mut stack = ScopeStack::new(ScopeOptions::new().with_int_sign(false));
        stack.push(ScopeOptions::new().with_prefix("x_"));
        assert!(!stack.flatten().is_signed());

        stack.push(ScopeOptions::new().with_int_sign(true));
        assert!(stack.flatten().is_signed());
    }

    #[test]
    fn unset_sign_is_signed() {
        let stack = ScopeStack::default();
        assert_eq!(stack.flatten().int_sign, None);
        assert!(stack.flatten().is_signed());
        assert_eq!(stack.flatten().int_width(), IntWidth::W64);
    }

    #[test]
    fn flatten_with_does_not_push() {
        let stack = ScopeStack::new(ScopeOptions::new().with_prefix("lib_"));
        let flat = stack.flatten_with(&ScopeOptions::new().with_int_width(IntWidth::W16));
        assert_eq!(flat.prefix, "lib_");
        assert_eq!(flat.int_width, Some(IntWidth::W16));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn guard_pops_on_early_exit() {
        fn fails(stack: &mut ScopeStack) -> Result<(), BindError> {
            let _guard = stack.enter(ScopeOptions::new().with_prefix("tmp_"));
            Err(BindError::InvalidDeclaration("boom".into()))
        }

        let mut stack = ScopeStack::default();
        assert!(fails(&mut stack).is_err());
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.flatten().prefix, "");
    }

    #[test]
    #[should_panic(expected = "scope stack underflow")]
    fn popping_defaults_panics() {
        let mut stack = ScopeStack::default();
        stack.pop();
    }

    #[test]
    fn int_width_from_bits() {
        assert_eq!(IntWidth::from_bits(16).unwrap(), IntWidth::W16);
        assert!(IntWidth::from_bits(12).is_err());
        assert_eq!(IntWidth::W32.bits(), 32);
    }
}
